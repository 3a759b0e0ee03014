//! Core device abstractions
//!
//! Event types and the dispatcher used to publish device lifecycle changes.

pub mod event;
