//! # HubLink Core
//!
//! Core types, traits, and utilities for HubLink.
//! Provides the device state model, the connection error taxonomy,
//! device events, and shared type aliases.

pub mod core;
pub mod data;
pub mod error;
pub mod types;

pub use crate::core::event::{DeviceEvent, EventDispatcher};

pub use data::{DeviceState, DeviceStatus, HandleId, TransportKind};

pub use error::{ConnectionError, Error, Result, NO_COMPATIBLE_SERVICE_MESSAGE};

// Re-export type aliases for convenience
pub use types::{
    notify_slot, thread_safe, thread_safe_none, thread_safe_rw, NotifyCallback, NotifySlot,
    ThreadSafe, ThreadSafeOption, ThreadSafeRw,
};
