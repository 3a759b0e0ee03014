//! Type system utilities and aliases.
//!
//! This module provides type aliases and utilities for commonly used
//! complex types throughout the codebase.
//!
//! ## Modules
//!
//! - [`aliases`]: Shared-state aliases (`Arc<Mutex<T>>`, `Arc<RwLock<T>>`) and the notification callback

pub mod aliases;

pub use aliases::*;
