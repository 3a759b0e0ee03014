//! Type aliases for commonly used shared types.
//!
//! The link layer shares a handful of pieces of state between the foreground
//! caller, the read loop and the write drain task. These aliases give those
//! nested types a name.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hublink_core::types::*;
//!
//! // Instead of: Arc<Mutex<Option<Box<dyn SerialPort>>>>
//! let port: ThreadSafeOption<Box<dyn SerialPort>> = thread_safe_none();
//! ```

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

// =============================================================================
// THREAD-SAFE SHARED TYPES (Arc<Mutex<T>> / Arc<RwLock<T>>)
// =============================================================================

/// A thread-safe, mutex-protected wrapper for cross-task sharing.
///
/// Uses `parking_lot::Mutex`; guards must never be held across an `.await`.
pub type ThreadSafe<T> = Arc<Mutex<T>>;

/// A thread-safe optional wrapper for lazily-initialized cross-task state.
pub type ThreadSafeOption<T> = Arc<Mutex<Option<T>>>;

/// A thread-safe reader-writer lock wrapper for read-heavy state.
pub type ThreadSafeRw<T> = Arc<RwLock<T>>;

// =============================================================================
// CALLBACK TYPES
// =============================================================================

/// Sink for inbound device bytes.
///
/// Invoked synchronously from the read loop, once per received chunk. It must
/// not block.
pub type NotifyCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Slot holding the single registered notification sink (last one wins).
pub type NotifySlot = ThreadSafeRw<Option<NotifyCallback>>;

// =============================================================================
// CONSTRUCTOR HELPERS
// =============================================================================

/// Create a new `ThreadSafe<T>` from a value.
#[inline]
pub fn thread_safe<T>(value: T) -> ThreadSafe<T> {
    Arc::new(Mutex::new(value))
}

/// Create a new `ThreadSafeOption<T>` initialized to `None`.
#[inline]
pub fn thread_safe_none<T>() -> ThreadSafeOption<T> {
    Arc::new(Mutex::new(None))
}

/// Create a new `ThreadSafeRw<T>` from a value.
#[inline]
pub fn thread_safe_rw<T>(value: T) -> ThreadSafeRw<T> {
    Arc::new(RwLock::new(value))
}

/// Create an empty notification slot.
#[inline]
pub fn notify_slot() -> NotifySlot {
    thread_safe_rw(None)
}
