//! An in-memory backend for exercising a [`crate::Session`] without any
//! Bluetooth hardware

mod session;
pub use session::*;
