//! Bridging asynchronous producers into blocking consumers.

pub mod bridge;

pub use bridge::{DEFAULT_CAPACITY, StreamBridge};
