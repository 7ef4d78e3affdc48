//! Event handlers plugged into the broker consumer.

pub mod forwarder;

pub use forwarder::{EventForwarder, Route};
