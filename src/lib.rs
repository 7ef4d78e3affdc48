//! Event Relay
//!
//! Consumes domain events from a topic broker and fans them out to live
//! clients connected to per-domain push hubs.

pub mod bus;
pub mod config;
pub mod events;
pub mod handlers;
pub mod hub;
pub mod supervisor;
pub mod utils;
