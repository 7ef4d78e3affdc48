//! Shared helpers: process bootstrap, retry policy and shutdown signalling.

pub mod bootstrap;
pub mod retry;
pub mod shutdown;
