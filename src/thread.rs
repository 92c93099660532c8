//! # Summary
//!
//! This module contains the node's background activities. Each one is a
//! `tokio` task holding a clone of the `Node` handle; none of them keeps
//! the state lock across an await point.

/// Inbound connection acceptor.
pub(crate) mod acceptor;

/// Per-connection inbound handler.
pub(crate) mod connection;

/// Critical-section execution.
pub(crate) mod executor;

/// Liveness monitor.
pub(crate) mod heartbeat;
