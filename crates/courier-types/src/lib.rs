//! Shared types, adapter traits, and core utilities for the Courier email pipeline.
//!
//! This crate contains the types shared between the email crate and the queue
//! adapter implementations, so adapters do not depend on the SMTP and template
//! stack.

pub mod email;
pub mod error;
pub mod event_publisher;
pub mod prelude;
pub mod queue_adapter;
pub mod types;

// vim: ts=4
