//! Core data model types for messages, threads and addresses.

pub mod address;
pub mod message;
pub mod thread;
