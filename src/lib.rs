//! `mboxsync`: ingest a mailing list's monthly MBOX archives into SQLite.
//!
//! The library fetches archive units over HTTP, parses them into message
//! records, groups messages into threads, and reconciles each batch with the
//! store while classifying every thread's activity state.

pub mod classify;
pub mod config;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod model;
pub mod parser;
pub mod progress;
pub mod reconcile;
pub mod store;
pub mod threading;
