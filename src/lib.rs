//! AUTOMINE: autonomous risk-managed mining controller for refinORE.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod controller;
pub mod dashboard;
pub mod error;
pub mod ingest;
pub mod storage;
pub mod strategy;
pub mod tracker;
pub mod transport;
pub mod types;
