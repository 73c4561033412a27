//! interp-rpc-daemon library
//!
//! This crate provides the execution tier for interactive interpreter
//! sessions:
//! - One long-lived interpreter process per configured language
//! - FIFO execution queues correlating the interpreter's unframed output
//!   back to the request that caused it
//! - An RPC gateway exposing `execute` to the web tier

pub mod config;
pub mod error;
pub mod queue;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod supervisor;
