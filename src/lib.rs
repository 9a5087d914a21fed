// src/lib.rs

//! Over-the-air system update client
//!
//! Checks an update server for a newer build, downloads an incremental or
//! full package, verifies it, and hands the payload to the device's update
//! engine in place.
//!
//! # Architecture
//!
//! - Transfer: one-line metadata, incremental-then-full package download
//! - Package: signature and `post-timestamp` checks, payload offset scan
//! - Engine: payload submission with completion reported over a channel
//! - Orchestrator: single-flight run state, wake lease, reboot prompt
//! - Journal: every run recorded in SQLite for `history`

pub mod db;
pub mod device;
pub mod engine;
mod error;
pub mod notify;
pub mod orchestrator;
pub mod package;
pub mod power;
pub mod schedule;
pub mod transfer;

pub use error::{Error, Result, TransferFailure};
pub use orchestrator::{Orchestrator, RunOutcome, RunState};
