//! certrig - hardware certification test orchestrator
//!
//! Loads test units, resolves a test plan into an ordered job list and runs
//! it as a resumable session inside a resident agent that controllers can
//! attach to, detach from and reattach to across reboots.

pub mod agent;
pub mod cli;
pub mod commands;
pub mod common;
pub mod exec;
pub mod ipc;
pub mod plan;
pub mod resource;
pub mod session;
pub mod units;

pub use common::{Error, Result};
