//! Worker execution engine for running jobs.
//!
//! This module handles the actual execution of queued shell commands:
//! - **Claiming**: each worker polls the store and atomically claims one job
//! - **Execution**: spawns `sh -c <command>` with an optional timeout
//! - **Settling**: records the run and applies the next state transition
//!
//! # Components
//!
//! - [`JobExecutor`]: Executes shell commands and returns results
//! - [`Worker`]: The poll/claim/execute/settle loop of one execution slot
//! - [`WorkerPool`]: Spawns N workers and waits for them to drain on shutdown
//!
//! # Execution Flow
//!
//! 1. Worker claims the oldest ready job (state becomes `processing`)
//! 2. [`JobExecutor::execute`] runs the command, killing its process group on timeout
//! 3. The run is appended to the store
//! 4. Success completes the job; failure increments attempts and either
//!    requeues it after backoff or moves it to the dead letter queue
//!
//! # Security Note
//!
//! Commands are trusted and executed directly via shell without sandboxing.

pub mod executor;
pub mod pool;
pub mod runner;

pub use executor::{ExecutionResult, JobExecutor};
pub use pool::{PoolReport, WorkerPool};
pub use runner::Worker;
