//! Job process execution, shared by plan resolution and the session engine

pub mod env;
pub mod runner;

pub use env::{host_environment, job_environment, EnvContext, RunContext};
pub use runner::{
    ExitKind, JobRunner, OutputChunk, OutputSink, OutputStream, ProcessRunner, RunReport,
    RunRequest,
};
