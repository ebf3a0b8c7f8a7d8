//! Resource evaluator
//!
//! Resource jobs describe the machine as rfc822 records. Requirement
//! programs and template filters are evaluated against those tables.

pub mod eval;
pub mod expr;
pub mod table;

pub use eval::{evaluate, evaluate_program};
pub use expr::{Expr, Program, Scope};
pub use table::{ResourceMap, ResourceTable};

use crate::common::{Error, Result};
use crate::exec::{ExitKind, RunReport};
use crate::units::JobUnit;

/// Parse the output of a finished resource job into a table
///
/// A non-zero exit still yields whatever records were printed.
pub fn table_from_report(job: &JobUnit, report: &RunReport) -> Result<ResourceTable> {
    if report.exit != ExitKind::Code(0) {
        tracing::warn!(job_id = %job.id, exit = ?report.exit, "resource job did not exit cleanly");
    }

    let output = String::from_utf8_lossy(&report.stdout);
    let table = ResourceTable::parse(&job.id, &output).map_err(|e| match e {
        Error::ResourceParse { .. } => e,
        other => Error::resource_parse(&job.id, other.to_string()),
    })?;

    tracing::debug!(job_id = %job.id, records = table.len(), "resource job produced table");
    Ok(table)
}

/// Evaluate a job's `requires` program, if it has one
pub fn requirements_met(job: &JobUnit, tables: &ResourceMap) -> Result<bool> {
    match &job.requires {
        Some(program) => evaluate_program(program, tables),
        None => Ok(true),
    }
}
