//! Plan resolver
//!
//! Selects the jobs of a test plan, closes the selection over its
//! prerequisites and orders it for execution.

pub mod order;
pub mod resolver;

pub use order::order;
pub use resolver::{PlanOverrides, PrerunJob, ResolvedPlan, Resolver};
