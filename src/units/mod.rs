//! Unit store
//!
//! Parses unit definition files into jobs, templates, test plans and
//! manifest entries, and keeps them in a [`Catalog`].

pub mod catalog;
pub mod job;
pub mod rfc822;
pub mod template;
pub mod testplan;

pub use catalog::{Catalog, Unit, UnitSource};
pub use job::{JobFlag, JobUnit, Plugin};
pub use template::TemplateUnit;
pub use testplan::TestPlan;
