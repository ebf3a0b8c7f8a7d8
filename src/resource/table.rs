//! Resource tables produced by resource jobs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::common::{Error, Result};
use crate::units::rfc822::{self, DuplicateKeys};

/// One record of resource output
pub type ResourceRecord = BTreeMap<String, String>;

/// Tables available to requirement programs, keyed by resource job id
pub type ResourceMap = BTreeMap<String, ResourceTable>;

/// Ordered records emitted by one resource job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTable {
    pub records: Vec<ResourceRecord>,
}

impl ResourceTable {
    /// Parse resource job output; repeated keys overwrite earlier values
    pub fn parse(job_id: &str, output: &str) -> Result<Self> {
        let records = rfc822::parse(output, job_id, DuplicateKeys::Overwrite).map_err(|e| match e {
            Error::Parse { message, .. } => Error::resource_parse(job_id, message),
            other => other,
        })?;

        Ok(Self {
            records: records.into_iter().map(|r| r.fields).collect(),
        })
    }

    /// Single-record table of manifest answers
    pub fn from_manifest(answers: &BTreeMap<String, String>) -> Self {
        Self {
            records: vec![answers.clone()],
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource_output() {
        let output = "path: /dev/sda\nsize: 100\n\npath: /dev/sdb\nsize: 200\nsize: 250\n";
        let table = ResourceTable::parse("ns::disk", output).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.records[1]["size"], "250");
    }

    #[test]
    fn test_empty_output_is_empty_table() {
        let table = ResourceTable::parse("ns::disk", "\n\n").unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_malformed_output() {
        let err = ResourceTable::parse("ns::disk", "path /dev/sda\n").unwrap_err();
        assert!(matches!(err, Error::ResourceParse { ref job_id, .. } if job_id == "ns::disk"));
    }
}
