//! Test plan units
//!
//! A test plan selects jobs with anchored regular expressions:
//!
//! ```text
//! unit: test plan
//! id: client-cert
//! include:
//!     audio/.*                certification-status=blocker
//!     disk/read_.*
//! exclude:
//!     audio/.*_hdmi
//! nested_part:
//!     networking-cert
//! bootstrap_include:
//!     device
//! ```

use regex::Regex;
use std::fmt;

use super::job::{CertificationStatus, JobUnit};
use super::rfc822::{Origin, Record};
use crate::common::{Error, Result};
use crate::resource::expr::Scope;

/// An anchored id pattern
#[derive(Debug, Clone)]
pub struct Pattern {
    /// Pattern text after namespace expansion
    pub source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a pattern, qualifying it with `scope` unless it names a namespace
    pub fn new(text: &str, scope: &Scope) -> std::result::Result<Self, String> {
        let source = match &scope.namespace {
            Some(ns) if !text.contains("::") => format!("{}::{}", regex::escape(ns), text),
            _ => text.to_string(),
        };
        let regex = Regex::new(&format!("^(?:{})$", source))
            .map_err(|e| format!("invalid pattern '{}': {}", text, e))?;
        Ok(Self { source, regex })
    }

    pub fn matches(&self, id: &str) -> bool {
        self.regex.is_match(id)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Field overrides written inline after an include pattern
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOverrides {
    pub certification_status: Option<CertificationStatus>,
    pub category_id: Option<String>,
    pub estimated_duration: Option<f64>,
    pub timeout: Option<u64>,
}

impl JobOverrides {
    fn set(&mut self, key: &str, value: &str, scope: &Scope) -> std::result::Result<(), String> {
        match key {
            "certification-status" => self.certification_status = Some(value.parse()?),
            "category-id" => self.category_id = Some(scope.qualify(value)),
            "estimated-duration" => {
                self.estimated_duration = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid estimated-duration '{}'", value))?,
                )
            }
            "timeout" => {
                self.timeout = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid timeout '{}'", value))?,
                )
            }
            other => return Err(format!("field '{}' cannot be overridden", other)),
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, job: &mut JobUnit) {
        if let Some(status) = self.certification_status {
            job.certification_status = status;
        }
        if let Some(category) = &self.category_id {
            job.category_id = Some(category.clone());
        }
        if let Some(duration) = self.estimated_duration {
            job.estimated_duration = Some(duration);
        }
        if let Some(timeout) = self.timeout {
            job.timeout = Some(timeout);
        }
    }
}

/// One `include` line
#[derive(Debug, Clone)]
pub struct IncludeEntry {
    pub pattern: Pattern,
    pub overrides: JobOverrides,
}

#[derive(Debug, Clone)]
pub struct TestPlan {
    pub id: String,
    pub name: Option<String>,
    pub include: Vec<IncludeEntry>,
    pub exclude: Vec<Pattern>,
    pub nested_part: Vec<String>,
    pub bootstrap_include: Vec<String>,
    pub origin: Origin,
}

/// Non-empty lines of a list field, with `#` comments removed
fn entries(value: Option<&str>) -> impl Iterator<Item = &str> {
    value
        .into_iter()
        .flat_map(str::lines)
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
}

impl TestPlan {
    pub fn from_record(record: &Record, namespace: Option<&str>) -> Result<Self> {
        let bad = |message: String| Error::parse(&record.origin, message);
        let scope = Scope::new(namespace);

        let raw_id = record
            .get("id")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| bad("test plan has no 'id' field".into()))?;
        let id = scope.qualify(raw_id);

        let mut include = Vec::new();
        for line in entries(record.get("include")) {
            let mut words = line.split_whitespace();
            let Some(pattern) = words.next() else {
                continue;
            };
            let pattern = Pattern::new(pattern, &scope).map_err(&bad)?;
            let mut overrides = JobOverrides::default();
            for word in words {
                let (key, value) = word.split_once('=').ok_or_else(|| {
                    bad(format!("expected 'field=value' after '{}', got '{}'", pattern, word))
                })?;
                overrides.set(key, value, &scope).map_err(&bad)?;
            }
            include.push(IncludeEntry { pattern, overrides });
        }

        let exclude = entries(record.get("exclude"))
            .map(|line| Pattern::new(line, &scope).map_err(&bad))
            .collect::<Result<Vec<_>>>()?;

        let nested_part = entries(record.get("nested_part"))
            .map(|line| scope.qualify(line))
            .collect();

        let bootstrap_include = entries(record.get("bootstrap_include"))
            .map(|line| line.split_whitespace().next().unwrap_or(line))
            .map(|line| scope.qualify(line))
            .collect();

        Ok(Self {
            id,
            name: record.get("name").map(str::to_string),
            include,
            exclude,
            nested_part,
            bootstrap_include,
            origin: record.origin.clone(),
        })
    }

    /// Whether `id` is excluded by this plan
    pub fn excludes(&self, id: &str) -> bool {
        self.exclude.iter().any(|p| p.matches(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::rfc822::{parse, DuplicateKeys};

    fn plan(text: &str) -> Result<TestPlan> {
        let records = parse(text, "plan.pxu", DuplicateKeys::Reject).unwrap();
        TestPlan::from_record(&records[0], Some("com.example"))
    }

    #[test]
    fn test_plan_fields() {
        let plan = plan(
            "unit: test plan\nid: client\nname: Client certification\n\
             include:\n  audio/.*   certification-status=blocker\n  # comment\n  other::disk/.*\n\
             exclude:\n  audio/.*_hdmi\nnested_part: networking\nbootstrap_include: device\n",
        )
        .unwrap();

        assert_eq!(plan.id, "com.example::client");
        assert_eq!(plan.include.len(), 2);
        assert_eq!(
            plan.include[0].overrides.certification_status,
            Some(CertificationStatus::Blocker)
        );
        assert!(plan.include[0].pattern.matches("com.example::audio/playback"));
        assert!(!plan.include[0].pattern.matches("org::audio/playback"));
        assert!(plan.include[1].pattern.matches("other::disk/read_sda"));
        assert!(plan.excludes("com.example::audio/out_hdmi"));
        assert!(!plan.excludes("com.example::audio/out_hdmi_extra"));
        assert_eq!(plan.nested_part, vec!["com.example::networking"]);
        assert_eq!(plan.bootstrap_include, vec!["com.example::device"]);
    }

    #[test]
    fn test_patterns_are_anchored() {
        let pattern = Pattern::new("cpu/.*", &Scope::new(Some("ns"))).unwrap();
        assert!(pattern.matches("ns::cpu/load"));
        assert!(!pattern.matches("ns::x-cpu/load"));
        assert!(!pattern.matches("other::ns::cpu/load"));
    }

    #[test]
    fn test_bad_include_lines() {
        assert!(plan("id: p\ninclude: audio/.* blocker\n").is_err());
        assert!(plan("id: p\ninclude: audio/.* colour=blue\n").is_err());
        assert!(plan("id: p\ninclude: audio/(\n").is_err());
        assert!(plan("include: audio/.*\n").is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let plan = plan("id: p\ninclude: a timeout=30 category-id=audio\n").unwrap();
        let overrides = &plan.include[0].overrides;
        assert!(!overrides.is_empty());
        assert_eq!(overrides.timeout, Some(30));
        assert_eq!(overrides.category_id.as_deref(), Some("com.example::audio"));
    }
}
