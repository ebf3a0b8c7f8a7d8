//! Job units

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::rfc822::{Origin, Record};
use crate::common::{Error, Result};
use crate::resource::expr::{Program, Scope};

/// Partial id of the job that suspends the machine for `also-after-suspend` siblings
pub const SUSPEND_JOB: &str = "suspend/suspend_advanced_auto";

/// Prefix of the id of an `also-after-suspend` sibling
pub const AFTER_SUSPEND_PREFIX: &str = "after-suspend-";

/// How a job is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Plugin {
    Shell,
    Resource,
    Manual,
    UserInteract,
    UserInteractVerify,
    Attachment,
    Local,
}

impl Plugin {
    /// Plugins that need an operator verdict or confirmation
    pub fn is_interactive(self) -> bool {
        matches!(
            self,
            Plugin::Manual | Plugin::UserInteract | Plugin::UserInteractVerify
        )
    }

    fn needs_command(self) -> bool {
        !matches!(self, Plugin::Manual)
    }
}

impl fmt::Display for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Plugin::Shell => "shell",
            Plugin::Resource => "resource",
            Plugin::Manual => "manual",
            Plugin::UserInteract => "user-interact",
            Plugin::UserInteractVerify => "user-interact-verify",
            Plugin::Attachment => "attachment",
            Plugin::Local => "local",
        };
        f.write_str(s)
    }
}

impl FromStr for Plugin {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "shell" => Plugin::Shell,
            "resource" => Plugin::Resource,
            "manual" => Plugin::Manual,
            "user-interact" => Plugin::UserInteract,
            "user-interact-verify" => Plugin::UserInteractVerify,
            "attachment" => Plugin::Attachment,
            "local" => Plugin::Local,
            other => return Err(format!("unknown plugin '{}'", other)),
        })
    }
}

/// Behavioural flags of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobFlag {
    Simple,
    /// The job reboots or otherwise never returns control
    #[serde(rename = "noreturn")]
    NoReturn,
    #[serde(rename = "autorestart")]
    AutoRestart,
    PreserveLocale,
    AlsoAfterSuspend,
    FailOnResource,
    SuppressOutput,
}

impl FromStr for JobFlag {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "simple" => JobFlag::Simple,
            "noreturn" => JobFlag::NoReturn,
            "autorestart" => JobFlag::AutoRestart,
            "preserve-locale" => JobFlag::PreserveLocale,
            "also-after-suspend" => JobFlag::AlsoAfterSuspend,
            "fail-on-resource" => JobFlag::FailOnResource,
            "suppress-output" => JobFlag::SuppressOutput,
            _ => return Err(()),
        })
    }
}

/// Certification weight of a job's outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificationStatus {
    #[default]
    Unspecified,
    NonBlocker,
    Blocker,
}

impl FromStr for CertificationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "unspecified" => Self::Unspecified,
            "non-blocker" => Self::NonBlocker,
            "blocker" => Self::Blocker,
            other => return Err(format!("unknown certification status '{}'", other)),
        })
    }
}

/// An executable test job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUnit {
    pub id: String,
    pub summary: Option<String>,
    pub plugin: Plugin,
    pub command: Option<String>,
    pub requires: Option<Program>,
    pub depends: Vec<String>,
    pub after: Vec<String>,
    pub flags: BTreeSet<JobFlag>,
    pub environ: Vec<String>,
    pub estimated_duration: Option<f64>,
    pub user: Option<String>,
    pub purpose: Option<String>,
    pub steps: Option<String>,
    pub verification: Option<String>,
    pub category_id: Option<String>,
    #[serde(default)]
    pub certification_status: CertificationStatus,
    /// Time limit in seconds
    pub timeout: Option<u64>,
    /// Set on jobs instantiated from a template
    pub template_id: Option<String>,
    pub template_resource: Option<String>,
    pub origin: Origin,
}

/// Split a list field on whitespace and commas
pub(crate) fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
}

/// Namespace part of a qualified id
pub fn namespace_of(id: &str) -> Option<&str> {
    id.rsplit_once("::").map(|(ns, _)| ns)
}

/// Id without its namespace
pub fn partial_id(id: &str) -> &str {
    id.rsplit_once("::").map(|(_, p)| p).unwrap_or(id)
}

impl JobUnit {
    /// Build a job from a unit record
    pub fn from_record(record: &Record, namespace: Option<&str>) -> Result<Self> {
        Self::from_fields(&record.fields, record.origin.clone(), namespace)
    }

    /// Build a job from raw field values
    pub fn from_fields(
        fields: &BTreeMap<String, String>,
        origin: Origin,
        namespace: Option<&str>,
    ) -> Result<Self> {
        let get = |key: &str| fields.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        let bad = |message: String| Error::parse(&origin, message);

        let raw_id = get("id").ok_or_else(|| bad("job has no 'id' field".into()))?;
        if raw_id.contains(char::is_whitespace) {
            return Err(bad(format!("job id '{}' contains whitespace", raw_id)));
        }

        let mut scope = Scope::new(namespace);
        if let Some(imports) = get("imports") {
            scope = scope.with_imports(imports).map_err(|e| bad(e.to_string()))?;
        }
        let id = scope.qualify(raw_id);

        let plugin: Plugin = get("plugin")
            .ok_or_else(|| bad(format!("job '{}' has no 'plugin' field", id)))?
            .parse()
            .map_err(|e: String| bad(e))?;

        let command = get("command").map(str::to_string);
        if plugin.needs_command() && command.is_none() {
            return Err(bad(format!(
                "job '{}' uses plugin '{}' but has no command",
                id, plugin
            )));
        }

        let requires = get("requires")
            .map(|text| Program::parse(text, &scope))
            .transpose()
            .map_err(|e| bad(format!("invalid requires of '{}': {}", id, e)))?;

        let mut flags = BTreeSet::new();
        for flag in get("flags").map(split_list).into_iter().flatten() {
            match flag.parse::<JobFlag>() {
                Ok(flag) => {
                    flags.insert(flag);
                }
                Err(()) => tracing::debug!(job_id = %id, flag, "ignoring unknown flag"),
            }
        }

        let ids = |key: &str| -> Vec<String> {
            get(key)
                .map(|v| split_list(v).map(|d| scope.qualify(d)).collect())
                .unwrap_or_default()
        };

        let estimated_duration = get("estimated_duration")
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|_| bad(format!("invalid estimated_duration '{}'", v)))
            })
            .transpose()?;

        let timeout = get("timeout")
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| bad(format!("invalid timeout '{}'", v)))
            })
            .transpose()?;

        let certification_status = get("certification-status")
            .map(|v| v.parse::<CertificationStatus>().map_err(|e| bad(e)))
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            summary: get("summary").map(str::to_string),
            plugin,
            command,
            requires,
            depends: ids("depends"),
            after: ids("after"),
            flags,
            environ: get("environ")
                .map(|v| split_list(v).map(str::to_string).collect())
                .unwrap_or_default(),
            estimated_duration,
            user: get("user").map(str::to_string),
            purpose: get("purpose").map(str::to_string),
            steps: get("steps").map(str::to_string),
            verification: get("verification").map(str::to_string),
            category_id: get("category_id").map(|c| scope.qualify(c)),
            certification_status,
            timeout,
            template_id: None,
            template_resource: None,
            origin: origin.clone(),
            id,
        })
    }

    pub fn has_flag(&self, flag: JobFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn partial_id(&self) -> &str {
        partial_id(&self.id)
    }

    pub fn namespace(&self) -> Option<&str> {
        namespace_of(&self.id)
    }

    /// Jobs this one needs to have run first: `depends` and `requires` resources
    pub fn hard_prerequisites(&self) -> Vec<String> {
        let mut ids = self.depends.clone();
        if let Some(requires) = &self.requires {
            ids.extend(
                requires
                    .resource_ids()
                    .into_iter()
                    .filter(|r| r != crate::resource::expr::MANIFEST_RESOURCE),
            );
        }
        if let Some(resource) = &self.template_resource {
            ids.push(resource.clone());
        }
        let mut seen = BTreeSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        ids
    }

    /// Text shown to the operator when a verdict is needed
    pub fn prompt(&self) -> String {
        let mut parts = Vec::new();
        if let Some(summary) = &self.summary {
            parts.push(summary.clone());
        }
        for (label, text) in [
            ("Purpose", &self.purpose),
            ("Steps", &self.steps),
            ("Verification", &self.verification),
        ] {
            if let Some(text) = text {
                parts.push(format!("{}:\n{}", label, text));
            }
        }
        if parts.is_empty() {
            parts.push(self.id.clone());
        }
        parts.join("\n\n")
    }

    /// Id of the suspend job that `also-after-suspend` siblings wait for
    pub fn suspend_job_id(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}::{}", ns, SUSPEND_JOB),
            None => SUSPEND_JOB.to_string(),
        }
    }

    /// The copy of this job that runs again after the machine resumed from suspend
    pub fn after_suspend_sibling(&self) -> JobUnit {
        let mut sibling = self.clone();
        let partial = format!("{}{}", AFTER_SUSPEND_PREFIX, self.partial_id());
        sibling.id = match self.namespace() {
            Some(ns) => format!("{}::{}", ns, partial),
            None => partial,
        };
        sibling.flags.remove(&JobFlag::AlsoAfterSuspend);
        sibling.summary = Some(format!(
            "{} after suspend (S3)",
            self.summary.as_deref().unwrap_or(self.partial_id())
        ));
        for extra in [self.id.clone(), self.suspend_job_id()] {
            if !sibling.depends.contains(&extra) {
                sibling.depends.push(extra);
            }
        }
        sibling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::rfc822::{parse, DuplicateKeys};

    fn job(text: &str) -> Result<JobUnit> {
        let records = parse(text, "test.pxu", DuplicateKeys::Reject).unwrap();
        JobUnit::from_record(&records[0], Some("com.example"))
    }

    #[test]
    fn test_job_fields() {
        let job = job("id: audio/playback\nplugin: shell\ncommand: aplay -l\n\
             depends: audio/detect, audio/mixer\nafter: net/ping\n\
             requires: device.category == 'AUDIO'\nflags: noreturn bogus preserve-locale\n\
             estimated_duration: 2.5\nenviron: ALSA_CARD\ncertification-status: blocker\n")
        .unwrap();

        assert_eq!(job.id, "com.example::audio/playback");
        assert_eq!(job.partial_id(), "audio/playback");
        assert_eq!(
            job.depends,
            vec!["com.example::audio/detect", "com.example::audio/mixer"]
        );
        assert_eq!(job.after, vec!["com.example::net/ping"]);
        assert!(job.has_flag(JobFlag::NoReturn));
        assert!(job.has_flag(JobFlag::PreserveLocale));
        assert_eq!(job.flags.len(), 2);
        assert_eq!(job.estimated_duration, Some(2.5));
        assert_eq!(job.certification_status, CertificationStatus::Blocker);
        assert_eq!(
            job.hard_prerequisites(),
            vec![
                "com.example::audio/detect",
                "com.example::audio/mixer",
                "com.example::device"
            ]
        );
    }

    #[test]
    fn test_missing_fields_are_parse_errors() {
        assert!(matches!(job("plugin: shell\ncommand: true\n"), Err(Error::Parse { .. })));
        assert!(matches!(job("id: a\ncommand: true\n"), Err(Error::Parse { .. })));
        assert!(matches!(job("id: a\nplugin: shell\n"), Err(Error::Parse { .. })));
        assert!(matches!(
            job("id: a\nplugin: teleport\ncommand: true\n"),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(
            job("id: a\nplugin: shell\ncommand: true\nrequires: device.x ==\n"),
            Err(Error::Parse { .. })
        ));
        assert!(job("id: a\nplugin: manual\n").is_ok());
    }

    #[test]
    fn test_after_suspend_sibling() {
        let job = job("id: wifi/scan\n_summary: Scan networks\nplugin: shell\ncommand: true\n\
             depends: wifi/detect\nflags: also-after-suspend\n")
        .unwrap();
        let sibling = job.after_suspend_sibling();

        assert_eq!(sibling.id, "com.example::after-suspend-wifi/scan");
        assert!(!sibling.has_flag(JobFlag::AlsoAfterSuspend));
        assert_eq!(sibling.summary.as_deref(), Some("Scan networks after suspend (S3)"));
        assert_eq!(
            sibling.depends,
            vec![
                "com.example::wifi/detect",
                "com.example::wifi/scan",
                "com.example::suspend/suspend_advanced_auto"
            ]
        );
    }

    #[test]
    fn test_prompt_text() {
        let job = job("id: kb\nplugin: manual\nsummary: Keyboard\npurpose: Check keys\n").unwrap();
        assert_eq!(job.prompt(), "Keyboard\n\nPurpose:\nCheck keys");
    }
}
