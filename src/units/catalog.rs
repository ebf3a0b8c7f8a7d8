//! The unit catalog: every job, template, test plan and manifest entry known
//! to the agent, keyed by qualified id

use indexmap::IndexMap;
use std::path::{Path, PathBuf};

use super::job::{JobFlag, JobUnit};
use super::rfc822::{self, DuplicateKeys, Origin, Record};
use super::template::TemplateUnit;
use super::testplan::TestPlan;
use crate::common::config::UnitsConfig;
use crate::common::{Error, Result};
use crate::resource::expr::Scope;

/// File extensions read from unit directories
const UNIT_EXTENSIONS: &[&str] = &["pxu", "units"];

/// Text holding unit definitions, plus the namespace its partial ids live in
#[derive(Debug, Clone)]
pub struct UnitSource {
    pub name: String,
    pub namespace: Option<String>,
    pub text: String,
}

impl UnitSource {
    pub fn new(name: impl Into<String>, namespace: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.map(str::to_string),
            text: text.into(),
        }
    }

    pub fn read(path: &Path, namespace: Option<&str>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Ok(Self::new(path.display().to_string(), namespace, text))
    }

    /// Read every unit file below `dir`, in path order
    pub fn scan_dir(dir: &Path, namespace: &str) -> Result<Vec<Self>> {
        let mut files = Vec::new();
        collect_unit_files(dir, &mut files)?;
        files.sort();
        files
            .iter()
            .map(|path| Self::read(path, Some(namespace)))
            .collect()
    }
}

fn collect_unit_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_unit_files(&path, files)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| UNIT_EXTENSIONS.contains(&e))
        {
            files.push(path);
        }
    }
    Ok(())
}

/// Type of a manifest answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestValueType {
    Bool,
    Natural,
}

/// A hardware fact the operator is asked about before testing
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub id: String,
    pub name: Option<String>,
    pub value_type: ManifestValueType,
    pub origin: Origin,
}

impl ManifestEntry {
    pub fn from_record(record: &Record, namespace: Option<&str>) -> Result<Self> {
        let bad = |message: String| Error::parse(&record.origin, message);
        let id = record
            .get("id")
            .ok_or_else(|| bad("manifest entry has no 'id' field".into()))?;
        let value_type = match record.get("value-type") {
            Some("bool") => ManifestValueType::Bool,
            Some("natural") => ManifestValueType::Natural,
            other => {
                return Err(bad(format!(
                    "manifest entry '{}' has invalid value-type {:?}",
                    id, other
                )))
            }
        };
        Ok(Self {
            id: Scope::new(namespace).qualify(id),
            name: record.get("name").map(str::to_string),
            value_type,
            origin: record.origin.clone(),
        })
    }
}

/// A unit found by [`Catalog::lookup`]
#[derive(Debug, Clone, Copy)]
pub enum Unit<'a> {
    Job(&'a JobUnit),
    Template(&'a TemplateUnit),
    TestPlan(&'a TestPlan),
    Manifest(&'a ManifestEntry),
}

impl Unit<'_> {
    pub fn origin(&self) -> &Origin {
        match self {
            Unit::Job(j) => &j.origin,
            Unit::Template(t) => &t.origin,
            Unit::TestPlan(p) => &p.origin,
            Unit::Manifest(m) => &m.origin,
        }
    }
}

enum ParsedUnit {
    Job(JobUnit),
    Template(TemplateUnit),
    TestPlan(TestPlan),
    Manifest(ManifestEntry),
}

impl ParsedUnit {
    fn id(&self) -> &str {
        match self {
            ParsedUnit::Job(j) => &j.id,
            ParsedUnit::Template(t) => &t.id,
            ParsedUnit::TestPlan(p) => &p.id,
            ParsedUnit::Manifest(m) => &m.id,
        }
    }

    fn origin(&self) -> &Origin {
        match self {
            ParsedUnit::Job(j) => &j.origin,
            ParsedUnit::Template(t) => &t.origin,
            ParsedUnit::TestPlan(p) => &p.origin,
            ParsedUnit::Manifest(m) => &m.origin,
        }
    }
}

/// Parse all units in one source
fn parse_source(source: &UnitSource) -> Result<Vec<ParsedUnit>> {
    let namespace = source.namespace.as_deref();
    let mut units = Vec::new();

    for record in rfc822::parse(&source.text, &source.name, DuplicateKeys::Reject)? {
        match record.get("unit").unwrap_or("job") {
            "job" => {
                let job = JobUnit::from_record(&record, namespace)?;
                let sibling = job
                    .has_flag(JobFlag::AlsoAfterSuspend)
                    .then(|| job.after_suspend_sibling());
                units.push(ParsedUnit::Job(job));
                units.extend(sibling.map(ParsedUnit::Job));
            }
            "template" => units.push(ParsedUnit::Template(TemplateUnit::from_record(
                &record, namespace,
            )?)),
            "test plan" => units.push(ParsedUnit::TestPlan(TestPlan::from_record(
                &record, namespace,
            )?)),
            "manifest entry" => units.push(ParsedUnit::Manifest(ManifestEntry::from_record(
                &record, namespace,
            )?)),
            other => {
                tracing::debug!(origin = %record.origin, unit = other, "skipping unsupported unit");
            }
        }
    }

    Ok(units)
}

/// In-memory store of parsed units
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    jobs: IndexMap<String, JobUnit>,
    templates: IndexMap<String, TemplateUnit>,
    test_plans: IndexMap<String, TestPlan>,
    manifest: IndexMap<String, ManifestEntry>,
}

impl Catalog {
    /// Load every source; any malformed source fails the whole load
    pub fn load(sources: &[UnitSource]) -> Result<Self> {
        let mut catalog = Self::default();
        for source in sources {
            catalog.add_source(source)?;
        }
        Ok(catalog)
    }

    /// Load every source, skipping the ones that fail to parse
    pub fn load_each(sources: &[UnitSource]) -> (Self, Vec<Error>) {
        let mut catalog = Self::default();
        let mut errors = Vec::new();
        for source in sources {
            if let Err(e) = catalog.add_source(source) {
                tracing::warn!(source = %source.name, error = %e, "discarding unit source");
                errors.push(e);
            }
        }
        (catalog, errors)
    }

    /// Load every unit directory named in the configuration
    ///
    /// Unreadable directories and malformed sources are skipped and reported.
    pub fn from_config(config: &UnitsConfig) -> (Self, Vec<Error>) {
        let mut sources = Vec::new();
        let mut errors = Vec::new();
        for dir in &config.dirs {
            match UnitSource::scan_dir(&dir.path, &dir.namespace) {
                Ok(found) => sources.extend(found),
                Err(e) => {
                    tracing::warn!(dir = %dir.path.display(), error = %e, "cannot read unit directory");
                    errors.push(e);
                }
            }
        }
        let (catalog, more) = Self::load_each(&sources);
        errors.extend(more);
        (catalog, errors)
    }

    /// Add all units of one source, or none of them
    pub fn add_source(&mut self, source: &UnitSource) -> Result<()> {
        let units = parse_source(source)?;

        let mut seen = std::collections::HashMap::new();
        for unit in &units {
            if let Some(existing) = self.lookup(unit.id()) {
                return Err(Error::DuplicateId {
                    id: unit.id().to_string(),
                    first: existing.origin().to_string(),
                    second: unit.origin().to_string(),
                });
            }
            if let Some(first) = seen.insert(unit.id().to_string(), unit.origin()) {
                return Err(Error::DuplicateId {
                    id: unit.id().to_string(),
                    first: first.to_string(),
                    second: unit.origin().to_string(),
                });
            }
        }

        let count = units.len();
        for unit in units {
            match unit {
                ParsedUnit::Job(job) => {
                    self.jobs.insert(job.id.clone(), job);
                }
                ParsedUnit::Template(t) => {
                    self.templates.insert(t.id.clone(), t);
                }
                ParsedUnit::TestPlan(p) => {
                    self.test_plans.insert(p.id.clone(), p);
                }
                ParsedUnit::Manifest(m) => {
                    self.manifest.insert(m.id.clone(), m);
                }
            }
        }
        tracing::debug!(source = %source.name, units = count, "loaded unit source");
        Ok(())
    }

    /// Add a job created at run time (template instance or `local` job output)
    pub fn add_job(&mut self, job: JobUnit) -> Result<()> {
        if let Some(existing) = self.lookup(&job.id) {
            return Err(Error::DuplicateId {
                id: job.id.clone(),
                first: existing.origin().to_string(),
                second: job.origin.to_string(),
            });
        }
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Option<Unit<'_>> {
        if let Some(job) = self.jobs.get(id) {
            return Some(Unit::Job(job));
        }
        if let Some(plan) = self.test_plans.get(id) {
            return Some(Unit::TestPlan(plan));
        }
        if let Some(template) = self.templates.get(id) {
            return Some(Unit::Template(template));
        }
        self.manifest.get(id).map(Unit::Manifest)
    }

    pub fn job(&self, id: &str) -> Option<&JobUnit> {
        self.jobs.get(id)
    }

    pub fn test_plan(&self, id: &str) -> Option<&TestPlan> {
        self.test_plans.get(id)
    }

    /// Jobs in declaration order
    pub fn jobs(&self) -> impl Iterator<Item = &JobUnit> {
        self.jobs.values()
    }

    pub fn templates(&self) -> impl Iterator<Item = &TemplateUnit> {
        self.templates.values()
    }

    pub fn test_plans(&self) -> impl Iterator<Item = &TestPlan> {
        self.test_plans.values()
    }

    pub fn manifest_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.manifest.values()
    }
}
