//! Turning a test plan into an ordered job list
//!
//! Resolution runs in two phases. The static phase flattens nested plans.
//! The dynamic phase runs bootstrap jobs, expands templates from the tables
//! they produced and only then selects, closes and orders the job set.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tokio_util::sync::CancellationToken;

use super::order::order;
use crate::common::{Error, Result};
use crate::exec::{ExitKind, JobRunner, RunContext, RunReport};
use crate::resource::expr::{Scope, MANIFEST_RESOURCE};
use crate::resource::{requirements_met, table_from_report, ResourceMap, ResourceTable};
use crate::units::job::{namespace_of, Plugin};
use crate::units::testplan::Pattern;
use crate::units::{Catalog, JobFlag, JobUnit, TestPlan, UnitSource};

/// Controller-side adjustments to a test plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOverrides {
    /// Extra exclude patterns, qualified with the plan's namespace
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Restrict the selection to these job ids
    #[serde(default)]
    pub only: Option<Vec<String>>,
}

/// A job that already ran while the plan was being resolved
#[derive(Debug, Clone)]
pub struct PrerunJob {
    pub job_id: String,
    /// `None` when the command could not be started
    pub report: Option<RunReport>,
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PrerunJob {
    pub fn exit(&self) -> Option<&ExitKind> {
        self.report.as_ref().map(|r| &r.exit)
    }
}

/// Outcome of resolution, ready to become a session
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub test_plan: String,
    pub jobs: Vec<JobUnit>,
    /// Tables produced during resolution, manifest included
    pub resources: ResourceMap,
    /// Jobs executed during resolution, in execution order
    pub prerun: Vec<PrerunJob>,
}

impl ResolvedPlan {
    pub fn job_ids(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.id.as_str()).collect()
    }
}

/// Mutable state of one resolution
struct Work {
    catalog: Catalog,
    tables: ResourceMap,
    prerun: IndexMap<String, PrerunJob>,
}

pub struct Resolver<'a> {
    catalog: &'a Catalog,
    runner: &'a dyn JobRunner,
    context: &'a RunContext,
    manifest: BTreeMap<String, String>,
    cancel: CancellationToken,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a Catalog, runner: &'a dyn JobRunner, context: &'a RunContext) -> Self {
        Self {
            catalog,
            runner,
            context,
            manifest: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Manifest answers exposed to requirement programs as `manifest`
    pub fn with_manifest(mut self, manifest: BTreeMap<String, String>) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve `plan_id` into an ordered job list
    pub async fn resolve(&self, plan_id: &str, overrides: &PlanOverrides) -> Result<ResolvedPlan> {
        let plans = self.flatten(plan_id)?;
        let root = plans[0];

        let mut work = Work {
            catalog: self.catalog.clone(),
            tables: ResourceMap::new(),
            prerun: IndexMap::new(),
        };
        work.tables.insert(
            MANIFEST_RESOURCE.to_string(),
            ResourceTable::from_manifest(&self.manifest),
        );

        let includes: Vec<_> = plans.iter().flat_map(|p| p.include.iter()).collect();
        let scope = Scope::new(namespace_of(&root.id));
        let mut excludes: Vec<Pattern> = plans.iter().flat_map(|p| p.exclude.iter().cloned()).collect();
        for text in &overrides.exclude {
            excludes.push(Pattern::new(text, &scope).map_err(|e| Error::parse("exclude override", e))?);
        }

        // Dynamic phase: bootstrap, then templates
        let mut bootstrap: Vec<&String> = Vec::new();
        for id in plans.iter().flat_map(|p| p.bootstrap_include.iter()) {
            if !bootstrap.contains(&id) {
                bootstrap.push(id);
            }
        }
        for id in bootstrap {
            self.prerun(&mut work, id).await?;
        }

        let templates: Vec<_> = work.catalog.templates().cloned().collect();
        for template in templates {
            let selected = includes.iter().any(|e| e.pattern.matches(&template.id));
            if !selected && !work.tables.contains_key(&template.resource) {
                continue;
            }
            if !work.tables.contains_key(&template.resource) {
                if work.catalog.job(&template.resource).is_none() {
                    return Err(Error::unknown_dependency(&template.id, &template.resource));
                }
                self.prerun(&mut work, &template.resource).await?;
            }
            let Some(table) = work.tables.get(&template.resource) else {
                tracing::warn!(template = %template.id, resource = %template.resource, "no resource data, template not expanded");
                continue;
            };
            if selected {
                for job in template.expand(table)? {
                    work.catalog.add_job(job)?;
                }
                continue;
            }

            // Not named by the plan: its jobs are only candidates for selection
            let jobs = match template.expand(table) {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::warn!(template = %template.id, error = %e, "unselected template not expanded");
                    continue;
                }
            };
            for job in jobs {
                let job_id = job.id.clone();
                if let Err(e) = work.catalog.add_job(job) {
                    tracing::warn!(template = %template.id, job_id = %job_id, error = %e, "skipping generated job");
                }
            }
        }

        // Selection, in include order
        let mut selected: IndexMap<String, JobUnit> = IndexMap::new();
        for entry in &includes {
            for job in work.catalog.jobs() {
                let by_template = job
                    .template_id
                    .as_deref()
                    .is_some_and(|t| entry.pattern.matches(t));
                if !entry.pattern.matches(&job.id) && !by_template {
                    continue;
                }
                let chosen = selected
                    .entry(job.id.clone())
                    .or_insert_with(|| job.clone());
                entry.overrides.apply(chosen);
            }
        }

        if let Some(only) = &overrides.only {
            selected.retain(|id, job| {
                only.iter().any(|o| o == id || o == job.partial_id())
            });
        }
        selected.retain(|id, _| {
            let excluded = excludes.iter().any(|p| p.matches(id));
            if excluded {
                tracing::debug!(job_id = %id, "excluded by test plan");
            }
            !excluded
        });

        // Closure over hard prerequisites
        let mut queue: VecDeque<String> = selected.keys().cloned().collect();
        while let Some(id) = queue.pop_front() {
            let prerequisites = match selected.get(&id) {
                Some(job) => job.hard_prerequisites(),
                None => continue,
            };
            for dep in prerequisites {
                if selected.contains_key(&dep) {
                    continue;
                }
                let job = work
                    .catalog
                    .job(&dep)
                    .ok_or_else(|| Error::unknown_dependency(&id, &dep))?;
                selected.insert(dep.clone(), job.clone());
                queue.push_back(dep);
            }
        }

        let ordered = order(&selected)?;
        let jobs: Vec<JobUnit> = ordered
            .iter()
            .filter_map(|id| selected.get(id).cloned())
            .collect();

        tracing::info!(
            test_plan = %root.id,
            jobs = jobs.len(),
            prerun = work.prerun.len(),
            "resolved test plan"
        );

        Ok(ResolvedPlan {
            test_plan: root.id.clone(),
            jobs,
            resources: work.tables,
            prerun: work.prerun.into_values().collect(),
        })
    }

    /// The plan and everything it nests, depth first, each plan once
    fn flatten(&self, plan_id: &str) -> Result<Vec<&'a TestPlan>> {
        let mut plans = Vec::new();
        let mut trail = Vec::new();
        self.flatten_into(plan_id, &mut trail, &mut plans)?;
        Ok(plans)
    }

    fn flatten_into(
        &self,
        plan_id: &str,
        trail: &mut Vec<String>,
        plans: &mut Vec<&'a TestPlan>,
    ) -> Result<()> {
        if trail.iter().any(|t| t == plan_id) {
            let mut cycle = trail.clone();
            cycle.push(plan_id.to_string());
            return Err(Error::CyclicPlan(cycle));
        }
        let plan = self
            .catalog
            .test_plan(plan_id)
            .ok_or_else(|| Error::UnknownUnit(plan_id.to_string()))?;
        if plans.iter().any(|p| p.id == plan.id) {
            return Ok(());
        }

        plans.push(plan);
        trail.push(plan_id.to_string());
        for nested in &plan.nested_part {
            self.flatten_into(nested, trail, plans)?;
        }
        trail.pop();
        Ok(())
    }

    /// Run `job_id` and whatever it needs, unless they already ran
    async fn prerun(&self, work: &mut Work, job_id: &str) -> Result<()> {
        let mut needed: IndexMap<String, JobUnit> = IndexMap::new();
        let mut queue = VecDeque::from([job_id.to_string()]);
        while let Some(id) = queue.pop_front() {
            if needed.contains_key(&id) {
                continue;
            }
            let job = work.catalog.job(&id).ok_or_else(|| {
                if id == job_id {
                    Error::UnknownUnit(id.clone())
                } else {
                    Error::unknown_dependency(job_id, &id)
                }
            })?;
            queue.extend(job.hard_prerequisites());
            needed.insert(id, job.clone());
        }

        for id in order(&needed)? {
            if work.prerun.contains_key(&id) {
                continue;
            }
            if let Some(job) = needed.get(&id) {
                self.run_one(work, job).await?;
            }
        }
        Ok(())
    }

    async fn run_one(&self, work: &mut Work, job: &JobUnit) -> Result<()> {
        match requirements_met(job, &work.tables) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id = %job.id, "bootstrap job requirements not met, not running it");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(job_id = %job.id, error = %e, "bootstrap job requirements not met, not running it");
                return Ok(());
            }
        }
        let Some(request) = self.context.request(job) else {
            return Ok(());
        };

        tracing::info!(job_id = %job.id, "running bootstrap job");
        let started_at = Utc::now();
        let result = self.runner.run(request, None, self.cancel.clone()).await;
        if self.cancel.is_cancelled() {
            return Err(Error::invalid_state("resolve test plan", "aborted"));
        }

        let (report, reason) = match result {
            Ok(report) => {
                self.absorb(work, job, &report)?;
                (Some(report), None)
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "bootstrap job could not be started");
                (None, Some(e.to_string()))
            }
        };

        work.prerun.insert(
            job.id.clone(),
            PrerunJob {
                job_id: job.id.clone(),
                report,
                reason,
                started_at,
                finished_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Feed the output of a bootstrap job back into resolution
    fn absorb(&self, work: &mut Work, job: &JobUnit, report: &RunReport) -> Result<()> {
        match job.plugin {
            Plugin::Resource => {
                let table = match table_from_report(job, report) {
                    Ok(table) => table,
                    Err(e) if job.has_flag(JobFlag::FailOnResource) => return Err(e),
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "ignoring malformed resource output");
                        ResourceTable::default()
                    }
                };
                work.tables.insert(job.id.clone(), table);
            }
            Plugin::Local => {
                let source = UnitSource::new(
                    format!("{} (generated)", job.id),
                    job.namespace(),
                    String::from_utf8_lossy(&report.stdout),
                );
                if let Err(e) = work.catalog.add_source(&source) {
                    tracing::warn!(job_id = %job.id, error = %e, "discarding units generated by local job");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::exec::{OutputSink, RunRequest};

    /// Prints canned output for known commands
    #[derive(Default)]
    struct ScriptedRunner {
        outputs: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn with(mut self, command: &str, output: &str) -> Self {
            self.outputs.insert(command.to_string(), output.to_string());
            self
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run(
            &self,
            request: RunRequest,
            _output: Option<OutputSink>,
            _cancel: CancellationToken,
        ) -> Result<RunReport> {
            self.calls.lock().push(request.job_id.clone());
            let stdout = self.outputs.get(&request.command).cloned().unwrap_or_default();
            Ok(RunReport {
                exit: ExitKind::Code(0),
                stdout: stdout.into_bytes(),
                stderr: Vec::new(),
                duration: Duration::ZERO,
            })
        }
    }

    fn context() -> RunContext {
        RunContext {
            session_id: "test".into(),
            share_dir: PathBuf::from("/tmp"),
            overrides: BTreeMap::new(),
            host: BTreeMap::new(),
            default_timeout: None,
        }
    }

    fn catalog(text: &str) -> Catalog {
        Catalog::load(&[UnitSource::new("test.pxu", Some("com.example"), text)]).unwrap()
    }

    async fn resolve(catalog: &Catalog, runner: &ScriptedRunner, plan: &str) -> Result<ResolvedPlan> {
        let ctx = context();
        Resolver::new(catalog, runner, &ctx)
            .resolve(plan, &PlanOverrides::default())
            .await
    }

    const DEVICES: &str = "\
id: device
plugin: resource
command: list-devices

unit: template
template-resource: device
template-filter: device.bus == 'usb'
id: probe_{name}
plugin: shell
command: probe {name} {__index__}

unit: test plan
id: probes
include: probe_.*
";

    #[tokio::test]
    async fn test_template_instances_follow_resource() {
        let catalog = catalog(DEVICES);
        let runner = ScriptedRunner::default().with(
            "list-devices",
            "name: cam\nbus: usb\n\nname: nic\nbus: pci\n\nname: key\nbus: usb\n",
        );
        let plan = resolve(&catalog, &runner, "com.example::probes").await.unwrap();

        assert_eq!(
            plan.job_ids(),
            vec![
                "com.example::device",
                "com.example::probe_cam",
                "com.example::probe_key"
            ]
        );
        assert_eq!(plan.jobs[2].command.as_deref(), Some("probe key 2"));
        assert_eq!(plan.resources["com.example::device"].len(), 3);
        assert_eq!(plan.prerun.len(), 1);
        assert_eq!(*runner.calls.lock(), vec!["com.example::device"]);
    }

    #[tokio::test]
    async fn test_exclude_wins_over_include() {
        let catalog = catalog(
            "id: a\nplugin: shell\ncommand: true\n\n\
             id: b\nplugin: shell\ncommand: true\n\n\
             unit: test plan\nid: inner\ninclude: b\n\n\
             unit: test plan\nid: outer\nexclude: b\ninclude: a\nnested_part: inner\n",
        );
        let plan = resolve(&catalog, &ScriptedRunner::default(), "com.example::outer")
            .await
            .unwrap();
        assert_eq!(plan.job_ids(), vec!["com.example::a"]);
    }

    #[tokio::test]
    async fn test_closure_pulls_prerequisites() {
        let catalog = catalog(
            "id: info\nplugin: resource\ncommand: info\n\n\
             id: base\nplugin: shell\ncommand: true\n\n\
             id: top\nplugin: shell\ncommand: true\ndepends: base\nrequires: info.ok == 'yes'\n\n\
             unit: test plan\nid: p\ninclude: top\n",
        );
        let plan = resolve(&catalog, &ScriptedRunner::default(), "com.example::p")
            .await
            .unwrap();
        assert_eq!(
            plan.job_ids(),
            vec!["com.example::base", "com.example::info", "com.example::top"]
        );
        // Nothing runs unless bootstrapped
        assert!(plan.prerun.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_dependency_aborts() {
        let catalog = catalog(
            "id: top\nplugin: shell\ncommand: true\ndepends: ghost\n\n\
             unit: test plan\nid: p\ninclude: top\n",
        );
        let err = resolve(&catalog, &ScriptedRunner::default(), "com.example::p")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { ref dependency, .. } if dependency == "com.example::ghost"));
    }

    #[tokio::test]
    async fn test_nested_plan_cycle() {
        let catalog = catalog(
            "unit: test plan\nid: a\nnested_part: b\n\n\
             unit: test plan\nid: b\nnested_part: a\n",
        );
        let err = resolve(&catalog, &ScriptedRunner::default(), "com.example::a")
            .await
            .unwrap_err();
        match err {
            Error::CyclicPlan(trail) => assert_eq!(
                trail,
                vec!["com.example::a", "com.example::b", "com.example::a"]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_plan() {
        let catalog = catalog("id: a\nplugin: shell\ncommand: true\n");
        let err = resolve(&catalog, &ScriptedRunner::default(), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownUnit(_)));
    }

    #[tokio::test]
    async fn test_colliding_template_ids_abort() {
        let catalog = catalog(DEVICES);
        let runner = ScriptedRunner::default().with(
            "list-devices",
            "name: cam\nbus: usb\n\nname: cam\nbus: usb\n",
        );
        let err = resolve(&catalog, &runner, "com.example::probes").await.unwrap_err();
        assert!(matches!(err, Error::Template { .. }));
    }

    #[tokio::test]
    async fn test_unselected_template_collision_is_skipped() {
        let text = format!(
            "{DEVICES}\n\
             unit: template\ntemplate-resource: device\nid: other_{{name}}\nplugin: shell\ncommand: other {{name}}\n\n\
             id: other_cam\nplugin: shell\ncommand: true\n"
        );
        let catalog = catalog(&text);
        let runner = ScriptedRunner::default().with("list-devices", "name: cam\nbus: usb\n");
        let plan = resolve(&catalog, &runner, "com.example::probes").await.unwrap();
        assert_eq!(
            plan.job_ids(),
            vec!["com.example::device", "com.example::probe_cam"]
        );
    }

    #[tokio::test]
    async fn test_local_job_generates_units() {
        let catalog = catalog(
            "id: gen\nplugin: local\ncommand: generate\n\n\
             unit: test plan\nid: p\nbootstrap_include: gen\ninclude: generated_.*\n",
        );
        let runner = ScriptedRunner::default().with(
            "generate",
            "id: generated_one\nplugin: shell\ncommand: true\n\n\
             id: generated_two\nplugin: shell\ncommand: true\n",
        );
        let plan = resolve(&catalog, &runner, "com.example::p").await.unwrap();
        assert_eq!(
            plan.job_ids(),
            vec!["com.example::generated_one", "com.example::generated_two"]
        );
    }

    #[tokio::test]
    async fn test_overrides_only_and_exclude() {
        let catalog = catalog(
            "id: a\nplugin: shell\ncommand: true\n\n\
             id: b\nplugin: shell\ncommand: true\n\n\
             id: c\nplugin: shell\ncommand: true\n\n\
             unit: test plan\nid: p\ninclude: .*\n",
        );
        let ctx = context();
        let runner = ScriptedRunner::default();
        let overrides = PlanOverrides {
            exclude: vec!["c".into()],
            only: Some(vec!["b".into(), "com.example::c".into()]),
        };
        let plan = Resolver::new(&catalog, &runner, &ctx)
            .resolve("com.example::p", &overrides)
            .await
            .unwrap();
        assert_eq!(plan.job_ids(), vec!["com.example::b"]);
    }

    #[tokio::test]
    async fn test_inline_overrides_apply() {
        let catalog = catalog(
            "id: a\nplugin: shell\ncommand: true\n\n\
             unit: test plan\nid: p\ninclude: a certification-status=blocker timeout=9\n",
        );
        let plan = resolve(&catalog, &ScriptedRunner::default(), "com.example::p")
            .await
            .unwrap();
        assert_eq!(plan.jobs[0].timeout, Some(9));
        assert_eq!(
            plan.jobs[0].certification_status,
            crate::units::job::CertificationStatus::Blocker
        );
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic() {
        let catalog = catalog(DEVICES);
        let runner = ScriptedRunner::default().with(
            "list-devices",
            "name: b\nbus: usb\n\nname: a\nbus: usb\n",
        );
        let first = resolve(&catalog, &runner, "com.example::probes").await.unwrap();
        let second = resolve(&catalog, &runner, "com.example::probes").await.unwrap();
        assert_eq!(first.job_ids(), second.job_ids());
    }
}
