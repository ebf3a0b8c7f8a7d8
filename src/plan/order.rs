//! Execution ordering
//!
//! Jobs are ordered depth-first in selection order. Hard edges (`depends`,
//! requirement resources, the driving resource of generated jobs) must hold.
//! Soft edges (`after`, suspend ordering) are honoured only while they keep
//! the graph acyclic.

use indexmap::IndexMap;
use std::collections::HashMap;

use crate::common::{Error, Result};
use crate::units::{JobFlag, JobUnit};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Order the jobs of a closed selection
///
/// `jobs` must contain every job named by the hard edges of the selection.
pub fn order(jobs: &IndexMap<String, JobUnit>) -> Result<Vec<String>> {
    let ids: Vec<&str> = jobs.keys().map(String::as_str).collect();
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for (i, job) in jobs.values().enumerate() {
        for dep in job.hard_prerequisites() {
            let &d = index
                .get(dep.as_str())
                .ok_or_else(|| Error::unknown_dependency(&job.id, &dep))?;
            edges[i].push(d);
        }
    }

    // Fails on the first real cycle; nothing soft has been added yet
    visit_all(&ids, &edges)?;

    for (job_idx, before_idx) in soft_edges(jobs, &index) {
        if edges[job_idx].contains(&before_idx) {
            continue;
        }
        if reaches(&edges, before_idx, job_idx) {
            tracing::debug!(
                job_id = ids[job_idx],
                after = ids[before_idx],
                "ordering hint would form a cycle, ignoring it"
            );
            continue;
        }
        edges[job_idx].push(before_idx);
    }

    let sorted = visit_all(&ids, &edges)?;
    Ok(sorted.into_iter().map(|i| ids[i].to_string()).collect())
}

/// `(job, job it should follow)` pairs, in selection order
fn soft_edges(jobs: &IndexMap<String, JobUnit>, index: &HashMap<&str, usize>) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (i, job) in jobs.values().enumerate() {
        for after in &job.after {
            match index.get(after.as_str()) {
                Some(&a) if a != i => pairs.push((i, a)),
                Some(_) => {}
                None => tracing::debug!(job_id = %job.id, after = %after, "ordering hint names a job outside the plan"),
            }
        }
    }
    // A suspend job runs after every job that must be repeated after suspend
    for (i, job) in jobs.values().enumerate() {
        if !job.has_flag(JobFlag::AlsoAfterSuspend) {
            continue;
        }
        if let Some(&s) = index.get(job.suspend_job_id().as_str()) {
            if s != i {
                pairs.push((s, i));
            }
        }
    }
    pairs
}

/// Whether `to` is reachable from `from` along prerequisite edges
fn reaches(edges: &[Vec<usize>], from: usize, to: usize) -> bool {
    let mut seen = vec![false; edges.len()];
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if std::mem::replace(&mut seen[node], true) {
            continue;
        }
        stack.extend(edges[node].iter().copied().filter(|&n| !seen[n]));
    }
    false
}

/// Post-order DFS over all nodes in index order
fn visit_all(ids: &[&str], edges: &[Vec<usize>]) -> Result<Vec<usize>> {
    let mut marks = vec![Mark::White; ids.len()];
    let mut sorted = Vec::with_capacity(ids.len());
    for root in 0..ids.len() {
        if marks[root] == Mark::White {
            visit(root, ids, edges, &mut marks, &mut sorted)?;
        }
    }
    Ok(sorted)
}

fn visit(
    root: usize,
    ids: &[&str],
    edges: &[Vec<usize>],
    marks: &mut [Mark],
    sorted: &mut Vec<usize>,
) -> Result<()> {
    // Explicit stack of (node, next edge to look at); deep chains are common
    let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
    marks[root] = Mark::Gray;

    while let Some(top) = stack.last_mut() {
        let (node, next) = *top;
        if let Some(&dep) = edges[node].get(next) {
            top.1 += 1;
            match marks[dep] {
                Mark::Black => {}
                Mark::White => {
                    marks[dep] = Mark::Gray;
                    stack.push((dep, 0));
                }
                Mark::Gray => {
                    let start = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                    let mut trail: Vec<String> =
                        stack[start..].iter().map(|(n, _)| ids[*n].to_string()).collect();
                    trail.push(ids[dep].to_string());
                    return Err(Error::CyclicDependency(trail));
                }
            }
        } else {
            marks[node] = Mark::Black;
            sorted.push(node);
            stack.pop();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::rfc822::Origin;
    use std::collections::BTreeMap;

    fn job(id: &str, depends: &[&str], after: &[&str]) -> JobUnit {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), id.to_string());
        fields.insert("plugin".to_string(), "shell".to_string());
        fields.insert("command".to_string(), "true".to_string());
        if !depends.is_empty() {
            fields.insert("depends".to_string(), depends.join(" "));
        }
        if !after.is_empty() {
            fields.insert("after".to_string(), after.join(" "));
        }
        JobUnit::from_fields(&fields, Origin::synthetic("test"), None).unwrap()
    }

    fn selection(jobs: Vec<JobUnit>) -> IndexMap<String, JobUnit> {
        jobs.into_iter().map(|j| (j.id.clone(), j)).collect()
    }

    #[test]
    fn test_depends_and_after_precede() {
        let jobs = selection(vec![
            job("d", &["a", "b"], &["c"]),
            job("c", &[], &[]),
            job("b", &[], &[]),
            job("a", &[], &[]),
        ]);
        assert_eq!(order(&jobs).unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_selection_order_breaks_ties() {
        let jobs = selection(vec![job("x", &[], &[]), job("y", &[], &[]), job("z", &[], &[])]);
        assert_eq!(order(&jobs).unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_hard_cycle_is_fatal() {
        let jobs = selection(vec![job("a", &["b"], &[]), job("b", &["c"], &[]), job("c", &["a"], &[])]);
        match order(&jobs).unwrap_err() {
            Error::CyclicDependency(trail) => {
                assert_eq!(trail.first(), trail.last());
                assert_eq!(trail.len(), 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_after_hint_never_forms_a_cycle() {
        // a after b, but b depends on a: the hint loses
        let jobs = selection(vec![job("a", &[], &["b"]), job("b", &["a"], &[])]);
        assert_eq!(order(&jobs).unwrap(), vec!["a", "b"]);

        // indirect: a after c, c depends on b, b depends on a
        let jobs = selection(vec![
            job("a", &[], &["c"]),
            job("b", &["a"], &[]),
            job("c", &["b"], &[]),
        ]);
        assert_eq!(order(&jobs).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_mutual_after_hints_keep_first() {
        let jobs = selection(vec![job("a", &[], &["b"]), job("b", &[], &["a"])]);
        assert_eq!(order(&jobs).unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn test_missing_hard_prerequisite() {
        let jobs = selection(vec![job("a", &["ghost"], &[])]);
        assert!(matches!(
            order(&jobs).unwrap_err(),
            Error::UnknownDependency { .. }
        ));
    }

    #[test]
    fn test_suspend_runs_after_flagged_jobs() {
        let suspend = job(crate::units::job::SUSPEND_JOB, &[], &[]);
        let mut wifi = job("wifi", &[], &[]);
        wifi.flags.insert(JobFlag::AlsoAfterSuspend);
        let sibling = wifi.after_suspend_sibling();
        let jobs = selection(vec![sibling, suspend, wifi]);
        assert_eq!(
            order(&jobs).unwrap(),
            vec!["wifi", crate::units::job::SUSPEND_JOB, "after-suspend-wifi"]
        );
    }
}
