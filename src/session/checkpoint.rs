//! Durable session checkpoints
//!
//! Layout under the storage root:
//!
//! ```text
//! current                  id of the session the agent should resume
//! <id>/session.json        last checkpoint
//! <id>/io-logs/<job>.log   captured job output
//! <id>/share/              scratch directory shared by the session's jobs
//! archive/<id>/            finished sessions
//! ```
//!
//! Every write goes to a temporary file that is synced and renamed over the
//! previous one, so a crash leaves either the old or the new checkpoint.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::state::{Session, SESSION_VERSION};
use crate::common::{slugify, Error, Result};

const CHECKPOINT_FILE: &str = "session.json";
const CURRENT_FILE: &str = "current";
const ARCHIVE_DIR: &str = "archive";

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn checkpoint_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(CHECKPOINT_FILE)
    }

    pub fn share_dir(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("share")
    }

    pub fn io_log_path(&self, id: &str, job_id: &str) -> PathBuf {
        self.session_dir(id)
            .join("io-logs")
            .join(format!("{}.log", slugify(job_id)))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR)
    }

    /// Create the directories a new session needs
    pub fn prepare(&self, id: &str) -> Result<()> {
        for dir in [self.share_dir(id), self.session_dir(id).join("io-logs")] {
            fs::create_dir_all(&dir).map_err(|e| Error::checkpoint(&dir, e))?;
        }
        Ok(())
    }

    /// Persist `session` and mark it as the one to resume
    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.checkpoint_path(&session.id);
        let mut buf = serde_json::to_vec_pretty(session)?;
        buf.push(b'\n');
        write_atomic(&path, &buf)?;

        let current = self.root.join(CURRENT_FILE);
        if fs::read_to_string(&current).ok().as_deref().map(str::trim) != Some(session.id.as_str()) {
            write_atomic(&current, session.id.as_bytes())?;
        }

        tracing::trace!(
            session_id = %session.id,
            status = %session.status,
            seq = session.event_seq,
            "checkpoint written"
        );
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Session> {
        let path = self.checkpoint_path(id);
        let data = fs::read(&path).map_err(|e| Error::checkpoint(&path, e))?;
        let session: Session =
            serde_json::from_slice(&data).map_err(|e| Error::checkpoint(&path, e))?;
        if session.version > SESSION_VERSION {
            return Err(Error::checkpoint(
                &path,
                format!(
                    "written by a newer version (schema {}, supported {})",
                    session.version, SESSION_VERSION
                ),
            ));
        }
        Ok(session)
    }

    /// The session named by the `current` pointer, if any
    pub fn load_current(&self) -> Result<Option<Session>> {
        let current = self.root.join(CURRENT_FILE);
        let id = match fs::read_to_string(&current) {
            Ok(id) => id.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::checkpoint(&current, e)),
        };
        if id.is_empty() {
            return Ok(None);
        }
        if !self.checkpoint_path(&id).exists() {
            tracing::warn!(session_id = %id, "current session has no checkpoint, ignoring it");
            self.clear_current()?;
            return Ok(None);
        }
        self.load(&id).map(Some)
    }

    /// Move a finished session out of the way
    pub fn archive(&self, id: &str) -> Result<PathBuf> {
        let from = self.session_dir(id);
        let archive = self.archive_dir();
        fs::create_dir_all(&archive).map_err(|e| Error::checkpoint(&archive, e))?;
        let to = archive.join(id);
        if to.exists() {
            fs::remove_dir_all(&to).map_err(|e| Error::checkpoint(&to, e))?;
        }
        fs::rename(&from, &to).map_err(|e| Error::checkpoint(&from, e))?;

        let current = self.root.join(CURRENT_FILE);
        if fs::read_to_string(&current).ok().as_deref().map(str::trim) == Some(id) {
            self.clear_current()?;
        }
        tracing::info!(session_id = %id, path = %to.display(), "session archived");
        Ok(to)
    }

    /// Load an archived session
    pub fn load_archived(&self, id: &str) -> Result<Session> {
        let path = self.archive_dir().join(id).join(CHECKPOINT_FILE);
        let data = fs::read(&path).map_err(|e| Error::checkpoint(&path, e))?;
        serde_json::from_slice(&data).map_err(|e| Error::checkpoint(&path, e))
    }

    fn clear_current(&self) -> Result<()> {
        let current = self.root.join(CURRENT_FILE);
        match fs::remove_file(&current) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::checkpoint(&current, e)),
        }
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::checkpoint(path, "path has no parent directory"))?;
    fs::create_dir_all(parent).map_err(|e| Error::checkpoint(parent, e))?;

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path).map_err(|e| Error::checkpoint(&tmp_path, e))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .map_err(|e| Error::checkpoint(&tmp_path, e))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| Error::checkpoint(path, e))?;

    // Make the rename itself durable
    #[cfg(unix)]
    if let Err(e) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
        tracing::debug!(path = %parent.display(), error = %e, "could not sync checkpoint directory");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ResolvedPlan;
    use crate::resource::{ResourceMap, ResourceTable};
    use crate::session::state::{ExecutionMode, Outcome, SessionEnvironment, SessionStatus};
    use crate::units::rfc822::Origin;
    use crate::units::JobUnit;
    use std::collections::BTreeMap;

    fn session() -> Session {
        let jobs = ["a", "b"]
            .iter()
            .map(|id| {
                let mut fields = BTreeMap::new();
                fields.insert("id".to_string(), id.to_string());
                fields.insert("plugin".to_string(), "shell".to_string());
                fields.insert("command".to_string(), "true".to_string());
                fields.insert("requires".to_string(), "res.kind == 'x'".to_string());
                JobUnit::from_fields(&fields, Origin::synthetic("test"), Some("ns")).unwrap()
            })
            .collect();
        let mut resources = ResourceMap::new();
        resources.insert(
            "ns::res".into(),
            ResourceTable::parse("ns::res", "kind: x\n").unwrap(),
        );
        let mut environment = SessionEnvironment::default();
        environment.manifest.insert("has_camera".into(), "True".into());
        environment.overrides.insert("WIFI".into(), "lab".into());
        let plan = ResolvedPlan {
            test_plan: "ns::plan".into(),
            jobs,
            resources,
            prerun: Vec::new(),
        };
        Session::new("abc", plan, ExecutionMode::Interactive, environment)
    }

    #[test]
    fn test_round_trip_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let mut s = session();
        s.status = SessionStatus::Running;
        s.cursor = 1;
        s.event_seq = 17;
        s.state_mut("ns::a").unwrap().finish(Outcome::Passed, None);
        s.state_mut("ns::b").unwrap().outcome = Outcome::Running;
        store.save(&s).unwrap();

        let loaded = store.load_current().unwrap().unwrap();
        assert_eq!(loaded, s);
        assert_eq!(loaded.cursor, 1);
        assert_eq!(loaded.environment.manifest["has_camera"], "True");
    }

    #[test]
    fn test_no_current_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load_current().unwrap().is_none());
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let s = session();
        store.save(&s).unwrap();
        store.save(&s).unwrap();
        let names: Vec<_> = fs::read_dir(store.session_dir("abc"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["session.json"]);
    }

    #[test]
    fn test_archive_clears_current() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let s = session();
        store.prepare(&s.id).unwrap();
        store.save(&s).unwrap();

        let archived = store.archive("abc").unwrap();
        assert!(archived.join("session.json").exists());
        assert!(store.load_current().unwrap().is_none());
        assert_eq!(store.load_archived("abc").unwrap().id, "abc");
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut s = session();
        s.version = SESSION_VERSION + 1;
        store.save(&s).unwrap();
        assert!(matches!(store.load("abc"), Err(Error::Checkpoint { .. })));
    }

    #[test]
    fn test_io_log_path_is_slugged() {
        let store = CheckpointStore::new("/var/lib/certrig");
        assert_eq!(
            store.io_log_path("abc", "ns::audio/play back"),
            PathBuf::from("/var/lib/certrig/abc/io-logs/ns__audio_play_back.log")
        );
    }
}
