//! Streaming output bundle with checkpoints.
//!
//! Artifacts and evidence are written one file at a time into a staging
//! area while a run progresses, so a crash loses at most the unit being
//! written. Layout under the output root:
//!
//! ```text
//! .staging/<run_id>/artifacts/<id>.json
//! .staging/<run_id>/evidence/<id>.txt
//! .staging/<run_id>/checkpoint.json
//! ```
//!
//! [`StreamingBundle::finalize`] folds the artifacts into
//! `<run_id>/bundle.json`, copies the evidence to `<run_id>/evidence/`,
//! adds `<run_id>/AUDIT.md` if missing and removes the staging area.

mod atomic;

pub use atomic::write_atomic;

use chrono::{DateTime, Utc};
use scriptorium_core::Checkpoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub const STAGING_DIR: &str = ".staging";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const BUNDLE_FILE: &str = "bundle.json";
pub const AUDIT_FILE: &str = "AUDIT.md";

const ARTIFACTS_DIR: &str = "artifacts";
const EVIDENCE_DIR: &str = "evidence";

/// Errors from bundle I/O.
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Bundle I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Bundle JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid id '{0}': ids must be non-empty and free of path separators")]
    InvalidId(String),

    #[error("No artifact '{0}' in bundle")]
    MissingArtifact(String),

    #[error("Run '{0}' is already finalized")]
    Finalized(String),
}

/// What [`StreamingBundle::finalize`] produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSummary {
    /// Final run directory
    pub path: PathBuf,
    pub artifact_count: usize,
    pub evidence_count: usize,
}

/// Aggregate document written to `bundle.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleDocument {
    pub run_id: String,
    pub finalized_at: DateTime<Utc>,
    pub artifacts: BTreeMap<String, Value>,
    pub evidence_count: usize,
}

/// Incrementally persisted outputs of one run.
///
/// Opening a bundle for a run id that already has a staging area picks up
/// where it left off.
#[derive(Debug, Clone)]
pub struct StreamingBundle {
    root: PathBuf,
    run_id: String,
}

impl StreamingBundle {
    pub fn new(root: impl Into<PathBuf>, run_id: impl Into<String>) -> Result<Self, BundleError> {
        let run_id = run_id.into();
        validate_id(&run_id)?;
        Ok(Self {
            root: root.into(),
            run_id,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// In-progress area for this run.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR).join(&self.run_id)
    }

    /// Permanent location after finalize.
    pub fn output_dir(&self) -> PathBuf {
        self.root.join(&self.run_id)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.staging_dir().join(CHECKPOINT_FILE)
    }

    pub fn is_finalized(&self) -> bool {
        self.output_dir().join(BUNDLE_FILE).is_file()
    }

    fn artifact_path(&self, id: &str) -> PathBuf {
        self.staging_dir()
            .join(ARTIFACTS_DIR)
            .join(format!("{id}.json"))
    }

    /// Persist one artifact as pretty JSON.
    #[instrument(level = "debug", skip(self, data), fields(run_id = %self.run_id))]
    pub fn write_artifact(&self, id: &str, data: &Value) -> Result<PathBuf, BundleError> {
        validate_id(id)?;
        let path = self.artifact_path(id);
        write_atomic(&path, &serde_json::to_vec_pretty(data)?)?;
        debug!(path = %path.display(), "Artifact written");
        Ok(path)
    }

    /// Persist one evidence chunk as plain text.
    #[instrument(level = "debug", skip(self, content), fields(run_id = %self.run_id))]
    pub fn write_evidence(&self, id: &str, content: &str) -> Result<PathBuf, BundleError> {
        validate_id(id)?;
        let path = self
            .staging_dir()
            .join(EVIDENCE_DIR)
            .join(format!("{id}.txt"));
        write_atomic(&path, content.as_bytes())?;
        debug!(path = %path.display(), bytes = content.len(), "Evidence written");
        Ok(path)
    }

    /// Read a staged artifact back.
    pub fn read_artifact(&self, id: &str) -> Result<Value, BundleError> {
        validate_id(id)?;
        match fs::read(self.artifact_path(id)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BundleError::MissingArtifact(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of all staged artifacts, sorted.
    pub fn artifact_ids(&self) -> Result<Vec<String>, BundleError> {
        let dir = self.staging_dir().join(ARTIFACTS_DIR);
        let mut ids = Vec::new();
        for path in list_files(&dir)? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Atomically record run progress.
    #[instrument(
        level = "debug",
        skip(self, completed, pending, results),
        fields(run_id = %self.run_id, completed = completed.len(), pending = pending.len())
    )]
    pub fn save_checkpoint(
        &self,
        completed: Vec<String>,
        pending: Vec<String>,
        results: BTreeMap<String, String>,
        manifest_hash: &str,
    ) -> Result<Checkpoint, BundleError> {
        let checkpoint = Checkpoint::new(&self.run_id, completed, pending, results, manifest_hash);
        write_atomic(&self.checkpoint_path(), &serde_json::to_vec_pretty(&checkpoint)?)?;
        debug!(checkpoint_id = %checkpoint.checkpoint_id, "Checkpoint saved");
        Ok(checkpoint)
    }

    /// The last saved checkpoint, if any.
    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>, BundleError> {
        match fs::read(self.checkpoint_path()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// True only if a checkpoint exists and was taken under `manifest_hash`.
    pub fn can_resume(&self, manifest_hash: &str) -> bool {
        match self.load_checkpoint() {
            Ok(Some(checkpoint)) => checkpoint.matches(manifest_hash),
            Ok(None) => false,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Unreadable checkpoint, cannot resume");
                false
            }
        }
    }

    /// Publish the staged outputs and remove the staging area.
    #[instrument(level = "info", skip(self), fields(run_id = %self.run_id))]
    pub fn finalize(&self) -> Result<BundleSummary, BundleError> {
        if self.is_finalized() {
            return Err(BundleError::Finalized(self.run_id.clone()));
        }

        let mut artifacts = BTreeMap::new();
        for id in self.artifact_ids()? {
            let value = self.read_artifact(&id)?;
            artifacts.insert(id, value);
        }

        let output = self.output_dir();
        let evidence_src = self.staging_dir().join(EVIDENCE_DIR);
        let evidence_dst = output.join(EVIDENCE_DIR);
        let evidence_count = if evidence_src.is_dir() {
            atomic::copy_dir(&evidence_src, &evidence_dst)?
        } else {
            fs::create_dir_all(&evidence_dst)?;
            0
        };

        let document = BundleDocument {
            run_id: self.run_id.clone(),
            finalized_at: Utc::now(),
            artifacts,
            evidence_count,
        };
        let artifact_count = document.artifacts.len();
        write_atomic(&output.join(BUNDLE_FILE), &serde_json::to_vec_pretty(&document)?)?;

        let audit = output.join(AUDIT_FILE);
        if !audit.exists() {
            write_atomic(&audit, audit_placeholder(&self.run_id).as_bytes())?;
        }

        self.cleanup()?;
        info!(artifact_count, evidence_count, path = %output.display(), "Bundle finalized");

        Ok(BundleSummary {
            path: output,
            artifact_count,
            evidence_count,
        })
    }

    /// Discard the staging area without publishing anything.
    pub fn cleanup(&self) -> Result<(), BundleError> {
        let staging = self.staging_dir();
        match fs::remove_dir_all(&staging) {
            Ok(()) => debug!(path = %staging.display(), "Staging area removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Drop `.staging` itself once no run uses it; fails harmlessly otherwise.
        let _ = fs::remove_dir(self.root.join(STAGING_DIR));
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<(), BundleError> {
    let invalid = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(BundleError::InvalidId(id.to_string()));
    }
    Ok(())
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, BundleError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

fn audit_placeholder(run_id: &str) -> String {
    format!(
        "# Audit: {run_id}\n\n\
         Automated output. Review the artifacts in `bundle.json` and the\n\
         source excerpts in `evidence/` before relying on them.\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(dir: &tempfile::TempDir) -> StreamingBundle {
        StreamingBundle::new(dir.path(), "run-1").unwrap()
    }

    #[test]
    fn test_artifacts_round_trip_through_staging() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(&dir);

        let path = bundle.write_artifact("summary", &json!({"n": 1})).unwrap();
        assert!(path.starts_with(dir.path().join(".staging/run-1/artifacts")));

        bundle.write_artifact("summary", &json!({"n": 2})).unwrap();
        bundle.write_artifact("claims", &json!([1, 2])).unwrap();

        assert_eq!(bundle.read_artifact("summary").unwrap(), json!({"n": 2}));
        assert_eq!(bundle.artifact_ids().unwrap(), vec!["claims", "summary"]);
        assert!(matches!(
            bundle.read_artifact("missing"),
            Err(BundleError::MissingArtifact(_))
        ));
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(&dir);

        for id in ["", "..", "a/b", "a\\b"] {
            assert!(
                matches!(bundle.write_artifact(id, &json!(1)), Err(BundleError::InvalidId(_))),
                "accepted {id:?}"
            );
        }
        assert!(StreamingBundle::new(dir.path(), "../escape").is_err());
    }

    #[test]
    fn test_checkpoint_resume_requires_exact_hash() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(&dir);

        assert!(bundle.load_checkpoint().unwrap().is_none());
        assert!(!bundle.can_resume("abc"));

        let results = BTreeMap::from([("a".to_string(), "1".to_string())]);
        bundle
            .save_checkpoint(vec!["a".into()], vec!["b".into()], results, "abc")
            .unwrap();

        let loaded = bundle.load_checkpoint().unwrap().unwrap();
        assert_eq!(loaded.completed, vec!["a"]);
        assert_eq!(loaded.pending, vec!["b"]);
        assert!(bundle.can_resume("abc"));
        assert!(!bundle.can_resume("abd"));
        assert!(!bundle.can_resume("ABC"));
    }

    #[test]
    fn test_reopened_bundle_sees_existing_staging() {
        let dir = tempfile::tempdir().unwrap();
        bundle(&dir).write_artifact("a", &json!(1)).unwrap();
        bundle(&dir)
            .save_checkpoint(vec!["a".into()], vec![], BTreeMap::new(), "h")
            .unwrap();

        let reopened = bundle(&dir);
        assert_eq!(reopened.artifact_ids().unwrap(), vec!["a"]);
        assert!(reopened.can_resume("h"));
    }

    #[test]
    fn test_corrupt_checkpoint_is_not_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(&dir);
        write_atomic(&bundle.checkpoint_path(), b"{not json").unwrap();

        assert!(matches!(bundle.load_checkpoint(), Err(BundleError::Json(_))));
        assert!(!bundle.can_resume("h"));
    }

    #[test]
    fn test_finalize_publishes_and_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(&dir);
        bundle.write_artifact("a", &json!(1)).unwrap();
        bundle.write_artifact("b", &json!({"k": "v"})).unwrap();
        bundle.write_artifact("a", &json!(3)).unwrap();
        bundle.write_evidence("e1", "quoted passage").unwrap();
        bundle
            .save_checkpoint(vec![], vec![], BTreeMap::new(), "h")
            .unwrap();

        let summary = bundle.finalize().unwrap();

        assert_eq!(summary.artifact_count, 2);
        assert_eq!(summary.evidence_count, 1);
        assert_eq!(summary.path, dir.path().join("run-1"));
        assert!(!bundle.staging_dir().exists());
        assert!(!dir.path().join(STAGING_DIR).exists());

        let document: BundleDocument =
            serde_json::from_slice(&fs::read(summary.path.join(BUNDLE_FILE)).unwrap()).unwrap();
        assert_eq!(document.artifacts["a"], json!(3));
        assert_eq!(document.evidence_count, 1);
        assert_eq!(
            fs::read_to_string(summary.path.join("evidence/e1.txt")).unwrap(),
            "quoted passage"
        );
        assert!(summary.path.join(AUDIT_FILE).is_file());

        assert!(matches!(bundle.finalize(), Err(BundleError::Finalized(_))));
    }

    #[test]
    fn test_finalize_keeps_existing_audit() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(&dir);
        bundle.write_artifact("a", &json!(1)).unwrap();
        write_atomic(&bundle.output_dir().join(AUDIT_FILE), b"reviewed").unwrap();

        bundle.finalize().unwrap();

        assert_eq!(
            fs::read_to_string(bundle.output_dir().join(AUDIT_FILE)).unwrap(),
            "reviewed"
        );
    }

    #[test]
    fn test_cleanup_discards_staging_only() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(&dir);
        bundle.write_artifact("a", &json!(1)).unwrap();
        let other = StreamingBundle::new(dir.path(), "run-2").unwrap();
        other.write_artifact("x", &json!(1)).unwrap();

        bundle.cleanup().unwrap();
        bundle.cleanup().unwrap();

        assert!(!bundle.staging_dir().exists());
        assert!(!bundle.output_dir().exists());
        assert_eq!(other.artifact_ids().unwrap(), vec!["x"]);
    }
}
