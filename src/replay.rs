//! Golden-event replay harness: deterministic contract tests driven by a
//! fixture directory of valid and deliberately dirty envelopes.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::schema_registry::SchemaRegistry;
use crate::store::EventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPolicy {
    SkipInvalid,
    FailOnInvalid,
    IncludeInvalid,
}

impl ReplayPolicy {
    pub fn from_config_str(s: &str) -> Option<Self> {
        match s {
            "skip_invalid" => Some(Self::SkipInvalid),
            "fail_on_invalid" => Some(Self::FailOnInvalid),
            "include_invalid" => Some(Self::IncludeInvalid),
            _ => None,
        }
    }
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self::SkipInvalid
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read fixture directory {0}: {1}")]
    DirectoryRead(PathBuf, std::io::Error),
    #[error("fixture {0} is not valid JSON: {1}")]
    MalformedFixture(PathBuf, serde_json::Error),
    #[error("fixture {0} is missing its test-only 'expected' field")]
    MissingExpectedField(PathBuf),
    #[error("fixture {0} declares expected='{1}', must be 'valid' or 'invalid'")]
    BadExpectedValue(PathBuf, String),
    #[error("aborting on invalid fixture {0} under fail_on_invalid policy")]
    AbortedOnInvalid(PathBuf),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] crate::store::StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub published: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Enumerates fixture files in `dir`, sorted by file name, for stable,
/// reproducible replay ordering across runs.
fn list_fixtures(dir: &Path) -> Result<Vec<PathBuf>, ReplayError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ReplayError::DirectoryRead(dir.to_path_buf(), e))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();
    Ok(paths)
}

fn classify(registry: &SchemaRegistry, value: &Value) -> &'static str {
    match registry.validate(value) {
        Ok(()) => "valid",
        Err(_) => "invalid",
    }
}

/// Runs the harness against one fixture directory. `registry` provides the
/// same validation path a production producer uses; `store` receives
/// publishable fixtures according to `policy`.
pub async fn run_replay(
    registry: &SchemaRegistry,
    store: &dyn EventStore,
    fixture_dir: &Path,
    policy: ReplayPolicy,
) -> Result<ReplaySummary, ReplayError> {
    let mut summary = ReplaySummary::default();

    for path in list_fixtures(fixture_dir)? {
        let raw = std::fs::read_to_string(&path).map_err(|e| ReplayError::DirectoryRead(path.clone(), e))?;
        let mut value: Value = serde_json::from_str(&raw).map_err(|e| ReplayError::MalformedFixture(path.clone(), e))?;

        let expected = value
            .as_object()
            .and_then(|obj| obj.get("expected"))
            .and_then(Value::as_str)
            .ok_or_else(|| ReplayError::MissingExpectedField(path.clone()))?
            .to_string();
        if expected != "valid" && expected != "invalid" {
            return Err(ReplayError::BadExpectedValue(path, expected));
        }
        if let Some(obj) = value.as_object_mut() {
            obj.remove("expected");
        }

        summary.total += 1;
        let actual = classify(registry, &value);
        if actual == "valid" {
            summary.valid += 1;
        } else {
            summary.invalid += 1;
        }
        if actual != expected {
            summary.failed += 1;
            warn!(fixture = %path.display(), expected, actual, "classification mismatch");
        }

        if actual == "invalid" && policy == ReplayPolicy::FailOnInvalid {
            return Err(ReplayError::AbortedOnInvalid(path));
        }

        let should_publish = actual == "valid" || policy == ReplayPolicy::IncludeInvalid;
        if !should_publish {
            summary.skipped += 1;
            continue;
        }

        let Some(stream) = value.as_object().and_then(|obj| obj.get("schema")).and_then(Value::as_str) else {
            warn!(fixture = %path.display(), "no 'schema' field, cannot derive a target stream, skipping publish");
            summary.skipped += 1;
            continue;
        };
        let bytes = serde_json::to_vec(&value).expect("fixture value always serializes");
        store.append(stream, bytes).await?;
        summary.published += 1;
    }

    info!(
        total = summary.total,
        valid = summary.valid,
        invalid = summary.invalid,
        published = summary.published,
        skipped = summary.skipped,
        failed = summary.failed,
        "replay complete"
    );
    Ok(summary)
}
