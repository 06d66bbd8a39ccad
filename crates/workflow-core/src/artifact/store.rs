//! Artifact storage: versioned, opaque named blobs addressed by
//! `(app_name, user_id, session_id, filename, version)`.
//!
//! The filesystem layout follows the donor original's `artifact/layout.rs`
//! directory-builder convention (one deterministic path-builder method per
//! concern) but keyed by the workflow's own addressing tuple rather than a
//! `(run_id, agent_key)` pair.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use super::ArtifactError;

/// Fully qualifies a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
    pub filename: String,
}

impl ArtifactKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            filename: filename.into(),
        }
    }
}

/// Storage for versioned JSON artifacts. The executor never deletes
/// artifacts through this trait; retention is owned by whatever embeds
/// the executor.
pub trait ArtifactService: Send + Sync {
    /// Persist `content` as the next version under `key`, returning the
    /// version number assigned.
    fn save(&self, key: &ArtifactKey, content: &Value) -> Result<u64, ArtifactError>;

    /// Load a specific version, or the latest if `version` is `None`.
    fn load(&self, key: &ArtifactKey, version: Option<u64>) -> Result<Value, ArtifactError>;

    fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<u64>, ArtifactError>;
}

/// Filesystem-backed [`ArtifactService`]. Each artifact version is a JSON
/// sidecar file under `base_dir/app_name/user_id/session_id/filename/{version}.json`,
/// mirroring the donor original's per-run, per-agent subdirectory scheme.
pub struct FsArtifactService {
    base_dir: PathBuf,
    /// In-memory cache of the next version number per key, avoiding a
    /// directory scan on every save. Seeded lazily from disk.
    next_version: Mutex<HashMap<ArtifactKey, u64>>,
}

impl FsArtifactService {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            next_version: Mutex::new(HashMap::new()),
        }
    }

    fn dir_for(&self, key: &ArtifactKey) -> PathBuf {
        self.base_dir
            .join(&key.app_name)
            .join(&key.user_id)
            .join(&key.session_id)
            .join(&key.filename)
    }

    fn version_path(dir: &Path, version: u64) -> PathBuf {
        dir.join(format!("{version}.json"))
    }

    fn existing_versions(dir: &Path) -> Result<Vec<u64>, ArtifactError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(v) = stem.parse::<u64>() {
                    versions.push(v);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

impl ArtifactService for FsArtifactService {
    fn save(&self, key: &ArtifactKey, content: &Value) -> Result<u64, ArtifactError> {
        let dir = self.dir_for(key);
        std::fs::create_dir_all(&dir)?;

        let mut cache = self.next_version.lock().unwrap();
        let version = match cache.get(key) {
            Some(v) => *v,
            None => Self::existing_versions(&dir)?.last().map(|v| v + 1).unwrap_or(0),
        };

        let path = Self::version_path(&dir, version);
        let data = serde_json::to_vec_pretty(content)?;
        std::fs::write(&path, data)?;
        cache.insert(key.clone(), version + 1);
        Ok(version)
    }

    fn load(&self, key: &ArtifactKey, version: Option<u64>) -> Result<Value, ArtifactError> {
        let dir = self.dir_for(key);
        let version = match version {
            Some(v) => v,
            None => Self::existing_versions(&dir)?
                .last()
                .copied()
                .ok_or_else(|| ArtifactError::ManifestNotFound { path: dir.clone() })?,
        };
        let path = Self::version_path(&dir, version);
        let data = std::fs::read(&path).map_err(|_| ArtifactError::RunNotFound { path: path.clone() })?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<u64>, ArtifactError> {
        Self::existing_versions(&self.dir_for(key))
    }
}
