use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::cache::RuleMetadata;
use crate::config::LocalLoaderConfig;

use super::{LoaderError, Result, RuleLoader};

#[derive(Debug, Deserialize)]
struct SidecarMetadata {
    version: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    last_modified: Option<String>,
}

/// One artifact produced by [`LocalLoader::scan_directory`], paired with
/// whatever went wrong reading it, if anything.
#[derive(Debug)]
pub struct ScannedRule {
    /// Forward-slash rule id, relative to the configured root.
    pub id: String,
    /// Raw artifact bytes.
    pub bytes: Vec<u8>,
    /// Resolved metadata (sidecar-overridden, or filesystem-derived).
    pub metadata: RuleMetadata,
}

const RESERVED_WINDOWS_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Reject rule ids that could escape the configured root or that use
/// reserved/invalid path components on any supported platform. Operates
/// purely on the string, so it works before the candidate path is known
/// to exist (unlike `canonicalize`-based containment checks).
fn validate_rule_id(rule_id: &str) -> Result<()> {
    if rule_id.is_empty() || rule_id.starts_with('/') || rule_id.contains('\\') {
        return Err(LoaderError::PathTraversal(rule_id.to_string()));
    }
    // A Windows drive prefix ("C:") smuggled into an id would otherwise
    // resolve to an absolute path once joined with the root.
    if rule_id.len() >= 2 && rule_id.as_bytes()[1] == b':' {
        return Err(LoaderError::PathTraversal(rule_id.to_string()));
    }

    for segment in rule_id.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(LoaderError::PathTraversal(rule_id.to_string()));
        }
        if segment.chars().any(|c| matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*')) {
            return Err(LoaderError::PathTraversal(rule_id.to_string()));
        }
        let base = segment.split('.').next().unwrap_or(segment);
        if RESERVED_WINDOWS_NAMES
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(base))
        {
            return Err(LoaderError::PathTraversal(rule_id.to_string()));
        }
    }

    Ok(())
}

/// Rule source backed by a directory of `<id><extension>` artifact files,
/// each with an optional `<id><metadata_suffix>` sidecar describing
/// version, tags and last-modified time. Mirrors the on-disk contract the
/// teacher's `LocalRegistry` keeps in sync with its in-memory index, minus
/// the write path — this loader is read-only.
pub struct LocalLoader {
    config: LocalLoaderConfig,
}

impl LocalLoader {
    /// Build a loader rooted at the directory in `config`.
    pub fn new(config: LocalLoaderConfig) -> Self {
        Self { config }
    }

    fn relative_path(&self, rule_id: &str) -> PathBuf {
        let mut path = PathBuf::new();
        for segment in rule_id.split('/') {
            path.push(segment);
        }
        path
    }

    fn artifact_path(&self, rule_id: &str) -> Result<PathBuf> {
        validate_rule_id(rule_id)?;
        Ok(Path::new(&self.config.root)
            .join(self.relative_path(rule_id))
            .with_extension(self.config.extension.trim_start_matches('.')))
    }

    fn metadata_path(&self, rule_id: &str) -> PathBuf {
        let mut name = self.relative_path(rule_id).into_os_string();
        name.push(&self.config.metadata_suffix);
        Path::new(&self.config.root).join(name)
    }

    fn read_metadata(&self, rule_id: &str, artifact_path: &Path) -> Result<RuleMetadata> {
        let meta_path = self.metadata_path(rule_id);
        let fallback_last_modified = mtime_millis(artifact_path)?;

        if meta_path.exists() {
            let raw = std::fs::read_to_string(&meta_path)?;
            let sidecar: SidecarMetadata = serde_json::from_str(&raw).map_err(|e| {
                LoaderError::InvalidMetadata {
                    id: rule_id.to_string(),
                    message: e.to_string(),
                }
            })?;
            let last_modified = match sidecar.last_modified {
                Some(text) => chrono::DateTime::parse_from_rfc3339(&text)
                    .map(|dt| dt.timestamp_millis())
                    .map_err(|e| LoaderError::InvalidMetadata {
                        id: rule_id.to_string(),
                        message: format!("invalid lastModified: {e}"),
                    })?,
                None => fallback_last_modified,
            };
            Ok(RuleMetadata {
                id: rule_id.to_string(),
                version: sidecar.version.unwrap_or_else(|| fallback_last_modified.to_string()),
                tags: sidecar.tags.into_iter().collect(),
                last_modified,
            })
        } else {
            Ok(RuleMetadata {
                id: rule_id.to_string(),
                version: fallback_last_modified.to_string(),
                tags: HashSet::new(),
                last_modified: fallback_last_modified,
            })
        }
    }

    fn walk(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy().into_owned();

            if path.is_dir() {
                if self.config.recursive {
                    let child_prefix = if prefix.is_empty() {
                        name
                    } else {
                        format!("{prefix}/{name}")
                    };
                    self.walk(&path, &child_prefix, out)?;
                }
                continue;
            }

            if let Some(id) = self.id_for_file(&name, prefix) {
                out.push(id);
            }
        }
        Ok(())
    }

    fn id_for_file(&self, file_name: &str, prefix: &str) -> Option<String> {
        if file_name.ends_with(&self.config.metadata_suffix)
            && self.config.metadata_suffix != self.config.extension
        {
            return None;
        }
        let stem = file_name.strip_suffix(&self.config.extension)?;
        Some(if prefix.is_empty() {
            stem.to_string()
        } else {
            format!("{prefix}/{stem}")
        })
    }

    /// Recursively (when `recursive` is set) or top-level walk the root
    /// directory, reading every artifact found. A file that fails to
    /// parse or fails structural validation is skipped and its error
    /// recorded rather than aborting the scan; the scan only fails if
    /// *no* valid rule was found and at least one error occurred.
    #[instrument(skip(self), fields(component = "local_loader"))]
    pub async fn scan_directory(&self) -> Result<Vec<ScannedRule>> {
        let mut ids = Vec::new();
        self.walk(Path::new(&self.config.root), "", &mut ids)?;

        let mut rules = Vec::with_capacity(ids.len());
        let mut errors = Vec::new();

        for id in ids {
            match self.load(&id).await {
                Ok((bytes, metadata)) => rules.push(ScannedRule { id, bytes, metadata }),
                Err(err) => {
                    warn!(rule_id = %id, error = %err, "skipping invalid rule artifact during scan");
                    errors.push((id, err));
                }
            }
        }

        if rules.is_empty() {
            if let Some((id, err)) = errors.into_iter().next() {
                return Err(LoaderError::InvalidMetadata {
                    id,
                    message: err.to_string(),
                });
            }
        }

        Ok(rules)
    }
}

fn mtime_millis(path: &Path) -> Result<i64> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified()?;
    let millis = modified
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    Ok(millis)
}

fn validate_is_json(rule_id: &str, bytes: &[u8]) -> Result<()> {
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(serde_json::Value::Object(obj)) if !obj.is_empty() => Ok(()),
        Ok(serde_json::Value::Array(arr)) if !arr.is_empty() => Ok(()),
        Ok(_) => Err(LoaderError::InvalidMetadata {
            id: rule_id.to_string(),
            message: "artifact must be a non-empty JSON object or array".to_string(),
        }),
        Err(e) => Err(LoaderError::InvalidMetadata {
            id: rule_id.to_string(),
            message: e.to_string(),
        }),
    }
}

#[async_trait]
impl RuleLoader for LocalLoader {
    #[instrument(skip(self), fields(component = "local_loader", rule_id))]
    async fn load(&self, rule_id: &str) -> Result<(Vec<u8>, RuleMetadata)> {
        let path = self.artifact_path(rule_id)?;
        let bytes = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LoaderError::NotFound(rule_id.to_string())
            } else {
                LoaderError::Io(e)
            }
        })?;
        validate_is_json(rule_id, &bytes)?;
        let metadata = self.read_metadata(rule_id, &path)?;
        Ok((bytes, metadata))
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        self.walk(Path::new(&self.config.root), "", &mut ids)?;
        ids.sort();
        Ok(ids)
    }
}
