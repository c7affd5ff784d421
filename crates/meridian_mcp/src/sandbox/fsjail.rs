//! Sandboxed file access for code-API programs.
//!
//! Reads and writes are confined to one root directory. Absolute paths and
//! any traversal component are rejected before touching the filesystem.

use std::path::{Component, Path, PathBuf};

use meridian_protocol::{ToolError, ToolResult};
use uuid::Uuid;

/// A jailed directory.
pub struct FsJail {
    root: PathBuf,
}

impl FsJail {
    /// Create a fresh per-invocation jail under `parent`.
    pub fn create_scratch(parent: &Path) -> ToolResult<Self> {
        let root = parent.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&root)
            .map_err(|e| ToolError::internal(format!("failed to create scratch dir: {e}")))?;
        Ok(Self { root })
    }

    /// Open an existing directory as the jail root.
    pub fn open(root: PathBuf) -> ToolResult<Self> {
        std::fs::create_dir_all(&root)
            .map_err(|e| ToolError::internal(format!("failed to open workspace dir: {e}")))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path inside the jail.
    fn resolve(&self, rel: &str) -> ToolResult<PathBuf> {
        if rel.is_empty() {
            return Err(ToolError::invalid_argument("path is empty"));
        }
        let candidate = Path::new(rel);
        if candidate.is_absolute() {
            return Err(ToolError::permission_denied(format!(
                "absolute paths are not allowed: {rel}"
            )));
        }
        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(ToolError::permission_denied(format!(
                        "path traversal is not allowed: {rel}"
                    )));
                }
            }
        }
        Ok(self.root.join(candidate))
    }

    pub async fn read(&self, rel: &str) -> ToolResult<String> {
        let path = self.resolve(rel)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ToolError::not_found(format!("no such file: {rel}"))
                }
                _ => ToolError::internal(format!("read failed for {rel}: {e}")),
            })
    }

    pub async fn write(&self, rel: &str, contents: &str) -> ToolResult<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::internal(format!("mkdir failed for {rel}: {e}")))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| ToolError::internal(format!("write failed for {rel}: {e}")))
    }

    /// Remove the jail directory and everything in it.
    pub fn cleanup(self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}
