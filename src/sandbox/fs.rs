use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::errors::SandboxFsError;

/// Directories never listed back to the model.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "dist", "build", ".vite"];

/// Cap on the number of entries `list_files` returns.
const MAX_LISTED_FILES: usize = 500;

/// File access confined to one session's sandbox directory.
#[derive(Debug, Clone)]
pub struct SandboxFs {
    root: PathBuf,
}

impl SandboxFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a model-supplied relative path to an absolute path inside the
    /// sandbox. Absolute paths, `..` that climbs out of the root, and symlinks
    /// pointing outside the root are rejected.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, SandboxFsError> {
        let trimmed = relative.trim();
        if trimmed.is_empty() {
            return Err(SandboxFsError::Empty);
        }
        let candidate = Path::new(trimmed);
        if candidate.is_absolute() || trimmed.starts_with('\\') {
            return Err(SandboxFsError::Absolute(trimmed.to_string()));
        }

        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxFsError::Escape(trimmed.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SandboxFsError::Absolute(trimmed.to_string()));
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(SandboxFsError::Empty);
        }

        let full = self.root.join(&normalized);
        self.ensure_no_symlink_escape(&full, trimmed)?;
        Ok(full)
    }

    /// Canonicalize the deepest existing ancestor and make sure it is still
    /// under the canonical root.
    fn ensure_no_symlink_escape(&self, full: &Path, original: &str) -> Result<(), SandboxFsError> {
        let Ok(root) = self.root.canonicalize() else {
            return Ok(());
        };
        let mut probe = Some(full);
        while let Some(p) = probe {
            if p.exists() {
                let real = p.canonicalize().map_err(|source| SandboxFsError::Io {
                    path: original.to_string(),
                    source,
                })?;
                if !real.starts_with(&root) {
                    return Err(SandboxFsError::Escape(original.to_string()));
                }
                return Ok(());
            }
            probe = p.parent();
        }
        Ok(())
    }

    /// Sandbox-relative form of a resolved path, with forward slashes.
    pub fn relative(&self, full: &Path) -> String {
        full.strip_prefix(&self.root)
            .unwrap_or(full)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub async fn write_file(&self, relative: &str, content: &str) -> Result<String, SandboxFsError> {
        let full = self.resolve(relative)?;
        let rel = self.relative(&full);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SandboxFsError::Io {
                    path: rel.clone(),
                    source,
                })?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|source| SandboxFsError::Io {
                path: rel.clone(),
                source,
            })?;
        Ok(rel)
    }

    pub async fn read_file(&self, relative: &str) -> Result<String, SandboxFsError> {
        let full = self.resolve(relative)?;
        let rel = self.relative(&full);
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SandboxFsError::NotFound(rel)),
            Err(source) => Err(SandboxFsError::Io { path: rel, source }),
        }
    }

    pub async fn delete_file(&self, relative: &str) -> Result<String, SandboxFsError> {
        let full = self.resolve(relative)?;
        let rel = self.relative(&full);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(rel),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SandboxFsError::NotFound(rel)),
            Err(source) => Err(SandboxFsError::Io { path: rel, source }),
        }
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.resolve(relative).map(|p| p.exists()).unwrap_or(false)
    }

    /// List files under `relative` (or the whole sandbox), skipping dependency
    /// and build directories. Paths are sandbox-relative and sorted.
    pub fn list_files(&self, relative: Option<&str>) -> Result<Vec<String>, SandboxFsError> {
        let start = match relative.map(str::trim) {
            None | Some("") | Some(".") => self.root.clone(),
            Some(rel) => self.resolve(rel)?,
        };
        if !start.exists() {
            return Ok(Vec::new());
        }

        let mut files: Vec<String> = WalkDir::new(&start)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && e.file_name()
                        .to_str()
                        .is_some_and(|n| SKIPPED_DIRS.contains(&n)))
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| self.relative(e.path()))
            .collect();
        files.sort();
        files.truncate(MAX_LISTED_FILES);
        Ok(files)
    }
}
