use std::path::{Path, PathBuf};

use anyhow::Context;
use appforge_common::{InputMode, TokenUsage};
use async_trait::async_trait;
use tracing::info;
use walkdir::WalkDir;

use super::{Capability, CapabilityEnv, CapabilityResult, ContextUpdate, GenerationContext, require_sandbox};
use crate::errors::CapabilityError;

const NAME: &str = "template";

/// Directories never copied out of a template tree.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "dist"];

/// Copies a named template tree into the sandbox.
pub struct TemplateCapability {
    templates_dir: PathBuf,
}

impl TemplateCapability {
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
        }
    }

    fn source_for(&self, name: &str) -> Result<PathBuf, CapabilityError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let source = self.templates_dir.join(name);
        if !valid || !source.is_dir() {
            return Err(CapabilityError::UnknownTemplate(name.to_string()));
        }
        Ok(source)
    }
}

#[async_trait]
impl Capability for TemplateCapability {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_skip(&self, ctx: &GenerationContext) -> bool {
        ctx.config().input_mode != InputMode::Template
    }

    fn validate_context(&self, ctx: &GenerationContext) -> Result<(), CapabilityError> {
        require_sandbox(NAME, ctx).map(|_| ())
    }

    async fn execute(&self, ctx: &GenerationContext, _env: &CapabilityEnv) -> CapabilityResult {
        let sandbox = match require_sandbox(NAME, ctx) {
            Ok(dir) => dir.to_path_buf(),
            Err(e) => return CapabilityResult::failed(e, TokenUsage::default()),
        };
        let name = ctx.config().template_name().to_string();
        let source = match self.source_for(&name) {
            Ok(source) => source,
            Err(e) => return CapabilityResult::failed(e, TokenUsage::default()),
        };

        let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &sandbox)).await;
        match copied {
            Ok(Ok(count)) => {
                info!(session_id = %ctx.session_id(), template = %name, files = count, "template copied");
                CapabilityResult::ok(TokenUsage::default(), ContextUpdate::default())
            }
            Ok(Err(e)) => CapabilityResult::failed(
                CapabilityError::TemplateCopy(format!("{:#}", e)),
                TokenUsage::default(),
            ),
            Err(e) => CapabilityResult::failed(
                CapabilityError::TemplateCopy(e.to_string()),
                TokenUsage::default(),
            ),
        }
    }
}

/// Copy every file under `source` into `dest`, returning the file count.
/// A failure part-way leaves what was already copied in place.
fn copy_tree(source: &Path, dest: &Path) -> anyhow::Result<usize> {
    std::fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut count = 0;
    let walker = WalkDir::new(source).into_iter().filter_entry(|e| {
        !(e.file_type().is_dir()
            && e.file_name()
                .to_str()
                .is_some_and(|n| SKIPPED_DIRS.contains(&n)))
    });
    for entry in walker {
        let entry = entry.context("Failed to walk template")?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .context("Template entry outside template root")?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", rel.display()))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", rel.display()))?;
            count += 1;
        }
    }
    Ok(count)
}
