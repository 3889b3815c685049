use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use neuroflow_common::ensure_directory;
use serde::Serialize;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::traits::{OutputCache, Validity};

/// Whether a stage reused its outputs or computed them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn is_hit(self) -> bool {
        self == Self::Hit
    }
}

/// Default validity predicate: existence alone
pub fn exists(_: &Path) -> bool {
    true
}

/// Lookup step shared by every stage: drop the outputs when forced, then
/// report whether what is on disk can be reused.
pub fn lookup(
    cache: &dyn OutputCache,
    outputs: &[PathBuf],
    force: bool,
    validity: Validity<'_>,
) -> Result<CacheStatus> {
    if force {
        cache.invalidate(outputs)?;
        return Ok(CacheStatus::Miss);
    }
    if cache.has_valid_output(outputs, validity) {
        Ok(CacheStatus::Hit)
    } else {
        Ok(CacheStatus::Miss)
    }
}

/// The filesystem is the cache: an output is cached when its path exists.
///
/// Outputs are staged in a hidden directory next to the first target and
/// renamed into place, so a crash or a failed tool never leaves a partial
/// file at a target path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemCache;

impl OutputCache for FilesystemCache {
    fn has_valid_output(&self, outputs: &[PathBuf], validity: Validity<'_>) -> bool {
        !outputs.is_empty() && outputs.iter().all(|path| path.exists() && validity(path))
    }

    fn invalidate(&self, outputs: &[PathBuf]) -> Result<()> {
        for path in outputs {
            let removed = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            match removed {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn publish(
        &self,
        targets: &[PathBuf],
        produce: &mut dyn FnMut(&[PathBuf]) -> Result<()>,
    ) -> Result<()> {
        let Some(first) = targets.first() else {
            return Ok(());
        };

        let mut names = HashSet::new();
        for target in targets {
            let name = target.file_name().ok_or_else(|| {
                PipelineError::InvalidRecord(format!("output {} has no file name", target.display()))
            })?;
            if !names.insert(name) {
                return Err(PipelineError::InvalidRecord(format!(
                    "outputs published together must have distinct names: {}",
                    target.display()
                )));
            }
        }

        let parent = first.parent().unwrap_or(Path::new("."));
        ensure_directory(parent)?;
        let staging = tempfile::Builder::new().prefix(".staging-").tempdir_in(parent)?;
        let staged: Vec<PathBuf> = targets
            .iter()
            .filter_map(|target| target.file_name())
            .map(|name| staging.path().join(name))
            .collect();

        produce(&staged)?;

        if let Some(missing) = staged.iter().find(|path| !path.exists()) {
            return Err(drivers::ToolError::NotProduced {
                tool: "stage".to_string(),
                path: missing.clone(),
            }
            .into());
        }

        for (staged, target) in staged.iter().zip(targets) {
            if let Some(dir) = target.parent() {
                ensure_directory(dir)?;
            }
            if target.is_dir() {
                fs::remove_dir_all(target)?;
            }
            fs::rename(staged, target)?;
            debug!("Published {}", target.display());
        }
        Ok(())
    }
}
