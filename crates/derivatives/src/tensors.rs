use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use drivers::{ShellExtractionRequest, TensorFitRequest};
use neuroflow_common::layout::{shell_crop_stem, tensor_metric_path};
use neuroflow_common::{Role, SessionContext, Shell, ShellSelector, stage_directory};
use serde::Serialize;
use tracing::info;

use crate::cache::{self, CacheStatus};
use crate::error::Result;
use crate::files::FileSet;
use crate::pipeline::Toolbox;
use crate::traits::OutputCache;

pub const DIRECTORY_NAME: &str = "tensors";

pub const REQUIRED_ROLES: &[Role] = &[Role::DwiFile, Role::BvalFile, Role::BvecFile, Role::B0BrainMask];

/// Diffusion series reduced to the selected shell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellFiles {
    pub dwi: PathBuf,
    pub bval: PathBuf,
    pub bvec: PathBuf,
    pub status: CacheStatus,
}

/// Scalar maps of one tensor fit, keyed by metric name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorMaps {
    pub software: String,
    pub max_bvalue: u32,
    pub metrics: BTreeMap<String, PathBuf>,
    pub status: CacheStatus,
}

impl TensorMaps {
    pub fn get(&self, metric: &str) -> Option<&Path> {
        self.metrics.get(metric).map(PathBuf::as_path)
    }
}

/// Shell cropping followed by tensor fitting. Both sub-steps are cached
/// independently; file names embed the software and the shell maximum.
pub struct TensorReconstructionStage<'a> {
    ctx: &'a SessionContext,
    files: &'a FileSet,
    shell: Shell,
    tools: &'a Toolbox,
    cache: &'a dyn OutputCache,
    output_dir: PathBuf,
}

impl<'a> TensorReconstructionStage<'a> {
    /// Selects the shell from the session's bval file
    pub fn new(
        ctx: &'a SessionContext,
        files: &'a FileSet,
        selector: ShellSelector,
        tools: &'a Toolbox,
        cache: &'a dyn OutputCache,
        output_directory: &Path,
    ) -> Result<Self> {
        files.require(REQUIRED_ROLES)?;
        let shell = selector.select_from_file(files.get(Role::BvalFile)?)?;
        info!("Selected shell {{{}}} for {}", shell, ctx.file_prefix());
        Ok(Self {
            ctx,
            files,
            shell,
            tools,
            cache,
            output_dir: stage_directory(output_directory, ctx, DIRECTORY_NAME),
        })
    }

    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    /// Representative maximum used in file names
    pub fn max_bvalue(&self) -> u32 {
        self.shell.max()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `[dwi, bval, bvec]` of the cropped series
    pub fn crop_outputs(&self) -> [PathBuf; 3] {
        let stem = shell_crop_stem(self.ctx, self.max_bvalue());
        ["nii.gz", "bval", "bvec"].map(|ext| self.output_dir.join(format!("{stem}.{ext}")))
    }

    pub fn metric_outputs(&self) -> BTreeMap<String, PathBuf> {
        let fitting = &self.tools.tensor_fitting;
        fitting
            .metrics()
            .iter()
            .map(|metric| {
                let relative = tensor_metric_path(self.ctx, fitting.software(), self.max_bvalue(), metric);
                (metric.to_string(), self.output_dir.join(relative))
            })
            .collect()
    }

    pub fn crop_to_shell(&self, force: bool) -> Result<ShellFiles> {
        let outputs = self.crop_outputs();
        let status = cache::lookup(self.cache, &outputs, force, &cache::exists)?;

        if status.is_hit() {
            info!("Shell {} already extracted for {}", self.max_bvalue(), self.ctx.file_prefix());
        } else {
            let dwi = self.files.get(Role::DwiFile)?;
            let bval = self.files.get(Role::BvalFile)?;
            let bvec = self.files.get(Role::BvecFile)?;
            self.cache.publish(&outputs, &mut |staged| {
                Ok(self.tools.shell_extraction.extract_shell(&ShellExtractionRequest {
                    dwi,
                    bval,
                    bvec,
                    shell: &self.shell,
                    out_dwi: &staged[0],
                    out_bval: &staged[1],
                    out_bvec: &staged[2],
                })?)
            })?;
        }

        let [dwi, bval, bvec] = outputs;
        Ok(ShellFiles { dwi, bval, bvec, status })
    }

    /// Crop, then fit. The fit is skipped when every metric map exists.
    pub fn run(&self, force: bool) -> Result<TensorMaps> {
        let cropped = self.crop_to_shell(force)?;
        let fitting = &self.tools.tensor_fitting;
        let metrics = self.metric_outputs();
        let outputs: Vec<PathBuf> = metrics.values().cloned().collect();

        let status = cache::lookup(self.cache, &outputs, force, &cache::exists)?;
        if status.is_hit() {
            info!("Tensor maps ({}) already computed for {}", fitting.software(), self.ctx.file_prefix());
        } else {
            let mask = self.files.get(Role::B0BrainMask)?;
            let names: Vec<&str> = metrics.keys().map(String::as_str).collect();
            self.cache.publish(&outputs, &mut |staged| {
                let Some(staging_dir) = staged.first().and_then(|path| path.parent()) else {
                    return Ok(());
                };
                fitting.fit(&TensorFitRequest {
                    dwi: &cropped.dwi,
                    bval: &cropped.bval,
                    bvec: &cropped.bvec,
                    mask,
                    output_dir: staging_dir,
                })?;
                for (metric, target) in names.iter().zip(staged) {
                    let produced = staging_dir.join(fitting.output_file_name(metric));
                    if produced.exists() {
                        fs::rename(&produced, target)?;
                    }
                }
                Ok(())
            })?;
        }

        Ok(TensorMaps {
            software: fitting.software().to_string(),
            max_bvalue: self.max_bvalue(),
            metrics,
            status,
        })
    }
}
