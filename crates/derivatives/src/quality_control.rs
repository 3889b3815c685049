use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use drivers::{EDDY_QC_REPORT, EddyQcRequest, StripingRequest};
use neuroflow_common::{Role, SessionContext, stage_directory};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{self, CacheStatus};
use crate::covariates::{Covariate, CovariateSource, CovariateValue};
use crate::error::{PipelineError, Result};
use crate::files::FileSet;
use crate::pipeline::Toolbox;
use crate::traits::OutputCache;

pub const DIRECTORY_NAME: &str = "quality_control";
pub const EDDY_QC_DIRECTORY: &str = "eddy_qc";
/// Marks a complete eddy QC directory
pub const SENTINEL: &str = ".complete";

pub const EDDY_QC_KEYS: &[&str] = &[
    "qc_mot_abs",
    "qc_mot_rel",
    "qc_outliers_tot",
    "qc_outliers_b",
    "qc_outliers_pe",
    "qc_cnr_avg",
    "qc_snr_avg",
];
pub const STRIPING_KEY: &str = "striping_score";

pub const REQUIRED_ROLES: &[Role] = &[
    Role::DwiFile,
    Role::BvalFile,
    Role::BvecFile,
    Role::B0BrainMask,
    Role::IndexFile,
    Role::ParamFile,
];

/// Best-effort diffusion quality metrics.
///
/// The eddy QC tool runs once per session, gated by a sentinel file. Its
/// failures never propagate out of [`QualityControlStage::get_covariates`].
pub struct QualityControlStage<'a> {
    ctx: &'a SessionContext,
    files: &'a FileSet,
    tools: &'a Toolbox,
    cache: &'a dyn OutputCache,
    output_dir: PathBuf,
}

impl<'a> QualityControlStage<'a> {
    pub fn new(
        ctx: &'a SessionContext,
        files: &'a FileSet,
        tools: &'a Toolbox,
        cache: &'a dyn OutputCache,
        output_directory: &Path,
    ) -> Result<Self> {
        files.require(REQUIRED_ROLES)?;
        Ok(Self {
            ctx,
            files,
            tools,
            cache,
            output_dir: stage_directory(output_directory, ctx, DIRECTORY_NAME),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn eddy_qc_dir(&self) -> PathBuf {
        self.output_dir.join(EDDY_QC_DIRECTORY)
    }

    pub fn sentinel_path(&self) -> PathBuf {
        self.eddy_qc_dir().join(SENTINEL)
    }

    pub fn report_path(&self) -> PathBuf {
        self.eddy_qc_dir().join(EDDY_QC_REPORT)
    }

    /// Run the eddy QC tool unless the sentinel says its output is complete
    pub fn run_eddy_qc(&self, force: bool) -> Result<CacheStatus> {
        let sentinel = [self.sentinel_path()];
        let status = cache::lookup(self.cache, &sentinel, force, &cache::exists)?;
        if status.is_hit() {
            info!("Eddy QC already complete for {}", self.ctx.file_prefix());
            return Ok(status);
        }

        let dwi = self.files.get(Role::DwiFile)?;
        let inputs = NormalizedInputs::apply(dwi)?;
        let bval = inputs.resolve(self.files.get(Role::BvalFile)?);
        let bvec = inputs.resolve(self.files.get(Role::BvecFile)?);
        let mask = inputs.resolve(self.files.get(Role::B0BrainMask)?);
        let index = inputs.resolve(self.files.get(Role::IndexFile)?);
        let param = inputs.resolve(self.files.get(Role::ParamFile)?);

        self.cache.publish(&[self.eddy_qc_dir()], &mut |staged| {
            Ok(self.tools.eddy_quality.run(&EddyQcRequest {
                base_name: inputs.base_name(),
                bval: &bval,
                bvec: &bvec,
                mask: &mask,
                index: &index,
                param: &param,
                output_dir: &staged[0],
            })?)
        })?;
        drop(inputs);

        self.cache.publish(&sentinel, &mut |staged| {
            fs::write(&staged[0], chrono::Local::now().to_rfc3339())?;
            Ok(())
        })?;
        Ok(status)
    }

    /// Eddy QC metrics plus the striping score. Every key of
    /// [`EDDY_QC_KEYS`] is present; values are null when QC could not be
    /// computed.
    pub fn get_covariates(&self, force: bool) -> Covariate {
        let mut covariate = Covariate::nulls(CovariateSource::QualityControl, EDDY_QC_KEYS);

        match self.run_eddy_qc(force).and_then(|_| read_report(&self.report_path())) {
            Ok(values) => covariate.values.extend(values),
            Err(e) => warn!("Eddy QC unavailable for {}: {}", self.ctx.file_prefix(), e),
        }

        covariate.insert(STRIPING_KEY, self.striping_score().into());
        covariate
    }

    fn striping_score(&self) -> Option<f64> {
        let scorer = self.tools.striping.as_ref()?;
        let request = StripingRequest {
            dwi: self.files.get(Role::DwiFile).ok()?,
            bval: self.files.get(Role::BvalFile).ok()?,
            bvec: self.files.get(Role::BvecFile).ok()?,
            mask: self.files.get(Role::B0BrainMask).ok()?,
        };
        match scorer.score(&request) {
            Ok(score) => Some(score),
            Err(e) => {
                warn!("Striping score unavailable for {}: {}", self.ctx.file_prefix(), e);
                None
            }
        }
    }
}

/// Eddy QC metrics from the report. Missing keys stay absent; arrays are
/// averaged.
pub fn read_report(path: &Path) -> Result<BTreeMap<String, CovariateValue>> {
    let report: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    let Value::Object(fields) = report else {
        return Err(PipelineError::InvalidRecord(format!("{} is not a JSON object", path.display())));
    };
    Ok(EDDY_QC_KEYS
        .iter()
        .filter_map(|key| {
            let value = fields.get(*key)?;
            Some((key.to_string(), summarize(value).into()))
        })
        .collect())
}

fn summarize(value: &Value) -> Option<f64> {
    let mut numbers = Vec::new();
    collect_numbers(value, &mut numbers);
    if numbers.is_empty() {
        return None;
    }
    Some(numbers.iter().sum::<f64>() / numbers.len() as f64)
}

fn collect_numbers(value: &Value, numbers: &mut Vec<f64>) {
    match value {
        Value::Number(n) => numbers.extend(n.as_f64()),
        Value::Array(items) => items.iter().for_each(|item| collect_numbers(item, numbers)),
        _ => {}
    }
}

/// Eddy outputs stored as `data.nii.gz.<ext>` renamed to `data.<ext>` for
/// the QC tool. Dropping the guard renames them back.
struct NormalizedInputs {
    base_name: PathBuf,
    renamed: Vec<(PathBuf, PathBuf)>,
}

impl NormalizedInputs {
    fn apply(dwi: &Path) -> Result<Self> {
        let dir = dwi.parent().unwrap_or(Path::new("."));
        let name = dwi
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = name
            .strip_suffix(".nii.gz")
            .or_else(|| name.strip_suffix(".nii"))
            .unwrap_or(&name)
            .to_string();

        let mut guard = Self {
            base_name: dir.join(&stem),
            renamed: Vec::new(),
        };
        let prefix = format!("{stem}.nii.gz.");
        let candidates: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .collect();
        for original in candidates {
            let Some(rest) = original
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(&prefix))
            else {
                continue;
            };
            let target = dir.join(format!("{stem}.{rest}"));
            if target.exists() {
                continue;
            }
            fs::rename(&original, &target)?;
            debug!("Renamed {} -> {}", original.display(), target.display());
            guard.renamed.push((original, target));
        }
        Ok(guard)
    }

    fn base_name(&self) -> &Path {
        &self.base_name
    }

    /// Current location of `path`
    fn resolve(&self, path: &Path) -> PathBuf {
        self.renamed
            .iter()
            .find(|(original, _)| original == path)
            .map(|(_, renamed)| renamed.clone())
            .unwrap_or_else(|| path.to_path_buf())
    }
}

impl Drop for NormalizedInputs {
    fn drop(&mut self) {
        for (original, renamed) in self.renamed.iter().rev() {
            if let Err(e) = fs::rename(renamed, original) {
                warn!("Could not restore {}: {}", original.display(), e);
            }
        }
    }
}
