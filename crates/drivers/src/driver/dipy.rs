use std::path::Path;
use std::process::Command;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::driver::{execute_command, Executable};
use crate::sources::{prepare_output, validate_inputs, validate_outputs};
use crate::{Result, TensorFitRequest, TensorFitting};

/// Scalar maps written by the DIPY tensor workflow
pub const DIPY_METRICS: &[&str] = &["fa", "ga", "md", "ad", "rd", "mode"];

/// Tensor estimation method passed to `dipy_fit_dti`
#[derive(
    Debug, Clone, Copy, Default,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, IntoStaticStr,
    PartialEq, Eq
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum FitMethod {
    Ols,
    Wls,
    #[default]
    Nlls,
    Restore,
}

/// DIPY command-line driver for tensor reconstruction
#[derive(Debug, Clone)]
pub struct DipyDriver {
    fit_dti: Executable,
    fit_method: FitMethod,
}

impl DipyDriver {
    pub fn new(bin_dir: Option<&Path>, fit_method: FitMethod) -> Result<Self> {
        Ok(Self {
            fit_dti: Executable::locate("dipy_fit_dti", bin_dir)?,
            fit_method,
        })
    }

    pub fn with_bin_dir(bin_dir: &Path, fit_method: FitMethod) -> Self {
        Self {
            fit_dti: Executable::in_dir(bin_dir, "dipy_fit_dti"),
            fit_method,
        }
    }

    pub fn fit_method(&self) -> FitMethod {
        self.fit_method
    }

    pub fn build_fit_command(&self, request: &TensorFitRequest<'_>) -> Command {
        let mut cmd = self.fit_dti.command();
        cmd.arg(request.dwi)
            .arg(request.bval)
            .arg(request.bvec)
            .arg(request.mask)
            .arg("--fit_method").arg(self.fit_method.to_string())
            .arg("--save_metrics").args(DIPY_METRICS)
            .arg("--out_dir").arg(request.output_dir);
        for metric in DIPY_METRICS {
            cmd.arg(format!("--out_{metric}")).arg(self.output_file_name(metric));
        }
        cmd.arg("--force");
        cmd
    }
}

impl TensorFitting for DipyDriver {
    fn software(&self) -> &str {
        "dipy"
    }

    fn metrics(&self) -> &[&'static str] {
        DIPY_METRICS
    }

    fn fit(&self, request: &TensorFitRequest<'_>) -> Result<()> {
        let tool = self.fit_dti.name();
        validate_inputs(tool, &[request.dwi, request.bval, request.bvec, request.mask])?;
        prepare_output(tool, &request.output_dir.join(self.output_file_name("fa")))?;
        execute_command(tool, self.build_fit_command(request))?;

        let outputs: Vec<_> = DIPY_METRICS
            .iter()
            .map(|metric| request.output_dir.join(self.output_file_name(metric)))
            .collect();
        let outputs: Vec<&Path> = outputs.iter().map(|p| p.as_path()).collect();
        validate_outputs(tool, &outputs)
    }
}
