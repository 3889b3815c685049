use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use neuroflow_common::Measure;

use crate::driver::{execute_command, Executable};
use crate::sources::{prepare_output, validate_inputs, validate_outputs};
use crate::{
    AffineRequest, EddyQcRequest, EddyQuality, OverlayRenderer, Registration, RegionStatistics,
    Result, ToolError, WarpRequest, EDDY_QC_REPORT,
};

/// FSL command-line driver: registration, region statistics, overlays and eddy QC
#[derive(Debug, Clone)]
pub struct FslDriver {
    applywarp: Executable,
    flirt: Executable,
    fslstats: Executable,
    slicer: Executable,
    eddy_quad: Executable,
}

impl FslDriver {
    /// Use `fsl_dir/bin`, falling back to `$FSLDIR/bin` and then `PATH`
    pub fn new(fsl_dir: Option<&Path>) -> Result<Self> {
        let bin_dir: Option<PathBuf> = fsl_dir
            .map(Path::to_path_buf)
            .or_else(|| env::var_os("FSLDIR").map(PathBuf::from))
            .map(|dir| dir.join("bin"));
        let bin_dir = bin_dir.as_deref();

        Ok(Self {
            applywarp: Executable::locate("applywarp", bin_dir)?,
            flirt: Executable::locate("flirt", bin_dir)?,
            fslstats: Executable::locate("fslstats", bin_dir)?,
            slicer: Executable::locate("slicer", bin_dir)?,
            eddy_quad: Executable::locate("eddy_quad", bin_dir)?,
        })
    }

    /// Programs in `bin_dir`, unchecked
    pub fn with_bin_dir(bin_dir: &Path) -> Self {
        Self {
            applywarp: Executable::in_dir(bin_dir, "applywarp"),
            flirt: Executable::in_dir(bin_dir, "flirt"),
            fslstats: Executable::in_dir(bin_dir, "fslstats"),
            slicer: Executable::in_dir(bin_dir, "slicer"),
            eddy_quad: Executable::in_dir(bin_dir, "eddy_quad"),
        }
    }

    fn fsl_command(&self, executable: &Executable) -> Command {
        let mut cmd = executable.command();
        cmd.env("FSLOUTPUTTYPE", "NIFTI_GZ");
        cmd
    }

    pub fn build_warp_command(&self, request: &WarpRequest<'_>) -> Command {
        let mut cmd = self.fsl_command(&self.applywarp);
        cmd.arg(format!("--in={}", request.input.display()))
            .arg(format!("--ref={}", request.reference.display()))
            .arg(format!("--out={}", request.output.display()))
            .arg(format!("--warp={}", request.warp_field.display()))
            .arg(format!("--mask={}", request.mask.display()))
            .args(["--interp=nn", "--datatype=int"]);
        cmd
    }

    pub fn build_affine_command(&self, request: &AffineRequest<'_>) -> Command {
        let mut cmd = self.fsl_command(&self.flirt);
        cmd.arg("-in").arg(request.input)
            .arg("-ref").arg(request.reference)
            .arg("-out").arg(request.output)
            .arg("-applyxfm")
            .arg("-init").arg(request.matrix)
            .args(["-interp", "nearestneighbour", "-datatype", "int"]);
        cmd
    }

    pub fn build_stats_command(&self, metric_image: &Path, label_image: &Path, measure: Measure) -> Command {
        let mut cmd = self.fsl_command(&self.fslstats);
        cmd.arg("-K").arg(label_image).arg(metric_image);
        match measure {
            Measure::Mean => cmd.arg("-m"),
            Measure::Median => cmd.args(["-p", "50"]),
            Measure::Std => cmd.arg("-s"),
            Measure::Min | Measure::Max => cmd.arg("-R"),
        };
        cmd
    }

    pub fn build_overlay_command(&self, overlay: &Path, background: &Path, output: &Path) -> Command {
        let mut cmd = self.fsl_command(&self.slicer);
        cmd.arg(background).arg(overlay).arg("-a").arg(output);
        cmd
    }

    pub fn build_eddy_qc_command(&self, request: &EddyQcRequest<'_>) -> Command {
        let mut cmd = self.fsl_command(&self.eddy_quad);
        cmd.arg(request.base_name)
            .arg("-idx").arg(request.index)
            .arg("-par").arg(request.param)
            .arg("-m").arg(request.mask)
            .arg("-b").arg(request.bval)
            .arg("-g").arg(request.bvec)
            .arg("-o").arg(request.output_dir);
        cmd
    }
}

/// One line per label (`label - 1` is the line index). Lines that do not
/// parse, e.g. for labels without voxels, become `NaN`.
pub fn parse_label_stats(stdout: &str, measure: Measure) -> Result<Vec<f64>> {
    let column = match measure {
        Measure::Max => 1,
        _ => 0,
    };
    let values: Vec<f64> = stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.split_whitespace()
                .nth(column)
                .and_then(|token| token.parse::<f64>().ok())
                .unwrap_or(f64::NAN)
        })
        .collect();

    if values.is_empty() {
        return Err(ToolError::Parse {
            tool: "fslstats".to_string(),
            message: "no per-label output".to_string(),
        });
    }
    Ok(values)
}

impl Registration for FslDriver {
    fn apply_warp(&self, request: &WarpRequest<'_>) -> Result<()> {
        let tool = self.applywarp.name();
        validate_inputs(tool, &[request.input, request.reference, request.mask, request.warp_field])?;
        prepare_output(tool, request.output)?;
        execute_command(tool, self.build_warp_command(request))?;
        validate_outputs(tool, &[request.output])
    }

    fn apply_affine(&self, request: &AffineRequest<'_>) -> Result<()> {
        let tool = self.flirt.name();
        validate_inputs(tool, &[request.input, request.reference, request.matrix])?;
        prepare_output(tool, request.output)?;
        execute_command(tool, self.build_affine_command(request))?;
        validate_outputs(tool, &[request.output])
    }
}

impl RegionStatistics for FslDriver {
    fn region_values(&self, metric_image: &Path, label_image: &Path, measure: Measure) -> Result<Vec<f64>> {
        let tool = self.fslstats.name();
        validate_inputs(tool, &[metric_image, label_image])?;
        let output = execute_command(tool, self.build_stats_command(metric_image, label_image, measure))?;
        parse_label_stats(&String::from_utf8_lossy(&output.stdout), measure)
    }
}

impl OverlayRenderer for FslDriver {
    fn render_overlay(&self, overlay: &Path, background: &Path, title: &str, output: &Path) -> Result<()> {
        let tool = self.slicer.name();
        validate_inputs(tool, &[overlay, background])?;
        prepare_output(tool, output)?;
        tracing::debug!("Rendering '{}' to {}", title, output.display());
        execute_command(tool, self.build_overlay_command(overlay, background, output))?;
        validate_outputs(tool, &[output])
    }
}

impl EddyQuality for FslDriver {
    fn run(&self, request: &EddyQcRequest<'_>) -> Result<()> {
        let tool = self.eddy_quad.name();
        validate_inputs(tool, &[request.bval, request.bvec, request.mask, request.index, request.param])?;
        prepare_output(tool, request.output_dir)?;
        execute_command(tool, self.build_eddy_qc_command(request))?;
        validate_outputs(tool, &[&request.output_dir.join(EDDY_QC_REPORT)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::command_args;

    fn driver() -> FslDriver {
        FslDriver::with_bin_dir(Path::new("/opt/fsl/bin"))
    }

    #[test]
    fn test_warp_command_uses_nearest_neighbour_integer() {
        let request = WarpRequest {
            input: Path::new("atlas.nii.gz"),
            reference: Path::new("t1w_brain.nii.gz"),
            mask: Path::new("mask.nii.gz"),
            warp_field: Path::new("warp.nii.gz"),
            output: Path::new("out.nii.gz"),
        };
        let cmd = driver().build_warp_command(&request);
        assert_eq!(cmd.get_program(), "/opt/fsl/bin/applywarp");
        let args = command_args(&cmd);
        assert!(args.contains(&"--interp=nn".to_string()));
        assert!(args.contains(&"--datatype=int".to_string()));
        assert!(args.contains(&"--warp=warp.nii.gz".to_string()));
        assert!(args.contains(&"--mask=mask.nii.gz".to_string()));
    }

    #[test]
    fn test_affine_command() {
        let request = AffineRequest {
            input: Path::new("t1w_atlas.nii.gz"),
            reference: Path::new("b0.nii.gz"),
            matrix: Path::new("t1w_to_dwi.mat"),
            output: Path::new("dwi_atlas.nii.gz"),
        };
        let args = command_args(&driver().build_affine_command(&request));
        assert_eq!(
            args,
            vec![
                "-in", "t1w_atlas.nii.gz", "-ref", "b0.nii.gz", "-out", "dwi_atlas.nii.gz",
                "-applyxfm", "-init", "t1w_to_dwi.mat", "-interp", "nearestneighbour",
                "-datatype", "int",
            ]
        );
    }

    #[test]
    fn test_stats_command_per_measure() {
        let driver = driver();
        let metric = Path::new("fa.nii.gz");
        let labels = Path::new("atlas.nii.gz");
        let args = command_args(&driver.build_stats_command(metric, labels, Measure::Median));
        assert_eq!(args, vec!["-K", "atlas.nii.gz", "fa.nii.gz", "-p", "50"]);
        let args = command_args(&driver.build_stats_command(metric, labels, Measure::Max));
        assert_eq!(args.last().map(String::as_str), Some("-R"));
    }

    #[test]
    fn test_parse_label_stats() {
        let stdout = "0.41 0.90\nmissing label\n0.25 0.70\n";
        let min = parse_label_stats(stdout, Measure::Min).unwrap();
        assert_eq!(min.len(), 3);
        assert_eq!(min[0], 0.41);
        assert!(min[1].is_nan());
        let max = parse_label_stats(stdout, Measure::Max).unwrap();
        assert_eq!(max[2], 0.70);
        assert!(parse_label_stats("\n", Measure::Mean).is_err());
    }

    #[test]
    fn test_eddy_qc_command() {
        let request = EddyQcRequest {
            base_name: Path::new("/dwi/data"),
            bval: Path::new("/dwi/data.bval"),
            bvec: Path::new("/dwi/data.bvec"),
            mask: Path::new("/dwi/mask.nii.gz"),
            index: Path::new("/dwi/index.txt"),
            param: Path::new("/dwi/acqp.txt"),
            output_dir: Path::new("/qc/eddy_qc"),
        };
        let args = command_args(&driver().build_eddy_qc_command(&request));
        assert_eq!(args[0], "/dwi/data");
        assert_eq!(args.last().map(String::as_str), Some("/qc/eddy_qc"));
        assert!(args.windows(2).any(|w| w[0] == "-idx" && w[1] == "/dwi/index.txt"));
    }

    #[test]
    fn test_missing_input_is_reported_before_spawning() {
        let request = WarpRequest {
            input: Path::new("/nonexistent/atlas.nii.gz"),
            reference: Path::new("/nonexistent/t1w.nii.gz"),
            mask: Path::new("/nonexistent/mask.nii.gz"),
            warp_field: Path::new("/nonexistent/warp.nii.gz"),
            output: Path::new("/nonexistent/out.nii.gz"),
        };
        assert!(matches!(driver().apply_warp(&request), Err(ToolError::MissingInput { .. })));
    }
}
