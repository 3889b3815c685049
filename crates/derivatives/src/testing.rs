//! Session fixtures and in-process stand-ins for the external tools.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use drivers::{
    AffineRequest, EDDY_QC_REPORT, EddyQcRequest, EddyQuality, OverlayRenderer, RegionStatistics, Registration,
    ShellExtraction, ShellExtractionRequest, StripingRequest, StripingScorer, StructuralPreprocessing,
    StructuralRequest, TensorFitRequest, TensorFitting, ToolError, WarpRequest,
};
use neuroflow_common::{Measure, Role, SessionContext};
use tempfile::TempDir;

use crate::atlases::{AtlasRecord, AtlasRegistry};
use crate::files::{FileResolver, FileSet};
use crate::pipeline::Toolbox;

const SESSION_FILES: &[(Role, &str)] = &[
    (Role::T1w, "anat/sub-0001_ses-1_desc-preproc_T1w.nii.gz"),
    (Role::T1wBrain, "anat/sub-0001_ses-1_desc-brain_T1w.nii.gz"),
    (Role::T1wBrainMask, "anat/sub-0001_ses-1_desc-brain_mask.nii.gz"),
    (
        Role::TemplateToT1wWarp,
        "anat/sub-0001_ses-1_from-MNI152NLin2009cAsym_to-T1w_mode-image_xfm.nii.gz",
    ),
    (Role::B0Brain, "dwi/sub-0001_ses-1_desc-brain_b0ref.nii.gz"),
    (Role::B0BrainMask, "dwi/sub-0001_ses-1_desc-brain_mask.nii.gz"),
    (Role::T1wToDwiMat, "dwi/sub-0001_ses-1_from-T1w_to-dwi_mode-image_xfm.mat"),
    (Role::DwiFile, "dwi/data.nii.gz"),
    (Role::BvalFile, "dwi/data.nii.gz.bval"),
    (Role::BvecFile, "dwi/data.nii.gz.bvec"),
    (Role::IndexFile, "dwi/index.txt"),
    (Role::ParamFile, "dwi/acqp.txt"),
];

const BVALS: &str = "0 0 995 1005 2000 2005\n";
const LABELS: &str = "index,name\n1,left\n2,right\n3,stem\n";

/// A preprocessed session laid out with the default role patterns, two
/// small atlases and a license file, all under one temporary directory.
/// The output root is not created.
pub struct SessionFixture {
    dir: TempDir,
    ctx: SessionContext,
    output_root: PathBuf,
    license: PathBuf,
}

impl SessionFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let input_root = dir.path().join("input/0001/202301011200");
        for (role, relative) in SESSION_FILES {
            let path = input_root.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            let content = if *role == Role::BvalFile { BVALS.to_string() } else { role.to_string() };
            fs::write(path, content).unwrap();
        }
        fs::write(input_root.join("dwi/data.nii.gz.eddy_outlier_map"), "map").unwrap();

        for atlas in ["toy", "toy2"] {
            let atlas_dir = dir.path().join("atlases").join(atlas);
            fs::create_dir_all(&atlas_dir).unwrap();
            fs::write(atlas_dir.join(format!("space-MNI152_atlas-{atlas}_res-1mm_dseg.nii.gz")), "atlas").unwrap();
            fs::write(atlas_dir.join("labels.csv"), LABELS).unwrap();
        }
        let license = dir.path().join("license.txt");
        fs::write(&license, "license").unwrap();

        let ctx = SessionContext::new("0001", "202301011200", input_root).unwrap();
        let output_root = dir.path().join("derivatives");
        Self {
            dir,
            ctx,
            output_root,
            license,
        }
    }

    pub fn ctx(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn input_root(&self) -> &Path {
        self.ctx.input_root()
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn license(&self) -> &Path {
        &self.license
    }

    pub fn path(&self, role: Role) -> PathBuf {
        let relative = SESSION_FILES
            .iter()
            .find(|(candidate, _)| *candidate == role)
            .map(|(_, relative)| *relative)
            .unwrap();
        self.input_root().join(relative)
    }

    pub fn files(&self) -> FileSet {
        FileResolver::new(self.input_root(), &Default::default())
            .resolve_all()
            .unwrap()
    }

    /// `toy` and `toy2`, three labels each
    pub fn registry(&self) -> AtlasRegistry {
        let records = ["toy", "toy2"].map(|atlas| {
            let atlas_dir = self.dir.path().join("atlases").join(atlas);
            AtlasRecord::new(
                atlas,
                atlas_dir.join(format!("space-MNI152_atlas-{atlas}_res-1mm_dseg.nii.gz")),
                atlas_dir.join("labels.csv"),
                "index",
            )
            .unwrap()
        });
        AtlasRegistry::from_records(records).unwrap()
    }
}

/// Calls made to the fake tools, and the calls that must fail.
///
/// A failure pattern is either an operation name (`"fit"`) or
/// `"operation:needle"`, matching calls whose detail contains the needle.
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn fail_on(&self, pattern: &str) {
        self.failures.lock().unwrap().push(pattern.to_string());
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(op, _)| op == operation).count()
    }

    pub fn total(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|(op, detail)| matches_pattern(pattern, op, detail))
    }

    fn record(&self, operation: &str, detail: &Path) -> drivers::Result<()> {
        let detail = detail
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.lock().unwrap().push((operation.to_string(), detail.clone()));

        let fails = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| matches_pattern(pattern, operation, &detail));
        if fails {
            return Err(ToolError::Execution {
                tool: operation.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

fn matches_pattern(pattern: &str, operation: &str, detail: &str) -> bool {
    match pattern.split_once(':') {
        Some((op, needle)) => op == operation && detail.contains(needle),
        None => pattern == operation,
    }
}

/// Every tool at once, writing placeholder outputs
#[derive(Debug, Clone)]
pub struct FakeTools {
    log: Arc<CallLog>,
}

impl FakeTools {
    pub fn toolbox() -> (Toolbox, Arc<CallLog>) {
        let log = Arc::new(CallLog::default());
        let fake = FakeTools { log: Arc::clone(&log) };
        let toolbox = Toolbox {
            registration: Box::new(fake.clone()),
            overlay: Box::new(fake.clone()),
            shell_extraction: Box::new(fake.clone()),
            tensor_fitting: Box::new(fake.clone()),
            region_statistics: Box::new(fake.clone()),
            eddy_quality: Box::new(fake.clone()),
            striping: Some(Box::new(fake.clone())),
            structural: Box::new(fake),
        };
        (toolbox, log)
    }
}

fn io_error(tool: &str, e: std::io::Error) -> ToolError {
    ToolError::Execution {
        tool: tool.to_string(),
        message: e.to_string(),
    }
}

impl Registration for FakeTools {
    fn apply_warp(&self, request: &WarpRequest<'_>) -> drivers::Result<()> {
        self.log.record("apply_warp", request.input)?;
        fs::write(request.output, "labels").map_err(|e| io_error("apply_warp", e))
    }

    fn apply_affine(&self, request: &AffineRequest<'_>) -> drivers::Result<()> {
        self.log.record("apply_affine", request.input)?;
        fs::write(request.output, "labels").map_err(|e| io_error("apply_affine", e))
    }
}

impl OverlayRenderer for FakeTools {
    fn render_overlay(&self, _overlay: &Path, _background: &Path, _title: &str, output: &Path) -> drivers::Result<()> {
        self.log.record("render_overlay", output)?;
        fs::write(output, "png").map_err(|e| io_error("render_overlay", e))
    }
}

impl ShellExtraction for FakeTools {
    fn extract_shell(&self, request: &ShellExtractionRequest<'_>) -> drivers::Result<()> {
        self.log.record("extract_shell", request.dwi)?;
        for output in [request.out_dwi, request.out_bval, request.out_bvec] {
            fs::write(output, request.shell.to_string()).map_err(|e| io_error("extract_shell", e))?;
        }
        Ok(())
    }
}

impl TensorFitting for FakeTools {
    fn software(&self) -> &str {
        "fake"
    }

    fn metrics(&self) -> &[&'static str] {
        &["fa", "md", "rd"]
    }

    fn fit(&self, request: &TensorFitRequest<'_>) -> drivers::Result<()> {
        self.log.record("fit", request.dwi)?;
        for metric in self.metrics() {
            fs::write(request.output_dir.join(self.output_file_name(metric)), *metric)
                .map_err(|e| io_error("fit", e))?;
        }
        Ok(())
    }
}

impl RegionStatistics for FakeTools {
    fn region_values(&self, metric_image: &Path, _label_image: &Path, _measure: Measure) -> drivers::Result<Vec<f64>> {
        self.log.record("region_values", metric_image)?;
        Ok(vec![1.0, 2.0, 3.0])
    }
}

impl EddyQuality for FakeTools {
    fn run(&self, request: &EddyQcRequest<'_>) -> drivers::Result<()> {
        self.log.record("eddy_qc", request.bval)?;
        if !request.bval.exists() {
            return Err(ToolError::MissingInput {
                tool: "eddy_qc".to_string(),
                path: request.bval.to_path_buf(),
            });
        }
        let report = serde_json::json!({
            "qc_mot_abs": 0.5,
            "qc_mot_rel": 0.25,
            "qc_outliers_tot": 1.0,
            "qc_outliers_b": [1.0, 2.0],
            "qc_outliers_pe": [0.5],
            "qc_cnr_avg": [[1.0, 2.0], [3.0]],
        });
        fs::create_dir_all(request.output_dir).map_err(|e| io_error("eddy_qc", e))?;
        fs::write(request.output_dir.join(EDDY_QC_REPORT), report.to_string()).map_err(|e| io_error("eddy_qc", e))
    }
}

impl StripingScorer for FakeTools {
    fn score(&self, request: &StripingRequest<'_>) -> drivers::Result<f64> {
        self.log.record("score", request.dwi)?;
        Ok(0.125)
    }
}

impl StructuralPreprocessing for FakeTools {
    fn run(&self, request: &StructuralRequest<'_>) -> drivers::Result<()> {
        self.log.record("smriprep", request.bids_dir)?;
        let subject = format!("sub-{}", request.subject);
        let sessions = fs::read_dir(request.bids_dir.join(&subject)).map_err(|e| io_error("smriprep", e))?;
        for session in sessions.flatten() {
            let session = session.file_name().to_string_lossy().into_owned();
            let anat = request.output_dir.join(&subject).join(&session).join("anat");
            fs::create_dir_all(&anat).map_err(|e| io_error("smriprep", e))?;
            fs::write(anat.join(format!("{subject}_{session}_desc-summary.html")), "<html/>")
                .map_err(|e| io_error("smriprep", e))?;
        }
        Ok(())
    }
}
