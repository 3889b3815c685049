pub mod driver;
pub mod sources;

use std::path::{Path, PathBuf};

use neuroflow_common::{Measure, Shell};
use thiserror::Error;

pub use driver::dipy::{DipyDriver, FitMethod};
pub use driver::fsl::FslDriver;
pub use driver::mrtrix::MrtrixDriver;
pub use driver::smriprep::SmriprepDriver;
pub use driver::striping::CommandStripingScorer;

pub type Result<T> = std::result::Result<T, ToolError>;

/// Failure of an external collaborator
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to initialize {tool}: {message}")]
    Initialization { tool: String, message: String },
    #[error("{tool} execution failed: {message}")]
    Execution { tool: String, message: String },
    #[error("Input for {tool} not found: {}", path.display())]
    MissingInput { tool: String, path: PathBuf },
    #[error("{tool} finished without producing {}", path.display())]
    NotProduced { tool: String, path: PathBuf },
    #[error("Could not parse {tool} output: {message}")]
    Parse { tool: String, message: String },
}

/// Nonlinear warp of a label image (nearest neighbour, integer datatype)
#[derive(Debug, Clone, Copy)]
pub struct WarpRequest<'a> {
    pub input: &'a Path,
    pub reference: &'a Path,
    pub mask: &'a Path,
    pub warp_field: &'a Path,
    pub output: &'a Path,
}

/// Affine transform of a label image (nearest neighbour, integer datatype)
#[derive(Debug, Clone, Copy)]
pub struct AffineRequest<'a> {
    pub input: &'a Path,
    pub reference: &'a Path,
    pub matrix: &'a Path,
    pub output: &'a Path,
}

/// Registration backend. Label maps must never be blended by interpolation,
/// so implementations always resample with nearest neighbour into an integer
/// datatype.
pub trait Registration: Send + Sync {
    fn apply_warp(&self, request: &WarpRequest<'_>) -> Result<()>;
    fn apply_affine(&self, request: &AffineRequest<'_>) -> Result<()>;
}

/// Renders a QC picture of `overlay` on top of `background`
pub trait OverlayRenderer: Send + Sync {
    fn render_overlay(&self, overlay: &Path, background: &Path, title: &str, output: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ShellExtractionRequest<'a> {
    pub dwi: &'a Path,
    pub bval: &'a Path,
    pub bvec: &'a Path,
    pub shell: &'a Shell,
    pub out_dwi: &'a Path,
    pub out_bval: &'a Path,
    pub out_bvec: &'a Path,
}

/// b-value aware extraction of the volumes belonging to a shell
pub trait ShellExtraction: Send + Sync {
    fn extract_shell(&self, request: &ShellExtractionRequest<'_>) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct TensorFitRequest<'a> {
    pub dwi: &'a Path,
    pub bval: &'a Path,
    pub bvec: &'a Path,
    pub mask: &'a Path,
    pub output_dir: &'a Path,
}

/// Tensor fitting backend.
///
/// `fit` writes one image per entry of [`TensorFitting::metrics`] into the
/// request's output directory, named by [`TensorFitting::output_file_name`].
pub trait TensorFitting: Send + Sync {
    /// Name embedded in derivative file names (`rec-{software}`)
    fn software(&self) -> &str;
    fn metrics(&self) -> &[&'static str];
    fn output_file_name(&self, metric: &str) -> String {
        format!("{metric}.nii.gz")
    }
    fn fit(&self, request: &TensorFitRequest<'_>) -> Result<()>;
}

/// Per-label summary of a scalar image.
///
/// The returned vector is indexed by `label - 1`; labels with no voxels are `NaN`.
pub trait RegionStatistics: Send + Sync {
    fn region_values(&self, metric_image: &Path, label_image: &Path, measure: Measure) -> Result<Vec<f64>>;
}

/// File written by the eddy QC tool into its output directory
pub const EDDY_QC_REPORT: &str = "qc.json";

#[derive(Debug, Clone, Copy)]
pub struct EddyQcRequest<'a> {
    /// Basename of the eddy outputs (`<dir>/data`)
    pub base_name: &'a Path,
    pub bval: &'a Path,
    pub bvec: &'a Path,
    pub mask: &'a Path,
    pub index: &'a Path,
    pub param: &'a Path,
    /// Must not exist yet
    pub output_dir: &'a Path,
}

/// Eddy-current QC. Writes [`EDDY_QC_REPORT`] into the output directory.
pub trait EddyQuality: Send + Sync {
    fn run(&self, request: &EddyQcRequest<'_>) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct StripingRequest<'a> {
    pub dwi: &'a Path,
    pub bval: &'a Path,
    pub bvec: &'a Path,
    pub mask: &'a Path,
}

/// Scores slice-wise striping artefacts of a diffusion series
pub trait StripingScorer: Send + Sync {
    fn score(&self, request: &StripingRequest<'_>) -> Result<f64>;
}

#[derive(Debug, Clone, Copy)]
pub struct StructuralRequest<'a> {
    pub bids_dir: &'a Path,
    pub output_dir: &'a Path,
    pub license: &'a Path,
    pub subject: &'a str,
}

/// Anatomical preprocessing (sMRIPrep) of one participant
pub trait StructuralPreprocessing: Send + Sync {
    fn run(&self, request: &StructuralRequest<'_>) -> Result<()>;
}
