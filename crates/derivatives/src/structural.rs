use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use drivers::StructuralRequest;
use neuroflow_common::{Role, SessionContext, stage_directory};
use tracing::info;

use crate::cache::{self, CacheStatus};
use crate::error::{PipelineError, Result};
use crate::files::FileSet;
use crate::pipeline::Toolbox;
use crate::traits::OutputCache;

pub const DIRECTORY_NAME: &str = "smriprep";
pub const BIDS_DIRECTORY: &str = "bids";

pub const REQUIRED_ROLES: &[Role] = &[Role::T1w];

/// FreeSurfer license: the explicit path, then `FS_LICENSE`, then
/// `$FREESURFER_HOME/license.txt`
pub fn resolve_license(explicit: Option<&Path>) -> Result<PathBuf> {
    resolve_license_from(
        explicit,
        std::env::var_os("FS_LICENSE"),
        std::env::var_os("FREESURFER_HOME"),
    )
}

fn resolve_license_from(
    explicit: Option<&Path>,
    fs_license: Option<OsString>,
    freesurfer_home: Option<OsString>,
) -> Result<PathBuf> {
    let candidates = [
        explicit.map(Path::to_path_buf),
        fs_license.map(PathBuf::from),
        freesurfer_home.map(|home| PathBuf::from(home).join("license.txt")),
    ];
    let tried: Vec<PathBuf> = candidates.into_iter().flatten().collect();
    match tried.iter().find(|path| path.is_file()) {
        Some(license) => Ok(license.clone()),
        None => Err(PipelineError::License(if tried.is_empty() {
            "no license path given and FS_LICENSE/FREESURFER_HOME are unset".to_string()
        } else {
            tried
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        })),
    }
}

/// Anatomical preprocessing of the raw T1w with sMRIPrep.
///
/// The T1w is copied into a minimal BIDS tree next to the output and the
/// whole sMRIPrep output directory is published at once.
pub struct StructuralStage<'a> {
    ctx: &'a SessionContext,
    files: &'a FileSet,
    tools: &'a Toolbox,
    cache: &'a dyn OutputCache,
    output_dir: PathBuf,
    bids_dir: PathBuf,
    license: PathBuf,
}

impl<'a> StructuralStage<'a> {
    pub fn new(
        ctx: &'a SessionContext,
        files: &'a FileSet,
        tools: &'a Toolbox,
        cache: &'a dyn OutputCache,
        output_directory: &Path,
        license: Option<&Path>,
    ) -> Result<Self> {
        files.require(REQUIRED_ROLES)?;
        let license = resolve_license(license)?;
        Ok(Self {
            ctx,
            files,
            tools,
            cache,
            output_dir: stage_directory(output_directory, ctx, DIRECTORY_NAME),
            bids_dir: stage_directory(output_directory, ctx, BIDS_DIRECTORY),
            license,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `bids/sub-{s}/ses-{ss}/anat/sub-{s}_ses-{ss}_T1w.nii.gz`
    pub fn bids_t1w_path(&self) -> PathBuf {
        self.bids_dir
            .join(self.ctx.subject_dir())
            .join(self.ctx.session_dir())
            .join("anat")
            .join(format!("{}_T1w.nii.gz", self.ctx.file_prefix()))
    }

    /// Report written last by sMRIPrep
    pub fn summary_path(&self) -> PathBuf {
        self.output_dir
            .join(self.ctx.subject_dir())
            .join(self.ctx.session_dir())
            .join("anat")
            .join(format!("{}_desc-summary.html", self.ctx.file_prefix()))
    }

    /// Copy (never link) the T1w into the BIDS tree
    pub fn stage_t1w(&self, force: bool) -> Result<PathBuf> {
        let target = [self.bids_t1w_path()];
        if !cache::lookup(self.cache, &target, force, &cache::exists)?.is_hit() {
            let t1w = self.files.get(Role::T1w)?;
            self.cache.publish(&target, &mut |staged| {
                fs::copy(t1w, &staged[0])?;
                Ok(())
            })?;
        }
        let [path] = target;
        Ok(path)
    }

    pub fn run(&self, force: bool) -> Result<CacheStatus> {
        let status = cache::lookup(self.cache, &[self.summary_path()], force, &cache::exists)?;
        if status.is_hit() {
            info!("sMRIPrep outputs already present for {}", self.ctx.file_prefix());
            return Ok(status);
        }

        self.stage_t1w(force)?;
        let bids_root = self.bids_dir.clone();
        info!("Running sMRIPrep for {}", self.ctx.file_prefix());
        self.cache.publish(&[self.output_dir.clone()], &mut |staged| {
            Ok(self.tools.structural.run(&StructuralRequest {
                bids_dir: &bids_root,
                output_dir: &staged[0],
                license: &self.license,
                subject: self.ctx.subject(),
            })?)
        })?;
        Ok(status)
    }
}
