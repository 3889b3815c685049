//! Output directory convention and derivative file naming.
//!
//! Every derivative path is a pure function of the session context and the
//! parameters that vary between outputs (space, atlas, metric, shell,
//! software, measure). Nothing here touches the filesystem except
//! [`ensure_directory`].

use std::io;
use std::path::{Path, PathBuf};

use crate::{SessionContext, Space};

/// Resolve the directory of a stage under an output root.
///
/// `<root>/sub-{subject}/ses-{session}/{stage}` when `output_directory` is a
/// study root. When it already is the session directory
/// (`.../sub-{subject}/ses-{session}`) only the stage name is appended, and
/// when it is a stage directory inside that session directory the stage
/// becomes its sibling.
pub fn stage_directory(output_directory: &Path, ctx: &SessionContext, stage: &str) -> PathBuf {
    if is_session_level(output_directory, ctx) {
        return output_directory.join(stage);
    }
    if let Some(parent) = output_directory.parent() {
        if is_session_level(parent, ctx) {
            return parent.join(stage);
        }
    }
    output_directory
        .join(ctx.subject_dir())
        .join(ctx.session_dir())
        .join(stage)
}

fn is_session_level(path: &Path, ctx: &SessionContext) -> bool {
    let session_matches = path
        .file_name()
        .is_some_and(|name| name.to_string_lossy() == ctx.session_dir());
    let subject_matches = path
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|name| name.to_string_lossy() == ctx.subject_dir());
    session_matches && subject_matches
}

/// Create-if-absent, never error-if-exists
pub fn ensure_directory(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}

/// `sub-{subject}_ses-{session}_space-{space}_{atlas}`
pub fn atlas_registration_name(ctx: &SessionContext, space: Space, atlas_base: &str) -> String {
    format!("{}_space-{}_{}", ctx.file_prefix(), space, atlas_base)
}

/// Stem of the shell-cropped diffusion triple: `sub-{subject}_ses-{session}_acq-shell{maxB}_dwi`
pub fn shell_crop_stem(ctx: &SessionContext, max_bvalue: u32) -> String {
    format!("{}_acq-shell{}_dwi", ctx.file_prefix(), max_bvalue)
}

/// `{software}/sub-{subject}_ses-{session}_space-dwi_acq-shell{maxB}_rec-{software}_desc-{metric}_dwiref.nii.gz`
pub fn tensor_metric_path(ctx: &SessionContext, software: &str, max_bvalue: u32, metric: &str) -> PathBuf {
    Path::new(software).join(format!(
        "{}_space-dwi_acq-shell{}_rec-{}_desc-{}_dwiref.nii.gz",
        ctx.file_prefix(),
        max_bvalue,
        software,
        metric
    ))
}

/// Parameters that key one parcellation table
#[derive(Debug, Clone, Copy)]
pub struct ParcellationKey<'a> {
    pub atlas: &'a str,
    pub label: &'a str,
    pub max_bvalue: u32,
    pub software: &'a str,
    pub metric: &'a str,
}

/// `{atlas}/sub-{subject}_ses-{session}_space-dwi_label-{label}_acq-shell{maxB}_rec-{software}_atlas-{atlas}_desc-{metric}_parc.csv`
pub fn parcellation_path(ctx: &SessionContext, key: ParcellationKey<'_>) -> PathBuf {
    Path::new(key.atlas).join(format!(
        "{}_space-dwi_label-{}_acq-shell{}_rec-{}_atlas-{}_desc-{}_parc.csv",
        ctx.file_prefix(),
        key.label,
        key.max_bvalue,
        key.software,
        key.atlas,
        key.metric
    ))
}

/// `{atlas}/sub-{subject}_ses-{session}_space-dwi_atlas-{atlas}_scale-{scale}_meas-{stat_edge}_{suffix}.csv`
pub fn connectome_path(
    ctx: &SessionContext,
    atlas: &str,
    scale: &str,
    stat_edge: &str,
    suffix: &str,
) -> PathBuf {
    Path::new(atlas).join(format!(
        "{}_space-dwi_atlas-{}_scale-{}_meas-{}_{}.csv",
        ctx.file_prefix(),
        atlas,
        scale,
        stat_edge,
        suffix
    ))
}

/// `sub-{subject}_ses-{session}_covariates.json`
pub fn covariates_name(ctx: &SessionContext) -> String {
    format!("{}_covariates.json", ctx.file_prefix())
}
