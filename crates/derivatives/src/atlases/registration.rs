use std::path::{Path, PathBuf};
use std::sync::Arc;

use drivers::{AffineRequest, WarpRequest};
use neuroflow_common::layout::atlas_registration_name;
use neuroflow_common::{Role, SessionContext, Space, stage_directory};
use tracing::{info, warn};

use crate::atlases::{AtlasRecord, AtlasRegistry};
use crate::cache::{self, CacheStatus};
use crate::error::{PipelineError, Result};
use crate::files::FileSet;
use crate::pipeline::Toolbox;
use crate::traits::OutputCache;

pub const DIRECTORY_NAME: &str = "atlases";

pub const REQUIRED_ROLES: &[Role] = &[
    Role::T1wBrain,
    Role::T1wBrainMask,
    Role::TemplateToT1wWarp,
    Role::B0Brain,
    Role::T1wToDwiMat,
];

/// An atlas label image resampled into subject space
#[derive(Debug, Clone)]
pub struct RegisteredAtlas {
    pub record: Arc<AtlasRecord>,
    pub space: Space,
    pub path: PathBuf,
    pub status: CacheStatus,
}

impl RegisteredAtlas {
    pub fn id(&self) -> &str {
        self.record.id()
    }
}

/// Outcome of one registration phase. Atlases fail independently.
#[derive(Debug, Default)]
pub struct RegistrationReport {
    pub registered: Vec<RegisteredAtlas>,
    pub failures: Vec<(String, PipelineError)>,
}

impl RegistrationReport {
    pub fn in_space(&self, space: Space) -> Vec<RegisteredAtlas> {
        self.registered
            .iter()
            .filter(|atlas| atlas.space == space)
            .cloned()
            .collect()
    }

    fn merge(&mut self, other: RegistrationReport) {
        self.registered.extend(other.registered);
        self.failures.extend(other.failures);
    }
}

/// Standard space → T1w (nonlinear warp) → diffusion space (affine) for every
/// selected atlas. Each phase is cached per atlas.
pub struct AtlasRegistrationStage<'a> {
    ctx: &'a SessionContext,
    files: &'a FileSet,
    atlases: Vec<Arc<AtlasRecord>>,
    tools: &'a Toolbox,
    cache: &'a dyn OutputCache,
    output_dir: PathBuf,
}

impl<'a> AtlasRegistrationStage<'a> {
    /// Validates the atlas selection and the required roles. Nothing is
    /// written until a phase runs.
    pub fn new(
        ctx: &'a SessionContext,
        files: &'a FileSet,
        registry: &AtlasRegistry,
        selection: Option<&[String]>,
        tools: &'a Toolbox,
        cache: &'a dyn OutputCache,
        output_directory: &Path,
    ) -> Result<Self> {
        let atlases = registry.select(selection)?;
        files.require(REQUIRED_ROLES)?;
        Ok(Self {
            ctx,
            files,
            atlases,
            tools,
            cache,
            output_dir: stage_directory(output_directory, ctx, DIRECTORY_NAME),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn atlases(&self) -> &[Arc<AtlasRecord>] {
        &self.atlases
    }

    pub fn output_path(&self, record: &AtlasRecord, space: Space) -> PathBuf {
        self.output_dir
            .join(atlas_registration_name(self.ctx, space, &record.base_name()))
    }

    /// Both phases. Atlases whose T1w registration failed are not carried
    /// into diffusion space.
    pub fn run(&self, force: bool) -> RegistrationReport {
        let mut report = self.register_to_t1w(force);
        let t1w = report.registered.clone();
        report.merge(self.register_to_dwi(&t1w, force));
        report
    }

    pub fn register_to_t1w(&self, force: bool) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        for record in &self.atlases {
            match self.warp_to_t1w(record, force) {
                Ok(registered) => report.registered.push(registered),
                Err(e) => {
                    warn!("Registration of {} to T1w failed: {}", record.id(), e);
                    report.failures.push((record.id().to_string(), e));
                }
            }
        }
        report
    }

    pub fn register_to_dwi(&self, t1w_atlases: &[RegisteredAtlas], force: bool) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        for atlas in t1w_atlases.iter().filter(|atlas| atlas.space == Space::T1w) {
            match self.transform_to_dwi(atlas, force) {
                Ok(registered) => report.registered.push(registered),
                Err(e) => {
                    warn!("Registration of {} to DWI failed: {}", atlas.id(), e);
                    report.failures.push((atlas.id().to_string(), e));
                }
            }
        }
        report
    }

    fn warp_to_t1w(&self, record: &Arc<AtlasRecord>, force: bool) -> Result<RegisteredAtlas> {
        let reference = self.files.get(Role::T1wBrain)?;
        let mask = self.files.get(Role::T1wBrainMask)?;
        let warp_field = self.files.get(Role::TemplateToT1wWarp)?;

        self.register(record, Space::T1w, reference, force, |output| {
            self.tools.registration.apply_warp(&WarpRequest {
                input: record.reference(),
                reference,
                mask,
                warp_field,
                output,
            })
        })
    }

    fn transform_to_dwi(&self, atlas: &RegisteredAtlas, force: bool) -> Result<RegisteredAtlas> {
        let reference = self.files.get(Role::B0Brain)?;
        let matrix = self.files.get(Role::T1wToDwiMat)?;

        self.register(&atlas.record, Space::Dwi, reference, force, |output| {
            self.tools.registration.apply_affine(&AffineRequest {
                input: &atlas.path,
                reference,
                matrix,
                output,
            })
        })
    }

    fn register(
        &self,
        record: &Arc<AtlasRecord>,
        space: Space,
        reference: &Path,
        force: bool,
        apply: impl Fn(&Path) -> drivers::Result<()>,
    ) -> Result<RegisteredAtlas> {
        let path = self.output_path(record, space);
        let outputs = [path.clone()];

        let status = cache::lookup(self.cache, &outputs, force, &cache::exists)?;
        if status.is_hit() {
            info!("Atlas {} already registered to {}: {}", record.id(), space, path.display());
        } else {
            info!("Registering {} to {}", record.id(), space);
            self.cache.publish(&outputs, &mut |staged| Ok(apply(&staged[0])?))?;
            self.render_qc(record, space, &path, reference, force);
        }

        Ok(RegisteredAtlas {
            record: Arc::clone(record),
            space,
            path,
            status,
        })
    }

    fn render_qc(&self, record: &AtlasRecord, space: Space, registered: &Path, reference: &Path, force: bool) {
        let qc = qc_image_path(registered);
        if qc.exists() && !force {
            return;
        }
        let title = format!("{} registration to {}", record.id(), space);
        let targets = [qc.clone()];
        let rendered = self.cache.publish(&targets, &mut |staged| {
            Ok(self.tools.overlay.render_overlay(registered, reference, &title, &staged[0])?)
        });
        if let Err(e) = rendered {
            warn!("QC image {} not rendered: {}", qc.display(), e);
        }
    }
}

/// `..._dseg.nii.gz` → `..._QC.png`
pub fn qc_image_path(registered: &Path) -> PathBuf {
    let name = registered
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let qc_name = if name.contains("dseg.nii.gz") {
        name.replace("dseg.nii.gz", "QC.png")
    } else {
        let stem = name
            .strip_suffix(".nii.gz")
            .or_else(|| name.strip_suffix(".nii"))
            .unwrap_or(&name);
        format!("{stem}_QC.png")
    };
    registered.with_file_name(qc_name)
}
