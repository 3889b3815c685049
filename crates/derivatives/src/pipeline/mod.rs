pub mod builder;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drivers::{
    CommandStripingScorer, DipyDriver, EddyQuality, FitMethod, FslDriver, MrtrixDriver, OverlayRenderer,
    RegionStatistics, Registration, ShellExtraction, SmriprepDriver, StripingScorer, StructuralPreprocessing,
    TensorFitting,
};
use neuroflow_common::{Role, SessionContext, ShellSelector, Space, stage_directory};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::atlases::{AtlasRegistrationStage, AtlasRegistry, RegisteredAtlas};
use crate::cache::CacheStatus;
use crate::connectome::{ConnectomeDirectoryStage, PlannedConnectome};
use crate::covariates::{self, Covariate, Demographics, SessionCovariates};
use crate::error::{PipelineError, Result};
use crate::files::{FileResolver, FileSet};
use crate::parcellation::{self, ParcellationFailure, ParcellationOutput, ParcellationStage};
use crate::quality_control::QualityControlStage;
use crate::structural::StructuralStage;
use crate::tensors::{TensorMaps, TensorReconstructionStage};
use crate::traits::OutputCache;
use crate::{atlases, quality_control, structural, tensors};

pub use builder::PipelineBuilder;

pub const COVARIATES_DIRECTORY: &str = "covariates";

/// External collaborators used by the stages
pub struct Toolbox {
    pub registration: Box<dyn Registration>,
    pub overlay: Box<dyn OverlayRenderer>,
    pub shell_extraction: Box<dyn ShellExtraction>,
    pub tensor_fitting: Box<dyn TensorFitting>,
    pub region_statistics: Box<dyn RegionStatistics>,
    pub eddy_quality: Box<dyn EddyQuality>,
    pub striping: Option<Box<dyn StripingScorer>>,
    pub structural: Box<dyn StructuralPreprocessing>,
}

/// Locations of the external toolkits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ToolsConfig {
    /// FSL installation (defaults to `$FSLDIR`)
    pub fsl_dir: Option<PathBuf>,
    pub mrtrix_bin: Option<PathBuf>,
    pub dipy_bin: Option<PathBuf>,
    pub smriprep_bin: Option<PathBuf>,
    pub fit_method: FitMethod,
    /// Striping scorer command with `{dwi}`, `{bval}`, `{bvec}`, `{mask}`
    /// placeholders; no score when unset
    pub striping_command: Option<Vec<String>>,
}

impl Toolbox {
    /// Command-line drivers for every collaborator
    pub fn from_config(config: &ToolsConfig) -> Result<Self> {
        let fsl = FslDriver::new(config.fsl_dir.as_deref())?;
        let striping: Option<Box<dyn StripingScorer>> = match &config.striping_command {
            Some(argv) => Some(Box::new(CommandStripingScorer::new(argv.clone())?)),
            None => None,
        };
        Ok(Self {
            registration: Box::new(fsl.clone()),
            overlay: Box::new(fsl.clone()),
            region_statistics: Box::new(fsl.clone()),
            eddy_quality: Box::new(fsl),
            shell_extraction: Box::new(MrtrixDriver::new(config.mrtrix_bin.as_deref())?),
            tensor_fitting: Box::new(DipyDriver::new(config.dipy_bin.as_deref(), config.fit_method)?),
            striping,
            structural: Box::new(SmriprepDriver::new(config.smriprep_bin.as_deref())?),
        })
    }
}

/// Parameters shared by every session of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PipelineOptions {
    /// Atlas identifiers; every catalog atlas when unset
    pub atlases: Option<Vec<String>>,
    /// Parcellation measures; all of them when unset
    pub measures: Option<Vec<String>>,
    /// Tensor metrics to parcellate; every fitted metric when unset
    pub metrics: Option<Vec<String>>,
    pub max_bvalue: Option<u32>,
    /// Keep every acquired shell instead of cutting at `max_bvalue`
    pub multi_shell: bool,
    pub bval_tolerance: u32,
    /// Delete and recompute existing outputs
    pub force: bool,
    pub quality_control: bool,
    pub connectomes: bool,
    /// Run sMRIPrep on the raw T1w first
    pub structural: bool,
    pub fs_license: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            atlases: None,
            measures: None,
            metrics: None,
            max_bvalue: Some(1000),
            multi_shell: false,
            bval_tolerance: 50,
            force: false,
            quality_control: true,
            connectomes: true,
            structural: false,
            fs_license: None,
        }
    }
}

impl PipelineOptions {
    pub fn shell_selector(&self) -> ShellSelector {
        let max_bvalue = if self.multi_shell { None } else { self.max_bvalue };
        ShellSelector::new(max_bvalue, self.bval_tolerance)
    }
}

/// What one session produced or reused
#[derive(Debug)]
pub struct SessionReport {
    pub ctx: SessionContext,
    pub structural: Option<CacheStatus>,
    pub atlases: Vec<RegisteredAtlas>,
    pub registration_failures: Vec<(String, String)>,
    pub tensors: TensorMaps,
    pub parcellations: Vec<ParcellationOutput>,
    pub parcellation_failures: Vec<ParcellationFailure>,
    pub connectome_dir: Option<PathBuf>,
    pub connectomes: Vec<PlannedConnectome>,
    pub covariates: SessionCovariates,
    pub covariates_path: PathBuf,
}

impl SessionReport {
    /// Outputs computed during this run (as opposed to reused)
    pub fn computed(&self) -> usize {
        let atlases = self.atlases.iter().filter(|a| !a.status.is_hit()).count();
        let tables = self.parcellations.iter().filter(|p| !p.status.is_hit()).count();
        atlases + tables + usize::from(!self.tensors.status.is_hit())
    }
}

/// Runs the stages in dependency order for one subject/session at a time
pub struct SessionPipeline {
    registry: Arc<AtlasRegistry>,
    tools: Toolbox,
    cache: Box<dyn OutputCache>,
    options: PipelineOptions,
    patterns: BTreeMap<Role, String>,
    output_directory: PathBuf,
    demographics: Option<Demographics>,
}

impl SessionPipeline {
    pub fn builder(output_directory: impl Into<PathBuf>, registry: Arc<AtlasRegistry>) -> PipelineBuilder {
        PipelineBuilder::new(output_directory, registry)
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }

    /// Roles the enabled stages consume
    pub fn required_roles(&self) -> Vec<Role> {
        let mut roles: BTreeSet<Role> = atlases::registration::REQUIRED_ROLES
            .iter()
            .chain(tensors::REQUIRED_ROLES)
            .copied()
            .collect();
        if self.options.quality_control {
            roles.extend(quality_control::REQUIRED_ROLES);
        }
        if self.options.structural {
            roles.extend(structural::REQUIRED_ROLES);
        }
        roles.into_iter().collect()
    }

    pub fn run(&self, ctx: &SessionContext) -> Result<SessionReport> {
        let force = self.options.force;
        let cache = self.cache.as_ref();
        let output = self.output_directory.as_path();
        info!("Processing {}", ctx.file_prefix());

        let files = FileResolver::new(ctx.input_root(), &self.patterns).resolve(&self.required_roles())?;

        let structural = if self.options.structural {
            let stage = StructuralStage::new(ctx, &files, &self.tools, cache, output, self.options.fs_license.as_deref())?;
            Some(stage.run(force)?)
        } else {
            None
        };

        let registration = AtlasRegistrationStage::new(
            ctx,
            &files,
            &self.registry,
            self.options.atlases.as_deref(),
            &self.tools,
            cache,
            output,
        )?;
        let tensor_stage = TensorReconstructionStage::new(
            ctx,
            &files,
            self.options.shell_selector(),
            &self.tools,
            cache,
            output,
        )?;

        let registered = registration.run(force);
        let dwi_atlases = registered.in_space(Space::Dwi);
        let tensors = tensor_stage.run(force)?;

        let parcellations = ParcellationStage::new(
            ctx,
            &dwi_atlases,
            &tensors,
            self.options.measures.as_deref(),
            self.options.metrics.as_deref(),
            &self.tools,
            cache,
            output,
        )?
        .run(force);

        let (connectome_dir, connectomes) = if self.options.connectomes {
            let stage = ConnectomeDirectoryStage::new(ctx, output);
            let dir = stage.ensure()?.to_path_buf();
            (Some(dir), stage.planned_outputs(ctx, &dwi_atlases))
        } else {
            (None, Vec::new())
        };

        let covariates = SessionCovariates::new(ctx, self.collect_covariates(ctx, &files, force));
        let covariates_path = self.publish_covariates(ctx, &covariates)?;

        Ok(SessionReport {
            ctx: ctx.clone(),
            structural,
            atlases: registered.registered,
            registration_failures: registered
                .failures
                .into_iter()
                .map(|(atlas, e)| (atlas, e.to_string()))
                .collect(),
            tensors,
            parcellations: parcellations.outputs,
            parcellation_failures: parcellations.failures,
            connectome_dir,
            connectomes,
            covariates,
            covariates_path,
        })
    }

    fn collect_covariates(&self, ctx: &SessionContext, files: &FileSet, force: bool) -> Vec<Covariate> {
        let mut collected = vec![covariates::temporal(ctx)];

        if self.options.quality_control {
            match QualityControlStage::new(ctx, files, &self.tools, self.cache.as_ref(), &self.output_directory) {
                Ok(stage) => collected.push(stage.get_covariates(force)),
                Err(e) => warn!("Quality control skipped for {}: {}", ctx.file_prefix(), e),
            }
        }

        if let Some(demographics) = &self.demographics {
            match demographics.covariates(ctx) {
                Ok(covariate) => collected.push(covariate),
                Err(e) => warn!("Demographics unavailable for {}: {}", ctx.file_prefix(), e),
            }
        }
        collected
    }

    fn publish_covariates(&self, ctx: &SessionContext, covariates: &SessionCovariates) -> Result<PathBuf> {
        let directory = stage_directory(&self.output_directory, ctx, COVARIATES_DIRECTORY);
        let path = covariates::covariates_path(&directory, ctx);
        self.cache
            .publish(std::slice::from_ref(&path), &mut |staged| covariates.write_json(&staged[0]))?;
        Ok(path)
    }
}

/// Validate selections that must fail before any session runs
pub(crate) fn validate_options(registry: &AtlasRegistry, options: &PipelineOptions) -> Result<()> {
    registry.select(options.atlases.as_deref())?;
    parcellation::parse_measures(options.measures.as_deref())?;
    Ok(())
}

/// Metric selections must name maps the tensor fitting produces
pub(crate) fn validate_metrics(options: &PipelineOptions, fitting: &dyn TensorFitting) -> Result<()> {
    let Some(requested) = &options.metrics else {
        return Ok(());
    };
    match requested
        .iter()
        .find(|metric| !fitting.metrics().iter().any(|known| *known == metric.as_str()))
    {
        Some(unknown) => Err(PipelineError::InvalidMetric {
            metric: unknown.clone(),
            software: fitting.software().to_string(),
        }),
        None => Ok(()),
    }
}
