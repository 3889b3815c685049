//! # Neuroflow Derivatives
//!
//! Staged, idempotent computation of per-session diffusion derivatives:
//! atlas registrations, tensor maps, regional parcellation tables,
//! connectome locations and quality-control covariates.
//!
//! ## Core Features
//!
//! - **Filesystem as cache**: every output has a deterministic path; a stage
//!   reuses what is on disk and publishes new outputs atomically
//! - **Trait-based collaborators**: registration, tensor fitting, statistics
//!   and QC tools sit behind the traits of the `drivers` crate
//! - **Fail fast**: unknown atlases, measures or unresolved input roles are
//!   rejected before anything is written
//! - **Best-effort QC**: quality-control failures degrade to null covariates
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use derivatives::{AtlasRegistry, PipelineOptions, SessionPipeline};
//! use neuroflow_common::SessionContext;
//!
//! let registry = Arc::new(AtlasRegistry::builtin(Path::new("/opt/atlases"))?);
//! let pipeline = SessionPipeline::builder("/data/derivatives", registry)
//!     .with_options(PipelineOptions {
//!         atlases: Some(vec!["fan2016".to_string()]),
//!         ..PipelineOptions::default()
//!     })
//!     .build()?;
//!
//! let ctx = SessionContext::new("0001", "202301011200", "/data/preprocessed/0001/202301011200")?;
//! let report = pipeline.run(&ctx)?;
//! println!("{} parcellation tables", report.parcellations.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod atlases;
pub mod cache;
pub mod connectome;
pub mod covariates;
pub mod error;
pub mod files;
pub mod parcellation;
pub mod pipeline;
pub mod quality_control;
pub mod structural;
pub mod tensors;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use atlases::{AtlasRecord, AtlasRegistrationStage, AtlasRegistry, AtlasSpec, RegisteredAtlas};
pub use cache::{CacheStatus, FilesystemCache};
pub use connectome::ConnectomeDirectoryStage;
pub use covariates::{Covariate, CovariateSource, CovariateValue, Demographics, DemographicsConfig, SessionCovariates};
pub use error::{PipelineError, Result};
pub use files::{FileResolver, FileSet};
pub use parcellation::{ParcellationFailure, ParcellationReport, ParcellationStage, ParcellationTable};
pub use pipeline::{PipelineBuilder, PipelineOptions, SessionPipeline, SessionReport, Toolbox, ToolsConfig};
pub use quality_control::QualityControlStage;
pub use structural::StructuralStage;
pub use tensors::TensorReconstructionStage;
pub use traits::{OutputCache, TabularSource};
