use std::path::{Path, PathBuf};

use neuroflow_common::layout::connectome_path;
use neuroflow_common::{SessionContext, ensure_directory, stage_directory};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::debug;

use crate::atlases::RegisteredAtlas;
use crate::error::Result;

pub const DIRECTORY_NAME: &str = "connectomes";
pub const SUFFIX: &str = "connectome";

/// Edge weighting of a structural connectome
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, EnumIter, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectomeScale {
    None,
    Length,
    Invlength,
    Invnodevol,
}

/// Reduction of the streamline values along an edge
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, EnumIter, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StatEdge {
    Sum,
    Mean,
}

/// A connectome file expected from the downstream matrix computation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedConnectome {
    pub atlas: String,
    pub scale: ConnectomeScale,
    pub stat_edge: StatEdge,
    pub path: PathBuf,
}

/// Output location of connectome matrices. The matrices themselves are
/// computed outside of this pipeline.
pub struct ConnectomeDirectoryStage {
    output_dir: PathBuf,
}

impl ConnectomeDirectoryStage {
    pub fn new(ctx: &SessionContext, output_directory: &Path) -> Self {
        Self {
            output_dir: stage_directory(output_directory, ctx, DIRECTORY_NAME),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.output_dir
    }

    /// Create the directory if needed
    pub fn ensure(&self) -> Result<&Path> {
        ensure_directory(&self.output_dir)?;
        debug!("Connectome directory {}", self.output_dir.display());
        Ok(&self.output_dir)
    }

    /// Every scale × edge statistic for each atlas
    pub fn planned_outputs(&self, ctx: &SessionContext, atlases: &[RegisteredAtlas]) -> Vec<PlannedConnectome> {
        let mut planned = Vec::new();
        for atlas in atlases {
            for scale in ConnectomeScale::iter() {
                for stat_edge in StatEdge::iter() {
                    let relative = connectome_path(
                        ctx,
                        atlas.id(),
                        &scale.to_string(),
                        &stat_edge.to_string(),
                        SUFFIX,
                    );
                    planned.push(PlannedConnectome {
                        atlas: atlas.id().to_string(),
                        scale,
                        stat_edge,
                        path: self.output_dir.join(relative),
                    });
                }
            }
        }
        planned
    }
}
