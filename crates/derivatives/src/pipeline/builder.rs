use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use neuroflow_common::Role;

use crate::{
    atlases::AtlasRegistry,
    cache::FilesystemCache,
    covariates::Demographics,
    error::Result,
    pipeline::{validate_metrics, validate_options, PipelineOptions, SessionPipeline, Toolbox, ToolsConfig},
    traits::OutputCache,
};

/// Builder for session pipelines with a fluent API
pub struct PipelineBuilder {
    output_directory: PathBuf,
    registry: Arc<AtlasRegistry>,
    toolbox: Option<Toolbox>,
    tools_config: ToolsConfig,
    cache: Option<Box<dyn OutputCache>>,
    options: PipelineOptions,
    patterns: BTreeMap<Role, String>,
    demographics: Option<Demographics>,
}

impl PipelineBuilder {
    pub fn new(output_directory: impl Into<PathBuf>, registry: Arc<AtlasRegistry>) -> Self {
        Self {
            output_directory: output_directory.into(),
            registry,
            toolbox: None,
            tools_config: ToolsConfig::default(),
            cache: None,
            options: PipelineOptions::default(),
            patterns: BTreeMap::new(),
            demographics: None,
        }
    }

    /// Use these collaborators instead of the command-line drivers
    pub fn with_toolbox(mut self, toolbox: Toolbox) -> Self {
        self.toolbox = Some(toolbox);
        self
    }

    /// Where to find the command-line drivers (ignored with [`Self::with_toolbox`])
    pub fn with_tools_config(mut self, config: ToolsConfig) -> Self {
        self.tools_config = config;
        self
    }

    /// Set the output cache (replaces the filesystem cache)
    pub fn with_cache<C>(mut self, cache: C) -> Self
    where
        C: OutputCache + 'static,
    {
        self.cache = Some(Box::new(cache));
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Role patterns overriding the defaults
    pub fn with_patterns(mut self, patterns: BTreeMap<Role, String>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_demographics(mut self, demographics: Demographics) -> Self {
        self.demographics = Some(demographics);
        self
    }

    /// Validate the atlas, measure and metric selections, then build with
    /// the command-line drivers and the filesystem cache unless others were
    /// given
    pub fn build(self) -> Result<SessionPipeline> {
        validate_options(&self.registry, &self.options)?;

        let tools = match self.toolbox {
            Some(toolbox) => toolbox,
            None => Toolbox::from_config(&self.tools_config)?,
        };
        validate_metrics(&self.options, tools.tensor_fitting.as_ref())?;
        let cache = self.cache.unwrap_or_else(|| Box::new(FilesystemCache));

        Ok(SessionPipeline {
            registry: self.registry,
            tools,
            cache,
            options: self.options,
            patterns: self.patterns,
            output_directory: self.output_directory,
            demographics: self.demographics,
        })
    }
}
