use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use derivatives::{
    AtlasRegistry, AtlasSpec, Demographics, DemographicsConfig, PipelineError, PipelineOptions, SessionPipeline,
    ToolsConfig,
};
use neuroflow_common::{CommonError, Role, SessionContext};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    SerdeError(#[from] serde_json::Error),
    #[error(transparent)]
    TomlDeError(#[from] toml::de::Error),
    #[error(transparent)]
    TomlSerError(#[from] toml::ser::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Session(#[from] CommonError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("No configured session matches subject {subject:?} and session {session:?}")]
    NoMatchingSession {
        subject: Option<String>,
        session: Option<String>,
    },
    #[error("Unsupported file format. Please use .toml or .json files")]
    UnsupportedFileFormat,
}

/// One preprocessed subject/session
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SessionEntry {
    pub subject: String,
    pub session: String,
    /// Preprocessed input root of the session
    pub input_dir: PathBuf,
}

/// Study configuration: where the data lives, which sessions to process
/// and how.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StudyConfig {
    /// Derivatives root; stage directories are created beneath it
    pub output_dir: PathBuf,
    /// Root of the built-in atlas catalog
    pub atlas_root: PathBuf,
    /// Extra atlases, paths relative to `atlas_root`
    #[serde(default)]
    pub custom_atlases: Vec<AtlasSpec>,
    /// Glob patterns overriding the default input layout, per role
    #[serde(default)]
    pub patterns: BTreeMap<Role, String>,
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
    #[serde(default)]
    pub options: PipelineOptions,
    #[serde(default)]
    pub tools: ToolsConfig,
    pub demographics: Option<DemographicsConfig>,
}

impl StudyConfig {
    /// Starting point written by `neuroflow init`
    pub fn skeleton() -> Self {
        Self {
            output_dir: PathBuf::from("derivatives"),
            atlas_root: PathBuf::from("atlases"),
            custom_atlases: Vec::new(),
            patterns: BTreeMap::new(),
            sessions: vec![SessionEntry {
                subject: "0001".to_string(),
                session: "202301011200".to_string(),
                input_dir: PathBuf::from("preprocessed/0001/202301011200"),
            }],
            options: PipelineOptions::default(),
            tools: ToolsConfig::default(),
            demographics: None,
        }
    }

    /// Load StudyConfig from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load StudyConfig from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Auto-detect file format and load configuration
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        match path_ref.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("json") => Self::from_json_file(path),
            _ => Err(ConfigError::UnsupportedFileFormat),
        }
    }

    /// Save in the format given by the file extension
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path_ref = path.as_ref();
        match path_ref.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => self.to_toml_file(path),
            Some("json") => self.to_json_file(path),
            _ => Err(ConfigError::UnsupportedFileFormat),
        }
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&self)?)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = self.to_json()?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(&self)?)
    }

    /// Built-in catalog plus the custom atlases
    pub fn registry(&self) -> Result<AtlasRegistry, ConfigError> {
        let registry = AtlasRegistry::builtin(&self.atlas_root)?;
        if self.custom_atlases.is_empty() {
            return Ok(registry);
        }
        Ok(registry.with_custom(&self.custom_atlases, &self.atlas_root)?)
    }

    /// Configured sessions, optionally restricted to one subject and/or
    /// session
    pub fn session_contexts(
        &self,
        subject: Option<&str>,
        session: Option<&str>,
    ) -> Result<Vec<SessionContext>, ConfigError> {
        let contexts = self
            .sessions
            .iter()
            .filter(|entry| subject.is_none_or(|s| s == entry.subject))
            .filter(|entry| session.is_none_or(|s| s == entry.session))
            .map(|entry| SessionContext::new(entry.subject.clone(), entry.session.clone(), entry.input_dir.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        if contexts.is_empty() {
            return Err(ConfigError::NoMatchingSession {
                subject: subject.map(str::to_string),
                session: session.map(str::to_string),
            });
        }
        Ok(contexts)
    }

    /// Pipeline using the command-line drivers; `force` overrides the
    /// configured option when set
    pub fn pipeline(&self, force: bool) -> Result<SessionPipeline, ConfigError> {
        let registry = Arc::new(self.registry()?);
        let mut options = self.options.clone();
        options.force |= force;

        let mut builder = SessionPipeline::builder(self.output_dir.clone(), registry)
            .with_tools_config(self.tools.clone())
            .with_options(options)
            .with_patterns(self.patterns.clone());
        if let Some(demographics) = &self.demographics {
            builder = builder.with_demographics(Demographics::from_config(demographics));
        }
        Ok(builder.build()?)
    }
}
