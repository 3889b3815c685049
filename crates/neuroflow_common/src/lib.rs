//! # Neuroflow Common - Shared Types and Utilities
//!
//! Value types shared by the tool drivers and the derivative stages: the
//! subject/session context, input file roles, image spaces, summary measures,
//! diffusion shells and the output directory/file naming convention.
//!
//! ## Example
//!
//! ```rust
//! use neuroflow_common::{SessionContext, ShellSelector};
//!
//! let ctx = SessionContext::new("0001", "202301011200", "/data/0001/202301011200").unwrap();
//! assert_eq!(ctx.subject_dir(), "sub-0001");
//!
//! let shell = ShellSelector::new(Some(1000), 50)
//!     .select(&[0.0, 0.0, 995.0, 1005.0, 2000.0, 2005.0])
//!     .unwrap();
//! assert_eq!(shell.max(), 1000);
//! ```

pub mod layout;
pub mod shell;

use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr, VariantNames};
use thiserror::Error;

pub use layout::{ensure_directory, stage_directory};
pub use shell::{Shell, ShellSelector};

/// Result type for shared operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared types
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: &'static str },

    #[error("No b-value survives filtering (max {max_bvalue:?}, tolerance {tolerance})")]
    EmptyShell { max_bvalue: Option<u32>, tolerance: u32 },

    #[error("Invalid b-values in {path}: {reason}")]
    InvalidBvals { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifiers and input root of one subject/session.
///
/// Immutable for the lifetime of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SessionContext {
    subject: String,
    session: String,
    input_root: PathBuf,
}

impl SessionContext {
    pub fn new(
        subject: impl Into<String>,
        session: impl Into<String>,
        input_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let subject = validate_identifier(subject.into())?;
        let session = validate_identifier(session.into())?;
        Ok(Self {
            subject,
            session,
            input_root: input_root.into(),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn input_root(&self) -> &Path {
        &self.input_root
    }

    /// `sub-{subject}`
    pub fn subject_dir(&self) -> String {
        format!("sub-{}", self.subject)
    }

    /// `ses-{session}`
    pub fn session_dir(&self) -> String {
        format!("ses-{}", self.session)
    }

    /// `sub-{subject}_ses-{session}`, the prefix of every derivative file name
    pub fn file_prefix(&self) -> String {
        format!("sub-{}_ses-{}", self.subject, self.session)
    }
}

fn validate_identifier(value: String) -> Result<String> {
    if value.is_empty() {
        return Err(CommonError::InvalidIdentifier { value, reason: "must not be empty" });
    }
    if value.contains(['/', '\\']) || value.chars().any(char::is_whitespace) {
        return Err(CommonError::InvalidIdentifier {
            value,
            reason: "must not contain path separators or whitespace",
        });
    }
    Ok(value)
}

/// Input file roles consumed by the stages
#[derive(
    Debug, Clone, Copy,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
    PartialEq, Eq, PartialOrd, Ord, Hash
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    T1w,
    T1wBrain,
    T1wBrainMask,
    TemplateToT1wWarp,
    B0Brain,
    B0BrainMask,
    T1wToDwiMat,
    DwiFile,
    BvalFile,
    BvecFile,
    IndexFile,
    ParamFile,
}

/// Image space an output lives in
#[derive(
    Debug, Clone, Copy,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, IntoStaticStr,
    PartialEq, Eq, PartialOrd, Ord, Hash
)]
pub enum Space {
    #[strum(serialize = "MNI152")]
    #[serde(rename = "MNI152")]
    Mni152,
    #[strum(serialize = "T1w")]
    #[serde(rename = "T1w")]
    T1w,
    #[strum(serialize = "dwi")]
    #[serde(rename = "dwi")]
    Dwi,
}

/// Regional summary statistic of a metric image
#[derive(
    Debug, Clone, Copy,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
    PartialEq, Eq, PartialOrd, Ord, Hash
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Measure {
    Mean,
    Median,
    Std,
    Min,
    Max,
}

impl Measure {
    /// Names of every available measure
    pub fn names() -> &'static [&'static str] {
        <Self as VariantNames>::VARIANTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_session_context_names() {
        let ctx = SessionContext::new("0042", "202401151030", "/data/0042").unwrap();
        assert_eq!(ctx.subject_dir(), "sub-0042");
        assert_eq!(ctx.session_dir(), "ses-202401151030");
        assert_eq!(ctx.file_prefix(), "sub-0042_ses-202401151030");
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(SessionContext::new("", "1", "/data").is_err());
        assert!(SessionContext::new("00/1", "1", "/data").is_err());
        assert!(SessionContext::new("0001", "ses 1", "/data").is_err());
    }

    #[test]
    fn test_role_names() {
        assert_eq!(Role::T1wBrain.to_string(), "t1w_brain");
        assert_eq!(Role::T1wToDwiMat.to_string(), "t1w_to_dwi_mat");
        assert_eq!(Role::B0BrainMask.to_string(), "b0_brain_mask");
        assert_eq!(Role::from_str("template_to_t1w_warp").unwrap(), Role::TemplateToT1wWarp);
    }

    #[test]
    fn test_space_and_measure_names() {
        assert_eq!(Space::T1w.to_string(), "T1w");
        assert_eq!(Space::Dwi.to_string(), "dwi");
        assert_eq!(Measure::from_str("median").unwrap(), Measure::Median);
        assert!(Measure::from_str("mode").is_err());
        assert!(Measure::names().contains(&"std"));
    }
}
