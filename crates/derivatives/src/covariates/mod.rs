//! Per-session covariates.
//!
//! Every source produces the same record shape, a [`Covariate`] tagged with
//! its [`CovariateSource`]. Source specific collection lives in
//! [`temporal`], [`demographics`] and the quality control stage.

pub mod demographics;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use neuroflow_common::SessionContext;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::error::{PipelineError, Result};
use crate::traits::TabularSource;

pub use demographics::{CsvTableSource, Demographics, DemographicsConfig};

/// Format of session identifiers that encode the acquisition time
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M";
pub const SESSION_TIMESTAMP: &str = "session_timestamp";

#[derive(
    Debug, Clone, Copy,
    Serialize, Deserialize,
    Display, EnumString, EnumIter,
    PartialEq, Eq, PartialOrd, Ord, Hash
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CovariateSource {
    Demographics,
    QualityControl,
    Temporal,
}

/// A single covariate value. Serialized without a tag: `null`, a number,
/// a timestamp string or any other string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CovariateValue {
    Null,
    Number(f64),
    Timestamp(NaiveDateTime),
    Text(String),
}

impl CovariateValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Number when the cell parses as one, null when empty
    pub fn from_cell(cell: &str) -> Self {
        let cell = cell.trim();
        if cell.is_empty() {
            Self::Null
        } else if let Ok(value) = cell.parse::<f64>() {
            Self::Number(value)
        } else {
            Self::Text(cell.to_string())
        }
    }
}

impl From<Option<f64>> for CovariateValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Self::Null, Self::Number)
    }
}

/// Key → value record produced by one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Covariate {
    pub source: CovariateSource,
    pub values: BTreeMap<String, CovariateValue>,
}

impl Covariate {
    pub fn new(source: CovariateSource) -> Self {
        Self {
            source,
            values: BTreeMap::new(),
        }
    }

    /// Record with every key present and null
    pub fn nulls(source: CovariateSource, keys: &[&str]) -> Self {
        let mut covariate = Self::new(source);
        for key in keys {
            covariate.insert(*key, CovariateValue::Null);
        }
        covariate
    }

    pub fn insert(&mut self, key: impl Into<String>, value: CovariateValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&CovariateValue> {
        self.values.get(key)
    }
}

/// Two-dimensional table with named columns; cells are kept as text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabeledTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl LabeledTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        if let Some(row) = rows.iter().find(|row| row.len() != columns.len()) {
            return Err(PipelineError::InvalidRecord(format!(
                "row with {} cells in a table of {} columns",
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let columns = reader.headers()?.iter().map(str::to_string).collect();
        let rows = reader
            .records()
            .map(|record| Ok(record?.iter().map(str::to_string).collect()))
            .collect::<Result<Vec<Vec<String>>>>()?;
        Self::new(columns, rows)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[String]> {
        self.rows.iter().map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Acquisition time encoded in the session identifier
pub fn session_timestamp(ctx: &SessionContext) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(ctx.session(), TIMESTAMP_FORMAT).ok()
}

/// Covariates derived from the session identifier alone
pub fn temporal(ctx: &SessionContext) -> Covariate {
    let mut covariate = Covariate::new(CovariateSource::Temporal);
    let value = session_timestamp(ctx).map_or(CovariateValue::Null, CovariateValue::Timestamp);
    covariate.insert(SESSION_TIMESTAMP, value);
    covariate
}

/// All covariates of one session, as published next to the derivatives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCovariates {
    pub subject: String,
    pub session: String,
    pub covariates: Vec<Covariate>,
}

impl SessionCovariates {
    pub fn new(ctx: &SessionContext, covariates: Vec<Covariate>) -> Self {
        Self {
            subject: ctx.subject().to_string(),
            session: ctx.session().to_string(),
            covariates,
        }
    }

    pub fn get(&self, source: CovariateSource) -> Option<&Covariate> {
        self.covariates.iter().find(|covariate| covariate.source == source)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// A [`TabularSource`] reading a table already in memory
#[derive(Debug, Clone)]
pub struct StaticTable(pub LabeledTable);

impl TabularSource for StaticTable {
    fn load(&self) -> Result<LabeledTable> {
        Ok(self.0.clone())
    }
}

/// Location of a session's covariates file
pub fn covariates_path(directory: &Path, ctx: &SessionContext) -> PathBuf {
    directory.join(neuroflow_common::layout::covariates_name(ctx))
}
