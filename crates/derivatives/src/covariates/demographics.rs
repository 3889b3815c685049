use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::NaiveDate;
use neuroflow_common::SessionContext;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::covariates::{Covariate, CovariateSource, CovariateValue, LabeledTable, session_timestamp};
use crate::error::Result;
use crate::traits::TabularSource;

pub const AGE_AT_SCAN: &str = "age_at_scan";

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y-%m-%d %H:%M:%S", "%d.%m.%Y"];

/// CSV export of a case report form
#[derive(Debug, Clone)]
pub struct CsvTableSource {
    path: PathBuf,
}

impl CsvTableSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TabularSource for CsvTableSource {
    fn load(&self) -> Result<LabeledTable> {
        debug!("Loading demographics from {}", self.path.display());
        LabeledTable::from_csv(&self.path)
    }
}

fn default_subject_column() -> String {
    "Questionnaire".to_string()
}

fn default_dob_column() -> String {
    "dob".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DemographicsConfig {
    /// CSV export of the demographics table
    pub table: PathBuf,
    /// Column holding the subject identifier
    #[serde(default = "default_subject_column")]
    pub subject_column: String,
    /// Date of birth column, used for `age_at_scan`
    #[serde(default = "default_dob_column")]
    pub dob_column: String,
    /// Columns to keep, mapped to their covariate name
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

/// Normalized form of a subject identifier as typed in the form:
/// lowercase, zero padded to four characters, underscores dropped
pub fn normalize_subject_id(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let (sign, digits) = match lower.strip_prefix(['-', '+']) {
        Some(rest) => (&lower[..1], rest),
        None => ("", lower.as_str()),
    };
    let width = 4usize.saturating_sub(lower.chars().count());
    format!("{sign}{}{digits}", "0".repeat(width)).replace('_', "")
}

/// Demographic covariates of a study.
///
/// The table is loaded from its source on first use and kept; whether that
/// happened is visible through [`Demographics::is_loaded`].
pub struct Demographics {
    source: Box<dyn TabularSource>,
    subject_column: String,
    dob_column: String,
    columns: BTreeMap<String, String>,
    table: OnceLock<LabeledTable>,
}

impl Demographics {
    pub fn new(source: Box<dyn TabularSource>, config: &DemographicsConfig) -> Self {
        Self {
            source,
            subject_column: config.subject_column.clone(),
            dob_column: config.dob_column.clone(),
            columns: config.columns.clone(),
            table: OnceLock::new(),
        }
    }

    pub fn from_config(config: &DemographicsConfig) -> Self {
        Self::new(Box::new(CsvTableSource::new(config.table.clone())), config)
    }

    pub fn is_loaded(&self) -> bool {
        self.table.get().is_some()
    }

    pub fn table(&self) -> Result<&LabeledTable> {
        if let Some(table) = self.table.get() {
            return Ok(table);
        }
        let loaded = self.source.load()?;
        Ok(self.table.get_or_init(|| loaded))
    }

    /// Row of `subject`, compared after normalization on both sides
    pub fn subject_row(&self, subject: &str) -> Result<Option<&[String]>> {
        let table = self.table()?;
        let Some(column) = table.column_index(&self.subject_column) else {
            warn!("Demographics table has no column {:?}", self.subject_column);
            return Ok(None);
        };
        let wanted = normalize_subject_id(subject);
        Ok(table
            .rows()
            .find(|row| normalize_subject_id(&row[column]) == wanted))
    }

    /// Configured columns of the subject's row, renamed, plus `age_at_scan`.
    /// Every configured key is present; values are null when the subject or
    /// the cell is missing.
    pub fn covariates(&self, ctx: &SessionContext) -> Result<Covariate> {
        let mut covariate = Covariate::new(CovariateSource::Demographics);
        for name in self.columns.values() {
            covariate.insert(name.clone(), CovariateValue::Null);
        }
        covariate.insert(AGE_AT_SCAN, CovariateValue::Null);

        let Some(row) = self.subject_row(ctx.subject())? else {
            warn!("Subject {} not found in demographics", ctx.subject());
            return Ok(covariate);
        };
        let table = self.table()?;

        for (original, renamed) in &self.columns {
            if let Some(index) = table.column_index(original) {
                covariate.insert(renamed.clone(), CovariateValue::from_cell(&row[index]));
            }
        }

        let dob = table
            .column_index(&self.dob_column)
            .and_then(|index| parse_date(&row[index]));
        if let (Some(dob), Some(scan)) = (dob, session_timestamp(ctx)) {
            let days = (scan.date() - dob).num_days();
            covariate.insert(AGE_AT_SCAN, CovariateValue::Number(days as f64 / 365.25));
        }
        Ok(covariate)
    }
}

fn parse_date(cell: &str) -> Option<NaiveDate> {
    let cell = cell.trim();
    DATE_FORMATS.iter().find_map(|format| {
        NaiveDate::parse_from_str(cell, format)
            .ok()
            .or_else(|| chrono::NaiveDateTime::parse_from_str(cell, format).ok().map(|dt| dt.date()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariates::StaticTable;
    use crate::error::PipelineError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn table() -> LabeledTable {
        let columns = ["Questionnaire", "dob", "Sex", "Height"].map(String::from).to_vec();
        let rows = vec![
            ["1", "1990-01-15", "F", "170"].map(String::from).to_vec(),
            ["00_42", "", "M", ""].map(String::from).to_vec(),
        ];
        LabeledTable::new(columns, rows).unwrap()
    }

    fn config() -> DemographicsConfig {
        DemographicsConfig {
            table: PathBuf::from("unused.csv"),
            subject_column: default_subject_column(),
            dob_column: default_dob_column(),
            columns: BTreeMap::from([
                ("Sex".to_string(), "sex".to_string()),
                ("Height".to_string(), "height".to_string()),
            ]),
        }
    }

    struct CountingSource {
        loads: Arc<AtomicUsize>,
    }

    impl TabularSource for CountingSource {
        fn load(&self) -> Result<LabeledTable> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(table())
        }
    }

    #[test]
    fn test_normalize_subject_id() {
        assert_eq!(normalize_subject_id("1"), "0001");
        assert_eq!(normalize_subject_id("0042"), "0042");
        assert_eq!(normalize_subject_id("00_42"), "0042");
        assert_eq!(normalize_subject_id("AB12"), "ab12");
        assert_eq!(normalize_subject_id("12345"), "12345");
    }

    #[test]
    fn test_covariates_of_subject() {
        let demographics = Demographics::new(Box::new(StaticTable(table())), &config());
        let ctx = SessionContext::new("0001", "202001150900", "/in").unwrap();
        let covariate = demographics.covariates(&ctx).unwrap();

        assert_eq!(covariate.source, CovariateSource::Demographics);
        assert_eq!(covariate.get("sex"), Some(&CovariateValue::Text("F".to_string())));
        assert_eq!(covariate.get("height"), Some(&CovariateValue::Number(170.0)));
        let age = covariate.get(AGE_AT_SCAN).and_then(CovariateValue::as_f64).unwrap();
        assert!((age - 30.0).abs() < 0.01, "age {age}");
    }

    #[test]
    fn test_missing_values_are_null() {
        let demographics = Demographics::new(Box::new(StaticTable(table())), &config());

        let ctx = SessionContext::new("0042", "202001150900", "/in").unwrap();
        let covariate = demographics.covariates(&ctx).unwrap();
        assert_eq!(covariate.get("sex"), Some(&CovariateValue::Text("M".to_string())));
        assert!(covariate.get("height").unwrap().is_null());
        assert!(covariate.get(AGE_AT_SCAN).unwrap().is_null());

        let unknown = SessionContext::new("9999", "202001150900", "/in").unwrap();
        let covariate = demographics.covariates(&unknown).unwrap();
        assert_eq!(covariate.values.len(), 3);
        assert!(covariate.values.values().all(CovariateValue::is_null));
    }

    #[test]
    fn test_table_is_loaded_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let demographics = Demographics::new(
            Box::new(CountingSource { loads: Arc::clone(&loads) }),
            &config(),
        );
        assert!(!demographics.is_loaded());

        for subject in ["0001", "0042"] {
            let ctx = SessionContext::new(subject, "202001150900", "/in").unwrap();
            demographics.covariates(&ctx).unwrap();
        }
        assert!(demographics.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_csv_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crf.csv");
        std::fs::write(&path, "Questionnaire,dob\n7,2000-01-01\n").unwrap();
        let table = CsvTableSource::new(&path).load().unwrap();
        assert_eq!(table.columns(), ["Questionnaire", "dob"]);

        let missing = CsvTableSource::new(dir.path().join("absent.csv")).load();
        assert!(matches!(missing, Err(PipelineError::Csv(_))));
    }
}
