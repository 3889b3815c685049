//! Atlas catalog and registration of atlases into subject space.

pub mod registration;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub use registration::{AtlasRegistrationStage, RegisteredAtlas, RegistrationReport};

const SCHAEFER_PARCELS: [u32; 10] = [100, 200, 300, 400, 500, 600, 700, 800, 900, 1000];
const SCHAEFER_NETWORKS: [u32; 2] = [7, 17];

/// An atlas as configured by the user. Relative paths are resolved against
/// the atlas root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AtlasSpec {
    pub id: String,
    pub reference: PathBuf,
    pub label_table: PathBuf,
    pub label_column: String,
}

/// Validated catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AtlasRecord {
    id: String,
    reference: PathBuf,
    label_table: PathBuf,
    label_column: String,
}

impl AtlasRecord {
    pub fn new(
        id: impl Into<String>,
        reference: impl Into<PathBuf>,
        label_table: impl Into<PathBuf>,
        label_column: impl Into<String>,
    ) -> Result<Self> {
        let record = Self {
            id: id.into(),
            reference: reference.into(),
            label_table: label_table.into(),
            label_column: label_column.into(),
        };
        record.validate()?;
        Ok(record)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(PipelineError::InvalidRecord(format!("atlas {:?}: {reason}", self.id)));

        if self.id.is_empty() || !self.id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return invalid("identifier must be non-empty and contain only [A-Za-z0-9_-]");
        }
        let reference = self.reference.to_string_lossy();
        if !(reference.ends_with(".nii.gz") || reference.ends_with(".nii")) {
            return invalid("reference must be a NIfTI image");
        }
        if self.label_table.file_name().is_none() {
            return invalid("label table must be a file");
        }
        if self.label_entity().is_empty() {
            return invalid("label column must contain at least one alphanumeric character");
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn reference(&self) -> &Path {
        &self.reference
    }

    pub fn label_table(&self) -> &Path {
        &self.label_table
    }

    pub fn label_column(&self) -> &str {
        &self.label_column
    }

    /// Reference file name without its leading `space-<template>_` entity,
    /// e.g. `atlas-fan2016_res-1mm_dseg.nii.gz`
    pub fn base_name(&self) -> String {
        let name = self
            .reference
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match name.strip_prefix("space-").and_then(|rest| rest.split_once('_')) {
            Some((_, base)) => base.to_string(),
            None => name,
        }
    }

    /// Value of the `label-{label}` file name entity
    pub fn label_entity(&self) -> String {
        self.label_column.chars().filter(char::is_ascii_alphanumeric).collect()
    }

    /// Label indices listed in the label table, in table order.
    ///
    /// Tab separated when the table ends in `.tsv`, comma separated otherwise.
    pub fn read_labels(&self) -> Result<Vec<i64>> {
        let table_error = |reason: String| PipelineError::LabelTable {
            path: self.label_table.clone(),
            reason,
        };
        let delimiter = if self.label_table.extension().is_some_and(|ext| ext == "tsv") {
            b'\t'
        } else {
            b','
        };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .from_path(&self.label_table)?;

        let column = reader
            .headers()?
            .iter()
            .position(|header| header.trim() == self.label_column)
            .ok_or_else(|| table_error(format!("no column {:?}", self.label_column)))?;

        let mut labels = Vec::new();
        for record in reader.records() {
            let record = record?;
            let raw = record.get(column).unwrap_or("").trim();
            let value: f64 = raw
                .parse()
                .map_err(|_| table_error(format!("label {raw:?} is not a number")))?;
            if value.fract() != 0.0 {
                return Err(table_error(format!("label {raw:?} is not an integer")));
            }
            labels.push(value as i64);
        }
        if labels.is_empty() {
            return Err(table_error("table has no labels".to_string()));
        }
        Ok(labels)
    }
}

/// Immutable catalog of atlases, built once at startup and shared by
/// reference.
#[derive(Debug, Clone, Default)]
pub struct AtlasRegistry {
    atlases: BTreeMap<String, Arc<AtlasRecord>>,
}

impl AtlasRegistry {
    pub fn from_records(records: impl IntoIterator<Item = AtlasRecord>) -> Result<Self> {
        let mut atlases = BTreeMap::new();
        for record in records {
            let id = record.id.clone();
            if atlases.insert(id.clone(), Arc::new(record)).is_some() {
                return Err(PipelineError::InvalidRecord(format!("duplicate atlas {id:?}")));
            }
        }
        Ok(Self { atlases })
    }

    /// Built-in catalog with image and table paths under `atlas_root`
    pub fn builtin(atlas_root: &Path) -> Result<Self> {
        let mut records = vec![
            family_record(atlas_root, "fan2016", "fan2016", "", "Label")?,
            family_record(atlas_root, "huang2022", "huang2022", "", "HCPex_label")?,
        ];
        for parcels in SCHAEFER_PARCELS {
            for networks in SCHAEFER_NETWORKS {
                records.push(family_record(
                    atlas_root,
                    &format!("schaefer2018_{parcels}_{networks}"),
                    "schaefer2018",
                    &format!("_den-{parcels}_desc-{networks}networks"),
                    "index",
                )?);
            }
        }
        Self::from_records(records)
    }

    /// Registry extended with user supplied atlases
    pub fn with_custom(self, specs: &[AtlasSpec], atlas_root: &Path) -> Result<Self> {
        let custom = specs
            .iter()
            .map(|spec| {
                AtlasRecord::new(
                    spec.id.clone(),
                    atlas_root.join(&spec.reference),
                    atlas_root.join(&spec.label_table),
                    spec.label_column.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let existing = self.atlases.into_values().map(Arc::unwrap_or_clone);
        Self::from_records(existing.chain(custom))
    }

    pub fn get(&self, id: &str) -> Result<&Arc<AtlasRecord>> {
        self.atlases
            .get(id)
            .ok_or_else(|| PipelineError::InvalidAtlas(id.to_string()))
    }

    /// Records for `ids`, or the whole catalog when no selection is given.
    /// Unknown identifiers fail before anything else happens.
    pub fn select(&self, ids: Option<&[String]>) -> Result<Vec<Arc<AtlasRecord>>> {
        match ids {
            Some(ids) => ids.iter().map(|id| self.get(id).cloned()).collect(),
            None => Ok(self.atlases.values().cloned().collect()),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.atlases.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &Arc<AtlasRecord>> {
        self.atlases.values()
    }

    pub fn len(&self) -> usize {
        self.atlases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atlases.is_empty()
    }
}

fn family_record(root: &Path, id: &str, family: &str, entities: &str, label_column: &str) -> Result<AtlasRecord> {
    let stem = format!("space-MNI152_atlas-{family}_res-1mm{entities}_dseg");
    let dir = root.join(family).join("MNI152");
    AtlasRecord::new(
        id,
        dir.join(format!("{stem}.nii.gz")),
        dir.join(format!("{stem}.csv")),
        label_column,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let registry = AtlasRegistry::builtin(Path::new("/atlases")).unwrap();
        assert_eq!(registry.len(), 2 + 20);

        let fan = registry.get("fan2016").unwrap();
        assert_eq!(
            fan.reference(),
            Path::new("/atlases/fan2016/MNI152/space-MNI152_atlas-fan2016_res-1mm_dseg.nii.gz")
        );
        assert_eq!(fan.base_name(), "atlas-fan2016_res-1mm_dseg.nii.gz");
        assert_eq!(fan.label_entity(), "Label");

        let schaefer = registry.get("schaefer2018_400_17").unwrap();
        assert_eq!(
            schaefer.base_name(),
            "atlas-schaefer2018_res-1mm_den-400_desc-17networks_dseg.nii.gz"
        );
        assert_eq!(registry.get("huang2022").unwrap().label_entity(), "HCPexlabel");
    }

    #[test]
    fn test_unknown_atlas_is_rejected() {
        let registry = AtlasRegistry::builtin(Path::new("/atlases")).unwrap();
        let selection = vec!["fan2016".to_string(), "not_a_real_atlas".to_string()];
        assert!(matches!(
            registry.select(Some(&selection)),
            Err(PipelineError::InvalidAtlas(id)) if id == "not_a_real_atlas"
        ));
        assert_eq!(registry.select(None).unwrap().len(), registry.len());
    }

    #[test]
    fn test_record_validation() {
        assert!(AtlasRecord::new("ok", "a.nii.gz", "a.csv", "index").is_ok());
        assert!(AtlasRecord::new("", "a.nii.gz", "a.csv", "index").is_err());
        assert!(AtlasRecord::new("bad id", "a.nii.gz", "a.csv", "index").is_err());
        assert!(AtlasRecord::new("ok", "a.png", "a.csv", "index").is_err());
        assert!(AtlasRecord::new("ok", "a.nii.gz", "a.csv", "__").is_err());
    }

    #[test]
    fn test_custom_atlases_are_appended() {
        let registry = AtlasRegistry::builtin(Path::new("/atlases"))
            .unwrap()
            .with_custom(
                &[AtlasSpec {
                    id: "lab".to_string(),
                    reference: PathBuf::from("lab/space-MNI152_atlas-lab_dseg.nii.gz"),
                    label_table: PathBuf::from("lab/labels.tsv"),
                    label_column: "roi".to_string(),
                }],
                Path::new("/atlases"),
            )
            .unwrap();
        assert_eq!(registry.len(), 23);
        assert_eq!(registry.get("lab").unwrap().label_table(), Path::new("/atlases/lab/labels.tsv"));

        let duplicate = AtlasSpec {
            id: "fan2016".to_string(),
            reference: PathBuf::from("x.nii.gz"),
            label_table: PathBuf::from("x.csv"),
            label_column: "index".to_string(),
        };
        assert!(registry.with_custom(&[duplicate], Path::new("/atlases")).is_err());
    }

    #[test]
    fn test_read_labels() {
        let dir = tempfile::tempdir().unwrap();
        let csv_table = dir.path().join("labels.csv");
        std::fs::write(&csv_table, "index,name\n1,left\n2,right\n4,stem\n").unwrap();
        let record = AtlasRecord::new("toy", dir.path().join("toy.nii.gz"), &csv_table, "index").unwrap();
        assert_eq!(record.read_labels().unwrap(), vec![1, 2, 4]);

        let tsv_table = dir.path().join("labels.tsv");
        std::fs::write(&tsv_table, "name\tLabel\nleft\t1.0\nright\t2\n").unwrap();
        let record = AtlasRecord::new("toy", dir.path().join("toy.nii.gz"), &tsv_table, "Label").unwrap();
        assert_eq!(record.read_labels().unwrap(), vec![1, 2]);

        let record = AtlasRecord::new("toy", dir.path().join("toy.nii.gz"), &tsv_table, "missing").unwrap();
        assert!(matches!(record.read_labels(), Err(PipelineError::LabelTable { .. })));
    }
}
