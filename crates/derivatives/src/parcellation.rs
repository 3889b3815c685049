use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use neuroflow_common::layout::{ParcellationKey, parcellation_path};
use neuroflow_common::{Measure, SessionContext, Space, stage_directory};
use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

use crate::atlases::RegisteredAtlas;
use crate::cache::{self, CacheStatus};
use crate::error::{PipelineError, Result};
use crate::pipeline::Toolbox;
use crate::tensors::TensorMaps;
use crate::traits::OutputCache;

pub const DIRECTORY_NAME: &str = "parcellations";

/// Regional statistics of one metric within the labels of one atlas.
///
/// One row per label, the label column first and one column per measure.
#[derive(Debug, Clone, PartialEq)]
pub struct ParcellationTable {
    label_column: String,
    labels: Vec<i64>,
    columns: BTreeMap<Measure, Vec<f64>>,
}

impl ParcellationTable {
    pub fn new(label_column: impl Into<String>, labels: Vec<i64>) -> Self {
        Self {
            label_column: label_column.into(),
            labels,
            columns: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, measure: Measure, values: Vec<f64>) -> Result<()> {
        if values.len() != self.labels.len() {
            return Err(PipelineError::InvalidRecord(format!(
                "{} values for {} labels",
                values.len(),
                self.labels.len()
            )));
        }
        self.columns.insert(measure, values);
        Ok(())
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    pub fn measures(&self) -> impl Iterator<Item = Measure> + '_ {
        self.columns.keys().copied()
    }

    pub fn column(&self, measure: Measure) -> Option<&[f64]> {
        self.columns.get(&measure).map(Vec::as_slice)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;

        let mut header = vec![self.label_column.clone()];
        header.extend(self.columns.keys().map(|measure| measure.to_string()));
        writer.write_record(&header)?;

        for (row, label) in self.labels.iter().enumerate() {
            let mut record = vec![label.to_string()];
            record.extend(self.columns.values().map(|values| values[row].to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let label_column = headers.get(0).unwrap_or_default().to_string();
        let measures = headers
            .iter()
            .skip(1)
            .map(|name| Measure::from_str(name).map_err(|_| PipelineError::InvalidMeasure(name.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let mut table = Self::new(label_column, Vec::new());
        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); measures.len()];
        for record in reader.records() {
            let record = record?;
            let parse_error = |raw: &str| PipelineError::LabelTable {
                path: path.to_path_buf(),
                reason: format!("{raw:?} is not a number"),
            };
            let label = record.get(0).unwrap_or_default();
            table.labels.push(label.parse().map_err(|_| parse_error(label))?);
            for (column, raw) in columns.iter_mut().zip(record.iter().skip(1)) {
                column.push(raw.parse().map_err(|_| parse_error(raw))?);
            }
        }
        table.columns = measures.into_iter().zip(columns).collect();
        Ok(table)
    }

    /// Validity predicate of a cached table: its rows are exactly `labels`
    /// and it holds every requested measure
    pub fn is_complete(path: &Path, labels: &[i64], measures: &[Measure]) -> bool {
        match Self::read_csv(path) {
            Ok(table) => {
                table.labels == labels && measures.iter().all(|measure| table.columns.contains_key(measure))
            }
            Err(e) => {
                debug!("Cached table {} unreadable: {}", path.display(), e);
                false
            }
        }
    }
}

/// One produced or reused table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParcellationOutput {
    pub atlas: String,
    pub metric: String,
    pub path: PathBuf,
    pub status: CacheStatus,
}

/// A (atlas, metric) pair whose table could not be produced
#[derive(Debug)]
pub struct ParcellationFailure {
    pub atlas: String,
    pub metric: String,
    pub error: PipelineError,
}

/// Tables of one stage run. Pairs fail independently.
#[derive(Debug, Default)]
pub struct ParcellationReport {
    pub outputs: Vec<ParcellationOutput>,
    pub failures: Vec<ParcellationFailure>,
}

/// Parse measure names; `None` selects every measure
pub fn parse_measures(names: Option<&[String]>) -> Result<Vec<Measure>> {
    let mut measures = match names {
        Some(names) => names
            .iter()
            .map(|name| Measure::from_str(name).map_err(|_| PipelineError::InvalidMeasure(name.clone())))
            .collect::<Result<Vec<_>>>()?,
        None => Measure::iter().collect(),
    };
    measures.sort();
    measures.dedup();
    if measures.is_empty() {
        return Err(PipelineError::InvalidMeasure("no measure requested".to_string()));
    }
    Ok(measures)
}

/// Regional statistics for every (diffusion-space atlas, metric) pair.
///
/// A cached table is reused only when it already holds every requested
/// measure; otherwise the whole table is recomputed with the requested
/// measures.
pub struct ParcellationStage<'a> {
    ctx: &'a SessionContext,
    atlases: &'a [RegisteredAtlas],
    tensors: &'a TensorMaps,
    metrics: Vec<String>,
    measures: Vec<Measure>,
    tools: &'a Toolbox,
    cache: &'a dyn OutputCache,
    output_dir: PathBuf,
}

impl<'a> ParcellationStage<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &'a SessionContext,
        atlases: &'a [RegisteredAtlas],
        tensors: &'a TensorMaps,
        measures: Option<&[String]>,
        metrics: Option<&[String]>,
        tools: &'a Toolbox,
        cache: &'a dyn OutputCache,
        output_directory: &Path,
    ) -> Result<Self> {
        let measures = parse_measures(measures)?;
        let metrics = match metrics {
            Some(requested) => {
                if let Some(unknown) = requested.iter().find(|metric| tensors.get(metric).is_none()) {
                    return Err(PipelineError::InvalidMetric {
                        metric: unknown.clone(),
                        software: tensors.software.clone(),
                    });
                }
                requested.to_vec()
            }
            None => tensors.metrics.keys().cloned().collect(),
        };
        if let Some(atlas) = atlases.iter().find(|atlas| atlas.space != Space::Dwi) {
            return Err(PipelineError::InvalidRecord(format!(
                "atlas {} is in {} space, parcellation needs diffusion space",
                atlas.id(),
                atlas.space
            )));
        }

        Ok(Self {
            ctx,
            atlases,
            tensors,
            metrics,
            measures,
            tools,
            cache,
            output_dir: stage_directory(output_directory, ctx, DIRECTORY_NAME),
        })
    }

    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }

    pub fn output_path(&self, atlas: &RegisteredAtlas, metric: &str) -> PathBuf {
        let label = atlas.record.label_entity();
        self.output_dir.join(parcellation_path(
            self.ctx,
            ParcellationKey {
                atlas: atlas.id(),
                label: &label,
                max_bvalue: self.tensors.max_bvalue,
                software: &self.tensors.software,
                metric,
            },
        ))
    }

    pub fn run(&self, force: bool) -> ParcellationReport {
        let mut report = ParcellationReport {
            outputs: Vec::with_capacity(self.atlases.len() * self.metrics.len()),
            failures: Vec::new(),
        };
        for atlas in self.atlases {
            for metric in &self.metrics {
                match self.parcellate(atlas, metric, force) {
                    Ok(output) => report.outputs.push(output),
                    Err(e) => {
                        warn!("Parcellation of {} by {} failed: {}", metric, atlas.id(), e);
                        report.failures.push(ParcellationFailure {
                            atlas: atlas.id().to_string(),
                            metric: metric.clone(),
                            error: e,
                        });
                    }
                }
            }
        }
        report
    }

    fn parcellate(&self, atlas: &RegisteredAtlas, metric: &str, force: bool) -> Result<ParcellationOutput> {
        let path = self.output_path(atlas, metric);
        let targets = [path.clone()];
        let labels = atlas.record.read_labels()?;
        let complete = |table: &Path| ParcellationTable::is_complete(table, &labels, &self.measures);

        let status = cache::lookup(self.cache, &targets, force, &complete)?;
        if status.is_hit() {
            info!("Parcellation of {} by {} already complete", metric, atlas.id());
        } else {
            if path.exists() {
                debug!("Cached table {} is stale; recomputing", path.display());
            }
            let table = self.compute_table(atlas, metric, labels.clone())?;
            self.cache.publish(&targets, &mut |staged| table.write_csv(&staged[0]))?;
            info!("Parcellated {} by {}", metric, atlas.id());
        }

        Ok(ParcellationOutput {
            atlas: atlas.id().to_string(),
            metric: metric.to_string(),
            path,
            status,
        })
    }

    fn compute_table(&self, atlas: &RegisteredAtlas, metric: &str, labels: Vec<i64>) -> Result<ParcellationTable> {
        let metric_image = self.tensors.get(metric).ok_or_else(|| PipelineError::InvalidMetric {
            metric: metric.to_string(),
            software: self.tensors.software.clone(),
        })?;
        let mut table = ParcellationTable::new(atlas.record.label_column(), labels);

        for &measure in &self.measures {
            let values = self
                .tools
                .region_statistics
                .region_values(metric_image, &atlas.path, measure)?;
            let column = table
                .labels()
                .iter()
                .map(|&label| match usize::try_from(label - 1) {
                    Ok(index) => values.get(index).copied().unwrap_or(f64::NAN),
                    Err(_) => f64::NAN,
                })
                .collect();
            table.insert(measure, column)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlases::AtlasRegistrationStage;
    use crate::cache::FilesystemCache;
    use crate::tensors::TensorReconstructionStage;
    use crate::testing::{FakeTools, SessionFixture};
    use neuroflow_common::ShellSelector;

    struct Upstream {
        atlases: Vec<RegisteredAtlas>,
        tensors: TensorMaps,
    }

    fn upstream(fixture: &SessionFixture, tools: &Toolbox) -> Upstream {
        let files = fixture.files();
        let registry = fixture.registry();
        let registration = AtlasRegistrationStage::new(
            fixture.ctx(),
            &files,
            &registry,
            None,
            tools,
            &FilesystemCache,
            fixture.output_root(),
        )
        .unwrap();
        let atlases = registration.run(false).in_space(Space::Dwi);
        let tensors = TensorReconstructionStage::new(
            fixture.ctx(),
            &files,
            ShellSelector::new(Some(1000), 50),
            tools,
            &FilesystemCache,
            fixture.output_root(),
        )
        .unwrap()
        .run(false)
        .unwrap();
        Upstream { atlases, tensors }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_table_per_atlas_and_metric() {
        let fixture = SessionFixture::new();
        let (tools, log) = FakeTools::toolbox();
        let upstream = upstream(&fixture, &tools);
        let measures = strings(&["mean"]);

        let stage = ParcellationStage::new(
            fixture.ctx(),
            &upstream.atlases,
            &upstream.tensors,
            Some(measures.as_slice()),
            None,
            &tools,
            &FilesystemCache,
            fixture.output_root(),
        )
        .unwrap();
        let outputs = stage.run(false).outputs;
        assert_eq!(outputs.len(), 2 * upstream.tensors.metrics.len());
        assert!(outputs.iter().all(|out| out.path.exists() && out.status == CacheStatus::Miss));

        let toy_fa = outputs.iter().find(|o| o.atlas == "toy" && o.metric == "fa").unwrap();
        assert!(toy_fa.path.ends_with(
            "parcellations/toy/sub-0001_ses-202301011200_space-dwi_label-index_acq-shell1000_rec-fake_atlas-toy_desc-fa_parc.csv"
        ));

        let table = ParcellationTable::read_csv(&toy_fa.path).unwrap();
        assert_eq!(table.labels(), &[1, 2, 3]);
        assert_eq!(table.column(Measure::Mean).unwrap(), &[1.0, 2.0, 3.0]);

        let calls = log.count("region_values");
        assert!(stage.run(false).failures.is_empty());
        assert_eq!(log.count("region_values"), calls);
    }

    #[test]
    fn test_new_measure_recomputes_whole_table() {
        let fixture = SessionFixture::new();
        let (tools, log) = FakeTools::toolbox();
        let upstream = upstream(&fixture, &tools);
        let metrics = strings(&["fa"]);
        let atlases = &upstream.atlases[..1];

        let mean = strings(&["mean"]);
        let first = ParcellationStage::new(
            fixture.ctx(),
            atlases,
            &upstream.tensors,
            Some(mean.as_slice()),
            Some(metrics.as_slice()),
            &tools,
            &FilesystemCache,
            fixture.output_root(),
        )
        .unwrap()
        .run(false)
        .outputs;
        assert_eq!(log.count("region_values"), 1);

        let both = strings(&["median", "mean"]);
        let second = ParcellationStage::new(
            fixture.ctx(),
            atlases,
            &upstream.tensors,
            Some(both.as_slice()),
            Some(metrics.as_slice()),
            &tools,
            &FilesystemCache,
            fixture.output_root(),
        )
        .unwrap()
        .run(false)
        .outputs;
        assert_eq!(second[0].status, CacheStatus::Miss);
        assert_eq!(second[0].path, first[0].path);
        assert_eq!(log.count("region_values"), 3, "both measures recomputed");

        let table = ParcellationTable::read_csv(&second[0].path).unwrap();
        assert_eq!(table.measures().collect::<Vec<_>>(), vec![Measure::Mean, Measure::Median]);

        // a subset of what is cached is a hit
        let third = ParcellationStage::new(
            fixture.ctx(),
            atlases,
            &upstream.tensors,
            Some(mean.as_slice()),
            Some(metrics.as_slice()),
            &tools,
            &FilesystemCache,
            fixture.output_root(),
        )
        .unwrap()
        .run(false)
        .outputs;
        assert_eq!(third[0].status, CacheStatus::Hit);
    }

    #[test]
    fn test_edited_label_table_recomputes() {
        let fixture = SessionFixture::new();
        let (tools, log) = FakeTools::toolbox();
        let upstream = upstream(&fixture, &tools);
        let metrics = strings(&["fa"]);
        let atlases = &upstream.atlases[..1];
        let stage = ParcellationStage::new(
            fixture.ctx(),
            atlases,
            &upstream.tensors,
            None,
            Some(metrics.as_slice()),
            &tools,
            &FilesystemCache,
            fixture.output_root(),
        )
        .unwrap();

        stage.run(false);
        let calls = log.count("region_values");
        std::fs::write(atlases[0].record.label_table(), "index,name\n1,left\n2,right\n").unwrap();

        let rerun = stage.run(false).outputs;
        assert_eq!(rerun[0].status, CacheStatus::Miss);
        assert_eq!(log.count("region_values"), 2 * calls);
        assert_eq!(ParcellationTable::read_csv(&rerun[0].path).unwrap().labels(), &[1, 2]);
    }

    #[test]
    fn test_failed_pair_does_not_stop_the_others() {
        let fixture = SessionFixture::new();
        let (tools, log) = FakeTools::toolbox();
        let upstream = upstream(&fixture, &tools);
        log.fail_on("region_values:desc-md");

        let report = ParcellationStage::new(
            fixture.ctx(),
            &upstream.atlases,
            &upstream.tensors,
            None,
            None,
            &tools,
            &FilesystemCache,
            fixture.output_root(),
        )
        .unwrap()
        .run(false);

        assert_eq!(report.failures.len(), 2, "md fails for both atlases");
        assert!(report.failures.iter().all(|failure| failure.metric == "md"));
        assert!(matches!(report.failures[0].error, PipelineError::Tool(_)));
        assert_eq!(report.outputs.len(), 2 * (upstream.tensors.metrics.len() - 1));
        assert!(report.outputs.iter().all(|out| out.path.exists()));
    }

    #[test]
    fn test_unknown_measure_and_metric() {
        let fixture = SessionFixture::new();
        let (tools, _) = FakeTools::toolbox();
        let upstream = upstream(&fixture, &tools);

        let result = ParcellationStage::new(
            fixture.ctx(),
            &upstream.atlases,
            &upstream.tensors,
            Some(strings(&["mean", "mode"]).as_slice()),
            None,
            &tools,
            &FilesystemCache,
            fixture.output_root(),
        );
        assert!(matches!(result, Err(PipelineError::InvalidMeasure(m)) if m == "mode"));

        let result = ParcellationStage::new(
            fixture.ctx(),
            &upstream.atlases,
            &upstream.tensors,
            None,
            Some(strings(&["kurtosis"]).as_slice()),
            &tools,
            &FilesystemCache,
            fixture.output_root(),
        );
        assert!(matches!(result, Err(PipelineError::InvalidMetric { .. })));
    }

    #[test]
    fn test_missing_labels_are_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        let mut table = ParcellationTable::new("index", vec![1, 2]);
        table.insert(Measure::Max, vec![4.0, f64::NAN]).unwrap();
        table.write_csv(&path).unwrap();

        let read = ParcellationTable::read_csv(&path).unwrap();
        assert_eq!(read.column(Measure::Max).unwrap()[0], 4.0);
        assert!(read.column(Measure::Max).unwrap()[1].is_nan());
        assert!(ParcellationTable::is_complete(&path, &[1, 2], &[Measure::Max]));
        assert!(!ParcellationTable::is_complete(&path, &[1, 2], &[Measure::Max, Measure::Std]));
        assert!(!ParcellationTable::is_complete(&path, &[1, 2, 3], &[Measure::Max]));
        assert!(table.insert(Measure::Min, vec![1.0]).is_err());
    }
}
