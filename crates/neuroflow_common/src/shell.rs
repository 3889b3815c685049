use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{CommonError, Result};

/// Rounded, filtered subset of b-values selected for reconstruction.
///
/// Never empty: a `Shell` can only be obtained through [`ShellSelector::select`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shell {
    values: BTreeSet<u32>,
}

impl Shell {
    /// Representative max b-value, the one that appears in output names
    pub fn max(&self) -> u32 {
        // non-empty by construction
        self.values.iter().next_back().copied().unwrap_or_default()
    }

    pub fn values(&self) -> &BTreeSet<u32> {
        &self.values
    }

    pub fn contains(&self, bvalue: u32) -> bool {
        self.values.contains(&bvalue)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Shell {
    /// Comma separated, ascending (`0,1000`)
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

/// Filters raw b-values into a [`Shell`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellSelector {
    max_bvalue: Option<u32>,
    tolerance: u32,
}

impl ShellSelector {
    /// `max_bvalue = None` keeps every acquired shell (multi-shell mode)
    pub fn new(max_bvalue: Option<u32>, tolerance: u32) -> Self {
        Self { max_bvalue, tolerance }
    }

    pub fn select(&self, raw: &[f64]) -> Result<Shell> {
        let values: BTreeSet<u32> = raw
            .iter()
            .copied()
            .filter(|&bvalue| match self.max_bvalue {
                Some(max) => bvalue <= f64::from(max) + f64::from(self.tolerance),
                None => true,
            })
            .map(round_to_hundred)
            .collect();

        if values.is_empty() {
            return Err(CommonError::EmptyShell {
                max_bvalue: self.max_bvalue,
                tolerance: self.tolerance,
            });
        }
        Ok(Shell { values })
    }

    /// Read the bval file and select from it
    pub fn select_from_file(&self, bval_file: &Path) -> Result<Shell> {
        let raw = read_bvals(bval_file)?;
        self.select(&raw)
    }
}

/// Nearest multiple of 100, ties to even (`1050 -> 1000`, `1150 -> 1200`)
fn round_to_hundred(bvalue: f64) -> u32 {
    ((bvalue / 100.0).round_ties_even() * 100.0) as u32
}

/// Parse an FSL-style bval file: whitespace separated values on the first
/// non-empty line.
pub fn read_bvals(path: &Path) -> Result<Vec<f64>> {
    let content = fs::read_to_string(path)?;
    let line = content.lines().find(|line| !line.trim().is_empty()).unwrap_or("");
    parse_bvals(line).map_err(|reason| CommonError::InvalidBvals {
        path: path.to_path_buf(),
        reason,
    })
}

fn parse_bvals(line: &str) -> std::result::Result<Vec<f64>, String> {
    line.split_whitespace()
        .map(|token| {
            let value: f64 = token
                .parse()
                .map_err(|_| format!("{token:?} is not a number"))?;
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{token:?} is not a non-negative b-value"));
            }
            Ok(value)
        })
        .collect()
}
