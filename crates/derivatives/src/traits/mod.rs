use std::path::{Path, PathBuf};

use crate::covariates::LabeledTable;
use crate::error::Result;

/// Validity predicate applied to every expected output on a cache lookup
pub type Validity<'a> = &'a dyn Fn(&Path) -> bool;

/// Storage of stage outputs.
///
/// Stages never check or write their outputs directly: they ask the cache
/// whether the deterministic output set is valid, and publish new outputs
/// through it so a reader never sees a partially written file.
pub trait OutputCache: Send + Sync {
    /// Every output exists and satisfies `validity`
    fn has_valid_output(&self, outputs: &[PathBuf], validity: Validity<'_>) -> bool;

    /// Remove outputs; missing ones are not an error
    fn invalidate(&self, outputs: &[PathBuf]) -> Result<()>;

    /// Run `produce` against staging paths standing in for `targets` and move
    /// them into place only once it succeeded.
    ///
    /// Staging paths keep the file (or directory) name of their target, so
    /// tools that infer a format from the extension behave the same.
    fn publish(
        &self,
        targets: &[PathBuf],
        produce: &mut dyn FnMut(&[PathBuf]) -> Result<()>,
    ) -> Result<()>;
}

/// Remote or exported two-dimensional table (e.g. a case report form)
pub trait TabularSource: Send + Sync {
    fn load(&self) -> Result<LabeledTable>;
}
