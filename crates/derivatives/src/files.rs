use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use neuroflow_common::Role;
use strum::IntoEnumIterator;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Glob pattern (relative to the session input root) used when a role is not
/// configured explicitly
pub fn default_pattern(role: Role) -> &'static str {
    match role {
        Role::T1w => "anat/*_desc-preproc_T1w.nii.gz",
        Role::T1wBrain => "anat/*_desc-brain_T1w.nii.gz",
        Role::T1wBrainMask => "anat/*_desc-brain_mask.nii.gz",
        Role::TemplateToT1wWarp => "anat/*_from-MNI152NLin2009cAsym_to-T1w_mode-image_xfm.nii.gz",
        Role::B0Brain => "dwi/*_desc-brain_b0ref.nii.gz",
        Role::B0BrainMask => "dwi/*_desc-brain_mask.nii.gz",
        Role::T1wToDwiMat => "dwi/*_from-T1w_to-dwi_mode-image_xfm.mat",
        Role::DwiFile => "dwi/data.nii.gz",
        Role::BvalFile => "dwi/data.nii.gz.bval",
        Role::BvecFile => "dwi/data.nii.gz.bvec",
        Role::IndexFile => "dwi/index.txt",
        Role::ParamFile => "dwi/acqp.txt",
    }
}

/// Resolved role → path mapping. Created once per run, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    files: BTreeMap<Role, PathBuf>,
}

impl FileSet {
    pub fn from_map(files: BTreeMap<Role, PathBuf>) -> Self {
        Self { files }
    }

    pub fn get(&self, role: Role) -> Result<&Path> {
        self.files
            .get(&role)
            .map(PathBuf::as_path)
            .ok_or(PipelineError::UnresolvedRole(role))
    }

    /// Fail fast when any of `roles` is absent
    pub fn require(&self, roles: &[Role]) -> Result<()> {
        match roles.iter().find(|role| !self.files.contains_key(role)) {
            Some(&role) => Err(PipelineError::UnresolvedRole(role)),
            None => Ok(()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Role, &Path)> {
        self.files.iter().map(|(role, path)| (*role, path.as_path()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Maps a session input root to its required files via glob patterns.
///
/// Each requested role must match exactly one file; zero or several matches
/// are both errors.
#[derive(Debug, Clone)]
pub struct FileResolver {
    root: PathBuf,
    patterns: BTreeMap<Role, String>,
}

impl FileResolver {
    /// Default patterns, overridden by `patterns`
    pub fn new(root: impl Into<PathBuf>, patterns: &BTreeMap<Role, String>) -> Self {
        let mut merged: BTreeMap<Role, String> = Role::iter()
            .map(|role| (role, default_pattern(role).to_string()))
            .collect();
        merged.extend(patterns.iter().map(|(role, pattern)| (*role, pattern.clone())));
        Self {
            root: root.into(),
            patterns: merged,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pattern(&self, role: Role) -> &str {
        self.patterns
            .get(&role)
            .map(String::as_str)
            .unwrap_or_else(|| default_pattern(role))
    }

    pub fn resolve_role(&self, role: Role) -> Result<PathBuf> {
        let pattern = self.pattern(role);
        let full = format!("{}/{}", glob::Pattern::escape(&self.root.to_string_lossy()), pattern);
        let mut matches = Vec::new();
        for entry in glob::glob(&full)? {
            let path = entry.map_err(glob::GlobError::into_error)?;
            if path.is_file() {
                matches.push(path);
            }
        }

        match matches.as_slice() {
            [single] => {
                debug!("Resolved {} -> {}", role, single.display());
                Ok(single.clone())
            }
            _ => Err(PipelineError::MissingFile {
                role,
                pattern: pattern.to_string(),
                root: self.root.clone(),
                found: matches.len(),
            }),
        }
    }

    /// Resolve `roles` only; no side effects
    pub fn resolve(&self, roles: &[Role]) -> Result<FileSet> {
        let files = roles
            .iter()
            .map(|&role| Ok((role, self.resolve_role(role)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(FileSet { files })
    }

    pub fn resolve_all(&self) -> Result<FileSet> {
        let roles: Vec<Role> = Role::iter().collect();
        self.resolve(&roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SessionFixture;

    #[test]
    fn test_resolve_all_default_layout() {
        let fixture = SessionFixture::new();
        let files = FileResolver::new(fixture.input_root(), &BTreeMap::new())
            .resolve_all()
            .unwrap();
        assert_eq!(files.len(), Role::iter().count());
        assert!(files.get(Role::BvalFile).unwrap().ends_with("dwi/data.nii.gz.bval"));
    }

    #[test]
    fn test_missing_role() {
        let fixture = SessionFixture::new();
        std::fs::remove_file(fixture.path(Role::IndexFile)).unwrap();
        let result = FileResolver::new(fixture.input_root(), &BTreeMap::new()).resolve(&[Role::IndexFile]);
        assert!(matches!(result, Err(PipelineError::MissingFile { role: Role::IndexFile, found: 0, .. })));
    }

    #[test]
    fn test_ambiguous_role_is_an_error() {
        let fixture = SessionFixture::new();
        let extra = fixture.input_root().join("anat/sub-0001_run-2_desc-brain_T1w.nii.gz");
        std::fs::write(extra, b"").unwrap();
        let result = FileResolver::new(fixture.input_root(), &BTreeMap::new()).resolve(&[Role::T1wBrain]);
        assert!(matches!(result, Err(PipelineError::MissingFile { found: 2, .. })));
    }

    #[test]
    fn test_pattern_override() {
        let fixture = SessionFixture::new();
        let custom = fixture.input_root().join("dwi/custom.idx");
        std::fs::write(&custom, b"1 1 1").unwrap();
        let patterns = BTreeMap::from([(Role::IndexFile, "dwi/*.idx".to_string())]);
        let files = FileResolver::new(fixture.input_root(), &patterns)
            .resolve(&[Role::IndexFile])
            .unwrap();
        assert_eq!(files.get(Role::IndexFile).unwrap(), custom);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_is_an_io_error() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = SessionFixture::new();
        let anat = fixture.input_root().join("anat");
        std::fs::set_permissions(&anat, std::fs::Permissions::from_mode(0o000)).unwrap();
        let privileged = std::fs::read_dir(&anat).is_ok();
        let result = FileResolver::new(fixture.input_root(), &BTreeMap::new()).resolve(&[Role::T1wBrain]);
        std::fs::set_permissions(&anat, std::fs::Permissions::from_mode(0o755)).unwrap();

        // permission bits do not apply to a privileged user
        if privileged {
            return;
        }
        assert!(matches!(result, Err(PipelineError::Io(_))), "{result:?}");
    }

    #[test]
    fn test_require_fails_fast() {
        let files = FileSet::from_map(BTreeMap::from([(Role::T1w, PathBuf::from("/x/t1w.nii.gz"))]));
        assert!(files.require(&[Role::T1w]).is_ok());
        assert!(matches!(
            files.require(&[Role::T1w, Role::DwiFile]),
            Err(PipelineError::UnresolvedRole(Role::DwiFile))
        ));
    }
}
