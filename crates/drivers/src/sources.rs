use std::path::Path;

use crate::{Result, ToolError};

/// Check that every input of a tool call exists before spawning it
pub fn validate_inputs(tool: &str, inputs: &[&Path]) -> Result<()> {
    match inputs.iter().find(|path| !path.exists()) {
        Some(missing) => Err(ToolError::MissingInput {
            tool: tool.to_string(),
            path: missing.to_path_buf(),
        }),
        None => Ok(()),
    }
}

/// Create the parent directory of an output if needed
pub fn prepare_output(tool: &str, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ToolError::Execution {
            tool: tool.to_string(),
            message: format!("Cannot create output directory {}: {}", parent.display(), e),
        })?;
    }
    Ok(())
}

/// Check that a tool produced every output it was asked for
pub fn validate_outputs(tool: &str, outputs: &[&Path]) -> Result<()> {
    match outputs.iter().find(|path| !path.exists()) {
        Some(missing) => Err(ToolError::NotProduced {
            tool: tool.to_string(),
            path: missing.to_path_buf(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_inputs_reports_first_missing() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("t1w.nii.gz");
        std::fs::write(&present, b"").unwrap();
        let missing = dir.path().join("mask.nii.gz");

        assert!(validate_inputs("applywarp", &[&present]).is_ok());
        match validate_inputs("applywarp", &[&present, &missing]) {
            Err(ToolError::MissingInput { tool, path }) => {
                assert_eq!(tool, "applywarp");
                assert_eq!(path, missing);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_prepare_output_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested/deeper/out.nii.gz");
        prepare_output("flirt", &output).unwrap();
        assert!(output.parent().unwrap().is_dir());
        assert!(matches!(
            validate_outputs("flirt", &[&output]),
            Err(ToolError::NotProduced { .. })
        ));
    }
}
