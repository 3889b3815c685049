use std::path::Path;
use std::process::Command;

use crate::driver::{execute_command, Executable};
use crate::sources::{prepare_output, validate_inputs, validate_outputs};
use crate::{Result, ShellExtraction, ShellExtractionRequest};

/// MRtrix3 driver for b-value aware volume extraction
#[derive(Debug, Clone)]
pub struct MrtrixDriver {
    dwiextract: Executable,
}

impl MrtrixDriver {
    pub fn new(bin_dir: Option<&Path>) -> Result<Self> {
        Ok(Self {
            dwiextract: Executable::locate("dwiextract", bin_dir)?,
        })
    }

    pub fn with_bin_dir(bin_dir: &Path) -> Self {
        Self {
            dwiextract: Executable::in_dir(bin_dir, "dwiextract"),
        }
    }

    pub fn build_extract_command(&self, request: &ShellExtractionRequest<'_>) -> Command {
        let mut cmd = self.dwiextract.command();
        cmd.arg(request.dwi)
            .arg(request.out_dwi)
            .arg("-fslgrad").arg(request.bvec).arg(request.bval)
            .arg("-shells").arg(request.shell.to_string())
            .arg("-export_grad_fsl").arg(request.out_bvec).arg(request.out_bval)
            .args(["-force", "-quiet"]);
        cmd
    }
}

impl ShellExtraction for MrtrixDriver {
    fn extract_shell(&self, request: &ShellExtractionRequest<'_>) -> Result<()> {
        let tool = self.dwiextract.name();
        validate_inputs(tool, &[request.dwi, request.bval, request.bvec])?;
        prepare_output(tool, request.out_dwi)?;
        execute_command(tool, self.build_extract_command(request))?;
        validate_outputs(tool, &[request.out_dwi, request.out_bval, request.out_bvec])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::command_args;
    use neuroflow_common::ShellSelector;

    #[test]
    fn test_extract_command_lists_shells() {
        let shell = ShellSelector::new(Some(1000), 50)
            .select(&[0.0, 995.0, 1005.0, 2000.0])
            .unwrap();
        let request = ShellExtractionRequest {
            dwi: Path::new("dwi.nii.gz"),
            bval: Path::new("dwi.bval"),
            bvec: Path::new("dwi.bvec"),
            shell: &shell,
            out_dwi: Path::new("shell.nii.gz"),
            out_bval: Path::new("shell.bval"),
            out_bvec: Path::new("shell.bvec"),
        };
        let driver = MrtrixDriver::with_bin_dir(Path::new("/opt/mrtrix3/bin"));
        let args = command_args(&driver.build_extract_command(&request));
        assert_eq!(
            args,
            vec![
                "dwi.nii.gz", "shell.nii.gz", "-fslgrad", "dwi.bvec", "dwi.bval",
                "-shells", "0,1000", "-export_grad_fsl", "shell.bvec", "shell.bval",
                "-force", "-quiet",
            ]
        );
    }
}
