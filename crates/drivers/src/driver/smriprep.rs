use std::path::Path;
use std::process::Command;

use crate::driver::{execute_command, Executable};
use crate::sources::{prepare_output, validate_inputs};
use crate::{Result, StructuralPreprocessing, StructuralRequest};

/// Template the T1w is normalised to; the warp used for atlas registration
/// comes from this space.
pub const OUTPUT_SPACE: &str = "MNI152NLin2009cAsym";

#[derive(Debug, Clone)]
pub struct SmriprepDriver {
    smriprep: Executable,
}

impl SmriprepDriver {
    pub fn new(bin_dir: Option<&Path>) -> Result<Self> {
        Ok(Self {
            smriprep: Executable::locate("smriprep", bin_dir)?,
        })
    }

    pub fn with_bin_dir(bin_dir: &Path) -> Self {
        Self {
            smriprep: Executable::in_dir(bin_dir, "smriprep"),
        }
    }

    pub fn build_command(&self, request: &StructuralRequest<'_>) -> Command {
        let mut cmd = self.smriprep.command();
        cmd.arg(request.bids_dir)
            .arg(request.output_dir)
            .arg("participant")
            .arg("--participant-label").arg(request.subject)
            .arg("--fs-license-file").arg(request.license)
            .arg("--output-spaces").arg(OUTPUT_SPACE)
            .arg("--notrack");
        cmd
    }
}

impl StructuralPreprocessing for SmriprepDriver {
    fn run(&self, request: &StructuralRequest<'_>) -> Result<()> {
        let tool = self.smriprep.name();
        validate_inputs(tool, &[request.bids_dir, request.license])?;
        prepare_output(tool, &request.output_dir.join(request.subject))?;
        execute_command(tool, self.build_command(request))?;
        Ok(())
    }
}
