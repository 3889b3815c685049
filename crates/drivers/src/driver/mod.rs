pub mod dipy;
pub mod fsl;
pub mod mrtrix;
pub mod smriprep;
pub mod striping;

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::debug;

use crate::{Result, ToolError};

/// A command-line program of an external toolkit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    name: &'static str,
    program: PathBuf,
}

impl Executable {
    /// `bin_dir/name`, without checking that it exists
    pub fn in_dir(bin_dir: &Path, name: &'static str) -> Self {
        Self {
            name,
            program: bin_dir.join(name),
        }
    }

    /// Find `name` in `bin_dir` when given, otherwise on `PATH`
    pub fn locate(name: &'static str, bin_dir: Option<&Path>) -> Result<Self> {
        if let Some(dir) = bin_dir {
            let executable = Self::in_dir(dir, name);
            if !executable.program.exists() {
                return Err(ToolError::Initialization {
                    tool: name.to_string(),
                    message: format!("executable not found at {}", executable.program.display()),
                });
            }
            return Ok(executable);
        }

        if let Ok(output) = Command::new("which").arg(name).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Ok(Self {
                        name,
                        program: PathBuf::from(path),
                    });
                }
            }
        }

        // Fall back to PATH resolution when the command is spawned
        Ok(Self {
            name,
            program: PathBuf::from(name),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn command(&self) -> Command {
        Command::new(&self.program)
    }
}

/// Run a command to completion and fail on a non-zero exit status
pub fn execute_command(tool: &str, mut cmd: Command) -> Result<Output> {
    debug!("Executing {} command: {:?}", tool, cmd);

    // Conda/FSL wrappers pick up foreign libraries through this variable
    cmd.env_remove("DYLD_LIBRARY_PATH");

    let output = cmd.output().map_err(|e| ToolError::Execution {
        tool: tool.to_string(),
        message: format!("failed to spawn: {e}"),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ToolError::Execution {
            tool: tool.to_string(),
            message: format!("{} ({})", stderr.trim(), output.status),
        });
    }

    debug!("{} command executed successfully", tool);
    Ok(output)
}

/// Command arguments as strings, for logging and tests
pub fn command_args(cmd: &Command) -> Vec<String> {
    cmd.get_args().map(|arg| arg.to_string_lossy().into_owned()).collect()
}
