use std::process::Command;

use crate::driver::execute_command;
use crate::sources::validate_inputs;
use crate::{Result, StripingRequest, StripingScorer, ToolError};

/// Runs a user supplied command and reads the score from the last line of
/// its standard output.
///
/// Arguments may contain the placeholders `{dwi}`, `{bval}`, `{bvec}` and `{mask}`.
#[derive(Debug, Clone)]
pub struct CommandStripingScorer {
    argv: Vec<String>,
}

impl CommandStripingScorer {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(ToolError::Initialization {
                tool: "striping".to_string(),
                message: "empty command".to_string(),
            });
        }
        Ok(Self { argv })
    }

    pub fn build_command(&self, request: &StripingRequest<'_>) -> Command {
        let substitute = |arg: &String| {
            arg.replace("{dwi}", &request.dwi.to_string_lossy())
                .replace("{bval}", &request.bval.to_string_lossy())
                .replace("{bvec}", &request.bvec.to_string_lossy())
                .replace("{mask}", &request.mask.to_string_lossy())
        };
        let mut cmd = Command::new(substitute(&self.argv[0]));
        cmd.args(self.argv[1..].iter().map(substitute));
        cmd
    }
}

pub fn parse_score(stdout: &str) -> Result<f64> {
    stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.trim().parse::<f64>().ok())
        .ok_or_else(|| ToolError::Parse {
            tool: "striping".to_string(),
            message: format!("no score in output {:?}", stdout.trim()),
        })
}

impl StripingScorer for CommandStripingScorer {
    fn score(&self, request: &StripingRequest<'_>) -> Result<f64> {
        validate_inputs("striping", &[request.dwi, request.mask])?;
        let output = execute_command("striping", self.build_command(request))?;
        parse_score(&String::from_utf8_lossy(&output.stdout))
    }
}
