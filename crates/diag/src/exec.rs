use std::process::Command;

use crate::DiagError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs an external tool to completion and captures its output.
pub trait Exec {
    fn run(&self, program: &str, args: &[String]) -> Result<Captured, DiagError>;
}

/// Resolves tools on `PATH` and runs them directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExec;

impl Exec for SystemExec {
    fn run(&self, program: &str, args: &[String]) -> Result<Captured, DiagError> {
        let bin = which::which(program).map_err(|_| DiagError::MissingTool(program.to_string()))?;
        let out = Command::new(bin).args(args).output()
            .map_err(|source| DiagError::Spawn { program: program.to_string(), source })?;
        Ok(Captured {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}
