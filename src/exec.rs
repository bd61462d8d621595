//! External-process collaborator.
//!
//! Volume capture shells out to `mkfs`/`losetup`/`mount`/`rsync` and
//! friends.  Those invocations go through the [`CommandRunner`] trait
//! rather than inline `Command::new` calls so that tests can script
//! command outcomes and inject failures.

use std::process::{Command, Output, Stdio};

use log::debug;

use crate::error::BundleError;

pub trait CommandRunner {
    /// Run `program` with `args` to completion, capturing stdout.
    /// A non-zero exit status is an error.
    fn run(&self, program: &str, args: &[&str]) -> Result<Output, BundleError>;

    /// Like [`CommandRunner::run`], but a non-zero exit status is
    /// reported through `Output` instead of failing.  Used where the
    /// exit code carries meaning (e.g. rsync partial-transfer codes).
    fn run_unchecked(&self, program: &str, args: &[&str]) -> Result<Output, BundleError>;
}

/// The production runner: plain subprocess execution.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<Output, BundleError> {
        let output = self.run_unchecked(program, args)?;
        if !output.status.success() {
            return Err(BundleError::Command {
                program: program.to_string(),
                status: output.status,
            });
        }
        Ok(output)
    }

    fn run_unchecked(&self, program: &str, args: &[&str]) -> Result<Output, BundleError> {
        debug!("running {program} {args:?}");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| BundleError::Spawn {
                program: program.to_string(),
                source,
            })
    }
}

/// Check that `program` exists on PATH before starting a multi-step
/// operation that would otherwise fail halfway through.
pub fn check_prerequisite(runner: &dyn CommandRunner, program: &str) -> Result<(), BundleError> {
    match runner.run_unchecked("which", &[program]) {
        Ok(output) if output.status.success() => Ok(()),
        _ => Err(BundleError::precondition(format!(
            "required command '{program}' was not found on PATH"
        ))),
    }
}
