use super::{JobHandle, Scheduler, SubmissionError};
use crate::{manifest::JobSpec, render};
use std::{
    io::Read,
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Submission gateway for PBS/Torque style schedulers (qsub/qstat/tracejob).
pub struct PbsScheduler {
    artifacts: PathBuf,
    program: String,
    command_timeout: Duration,
}

impl PbsScheduler {
    pub fn new(artifacts: PathBuf, program: String, command_timeout: Duration) -> Self {
        Self {
            artifacts,
            program,
            command_timeout,
        }
    }

    /// Run an external status command, returning its stdout if it exited
    /// cleanly within the timeout and produced anything at all. Every failure
    /// mode collapses to `None` since the caller treats "no report" and
    /// "unusable report" identically.
    fn run(&self, command: &str, args: &[&str]) -> Option<String> {
        let mut child = match Command::new(command)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                debug!(command = command, error = %error, "failed to spawn status command");

                return None;
            }
        };

        match child.wait_timeout(self.command_timeout) {
            Ok(Some(status)) if status.success() => {
                let mut output = String::new();
                let mut stdout = child.stdout.take()?;

                if let Err(error) = stdout.read_to_string(&mut output) {
                    debug!(command = command, error = %error, "failed to read status output");

                    return None;
                }

                if output.trim().is_empty() {
                    None
                } else {
                    Some(output)
                }
            }
            Ok(Some(status)) => {
                debug!(command = command, status = ?status.code(), "status command failed");

                None
            }
            Ok(None) => {
                warn!(command = command, "status command timed out");
                let _ = child.kill();

                None
            }
            Err(error) => {
                warn!(command = command, error = %error, "failed to wait for status command");

                None
            }
        }
    }
}

impl Scheduler for PbsScheduler {
    fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmissionError> {
        let script =
            render::write_artifacts(spec, &self.program, &self.artifacts).map_err(SubmissionError::Render)?;

        debug!(job = %spec.name, script = ?script, "submitting");

        let mut child = Command::new("qsub")
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(SubmissionError::Spawn)?;

        let status = match child
            .wait_timeout(self.command_timeout)
            .map_err(SubmissionError::Spawn)?
        {
            Some(status) => status,
            None => {
                let _ = child.kill();

                return Err(SubmissionError::Timeout);
            }
        };

        if !status.success() {
            return Err(SubmissionError::Failed(status.code().unwrap_or(-1)));
        }

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout
                .read_to_string(&mut output)
                .map_err(SubmissionError::Spawn)?;
        }

        let handle = parse_handle(&output)?;
        info!(job = %spec.name, handle = %handle, "entered the queue");

        Ok(handle)
    }

    fn query_status(&self, handle: &JobHandle) -> Option<String> {
        self.run("qstat", &["-f", handle.as_str()])
    }

    fn query_trace(&self, handle: &JobHandle) -> Option<String> {
        self.run("tracejob", &[handle.as_str()])
    }
}

/// Extract the job handle from the submit command's output. qsub prints a
/// single `<id>.<server>` token; only the numeric id is used for later polls.
fn parse_handle(output: &str) -> Result<JobHandle, SubmissionError> {
    let token = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split('.').next())
        .unwrap_or("");

    if !token.is_empty() && token.bytes().all(|byte| byte.is_ascii_digit()) {
        Ok(JobHandle::new(token))
    } else {
        Err(SubmissionError::BadHandle(output.trim().to_owned()))
    }
}
