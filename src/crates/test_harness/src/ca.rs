//! Channel Access through the EPICS command line clients.
//!
//! `caget` and `caput` are run as short-lived child processes with the
//! session environment, so they only ever talk to the loopback IOC.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::env::ProcessEnv;
use crate::error::{HarnessError, HarnessResult};
use crate::point::PointTransport;
use crate::process::{CapturedOutput, ProcessHandle, ProcessSpec};

/// Extra time granted to a tool beyond its own `-w` timeout before it is killed.
const TOOL_GRACE: Duration = Duration::from_secs(2);

/// [`PointTransport`] backed by `caget` / `caput`.
#[derive(Debug, Clone)]
pub struct CaTools {
    caget: PathBuf,
    caput: PathBuf,
    env: ProcessEnv,
}

impl CaTools {
    pub fn new(caget: impl Into<PathBuf>, caput: impl Into<PathBuf>, env: ProcessEnv) -> Self {
        Self {
            caget: caget.into(),
            caput: caput.into(),
            env,
        }
    }

    /// Tools shipped in `<epics_base>/bin/<host_arch>`.
    pub fn from_epics_base(epics_base: &Path, host_arch: &str, env: ProcessEnv) -> Self {
        let bin = epics_base.join("bin").join(host_arch);
        Self::new(bin.join("caget"), bin.join("caput"), env)
    }

    pub fn caget(&self) -> &Path {
        &self.caget
    }

    pub fn caput(&self) -> &Path {
        &self.caput
    }

    fn run(&self, spec: ProcessSpec, name: &str, timeout: Duration) -> HarnessResult<String> {
        let label = spec.label.clone();
        let mut tool = ProcessHandle::launch(spec.with_env(self.env.clone()))?;
        let limit = timeout + TOOL_GRACE;
        if tool.wait_timeout(limit)?.is_none() {
            stop_overdue(&mut tool)?;
            return Err(HarnessError::PointUnavailable {
                name: name.to_string(),
                timeout,
            });
        }

        let output = tool.capture_output()?;
        if output.exit_code == Some(0) {
            return Ok(output.stdout);
        }
        Err(classify_failure(&label, name, timeout, &output))
    }
}

impl PointTransport for CaTools {
    fn get(&self, name: &str, timeout: Duration) -> HarnessResult<String> {
        let spec = ProcessSpec::new("caget", &self.caget)
            .with_arg("-w")
            .with_arg(wait_seconds(timeout))
            .with_args(["-t", "-g", "17"])
            .with_arg(name);
        let stdout = self.run(spec, name, timeout)?;
        // Only the line terminator is stripped; string values may carry spaces.
        let value = stdout.lines().next().unwrap_or_default().to_string();
        debug!(point = name, %value, "caget");
        Ok(value)
    }

    fn put(&self, name: &str, value: &str, timeout: Duration) -> HarnessResult<()> {
        let spec = ProcessSpec::new("caput", &self.caput)
            .with_arg("-c")
            .with_arg("-w")
            .with_arg(wait_seconds(timeout))
            .with_arg("-t")
            // Negative values would otherwise be read as options.
            .with_arg("--")
            .with_arg(name)
            .with_arg(value);
        self.run(spec, name, timeout)?;
        debug!(point = name, value, "caput");
        Ok(())
    }
}

/// Kill a tool that outlived its bound; one that exited meanwhile is fine too.
fn stop_overdue(tool: &mut ProcessHandle) -> HarnessResult<()> {
    match tool.stop(Duration::ZERO, TOOL_GRACE) {
        Ok(()) | Err(HarnessError::AlreadyStopped(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

fn wait_seconds(timeout: Duration) -> String {
    format!("{:.3}", timeout.as_secs_f64())
}

/// Connect timeouts become [`HarnessError::PointUnavailable`]; anything else is a transport error.
fn classify_failure(
    tool: &str,
    name: &str,
    timeout: Duration,
    output: &CapturedOutput,
) -> HarnessError {
    let text = format!("{}{}", output.stdout, output.stderr);
    let lower = text.to_ascii_lowercase();
    if lower.contains("not found") || lower.contains("timed out") || lower.contains("timeout") {
        return HarnessError::PointUnavailable {
            name: name.to_string(),
            timeout,
        };
    }
    HarnessError::transport(format!(
        "{tool} {name} exited with {:?}: {}",
        output.exit_code,
        text.trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stdout: &str, stderr: &str) -> CapturedOutput {
        CapturedOutput {
            exit_code: Some(1),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn connect_timeout_maps_to_point_unavailable() {
        let output = failed("", "Channel connect timed out: 'Nope' not found.\n");
        let err = classify_failure("caget", "Nope", Duration::from_secs(2), &output);
        assert!(matches!(err, HarnessError::PointUnavailable { ref name, .. } if name == "Nope"));
    }

    #[test]
    fn other_failures_are_transport_errors() {
        let output = failed("", "Error from put operation: Write access denied\n");
        let err = classify_failure("caput", "TestINT", Duration::from_secs(2), &output);
        assert!(matches!(err, HarnessError::Transport(_)));
    }

    #[cfg(unix)]
    #[test]
    fn overdue_tool_that_already_exited_is_not_an_error() {
        let mut tool =
            ProcessHandle::launch(ProcessSpec::new("caget", "/bin/sh").with_args(["-c", "exit 0"]))
                .unwrap();
        assert!(tool.wait_timeout(Duration::from_secs(5)).unwrap().is_some());

        stop_overdue(&mut tool).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn overdue_tool_is_killed() {
        let mut tool =
            ProcessHandle::launch(ProcessSpec::new("caget", "/bin/sh").with_args(["-c", "sleep 30"]))
                .unwrap();

        stop_overdue(&mut tool).unwrap();
        assert!(!tool.is_running());
    }

    #[test]
    fn tools_resolve_under_epics_base() {
        let tools = CaTools::from_epics_base(
            Path::new("/opt/epics/base"),
            "linux-x86_64",
            ProcessEnv::default(),
        );
        assert_eq!(
            tools.caget(),
            Path::new("/opt/epics/base/bin/linux-x86_64/caget")
        );
        assert_eq!(
            tools.caput(),
            Path::new("/opt/epics/base/bin/linux-x86_64/caput")
        );
        assert_eq!(wait_seconds(Duration::from_millis(1500)), "1.500");
    }
}
