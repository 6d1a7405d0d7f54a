use std::fmt;
use std::fs::File;
use std::path::Path;

use serde::Serialize;

use crate::env::TargetDevice;
use crate::error::{HarnessError, HarnessResult};
use crate::process::CapturedOutput;

/// Outcome of one session: failed assertions, teardown problems and process output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub target: TargetDevice,
    pub failures: Vec<String>,
    pub teardown_errors: Vec<String>,
    pub simulator_output: Option<CapturedOutput>,
    pub controller_output: Option<CapturedOutput>,
}

impl SessionReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty() && self.teardown_errors.is_empty()
    }

    /// Store the report as pretty JSON, e.g. as a CI artifact.
    pub fn write_json(&self, path: &Path) -> HarnessResult<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// `Err(AssertionsFailed)` when any assertion or teardown step failed.
    pub fn into_result(self) -> HarnessResult<()> {
        if self.passed() {
            Ok(())
        } else {
            Err(HarnessError::AssertionsFailed(
                self.failures.len() + self.teardown_errors.len(),
            ))
        }
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for failure in &self.failures {
            writeln!(f, "FAILED: {failure}")?;
        }
        for error in &self.teardown_errors {
            writeln!(f, "TEARDOWN: {error}")?;
        }
        if self.passed() {
            writeln!(f, "All tests passed!")?;
            return Ok(());
        }
        writeln!(f, "{} test(s) failed", self.failures.len())?;
        if let Some(output) = &self.controller_output {
            writeln!(f, "=== controller output ===")?;
            write!(f, "{output}")?;
        }
        if let Some(output) = &self.simulator_output {
            writeln!(f, "=== simulator output ===")?;
            write!(f, "{output}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(failures: &[&str]) -> SessionReport {
        SessionReport {
            target: TargetDevice::Omron,
            failures: failures.iter().map(|f| f.to_string()).collect(),
            teardown_errors: Vec::new(),
            simulator_output: None,
            controller_output: Some(CapturedOutput {
                exit_code: Some(0),
                stdout: "iocRun: All initialization complete\n".to_string(),
                stderr: String::new(),
            }),
        }
    }

    #[test]
    fn summary_lists_every_failure_with_output() {
        let text = report(&["TestINT: expected 5, read 4", "TestDINT unavailable"]).to_string();
        assert!(text.contains("FAILED: TestINT: expected 5, read 4"));
        assert!(text.contains("FAILED: TestDINT unavailable"));
        assert!(text.contains("2 test(s) failed"));
        assert!(text.contains("iocRun: All initialization complete"));
    }

    #[test]
    fn clean_report_passes() {
        let clean = report(&[]);
        assert!(clean.to_string().contains("All tests passed!"));
        assert!(clean.into_result().is_ok());
        assert!(matches!(
            report(&["x"]).into_result(),
            Err(HarnessError::AssertionsFailed(1))
        ));
    }
}
