use std::mem;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::ca::CaTools;
use crate::config::{HarnessConfig, Readiness, SimulatorSpec};
use crate::env::ProcessEnv;
use crate::error::{HarnessError, HarnessResult};
use crate::point::{Point, PointSession, PointTransport, PointValue};
use crate::process::{CapturedOutput, LogLine, ProcessHandle, ProcessSpec, StdinMode};
use crate::report::SessionReport;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const MAX_PROBE_ATTEMPT: Duration = Duration::from_secs(1);

/// Lifecycle of a session; point operations are only allowed in `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    SimulatorStarted,
    ControllerStarted,
    Ready,
    ControllerStopped,
    SimulatorStopped,
    /// Controller startup failed; only teardown is possible.
    Failed,
}

/// One simulator and one IOC driven through a fixed start/exercise/stop sequence.
///
/// Point failures are recorded against the session and surface in the
/// [`SessionReport`] returned by [`Session::finish`]; teardown always runs,
/// including on drop.
pub struct Session<T: PointTransport = CaTools> {
    config: HarnessConfig,
    env: ProcessEnv,
    state: SessionState,
    simulator: Option<ProcessHandle>,
    controller: Option<ProcessHandle>,
    points: PointSession<T>,
    failures: Vec<String>,
    teardown_errors: Vec<String>,
    simulator_output: Option<CapturedOutput>,
    controller_output: Option<CapturedOutput>,
}

impl Session<CaTools> {
    /// Create a session that talks Channel Access through `caget` / `caput`.
    pub fn new(config: HarnessConfig) -> Self {
        let env = config.process_env();
        let tools = match &config.ca_tools {
            Some((caget, caput)) => CaTools::new(caget, caput, env),
            None => CaTools::from_epics_base(&config.epics_base, &config.host_arch, env),
        };
        Self::with_transport(config, tools)
    }
}

impl<T: PointTransport> Session<T> {
    /// Create a session with a custom point transport.
    pub fn with_transport(config: HarnessConfig, transport: T) -> Self {
        let env = config.process_env();
        Self {
            config,
            env,
            state: SessionState::Idle,
            simulator: None,
            controller: None,
            points: PointSession::new(transport),
            failures: Vec::new(),
            teardown_errors: Vec::new(),
            simulator_output: None,
            controller_output: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Environment applied to every child process of this session.
    pub fn env(&self) -> &ProcessEnv {
        &self.env
    }

    pub fn points(&self) -> &PointSession<T> {
        &self.points
    }

    /// Assertion failures recorded so far.
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn simulator_pid(&self) -> Option<u32> {
        self.simulator.as_ref().map(ProcessHandle::pid)
    }

    pub fn controller_pid(&self) -> Option<u32> {
        self.controller.as_ref().map(ProcessHandle::pid)
    }

    pub fn is_controller_running(&mut self) -> bool {
        self.controller
            .as_mut()
            .map(ProcessHandle::is_running)
            .unwrap_or(false)
    }

    pub fn is_simulator_running(&mut self) -> bool {
        self.simulator
            .as_mut()
            .map(ProcessHandle::is_running)
            .unwrap_or(false)
    }

    /// Lines captured from the controller so far.
    pub fn controller_logs(&self) -> Vec<LogLine> {
        self.controller
            .as_ref()
            .map(ProcessHandle::logs)
            .unwrap_or_default()
    }

    /// Lines captured from the simulator so far.
    pub fn simulator_logs(&self) -> Vec<LogLine> {
        self.simulator
            .as_ref()
            .map(ProcessHandle::logs)
            .unwrap_or_default()
    }

    /// Launch the PLC simulator with the given tags.
    pub fn start_simulator(&mut self, spec: &SimulatorSpec) -> HarnessResult<()> {
        if !matches!(
            self.state,
            SessionState::Idle | SessionState::SimulatorStopped
        ) {
            return Err(HarnessError::precondition(format!(
                "start_simulator requires an idle session, state is {:?}",
                self.state
            )));
        }

        let args = spec.args(self.config.target);
        info!(target_device = %self.config.target, ?args, "starting simulator");
        let process = ProcessSpec::new("simulator", &self.config.simulator_path)
            .with_args(args)
            .with_env(self.env.clone());
        let mut simulator = match ProcessHandle::launch(process) {
            Ok(simulator) => simulator,
            Err(err) => {
                error!(error = %err, "simulator launch failed");
                self.failures.push(err.to_string());
                return Err(err);
            }
        };

        thread::sleep(self.config.simulator_settle);
        if !simulator.is_running() {
            let output = simulator.capture_output().ok();
            self.simulator_output = output.clone();
            self.state = SessionState::Failed;
            let err = HarnessError::Startup {
                process: "simulator".to_string(),
                reason: "exited during startup".to_string(),
                output,
            };
            self.failures.push(err.to_string());
            return Err(err);
        }

        self.simulator = Some(simulator);
        self.simulator_output = None;
        self.state = SessionState::SimulatorStarted;
        Ok(())
    }

    /// Launch the IOC and wait until it is ready for point traffic.
    pub fn start_controller(&mut self) -> HarnessResult<()> {
        if self.state != SessionState::SimulatorStarted {
            return Err(HarnessError::precondition(format!(
                "start_controller requires a started simulator, state is {:?}",
                self.state
            )));
        }
        if !self.is_simulator_running() {
            return Err(HarnessError::precondition(
                "simulator is no longer running",
            ));
        }

        let script = self.config.startup_script();
        info!(script = %script.display(), "starting controller");
        let process = ProcessSpec::new("controller", self.config.controller_executable())
            .with_arg(script.display().to_string())
            .with_env(self.env.clone())
            .with_working_directory(self.config.controller_working_directory())
            .with_stdin(StdinMode::KeepOpen);
        let controller = match ProcessHandle::launch(process) {
            Ok(controller) => controller,
            Err(err) => {
                error!(error = %err, "controller launch failed");
                self.state = SessionState::Failed;
                self.failures.push(err.to_string());
                return Err(err);
            }
        };
        self.controller = Some(controller);
        self.state = SessionState::ControllerStarted;

        if let Err(reason) = self.wait_until_ready() {
            return Err(self.fail_controller_startup(reason));
        }

        info!("controller ready");
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Read a point from the running controller.
    pub fn read_point(&mut self, point: &Point) -> HarnessResult<PointValue> {
        self.ensure_ready("read", point)?;
        let result = self.points.read(point, self.config.point_timeout);
        if let Err(err) = &result {
            self.record_failure(format!("read {}: {err}", point.name));
        }
        result
    }

    /// Write a point and wait for the controller to apply it.
    pub fn write_point(
        &mut self,
        point: &Point,
        value: impl Into<PointValue>,
    ) -> HarnessResult<()> {
        self.ensure_ready("write", point)?;
        let value = value.into();
        let result = self.points.write(point, &value, self.config.point_timeout);
        if let Err(err) = &result {
            self.record_failure(format!("write {value} to {}: {err}", point.name));
        }
        result
    }

    /// Read a point and record a failure unless it equals `expected` at the declared width.
    pub fn expect_point(&mut self, point: &Point, expected: impl Into<PointValue>) -> bool {
        let expected = expected.into();
        match self.read_point(point) {
            Ok(actual) if actual.same_as(&expected) => true,
            Ok(actual) => {
                self.record_failure(format!(
                    "{}: expected {expected}, read {actual}",
                    point.name
                ));
                false
            }
            Err(_) => false,
        }
    }

    /// Write `value` to `write`, let it settle, and expect it back from `read`.
    pub fn expect_round_trip(
        &mut self,
        write: &Point,
        read: &Point,
        value: impl Into<PointValue>,
        settle: Duration,
    ) -> bool {
        let value = value.into();
        if self.write_point(write, value.clone()).is_err() {
            return false;
        }
        thread::sleep(settle);
        self.expect_point(read, value)
    }

    /// Record a test-case failure without aborting the session.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(failure = %message, "assertion failed");
        self.failures.push(message);
    }

    /// Stop the controller; a no-op when it was never started or is already stopped.
    pub fn stop_controller(&mut self) -> HarnessResult<()> {
        let Some(controller) = self.controller.as_mut() else {
            return Ok(());
        };

        info!(pid = controller.pid(), "stopping controller");
        let result = controller.stop(self.config.shutdown_grace, self.config.shutdown_timeout);
        if let Err(err) = &result {
            if !matches!(err, HarnessError::AlreadyStopped(_)) {
                warn!(error = %err, "controller shutdown failed");
                self.teardown_errors.push(err.to_string());
                return result;
            }
        }

        if let Ok(output) = controller.capture_output() {
            if self.controller_output.is_none() {
                self.controller_output = Some(output);
            }
        }
        self.controller = None;
        if matches!(
            self.state,
            SessionState::ControllerStarted | SessionState::Ready
        ) {
            self.state = SessionState::ControllerStopped;
        }
        Ok(())
    }

    /// Stop the simulator; refused while the controller that depends on it is still running.
    pub fn stop_simulator(&mut self) -> HarnessResult<()> {
        if self.is_controller_running() {
            let err = HarnessError::precondition(
                "controller must be stopped before the simulator",
            );
            self.teardown_errors.push(err.to_string());
            return Err(err);
        }
        self.stop_simulator_process()
    }

    /// Stop the controller, then the simulator; both steps always run.
    pub fn teardown(&mut self) -> HarnessResult<()> {
        let controller = self.stop_controller();
        let simulator = self.stop_simulator_process();
        controller.and(simulator)
    }

    /// Tear everything down and summarize the session.
    pub fn finish(mut self) -> SessionReport {
        let _ = self.teardown();
        let report = SessionReport {
            target: self.config.target,
            failures: mem::take(&mut self.failures),
            teardown_errors: mem::take(&mut self.teardown_errors),
            simulator_output: self.simulator_output.take(),
            controller_output: self.controller_output.take(),
        };
        if report.passed() {
            info!("session passed");
        } else {
            error!(
                failures = report.failures.len(),
                teardown_errors = report.teardown_errors.len(),
                "session failed"
            );
        }
        report
    }

    fn stop_simulator_process(&mut self) -> HarnessResult<()> {
        let Some(simulator) = self.simulator.as_mut() else {
            return Ok(());
        };

        info!(pid = simulator.pid(), "stopping simulator");
        let result = simulator.stop(self.config.shutdown_grace, self.config.shutdown_timeout);
        if let Err(err) = &result {
            if !matches!(err, HarnessError::AlreadyStopped(_)) {
                warn!(error = %err, "simulator shutdown failed");
                self.teardown_errors.push(err.to_string());
                return result;
            }
        }

        if let Ok(output) = simulator.capture_output() {
            self.simulator_output = Some(output);
        }
        self.simulator = None;
        if self.state != SessionState::Failed {
            self.state = SessionState::SimulatorStopped;
        }
        Ok(())
    }

    fn ensure_ready(&mut self, action: &str, point: &Point) -> HarnessResult<()> {
        let reason = if self.state != SessionState::Ready {
            Some(format!("session state is {:?}", self.state))
        } else if !self.is_controller_running() {
            Some("controller is not running".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => {
                let err = HarnessError::precondition(format!(
                    "cannot {action} {}: {reason}",
                    point.name
                ));
                self.record_failure(err.to_string());
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn wait_until_ready(&mut self) -> Result<(), String> {
        match self.config.readiness.clone() {
            Readiness::Settle(interval) => {
                thread::sleep(interval);
                if self.is_controller_running() {
                    Ok(())
                } else {
                    Err("exited during startup".to_string())
                }
            }
            Readiness::Probe { point, timeout } => self.poll_readiness(&point, timeout),
        }
    }

    fn poll_readiness(&mut self, point: &str, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if !self.is_controller_running() {
                return Err("exited during startup".to_string());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(format!("{point} did not answer within {timeout:?}"));
            }

            match self.points.probe(point, remaining.min(MAX_PROBE_ATTEMPT)) {
                Ok(()) => return Ok(()),
                Err(HarnessError::PointUnavailable { .. }) => {}
                Err(err) => return Err(format!("readiness probe failed: {err}")),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(backoff.min(remaining));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn fail_controller_startup(&mut self, reason: String) -> HarnessError {
        error!(%reason, "controller failed to start");
        let mut output = None;
        if let Some(controller) = self.controller.as_mut() {
            if let Err(err) =
                controller.stop(self.config.shutdown_grace, self.config.shutdown_timeout)
            {
                if !matches!(err, HarnessError::AlreadyStopped(_)) {
                    self.teardown_errors.push(err.to_string());
                }
            }
            output = controller.capture_output().ok();
        }
        if !self.is_controller_running() {
            self.controller = None;
        }
        self.controller_output = output.clone();
        self.state = SessionState::Failed;

        let err = HarnessError::Startup {
            process: "controller".to_string(),
            reason,
            output,
        };
        self.failures.push(err.to_string());
        err
    }
}

impl<T: PointTransport> Drop for Session<T> {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}
