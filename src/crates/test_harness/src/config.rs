use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::env::{EnvPaths, ProcessEnv, TargetDevice};
use crate::error::{HarnessError, HarnessResult};

/// Simulator executable override.
pub const SIMULATOR_VAR: &str = "OMRONEIP_SIMULATOR";
/// IOC top directory override.
pub const IOC_TOP_VAR: &str = "OMRONEIP_IOC_TOP";
/// Target PLC family, `Omron` or `ControlLogix`.
pub const PLC_VAR: &str = "OMRONEIP_PLC";
pub const EPICS_BASE_VAR: &str = "EPICS_BASE";
pub const EPICS_HOST_ARCH_VAR: &str = "EPICS_HOST_ARCH";

const DEFAULT_HOST_ARCH: &str = "linux-x86_64";
const IOC_APP: &str = "omroneipApp";
const IOC_BOOT_DIR: &str = "iocBoot/iocCITests";
const IOC_SCRIPT: &str = "testInt.cmd";

/// How the harness decides the controller is ready for point traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Sleep for a fixed interval, then require the process to still be running.
    Settle(Duration),
    /// Poll a point until it answers, backing off exponentially, up to `timeout`.
    Probe { point: String, timeout: Duration },
}

/// Process-level configuration for one simulator/IOC session.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Path to the libplctag `ab_server` binary.
    pub simulator_path: PathBuf,
    /// Top directory of the IOC application.
    pub ioc_top: PathBuf,
    /// EPICS base installation, used for the library path and the CA tools.
    pub epics_base: PathBuf,
    /// EPICS host architecture.
    pub host_arch: String,
    /// PLC family under test.
    pub target: TargetDevice,
    /// Overrides `<ioc_top>/bin/<arch>/omroneipApp`.
    pub controller_executable: Option<PathBuf>,
    /// Overrides `<ioc_top>/iocBoot/iocCITests/testInt.cmd`.
    pub startup_script: Option<PathBuf>,
    /// Overrides `<ioc_top>/iocBoot/iocCITests`.
    pub controller_working_directory: Option<PathBuf>,
    /// Overrides the `caget` / `caput` binaries found under EPICS base.
    pub ca_tools: Option<(PathBuf, PathBuf)>,
    /// Channel Access server port; EPICS default when unset.
    pub ca_server_port: Option<u16>,
    /// Bound on every point read or write.
    pub point_timeout: Duration,
    /// Delay after launching the simulator before it is considered up.
    pub simulator_settle: Duration,
    /// Readiness strategy for the controller.
    pub readiness: Readiness,
    /// Time allowed for a graceful exit before the process is killed.
    pub shutdown_grace: Duration,
    /// Time allowed for a killed process to be reaped.
    pub shutdown_timeout: Duration,
}

impl HarnessConfig {
    /// Create a config with explicit simulator, IOC and EPICS base locations.
    pub fn new(
        simulator_path: impl Into<PathBuf>,
        ioc_top: impl Into<PathBuf>,
        epics_base: impl Into<PathBuf>,
    ) -> Self {
        Self {
            simulator_path: simulator_path.into(),
            ioc_top: ioc_top.into(),
            epics_base: epics_base.into(),
            host_arch: DEFAULT_HOST_ARCH.to_string(),
            target: TargetDevice::Omron,
            controller_executable: None,
            startup_script: None,
            controller_working_directory: None,
            ca_tools: None,
            ca_server_port: None,
            point_timeout: Duration::from_secs(2),
            simulator_settle: Duration::from_millis(500),
            readiness: Readiness::Settle(Duration::from_secs(2)),
            shutdown_grace: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Build a config from the environment, falling back to the CI layout under `$HOME`.
    pub fn from_env() -> HarnessResult<Self> {
        let home = env::var("HOME").map(PathBuf::from).ok();
        let under_home = |relative: &str| -> HarnessResult<PathBuf> {
            home.as_ref().map(|home| home.join(relative)).ok_or_else(|| {
                HarnessError::config(format!("HOME is not set and no override for {relative}"))
            })
        };

        let simulator_path = match env::var(SIMULATOR_VAR) {
            Ok(path) => PathBuf::from(path),
            Err(_) => under_home("libplctag-2.5.5/build/bin_dist/ab_server")?,
        };
        let ioc_top = match env::var(IOC_TOP_VAR) {
            Ok(path) => PathBuf::from(path),
            Err(_) => under_home("omroneip")?,
        };
        let epics_base = env::var(EPICS_BASE_VAR)
            .map(PathBuf::from)
            .map_err(|_| HarnessError::config(format!("{EPICS_BASE_VAR} is not set")))?;

        let mut config = Self::new(simulator_path, ioc_top, epics_base);
        if let Ok(arch) = env::var(EPICS_HOST_ARCH_VAR) {
            config.host_arch = arch;
        }
        if let Ok(plc) = env::var(PLC_VAR) {
            config.target = plc.parse()?;
        }
        Ok(config)
    }

    /// Select the PLC family; also decides the `PLC` routing value.
    pub fn with_target(mut self, target: TargetDevice) -> Self {
        self.target = target;
        self
    }

    /// Override the EPICS host architecture.
    pub fn with_host_arch(mut self, arch: impl Into<String>) -> Self {
        self.host_arch = arch.into();
        self
    }

    /// Launch a different controller binary with its own startup script.
    pub fn with_controller(
        mut self,
        executable: impl Into<PathBuf>,
        startup_script: impl Into<PathBuf>,
    ) -> Self {
        self.controller_executable = Some(executable.into());
        self.startup_script = Some(startup_script.into());
        self
    }

    /// Directory the IOC is started in.
    pub fn with_controller_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.controller_working_directory = Some(dir.into());
        self
    }

    /// Use these `caget` / `caput` binaries instead of the ones under EPICS base.
    pub fn with_ca_tools(mut self, caget: impl Into<PathBuf>, caput: impl Into<PathBuf>) -> Self {
        self.ca_tools = Some((caget.into(), caput.into()));
        self
    }

    /// Run Channel Access on a dedicated port, isolating concurrent sessions.
    pub fn with_ca_server_port(mut self, port: u16) -> Self {
        self.ca_server_port = Some(port);
        self
    }

    /// Bound for each point read or write.
    pub fn with_point_timeout(mut self, timeout: Duration) -> Self {
        self.point_timeout = timeout;
        self
    }

    /// Wait after launching the simulator before checking it is still alive.
    pub fn with_simulator_settle(mut self, settle: Duration) -> Self {
        self.simulator_settle = settle;
        self
    }

    /// Set how controller readiness is established.
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Time a process gets to exit after `SIGTERM`.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Time a killed process gets to be reaped.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// IOC binary, derived from the IOC top unless overridden.
    pub fn controller_executable(&self) -> PathBuf {
        self.controller_executable.clone().unwrap_or_else(|| {
            self.ioc_top
                .join("bin")
                .join(&self.host_arch)
                .join(IOC_APP)
        })
    }

    /// IOC startup script, derived from the IOC top unless overridden.
    pub fn startup_script(&self) -> PathBuf {
        self.startup_script
            .clone()
            .unwrap_or_else(|| self.ioc_top.join(IOC_BOOT_DIR).join(IOC_SCRIPT))
    }

    /// IOC working directory, derived from the IOC top unless overridden.
    pub fn controller_working_directory(&self) -> PathBuf {
        self.controller_working_directory
            .clone()
            .unwrap_or_else(|| self.ioc_top.join(IOC_BOOT_DIR))
    }

    /// Environment shared by the simulator, the IOC and the CA tools.
    pub fn process_env(&self) -> ProcessEnv {
        ProcessEnv::for_target(
            self.target,
            &EnvPaths {
                ioc_top: self.ioc_top.clone(),
                epics_base: self.epics_base.clone(),
                host_arch: self.host_arch.clone(),
                ca_server_port: self.ca_server_port,
            },
        )
    }
}

/// Tag type understood by the simulator's `--tag` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    Bool,
    Sint,
    Int,
    Dint,
    Lint,
    Real,
    Lreal,
    String,
}

impl TagType {
    pub fn as_str(self) -> &'static str {
        match self {
            TagType::Bool => "BOOL",
            TagType::Sint => "SINT",
            TagType::Int => "INT",
            TagType::Dint => "DINT",
            TagType::Lint => "LINT",
            TagType::Real => "REAL",
            TagType::Lreal => "LREAL",
            TagType::String => "STRING",
        }
    }
}

/// One emulated tag: name, type and dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSpec {
    pub name: String,
    pub kind: TagType,
    pub dimensions: Vec<u32>,
}

impl TagSpec {
    /// A scalar tag, declared to the simulator as `[1,1]`.
    pub fn new(name: impl Into<String>, kind: TagType) -> Self {
        Self {
            name: name.into(),
            kind,
            dimensions: vec![1, 1],
        }
    }

    /// Declare an array tag, e.g. `&[10]` or `&[2, 3]`.
    pub fn with_dimensions(mut self, dimensions: &[u32]) -> Self {
        self.dimensions = dimensions.to_vec();
        self
    }

    /// Render as `--tag=<name>:<TYPE>[<dims>]`.
    pub fn to_arg(&self) -> String {
        let dims = self
            .dimensions
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!("--tag={}:{}[{}]", self.name, self.kind.as_str(), dims)
    }
}

/// Command line of one simulator run.
#[derive(Debug, Clone, Default)]
pub struct SimulatorSpec {
    pub tags: Vec<TagSpec>,
    /// Additional CLI arguments passed through to the simulator.
    pub extra_args: Vec<String>,
}

impl SimulatorSpec {
    /// Add one emulated tag.
    pub fn with_tag(mut self, tag: TagSpec) -> Self {
        self.tags.push(tag);
        self
    }

    /// Pass an extra argument through to the simulator.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Full argument list for the given PLC family.
    pub fn args(&self, target: TargetDevice) -> Vec<String> {
        let mut args = vec![format!("--plc={}", target.simulator_profile())];
        args.extend(self.tags.iter().map(TagSpec::to_arg));
        args.extend(self.extra_args.iter().cloned());
        args
    }
}
