use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

use crate::error::HarnessError;

/// Channel Access address list; restricts clients to loopback.
pub const CA_ADDR_LIST: &str = "EPICS_CA_ADDR_LIST";
/// Disables broadcast discovery of Channel Access servers.
pub const CA_AUTO_ADDR_LIST: &str = "EPICS_CA_AUTO_ADDR_LIST";
/// Channel Access server port shared by the IOC and the CA tools.
pub const CA_SERVER_PORT: &str = "EPICS_CA_SERVER_PORT";
/// Search path used by the IOC when loading database includes.
pub const DB_INCLUDE_PATH: &str = "EPICS_DB_INCLUDE_PATH";
/// Dynamic library search path for EPICS base.
pub const LIBRARY_PATH: &str = "LD_LIBRARY_PATH";
/// Device-routing selector read by the IOC startup script.
pub const PLC_SELECTOR: &str = "PLC";

const LOOPBACK: &str = "127.0.0.1";

/// PLC family emulated by the simulator and addressed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TargetDevice {
    Omron,
    ControlLogix,
}

impl TargetDevice {
    /// Profile name passed to the simulator as `--plc=<profile>`.
    pub fn simulator_profile(self) -> &'static str {
        match self {
            TargetDevice::Omron => "Omron",
            TargetDevice::ControlLogix => "ControlLogix",
        }
    }

    /// Value of the `PLC` selector consumed by the IOC startup script.
    pub fn routing_value(self) -> &'static str {
        match self {
            TargetDevice::Omron => "omron-njnx",
            TargetDevice::ControlLogix => "ControlLogix",
        }
    }
}

impl fmt::Display for TargetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.simulator_profile())
    }
}

impl FromStr for TargetDevice {
    type Err = HarnessError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Omron" => Ok(TargetDevice::Omron),
            "ControlLogix" => Ok(TargetDevice::ControlLogix),
            other => Err(HarnessError::config(format!(
                "unknown PLC '{other}', expected 'Omron' or 'ControlLogix'"
            ))),
        }
    }
}

/// Filesystem roots the child process environment is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPaths {
    /// Top directory of the IOC application.
    pub ioc_top: PathBuf,
    /// EPICS base installation.
    pub epics_base: PathBuf,
    /// EPICS host architecture, e.g. `linux-x86_64`.
    pub host_arch: String,
    /// Optional Channel Access server port override.
    pub ca_server_port: Option<u16>,
}

/// Immutable environment applied to every process launched by a session.
///
/// Built once per session; the harness never edits its own process environment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessEnv {
    vars: BTreeMap<String, String>,
}

impl ProcessEnv {
    /// Compute the environment for the given target device and install paths.
    pub fn for_target(target: TargetDevice, paths: &EnvPaths) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(CA_ADDR_LIST.to_string(), LOOPBACK.to_string());
        vars.insert(CA_AUTO_ADDR_LIST.to_string(), "NO".to_string());
        vars.insert(
            LIBRARY_PATH.to_string(),
            paths
                .epics_base
                .join("lib")
                .join(&paths.host_arch)
                .display()
                .to_string(),
        );
        vars.insert(
            DB_INCLUDE_PATH.to_string(),
            paths
                .ioc_top
                .join("omroneipApp")
                .join("db")
                .display()
                .to_string(),
        );
        vars.insert(PLC_SELECTOR.to_string(), target.routing_value().to_string());
        if let Some(port) = paths.ca_server_port {
            vars.insert(CA_SERVER_PORT.to_string(), port.to_string());
        }
        Self { vars }
    }

    /// Copy of this environment with one extra variable set.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Look up a single variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Iterate over all variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> EnvPaths {
        EnvPaths {
            ioc_top: PathBuf::from("/opt/omroneip"),
            epics_base: PathBuf::from("/opt/epics/base"),
            host_arch: "linux-x86_64".to_string(),
            ca_server_port: None,
        }
    }

    #[test]
    fn omron_environment_contains_required_keys() {
        let env = ProcessEnv::for_target(TargetDevice::Omron, &paths());

        assert_eq!(env.get(CA_ADDR_LIST), Some("127.0.0.1"));
        assert_eq!(env.get(CA_AUTO_ADDR_LIST), Some("NO"));
        assert_eq!(env.get(PLC_SELECTOR), Some("omron-njnx"));
        assert_eq!(
            env.get(LIBRARY_PATH),
            Some("/opt/epics/base/lib/linux-x86_64")
        );
        assert_eq!(
            env.get(DB_INCLUDE_PATH),
            Some("/opt/omroneip/omroneipApp/db")
        );
        assert_eq!(env.get(CA_SERVER_PORT), None);
    }

    #[test]
    fn routing_value_depends_only_on_target() {
        let omron = ProcessEnv::for_target(TargetDevice::Omron, &paths());
        let logix = ProcessEnv::for_target(TargetDevice::ControlLogix, &paths());

        assert_eq!(logix.get(PLC_SELECTOR), Some("ControlLogix"));
        let differing: Vec<_> = omron
            .iter()
            .zip(logix.iter())
            .filter(|(a, b)| a != b)
            .map(|((key, _), _)| key)
            .collect();
        assert_eq!(differing, vec![PLC_SELECTOR]);
    }

    #[test]
    fn building_twice_is_idempotent() {
        let mut with_port = paths();
        with_port.ca_server_port = Some(15064);

        let first = ProcessEnv::for_target(TargetDevice::ControlLogix, &with_port);
        let second = ProcessEnv::for_target(TargetDevice::ControlLogix, &with_port);
        assert_eq!(first, second);
        assert_eq!(first.get(CA_SERVER_PORT), Some("15064"));
    }

    #[test]
    fn unknown_plc_is_rejected_immediately() {
        let err = "Micro800".parse::<TargetDevice>().unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
        assert_eq!("Omron".parse::<TargetDevice>().unwrap(), TargetDevice::Omron);
    }
}
