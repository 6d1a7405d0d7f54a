#![cfg(feature = "test-support")]
#![allow(dead_code)]

use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use omroneip_harness::{HarnessConfig, Readiness, SimulatorSpec, TagSpec, TagType};
use tempfile::TempDir;

/// Point every fixture script exposes, used as the readiness probe.
pub const HEARTBEAT: &str = "Heartbeat";

pub fn fake_bin(name: &str, compiled: Option<&str>) -> PathBuf {
    if let Some(path) = compiled {
        return PathBuf::from(path);
    }

    // Fallback to the workspace target directory.
    let mut path = std::env::current_exe().expect("current exe");
    path.pop(); // deps
    path.pop(); // debug or release
    path.push(name);
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

pub fn fake_ab_server() -> PathBuf {
    fake_bin("fake_ab_server", option_env!("CARGO_BIN_EXE_fake_ab_server"))
}

pub fn fake_ioc() -> PathBuf {
    fake_bin("fake_ioc", option_env!("CARGO_BIN_EXE_fake_ioc"))
}

pub fn fake_caget() -> PathBuf {
    fake_bin("fake_caget", option_env!("CARGO_BIN_EXE_fake_caget"))
}

pub fn fake_caput() -> PathBuf {
    fake_bin("fake_caput", option_env!("CARGO_BIN_EXE_fake_caput"))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Reserve a loopback port so concurrent tests never share a Channel Access server.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("free loopback port")
}

/// Temporary IOC directory plus a config wired to the fake binaries.
pub struct Fixture {
    pub dir: TempDir,
    pub config: HarnessConfig,
}

/// Build a fixture whose IOC serves `records` as `(pv, tag)` pairs, plus any extra script lines.
pub fn fixture_with_script(records: &[(&str, &str)], extra_lines: &[&str]) -> Fixture {
    init_tracing();
    let dir = TempDir::new().expect("temp ioc dir");

    let mut script = String::from("# generated startup script\n");
    for line in extra_lines {
        script.push_str(line);
        script.push('\n');
    }
    script.push_str(&format!("record {HEARTBEAT} {HEARTBEAT}\n"));
    for (pv, tag) in records {
        script.push_str(&format!("record {pv} {tag}\n"));
    }
    let script_path = dir.path().join("st.cmd");
    fs::write(&script_path, script).expect("write startup script");

    let config = HarnessConfig::new(fake_ab_server(), dir.path(), dir.path().join("base"))
        .with_controller(fake_ioc(), &script_path)
        .with_controller_working_directory(dir.path())
        .with_ca_tools(fake_caget(), fake_caput())
        .with_ca_server_port(free_port())
        .with_point_timeout(Duration::from_secs(1))
        .with_simulator_settle(Duration::from_millis(100))
        .with_readiness(Readiness::Probe {
            point: HEARTBEAT.to_string(),
            timeout: Duration::from_secs(5),
        })
        .with_shutdown_grace(Duration::from_secs(1))
        .with_shutdown_timeout(Duration::from_secs(2));

    Fixture { dir, config }
}

pub fn fixture(records: &[(&str, &str)]) -> Fixture {
    fixture_with_script(records, &[])
}

pub fn simulator_with(tags: &[(&str, TagType)]) -> SimulatorSpec {
    tags.iter().fold(SimulatorSpec::default(), |spec, (name, kind)| {
        spec.with_tag(TagSpec::new(*name, *kind))
    })
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
