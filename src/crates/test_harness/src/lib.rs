//! Utilities for running the omroneip driver end to end in tests: spawn the
//! libplctag PLC simulator, spawn the EPICS IOC hosting the driver, and drive
//! the IOC's process variables through Channel Access.
//!
//! Typical usage:
//! ```no_run
//! use omroneip_harness::{
//!     HarnessConfig, Point, PointType, Session, SimulatorSpec, TagSpec, TagType,
//! };
//! use std::time::Duration;
//!
//! let config = HarnessConfig::from_env().expect("harness configuration");
//! let mut session = Session::new(config);
//! session
//!     .start_simulator(&SimulatorSpec::default().with_tag(TagSpec::new("TestREAL", TagType::Real)))
//!     .expect("simulator should launch");
//! session.start_controller().expect("IOC should start");
//!
//! let write = Point::new("TestREAL:Write", PointType::Float32);
//! let read = Point::new("TestREAL:Read", PointType::Float32);
//! session.expect_round_trip(&write, &read, -12.580238505_f32, Duration::from_secs(1));
//!
//! let report = session.finish();
//! println!("{report}");
//! report.into_result().expect("all assertions should pass");
//! ```

mod ca;
mod config;
mod env;
mod error;
mod harness;
mod point;
mod process;
mod report;

pub use ca::CaTools;
pub use config::{HarnessConfig, Readiness, SimulatorSpec, TagSpec, TagType};
pub use env::{EnvPaths, ProcessEnv, TargetDevice};
pub use error::{HarnessError, HarnessResult};
pub use harness::{Session, SessionState};
pub use point::{ConnectionState, Point, PointSession, PointTransport, PointType, PointValue};
pub use process::{
    CapturedOutput, LogLine, LogStream, ProcessHandle, ProcessSpec, ProcessState, StdinMode,
    Termination,
};
pub use report::SessionReport;

/// Names of the environment variables handed to child processes.
pub mod env_vars {
    pub use crate::config::{
        EPICS_BASE_VAR, EPICS_HOST_ARCH_VAR, IOC_TOP_VAR, PLC_VAR, SIMULATOR_VAR,
    };
    pub use crate::env::{
        CA_ADDR_LIST, CA_AUTO_ADDR_LIST, CA_SERVER_PORT, DB_INCLUDE_PATH, LIBRARY_PATH,
        PLC_SELECTOR,
    };
}
