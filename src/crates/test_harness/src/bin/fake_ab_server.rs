//! Stand-in for libplctag's `ab_server`: validates `--plc` and `--tag`
//! arguments, then idles until it is terminated.
//!
//! Setting `FAKE_AB_SERVER_IGNORE_SIGTERM=1` makes it ignore `SIGTERM` so
//! tests can exercise forced shutdown.

use std::process::ExitCode;
use std::thread;
use std::time::Duration;

const PLC_TYPES: &[&str] = &["ControlLogix", "Micro800", "Omron"];
const TAG_TYPES: &[&str] = &[
    "BOOL", "SINT", "INT", "DINT", "LINT", "USINT", "UINT", "UDINT", "ULINT", "REAL", "LREAL",
    "STRING",
];

fn main() -> ExitCode {
    let mut plc = None;
    let mut tags = Vec::new();
    for arg in std::env::args().skip(1) {
        if let Some(value) = arg.strip_prefix("--plc=") {
            plc = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("--tag=") {
            match parse_tag(value) {
                Some(tag) => tags.push(tag),
                None => return usage(&format!("invalid tag definition '{value}'")),
            }
        } else {
            return usage(&format!("unknown argument '{arg}'"));
        }
    }

    let plc = match plc {
        Some(plc) if PLC_TYPES.contains(&plc.as_str()) => plc,
        Some(plc) => return usage(&format!("unsupported PLC type '{plc}'")),
        None => return usage("--plc is required"),
    };
    if tags.is_empty() {
        return usage("at least one --tag is required");
    }

    #[cfg(unix)]
    {
        if std::env::var("FAKE_AB_SERVER_IGNORE_SIGTERM").as_deref() == Ok("1") {
            use nix::sys::signal::{signal, SigHandler, Signal};
            // SAFETY: installs SIG_IGN before any other thread exists.
            if let Err(err) = unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) } {
                eprintln!("failed to ignore SIGTERM: {err}");
                return ExitCode::from(1);
            }
        }
    }

    println!("Starting {plc} simulator with {} tag(s)", tags.len());
    for tag in &tags {
        println!("tag {tag}");
    }

    loop {
        thread::sleep(Duration::from_millis(100));
    }
}

/// `<name>:<TYPE>[<dims>]`
fn parse_tag(value: &str) -> Option<String> {
    let (name, rest) = value.split_once(':')?;
    let (kind, dims) = rest.strip_suffix(']')?.split_once('[')?;
    let dims_valid = dims
        .split(',')
        .all(|dim| dim.parse::<u32>().map(|d| d > 0).unwrap_or(false));
    if name.is_empty() || !TAG_TYPES.contains(&kind) || !dims_valid {
        return None;
    }
    Some(format!("{name}:{kind}[{dims}]"))
}

fn usage(message: &str) -> ExitCode {
    eprintln!("ab_server: {message}");
    eprintln!("usage: ab_server --plc=<type> --tag=<name>:<TYPE>[<dims>] ...");
    ExitCode::from(1)
}
