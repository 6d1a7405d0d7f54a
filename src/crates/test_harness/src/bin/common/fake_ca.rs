//! Loopback stand-in for Channel Access shared by the fake IOC and the fake CA tools.
//!
//! One newline-delimited JSON request per TCP connection, one reply back.

#![allow(dead_code)]

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 5064;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Get { name: String },
    Put { name: String, value: String },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Value { value: String },
    NotFound,
}

/// Port from `EPICS_CA_SERVER_PORT`, EPICS default otherwise.
pub fn server_port() -> u16 {
    std::env::var("EPICS_CA_SERVER_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub fn server_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, server_port()))
}

pub fn read_message<T: for<'de> Deserialize<'de>>(stream: &TcpStream) -> io::Result<T> {
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    serde_json::from_str(&line).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub fn write_message<T: Serialize>(stream: &mut TcpStream, message: &T) -> io::Result<()> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    stream.write_all(&bytes)?;
    stream.flush()
}

/// Command line shared by `caget` and `caput`: `[-c] [-t] [-w secs] [-g n] name [value]`.
#[derive(Debug)]
pub struct ToolArgs {
    pub wait: Duration,
    pub positional: Vec<String>,
}

impl ToolArgs {
    pub fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut wait = Duration::from_secs(1);
        let mut positional = Vec::new();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--" => positional.extend(args.by_ref()),
                "-c" | "-t" => {}
                "-w" => {
                    let secs: f64 = args
                        .next()
                        .ok_or("-w needs a value")?
                        .parse()
                        .map_err(|err| format!("invalid -w value: {err}"))?;
                    wait = Duration::from_secs_f64(secs);
                }
                "-g" => {
                    args.next().ok_or("-g needs a value")?;
                }
                _ => positional.push(arg),
            }
        }
        Ok(Self { wait, positional })
    }
}

/// Retry until the IOC answers for `name` or `wait` elapses, like a CA channel search.
pub fn request_until_connected(request: &Request, name: &str, wait: Duration) -> Option<String> {
    let deadline = Instant::now() + wait;
    loop {
        if let Ok(Reply::Value { value }) = exchange(request, deadline) {
            return Some(value);
        }
        if Instant::now() >= deadline {
            eprintln!("Channel connect timed out: '{name}' not found.");
            return None;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn exchange(request: &Request, deadline: Instant) -> io::Result<Reply> {
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(10));
    let mut stream = TcpStream::connect_timeout(&server_addr(), remaining)?;
    stream.set_read_timeout(Some(remaining))?;
    write_message(&mut stream, request)?;
    read_message(&stream)
}
