//! Minimal IOC stand-in: loads `record <pv> <tag>` lines from its startup
//! script and serves them over the loopback fake Channel Access protocol.
//!
//! Script directives:
//! - `record <pv> <tag>`: expose `<pv>`, backed by simulator tag `<tag>`
//! - `delay <ms>`: sleep before serving, to emulate a slow boot
//! - `crash`: exit with status 1 once the script has been read

#[path = "common/fake_ca.rs"]
mod fake_ca;

use std::collections::HashMap;
use std::io::{self, BufRead};
use std::net::{TcpListener, TcpStream};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fake_ca::{read_message, write_message, Reply, Request};

struct Database {
    /// pv name -> tag name
    records: HashMap<String, String>,
    /// tag name -> current value
    tags: Mutex<HashMap<String, String>>,
}

fn main() -> ExitCode {
    let Some(script) = std::env::args().nth(1) else {
        eprintln!("usage: fake_ioc <startup script>");
        return ExitCode::from(1);
    };

    let plc = std::env::var("PLC").unwrap_or_default();
    if plc != "omron-njnx" && plc != "ControlLogix" {
        eprintln!("Invalid PLC name supplied: '{plc}'");
        return ExitCode::from(1);
    }
    if std::env::var("EPICS_CA_ADDR_LIST").as_deref() != Ok("127.0.0.1") {
        eprintln!("EPICS_CA_ADDR_LIST must be restricted to loopback");
        return ExitCode::from(1);
    }

    let text = match std::fs::read_to_string(&script) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("Can't open {script}: {err}");
            return ExitCode::from(1);
        }
    };
    println!("< {script}");

    let mut records = HashMap::new();
    let mut delay = Duration::ZERO;
    for line in text.lines().map(str::trim) {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["record", pv, tag] => {
                records.insert(pv.to_string(), tag.to_string());
            }
            ["delay", ms] => {
                delay = Duration::from_millis(ms.parse().unwrap_or(0));
            }
            ["crash"] => {
                eprintln!("driver initialisation failed for PLC {plc}");
                return ExitCode::from(1);
            }
            _ => {}
        }
    }

    thread::sleep(delay);
    let listener = match TcpListener::bind(fake_ca::server_addr()) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("CAS: bind failed: {err}");
            return ExitCode::from(1);
        }
    };

    let tags = records
        .values()
        .map(|tag| (tag.clone(), "0".to_string()))
        .collect();
    let database = Arc::new(Database {
        records,
        tags: Mutex::new(tags),
    });
    thread::spawn(move || serve(listener, database));
    println!("iocRun: All initialization complete");

    // The IOC shell exits on `exit` or end of input.
    for line in io::stdin().lock().lines() {
        match line {
            Ok(line) if line.trim() == "exit" => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    ExitCode::SUCCESS
}

fn serve(listener: TcpListener, database: Arc<Database>) {
    for stream in listener.incoming().flatten() {
        let database = database.clone();
        thread::spawn(move || {
            let _ = handle(stream, &database);
        });
    }
}

fn handle(mut stream: TcpStream, database: &Database) -> io::Result<()> {
    let request: Request = read_message(&stream)?;
    let reply = match request {
        Request::Get { name } => lookup(database, &name, None),
        Request::Put { name, value } => lookup(database, &name, Some(value)),
    };
    write_message(&mut stream, &reply)
}

fn lookup(database: &Database, name: &str, write: Option<String>) -> Reply {
    let Some(tag) = database.records.get(name) else {
        return Reply::NotFound;
    };
    let Ok(mut tags) = database.tags.lock() else {
        return Reply::NotFound;
    };
    if let Some(value) = write {
        tags.insert(tag.clone(), value);
    }
    Reply::Value {
        value: tags.get(tag).cloned().unwrap_or_default(),
    }
}
