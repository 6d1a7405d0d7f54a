#[path = "common/fake_ca.rs"]
mod fake_ca;

use std::process::ExitCode;

use fake_ca::{request_until_connected, Request, ToolArgs};

fn main() -> ExitCode {
    let args = match ToolArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("caget: {err}");
            return ExitCode::from(1);
        }
    };
    let Some(name) = args.positional.first() else {
        eprintln!("caget: No pv name specified");
        return ExitCode::from(1);
    };

    let request = Request::Get { name: name.clone() };
    match request_until_connected(&request, name, args.wait) {
        Some(value) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        None => ExitCode::from(1),
    }
}
