#[path = "common/fake_ca.rs"]
mod fake_ca;

use std::process::ExitCode;

use fake_ca::{request_until_connected, Request, ToolArgs};

fn main() -> ExitCode {
    let args = match ToolArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("caput: {err}");
            return ExitCode::from(1);
        }
    };
    let [name, value] = args.positional.as_slice() else {
        eprintln!("caput: expected a pv name and a value");
        return ExitCode::from(1);
    };

    let request = Request::Put {
        name: name.clone(),
        value: value.clone(),
    };
    match request_until_connected(&request, name, args.wait) {
        Some(applied) => {
            println!("{applied}");
            ExitCode::SUCCESS
        }
        None => ExitCode::from(1),
    }
}
