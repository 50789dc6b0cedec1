mod workflows;

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = workflows::Cli::parse();
    match workflows::dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[forge] error: {e:#}");
            ExitCode::from(distro_forge::BuildExit::Prerequisite.code() as u8)
        }
    }
}
