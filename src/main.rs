//! `cfn` binary entry point.

use std::process::ExitCode;

use clap::Parser;
use content_funnel::cli_app::{Cli, run};

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cfn: {e}");
            ExitCode::FAILURE
        }
    }
}
