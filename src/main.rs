mod cli;
mod data;
mod error;
mod forecast;
mod metrics;
mod pipeline;
mod topology;

use std::io::{self, Write};
use std::process::ExitCode;

use cli::RunConfig;
use pipeline::Report;

const EXIT_FAILURE: u8 = 1;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    // clap prints its own message and exits with status 2
    let config = match RunConfig::from_args(std::env::args_os()) {
        Ok(config) => config,
        Err(e) => e.exit(),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result = pipeline::run(&config, &mut out);
    let _ = out.flush();

    ExitCode::from(exit_status(&result, &mut io::stderr()))
}

/// Process status for a finished run; failures are described on `err`.
fn exit_status<W: Write>(result: &error::Result<Report>, err: &mut W) -> u8 {
    match result {
        Ok(_) => 0,
        Err(e) => {
            log::debug!("run failed: {e:?}");
            let _ = writeln!(err, "error: {e}");
            EXIT_FAILURE
        }
    }
}
