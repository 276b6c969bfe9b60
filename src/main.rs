use argh::FromArgs;
use mysh::{Interpreter, ShellConfig};
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable holding the log filter, e.g. `MYSH_LOG=mysh=debug`.
const LOG_ENV: &str = "MYSH_LOG";

#[derive(FromArgs)]
/// Interactive shell with pipelines and background jobs.
struct Args {
    /// text printed before every input line
    #[argh(option)]
    prompt: Option<String>,

    /// maximum number of background jobs tracked at once
    #[argh(option)]
    max_jobs: Option<usize>,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Args = argh::from_env();
    let defaults = ShellConfig::default();
    let config = ShellConfig {
        prompt: args.prompt.unwrap_or(defaults.prompt),
        job_capacity: args.max_jobs.unwrap_or(defaults.job_capacity),
        ..defaults
    };

    match Interpreter::new(config).repl() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::FAILURE
        }
    }
}
