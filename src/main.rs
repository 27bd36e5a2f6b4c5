//! elm-watch - watch mode for the Elm compiler.

mod cli;
mod clock;
mod compile;
mod config;
mod elm;
mod errors;
mod hot;
mod logger;
mod make;
mod persist;
mod postprocess;
mod project;
mod spawn;
mod watcher;
mod ws;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};

/// Exit code for argument misuse (0 = success, 1 = compile or
/// configuration errors).
const EXIT_USAGE: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::set_verbose(cli.verbose);

    if let Err(e) = hot::setup_shutdown_handler() {
        log!("error"; "{}", e);
        return ExitCode::from(EXIT_USAGE);
    }

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log!("error"; "{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli) -> Result<u8> {
    let cwd = std::env::current_dir()?;
    let Some(config_path) = config::find_config(&cwd) else {
        log!(
            "error";
            "no {} found in {} or any parent directory",
            config::CONFIG_FILE,
            cwd.display()
        );
        return Ok(1);
    };
    let known = config::target_names(&config_path)?;

    match &cli.command {
        Commands::Make { debug, optimize, targets } => {
            let mode = match cli::make_mode(*debug, *optimize) {
                Ok(mode) => mode,
                Err(usage) => return usage_error(usage),
            };
            let enabled = match cli::enabled_targets(targets, &known) {
                Ok(enabled) => enabled,
                Err(usage) => return usage_error(usage),
            };
            let code = make::run_make(&config_path, enabled, mode)?;
            Ok(code as u8)
        }
        Commands::Hot { debug, optimize, targets } => {
            if let Err(usage) = cli::check_hot_flags(*debug, *optimize) {
                return usage_error(usage);
            }
            let enabled = match cli::enabled_targets(targets, &known) {
                Ok(enabled) => enabled,
                Err(usage) => return usage_error(usage),
            };
            let on_idle: hot::OnIdleCallback = Box::new(|| hot::OnIdle::KeepGoing);
            let code = hot::run_hot(config_path, enabled, on_idle)?;
            Ok(code as u8)
        }
    }
}

fn usage_error(usage: cli::BadUsage) -> Result<u8> {
    log!("error"; "{}", usage.message());
    Ok(EXIT_USAGE)
}
