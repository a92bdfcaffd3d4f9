//! vpcstack CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments or configuration
//! - 3: Validation failure
//! - 5: Synthesis error

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use vpc_stack::StackError;

mod commands;

use commands::{Cli, Commands, ValidationFailed};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const VALIDATION_FAILURE: u8 = 3;
    pub const SYNTH_ERROR: u8 = 5;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Synth(args) => commands::synth::execute(args).await,
        Commands::Validate(args) => commands::validate::execute(args).await,
        Commands::Outputs(args) => commands::outputs::execute(args).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else if quiet {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    };

    let default_filter = format!("vpc_stack={level},vpcstack={level},warn", level = level);
    let filter = if verbose {
        EnvFilter::new(default_filter)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    };

    // Ignored when a subscriber is already installed.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .try_init();
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    if e.downcast_ref::<ValidationFailed>().is_some() {
        return ExitCodes::VALIDATION_FAILURE;
    }

    match e.downcast_ref::<StackError>() {
        Some(StackError::InvalidConfig(_)) | Some(StackError::InvalidCidr(_)) | Some(StackError::Yaml(_)) => {
            ExitCodes::INVALID_ARGS
        }
        Some(StackError::Io(_)) => ExitCodes::GENERAL_ERROR,
        Some(_) => ExitCodes::SYNTH_ERROR,
        None => ExitCodes::GENERAL_ERROR,
    }
}
