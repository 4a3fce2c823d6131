//! Skiff CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use skiff::cli::{Cli, LogFormat};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing; logs go to stderr so the container owns stdout
    let level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("skiff={level}").parse()?)
        .add_directive(format!("skiff_network={level}").parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    // Execute command
    let code = cli.execute().await?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)))
}
