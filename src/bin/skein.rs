//! skein CLI binary

use anyhow::Context as _;
use clap::Parser;
use skein::cli::{map_error, Cli, RunContext};
use skein::config::{ConfigLoader, SkeinConfig};
use skein::logging::{init_logging, LoggingConfig};
use std::process;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&build_logging_config(&cli, &config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!(workspace = %cli.workspace.display(), "skein starting");

    let context = RunContext::new(cli.workspace.clone(), config);
    match context.execute(&cli.command).await {
        Ok(output) => {
            info!("Command completed successfully");
            println!("{}", output);
        }
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("{}", map_error(&e));
            process::exit(1);
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SkeinConfig> {
    let workspace = dunce::canonicalize(&cli.workspace)
        .with_context(|| format!("Workspace not found: {}", cli.workspace.display()))?;
    ConfigLoader::new()
        .with_workspace(workspace)
        .load()
        .context("Failed to load configuration")
}

/// Logging is off unless --verbose; CLI flags override the config file
fn build_logging_config(cli: &Cli, config: &SkeinConfig) -> LoggingConfig {
    let mut logging = config.logging.clone();
    if !cli.verbose {
        logging.level = "off".to_string();
        return logging;
    }
    if let Some(ref level) = cli.log_level {
        logging.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        logging.format = format.clone();
    }
    logging
}
