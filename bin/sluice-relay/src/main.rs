//! Relays metric event records to a line protocol database.
//!
//! Reads one JSON object per line from a file or standard input, converts each into a metric event, and writes the
//! events to the configured database in batches. The sink is completed at the end of the input, and failed if the
//! process is interrupted.

#![deny(warnings)]
#![deny(missing_docs)]

use std::path::Path;

use clap::Parser as _;
use sluice_app::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
use sluice_config::{ConfigurationLoader, GenericConfiguration};
use sluice_core::{
    config::SinkConfiguration,
    error::{ErrorContext as _, GenericError},
    generic_error,
    sink::Sink,
};
use tokio::io::{AsyncRead, BufReader};
use tracing::{error, info};

mod config;
use self::config::Cli;

mod relay;
use self::relay::relay;

const ENV_PREFIX: &str = "SLUICE";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let configuration = match load_configuration(cli.config.as_deref()) {
        Ok(configuration) => configuration,
        Err(e) => {
            fatal_and_exit(format!("failed to load configuration: {:#}", e));
            return;
        }
    };

    let logging_config = match LoggingConfiguration::from_configuration(&configuration) {
        Ok(logging_config) => logging_config,
        Err(e) => {
            fatal_and_exit(format!("invalid logging configuration: {:#}", e));
            return;
        }
    };

    if let Err(e) = initialize_logging(&logging_config) {
        fatal_and_exit(format!("failed to initialize logging: {:#}", e));
    }

    match run(&configuration, cli.input.as_deref()).await {
        Ok(()) => info!("Relay stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn load_configuration(path: Option<&Path>) -> Result<GenericConfiguration, GenericError> {
    let mut loader = ConfigurationLoader::default();
    if let Some(path) = path {
        loader = loader
            .from_yaml(path)
            .with_error_context(|| format!("Failed to load configuration from '{}'.", path.display()))?;
    }

    Ok(loader.from_environment(ENV_PREFIX)?.into_generic())
}

async fn run(configuration: &GenericConfiguration, input: Option<&Path>) -> Result<(), GenericError> {
    let sink_config = SinkConfiguration::from_configuration(configuration)?;
    let sink = Sink::new(&sink_config)?;

    let reader: Box<dyn AsyncRead + Send + Unpin> = match input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_error_context(|| format!("Failed to open input file '{}'.", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for interrupt signal.");
            std::future::pending::<()>().await;
        }
    };

    let stats = relay(&sink, BufReader::new(reader), shutdown).await?;
    info!(
        accepted = stats.accepted,
        refused = stats.refused,
        skipped = stats.skipped,
        "Finished relaying event records."
    );

    if stats.accepted == 0 && stats.refused > 0 {
        return Err(generic_error!(
            "None of the {} event records were accepted by the sink.",
            stats.refused
        ));
    }

    Ok(())
}
