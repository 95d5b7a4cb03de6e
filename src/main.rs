//! Yeti command-line tools
//!
//! Query a Yeti deployment and drive the client's CI workflows.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

/// Yeti client tools
#[derive(Parser)]
#[command(name = "yeti")]
#[command(about = "Command-line client for the Yeti platform")]
#[command(version)]
struct Cli {
    /// Root URL of the Yeti deployment
    #[arg(long, global = true, env = "YETI_ENDPOINT")]
    endpoint: Option<String>,

    /// API key exchanged for an access token
    #[arg(long, global = true, env = "YETI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Client configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Indicator queries
    Indicators {
        #[command(subcommand)]
        command: IndicatorCommands,
    },

    /// Observable management
    Observables {
        #[command(subcommand)]
        command: ObservableCommands,
    },

    /// Bloom filter lookups
    Bloom {
        #[command(subcommand)]
        command: BloomCommands,
    },

    /// Run and support CI workflows
    Ci {
        #[command(subcommand)]
        command: CiCommands,
    },
}

#[derive(Subcommand)]
enum IndicatorCommands {
    /// Search indicators, printing one name per line
    Search {
        #[arg(short, long)]
        name: Option<String>,

        /// Indicator type
        #[arg(short = 't', long = "type", default_value = "yara")]
        indicator_type: String,
    },

    /// Find a single indicator by exact name and type
    Find {
        #[arg(short, long)]
        name: String,

        #[arg(short = 't', long = "type")]
        indicator_type: String,
    },
}

#[derive(Subcommand)]
enum ObservableCommands {
    /// Add an observable
    Add {
        #[arg(long)]
        value: String,

        /// Observable type, e.g. hostname
        #[arg(short = 't', long = "type")]
        observable_type: String,

        /// Tag to apply (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
}

#[derive(Subcommand)]
enum BloomCommands {
    /// Check values against the server's bloom filters
    Search {
        #[arg(required = true)]
        values: Vec<String>,
    },
}

#[derive(Subcommand)]
enum CiCommands {
    /// Run a workflow file for an event
    Run {
        /// Workflow YAML file
        workflow: PathBuf,

        /// Triggering event (pull_request, release)
        #[arg(short, long)]
        event: String,

        /// Working directory for the jobs
        #[arg(short, long, default_value = ".")]
        workdir: PathBuf,
    },

    /// Poll the endpoint until the deployment answers
    WaitReady {
        #[arg(long, default_value = "120")]
        timeout_secs: u64,

        #[arg(long, default_value = "2000")]
        interval_ms: u64,
    },

    /// Create the admin test user and print its API key
    ProvisionKey {
        #[arg(long, default_value = "yeti-docker/prod")]
        compose_dir: PathBuf,

        #[arg(long, default_value = "test")]
        user: String,

        #[arg(long, default_value = "test")]
        password: String,
    },
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("yeti={},warn", log_level))),
        )
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("❌ {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Dispatch a command; `Ok(false)` means it ran but did not succeed
async fn run(cli: Cli) -> Result<bool> {
    let connection = commands::Connection {
        endpoint: cli.endpoint,
        api_key: cli.api_key,
        config: cli.config,
    };

    match cli.command {
        Commands::Indicators { command } => match command {
            IndicatorCommands::Search {
                name,
                indicator_type,
            } => commands::search_indicators(&connection, name, indicator_type).await,
            IndicatorCommands::Find {
                name,
                indicator_type,
            } => commands::find_indicator(&connection, &name, &indicator_type).await,
        },
        Commands::Observables { command } => match command {
            ObservableCommands::Add {
                value,
                observable_type,
                tags,
            } => commands::add_observable(&connection, &value, &observable_type, &tags).await,
        },
        Commands::Bloom { command } => match command {
            BloomCommands::Search { values } => commands::search_bloom(&connection, &values).await,
        },
        Commands::Ci { command } => match command {
            CiCommands::Run {
                workflow,
                event,
                workdir,
            } => {
                let event = event
                    .parse()
                    .with_context(|| format!("Invalid --event '{}'", event))?;
                commands::run_workflow(&workflow, event, workdir).await
            }
            CiCommands::WaitReady {
                timeout_secs,
                interval_ms,
            } => commands::wait_ready(&connection, timeout_secs, interval_ms).await,
            CiCommands::ProvisionKey {
                compose_dir,
                user,
                password,
            } => commands::provision_key(compose_dir, user, password).await,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_type(cli: Cli) -> String {
        match cli.command {
            Commands::Indicators {
                command: IndicatorCommands::Search { indicator_type, .. },
            } => indicator_type,
            _ => panic!("expected `indicators search`"),
        }
    }

    #[test]
    fn test_indicator_search_defaults_to_yara() {
        let cli = Cli::try_parse_from([
            "yeti",
            "--endpoint",
            "http://localhost:80",
            "indicators",
            "search",
        ])
        .unwrap();
        assert_eq!(search_type(cli), "yara");
    }

    #[test]
    fn test_indicator_search_type_is_overridable() {
        let cli = Cli::try_parse_from(["yeti", "indicators", "search", "--type", "regex", "-n", "x"])
            .unwrap();
        assert_eq!(search_type(cli), "regex");
    }

    #[tokio::test]
    async fn test_bare_indicator_search_reaches_the_server() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = format!("http://127.0.0.1:{}", port);
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("yeti.yaml");
        std::fs::write(
            &config,
            format!("endpoint: {}\nretry:\n  max_attempts: 1\n", endpoint),
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "yeti",
            "--endpoint",
            endpoint.as_str(),
            "--config",
            config.to_str().unwrap(),
            "indicators",
            "search",
        ])
        .unwrap();
        let err = run(cli).await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(!message.contains("You must provide"), "{}", message);
        assert!(err.downcast_ref::<yeti::YetiError>().is_some(), "{}", message);
    }
}
