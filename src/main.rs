use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fluxrev::capability::create_capability;
use fluxrev::config::Config;
use fluxrev::review::{CapabilityPool, CodeSubmission, ReviewService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fluxrev", version, about = "Multi-agent AI code review pipeline")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "fluxrev.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway.
    Serve {
        /// Override the configured bind host.
        #[arg(long)]
        host: Option<String>,
        /// Override the configured port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Review one file and print the report as JSON.
    Review {
        /// File to review.
        file: PathBuf,
        /// Language tag; inferred from the extension when omitted.
        #[arg(long)]
        language: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fluxrev=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            fluxrev::gateway::run_gateway(config).await
        }
        Command::Review { file, language } => review_file(config, &file, language).await,
    }
}

async fn review_file(config: Config, file: &PathBuf, language: Option<String>) -> Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let language = language
        .or_else(|| language_from_extension(file))
        .unwrap_or_else(|| "python".into());
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".into());

    let capability = create_capability(&config.capability)?;
    let pool = Arc::new(CapabilityPool::new(
        config.pool.capacity,
        Duration::from_secs(config.pool.queue_timeout_secs),
    ));
    let service = ReviewService::new(capability, pool, &config);

    let report = service
        .review(CodeSubmission::new(filename, language, code))
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn language_from_extension(file: &std::path::Path) -> Option<String> {
    let tag = match file.extension()?.to_str()? {
        "py" => "python",
        "js" => "javascript",
        "ts" => "typescript",
        "rs" => "rust",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "rb" => "ruby",
        "php" => "php",
        _ => return None,
    };
    Some(tag.into())
}
