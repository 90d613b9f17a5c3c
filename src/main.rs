use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use talkback::config::Config;
use talkback::{convert, server};

#[derive(Parser, Debug)]
#[command(name = "talkback", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway server
    Serve {
        /// Path to config file
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
    },
    /// Convert an audio file and play it through the device speaker
    Send {
        /// Audio file to send (any format ffmpeg can read)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Gateway address
        #[arg(short = 's', long = "server", default_value = "http://127.0.0.1:8080")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => run_serve(&config).await,
        Commands::Send { file, server } => run_send(&file, &server).await,
    }
}

async fn run_serve(config: &PathBuf) -> Result<()> {
    let cfg = Config::load(config)?;

    let shutdown = Arc::new(tokio::sync::Notify::new());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
                shutdown.notify_waiters();
            }
        }
    });

    server::serve(&cfg, shutdown).await
}

async fn run_send(file: &PathBuf, server: &str) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("audio file not found: {}", file.display());
    }
    let server_url = url::Url::parse(server).context("parse server address")?;
    if server_url.scheme() != "http" && server_url.scheme() != "https" {
        anyhow::bail!("server address must be http or https");
    }

    tracing::info!(file = %file.display(), "converting audio to 8 kHz mono mu-law");
    let audio = convert::to_mulaw(file).await?;
    tracing::info!(bytes = audio.len(), "uploading to gateway");

    let part = reqwest::multipart::Part::bytes(audio).file_name("audio.raw");
    let form = reqwest::multipart::Form::new().part("audio", part);
    let url = format!("{}/api/audio/play-file", server.trim_end_matches('/'));
    let resp = reqwest::Client::new()
        .post(&url)
        .multipart(form)
        .send()
        .await
        .context("upload audio")?;

    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("gateway returned {status}: {body}");
    }
    tracing::info!("audio played successfully");
    Ok(())
}
