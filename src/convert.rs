//! Audio conversion for the CLI uploader.
//!
//! The gateway core only accepts raw 8 kHz mono µ-law; conversion from
//! arbitrary formats is delegated to ffmpeg on the caller's machine.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Command;

/// Converts `input` to raw 8 kHz mono µ-law bytes via ffmpeg.
pub async fn to_mulaw(input: &Path) -> Result<Vec<u8>> {
    transcode_with("ffmpeg", input).await
}

async fn transcode_with(program: &str, input: &Path) -> Result<Vec<u8>> {
    let output = Command::new(program)
        .arg("-i")
        .arg(input)
        .args(["-ar", "8000", "-ac", "1", "-acodec", "pcm_mulaw", "-f", "mulaw", "-"])
        .output()
        .await
        .with_context(|| format!("run {program} (is it installed?)"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{program} conversion failed: {}\n{stderr}", output.status);
    }
    if output.stdout.is_empty() {
        anyhow::bail!("{program} produced no audio data");
    }
    Ok(output.stdout)
}
