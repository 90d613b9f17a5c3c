use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Device host as `host` or `host:port` (no scheme).
    pub device_host: String,
    pub device_username: String,
    pub device_password: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebRtcConfig {
    /// Public address substituted into generated ICE candidates for
    /// NAT/VPN deployments. Candidates stay host-local when unset.
    #[serde(default)]
    pub public_ip: Option<String>,
    /// Fixed local UDP port for RTP media.
    #[serde(default = "default_media_port")]
    pub media_port: u16,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        WebRtcConfig {
            public_ip: None,
            media_port: default_media_port(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_media_port() -> u16 {
    50000
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment overrides for the WebRTC knobs, matching how deployments
    /// inject them without editing the config file.
    fn apply_env(&mut self) {
        if let Ok(ip) = std::env::var("WEBRTC_PUBLIC_IP") {
            if !ip.trim().is_empty() {
                self.webrtc.public_ip = Some(ip.trim().to_string());
            }
        }
        if let Ok(port) = std::env::var("WEBRTC_MEDIA_PORT") {
            if let Ok(port) = port.trim().parse() {
                self.webrtc.media_port = port;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.device_host.trim().is_empty() {
            anyhow::bail!("device_host is empty");
        }
        if self.device_host.contains("://") {
            anyhow::bail!("device_host must be host[:port], not a URL");
        }
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("listen_addr {:?} (use numeric IP:port)", self.listen_addr))?;
        if let Some(ip) = &self.webrtc.public_ip {
            ip.parse::<IpAddr>()
                .with_context(|| format!("webrtc.public_ip {ip:?}"))?;
        }
        if self.webrtc.media_port == 0 {
            anyhow::bail!("webrtc.media_port must be non-zero");
        }
        Ok(())
    }
}
