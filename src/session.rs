//! Exclusive acquisition and release of the device audio channel.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::device::{AudioSession, Channel, DeviceClient};
use crate::error::{Error, Result};

/// Backend-agnostic contract for managing device audio sessions. The
/// operation registry and both operation types talk to the device channel
/// exclusively through this seam.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Finds and opens the first available channel. The channel list is
    /// re-queried on every call; device-side state is never cached.
    async fn acquire_channel(&self, cancel: &CancellationToken) -> Result<AudioSession>;

    /// Closes a channel by id, regardless of which operation opened it.
    async fn release_channel(&self, channel_id: &str) -> Result<()>;

    /// Raw channel listing, used by the registry's bulk-cleanup sweep.
    async fn list_channels(&self) -> Result<Vec<Channel>>;
}

/// `SessionManager` backed by the device protocol client.
pub struct DeviceSessionManager {
    client: std::sync::Arc<DeviceClient>,
}

impl DeviceSessionManager {
    pub fn new(client: std::sync::Arc<DeviceClient>) -> Self {
        DeviceSessionManager { client }
    }
}

#[async_trait]
impl SessionManager for DeviceSessionManager {
    async fn acquire_channel(&self, cancel: &CancellationToken) -> Result<AudioSession> {
        if cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }

        let channels = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Interrupted),
            channels = self.client.list_channels() => channels?,
        };

        // First available wins. A concurrent device-side open can still
        // race this selection; the open call below is the arbiter.
        let Some(channel) = channels.iter().find(|c| !c.enabled) else {
            tracing::warn!(
                target: "session",
                total = channels.len(),
                "no available audio channels"
            );
            return Err(Error::NoAvailableChannels);
        };

        let session = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Interrupted),
            session = self.client.open_channel(&channel.id) => session?,
        };
        tracing::info!(
            target: "session",
            channel_id = %session.channel_id,
            session_id = %session.session_id,
            "acquired audio channel"
        );
        Ok(session)
    }

    async fn release_channel(&self, channel_id: &str) -> Result<()> {
        self.client.close_channel(channel_id).await?;
        tracing::info!(target: "session", channel_id, "released audio channel");
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<Channel>> {
        self.client.list_channels().await
    }
}
