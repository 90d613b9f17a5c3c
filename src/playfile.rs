//! One-shot playback of an uploaded clip on the device speaker.
//!
//! The payload must already be 8 kHz mono µ-law; the uploader converts
//! before calling in. Playback refuses to start while any other operation
//! is active, registers itself so an incoming call can preempt it, and
//! does not report success until the audio has audibly finished playing.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::audio;
use crate::device::{AudioSession, DeviceClient};
use crate::error::{Error, Result};
use crate::ops::{OperationKind, OperationRegistry};
use crate::session::SessionManager;
use crate::stream::AudioStreamWriter;

const CHUNK_SIZE: usize = 4096;

/// Plays `data` through the device speaker. Blocks until playback has
/// finished (or the operation is preempted/aborted, surfacing
/// `Interrupted`).
pub async fn play_file(
    client: &Arc<DeviceClient>,
    sessions: &Arc<dyn SessionManager>,
    registry: &Arc<OperationRegistry>,
    data: Bytes,
) -> Result<()> {
    if registry.has_active_operation() {
        tracing::warn!(target: "playfile", "rejected: another operation is active");
        return Err(Error::Conflict("another operation is active"));
    }
    if data.is_empty() {
        return Err(Error::Protocol("empty audio payload".to_string()));
    }

    let token = CancellationToken::new();
    let op = registry.register(OperationKind::PlayFile, token.clone());
    tracing::info!(target: "playfile", bytes = data.len(), "playback starting");

    let outcome = run_playback(client, sessions, &token, &data).await;

    // Resources are released inside run_playback; completion fires only
    // after that, because preempting callers block on it before touching
    // the channel.
    op.complete();
    registry.unregister(&op);

    match &outcome {
        Ok(()) => tracing::info!(target: "playfile", "playback complete"),
        Err(err) => tracing::warn!(target: "playfile", error = %err, "playback ended early"),
    }
    outcome
}

async fn run_playback(
    client: &Arc<DeviceClient>,
    sessions: &Arc<dyn SessionManager>,
    token: &CancellationToken,
    data: &Bytes,
) -> Result<()> {
    let session = sessions.acquire_channel(token).await?;

    let result = stream_payload(client, &session, token, data).await;

    // The channel is released whatever happened above; a release failure
    // surfaces unless it would mask the playback error.
    match sessions.release_channel(&session.channel_id).await {
        Ok(()) => result,
        Err(release_err) => {
            if result.is_err() {
                tracing::warn!(
                    target: "playfile",
                    channel_id = %session.channel_id,
                    error = %release_err,
                    "failed to release channel after playback error"
                );
                result
            } else {
                Err(release_err)
            }
        }
    }
}

async fn stream_payload(
    client: &Arc<DeviceClient>,
    session: &AudioSession,
    token: &CancellationToken,
    data: &Bytes,
) -> Result<()> {
    if token.is_cancelled() {
        return Err(Error::Interrupted);
    }
    let writer = AudioStreamWriter::connect(client, session).await?;

    let result = async {
        for chunk in data.chunks(CHUNK_SIZE) {
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Interrupted),
                written = writer.write(chunk) => {
                    written?;
                }
            }
        }

        // The writer queues and paces asynchronously; hold the request
        // open until the audio has actually finished playing.
        let duration = audio::playback_duration(data.len());
        tracing::debug!(
            target: "playfile",
            seconds = duration.as_secs_f64(),
            "waiting for playback to finish"
        );
        tokio::select! {
            _ = token.cancelled() => Err(Error::Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
    .await;

    writer.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OperationRegistry;
    use crate::session::SessionManager;
    use async_trait::async_trait;

    struct NoSessions;

    #[async_trait]
    impl SessionManager for NoSessions {
        async fn acquire_channel(&self, _cancel: &CancellationToken) -> Result<AudioSession> {
            Err(Error::NoAvailableChannels)
        }
        async fn release_channel(&self, _channel_id: &str) -> Result<()> {
            Ok(())
        }
        async fn list_channels(&self) -> Result<Vec<crate::device::Channel>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn rejects_when_another_operation_is_active() {
        let sessions: Arc<dyn SessionManager> = Arc::new(NoSessions);
        let registry = Arc::new(OperationRegistry::new(sessions.clone()));
        let client = Arc::new(DeviceClient::new("127.0.0.1:9", "u", "p").unwrap());

        let _other = registry.register(OperationKind::WebRtc, CancellationToken::new());
        let err = play_file(&client, &sessions, &registry, Bytes::from_static(&[0u8; 16]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn no_channels_unregisters_and_completes() {
        let sessions: Arc<dyn SessionManager> = Arc::new(NoSessions);
        let registry = Arc::new(OperationRegistry::new(sessions.clone()));
        let client = Arc::new(DeviceClient::new("127.0.0.1:9", "u", "p").unwrap());

        let err = play_file(&client, &sessions, &registry, Bytes::from_static(&[0u8; 16]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAvailableChannels));
        // Failure paths must not leave a stale registration behind.
        assert!(!registry.has_active_operation());
    }

    #[tokio::test]
    async fn rejects_empty_payload() {
        let sessions: Arc<dyn SessionManager> = Arc::new(NoSessions);
        let registry = Arc::new(OperationRegistry::new(sessions.clone()));
        let client = Arc::new(DeviceClient::new("127.0.0.1:9", "u", "p").unwrap());

        let err = play_file(&client, &sessions, &registry, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!registry.has_active_operation());
    }
}
