//! WebRTC session controller.
//!
//! Accepts one SDP offer at a time, preempts any in-flight file playback,
//! and bridges the negotiated RTP tracks to the device's audio data plane.
//! ICE is restricted to host candidates on a fixed UDP port; deployments
//! behind NAT/VPN substitute a statically configured public address into
//! the generated candidates. The answer is returned only after local
//! candidate gathering completes (no trickle ICE).
//!
//! Cleanup is driven by the operation's cancellation token: every trigger
//! (forwarding task exit, connection failure, external abort) cancels the
//! token, and a single supervisor task runs the teardown sequence exactly
//! once: stop the bridge, release the device session, close the peer
//! connection, signal completion, unregister.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio;
use crate::config::WebRtcConfig;
use crate::device::{AudioSession, DeviceClient};
use crate::error::{Error, Result};
use crate::ops::{Operation, OperationKind, OperationRegistry};
use crate::session::SessionManager;
use crate::stream::{AudioStreamReader, AudioStreamWriter};

pub struct CallController {
    cfg: WebRtcConfig,
    client: Arc<DeviceClient>,
    sessions: Arc<dyn SessionManager>,
    registry: Arc<OperationRegistry>,
    /// Serializes concurrent offers so the conflict check and registration
    /// are atomic with respect to each other.
    offer_lock: tokio::sync::Mutex<()>,
}

struct ActiveCall {
    op: Arc<Operation>,
    token: CancellationToken,
    pc: Arc<RTCPeerConnection>,
    client: Arc<DeviceClient>,
    sessions: Arc<dyn SessionManager>,
    registry: Arc<OperationRegistry>,
    media_started: AtomicBool,
    media: tokio::sync::Mutex<CallMedia>,
}

#[derive(Default)]
struct CallMedia {
    session: Option<AudioSession>,
    writer: Option<Arc<AudioStreamWriter>>,
    device_task: Option<JoinHandle<()>>,
    rtp_task: Option<JoinHandle<()>>,
    /// Set once cleanup has swept this struct; late arrivals must release
    /// what they hold themselves instead of stashing it here.
    swept: bool,
}

impl CallController {
    pub fn new(
        cfg: WebRtcConfig,
        client: Arc<DeviceClient>,
        sessions: Arc<dyn SessionManager>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        CallController {
            cfg,
            client,
            sessions,
            registry,
            offer_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Negotiates one call: registers the operation, preempts file
    /// playback, wires the tracks, and returns the answer once ICE
    /// gathering has finished.
    pub async fn handle_offer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        let _serialized = self.offer_lock.lock().await;

        if self.registry.has_active_webrtc() {
            tracing::warn!(target: "call", "rejected offer: call already active");
            return Err(Error::Conflict("webrtc session already active"));
        }

        let token = CancellationToken::new();
        // Register before preempting so the precedence abort can never
        // target this call.
        let op = self.registry.register(OperationKind::WebRtc, token.clone());
        self.registry.abort_play_file_operations().await;

        // Build phase: nothing beyond the registration exists yet, so a
        // failure here just retracts the operation.
        let (call, outgoing) = match self.build_call(op.clone(), token.clone()).await {
            Ok(built) => built,
            Err(err) => {
                op.complete();
                self.registry.unregister(&op);
                return Err(err);
            }
        };

        // From here the supervisor owns teardown: on failure, trigger it
        // and wait for the completion latch.
        match negotiate(&call, outgoing, offer).await {
            Ok(answer) => Ok(answer),
            Err(err) => {
                token.cancel();
                op.wait_complete().await;
                Err(err)
            }
        }
    }

    async fn build_call(
        &self,
        op: Arc<Operation>,
        token: CancellationToken,
    ) -> Result<(Arc<ActiveCall>, Arc<TrackLocalStaticSample>)> {
        let pc = build_peer_connection(&self.cfg).await?;

        let outgoing = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: audio::MIME_TYPE_PCMU.to_owned(),
                clock_rate: audio::SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "intercom-audio".to_owned(),
        ));
        pc.add_track(Arc::clone(&outgoing) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let call = Arc::new(ActiveCall {
            op,
            token,
            pc,
            client: self.client.clone(),
            sessions: self.sessions.clone(),
            registry: self.registry.clone(),
            media_started: AtomicBool::new(false),
            media: tokio::sync::Mutex::new(CallMedia::default()),
        });

        // Single cleanup owner: waits for the cancellation trigger.
        tokio::spawn({
            let call = call.clone();
            async move {
                call.token.cancelled().await;
                run_cleanup(call).await;
            }
        });

        Ok((call, outgoing))
    }
}

/// Wires the connection callbacks and performs the SDP dance.
async fn negotiate(
    call: &Arc<ActiveCall>,
    outgoing: Arc<TrackLocalStaticSample>,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription> {
    let pc = call.pc.clone();

    pc.on_track({
        let call = call.clone();
        Box::new(move |track, _receiver, _transceiver| {
            let call = call.clone();
            let outgoing = outgoing.clone();
            Box::pin(async move {
                tracing::info!(target: "call", kind = %track.kind(), "remote track received");
                start_media(call, track, outgoing).await;
            })
        })
    });

    pc.on_peer_connection_state_change({
        let token = call.token.clone();
        Box::new(move |state: RTCPeerConnectionState| {
            tracing::info!(target: "call", %state, "connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
                    | RTCPeerConnectionState::Disconnected
            ) {
                token.cancel();
            }
            Box::pin(async {})
        })
    });

    pc.on_ice_candidate(Box::new(|candidate| {
        if let Some(candidate) = candidate {
            tracing::debug!(target: "call", ?candidate, "generated ICE candidate");
        }
        Box::pin(async {})
    }));

    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;
    // Setting the local description starts gathering; the promise resolves
    // once the candidate set is final.
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gathered.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| Error::WebRtc("missing local description".to_string()))?;
    tracing::info!(target: "call", "answer ready with gathered candidates");
    Ok(local)
}

async fn build_peer_connection(cfg: &WebRtcConfig) -> Result<Arc<RTCPeerConnection>> {
    let mut media = MediaEngine::default();
    media.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: audio::MIME_TYPE_PCMU.to_owned(),
                clock_rate: audio::SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            payload_type: 0,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let registry = register_default_interceptors(Registry::new(), &mut media)?;

    // Host-only ICE on a fixed UDP port; no STUN or relay. The gateway is
    // meant for LAN/VPN reachability, optionally with one public address
    // rewritten into the host candidates.
    let mut setting = SettingEngine::default();
    setting.set_network_types(vec![NetworkType::Udp4]);
    let udp = EphemeralUDP::new(cfg.media_port, cfg.media_port)
        .map_err(|err| Error::WebRtc(err.to_string()))?;
    setting.set_udp_network(UDPNetwork::Ephemeral(udp));
    if let Some(public_ip) = &cfg.public_ip {
        setting.set_nat_1to1_ips(vec![public_ip.clone()], RTCIceCandidateType::Host);
    }

    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting)
        .build();

    let pc = api.new_peer_connection(RTCConfiguration::default()).await?;
    Ok(Arc::new(pc))
}

/// First inbound media starts the device side: acquire a session, connect
/// both bridge directions, and run the two forwarding tasks. Extra tracks
/// are ignored (one audio track per connection).
async fn start_media(
    call: Arc<ActiveCall>,
    remote: Arc<TrackRemote>,
    outgoing: Arc<TrackLocalStaticSample>,
) {
    if call.media_started.swap(true, Ordering::SeqCst) {
        return;
    }

    let session = match call.sessions.acquire_channel(&call.token).await {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(target: "call", error = %err, "failed to acquire audio session");
            call.token.cancel();
            return;
        }
    };

    // Stash the session before opening the streams so cleanup releases it
    // even if stream setup fails below. If cleanup already swept, we are
    // too late and must release it ourselves.
    {
        let mut media = call.media.lock().await;
        if media.swept {
            drop(media);
            if let Err(err) = call.sessions.release_channel(&session.channel_id).await {
                tracing::error!(target: "call", error = %err, "failed to release late session");
            }
            return;
        }
        media.session = Some(session.clone());
    }
    if call.token.is_cancelled() {
        return;
    }

    let mut reader = match AudioStreamReader::connect(&call.client, &session).await {
        Ok(reader) => reader,
        Err(err) => {
            tracing::error!(target: "call", error = %err, "failed to open device reader");
            call.token.cancel();
            return;
        }
    };
    let writer = match AudioStreamWriter::connect(&call.client, &session).await {
        Ok(writer) => Arc::new(writer),
        Err(err) => {
            tracing::error!(target: "call", error = %err, "failed to open device writer");
            reader.close().await;
            call.token.cancel();
            return;
        }
    };

    let device_task = tokio::spawn({
        let token = call.token.clone();
        let outgoing = outgoing.clone();
        async move {
            pump_device_to_track(&mut reader, &outgoing, &token).await;
            // Join the pump before signalling teardown so no socket read
            // can race the channel close that follows.
            reader.close().await;
            token.cancel();
        }
    });

    let rtp_task = tokio::spawn({
        let token = call.token.clone();
        let writer = writer.clone();
        async move {
            pump_rtp_to_device(&remote, &writer, &token).await;
            token.cancel();
        }
    });

    let mut media = call.media.lock().await;
    if media.swept {
        // Cleanup ran while the streams were being set up; shut the new
        // tasks down the same way it would have.
        drop(media);
        call.token.cancel();
        let _ = device_task.await;
        let _ = rtp_task.await;
        writer.close();
        return;
    }
    media.writer = Some(writer);
    media.device_task = Some(device_task);
    media.rtp_task = Some(rtp_task);
    tracing::info!(
        target: "call",
        channel_id = %session.channel_id,
        "media bridge running"
    );
}

/// Drains the device reader in 20 ms frames and delivers each as a timed
/// sample on the outgoing track.
async fn pump_device_to_track(
    reader: &mut AudioStreamReader,
    outgoing: &TrackLocalStaticSample,
    token: &CancellationToken,
) {
    let mut frame = vec![0u8; audio::FRAME_SIZE];
    loop {
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read_exact(&mut frame) => read,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let sample = Sample {
                    data: Bytes::copy_from_slice(&frame[..n]),
                    duration: audio::playback_duration(n),
                    ..Default::default()
                };
                if let Err(err) = outgoing.write_sample(&sample).await {
                    tracing::warn!(target: "call", error = %err, "outgoing track write failed");
                    break;
                }
            }
        }
    }
}

/// Forwards each incoming RTP payload to the device writer.
async fn pump_rtp_to_device(
    remote: &TrackRemote,
    writer: &AudioStreamWriter,
    token: &CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = remote.read_rtp() => next,
        };
        match next {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                if writer.write(&packet.payload).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(target: "call", error = %err, "remote track ended");
                break;
            }
        }
    }
}

/// Runs exactly once per call, after the cancellation trigger. Order
/// matters: the forwarding tasks (and the reader pump they own) must be
/// fully stopped before the device session is released, and completion is
/// signalled only after every resource is gone.
async fn run_cleanup(call: Arc<ActiveCall>) {
    let (session, writer, device_task, rtp_task) = {
        let mut media = call.media.lock().await;
        media.swept = true;
        (
            media.session.take(),
            media.writer.take(),
            media.device_task.take(),
            media.rtp_task.take(),
        )
    };

    if let Some(task) = device_task {
        let _ = task.await;
    }
    if let Some(task) = rtp_task {
        let _ = task.await;
    }
    if let Some(writer) = writer {
        writer.close();
    }

    if let Some(session) = session {
        if let Err(err) = call.sessions.release_channel(&session.channel_id).await {
            tracing::error!(
                target: "call",
                channel_id = %session.channel_id,
                error = %err,
                "failed to release audio session"
            );
        }
    }

    if let Err(err) = call.pc.close().await {
        tracing::warn!(target: "call", error = %err, "peer connection close failed");
    }

    call.op.complete();
    call.registry.unregister(&call.op);
    tracing::info!(target: "call", "call cleanup complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_pcmu_peer_connection() {
        let cfg = WebRtcConfig {
            public_ip: None,
            media_port: 53211,
        };
        let pc = build_peer_connection(&cfg).await.unwrap();
        assert_eq!(pc.connection_state(), RTCPeerConnectionState::New);
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn nat_public_ip_is_accepted() {
        let cfg = WebRtcConfig {
            public_ip: Some("203.0.113.10".to_string()),
            media_port: 53212,
        };
        let pc = build_peer_connection(&cfg).await.unwrap();
        pc.close().await.unwrap();
    }
}
