//! Streaming bridge for the device's audio data plane.
//!
//! Both directions share one open `AudioSession` but own independent
//! connections. The reader drains a long-lived GET into a bounded chunk
//! queue on a pump task; the writer feeds a long-lived PUT through a paced
//! send loop so audio reaches the device at playback rate. The device
//! answers the data-plane PUT early and keeps accepting raw bytes on the
//! same connection afterwards, so the writer drives a raw TCP connection
//! with a minimal HTTP/1.1 head rather than a pooled client request.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::audio;
use crate::device::{AudioSession, DeviceClient};
use crate::error::{Error, Result};

const READER_QUEUE_CHUNKS: usize = 128;
const WRITER_QUEUE_CHUNKS: usize = 100;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Continuously reads device audio from the data-plane GET.
pub struct AudioStreamReader {
    rx: mpsc::Receiver<Bytes>,
    carry: Bytes,
    stop: CancellationToken,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

impl AudioStreamReader {
    /// Opens the persistent GET and starts the pump task.
    pub async fn connect(client: &DeviceClient, session: &AudioSession) -> Result<Self> {
        let resp = client.open_audio_stream(session).await?;
        tracing::info!(
            target: "stream",
            channel_id = %session.channel_id,
            "audio stream reader connected"
        );
        let (tx, rx) = mpsc::channel(READER_QUEUE_CHUNKS);
        let stop = CancellationToken::new();
        let pump = tokio::spawn(pump_loop(resp, tx, stop.clone()));
        Ok(Self::from_parts(rx, stop, pump))
    }

    fn from_parts(rx: mpsc::Receiver<Bytes>, stop: CancellationToken, pump: JoinHandle<()>) -> Self {
        AudioStreamReader {
            rx,
            carry: Bytes::new(),
            stop,
            pump: Some(pump),
            closed: false,
        }
    }

    /// Fills `buf` with the next queued bytes. A chunk larger than `buf` is
    /// delivered across successive calls without dropping or reordering
    /// anything. Returns `Ok(0)` once the pump has exited and the queue is
    /// drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if self.carry.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.carry = chunk,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.carry.len());
        buf[..n].copy_from_slice(&self.carry[..n]);
        self.carry = self.carry.slice(n..);
        Ok(n)
    }

    /// Reads exactly `buf.len()` bytes unless the stream ends first, in
    /// which case the number of bytes actually read is returned.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Stops the pump and waits for it to exit. After `close` returns, no
    /// further reads of the underlying connection occur, so the device
    /// channel can be closed immediately without racing the socket.
    /// Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop.cancel();
        self.rx.close();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        tracing::debug!(target: "stream", "audio stream reader closed");
    }
}

async fn pump_loop(
    resp: reqwest::Response,
    tx: mpsc::Sender<Bytes>,
    stop: CancellationToken,
) {
    let mut body = resp.bytes_stream();
    let mut chunks = 0usize;
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = body.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                chunks += 1;
                tokio::select! {
                    _ = stop.cancelled() => break,
                    res = tx.send(chunk) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(Err(err)) => {
                tracing::warn!(target: "stream", error = %err, chunks, "reader stream error");
                break;
            }
            None => {
                tracing::debug!(target: "stream", chunks, "reader stream ended");
                break;
            }
        }
    }
    // Dropping the response here tears down the connection; close() joins
    // this task before the channel is released.
}

/// Continuously sends audio to the device through the data-plane PUT.
pub struct AudioStreamWriter {
    tx: mpsc::Sender<Vec<u8>>,
    stop: CancellationToken,
}

impl AudioStreamWriter {
    /// Establishes the persistent PUT (digest-authenticated, 5 s handshake
    /// bound) and starts the paced send loop.
    pub async fn connect(client: &DeviceClient, session: &AudioSession) -> Result<Self> {
        // The device rejects a session id on the data-plane PUT; only the
        // reader echoes it.
        let path = format!(
            "/ISAPI/System/TwoWayAudio/channels/{}/audioData",
            session.channel_id
        );
        let conn = establish_put(client, &path).await?;
        tracing::info!(
            target: "stream",
            channel_id = %session.channel_id,
            "audio stream writer connected"
        );

        let (tx, rx) = mpsc::channel(WRITER_QUEUE_CHUNKS);
        let stop = CancellationToken::new();
        tokio::spawn(send_loop(conn, rx, stop.clone()));
        Ok(AudioStreamWriter { tx, stop })
    }

    /// Queues bytes for paced transmission. Fails fast with `Closed` once
    /// the writer has been stopped or the send loop has died.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let owned = data.to_vec();
        tokio::select! {
            _ = self.stop.cancelled() => Err(Error::Closed),
            res = self.tx.send(owned) => match res {
                Ok(()) => Ok(data.len()),
                Err(_) => Err(Error::Closed),
            },
        }
    }

    /// Signals the send loop to stop. Idempotent; does not wait on socket
    /// teardown beyond releasing the connection.
    pub fn close(&self) {
        self.stop.cancel();
    }
}

/// Forwards queued chunks to the open connection, sleeping for each chunk's
/// playback time so the device receives audio at real-time rate. Bursting
/// makes the device drop or garble audio.
async fn send_loop<W>(mut conn: W, mut rx: mpsc::Receiver<Vec<u8>>, stop: CancellationToken)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut chunks = 0usize;
    loop {
        let data = tokio::select! {
            _ = stop.cancelled() => break,
            data = rx.recv() => data,
        };
        match data {
            Some(data) if !data.is_empty() => {
                if let Err(err) = conn.write_all(&data).await {
                    tracing::warn!(target: "stream", error = %err, chunks, "writer send failed");
                    stop.cancel();
                    break;
                }
                chunks += 1;
                tokio::time::sleep(audio::playback_duration(data.len())).await;
            }
            Some(_) => continue,
            None => break,
        }
    }
    tracing::debug!(target: "stream", chunks, "writer send loop stopped");
}

/// Performs the raw PUT handshake: connect, send an empty-bodied request
/// head, read the device's early response, and hand back the connection
/// ready for raw audio writes. Handles one digest challenge and one
/// empty-challenge firmware retry, mirroring the control-plane client.
async fn establish_put(client: &DeviceClient, path: &str) -> Result<TcpStream> {
    let mut authorization = client.authorization_for("PUT", path);
    let mut defect_retry_left = true;

    for _ in 0..3 {
        let head = timeout(
            HANDSHAKE_TIMEOUT,
            put_attempt(client.host(), path, authorization.as_deref()),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        match head.status {
            200 => return Ok(head.conn),
            401 => match head.www_authenticate {
                Some(challenge) => {
                    authorization = Some(client.respond_challenge(&challenge, "PUT", path)?);
                }
                None if defect_retry_left => {
                    // Empty-challenge firmware defect: retry once as-is.
                    defect_retry_left = false;
                }
                None => {
                    return Err(Error::Protocol(
                        "data plane 401 without challenge".to_string(),
                    ))
                }
            },
            status => {
                return Err(Error::Protocol(format!(
                    "data plane PUT rejected: status {status}"
                )))
            }
        }
    }
    Err(Error::Protocol("data plane authentication failed".to_string()))
}

struct ResponseHead {
    status: u16,
    www_authenticate: Option<String>,
    conn: TcpStream,
}

async fn put_attempt(host: &str, path: &str, authorization: Option<&str>) -> Result<ResponseHead> {
    let addr = host_with_port(host);
    let mut conn = TcpStream::connect(&addr)
        .await
        .map_err(|err| Error::Unreachable(format!("connect {addr}: {err}")))?;

    let mut head = format!("PUT {path} HTTP/1.1\r\nHost: {host}\r\n");
    if let Some(auth) = authorization {
        head.push_str("Authorization: ");
        head.push_str(auth);
        head.push_str("\r\n");
    }
    head.push_str("Content-Type: application/octet-stream\r\nContent-Length: 0\r\n\r\n");
    conn.write_all(head.as_bytes()).await?;

    let (status, www_authenticate) = read_response_head(&mut conn).await?;
    Ok(ResponseHead {
        status,
        www_authenticate,
        conn,
    })
}

async fn read_response_head(conn: &mut TcpStream) -> Result<(u16, Option<String>)> {
    let mut raw = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        if raw.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::Protocol("oversized response head".to_string()));
        }
        let n = conn.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Protocol("connection closed during handshake".to_string()));
        }
        raw.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("bad status line: {status_line}")))?;

    let mut www_authenticate = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("www-authenticate") {
                let value = value.trim();
                if !value.is_empty() {
                    www_authenticate = Some(value.to_string());
                }
            }
        }
    }
    Ok((status, www_authenticate))
}

fn host_with_port(host: &str) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:80")
    }
}
