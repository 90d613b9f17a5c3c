//! HTTP client for the device's ISAPI-style two-way audio control plane.
//!
//! All requests authenticate with HTTP Digest. Device firmware has a known
//! defect where a fresh request is occasionally answered with 401 and an
//! empty `WWW-Authenticate` header; that exact case is retried once,
//! transparently. A 401 carrying a real challenge goes through the normal
//! challenge/response dance; any 401 after that is surfaced.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Client as HttpClient, ClientBuilder, Method, Response, StatusCode};
use serde::Deserialize;

use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One device-side audio channel as reported by the channel list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    /// `true` means the channel is currently held by some session.
    pub enabled: bool,
}

/// An open two-way audio session. The device-assigned session id may be
/// empty and must be echoed on data-plane requests when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSession {
    pub channel_id: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
struct ChannelXml {
    id: String,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ChannelListXml {
    #[serde(rename = "TwoWayAudioChannel", default)]
    channels: Vec<ChannelXml>,
}

#[derive(Debug, Deserialize)]
struct SessionXml {
    #[serde(rename = "sessionId", default)]
    session_id: String,
}

/// Digest-authenticated client for one device.
pub struct DeviceClient {
    host: String,
    username: String,
    password: String,
    http: HttpClient,
    auth: Mutex<Option<DigestState>>,
}

impl DeviceClient {
    pub fn new(host: &str, username: &str, password: &str) -> Result<Self> {
        let http = ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(Error::from_http)?;
        Ok(DeviceClient {
            host: host.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http,
            auth: Mutex::new(None),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Queries the device's channel list.
    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let path = "/ISAPI/System/TwoWayAudio/channels";
        let resp = self.send_authed(Method::GET, path).await?;
        let body = read_success_body(resp, "list channels").await?;
        let list: ChannelListXml = quick_xml::de::from_str(&body)
            .map_err(|e| Error::Protocol(format!("parse channel list: {e}")))?;
        let channels: Vec<Channel> = list
            .channels
            .into_iter()
            .map(|c| Channel {
                id: c.id,
                enabled: c.enabled,
            })
            .collect();
        tracing::debug!(target: "device", count = channels.len(), "listed audio channels");
        Ok(channels)
    }

    /// Opens a channel; the returned session id must be echoed on
    /// data-plane requests.
    pub async fn open_channel(&self, channel_id: &str) -> Result<AudioSession> {
        let path = format!("/ISAPI/System/TwoWayAudio/channels/{channel_id}/open");
        let resp = self.send_authed(Method::PUT, &path).await?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(Error::Conflict("channel already open"));
        }
        let body = read_success_body(resp, "open channel").await?;
        let session: SessionXml = quick_xml::de::from_str(&body)
            .map_err(|e| Error::Protocol(format!("parse open response: {e}")))?;
        tracing::info!(
            target: "device",
            channel_id,
            session_id = %session.session_id,
            "audio channel opened"
        );
        Ok(AudioSession {
            channel_id: channel_id.to_string(),
            session_id: session.session_id,
        })
    }

    pub async fn close_channel(&self, channel_id: &str) -> Result<()> {
        let path = format!("/ISAPI/System/TwoWayAudio/channels/{channel_id}/close");
        let resp = self.send_authed(Method::PUT, &path).await?;
        read_success_body(resp, "close channel").await?;
        tracing::info!(target: "device", channel_id, "audio channel closed");
        Ok(())
    }

    /// Path of the data-plane endpoint for a session.
    pub fn audio_data_path(session: &AudioSession) -> String {
        let mut path = format!(
            "/ISAPI/System/TwoWayAudio/channels/{}/audioData",
            session.channel_id
        );
        if !session.session_id.is_empty() {
            path.push_str("?sessionId=");
            path.push_str(&session.session_id);
        }
        path
    }

    /// Opens the long-lived data-plane GET used by the stream reader.
    /// The response body streams raw audio for the session's lifetime.
    pub async fn open_audio_stream(&self, session: &AudioSession) -> Result<Response> {
        let path = Self::audio_data_path(session);
        let resp = self.send_authed(Method::GET, &path).await?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!(
                "audio stream rejected: status {status}, body: {body}"
            )));
        }
        Ok(resp)
    }

    /// Sends one control-plane request, handling digest auth and the
    /// empty-challenge firmware defect. The returned response may still
    /// carry a non-success status for the caller to map.
    async fn send_authed(&self, method: Method, path: &str) -> Result<Response> {
        let url = format!("http://{}{}", self.host, path);
        let cached = self.authorization_for(method.as_str(), path);

        let mut resp = self.execute(method.clone(), &url, cached.clone()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        if challenge_header(&resp).is_none() {
            // Firmware defect: 401 with no challenge. Retry the same
            // request once before surfacing anything.
            tracing::debug!(target: "device", path, "401 with empty challenge, retrying once");
            resp = self.execute(method.clone(), &url, cached).await?;
            if resp.status() != StatusCode::UNAUTHORIZED {
                return Ok(resp);
            }
        }

        let Some(challenge) = challenge_header(&resp) else {
            return Err(Error::Protocol(
                "401 without WWW-Authenticate challenge".to_string(),
            ));
        };

        let header = self.respond_challenge(&challenge, method.as_str(), path)?;
        self.execute(method, &url, Some(header)).await
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        authorization: Option<String>,
    ) -> Result<Response> {
        let mut req = self.http.request(method, url);
        if let Some(value) = authorization {
            req = req.header(reqwest::header::AUTHORIZATION, value);
        }
        req.send().await.map_err(Error::from_http)
    }

    /// Computes an `Authorization` value from the cached challenge, if any.
    /// Used both for preemptive auth here and by the stream writer, which
    /// drives its own connection.
    pub(crate) fn authorization_for(&self, method: &str, uri: &str) -> Option<String> {
        let mut guard = self.auth.lock().unwrap();
        guard
            .as_mut()
            .map(|state| state.respond(&self.username, &self.password, method, uri))
    }

    /// Parses a `WWW-Authenticate` value, caches it, and computes the
    /// response header for the given request line.
    pub(crate) fn respond_challenge(
        &self,
        challenge: &str,
        method: &str,
        uri: &str,
    ) -> Result<String> {
        let mut state = DigestState::parse(challenge)?;
        let header = state.respond(&self.username, &self.password, method, uri);
        *self.auth.lock().unwrap() = Some(state);
        Ok(header)
    }
}

fn challenge_header(resp: &Response) -> Option<String> {
    let value = resp.headers().get(WWW_AUTHENTICATE)?;
    let value = value.to_str().ok()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

async fn read_success_body(resp: Response, op: &str) -> Result<String> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if status != StatusCode::OK {
        return Err(Error::Protocol(format!(
            "{op} failed: status {status}, body: {body}"
        )));
    }
    Ok(body)
}

/// Cached digest challenge plus the per-challenge nonce counter.
struct DigestState {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop_auth: bool,
    nc: u32,
}

impl DigestState {
    fn parse(header: &str) -> Result<Self> {
        let rest = header
            .strip_prefix("Digest ")
            .or_else(|| header.strip_prefix("digest "))
            .ok_or_else(|| Error::Protocol(format!("unsupported auth scheme: {header}")))?;

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;
        for (key, value) in parse_auth_params(rest) {
            match key.as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop_auth = value.split(',').any(|q| q.trim() == "auth"),
                _ => {}
            }
        }

        Ok(DigestState {
            realm: realm.ok_or_else(|| Error::Protocol("digest challenge missing realm".into()))?,
            nonce: nonce.ok_or_else(|| Error::Protocol("digest challenge missing nonce".into()))?,
            opaque,
            qop_auth,
            nc: 0,
        })
    }

    fn respond(&mut self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let cnonce = uuid::Uuid::new_v4().as_simple().to_string();
        self.respond_with_cnonce(username, password, method, uri, &cnonce)
    }

    fn respond_with_cnonce(
        &mut self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        self.nc += 1;
        let ha1 = md5_hex(&format!("{username}:{}:{password}", self.realm));
        let ha2 = md5_hex(&format!("{method}:{uri}"));

        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\"",
            self.realm, self.nonce
        );
        let response = if self.qop_auth {
            let nc = format!("{:08x}", self.nc);
            let response = md5_hex(&format!(
                "{ha1}:{}:{nc}:{cnonce}:auth:{ha2}",
                self.nonce
            ));
            header.push_str(&format!(", qop=auth, nc={nc}, cnonce=\"{cnonce}\""));
            response
        } else {
            md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce))
        };
        header.push_str(&format!(", response=\"{response}\""));
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header
    }
}

/// Splits `k=v, k="v with, comma"` challenge parameters, honoring quotes.
fn parse_auth_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            value = stripped[..end].to_string();
            rest = stripped.get(end + 1..).unwrap_or("").trim_start();
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest.get(end + 1..).unwrap_or("").trim_start();
        }
        params.push((key, value));
    }
    params
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_list_xml() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<TwoWayAudioChannelList version="2.0">
  <TwoWayAudioChannel>
    <id>1</id>
    <enabled>false</enabled>
    <audioCompressionType>G.711ulaw</audioCompressionType>
  </TwoWayAudioChannel>
  <TwoWayAudioChannel>
    <id>2</id>
    <enabled>true</enabled>
  </TwoWayAudioChannel>
</TwoWayAudioChannelList>"#;
        let list: ChannelListXml = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(list.channels.len(), 2);
        assert_eq!(list.channels[0].id, "1");
        assert!(!list.channels[0].enabled);
        assert!(list.channels[1].enabled);
    }

    #[test]
    fn parses_open_session_xml() {
        let xml = r#"<TwoWayAudioSession><sessionId>abc-123</sessionId></TwoWayAudioSession>"#;
        let session: SessionXml = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(session.session_id, "abc-123");

        let empty = r#"<TwoWayAudioSession></TwoWayAudioSession>"#;
        let session: SessionXml = quick_xml::de::from_str(empty).unwrap();
        assert_eq!(session.session_id, "");
    }

    #[test]
    fn audio_data_path_appends_session_id() {
        let with_id = AudioSession {
            channel_id: "1".into(),
            session_id: "s42".into(),
        };
        assert_eq!(
            DeviceClient::audio_data_path(&with_id),
            "/ISAPI/System/TwoWayAudio/channels/1/audioData?sessionId=s42"
        );

        let without = AudioSession {
            channel_id: "1".into(),
            session_id: String::new(),
        };
        assert_eq!(
            DeviceClient::audio_data_path(&without),
            "/ISAPI/System/TwoWayAudio/channels/1/audioData"
        );
    }

    #[test]
    fn digest_response_matches_rfc2617_example() {
        let header = r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#;
        let mut state = DigestState::parse(header).unwrap();
        let value = state.respond_with_cnonce(
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "0a4f113b",
        );
        assert!(value.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn digest_without_qop_uses_legacy_response() {
        let header = r#"Digest realm="dev", nonce="abc""#;
        let mut state = DigestState::parse(header).unwrap();
        let value = state.respond_with_cnonce("user", "pass", "GET", "/x", "ignored");
        let ha1 = md5_hex("user:dev:pass");
        let ha2 = md5_hex("GET:/x");
        let expected = md5_hex(&format!("{ha1}:abc:{ha2}"));
        assert!(value.contains(&format!("response=\"{expected}\"")));
        assert!(!value.contains("qop="));
    }

    #[test]
    fn nonce_counter_increments_per_response() {
        let header = r#"Digest realm="dev", nonce="abc", qop="auth""#;
        let mut state = DigestState::parse(header).unwrap();
        let first = state.respond_with_cnonce("u", "p", "GET", "/x", "c");
        let second = state.respond_with_cnonce("u", "p", "GET", "/x", "c");
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn auth_params_handle_quoted_commas() {
        let params = parse_auth_params(r#"realm="a, b", nonce=xyz, qop="auth""#);
        assert_eq!(params[0], ("realm".to_string(), "a, b".to_string()));
        assert_eq!(params[1], ("nonce".to_string(), "xyz".to_string()));
        assert_eq!(params[2], ("qop".to_string(), "auth".to_string()));
    }

    #[test]
    fn rejects_non_digest_scheme() {
        assert!(DigestState::parse("Basic realm=\"x\"").is_err());
    }
}
