//! Client side of the gateway ECDH challenge handshake.
//!
//! A client without a token connects to the relay URL and negotiates:
//!
//! ```json
//! c→r ["AUTH", {"pubkey": "<hex>"}]
//! r→c ["AUTH", {"challenge": "<hex>", "relayPubkey": "<hex>", "identifier": "<group>"}]
//! c→r ["AUTH", {"pubkey": "<hex>", "response": "<ct>?iv=<iv>"}]
//! r→c ["AUTH", {"success": true, "token": "<hex>"}]
//! ```
//!
//! The response envelope is the challenge encrypted with the ECDH shared
//! secret; on success the relay mints a bearer token for `?token=…` use.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::crypto;
use crate::error::Error;
use crate::keys::Keys;
use crate::wire::{ClientFrame, RelayFrame};
use crate::Result;

/// Handshake stages reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeProgress {
    Connected,
    ChallengeReceived,
    ResponseSent,
}

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Perform the challenge handshake against a relay URL and return the
/// issued token. `progress` observes the intermediate stages.
pub async fn authenticate(
    url: &str,
    keys: &Keys,
    mut progress: impl FnMut(HandshakeProgress),
) -> Result<String> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, run(url, keys, &mut progress))
        .await
        .map_err(|_| Error::Transport(format!("handshake with {url} timed out")))?
}

async fn run(
    url: &str,
    keys: &Keys,
    progress: &mut impl FnMut(HandshakeProgress),
) -> Result<String> {
    let (mut stream, _response) = connect_async(url)
        .await
        .map_err(|e| Error::Transport(format!("connect {url}: {e}")))?;
    progress(HandshakeProgress::Connected);

    let pubkey = keys.public_key_hex();
    let announce = ClientFrame::Auth {
        payload: json!({ "pubkey": pubkey }),
    };
    stream
        .send(Message::Text(announce.to_json().into()))
        .await
        .map_err(|e| Error::Transport(format!("send announce: {e}")))?;

    let mut responded = false;
    while let Some(message) = stream.next().await {
        let message = message.map_err(|e| Error::Transport(format!("read: {e}")))?;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match RelayFrame::parse(text.as_str())? {
            RelayFrame::Auth { challenge } => {
                if let Some(token) = challenge.get("token").and_then(|v| v.as_str()) {
                    return Ok(token.to_string());
                }
                let Some(challenge_hex) = challenge.get("challenge").and_then(|v| v.as_str())
                else {
                    return Err(Error::BadFrame("AUTH frame without challenge".into()));
                };
                let Some(relay_pubkey) = challenge.get("relayPubkey").and_then(|v| v.as_str())
                else {
                    return Err(Error::BadFrame("AUTH frame without relayPubkey".into()));
                };
                progress(HandshakeProgress::ChallengeReceived);

                let secret = crypto::shared_secret(keys, relay_pubkey)?;
                let envelope = crypto::encrypt_payload(&secret, challenge_hex);
                let response = ClientFrame::Auth {
                    payload: json!({ "pubkey": pubkey, "response": envelope }),
                };
                stream
                    .send(Message::Text(response.to_json().into()))
                    .await
                    .map_err(|e| Error::Transport(format!("send response: {e}")))?;
                responded = true;
                progress(HandshakeProgress::ResponseSent);
            }
            RelayFrame::Notice { text } => {
                tracing::info!(relay = %url, "handshake notice: {text}");
            }
            _ => {}
        }
    }

    if responded {
        Err(Error::AuthFailed {
            relay_url: url.to_string(),
        })
    } else {
        Err(Error::Transport(format!("{url} closed before challenge")))
    }
}
