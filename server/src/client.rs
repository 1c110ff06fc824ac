//! Client-side protocol helpers.
//!
//! Everything a whistler or listener process needs to speak to the server:
//! header names, listen-request canonicalization and signing, envelope
//! building, the SSE frame parser, and the environment contract for
//! executables spawned on delivery. The HTTP transport itself is left to the
//! calling program.

use std::{collections::BTreeSet, io};

use ed25519_dalek::SigningKey;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use crate::{
    api::{Level, Message},
    crypto,
};

pub const HEADER_GUID: &str = "X-Marmot-GUID";
pub const HEADER_CHANNELS: &str = "X-Marmot-Channels";
pub const HEADER_SIGNATURE: &str = "X-Marmot-Signature";

/// Environment passed to executables spawned by a listener on each delivery.
pub const ENV_MSG_LEVEL: &str = "MARMOT_MSG_LEVEL";
pub const ENV_MSG_CHANNEL: &str = "MARMOT_MSG_CHANNEL";
pub const ENV_MSG_WHISTLER: &str = "MARMOT_MSG_WHISTLER";
pub const ENV_MSG_CONTENT: &str = "MARMOT_MSG_CONTENT";

/// Canonicalized multi-channel subscription request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenParams {
    guid: String,
    channels: Vec<String>,
}

impl ListenParams {
    /// Channels are deduplicated and sorted; the result is the canonical
    /// form shared with the server.
    pub fn new<I, S>(guid: impl Into<String>, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: BTreeSet<String> = channels.into_iter().map(Into::into).collect();
        Self {
            guid: guid.into(),
            channels: channels.into_iter().collect(),
        }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn digest(&self) -> [u8; 32] {
        crypto::hash_listen_params(&self.guid, &self.channels)
    }

    pub fn sign(&self, prikey: &SigningKey) -> String {
        crypto::sign_digest(prikey, &self.digest())
    }

    /// The header triple authorizing this subscription.
    pub fn headers(&self, prikey: &SigningKey) -> [(&'static str, String); 3] {
        [
            (HEADER_GUID, self.guid.clone()),
            (HEADER_CHANNELS, self.channels.join("|")),
            (HEADER_SIGNATURE, self.sign(prikey)),
        ]
    }
}

/// Unsigned message content, as supplied by the calling program
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub channel: String,
    pub content: String,
    pub level: Level,
}

/// Build the signed envelopes for a whistle request.
pub fn build_messages<I>(guid: &str, prikey: &SigningKey, drafts: I) -> Vec<Message>
where
    I: IntoIterator<Item = MessageDraft>,
{
    drafts
        .into_iter()
        .map(|draft| {
            Message {
                channel: draft.channel,
                content: draft.content,
                whistler: guid.to_string(),
                level: draft.level,
                signature: String::new(),
            }
            .sign(prikey)
        })
        .collect()
}

/// One parsed server-sent event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<u64>,
}

/// Incremental SSE parser over a buffered byte stream.
///
/// Comment lines (the server's ping keep-alives) are skipped; an event is
/// complete at the first empty line after at least one field.
pub struct EventSource<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> EventSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Next event, or `None` at end of stream.
    pub async fn next_event(&mut self) -> io::Result<Option<SseEvent>> {
        let mut pending: Option<SseEvent> = None;
        while let Some(line) = self.lines.next_line().await? {
            if line.is_empty() {
                if let Some(event) = pending.take() {
                    return Ok(Some(event));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };
            let event = pending.get_or_insert_with(SseEvent::default);
            match field {
                "id" => event.id = Some(value.to_string()),
                "event" => event.event = Some(value.to_string()),
                "data" => event.data.push_str(value),
                "retry" => event.retry = value.parse().ok(),
                _ => {}
            }
        }
        Ok(pending)
    }
}
