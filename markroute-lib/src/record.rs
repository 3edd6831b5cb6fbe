//! Resolver record observations.
//!
//! The resolver forwards every answer it sees as a JSON text frame; only
//! A records (`type == 1`) drive the engine. Names arrive in zone-file form
//! with a trailing dot, which is stripped before rule matching.

use std::net::Ipv4Addr;

use serde::Deserialize;
use thiserror::Error;

pub const TYPE_A: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported record type {0}")]
    UnsupportedType(u32),
    #[error("record content is not an IPv4 address: `{0}`")]
    BadContent(String),
}

/// Wire schema of one resolver message.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordMessage {
    pub query: String,
    pub name: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: u32,
    #[serde(default)]
    pub ttl: Option<u32>,
}

/// A validated A-record observation.
#[derive(Debug, Clone)]
pub struct ARecord {
    pub name: String,
    pub query: String,
    pub addr: Ipv4Addr,
    pub ttl: Option<u32>,
}

impl TryFrom<RecordMessage> for ARecord {
    type Error = Error;

    fn try_from(msg: RecordMessage) -> Result<Self, Error> {
        if msg.kind != TYPE_A {
            return Err(Error::UnsupportedType(msg.kind));
        }
        let addr = msg
            .content
            .parse::<Ipv4Addr>()
            .map_err(|_| Error::BadContent(msg.content.clone()))?;
        Ok(Self {
            name: msg.name.trim_end_matches('.').to_string(),
            query: msg.query.trim_end_matches('.').to_string(),
            addr,
            ttl: msg.ttl,
        })
    }
}
