//! WebSocket listener feeding resolver A-record observations into the route
//! engine.
//!
//! One task per connection. The protocol is text frames carrying JSON:
//! A records answer `{"ttl": <seconds|null>}`, other record types answer
//! `{}`, malformed JSON answers a plain error string and the connection
//! stays open either way.

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use markroute_lib::record::{self, ARecord, RecordMessage};

use crate::routing::engine::RouteEngine;
use crate::routing::netlink_ops::KernelOps;

const INVALID_JSON: &str = "Error: Invalid JSON";
const INVALID_RECORD: &str = "Error: Invalid record";

pub(crate) async fn listen<K: KernelOps + 'static>(
    listener: TcpListener,
    engine: RouteEngine<K>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "resolver connected");
                    let engine = engine.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(error) = serve_connection(stream, engine, shutdown).await {
                            tracing::debug!(%error, "resolver connection closed");
                        }
                    });
                }
                Err(error) => tracing::warn!(%error, "failed to accept resolver connection"),
            },
        }
    }
    tracing::debug!("listener stopped");
}

async fn serve_connection<K: KernelOps>(
    stream: TcpStream,
    engine: RouteEngine<K>,
    shutdown: CancellationToken,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws.close(None).await;
                break;
            }
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_message(text.as_str(), &engine).await;
                    ws.send(Message::text(reply)).await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by the library
                Some(Err(error)) => return Err(error),
            },
        }
    }
    Ok(())
}

/// Computes the reply for one text frame.
pub(crate) async fn handle_message<K: KernelOps>(raw: &str, engine: &RouteEngine<K>) -> String {
    let msg: RecordMessage = match serde_json::from_str(raw) {
        Ok(msg) => msg,
        Err(error) => {
            tracing::debug!(%error, "malformed resolver message");
            return INVALID_JSON.to_string();
        }
    };
    tracing::debug!(query = %msg.query, content = %msg.content, "got resolver message");

    match ARecord::try_from(msg) {
        Ok(record) => {
            let ttl = engine.on_a_record(&record).await;
            serde_json::json!({ "ttl": ttl }).to_string()
        }
        Err(record::Error::UnsupportedType(_)) => "{}".to_string(),
        Err(error) => {
            tracing::warn!(%error, "rejecting resolver record");
            INVALID_RECORD.to_string()
        }
    }
}
