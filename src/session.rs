//! # WebSocket sessions
//!
//! One session per upgraded connection. A session runs three tasks:
//!
//! - the **receive loop** (the caller's task) reads inbound frames under the
//!   read deadline, turns them into queries or stop requests, and owns the
//!   session's cancellation scope;
//! - the **query worker** runs queued queries through the [`Pipeline`] one at a
//!   time, in arrival order;
//! - the **send loop** is the only writer to the socket. It takes frames from
//!   the session's queue (or the shared [`BroadcastChannel`]), skips frames
//!   whose scope was cancelled, and writes each under the write deadline.
//!
//! ## Inbound frames
//! Text frames are either a JSON object `{"message": "<text>"}` (optionally
//! with a positive integer `"top_k"`) or raw query text. `{"message": "stop"}`
//! cancels whatever the session is running and opens a fresh scope for later
//! queries. An object without a string `message`, an empty query, or a binary
//! frame is dropped with a warning and the session continues.
//!
//! ## Ending
//! The session closes when the client closes, the read deadline expires, a
//! write fails or times out, or the server shuts down. Closing cancels the
//! session token, which cancels every scope derived from it, so in-flight
//! searches, subprocesses and generations are abandoned.

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::broadcast::{BroadcastChannel, Outbound};
use crate::config::SessionConfig;
use crate::error::{RagError, Result};
use crate::pipeline::{Frame, FrameSink, Pipeline, Query};

/// The inbound message that cancels the running query.
pub const STOP_COMMAND: &str = "stop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    /// Legal next states. Sessions only move forward.
    pub fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closed) | (Open, Closing) | (Closing, Closed)
        )
    }

    fn advance(&mut self, next: SessionState) {
        if self.can_become(next) {
            debug!(from = ?*self, to = ?next, "Session state change");
            *self = next;
        } else {
            warn!(from = ?*self, to = ?next, "Ignoring illegal session state change");
        }
    }
}

/// The session's current cancellation scope.
///
/// Each scope is a child of the session token. [`CancelScope::replace`]
/// cancels the current scope and installs a fresh one; work started under the
/// old scope sees the cancellation, work started afterwards does not.
#[derive(Debug)]
pub struct CancelScope {
    session: CancellationToken,
    current: CancellationToken,
}

impl CancelScope {
    pub fn new(session: CancellationToken) -> Self {
        let current = session.child_token();
        Self { session, current }
    }

    pub fn current(&self) -> CancellationToken {
        self.current.clone()
    }

    pub fn replace(&mut self) -> CancellationToken {
        self.current.cancel();
        self.current = self.session.child_token();
        self.current.clone()
    }
}

/// Record a connection that never became a session.
pub fn reject_upgrade(id: u64, reason: impl Display) -> SessionState {
    let mut state = SessionState::Connecting;
    info_span!("session", session = id).in_scope(|| {
        warn!("WebSocket upgrade failed: {reason}");
        state.advance(SessionState::Closed);
    });
    state
}

/// A parsed inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Query(Query),
    Stop,
}

/// Interpret one inbound text frame.
///
/// Returns [`RagError::Protocol`] for frames that should be dropped.
pub fn parse_inbound(text: &str) -> Result<Inbound> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => {
            let message = match map.get("message") {
                Some(Value::String(m)) => m,
                Some(_) => return Err(RagError::Protocol("'message' is not a string".into())),
                None => return Err(RagError::Protocol("missing 'message' field".into())),
            };
            if message == STOP_COMMAND {
                return Ok(Inbound::Stop);
            }
            let k = map
                .get("top_k")
                .and_then(Value::as_u64)
                .filter(|k| *k > 0)
                .map(|k| k as usize);
            query(message, k)
        }
        _ => query(text, None),
    }
}

fn query(text: &str, k: Option<usize>) -> Result<Inbound> {
    let text = text.trim();
    if text.is_empty() {
        return Err(RagError::Protocol("empty query".into()));
    }
    Ok(Inbound::Query(Query {
        text: text.to_string(),
        k,
    }))
}

/// Shared, per-server pieces a session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub pipeline: Arc<Pipeline>,
    pub config: SessionConfig,
    pub broadcast: Option<BroadcastChannel>,
    pub shutdown: CancellationToken,
}

#[derive(Clone)]
enum Route {
    Own(mpsc::Sender<Outbound>),
    Shared(BroadcastChannel),
}

/// Tags pipeline frames with their query's scope and queues them.
struct ScopedSink {
    route: Route,
    scope: CancellationToken,
}

#[async_trait]
impl FrameSink for ScopedSink {
    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.scope.is_cancelled() {
            return Ok(());
        }
        let outbound = Outbound::new(frame.text, self.scope.clone());
        let deliver = async {
            match &self.route {
                Route::Own(tx) => tx
                    .send(outbound)
                    .await
                    .map_err(|_| RagError::Transport("session send queue closed".into())),
                Route::Shared(channel) => channel.publish(outbound).await,
            }
        };
        tokio::select! {
            _ = self.scope.cancelled() => Ok(()),
            r = deliver => r,
        }
    }
}

struct PendingQuery {
    query: Query,
    scope: CancellationToken,
}

/// Drive one session until it closes.
///
/// `writer` and `reader` are the two halves of the client connection.
pub async fn run_session<W, R, E>(id: u64, writer: W, mut reader: R, ctx: SessionContext)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let span = info_span!("session", session = id);
    let mut state = SessionState::Connecting;
    let session_token = ctx.shutdown.child_token();
    let mut scope = CancelScope::new(session_token.clone());

    let (out_tx, out_rx) = mpsc::channel::<Outbound>(ctx.config.outbound_capacity.max(1));
    let (query_tx, query_rx) = mpsc::channel::<PendingQuery>(ctx.config.query_capacity.max(1));
    let route = match &ctx.broadcast {
        Some(channel) => Route::Shared(channel.clone()),
        None => Route::Own(out_tx.clone()),
    };

    let send_task = tokio::spawn(
        send_loop(
            writer,
            out_rx,
            ctx.broadcast.clone(),
            ctx.config.write_timeout(),
            session_token.clone(),
        )
        .instrument(span.clone()),
    );
    let worker = tokio::spawn(
        query_worker(query_rx, ctx.pipeline.clone(), route, session_token.clone())
            .instrument(span.clone()),
    );

    state.advance(SessionState::Open);
    let read_timeout = ctx.config.read_timeout();

    async {
        info!("Client connected");
        loop {
            let next = tokio::select! {
                _ = session_token.cancelled() => {
                    debug!("Session cancelled");
                    break;
                }
                next = timeout(read_timeout, reader.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    info!("Read deadline expired");
                    break;
                }
                Ok(None) => {
                    info!("Client went away");
                    break;
                }
                Ok(Some(Err(e))) => {
                    info!("Read failed: {e}");
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => match parse_inbound(text.as_str()) {
                    Ok(Inbound::Stop) => {
                        scope.replace();
                        info!("Stop request received");
                    }
                    Ok(Inbound::Query(query)) => {
                        info!("Received message: {}", query.text);
                        let pending = PendingQuery {
                            query,
                            scope: scope.current(),
                        };
                        match query_tx.try_send(pending) {
                            Ok(()) => {}
                            Err(TrySendError::Full(dropped)) => {
                                warn!("Query backlog full, dropping: {}", dropped.query.text);
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(e) => warn!("Dropping inbound frame: {e}"),
                },
                Message::Binary(_) => warn!("Dropping binary frame"),
                Message::Close(_) => {
                    info!("Client closed the connection");
                    break;
                }
                _ => {}
            }
        }
    }
    .instrument(span.clone())
    .await;

    state.advance(SessionState::Closing);
    session_token.cancel();
    drop(query_tx);
    drop(out_tx);
    let _ = worker.await;
    let _ = send_task.await;
    state.advance(SessionState::Closed);
    span.in_scope(|| info!("Session closed"));
}

async fn query_worker(
    mut queries: mpsc::Receiver<PendingQuery>,
    pipeline: Arc<Pipeline>,
    route: Route,
    session_token: CancellationToken,
) {
    while let Some(pending) = queries.recv().await {
        if pending.scope.is_cancelled() {
            debug!("Skipping query from a cancelled scope");
            continue;
        }
        let sink = ScopedSink {
            route: route.clone(),
            scope: pending.scope.clone(),
        };
        match pipeline.run(&pending.query, &pending.scope, &sink).await {
            Ok(outcome) => debug!(?outcome, "Query finished"),
            Err(e) => {
                warn!("Abandoning query: {e}");
                session_token.cancel();
                break;
            }
        }
    }
}

async fn next_shared(shared: &Option<BroadcastChannel>) -> Option<Outbound> {
    match shared {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_loop<W>(
    mut writer: W,
    mut own: mpsc::Receiver<Outbound>,
    shared: Option<BroadcastChannel>,
    write_timeout: std::time::Duration,
    session_token: CancellationToken,
) where
    W: Sink<Message> + Unpin + Send,
    W::Error: Display + Send,
{
    loop {
        let outbound = tokio::select! {
            _ = session_token.cancelled() => break,
            item = own.recv() => match item {
                Some(item) => item,
                None => break,
            },
            Some(item) = next_shared(&shared) => item,
        };

        if outbound.is_stale() {
            debug!("Dropping frame from a cancelled scope");
            continue;
        }

        match timeout(write_timeout, writer.send(Message::Text(outbound.text.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Write failed: {e}");
                break;
            }
            Err(_) => {
                warn!("Write deadline expired");
                break;
            }
        }
    }

    session_token.cancel();
    let _ = timeout(write_timeout, writer.close()).await;
}
