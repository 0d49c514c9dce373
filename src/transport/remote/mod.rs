//! WebSocket transport to a remote DuckDB server.
//!
//! One socket is shared by every query. Each statement is sent with its
//! query id and the reply is routed back to the waiting caller by that id.
//! Results arrive as binary Arrow frames (see [`protocol`]).

pub mod protocol;

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::protocol::{decode_result_frame, ClientMessage, ServerMessage};
use super::{StagedFile, Transport, TransportKind};
use crate::config::RemoteConfig;
use crate::db::Table;
use crate::error::{parse_engine_error, ConnectorError, Result};
use crate::load::{self, FileSource, LoadFileOptions, LoadMethod, LoadOptions};
use crate::query::QueryId;

/// Connection state of the shared socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketStatus {
    Disconnected,
    Connecting,
    Authenticating,
    Open,
}

/// Handle returned when registering a notification listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&JsonValue) + Send + Sync>;
type ConnectFuture = Shared<BoxFuture<'static, Result<()>>>;

struct Waiter {
    sql: String,
    reply: oneshot::Sender<Result<Table>>,
}

struct SocketState {
    status: SocketStatus,
    /// Bumped whenever a socket opens or is reset; reader tasks of older
    /// sockets compare against it before touching shared state.
    epoch: u64,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    connecting: Option<ConnectFuture>,
}

/// State shared between the transport and its socket tasks.
struct Session {
    socket: Mutex<SocketState>,
    pending: Mutex<HashMap<QueryId, Waiter>>,
    channels: Mutex<Vec<String>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Session {
    fn new(channels: Vec<String>) -> Self {
        let mut unique = Vec::with_capacity(channels.len());
        for channel in channels {
            if !unique.contains(&channel) {
                unique.push(channel);
            }
        }

        Self {
            socket: Mutex::new(SocketState {
                status: SocketStatus::Disconnected,
                epoch: 0,
                outgoing: None,
                connecting: None,
            }),
            pending: Mutex::new(HashMap::new()),
            channels: Mutex::new(unique),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    fn socket(&self) -> MutexGuard<'_, SocketState> {
        lock(&self.socket)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<QueryId, Waiter>> {
        lock(&self.pending)
    }

    fn send(&self, message: &ClientMessage) -> Result<()> {
        self.send_raw(Message::text(message.to_json()?))
    }

    fn send_raw(&self, message: Message) -> Result<()> {
        let socket = self.socket();
        match (&socket.status, &socket.outgoing) {
            (SocketStatus::Open, Some(outgoing)) => outgoing
                .send(message)
                .map_err(|_| ConnectorError::transport("WebSocket closed")),
            _ => Err(ConnectorError::transport("WebSocket is not connected")),
        }
    }

    /// Completes the waiter for `id` with the result of `f`, computed from
    /// the statement text. Replies for unknown ids are dropped.
    fn resolve_with(&self, id: &QueryId, f: impl FnOnce(&str) -> Result<Table>) {
        let waiter = self.pending().remove(id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.reply.send(f(&waiter.sql));
            }
            None => debug!(query_id = %id, "Dropping reply for unknown query"),
        }
    }

    fn reject_all(&self, error: &ConnectorError) -> usize {
        let waiters: Vec<Waiter> = self.pending().drain().map(|(_, w)| w).collect();
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.reply.send(Err(error.clone()));
        }
        count
    }

    fn notify(&self, payload: &JsonValue) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
                warn!("Notification listener panicked");
            }
        }
    }

    /// Resets the socket and rejects every pending query.
    ///
    /// With `epoch` set, only acts if that socket is still the current one.
    fn disconnect(&self, epoch: Option<u64>, reason: &str) -> bool {
        {
            let mut socket = self.socket();
            if epoch.is_some_and(|e| e != socket.epoch) {
                return false;
            }
            socket.epoch += 1;
            socket.status = SocketStatus::Disconnected;
            socket.outgoing = None;
            socket.connecting = None;
        }

        let rejected = self.reject_all(&ConnectorError::transport(reason));
        if rejected > 0 {
            debug!(rejected, reason, "Rejected pending queries");
        }
        true
    }

    /// Handles one text frame. Returns a reason when the socket must close.
    fn handle_text(&self, text: &str) -> Option<String> {
        let Some(message) = ServerMessage::parse(text) else {
            debug!("Ignoring unparseable server message");
            return None;
        };

        match message {
            ServerMessage::Ok { query_id } => self.resolve_with(&query_id, |_| Ok(Table::empty())),
            ServerMessage::Error {
                query_id: Some(query_id),
                error,
            } => {
                let raw = error.unwrap_or_else(|| "Unknown server error".to_string());
                self.resolve_with(&query_id, |sql| Err(parse_engine_error(sql, &raw)));
            }
            ServerMessage::Error {
                query_id: None,
                error,
            } => {
                let reason = error.unwrap_or_else(|| "Unknown server error".to_string());
                warn!(error = %reason, "Server reported a connection error");
                return Some(reason);
            }
            ServerMessage::Arrow { query_id, data } => {
                self.resolve_with(&query_id, |_| {
                    let bytes = BASE64.decode(data.as_bytes()).map_err(|e| {
                        ConnectorError::transport(format!("Invalid base64 result: {e}"))
                    })?;
                    Table::from_ipc_stream(&bytes)
                });
            }
            ServerMessage::Notify { payload } => self.notify(&payload),
            ServerMessage::AuthAck | ServerMessage::CancelAck { .. } | ServerMessage::Unknown => {}
        }
        None
    }

    fn handle_binary(&self, frame: &[u8]) {
        match decode_result_frame(frame) {
            Ok((header, ipc)) => self.resolve_with(&header.query_id, |_| Table::from_ipc_stream(ipc)),
            Err(e) => debug!(error = %e, "Dropping malformed result frame"),
        }
    }
}

/// Removes an in-flight query when dropped, telling the server to stop it.
struct InFlight<'a> {
    session: &'a Session,
    id: &'a QueryId,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed || self.session.pending().remove(self.id).is_none() {
            return;
        }
        let cancel = ClientMessage::Cancel {
            query_id: self.id.clone(),
        };
        if self.session.send(&cancel).is_ok() {
            debug!(query_id = %self.id, "Sent cancel");
        }
    }
}

fn connect_error(error: WsError) -> ConnectorError {
    match error {
        WsError::Http(response) if response.status().as_u16() == 401 => {
            ConnectorError::transport("Unauthorized")
        }
        other => ConnectorError::transport(format!("WebSocket connection error: {other}")),
    }
}

async fn authenticate<S>(ws: &mut S, token: &str, timeout: Duration) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin,
{
    let auth = ClientMessage::Auth {
        token: token.to_string(),
    };
    ws.send(Message::text(auth.to_json()?))
        .await
        .map_err(|e| ConnectorError::transport(format!("Failed to send auth message: {e}")))?;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ConnectorError::transport("Authentication timeout"));
        }

        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match ServerMessage::parse(text.as_str()) {
                Some(ServerMessage::AuthAck) => return Ok(()),
                Some(ServerMessage::Error { error, .. }) => {
                    let reason = error.unwrap_or_else(|| "Unauthorized".to_string());
                    return Err(ConnectorError::transport(format!(
                        "Authentication failed: {reason}"
                    )));
                }
                _ => {}
            },
            Ok(Some(Ok(Message::Ping(payload)))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                return Err(ConnectorError::transport(
                    "Connection closed during authentication",
                ));
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                return Err(ConnectorError::transport(format!(
                    "WebSocket error during authentication: {e}"
                )));
            }
            Err(_) => return Err(ConnectorError::transport("Authentication timeout")),
        }
    }
}

/// Opens, authenticates and starts the socket. Runs at most once at a time.
async fn connect(config: RemoteConfig, session: Arc<Session>, start_epoch: u64) -> Result<()> {
    let opened = async {
        let url = config.validate()?;
        debug!(url = %config.display_string(), "Connecting");

        let (mut ws, _response) = tokio::time::timeout(
            config.connect_timeout(),
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| {
            ConnectorError::transport(format!(
                "Connection timeout after {}s",
                config.connect_timeout_secs
            ))
        })?
        .map_err(connect_error)?;

        if let Some(token) = &config.auth_token {
            {
                let mut socket = session.socket();
                if socket.epoch == start_epoch {
                    socket.status = SocketStatus::Authenticating;
                }
            }
            authenticate(&mut ws, token, config.auth_timeout()).await?;
        }
        Ok::<_, ConnectorError>(ws)
    }
    .await;

    let ws = match opened {
        Ok(ws) => ws,
        Err(e) => {
            let mut socket = session.socket();
            if socket.epoch == start_epoch {
                socket.status = SocketStatus::Disconnected;
                socket.connecting = None;
            }
            return Err(e);
        }
    };

    let mut subscriptions = Vec::new();
    for channel in lock(&session.channels).iter() {
        let subscribe = ClientMessage::Subscribe {
            channel: channel.clone(),
        };
        subscriptions.push(Message::text(subscribe.to_json()?));
    }

    let (sink, stream) = ws.split();
    let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
    for message in subscriptions {
        let _ = outgoing.send(message);
    }

    let epoch = {
        let mut socket = session.socket();
        if socket.epoch != start_epoch {
            // Torn down while connecting; dropping the halves closes the socket.
            return Err(ConnectorError::transport("Connection closed while connecting"));
        }
        socket.epoch += 1;
        socket.status = SocketStatus::Open;
        socket.outgoing = Some(outgoing);
        socket.connecting = None;
        socket.epoch
    };

    tokio::spawn(write_loop(sink, outgoing_rx));
    tokio::spawn(read_loop(stream, Arc::clone(&session), epoch));
    info!(url = %config.display_string(), "WebSocket connected");
    Ok(())
}

async fn write_loop<S>(mut sink: S, mut outgoing: mpsc::UnboundedReceiver<Message>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "WebSocket write failed");
            return;
        }
    }
    // Sender dropped: the socket was reset.
    let _ = sink.close().await;
}

async fn read_loop<S>(mut stream: S, session: Arc<Session>, epoch: u64)
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(fault) = session.handle_text(text.as_str()) {
                    break fault;
                }
            }
            Some(Ok(Message::Binary(data))) => session.handle_binary(&data),
            Some(Ok(Message::Close(_))) | None => break "WebSocket closed".to_string(),
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("WebSocket error: {e}"),
        }
    };

    if session.disconnect(Some(epoch), &reason) {
        info!(reason = %reason, "WebSocket disconnected");
    }
}

/// Transport talking to a DuckDB server over a WebSocket.
pub struct RemoteTransport {
    config: RemoteConfig,
    session: Arc<Session>,
}

impl RemoteTransport {
    pub fn new(config: RemoteConfig) -> Self {
        let session = Arc::new(Session::new(config.channels.clone()));
        Self { config, session }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn status(&self) -> SocketStatus {
        self.session.socket().status
    }

    /// Queries sent and not yet answered.
    pub fn pending_count(&self) -> usize {
        self.session.pending().len()
    }

    /// Connects if needed. Concurrent callers share one connect attempt.
    async fn ensure_connected(&self) -> Result<()> {
        let connecting = {
            let mut socket = self.session.socket();
            if socket.status == SocketStatus::Open && socket.outgoing.is_some() {
                return Ok(());
            }
            match &socket.connecting {
                Some(connecting) => connecting.clone(),
                None => {
                    let connecting = connect(
                        self.config.clone(),
                        Arc::clone(&self.session),
                        socket.epoch,
                    )
                    .boxed()
                    .shared();
                    socket.status = SocketStatus::Connecting;
                    socket.connecting = Some(connecting.clone());
                    connecting
                }
            }
        };
        connecting.await
    }

    /// Sends an arbitrary JSON message over the socket, connecting first.
    pub async fn send_control_message(&self, message: &JsonValue) -> Result<()> {
        self.ensure_connected().await?;
        let text = serde_json::to_string(message)
            .map_err(|e| ConnectorError::internal(format!("Failed to encode message: {e}")))?;
        self.session.send_raw(Message::text(text))
    }

    /// Calls `listener` with the payload of every `notify` message.
    pub fn add_notification_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&JsonValue) + Send + Sync + 'static,
    {
        let id = ListenerId(self.session.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.session.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn remove_notification_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.session.listeners);
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Subscribes to a notification channel, now if connected and again
    /// after every reconnect.
    pub fn subscribe(&self, channel: impl Into<String>) -> Result<()> {
        let channel = channel.into();
        {
            let mut channels = lock(&self.session.channels);
            if channels.contains(&channel) {
                return Ok(());
            }
            channels.push(channel.clone());
        }

        if self.status() == SocketStatus::Open {
            self.session.send(&ClientMessage::Subscribe { channel })?;
        }
        Ok(())
    }

    /// Stops resubscribing to `channel` on reconnect.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        let mut channels = lock(&self.session.channels);
        let before = channels.len();
        channels.retain(|c| c != channel);
        channels.len() != before
    }

    pub fn channels(&self) -> Vec<String> {
        lock(&self.session.channels).clone()
    }
}

impl fmt::Debug for RemoteTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTransport")
            .field("url", &self.config.display_string())
            .field("status", &self.status())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Remote
    }

    async fn bootstrap(&self) -> Result<()> {
        self.ensure_connected().await.map_err(|e| match e {
            ConnectorError::Transport(message) => ConnectorError::initialization(message),
            other => other,
        })
    }

    async fn teardown(&self) -> Result<()> {
        if self.session.disconnect(None, "WebSocket closed") {
            info!(url = %self.config.display_string(), "Closed WebSocket");
        }
        Ok(())
    }

    async fn run_query(
        &self,
        sql: &str,
        id: &QueryId,
        cancel: &CancellationToken,
    ) -> Result<Table> {
        if cancel.is_cancelled() {
            return Err(ConnectorError::aborted());
        }

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectorError::aborted()),
            connected = self.ensure_connected() => connected,
        };
        connected?;

        let (reply, response) = oneshot::channel();
        {
            let mut pending = self.session.pending();
            if pending.contains_key(id) {
                return Err(ConnectorError::internal(format!(
                    "Query {id} is already in flight"
                )));
            }
            pending.insert(
                id.clone(),
                Waiter {
                    sql: sql.to_string(),
                    reply,
                },
            );
        }

        let mut in_flight = InFlight {
            session: &self.session,
            id,
            armed: true,
        };
        self.session.send(&ClientMessage::Arrow {
            sql: sql.to_string(),
            query_id: id.clone(),
        })?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectorError::aborted()),
            reply = response => reply.unwrap_or_else(|_| Err(ConnectorError::transport("WebSocket closed"))),
        };

        if !matches!(result, Err(ConnectorError::Aborted(_))) {
            in_flight.disarm();
        }
        result
    }

    /// In-memory files are not uploaded; their name is taken as a path the
    /// server can read.
    async fn stage_file(&self, source: &FileSource) -> Result<StagedFile> {
        if let FileSource::Bytes { name, .. } = source {
            debug!(file = %name, "Treating in-memory file as a server-side path");
        }
        Ok(StagedFile::existing(source.name()))
    }

    /// `.arrow` files default to the server's `read_ipc` reader.
    fn file_load_sql(&self, path: &str, table: &str, options: &LoadFileOptions) -> Result<String> {
        let is_arrow = Path::new(path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("arrow"));
        if is_arrow && options.method == LoadMethod::Auto {
            let options = LoadFileOptions {
                method: LoadMethod::ReadIpc,
                ..options.clone()
            };
            return Ok(load::load_file(table, path, &options));
        }
        Ok(load::load_file(table, path, options))
    }

    async fn load_arrow(&self, _table: &str, _data: Table, _options: &LoadOptions) -> Result<()> {
        Err(ConnectorError::unsupported(
            "Arrow buffer upload is not supported over the WebSocket transport",
        ))
    }
}
