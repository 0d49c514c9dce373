//! WebSocket transport integration tests.
//!
//! A small server backed by the embedded engine stands in for a remote
//! DuckDB server: it authenticates, runs statements concurrently, honours
//! cancel requests and streams results back as binary Arrow frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use duckconn::config::RemoteConfig;
use duckconn::load::LoadOptions;
use duckconn::query::QueryId;
use duckconn::transport::remote::protocol::{encode_result_frame, ClientMessage, FrameHeader};
use duckconn::transport::{InProcessTransport, RemoteTransport, SocketStatus, Transport};
use duckconn::{Connector, ConnectorError, ConnectorState, QueryOptions, Table};
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

type ServerSocket = WebSocketStream<TcpStream>;

const TOKEN: &str = "let-me-in";

/// A running engine-backed server.
struct EngineServer {
    url: String,
    connections: Arc<AtomicUsize>,
    /// Receives the batch count of every result the server sends.
    batches: mpsc::UnboundedReceiver<usize>,
}

async fn start_server() -> EngineServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let (batches_tx, batches) = mpsc::unbounded_channel();

    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let batches_tx = batches_tx.clone();
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    serve_engine(ws, batches_tx).await;
                }
            });
        }
    });

    EngineServer {
        url: format!("ws://{addr}"),
        connections,
        batches,
    }
}

async fn serve_engine(ws: ServerSocket, batches: mpsc::UnboundedSender<usize>) {
    let engine = Arc::new(InProcessTransport::in_memory());
    engine.bootstrap().await.unwrap();

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let running: Arc<Mutex<HashMap<QueryId, CancellationToken>>> = Arc::default();
    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(message) = serde_json::from_str::<ClientMessage>(text.as_str()) else {
            continue;
        };

        match message {
            ClientMessage::Auth { token } => {
                let reply = if token == TOKEN {
                    json!({"type": "authAck"})
                } else {
                    json!({"type": "error", "error": "Unauthorized"})
                };
                let _ = tx.send(Message::text(reply.to_string()));
            }
            ClientMessage::Subscribe { channel } => {
                let reply = json!({"type": "notify", "payload": {"subscribed": channel}});
                let _ = tx.send(Message::text(reply.to_string()));
            }
            ClientMessage::Cancel { query_id } => {
                if let Some(token) = running.lock().unwrap().remove(&query_id) {
                    token.cancel();
                }
                let reply = json!({"type": "cancelAck", "queryId": query_id});
                let _ = tx.send(Message::text(reply.to_string()));
            }
            ClientMessage::Arrow { sql, query_id } => {
                let cancel = CancellationToken::new();
                running
                    .lock()
                    .unwrap()
                    .insert(query_id.clone(), cancel.clone());

                let engine = engine.clone();
                let tx = tx.clone();
                let running = running.clone();
                let batches = batches.clone();
                tokio::spawn(async move {
                    let result = engine.run_query(&sql, &query_id, &cancel).await;
                    running.lock().unwrap().remove(&query_id);
                    let reply = match result {
                        Ok(table) if table.num_columns() == 0 => {
                            Message::text(json!({"type": "ok", "queryId": query_id}).to_string())
                        }
                        Ok(table) => {
                            let _ = batches.send(table.num_batches());
                            let frame = encode_result_frame(
                                &FrameHeader::arrow(query_id),
                                &table.to_ipc_stream().unwrap(),
                            )
                            .unwrap();
                            Message::binary(frame)
                        }
                        Err(e) => Message::text(
                            json!({"type": "error", "queryId": query_id, "error": wire_error(&e)})
                                .to_string(),
                        ),
                    };
                    let _ = tx.send(reply);
                });
            }
        }
    }

    drop(tx);
    let _ = writer.await;
    let _ = engine.teardown().await;
}

/// Engine errors travel as the JSON payload the engine itself produces.
fn wire_error(err: &ConnectorError) -> String {
    match err.structured() {
        Some(s) => json!({
            "exception_type": s.error_type,
            "exception_message": s.message,
            "position": s.position.map(|p| p.to_string()),
        })
        .to_string(),
        None => err.to_string(),
    }
}

/// What the scripted server does with one client message.
#[derive(Debug, Clone, Copy)]
enum Step {
    /// Acknowledge auth and answer queries with `ok`.
    Answer,
    /// Leave the message unanswered.
    Ignore,
    /// Send a close frame and stop serving the connection.
    Close,
    /// Drop the connection without a close frame.
    HangUp,
}

type Seen = mpsc::UnboundedReceiver<(usize, ClientMessage)>;

/// A server that reports every client message as `(connection, message)`
/// and handles it as `script(connection, index, message)` says. Connections
/// and per-connection message indexes count from 1.
async fn start_scripted_server(script: fn(usize, usize, &ClientMessage) -> Step) -> (String, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut connection = 0;
        while let Ok((stream, _)) = listener.accept().await {
            connection += 1;
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let mut index = 0;
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let Ok(message) = serde_json::from_str::<ClientMessage>(text.as_str()) else {
                        continue;
                    };
                    index += 1;

                    let step = script(connection, index, &message);
                    let reply = match (step, &message) {
                        (Step::Answer, ClientMessage::Auth { .. }) => Some(json!({"type": "authAck"})),
                        (Step::Answer, ClientMessage::Arrow { query_id, .. }) => {
                            Some(json!({"type": "ok", "queryId": query_id}))
                        }
                        _ => None,
                    };
                    let _ = seen_tx.send((connection, message));
                    if let Some(reply) = reply {
                        let _ = ws.send(Message::text(reply.to_string())).await;
                    }

                    match step {
                        Step::Close => {
                            let _ = ws.close(None).await;
                            return;
                        }
                        Step::HangUp => return,
                        Step::Answer | Step::Ignore => {}
                    }
                }
            });
        }
    });

    (format!("ws://{addr}"), seen)
}

/// Next `Subscribe` the server saw, with its connection number.
async fn next_subscription(seen: &mut Seen) -> (usize, String) {
    loop {
        let (connection, message) = tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .expect("server saw a subscription")
            .unwrap();
        if let ClientMessage::Subscribe { channel } = message {
            return (connection, channel);
        }
    }
}

async fn wait_for_status(transport: &RemoteTransport, status: SocketStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.status() != status {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("socket reached the expected status");
}

fn connector_for(url: &str, token: &str) -> Connector<RemoteTransport> {
    let mut config = RemoteConfig::new(url);
    config.auth_token = Some(token.to_string());
    config.connect_timeout_secs = 5;
    config.auth_timeout_secs = 5;
    Connector::new(RemoteTransport::new(config))
}

#[tokio::test]
async fn test_remote_select_one() {
    let server = start_server().await;
    let connector = connector_for(&server.url, TOKEN);

    let table = connector
        .query("SELECT 1 as a", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(table.num_rows(), 1);
    assert_eq!(table.column("a").unwrap().get_i64(0), Some(1));
    assert_eq!(connector.state(), ConnectorState::Ready);
    assert_eq!(connector.transport().status(), SocketStatus::Open);
    connector.destroy().await.unwrap();
}

#[tokio::test]
async fn test_remote_result_keeps_server_batches() {
    let mut server = start_server().await;
    let connector = connector_for(&server.url, TOKEN);

    let table = connector
        .query("SELECT * FROM range(5000) t(n)", QueryOptions::default())
        .await
        .unwrap();
    let sent = server.batches.recv().await.unwrap();

    assert_eq!(table.num_rows(), 5000);
    assert_eq!(table.num_batches(), sent);
    assert_eq!(table.column("n").unwrap().get_i64(4999), Some(4999));
}

#[tokio::test]
async fn test_remote_statements_share_one_session() {
    let server = start_server().await;
    let connector = connector_for(&server.url, TOKEN);

    connector
        .execute("CREATE TABLE t AS SELECT * FROM range(3) t(n)", QueryOptions::default())
        .await
        .unwrap();
    let rows = connector
        .query_json("SELECT n FROM t ORDER BY n", QueryOptions::default())
        .await
        .unwrap();
    let json: Vec<_> = rows.iter().map(|row| row.to_json()).collect();
    assert_eq!(json, vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})]);
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remote_missing_table_is_query_error() {
    let server = start_server().await;
    let connector = connector_for(&server.url, TOKEN);

    let err = connector
        .query("SELECT * FROM t", QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "Query Error");
    let message = err.to_string();
    assert!(message.contains("LINE 1"), "unexpected message: {message}");

    // The socket stays usable after a query-scoped error.
    let table = connector
        .query("SELECT 2 AS b", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(table.column("b").unwrap().get_i64(0), Some(2));
}

#[tokio::test]
async fn test_remote_cancel_running_query() {
    let server = start_server().await;
    let connector = connector_for(&server.url, TOKEN);
    connector.initialize().await.unwrap();

    let handle = connector.query(
        "SELECT sum(a.range * b.range) FROM range(60000) a, range(60000) b",
        QueryOptions::default(),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let err = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("cancelled query settles")
        .unwrap_err();
    assert!(err.is_abort());
    assert_eq!(connector.transport().pending_count(), 0);

    let table = connector
        .query("SELECT 3 AS c", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(table.column("c").unwrap().get_i64(0), Some(3));
}

#[tokio::test]
async fn test_remote_bad_token_fails_initialization() {
    let server = start_server().await;
    let connector = connector_for(&server.url, "wrong");

    let err = connector.initialize().await.unwrap_err();
    assert_eq!(err.category(), "Initialization Error");
    assert!(err.to_string().contains("Unauthorized"), "unexpected: {err}");
    assert_eq!(connector.state(), ConnectorState::Uninitialized);
}

#[tokio::test]
async fn test_remote_load_arrow_is_unsupported() {
    let server = start_server().await;
    let connector = connector_for(&server.url, TOKEN);

    let err = connector
        .load_arrow(Table::empty(), "t", &LoadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "Unsupported Operation");
}

#[tokio::test]
async fn test_remote_destroy_then_reconnect() {
    let server = start_server().await;
    let connector = connector_for(&server.url, TOKEN);

    connector
        .execute("CREATE TABLE t AS SELECT 1 AS a", QueryOptions::default())
        .await
        .unwrap();
    connector.destroy().await.unwrap();
    assert_eq!(connector.transport().status(), SocketStatus::Disconnected);

    // The new connection gets a fresh server session.
    let err = connector
        .query("SELECT * FROM t", QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "Query Error");
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_remote_subscription_notifications() {
    let server = start_server().await;
    let connector = connector_for(&server.url, TOKEN);
    connector.transport().subscribe("jobs").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    connector
        .transport()
        .add_notification_listener(move |payload| {
            let _ = tx.send(payload.clone());
        });
    connector.initialize().await.unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, json!({"subscribed": "jobs"}));
}

#[tokio::test]
async fn test_global_error_rejects_pending_queries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let mut queries = 0;
        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            match serde_json::from_str::<ClientMessage>(text.as_str()).unwrap() {
                ClientMessage::Auth { .. } => {
                    ws.send(Message::text(r#"{"type":"authAck"}"#)).await.unwrap();
                }
                ClientMessage::Arrow { .. } => {
                    queries += 1;
                    if queries == 2 {
                        ws.send(Message::text(r#"{"type":"error","error":"Unauthorized"}"#))
                            .await
                            .unwrap();
                    }
                }
                _ => {}
            }
        }
    });

    let connector = connector_for(&format!("ws://{addr}"), TOKEN);
    connector.initialize().await.unwrap();

    let first = connector.query("SELECT 1", QueryOptions::default());
    let second = connector.query("SELECT 2", QueryOptions::default());
    let (first, second) = tokio::join!(first, second);

    for result in [first, second] {
        let err = result.unwrap_err();
        assert_eq!(err.category(), "Transport Error");
        assert!(err.to_string().contains("Unauthorized"), "unexpected: {err}");
    }
    assert_eq!(connector.transport().status(), SocketStatus::Disconnected);
    assert_eq!(connector.transport().pending_count(), 0);
}

#[tokio::test]
async fn test_remote_resubscribes_after_server_close() {
    let (url, mut seen) = start_scripted_server(|connection, _, message| match (connection, message) {
        (1, ClientMessage::Subscribe { .. }) => Step::Close,
        _ => Step::Answer,
    })
    .await;
    let connector = connector_for(&url, TOKEN);
    connector.transport().subscribe("jobs").unwrap();
    connector.initialize().await.unwrap();

    assert_eq!(next_subscription(&mut seen).await, (1, "jobs".to_string()));
    wait_for_status(connector.transport(), SocketStatus::Disconnected).await;

    // The next query reconnects and the subscription is replayed first.
    connector
        .execute("SELECT 1", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(next_subscription(&mut seen).await, (2, "jobs".to_string()));
    assert_eq!(connector.transport().status(), SocketStatus::Open);
}

#[tokio::test]
async fn test_remote_socket_close_rejects_pending_then_reconnects() {
    let (url, mut seen) = start_scripted_server(|connection, index, message| {
        match (connection, index, message) {
            // Auth, then two queries; the second one hangs up.
            (1, 3, _) => Step::HangUp,
            (1, _, ClientMessage::Arrow { .. }) => Step::Ignore,
            _ => Step::Answer,
        }
    })
    .await;
    let connector = connector_for(&url, TOKEN);
    connector.initialize().await.unwrap();

    let first = connector.query("SELECT 1", QueryOptions::default());
    let second = connector.query("SELECT 2", QueryOptions::default());
    let (first, second) = tokio::join!(first, second);
    for result in [first, second] {
        let err = result.unwrap_err();
        assert_eq!(err.category(), "Transport Error");
        assert!(!err.is_abort());
    }
    assert_eq!(connector.transport().pending_count(), 0);
    assert_eq!(connector.transport().status(), SocketStatus::Disconnected);

    let table = connector
        .query("SELECT 3", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(table.num_columns(), 0);
    assert_eq!(connector.transport().status(), SocketStatus::Open);

    let mut connections = Vec::new();
    while let Ok((connection, _)) = seen.try_recv() {
        connections.push(connection);
    }
    assert_eq!(connections.first(), Some(&1));
    assert_eq!(connections.last(), Some(&2));
}
