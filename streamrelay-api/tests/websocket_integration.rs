//! Viewer sockets against a live server backed by the in-memory transport.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use streamrelay_api::{create_router, AppState};
use streamrelay_core::{Config, MemoryTransport, RelayCoordinator, RelayHandle};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOPIC: &str = "meters/ws";

async fn start_server() -> (SocketAddr, RelayHandle, MemoryTransport) {
    let mut config = Config::default();
    config.upstream.topic = TOPIC.to_string();
    let config = Arc::new(config);

    let transport = MemoryTransport::new();
    let (relay, _task) = RelayCoordinator::spawn(&config, Arc::new(transport.clone()));
    let app = create_router(AppState::new(relay.clone(), config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, relay, transport)
}

async fn open(addr: SocketAddr, path: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    socket
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(_) = frame {
            return serde_json::from_str(frame.to_text().unwrap()).unwrap();
        }
    }
}

async fn wait_for_viewers(relay: &RelayHandle, expected: usize) {
    for _ in 0..200 {
        if relay.status().await.unwrap().viewers == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("viewer count never reached {expected}");
}

#[tokio::test]
async fn viewer_receives_confirmation_and_live_messages() {
    let (addr, relay, transport) = start_server().await;
    let mut socket = open(addr, "/").await;

    let connected = next_json(&mut socket).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["streamId"], TOPIC);

    transport.publish(TOPIC, json!({"kwh": 12.5}));
    let message = next_json(&mut socket).await;
    assert_eq!(message["type"], "message");
    assert_eq!(message["data"], json!({"kwh": 12.5}));
    assert!(message["timestamp"].is_i64());

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn late_viewer_on_alias_route_gets_history_first() {
    let (addr, _relay, transport) = start_server().await;
    let mut first = open(addr, "/").await;
    assert_eq!(next_json(&mut first).await["type"], "connected");

    transport.publish(TOPIC, json!("one"));
    transport.publish(TOPIC, json!("two"));
    assert_eq!(next_json(&mut first).await["data"], "one");
    assert_eq!(next_json(&mut first).await["data"], "two");

    let mut second = open(addr, "/ws").await;
    let history = next_json(&mut second).await;
    assert_eq!(history["type"], "history");
    let entries = history["data"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["data"], "one");
    assert!(entries[0]["timestamp"].is_i64());
    assert_eq!(next_json(&mut second).await["type"], "connected");
}

#[tokio::test]
async fn viewer_text_is_accepted_and_close_unregisters() {
    let (addr, relay, _transport) = start_server().await;
    let mut socket = open(addr, "/").await;
    assert_eq!(next_json(&mut socket).await["type"], "connected");
    wait_for_viewers(&relay, 1).await;

    socket.send(Message::Text("hello relay".into())).await.unwrap();
    socket.close(None).await.unwrap();

    wait_for_viewers(&relay, 0).await;
    assert!(relay.status().await.unwrap().idle_teardown_pending);
}

#[tokio::test]
async fn relay_shutdown_closes_sockets() {
    let (addr, relay, _transport) = start_server().await;
    let mut socket = open(addr, "/").await;
    assert_eq!(next_json(&mut socket).await["type"], "connected");

    relay.shutdown().await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);
}
