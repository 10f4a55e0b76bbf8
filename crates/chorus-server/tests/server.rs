//! Server tests over real sockets.

use chorus_core::{Hub, HubConfig, HubHandle, MemoryPresence, MemorySink};
use chorus_protocol::{codec, Envelope, MessageType};
use chorus_server::config::Config;
use chorus_server::handlers::{app, AppState};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    hub: HubHandle,
    task: JoinHandle<()>,
}

async fn start() -> Server {
    let (hub, task) = Hub::spawn(
        HubConfig::default(),
        Arc::new(MemoryPresence::default()),
        Arc::new(MemorySink::new()),
    );
    let state = Arc::new(AppState::new(hub.clone(), Config::default()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    Server { addr, hub, task }
}

fn request(
    addr: SocketAddr,
    user: Option<&str>,
    query: &str,
) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut request = format!("ws://{addr}/ws{query}").into_client_request().unwrap();
    if let Some(user) = user {
        request
            .headers_mut()
            .insert("x-user-id", HeaderValue::from_str(user).unwrap());
    }
    request
}

struct Client {
    socket: Socket,
    pending: VecDeque<Envelope>,
}

impl Client {
    async fn connect(addr: SocketAddr, user: &str, room: &str) -> Self {
        let (socket, _) = connect_async(request(addr, Some(user), &format!("?room_id={room}")))
            .await
            .unwrap();
        Self {
            socket,
            pending: VecDeque::new(),
        }
    }

    /// Next envelope, or `None` once the server closes.
    async fn next(&mut self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.pending.pop_front() {
                return Some(envelope);
            }
            let message = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                .await
                .expect("timed out waiting for a message");
            match message {
                Some(Ok(Message::Text(text))) => self
                    .pending
                    .extend(codec::decode_batch(text.as_bytes()).unwrap()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => {}
            }
        }
    }

    async fn say(&mut self, text: &str) {
        let payload = serde_json::json!({ "type": "text", "content": { "text": text } });
        self.socket
            .send(Message::text(payload.to_string()))
            .await
            .unwrap();
    }
}

async fn expect_status(addr: SocketAddr, user: Option<&str>, query: &str) -> u16 {
    match connect_async(request(addr, user, query)).await {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("upgrade unexpectedly succeeded"),
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
    (status, serde_json::from_str(body).unwrap_or_default())
}

#[tokio::test]
async fn test_room_conversation() {
    let server = start().await;

    let mut alice = Client::connect(server.addr, "alice", "lobby").await;
    let joined = alice.next().await.unwrap();
    assert_eq!(joined.kind, MessageType::Join);
    assert_eq!(joined.sender_id, "alice");

    let mut bob = Client::connect(server.addr, "bob", "lobby").await;
    assert_eq!(bob.next().await.unwrap().sender_id, "bob");
    assert_eq!(alice.next().await.unwrap().sender_id, "bob");

    alice.say("hi bob").await;
    let received = bob.next().await.unwrap();
    assert_eq!(received.kind, MessageType::Text);
    assert_eq!(received.sender_id, "alice");
    assert_eq!(received.room_id, "lobby");
    assert_eq!(received.content["text"], "hi bob");
    assert_eq!(alice.next().await.unwrap().content["text"], "hi bob");

    bob.socket.close(None).await.unwrap();
    let left = alice.next().await.unwrap();
    assert_eq!(left.kind, MessageType::Leave);
    assert_eq!(left.sender_id, "bob");
}

#[tokio::test]
async fn test_missing_user_header_is_unauthorized() {
    let server = start().await;
    assert_eq!(expect_status(server.addr, None, "?room_id=lobby").await, 401);
}

#[tokio::test]
async fn test_missing_room_is_bad_request() {
    let server = start().await;
    assert_eq!(expect_status(server.addr, Some("alice"), "").await, 400);
    assert_eq!(expect_status(server.addr, Some("alice"), "?room_id=").await, 400);
}

#[tokio::test]
async fn test_room_and_stats_endpoints() {
    let server = start().await;
    let mut alice = Client::connect(server.addr, "alice", "lobby").await;
    alice.next().await.unwrap();

    let (status, body) = http_get(server.addr, "/rooms/lobby").await;
    assert_eq!(status, 200);
    assert_eq!(body["users"], serde_json::json!(["alice"]));

    let (status, _) = http_get(server.addr, "/rooms/empty").await;
    assert_eq!(status, 404);

    let (status, body) = http_get(server.addr, "/stats").await;
    assert_eq!(status, 200);
    assert_eq!(body["connections"], 1);
    assert_eq!(body["rooms"], 1);

    let (status, body) = http_get(server.addr, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_shutdown_closes_sockets() {
    let server = start().await;
    let mut alice = Client::connect(server.addr, "alice", "lobby").await;
    alice.next().await.unwrap();

    server.hub.shutdown();
    server.task.await.unwrap();

    assert!(alice.next().await.is_none());
    assert_eq!(expect_status(server.addr, Some("bob"), "?room_id=lobby").await, 503);

    let (status, _) = http_get(server.addr, "/stats").await;
    assert_eq!(status, 503);
}
