use std::{sync::Arc, time::Duration};

use chatbox_auth::{Sha256TokenIssuer, TokenIssuer};
use chatbox_config::Config;
use chatbox_hub::{Hub, HubHandle};
use chatbox_logging::{ErrorLog, MemoryErrorLog};
use chatbox_ws::{SERVER_SENDER_ID, client::Client};
use pretty_assertions::assert_eq;
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
    task::JoinHandle,
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    addr: std::net::SocketAddr,
    hub: HubHandle,
    server: JoinHandle<()>,
}

async fn start() -> Running {
    let config = Config::default().with_listen_addr("127.0.0.1:0");
    let listener = chatbox_server::bind(&config).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (hub, handle) = Hub::new(&config);
    tokio::spawn(hub.run());

    let issuer: Arc<dyn TokenIssuer> = Arc::new(Sha256TokenIssuer::new().with_secret("test"));
    let error_log: Arc<dyn ErrorLog> = Arc::new(MemoryErrorLog::new());
    let server = tokio::spawn(chatbox_server::serve(
        listener,
        handle.clone(),
        issuer,
        Arc::new(config),
        error_log,
    ));

    Running {
        addr,
        hub: handle,
        server,
    }
}

async fn connect(addr: std::net::SocketAddr, credential: &str) -> Client<TcpStream> {
    let socket = TcpStream::connect(addr).await.unwrap();
    Client::connect(socket, "Authorization", credential)
        .await
        .unwrap()
}

async fn wait_for_users(hub: &HubHandle, count: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while hub.len().await != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[test_log::test(tokio::test)]
async fn clients_chat_over_tcp() {
    let running = start().await;
    let mut alice = connect(running.addr, "alice").await;
    let mut bob = connect(running.addr, "bob").await;
    wait_for_users(&running.hub, 2).await;

    alice.send_text("", "hi bob").await.unwrap();

    let payload = tokio::time::timeout(TIMEOUT, bob.recv_payload())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(payload.body, "hi bob");

    alice.close().await.unwrap();

    let notice = tokio::time::timeout(TIMEOUT, bob.recv_payload())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(notice.sender_id, SERVER_SENDER_ID);
    assert!(notice.body.ends_with(" has disconnected"));
}

#[test_log::test(tokio::test)]
async fn legacy_credential_header_is_accepted() {
    let running = start().await;
    let socket = TcpStream::connect(running.addr).await.unwrap();

    assert!(Client::connect(socket, "Autorization", "alice").await.is_ok());
    wait_for_users(&running.hub, 1).await;
}

#[test_log::test(tokio::test)]
async fn rejected_handshake_closes_the_socket_and_registers_nothing() {
    let running = start().await;
    let mut socket = TcpStream::connect(running.addr).await.unwrap();

    socket
        .write_all(b"GET / HTTP/1.1\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n")
        .await
        .unwrap();

    let mut buf = vec![];
    let read = tokio::time::timeout(TIMEOUT, socket.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0);
    assert!(running.hub.is_empty().await);

    // The listener is still accepting.
    let _client = connect(running.addr, "bob").await;
    wait_for_users(&running.hub, 1).await;
}

#[test_log::test(tokio::test)]
async fn shutdown_stops_the_accept_loop() {
    let running = start().await;
    let mut alice = connect(running.addr, "alice").await;
    wait_for_users(&running.hub, 1).await;

    running.hub.shutdown();

    tokio::time::timeout(TIMEOUT, running.server)
        .await
        .unwrap()
        .unwrap();

    let raw = tokio::time::timeout(TIMEOUT, alice.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(raw.kind, chatbox_frame::OpCode::Close);
}
