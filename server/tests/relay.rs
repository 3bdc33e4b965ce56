use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use tandem_protocol::{
    unix_millis, ClientHello, CreateRoomReq, Envelope, HostState, JoinRoomReq, TimeSyncReq,
};
use tandem_server::RelayConfig;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Relay {
    addr: std::net::SocketAddr,
    url: String,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn start_relay() -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = RelayConfig {
        addr,
        ws_path: "/ws".to_string(),
        host_idle_timeout: None,
    };
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(tandem_server::serve(listener, config, shutdown.clone()));
    Relay {
        addr,
        url: format!("ws://{addr}/ws"),
        shutdown,
        handle,
    }
}

struct Peer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    client_id: String,
}

impl Peer {
    async fn connect(url: &str, name: &str) -> Self {
        let (ws, _) = connect_async(url).await.unwrap();
        let mut peer = Peer {
            ws,
            client_id: String::new(),
        };
        peer.send(Envelope::ClientHello(ClientHello {
            client_name: name.to_string(),
            client_version: "test".to_string(),
        }))
        .await;
        match peer.recv().await {
            Envelope::ServerHello(hello) => peer.client_id = hello.client_id,
            other => panic!("expected server hello, got {other:?}"),
        }
        peer
    }

    async fn send(&mut self, envelope: Envelope) {
        let frame = envelope.encode().unwrap();
        self.ws.send(Message::Binary(frame.into())).await.unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        loop {
            let message = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection ended")
                .unwrap();
            if let Message::Binary(frame) = message {
                return Envelope::decode(&frame).unwrap();
            }
        }
    }

    /// Skips frames until one satisfies `pick`.
    async fn recv_until<T>(&mut self, mut pick: impl FnMut(Envelope) -> Option<T>) -> T {
        loop {
            if let Some(found) = pick(self.recv().await) {
                return found;
            }
        }
    }

    /// True once the server has closed the socket.
    async fn closed_by_server(&mut self) -> bool {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

async fn create_room(host: &mut Peer) -> (String, String) {
    host.send(Envelope::CreateRoomReq(CreateRoomReq {
        client_id: host.client_id.clone(),
    }))
    .await;
    host.recv_until(|env| match env {
        Envelope::CreateRoomResp(resp) => Some((resp.room_id, resp.room_code)),
        _ => None,
    })
    .await
}

async fn join_room(peer: &mut Peer, code: &str) -> Envelope {
    peer.send(Envelope::JoinRoomReq(JoinRoomReq {
        client_id: peer.client_id.clone(),
        room_code: code.to_string(),
    }))
    .await;
    peer.recv_until(|env| match env {
        Envelope::JoinRoomResp(_) | Envelope::ErrorResp(_) => Some(env),
        _ => None,
    })
    .await
}

fn playing_at(room_id: &str, position_ms: i64) -> HostState {
    HostState {
        room_id: room_id.to_string(),
        host_id: String::new(),
        seq: 7,
        position_ms,
        rate: 1.0,
        paused: false,
        sample_server_time_ms: unix_millis(),
        offset_ms: 0,
        media: None,
    }
}

#[tokio::test]
async fn host_state_reaches_follower() {
    let relay = start_relay().await;
    let mut host = Peer::connect(&relay.url, "host").await;
    let mut follower = Peer::connect(&relay.url, "follower").await;

    let (room_id, code) = create_room(&mut host).await;
    match join_room(&mut follower, &code).await {
        Envelope::JoinRoomResp(resp) => {
            assert_eq!(resp.room_id, room_id);
            assert_eq!(resp.host_id, host.client_id);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Wait until the host has seen the follower arrive so the update cannot race the join.
    host.recv_until(|env| match env {
        Envelope::RoomSnapshot(snapshot) if snapshot.members.len() == 2 => Some(()),
        _ => None,
    })
    .await;

    host.send(Envelope::HostState(playing_at(&room_id, 61_000)))
        .await;
    let state = follower
        .recv_until(|env| match env {
            Envelope::BroadcastState(broadcast) => Some(broadcast.state),
            _ => None,
        })
        .await;
    assert_eq!(state.position_ms, 61_000);
    assert_eq!(state.seq, 7);

    relay.shutdown.cancel();
    relay.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_code_reports_error_and_keeps_connection() {
    let relay = start_relay().await;
    let mut peer = Peer::connect(&relay.url, "lost").await;

    match join_room(&mut peer, "NOPE22").await {
        Envelope::ErrorResp(err) => assert_eq!(err.message, "room not found"),
        other => panic!("unexpected {other:?}"),
    }

    peer.send(Envelope::TimeSyncReq(TimeSyncReq { t1_local_ms: 99 }))
        .await;
    let t1 = peer
        .recv_until(|env| match env {
            Envelope::TimeSyncResp(resp) => Some(resp.t1_local_ms),
            _ => None,
        })
        .await;
    assert_eq!(t1, 99);
    relay.shutdown.cancel();
}

#[tokio::test]
async fn host_disconnect_closes_room_for_followers() {
    let relay = start_relay().await;
    let mut host = Peer::connect(&relay.url, "host").await;
    let mut follower = Peer::connect(&relay.url, "follower").await;

    let (_room_id, code) = create_room(&mut host).await;
    join_room(&mut follower, &code).await;
    drop(host);

    let message = follower
        .recv_until(|env| match env {
            Envelope::ErrorResp(err) => Some(err.message),
            _ => None,
        })
        .await;
    assert!(message.contains("room closed"), "{message}");

    // The code no longer resolves.
    let mut late = Peer::connect(&relay.url, "late").await;
    assert!(matches!(
        join_room(&mut late, &code).await,
        Envelope::ErrorResp(_)
    ));
    relay.shutdown.cancel();
}

#[tokio::test]
async fn first_frame_must_be_hello() {
    let relay = start_relay().await;
    let (mut ws, _) = connect_async(&relay.url).await.unwrap();
    let frame = Envelope::TimeSyncReq(TimeSyncReq { t1_local_ms: 1 })
        .encode()
        .unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();

    let mut peer = Peer {
        ws,
        client_id: String::new(),
    };
    assert!(peer.closed_by_server().await);
    relay.shutdown.cancel();
}

#[tokio::test]
async fn garbage_frame_closes_connection() {
    let relay = start_relay().await;
    let mut peer = Peer::connect(&relay.url, "noisy").await;
    peer.ws
        .send(Message::Binary(vec![0xff, 0xff, 0xff].into()))
        .await
        .unwrap();
    assert!(peer.closed_by_server().await);
    relay.shutdown.cancel();
}

#[tokio::test]
async fn healthz_answers_ok() {
    let relay = start_relay().await;
    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("ok"), "{response}");
    relay.shutdown.cancel();
}

#[tokio::test]
async fn shutdown_closes_open_connections() {
    let relay = start_relay().await;
    let mut peer = Peer::connect(&relay.url, "stayer").await;

    relay.shutdown.cancel();
    tokio::time::timeout(RECV_TIMEOUT, relay.handle)
        .await
        .expect("serve did not stop")
        .unwrap()
        .unwrap();
    assert!(peer.closed_by_server().await);
}
