use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tandem_protocol::{unix_millis, ClientHello, Envelope, ServerHello};

use crate::error::RelayError;
use crate::state::{Frame, ServerState, OUTBOUND_QUEUE};

/// Maximum time a single frame write may take.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Inbound liveness window; any frame (including Pong) refreshes it.
pub const PONG_WAIT: Duration = Duration::from_secs(30);
pub const PING_PERIOD: Duration = Duration::from_secs(15);

/// Drives one WebSocket connection from hello to teardown.
pub async fn handle_connection(socket: WebSocket, state: ServerState, shutdown: CancellationToken) {
    let (mut sink, mut stream) = socket.split();

    let hello = tokio::select! {
        _ = shutdown.cancelled() => return,
        hello = read_hello(&mut stream) => hello,
    };
    let hello = match hello {
        Ok(hello) => hello,
        Err(e) => {
            tracing::warn!("Closing connection before hello: {}", e);
            let _ = time::timeout(WRITE_WAIT, sink.close()).await;
            return;
        }
    };

    let client_id = Uuid::new_v4().simple().to_string();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    state.add_client(&client_id, &hello.client_name, tx);
    tracing::debug!(
        "Hello from {} ({} {})",
        client_id,
        hello.client_name,
        hello.client_version
    );
    state.send_to(
        &client_id,
        &Envelope::ServerHello(ServerHello {
            client_id: client_id.clone(),
            server_time_ms: unix_millis(),
        }),
    );

    let conn = shutdown.child_token();
    let writer = tokio::spawn(write_loop(sink, rx, conn.clone()));

    if let Err(e) = read_loop(&mut stream, &state, &client_id, &conn).await {
        tracing::info!("Connection {} closed: {}", client_id, e);
    }

    conn.cancel();
    state.remove_client(&client_id);
    if let Err(e) = writer.await {
        tracing::error!("Writer for {} panicked: {}", client_id, e);
    }
}

async fn read_hello(stream: &mut SplitStream<WebSocket>) -> Result<ClientHello, RelayError> {
    let next = time::timeout(PONG_WAIT, stream.next())
        .await
        .map_err(|_| RelayError::HelloTimeout)?;
    match next {
        Some(Ok(Message::Binary(frame))) => match Envelope::decode(&frame)? {
            Envelope::ClientHello(hello) => Ok(hello),
            other => Err(RelayError::UnexpectedHello(other.kind())),
        },
        Some(Err(e)) => Err(e.into()),
        Some(Ok(_)) | None => Err(RelayError::HelloMissing),
    }
}

async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    state: &ServerState,
    client_id: &str,
    conn: &CancellationToken,
) -> Result<(), RelayError> {
    loop {
        let next = tokio::select! {
            _ = conn.cancelled() => return Ok(()),
            next = time::timeout(PONG_WAIT, stream.next()) => next,
        };
        let message = match next {
            Err(_) => return Err(RelayError::ReadTimeout(PONG_WAIT)),
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return Ok(()),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(message))) => message,
        };
        match message {
            Message::Binary(frame) => {
                let envelope = Envelope::decode(&frame)?;
                dispatch(state, client_id, envelope);
            }
            Message::Text(_) => {
                tracing::debug!("Ignoring text frame from {}", client_id);
            }
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) => {}
        }
    }
}

fn dispatch(state: &ServerState, client_id: &str, envelope: Envelope) {
    match envelope {
        Envelope::ClientHello(hello) => state.rename_client(client_id, &hello.client_name),
        Envelope::CreateRoomReq(_) => {
            if let Err(e) = state.create_room(client_id) {
                tracing::warn!("Create room for {} failed: {}", client_id, e);
            }
        }
        Envelope::JoinRoomReq(req) => {
            if let Err(e) = state.join_room(client_id, &req.room_code) {
                tracing::info!("Join {} by {} failed: {}", req.room_code, client_id, e);
                state.send_error(client_id, &e.to_string());
            }
        }
        Envelope::LeaveRoomReq(_) => {
            state.leave_room(client_id);
        }
        Envelope::MemberStatus(status) => {
            if !state.update_member_status(client_id, &status) {
                tracing::debug!("Ignoring member status from {}", client_id);
            }
        }
        Envelope::HostState(host_state) => {
            if state.apply_host_state(client_id, host_state).is_none() {
                tracing::debug!("Ignoring host state from non-host {}", client_id);
            }
        }
        Envelope::TimeSyncReq(req) => state.time_sync(client_id, &req),
        other => {
            tracing::debug!("Ignoring {} from client {}", other.kind(), client_id);
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Frame>,
    conn: CancellationToken,
) {
    let mut ping = time::interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    loop {
        let message = tokio::select! {
            _ = conn.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => Message::Binary(frame),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };
        match time::timeout(WRITE_WAIT, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("Write failed: {}", e);
                break;
            }
            Err(_) => {
                tracing::warn!("Write timed out after {:?}", WRITE_WAIT);
                break;
            }
        }
    }
    // Unblocks the reader when the write side dies first.
    conn.cancel();
    let _ = time::timeout(WRITE_WAIT, sink.close()).await;
}
