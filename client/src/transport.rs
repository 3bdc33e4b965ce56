use anyhow::{bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use tandem_protocol::Envelope;

pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
pub const PING_PERIOD: Duration = Duration::from_secs(15);
pub const PONG_WAIT: Duration = Duration::from_secs(30);
pub const INBOUND_QUEUE: usize = 128;
pub const OUTBOUND_QUEUE: usize = 128;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection deadlines. Defaults are the production values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimings {
    pub connect_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub write_wait: Duration,
    pub ping_period: Duration,
    /// Inbound liveness: the connection is dropped after this long without any frame.
    pub pong_wait: Duration,
}

impl Default for TransportTimings {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            reconnect_backoff: RECONNECT_BACKOFF,
            write_wait: WRITE_WAIT,
            ping_period: PING_PERIOD,
            pong_wait: PONG_WAIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

/// Callbacks from the connection loop to its owner.
pub trait TransportHooks: Send + Sync + 'static {
    /// Builds the first envelope sent on a fresh connection. An error tears the connection down.
    fn on_connect(&self) -> Result<Envelope>;
    /// Connected (`true`) after the hello went out; disconnected (`false`) when it drops.
    fn on_status(&self, connected: bool);
    /// Any successful read or write.
    fn on_activity(&self);
}

/// Cheap, cloneable sending side of a [`Transport`].
#[derive(Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<Envelope>,
    state: watch::Receiver<ConnectionState>,
}

impl TransportHandle {
    /// Queues an envelope without waiting. Returns false if it was dropped.
    pub fn send(&self, envelope: Envelope) -> bool {
        match self.outbound.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                tracing::warn!("Outbound queue full, dropping {}", envelope.kind());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Reconnecting WebSocket client carrying binary envelopes.
pub struct Transport {
    url: String,
    hooks: Arc<dyn TransportHooks>,
    timings: TransportTimings,
    inbound: mpsc::Sender<Envelope>,
    outbound: mpsc::Receiver<Envelope>,
    state: watch::Sender<ConnectionState>,
}

impl Transport {
    /// Returns the loop itself, its sending handle and the inbound envelope queue.
    pub fn new(
        url: impl Into<String>,
        hooks: Arc<dyn TransportHooks>,
    ) -> (Self, TransportHandle, mpsc::Receiver<Envelope>) {
        Self::with_timings(url, hooks, TransportTimings::default())
    }

    pub fn with_timings(
        url: impl Into<String>,
        hooks: Arc<dyn TransportHooks>,
        timings: TransportTimings,
    ) -> (Self, TransportHandle, mpsc::Receiver<Envelope>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let transport = Self {
            url: url.into(),
            hooks,
            timings,
            inbound: inbound_tx,
            outbound: outbound_rx,
            state: state_tx,
        };
        let handle = TransportHandle {
            outbound: outbound_tx,
            state: state_rx,
        };
        (transport, handle, inbound_rx)
    }

    /// Connects, pumps frames and reconnects after a fixed backoff until cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.connect_once(&shutdown).await {
                Ok(()) => tracing::info!("Connection to {} closed", self.url),
                Err(e) => tracing::warn!("Connection to {} failed: {:#}", self.url, e),
            }
            self.set_state(ConnectionState::Disconnected);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = time::sleep(self.timings.reconnect_backoff) => {}
            }
        }
        tracing::debug!("Transport stopped");
    }

    #[cfg(test)]
    pub(crate) fn try_next_outbound(&mut self) -> Option<Envelope> {
        self.outbound.try_recv().ok()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!("Transport {:?} -> {:?}", previous, next);
        }
    }

    async fn connect_once(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let connect = time::timeout(self.timings.connect_timeout, connect_async(self.url.as_str()));
        let ws = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = connect => {
                let (ws, _) = result
                    .context("connect timed out")?
                    .context("websocket handshake failed")?;
                ws
            }
        };

        self.set_state(ConnectionState::Handshaking);
        let hello = self.hooks.on_connect().context("on-connect hook failed")?;
        let frame = hello.encode()?;
        let (mut sink, mut stream) = ws.split();
        time::timeout(
            self.timings.write_wait,
            sink.send(WsMessage::Binary(frame.into())),
        )
            .await
            .context("hello write timed out")?
            .context("hello write failed")?;
        self.hooks.on_activity();

        self.hooks.on_status(true);
        self.set_state(ConnectionState::Connected);
        tracing::info!("Connected to {}", self.url);

        let hooks = &self.hooks;
        let timings = self.timings;
        let result = tokio::select! {
            result = read_loop(&mut stream, &self.inbound, hooks.as_ref(), timings.pong_wait) => result,
            result = write_loop(sink, &mut self.outbound, hooks.as_ref(), &timings, shutdown) => result,
        };
        self.hooks.on_status(false);
        result
    }
}

async fn read_loop(
    stream: &mut SplitStream<WsStream>,
    inbound: &mpsc::Sender<Envelope>,
    hooks: &dyn TransportHooks,
    pong_wait: Duration,
) -> Result<()> {
    loop {
        let message = match time::timeout(pong_wait, stream.next()).await {
            Err(_) => bail!("no inbound traffic for {:?}", pong_wait),
            Ok(None) => return Ok(()),
            Ok(Some(message)) => message.context("read failed")?,
        };
        hooks.on_activity();
        match message {
            WsMessage::Binary(frame) => {
                let envelope = Envelope::decode(&frame).context("undecodable frame")?;
                match inbound.try_send(envelope) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(envelope)) => {
                        tracing::warn!("Inbound queue full, dropping {}", envelope.kind());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return Ok(()),
                }
            }
            WsMessage::Close(_) => return Ok(()),
            _ => {}
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    outbound: &mut mpsc::Receiver<Envelope>,
    hooks: &dyn TransportHooks,
    timings: &TransportTimings,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut ping = time::interval_at(
        Instant::now() + timings.ping_period,
        timings.ping_period,
    );
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = time::timeout(timings.write_wait, sink.close()).await;
                return Ok(());
            }
            envelope = outbound.recv() => match envelope {
                Some(envelope) => match envelope.encode() {
                    Ok(frame) => WsMessage::Binary(frame.into()),
                    Err(e) => {
                        tracing::error!("Failed to encode {}: {}", envelope.kind(), e);
                        continue;
                    }
                },
                None => return Ok(()),
            },
            _ = ping.tick() => WsMessage::Ping(Vec::<u8>::new().into()),
        };
        time::timeout(timings.write_wait, sink.send(message))
            .await
            .context("write timed out")?
            .context("write failed")?;
        hooks.on_activity();
    }
}
