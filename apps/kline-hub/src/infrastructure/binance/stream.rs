//! Market Stream Client
//!
//! Holds the hub's single WebSocket connection to the Binance market
//! stream. Klines and tickers are decoded and forwarded to the ingest
//! pipeline as [`ExchangeEvent`]s.
//!
//! # Stream URL
//!
//! - Production: `wss://stream.binance.com:9443/ws`
//!
//! # Lifecycle
//!
//! Every connection attempt is reflected in the shared
//! [`UpstreamMonitor`]: `Dial` before connecting, `Established` once the
//! stream set has been requested, `Dropped` on any failure and `Shutdown`
//! on cancellation. The desired stream set is followed through a `watch`
//! channel: every connection subscribes to its latest value, and changes
//! arriving while connected are applied as a diff against what this
//! connection already requested. Every write to the exchange is bounded by
//! the write timeout; a stalled write drops the connection.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, StreamCodec};
use super::messages::{BinanceMessage, StreamMethod, StreamRequest, stream_name};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::domain::streaming::{Channel, RawKline, RawTicker};
use crate::domain::upstream::{LinkEvent, LinkState, Transition, UpstreamMonitor};
use crate::infrastructure::config::{ExchangeSettings, WebSocketSettings};
use crate::infrastructure::heartbeat::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatManager, PingTracker,
};
use crate::infrastructure::metrics::{self, ErrorKind};

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end one connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum StreamClientError {
    /// Connection did not open in time.
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A frame could not be written in time.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Codec error while encoding a request.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No pong within the heartbeat timeout.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// The server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The event receiver is gone; nothing left to stream for.
    #[error("event channel closed")]
    ChannelClosed,
}

// =============================================================================
// Events
// =============================================================================

/// Events emitted by the stream client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// Connected and stream set requested.
    Connected,
    /// An established connection was lost.
    Disconnected {
        /// Failure description.
        reason: String,
    },
    /// Waiting before the next connection attempt.
    Reconnecting {
        /// Attempt number since the last stable connection.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Kline update.
    Kline(RawKline),
    /// Ticker update.
    Ticker(RawTicker),
    /// A control request was acknowledged.
    Subscribed {
        /// Request id.
        id: u64,
    },
    /// Exchange error frame.
    Error(String),
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the stream client.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// WebSocket URL.
    pub url: String,
    /// Bound on opening the connection.
    pub connect_timeout: Duration,
    /// Bound on each outbound frame.
    pub write_timeout: Duration,
    /// Stream names per control request.
    pub max_streams_per_request: usize,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
}

impl StreamClientConfig {
    /// Build from hub settings.
    #[must_use]
    pub fn from_settings(exchange: &ExchangeSettings, websocket: &WebSocketSettings) -> Self {
        Self {
            url: exchange.ws_url.clone(),
            connect_timeout: exchange.connect_timeout,
            write_timeout: exchange.write_timeout,
            max_streams_per_request: exchange.max_streams_per_request,
            reconnect: ReconnectConfig::from_websocket_settings(websocket),
            heartbeat: HeartbeatConfig::from_websocket_settings(websocket),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// WebSocket client for the exchange market stream.
pub struct BinanceStreamClient {
    config: StreamClientConfig,
    codec: StreamCodec,
    event_tx: mpsc::Sender<ExchangeEvent>,
    demand: watch::Receiver<BTreeSet<Channel>>,
    demand_open: bool,
    monitor: Arc<UpstreamMonitor>,
    cancel: CancellationToken,
    /// Streams requested on the current connection.
    streams: BTreeSet<String>,
    next_request_id: u64,
}

impl BinanceStreamClient {
    /// Create a client that streams whatever `demand` currently holds.
    #[must_use]
    pub fn new(
        config: StreamClientConfig,
        demand: watch::Receiver<BTreeSet<Channel>>,
        event_tx: mpsc::Sender<ExchangeEvent>,
        monitor: Arc<UpstreamMonitor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            codec: StreamCodec::new(),
            event_tx,
            demand,
            demand_open: true,
            monitor,
            cancel,
            streams: BTreeSet::new(),
            next_request_id: 1,
        }
    }

    /// Run the connection loop until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`StreamClientError::ChannelClosed`] if the event receiver
    /// is dropped; every other failure leads to a reconnect.
    pub async fn run(mut self) -> Result<(), StreamClientError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                self.transition(LinkEvent::Shutdown);
                tracing::info!("Stream client cancelled");
                return Ok(());
            }

            self.transition(LinkEvent::Dial);

            match self.connect_and_run().await {
                Ok(()) => {
                    self.transition(LinkEvent::Shutdown);
                    tracing::info!("Stream connection closed on shutdown");
                    return Ok(());
                }
                Err(StreamClientError::ChannelClosed) => {
                    self.transition(LinkEvent::Shutdown);
                    return Err(StreamClientError::ChannelClosed);
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::warn!(error = %reason, "Stream connection error");
                    self.monitor.record_error(reason.clone());
                    metrics::record_error(ErrorKind::Connection);

                    let transition = self.transition(LinkEvent::Dropped);
                    policy.on_disconnect(transition.and_then(|t| t.connected_for));

                    if transition.is_some_and(|t| t.from == LinkState::Connected) {
                        self.emit(ExchangeEvent::Disconnected { reason }).await?;
                    }

                    let delay = policy.next_delay();
                    let attempt = policy.attempt_count();
                    tracing::info!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Reconnecting to market stream"
                    );
                    metrics::record_reconnect();
                    self.emit(ExchangeEvent::Reconnecting { attempt, delay }).await?;

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            self.transition(LinkEvent::Shutdown);
                            tracing::info!("Stream client cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect and stream until error or cancellation.
    async fn connect_and_run(&mut self) -> Result<(), StreamClientError> {
        tracing::info!(url = %self.config.url, "Connecting to market stream");

        let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
        let (ws_stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| StreamClientError::ConnectTimeout(self.config.connect_timeout))??;

        let (mut write, mut read) = ws_stream.split();

        self.streams.clear();
        let streams: Vec<String> = self.desired_streams().into_iter().collect();
        self.send_requests(&mut write, StreamMethod::Subscribe, &streams)
            .await?;
        self.streams.extend(streams);

        self.transition(LinkEvent::Established);
        tracing::info!(streams = self.streams.len(), "Market stream connected");
        self.emit(ExchangeEvent::Connected).await?;

        let tracker = Arc::new(PingTracker::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(4);
        let heartbeat_cancel = self.cancel.child_token();
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat.clone(),
                tracker.clone(),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );
        let _heartbeat_guard = heartbeat_cancel.drop_guard();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = self.send_frame(&mut write, Message::Close(None)).await;
                    return Ok(());
                }
                event = heartbeat_rx.recv() => {
                    match event {
                        Some(HeartbeatEvent::SendPing) => {
                            tracker.mark_ping_sent();
                            self.send_frame(&mut write, Message::Ping(Vec::new().into())).await?;
                        }
                        Some(HeartbeatEvent::Timeout) => {
                            return Err(StreamClientError::HeartbeatTimeout);
                        }
                        None => {}
                    }
                }
                changed = self.demand.changed(), if self.demand_open => {
                    match changed {
                        Ok(()) => self.sync_streams(&mut write).await?,
                        Err(_) => {
                            tracing::debug!("Demand source closed");
                            self.demand_open = false;
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            tracker.record_pong();
                            self.handle_text(text.as_str()).await?;
                        }
                        Some(Ok(Message::Pong(_))) => tracker.record_pong(),
                        Some(Ok(Message::Ping(data))) => {
                            tracker.record_pong();
                            self.send_frame(&mut write, Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Server sent close frame");
                            return Err(StreamClientError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(StreamClientError::ConnectionClosed),
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) -> Result<(), StreamClientError> {
        let message = match self.codec.decode(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable stream frame");
                metrics::record_error(ErrorKind::Codec);
                return Ok(());
            }
        };

        match message {
            BinanceMessage::Kline(event) => {
                // The only place exchange messages are counted.
                self.monitor.record_message();
                self.emit(ExchangeEvent::Kline(event.into_raw())).await
            }
            BinanceMessage::Ticker(event) => {
                self.monitor.record_message();
                self.emit(ExchangeEvent::Ticker(event.into_raw())).await
            }
            BinanceMessage::Ack { id } => {
                tracing::debug!(id, "Stream request acknowledged");
                self.emit(ExchangeEvent::Subscribed { id }).await
            }
            BinanceMessage::Error(frame) => {
                tracing::error!(code = frame.code, msg = %frame.msg, id = ?frame.id, "Exchange error frame");
                self.monitor.record_error(frame.msg.clone());
                self.emit(ExchangeEvent::Error(frame.msg)).await
            }
        }
    }

    /// Latest desired stream names, marking the demand as seen.
    fn desired_streams(&mut self) -> BTreeSet<String> {
        self.demand.borrow_and_update().iter().map(stream_name).collect()
    }

    /// Bring the connection's stream set in line with the demand.
    async fn sync_streams<W>(&mut self, write: &mut W) -> Result<(), StreamClientError>
    where
        W: Sink<Message, Error = WsError> + Unpin,
    {
        let desired = self.desired_streams();
        let added: Vec<String> = desired.difference(&self.streams).cloned().collect();
        let removed: Vec<String> = self.streams.difference(&desired).cloned().collect();

        self.send_requests(write, StreamMethod::Subscribe, &added)
            .await?;
        self.streams.extend(added);
        self.send_requests(write, StreamMethod::Unsubscribe, &removed)
            .await?;
        for name in &removed {
            self.streams.remove(name);
        }
        Ok(())
    }

    async fn send_requests<W>(
        &mut self,
        write: &mut W,
        method: StreamMethod,
        streams: &[String],
    ) -> Result<(), StreamClientError>
    where
        W: Sink<Message, Error = WsError> + Unpin,
    {
        let requests = StreamRequest::batched(
            method,
            streams,
            self.config.max_streams_per_request,
            self.next_request_id,
        );
        self.next_request_id += requests.len() as u64;

        for request in requests {
            tracing::debug!(?method, id = request.id, streams = request.params.len(), "Sending stream request");
            let json = self.codec.encode(&request)?;
            self.send_frame(write, Message::Text(json.into())).await?;
        }
        Ok(())
    }

    async fn send_frame<W>(&self, write: &mut W, message: Message) -> Result<(), StreamClientError>
    where
        W: Sink<Message, Error = WsError> + Unpin,
    {
        let limit = self.config.write_timeout;
        tokio::time::timeout(limit, write.send(message))
            .await
            .map_err(|_| StreamClientError::WriteTimeout(limit))?
            .map_err(StreamClientError::from)
    }

    async fn emit(&self, event: ExchangeEvent) -> Result<(), StreamClientError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| StreamClientError::ChannelClosed)
    }

    fn transition(&self, event: LinkEvent) -> Option<Transition> {
        match self.monitor.apply(event) {
            Ok(transition) => {
                metrics::set_upstream_state(transition.to.code());
                tracing::debug!(from = transition.from.as_str(), to = transition.to.as_str(), "Upstream link transition");
                Some(transition)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring invalid upstream transition");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::net::TcpListener;
    use tokio_tungstenite::WebSocketStream;

    use super::*;
    use crate::domain::streaming::Interval;
    use crate::domain::subscription::DemandTracker;

    const KLINE: &str = r#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":60000,"T":119999,
        "s":"BTCUSDT","i":"1m","o":"1","c":"1","h":"1","l":"1","v":"1","n":1,"x":true,"q":"1"}}"#;

    fn config(url: String) -> StreamClientConfig {
        StreamClientConfig {
            url,
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            max_streams_per_request: 200,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
                multiplier: 2.0,
                jitter_factor: 0.0,
                stable_after: Duration::from_secs(60),
            },
            heartbeat: HeartbeatConfig::default(),
        }
    }

    fn client(
        url: String,
        demand: &DemandTracker,
        monitor: &Arc<UpstreamMonitor>,
        cancel: &CancellationToken,
    ) -> (BinanceStreamClient, mpsc::Receiver<ExchangeEvent>) {
        let (event_tx, event_rx) = mpsc::channel(16);
        let client = BinanceStreamClient::new(
            config(url),
            demand.upstream(),
            event_tx,
            Arc::clone(monitor),
            cancel.clone(),
        );
        (client, event_rx)
    }

    async fn next_request(ws: &mut WebSocketStream<tokio::net::TcpStream>) -> serde_json::Value {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<ExchangeEvent>) -> ExchangeEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn recv_request(rx: &mut mpsc::UnboundedReceiver<serde_json::Value>) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("request in time")
            .expect("server running")
    }

    /// Sink whose writes never complete.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn subscribes_base_streams_and_forwards_klines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let request = next_request(&mut ws).await;
            let ack = format!(r#"{{"result":null,"id":{}}}"#, request["id"]);
            ws.send(Message::Text(ack.into())).await.unwrap();
            ws.send(Message::Text(KLINE.to_string().into())).await.unwrap();
            let _ = release_rx.await;
            request
        });

        let demand = DemandTracker::new([
            Channel::kline("BTCUSDT", Interval::OneMinute),
            Channel::ticker("BTCUSDT"),
        ]);
        let monitor = Arc::new(UpstreamMonitor::new("binance"));
        let cancel = CancellationToken::new();
        let (client, mut event_rx) = client(format!("ws://{addr}"), &demand, &monitor, &cancel);
        let handle = tokio::spawn(client.run());

        assert_eq!(recv(&mut event_rx).await, ExchangeEvent::Connected);
        assert_eq!(recv(&mut event_rx).await, ExchangeEvent::Subscribed { id: 1 });
        match recv(&mut event_rx).await {
            ExchangeEvent::Kline(raw) => assert_eq!(raw.open_time, Some(60_000)),
            other => panic!("expected kline, got {other:?}"),
        }
        assert!(monitor.is_connected());
        assert_eq!(monitor.snapshot().messages_received, 1);

        release_tx.send(()).unwrap();
        let request = server.await.unwrap();
        assert_eq!(request["method"], "SUBSCRIBE");
        assert_eq!(
            request["params"],
            serde_json::json!(["btcusdt@kline_1m", "btcusdt@ticker"])
        );

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(monitor.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn demand_changes_become_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (request_tx, mut requests) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            loop {
                let request = next_request(&mut ws).await;
                if request_tx.send(request).is_err() {
                    break;
                }
            }
        });

        let demand = DemandTracker::new([Channel::ticker("BTCUSDT")]);
        let monitor = Arc::new(UpstreamMonitor::new("binance"));
        let cancel = CancellationToken::new();
        let (client, mut event_rx) = client(format!("ws://{addr}"), &demand, &monitor, &cancel);
        let handle = tokio::spawn(client.run());
        assert_eq!(recv(&mut event_rx).await, ExchangeEvent::Connected);
        let _base = recv_request(&mut requests).await;

        let extra = Channel::kline("ETHUSDT", Interval::OneHour);
        demand.acquire(&[extra.clone()]);
        let subscribe = recv_request(&mut requests).await;
        assert_eq!(subscribe["method"], "SUBSCRIBE");
        assert_eq!(subscribe["params"], serde_json::json!(["ethusdt@kline_1h"]));

        demand.release(&[extra]);
        let unsubscribe = recv_request(&mut requests).await;
        assert_eq!(unsubscribe["method"], "UNSUBSCRIBE");
        assert_eq!(unsubscribe["params"], serde_json::json!(["ethusdt@kline_1h"]));
        assert_eq!(unsubscribe["id"], 3);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn dropped_connection_reconnects_with_current_demand() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (request_tx, mut requests) = mpsc::unbounded_channel();
        let (drop_tx, drop_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            // First connection is dropped on request.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            request_tx.send(next_request(&mut ws).await).unwrap();
            let _ = drop_rx.await;
            drop(ws);

            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            request_tx.send(next_request(&mut ws).await).unwrap();
            while ws.next().await.is_some() {}
        });

        let demand = DemandTracker::new([Channel::ticker("BTCUSDT")]);
        let monitor = Arc::new(UpstreamMonitor::new("binance"));
        let cancel = CancellationToken::new();
        let (client, mut event_rx) = client(format!("ws://{addr}"), &demand, &monitor, &cancel);
        let handle = tokio::spawn(client.run());

        assert_eq!(recv(&mut event_rx).await, ExchangeEvent::Connected);
        let first = recv_request(&mut requests).await;
        assert_eq!(first["params"], serde_json::json!(["btcusdt@ticker"]));

        // Demand added on the old connection is requested again on the new one.
        demand.acquire(&[Channel::ticker("SOLUSDT")]);
        drop_tx.send(()).unwrap();
        assert!(matches!(recv(&mut event_rx).await, ExchangeEvent::Disconnected { .. }));
        assert_eq!(
            recv(&mut event_rx).await,
            ExchangeEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(20)
            }
        );
        assert_eq!(recv(&mut event_rx).await, ExchangeEvent::Connected);
        assert_eq!(monitor.snapshot().reconnects, 1);

        let second = recv_request(&mut requests).await;
        assert_eq!(second["method"], "SUBSCRIBE");
        assert_eq!(
            second["params"],
            serde_json::json!(["btcusdt@ticker", "solusdt@ticker"])
        );

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out() {
        let demand = DemandTracker::new([Channel::ticker("BTCUSDT")]);
        let monitor = Arc::new(UpstreamMonitor::new("binance"));
        let cancel = CancellationToken::new();
        let (mut client, _event_rx) = client("ws://unused".into(), &demand, &monitor, &cancel);

        let ping = client
            .send_frame(&mut StalledSink, Message::Ping(Vec::new().into()))
            .await;
        assert!(matches!(ping, Err(StreamClientError::WriteTimeout(limit)) if limit == Duration::from_secs(5)));

        demand.acquire(&[Channel::ticker("ETHUSDT")]);
        let sync = client.sync_streams(&mut StalledSink).await;
        assert!(matches!(sync, Err(StreamClientError::WriteTimeout(_))));
    }
}
