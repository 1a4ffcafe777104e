//! Multiplexed relay channel over one physical tunnel

use crate::stream::{RelayStream, StreamShared};
use crate::{lock, RelayConfig, RelayError};
use futures::{SinkExt, StreamExt};
use meshhub_proto::{ControlMessage, Frame, FrameCodec, FrameType, StreamId, CONTROL_STREAM_ID};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Which side of the physical tunnel this channel sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the tunnel (endpoint side), opens odd stream ids
    Client,
    /// Accepted the tunnel (hub side), opens even stream ids
    Server,
}

impl Role {
    fn first_stream_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn is_peer_stream(self, id: StreamId) -> bool {
        match self {
            Role::Client => id % 2 == 0,
            Role::Server => id % 2 == 1,
        }
    }
}

/// Channel statistics
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_streams: usize,
    pub uptime: Duration,
}

/// Incoming stream waiting for `accept_stream`
pub(crate) struct PendingStream {
    state: Arc<StreamShared>,
    permit: OwnedSemaphorePermit,
}

pub(crate) struct Shared {
    channel_id: String,
    role: Role,
    pub(crate) config: RelayConfig,
    frame_tx: mpsc::UnboundedSender<Frame>,
    streams: Mutex<HashMap<StreamId, Arc<StreamShared>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<PendingStream>>,
    next_stream_id: AtomicU32,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    close_reason: Mutex<Option<String>>,
    created_at: Instant,
    /// Milliseconds since `created_at` when the last frame arrived
    last_seen_ms: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Shared {
    pub(crate) fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub(crate) fn send_frame(&self, frame: Frame) -> Result<(), RelayError> {
        if self.shutdown.is_cancelled() {
            return Err(self.closed_error());
        }
        self.frame_tx.send(frame).map_err(|_| self.closed_error())
    }

    pub(crate) fn closed_error(&self) -> RelayError {
        RelayError::PeerGone(
            self.close_reason()
                .unwrap_or_else(|| "relay channel closed".to_string()),
        )
    }

    pub(crate) fn forget_stream(&self, id: StreamId) {
        lock(&self.streams).remove(&id);
    }

    fn close_reason(&self) -> Option<String> {
        lock(&self.close_reason).clone()
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.created_at.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_seen_ms.load(Ordering::Relaxed)))
    }

    fn stream(&self, id: StreamId) -> Option<Arc<StreamShared>> {
        lock(&self.streams).get(&id).cloned()
    }

    fn register(&self, id: StreamId, state: Arc<StreamShared>) -> Result<(), RelayError> {
        let mut streams = lock(&self.streams);
        // Checked under the map lock so terminate() cannot miss this stream
        if self.shutdown.is_cancelled() {
            return Err(self.closed_error());
        }
        if streams.contains_key(&id) {
            return Err(RelayError::ProtocolError(format!(
                "stream {} is already open",
                id
            )));
        }
        streams.insert(id, state);
        Ok(())
    }

    fn allocate_stream_id(&self) -> Result<StreamId, RelayError> {
        self.next_stream_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(2))
            .map_err(|_| RelayError::ProtocolError("stream ids exhausted".to_string()))
    }

    /// Tear the channel down and abort every open stream
    fn terminate(&self, reason: String) {
        {
            let mut slot = lock(&self.close_reason);
            if slot.is_none() {
                debug!(channel_id = %self.channel_id, %reason, "Relay channel closing");
                *slot = Some(reason);
            }
        }
        self.shutdown.cancel();
        self.permits.close();

        let error = self.closed_error();
        let streams: Vec<Arc<StreamShared>> =
            lock(&self.streams).drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.abort(error.clone());
        }
    }

    fn close_with_goaway(&self, reason: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        match (ControlMessage::GoAway {
            reason: reason.to_string(),
        })
        .to_frame()
        {
            Ok(frame) => {
                let _ = self.send_frame(frame);
            }
            Err(e) => warn!(channel_id = %self.channel_id, "Failed to encode GoAway: {}", e),
        }
        self.terminate(reason.to_string());
    }

    fn handle_frame(
        &self,
        frame: Frame,
        accept_tx: &mpsc::Sender<PendingStream>,
    ) -> Result<(), RelayError> {
        self.touch();
        self.bytes_received.fetch_add(
            (Frame::HEADER_SIZE + frame.payload.len()) as u64,
            Ordering::Relaxed,
        );
        trace!(
            channel_id = %self.channel_id,
            "Received frame: stream={}, type={:?}, flags={}, len={}",
            frame.stream_id,
            frame.frame_type,
            frame.flags.as_u8(),
            frame.payload.len()
        );

        match frame.frame_type {
            FrameType::Control => self.handle_control(&frame),
            FrameType::Data => self.handle_data(frame, accept_tx),
            FrameType::Close => {
                if let Some(stream) = lock(&self.streams).remove(&frame.stream_id) {
                    debug!(channel_id = %self.channel_id, "Stream {} reset by peer", frame.stream_id);
                    stream.abort(RelayError::StreamReset);
                }
                Ok(())
            }
            FrameType::WindowUpdate => {
                let credit = frame.window_credit()?;
                if let Some(stream) = self.stream(frame.stream_id) {
                    stream.grant(credit);
                }
                Ok(())
            }
        }
    }

    fn handle_control(&self, frame: &Frame) -> Result<(), RelayError> {
        match ControlMessage::from_frame(frame)? {
            ControlMessage::Ping { nonce } => {
                let _ = self.send_frame(ControlMessage::Pong { nonce }.to_frame()?);
            }
            ControlMessage::Pong { nonce } => {
                trace!(channel_id = %self.channel_id, "Pong {}", nonce);
            }
            ControlMessage::GoAway { reason } => {
                self.terminate(format!("peer closed the channel: {}", reason));
            }
        }
        Ok(())
    }

    fn handle_data(
        &self,
        frame: Frame,
        accept_tx: &mpsc::Sender<PendingStream>,
    ) -> Result<(), RelayError> {
        let id = frame.stream_id;
        if id == CONTROL_STREAM_ID {
            return Err(RelayError::ProtocolError(
                "data frame on the control stream".to_string(),
            ));
        }

        if frame.flags.has_syn() {
            if !self.role.is_peer_stream(id) {
                return Err(RelayError::ProtocolError(format!(
                    "peer opened stream {} with our id parity",
                    id
                )));
            }
            self.admit(id, accept_tx)?;
        }

        let Some(stream) = self.stream(id) else {
            // Late frames for a stream we already dropped or refused
            trace!(channel_id = %self.channel_id, "Frame for unknown stream {}", id);
            return Ok(());
        };

        if !frame.payload.is_empty() {
            if let Err(e) = stream.push_data(frame.payload) {
                warn!(channel_id = %self.channel_id, "Resetting stream {}: {}", id, e);
                self.forget_stream(id);
                stream.abort(e);
                let _ = self.send_frame(Frame::reset(id));
                return Ok(());
            }
        }

        if frame.flags.has_fin() {
            stream.recv_fin();
        }
        Ok(())
    }

    fn admit(&self, id: StreamId, accept_tx: &mpsc::Sender<PendingStream>) -> Result<(), RelayError> {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    channel_id = %self.channel_id,
                    "Refusing stream {}: {} streams already open",
                    id,
                    self.config.max_streams
                );
                let _ = self.send_frame(Frame::reset(id));
                return Ok(());
            }
        };

        let state = Arc::new(StreamShared::new(id, self.config.initial_window));
        self.register(id, state.clone())?;

        if accept_tx.try_send(PendingStream { state, permit }).is_err() {
            warn!(channel_id = %self.channel_id, "Accept backlog full, refusing stream {}", id);
            self.forget_stream(id);
            let _ = self.send_frame(Frame::reset(id));
        } else {
            debug!(channel_id = %self.channel_id, "Accepted stream {}", id);
        }
        Ok(())
    }
}

/// Closes the channel when the last `RelayChannel` handle goes away
struct ChannelOwner(Arc<Shared>);

impl Drop for ChannelOwner {
    fn drop(&mut self) {
        self.0.close_with_goaway("relay channel dropped");
    }
}

/// Multiplexed relay channel
///
/// Cloning is cheap; all clones refer to the same physical tunnel. Streams
/// opened from the channel do not keep it alive.
#[derive(Clone)]
pub struct RelayChannel {
    shared: Arc<Shared>,
    _owner: Arc<ChannelOwner>,
}

impl std::fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayChannel")
            .field("channel_id", &self.shared.channel_id)
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RelayChannel {
    /// Start multiplexing over an established duplex tunnel.
    ///
    /// Spawns the reader, writer and keepalive tasks, so this must be called
    /// from within a tokio runtime.
    pub fn new<T>(io: T, role: Role, config: RelayConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel_id = format!("relay-{}", uuid::Uuid::new_v4());
        let (read_half, write_half) = tokio::io::split(io);

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(Shared {
            channel_id,
            role,
            frame_tx,
            streams: Mutex::new(HashMap::new()),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            permits: Arc::new(Semaphore::new(config.max_streams.max(1))),
            shutdown: CancellationToken::new(),
            close_reason: Mutex::new(None),
            created_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            config,
        });

        let codec = FrameCodec::with_max_frame_size(meshhub_proto::MAX_FRAME_SIZE as usize);
        let source = FramedRead::new(read_half, codec.clone());
        let sink = FramedWrite::new(write_half, codec);

        tokio::spawn(Self::writer_task(sink, frame_rx, shared.clone()));
        tokio::spawn(Self::reader_task(source, accept_tx, shared.clone()));
        tokio::spawn(Self::keepalive_task(shared.clone()));

        debug!(channel_id = %shared.channel_id, ?role, "Relay channel started");

        Self {
            _owner: Arc::new(ChannelOwner(shared.clone())),
            shared,
        }
    }

    /// Channel ID for logging and identity checks
    pub fn id(&self) -> &str {
        &self.shared.channel_id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Open a new logical stream to the peer.
    ///
    /// Waits while the channel is at its stream limit. Fails with
    /// [`RelayError::PeerGone`] once the channel is closed.
    pub async fn open_stream(&self) -> Result<RelayStream, RelayError> {
        let shared = &self.shared;

        let permit = tokio::select! {
            permit = shared.permits.clone().acquire_owned() => {
                permit.map_err(|_| shared.closed_error())?
            }
            _ = shared.shutdown.cancelled() => return Err(shared.closed_error()),
        };

        let id = shared.allocate_stream_id()?;
        let state = Arc::new(StreamShared::new(id, shared.config.initial_window));
        shared.register(id, state.clone())?;

        // Dropping the stream on the error path below unregisters it
        let stream = RelayStream::new(state, shared.clone(), permit);
        shared.send_frame(Frame::open(id))?;

        debug!(channel_id = %shared.channel_id, "Opened stream {}", id);
        Ok(stream)
    }

    /// Wait for the next stream opened by the peer.
    ///
    /// Returns `None` once the channel is closed and all queued streams have
    /// been handed out.
    pub async fn accept_stream(&self) -> Option<RelayStream> {
        let pending = self.shared.accept_rx.lock().await.recv().await?;
        Some(RelayStream::new(
            pending.state,
            self.shared.clone(),
            pending.permit,
        ))
    }

    /// Close the channel, notifying the peer and aborting all streams
    pub fn close(&self, reason: &str) {
        self.shared.close_with_goaway(reason);
    }

    pub(crate) fn closed_error(&self) -> RelayError {
        self.shared.closed_error()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolves when the channel has closed, with the close reason
    pub async fn closed(&self) -> String {
        self.shared.shutdown.cancelled().await;
        self.shared
            .close_reason()
            .unwrap_or_else(|| "relay channel closed".to_string())
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            active_streams: lock(&self.shared.streams).len(),
            uptime: self.shared.created_at.elapsed(),
        }
    }

    /// Writer task - drains the frame queue into the tunnel
    async fn writer_task<W>(
        mut sink: FramedWrite<WriteHalf<W>, FrameCodec>,
        mut rx: mpsc::UnboundedReceiver<Frame>,
        shared: Arc<Shared>,
    ) where
        W: AsyncRead + AsyncWrite + Send + 'static,
    {
        loop {
            let frame = tokio::select! {
                biased;
                frame = rx.recv() => frame,
                _ = shared.shutdown.cancelled() => None,
            };
            let Some(frame) = frame else { break };

            let written = tokio::select! {
                biased;
                result = Self::write_batch(&mut sink, &mut rx, frame, &shared) => result,
                _ = shared.shutdown.cancelled() => break,
            };
            if let Err(e) = written {
                debug!(channel_id = %shared.channel_id, "Tunnel write failed: {}", e);
                shared.terminate(format!("tunnel write failed: {}", e));
                break;
            }
        }

        // Best effort: deliver a queued GoAway and resets before closing
        let drain = async {
            while let Ok(frame) = rx.try_recv() {
                if sink.feed(frame).await.is_err() {
                    return;
                }
            }
            let _ = sink.close().await;
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), drain).await;
        debug!(channel_id = %shared.channel_id, "Relay writer task ended");
    }

    async fn write_batch<W>(
        sink: &mut FramedWrite<WriteHalf<W>, FrameCodec>,
        rx: &mut mpsc::UnboundedReceiver<Frame>,
        first: Frame,
        shared: &Shared,
    ) -> Result<(), meshhub_proto::MuxError>
    where
        W: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut written = Frame::HEADER_SIZE + first.payload.len();
        sink.feed(first).await?;
        for _ in 0..64 {
            match rx.try_recv() {
                Ok(frame) => {
                    written += Frame::HEADER_SIZE + frame.payload.len();
                    sink.feed(frame).await?;
                }
                Err(_) => break,
            }
        }
        sink.flush().await?;
        shared
            .bytes_sent
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Reader task - dispatches incoming frames to streams
    async fn reader_task<R>(
        mut source: FramedRead<ReadHalf<R>, FrameCodec>,
        accept_tx: mpsc::Sender<PendingStream>,
        shared: Arc<Shared>,
    ) where
        R: AsyncRead + AsyncWrite + Send + 'static,
    {
        let reason = loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break None,
                next = source.next() => match next {
                    Some(Ok(frame)) => {
                        if let Err(e) = shared.handle_frame(frame, &accept_tx) {
                            warn!(channel_id = %shared.channel_id, "Relay protocol violation: {}", e);
                            break Some(e.to_string());
                        }
                    }
                    Some(Err(e)) => break Some(format!("tunnel read failed: {}", e)),
                    None => break Some("tunnel closed by peer".to_string()),
                },
            }
        };

        if let Some(reason) = reason {
            shared.terminate(reason);
        }
        // Dropping accept_tx ends accept_stream() once the backlog is drained
        drop(accept_tx);
        debug!(channel_id = %shared.channel_id, "Relay reader task ended");
    }

    /// Keepalive task - pings the peer and detects a silent tunnel
    async fn keepalive_task(shared: Arc<Shared>) {
        let interval = shared.config.keepalive_interval;
        let timeout = shared.config.keepalive_timeout;
        let mut nonce = 0u64;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shared.shutdown.cancelled() => return,
            }

            let idle = shared.idle_for();
            if idle > timeout {
                warn!(channel_id = %shared.channel_id, "No traffic for {:?}, closing", idle);
                shared.terminate(format!("keepalive timeout after {:?}", idle));
                return;
            }

            nonce += 1;
            match (ControlMessage::Ping { nonce }).to_frame() {
                Ok(frame) => {
                    if shared.send_frame(frame).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(channel_id = %shared.channel_id, "Failed to encode ping: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn channel_pair(config: RelayConfig) -> (RelayChannel, RelayChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let hub = RelayChannel::new(a, Role::Server, config.clone());
        let endpoint = RelayChannel::new(b, Role::Client, config);
        (hub, endpoint)
    }

    #[tokio::test]
    async fn test_open_accept_roundtrip() {
        let (hub, endpoint) = channel_pair(RelayConfig::default());

        let mut outbound = hub.open_stream().await.unwrap();
        assert_eq!(outbound.id() % 2, 0);
        outbound.write_all(b"ping").await.unwrap();
        outbound.shutdown().await.unwrap();

        let mut inbound = timeout(Duration::from_secs(5), endpoint.accept_stream())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.id(), outbound.id());

        let mut buf = Vec::new();
        inbound.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        inbound.shutdown().await.unwrap();

        let mut reply = Vec::new();
        outbound.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");
    }

    #[tokio::test]
    async fn test_both_sides_open_streams() {
        let (hub, endpoint) = channel_pair(RelayConfig::default());

        let from_endpoint = endpoint.open_stream().await.unwrap();
        assert_eq!(from_endpoint.id() % 2, 1);
        let accepted = timeout(Duration::from_secs(5), hub.accept_stream())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.id(), from_endpoint.id());

        let from_hub = hub.open_stream().await.unwrap();
        assert_ne!(from_hub.id(), from_endpoint.id());
    }

    #[tokio::test]
    async fn test_stalled_stream_does_not_block_sibling() {
        let config = RelayConfig {
            initial_window: 1024,
            max_data_frame: 512,
            ..RelayConfig::default()
        };
        let (hub, endpoint) = channel_pair(config);

        // Fill the first stream's window without ever reading it
        let mut stalled = hub.open_stream().await.unwrap();
        let _stalled_peer = endpoint.accept_stream().await.unwrap();
        stalled.write_all(&[7u8; 1024]).await.unwrap();
        let blocked = timeout(Duration::from_millis(200), stalled.write_all(&[7u8; 10])).await;
        assert!(blocked.is_err(), "write beyond the window must wait for credit");

        // A sibling stream still flows freely
        let mut fast = hub.open_stream().await.unwrap();
        let mut fast_peer = timeout(Duration::from_secs(5), endpoint.accept_stream())
            .await
            .unwrap()
            .unwrap();
        fast.write_all(b"through").await.unwrap();
        fast.shutdown().await.unwrap();

        let mut buf = Vec::new();
        timeout(Duration::from_secs(5), fast_peer.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, b"through");
    }

    #[tokio::test]
    async fn test_reading_returns_credit() {
        let config = RelayConfig {
            initial_window: 1024,
            max_data_frame: 256,
            ..RelayConfig::default()
        };
        let (hub, endpoint) = channel_pair(config);

        let mut writer = hub.open_stream().await.unwrap();
        let mut reader = endpoint.accept_stream().await.unwrap();

        let payload = vec![42u8; 16 * 1024];
        let expected = payload.clone();
        let write = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
            writer
        });

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), reader.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);
        write.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_aborts_streams_with_peer_gone() {
        let (hub, endpoint) = channel_pair(RelayConfig::default());

        let mut outbound = hub.open_stream().await.unwrap();
        let _inbound = endpoint.accept_stream().await.unwrap();

        endpoint.close("endpoint shutting down");

        let mut buf = [0u8; 16];
        let err = timeout(Duration::from_secs(5), outbound.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);

        let reason = timeout(Duration::from_secs(5), hub.closed()).await.unwrap();
        assert!(reason.contains("endpoint shutting down"));
        assert!(matches!(
            hub.open_stream().await,
            Err(RelayError::PeerGone(_))
        ));
        assert!(hub.accept_stream().await.is_none());
    }

    #[tokio::test]
    async fn test_physical_eof_closes_channel() {
        let (a, b) = tokio::io::duplex(4096);
        let hub = RelayChannel::new(a, Role::Server, RelayConfig::default());
        let mut stream = hub.open_stream().await.unwrap();

        drop(b);

        let reason = timeout(Duration::from_secs(5), hub.closed()).await.unwrap();
        assert!(!reason.is_empty());
        let mut buf = [0u8; 4];
        assert!(stream.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_reaches_peer() {
        let (hub, endpoint) = channel_pair(RelayConfig::default());

        let outbound = hub.open_stream().await.unwrap();
        let mut inbound = endpoint.accept_stream().await.unwrap();

        // Dropping a stream that was not shut down resets it
        drop(outbound);

        let mut buf = [0u8; 4];
        let err = timeout(Duration::from_secs(5), inbound.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        assert!(!hub.is_closed());
    }

    #[tokio::test]
    async fn test_stream_limit_waits_for_permit() {
        let config = RelayConfig {
            max_streams: 1,
            ..RelayConfig::default()
        };
        let (hub, _endpoint) = channel_pair(config);

        let first = hub.open_stream().await.unwrap();
        let second = timeout(Duration::from_millis(200), hub.open_stream()).await;
        assert!(second.is_err(), "second open must wait for a free slot");

        drop(first);
        let third = timeout(Duration::from_secs(5), hub.open_stream()).await;
        assert!(third.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timeout_closes_silent_tunnel() {
        let config = RelayConfig {
            keepalive_interval: Duration::from_secs(1),
            keepalive_timeout: Duration::from_secs(3),
            ..RelayConfig::default()
        };
        // The far end never answers
        let (a, _silent) = tokio::io::duplex(64 * 1024);
        let hub = RelayChannel::new(a, Role::Server, config);

        let reason = timeout(Duration::from_secs(30), hub.closed()).await.unwrap();
        assert!(reason.contains("keepalive timeout"));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_channel() {
        let (hub, endpoint) = channel_pair(RelayConfig::default());
        drop(hub);

        let reason = timeout(Duration::from_secs(5), endpoint.closed()).await.unwrap();
        assert!(reason.contains("relay channel dropped"));
    }
}
