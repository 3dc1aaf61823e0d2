//! Transport layer
//!
//! A [`Transport`] owns one duplex byte stream (a serial port or an in-memory
//! pipe). A background reader task runs the frame codec on inbound bytes:
//! log frames go to the diagnostic sink, every other frame is decoded and
//! queued for [`Transport::call`] whether or not a caller is waiting.

pub mod exchange;
pub mod flow;
mod serial;

pub use exchange::{Delivery, Exchange, Expect, MatchMode, Reply};
pub use flow::FlowControl;
pub use serial::{list_ports, open as open_serial, SerialConfig, SerialFlowControl, SerialParity, DEFAULT_BAUD_RATE};

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::core::logger::TrafficLog;
use crate::core::protocol::value::raw_decoder;
use crate::core::protocol::{DecodeFn, Decoded, Frame, FrameCodec};

/// Default cap of the rolling diagnostic buffer, in bytes
pub const DIAG_LOG_CAPACITY: usize = 6000;

/// Any duplex byte stream a transport can own
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Link for T {}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Write on a closed channel
    #[error("Channel closed: {0}")]
    Closed(String),
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received in complete frames
    pub bytes_received: u64,
    /// Frames sent
    pub frames_sent: u64,
    /// Command frames received
    pub frames_received: u64,
    /// Log frames received
    pub log_frames: u64,
}

type Decoders = Arc<RwLock<HashMap<Bytes, DecodeFn>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// One flow-controlled duplex channel
pub struct Transport {
    name: String,
    codec: FrameCodec,
    writer: tokio::sync::Mutex<Option<Writer>>,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    flow: Arc<FlowControl>,
    decoders: Decoders,
    diag_log: Arc<Mutex<String>>,
    stats: Arc<RwLock<TransportStats>>,
    traffic: TrafficLog,
    closed: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Take ownership of `link` and start the reader task
    pub fn new<L: Link>(name: &str, link: L, codec: FrameCodec, traffic: TrafficLog) -> Self {
        let (read_half, write_half) = tokio::io::split(link);
        let (tx, rx) = mpsc::unbounded_channel();

        let transport = Self {
            name: name.to_string(),
            codec: codec.clone(),
            writer: tokio::sync::Mutex::new(Some(Box::new(write_half))),
            queue: tokio::sync::Mutex::new(rx),
            flow: Arc::new(FlowControl::new()),
            decoders: Arc::new(RwLock::new(HashMap::new())),
            diag_log: Arc::new(Mutex::new(String::new())),
            stats: Arc::new(RwLock::new(TransportStats::default())),
            traffic,
            closed: CancellationToken::new(),
            reader: Mutex::new(None),
        };

        let reader = ReceivePath {
            name: transport.name.clone(),
            flow: transport.flow.clone(),
            decoders: transport.decoders.clone(),
            diag_log: transport.diag_log.clone(),
            stats: transport.stats.clone(),
            traffic: transport.traffic.clone(),
            closed: transport.closed.clone(),
            tx,
        };
        let handle = tokio::spawn(reader.run(FramedRead::new(read_half, codec)));
        *transport.reader.lock() = Some(handle);
        transport
    }

    /// Open a serial port and wrap it
    pub fn open_serial(config: &SerialConfig, codec: FrameCodec, traffic: TrafficLog) -> Result<Self, TransportError> {
        let stream = serial::open(config)?;
        tracing::debug!(port = %config.port, baud = config.baud_rate, "Serial port opened");
        Ok(Self::new(&config.port, stream, codec, traffic))
    }

    /// Channel label (the port name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frame codec of this channel
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Flow-control state
    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    /// Whether the channel is closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> TransportStats {
        self.stats.read().clone()
    }

    /// Bind the decode function for an uplink header
    pub fn bind_decoder(&self, header: &[u8], decode: DecodeFn) {
        self.decoders.write().insert(Bytes::copy_from_slice(header), decode);
    }

    /// Bind `decode` unless the header already has one
    pub fn bind_decoder_if_absent(&self, header: &[u8], decode: DecodeFn) {
        self.decoders
            .write()
            .entry(Bytes::copy_from_slice(header))
            .or_insert(decode);
    }

    /// Whether the header has a decode function
    pub fn has_decoder(&self, header: &[u8]) -> bool {
        self.decoders.read().contains_key(header)
    }

    /// Write one encoded frame, waiting while writing is paused
    pub async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.name.clone()));
        }
        tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::Closed(self.name.clone())),
            _ = self.flow.writable() => {}
        }

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| TransportError::Closed(self.name.clone()))?;
        writer.write_all(frame).await?;
        writer.flush().await?;
        drop(guard);

        {
            let mut stats = self.stats.write();
            stats.bytes_sent += frame.len() as u64;
            stats.frames_sent += 1;
        }
        tracing::trace!(target: "devbench::serial", port = %self.name, tx = %hex::encode(frame));
        self.traffic.lock().log_tx(&self.name, frame);
        Ok(())
    }

    /// Send `frame` (if any) and wait for the expected uplink frames
    ///
    /// Dequeued frames that match nothing are discarded. Time spent with
    /// reading paused does not count against `timeout`. A timeout is not an
    /// error: the reply carries absent values.
    pub async fn call(
        &self,
        frame: Option<&[u8]>,
        expect: Expect,
        mode: MatchMode,
        timeout: Duration,
    ) -> Result<Reply, TransportError> {
        let mut queue = self.queue.lock().await;
        if let Some(frame) = frame {
            self.write(frame).await?;
        }
        Ok(self.await_reply(&mut queue, Exchange::new(expect, mode, timeout)).await)
    }

    async fn await_reply(&self, queue: &mut mpsc::UnboundedReceiver<Delivery>, mut exchange: Exchange) -> Reply {
        let mut deadline = Instant::now() + exchange.timeout();
        let mut paused = self.flow.subscribe_read();

        loop {
            if *paused.borrow_and_update() {
                let since = Instant::now();
                tokio::select! {
                    _ = self.closed.cancelled() => return exchange.expire(),
                    _ = self.flow.readable() => {}
                }
                deadline += since.elapsed();
                continue;
            }

            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return exchange.expire(),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return exchange.expire();
                    }
                }
                delivery = queue.recv() => match delivery {
                    Some(delivery) => {
                        if let Some(reply) = exchange.offer(delivery) {
                            return reply;
                        }
                    }
                    // Reader gone: nothing more can arrive
                    None => return exchange.expire(),
                },
                _ = tokio::time::sleep_until(deadline) => return exchange.expire(),
            }
        }
    }

    /// Discard frames nobody has consumed yet
    pub async fn clear_queue(&self) -> usize {
        let mut queue = self.queue.lock().await;
        let mut dropped = 0;
        while queue.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Take the rolling diagnostic buffer, leaving it empty
    pub fn drain_diag_log(&self) -> String {
        std::mem::take(&mut *self.diag_log.lock())
    }

    /// Pause both flow-control axes
    pub fn pause(&self) {
        self.flow.pause_reading();
        self.flow.pause_writing();
    }

    /// Resume both flow-control axes
    pub fn resume(&self) {
        self.flow.resume_reading();
        self.flow.resume_writing();
    }

    /// Close the channel: stop the reader and release blocked writers
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::debug!(port = %self.name, "Transport closed");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// State owned by the reader task
struct ReceivePath {
    name: String,
    flow: Arc<FlowControl>,
    decoders: Decoders,
    diag_log: Arc<Mutex<String>>,
    stats: Arc<RwLock<TransportStats>>,
    traffic: TrafficLog,
    closed: CancellationToken,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ReceivePath {
    async fn run<R: AsyncRead + Unpin>(self, mut frames: FramedRead<R, FrameCodec>) {
        let mut paused = self.flow.subscribe_read();
        loop {
            if *paused.borrow_and_update() {
                tokio::select! {
                    _ = self.closed.cancelled() => break,
                    _ = self.flow.readable() => continue,
                }
            }

            let next = tokio::select! {
                _ = self.closed.cancelled() => break,
                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => self.handle(frame),
                Some(Err(e)) => {
                    tracing::warn!(port = %self.name, error = %e, "Read failed");
                    break;
                }
                None => {
                    tracing::debug!(port = %self.name, "Stream ended");
                    break;
                }
            }
        }
    }

    fn handle(&self, frame: Frame) {
        {
            let mut stats = self.stats.write();
            stats.bytes_received += frame.length as u64;
            if frame.is_log() {
                stats.log_frames += 1;
            } else {
                stats.frames_received += 1;
            }
        }

        if frame.is_log() {
            let text = frame.payload.to_text();
            tracing::info!(target: "devbench::diag", port = %self.name, "{}", text);
            append_rolling(&mut self.diag_log.lock(), &text, DIAG_LOG_CAPACITY);
            self.traffic.lock().log_diag(&self.name, &text);
            return;
        }

        tracing::trace!(target: "devbench::serial", port = %self.name, rx = %hex::encode(&frame.raw_data));
        self.traffic.lock().log_rx(&self.name, &frame.raw_data);

        let decode = self
            .decoders
            .read()
            .get(&frame.header)
            .cloned()
            .unwrap_or_else(raw_decoder);
        let payload: Decoded = decode(frame.payload.as_bytes());
        // The queue outlives any single call; a dropped receiver means the
        // transport itself is gone
        let _ = self.tx.send(Delivery { payload, frame });
    }
}

/// Append a line, keeping only the newest `cap` bytes
fn append_rolling(buffer: &mut String, text: &str, cap: usize) {
    buffer.push_str(text);
    buffer.push('\n');
    if buffer.len() > cap {
        let mut cut = buffer.len() - cap;
        while !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        buffer.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logger;
    use crate::core::protocol::{encode_frame, ProtocolConfig};
    use tokio::io::{AsyncReadExt, DuplexStream};

    const A: &[u8] = &[0xBB, 0x01, 0x01];
    const B: &[u8] = &[0xBB, 0x01, 0x02];
    const C: &[u8] = &[0xBB, 0x01, 0x03];

    fn setup() -> (Transport, DuplexStream) {
        let (host, device) = tokio::io::duplex(4096);
        let codec = FrameCodec::new(Arc::new(ProtocolConfig::default()));
        (Transport::new("test", host, codec, logger::shared()), device)
    }

    fn frame(header: &[u8], payload: &[u8]) -> Vec<u8> {
        encode_frame(&ProtocolConfig::default(), header, payload)
    }

    fn many(headers: &[&[u8]]) -> Expect {
        Expect::Many(headers.iter().map(|h| Bytes::copy_from_slice(h)).collect())
    }

    #[tokio::test]
    async fn test_ordered_multi_header_call() {
        let (transport, mut device) = setup();
        for (h, p) in [(B, b"b"), (A, b"a"), (C, b"c")] {
            device.write_all(&frame(h, p)).await.unwrap();
        }

        let reply = transport
            .call(None, many(&[A, B, C]), MatchMode::All, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Slots(vec![
                Some(Decoded::raw(b"a")),
                Some(Decoded::raw(b"b")),
                Some(Decoded::raw(b"c")),
            ])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_pads_absent() {
        let (transport, mut device) = setup();
        device.write_all(&frame(A, b"a")).await.unwrap();

        let reply = transport
            .call(None, many(&[A, B]), MatchMode::All, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Slots(vec![Some(Decoded::raw(b"a")), None]));
    }

    #[tokio::test]
    async fn test_call_writes_request() {
        let (transport, mut device) = setup();
        let request = frame(&[0xAA, 0x01, 0x01], b"");

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; request.len()];
            device.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, request);
            device.write_all(&frame(A, &[0x00, 0x00])).await.unwrap();
            device
        });

        let reply = transport
            .call(
                Some(&frame(&[0xAA, 0x01, 0x01], b"")),
                Expect::One(Bytes::from_static(A)),
                MatchMode::All,
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply.into_single(), Some(Decoded::raw(&[0x00, 0x00])));
        responder.await.unwrap();
        assert_eq!(transport.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_bound_decoder_is_used() {
        let (transport, mut device) = setup();
        transport.bind_decoder(A, Arc::new(|p: &[u8]| Decoded::Text(String::from_utf8_lossy(p).into_owned())));
        device.write_all(&frame(A, b"hello")).await.unwrap();

        let reply = transport
            .call(None, Expect::Any, MatchMode::All, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.into_single(), Some(Decoded::Text("hello".into())));
    }

    #[tokio::test]
    async fn test_log_frames_go_to_diag_buffer() {
        let (transport, mut device) = setup();
        device
            .write_all(&frame(&[0xFF, 0x00, 0x00], b"boot ok"))
            .await
            .unwrap();
        device.write_all(&frame(A, b"a")).await.unwrap();

        let reply = transport
            .call(None, Expect::Any, MatchMode::All, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.into_single(), Some(Decoded::raw(b"a")));
        assert_eq!(transport.drain_diag_log(), "boot ok\n");
        assert!(transport.drain_diag_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_time_extends_deadline() {
        let (transport, mut device) = setup();
        let transport = Arc::new(transport);
        transport.pause();

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .call(None, Expect::One(Bytes::from_static(A)), MatchMode::All, Duration::from_secs(1))
                    .await
            })
        };

        device.write_all(&frame(A, b"late")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!call.is_finished());

        transport.resume();
        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.into_single(), Some(Decoded::raw(b"late")));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (transport, _device) = setup();
        transport.close().await;
        assert!(transport.is_closed());
        assert!(matches!(transport.write(&[0xAA]).await, Err(TransportError::Closed(_))));
    }

    #[tokio::test]
    async fn test_close_releases_blocked_writer() {
        let (transport, _device) = setup();
        let transport = Arc::new(transport);
        transport.flow().pause_writing();

        let writer = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.write(&[0xAA]).await })
        };
        tokio::task::yield_now().await;
        transport.close().await;
        let result = writer.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed(_))));
    }

    #[tokio::test]
    async fn test_clear_queue() {
        let (transport, mut device) = setup();
        device.write_all(&frame(A, b"stale")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.clear_queue().await, 1);
    }

    #[test]
    fn test_rolling_buffer_cap() {
        let mut buffer = String::new();
        for i in 0..100 {
            append_rolling(&mut buffer, &format!("line {i}"), 32);
        }
        assert!(buffer.len() <= 32);
        assert!(buffer.ends_with("line 99\n"));
    }
}
