//! Stream framing
//!
//! Splits a raw, possibly fragmented byte stream into frames:
//!
//! - Command/response frames: `header | model | opcode | length | payload | checksum`
//! - Device-info frames: `uplink_code 00 00 | payload | checksum`, no length field
//! - Plain log frames: generic shape with the log header, payload is text
//! - Diagnostic log frames: see [`super::diag`]
//!
//! Garbage and false-positive headers are skipped one byte at a time. The
//! unconsumed tail is handed back so the next chunk can complete it.

use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::Decoder;

use super::checksum;
use super::diag::DiagDecoder;
use super::ProtocolConfig;

/// Frame classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Command or response
    Command,
    /// Bootstrap device-info response
    DeviceInfo,
    /// Plain or structured log line
    Log,
}

/// Frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    /// Binary payload
    Binary(Bytes),
    /// Decoded log text
    Text(String),
}

impl FramePayload {
    /// Payload bytes (UTF-8 for text)
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Binary(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }

    /// Payload rendered as text
    pub fn to_text(&self) -> String {
        match self {
            Self::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::Text(text) => text.clone(),
        }
    }
}

/// One decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame classification
    pub kind: FrameKind,
    /// Header + model + opcode (log frames: the log header byte)
    pub header: Bytes,
    /// Declared payload length
    pub data_len: usize,
    /// Payload
    pub payload: FramePayload,
    /// Checksum field (empty for diagnostic frames)
    pub checksum: Bytes,
    /// Bytes consumed from the stream
    pub length: usize,
    /// The frame as received
    pub raw_data: Bytes,
}

impl Frame {
    /// Whether this frame goes to the diagnostic sink
    pub fn is_log(&self) -> bool {
        self.kind == FrameKind::Log
    }
}

/// Result of parsing at one offset
#[derive(Debug)]
pub(crate) enum Parse {
    /// A complete frame
    Frame(Frame),
    /// Looks like a frame but more bytes are needed
    Incomplete,
    /// Not a frame at this offset
    Invalid,
}

/// Encode a frame: `header + len(payload) + payload + checksum`
pub fn encode_frame(config: &ProtocolConfig, header: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(header.len() + config.length_size + payload.len() + config.checksum_size);
    frame.extend_from_slice(header);
    frame.extend(config.byte_order.write_uint(payload.len() as u64, config.length_size));
    frame.extend_from_slice(payload);
    let sum = checksum::calculate(&frame, config.checksum_size);
    frame.extend(sum);
    frame
}

/// Frame codec bound to one set of protocol constants
#[derive(Debug, Clone)]
pub struct FrameCodec {
    config: Arc<ProtocolConfig>,
    diag: Arc<DiagDecoder>,
}

impl FrameCodec {
    /// Create a codec; diagnostic frames render raw-only without a table
    pub fn new(config: Arc<ProtocolConfig>) -> Self {
        Self {
            config,
            diag: Arc::new(DiagDecoder::default()),
        }
    }

    /// Attach a diagnostic decoder
    #[must_use]
    pub fn with_diag(mut self, diag: Arc<DiagDecoder>) -> Self {
        self.diag = diag;
        self
    }

    /// Protocol constants
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Encode a downlink command frame
    pub fn encode_command(&self, model_id: &[u8], opcode: &[u8], payload: &[u8]) -> Vec<u8> {
        let header = self.config.downlink_header_for(model_id, opcode);
        encode_frame(&self.config, &header, payload)
    }

    /// Decode every complete frame in `buffer`; returns the frames and the
    /// unconsumed tail
    pub fn decode_stream<'a>(&self, buffer: &'a [u8]) -> (Vec<Frame>, &'a [u8]) {
        let min = self.config.min_frame_size();
        let mut frames = Vec::new();
        let mut cursor = 0;

        while cursor + min <= buffer.len() {
            match self.parse_at(&buffer[cursor..]) {
                Parse::Frame(frame) => {
                    cursor += frame.length;
                    frames.push(frame);
                }
                Parse::Incomplete => break,
                Parse::Invalid => cursor += 1,
            }
        }

        (frames, &buffer[cursor..])
    }

    pub(crate) fn parse_at(&self, data: &[u8]) -> Parse {
        let cfg = &*self.config;
        let Some(&first) = data.first() else {
            return Parse::Incomplete;
        };
        if !cfg.is_known_header(first) {
            return Parse::Invalid;
        }
        if first == cfg.diag_header {
            return self.diag.parse_frame(data);
        }
        if data.len() < cfg.min_frame_size() {
            return Parse::Incomplete;
        }

        let protocol = &data[..cfg.protocol_size()];
        if cfg.device_info_frames && protocol == cfg.device_info_header().as_slice() {
            return self.parse_device_info(data);
        }

        let payload_index = cfg.payload_index();
        let declared = cfg.byte_order.read_uint(&data[cfg.protocol_size()..payload_index]);
        let Ok(data_len) = usize::try_from(declared) else {
            return Parse::Invalid;
        };
        let checksum_index = payload_index + data_len;
        let end = checksum_index + cfg.checksum_size;
        if end > data.len() {
            return Parse::Incomplete;
        }

        let sum = &data[checksum_index..end];
        if !checksum::verify(&data[..checksum_index], sum) {
            return Parse::Invalid;
        }

        let kind = if cfg.is_log_header(first) {
            FrameKind::Log
        } else {
            FrameKind::Command
        };
        let body = Bytes::copy_from_slice(&data[payload_index..checksum_index]);
        let payload = match kind {
            FrameKind::Log => FramePayload::Text(String::from_utf8_lossy(&body).into_owned()),
            _ => FramePayload::Binary(body),
        };

        Parse::Frame(Frame {
            kind,
            header: Bytes::copy_from_slice(protocol),
            data_len,
            payload,
            checksum: Bytes::copy_from_slice(sum),
            length: end,
            raw_data: Bytes::copy_from_slice(&data[..end]),
        })
    }

    /// Device-info frames carry no length field: the end is found by trying
    /// every checksum position from the minimum frame size onwards
    ///
    /// Running out of buffered bytes is `Incomplete` until
    /// `device_info_max_size` bytes are available.
    fn parse_device_info(&self, data: &[u8]) -> Parse {
        let cfg = &*self.config;
        let width = cfg.checksum_size;
        let start = cfg.min_frame_size() - width;
        let protocol_size = cfg.protocol_size();
        let limit = cfg.device_info_max_size.max(cfg.min_frame_size());
        let window = &data[..data.len().min(limit)];

        for i in start..=window.len().saturating_sub(width) {
            let sum = &data[i..i + width];
            if checksum::verify(&data[..i], sum) {
                let payload = Bytes::copy_from_slice(&data[protocol_size..i]);
                return Parse::Frame(Frame {
                    kind: FrameKind::DeviceInfo,
                    header: Bytes::copy_from_slice(&data[..protocol_size]),
                    data_len: payload.len(),
                    payload: FramePayload::Binary(payload),
                    checksum: Bytes::copy_from_slice(sum),
                    length: i + width,
                    raw_data: Bytes::copy_from_slice(&data[..i + width]),
                });
            }
        }
        if data.len() < limit {
            Parse::Incomplete
        } else {
            Parse::Invalid
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        let min = self.config.min_frame_size();
        while src.len() >= min {
            match self.parse_at(src) {
                Parse::Frame(frame) => {
                    src.advance(frame.length);
                    return Ok(Some(frame));
                }
                Parse::Incomplete => return Ok(None),
                Parse::Invalid => src.advance(1),
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        let frame = self.decode(src)?;
        if frame.is_none() {
            // A truncated tail at end of stream is dropped, not an error
            src.clear();
        }
        Ok(frame)
    }
}

/// Streaming decoder that keeps the unconsumed tail between chunks
#[derive(Debug, Clone)]
pub struct StreamDecoder {
    codec: FrameCodec,
    buffer: Vec<u8>,
}

impl StreamDecoder {
    /// Create a new decoder
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: Vec::new(),
        }
    }

    /// Add data and return complete frames
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);
        let (frames, rest) = self.codec.decode_stream(&self.buffer);
        let consumed = self.buffer.len() - rest.len();
        self.buffer.drain(..consumed);
        frames
    }

    /// Bytes waiting for more data
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Clear buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(Arc::new(ProtocolConfig::default()))
    }

    #[test]
    fn test_hi_frame() {
        let raw = [0xAA, 0x00, 0x01, 0x02, 0x00, 0x48, 0x49, 0xC2];
        let (frames, rest) = codec().decode_stream(&raw);
        assert_eq!(frames.len(), 1);
        assert!(rest.is_empty());
        let frame = &frames[0];
        assert_eq!(frame.kind, FrameKind::Command);
        assert_eq!(frame.header.as_ref(), &[0xAA, 0x00, 0x01]);
        assert_eq!(frame.payload.as_bytes(), b"HI");
        assert_eq!(frame.length, raw.len());
        assert_eq!(frame.raw_data.as_ref(), &raw);
    }

    #[test]
    fn test_hi_frame_big_endian_length() {
        let config = ProtocolConfig {
            byte_order: super::super::ByteOrder::Big,
            ..ProtocolConfig::default()
        };
        let codec = FrameCodec::new(Arc::new(config));
        let raw = [0xAA, 0x00, 0x01, 0x00, 0x02, 0x48, 0x49, 0xC2];
        let (frames, rest) = codec.decode_stream(&raw);
        assert_eq!(frames.len(), 1);
        assert!(rest.is_empty());
        assert_eq!(frames[0].payload.as_bytes(), b"HI");
    }

    #[test]
    fn test_encode_matches_wire_layout() {
        let cfg = ProtocolConfig::default();
        let frame = encode_frame(&cfg, &[0xAA, 0x00, 0x01], b"HI");
        assert_eq!(frame, vec![0xAA, 0x00, 0x01, 0x02, 0x00, 0x48, 0x49, 0xC2]);
        assert_eq!(codec().encode_command(&[0x00], &[0x01], b"HI"), frame);
    }

    #[test]
    fn test_round_trip_payload_sizes() {
        let cfg = ProtocolConfig::default();
        let codec = codec();
        for size in [0usize, 1, 7, 255, 300] {
            let payload: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();
            let raw = encode_frame(&cfg, &[0xBB, 0x12, 0x34], &payload);
            let (frames, rest) = codec.decode_stream(&raw);
            assert_eq!(frames.len(), 1, "size {size}");
            assert!(rest.is_empty());
            assert_eq!(frames[0].payload.as_bytes(), payload.as_slice());
        }
    }

    #[test]
    fn test_split_feed_every_boundary() {
        let cfg = ProtocolConfig::default();
        let raw = encode_frame(&cfg, &[0xBB, 0x01, 0x02], b"payload");
        let (whole, _) = codec().decode_stream(&raw);

        for split in 0..=raw.len() {
            let mut decoder = StreamDecoder::new(codec());
            let mut frames = decoder.push(&raw[..split]);
            frames.extend(decoder.push(&raw[split..]));
            assert_eq!(frames, whole, "split at {split}");
            assert!(decoder.pending().is_empty());
        }
    }

    #[test]
    fn test_device_info_split_every_boundary() {
        let raw = [0xBB, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x3B];
        let (whole, _) = codec().decode_stream(&raw);
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].kind, FrameKind::DeviceInfo);

        for split in 0..=raw.len() {
            let mut decoder = StreamDecoder::new(codec());
            let mut frames = decoder.push(&raw[..split]);
            frames.extend(decoder.push(&raw[split..]));
            assert_eq!(frames, whole, "split at {split}");
            assert!(decoder.pending().is_empty());
        }
    }

    #[test]
    fn test_stray_device_info_header_is_skipped_at_limit() {
        let config = ProtocolConfig {
            device_info_max_size: 8,
            ..ProtocolConfig::default()
        };
        let codec = FrameCodec::new(Arc::new(config.clone()));
        let mut raw = vec![0xBB, 0x00, 0x00, 0x11, 0x11, 0x11];

        let (frames, rest) = codec.decode_stream(&raw);
        assert!(frames.is_empty());
        assert_eq!(rest.len(), raw.len());

        raw.extend_from_slice(&[0x11; 4]);
        raw.extend(encode_frame(&config, &[0xBB, 0x01, 0x02], b"ok"));
        let (frames, rest) = codec.decode_stream(&raw);
        assert!(rest.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Command);
        assert_eq!(frames[0].payload.as_bytes(), b"ok");
    }

    #[test]
    fn test_incomplete_frame_is_remainder() {
        let cfg = ProtocolConfig::default();
        let raw = encode_frame(&cfg, &[0xBB, 0x01, 0x02], b"abcdef");
        let (frames, rest) = codec().decode_stream(&raw[..raw.len() - 1]);
        assert!(frames.is_empty());
        assert_eq!(rest, &raw[..raw.len() - 1]);
    }

    #[test]
    fn test_garbage_is_skipped() {
        let cfg = ProtocolConfig::default();
        let mut raw = vec![0x00, 0x13, 0x37];
        raw.extend(encode_frame(&cfg, &[0xBB, 0x01, 0x02], b"ok"));
        let (frames, rest) = codec().decode_stream(&raw);
        assert_eq!(frames.len(), 1);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_corrupted_byte_never_misattributes() {
        let cfg = ProtocolConfig::default();
        let first = encode_frame(&cfg, &[0xBB, 0x01, 0x02], b"first");
        let second = encode_frame(&cfg, &[0xBB, 0x03, 0x04], b"second");

        for i in 0..first.len() {
            let mut raw = first.clone();
            raw[i] ^= 0x5A;
            raw.extend_from_slice(&second);

            let mut decoder = StreamDecoder::new(codec());
            let frames = decoder.push(&raw);
            assert!(frames.iter().all(|f| f.payload.as_bytes() != b"first"), "byte {i}");
            let recovered = frames.iter().any(|f| f.payload.as_bytes() == b"second");
            // A corrupted length can swallow the next frame until more bytes arrive
            assert!(recovered || !decoder.pending().is_empty(), "byte {i}");
        }
    }

    #[test]
    fn test_log_frames() {
        let cfg = ProtocolConfig::default();
        let mut raw = encode_frame(&cfg, &[0xFF, 0x00, 0x00], b"boot ok");
        raw.extend_from_slice(&[0xC7, 0xD8, 0x04, 0x03, 0x00]);
        raw.extend(encode_frame(&cfg, &[0xBB, 0x01, 0x01], &[0x00]));

        let (frames, rest) = codec().decode_stream(&raw);
        assert!(rest.is_empty());
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].kind, FrameKind::Log);
        assert_eq!(frames[0].payload, FramePayload::Text("boot ok".into()));
        assert_eq!(frames[1].kind, FrameKind::Log);
        assert_eq!(frames[1].payload.to_text(), "[raw_data:c7d8040300]");
        assert_eq!(frames[2].kind, FrameKind::Command);
    }

    #[test]
    fn test_device_info_frame() {
        let mut raw = vec![0xBB, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04];
        raw.push(checksum::lrc_checksum(&raw));
        let (frames, rest) = codec().decode_stream(&raw);
        assert!(rest.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::DeviceInfo);
        assert_eq!(frames[0].payload.as_bytes(), &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frames[0].length, raw.len());
    }

    #[test]
    fn test_tokio_decoder() {
        let cfg = ProtocolConfig::default();
        let mut src = BytesMut::new();
        src.extend_from_slice(&[0x01, 0x02]);
        src.extend(encode_frame(&cfg, &[0xBB, 0x01, 0x02], b"a"));
        src.extend(encode_frame(&cfg, &[0xBB, 0x01, 0x03], b"b"));

        let mut codec = codec();
        let first = codec.decode(&mut src).unwrap().unwrap();
        let second = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(first.payload.as_bytes(), b"a");
        assert_eq!(second.payload.as_bytes(), b"b");
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.is_empty());
    }
}
