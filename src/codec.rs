//! Packet codec
//!
//! A logical frame is split into transport-sized chunks. Every chunk has the layout
//!
//! ```text
//! [opcode:1][total_len:2 LE][body...]
//! ```
//!
//! where `total_len` is the length of the logical payload (sequence prefix included,
//! checksum excluded) and is repeated in every chunk. The bodies of all chunks,
//! concatenated, hold the payload followed by the checksum bytes. Reassembly is
//! complete once `total_len + checksum width` body bytes have been collected.

use crate::checksum::{Checksum, Crc16Arc};
use crate::types::{BandError, Result};
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Bytes of per-chunk header: opcode plus the 16-bit total length
pub const CHUNK_HEADER_LEN: usize = 3;

/// Default reassembly timeout in milliseconds
const REASSEMBLY_TIMEOUT_MS: u64 = 1500;

/// Default chunk size: a 23 byte ATT MTU minus the 3 byte ATT header
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// One fully reassembled protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    opcode: u8,
    sequence: Option<u16>,
    payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            sequence: None,
            payload,
        }
    }

    /// A frame carrying a packet index, used by the transfer protocols
    pub fn with_sequence(opcode: u8, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            sequence: Some(sequence),
            payload,
        }
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn sequence(&self) -> Option<u16> {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Length of the logical payload on the wire, sequence prefix included
    pub fn len(&self) -> usize {
        self.payload.len() + if self.sequence.is_some() { 2 } else { 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a little-endian u16 assembled from a low/high byte pair at `offset`
    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        let lo = *self.payload.get(offset)?;
        let hi = *self.payload.get(offset + 1)?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    /// Read a little-endian u32 at `offset`
    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        let bytes = self.payload.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Result of feeding one chunk into the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    Incomplete,
}

/// Partially reassembled frame
struct Reassembly {
    opcode: u8,
    declared_len: usize,
    body: Vec<u8>,
}

/// Chunking encoder and reassembling decoder
pub struct FrameCodec {
    chunk_size: usize,
    checksum: Arc<dyn Checksum>,
    sequenced: HashSet<u8>,
    reassembly: Option<Reassembly>,
    last_update: Option<Instant>,
    reassembly_timeout: Duration,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the default chunk size, CRC-16 and the standard sequenced opcodes
    pub fn new() -> Self {
        Self::with_settings(
            DEFAULT_CHUNK_SIZE,
            Arc::new(Crc16Arc),
            crate::opcodes::SEQUENCED.iter().copied(),
        )
    }

    pub fn with_settings(
        chunk_size: usize,
        checksum: Arc<dyn Checksum>,
        sequenced: impl IntoIterator<Item = u8>,
    ) -> Self {
        Self {
            chunk_size,
            checksum,
            sequenced: sequenced.into_iter().collect(),
            reassembly: None,
            last_update: None,
            reassembly_timeout: Duration::from_millis(REASSEMBLY_TIMEOUT_MS),
        }
    }

    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Change the chunk size, e.g. after an MTU exchange
    pub fn set_chunk_size(&mut self, chunk_size: usize) -> Result<()> {
        if chunk_size <= CHUNK_HEADER_LEN {
            return Err(BandError::InvalidParameter(format!(
                "chunk size {} cannot hold the {} byte header",
                chunk_size, CHUNK_HEADER_LEN
            )));
        }
        self.chunk_size = chunk_size;
        debug!("Codec chunk size set to {}", chunk_size);
        Ok(())
    }

    pub fn is_sequenced(&self, opcode: u8) -> bool {
        self.sequenced.contains(&opcode)
    }

    /// Split a frame into wire chunks
    pub fn encode(&self, frame: &Frame) -> Result<Vec<Vec<u8>>> {
        let body_capacity = self.chunk_size.saturating_sub(CHUNK_HEADER_LEN);
        if body_capacity == 0 {
            return Err(BandError::InvalidParameter(format!(
                "chunk size {} cannot hold the {} byte header",
                self.chunk_size, CHUNK_HEADER_LEN
            )));
        }

        let mut logical = Vec::with_capacity(frame.len() + self.checksum.width());
        if let Some(seq) = frame.sequence {
            logical.extend_from_slice(&seq.to_le_bytes());
        }
        logical.extend_from_slice(&frame.payload);

        let total_len = logical.len();
        if total_len > u16::MAX as usize {
            return Err(BandError::PayloadTooLarge(total_len));
        }

        let crc = self.checksum.compute(frame.opcode, &logical);
        logical.extend_from_slice(&self.checksum.to_bytes(crc));

        let len_bytes = (total_len as u16).to_le_bytes();
        let mut chunks = Vec::with_capacity(logical.len().div_ceil(body_capacity).max(1));

        // A frame with no payload and no checksum is still one header-only chunk
        if logical.is_empty() {
            chunks.push(vec![frame.opcode, len_bytes[0], len_bytes[1]]);
            return Ok(chunks);
        }

        for body in logical.chunks(body_capacity) {
            let mut chunk = Vec::with_capacity(CHUNK_HEADER_LEN + body.len());
            chunk.push(frame.opcode);
            chunk.extend_from_slice(&len_bytes);
            chunk.extend_from_slice(body);
            chunks.push(chunk);
        }

        debug!(
            "Encoded {} ({} payload bytes) into {} chunk(s)",
            crate::opcodes::name(frame.opcode),
            total_len,
            chunks.len()
        );

        Ok(chunks)
    }

    /// Feed one received chunk
    ///
    /// Any error discards the partial frame; no bytes of a failed frame are ever
    /// delivered.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Decoded> {
        let now = Instant::now();

        if let Some(last_update) = self.last_update {
            if self.reassembly.is_some() && now.duration_since(last_update) > self.reassembly_timeout
            {
                warn!("Reassembly timed out, discarding partial frame");
                self.reset();
            }
        }
        self.last_update = Some(now);

        if chunk.len() < CHUNK_HEADER_LEN {
            self.reset();
            return Err(BandError::PacketTooShort(chunk.len()));
        }

        let opcode = chunk[0];
        let declared_len = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let body = &chunk[CHUNK_HEADER_LEN..];

        let expected_total = declared_len + self.checksum.width();

        if let Some(r) = &self.reassembly {
            if r.opcode != opcode || r.declared_len != declared_len {
                let (expected_opcode, expected_len) = (r.opcode, r.declared_len);
                self.reset();
                return Err(BandError::InvalidData(format!(
                    "chunk {:#04x}/{} does not continue frame {:#04x}/{}",
                    opcode, declared_len, expected_opcode, expected_len
                )));
            }
        }

        let reassembly = self.reassembly.get_or_insert_with(|| Reassembly {
            opcode,
            declared_len,
            body: Vec::with_capacity(expected_total),
        });

        reassembly.body.extend_from_slice(body);

        if reassembly.body.len() > expected_total {
            let actual = reassembly.body.len() - self.checksum.width().min(reassembly.body.len());
            self.reset();
            return Err(BandError::WrongDataLength {
                declared: declared_len,
                actual,
            });
        }

        if reassembly.body.len() < expected_total {
            return Ok(Decoded::Incomplete);
        }

        let Some(complete) = self.reassembly.take() else {
            return Ok(Decoded::Incomplete);
        };
        let (logical, crc_bytes) = complete.body.split_at(declared_len);

        let expected = self.checksum.compute(opcode, logical);
        let actual = self.checksum.from_bytes(crc_bytes);
        if expected != actual {
            return Err(BandError::ChecksumMismatch { expected, actual });
        }

        let frame = if self.is_sequenced(opcode) {
            if logical.len() < 2 {
                return Err(BandError::WrongDataLength {
                    declared: 2,
                    actual: logical.len(),
                });
            }
            let seq = u16::from_le_bytes([logical[0], logical[1]]);
            Frame::with_sequence(opcode, seq, logical[2..].to_vec())
        } else {
            Frame::new(opcode, logical.to_vec())
        };

        debug!(
            "Decoded {} frame: {} bytes, seq {:?}",
            crate::opcodes::name(opcode),
            frame.payload.len(),
            frame.sequence
        );

        Ok(Decoded::Frame(frame))
    }

    /// Drop any partially reassembled frame
    pub fn reset(&mut self) {
        self.reassembly = None;
    }

    pub fn has_partial(&self) -> bool {
        self.reassembly.is_some()
    }
}

/// Format bytes as hex for debug logging
pub fn hex_dump(data: &[u8], max_len: usize) -> String {
    let len = data.len().min(max_len);
    let hex: String = data[..len]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > max_len {
        format!("{} ... ({} bytes total)", hex, data.len())
    } else {
        format!("{} ({} bytes)", hex, data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::NoChecksum;
    use crate::opcodes::{command, dfu};

    fn decode_all(codec: &mut FrameCodec, chunks: &[Vec<u8>]) -> Result<Decoded> {
        let mut last = Decoded::Incomplete;
        for chunk in chunks {
            last = codec.decode(chunk)?;
        }
        Ok(last)
    }

    #[test]
    fn test_encode_single_chunk_layout() {
        let codec = FrameCodec::with_settings(20, Arc::new(NoChecksum), []);
        let chunks = codec
            .encode(&Frame::new(command::BATTERY, vec![78, 0x01]))
            .unwrap();
        assert_eq!(chunks, vec![vec![0x06, 0x02, 0x00, 78, 0x01]]);
    }

    #[test]
    fn test_every_chunk_declares_total_length() {
        let codec = FrameCodec::new();
        let payload: Vec<u8> = (0..40).collect();
        let chunks = codec.encode(&Frame::new(0x2D, payload)).unwrap();
        // 40 payload + 2 crc = 42 body bytes, 17 per chunk
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.len() <= 20);
            assert_eq!(chunk[0], 0x2D);
            assert_eq!(u16::from_le_bytes([chunk[1], chunk[2]]), 40);
        }
    }

    #[test]
    fn test_multi_chunk_reassembly() {
        let mut codec = FrameCodec::new();
        let payload: Vec<u8> = (0..=255).cycle().take(300).collect();
        let frame = Frame::new(dfu::CONTACTS, payload.clone());
        let chunks = codec.encode(&frame).unwrap();

        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(codec.decode(chunk).unwrap(), Decoded::Incomplete);
            assert!(codec.has_partial());
        }
        match codec.decode(&chunks[chunks.len() - 1]).unwrap() {
            Decoded::Frame(f) => {
                assert_eq!(f.opcode(), dfu::CONTACTS);
                assert_eq!(f.payload(), payload.as_slice());
                assert_eq!(f.sequence(), None);
            }
            Decoded::Incomplete => panic!("frame should be complete"),
        }
        assert!(!codec.has_partial());
    }

    #[test]
    fn test_sequenced_opcode_carries_index() {
        let mut codec = FrameCodec::new();
        let frame = Frame::with_sequence(dfu::RECEIVE_IMAGE, 7, vec![0xAA; 10]);
        let chunks = codec.encode(&frame).unwrap();
        assert_eq!(&chunks[0][3..5], &[7, 0]);
        assert_eq!(decode_all(&mut codec, &chunks).unwrap(), Decoded::Frame(frame));
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let mut codec = FrameCodec::with_settings(20, Arc::new(NoChecksum), []);
        let frame = Frame::new(command::FIND_DEVICE, vec![]);
        let chunks = codec.encode(&frame).unwrap();
        assert_eq!(chunks, vec![vec![command::FIND_DEVICE, 0, 0]]);
        assert_eq!(codec.decode(&chunks[0]).unwrap(), Decoded::Frame(frame));
    }

    #[test]
    fn test_checksum_mismatch_fails_frame() {
        let mut codec = FrameCodec::new();
        let mut chunks = codec
            .encode(&Frame::new(command::BATTERY, vec![78, 1]))
            .unwrap();
        chunks[0][3] = 79;
        assert!(matches!(
            codec.decode(&chunks[0]),
            Err(BandError::ChecksumMismatch { .. })
        ));
        assert!(!codec.has_partial());
    }

    #[test]
    fn test_wrong_opcode_mid_frame_is_invalid_data() {
        let mut codec = FrameCodec::new();
        let chunks = codec.encode(&Frame::new(0x2D, vec![1; 40])).unwrap();
        assert_eq!(codec.decode(&chunks[0]).unwrap(), Decoded::Incomplete);

        let mut intruder = chunks[1].clone();
        intruder[0] = 0x29;
        assert!(matches!(
            codec.decode(&intruder),
            Err(BandError::InvalidData(_))
        ));
        // Later chunks of the first frame would start a fresh (bogus) frame rather
        // than completing the failed one.
        assert!(!codec.has_partial());
    }

    #[test]
    fn test_length_mismatch_mid_frame_is_invalid_data() {
        let mut codec = FrameCodec::new();
        let chunks = codec.encode(&Frame::new(0x2D, vec![1; 40])).unwrap();
        codec.decode(&chunks[0]).unwrap();

        let mut altered = chunks[1].clone();
        altered[1] = 41;
        assert!(matches!(
            codec.decode(&altered),
            Err(BandError::InvalidData(_))
        ));
    }

    #[test]
    fn test_overflow_is_wrong_data_length() {
        let mut codec = FrameCodec::with_settings(20, Arc::new(NoChecksum), []);
        // Declares 2 bytes but carries 3
        assert!(matches!(
            codec.decode(&[0x06, 0x02, 0x00, 1, 2, 3]),
            Err(BandError::WrongDataLength {
                declared: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_short_chunk_rejected() {
        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&[0x06, 0x02]),
            Err(BandError::PacketTooShort(2))
        ));
    }

    #[test]
    fn test_payload_too_large() {
        let codec = FrameCodec::new();
        let frame = Frame::new(0x37, vec![0; u16::MAX as usize + 1]);
        assert!(matches!(
            codec.encode(&frame),
            Err(BandError::PayloadTooLarge(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reassembly_timeout_discards_partial() {
        let mut codec = FrameCodec::new().with_reassembly_timeout(Duration::from_millis(1500));
        let first = codec.encode(&Frame::new(0x2D, vec![1; 40])).unwrap();
        codec.decode(&first[0]).unwrap();
        assert!(codec.has_partial());
        tokio::time::advance(Duration::from_millis(1600)).await;

        let fresh = codec
            .encode(&Frame::new(command::BATTERY, vec![50, 0]))
            .unwrap();
        match codec.decode(&fresh[0]).unwrap() {
            Decoded::Frame(f) => assert_eq!(f.payload(), &[50, 0]),
            Decoded::Incomplete => panic!("stale partial frame should have been dropped"),
        }
    }

    #[test]
    fn test_chunk_size_validation() {
        let mut codec = FrameCodec::new();
        assert!(codec.set_chunk_size(3).is_err());
        codec.set_chunk_size(244).unwrap();
        let chunks = codec.encode(&Frame::new(0x37, vec![0; 200])).unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_frame_field_helpers() {
        let frame = Frame::new(0x13, vec![0x10, 0x27, 0x00, 0x00, 0x34, 0x12]);
        assert_eq!(frame.u32_at(0), Some(10_000));
        assert_eq!(frame.u16_at(4), Some(0x1234));
        assert_eq!(frame.u16_at(5), None);
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x01, 0xAB], 8), "01 AB (2 bytes)");
        assert_eq!(hex_dump(&[1, 2, 3], 2), "01 02 ... (3 bytes total)");
    }
}
