//! Stream and datagram frame decoding with resynchronization.

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use contracts::CrossingEvent;
pub use contracts::Endianness;
use tracing::{debug, trace, warn};

use crate::frame::parse_frame;

/// A partial frame larger than this cannot be real; the buffer resyncs.
const MAX_FRAME_LEN: usize = 256;

/// Reverse the bits within a single byte, e.g. 0x23 -> 0xC4.
#[inline]
pub(crate) fn bit_reverse(b: u8) -> u8 {
    b.reverse_bits()
}

/// Decoder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub malformed_frames: u64,
    pub bytes_discarded: u64,
}

/// Incremental frame decoder.
///
/// Stream transports feed arbitrary byte chunks through [`push_bytes`]
/// (partial frames are buffered across calls); packet transports decode each
/// datagram in isolation through [`decode_datagram`]. Both tolerate garbage:
/// bytes before a `<` are discarded and a malformed frame body is skipped up
/// to its closing `>`.
///
/// [`push_bytes`]: FrameDecoder::push_bytes
/// [`decode_datagram`]: FrameDecoder::decode_datagram
#[derive(Debug)]
pub struct FrameDecoder {
    endianness: Endianness,
    buf: BytesMut,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// Create a decoder for the given byte order mode.
    pub fn new(endianness: Endianness) -> Self {
        Self {
            endianness,
            buf: BytesMut::with_capacity(4 * MAX_FRAME_LEN),
            stats: DecoderStats::default(),
        }
    }

    /// Feed stream bytes; returns every crossing completed by this chunk.
    pub fn push_bytes(&mut self, data: &[u8], now: DateTime<Utc>) -> Vec<CrossingEvent> {
        self.extend_transformed(data);

        let mut events = Vec::new();
        loop {
            // Resync: drop everything before the next frame start
            match self.buf.iter().position(|&b| b == b'<') {
                Some(0) => {}
                Some(start) => {
                    self.discard(start);
                }
                None => {
                    self.discard(self.buf.len());
                    break;
                }
            }

            let Some(end) = self.buf.iter().position(|&b| b == b'>') else {
                // Partial frame: keep waiting unless it is implausibly long
                if self.buf.len() > MAX_FRAME_LEN {
                    warn!(buffered = self.buf.len(), "oversized partial frame, resyncing");
                    self.discard(1);
                    continue;
                }
                break;
            };

            let body = self.buf[1..end].to_vec();
            self.buf.advance(end + 1);
            if let Some(event) = self.decode_body(&body, now) {
                events.push(event);
            }
        }
        events
    }

    /// Decode one whole datagram; no state is carried to the next packet.
    pub fn decode_datagram(&mut self, data: &[u8], now: DateTime<Utc>) -> Vec<CrossingEvent> {
        let data = self.transform(data);
        let mut events = Vec::new();
        let mut rest: &[u8] = &data;

        while let Some(start) = rest.iter().position(|&b| b == b'<') {
            self.stats.bytes_discarded += start as u64;
            rest = &rest[start + 1..];
            let Some(end) = rest.iter().position(|&b| b == b'>') else {
                // Truncated datagram frame is gone for good
                self.record_malformed("truncated datagram frame");
                break;
            };
            let body = &rest[..end];
            if let Some(event) = self.decode_body(body, now) {
                events.push(event);
            }
            rest = &rest[end + 1..];
        }
        events
    }

    /// Decoder counters so far.
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    fn decode_body(&mut self, body: &[u8], now: DateTime<Utc>) -> Option<CrossingEvent> {
        match parse_frame(body) {
            Ok(frame) => {
                self.stats.frames_decoded += 1;
                metrics::counter!("decoder_frames_total").increment(1);
                trace!(
                    transponder_id = %frame.transponder_id,
                    raw_time = frame.raw_time,
                    "frame decoded"
                );
                Some(CrossingEvent {
                    transponder_id: frame.transponder_id,
                    timestamp: now,
                    raw_time: frame.raw_time,
                    signal_strength: frame.signal_strength,
                    source_sequence: None,
                })
            }
            Err(e) => {
                self.record_malformed(&e.to_string());
                None
            }
        }
    }

    fn record_malformed(&mut self, reason: &str) {
        self.stats.malformed_frames += 1;
        metrics::counter!("decoder_malformed_total").increment(1);
        debug!(reason, "malformed frame skipped");
    }

    fn discard(&mut self, n: usize) {
        if n > 0 {
            self.stats.bytes_discarded += n as u64;
            self.buf.advance(n);
        }
    }

    fn extend_transformed(&mut self, data: &[u8]) {
        match self.endianness {
            Endianness::Normal => self.buf.extend_from_slice(data),
            Endianness::BitReversed => self.buf.extend(data.iter().map(|&b| bit_reverse(b))),
        }
    }

    fn transform(&self, data: &[u8]) -> Vec<u8> {
        match self.endianness {
            Endianness::Normal => data.to_vec(),
            Endianness::BitReversed => data.iter().map(|&b| bit_reverse(b)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &[u8] = b"<STA 023066 80:27'53\"016 01 01 01 3 1569>";

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_bit_reverse_byte() {
        assert_eq!(bit_reverse(0x23), 0xC4);
        assert_eq!(bit_reverse(bit_reverse(0x5A)), 0x5A);
    }

    #[test]
    fn test_whole_frame_in_one_chunk() {
        let mut dec = FrameDecoder::new(Endianness::Normal);
        let events = dec.push_bytes(FRAME, now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transponder_id, "023066");
        assert_eq!(events[0].signal_strength, 1569);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut dec = FrameDecoder::new(Endianness::Normal);
        let (a, b) = FRAME.split_at(17);
        assert!(dec.push_bytes(a, now()).is_empty());
        let events = dec.push_bytes(b, now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transponder_id, "023066");
    }

    #[test]
    fn test_garbage_before_frame_is_skipped() {
        let mut dec = FrameDecoder::new(Endianness::Normal);
        let mut data = b"\x00\xff noise ".to_vec();
        data.extend_from_slice(FRAME);
        let events = dec.push_bytes(&data, now());
        assert_eq!(events.len(), 1);
        assert!(dec.stats().bytes_discarded > 0);
    }

    #[test]
    fn test_malformed_frame_does_not_stop_pipeline() {
        let mut dec = FrameDecoder::new(Endianness::Normal);
        let mut data = b"<STA bogus>".to_vec();
        data.extend_from_slice(FRAME);
        let events = dec.push_bytes(&data, now());
        assert_eq!(events.len(), 1);
        assert_eq!(dec.stats().malformed_frames, 1);
        assert_eq!(dec.stats().frames_decoded, 1);
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut dec = FrameDecoder::new(Endianness::Normal);
        let mut data = FRAME.to_vec();
        data.extend_from_slice(b"<STA 100002 0:01'00\"000 7>");
        let events = dec.push_bytes(&data, now());
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].transponder_id, "100002");
    }

    #[test]
    fn test_bit_reversed_stream() {
        let mut dec = FrameDecoder::new(Endianness::BitReversed);
        let reversed: Vec<u8> = FRAME.iter().map(|&b| bit_reverse(b)).collect();
        let events = dec.push_bytes(&reversed, now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transponder_id, "023066");
    }

    #[test]
    fn test_datagram_is_stateless() {
        let mut dec = FrameDecoder::new(Endianness::Normal);
        // Truncated datagram frame does not leak into the next packet
        assert!(dec.decode_datagram(b"<STA 023066 80:2", now()).is_empty());
        let events = dec.decode_datagram(FRAME, now());
        assert_eq!(events.len(), 1);
        assert_eq!(dec.stats().malformed_frames, 1);
    }

    #[test]
    fn test_oversized_partial_frame_resyncs() {
        let mut dec = FrameDecoder::new(Endianness::Normal);
        let mut data = vec![b'<'];
        data.extend(std::iter::repeat(b'A').take(MAX_FRAME_LEN + 10));
        assert!(dec.push_bytes(&data, now()).is_empty());

        let events = dec.push_bytes(FRAME, now());
        assert_eq!(events.len(), 1);
    }
}
