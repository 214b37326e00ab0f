//! # Decoder
//!
//! Hardware frame decoding: turns raw decoder bytes (serial stream or network
//! datagram) into normalized [`contracts::CrossingEvent`]s.
//!
//! Supported grammar is the fixed-field text frame
//! `<STA 023066 80:27'53"016 01 01 01 3 1569>`: start marker, transponder id,
//! passing time with millisecond precision, auxiliary counters, signal value.
//! Some decoder hardware emits bit-reversed serial bytes; the decoder applies
//! an optional per-byte reversal before scanning.
//!
//! One bad frame never stops the pipeline: garbage is skipped up to the next
//! plausible frame start and counted.

mod decoder;
mod frame;

pub use decoder::{DecoderStats, Endianness, FrameDecoder};
pub use frame::{parse_decoder_time, parse_frame, DecodedFrame};
