//! Frame grammar parsing
//!
//! A frame body (the bytes between `<` and `>`) looks like:
//!
//! ```text
//! STA 023066 80:27'53"016 01 01 01 3 1569
//! ```
//!
//! marker, transponder id, passing time `H:MM'SS"mmm`, auxiliary counters,
//! trailing signal value. Hours are a free-running decoder clock and may
//! exceed 24.

use contracts::{TimingError, TransponderId};

/// Frame start marker.
const MARKER: &str = "STA";

/// One successfully parsed frame body.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub transponder_id: TransponderId,
    /// Decoder passing time in seconds
    pub raw_time: f64,
    /// Trailing signal value, 0 when the frame carries none
    pub signal_strength: u16,
}

/// Parse a passing time of the form `80:27'53"016` into seconds.
///
/// # Errors
/// `MalformedFrame` when the field does not match the grammar.
pub fn parse_decoder_time(field: &str) -> Result<f64, TimingError> {
    let (hours, rest) = field
        .split_once(':')
        .ok_or_else(|| TimingError::malformed_frame(format!("time field '{field}': no ':'")))?;
    let (minutes, rest) = rest
        .split_once('\'')
        .ok_or_else(|| TimingError::malformed_frame(format!("time field '{field}': no '\\''")))?;
    let (seconds, millis) = rest
        .split_once('"')
        .ok_or_else(|| TimingError::malformed_frame(format!("time field '{field}': no '\"'")))?;

    let parse = |part: &str, what: &str| {
        part.parse::<u32>()
            .map_err(|_| TimingError::malformed_frame(format!("time field '{field}': bad {what}")))
    };

    let h = parse(hours, "hours")?;
    let m = parse(minutes, "minutes")?;
    let s = parse(seconds, "seconds")?;
    let ms = parse(millis, "millis")?;

    if m >= 60 || s >= 60 || ms >= 1000 {
        return Err(TimingError::malformed_frame(format!(
            "time field '{field}': component out of range"
        )));
    }

    Ok(f64::from(h) * 3600.0 + f64::from(m) * 60.0 + f64::from(s) + f64::from(ms) / 1000.0)
}

/// Parse one frame body (without the `<` `>` delimiters).
///
/// # Errors
/// `MalformedFrame` when the marker, id or time field is missing or invalid.
pub fn parse_frame(body: &[u8]) -> Result<DecodedFrame, TimingError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| TimingError::malformed_frame("frame body is not valid utf-8"))?;

    let mut fields = text.split_ascii_whitespace();

    match fields.next() {
        Some(MARKER) => {}
        Some(other) => {
            return Err(TimingError::malformed_frame(format!(
                "unknown frame marker '{other}'"
            )))
        }
        None => return Err(TimingError::malformed_frame("empty frame body")),
    }

    let id_field = fields
        .next()
        .ok_or_else(|| TimingError::malformed_frame("frame has no transponder id"))?;
    if id_field.is_empty() || !id_field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TimingError::malformed_frame(format!(
            "transponder id '{id_field}' is not numeric"
        )));
    }

    let time_field = fields
        .next()
        .ok_or_else(|| TimingError::malformed_frame("frame has no time field"))?;
    let raw_time = parse_decoder_time(time_field)?;

    // Remaining fields are auxiliary counters; the trailing value is the
    // loop signal strength when present.
    let signal_strength = fields.last().and_then(|f| f.parse::<u16>().ok()).unwrap_or(0);

    Ok(DecodedFrame {
        transponder_id: TransponderId::new(id_field),
        raw_time,
        signal_strength,
    })
}
