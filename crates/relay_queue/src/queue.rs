//! Journal-backed relay queue implementation.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use contracts::{RelayEnvelope, RelayPayload, TimingError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Acked journal records tolerated before the journal is rewritten.
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1024;

/// One line of the journal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Entry { seq: u64, payload: RelayPayload },
    /// Cumulative: acknowledges every entry with seq <= this one
    Ack { seq: u64 },
}

/// Queue statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Enqueued over the queue's lifetime (including before this process)
    pub total: u64,
    /// Acknowledged over the queue's lifetime
    pub acked: u64,
    /// Currently awaiting acknowledgment
    pub pending: u64,
}

/// Durable FIFO queue with cumulative acknowledgment.
///
/// Single-producer / single-consumer per instance; callers running producer
/// and consumer on separate tasks share it behind a mutex. Sequence ids are
/// monotonic and never reused, including across process restarts.
#[derive(Debug)]
pub struct RelayQueue {
    path: PathBuf,
    writer: BufWriter<File>,
    pending: BTreeMap<u64, RelayPayload>,
    next_seq: u64,
    total_enqueued: u64,
    total_acked: u64,
    acked_since_compact: u64,
    compact_threshold: u64,
}

impl RelayQueue {
    /// Open (or create) a queue journal, replaying any existing state.
    ///
    /// # Errors
    /// - IO failure reading or creating the journal
    /// - `InvariantViolation` on duplicate or regressing sequence ids
    #[instrument(name = "relay_queue_open", skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TimingError> {
        Self::open_with_threshold(path, DEFAULT_COMPACT_THRESHOLD)
    }

    /// Open with a custom compaction threshold (mainly for tests).
    pub fn open_with_threshold(
        path: impl AsRef<Path>,
        compact_threshold: u64,
    ) -> Result<Self, TimingError> {
        let path = path.as_ref().to_path_buf();
        let mut pending = BTreeMap::new();
        let mut max_seq = 0u64;
        let mut total_enqueued = 0u64;
        let mut total_acked = 0u64;

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: JournalRecord = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        // A torn final line after a crash is expected; anything
                        // else would have been caught by the seq checks below.
                        warn!(line = line_no + 1, error = %e, "skipping unreadable journal line");
                        continue;
                    }
                };
                match record {
                    JournalRecord::Entry { seq, payload } => {
                        if seq <= max_seq && max_seq != 0 {
                            return Err(TimingError::invariant(format!(
                                "journal {}: entry seq {seq} not above {max_seq}",
                                path.display()
                            )));
                        }
                        max_seq = seq;
                        total_enqueued += 1;
                        pending.insert(seq, payload);
                    }
                    JournalRecord::Ack { seq } => {
                        let before = pending.len();
                        pending.retain(|&s, _| s > seq);
                        total_acked += (before - pending.len()) as u64;
                    }
                }
            }
        }

        // A crash mid-append can leave a torn final line; terminate it so the
        // next record starts clean instead of gluing onto the junk.
        let needs_newline = match File::open(&path) {
            Ok(mut f) => {
                use std::io::{Read, Seek, SeekFrom};
                let len = f.metadata()?.len();
                if len == 0 {
                    false
                } else {
                    f.seek(SeekFrom::End(-1))?;
                    let mut last = [0u8; 1];
                    f.read_exact(&mut last)?;
                    last[0] != b'\n'
                }
            }
            Err(_) => false,
        };

        let mut writer = BufWriter::new(OpenOptions::new().create(true).append(true).open(&path)?);
        if needs_newline {
            writer.write_all(b"\n")?;
            writer.flush()?;
        }

        if !pending.is_empty() {
            info!(
                pending = pending.len(),
                next_seq = max_seq + 1,
                "relay queue recovered unacked entries"
            );
        }

        Ok(Self {
            path,
            writer,
            pending,
            next_seq: max_seq + 1,
            total_enqueued,
            total_acked,
            acked_since_compact: 0,
            compact_threshold,
        })
    }

    /// Persist a payload and return its sequence id.
    ///
    /// The payload is on disk before this returns; network delivery is the
    /// consumer loop's job.
    pub fn enqueue(&mut self, payload: RelayPayload) -> Result<u64, TimingError> {
        let seq = self.next_seq;
        self.append(&JournalRecord::Entry {
            seq,
            payload: payload.clone(),
        })?;
        self.pending.insert(seq, payload);
        self.next_seq += 1;
        self.total_enqueued += 1;
        metrics::counter!("relay_queue_enqueued_total").increment(1);
        metrics::gauge!("relay_queue_pending").set(self.pending.len() as f64);
        Ok(seq)
    }

    /// Unacked envelopes in sequence order, up to `max`. Entries stay queued.
    pub fn peek_batch(&self, max: usize) -> Vec<RelayEnvelope> {
        self.pending
            .iter()
            .take(max)
            .map(|(&sequence_id, payload)| RelayEnvelope {
                sequence_id,
                payload: payload.clone(),
            })
            .collect()
    }

    /// Acknowledge every entry with sequence id <= `seq`.
    ///
    /// Returns how many entries were removed; 0 for a stale or repeated ack
    /// (at-least-once delivery makes those normal).
    pub fn ack(&mut self, seq: u64) -> Result<usize, TimingError> {
        let before = self.pending.len();
        self.pending.retain(|&s, _| s > seq);
        let removed = before - self.pending.len();

        if removed == 0 {
            debug!(seq, "ack matched nothing (duplicate or stale)");
            return Ok(0);
        }

        self.append(&JournalRecord::Ack { seq })?;
        self.total_acked += removed as u64;
        self.acked_since_compact += removed as u64;
        metrics::counter!("relay_queue_acked_total").increment(removed as u64);
        metrics::gauge!("relay_queue_pending").set(self.pending.len() as f64);

        if self.acked_since_compact >= self.compact_threshold {
            self.compact()?;
        }
        Ok(removed)
    }

    /// Number of entries awaiting acknowledgment.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Lowest unacked sequence id, if any.
    pub fn first_pending(&self) -> Option<u64> {
        self.pending.keys().next().copied()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            total: self.total_enqueued,
            acked: self.total_acked,
            pending: self.pending.len() as u64,
        }
    }

    /// Rewrite the journal keeping only unacked entries.
    #[instrument(name = "relay_queue_compact", skip(self), fields(pending = self.pending.len()))]
    pub fn compact(&mut self) -> Result<(), TimingError> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for (&seq, payload) in &self.pending {
                let record = JournalRecord::Entry {
                    seq,
                    payload: payload.clone(),
                };
                serde_json::to_writer(&mut tmp, &record)
                    .map_err(|e| TimingError::invariant(format!("journal encode: {e}")))?;
                tmp.write_all(b"\n")?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_data()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        self.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.acked_since_compact = 0;
        debug!("journal compacted");
        Ok(())
    }

    fn append(&mut self, record: &JournalRecord) -> Result<(), TimingError> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| TimingError::invariant(format!("journal encode: {e}")))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}
