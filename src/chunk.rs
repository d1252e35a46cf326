//! Large-payload chunking and reassembly.
//!
//! Brokers cap message size, so large payloads travel as a sequence of
//! [`ChunkEnvelope`]s:
//!
//! ```json
//! {"time": 1700000000.5, "chunk": "QUJD", "part": "1.3", "filename": "scan_1.tif", "encoding": "base64"}
//! ```
//!
//! The payload is first encoded to text in full (base64 for binary, as-is for
//! text), then sliced into consecutive pieces of `chunk_size` characters. Each
//! piece carries `part = "<i>.<n>"`, so the receiver knows when a file is
//! complete without waiting for a timeout.
//!
//! [`Reassembler`] buffers parts per file ID, in any arrival order and with any
//! number of files interleaved, and emits the decoded payload once all `n`
//! parts are present. Records for files that never complete stay in memory
//! until [`Reassembler::evict_stale`] or [`Reassembler::discard`] drops them.

use crate::clock::{Clock, SystemClock};
use crate::error::{MdmlError, Result};
use crate::validation::is_not_empty;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Chunk size used when none is configured, in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 750_000;

/// How a chunk's text maps back to the original payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Base64 of binary data.
    Base64,
    /// UTF-8 text.
    Utf8,
    /// ASCII text.
    Ascii,
    /// Any other name; passed through undecoded on reassembly.
    Other(String),
}

impl Encoding {
    /// Parses an encoding name, case-insensitively.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "base64" => Encoding::Base64,
            "utf-8" | "utf8" => Encoding::Utf8,
            "ascii" | "us-ascii" => Encoding::Ascii,
            _ => Encoding::Other(name.to_string()),
        }
    }

    /// Wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Encoding::Base64 => "base64",
            Encoding::Utf8 => "utf-8",
            Encoding::Ascii => "ascii",
            Encoding::Other(name) => name,
        }
    }

    /// Whether the reassembler can decode this encoding.
    pub fn is_known(&self) -> bool {
        !matches!(self, Encoding::Other(_))
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Encoding {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Encoding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Encoding::from_name(&name))
    }
}

/// Position of a chunk: `index` of `total`, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkPart {
    /// 1-based chunk number.
    pub index: usize,
    /// Number of chunks in the file.
    pub total: usize,
}

impl fmt::Display for ChunkPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.total)
    }
}

impl FromStr for ChunkPart {
    type Err = MdmlError;

    /// Accepts `i.n`, and `i/n` from older senders.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || MdmlError::Parse(format!("invalid chunk part '{s}', expected '<i>.<n>'"));
        let (index, total) = s.split_once(['.', '/']).ok_or_else(invalid)?;
        let index: usize = index.trim().parse().map_err(|_| invalid())?;
        let total: usize = total.trim().parse().map_err(|_| invalid())?;
        if index == 0 || index > total {
            return Err(MdmlError::Parse(format!(
                "chunk part '{s}' is out of range (1..={total})"
            )));
        }
        Ok(ChunkPart { index, total })
    }
}

impl Serialize for ChunkPart {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChunkPart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Wire body of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    /// Send time, Unix seconds.
    pub time: f64,
    /// Slice of the encoded payload.
    pub chunk: String,
    /// Position in the file.
    pub part: ChunkPart,
    /// File ID shared by all chunks of one payload.
    pub filename: String,
    /// Encoding of the full payload.
    pub encoding: Encoding,
}

impl ChunkEnvelope {
    /// Parses a received chunk message.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| MdmlError::Parse(format!("invalid chunk message: {e}")))
    }

    /// Serializes for sending.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// File ID.
    pub fn file_id(&self) -> &str {
        &self.filename
    }
}

/// Payload handed to [`chunk`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkInput {
    /// Raw bytes, base64-encoded before slicing.
    Binary(Vec<u8>),
    /// Text sent as-is under the named encoding.
    Text {
        /// The text.
        text: String,
        /// Encoding name announced to the receiver.
        encoding: Encoding,
    },
}

impl ChunkInput {
    /// UTF-8 text.
    pub fn text(text: impl Into<String>) -> Self {
        ChunkInput::Text {
            text: text.into(),
            encoding: Encoding::Utf8,
        }
    }

    fn encode(self) -> (String, Encoding) {
        match self {
            ChunkInput::Binary(bytes) => (BASE64.encode(bytes), Encoding::Base64),
            ChunkInput::Text { text, encoding } => (text, encoding),
        }
    }
}

impl From<Vec<u8>> for ChunkInput {
    fn from(value: Vec<u8>) -> Self {
        ChunkInput::Binary(value)
    }
}

impl From<&[u8]> for ChunkInput {
    fn from(value: &[u8]) -> Self {
        ChunkInput::Binary(value.to_vec())
    }
}

impl From<String> for ChunkInput {
    fn from(value: String) -> Self {
        ChunkInput::text(value)
    }
}

impl From<&str> for ChunkInput {
    fn from(value: &str) -> Self {
        ChunkInput::text(value)
    }
}

/// Splits a payload into chunk envelopes.
///
/// `chunk_size` counts characters of the encoded text. An empty payload still
/// produces one (empty) chunk so the receiver learns the file exists.
///
/// # Errors
///
/// [`MdmlError::Shape`] for a zero chunk size, [`MdmlError::Format`] for an
/// empty file ID.
pub fn chunk(payload: impl Into<ChunkInput>, chunk_size: usize, file_id: &str) -> Result<Chunks> {
    if chunk_size == 0 {
        return Err(MdmlError::Shape("chunk_size must be greater than 0".into()));
    }
    is_not_empty(file_id).map_err(|e| MdmlError::Format(format!("chunk file {e}")))?;
    let (text, encoding) = payload.into().encode();

    // Byte offsets of every chunk start, stepping by characters so multi-byte
    // text is never split inside a code point.
    let mut bounds: Vec<usize> = text
        .char_indices()
        .step_by(chunk_size)
        .map(|(offset, _)| offset)
        .collect();
    if bounds.is_empty() {
        bounds.push(0);
    }
    bounds.push(text.len());

    tracing::debug!(
        file_id,
        encoding = %encoding,
        encoded_len = text.len(),
        parts = bounds.len() - 1,
        "Payload chunked"
    );
    Ok(Chunks {
        text,
        encoding,
        file_id: file_id.to_string(),
        bounds,
        next: 0,
        clock: Arc::new(SystemClock),
    })
}

/// Lazy sequence of [`ChunkEnvelope`]s produced by [`chunk`].
pub struct Chunks {
    text: String,
    encoding: Encoding,
    file_id: String,
    bounds: Vec<usize>,
    next: usize,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Chunks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunks")
            .field("file_id", &self.file_id)
            .field("encoding", &self.encoding)
            .field("total", &self.total())
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

impl Chunks {
    /// Stamps chunks with `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of chunks in the file.
    pub fn total(&self) -> usize {
        self.bounds.len() - 1
    }

    /// Encoding announced in every chunk.
    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    /// Starts over from chunk 1.
    pub fn restart(&mut self) {
        self.next = 0;
    }
}

impl Iterator for Chunks {
    type Item = ChunkEnvelope;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total() {
            return None;
        }
        let i = self.next;
        self.next += 1;
        Some(ChunkEnvelope {
            time: self.clock.now_secs(),
            chunk: self.text[self.bounds[i]..self.bounds[i + 1]].to_string(),
            part: ChunkPart {
                index: i + 1,
                total: self.total(),
            },
            filename: self.file_id.clone(),
            encoding: self.encoding.clone(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total() - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunks {}

/// A fully reassembled payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Reassembled {
    /// File ID.
    pub file_id: String,
    /// `time` of part 1.
    pub time: f64,
    /// Decoded content.
    pub payload: ReassembledPayload,
}

/// Decoded content of a reassembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassembledPayload {
    /// Decoded from base64.
    Bytes(Vec<u8>),
    /// Text encodings.
    Text(String),
    /// Unknown encoding, or base64 that failed to decode. The concatenated
    /// chunk text is kept so the caller decides what to do with it.
    Undecoded {
        /// Encoding named by the sender.
        encoding: String,
        /// Concatenated chunk text.
        data: String,
    },
}

impl ReassembledPayload {
    /// Raw bytes of the content.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ReassembledPayload::Bytes(bytes) => bytes,
            ReassembledPayload::Text(text) => text.as_bytes(),
            ReassembledPayload::Undecoded { data, .. } => data.as_bytes(),
        }
    }
}

#[derive(Debug)]
struct PartialFile {
    total: usize,
    encoding: Encoding,
    parts: BTreeMap<usize, String>,
    part_one_time: Option<f64>,
    first_sent: f64,
    /// Local arrival time of the first chunk; eviction ages against this.
    first_seen: f64,
}

/// Rebuilds payloads from chunks arriving in any order.
pub struct Reassembler {
    pending: HashMap<String, PartialFile>,
    clock: Arc<dyn Clock>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reassembler")
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl Reassembler {
    /// Empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Measures transfer age with `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Parses and ingests a chunk message.
    pub fn ingest_json(&mut self, text: &str) -> Result<Option<Reassembled>> {
        self.ingest(ChunkEnvelope::from_json(text)?)
    }

    /// Stores one chunk. Returns the payload when this chunk completes its file.
    ///
    /// A repeated part replaces the earlier copy.
    ///
    /// # Errors
    ///
    /// [`MdmlError::Shape`] if the chunk disagrees with earlier chunks of the
    /// same file about the part count or encoding. The chunk is dropped and the
    /// record left as it was.
    pub fn ingest(&mut self, chunk: ChunkEnvelope) -> Result<Option<Reassembled>> {
        let ChunkEnvelope {
            time,
            chunk: text,
            part,
            filename,
            encoding,
        } = chunk;

        let clock = &self.clock;
        let record = self
            .pending
            .entry(filename.clone())
            .or_insert_with(|| PartialFile {
                total: part.total,
                encoding: encoding.clone(),
                parts: BTreeMap::new(),
                part_one_time: None,
                first_sent: time,
                first_seen: clock.now_secs(),
            });

        if record.total != part.total {
            return Err(MdmlError::Shape(format!(
                "chunk {part} of '{filename}' disagrees with earlier part count {}",
                record.total
            )));
        }
        if record.encoding != encoding {
            return Err(MdmlError::Shape(format!(
                "chunk {part} of '{filename}' uses encoding '{encoding}', earlier chunks used '{}'",
                record.encoding
            )));
        }
        if part.index == 1 {
            record.part_one_time = Some(time);
        }
        if record.parts.insert(part.index, text).is_some() {
            tracing::debug!(file_id = %filename, part = %part, "Duplicate chunk replaced");
        }
        tracing::trace!(
            file_id = %filename,
            part = %part,
            received = record.parts.len(),
            "Chunk stored"
        );

        if record.parts.len() < record.total {
            return Ok(None);
        }
        let Some(record) = self.pending.remove(&filename) else {
            return Ok(None);
        };
        let data: String = record.parts.into_values().collect();
        let payload = decode(&filename, record.encoding, data);
        tracing::debug!(file_id = %filename, parts = record.total, "File reassembled");
        Ok(Some(Reassembled {
            time: record.part_one_time.unwrap_or(record.first_sent),
            file_id: filename,
            payload,
        }))
    }

    /// Number of files with missing parts.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// IDs of files with missing parts.
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// `(received, total)` for an in-flight file.
    pub fn progress(&self, file_id: &str) -> Option<(usize, usize)> {
        self.pending
            .get(file_id)
            .map(|record| (record.parts.len(), record.total))
    }

    /// Drops an in-flight file. Returns whether it existed.
    pub fn discard(&mut self, file_id: &str) -> bool {
        self.pending.remove(file_id).is_some()
    }

    /// Drops files whose first chunk arrived more than `max_age_secs` ago by
    /// the reassembler's clock. The sender's `time` plays no part, so a skewed
    /// or queued sender cannot age out a live transfer. Returns the evicted IDs.
    pub fn evict_stale(&mut self, max_age_secs: f64) -> Vec<String> {
        let now_secs = self.clock.now_secs();
        let mut evicted = Vec::new();
        self.pending.retain(|file_id, record| {
            let keep = now_secs - record.first_seen <= max_age_secs;
            if !keep {
                tracing::warn!(
                    file_id = %file_id,
                    received = record.parts.len(),
                    total = record.total,
                    "Abandoned chunked transfer evicted"
                );
                evicted.push(file_id.clone());
            }
            keep
        });
        evicted.sort();
        evicted
    }
}

fn decode(file_id: &str, encoding: Encoding, data: String) -> ReassembledPayload {
    match encoding {
        Encoding::Base64 => match BASE64.decode(data.as_bytes()) {
            Ok(bytes) => ReassembledPayload::Bytes(bytes),
            Err(e) => {
                tracing::warn!(file_id, error = %e, "Reassembled base64 payload did not decode");
                ReassembledPayload::Undecoded {
                    encoding: Encoding::Base64.as_str().to_string(),
                    data,
                }
            }
        },
        Encoding::Utf8 | Encoding::Ascii => ReassembledPayload::Text(data),
        Encoding::Other(name) => {
            tracing::warn!(file_id, encoding = %name, "Unknown chunk encoding, payload left undecoded");
            ReassembledPayload::Undecoded { encoding: name, data }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::ErrorKind;

    #[test]
    fn part_wire_form() {
        let part: ChunkPart = "2.5".parse().unwrap();
        assert_eq!(part, ChunkPart { index: 2, total: 5 });
        assert_eq!(part.to_string(), "2.5");
        assert_eq!("3/4".parse::<ChunkPart>().unwrap().index, 3);
        assert!("0.2".parse::<ChunkPart>().is_err());
        assert!("3.2".parse::<ChunkPart>().is_err());
        assert!("x.2".parse::<ChunkPart>().is_err());
        assert!("12".parse::<ChunkPart>().is_err());
    }

    #[test]
    fn encoding_names() {
        assert_eq!(Encoding::from_name("BASE64"), Encoding::Base64);
        assert_eq!(Encoding::from_name("utf8"), Encoding::Utf8);
        assert_eq!(Encoding::from_name("latin-1"), Encoding::Other("latin-1".into()));
        assert!(!Encoding::from_name("latin-1").is_known());
    }

    #[test]
    fn part_count_is_ceiling() {
        assert_eq!(chunk("abcdefg", 3, "f").unwrap().total(), 3);
        assert_eq!(chunk("abcdef", 3, "f").unwrap().total(), 2);
        assert_eq!(chunk("ab", 3, "f").unwrap().total(), 1);
        assert_eq!(chunk("", 3, "f").unwrap().total(), 1);
    }

    #[test]
    fn chunk_wire_fields() {
        let clock = Arc::new(FixedClock::new(1_500_000_000));
        let parts: Vec<_> = chunk(b"hello".as_slice(), 4, "greeting.bin")
            .unwrap()
            .with_clock(clock)
            .collect();
        // base64("hello") = "aGVsbG8="
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].chunk, "aGVs");
        assert_eq!(parts[1].chunk, "bG8=");
        let json: serde_json::Value = serde_json::from_str(&parts[1].to_json().unwrap()).unwrap();
        assert_eq!(json["part"], "2.2");
        assert_eq!(json["encoding"], "base64");
        assert_eq!(json["filename"], "greeting.bin");
        assert_eq!(json["time"], 1.5);
    }

    #[test]
    fn multibyte_text_is_split_on_characters() {
        let parts: Vec<_> = chunk("ééé", 2, "t").unwrap().collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].chunk, "éé");
        assert_eq!(parts[1].chunk, "é");
    }

    #[test]
    fn restart_replays_from_first_part() {
        let mut chunks = chunk("abcdef", 2, "f").unwrap();
        assert_eq!(chunks.len(), 3);
        chunks.next();
        chunks.next();
        chunks.restart();
        assert_eq!(chunks.next().unwrap().part.index, 1);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert_eq!(chunk("a", 0, "f").unwrap_err().kind(), ErrorKind::Shape);
        assert_eq!(chunk("a", 1, "").unwrap_err().kind(), ErrorKind::Format);
        assert_eq!(chunk("a", 1, "  ").unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn out_of_order_reassembly() {
        let mut parts: Vec<_> = chunk("the quick brown fox", 4, "fox.txt").unwrap().collect();
        parts.reverse();
        let mut reassembler = Reassembler::new();
        let mut done = None;
        for part in parts {
            if let Some(file) = reassembler.ingest(part).unwrap() {
                done = Some(file);
            }
        }
        let done = done.unwrap();
        assert_eq!(done.payload, ReassembledPayload::Text("the quick brown fox".into()));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn unknown_encoding_passes_through() {
        let input = ChunkInput::Text {
            text: "caf\u{e9}".into(),
            encoding: Encoding::from_name("latin-1"),
        };
        let mut reassembler = Reassembler::new();
        let mut result = None;
        for part in chunk(input, 2, "f").unwrap() {
            result = reassembler.ingest(part).unwrap();
        }
        assert_eq!(
            result.unwrap().payload,
            ReassembledPayload::Undecoded {
                encoding: "latin-1".into(),
                data: "caf\u{e9}".into()
            }
        );
    }

    #[test]
    fn inconsistent_totals_are_rejected() {
        let mut reassembler = Reassembler::new();
        let first = ChunkEnvelope {
            time: 1.0,
            chunk: "a".into(),
            part: ChunkPart { index: 1, total: 2 },
            filename: "f".into(),
            encoding: Encoding::Utf8,
        };
        let mut conflicting = first.clone();
        conflicting.part = ChunkPart { index: 2, total: 3 };
        assert!(reassembler.ingest(first).unwrap().is_none());
        assert_eq!(
            reassembler.ingest(conflicting).unwrap_err().kind(),
            ErrorKind::Shape
        );
        assert_eq!(reassembler.progress("f"), Some((1, 2)));
    }

    #[test]
    fn stale_records_are_evicted() {
        let local = Arc::new(FixedClock::new(0));
        let mut reassembler = Reassembler::new().with_clock(local.clone());
        let mut old = chunk("abcd", 2, "old").unwrap();
        let mut new = chunk("abcd", 2, "new").unwrap();
        reassembler.ingest(old.next().unwrap()).unwrap();
        local.set(100_000_000_000);
        reassembler.ingest(new.next().unwrap()).unwrap();
        local.set(120_000_000_000);
        assert_eq!(reassembler.evict_stale(60.0), vec!["old".to_string()]);
        assert_eq!(reassembler.pending_ids(), vec!["new".to_string()]);
        assert!(reassembler.discard("new"));
        assert!(!reassembler.discard("new"));
    }

    #[test]
    fn age_ignores_sender_time() {
        let local = Arc::new(FixedClock::new(1_000_000_000_000));
        let mut reassembler = Reassembler::new().with_clock(local.clone());
        let mut parts = chunk("abcd", 2, "lagging")
            .unwrap()
            .with_clock(Arc::new(FixedClock::new(880_000_000_000)));
        reassembler.ingest(parts.next().unwrap()).unwrap();
        local.advance(1_000_000_000);
        assert!(reassembler.evict_stale(60.0).is_empty());

        let done = reassembler.ingest(parts.next().unwrap()).unwrap().unwrap();
        assert_eq!(done.time, 880.0);
        assert_eq!(done.payload, ReassembledPayload::Text("abcd".into()));
    }
}
