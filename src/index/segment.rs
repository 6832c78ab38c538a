//! Segment payloads and their on-disk encoding.
//!
//! A segment file is a fixed little-endian header followed by a bincode
//! payload:
//!
//! ```text
//! +--------+---------+----------+-------------+-----------------+
//! | "CSEG" | version | crc32    | payload len | bincode payload |
//! | 4 B    | u16     | u32      | u64         | ...             |
//! +--------+---------+----------+-------------+-----------------+
//! ```
//!
//! The checksum covers the payload only. A file that fails any header check
//! is reported as an index error rather than partially loaded.

use std::collections::BTreeMap;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{ChatSearchError, Result};
use crate::index::message::Message;
use crate::storage::{Storage, read_file, write_atomic};

/// Magic bytes at the start of every segment file.
pub const SEGMENT_MAGIC: &[u8; 4] = b"CSEG";

/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u16 = 1;

/// Header length in bytes.
pub const SEGMENT_HEADER_LEN: usize = 4 + 2 + 4 + 8;

// Rough per-message bookkeeping cost on top of the message's strings.
const MESSAGE_OVERHEAD_BYTES: u64 = 48;

/// Document number of a message within its segment.
pub type DocId = u32;

/// One entry of a term's posting list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub doc: DocId,
    /// Occurrences of the term in the message.
    pub tf: u32,
}

/// Message metadata kept in the segment for filtering and results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub seq: u64,
    pub conversation_id: String,
    pub sender: String,
    pub timestamp: i64,
}

/// The contents of one segment: stored messages plus an inverted index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentData {
    messages: Vec<StoredMessage>,
    postings: BTreeMap<String, Vec<Posting>>,
    by_seq: BTreeMap<u64, DocId>,
    approx_bytes: u64,
}

impl SegmentData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` with its analyzed term frequencies.
    pub fn add(&mut self, message: &Message, terms: &BTreeMap<String, u32>) -> Result<DocId> {
        if self.by_seq.contains_key(&message.seq) {
            return Err(ChatSearchError::index(format!(
                "seq {} is already in this segment",
                message.seq
            )));
        }
        let doc = DocId::try_from(self.messages.len())
            .map_err(|_| ChatSearchError::index("segment is full"))?;

        for (term, &tf) in terms {
            self.postings
                .entry(term.clone())
                .or_default()
                .push(Posting { doc, tf });
        }

        self.by_seq.insert(message.seq, doc);
        self.approx_bytes += (message.id.len()
            + message.conversation_id.len()
            + message.sender.len()
            + message.text.len()) as u64
            + MESSAGE_OVERHEAD_BYTES;
        self.messages.push(StoredMessage {
            id: message.id.clone(),
            seq: message.seq,
            conversation_id: message.conversation_id.clone(),
            sender: message.sender.clone(),
            timestamp: message.timestamp,
        });

        Ok(doc)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains_seq(&self, seq: u64) -> bool {
        self.by_seq.contains_key(&seq)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    pub fn min_seq(&self) -> Option<u64> {
        self.by_seq.keys().next().copied()
    }

    pub fn max_seq(&self) -> Option<u64> {
        self.by_seq.keys().next_back().copied()
    }

    /// Estimated in-memory size, used for byte-based rotation.
    pub fn approx_bytes(&self) -> u64 {
        self.approx_bytes
    }

    pub fn message(&self, doc: DocId) -> Option<&StoredMessage> {
        self.messages.get(doc as usize)
    }

    pub fn messages(&self) -> impl Iterator<Item = &StoredMessage> {
        self.messages.iter()
    }

    /// Posting list for `term`; empty when the term does not occur.
    pub fn postings(&self, term: &str) -> &[Posting] {
        self.postings.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of messages containing `term`.
    pub fn doc_freq(&self, term: &str) -> usize {
        self.postings(term).len()
    }

    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    pub fn newest_timestamp(&self) -> Option<i64> {
        self.messages.iter().map(|m| m.timestamp).max()
    }
}

/// File name of segment `segment_id`.
pub fn segment_file_name(segment_id: u64) -> String {
    format!("seg-{segment_id:08}.seg")
}

/// Whether `name` looks like a segment file.
pub fn is_segment_file(name: &str) -> bool {
    name.starts_with("seg-") && name.ends_with(".seg")
}

/// Encode a segment into its file representation.
pub fn encode_segment(data: &SegmentData) -> Result<Vec<u8>> {
    let payload = bincode::serialize(data)?;

    let mut bytes = Vec::with_capacity(SEGMENT_HEADER_LEN + payload.len());
    bytes.extend_from_slice(SEGMENT_MAGIC);
    bytes.write_u16::<LittleEndian>(SEGMENT_FORMAT_VERSION)?;
    bytes.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    bytes.write_u64::<LittleEndian>(payload.len() as u64)?;
    bytes.extend_from_slice(&payload);

    Ok(bytes)
}

/// Decode and verify a segment file.
pub fn decode_segment(bytes: &[u8]) -> Result<SegmentData> {
    if bytes.len() < SEGMENT_HEADER_LEN {
        return Err(ChatSearchError::index(format!(
            "segment truncated: {} bytes",
            bytes.len()
        )));
    }
    if &bytes[..4] != SEGMENT_MAGIC {
        return Err(ChatSearchError::index("bad segment magic"));
    }

    let mut header = &bytes[4..SEGMENT_HEADER_LEN];
    let version = header.read_u16::<LittleEndian>()?;
    let checksum = header.read_u32::<LittleEndian>()?;
    let length = header.read_u64::<LittleEndian>()?;

    if version != SEGMENT_FORMAT_VERSION {
        return Err(ChatSearchError::index(format!(
            "unsupported segment format version {version}"
        )));
    }

    let payload = &bytes[SEGMENT_HEADER_LEN..];
    if payload.len() as u64 != length {
        return Err(ChatSearchError::index(format!(
            "segment payload length mismatch: header says {length}, found {}",
            payload.len()
        )));
    }
    if crc32fast::hash(payload) != checksum {
        return Err(ChatSearchError::index("segment checksum mismatch"));
    }

    Ok(bincode::deserialize(payload)?)
}

/// Atomically write a segment file. Returns its size in bytes.
pub fn write_segment(storage: &dyn Storage, file_name: &str, data: &SegmentData) -> Result<u64> {
    let bytes = encode_segment(data)?;
    write_atomic(storage, file_name, &bytes)?;
    Ok(bytes.len() as u64)
}

/// Read and verify a segment file.
pub fn read_segment(storage: &dyn Storage, file_name: &str) -> Result<SegmentData> {
    let bytes = read_file(storage, file_name)?;
    decode_segment(&bytes)
        .map_err(|e| ChatSearchError::index(format!("{file_name}: {e}")))
}
