use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest replication message accepted off the wire
const MAX_MESSAGE_BYTES: u32 = 64 * 1024 * 1024;

/// Identifier of a replication peer (host), 0..=127
///
/// Doubles as log provenance and as the deterministic tie-breaker of the
/// conflict-resolution rule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(u8);

impl PeerId {
    pub const MAX: u8 = 127;

    pub fn new(raw: u8) -> ReplicationResult<Self> {
        if raw > Self::MAX {
            return Err(ReplicationError::IdentifierOutOfRange(raw));
        }
        Ok(Self(raw))
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One recorded mutation of a replicated map
///
/// `value: None` with `is_deleted` set is a tombstone. Immutable once
/// created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationEntry {
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub timestamp: i64,
    pub origin: PeerId,
    pub is_deleted: bool,
    pub bootstrap_timestamp: i64,
}

impl ModificationEntry {
    pub fn put(key: Bytes, value: Bytes, timestamp: i64, origin: PeerId) -> Self {
        Self {
            key,
            value: Some(value),
            timestamp,
            origin,
            is_deleted: false,
            bootstrap_timestamp: timestamp,
        }
    }

    pub fn tombstone(key: Bytes, timestamp: i64, origin: PeerId) -> Self {
        Self {
            key,
            value: None,
            timestamp,
            origin,
            is_deleted: true,
            bootstrap_timestamp: timestamp,
        }
    }

    /// Last-writer-wins with the identifier as deterministic tie-break
    pub fn supersedes(&self, other_timestamp: i64, other_origin: PeerId) -> bool {
        self.timestamp > other_timestamp
            || (self.timestamp == other_timestamp && self.origin > other_origin)
    }
}

/// Message exchanged on a replication peer session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Handshake: the connecting side names itself and the newest entry
    /// timestamp it has already seen from this host
    Hello {
        identifier: PeerId,
        last_seen_timestamp: i64,
    },

    /// One drained modification for the named asset
    Entry {
        asset: String,
        entry: ModificationEntry,
    },

    /// Full-map snapshot for the named asset (checksummed, see engine)
    Snapshot { asset: String, data: Vec<u8> },

    /// Keep-alive while no entries are flowing
    Heartbeat { timestamp: i64 },
}

impl ReplicationMessage {
    /// Write with a u32 big-endian length prefix
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> ReplicationResult<()> {
        let data = bincode::serialize(self)?;
        let len = data.len() as u32;

        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&data).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Read one length-prefixed message; `None` on clean end of stream
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> ReplicationResult<Option<Self>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf);
        if len > MAX_MESSAGE_BYTES {
            return Err(ReplicationError::MalformedEntry(format!(
                "message length {} exceeds limit",
                len
            )));
        }

        let mut data = vec![0u8; len as usize];
        reader.read_exact(&mut data).await?;

        Ok(Some(bincode::deserialize(&data)?))
    }
}

/// Replication statistics for one map
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicationStats {
    /// Entries accepted by the conflict rule (local and remote)
    pub entries_applied: u64,
    /// Entries silently discarded by the conflict rule
    pub entries_discarded: u64,
    /// Entries originated by the local host
    pub entries_local: u64,
    /// Tombstones currently recorded
    pub tombstones: u64,
}

/// Replication error types
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Identifier out of range (0..=127): {0}")]
    IdentifierOutOfRange(u8),

    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

impl From<bincode::Error> for ReplicationError {
    fn from(e: bincode::Error) -> Self {
        ReplicationError::SerializationError(e.to_string())
    }
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;
