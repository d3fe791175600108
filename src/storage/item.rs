//! Item Storage
//!
//! Persists records under the items subspace as self-describing
//! envelopes. A record whose encoded payload fits the inline limit is
//! stored directly; larger payloads are split into fixed-size chunks
//! under the blobs subspace and the envelope holds only a header.
//!
//! Layouts:
//! - Items: `R / <type> / <id-tuple> -> envelope`
//! - Blobs: `B / <blob-id> / <chunk-ix> -> bytes`
//!
//! Exactly one envelope exists per live primary key. Readers go through
//! [`ItemStorage::load`]; an unknown envelope version fails with
//! `UnsupportedEnvelope` rather than guessing.

use crate::error::{Error, Result};
use crate::kv::{KvRead, KvTransaction, RangeOptions};
use crate::record::{DynRecord, RecordCodec, RecordType};
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Current envelope version byte.
pub const ENVELOPE_VERSION: u8 = 1;

const DISC_INLINE: u8 = 0;
const DISC_BLOB: u8 = 1;

/// Decoded envelope contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Payload stored directly in the item value
    Inline(Vec<u8>),
    /// Payload chunked under the blobs subspace
    Blob(BlobHeader),
}

/// Header pointing at chained blob chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHeader {
    pub blob_id: i64,
    pub chunk_count: u32,
    pub total_len: u64,
}

impl Envelope {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![ENVELOPE_VERSION];
        match self {
            Envelope::Inline(payload) => {
                out.push(DISC_INLINE);
                out.extend_from_slice(payload);
            }
            Envelope::Blob(header) => {
                out.push(DISC_BLOB);
                let body =
                    bincode::serialize(header).map_err(|e| Error::Codec(e.to_string()))?;
                out.extend_from_slice(&body);
            }
        }
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Envelope> {
        let version = *bytes
            .first()
            .ok_or_else(|| Error::Codec("empty envelope".into()))?;
        if version != ENVELOPE_VERSION {
            return Err(Error::UnsupportedEnvelope(version));
        }
        let disc = *bytes
            .get(1)
            .ok_or_else(|| Error::Codec("truncated envelope".into()))?;
        match disc {
            DISC_INLINE => Ok(Envelope::Inline(bytes[2..].to_vec())),
            DISC_BLOB => {
                let header: BlobHeader = bincode::deserialize(&bytes[2..])
                    .map_err(|e| Error::Codec(format!("bad blob header: {e}")))?;
                Ok(Envelope::Blob(header))
            }
            other => Err(Error::Codec(format!("unknown envelope discriminant {other}"))),
        }
    }
}

/// Reads and writes record envelopes.
pub struct ItemStorage {
    items: Subspace,
    blobs: Subspace,
    codec: Arc<dyn RecordCodec>,
    inline_limit: usize,
    chunk_size: usize,
}

impl ItemStorage {
    pub fn new(
        root: &Subspace,
        codec: Arc<dyn RecordCodec>,
        inline_limit: usize,
        chunk_size: usize,
    ) -> Self {
        ItemStorage {
            items: root.child("R"),
            blobs: root.child("B"),
            codec,
            inline_limit,
            chunk_size: chunk_size.max(1),
        }
    }

    /// The item key for a primary key under a record type.
    pub fn item_key(&self, record_type: &str, primary_key: &Tuple) -> Vec<u8> {
        self.items.child(record_type).pack(primary_key)
    }

    /// The subspace covering every item of a record type.
    pub fn type_subspace(&self, record_type: &str) -> Subspace {
        self.items.child(record_type)
    }

    /// Write a record, replacing any existing envelope for the same
    /// primary key. Returns the primary key.
    pub fn save(
        &self,
        ty: &RecordType,
        record: &DynRecord,
        tx: &mut dyn KvTransaction,
    ) -> Result<Tuple> {
        let pk = ty.primary_key(record)?;
        let key = self.item_key(ty.name(), &pk);

        // Replacing a blob-backed envelope must release its old chunks
        if let Some(bytes) = tx.get(&key)? {
            if let Envelope::Blob(old) = Envelope::decode(&bytes)? {
                self.clear_chunks(&old, tx)?;
            }
        }

        let payload = self.codec.encode(record)?;
        let envelope = if payload.len() <= self.inline_limit {
            Envelope::Inline(payload)
        } else {
            let header = self.write_chunks(&payload, tx)?;
            tracing::debug!(
                record_type = ty.name(),
                blob_id = header.blob_id,
                chunks = header.chunk_count,
                total_len = header.total_len,
                "blob_spill"
            );
            Envelope::Blob(header)
        };
        tx.set(&key, &envelope.encode()?)?;
        Ok(pk)
    }

    /// Read a record by primary key. Returns `None` when no envelope
    /// exists.
    pub fn load(
        &self,
        ty: &RecordType,
        primary_key: &Tuple,
        reader: &dyn KvRead,
    ) -> Result<Option<DynRecord>> {
        let key = self.item_key(ty.name(), primary_key);
        let Some(bytes) = reader.get(&key)? else {
            return Ok(None);
        };
        let payload = self.read_envelope(&bytes, reader)?;
        Ok(Some(self.codec.decode(&payload)?))
    }

    /// Decode a record payload with the storage codec.
    pub fn decode_record(&self, payload: &[u8]) -> Result<DynRecord> {
        self.codec.decode(payload)
    }

    /// Decode an envelope value, reassembling blob chunks contiguously.
    pub fn read_envelope(&self, value: &[u8], reader: &dyn KvRead) -> Result<Vec<u8>> {
        match Envelope::decode(value)? {
            Envelope::Inline(payload) => Ok(payload),
            Envelope::Blob(header) => {
                let chunk_space = self.blobs.child(header.blob_id);
                let (begin, end) = chunk_space.range();
                let mut payload = Vec::with_capacity(header.total_len as usize);
                let mut chunks = 0u32;
                for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
                    let (_, chunk) = pair?;
                    payload.extend_from_slice(&chunk);
                    chunks += 1;
                }
                if chunks != header.chunk_count || payload.len() as u64 != header.total_len {
                    return Err(Error::Codec(format!(
                        "blob {} incomplete: {chunks}/{} chunks, {} bytes",
                        header.blob_id,
                        header.chunk_count,
                        payload.len()
                    )));
                }
                Ok(payload)
            }
        }
    }

    /// Delete a record's envelope and any chained chunks. Returns whether
    /// an envelope existed.
    pub fn delete(
        &self,
        ty: &RecordType,
        primary_key: &Tuple,
        tx: &mut dyn KvTransaction,
    ) -> Result<bool> {
        let key = self.item_key(ty.name(), primary_key);
        let Some(bytes) = tx.get(&key)? else {
            return Ok(false);
        };
        if let Envelope::Blob(header) = Envelope::decode(&bytes)? {
            self.clear_chunks(&header, tx)?;
        }
        tx.clear(&key)?;
        Ok(true)
    }

    /// Lazily scan every record of a type in primary-key order.
    pub fn scan_type<'a>(
        &'a self,
        ty: &'a RecordType,
        reader: &'a dyn KvRead,
        options: RangeOptions,
    ) -> impl Iterator<Item = Result<(Tuple, DynRecord)>> + 'a {
        let type_space = self.type_subspace(ty.name());
        let (begin, end) = type_space.range();
        reader.get_range(&begin, &end, options).map(move |pair| {
            let (key, value) = pair?;
            let pk = type_space.unpack(&key)?;
            let payload = self.read_envelope(&value, reader)?;
            Ok((pk, self.codec.decode(&payload)?))
        })
    }

    fn write_chunks(&self, payload: &[u8], tx: &mut dyn KvTransaction) -> Result<BlobHeader> {
        let blob_id = self.next_blob_id(tx)?;
        let chunk_space = self.blobs.child(blob_id);
        let mut chunk_count = 0u32;
        for (ix, chunk) in payload.chunks(self.chunk_size).enumerate() {
            tx.set(&chunk_space.pack(&Tuple::from_single(ix as i64)), chunk)?;
            chunk_count += 1;
        }
        Ok(BlobHeader {
            blob_id,
            chunk_count,
            total_len: payload.len() as u64,
        })
    }

    fn clear_chunks(&self, header: &BlobHeader, tx: &mut dyn KvTransaction) -> Result<()> {
        let (begin, end) = self.blobs.child(header.blob_id).range();
        tx.clear_range(&begin, &end)
    }

    /// Monotonic blob id from a reserved counter key; safe under the
    /// host's serializable transactions.
    fn next_blob_id(&self, tx: &mut dyn KvTransaction) -> Result<i64> {
        let counter_key = self.blobs.pack(&Tuple::from_single("ctr"));
        let next = match tx.get(&counter_key)? {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                if bytes.len() != 8 {
                    return Err(Error::Codec("bad blob counter".into()));
                }
                buf.copy_from_slice(&bytes);
                i64::from_be_bytes(buf) + 1
            }
            None => 0,
        };
        tx.set(&counter_key, &next.to_be_bytes())?;
        Ok(next)
    }
}
