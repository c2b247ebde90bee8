//! Auto-chunking of large content.
//!
//! Content above the configured threshold is split into chunk entities of
//! `chunk_size` bytes, linked to the parent by tags. The parent keeps no
//! content of its own, only metadata: chunk count, chunk size, declared
//! mime, total size and the sha256 of the whole value. Each chunk carries
//! its own sha256; streaming reads verify both layers.

use std::io::Write;

use sha2::{Digest, Sha256};
use tracing::error;

use entitydb_core::{EntityId, StoreError, NS_PARENT, TAG_CHUNK_TYPE};

use crate::format::MAX_ENTITY_BYTES;
use crate::index::EntityIndex;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn chunk_id(parent: &str, index: u32) -> EntityId {
    format!("{parent}-chunk-{index}")
}

/// A chunk entity staged for creation alongside its parent.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub id: EntityId,
    pub tags: Vec<String>,
    pub content: Vec<u8>,
}

/// How one content value will be stored.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    /// Metadata tag bodies to append to the parent.
    pub parent_tags: Vec<String>,

    /// Chunk entities to create; empty when the content is inlined.
    pub chunks: Vec<NewChunk>,

    /// Content stored directly on the parent, if below the threshold.
    pub inline: Option<Vec<u8>>,
}

impl ChunkPlan {
    pub fn is_chunked(&self) -> bool {
        !self.chunks.is_empty()
    }
}

/// Decides between inline storage and chunking.
///
/// The declared mime is stored verbatim when present; content sniffing
/// belongs to the API layer, not here. Inline content without a declared
/// mime gets no metadata tags at all.
pub fn plan_content(
    parent_id: &str,
    content: Vec<u8>,
    mime: Option<&str>,
    threshold: u64,
    chunk_size: u64,
) -> Result<ChunkPlan, StoreError> {
    if content.len() as u64 > MAX_ENTITY_BYTES {
        return Err(StoreError::EntityTooLarge);
    }

    if content.len() as u64 <= threshold {
        let mut parent_tags = Vec::new();

        if let Some(mime) = mime {
            parent_tags.push(format!("content:type:{mime}"));
            parent_tags.push(format!("content:size:{}", content.len()));
            parent_tags.push(format!("content:checksum:sha256:{}", sha256_hex(&content)));
        }

        return Ok(ChunkPlan {
            parent_tags,
            chunks: Vec::new(),
            inline: Some(content),
        });
    }

    let chunk_size = chunk_size.max(1) as usize;
    let total = content.len();
    let count = total.div_ceil(chunk_size);

    let mut chunks = Vec::with_capacity(count);
    let mut whole = Sha256::new();

    for (index, segment) in content.chunks(chunk_size).enumerate() {
        whole.update(segment);

        chunks.push(NewChunk {
            id: chunk_id(parent_id, index as u32),
            tags: vec![
                TAG_CHUNK_TYPE.to_string(),
                format!("{NS_PARENT}:{parent_id}"),
                format!("content:chunk:{index}"),
                format!("content:size:{}", segment.len()),
                format!("content:checksum:sha256:{}", sha256_hex(segment)),
            ],
            content: segment.to_vec(),
        });
    }

    let mut parent_tags = vec![
        format!("content:chunks:{count}"),
        format!("content:chunk-size:{chunk_size}"),
        format!("content:size:{total}"),
        format!("content:checksum:sha256:{}", hex::encode(whole.finalize())),
    ];

    if let Some(mime) = mime {
        parent_tags.push(format!("content:type:{mime}"));
    }

    Ok(ChunkPlan {
        parent_tags,
        chunks,
        inline: None,
    })
}

/// Streams an entity's content into `out`, reassembling chunked storage in
/// order and validating both per-chunk and whole-content checksums.
pub fn read_content(
    index: &EntityIndex,
    id: &str,
    out: &mut dyn Write,
) -> Result<u64, StoreError> {
    let chunk_count = index
        .with_record(id, |record| {
            record
                .tags
                .iter()
                .filter(|t| t.ns_key() == "content:chunks")
                .max_by_key(|t| t.ts)
                .and_then(|t| t.value().parse::<u32>().ok())
        })
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

    let Some(chunk_count) = chunk_count else {
        // inlined
        let content = index
            .with_record(id, |record| {
                record.current_content().map(|c| c.to_vec())
            })
            .flatten()
            .unwrap_or_default();

        out.write_all(&content)?;
        return Ok(content.len() as u64);
    };

    let declared = index
        .with_record(id, |record| {
            record
                .tags
                .iter()
                .filter(|t| t.ns_key() == "content:checksum:sha256")
                .max_by_key(|t| t.ts)
                .map(|t| t.value().to_string())
        })
        .flatten();

    let mut whole = Sha256::new();
    let mut written = 0u64;

    for i in 0..chunk_count {
        let child = chunk_id(id, i);

        let chunk = index
            .with_record(&child, |record| {
                let content = record.current_content().map(|c| c.to_vec());
                let checksum = record
                    .tags
                    .iter()
                    .filter(|t| t.ns_key() == "content:checksum:sha256")
                    .max_by_key(|t| t.ts)
                    .map(|t| t.value().to_string());
                (content, checksum)
            })
            .ok_or(StoreError::ChunkMissing {
                parent: id.to_string(),
                index: i,
            })?;

        let (Some(content), checksum) = chunk else {
            return Err(StoreError::ChunkMissing {
                parent: id.to_string(),
                index: i,
            });
        };

        let actual = sha256_hex(&content);
        if checksum.as_deref() != Some(actual.as_str()) {
            error!(parent = id, chunk = i, "chunk checksum mismatch");
            return Err(StoreError::ChunkCorrupt {
                parent: id.to_string(),
                index: i,
            });
        }

        whole.update(&content);
        out.write_all(&content)?;
        written += content.len() as u64;
    }

    if let Some(declared) = declared {
        let actual = hex::encode(whole.finalize());
        if actual != declared {
            error!(parent = id, "reassembled content checksum mismatch");
            return Err(StoreError::ChunkCorrupt {
                parent: id.to_string(),
                index: chunk_count.saturating_sub(1),
            });
        }
    }

    Ok(written)
}
