//! Auto-chunking scenarios: the 5 MiB split, streaming reassembly with
//! checksum validation, and chunk elision after parent deletion.

use entitydb::chunk::sha256_hex;
use entitydb::core::{Context, EngineConfig, EntityStore, GetOptions, NewEntity, StoreError};
use entitydb::EntityDb;

const MIB: usize = 1024 * 1024;

fn config(dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        data_path: dir.to_path_buf(),
        ..EngineConfig::default()
    }
}

fn big_entity(id: &str, content: Vec<u8>) -> NewEntity {
    NewEntity {
        id: id.into(),
        tags: vec!["type:document".into()],
        content: Some(content),
        content_type: Some("application/octet-stream".into()),
    }
}

#[test]
fn five_mib_splits_into_two_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let db = EntityDb::open(config(dir.path())).unwrap();
    let ctx = Context::background();

    let content = vec![0x41u8; 5 * MIB];
    let expected_checksum = sha256_hex(&content);

    db.create_entity(&ctx, big_entity("big", content)).unwrap();

    let parent = db.get_entity(&ctx, "big", GetOptions::default()).unwrap();
    assert_eq!(parent.content, None);
    assert!(parent.has_tag("content:chunks:2"));
    assert!(parent.has_tag("content:chunk-size:4194304"));
    assert!(parent.has_tag("content:size:5242880"));
    assert!(parent.has_tag(&format!("content:checksum:sha256:{expected_checksum}")));

    let chunk0 = db
        .get_entity(&ctx, "big-chunk-0", GetOptions::default())
        .unwrap();
    assert_eq!(chunk0.content.as_ref().unwrap().len(), 4 * MIB);
    assert!(chunk0.has_tag("type:chunk"));
    assert!(chunk0.has_tag("parent:big"));
    assert!(chunk0.has_tag("content:chunk:0"));

    let chunk1 = db
        .get_entity(&ctx, "big-chunk-1", GetOptions::default())
        .unwrap();
    assert_eq!(chunk1.content.as_ref().unwrap().len(), MIB);

    let mut streamed = Vec::new();
    let written = db.read_content(&ctx, "big", &mut streamed).unwrap();
    assert_eq!(written, (5 * MIB) as u64);
    assert_eq!(streamed.len(), 5 * MIB);
    assert!(streamed.iter().all(|b| *b == 0x41));
}

#[test]
fn inline_content_streams_directly() {
    let dir = tempfile::tempdir().unwrap();
    let db = EntityDb::open(config(dir.path())).unwrap();
    let ctx = Context::background();

    db.create_entity(&ctx, big_entity("small", b"just bytes".to_vec()))
        .unwrap();

    let entity = db.get_entity(&ctx, "small", GetOptions::default()).unwrap();
    assert_eq!(entity.content.as_deref(), Some(b"just bytes".as_slice()));
    assert!(entity.has_tag("content:type:application/octet-stream"));

    let mut streamed = Vec::new();
    let written = db.read_content(&ctx, "small", &mut streamed).unwrap();
    assert_eq!(written, 10);
    assert_eq!(streamed, b"just bytes");
}

#[test]
fn missing_chunk_fails_the_read() {
    let dir = tempfile::tempdir().unwrap();
    let db = EntityDb::open(config(dir.path())).unwrap();
    let ctx = Context::background();

    db.create_entity(&ctx, big_entity("big", vec![0x42u8; 5 * MIB]))
        .unwrap();

    db.index().remove("big-chunk-1");

    let mut sink = Vec::new();
    assert!(matches!(
        db.read_content(&ctx, "big", &mut sink),
        Err(StoreError::ChunkMissing { index: 1, .. })
    ));
}

#[test]
fn chunked_content_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let content = vec![0x43u8; 5 * MIB];

    {
        let db = EntityDb::open(config(dir.path())).unwrap();
        db.create_entity(&Context::background(), big_entity("big", content.clone()))
            .unwrap();
        db.close().unwrap();
    }

    let db = EntityDb::open(config(dir.path())).unwrap();
    let ctx = Context::background();

    let mut streamed = Vec::new();
    db.read_content(&ctx, "big", &mut streamed).unwrap();
    assert_eq!(streamed, content);
}

#[test]
fn deleted_parents_shed_their_chunks_at_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let db = EntityDb::open(config(dir.path())).unwrap();
    let ctx = Context::background();

    db.create_entity(&ctx, big_entity("doomed", vec![0x44u8; 5 * MIB]))
        .unwrap();
    db.create_entity(&ctx, big_entity("kept", vec![0x45u8; 5 * MIB]))
        .unwrap();

    // parent + 2 chunks, twice
    assert_eq!(db.stats().entity_count, 6);

    db.delete_entity(&ctx, "doomed").unwrap();
    db.checkpoint().unwrap();

    // doomed's chunks elided; the tombstoned parent itself survives
    assert_eq!(db.stats().entity_count, 4);
    assert!(!db.index().contains("doomed-chunk-0"));
    assert!(!db.index().contains("doomed-chunk-1"));

    let mut streamed = Vec::new();
    db.read_content(&ctx, "kept", &mut streamed).unwrap();
    assert_eq!(streamed.len(), 5 * MIB);
}
