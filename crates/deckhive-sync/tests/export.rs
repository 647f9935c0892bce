use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use deckhive_core::{Entry, Group, Record};
use deckhive_storage::{BlobStore, MemoryBlobStore};
use deckhive_sync::{collection_key, ExportPass, SyncConfig};
use tokio_util::sync::CancellationToken;

const PREFIX: &str = "pokemon/limitless";

fn deck(id: &str, cards: &[(&str, u32)]) -> Record {
    Record {
        id: id.to_string(),
        url: format!("https://limitless.example/decks/{id}"),
        source: "limitless-web".to_string(),
        release_date: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single(),
        groups: vec![Group::new(
            "Pokemon",
            cards.iter().map(|(name, count)| Entry::new(*name, *count)).collect(),
        )],
        ..Default::default()
    }
}

async fn put(store: &dyn BlobStore, record: &Record) {
    store
        .write(
            &collection_key(PREFIX, &record.id),
            &serde_json::to_vec(record).expect("encode"),
        )
        .await
        .expect("write");
}

#[tokio::test]
async fn export_flattens_changed_records_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let config = SyncConfig {
        prefix: PREFIX.to_string(),
        parallel: 4,
        export_dir: Some(dir.path().join("parquet")),
        ..SyncConfig::default()
    };
    put(store.as_ref(), &deck("lim-1", &[("Charizard ex", 3), ("Pidgeot ex", 2)])).await;
    put(store.as_ref(), &deck("lim-2", &[("Gardevoir ex", 3)])).await;
    // Not a collection; ignored by the replay.
    store
        .write("pokemon/limitless/.export_tracker.json", b"{}")
        .await
        .expect("seed tracker");

    let cancel = CancellationToken::new();
    let first = ExportPass::new(config.clone(), Arc::clone(&store))
        .run(&cancel)
        .await
        .expect("first export");
    assert_eq!(first.exported, 2);
    assert_eq!(first.rows, 3);
    let jsonl_key = first.jsonl_key.clone().expect("jsonl written");
    assert!(jsonl_key.starts_with("pokemon/limitless/exports/"));
    let jsonl = store.read(&jsonl_key).await.expect("read jsonl");
    let lines: Vec<serde_json::Value> = jsonl
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).expect("row"))
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["deck_id"], "lim-1");
    assert_eq!(lines[0]["name"], "Charizard ex");
    assert!(first.parquet_path.as_ref().expect("parquet").exists());

    let second = ExportPass::new(config.clone(), Arc::clone(&store))
        .run(&cancel)
        .await
        .expect("second export");
    assert_eq!(second.exported, 0);
    assert_eq!(second.skipped, 2);
    assert!(second.jsonl_key.is_none());

    let mut revised = deck("lim-2", &[("Gardevoir ex", 2), ("Kirlia", 4)]);
    revised.updated_at = Some(Utc::now() + Duration::minutes(5));
    revised.version = Some(2);
    put(store.as_ref(), &revised).await;

    let pass = ExportPass::new(config, Arc::clone(&store));
    let third = pass.run(&cancel).await.expect("third export");
    assert_eq!(third.exported, 1);
    assert_eq!(third.skipped, 1);
    assert_eq!(third.rows, 2);
    assert_eq!(pass.tracker().stats(), (2, 2));
}

#[tokio::test]
async fn cancelled_export_marks_nothing() {
    let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    put(store.as_ref(), &deck("lim-1", &[("Lugia V", 4)])).await;
    let config = SyncConfig {
        prefix: PREFIX.to_string(),
        parallel: 2,
        ..SyncConfig::default()
    };

    let cancel = CancellationToken::new();
    cancel.cancel();
    let pass = ExportPass::new(config, Arc::clone(&store));
    assert!(pass.run(&cancel).await.is_err());
    assert_eq!(pass.tracker().stats().0, 0);
    assert!(store.list_prefix("pokemon/limitless/exports/").await.expect("list").is_empty());
}
