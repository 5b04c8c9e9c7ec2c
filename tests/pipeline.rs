//! End-to-end: page events through a session into a file-backed record.

use scriptsift::discovery::{DocumentSnapshot, PageEvent, PageSession, WatchSettings};
use scriptsift::merger::DomainRecordMerger;
use scriptsift::service::{Message, RecordService, Reply};
use scriptsift::store::{FileStore, MemoryStore, RecordStore};
use scriptsift::{ScanConfig, Scanner, ScriptSource};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const PAGE: &str = r#"<!doctype html>
<html>
  <head>
    <meta http-equiv="Content-Security-Policy" content="script-src 'self' 'unsafe-eval'">
    <script src="/a.js"></script>
    <script src="/b.js"></script>
  </head>
  <body>
    <script>var x = "1 + 1"; eval(x);</script>
  </body>
</html>"#;

async fn run_session<S: RecordStore>(service: Arc<RecordService<S>>, events: Vec<PageEvent>) {
    let session = PageSession::new(service, &WatchSettings::default());
    let (tx, rx) = mpsc::channel(events.len() + 1);
    for event in events {
        tx.send(event).await.unwrap();
    }
    drop(tx);
    session.run(rx).await;
}

#[tokio::test]
async fn test_scan_persist_and_rescan_unchanged_page() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(RecordService::new(DomainRecordMerger::new(FileStore::new(dir.path()))));
    let snapshot = DocumentSnapshot::new("https://shop.example/", PAGE);

    run_session(service.clone(), vec![PageEvent::Ready(snapshot.clone()), PageEvent::Flush]).await;

    let record = service.record("shop.example").await.unwrap().unwrap();
    let urls: Vec<_> = record.files.iter().map(|f| f.url.as_str()).collect();
    assert_eq!(urls, vec!["https://shop.example/a.js", "https://shop.example/b.js"]);
    assert!(record.files.iter().all(|f| f.source == ScriptSource::Dom));
    assert_eq!(record.inlines.len(), 1);
    assert!(record.inlines[0].suspicious_signals.contains("eval"));
    assert_eq!(record.csp.as_deref(), Some("script-src 'self' 'unsafe-eval'"));
    assert_eq!(record.metadata.total_files, 2);
    assert_eq!(record.metadata.total_inlines, 1);

    // A fresh session over the unchanged page adds nothing.
    run_session(service.clone(), vec![PageEvent::Ready(snapshot), PageEvent::Flush]).await;

    let again = service.record("shop.example").await.unwrap().unwrap();
    assert_eq!(again.files, record.files);
    assert_eq!(again.inlines, record.inlines);
    assert_eq!(again.csp, record.csp);
}

#[tokio::test]
async fn test_legacy_file_record_is_upgraded_then_extended() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    store
        .set("shop.example", json!(["https://shop.example/old.js"]))
        .await
        .unwrap();

    let service = Arc::new(RecordService::new(DomainRecordMerger::new(store)));
    run_session(
        service.clone(),
        vec![
            PageEvent::Ready(DocumentSnapshot::new("https://shop.example/", PAGE)),
            PageEvent::Flush,
        ],
    )
    .await;

    let record = service.record("shop.example").await.unwrap().unwrap();
    assert_eq!(record.files.len(), 3);
    assert_eq!(record.files[0].url, "https://shop.example/old.js");
    assert_eq!(record.files[0].source, ScriptSource::Legacy);

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("shop.example.json")).unwrap()).unwrap();
    assert!(raw.is_object());
    assert_eq!(raw["metadata"]["totalFiles"], 3);
}

#[tokio::test]
async fn test_query_and_clear_messages() {
    let service = RecordService::new(DomainRecordMerger::new(MemoryStore::new()));
    let message = Message::from_json(
        r#"{"type": "discovery", "domain": "shop.example",
            "urls": [{"url": "https://cdn.example/lib.js", "source": "network"}],
            "sri": [{"url": "https://cdn.example/lib.js", "integrity": "sha384-abc", "algorithm": "sha384"}]}"#,
    )
    .unwrap();
    assert!(matches!(service.handle(message).await.unwrap(), Reply::Merged { .. }));

    let record = service.record("shop.example").await.unwrap().unwrap();
    assert_eq!(record.files[0].domain, "cdn.example");
    assert_eq!(record.sri.len(), 1);

    service
        .handle(Message::from_json(r#"{"type": "clear", "domain": "shop.example"}"#).unwrap())
        .await
        .unwrap();
    assert!(service.record("shop.example").await.unwrap().is_none());
}

#[tokio::test]
async fn test_scanner_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(PAGE),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = ScanConfig {
        json: true,
        quiet: true,
        max_retries: 0,
        ..Default::default()
    };
    let scanner = Scanner::new(&config, FileStore::new(dir.path()), false).unwrap();

    let report = scanner.scan(&server.uri()).await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.domain.as_deref(), Some("127.0.0.1"));
    assert_eq!(report.writes, 1);
    let record = report.record.unwrap();
    assert_eq!(record.files.len(), 2);
    assert_eq!(record.inlines.len(), 1);

    let rescan = scanner.scan(&server.uri()).await;
    assert_eq!(rescan.record.unwrap().files.len(), 2);
}
