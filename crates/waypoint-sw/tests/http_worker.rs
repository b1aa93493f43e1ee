//! The worker over a real HTTP fetcher and on-disk stores.

use std::sync::Arc;

use serde_json::json;
use url::Url;
use waypoint_core::{QueueKind, WorkerConfig, SYNC_SUBMISSIONS_TAG};
use waypoint_net::{HttpFetcher, LoaderConfig, Request};
use waypoint_test::ScriptedFetcher;
use waypoint_sw::{InstallOutcome, LogNotifier, OfflineWorker, SyncOutcome};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mock_platform() -> MockServer {
    let server = MockServer::start().await;
    for asset in ["/", "/index.html", "/manifest.json"] {
        Mock::given(method("GET"))
            .and(path(asset))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("asset {asset}")))
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/api/submissions"))
        .and(body_json(json!({"quiz": "q7", "answers": [2, 0, 1]})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    server
}

fn worker_for(config: &WorkerConfig) -> OfflineWorker {
    let fetcher = HttpFetcher::new(LoaderConfig::from_worker(config)).unwrap();
    OfflineWorker::new(config.clone(), Arc::new(fetcher), Arc::new(LogNotifier))
        .unwrap()
        .0
}

#[tokio::test]
async fn install_sync_and_restore_across_restarts() {
    let server = mock_platform().await;
    let data_dir = tempfile::tempdir().unwrap();
    let config = WorkerConfig {
        origin: Url::parse(&server.uri()).unwrap(),
        data_dir: data_dir.path().to_path_buf(),
        ..WorkerConfig::default()
    };

    {
        let worker = worker_for(&config);
        let outcome = worker.handle_install().await.unwrap();
        assert!(matches!(outcome, InstallOutcome::Activated(_)));

        worker
            .store()
            .enqueue(QueueKind::Submission, &json!({"quiz": "q7", "answers": [2, 0, 1]}))
            .unwrap();
    }

    let worker = worker_for(&config);
    assert_eq!(worker.store().pending(QueueKind::Submission).unwrap().len(), 1);

    assert_eq!(worker.active_version().await.as_deref(), Some("v1"));
    assert!(worker.resume().await.unwrap().is_none());

    let SyncOutcome::Drained(report) = worker.handle_sync(SYNC_SUBMISSIONS_TAG).await else {
        panic!("expected a drain");
    };
    assert!(report.is_clean());
    assert_eq!(report.delivered.len(), 1);

    // A restart without any network still serves the precached shell.
    let (offline, _events) = OfflineWorker::new(
        config.clone(),
        Arc::new(ScriptedFetcher::unreachable()),
        Arc::new(LogNotifier),
    )
    .unwrap();
    offline.resume().await.unwrap();
    let shell = offline
        .handle_fetch(Request::navigate(config.resolve("/index.html").unwrap()))
        .await
        .settle()
        .await
        .unwrap();
    assert!(shell.from_cache);
    assert_eq!(shell.text().unwrap(), "asset /index.html");
    assert!(offline.store().pending(QueueKind::Submission).unwrap().is_empty());
}
