use httpmock::prelude::*;
use httpmock::Method::HEAD;
use replica_cache::{
    CacheConfig, CacheError, CacheManager, CacheState, GetOptions, HttpRemoteConfig,
    HttpRemoteStore, RemoteStore,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn store_for(server: &MockServer, token: Option<&str>) -> HttpRemoteStore {
    let mut config = HttpRemoteConfig::new(server.base_url(), "demo");
    config.token = token.map(str::to_string);
    config.timeout = Some(Duration::from_secs(5));
    HttpRemoteStore::new(&config).unwrap()
}

#[test]
fn metadata_lookup_sends_token_and_maps_404_to_none() {
    init_tracing();
    let server = MockServer::start();
    let found = server.mock(|when, then| {
        when.method(GET)
            .path("/projects/demo/files/metadata")
            .query_param("key", "datasets/a.txt")
            .header("authorization", "Bearer s3cret");
        then.status(200).json_body(json!({
            "key": "datasets/a.txt",
            "version": 2,
            "size": 5,
            "metadata": { "owner": "ml" }
        }));
    });
    let missing = server.mock(|when, then| {
        when.method(GET)
            .path("/projects/demo/files/metadata")
            .query_param("key", "datasets/missing.txt");
        then.status(404);
    });

    let store = store_for(&server, Some("s3cret"));
    let meta = store.metadata("datasets/a.txt").unwrap().unwrap();
    assert_eq!((meta.version, meta.size), (2, 5));
    assert_eq!(meta.metadata.get("owner").map(String::as_str), Some("ml"));
    assert!(store.metadata("datasets/missing.txt").unwrap().is_none());

    found.assert();
    missing.assert();
}

#[test]
fn download_upload_list_and_delete_use_project_endpoints() {
    init_tracing();
    let server = MockServer::start();
    let download = server.mock(|when, then| {
        when.method(GET)
            .path("/projects/demo/files/download")
            .query_param("key", "datasets/a.txt")
            .query_param("version", "2");
        then.status(200).body("hello");
    });
    let upload = server.mock(|when, then| {
        when.method(POST)
            .path("/projects/demo/files/upload")
            .query_param("key", "datasets/a.txt")
            .header("x-replica-meta-owner", "ml")
            .body("hello!");
        then.status(200).json_body(json!({
            "key": "datasets/a.txt",
            "version": 3,
            "size": 6
        }));
    });
    let list = server.mock(|when, then| {
        when.method(GET)
            .path("/projects/demo/files/list")
            .query_param("prefix", "datasets/");
        then.status(200).json_body(json!([
            { "key": "datasets/a.txt", "version": 3, "size": 6 },
            { "key": "datasets/b.txt", "version": 1, "size": 1 }
        ]));
    });
    let delete = server.mock(|when, then| {
        when.method(DELETE)
            .path("/projects/demo/files")
            .query_param("key", "datasets/a.txt")
            .query_param("keep_latest_version", "true");
        then.status(204);
    });

    let store = store_for(&server, None);

    let mut body = String::new();
    let stream = store.download("datasets/a.txt", Some(2)).unwrap();
    assert_eq!(stream.size, Some(5));
    let mut reader = stream.reader;
    reader.read_to_string(&mut body).unwrap();
    assert_eq!(body, "hello");

    let mut metadata = BTreeMap::new();
    metadata.insert("owner".to_string(), "ml".to_string());
    let uploaded = store
        .upload("datasets/a.txt", &mut &b"hello!"[..], 6, &metadata)
        .unwrap();
    assert_eq!(uploaded.version, 3);
    assert!(uploaded.metadata.is_empty());

    let files = store.list("datasets/").unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[1].key, "datasets/b.txt");

    store.delete("datasets/a.txt", None, true).unwrap();

    download.assert();
    upload.assert();
    list.assert();
    delete.assert();
}

#[test]
fn server_errors_do_not_leak_credentials() {
    init_tracing();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/projects/demo/files/metadata");
        then.status(500);
    });

    let store = store_for(&server, Some("s3cret"));
    let err = store.metadata("datasets/a.txt").unwrap_err();
    assert!(matches!(err, CacheError::Transfer { .. }), "{err:?}");
    let message = err.to_string();
    assert!(message.contains("500"), "{message}");
    assert!(!message.contains("s3cret"), "{message}");
}

#[test]
fn manager_downloads_through_http_store() {
    init_tracing();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET)
            .path("/projects/demo/files/metadata")
            .query_param("key", "models/m.bin");
        then.status(200)
            .json_body(json!({ "key": "models/m.bin", "version": 4, "size": 3 }));
    });
    let download = server.mock(|when, then| {
        when.method(GET)
            .path("/projects/demo/files/download")
            .query_param("key", "models/m.bin")
            .query_param("version", "4");
        then.status(200).body("abc");
    });

    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn RemoteStore> = Arc::new(store_for(&server, None));
    let manager = CacheManager::new(CacheConfig::new(tmp.path(), "demo"), Some(store));

    let first = manager.get_file("models/m.bin", GetOptions::default()).unwrap();
    assert_eq!(first.state, CacheState::LocalMissing);
    assert_eq!(first.path, manager.project_folder().join("models/m.bin.v4"));
    assert_eq!(std::fs::read(&first.path).unwrap(), b"abc");

    let second = manager.get_file("models/m.bin", GetOptions::default()).unwrap();
    assert_eq!(second.state, CacheState::LocalFresh);
    download.assert_hits(1);
}

#[test]
fn url_keys_bypass_versioning_and_reuse_same_size_files() {
    init_tracing();
    let server = MockServer::start();
    let csv = server.mock(|when, then| {
        when.method(GET).path("/public/iris.csv");
        then.status(200).body("a,b\n1,2\n");
    });
    let head = server.mock(|when, then| {
        when.method(HEAD).path("/public/iris.csv");
        then.status(200).body("a,b\n1,2\n");
    });

    let tmp = tempfile::tempdir().unwrap();
    let manager = CacheManager::new(CacheConfig::new(tmp.path(), "demo"), None);
    let url = server.url("/public/iris.csv");

    let first = manager.get_file(&url, GetOptions::default()).unwrap();
    assert!(first.downloaded);
    assert_eq!(first.state, CacheState::LocalMissing);
    assert_eq!(first.key, "iris.csv");
    assert_eq!(first.path, manager.project_folder().join("iris.csv"));
    assert_eq!(first.version, None);

    let mut updates = Vec::new();
    let second = manager
        .get_file_with_progress(&url, GetOptions::default(), &mut |done, total| {
            updates.push((done, total))
        })
        .unwrap();
    assert!(!second.downloaded);
    assert_eq!(second.state, CacheState::LocalFresh);
    assert!(updates.is_empty());

    let forced = manager
        .get_file(&url, GetOptions::default().force_download())
        .unwrap();
    assert!(forced.downloaded);
    assert_eq!(forced.state, CacheState::LocalStale);
    // The reuse was settled by HEAD alone; forced downloads skip it.
    head.assert_hits(1);
    csv.assert_hits(2);
}

#[test]
fn url_reuse_opens_no_download_when_sizes_match() {
    init_tracing();
    let server = MockServer::start();
    let get = server.mock(|when, then| {
        when.method(GET).path("/weights.bin");
        then.status(200).body("0123456789");
    });
    let head = server.mock(|when, then| {
        when.method(HEAD).path("/weights.bin");
        then.status(200).body("0123456789");
    });

    let tmp = tempfile::tempdir().unwrap();
    let manager = CacheManager::new(CacheConfig::new(tmp.path(), "demo"), None);
    let local = manager.project_folder().join("weights.bin");
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, b"9876543210").unwrap();

    let resolved = manager
        .get_file(&server.url("/weights.bin"), GetOptions::default())
        .unwrap();
    assert!(!resolved.downloaded);
    assert_eq!(resolved.state, CacheState::LocalFresh);
    assert_eq!(std::fs::read(&local).unwrap(), b"9876543210");
    head.assert_hits(1);
    assert_eq!(get.hits(), 0);
}

#[test]
fn url_size_mismatch_downloads_again() {
    init_tracing();
    let server = MockServer::start();
    let get = server.mock(|when, then| {
        when.method(GET).path("/weights.bin");
        then.status(200).body("0123456789");
    });
    server.mock(|when, then| {
        when.method(HEAD).path("/weights.bin");
        then.status(200).body("0123456789");
    });

    let tmp = tempfile::tempdir().unwrap();
    let manager = CacheManager::new(CacheConfig::new(tmp.path(), "demo"), None);
    let local = manager.project_folder().join("weights.bin");
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, b"short").unwrap();

    let resolved = manager
        .get_file(&server.url("/weights.bin"), GetOptions::default())
        .unwrap();
    assert!(resolved.downloaded);
    assert_eq!(resolved.state, CacheState::LocalStale);
    assert_eq!(std::fs::read(&local).unwrap(), b"0123456789");
    get.assert_hits(1);
}
