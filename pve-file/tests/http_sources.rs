//! URL sources against a local HTTP server.

use std::net::SocketAddr;

use axum::Router;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::oneshot;

use pve_file::drift;
use pve_file::source::{self, SourceDescriptor, SourceFile};
use pve_file::{ErrorKind, FileError};

const BODY: &[u8] = b"not really an iso image";
const LAST_MODIFIED: &str = "Mon, 15 Jan 2024 10:30:00 GMT";
const ETAG: &str = "\"5f1a-abc123\"";

struct TestServer {
    base_url: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let app = Router::new().route("/images/debian.iso", get(get_file).head(head_file));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Self {
            base_url: format!("http://{addr}"),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn file_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::LAST_MODIFIED, HeaderValue::from_static(LAST_MODIFIED));
    headers.insert(header::ETAG, HeaderValue::from_static(ETAG));
    headers
}

async fn get_file() -> impl IntoResponse {
    (StatusCode::OK, file_headers(), BODY)
}

async fn head_file() -> impl IntoResponse {
    let mut headers = file_headers();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(BODY.len()));
    (StatusCode::OK, headers, Bytes::new())
}

fn url_source(url: String, checksum: Option<String>) -> SourceDescriptor {
    SourceDescriptor::File(SourceFile {
        path: url,
        checksum,
        ..Default::default()
    })
}

fn entries(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path()).unwrap().count()
}

#[tokio::test]
async fn test_download_with_checksum() {
    let server = TestServer::start().await;
    let tmp = TempDir::new().unwrap();

    let checksum = hex::encode(Sha256::digest(BODY)).to_uppercase();
    let source = url_source(server.url("/images/debian.iso"), Some(checksum));

    let artifact = source::resolve(&source, tmp.path()).await.unwrap();
    assert!(artifact.is_temporary());
    assert_eq!(artifact.file_name, "debian.iso");
    assert_eq!(std::fs::read(&artifact.path).unwrap(), BODY);
    assert_eq!(entries(&tmp), 1);

    drop(artifact);
    assert_eq!(entries(&tmp), 0);
}

#[tokio::test]
async fn test_download_checksum_mismatch_removes_temp_file() {
    let server = TestServer::start().await;
    let tmp = TempDir::new().unwrap();

    let source = url_source(server.url("/images/debian.iso"), Some("ab".repeat(32)));
    let err = source::resolve(&source, tmp.path()).await.unwrap_err();

    match err {
        FileError::ChecksumMismatch {
            ref computed,
            ref expected,
        } => {
            assert_eq!(computed, &hex::encode(Sha256::digest(BODY)));
            assert_eq!(expected, &"ab".repeat(32));
        }
        ref other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert_eq!(entries(&tmp), 0);
}

#[tokio::test]
async fn test_download_not_found() {
    let server = TestServer::start().await;
    let tmp = TempDir::new().unwrap();

    let source = url_source(server.url("/images/missing.iso"), None);
    let err = source::resolve(&source, tmp.path()).await.unwrap_err();

    assert!(matches!(err, FileError::DownloadFailed { .. }));
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(entries(&tmp), 0);
}

#[tokio::test]
async fn test_download_file_name_override() {
    let server = TestServer::start().await;
    let tmp = TempDir::new().unwrap();

    let source = SourceDescriptor::File(SourceFile {
        path: server.url("/images/debian.iso?mirror=1"),
        file_name: Some("debian-12.5.0-amd64-netinst.iso".to_string()),
        ..Default::default()
    });

    let artifact = source::resolve(&source, tmp.path()).await.unwrap();
    assert_eq!(artifact.file_name, "debian-12.5.0-amd64-netinst.iso");
}

#[tokio::test]
async fn test_observe_url_metadata() {
    let server = TestServer::start().await;

    let observed = drift::observe(&SourceFile {
        path: server.url("/images/debian.iso"),
        ..Default::default()
    })
    .await
    .unwrap();

    assert_eq!(observed.size, BODY.len() as i64);
    assert_eq!(observed.modification_date, "2024-01-15T10:30:00Z");
    assert_eq!(observed.tag, "5f1a-abc123");
    assert!(observed.is_complete());

    // Same resource observed twice is not a change.
    let again = drift::observe(&SourceFile {
        path: server.url("/images/debian.iso"),
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(!drift::has_changed(&observed, &again));
}

#[tokio::test]
async fn test_observe_url_not_found() {
    let server = TestServer::start().await;

    let err = drift::observe(&SourceFile {
        path: server.url("/images/missing.iso"),
        ..Default::default()
    })
    .await
    .unwrap_err();

    assert!(matches!(err, FileError::MetadataFailed { .. }));
    assert_eq!(err.kind(), ErrorKind::Transport);
}
