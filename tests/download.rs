mod common;

use common::{init_logging, Reply, TestServer};
use sandstrap::{errors::LayerError, layer::Downloader};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::runtime::Runtime;

fn downloader() -> Downloader {
    Downloader::new(Duration::from_secs(5), Duration::from_secs(5)).unwrap()
}

#[test]
fn progress_ends_at_one() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let server = TestServer::start().await;
        server.route("/layer.tar.gz", Reply::ok(vec![7u8; 100]));
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("layer.tar.gz");

        let mut reports = Vec::new();
        let received = downloader()
            .download(&server.url("/layer.tar.gz"), &dest, 100, None, |f| reports.push(f))
            .await
            .unwrap();

        assert_eq!(received, 100);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 100]);
        assert_eq!(*reports.last().unwrap(), 1.0);
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
    })
}

#[test]
fn follows_redirects() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let server = TestServer::start().await;
        server.route("/release/base.tar.gz", Reply::redirect("/cdn/base.tar.gz"));
        server.route("/cdn/base.tar.gz", Reply::redirect(&server.url("/objects/abc")));
        server.route("/objects/abc", Reply::ok("layer bytes"));
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("base.tar.gz");

        downloader()
            .download(&server.url("/release/base.tar.gz"), &dest, 0, None, |_| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "layer bytes");
        assert_eq!(server.hits(), 3);
    })
}

#[test]
fn redirect_loop_is_cut_short() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let server = TestServer::start().await;
        server.route("/loop", Reply::redirect("/loop"));
        let dir = tempfile::tempdir().unwrap();

        let result = downloader()
            .download(&server.url("/loop"), &dir.path().join("x"), 0, None, |_| {})
            .await;
        assert!(matches!(result, Err(LayerError::TooManyRedirects(_))));
        assert_eq!(server.hits(), sandstrap::layer::MAX_REDIRECTS + 1);
    })
}

#[test]
fn http_errors() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let server = TestServer::start().await;
        server.route("/gone", Reply::status(500));
        let dir = tempfile::tempdir().unwrap();

        match downloader()
            .download(&server.url("/gone"), &dir.path().join("x"), 0, None, |_| {})
            .await
        {
            Err(LayerError::HttpStatus { status, .. }) => assert_eq!(status, 500),
            other => panic!("unexpected {:?}", other),
        }
        match downloader()
            .download(&server.url("/nowhere"), &dir.path().join("y"), 0, None, |_| {})
            .await
        {
            Err(LayerError::HttpStatus { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected {:?}", other),
        }
    })
}

#[test]
fn digest_is_checked() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let server = TestServer::start().await;
        server.route("/layer", Reply::ok("expected content"));
        let good: String = Sha256::digest(b"expected content")
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("layer");

        downloader()
            .download(&server.url("/layer"), &dest, 0, Some(&good.to_uppercase()), |_| {})
            .await
            .unwrap();

        let bad = "0".repeat(64);
        match downloader()
            .download(&server.url("/layer"), &dest, 0, Some(&bad), |_| {})
            .await
        {
            Err(LayerError::ContentDigestMismatch { expected, found }) => {
                assert_eq!(expected, bad);
                assert_eq!(found, good);
            }
            other => panic!("unexpected {:?}", other),
        }
    })
}
