//! Data server and request client over loopback TCP
//!
//! Run with: cargo test -p pipestream-data --test peer_exchange

use serde_json::json;
use std::time::Duration;
use tokio::net::TcpListener;

use pipestream_core::config::DataServerConfig;
use pipestream_data::{DataError, DataRequest, DataServer, ErrorCode, ItemReply};

async fn server() -> DataServer {
    let config = DataServerConfig {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port: 0,
        max_cache_size: 2,
        ..DataServerConfig::default()
    };
    DataServer::listen(&config).await.unwrap()
}

#[tokio::test]
async fn test_fetch_whole_result_and_path() {
    let server = server().await;
    let address = server.local_addr().to_string();
    server.set_sending_state("t1", json!({ "frames": [{ "id": 3 }], "meta": null }));

    let whole = DataRequest::single(&address, "t1", None).fetch().await.unwrap();
    assert_eq!(whole["frames"][0]["id"], json!(3));

    let id = DataRequest::single(&address, "t1", Some("frames.0.id"))
        .fetch()
        .await
        .unwrap();
    assert_eq!(id, json!(3));

    // A present null is data, not a missing path
    let meta = DataRequest::single(&address, "t1", Some("meta"))
        .fetch()
        .await
        .unwrap();
    assert!(meta.is_null());

    let err = DataRequest::single(&address, "t1", Some("frames.4"))
        .fetch()
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Server { code: ErrorCode::NoSuchDataPath, .. }));

    assert!(!server.is_serving());
    server.wait_till_serving_is_done().await;
    server.close().await;
}

#[tokio::test]
async fn test_unknown_and_evicted_tasks_are_not_available() {
    let server = server().await;
    let address = server.local_addr().to_string();
    server.set_sending_state("t1", json!(1));
    server.set_sending_state("t2", json!(2));
    server.set_sending_state("t3", json!(3));

    let err = DataRequest::single(&address, "t1", None)
        .fetch()
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Server { code: ErrorCode::NotAvailable, .. }));

    let items = DataRequest::batch(&address, vec!["t2".to_string(), "t3".to_string(), "t9".to_string()], None)
        .fetch_items()
        .await
        .unwrap();
    assert_eq!(items[0], ItemReply::Data(json!(2)));
    assert_eq!(items[1], ItemReply::Data(json!(3)));
    assert!(items[2].is_error());
    server.close().await;
}

#[tokio::test]
async fn test_unreachable_peer() {
    // Grab a free port, then release it so nothing listens there
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = DataRequest::single(format!("127.0.0.1:{port}"), "t1", None)
        .with_timeouts(Duration::from_millis(200), Duration::from_secs(5))
        .fetch()
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Unreachable { .. }), "{err}");
}

#[tokio::test]
async fn test_silent_peer_times_out_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // Hold the connection open without replying
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(stream);
    });

    let err = DataRequest::single(&address, "t1", None)
        .with_timeouts(Duration::from_millis(500), Duration::from_millis(100))
        .fetch()
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::RequestTimeout { .. }), "{err}");
    accept.abort();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let server = server().await;
    let address = server.local_addr().to_string();
    server.close().await;
    server.close().await;

    let err = DataRequest::single(&address, "t1", None)
        .with_timeouts(Duration::from_millis(200), Duration::from_millis(200))
        .fetch()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DataError::Unreachable { .. } | DataError::Io(_) | DataError::RequestTimeout { .. }
    ));
}
