#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use kvsync_store::{ConsulStore, StoreClient, StoreConfig, StoreError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A one-route Consul stand-in: every request gets the same status and body.
struct Canned {
    cfg: StoreConfig,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Canned {
    fn store(&self) -> ConsulStore { ConsulStore::new(&self.cfg).unwrap() }

    fn requests(&self) -> Vec<String> { self.seen.lock().unwrap().clone() }
}

async fn read_request(sock: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = sock.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf).into_owned();
        if let Some(end) = text.find("\r\n\r\n") {
            let len = text[..end]
                .lines()
                .find_map(|l| {
                    let l = l.to_ascii_lowercase();
                    l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                })
                .unwrap_or(0);
            if text.len() >= end + 4 + len {
                return text;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn serve(status: u16, body: &'static str) -> Canned {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            let req = read_request(&mut sock).await;
            log.lock().unwrap().push(req);
            let resp = format!(
                "HTTP/1.1 {} Canned\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = sock.write_all(resp.as_bytes()).await;
            let _ = sock.shutdown().await;
        }
    });
    let cfg = StoreConfig { port, timeout_ms: 2_000, ..Default::default() };
    Canned { cfg, seen }
}

#[tokio::test]
async fn get_reads_the_raw_value_and_sends_the_token() {
    let mut consul = serve(200, "x").await;
    consul.cfg.token = Some("s3cret".into());
    assert_eq!(consul.store().get("db/host").await.unwrap().as_deref(), Some("x"));

    let reqs = consul.requests();
    assert_eq!(reqs.len(), 1);
    assert!(reqs[0].starts_with("GET /v1/kv/db/host?raw=true HTTP/1.1\r\n"), "{}", reqs[0]);
    assert!(reqs[0].to_ascii_lowercase().contains("x-consul-token: s3cret"), "{}", reqs[0]);
}

#[tokio::test]
async fn not_found_is_absent_on_get_and_success_on_delete() {
    let consul = serve(404, "").await;
    let store = consul.store();
    assert_eq!(store.get("gone").await.unwrap(), None);
    store.delete("gone").await.unwrap();
    assert!(store.list("app/").await.unwrap().is_empty());
    assert!(consul.requests()[1].starts_with("DELETE /v1/kv/gone HTTP/1.1\r\n"));
}

#[tokio::test]
async fn put_sends_the_value_and_accepts_true() {
    let consul = serve(200, "true").await;
    consul.store().put("db/port", "5432").await.unwrap();

    let req = &consul.requests()[0];
    assert!(req.starts_with("PUT /v1/kv/db/port HTTP/1.1\r\n"), "{req}");
    assert!(req.ends_with("\r\n\r\n5432"), "{req}");
}

#[tokio::test]
async fn put_answered_false_is_a_write_error() {
    let consul = serve(200, "false").await;
    let err = consul.store().put("db/port", "5432").await.unwrap_err();
    assert_eq!(err, StoreError::Write { key: "db/port".into(), reason: "store rejected the write".into() });
}

#[tokio::test]
async fn server_errors_map_to_the_failing_operation() {
    let consul = serve(500, "boom").await;
    let store = consul.store();
    assert!(matches!(store.get("k").await, Err(StoreError::Read { ref key, .. }) if key == "k"));
    assert!(matches!(store.put("k", "v").await, Err(StoreError::Write { ref key, .. }) if key == "k"));
    assert!(matches!(store.delete("k").await, Err(StoreError::Delete { ref key, .. }) if key == "k"));
    assert!(matches!(store.list("app/").await, Err(StoreError::Read { ref key, .. }) if key == "app/"));
    assert_eq!(consul.requests().len(), 4);
}

#[tokio::test]
async fn recursive_list_decodes_base64_values() {
    let consul = serve(
        200,
        r#"[{"Key":"app/b","Value":"Mg=="},{"Key":"app/a","Value":"MQ=="},{"Key":"app/","Value":null}]"#,
    )
    .await;
    let listed = consul.store().list("app/").await.unwrap();
    assert_eq!(
        listed,
        vec![
            ("app/".to_string(), String::new()),
            ("app/a".to_string(), "1".to_string()),
            ("app/b".to_string(), "2".to_string()),
        ]
    );
    assert!(consul.requests()[0].starts_with("GET /v1/kv/app/?recurse=true HTTP/1.1\r\n"));
}

#[tokio::test]
async fn dot_segment_keys_never_reach_the_server() {
    let consul = serve(200, "true").await;
    let store = consul.store();
    assert!(matches!(store.put("app/../secret", "a").await, Err(StoreError::Write { .. })));
    assert!(matches!(store.get("app/./secret").await, Err(StoreError::Read { .. })));
    // cannot exist over HTTP, so deleting it is a no-op rather than a delete of `a`
    store.delete("a/..").await.unwrap();
    assert!(consul.requests().is_empty());
}

#[tokio::test]
async fn refused_connection_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let store = ConsulStore::new(&StoreConfig { port, timeout_ms: 2_000, ..Default::default() }).unwrap();
    let err = store.get("k").await.unwrap_err();
    assert!(err.is_connection(), "{err}");
    assert!(store.put("k", "v").await.unwrap_err().is_connection());
}
