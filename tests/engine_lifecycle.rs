use std::sync::Arc;
use std::time::Duration;

use tapline_core::api::{EventSink, ProxyEngine, ProxyEvent};
use tapline_core::config::EngineConfig;
use tapline_core::error::EngineError;
use tapline_core::models::{MockRule, RequestRecord};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

fn channel_sink() -> (Arc<dyn EventSink>, mpsc::UnboundedReceiver<ProxyEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn EventSink> = Arc::new(move |event: ProxyEvent| {
        let _ = tx.send(event);
    });
    (sink, rx)
}

async fn next_terminal(rx: &mut mpsc::UnboundedReceiver<ProxyEvent>) -> RequestRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await.expect("sink closed") {
                ProxyEvent::Request(record) if !record.partial_update => return record,
                _ => continue,
            }
        }
    })
    .await
    .expect("terminal record in time")
}

/// Origin that answers a single HTTP request with `response`.
async fn one_shot_origin(response: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut seen = Vec::new();
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            seen.extend_from_slice(&buf[..n]);
        }
        socket.write_all(response).await.unwrap();
    });
    port
}

async fn send_through_proxy(proxy_port: u16, request: String) -> String {
    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut response))
        .await
        .expect("response in time")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_stop_transitions_state() {
    let storage_dir = tempfile::tempdir().unwrap();
    let engine = ProxyEngine::new(EngineConfig::with_storage_dir(storage_dir.path()));
    assert!(!engine.is_running());

    let (sink, _rx) = channel_sink();
    let port = engine.start(0, sink.clone()).await.expect("proxy starts");
    assert_ne!(port, 0);
    assert!(engine.is_running());
    assert_eq!(engine.port(), Some(port));
    assert!(engine.cert_path().exists());

    match engine.start(0, sink).await {
        Err(EngineError::AlreadyRunning(p)) => assert_eq!(p, port),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    assert!(engine.stop().await);
    assert!(!engine.is_running());
    assert_eq!(engine.port(), None);
    assert!(!engine.stop().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_fails_when_ca_material_is_corrupt() {
    let storage_dir = tempfile::tempdir().unwrap();
    std::fs::write(storage_dir.path().join("tapline_ca.pem"), "not a certificate").unwrap();
    std::fs::write(storage_dir.path().join("tapline_ca.key"), "not a key").unwrap();

    let engine = ProxyEngine::new(EngineConfig::with_storage_dir(storage_dir.path()));
    let (sink, _rx) = channel_sink();
    assert!(matches!(
        engine.start(0, sink).await,
        Err(EngineError::Certificate(_))
    ));
    assert!(!engine.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxies_plain_http_to_local_origin() {
    let storage_dir = tempfile::tempdir().unwrap();
    let engine = ProxyEngine::new(EngineConfig::with_storage_dir(storage_dir.path()));
    let (sink, mut rx) = channel_sink();
    let proxy_port = engine.start(0, sink).await.unwrap();

    let origin_port = one_shot_origin(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
    )
    .await;
    let response = send_through_proxy(
        proxy_port,
        format!(
            "GET http://127.0.0.1:{origin_port}/greeting HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\nConnection: close\r\n\r\n"
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("hello"));

    let record = next_terminal(&mut rx).await;
    assert_eq!(record.url, format!("http://127.0.0.1:{origin_port}/greeting"));
    assert_eq!(record.status_code, 200);
    assert_eq!(record.response_body, "hello");
    assert!(record.finished_at.is_some());

    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mock_rule_answers_for_unreachable_host() {
    let storage_dir = tempfile::tempdir().unwrap();
    let engine = ProxyEngine::new(EngineConfig::with_storage_dir(storage_dir.path()));
    let (sink, mut rx) = channel_sink();
    let proxy_port = engine.start(0, sink).await.unwrap();

    engine
        .add_rule(MockRule {
            id: String::new(),
            enabled: true,
            url_pattern: "http://mock.invalid/*".into(),
            method: None,
            conditions: Vec::new(),
            status: 200,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: "{\"mocked\":true}".into(),
            delay_ms: 0,
        })
        .unwrap();

    let response = send_through_proxy(
        proxy_port,
        "GET http://mock.invalid/users HTTP/1.1\r\nHost: mock.invalid\r\nConnection: close\r\n\r\n"
            .to_string(),
    )
    .await;
    assert!(response.ends_with("{\"mocked\":true}"), "{response}");

    let record = next_terminal(&mut rx).await;
    assert!(record.mocked);

    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_is_tunneled_when_mitm_is_disabled() {
    let storage_dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::with_storage_dir(storage_dir.path());
    config.mitm_enabled = false;
    let engine = ProxyEngine::new(config);
    let (sink, _rx) = channel_sink();
    let proxy_port = engine.start(0, sink).await.unwrap();

    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_port = echo.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let (mut reader, mut writer) = socket.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{echo_port} HTTP/1.1\r\nHost: 127.0.0.1:{echo_port}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut head = [0u8; 39];
    client.read_exact(&mut head).await.unwrap();
    assert_eq!(&head[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

    client.write_all(b"opaque bytes").await.unwrap();
    let mut echoed = [0u8; 12];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"opaque bytes");

    engine.stop().await;
}
