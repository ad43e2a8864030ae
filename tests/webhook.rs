use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use gsm_orchestrator_lib::events::{
    payload, sign_payload, EventBus, EventKind, Transport, WebhookTransport, SIGNATURE_HEADER,
};

/// Accept one HTTP request, answer 200 and hand back the raw request text.
async fn serve_once(listener: TcpListener, tx: oneshot::Sender<String>) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if request_complete(&buf) {
            break;
        }
    }
    stream
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    stream.shutdown().await.unwrap();
    let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
}

fn request_complete(buf: &[u8]) -> bool {
    let text = String::from_utf8_lossy(buf);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return false;
    };
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    body.len() >= length
}

/// A loopback URL nothing listens on.
async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/hook", port)
}

#[tokio::test]
async fn unreachable_primary_falls_back_to_secondary() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let secondary = format!("http://{}/hook", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel();
    let server = tokio::spawn(serve_once(listener, tx));

    let transport = WebhookTransport::new(
        vec![dead_url().await, secondary],
        Some("s3cret".into()),
        Duration::from_secs(2),
        1,
    )
    .unwrap();
    let bus = EventBus::new(vec![Arc::new(transport) as Arc<dyn Transport>]);

    let deliveries = bus
        .emit(
            EventKind::InstanceVersionUpdated,
            "mc-0001",
            payload([("from", "1.2.0"), ("to", "1.3.0")]),
        )
        .await;

    assert_eq!(deliveries.len(), 1);
    assert!(deliveries[0].delivered, "{:?}", deliveries[0].error);

    let request = rx.await.unwrap();
    server.await.unwrap();
    let (head, body) = request.split_once("\r\n\r\n").unwrap();
    assert!(body.contains("\"event\":\"instance_version_updated\""));
    assert!(body.contains("\"to\":\"1.3.0\""));
    let expected = sign_payload("s3cret", body.as_bytes()).unwrap();
    assert!(head
        .lines()
        .any(|l| l.eq_ignore_ascii_case(&format!("{}: {}", SIGNATURE_HEADER, expected))));
}

#[tokio::test]
async fn all_destinations_down_is_reported_but_not_raised() {
    let transport = WebhookTransport::new(
        vec![dead_url().await, dead_url().await],
        None,
        Duration::from_millis(500),
        0,
    )
    .unwrap();
    let bus = EventBus::new(vec![Arc::new(transport) as Arc<dyn Transport>]);

    let deliveries = bus
        .emit(EventKind::InstanceStarted, "mc-0001", payload([]))
        .await;

    assert_eq!(deliveries.len(), 1);
    assert!(!deliveries[0].delivered);
    assert!(deliveries[0].error.is_some());
}
