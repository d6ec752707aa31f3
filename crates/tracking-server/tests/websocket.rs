//! End-to-end tests against a real listener with a WebSocket client.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracking_hub::{ConnectionRegistry, ResourceKey, ScanType};
use tracking_server::{
    serve_on, Brokers, DeliveryNotifier, LogMailer, ServerConfig, TrackingService,
};

const SETTLE: Duration = Duration::from_secs(5);

struct Server {
    addr: SocketAddr,
    registry: ConnectionRegistry,
    notifier: DeliveryNotifier,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Server {
    async fn start(brokers: Brokers, heartbeat_secs: u64) -> Self {
        let mut config = ServerConfig::from_lookup(|_| None).unwrap();
        config.heartbeat_timeout = Duration::from_secs(heartbeat_secs);
        config.block_timeout = Duration::from_millis(50);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let service = TrackingService::new(config, brokers, Arc::new(LogMailer));
        let registry = service.registry().clone();
        let notifier = service.notifier().clone();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            serve_on(listener, service, async move {
                let _ = stopped.await;
            })
            .await
            .unwrap();
        });

        Self {
            addr,
            registry,
            notifier,
            stop: Some(stop),
            task,
        }
    }

    fn url(&self, delivery_id: u64) -> String {
        format!("ws://{}/ws/track/{delivery_id}", self.addr)
    }

    async fn wait_for_viewers(&self, delivery_id: u64, count: usize) {
        let key = ResourceKey::from(delivery_id);
        wait_until(|| self.registry.subscriber_count(&key) == count).await;
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(SETTLE, self.task).await.unwrap().unwrap();
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(SETTLE, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

type Client =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(url: &str) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    client
}

/// Next text frame, answering nothing and skipping pings.
async fn next_text(client: &mut Client) -> serde_json::Value {
    tokio::time::timeout(SETTLE, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("stream ended: {other:?}"),
            }
        }
    })
    .await
    .unwrap()
}

/// Read until the server closes the socket.
async fn expect_closed(client: &mut Client) {
    tokio::time::timeout(SETTLE, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("server did not close the socket");
}

#[tokio::test]
async fn viewer_receives_scan_events() {
    let server = Server::start(Brokers::in_memory(), 30).await;
    let mut client = connect(&server.url(42)).await;
    server.wait_for_viewers(42, 1).await;
    wait_until(|| server.registry.has_forwarder(&ResourceKey::from(42u64))).await;

    // The forwarder may still be attaching to the broker; retry until it lands.
    let received = tokio::time::timeout(SETTLE, async {
        loop {
            if server.notifier.scan_updated(42, ScanType::Out, "Hub A").await.unwrap() > 0 {
                return next_text(&mut client).await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(received["event"], "scan.updated");
    assert_eq!(received["delivery_id"], 42);
    assert_eq!(received["event_type"], "OUT");
    assert_eq!(received["location"], "Hub A");

    server.stop().await;
}

#[tokio::test]
async fn two_instances_share_events_through_the_broker() {
    let brokers = Brokers::in_memory();
    let a = Server::start(brokers.clone(), 30).await;
    let b = Server::start(brokers, 30).await;

    let mut viewer_a = connect(&a.url(7)).await;
    let mut viewer_b = connect(&b.url(7)).await;
    a.wait_for_viewers(7, 1).await;
    b.wait_for_viewers(7, 1).await;

    // Both instances' forwarders must be attached before publishing.
    tokio::time::timeout(SETTLE, async {
        while a.notifier.status_changed(7, "PROBE", None).await.unwrap() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    a.notifier
        .status_changed(7, "DELIVERED", Some("IN_TRANSIT".into()))
        .await
        .unwrap();

    for viewer in [&mut viewer_a, &mut viewer_b] {
        loop {
            let event = next_text(viewer).await;
            if event["status"] == "DELIVERED" {
                assert_eq!(event["previous_status"], "IN_TRANSIT");
                break;
            }
        }
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn closing_the_socket_unsubscribes() {
    let server = Server::start(Brokers::in_memory(), 30).await;
    let mut client = connect(&server.url(3)).await;
    server.wait_for_viewers(3, 1).await;

    client.close(None).await.unwrap();

    server.wait_for_viewers(3, 0).await;
    wait_until(|| !server.registry.has_forwarder(&ResourceKey::from(3u64))).await;
    server.stop().await;
}

#[tokio::test]
async fn silent_viewer_is_dropped_after_heartbeat_timeout() {
    let server = Server::start(Brokers::in_memory(), 1).await;
    // Never polled, so pings go unanswered.
    let _client = connect(&server.url(11)).await;
    server.wait_for_viewers(11, 1).await;

    tokio::time::timeout(Duration::from_secs(4), async {
        while server.registry.subscriber_count(&ResourceKey::from(11u64)) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("silent viewer outlived the heartbeat bound");

    server.stop().await;
}

#[tokio::test]
async fn responsive_viewer_survives_heartbeats() {
    let server = Server::start(Brokers::in_memory(), 1).await;
    let mut client = connect(&server.url(12)).await;
    server.wait_for_viewers(12, 1).await;

    // Polling the stream lets the client answer pings with pongs.
    let _ = tokio::time::timeout(Duration::from_millis(2500), async {
        while let Some(Ok(_)) = client.next().await {}
    })
    .await;

    assert_eq!(server.registry.subscriber_count(&ResourceKey::from(12u64)), 1);
    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let server = Server::start(Brokers::in_memory(), 30).await;
    let mut client = connect(&server.url(5)).await;
    server.wait_for_viewers(5, 1).await;
    let registry = server.registry.clone();

    let stopping = tokio::spawn(server.stop());
    expect_closed(&mut client).await;
    stopping.await.unwrap();

    assert!(registry.is_shutting_down());
    assert_eq!(registry.connection_count(), 0);
}

#[tokio::test]
async fn health_reports_live_counts() {
    let server = Server::start(Brokers::in_memory(), 30).await;
    let mut client = connect(&server.url(8)).await;
    server.wait_for_viewers(8, 1).await;

    let mut stream = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""status":"OK""#));
    assert!(response.contains(r#""connections":1"#));

    client.send(Message::Close(None)).await.unwrap();
    server.stop().await;
}
