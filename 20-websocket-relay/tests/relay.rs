use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message, client::IntoClientRequest, http::HeaderValue},
};
use websocket_relay::{
    hub::{Hub, HubConfig},
    origin::OriginPolicy,
    server::{Relay, RelayConfig},
};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    addr: SocketAddr,
    hub: Hub,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let relay = Relay::new(listener, config);
        let addr = relay.local_addr()?;
        let hub = relay.hub().clone();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = relay.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            hub,
            shutdown: Some(shutdown_tx),
            server,
        })
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn connect(&self) -> Result<Client> {
        let (client, _) = timeout(WAIT, connect_async(self.url())).await??;
        Ok(client)
    }

    async fn wait_for_connections(&self, expected: usize) -> Result<()> {
        timeout(WAIT, async {
            while self.hub.live_connections() != expected {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .with_context(|| {
            format!(
                "expected {expected} live connections, hub reports {}",
                self.hub.live_connections()
            )
        })
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = timeout(WAIT, self.server).await;
    }
}

async fn next_message(client: &mut Client) -> Result<Message> {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .context("timed out waiting for a message")?
            .ok_or_else(|| anyhow!("connection ended"))??;
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return Ok(message);
        }
    }
}

async fn assert_silent(client: &mut Client) {
    if let Ok(message) = timeout(QUIET, client.next()).await {
        panic!("expected no message, got {message:?}");
    }
}

#[tokio::test]
async fn message_from_one_client_reaches_the_others() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let mut a = relay.connect().await?;
    let mut b = relay.connect().await?;
    let mut c = relay.connect().await?;
    relay.wait_for_connections(3).await?;

    a.send(Message::Text("hello".into())).await?;

    assert_eq!(next_message(&mut b).await?, Message::Text("hello".into()));
    assert_eq!(next_message(&mut c).await?, Message::Text("hello".into()));
    assert_silent(&mut a).await;

    b.send(Message::Binary(vec![0, 159, 146, 150])).await?;
    assert_eq!(
        next_message(&mut a).await?,
        Message::Binary(vec![0, 159, 146, 150])
    );
    assert_eq!(
        next_message(&mut c).await?,
        Message::Binary(vec![0, 159, 146, 150])
    );

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let mut a = relay.connect().await?;
    let mut b = relay.connect().await?;
    relay.wait_for_connections(2).await?;

    for n in 0..20 {
        a.send(Message::Text(format!("m{n}"))).await?;
    }
    for n in 0..20 {
        assert_eq!(next_message(&mut b).await?, Message::Text(format!("m{n}")));
    }

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn departed_client_is_unregistered() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let mut a = relay.connect().await?;
    let mut b = relay.connect().await?;
    let mut c = relay.connect().await?;
    relay.wait_for_connections(3).await?;

    c.close(None).await?;
    relay.wait_for_connections(2).await?;

    a.send(Message::Text("after c left".into())).await?;
    assert_eq!(
        next_message(&mut b).await?,
        Message::Text("after c left".into())
    );

    drop(b);
    relay.wait_for_connections(1).await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn client_that_stops_reading_is_evicted_and_closed() -> Result<()> {
    let relay = TestRelay::start(RelayConfig {
        hub: HubConfig {
            queue_capacity: 4,
            ..HubConfig::default()
        },
        ..RelayConfig::default()
    })
    .await?;
    let mut a = relay.connect().await?;
    let mut stalled = relay.connect().await?;
    relay.wait_for_connections(2).await?;

    // Socket buffers absorb several megabytes before the outbound queue
    // backs up, so keep sending until the hub gives up on `stalled`.
    let chunk = vec![7u8; 64 * 1024];
    timeout(Duration::from_secs(20), async {
        while relay.hub.live_connections() == 2 {
            a.send(Message::Binary(chunk.clone())).await?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("stalled client was never evicted")??;
    relay.wait_for_connections(1).await?;

    let close = timeout(Duration::from_secs(20), async {
        loop {
            match stalled.next().await {
                Some(Ok(Message::Close(frame))) => return Ok(frame),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(anyhow!("stalled client failed: {err}")),
                None => return Err(anyhow!("connection ended without a close frame")),
            }
        }
    })
    .await
    .context("timed out draining the stalled client")??;
    let frame = close.context("close frame should carry a status code")?;
    assert_eq!(u16::from(frame.code), 1000);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn echo_mode_sends_messages_back_to_sender() -> Result<()> {
    let relay = TestRelay::start(RelayConfig {
        hub: HubConfig {
            echo: true,
            ..HubConfig::default()
        },
        ..RelayConfig::default()
    })
    .await?;
    let mut a = relay.connect().await?;
    let mut b = relay.connect().await?;
    relay.wait_for_connections(2).await?;

    a.send(Message::Text("ping".into())).await?;

    assert_eq!(next_message(&mut a).await?, Message::Text("ping".into()));
    assert_eq!(next_message(&mut b).await?, Message::Text("ping".into()));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn foreign_origin_is_refused_by_default() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;

    let mut request = relay.url().into_client_request()?;
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://evil.example"));

    match timeout(WAIT, connect_async(request)).await? {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 403),
        Err(other) => return Err(anyhow!("unexpected handshake error: {other}")),
        Ok(_) => return Err(anyhow!("handshake from a foreign origin succeeded")),
    }
    assert_eq!(relay.hub.live_connections(), 0);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn allow_listed_origin_is_accepted() -> Result<()> {
    let relay = TestRelay::start(RelayConfig {
        origin_policy: OriginPolicy::AllowList(vec!["http://localhost:3000".into()]),
        ..RelayConfig::default()
    })
    .await?;

    let mut request = relay.url().into_client_request()?;
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://localhost:3000"));

    let (_client, _) = timeout(WAIT, connect_async(request)).await??;
    relay.wait_for_connections(1).await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn static_files_are_served_next_to_the_endpoint() -> Result<()> {
    let relay = TestRelay::start(RelayConfig {
        static_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("public"),
        ..RelayConfig::default()
    })
    .await?;

    let mut stream = TcpStream::connect(relay.addr).await?;
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;
    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response)).await??;

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("new WebSocket"));

    relay.stop().await;
    Ok(())
}
