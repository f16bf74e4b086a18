use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use chat_room::{
    connection::{FrameReader, FrameWriter},
    frame::{self, MAX_BODY_BYTES, Message},
    room::Room,
    server::{Server, ServerConfig},
};
use tokio::{
    io::AsyncReadExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

struct TestServer {
    addr: SocketAddr,
    room: Arc<Room>,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener, config);
        let addr = server.local_addr()?;
        let room = server.room();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            room,
            shutdown_tx,
            task,
        })
    }

    async fn connect(&self) -> Result<Client> {
        let stream = TcpStream::connect(self.addr).await?;
        let local = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Client {
            local,
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        })
    }

    /// Membership changes happen on the session tasks, so poll until they land.
    async fn wait_for_members(&self, expected: usize) -> Result<()> {
        timeout(WAIT, async {
            while self.room.len().await != expected {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| anyhow!("room never reached {expected} members"))
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

struct Client {
    local: SocketAddr,
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl Client {
    async fn send(&mut self, text: &str) -> Result<()> {
        self.writer.write_message(&Message::from_text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Message> {
        Ok(timeout(WAIT, self.reader.read_message()).await??)
    }

    async fn recv_text(&mut self) -> Result<String> {
        Ok(self.recv().await?.text().into_owned())
    }

    async fn assert_silent(&mut self) {
        let result = timeout(QUIET, self.reader.read_message()).await;
        assert!(result.is_err(), "expected no frame, got {result:?}");
    }

    async fn assert_disconnected(self) {
        let mut stream = self.reader.into_inner();
        let mut buf = [0u8; 1];
        let result = timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("server should close the connection");
        assert!(
            matches!(result, Ok(0) | Err(_)),
            "expected end of stream, got {result:?}"
        );
    }
}

#[tokio::test]
async fn hello_reaches_the_other_client_verbatim() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut alice = server.connect().await?;
    let bob = TcpStream::connect(server.addr).await?;
    server.wait_for_members(2).await?;

    alice.writer.write_all(&frame::encode(b"hello")).await?;

    let (mut bob_reader, _bob_writer) = bob.into_split();
    let mut wire = [0u8; 9];
    timeout(WAIT, bob_reader.read_exact(&mut wire)).await??;
    assert_eq!(wire, [0x00, 0x00, 0x00, 0x05, 0x68, 0x65, 0x6c, 0x6c, 0x6f]);

    let mut bob = FrameReader::new(bob_reader);
    alice.send("again").await?;
    let again = timeout(WAIT, bob.read_message()).await??;
    assert_eq!(again.text(), "again");

    // Nothing is echoed back to the sender.
    alice.assert_silent().await;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn long_message_is_delivered_truncated() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut alice = server.connect().await?;
    let mut bob = server.connect().await?;
    server.wait_for_members(2).await?;

    let text: String = "0123456789".repeat(60);
    assert_eq!(text.len(), 600);
    alice.send(&text).await?;

    let delivered = bob.recv().await?;
    assert_eq!(delivered.len(), MAX_BODY_BYTES);
    assert_eq!(&delivered.body()[..], &text.as_bytes()[..MAX_BODY_BYTES]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn invalid_header_disconnects_only_the_sender() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut mallory = server.connect().await?;
    let mut bob = server.connect().await?;
    let mut carol = server.connect().await?;
    server.wait_for_members(3).await?;

    mallory.writer.write_all(&600u32.to_be_bytes()).await?;
    mallory.assert_disconnected().await;
    server.wait_for_members(2).await?;

    bob.send("still here").await?;
    assert_eq!(carol.recv_text().await?, "still here");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn disconnected_sender_leaves_the_room() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut alice = server.connect().await?;
    let mut bob = server.connect().await?;
    let mut carol = server.connect().await?;
    server.wait_for_members(3).await?;

    alice.send("bye").await?;
    assert_eq!(bob.recv_text().await?, "bye");
    assert_eq!(carol.recv_text().await?, "bye");

    drop(alice);
    server.wait_for_members(2).await?;

    carol.send("just us").await?;
    assert_eq!(bob.recv_text().await?, "just us");
    carol.assert_silent().await;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn membership_notices_when_enabled() -> Result<()> {
    let server = TestServer::start(ServerConfig {
        announce_membership: true,
        ..ServerConfig::default()
    })
    .await?;
    let mut alice = server.connect().await?;
    server.wait_for_members(1).await?;
    let bob = server.connect().await?;
    let bob_addr = bob.local;

    assert_eq!(
        alice.recv_text().await?,
        format!("*** {bob_addr} joined the chat")
    );

    drop(bob);
    assert_eq!(
        alice.recv_text().await?,
        format!("*** {bob_addr} left the chat")
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_every_session() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let alice = server.connect().await?;
    let bob = server.connect().await?;
    server.wait_for_members(2).await?;

    let room = Arc::clone(&server.room);
    server.stop().await;

    alice.assert_disconnected().await;
    bob.assert_disconnected().await;
    timeout(WAIT, async {
        while !room.is_empty().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_right_after_connect_leaves_no_session_running() -> Result<()> {
    // A connection accepted just before shutdown may not have joined the room
    // yet; it must still be closed.
    for _ in 0..40 {
        let server = TestServer::start(ServerConfig::default()).await?;
        let client = server.connect().await?;
        let room = Arc::clone(&server.room);
        server.stop().await;

        client.assert_disconnected().await;
        assert!(room.is_closed().await);
        timeout(WAIT, async {
            while !room.is_empty().await {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
    }
    Ok(())
}
