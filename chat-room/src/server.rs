use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    room::{Room, RoomConfig},
    session::Session,
};

pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Messages a session may have queued before it is disconnected as too slow.
    pub mailbox_capacity: usize,
    pub announce_membership: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            announce_membership: false,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    room: Arc<Room>,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(addr: SocketAddr, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let room = Room::new(RoomConfig {
            announce_membership: config.announce_membership,
        });
        Self {
            listener,
            room: Arc::new(room),
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn room(&self) -> Arc<Room> {
        Arc::clone(&self.room)
    }

    /// Accepts connections until `shutdown` resolves, then closes every session.
    /// Sessions still on their way into the room are refused by it.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            room,
            config,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    room.close_all().await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &room, &config)?;
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    room: &Arc<Room>,
    config: &ServerConfig,
) -> Result<()> {
    match result {
        Ok((stream, peer)) => {
            info!(peer = %peer, "accepted connection");
            spawn_session(stream, room, config);
            Ok(())
        }
        // The listener itself is unusable; nothing further will be accepted.
        Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
            Err(err).context("listening socket is no longer valid")
        }
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            Ok(())
        }
    }
}

fn spawn_session(stream: TcpStream, room: &Arc<Room>, config: &ServerConfig) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!(error = ?err, "failed to disable nagle");
    }
    let session = Session::from_tcp(stream, Arc::clone(room), config.mailbox_capacity);
    // Sessions report their own outcome when they close.
    drop(session.start());
}
