use std::{net::SocketAddr, num::NonZeroUsize};

use clap::{Args, Parser, Subcommand};

use crate::server::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, rebroadcasting every frame to the other clients.
    Serve(ServeArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub listen: SocketAddr,

    /// Outbound messages buffered per client before a slow client is dropped.
    #[arg(long, default_value = "256")]
    pub mailbox_capacity: NonZeroUsize,

    /// Tell the other clients when someone joins or leaves.
    #[arg(long)]
    pub announce: bool,
}

impl From<&ServeArgs> for ServerConfig {
    fn from(args: &ServeArgs) -> Self {
        Self {
            mailbox_capacity: args.mailbox_capacity.get(),
            announce_membership: args.announce,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub server: SocketAddr,

    /// Name prefixed to every line you send.
    #[arg(long)]
    pub name: Option<String>,
}
