//! CLI argument assembly and top-level parser.

use std::path::PathBuf;

use clap::{Args, Parser};
use stitch_coordinator::Role;
use stitch_overlay::PeerAddress;

const USAGE_HELP: &str = "\
A pair of stitch nodes tunnels local TCP conversations across the overlay;
an external backend command produces or consumes the bytes on either end.

Start the serving node first:            stitch
Then point a client node at it:          stitch -c <peer-multiaddress>
Nodes behind NAT can meet via a relay:   stitch -R (on a reachable host)";

/// Stitch - discovery-driven TCP tunnels over a p2p overlay.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None, after_help = USAGE_HELP)]
pub struct Cli {
    /// Logging configuration.
    #[command(flatten)]
    pub logs: LogArgs,

    /// Node configuration.
    #[command(flatten)]
    pub node: NodeArgs,
}

/// Logging configuration.
#[derive(Debug, Args, Clone, Default)]
#[command(next_help_heading = "Logging")]
pub struct LogArgs {
    /// Silence all output.
    #[arg(short, long)]
    pub quiet: bool,

    /// Verbose mode (-v, -vv, -vvv, etc.).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Log filter directive (e.g., "stitch=debug,libp2p=info").
    #[arg(long = "log.filter", value_name = "DIRECTIVE")]
    pub filter: Option<String>,
}

/// Node configuration.
#[derive(Debug, Args)]
#[command(next_help_heading = "Node")]
pub struct NodeArgs {
    /// Remote peer to tunnel to; selects the client role.
    ///
    /// Without it the node discovers peers itself under the shared
    /// rendezvous tag.
    #[arg(short = 'c', long = "connect", value_name = "MULTIADDR")]
    pub remote_peer: Option<PeerAddress>,

    /// Run as a relay only: assist connectivity for other nodes, never
    /// open tunnels.
    #[arg(short = 'R', long = "relay-only", conflicts_with = "remote_peer")]
    pub relay_only: bool,

    /// Relay to bootstrap connectivity through.
    #[arg(short = 'r', long = "relay", value_name = "MULTIADDR")]
    pub relay: Option<PeerAddress>,

    /// Backend command run for each tunnel event.
    #[arg(long, default_value = "make", value_name = "PROGRAM")]
    pub backend: String,

    /// Directory the node address file is written to.
    #[arg(long, default_value = "local", value_name = "PATH")]
    pub datadir: PathBuf,
}

impl NodeArgs {
    /// The role the flags select.
    pub fn role(&self) -> Role {
        if self.relay_only {
            Role::Relay
        } else if self.remote_peer.is_some() {
            Role::Client
        } else {
            Role::Server
        }
    }
}
