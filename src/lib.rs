//! Dnsburrow: Covert RPC Transport over DNS
//!
//! Dnsburrow tunnels an RPC conversation through ordinary-looking DNS
//! traffic. The client encodes outbound bytes into query names, the
//! server encodes return bytes into answer record names, and a reliable
//! sequenced-datagram layer in between repairs the loss, reordering, and
//! fragmentation the DNS carrier inflicts.
//!
//! ## Features
//!
//! - **Name-only payloads**: every tunneled byte travels in a QNAME or an
//!   answer RR name; the rest of each message is plausible DNS
//! - **Reliable delivery**: an ARQ endpoint per direction retransmits
//!   through packet loss and reassembles fragmented calls
//! - **Half-duplex pull**: idle clients poll with MX probes so the server
//!   always has a reply to hang its segments on
//! - **Per-host endpoint cache**: reconnecting to a host resumes its
//!   sequence state instead of starting a new conversation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dnsburrow::{Action, Module, Node};
//!
//! # async fn example(node: Arc<dyn Node>) -> Result<(), dnsburrow::TransportError> {
//! // listening side
//! let server = Module::new(Arc::clone(&node), 0x55667788, 0x11223344);
//! server.listen("0.0.0.0:53", true).await?;
//!
//! // calling side
//! let client = Module::new(node, 0x11223344, 0x55667788);
//! let cid = client
//!     .rpc("198.51.100.7:53", Action::Cid, vec![])
//!     .await?;
//! println!("remote identity: {cid:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! caller ──► rpc framer ──► reliable endpoint ──► DNS queries ──► UDP
//!                                                                  │
//! caller ◄── response inbox ◄── reliable endpoint ◄── answer RRs ◄─┘
//! ```

pub mod api;
pub mod channel;
pub mod config;
pub mod debounce;
pub mod dotify;
pub mod metrics;

mod downstream;
mod module;
mod rpc;
mod upstream;

pub use api::{
    Action, Bundle, Node, RemoteCall, RemoteResponse, Transport, Value, WireError,
};
pub use config::DnsConfig;
pub use dotify::{dotify, undotify, CodecError};
pub use module::Module;

/// Effective MTU inside the tunnel: the largest reliable-layer packet
/// that still encodes into one DNS name.
pub const MTU: usize = 150;

/// Serialized-size budget for a single RPC message. Larger calls are
/// warned about and attempted anyway.
pub const MAX_MSG_SIZE: usize = 2889;

/// Sentinel for an unset conversation tag.
pub const DEFAULT_CONV: u32 = 0xFFFF_FFFF;

/// Default per-bundle byte budget reported to the node layer.
pub const DEFAULT_BYTE_LIMIT: i64 = 2410;

/// Transport error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Label codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// An RPC frame would not decode.
    #[error("rpc frame decode failed: {0}")]
    DecodeFailed(#[from] WireError),

    /// One DNS exchange failed; the next feed cycle retries.
    #[error("dns exchange failed: {0}")]
    DnsExchange(String),

    /// The UDP listener could not be opened.
    #[error("failed to open dns listener: {0}")]
    ListenFailed(#[source] std::io::Error),

    /// The reliable layer rejected an operation.
    #[error("reliable channel: {0}")]
    Channel(String),

    /// The remote node answered with an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// No response arrived within the configured window.
    #[error("rpc timed out")]
    Timeout,

    /// A call was attempted before an upstream host was set.
    #[error("upstream host not set")]
    UpstreamNotSet,

    /// The client endpoint has not been initialized.
    #[error("client endpoint not initialized")]
    NotConnected,
}
