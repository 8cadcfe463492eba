//! Module configuration surface.
//!
//! Matches the serialized form the node layer hands around when wiring
//! transports from a config file: PascalCase keys, conv values defaulting
//! to the unset sentinel.

use serde::{Deserialize, Serialize};

use crate::DEFAULT_CONV;

fn default_transport() -> String {
    "dns".to_string()
}

fn default_conv() -> u32 {
    DEFAULT_CONV
}

/// Deserialization surface for a DNS transport module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DnsConfig {
    /// Transport name; always `"dns"` for this module.
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Local listen address (`ip:port`), empty when client-only.
    #[serde(default)]
    pub listen_str: String,

    /// Remote server address (`ip:port`), empty when server-only.
    #[serde(default)]
    pub upstream_str: String,

    /// Conversation tag for the client endpoint.
    #[serde(default = "default_conv")]
    pub client_conv: u32,

    /// Conversation tag for the server endpoint.
    #[serde(default = "default_conv")]
    pub server_conv: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            listen_str: String::new(),
            upstream_str: String::new(),
            client_conv: DEFAULT_CONV,
            server_conv: DEFAULT_CONV,
        }
    }
}
