//! The RPC entry point.

use log::{info, warn};
use tokio::time::timeout;

use crate::api::{Action, RemoteCall, Value};
use crate::module::Module;
use crate::{TransportError, MAX_MSG_SIZE};

impl Module {
    /// Execute one call against the listener at `host` and wait for the
    /// response.
    ///
    /// The first call to a host spins up the client loops and creates (or
    /// revives) that host's reliable endpoint; the loops wind down again
    /// once the response is in. One call may be in flight per module at a
    /// time, and splitting payloads larger than [`MAX_MSG_SIZE`] across
    /// calls is the caller's job — the tunnel does not chunk calls.
    pub async fn rpc(
        &self,
        host: &str,
        action: Action,
        args: Vec<Value>,
    ) -> Result<Option<Value>, TransportError> {
        info!("rpc {action:?} -> {host}");

        if !self.is_running_client() {
            self.set_upstream_str(host);
            let endpoint = self.init_client()?;
            self.start_client(endpoint);
        }

        let call = RemoteCall { action, args };
        let wire = call.to_bytes();
        if wire.len() > MAX_MSG_SIZE {
            warn!(
                "call serializes to {} bytes, over the {MAX_MSG_SIZE}-byte budget; \
                 the reliable layer may refuse it",
                wire.len()
            );
        }

        {
            let endpoint = self.client_endpoint().ok_or(TransportError::NotConnected)?;
            let mut channel = endpoint.lock().await;
            channel
                .send(&wire)
                .map_err(|e| TransportError::Channel(e.to_string()))?;
        }
        self.inner.client_metrics.sent(wire.len());

        let waited = {
            let mut inbox = self.inner.resp_rx.lock().await;
            timeout(self.rpc_timeout(), inbox.recv()).await
        };
        let response = match waited {
            Ok(Some(response)) => response,
            Ok(None) | Err(_) => {
                warn!("no response from {host} within {:?}", self.rpc_timeout());
                self.stop_client().await;
                return Err(TransportError::Timeout);
            }
        };

        self.stop_client().await;

        if response.is_err() {
            return Err(TransportError::Remote(response.error));
        }
        if response.is_nil() {
            return Ok(None);
        }
        Ok(response.value)
    }
}
