//! In-memory node used by the end-to-end tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use dnsburrow::{Action, Bundle, Node, RemoteCall, Transport, Value};

/// A node that keeps everything in memory: contacts, an outbox to pick
/// up from, and an inbox for dropped-off bundles. Administrative calls
/// are only honored through the admin surface.
pub struct RamNode {
    pubkey: String,
    pub contacts: Mutex<HashMap<String, String>>,
    pub outbox: Mutex<Vec<Bundle>>,
    pub inbox: Mutex<Vec<Bundle>>,
}

impl RamNode {
    pub fn new(pubkey: &str) -> Self {
        Self {
            pubkey: pubkey.to_string(),
            contacts: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Vec::new()),
            inbox: Mutex::new(Vec::new()),
        }
    }

    fn dispatch(&self, call: RemoteCall, admin: bool) -> Result<Option<Value>> {
        match call.action {
            Action::Cid => {
                if !admin {
                    bail!("access denied: administrative call on public listener");
                }
                Ok(Some(Value::PubKey(self.pubkey.clone())))
            }
            Action::AddContact => {
                if !admin {
                    bail!("access denied: administrative call on public listener");
                }
                let name = call
                    .args
                    .first()
                    .and_then(Value::as_text)
                    .ok_or_else(|| anyhow!("AddContact: missing contact name"))?;
                let key = call
                    .args
                    .get(1)
                    .and_then(Value::as_text)
                    .ok_or_else(|| anyhow!("AddContact: missing contact key"))?;
                self.contacts
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), key.to_string());
                Ok(None)
            }
            Action::Pickup => Ok(self
                .outbox
                .lock()
                .unwrap()
                .pop()
                .map(Value::Bundle)),
            Action::Dropoff => match call.args.into_iter().next() {
                Some(Value::Bundle(bundle)) => {
                    self.inbox.lock().unwrap().push(bundle);
                    Ok(None)
                }
                _ => bail!("Dropoff: expected a bundle argument"),
            },
            // accepted and discarded; stands in for outbound routing
            Action::Send => Ok(None),
            other => bail!("unhandled action {other:?}"),
        }
    }
}

#[async_trait]
impl Node for RamNode {
    async fn public_rpc(
        &self,
        _transport: &dyn Transport,
        call: RemoteCall,
    ) -> Result<Option<Value>> {
        self.dispatch(call, false)
    }

    async fn admin_rpc(
        &self,
        _transport: &dyn Transport,
        call: RemoteCall,
    ) -> Result<Option<Value>> {
        self.dispatch(call, true)
    }
}
