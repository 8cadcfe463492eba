//! RPC framing and the seams to the node layer.
//!
//! A call is `{action, args}` and a response is `{error, value}`. Both
//! travel as a self-describing binary frame: a tag byte announces each
//! value's shape, blobs are length-prefixed, integers are big-endian.
//! Both peers must share the [`Action`] registry and the tag table, and
//! an absent response value is kept distinct from an explicit null.

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};

use crate::TransportError;

/// RPC actions understood by a node.
///
/// The `u16` wire codes are frozen; new actions append, existing codes
/// never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Action {
    Id = 0,
    Dropoff = 1,
    Pickup = 2,
    Cid = 3,
    GetContact = 4,
    GetContacts = 5,
    AddContact = 6,
    DeleteContact = 7,
    GetChannel = 8,
    GetChannels = 9,
    AddChannel = 10,
    DeleteChannel = 11,
    GetProfile = 12,
    GetProfiles = 13,
    AddProfile = 14,
    DeleteProfile = 15,
    LoadProfile = 16,
    GetPeer = 17,
    GetPeers = 18,
    AddPeer = 19,
    DeletePeer = 20,
    Send = 21,
    SendChannel = 22,
}

impl TryFrom<u16> for Action {
    type Error = WireError;

    fn try_from(code: u16) -> Result<Self, WireError> {
        Ok(match code {
            0 => Action::Id,
            1 => Action::Dropoff,
            2 => Action::Pickup,
            3 => Action::Cid,
            4 => Action::GetContact,
            5 => Action::GetContacts,
            6 => Action::AddContact,
            7 => Action::DeleteContact,
            8 => Action::GetChannel,
            9 => Action::GetChannels,
            10 => Action::AddChannel,
            11 => Action::DeleteChannel,
            12 => Action::GetProfile,
            13 => Action::GetProfiles,
            14 => Action::AddProfile,
            15 => Action::DeleteProfile,
            16 => Action::LoadProfile,
            17 => Action::GetPeer,
            18 => Action::GetPeers,
            19 => Action::AddPeer,
            20 => Action::DeletePeer,
            21 => Action::Send,
            22 => Action::SendChannel,
            other => return Err(WireError::UnknownAction(other)),
        })
    }
}

/// A message bundle: opaque payload plus the sender's timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bundle {
    pub data: Vec<u8>,
    pub time: i64,
}

/// A runtime-typed RPC argument or return value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
    PubKey(String),
    Bundle(Bundle),
    List(Vec<Value>),
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_BYTES: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_PUBKEY: u8 = 5;
const TAG_BUNDLE: u8 = 6;
const TAG_LIST: u8 = 7;

/// Framing errors raised while decoding a call or response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown value tag {0}")]
    UnknownTag(u8),
    #[error("unknown action code {0}")]
    UnknownAction(u16),
    #[error("text field is not valid utf-8")]
    InvalidUtf8,
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn get_blob(buf: &mut &[u8]) -> Result<Vec<u8>, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_text(buf: &mut &[u8]) -> Result<String, WireError> {
    String::from_utf8(get_blob(buf)?).map_err(|_| WireError::InvalidUtf8)
}

impl Value {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => buf.put_u8(TAG_NULL),
            Value::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*b));
            }
            Value::Int(i) => {
                buf.put_u8(TAG_INT);
                buf.put_i64(*i);
            }
            Value::Bytes(b) => {
                buf.put_u8(TAG_BYTES);
                put_blob(buf, b);
            }
            Value::Text(s) => {
                buf.put_u8(TAG_TEXT);
                put_blob(buf, s.as_bytes());
            }
            Value::PubKey(s) => {
                buf.put_u8(TAG_PUBKEY);
                put_blob(buf, s.as_bytes());
            }
            Value::Bundle(b) => {
                buf.put_u8(TAG_BUNDLE);
                put_blob(buf, &b.data);
                buf.put_i64(b.time);
            }
            Value::List(items) => {
                buf.put_u8(TAG_LIST);
                buf.put_u32(items.len() as u32);
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Value, WireError> {
        if buf.remaining() < 1 {
            return Err(WireError::Truncated);
        }
        match buf.get_u8() {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => {
                if buf.remaining() < 1 {
                    return Err(WireError::Truncated);
                }
                Ok(Value::Bool(buf.get_u8() != 0))
            }
            TAG_INT => {
                if buf.remaining() < 8 {
                    return Err(WireError::Truncated);
                }
                Ok(Value::Int(buf.get_i64()))
            }
            TAG_BYTES => Ok(Value::Bytes(get_blob(buf)?)),
            TAG_TEXT => Ok(Value::Text(get_text(buf)?)),
            TAG_PUBKEY => Ok(Value::PubKey(get_text(buf)?)),
            TAG_BUNDLE => {
                let data = get_blob(buf)?;
                if buf.remaining() < 8 {
                    return Err(WireError::Truncated);
                }
                let time = buf.get_i64();
                Ok(Value::Bundle(Bundle { data, time }))
            }
            TAG_LIST => {
                if buf.remaining() < 4 {
                    return Err(WireError::Truncated);
                }
                let count = buf.get_u32() as usize;
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(Value::decode(buf)?);
                }
                Ok(Value::List(items))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }

    /// The text payload, when this value carries one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::PubKey(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Bundle> for Value {
    fn from(b: Bundle) -> Self {
        Value::Bundle(b)
    }
}

/// A serialized-ready RPC call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub action: Action,
    pub args: Vec<Value>,
}

impl RemoteCall {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(self.action as u16);
        buf.put_u32(self.args.len() as u32);
        for arg in &self.args {
            arg.encode(&mut buf);
        }
        buf.to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        if buf.remaining() < 6 {
            return Err(WireError::Truncated);
        }
        let action = Action::try_from(buf.get_u16())?;
        let count = buf.get_u32() as usize;
        let mut args = Vec::new();
        for _ in 0..count {
            args.push(Value::decode(&mut buf)?);
        }
        Ok(Self { action, args })
    }
}

/// An RPC response as carried back to the caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteResponse {
    pub error: String,
    pub value: Option<Value>,
}

impl RemoteResponse {
    pub fn is_err(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn is_nil(&self) -> bool {
        self.value.is_none()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_blob(&mut buf, self.error.as_bytes());
        match &self.value {
            None => buf.put_u8(0),
            Some(v) => {
                buf.put_u8(1);
                v.encode(&mut buf);
            }
        }
        buf.to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let error = get_text(&mut buf)?;
        if buf.remaining() < 1 {
            return Err(WireError::Truncated);
        }
        let value = match buf.get_u8() {
            0 => None,
            _ => Some(Value::decode(&mut buf)?),
        };
        Ok(Self { error, value })
    }
}

/// The node endpoint a listening transport dispatches into.
///
/// Admin listeners reach `admin_rpc`, everything else goes through
/// `public_rpc`. Errors come back to the remote caller as the response's
/// error string.
#[async_trait]
pub trait Node: Send + Sync {
    async fn public_rpc(
        &self,
        transport: &dyn Transport,
        call: RemoteCall,
    ) -> anyhow::Result<Option<Value>>;

    async fn admin_rpc(
        &self,
        transport: &dyn Transport,
        call: RemoteCall,
    ) -> anyhow::Result<Option<Value>>;
}

/// A transport module as the node layer sees it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name this transport registers under.
    fn name(&self) -> &'static str;

    /// Start answering on `listen`; admin listeners dispatch into the
    /// node's privileged surface.
    async fn listen(&self, listen: &str, admin_mode: bool) -> Result<(), TransportError>;

    /// Execute one call against a remote listener.
    async fn rpc(
        &self,
        host: &str,
        action: Action,
        args: Vec<Value>,
    ) -> Result<Option<Value>, TransportError>;

    /// Stop serving.
    async fn stop(&self);

    /// Upper bound on bundle bytes per exchange for this transport.
    fn byte_limit(&self) -> i64;

    fn set_byte_limit(&self, limit: i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_round_trip() {
        let call = RemoteCall {
            action: Action::AddContact,
            args: vec![
                Value::Text("destname1".into()),
                Value::PubKey("OZpP5z9iUJr8SPKSbDLQr0nLbfKsHGj0vHnDHqgE=".into()),
            ],
        };
        let decoded = RemoteCall::from_bytes(&call.to_bytes()).unwrap();
        assert_eq!(decoded, call);
    }

    #[test]
    fn response_round_trip_with_value() {
        let rr = RemoteResponse {
            error: String::new(),
            value: Some(Value::List(vec![
                Value::Int(-42),
                Value::Bool(true),
                Value::Bytes(vec![0, 1, 2, 255]),
                Value::Bundle(Bundle {
                    data: b"payload".to_vec(),
                    time: 1_700_000_000,
                }),
            ])),
        };
        let decoded = RemoteResponse::from_bytes(&rr.to_bytes()).unwrap();
        assert_eq!(decoded, rr);
        assert!(!decoded.is_err());
        assert!(!decoded.is_nil());
    }

    #[test]
    fn absent_value_differs_from_null() {
        let nil = RemoteResponse::default();
        let null = RemoteResponse {
            error: String::new(),
            value: Some(Value::Null),
        };
        let nil2 = RemoteResponse::from_bytes(&nil.to_bytes()).unwrap();
        let null2 = RemoteResponse::from_bytes(&null.to_bytes()).unwrap();
        assert!(nil2.is_nil());
        assert!(!null2.is_nil());
    }

    #[test]
    fn error_response() {
        let rr = RemoteResponse {
            error: "access denied".into(),
            value: None,
        };
        let decoded = RemoteResponse::from_bytes(&rr.to_bytes()).unwrap();
        assert!(decoded.is_err());
        assert_eq!(decoded.error, "access denied");
    }

    #[test]
    fn action_codes_are_frozen() {
        assert_eq!(Action::Dropoff as u16, 1);
        assert_eq!(Action::Pickup as u16, 2);
        assert_eq!(Action::Cid as u16, 3);
        assert_eq!(Action::AddContact as u16, 6);
        assert_eq!(Action::try_from(21).unwrap(), Action::Send);
        assert_eq!(Action::try_from(999), Err(WireError::UnknownAction(999)));
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(RemoteCall::from_bytes(&[0]), Err(WireError::Truncated));
        // valid header promising one arg, then a bogus tag
        let mut frame = RemoteCall {
            action: Action::Id,
            args: vec![],
        }
        .to_bytes();
        frame[5] = 1; // arg count 1
        frame.push(0xEE);
        assert_eq!(
            RemoteCall::from_bytes(&frame),
            Err(WireError::UnknownTag(0xEE))
        );
        // blob length runs past the end of the frame
        let truncated = [TAG_BYTES, 0, 0, 0, 10, 1, 2];
        let mut view = &truncated[..];
        assert_eq!(Value::decode(&mut view), Err(WireError::Truncated));
    }
}
