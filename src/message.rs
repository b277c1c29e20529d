//! # Messages and Headers
//!
//! Header construction and the reply protocol. A message pairs one
//! routed [`Header`] with a payload of registered records; intermediate
//! nodes only ever interpret the header.
//!
//! ## Wire form
//!
//! A message is assembly-encoded as an array whose first element is the
//! tagged header and whose remaining elements are the tagged payload
//! records, then netstring-framed for transmission.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::assembly::{self, downcast, Item, Record};
use crate::registry::Token;

/// A semantically hierarchical address for distributed networking.
///
/// `namespace` delimits a trust domain; `user` names a principal;
/// `service` identifies an operating instance of the network;
/// `application` names the endpoint function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Address {
    pub namespace: String,
    pub user: String,
    pub service: String,
    pub application: String,
}

impl Record for Address {
    const TYPE_NAME: &'static str = "ipc.fabric.Address";
}

impl Address {
    pub fn new(namespace: &str, user: &str, service: &str, application: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            user: user.to_string(),
            service: service.to_string(),
            application: application.to_string(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.namespace, self.user, self.service, self.application
        )
    }
}

/// The routed envelope carried ahead of every payload.
///
/// `id` is minted once and survives every forward; `src` and `dst` are
/// never rewritten in transit; `via` is overwritten by each forwarder
/// with its own address; `hop` never exceeds `h_max` in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Header {
    pub id: String,
    pub src: Option<Address>,
    pub dst: Option<Address>,
    #[serde(rename = "hMax")]
    pub h_max: u32,
    pub via: Option<Address>,
    pub hop: u32,
}

impl Record for Header {
    const TYPE_NAME: &'static str = "ipc.fabric.Header";
}

/// One routed message: a header and its payload records.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<Item>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Assembly(#[from] assembly::AssemblyError),

    /// The document decoded, but its first record is not a header.
    #[error("no header at the head of the message")]
    NoHeader,
}

/// A named, dimensioned reading with a validation pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scalar {
    pub name: String,
    pub unit: String,
    pub value: serde_json::Value,
    #[serde(with = "assembly::pattern_format")]
    pub regex: regex::Regex,
    pub tip: String,
}

impl Record for Scalar {
    const TYPE_NAME: &'static str = "ipc.fabric.Scalar";
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.unit == other.unit
            && self.value == other.value
            && self.regex.as_str() == other.regex.as_str()
            && self.tip == other.tip
    }
}

/// A timestamped notification, the demo payload type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Alert {
    #[serde(with = "assembly::datetime_format")]
    pub ts: chrono::NaiveDateTime,
    pub text: String,
}

impl Record for Alert {
    const TYPE_NAME: &'static str = "ipc.fabric.Alert";
}

/// Construct an outbound message from the local token.
///
/// `src` comes from the token; `dst` defaults to `src`, which makes an
/// unaddressed parcel a loopback. The id is fresh and the hop count
/// starts at zero.
pub fn parcel(
    token: &Token,
    payload: Vec<Item>,
    dst: Option<Address>,
    via: Option<Address>,
    h_max: u32,
) -> Message {
    let src = token.address();
    let dst = dst.unwrap_or_else(|| src.clone());
    Message {
        header: Header {
            id: Uuid::new_v4().simple().to_string(),
            src: Some(src),
            dst: Some(dst),
            h_max,
            via,
            hop: 0,
        },
        payload,
    }
}

/// Construct a reply to a received header.
///
/// The reply carries the *same* id as the originating header so the
/// parties can correlate the exchange; source and destination swap.
pub fn reply(
    header: &Header,
    payload: Vec<Item>,
    dst: Option<Address>,
    via: Option<Address>,
    h_max: u32,
) -> Message {
    Message {
        header: Header {
            id: header.id.clone(),
            src: header.dst.clone(),
            dst: dst.or_else(|| header.src.clone()),
            h_max,
            via,
            hop: 0,
        },
        payload,
    }
}

impl Message {
    /// Assembly-encode the message for framing.
    pub fn to_wire(&self) -> String {
        let mut doc = Vec::with_capacity(self.payload.len() + 1);
        doc.push(assembly::tagged_value(&self.header));
        doc.extend(self.payload.iter().map(|i| assembly::tagged_value(i.as_ref())));
        serde_json::to_string(&doc).unwrap_or_else(|_| "[]".to_string())
    }

    /// Decode a framed message body.
    pub fn from_wire(text: &str) -> Result<Self, MessageError> {
        let mut items = assembly::loads(text)?;
        if items.is_empty() || downcast::<Header>(&items[0]).is_none() {
            return Err(MessageError::NoHeader);
        }
        let header = downcast::<Header>(&items.remove(0))
            .cloned()
            .ok_or(MessageError::NoHeader)?;
        Ok(Message {
            header,
            payload: items,
        })
    }
}

/// Register the built-in record types.
///
/// Called once at process start, before any message crosses the wire.
pub fn register_builtin() {
    assembly::register::<Address>();
    assembly::register::<Header>();
    assembly::register::<Scalar>();
    assembly::register::<Alert>();
}
