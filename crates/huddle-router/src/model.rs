//! Durable data model for the shared resource directory.
//!
//! These entities are what nodes write to the cluster-wide directory store:
//! resource records describing which allocation owns a bound resource,
//! allocation records identifying live server instances, and extended
//! presence persisted per full address. All of them carry a compact binary
//! encoding so the directory can treat values as opaque bytes.

use jid::Jid;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::types::Stanza;

/// Binary entity codec failure.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encoding failed.
    #[error("encoding failed: {0}")]
    Encode(postcard::Error),
    /// Decoding failed.
    #[error("decoding failed: {0}")]
    Decode(postcard::Error),
    /// An embedded stanza could not be serialized or parsed.
    #[error("embedded stanza: {0}")]
    Stanza(String),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(CodecError::Encode)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(CodecError::Decode)
}

/// A directory entry describing a live resource and the allocation that
/// owns its underlying connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Identifier of the cluster allocation owning the connection.
    pub allocation_id: String,
    /// Full address of the bound resource.
    pub jid: Jid,
    /// Advertised presence priority (-128..127, higher is preferred).
    pub priority: i8,
}

impl Resource {
    /// Serialize to the directory's binary representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    /// Deserialize from the directory's binary representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        decode(bytes)
    }
}

/// One running server instance of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Stable unique identifier of the instance.
    pub id: String,
}

impl Allocation {
    /// Serialize to the directory's binary representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    /// Deserialize from the directory's binary representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        decode(bytes)
    }
}

/// Entity capabilities advertised alongside presence (XEP-0115).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Client node URI.
    pub node: String,
    /// Verification string.
    pub ver: String,
    /// Supported feature namespaces.
    pub features: Vec<String>,
}

/// Presence persisted per full address, with optional capabilities.
#[derive(Debug, Clone)]
pub struct ExtPresence {
    /// The presence stanza itself.
    pub presence: Presence,
    /// Capabilities associated with this presence, if advertised.
    pub caps: Option<Capabilities>,
}

/// Wire shape for `ExtPresence`. The presence stanza has no serde
/// representation, so it travels as its XML form.
#[derive(Serialize, Deserialize)]
struct ExtPresenceWire {
    presence_xml: String,
    caps: Option<Capabilities>,
}

impl ExtPresence {
    /// Create an extended presence without capabilities.
    pub fn new(presence: Presence) -> Self {
        Self {
            presence,
            caps: None,
        }
    }

    /// Whether this presence marks the resource as available.
    pub fn is_available(&self) -> bool {
        self.presence.type_ == PresenceType::None
    }

    /// Serialize to the directory's binary representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let presence_xml = Stanza::Presence(self.presence.clone())
            .to_xml()
            .map_err(|e| CodecError::Stanza(e.to_string()))?;
        encode(&ExtPresenceWire {
            presence_xml,
            caps: self.caps.clone(),
        })
    }

    /// Deserialize from the directory's binary representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: ExtPresenceWire = decode(bytes)?;
        let stanza = Stanza::from_xml(&wire.presence_xml)
            .map_err(|e| CodecError::Stanza(e.to_string()))?;
        match stanza {
            Stanza::Presence(presence) => Ok(Self {
                presence,
                caps: wire.caps,
            }),
            other => Err(CodecError::Stanza(format!(
                "expected presence, got {}",
                other.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_round_trip_full_jid() {
        let r1 = Resource {
            allocation_id: "a1234".to_string(),
            jid: "romeo@huddle.chat/balcony".parse().unwrap(),
            priority: 8,
        };
        let bytes = r1.to_bytes().unwrap();
        let r2 = Resource::from_bytes(&bytes).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_resource_round_trip_bare_jid() {
        let r1 = Resource {
            allocation_id: "a1234".to_string(),
            jid: "romeo@huddle.chat".parse().unwrap(),
            priority: -1,
        };
        let bytes = r1.to_bytes().unwrap();
        let r2 = Resource::from_bytes(&bytes).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_allocation_round_trip() {
        let a1 = Allocation {
            id: "a1234".to_string(),
        };
        let bytes = a1.to_bytes().unwrap();
        let a2 = Allocation::from_bytes(&bytes).unwrap();
        assert_eq!(a1, a2);
    }

    #[test]
    fn test_ext_presence_round_trip_with_caps() {
        let mut presence = Presence::new(PresenceType::None);
        presence.priority = 5;

        let p1 = ExtPresence {
            presence,
            caps: Some(Capabilities {
                node: "https://example.org/client".to_string(),
                ver: "dV9+SvmfN2evMv1A2vU5qTzOeAk=".to_string(),
                features: vec!["urn:xmpp:ping".to_string()],
            }),
        };
        let bytes = p1.to_bytes().unwrap();
        let p2 = ExtPresence::from_bytes(&bytes).unwrap();
        assert!(p2.is_available());
        assert_eq!(p2.presence.priority, 5);
        assert_eq!(p1.caps, p2.caps);
    }

    #[test]
    fn test_ext_presence_unavailable() {
        let p = ExtPresence::new(Presence::new(PresenceType::Unavailable));
        assert!(!p.is_available());

        let bytes = p.to_bytes().unwrap();
        let decoded = ExtPresence::from_bytes(&bytes).unwrap();
        assert!(!decoded.is_available());
        assert!(decoded.caps.is_none());
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Resource::from_bytes(&[0xff, 0x00, 0x01]).is_err());
    }
}
