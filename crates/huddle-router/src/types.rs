//! Common types for stanza routing.

use jid::Jid;
use minidom::Element;
use xmpp_parsers::iq::Iq;
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

use crate::RoutingError;

/// A routable XMPP stanza.
#[derive(Debug, Clone)]
pub enum Stanza {
    /// Message stanza
    Message(Message),
    /// Presence stanza
    Presence(Presence),
    /// IQ (info/query) stanza
    Iq(Iq),
}

impl Stanza {
    /// Get the stanza type name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }

    /// Get the destination JID, if any.
    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.to.as_ref(),
            Stanza::Presence(p) => p.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
        }
    }

    /// Get the sender JID, if any.
    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.from.as_ref(),
            Stanza::Presence(p) => p.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }

    /// Whether this stanza is a message (messages follow priority routing).
    pub fn is_message(&self) -> bool {
        matches!(self, Stanza::Message(_))
    }

    /// Serialize the stanza to its XML wire form.
    pub fn to_xml(&self) -> Result<String, RoutingError> {
        let element: Element = match self {
            Stanza::Message(m) => m.clone().into(),
            Stanza::Presence(p) => p.clone().into(),
            Stanza::Iq(iq) => iq.clone().into(),
        };
        let mut output = Vec::new();
        element
            .write_to(&mut output)
            .map_err(|e| RoutingError::MalformedStanza(format!("serialize: {}", e)))?;
        String::from_utf8(output)
            .map_err(|e| RoutingError::MalformedStanza(format!("invalid utf-8: {}", e)))
    }

    /// Parse a stanza from its XML wire form.
    pub fn from_xml(data: &str) -> Result<Self, RoutingError> {
        let element = data
            .parse::<Element>()
            .map_err(|e| RoutingError::MalformedStanza(format!("parse: {}", e)))?;
        Stanza::try_from(element)
    }
}

impl TryFrom<Element> for Stanza {
    type Error = RoutingError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        match element.name() {
            "message" => Message::try_from(element)
                .map(Stanza::Message)
                .map_err(|e| RoutingError::MalformedStanza(format!("invalid message: {:?}", e))),
            "presence" => Presence::try_from(element)
                .map(Stanza::Presence)
                .map_err(|e| RoutingError::MalformedStanza(format!("invalid presence: {:?}", e))),
            "iq" => Iq::try_from(element)
                .map(Stanza::Iq)
                .map_err(|e| RoutingError::MalformedStanza(format!("invalid iq: {:?}", e))),
            other => Err(RoutingError::MalformedStanza(format!(
                "unknown stanza element: {}",
                other
            ))),
        }
    }
}

/// Pre-routing validations, combinable with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Validations(u8);

impl Validations {
    /// No validation.
    pub const NONE: Validations = Validations(0);
    /// Verify the destination account exists.
    pub const USER_EXISTENCE: Validations = Validations(1 << 0);
    /// Verify the destination JID is not on the sender's block list.
    pub const BLOCKED_DESTINATION: Validations = Validations(1 << 1);

    /// Whether every flag in `other` is set.
    pub fn contains(self, other: Validations) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Validations {
    type Output = Validations;

    fn bitor(self, rhs: Validations) -> Validations {
        Validations(self.0 | rhs.0)
    }
}

/// Structural JID matching with the field subset the pattern carries.
///
/// A pattern with a resource matches only the identical full JID; a pattern
/// with a node but no resource matches any JID with the same bare address;
/// a domain-only pattern matches every JID at that domain. This is the
/// comparison block-list entries use.
pub fn jid_matches(pattern: &Jid, jid: &Jid) -> bool {
    if pattern.resource().is_some() {
        return pattern == jid;
    }
    if pattern.node().is_some() {
        return pattern.to_bare() == jid.to_bare();
    }
    pattern.domain() == jid.domain()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn j(s: &str) -> Jid {
        s.parse().unwrap()
    }

    #[test]
    fn test_validations_combine() {
        let v = Validations::USER_EXISTENCE | Validations::BLOCKED_DESTINATION;
        assert!(v.contains(Validations::USER_EXISTENCE));
        assert!(v.contains(Validations::BLOCKED_DESTINATION));

        let v = Validations::USER_EXISTENCE;
        assert!(!v.contains(Validations::BLOCKED_DESTINATION));
        assert!(Validations::NONE.contains(Validations::NONE));
    }

    #[test]
    fn test_jid_matches_full() {
        let pattern = j("romeo@huddle.chat/balcony");
        assert!(jid_matches(&pattern, &j("romeo@huddle.chat/balcony")));
        assert!(!jid_matches(&pattern, &j("romeo@huddle.chat/orchard")));
        assert!(!jid_matches(&pattern, &j("romeo@huddle.chat")));
    }

    #[test]
    fn test_jid_matches_bare() {
        let pattern = j("romeo@huddle.chat");
        assert!(jid_matches(&pattern, &j("romeo@huddle.chat")));
        assert!(jid_matches(&pattern, &j("romeo@huddle.chat/balcony")));
        assert!(!jid_matches(&pattern, &j("juliet@huddle.chat")));
    }

    #[test]
    fn test_jid_matches_domain_only() {
        let pattern = j("huddle.chat");
        assert!(jid_matches(&pattern, &j("romeo@huddle.chat")));
        assert!(jid_matches(&pattern, &j("juliet@huddle.chat/chamber")));
        assert!(!jid_matches(&pattern, &j("romeo@other.example")));
    }

    #[test]
    fn test_stanza_xml_round_trip() {
        let mut message = Message::new(Some(j("juliet@huddle.chat")));
        message.id = Some("msg-1".to_string());

        let xml = Stanza::Message(message).to_xml().unwrap();
        let parsed = Stanza::from_xml(&xml).unwrap();
        assert!(parsed.is_message());
        assert_eq!(parsed.to().unwrap().to_string(), "juliet@huddle.chat");
    }

    #[test]
    fn test_stanza_from_xml_rejects_unknown_element() {
        let err = Stanza::from_xml("<bogus xmlns='jabber:client'/>").unwrap_err();
        assert!(matches!(err, RoutingError::MalformedStanza(_)));
    }
}
