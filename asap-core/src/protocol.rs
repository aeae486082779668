//! ASAP protocol data units and version.

use serde::{Deserialize, Serialize};

use crate::era::Era;
use crate::error::AsapError;

/// Current protocol version. Carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum length of a peer name in bytes.
pub const MAX_PEER_NAME_LEN: usize = 255;

/// Uri used for the introduction offer a node sends when a connection starts.
pub const INTRODUCTION_URI: &str = "asap://introduction";

/// Format of the introduction offer.
pub const INTRODUCTION_FORMAT: &str = "application/x-asap-introduction";

/// All PDUs exchanged over a connection. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pdu {
    /// Offer: sender announces itself (and optionally a channel it holds at an era).
    Offer {
        sender: String,
        format: String,
        uri: String,
        era: Era,
    },
    /// Interest: sender wants content of this format.
    Interest { sender: String, format: String },
    /// Assimilate: content of one chunk, attributed to sender.
    Assimilate {
        sender: String,
        format: String,
        uri: String,
        era: Era,
        messages: Vec<Vec<u8>>,
    },
}

impl Pdu {
    /// Declared sender of this PDU.
    pub fn sender(&self) -> &str {
        match self {
            Pdu::Offer { sender, .. }
            | Pdu::Interest { sender, .. }
            | Pdu::Assimilate { sender, .. } => sender,
        }
    }

    /// Format (application namespace) this PDU belongs to.
    pub fn format(&self) -> &str {
        match self {
            Pdu::Offer { format, .. }
            | Pdu::Interest { format, .. }
            | Pdu::Assimilate { format, .. } => format,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Pdu::Offer { .. } => "offer",
            Pdu::Interest { .. } => "interest",
            Pdu::Assimilate { .. } => "assimilate",
        }
    }

    /// Introduction offer for `owner`.
    pub fn introduction(owner: &str) -> Pdu {
        Pdu::Offer {
            sender: owner.to_string(),
            format: INTRODUCTION_FORMAT.to_string(),
            uri: INTRODUCTION_URI.to_string(),
            era: crate::era::INITIAL_ERA,
        }
    }

    /// Check fields a peer relies on. Fails with a protocol fault.
    pub fn validate(&self) -> Result<(), AsapError> {
        validate_peer_name(self.sender())
    }
}

/// Peer names must be non-empty, bounded and free of control characters.
pub fn validate_peer_name(name: &str) -> Result<(), AsapError> {
    if name.is_empty() {
        return Err(AsapError::Protocol("empty peer name".into()));
    }
    if name.len() > MAX_PEER_NAME_LEN {
        return Err(AsapError::Protocol(format!(
            "peer name longer than {} bytes",
            MAX_PEER_NAME_LEN
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(AsapError::Protocol(
            "peer name contains control characters".into(),
        ));
    }
    Ok(())
}
