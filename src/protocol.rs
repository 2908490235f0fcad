//! Decoded-packet data model
//!
//! The core never parses or serializes MQTT control packets — that is an
//! external wire codec's job. This module defines only the shape the codec
//! and the core agree on: `QoS`, the packet-identifier alias, and the
//! [`ServerPacket`] surface the `Session` produces for the network layer to
//! drain via `dequeue` and write to the wire.

use crate::message::Message;

/// MQTT Quality-of-Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// The lower of two QoS levels — used to downgrade a publish to a
    /// subscription's granted QoS.
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// A 16-bit packet identifier, correlating QoS 1/2 acknowledgements. A
/// `Publish`'s `packet_id` is `None` for an outbound QoS 0 publish, which
/// carries no identifier at all.
pub type PacketId = u16;

/// The packets a `Session` can produce, drained by `Session::dequeue` and
/// written to the wire by the (external) network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    /// An application message delivered to this session.
    Publish {
        packet_id: Option<PacketId>,
        duplicate: bool,
        message: Message,
    },
    PublishAcknowledged(PacketId),
    PublishReceived(PacketId),
    PublishRelease(PacketId),
    PublishComplete(PacketId),
    /// `granted[i]` is `Some(qos)` if filter `i` in the SUBSCRIBE was
    /// permitted, `None` if it was denied.
    SubscribeAcknowledged {
        packet_id: PacketId,
        granted: Vec<Option<QoS>>,
    },
    UnsubscribeAcknowledged(PacketId),
    PingResponse,
}
