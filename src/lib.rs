//! Session, topic-trie, retained-store and broker core of an MQTT 3.1.1
//! broker.
//!
//! This crate is the in-memory engine that tracks per-client in-flight
//! message transactions, matches topics against subscription and permission
//! filters, and routes downstream publishes to matching sessions. It
//! consumes and produces only decoded packets (see [`protocol::ServerPacket`])
//! and calls out to an [`principal::Authenticator`] collaborator; it performs
//! no network I/O of its own. The wire codec, transport plumbing, CLI, and
//! authentication backend are external collaborators, not part of this
//! crate — see `DESIGN.md` for the full scope decision.

pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod principal;
pub mod protocol;
pub mod quota;
pub mod session;
pub mod topic;

pub use broker::Broker;
pub use error::{QueueOverflow, RejectReason};
pub use message::{Message, TopicFilter, TopicName};
pub use principal::{Authenticator, ConnectionRequest, Principal, PrincipalId};
pub use protocol::{PacketId, QoS, ServerPacket};
pub use quota::Quota;
pub use session::{Session, SessionHandle, SessionId};
pub use topic::TopicTrie;
