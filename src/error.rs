//! Core error types
//!
//! Most anomalies the core encounters are absorbed silently: an unknown
//! PUBACK packet id is ignored, a permission check failure is a silent drop.
//! The handful that do surface to a caller are collected here.

use std::fmt;

/// Outcome of a rejected `Broker::with_session` call.
///
/// This is the CONNACK-equivalent of the core: the network layer maps these
/// onto the wire return codes it actually sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The authenticator failed (raised an error rather than returning a
    /// verdict). The client was not at fault; treated as a transient
    /// service failure.
    ServerUnavailable,
    /// The authenticator returned no principal, or the principal looked up
    /// for an authenticated id does not exist.
    NotAuthorized,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ServerUnavailable => write!(f, "server unavailable"),
            RejectReason::NotAuthorized => write!(f, "not authorized"),
        }
    }
}

impl std::error::Error for RejectReason {}

/// Returned by `Session::enqueue_message` when a QoS 1/2 outbound queue or
/// the packet-identifier pool is exhausted. The caller is responsible for
/// cancelling the session's owner slot in response (see `SessionHandle::cancel_owner`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOverflow;

impl fmt::Display for QueueOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "outbound queue or packet-identifier pool exhausted")
    }
}

impl std::error::Error for QueueOverflow {}
