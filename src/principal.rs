//! Authentication and per-principal authorization
//!
//! The core never stores credentials itself — it calls out to an
//! `Authenticator` collaborator and trusts the `Principal` it returns.
//! Identity and topic-permission authorization live on a single
//! `Principal` here, since the core has no wire-level username/password
//! framing of its own to hang a separate auth stage off of.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::quota::Quota;
use crate::topic::TopicTrie;

/// Opaque identifier for an authenticated principal, scoped to the
/// `Authenticator` that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrincipalId(pub Arc<str>);

impl PrincipalId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A set of topic filters checked by membership only — built on the same
/// trie as subscriptions and retained messages, with `()` as the leaf
/// value.
#[derive(Debug, Default)]
pub struct TopicFilterSet(TopicTrie<()>);

impl TopicFilterSet {
    pub fn new() -> Self {
        Self(TopicTrie::new())
    }

    /// A set granting every topic (`#`) — the default for a principal with
    /// no explicit restriction.
    pub fn allow_all() -> Self {
        let mut set = Self::new();
        set.insert("#");
        set
    }

    /// A set granting nothing.
    pub fn deny_all() -> Self {
        Self::new()
    }

    pub fn insert(&mut self, filter: &str) {
        self.0.insert(filter, ());
    }

    /// `true` iff `topic` is covered by at least one filter in the set.
    pub fn permits(&self, topic: &str) -> bool {
        self.0.matches_any(topic)
    }
}

/// Resource limits and topic-filter permission sets granted to an
/// authenticated principal.
#[derive(Debug)]
pub struct Principal {
    pub username: Option<String>,
    pub quota: Quota,
    pub publish_permissions: TopicFilterSet,
    pub subscribe_permissions: TopicFilterSet,
    pub retain_permissions: TopicFilterSet,
}

impl Principal {
    pub fn new(username: Option<String>, quota: Quota) -> Self {
        Self {
            username,
            quota,
            publish_permissions: TopicFilterSet::allow_all(),
            subscribe_permissions: TopicFilterSet::allow_all(),
            retain_permissions: TopicFilterSet::allow_all(),
        }
    }
}

/// Credentials carried on a `ConnectionRequest`, as decoded from a CONNECT
/// packet by the (external) wire codec.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

/// A client's connection attempt, as handed to the core by the (external)
/// transport/codec layer.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub client_identifier: String,
    pub clean_session: bool,
    pub secure: bool,
    pub credentials: Option<Credentials>,
    pub certificate_chain: Option<Vec<u8>>,
    pub http_headers: Option<HashMap<String, String>>,
    pub remote_address: Option<SocketAddr>,
}

impl ConnectionRequest {
    pub fn new(client_identifier: impl Into<String>, clean_session: bool) -> Self {
        Self {
            client_identifier: client_identifier.into(),
            clean_session,
            secure: false,
            credentials: None,
            certificate_chain: None,
            http_headers: None,
            remote_address: None,
        }
    }
}

/// Raised by an `Authenticator` implementation when it cannot produce a
/// verdict (a downstream identity service is unreachable, for example).
/// `Broker::with_session` treats this the same as any other failure mode:
/// `RejectReason::ServerUnavailable`.
#[derive(Debug, Clone)]
pub struct AuthError(pub String);

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "authentication service error: {}", self.0)
    }
}

impl std::error::Error for AuthError {}

/// External collaborator that turns a `ConnectionRequest` into a
/// `Principal`. The core calls this and trusts the result; it never
/// inspects credentials itself.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify `request` and return the `PrincipalId` to authenticate as, or
    /// `None` if the request carries no valid identity (anonymous-denied,
    /// bad password, and so on). Returning `Err` is a service failure, not
    /// a denial.
    async fn authenticate(&self, request: &ConnectionRequest) -> Result<Option<PrincipalId>, AuthError>;

    /// Resolve a previously-authenticated principal id to its `Principal`.
    /// `None` means the id no longer resolves (principal deleted between
    /// authenticate and lookup, for example) and is treated as
    /// `NotAuthorized`.
    async fn get_principal(&self, id: &PrincipalId) -> Option<Arc<Principal>>;
}

/// An in-memory `Authenticator` over a static username/password table, with
/// a single shared set of permissions for every registered user. Useful as
/// a default and in tests; production deployments are expected to supply
/// their own `Authenticator` backed by whatever identity store they use.
pub struct StaticAuthenticator {
    users: RwLock<HashMap<String, (Option<Bytes>, Arc<Principal>)>>,
    allow_anonymous: bool,
}

impl StaticAuthenticator {
    pub fn new(allow_anonymous: bool) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            allow_anonymous,
        }
    }

    /// Register a user, requiring `password` to match exactly on connect.
    /// A `None` password accepts the username with no password check.
    pub fn add_user(&self, username: impl Into<String>, password: Option<Bytes>, principal: Principal) {
        self.users
            .write()
            .insert(username.into(), (password, Arc::new(principal)));
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(
        &self,
        request: &ConnectionRequest,
    ) -> Result<Option<PrincipalId>, AuthError> {
        let Some(credentials) = &request.credentials else {
            return Ok(self
                .allow_anonymous
                .then(|| PrincipalId::new("anonymous")));
        };

        let Some(username) = &credentials.username else {
            return Ok(self
                .allow_anonymous
                .then(|| PrincipalId::new("anonymous")));
        };

        let users = self.users.read();
        match users.get(username) {
            Some((Some(expected), _)) if credentials.password.as_ref() != Some(expected) => {
                Ok(None)
            }
            Some(_) => Ok(Some(PrincipalId::new(username.clone()))),
            None => Ok(None),
        }
    }

    async fn get_principal(&self, id: &PrincipalId) -> Option<Arc<Principal>> {
        if id.as_str() == "anonymous" && self.allow_anonymous {
            return Some(Arc::new(Principal::new(None, Quota::default())));
        }
        self.users.read().get(id.as_str()).map(|(_, p)| p.clone())
    }
}
