//! Identifiers, keys and data snapshots shared by the coordinator and its peers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use url::Url;

// ==================== Identifiers ====================

macro_rules! process_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Allocate a new process-unique identifier.
            pub fn new() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                Self(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            /// Get the raw ID value.
            pub fn raw(&self) -> u64 {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

process_identifier!(
    /// Identifier of a coordinator-side connection to one client process.
    ConnectionId
);
process_identifier!(
    /// Identifier of a registration.
    RegistrationId
);
process_identifier!(
    /// Identifier of a service worker instance.
    WorkerId
);
process_identifier!(
    /// Identifier of a browsing session (one coordinator per session).
    SessionId
);

/// Identifier of a job, allocated by the submitting connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub connection: ConnectionId,
    pub local: u64,
}

impl JobId {
    pub fn new(connection: ConnectionId, local: u64) -> Self {
        Self { connection, local }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.connection, self.local)
    }
}

/// Identifier of a page or worker client, scoped to the connection that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId {
    pub connection: ConnectionId,
    pub context: u64,
}

impl ClientId {
    pub fn new(connection: ConnectionId, context: u64) -> Self {
        Self {
            connection,
            context,
        }
    }
}

// ==================== Origins and keys ====================

/// Serializable tuple origin (scheme, host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityOriginData {
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
}

impl SecurityOriginData {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
        }
    }

    /// Origin of a URL. Default ports are normalised away.
    pub fn from_url(url: &Url) -> Self {
        Self {
            protocol: url.scheme().to_string(),
            host: url.host_str().unwrap_or_default().to_string(),
            port: url.port(),
        }
    }

    /// Check whether `url` belongs to this origin.
    pub fn contains(&self, url: &Url) -> bool {
        *self == Self::from_url(url)
    }
}

impl fmt::Display for SecurityOriginData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.protocol, self.host, port),
            None => write!(f, "{}://{}", self.protocol, self.host),
        }
    }
}

/// A client's (top-level origin, own origin) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrigin {
    pub top_origin: SecurityOriginData,
    pub client_origin: SecurityOriginData,
}

/// Key of a registration: top-level origin plus scope URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationKey {
    pub top_origin: SecurityOriginData,
    pub scope: Url,
}

impl RegistrationKey {
    /// Build a key; the scope's fragment is not part of it.
    pub fn new(top_origin: SecurityOriginData, mut scope: Url) -> Self {
        scope.set_fragment(None);
        Self { top_origin, scope }
    }

    /// The client origin whose pages this registration may control.
    pub fn client_origin(&self) -> ClientOrigin {
        ClientOrigin {
            top_origin: self.top_origin.clone(),
            client_origin: SecurityOriginData::from_url(&self.scope),
        }
    }

    /// Whether a client at `client_url` under `top_origin` falls inside this scope.
    pub fn is_matching(&self, top_origin: &SecurityOriginData, client_url: &Url) -> bool {
        self.top_origin == *top_origin
            && SecurityOriginData::from_url(&self.scope).contains(client_url)
            && client_url.as_str().starts_with(self.scope.as_str())
    }

    /// Length of the scope, used to pick the most specific match.
    pub fn scope_length(&self) -> usize {
        self.scope.as_str().len()
    }
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.top_origin, self.scope)
    }
}

// ==================== States ====================

/// Service worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Script fetched and parsed, not yet installing.
    #[default]
    Parsed,
    /// Install event dispatched.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activate event dispatched.
    Activating,
    /// Active and able to control clients.
    Activated,
    /// Replaced or failed. Terminal.
    Redundant,
}

impl ServiceWorkerState {
    /// The state that legitimately follows this one, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Parsed => Some(Self::Installing),
            Self::Installing => Some(Self::Installed),
            Self::Installed => Some(Self::Activating),
            Self::Activating => Some(Self::Activated),
            Self::Activated | Self::Redundant => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Redundant
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker slot of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationState {
    Installing,
    Waiting,
    Active,
}

/// Cache policy applied when fetching worker scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateViaCache {
    #[default]
    Imports,
    All,
    None,
}

/// Worker script type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerType {
    #[default]
    Classic,
    Module,
}

/// HTTP cache mode requested for a script fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchCacheMode {
    Default,
    NoCache,
}

/// Policy derived from the script response headers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponsePolicyHeaders {
    pub content_security_policy: Option<String>,
    pub referrer_policy: Option<String>,
}

// ==================== Snapshots ====================

/// Snapshot of a worker sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerData {
    pub id: WorkerId,
    pub registration_id: RegistrationId,
    pub script_url: Url,
    pub state: ServiceWorkerState,
    pub worker_type: WorkerType,
}

/// Snapshot of a registration sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationData {
    pub key: RegistrationKey,
    pub id: RegistrationId,
    pub scope_url: Url,
    pub update_via_cache: UpdateViaCache,
    pub last_update_time: Option<SystemTime>,
    pub installing: Option<WorkerData>,
    pub waiting: Option<WorkerData>,
    pub active: Option<WorkerData>,
}

// ==================== Clients ====================

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameType {
    Auxiliary,
    #[default]
    TopLevel,
    Nested,
    None,
}

/// A page or worker client as reported by its process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientData {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    pub frame_type: FrameType,
}

/// Options for `clients.matchAll()`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClientQueryOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

impl ClientQueryOptions {
    pub fn accepts(&self, client_type: ClientType) -> bool {
        self.client_type == ClientType::All || self.client_type == client_type
    }
}

// ==================== Job payloads ====================

/// Outcome of a script fetch performed by the client process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub job_id: JobId,
    pub registration_key: RegistrationKey,
    pub script: String,
    pub policy: ResponsePolicyHeaders,
    pub error: Option<String>,
}

impl FetchResult {
    pub fn success(job_id: JobId, registration_key: RegistrationKey, script: impl Into<String>) -> Self {
        Self {
            job_id,
            registration_key,
            script: script.into(),
            policy: ResponsePolicyHeaders::default(),
            error: None,
        }
    }

    pub fn failure(job_id: JobId, registration_key: RegistrationKey, error: impl Into<String>) -> Self {
        Self {
            job_id,
            registration_key,
            script: String::new(),
            policy: ResponsePolicyHeaders::default(),
            error: Some(error.into()),
        }
    }
}

/// Everything the execution engine needs to start a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextData {
    pub job_id: Option<JobId>,
    pub registration_id: RegistrationId,
    pub registration_key: RegistrationKey,
    pub worker_id: WorkerId,
    /// Echoed back in the termination event for this context.
    pub generation: u64,
    pub script_url: Url,
    pub script: String,
    pub policy: ResponsePolicyHeaders,
    pub worker_type: WorkerType,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_identifiers_are_unique() {
        let a = RegistrationId::new();
        let b = RegistrationId::new();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn test_origin_from_url() {
        let origin = SecurityOriginData::from_url(&url("https://example.com:8443/a/b"));
        assert_eq!(origin.to_string(), "https://example.com:8443");

        let default_port = SecurityOriginData::from_url(&url("https://example.com:443/"));
        assert_eq!(default_port.port, None);
    }

    #[test]
    fn test_key_matching() {
        let top = SecurityOriginData::from_url(&url("https://example.com/"));
        let key = RegistrationKey::new(top.clone(), url("https://example.com/app/"));

        assert!(key.is_matching(&top, &url("https://example.com/app/index.html")));
        assert!(!key.is_matching(&top, &url("https://example.com/other/")));
        assert!(!key.is_matching(&top, &url("https://evil.com/app/")));

        let other_top = SecurityOriginData::from_url(&url("https://frame.net/"));
        assert!(!key.is_matching(&other_top, &url("https://example.com/app/")));
    }

    #[test]
    fn test_key_ignores_scope_fragment() {
        let top = SecurityOriginData::from_url(&url("https://example.com/"));
        let key = RegistrationKey::new(top.clone(), url("https://example.com/app/#main"));

        assert_eq!(key.scope.as_str(), "https://example.com/app/");
        assert_eq!(key, RegistrationKey::new(top.clone(), url("https://example.com/app/")));
        assert!(key.is_matching(&top, &url("https://example.com/app/page.html")));
    }

    #[test]
    fn test_state_progression() {
        assert_eq!(
            ServiceWorkerState::Parsed.next(),
            Some(ServiceWorkerState::Installing)
        );
        assert_eq!(ServiceWorkerState::Activated.next(), None);
        assert!(ServiceWorkerState::Redundant.is_terminal());
    }

    #[test]
    fn test_query_options_accepts() {
        let all = ClientQueryOptions {
            include_uncontrolled: true,
            client_type: ClientType::All,
        };
        assert!(all.accepts(ClientType::Worker));

        let windows = ClientQueryOptions::default();
        assert!(windows.accepts(ClientType::Window));
        assert!(!windows.accepts(ClientType::Worker));
    }
}
