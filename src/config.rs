/// Per-connection configuration: authentication method, optional TLS
/// material, server_version, and the hook closures the engine invokes at
/// each lifecycle point.
///
/// Hooks are `Arc`-wrapped so one `ConnectionConfig` can be cheaply cloned
/// and shared across many connections, as §5 requires ("Configured
/// callbacks may be shared across connections and must themselves be
/// reentrant").
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::HookResult;
use crate::query::CommandResponse;
use crate::state::{ConnectionState, DetachHandle};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone)]
pub enum ServerVersion {
    Static(String),
    Dynamic(Arc<dyn Fn(ConnectionState) -> BoxFuture<'static, String> + Send + Sync>),
}

#[derive(Clone, Debug)]
pub struct TlsMaterial {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
    pub ca: Option<Vec<u8>>,
    pub passphrase: Option<String>,
}

#[derive(Clone)]
pub enum TlsConfig {
    Static(TlsMaterial),
    /// Invoked with the client's SNI hostname (if any), letting the caller
    /// select per-hostname certificates.
    Dynamic(Arc<dyn Fn(Option<String>) -> BoxFuture<'static, TlsMaterial> + Send + Sync>),
}

/// What an `on_message` hook may hand back instead of letting the engine's
/// built-in handling run.
pub enum OnMessageOutcome {
    Bytes(Bytes),
    Stream(BoxStream<'static, Bytes>),
}

type GetClearTextPassword =
    Arc<dyn Fn(String) -> BoxFuture<'static, Option<String>> + Send + Sync>;
type ValidatePassword = Arc<dyn Fn(String, String, String) -> BoxFuture<'static, bool> + Send + Sync>;

type GetPreHashedPassword =
    Arc<dyn Fn(String) -> BoxFuture<'static, Option<String>> + Send + Sync>;
type ValidateMd5 = Arc<dyn Fn(String, String, String) -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Clone)]
pub struct ScramData {
    pub salt_b64: String,
    pub iterations: u32,
    pub stored_key_b64: String,
    pub server_key_b64: String,
}

type GetScramData = Arc<dyn Fn(String) -> BoxFuture<'static, Option<ScramData>> + Send + Sync>;
type ValidateScram =
    Arc<dyn Fn(String, [u8; 32], [u8; 32]) -> BoxFuture<'static, bool> + Send + Sync>;

type ValidateCert = Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Clone)]
pub enum AuthConfig {
    Trust,
    Password {
        get_clear_text_password: GetClearTextPassword,
        validate_credentials: Option<ValidatePassword>,
    },
    Md5 {
        get_pre_hashed_password: GetPreHashedPassword,
        validate_credentials: Option<ValidateMd5>,
    },
    ScramSha256 {
        get_scram_sha256_data: GetScramData,
        validate_credentials: Option<ValidateScram>,
    },
    Cert {
        validate_credentials: Option<ValidateCert>,
    },
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::Trust
    }
}

// Every hook may raise a structured `BackendError` (framed and sent to the
// client before closing) or any other error (logged, connection aborted
// without attempting to frame it). See spec §7 and §4.4.5. Every hook also
// receives a `DetachHandle` it may call to end engine processing early and
// surrender the stream back to the embedder (§4.4.2, §5 "Detach contract").
type OnTlsUpgrade =
    Arc<dyn Fn(ConnectionState, DetachHandle) -> BoxFuture<'static, HookResult<()>> + Send + Sync>;
type OnStartup =
    Arc<dyn Fn(ConnectionState, DetachHandle) -> BoxFuture<'static, HookResult<()>> + Send + Sync>;
type OnAuthenticated =
    Arc<dyn Fn(ConnectionState, DetachHandle) -> BoxFuture<'static, HookResult<()>> + Send + Sync>;
type OnMessage = Arc<
    dyn Fn(Bytes, ConnectionState, DetachHandle) -> BoxFuture<'static, HookResult<Option<OnMessageOutcome>>>
        + Send
        + Sync,
>;
type OnQuery = Arc<
    dyn Fn(String, ConnectionState, DetachHandle) -> BoxFuture<'static, HookResult<Option<Vec<CommandResponse>>>>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub on_tls_upgrade: Option<OnTlsUpgrade>,
    pub on_startup: Option<OnStartup>,
    pub on_authenticated: Option<OnAuthenticated>,
    pub on_message: Option<OnMessage>,
    pub on_query: Option<OnQuery>,
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub server_version: Option<ServerVersion>,
    pub auth: AuthConfig,
    pub tls: Option<TlsConfig>,
    pub hooks: Hooks,
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            server_version: None,
            auth: AuthConfig::default(),
            tls: None,
            hooks: Hooks::default(),
        }
    }
}

/// Builder mirroring the shape of pgcat's own TOML-driven `Config`
/// assembly, adapted here to build in-process rather than deserialize.
#[derive(Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn server_version(mut self, version: impl Into<String>) -> Self {
        self.config.server_version = Some(ServerVersion::Static(version.into()));
        self
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.config.auth = auth;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = Some(tls);
        self
    }

    pub fn on_tls_upgrade(mut self, f: OnTlsUpgrade) -> Self {
        self.config.hooks.on_tls_upgrade = Some(f);
        self
    }

    pub fn on_startup(mut self, f: OnStartup) -> Self {
        self.config.hooks.on_startup = Some(f);
        self
    }

    pub fn on_authenticated(mut self, f: OnAuthenticated) -> Self {
        self.config.hooks.on_authenticated = Some(f);
        self
    }

    pub fn on_message(mut self, f: OnMessage) -> Self {
        self.config.hooks.on_message = Some(f);
        self
    }

    pub fn on_query(mut self, f: OnQuery) -> Self {
        self.config.hooks.on_query = Some(f);
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}
