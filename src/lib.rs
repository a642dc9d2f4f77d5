/// An embeddable server-side implementation of the PostgreSQL v3
/// frontend/backend wire protocol.
///
/// Consumers wrap a bidirectional byte stream in a [`Connection`], supply
/// hook callbacks and an authentication method through [`ConnectionConfig`],
/// and call [`Connection::run`] to drive a client through TLS upgrade,
/// startup, authentication, and the steady-state query loop. This crate
/// never parses SQL or executes queries itself. `on_query` delegates that
/// to whatever engine the consumer wraps.
pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod error_response;
pub mod framing;
pub mod messages;
pub mod query;
pub mod state;
pub mod tls;

pub use auth::create_scram_data;
pub use config::{
    AuthConfig, ConnectionConfig, ConnectionConfigBuilder, Hooks, OnMessageOutcome, ScramData,
    ServerVersion, TlsConfig, TlsMaterial,
};
pub use connection::Connection;
pub use error::{Error, HookError, HookResult, Result};
pub use error_response::{BackendError, Severity};
pub use query::{CommandResponse, Field, Row};
pub use state::{ClientParams, ConnectionState, DetachHandle, Step, TlsInfo};
pub use tls::{common_name_from_der, BoxDuplex, Duplex, RustlsTlsAcceptor, TlsAcceptor};
