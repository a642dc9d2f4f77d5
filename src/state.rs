/// Connection state exposed to hook callbacks, and the lifecycle `step` the
/// engine advances through.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AwaitingInitialMessage,
    PerformingAuthentication,
    ReadyForQuery,
}

#[derive(Debug, Clone)]
pub struct ClientParams {
    pub user: String,
    pub other: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    pub server_name: Option<String>,
    pub client_certificate: Option<Vec<u8>>,
}

/// Read-only view handed to hooks. Mirrors the engine's internal state but
/// never exposes mutable handles to it. Hooks observe, they don't mutate.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub has_started: bool,
    pub is_authenticated: bool,
    pub client_params: Option<ClientParams>,
    pub tls_info: Option<TlsInfo>,
    pub step: Step,
}

impl ConnectionState {
    pub fn new() -> Self {
        ConnectionState {
            has_started: false,
            is_authenticated: false,
            client_params: None,
            tls_info: None,
            step: Step::AwaitingInitialMessage,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// A cheaply-cloneable handle hooks use to ask the engine to stop processing
/// and surrender the stream (the source's "the hook detaches" contract in
/// §4.4.2 and §5 "Detach contract"). Requesting detach does not by itself
/// hand back the stream. `Connection::run` observes the request and returns
/// control to the caller, who then calls `Connection::detach` to take the
/// stream and any residual buffered bytes.
#[derive(Clone, Default)]
pub struct DetachHandle(Arc<AtomicBool>);

impl DetachHandle {
    pub fn new() -> Self {
        DetachHandle(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
