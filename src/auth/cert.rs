use bytes::Bytes;

use crate::auth::AuthStep;
use crate::config::BoxFuture;
use crate::error::Result;
use crate::error_response::BackendError;
use crate::state::TlsInfo;

type ValidateCert = std::sync::Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, bool> + Send + Sync>;

/// Client certificate auth completes immediately once the TLS handshake
/// has happened; it never reads a client frame of its own.
pub struct CertFlow {
    username: String,
    validate_credentials: Option<ValidateCert>,
    completed: bool,
}

impl CertFlow {
    pub fn new(username: String, validate_credentials: Option<ValidateCert>) -> Self {
        CertFlow {
            username,
            validate_credentials,
            completed: false,
        }
    }

    pub fn create_initial_auth_message(&self) -> Option<Bytes> {
        None
    }

    /// Not driven through `handle_client_message` like the other flows.
    /// The connection engine calls this directly right after Startup when
    /// `tls_info` is already known.
    pub async fn evaluate(&mut self, tls_info: Option<&TlsInfo>) -> AuthStep {
        let tls_info = match tls_info {
            Some(info) => info,
            None => {
                return AuthStep::Failed(BackendError::fatal(
                    "08000",
                    "ssl connection required when auth mode is 'certificate'",
                ))
            }
        };

        let cert = match &tls_info.client_certificate {
            Some(c) => c.clone(),
            None => {
                return AuthStep::Failed(BackendError::fatal(
                    "08000",
                    "client certificate required",
                ))
            }
        };

        let ok = match &self.validate_credentials {
            Some(validate) => validate(self.username.clone(), cert.clone()).await,
            None => match crate::tls::common_name_from_der(&cert) {
                Some(cn) => cn == self.username,
                None => false,
            },
        };

        if ok {
            self.completed = true;
            AuthStep::Success(vec![])
        } else {
            AuthStep::Failed(BackendError::fatal("08000", "client certificate is invalid"))
        }
    }

    pub async fn handle_client_message(&mut self, _payload: &[u8]) -> Result<AuthStep> {
        Err(crate::error::Error::Protocol(
            "certificate auth does not expect a client message".into(),
        ))
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}
