/// Authentication flows: one small state machine per method. Trust has no
/// flow object (authentication completes immediately after Startup); the
/// other four are represented as variants of [`AuthFlow`] rather than a
/// class hierarchy, per the polymorphism design note.
mod cert;
mod md5;
mod password;
mod scram;

pub use cert::CertFlow;
pub use md5::Md5Flow;
pub use password::PasswordFlow;
pub use scram::{create_scram_data, ScramFlow};

use bytes::Bytes;

use crate::config::AuthConfig;
use crate::error_response::BackendError;

/// Outcome of handing one client message to an in-progress auth flow.
pub enum AuthStep {
    /// Emit these frames and keep waiting for more client input.
    Continue(Vec<Bytes>),
    /// Authentication failed; emit this error, then close the connection.
    Failed(BackendError),
    /// Authentication succeeded. Any frames that needed sending (e.g.
    /// AuthenticationSASLFinal) are included here; the engine still emits
    /// AuthenticationOk itself afterward.
    Success(Vec<Bytes>),
}

pub enum AuthFlow {
    Password(PasswordFlow),
    Md5(Md5Flow),
    Scram(ScramFlow),
    Cert(CertFlow),
}

impl AuthFlow {
    /// Builds the flow for `auth`, if any (Trust yields `None`).
    pub fn new(auth: &AuthConfig, username: &str) -> Option<AuthFlow> {
        match auth {
            AuthConfig::Trust => None,
            AuthConfig::Password {
                get_clear_text_password,
                validate_credentials,
            } => Some(AuthFlow::Password(PasswordFlow::new(
                username.to_string(),
                get_clear_text_password.clone(),
                validate_credentials.clone(),
            ))),
            AuthConfig::Md5 {
                get_pre_hashed_password,
                validate_credentials,
            } => Some(AuthFlow::Md5(Md5Flow::new(
                username.to_string(),
                get_pre_hashed_password.clone(),
                validate_credentials.clone(),
            ))),
            AuthConfig::ScramSha256 {
                get_scram_sha256_data,
                validate_credentials,
            } => Some(AuthFlow::Scram(ScramFlow::new(
                username.to_string(),
                get_scram_sha256_data.clone(),
                validate_credentials.clone(),
            ))),
            AuthConfig::Cert { validate_credentials } => {
                Some(AuthFlow::Cert(CertFlow::new(
                    username.to_string(),
                    validate_credentials.clone(),
                )))
            }
        }
    }

    pub fn create_initial_auth_message(&self) -> Option<Bytes> {
        match self {
            AuthFlow::Password(f) => f.create_initial_auth_message(),
            AuthFlow::Md5(f) => f.create_initial_auth_message(),
            AuthFlow::Scram(f) => f.create_initial_auth_message(),
            AuthFlow::Cert(f) => f.create_initial_auth_message(),
        }
    }

    pub async fn handle_client_message(&mut self, payload: &[u8]) -> crate::error::Result<AuthStep> {
        match self {
            AuthFlow::Password(f) => f.handle_client_message(payload).await,
            AuthFlow::Md5(f) => f.handle_client_message(payload).await,
            AuthFlow::Scram(f) => f.handle_client_message(payload).await,
            AuthFlow::Cert(f) => f.handle_client_message(payload).await,
        }
    }

    pub fn is_completed(&self) -> bool {
        match self {
            AuthFlow::Password(f) => f.is_completed(),
            AuthFlow::Md5(f) => f.is_completed(),
            AuthFlow::Scram(f) => f.is_completed(),
            AuthFlow::Cert(f) => f.is_completed(),
        }
    }
}

pub(crate) fn auth_failed_error(username: &str) -> BackendError {
    BackendError::fatal(
        "28P01",
        format!("password authentication failed for user \"{}\"", username),
    )
}
