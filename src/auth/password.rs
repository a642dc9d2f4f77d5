use bytes::Bytes;

use crate::auth::{auth_failed_error, AuthStep};
use crate::codec::BufferReader;
use crate::codec::BufferWriter;
use crate::config::BoxFuture;
use crate::error::{Error, Result};

type GetClearTextPassword =
    std::sync::Arc<dyn Fn(String) -> BoxFuture<'static, Option<String>> + Send + Sync>;
type ValidatePassword =
    std::sync::Arc<dyn Fn(String, String, String) -> BoxFuture<'static, bool> + Send + Sync>;

pub struct PasswordFlow {
    username: String,
    get_clear_text_password: GetClearTextPassword,
    validate_credentials: Option<ValidatePassword>,
    completed: bool,
}

impl PasswordFlow {
    pub fn new(
        username: String,
        get_clear_text_password: GetClearTextPassword,
        validate_credentials: Option<ValidatePassword>,
    ) -> Self {
        PasswordFlow {
            username,
            get_clear_text_password,
            validate_credentials,
            completed: false,
        }
    }

    pub fn create_initial_auth_message(&self) -> Option<Bytes> {
        let mut w = BufferWriter::new();
        w.add_int32(3);
        Some(w.flush(Some(b'R')))
    }

    pub async fn handle_client_message(&mut self, payload: &[u8]) -> Result<AuthStep> {
        let mut r = BufferReader::new(payload);
        let password = r.cstring().map_err(|_| Error::Protocol("malformed password message".into()))?;

        let expected = (self.get_clear_text_password)(self.username.clone()).await;
        let expected = match expected {
            Some(e) => e,
            None => return Ok(AuthStep::Failed(auth_failed_error(&self.username))),
        };

        let ok = match &self.validate_credentials {
            Some(validate) => {
                validate(self.username.clone(), password.clone(), expected.clone()).await
            }
            None => password == expected,
        };

        if ok {
            self.completed = true;
            Ok(AuthStep::Success(vec![]))
        } else {
            Ok(AuthStep::Failed(auth_failed_error(&self.username)))
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn box_fut<T: Send + 'static>(v: T) -> BoxFuture<'static, T> {
        Box::pin(async move { v })
    }

    #[tokio::test]
    async fn accepts_matching_password() {
        let get: GetClearTextPassword =
            Arc::new(|_user| box_fut(Some("hunter2".to_string())));
        let mut flow = PasswordFlow::new("alice".into(), get, None);

        let mut msg = Vec::new();
        msg.extend_from_slice(b"hunter2\0");

        match flow.handle_client_message(&msg).await.unwrap() {
            AuthStep::Success(_) => assert!(flow.is_completed()),
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let get: GetClearTextPassword =
            Arc::new(|_user| box_fut(Some("hunter2".to_string())));
        let mut flow = PasswordFlow::new("alice".into(), get, None);

        let mut msg = Vec::new();
        msg.extend_from_slice(b"wrong\0");

        match flow.handle_client_message(&msg).await.unwrap() {
            AuthStep::Failed(err) => assert_eq!(err.code, "28P01"),
            _ => panic!("expected failure"),
        }
    }
}
