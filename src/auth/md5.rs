use bytes::Bytes;

use crate::auth::{auth_failed_error, AuthStep};
use crate::codec::{BufferReader, BufferWriter};
use crate::config::BoxFuture;
use crate::crypto::{constant_time_eq, md5_challenge_response, random_bytes};
use crate::error::{Error, Result};

type GetPreHashedPassword =
    std::sync::Arc<dyn Fn(String) -> BoxFuture<'static, Option<String>> + Send + Sync>;
type ValidateMd5 =
    std::sync::Arc<dyn Fn(String, String, String) -> BoxFuture<'static, bool> + Send + Sync>;

pub struct Md5Flow {
    username: String,
    salt: [u8; 4],
    get_pre_hashed_password: GetPreHashedPassword,
    validate_credentials: Option<ValidateMd5>,
    completed: bool,
}

impl Md5Flow {
    pub fn new(
        username: String,
        get_pre_hashed_password: GetPreHashedPassword,
        validate_credentials: Option<ValidateMd5>,
    ) -> Self {
        Md5Flow {
            username,
            salt: random_bytes::<4>(),
            get_pre_hashed_password,
            validate_credentials,
            completed: false,
        }
    }

    pub fn create_initial_auth_message(&self) -> Option<Bytes> {
        let mut w = BufferWriter::new();
        w.add_int32(5);
        w.add(&self.salt);
        Some(w.flush(Some(b'R')))
    }

    pub async fn handle_client_message(&mut self, payload: &[u8]) -> Result<AuthStep> {
        let mut r = BufferReader::new(payload);
        let response = r
            .cstring()
            .map_err(|_| Error::Protocol("malformed md5 password message".into()))?;

        let pre_hash = (self.get_pre_hashed_password)(self.username.clone()).await;
        let pre_hash = match pre_hash {
            Some(p) => p,
            None => return Ok(AuthStep::Failed(auth_failed_error(&self.username))),
        };

        let ok = match &self.validate_credentials {
            Some(validate) => {
                validate(self.username.clone(), response.clone(), pre_hash.clone()).await
            }
            None => {
                let expected = md5_challenge_response(&pre_hash, &self.salt);
                constant_time_eq(response.as_bytes(), expected.as_bytes())
            }
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
    use crate::crypto::md5_pre_hash;
    use std::sync::Arc;

    fn box_fut<T: Send + 'static>(v: T) -> BoxFuture<'static, T> {
        Box::pin(async move { v })
    }

    #[tokio::test]
    async fn happy_path_matches_reference_client() {
        let pre_hash = md5_pre_hash("postgres", "postgres");
        let get: GetPreHashedPassword = Arc::new({
            let pre_hash = pre_hash.clone();
            move |_user| box_fut(Some(pre_hash.clone()))
        });
        let mut flow = Md5Flow::new("postgres".into(), get, None);
        flow.salt = [1, 2, 3, 4];

        let response = md5_challenge_response(&pre_hash, &flow.salt);
        let mut msg = Vec::new();
        msg.extend_from_slice(response.as_bytes());
        msg.push(0);

        match flow.handle_client_message(&msg).await.unwrap() {
            AuthStep::Success(_) => assert!(flow.is_completed()),
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn wrong_password_is_fatal() {
        let pre_hash = md5_pre_hash("postgres", "postgres");
        let get: GetPreHashedPassword = Arc::new({
            let pre_hash = pre_hash.clone();
            move |_user| box_fut(Some(pre_hash.clone()))
        });
        let mut flow = Md5Flow::new("postgres".into(), get, None);
        flow.salt = [1, 2, 3, 4];

        let wrong_pre_hash = md5_pre_hash("wrong", "postgres");
        let response = md5_challenge_response(&wrong_pre_hash, &flow.salt);
        let mut msg = Vec::new();
        msg.extend_from_slice(response.as_bytes());
        msg.push(0);

        match flow.handle_client_message(&msg).await.unwrap() {
            AuthStep::Failed(err) => assert_eq!(err.code, "28P01"),
            _ => panic!("expected failure"),
        }
    }
}
