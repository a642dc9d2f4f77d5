/// Cryptographic primitives shared by the authentication flows: MD5 double
/// hashing, HMAC-SHA-256, SHA-256, PBKDF2-HMAC-SHA-256, constant-time
/// comparison, and CSPRNG bytes.
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// `md5(password + username)`, returned as a lowercase hex string. This is
/// the "pre-hashed" password MD5 auth stores server-side.
pub fn md5_pre_hash(password: &str, username: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `"md5" + hex(md5(pre_hash ++ salt))`, the value a client sends back and
/// the value the server must reproduce to validate it.
pub fn md5_challenge_response(pre_hash: &str, salt: &[u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(pre_hash.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::Digest as _;
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub fn pbkdf2_hmac_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

/// Constant-time equality, mandatory for MD5 and SCRAM stored-key comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_matches_reference_client_for_known_salt() {
        let pre_hash = md5_pre_hash("postgres", "postgres");
        let salt = [1u8, 2, 3, 4];
        let response = md5_challenge_response(&pre_hash, &salt);
        assert!(response.starts_with("md5"));
        assert_eq!(response.len(), 35);
    }

    #[test]
    fn constant_time_eq_detects_mismatch() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn pbkdf2_derivation_is_deterministic() {
        let a = pbkdf2_hmac_sha256(b"password", b"salt", 4096);
        let b = pbkdf2_hmac_sha256(b"password", b"salt", 4096);
        assert_eq!(a, b);
    }
}
