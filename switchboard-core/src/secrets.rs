// src/secrets.rs
//
// Service client-secret hashing. Format:
//   pbkdf2_sha256$<iterations>$<salt_b64>$<digest_b64>

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

const PBKDF2_PREFIX: &str = "pbkdf2_sha256";
const PBKDF2_ITERATIONS: u32 = 260_000;

pub fn hash_secret(secret: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut digest = [0u8; 32];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut digest);
    format!(
        "{PBKDF2_PREFIX}${PBKDF2_ITERATIONS}${}${}",
        URL_SAFE.encode(salt),
        URL_SAFE.encode(digest)
    )
}

pub fn verify_secret(secret: &str, secret_hash: &str) -> bool {
    let mut parts = secret_hash.splitn(4, '$');
    let (Some(prefix), Some(iter_s), Some(salt_b64), Some(digest_b64)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if prefix != PBKDF2_PREFIX {
        return false;
    }
    let Ok(iterations) = iter_s.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (URL_SAFE.decode(salt_b64), URL_SAFE.decode(digest_b64)) else {
        return false;
    };

    let mut digest = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), &salt, iterations, &mut digest);
    constant_time_eq(&digest, &expected)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verifies_and_rejects_wrong_secret() {
        let hash = hash_secret("hunter2-but-longer");
        assert!(verify_secret("hunter2-but-longer", &hash));
        assert!(!verify_secret("hunter2-but-wrong", &hash));
    }

    #[test]
    fn malformed_hashes_never_verify() {
        assert!(!verify_secret("whatever", ""));
        assert!(!verify_secret("whatever", "md5$1$x$y"));
        assert!(!verify_secret("whatever", "pbkdf2_sha256$abc$salt$digest"));
    }

    #[test]
    fn hashes_are_salted() {
        assert_ne!(hash_secret("same-secret"), hash_secret("same-secret"));
    }
}
