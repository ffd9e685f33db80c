// src/tokens.rs
//
// Short-lived, single-use tokens that let a service open /ws/events without
// putting its client secret in a query string.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use uuid::Uuid;

use crate::Error;

struct TokenEntry {
    service_account_id: Uuid,
    expires_at: Instant,
    used: bool,
}

pub struct WsTokenStore {
    ttl: Duration,
    tokens: Mutex<HashMap<String, TokenEntry>>,
}

impl WsTokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a token for `service_account_id`, returning (token, ttl seconds).
    pub fn mint(&self, service_account_id: Uuid) -> (String, u64) {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);

        let mut tokens = self.tokens.lock().unwrap();
        let now = Instant::now();
        tokens.retain(|_, entry| entry.expires_at > now);
        tokens.insert(
            token.clone(),
            TokenEntry {
                service_account_id,
                expires_at: now + self.ttl,
                used: false,
            },
        );
        (token, self.ttl.as_secs())
    }

    /// Atomically redeem a token. Each token authenticates exactly one
    /// connection attempt.
    pub fn consume(&self, token: &str) -> Result<Uuid, Error> {
        let mut tokens = self.tokens.lock().unwrap();
        let now = Instant::now();
        let entry = tokens.get_mut(token).ok_or(Error::InvalidToken)?;
        if entry.expires_at <= now {
            tokens.remove(token);
            return Err(Error::ExpiredToken);
        }
        if entry.used {
            return Err(Error::AlreadyUsed);
        }
        entry.used = true;
        Ok(entry.service_account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_then_consume_returns_service_id() {
        let store = WsTokenStore::new(Duration::from_secs(60));
        let service = Uuid::new_v4();
        let (token, expires_in) = store.mint(service);
        assert_eq!(expires_in, 60);
        assert_eq!(store.consume(&token).unwrap(), service);
    }

    #[test]
    fn second_consume_reports_already_used() {
        let store = WsTokenStore::new(Duration::from_secs(60));
        let (token, _) = store.mint(Uuid::new_v4());
        store.consume(&token).unwrap();
        assert!(matches!(store.consume(&token), Err(Error::AlreadyUsed)));
    }

    #[test]
    fn unknown_token_is_invalid() {
        let store = WsTokenStore::new(Duration::from_secs(60));
        assert!(matches!(store.consume("nope"), Err(Error::InvalidToken)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let store = WsTokenStore::new(Duration::from_millis(0));
        let (token, _) = store.mint(Uuid::new_v4());
        assert!(matches!(store.consume(&token), Err(Error::ExpiredToken)));
    }

    #[test]
    fn tokens_are_unique_and_urlsafe() {
        let store = WsTokenStore::new(Duration::from_secs(60));
        let (a, _) = store.mint(Uuid::new_v4());
        let (b, _) = store.mint(Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
