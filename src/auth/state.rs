//! Single-use anti-forgery state for the authorization-code flow.
//!
//! Each login attempt gets a random nonce. The nonce, the destination the
//! caller wants to land on and an opaque caller value are packed into the
//! `state` parameter sent to the provider, and a matching entry is kept in
//! [`StateStore`] until the callback consumes it.

use base64::{engine::general_purpose::URL_SAFE, Engine};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::metrics::METRICS;

pub const NONCE_LEN: usize = 32;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Random alphanumeric string drawn from the OS RNG.
///
/// Bytes at or above the largest multiple of the alphabet size are discarded
/// so every character is equally likely.
pub fn generate_nonce(len: usize) -> Result<String> {
    let limit = (256 / ALPHABET.len() * ALPHABET.len()) as u8;
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];

    while out.len() < len {
        OsRng.try_fill_bytes(&mut buf).map_err(|_| Error::Entropy)?;
        for &b in buf.iter().filter(|&&b| b < limit) {
            if out.len() == len {
                break;
            }
            out.push(ALPHABET[b as usize % ALPHABET.len()] as char);
        }
    }

    Ok(out)
}

/// Payload carried through the provider in the `state` parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateData {
    pub state: String,
    pub redirect_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_state: Option<String>,
}

impl StateData {
    /// JSON, then URL-safe base64
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|_| Error::BadState)?;
        Ok(URL_SAFE.encode(json))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let json = URL_SAFE.decode(raw).map_err(|_| Error::BadState)?;
        serde_json::from_slice(&json).map_err(|_| Error::BadState)
    }
}

/// What the coordinator remembers about a login it started
#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub redirect_url: String,
    pub client_state: Option<String>,
    pub pkce_verifier: Option<String>,
    issued_at: Instant,
}

impl PendingLogin {
    pub fn new(
        redirect_url: String,
        client_state: Option<String>,
        pkce_verifier: Option<String>,
    ) -> Self {
        Self {
            redirect_url,
            client_state,
            pkce_verifier,
            issued_at: Instant::now(),
        }
    }
}

/// Process-wide table of issued, unconsumed nonces
pub struct StateStore {
    entries: Mutex<HashMap<String, PendingLogin>>,
    ttl: Duration,
    max_entries: usize,
}

impl StateStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    pub fn insert(&self, nonce: String, pending: PendingLogin) {
        let mut entries = self.entries.lock();

        let ttl = self.ttl;
        entries.retain(|_, p| p.issued_at.elapsed() < ttl);

        // Evict oldest entry if at capacity
        while entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, p)| p.issued_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    debug!("State table full, evicting oldest entry");
                    entries.remove(&key);
                }
                None => break,
            }
        }

        entries.insert(nonce, pending);
        METRICS.oauth_pending_states.set(entries.len() as f64);
    }

    /// Check and remove in one critical section.
    ///
    /// An unknown or expired nonce, or one bound to a different redirect,
    /// yields [`Error::InvalidState`]. On a redirect mismatch the entry is
    /// kept so the legitimate callback can still complete.
    pub fn consume(&self, data: &StateData) -> Result<PendingLogin> {
        let mut entries = self.entries.lock();

        let (expired, bound_elsewhere) = match entries.get(&data.state) {
            Some(p) => (
                p.issued_at.elapsed() >= self.ttl,
                p.redirect_url != data.redirect_url,
            ),
            None => return Err(Error::InvalidState),
        };

        if expired {
            entries.remove(&data.state);
            METRICS.oauth_pending_states.set(entries.len() as f64);
            return Err(Error::InvalidState);
        }

        if bound_elsewhere {
            return Err(Error::InvalidState);
        }

        let pending = entries.remove(&data.state).ok_or(Error::InvalidState)?;
        METRICS.oauth_pending_states.set(entries.len() as f64);
        Ok(pending)
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, p| p.issued_at.elapsed() < ttl);
        METRICS.oauth_pending_states.set(entries.len() as f64);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const REDIRECT: &str = "https://app.example.com/done";

    fn data(nonce: &str, redirect: &str) -> StateData {
        StateData {
            state: nonce.to_string(),
            redirect_url: redirect.to_string(),
            client_state: None,
        }
    }

    fn store() -> StateStore {
        StateStore::new(Duration::from_secs(600), 100)
    }

    #[test]
    fn test_nonce_shape_and_uniqueness() {
        let a = generate_nonce(NONCE_LEN).unwrap();
        let b = generate_nonce(NONCE_LEN).unwrap();
        assert_eq!(a.len(), NONCE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_data_encoding() {
        let original = StateData {
            state: "abc".to_string(),
            redirect_url: REDIRECT.to_string(),
            client_state: Some("opaque".to_string()),
        };
        let encoded = original.encode().unwrap();
        assert!(!encoded.contains('+') && !encoded.contains('/'));
        assert_eq!(StateData::decode(&encoded).unwrap(), original);
    }

    #[test]
    fn test_malformed_state_is_bad_state() {
        assert!(matches!(StateData::decode("%%%"), Err(Error::BadState)));
        let not_json = URL_SAFE.encode(b"not json");
        assert!(matches!(StateData::decode(&not_json), Err(Error::BadState)));
    }

    #[test]
    fn test_consume_exactly_once() {
        let store = store();
        store.insert("n1".into(), PendingLogin::new(REDIRECT.into(), None, None));

        assert!(store.consume(&data("n1", REDIRECT)).is_ok());
        assert!(matches!(store.consume(&data("n1", REDIRECT)), Err(Error::InvalidState)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_unknown_nonce_rejected() {
        let store = store();
        assert!(matches!(store.consume(&data("never", REDIRECT)), Err(Error::InvalidState)));
    }

    #[test]
    fn test_redirect_mismatch_leaves_entry() {
        let store = store();
        store.insert("n1".into(), PendingLogin::new(REDIRECT.into(), None, None));

        assert!(matches!(
            store.consume(&data("n1", "https://evil.example.com")),
            Err(Error::InvalidState)
        ));
        assert_eq!(store.len(), 1);
        assert!(store.consume(&data("n1", REDIRECT)).is_ok());
    }

    #[test]
    fn test_expired_entry_rejected_and_purged() {
        let store = StateStore::new(Duration::ZERO, 100);
        store.insert("n1".into(), PendingLogin::new(REDIRECT.into(), None, None));
        assert!(matches!(store.consume(&data("n1", REDIRECT)), Err(Error::InvalidState)));
        assert!(store.is_empty());

        store.entries.lock().insert(
            "n2".into(),
            PendingLogin::new(REDIRECT.into(), None, None),
        );
        assert_eq!(store.purge_expired(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = StateStore::new(Duration::from_secs(600), 2);
        store.insert("a".into(), PendingLogin::new(REDIRECT.into(), None, None));
        std::thread::sleep(Duration::from_millis(2));
        store.insert("b".into(), PendingLogin::new(REDIRECT.into(), None, None));
        std::thread::sleep(Duration::from_millis(2));
        store.insert("c".into(), PendingLogin::new(REDIRECT.into(), None, None));

        assert_eq!(store.len(), 2);
        assert!(store.consume(&data("a", REDIRECT)).is_err());
        assert!(store.consume(&data("c", REDIRECT)).is_ok());
    }

    #[test]
    fn test_concurrent_replay_consumes_once() {
        let store = Arc::new(store());
        store.insert("n1".into(), PendingLogin::new(REDIRECT.into(), None, None));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.consume(&data("n1", REDIRECT)).is_ok())
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }
}
