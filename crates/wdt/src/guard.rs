/// Registry of in-flight transfers keyed by identity.
///
/// `try_acquire` is the only way in and succeeds for exactly one caller per
/// key. The returned ticket releases the key when dropped, so every exit path
/// of the owning session (success, error, early return, panic unwinding,
/// drop of the session) gives it back exactly once.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGuard {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard shared by every receiver in the process, keyed by destination
    /// directory.
    pub fn receiver_directories() -> &'static ConcurrencyGuard {
        static DIRECTORIES: OnceLock<ConcurrencyGuard> = OnceLock::new();
        DIRECTORIES.get_or_init(ConcurrencyGuard::new)
    }

    /// Claim `key`. `None` means another holder has it right now.
    pub fn try_acquire(&self, key: impl Into<String>) -> Option<GuardTicket> {
        let key = key.into();
        let inserted = self.inner.lock().insert(key.clone());
        inserted.then(|| GuardTicket {
            key,
            registry: self.inner.clone(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Key used by the facade for sender sessions.
pub fn send_key(identity: &str, host: &str) -> String {
    format!("send:{}@{}", identity, host)
}

/// Key used for receiver directories.
pub fn directory_key(dir: &Path) -> String {
    let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    format!("recv:{}", canonical.display())
}

/// Proof of a successful acquire. Dropping it releases the key.
#[derive(Debug)]
pub struct GuardTicket {
    key: String,
    registry: Arc<Mutex<HashSet<String>>>,
}

impl Drop for GuardTicket {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn second_acquire_fails_until_release() {
        let guard = ConcurrencyGuard::new();
        let ticket = guard.try_acquire("foo").unwrap();
        assert!(guard.try_acquire("foo").is_none());
        assert!(guard.try_acquire("bar").is_some());
        assert!(guard.is_held("foo"));
        drop(ticket);
        assert!(!guard.is_held("foo"));
        assert!(guard.try_acquire("foo").is_some());
        assert!(guard.is_empty());
    }

    #[test]
    fn only_one_concurrent_winner() {
        let guard = ConcurrencyGuard::new();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    guard.try_acquire("same")
                })
            })
            .collect();
        let tickets: Vec<GuardTicket> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(tickets.len(), 1);
        drop(tickets);
        assert!(guard.is_empty());
    }

    #[test]
    fn ticket_released_on_panic() {
        let guard = ConcurrencyGuard::new();
        let g = guard.clone();
        let result = std::thread::spawn(move || {
            let _ticket = g.try_acquire("boom").unwrap();
            panic!("session blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!guard.is_held("boom"));
    }

    #[test]
    fn keys_are_scoped() {
        assert_ne!(send_key("foo", "a"), send_key("foo", "b"));
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(directory_key(dir.path()), directory_key(&dir.path().join(".")));
    }
}
