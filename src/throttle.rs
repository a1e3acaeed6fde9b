//! Spam-score bookkeeping and thread-creation throttling.
//!
//! Scores accumulate per captcha session and per IP inside a TTL
//! window; crossing the threshold on either counter means the owning
//! session must present a fresh captcha before its next write. Thread
//! creation is rate limited by a TTL'd per-IP marker.

use std::net::IpAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;
use crate::store::{Store, StoreError};

#[derive(Clone)]
pub struct Throttle {
    store: Store,
    config: Arc<Config>,
}

impl Throttle {
    pub fn new(store: Store, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    fn session_key(session: Uuid) -> String {
        format!("spam:{session}")
    }

    fn ip_key(ip: IpAddr) -> String {
        format!("spam:ip:{ip}")
    }

    /// Whether this IP created a thread too recently.
    pub fn thread_throttled(&self, ip: IpAddr) -> Result<bool, StoreError> {
        self.store.string_exists(&format!("ip:{ip}"))
    }

    /// Mark a thread creation from this IP.
    pub fn note_thread_created(&self, ip: IpAddr) -> Result<(), StoreError> {
        self.store
            .string_set(&format!("ip:{ip}"), b"1", Some(self.config.thread_throttle))
    }

    /// Add to both counters. Returns `true` when either has crossed
    /// the threshold and a fresh captcha is required.
    pub fn increment_spam_score(
        &self,
        session: Uuid,
        ip: IpAddr,
        delta: u64,
    ) -> Result<bool, StoreError> {
        let window = self.config.spam_window;
        let session_score =
            self.store
                .string_incr(&Self::session_key(session), delta, window)?;
        let ip_score = self.store.string_incr(&Self::ip_key(ip), delta, window)?;
        Ok(session_score >= self.config.spam_threshold
            || ip_score >= self.config.spam_threshold)
    }

    /// Clear both counters after a solved captcha.
    pub fn reset(&self, session: Uuid, ip: IpAddr) -> Result<(), StoreError> {
        self.store.string_del(&Self::session_key(session))?;
        self.store.string_del(&Self::ip_key(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn setup() -> (Throttle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let throttle = Throttle::new(store, Arc::new(Config::for_testing()));
        (throttle, dir)
    }

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn test_spam_threshold_crossing() {
        let (throttle, _dir) = setup();
        let session = Uuid::new_v4();
        // Testing threshold is 200
        assert!(!throttle.increment_spam_score(session, ip(), 50).unwrap());
        assert!(!throttle.increment_spam_score(session, ip(), 100).unwrap());
        assert!(throttle.increment_spam_score(session, ip(), 60).unwrap());
    }

    #[test]
    fn test_ip_counter_shared_across_sessions() {
        let (throttle, _dir) = setup();
        assert!(!throttle
            .increment_spam_score(Uuid::new_v4(), ip(), 150)
            .unwrap());
        // Different session, same IP: the IP counter trips
        assert!(throttle
            .increment_spam_score(Uuid::new_v4(), ip(), 60)
            .unwrap());
    }

    #[test]
    fn test_reset_clears_counters() {
        let (throttle, _dir) = setup();
        let session = Uuid::new_v4();
        assert!(throttle.increment_spam_score(session, ip(), 500).unwrap());
        throttle.reset(session, ip()).unwrap();
        assert!(!throttle.increment_spam_score(session, ip(), 10).unwrap());
    }

    #[test]
    fn test_thread_throttle_expires() {
        let (throttle, _dir) = setup();
        assert!(!throttle.thread_throttled(ip()).unwrap());
        throttle.note_thread_created(ip()).unwrap();
        assert!(throttle.thread_throttled(ip()).unwrap());
        // Testing TTL is 200ms
        std::thread::sleep(Duration::from_millis(300));
        assert!(!throttle.thread_throttled(ip()).unwrap());
    }
}
