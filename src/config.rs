//! Runtime configuration: content limits, spam scoring, and per-board
//! settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::parser::{BoardPolicy, DefaultPolicy, TheftPolicy};

/// Content and throttling limits for the posting core.
#[derive(Clone)]
pub struct Config {
    /// Maximum open-post body length in runes (not bytes)
    pub max_body_len: usize,
    /// Maximum newline count in a body
    pub max_lines: usize,
    /// Spam score added per mutated character
    pub char_score: u64,
    /// Spam score added for acquiring an image
    pub image_score: u64,
    /// Score at which a fresh captcha is demanded
    pub spam_threshold: u64,
    /// Sliding window over which spam scores accumulate
    pub spam_window: Duration,
    /// Cooldown between thread creations from one IP
    pub thread_throttle: Duration,
    /// TTL of staged image tokens
    pub image_token_ttl: Duration,
    /// Per-board settings keyed by board tag
    pub boards: HashMap<String, BoardConfig>,
    /// Board-specific behavior hooks keyed by board tag
    policies: HashMap<String, Arc<dyn BoardPolicy>>,
    default_policy: Arc<dyn BoardPolicy>,
}

/// Static per-board settings.
#[derive(Debug, Clone, Default)]
pub struct BoardConfig {
    /// Images may not be attached to posts on this board
    pub text_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        let mut cfg = Self {
            max_body_len: 2000,
            max_lines: 100,
            char_score: 8,
            image_score: 320,
            spam_threshold: 4000,
            spam_window: Duration::from_secs(600),
            thread_throttle: Duration::from_secs(60),
            image_token_ttl: Duration::from_secs(120),
            boards: HashMap::new(),
            policies: HashMap::new(),
            default_policy: Arc::new(DefaultPolicy),
        };
        // The "a" board traditionally allows image theft
        cfg.install_policy("a", Arc::new(TheftPolicy));
        cfg
    }
}

impl Config {
    /// Config for testing: tiny limits so boundary cases are cheap to hit.
    pub fn for_testing() -> Self {
        Self {
            spam_threshold: 200,
            spam_window: Duration::from_secs(5),
            thread_throttle: Duration::from_millis(200),
            image_token_ttl: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Look up the settings for a board, falling back to defaults.
    pub fn board(&self, tag: &str) -> BoardConfig {
        self.boards.get(tag).cloned().unwrap_or_default()
    }

    /// Install a behavior policy for a board.
    pub fn install_policy(&mut self, tag: &str, policy: Arc<dyn BoardPolicy>) {
        self.policies.insert(tag.to_string(), policy);
    }

    /// The behavior policy for a board. Boards without an installed
    /// policy get the inert default.
    pub fn policy(&self, tag: &str) -> Arc<dyn BoardPolicy> {
        self.policies
            .get(tag)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("max_body_len", &self.max_body_len)
            .field("max_lines", &self.max_lines)
            .field("char_score", &self.char_score)
            .field("image_score", &self.image_score)
            .field("spam_threshold", &self.spam_threshold)
            .field("boards", &self.boards)
            .finish()
    }
}
