//! Limiter configuration, key strategies, and preconfigured policies.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::hook::{
    RequestMeta, ResponseWriter, HTTP_TOO_MANY_REQUESTS, RATE_LIMIT_ERROR_TYPE, RATE_LIMIT_MESSAGE,
};

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(60_000);

/// Default number of admitted requests per key per window.
pub const DEFAULT_MAX: u64 = 60;

/// Default cooldown before a failed shared store is retried.
pub const DEFAULT_RETRY_COOLDOWN: Duration = Duration::from_secs(5);

/// Handler invoked when a key's quota is exhausted.
///
/// Receives the request, the response to inject into, and the time until
/// the window resets.
pub type ExceededHandler =
    Arc<dyn Fn(&dyn RequestMeta, &mut dyn ResponseWriter, Duration) + Send + Sync>;

/// Maps a request to the string identity it is bucketed under.
#[derive(Clone)]
pub enum KeyStrategy {
    /// Caller's remote address.
    RemoteAddr,
    /// Caller's remote address, namespaced for authentication endpoints.
    Auth,
    /// Authenticated user id, falling back to the remote address.
    UserOrAddr,
    /// Caller-supplied derivation.
    Custom(Arc<dyn Fn(&dyn RequestMeta) -> String + Send + Sync>),
}

impl KeyStrategy {
    /// Derive the bucket identity for a request.
    pub fn derive(&self, request: &dyn RequestMeta) -> String {
        match self {
            KeyStrategy::RemoteAddr => request.remote_addr(),
            KeyStrategy::Auth => format!("auth:{}", request.remote_addr()),
            KeyStrategy::UserOrAddr => request.user_id().unwrap_or_else(|| request.remote_addr()),
            KeyStrategy::Custom(derive) => derive(request),
        }
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::RemoteAddr => f.write_str("RemoteAddr"),
            KeyStrategy::Auth => f.write_str("Auth"),
            KeyStrategy::UserOrAddr => f.write_str("UserOrAddr"),
            KeyStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Configuration for a request limiter.
///
/// Immutable once a limiter instance is built.
#[derive(Clone)]
pub struct LimiterConfig {
    /// Window length.
    pub window: Duration,
    /// Maximum admitted requests per key per window.
    pub max: u64,
    /// How a request maps to its bucket key.
    pub key_strategy: KeyStrategy,
    /// Invoked when the quota is exhausted.
    pub on_exceeded: ExceededHandler,
    /// Cooldown before a failed shared store is retried.
    pub retry_cooldown: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl LimiterConfig {
    /// 60 requests per minute, keyed by caller address.
    pub fn standard() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max: DEFAULT_MAX,
            key_strategy: KeyStrategy::RemoteAddr,
            on_exceeded: default_exceeded_handler(),
            retry_cooldown: DEFAULT_RETRY_COOLDOWN,
        }
    }

    /// 10 requests per minute for authentication endpoints, keyed by
    /// `"auth:" + caller address`.
    pub fn auth() -> Self {
        Self {
            max: 10,
            key_strategy: KeyStrategy::Auth,
            ..Self::standard()
        }
    }

    /// 100 requests per minute, keyed by authenticated user id when one is
    /// present and the caller address otherwise.
    pub fn per_user() -> Self {
        Self {
            max: 100,
            key_strategy: KeyStrategy::UserOrAddr,
            ..Self::standard()
        }
    }

    /// Set the window length.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the per-window request ceiling.
    pub fn with_max(mut self, max: u64) -> Self {
        self.max = max;
        self
    }

    /// Set the key derivation strategy.
    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    /// Replace the exceeded handler.
    pub fn with_exceeded_handler(mut self, handler: ExceededHandler) -> Self {
        self.on_exceeded = handler;
        self
    }

    /// Set the cooldown before a failed shared store is retried.
    pub fn with_retry_cooldown(mut self, cooldown: Duration) -> Self {
        self.retry_cooldown = cooldown;
        self
    }

    /// Validate the configuration.
    ///
    /// Misconfiguration is rejected here, at limiter construction, never at
    /// request time.
    pub fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(FloodgateError::Config("max must be positive".to_string()));
        }
        if self.window.is_zero() {
            return Err(FloodgateError::Config("window must be positive".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for LimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterConfig")
            .field("window", &self.window)
            .field("max", &self.max)
            .field("key_strategy", &self.key_strategy)
            .field("retry_cooldown", &self.retry_cooldown)
            .finish_non_exhaustive()
    }
}

/// The default exceeded handler: status 429 with a structured payload
/// carrying a stable error kind.
fn default_exceeded_handler() -> ExceededHandler {
    Arc::new(|_request, response, _retry_after| {
        response.set_status(HTTP_TOO_MANY_REQUESTS);
        response.set_json_body(json!({
            "error": {
                "type": RATE_LIMIT_ERROR_TYPE,
                "message": RATE_LIMIT_MESSAGE,
            }
        }));
    })
}

/// Key basis selectable from a policy file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyBasis {
    /// Caller's remote address.
    #[default]
    RemoteAddr,
    /// Namespaced caller address for authentication endpoints.
    Auth,
    /// Authenticated user id, falling back to the caller address.
    User,
}

impl From<KeyBasis> for KeyStrategy {
    fn from(basis: KeyBasis) -> Self {
        match basis {
            KeyBasis::RemoteAddr => KeyStrategy::RemoteAddr,
            KeyBasis::Auth => KeyStrategy::Auth,
            KeyBasis::User => KeyStrategy::UserOrAddr,
        }
    }
}

/// A single named limiter policy from a policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Maximum admitted requests per key per window.
    pub max: u64,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Key derivation basis.
    #[serde(default)]
    pub key: KeyBasis,
}

impl PolicyRule {
    /// Build a limiter configuration from this rule.
    pub fn to_config(&self) -> LimiterConfig {
        LimiterConfig::standard()
            .with_window(Duration::from_secs(self.window_secs))
            .with_max(self.max)
            .with_key_strategy(self.key.into())
    }
}

/// Named limiter policies loaded from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    /// Map of policy name to rule.
    #[serde(default)]
    pub policies: HashMap<String, PolicyRule>,
}

impl PolicyFile {
    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse policy file: {}", e)))
    }

    /// Look up a named policy.
    pub fn get(&self, name: &str) -> Option<&PolicyRule> {
        self.policies.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestRequest {
        addr: String,
        user: Option<String>,
    }

    impl RequestMeta for TestRequest {
        fn remote_addr(&self) -> String {
            self.addr.clone()
        }

        fn user_id(&self) -> Option<String> {
            self.user.clone()
        }
    }

    fn request(addr: &str, user: Option<&str>) -> TestRequest {
        TestRequest {
            addr: addr.to_string(),
            user: user.map(|u| u.to_string()),
        }
    }

    #[test]
    fn test_standard_defaults() {
        let config = LimiterConfig::standard();
        assert_eq!(config.window, Duration::from_millis(60_000));
        assert_eq!(config.max, 60);
        assert_eq!(config.retry_cooldown, DEFAULT_RETRY_COOLDOWN);
        config.validate().unwrap();
    }

    #[test]
    fn test_preset_values() {
        assert_eq!(LimiterConfig::auth().max, 10);
        assert_eq!(LimiterConfig::per_user().max, 100);
        assert_eq!(LimiterConfig::auth().window, Duration::from_millis(60_000));
    }

    #[test]
    fn test_key_strategy_remote_addr() {
        let req = request("10.0.0.1", None);
        assert_eq!(KeyStrategy::RemoteAddr.derive(&req), "10.0.0.1");
    }

    #[test]
    fn test_key_strategy_auth_is_namespaced() {
        let req = request("10.0.0.1", None);
        assert_eq!(KeyStrategy::Auth.derive(&req), "auth:10.0.0.1");
    }

    #[test]
    fn test_key_strategy_user_falls_back_to_addr() {
        let with_user = request("10.0.0.1", Some("user-42"));
        let without_user = request("10.0.0.1", None);

        assert_eq!(KeyStrategy::UserOrAddr.derive(&with_user), "user-42");
        assert_eq!(KeyStrategy::UserOrAddr.derive(&without_user), "10.0.0.1");
    }

    #[test]
    fn test_key_strategy_custom() {
        let strategy =
            KeyStrategy::Custom(Arc::new(|req| format!("tenant:{}", req.remote_addr())));
        let req = request("10.0.0.1", None);
        assert_eq!(strategy.derive(&req), "tenant:10.0.0.1");
    }

    #[test]
    fn test_validate_rejects_zero_max() {
        let config = LimiterConfig::standard().with_max(0);
        assert!(matches!(
            config.validate(),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = LimiterConfig::standard().with_window(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_parse_policy_file() {
        let yaml = r#"
policies:
  standard:
    max: 60
    window_secs: 60
  auth:
    max: 10
    window_secs: 60
    key: auth
  user:
    max: 100
    window_secs: 60
    key: user
"#;
        let file = PolicyFile::from_yaml(yaml).unwrap();
        assert_eq!(file.policies.len(), 3);

        let auth = file.get("auth").unwrap();
        assert_eq!(auth.max, 10);
        assert_eq!(auth.key, KeyBasis::Auth);

        // Key basis defaults to the remote address.
        assert_eq!(file.get("standard").unwrap().key, KeyBasis::RemoteAddr);
    }

    #[test]
    fn test_policy_rule_to_config() {
        let rule = PolicyRule {
            max: 25,
            window_secs: 30,
            key: KeyBasis::User,
        };
        let config = rule.to_config();

        assert_eq!(config.max, 25);
        assert_eq!(config.window, Duration::from_secs(30));
        assert!(matches!(config.key_strategy, KeyStrategy::UserOrAddr));
    }

    #[test]
    fn test_parse_invalid_policy_file() {
        let result = PolicyFile::from_yaml("policies: [not, a, map]");
        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }
}
