//! Process-wide configuration, read once at startup from the environment.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub enum CorsOrigin {
    Any,
    List(Vec<String>),
}

impl CorsOrigin {
    pub fn allows(&self, origin: &str) -> bool {
        match self {
            CorsOrigin::Any => true,
            CorsOrigin::List(allowed) => allowed.iter().any(|o| o == origin),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cors_origin: CorsOrigin,
    pub admin_key: Option<String>,
    pub redis_url: Option<String>,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Config {
    /// Reads configuration from environment variables, falling back to the
    /// same defaults documented in the external-interfaces section of the
    /// spec. Never panics on a missing var — only on one present but
    /// unparsable, since that's almost certainly a deployment mistake worth
    /// failing fast on.
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(v) => v.parse().map_err(|e| {
                anyhow::anyhow!("PORT={v:?} is not a valid port number: {e}")
            })?,
            Err(_) => DEFAULT_PORT,
        };

        let cors_origin = match std::env::var("CORS_ORIGIN") {
            Ok(v) if v.trim() == "*" => CorsOrigin::Any,
            Ok(v) => CorsOrigin::List(
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            Err(_) => CorsOrigin::Any,
        };

        let admin_key = std::env::var("ADMIN_KEY")
            .ok()
            .filter(|s| !s.is_empty());

        let redis_url = std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty());

        let session_ttl_secs = match std::env::var("SESSION_TTL_SECS") {
            Ok(v) => v
                .parse()
                .map_err(|e| anyhow::anyhow!("SESSION_TTL_SECS={v:?} invalid: {e}"))?,
            Err(_) => DEFAULT_SESSION_TTL_SECS,
        };

        let sweep_interval_secs = match std::env::var("SWEEP_INTERVAL_SECS") {
            Ok(v) => v
                .parse()
                .map_err(|e| anyhow::anyhow!("SWEEP_INTERVAL_SECS={v:?} invalid: {e}"))?,
            Err(_) => DEFAULT_SWEEP_INTERVAL_SECS,
        };

        Ok(Config {
            port,
            cors_origin,
            admin_key,
            redis_url,
            session_ttl: Duration::from_secs(session_ttl_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        })
    }

    pub fn admin_key_matches(&self, supplied: Option<&str>) -> bool {
        match &self.admin_key {
            None => true,
            Some(expected) => supplied.is_some_and(|s| s == expected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_any_allows_everything() {
        assert!(CorsOrigin::Any.allows("https://example.com"));
    }

    #[test]
    fn cors_list_is_exact_match() {
        let origin = CorsOrigin::List(vec!["https://a.com".into(), "https://b.com".into()]);
        assert!(origin.allows("https://a.com"));
        assert!(!origin.allows("https://c.com"));
    }

    #[test]
    fn admin_key_open_when_unset() {
        let cfg = Config {
            port: 3000,
            cors_origin: CorsOrigin::Any,
            admin_key: None,
            redis_url: None,
            session_ttl: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(1),
        };
        assert!(cfg.admin_key_matches(None));
        assert!(cfg.admin_key_matches(Some("anything")));
    }

    #[test]
    fn admin_key_gates_when_set() {
        let cfg = Config {
            port: 3000,
            cors_origin: CorsOrigin::Any,
            admin_key: Some("secret".into()),
            redis_url: None,
            session_ttl: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(1),
        };
        assert!(!cfg.admin_key_matches(None));
        assert!(!cfg.admin_key_matches(Some("wrong")));
        assert!(cfg.admin_key_matches(Some("secret")));
    }
}
