use crate::gateway::AppState;
use offgate_cache::PolicyConfig;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub bypass: BypassConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
    /// The origin clients address the gateway by. Requests whose Host does
    /// not match it are cross-origin and never cached.
    #[serde(default = "default_public_origin")]
    pub public_origin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub origin: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Generation identifier. Bumping it on deploy is the only supported way
    /// to invalidate everything previously cached.
    #[serde(default = "default_generation")]
    pub generation: String,
    /// Root-relative paths pre-cached when a generation installs. A path
    /// that fails to fetch is logged and skipped.
    #[serde(default = "default_bootstrap")]
    pub bootstrap: Vec<String>,
    /// When false, a generation installed by a config reload waits for the
    /// skip-waiting control signal instead of activating on its own.
    #[serde(default = "default_auto_activate")]
    pub auto_activate: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BypassConfig {
    /// Hostname substrings forced past the cache regardless of path, e.g.
    /// a hosting provider's domain or a backend subdomain.
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                origin: "http://127.0.0.1:3000".to_string(),
                timeout_ms: default_timeout_ms(),
            },
            cache: CacheConfig::default(),
            bypass: BypassConfig::default(),
        }
    }

    /// Classification policy derived from this config.
    pub fn policy(&self) -> Result<PolicyConfig, url::ParseError> {
        Ok(PolicyConfig {
            origin: Url::parse(&self.server.public_origin)?,
            bypass_hosts: self.bypass.hosts.clone(),
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
            public_origin: default_public_origin(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            generation: default_generation(),
            bootstrap: default_bootstrap(),
            auto_activate: default_auto_activate(),
        }
    }
}

/// Compare old and new config, apply safe changes, reject unsafe ones.
///
/// - Generation bumped → install a fresh generation over the shared store,
///   then activate it immediately (or park it for the skip signal when
///   `auto_activate` is off). Activation sweeps every older generation.
/// - Bypass rules or public origin changed → rebuild the engine in place,
///   same generation, no data loss.
/// - Address or upstream changes → WARN log, ignore (restart required).
pub async fn diff_and_apply(old: &Config, new: &Config, state: &Arc<AppState>) {
    if old.server.listen_addr != new.server.listen_addr
        || old.server.admin_addr != new.server.admin_addr
    {
        tracing::warn!("listen address change detected — ignoring. Restart to rebind");
    }

    if old.upstream.origin != new.upstream.origin
        || old.upstream.timeout_ms != new.upstream.timeout_ms
    {
        tracing::warn!("upstream change detected — ignoring. Restart to apply");
    }

    let policy = match new.policy() {
        Ok(policy) => policy,
        Err(error) => {
            tracing::error!(%error, origin = %new.server.public_origin, "invalid public origin in reloaded config, keeping current policy");
            return;
        }
    };

    if old.cache.generation != new.cache.generation {
        let engine = Arc::new(state.build_engine(
            policy,
            &new.cache.generation,
            new.cache.bootstrap.clone(),
        ));
        engine.install().await;

        if new.cache.auto_activate {
            engine.activate();
            state.engine.store(engine);
            tracing::info!(
                old = %old.cache.generation,
                new = %new.cache.generation,
                "config reloaded: generation replaced"
            );
        } else {
            *state.pending.lock() = Some(engine);
            tracing::info!(
                generation = %new.cache.generation,
                "config reloaded: generation installed, waiting for skip signal"
            );
        }
    } else if old.bypass.hosts != new.bypass.hosts
        || old.server.public_origin != new.server.public_origin
    {
        // Same generation, new classification rules: swap the engine in
        // place. Cached entries survive.
        let engine = Arc::new(state.build_engine(
            policy,
            &new.cache.generation,
            new.cache.bootstrap.clone(),
        ));
        engine.activate();
        state.engine.store(engine);
        tracing::info!("config reloaded: classification rules updated");
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_admin_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_public_origin() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_generation() -> String {
    "offgate-v1".to_string()
}
fn default_bootstrap() -> Vec<String> {
    vec![
        "/".to_string(),
        "/login".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
    ]
}
fn default_auto_activate() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            origin = "http://127.0.0.1:3000"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.cache.generation, "offgate-v1");
        assert_eq!(
            config.cache.bootstrap,
            vec!["/", "/login", "/index.html", "/manifest.json"]
        );
        assert!(config.cache.auto_activate);
        assert!(config.bypass.hosts.is_empty());
    }

    #[test]
    fn policy_parses_public_origin() {
        let mut config = Config::default_config();
        config.server.public_origin = "https://app.example.com".to_string();
        config.bypass.hosts = vec!["onrender.com".to_string()];

        let policy = config.policy().unwrap();
        assert_eq!(policy.origin.host_str(), Some("app.example.com"));
        assert_eq!(policy.bypass_hosts, vec!["onrender.com"]);
    }

    #[test]
    fn bad_public_origin_is_rejected() {
        let mut config = Config::default_config();
        config.server.public_origin = "not a url".to_string();
        assert!(config.policy().is_err());
    }
}
