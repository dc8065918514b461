use std::{
    collections::HashSet, fs, net::SocketAddr, path::Path, str::FromStr, time::Duration,
};

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::registry::LifecyclePolicy;

/// Root configuration structure deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    pub listeners: Vec<Listener>,
    pub server: ServerSettings,
    pub lifecycle: LifecycleSettings,
    /// Free-form values exposed to plugins through the config capability.
    pub settings: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Listener {
    pub name: String,
    pub bind: String,
    pub tls: Option<Tls>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tls {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub shutdown_grace_secs: u64,
    pub max_body_bytes: usize,
    pub request_timeout_secs: Option<u64>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: 10,
            max_body_bytes: 1024 * 1024,
            request_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Abort activation on the first plugin failure.
    pub strict: bool,
    pub hook_timeout_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            strict: false,
            hook_timeout_ms: 5000,
        }
    }
}

impl HostConfig {
    /// Reads, interpolates and parses a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let expanded = interpolate_env(raw)?;
        Ok(toml::from_str::<HostConfig>(&expanded)?)
    }

    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            bail!("at least one listener is required");
        }
        let mut listener_names = HashSet::new();
        let mut addrs = HashSet::new();
        for listener in &self.listeners {
            listener.validate()?;
            if !listener_names.insert(listener.name.clone()) {
                bail!("duplicate listener name `{}`", listener.name);
            }
            let addr = listener.parse_bind_addr()?;
            if !addrs.insert(addr) {
                bail!("listener `{}` reuses bind address {addr}", listener.name);
            }
        }
        if self.server.max_body_bytes == 0 {
            bail!("server.max_body_bytes must be greater than zero");
        }
        if self.server.request_timeout_secs == Some(0) {
            bail!("server.request_timeout_secs must be greater than zero when set");
        }
        if self.lifecycle.hook_timeout_ms == 0 {
            bail!("lifecycle.hook_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    /// Returns parsed listeners with ready-to-bind socket addresses.
    pub fn resolved_listeners(&self) -> Result<Vec<ResolvedListener>> {
        self.listeners
            .iter()
            .map(ResolvedListener::try_from)
            .collect()
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            strict: self.lifecycle.strict,
            hook_timeout: Duration::from_millis(self.lifecycle.hook_timeout_ms),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.server.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Runtime representation of a listener with parsed socket/tls config.
#[derive(Debug, Clone)]
pub struct ResolvedListener {
    pub name: String,
    pub addr: SocketAddr,
    pub tls: Option<Tls>,
}

impl TryFrom<&Listener> for ResolvedListener {
    type Error = anyhow::Error;

    fn try_from(listener: &Listener) -> Result<Self> {
        Ok(Self {
            name: listener.name.clone(),
            addr: listener.parse_bind_addr()?,
            tls: listener.tls.clone(),
        })
    }
}

impl Listener {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("listener name must not be empty");
        }
        self.parse_bind_addr()
            .with_context(|| format!("invalid bind address for listener `{}`", self.name))?;
        if let Some(tls) = &self.tls {
            tls.validate()
                .with_context(|| format!("listener `{}`", self.name))?;
        }
        Ok(())
    }

    /// Accepts `host:port` or the `:port` shorthand for all interfaces.
    pub fn parse_bind_addr(&self) -> Result<SocketAddr> {
        if self.bind.starts_with(':') {
            let addr = format!("0.0.0.0{}", self.bind);
            Ok(SocketAddr::from_str(&addr)?)
        } else {
            Ok(SocketAddr::from_str(&self.bind)?)
        }
    }
}

impl Tls {
    pub fn validate(&self) -> Result<()> {
        if self.cert.trim().is_empty() || self.key.trim().is_empty() {
            bail!("tls cert and key paths must be provided");
        }
        Ok(())
    }
}

/// Expands `${VAR}` and `${VAR:default}` from the process environment.
pub fn interpolate_env(input: &str) -> Result<String> {
    let regex = Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]*))?\}")?;
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_bind_shorthand_defaults_to_all_interfaces() {
        let listener = Listener {
            name: "test".into(),
            bind: ":8080".into(),
            tls: None,
        };
        assert_eq!(
            listener.parse_bind_addr().unwrap(),
            SocketAddr::from_str("0.0.0.0:8080").unwrap()
        );
    }

    #[test]
    fn sections_fall_back_to_defaults() {
        let cfg = HostConfig::from_toml_str(
            r#"
            [[listeners]]
            name = "public"
            bind = "127.0.0.1:8080"
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(cfg.server.max_body_bytes, 1024 * 1024);
        assert_eq!(cfg.request_timeout(), None);
        assert_eq!(cfg.lifecycle_policy(), LifecyclePolicy::default());
        assert!(cfg.settings.is_empty());
    }

    #[test]
    fn settings_keep_nested_tables() {
        let cfg = HostConfig::from_toml_str(
            r#"
            [[listeners]]
            name = "public"
            bind = ":8080"

            [lifecycle]
            strict = true
            hook_timeout_ms = 250

            [settings.greeter]
            hostname = "north"
            "#,
        )
        .unwrap();
        let policy = cfg.lifecycle_policy();
        assert!(policy.strict);
        assert_eq!(policy.hook_timeout, Duration::from_millis(250));
        assert_eq!(cfg.settings["greeter"]["hostname"], "north");
    }

    #[test]
    fn env_placeholders_use_defaults_when_unset() {
        let out = interpolate_env("bind = \"${TRESTLE_TEST_UNSET_BIND:127.0.0.1:9000}\"").unwrap();
        assert_eq!(out, "bind = \"127.0.0.1:9000\"");
        let out = interpolate_env("x = \"${TRESTLE_TEST_UNSET_EMPTY}\"").unwrap();
        assert_eq!(out, "x = \"\"");
    }

    #[test]
    fn validation_reports_problems() {
        let mut cfg = HostConfig::default();
        assert!(cfg.validate().unwrap_err().to_string().contains("at least one listener"));

        cfg.listeners = vec![
            Listener {
                name: "a".into(),
                bind: ":8080".into(),
                tls: None,
            },
            Listener {
                name: "a".into(),
                bind: ":8081".into(),
                tls: None,
            },
        ];
        assert!(cfg.validate().unwrap_err().to_string().contains("duplicate listener"));

        cfg.listeners[1].name = "b".into();
        cfg.lifecycle.hook_timeout_ms = 0;
        assert!(cfg.validate().unwrap_err().to_string().contains("hook_timeout_ms"));
    }
}
