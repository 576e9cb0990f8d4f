//! Tunnel configuration
//!
//! Loads the static tunnel list from a YAML file (default `~/.portward.yaml`)
//! and resolves every tunnel's optional SSH fields against the global
//! defaults before any session starts.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("No config file found (looked for {0})")]
    NotFound(PathBuf),

    #[error("ssh.private_key is not set")]
    MissingPrivateKey,

    #[error("Tunnel {local_host}:{local_port}: {reason}")]
    Resolution {
        local_host: String,
        local_port: u16,
        reason: String,
    },
}

/// Top-level config file shape.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ssh: SshSettings,
}

/// Global SSH defaults plus the tunnel list.
#[derive(Debug, Clone, Deserialize)]
pub struct SshSettings {
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,

    /// Path to the private key used by both auth strategies.
    pub private_key: Option<String>,

    #[serde(default)]
    pub default_ssh_user: Option<String>,

    #[serde(default)]
    pub default_ssh_host: Option<String>,

    #[serde(default)]
    pub default_ssh_port: Option<u16>,

    /// Authentication strategy: spawn an ssh-agent and inject the key, or
    /// sign with the key directly.
    #[serde(default)]
    pub auth: AuthStrategy,

    /// Check server keys against `~/.ssh/known_hosts`. Off by default since
    /// tunnels are typically pinned to known bastions. Flip on to reject
    /// unknown hosts.
    #[serde(default)]
    pub verify_host_key: bool,

    /// SSH dial timeout in seconds. Accept and relay are unbounded.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    15
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    /// Spawn an ssh-agent, add the key to it, authenticate via the agent.
    #[default]
    Agent,
    /// Read and parse the key file directly, no agent involved.
    Key,
}

/// One tunnel as written in the config file. SSH fields are optional
/// per-tunnel overrides of the global defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSpec {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,

    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl TunnelSpec {
    /// True if the tunnel carries every requested tag.
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }
}

/// A tunnel with all SSH fields resolved to concrete values. Created once
/// per run, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTunnel {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub ssh_host: String,
    pub ssh_user: String,
    pub ssh_port: u16,
}

impl ResolvedTunnel {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn ssh_addr(&self) -> String {
        format!("{}:{}", self.ssh_host, self.ssh_port)
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl Config {
    /// Load from an explicit path, or fall back to `~/.portward.yaml`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
                home.join(".portward.yaml")
            }
        };

        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }

        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let config: Config = serde_yaml::from_str(&raw)?;
        Ok(config)
    }
}

impl SshSettings {
    /// The configured private key path, with `~` expanded.
    pub fn private_key_path(&self) -> Result<PathBuf, ConfigError> {
        let raw = self
            .private_key
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::MissingPrivateKey)?;
        Ok(PathBuf::from(expand_tilde(raw)))
    }

    /// Tunnels carrying every tag in `tags` (all tunnels if `tags` is empty).
    pub fn tunnels_by_tags(&self, tags: &[String]) -> Vec<&TunnelSpec> {
        self.tunnels.iter().filter(|t| t.has_tags(tags)).collect()
    }

    /// Apply defaulting to one tunnel: missing port → 22, missing user/host →
    /// global default, error if no user or host is resolvable.
    pub fn resolve(&self, spec: &TunnelSpec) -> Result<ResolvedTunnel, ConfigError> {
        let fail = |reason: String| ConfigError::Resolution {
            local_host: spec.local_host.clone(),
            local_port: spec.local_port,
            reason,
        };

        let ssh_user = spec
            .ssh_user
            .clone()
            .or_else(|| self.default_ssh_user.clone())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| fail("no ssh user set and no default_ssh_user".into()))?;

        let ssh_host = spec
            .ssh_host
            .clone()
            .or_else(|| self.default_ssh_host.clone())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| fail("no ssh host set and no default_ssh_host".into()))?;

        let ssh_port = spec.ssh_port.or(self.default_ssh_port).unwrap_or(22);
        if ssh_port == 0 {
            return Err(fail("ssh port must be in 1..=65535".into()));
        }
        if spec.local_port == 0 || spec.remote_port == 0 {
            return Err(fail("local and remote ports must be in 1..=65535".into()));
        }

        Ok(ResolvedTunnel {
            remote_host: spec.remote_host.clone(),
            remote_port: spec.remote_port,
            local_host: spec.local_host.clone(),
            local_port: spec.local_port,
            ssh_host,
            ssh_user,
            ssh_port,
        })
    }

    /// Resolve the whole (tag-filtered) tunnel list. Any failure aborts the
    /// run before a single session starts.
    pub fn resolve_all(&self, tags: &[String]) -> Result<Vec<ResolvedTunnel>, ConfigError> {
        self.tunnels_by_tags(tags)
            .into_iter()
            .map(|spec| self.resolve(spec))
            .collect()
    }
}

/// Expand a leading `~` to the home directory; russh's key loader does not
/// handle tildes itself.
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_settings() -> SshSettings {
        serde_yaml::from_str(
            r#"
            private_key: ~/.ssh/id_ed25519
            default_ssh_user: alice
            default_ssh_host: bastion.example.com
            tunnels:
              - remote_host: db.internal
                remote_port: 5432
                local_host: db.local
                local_port: 15432
                tags: [db, prod]
              - remote_host: web.internal
                remote_port: 80
                local_host: web.local
                local_port: 8080
                ssh_user: bob
                ssh_host: edge.example.com
                ssh_port: 2222
                tags: [web]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_apply_to_unset_fields() {
        let settings = sample_settings();
        let resolved = settings.resolve(&settings.tunnels[0]).unwrap();
        assert_eq!(resolved.ssh_user, "alice");
        assert_eq!(resolved.ssh_host, "bastion.example.com");
        assert_eq!(resolved.ssh_port, 22);
        assert_eq!(resolved.local_addr(), "db.local:15432");
        assert_eq!(resolved.remote_addr(), "db.internal:5432");
    }

    #[test]
    fn per_tunnel_overrides_win() {
        let settings = sample_settings();
        let resolved = settings.resolve(&settings.tunnels[1]).unwrap();
        assert_eq!(resolved.ssh_user, "bob");
        assert_eq!(resolved.ssh_addr(), "edge.example.com:2222");
    }

    #[test]
    fn missing_user_fails_resolution() {
        let mut settings = sample_settings();
        settings.default_ssh_user = None;
        let err = settings.resolve(&settings.tunnels[0]).unwrap_err();
        assert!(matches!(err, ConfigError::Resolution { .. }));
        assert!(err.to_string().contains("ssh user"));
    }

    #[test]
    fn zero_port_fails_resolution() {
        let mut settings = sample_settings();
        settings.tunnels[0].local_port = 0;
        assert!(settings.resolve(&settings.tunnels[0]).is_err());
    }

    #[test]
    fn tag_filter_requires_all_tags() {
        let settings = sample_settings();
        assert_eq!(settings.tunnels_by_tags(&[]).len(), 2);
        assert_eq!(settings.tunnels_by_tags(&["db".into()]).len(), 1);
        assert_eq!(
            settings
                .tunnels_by_tags(&["db".into(), "prod".into()])
                .len(),
            1
        );
        assert_eq!(
            settings
                .tunnels_by_tags(&["db".into(), "web".into()])
                .len(),
            0
        );
    }

    #[test]
    fn resolve_all_filters_then_resolves() {
        let settings = sample_settings();
        let resolved = settings.resolve_all(&["web".into()]).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].ssh_user, "bob");
    }

    #[test]
    fn auth_strategy_defaults_to_agent() {
        let settings: SshSettings = serde_yaml::from_str("private_key: /k\n").unwrap();
        assert_eq!(settings.auth, AuthStrategy::Agent);
        assert!(!settings.verify_host_key);
        assert_eq!(settings.connect_timeout_secs, 15);
    }

    #[test]
    fn missing_private_key_is_an_error() {
        let settings: SshSettings = serde_yaml::from_str("default_ssh_user: a\n").unwrap();
        assert!(matches!(
            settings.private_key_path(),
            Err(ConfigError::MissingPrivateKey)
        ));
    }

    #[test]
    fn private_key_tilde_expands() {
        let settings: SshSettings =
            serde_yaml::from_str("private_key: ~/.ssh/id_ed25519\n").unwrap();
        let path = settings.private_key_path().unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.to_string_lossy().ends_with(".ssh/id_ed25519"));
    }
}
