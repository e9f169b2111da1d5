use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level server configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub server: ServerSection,
    #[serde(default)]
    pub store: HashMap<String, StoreSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Comma-separated list of `scheme:address` bindings, e.g.
    /// `socket:*:7000,local:/tmp/simutrace.sock`.
    pub bindings: String,
    pub workspace: PathBuf,
    #[serde(default)]
    pub memmgmt: MemoryManagementSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub workerpool: WorkerPoolSection,
    #[serde(default)]
    pub requestworkerpool: WorkerPoolSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryManagementSection {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub disable_cache: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_sleep_ms")]
    pub retry_sleep_ms: u64,
    #[serde(default = "default_read_ahead")]
    pub read_ahead: usize,
}

impl MemoryManagementSection {
    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }
}

impl Default for MemoryManagementSection {
    fn default() -> Self {
        MemoryManagementSection {
            pool_size: default_pool_size(),
            disable_cache: false,
            retry_count: default_retry_count(),
            retry_sleep_ms: default_retry_sleep_ms(),
            read_ahead: default_read_ahead(),
        }
    }
}

fn default_pool_size() -> usize {
    64 * 1024 * 1024
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_sleep_ms() -> u64 {
    50
}
fn default_read_ahead() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionSection {
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection {
            close_timeout_secs: default_close_timeout_secs(),
        }
    }
}

fn default_close_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerPoolSection {
    #[serde(default = "default_worker_count")]
    pub size: usize,
}

impl Default for WorkerPoolSection {
    fn default() -> Self {
        WorkerPoolSection {
            size: default_worker_count(),
        }
    }
}

fn default_worker_count() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSection {
    pub root: PathBuf,
}

/// One parsed `scheme:address` binding from `server.bindings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Local { path: String },
    Socket { host: String, port: String },
}

impl Binding {
    pub fn parse_list(spec: &str) -> Result<Vec<Binding>> {
        spec.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Binding::parse_one)
            .collect()
    }

    fn parse_one(spec: &str) -> Result<Binding> {
        let (scheme, address) = spec
            .split_once(':')
            .ok_or_else(|| Error::Configuration(format!("malformed binding '{spec}'")))?;

        match scheme {
            "local" => Ok(Binding::Local {
                path: address.to_string(),
            }),
            "socket" => {
                let (host, port) = address
                    .rsplit_once(':')
                    .ok_or_else(|| Error::Configuration(format!("malformed socket binding '{spec}'")))?;
                Ok(Binding::Socket {
                    host: host.to_string(),
                    port: port.to_string(),
                })
            }
            other => Err(Error::Configuration(format!("unknown binding scheme '{other}'"))),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read config file: {e}")))?;
        let config: ServerConfig =
            toml::from_str(&content).map_err(|e| Error::Configuration(format!("invalid toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let bindings = Binding::parse_list(&self.server.bindings)?;
        if bindings.is_empty() {
            return Err(Error::Configuration("no bindings configured".into()));
        }
        if self.server.memmgmt.pool_size == 0 {
            return Err(Error::Configuration("memmgmt.pool_size must be > 0".into()));
        }
        if self.server.workerpool.size == 0 || self.server.requestworkerpool.size == 0 {
            return Err(Error::Configuration("worker pool sizes must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_binding_list() {
        let bindings = Binding::parse_list("socket:*:7000, local:/tmp/st.sock").unwrap();
        assert_eq!(
            bindings,
            vec![
                Binding::Socket {
                    host: "*".into(),
                    port: "7000".into()
                },
                Binding::Local {
                    path: "/tmp/st.sock".into()
                },
            ]
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Binding::parse_list("ftp:host:1").is_err());
    }
}
