use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

use crate::server::ServerOptions;

/// Longest shutdown grace period accepted from the environment.
const MAX_SHUTDOWN_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub admin_port: Option<u16>,
    pub admin_token: Option<String>,
    pub shutdown_grace: Duration,
    pub max_message_bytes: usize,
    pub tls: Option<TlsPaths>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be a valid u16")]
    InvalidPort(&'static str),
    #[error("RPC_SHUTDOWN_GRACE_SECS must be a number of seconds between 0 and 86400")]
    InvalidGrace,
    #[error("RPC_MAX_MESSAGE_BYTES must be a positive integer")]
    InvalidMessageLimit,
    #[error("RPC_TLS_CERT and RPC_TLS_KEY must be set together")]
    IncompleteTls,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("RPC_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let bind_port = parse_var("RPC_BIND_PORT", || ConfigError::InvalidPort("RPC_BIND_PORT"))?
            .unwrap_or(50051);
        let admin_port =
            parse_var("RPC_ADMIN_PORT", || ConfigError::InvalidPort("RPC_ADMIN_PORT"))?;
        let admin_token = non_empty_var("RPC_ADMIN_TOKEN");

        let shutdown_grace = parse_var::<f64>("RPC_SHUTDOWN_GRACE_SECS", || {
            ConfigError::InvalidGrace
        })?
        .map(|secs| match Duration::try_from_secs_f64(secs) {
            Ok(grace) if grace <= MAX_SHUTDOWN_GRACE => Ok(grace),
            _ => Err(ConfigError::InvalidGrace),
        })
        .transpose()?
        .unwrap_or(Duration::from_secs(5));

        let max_message_bytes = parse_var::<usize>("RPC_MAX_MESSAGE_BYTES", || {
            ConfigError::InvalidMessageLimit
        })?
        .map(|limit| {
            if limit == 0 {
                Err(ConfigError::InvalidMessageLimit)
            } else {
                Ok(limit)
            }
        })
        .transpose()?
        .unwrap_or_else(|| ServerOptions::default().max_message_bytes);

        let tls = match (non_empty_var("RPC_TLS_CERT"), non_empty_var("RPC_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        let config = Self {
            bind_addr,
            bind_port,
            admin_port,
            admin_token,
            shutdown_grace,
            max_message_bytes,
            tls,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        self.socket(self.bind_port)
    }

    pub fn admin_socket(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.admin_port.map(|port| self.socket(port)).transpose()
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            max_message_bytes: self.max_message_bytes,
            ..ServerOptions::default()
        }
    }

    fn socket(&self, port: u16) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr>(
    name: &str,
    invalid: impl FnOnce() -> ConfigError,
) -> Result<Option<T>, ConfigError> {
    non_empty_var(name)
        .map(|value| value.parse::<T>().map_err(|_| invalid()))
        .transpose()
}

#[cfg(test)]
mod tests {
    use parking_lot::{const_mutex, Mutex};

    use super::*;

    // Tests share the process environment.
    static ENV_LOCK: Mutex<()> = const_mutex(());

    const VARS: [&str; 8] = [
        "RPC_BIND_ADDR",
        "RPC_BIND_PORT",
        "RPC_ADMIN_PORT",
        "RPC_ADMIN_TOKEN",
        "RPC_SHUTDOWN_GRACE_SECS",
        "RPC_MAX_MESSAGE_BYTES",
        "RPC_TLS_CERT",
        "RPC_TLS_KEY",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn parse_defaults() {
        let _env = ENV_LOCK.lock();
        clear_env();

        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 50051);
        assert_eq!(config.admin_port, None);
        assert_eq!(config.admin_token, None);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.max_message_bytes, 4 * 1024 * 1024);
        assert_eq!(config.tls, None);
    }

    #[test]
    fn fractional_grace_parses() {
        let _env = ENV_LOCK.lock();
        clear_env();
        env::set_var("RPC_SHUTDOWN_GRACE_SECS", "0.25");

        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
    }

    #[test]
    fn negative_grace_fails() {
        let _env = ENV_LOCK.lock();
        clear_env();
        env::set_var("RPC_SHUTDOWN_GRACE_SECS", "-1");

        let err = Config::from_env().expect_err("expected invalid grace error");
        assert!(matches!(err, ConfigError::InvalidGrace));
    }

    #[test]
    fn oversized_grace_fails() {
        let _env = ENV_LOCK.lock();
        clear_env();

        for value in ["1e19", "86401", "inf"] {
            env::set_var("RPC_SHUTDOWN_GRACE_SECS", value);
            let err = Config::from_env().expect_err("expected invalid grace error");
            assert!(matches!(err, ConfigError::InvalidGrace), "{value}");
        }

        env::set_var("RPC_SHUTDOWN_GRACE_SECS", "86400");
        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.shutdown_grace, MAX_SHUTDOWN_GRACE);
    }

    #[test]
    fn invalid_port_names_the_variable() {
        let _env = ENV_LOCK.lock();
        clear_env();
        env::set_var("RPC_ADMIN_PORT", "99999");

        let err = Config::from_env().expect_err("expected invalid port error");
        assert!(matches!(err, ConfigError::InvalidPort("RPC_ADMIN_PORT")));
    }

    #[test]
    fn tls_requires_both_paths() {
        let _env = ENV_LOCK.lock();
        clear_env();
        env::set_var("RPC_TLS_CERT", "/etc/rpc/cert.pem");

        let err = Config::from_env().expect_err("expected incomplete tls error");
        assert!(matches!(err, ConfigError::IncompleteTls));

        env::set_var("RPC_TLS_KEY", "/etc/rpc/key.pem");
        let config = Config::from_env().expect("config should parse");
        assert_eq!(
            config.tls,
            Some(TlsPaths {
                cert: "/etc/rpc/cert.pem".into(),
                key: "/etc/rpc/key.pem".into(),
            })
        );
    }

    #[test]
    fn zero_message_limit_fails() {
        let _env = ENV_LOCK.lock();
        clear_env();
        env::set_var("RPC_MAX_MESSAGE_BYTES", "0");

        let err = Config::from_env().expect_err("expected invalid limit error");
        assert!(matches!(err, ConfigError::InvalidMessageLimit));
    }
}
