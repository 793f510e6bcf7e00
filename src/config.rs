//! Server configuration from `SLOTD_*` environment variables.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both SLOTD_TLS_CERT and SLOTD_TLS_KEY must be set, or neither")]
    TlsPair,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// `(cert, key)` PEM paths.
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            user: "slotd".into(),
            password: "slotd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Unset variables keep their default; set but unparsable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(port) = parsed(&lookup, "SLOTD_PORT")? {
            config.port = port;
        }
        if let Some(bind) = lookup("SLOTD_BIND") {
            config.bind = bind;
        }
        if let Some(dir) = lookup("SLOTD_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(user) = lookup("SLOTD_USER") {
            config.user = user;
        }
        if let Some(password) = lookup("SLOTD_PASSWORD") {
            config.password = password;
        }
        if let Some(max) = parsed(&lookup, "SLOTD_MAX_CONNECTIONS")? {
            if max == 0 {
                return Err(ConfigError::Invalid {
                    var: "SLOTD_MAX_CONNECTIONS",
                    value: "0".into(),
                });
            }
            config.max_connections = max;
        }
        if let Some(threshold) = parsed(&lookup, "SLOTD_COMPACT_THRESHOLD")? {
            config.compact_threshold = threshold;
        }
        config.metrics_port = parsed(&lookup, "SLOTD_METRICS_PORT")?;
        config.tls = match (lookup("SLOTD_TLS_CERT"), lookup("SLOTD_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            _ => return Err(ConfigError::TlsPair),
        };
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let Some((cert_path, key_path)) = &self.tls else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert!(config.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides_from_environment() {
        let config = Config::from_lookup(lookup(&[
            ("SLOTD_PORT", "6543"),
            ("SLOTD_BIND", "127.0.0.1"),
            ("SLOTD_DATA_DIR", "/var/lib/slotd"),
            ("SLOTD_USER", "ops"),
            ("SLOTD_PASSWORD", "hunter2"),
            ("SLOTD_MAX_CONNECTIONS", "16"),
            ("SLOTD_COMPACT_THRESHOLD", "50"),
            ("SLOTD_METRICS_PORT", "9090"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotd"));
        assert_eq!(config.user, "ops");
        assert_eq!(config.password, "hunter2");
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9090));
    }

    #[test]
    fn rejects_unparsable_values() {
        let err = Config::from_lookup(lookup(&[("SLOTD_PORT", "fifty")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "SLOTD_PORT",
                value: "fifty".into()
            }
        );
        assert!(Config::from_lookup(lookup(&[("SLOTD_MAX_CONNECTIONS", "0")])).is_err());
    }

    #[test]
    fn tls_requires_both_paths() {
        let err = Config::from_lookup(lookup(&[("SLOTD_TLS_CERT", "cert.pem")])).unwrap_err();
        assert_eq!(err, ConfigError::TlsPair);

        let config = Config::from_lookup(lookup(&[
            ("SLOTD_TLS_CERT", "cert.pem"),
            ("SLOTD_TLS_KEY", "key.pem"),
        ]))
        .unwrap();
        assert_eq!(
            config.tls,
            Some((PathBuf::from("cert.pem"), PathBuf::from("key.pem")))
        );
    }

    #[test]
    fn missing_tls_files_surface_io_error() {
        let config = Config::from_lookup(lookup(&[
            ("SLOTD_TLS_CERT", "/nonexistent/cert.pem"),
            ("SLOTD_TLS_KEY", "/nonexistent/key.pem"),
        ]))
        .unwrap();
        assert!(config.tls_acceptor().is_err());
    }
}
