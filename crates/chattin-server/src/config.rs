use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use chattin_gateway::GatewaySettings;

/// Everything the binary reads from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub max_upload_bytes: usize,
    pub gateway: GatewaySettings,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = GatewaySettings::default();
        Ok(Self {
            host: lookup("CHATTIN_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&lookup, "CHATTIN_PORT", 3000)?,
            db_path: lookup("CHATTIN_DB_PATH")
                .unwrap_or_else(|| "chattin.db".into())
                .into(),
            max_upload_bytes: parse(&lookup, "CHATTIN_MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
            gateway: GatewaySettings {
                heartbeat_interval: seconds(
                    &lookup,
                    "CHATTIN_HEARTBEAT_SECS",
                    defaults.heartbeat_interval,
                )?,
                handshake_timeout: seconds(
                    &lookup,
                    "CHATTIN_HANDSHAKE_TIMEOUT_SECS",
                    defaults.handshake_timeout,
                )?,
                max_page_size: parse(&lookup, "CHATTIN_MAX_PAGE_SIZE", defaults.max_page_size)?,
                max_message_len: parse(
                    &lookup,
                    "CHATTIN_MAX_MESSAGE_LEN",
                    defaults.max_message_len,
                )?,
            },
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value {:?}", key, raw)),
        None => Ok(default),
    }
}

/// Whole seconds; zero is rejected since it would disable the timer.
fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    let secs: u64 = parse(lookup, key, default.as_secs())?;
    anyhow::ensure!(secs > 0, "{} must be at least 1", key);
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("chattin.db"));
        assert_eq!(config.max_upload_bytes, 10_485_760);
        assert_eq!(config.gateway.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.gateway.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.gateway.max_page_size, 200);
        assert_eq!(config.gateway.max_message_len, 4000);
        assert_eq!(config.addr().unwrap().to_string(), "0.0.0.0:3000");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("CHATTIN_PORT", "8080"),
            ("CHATTIN_HOST", "127.0.0.1"),
            ("CHATTIN_HEARTBEAT_SECS", "30"),
            ("CHATTIN_MAX_PAGE_SIZE", " 50 "),
        ])
        .unwrap();
        assert_eq!(config.addr().unwrap().to_string(), "127.0.0.1:8080");
        assert_eq!(config.gateway.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.gateway.max_page_size, 50);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = config(&[("CHATTIN_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("CHATTIN_PORT"));

        let err = config(&[("CHATTIN_HANDSHAKE_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(err.to_string().contains("CHATTIN_HANDSHAKE_TIMEOUT_SECS"));
    }
}
