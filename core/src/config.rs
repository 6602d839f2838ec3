/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_PORT: u16 = 17082;
const DEFAULT_DATA_DIR: &str = ".chatsync";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the sled databases
    pub data_dir: PathBuf,

    /// Messenger API listen address
    pub api_addr: SocketAddr,

    /// Upper bound for any single store call, lock wait included
    pub store_timeout: Duration,

    /// How many times a create-conversation rollback write is attempted
    pub rollback_attempts: u32,

    /// Base delay between rollback attempts (multiplied by attempt number)
    pub rollback_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            api_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT)),
            store_timeout: Duration::from_secs(5),
            rollback_attempts: 3,
            rollback_backoff: Duration::from_millis(50),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();
        let mut api_port: Option<u16> = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = flag_value(args, i)?;
                    config.data_dir = PathBuf::from(path);
                    i += 2;
                }
                "--api-port" => {
                    api_port = Some(parse_flag::<u16>(args, i, "a valid port (0-65535)")?);
                    i += 2;
                }
                "--store-timeout-ms" => {
                    let ms = parse_flag::<u64>(args, i, "a number of milliseconds")?;
                    config.store_timeout = Duration::from_millis(ms);
                    i += 2;
                }
                "--rollback-attempts" => {
                    config.rollback_attempts = parse_flag::<u32>(args, i, "a positive number")?;
                    i += 2;
                }
                "--rollback-backoff-ms" => {
                    let ms = parse_flag::<u64>(args, i, "a number of milliseconds")?;
                    config.rollback_backoff = Duration::from_millis(ms);
                    i += 2;
                }
                other => {
                    return Err(SyncError::Config(format!(
                        "Unknown argument: {}\nUsage: {} [--data-dir <path>] [--api-port <port>] [--store-timeout-ms <ms>] [--rollback-attempts <n>] [--rollback-backoff-ms <ms>]",
                        other,
                        args.first().map(String::as_str).unwrap_or("chatsync")
                    )));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(dir) = std::env::var("CHATSYNC_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }
        if let Some(p) = std::env::var("CHATSYNC_API_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            api_port = Some(p);
        }
        if let Some(ms) = std::env::var("CHATSYNC_STORE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.store_timeout = Duration::from_millis(ms);
        }

        if let Some(p) = api_port {
            config.api_addr.set_port(p);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_timeout.is_zero() {
            return Err(SyncError::Config(
                "store timeout must be greater than zero".to_string(),
            ));
        }
        if self.rollback_attempts == 0 {
            return Err(SyncError::Config(
                "rollback attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn flag_value(args: &[String], i: usize) -> Result<&str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| SyncError::Config(format!("{} requires an argument", args[i])))
}

fn parse_flag<T: std::str::FromStr>(args: &[String], i: usize, expected: &str) -> Result<T> {
    flag_value(args, i)?
        .parse::<T>()
        .map_err(|_| SyncError::Config(format!("{} must be {}", args[i], expected)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.rollback_attempts, 3);
        assert_eq!(config.api_addr.port(), DEFAULT_API_PORT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags() {
        let config = Config::from_args(&args(&[
            "chatsync",
            "--data-dir",
            "/tmp/cs",
            "--store-timeout-ms",
            "250",
            "--rollback-attempts",
            "5",
        ]))
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/cs"));
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.rollback_attempts, 5);
    }

    #[test]
    fn test_bad_flags() {
        assert!(Config::from_args(&args(&["chatsync", "--api-port"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "--api-port", "nope"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "--rollback-attempts", "0"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "--bogus"])).is_err());
    }
}
