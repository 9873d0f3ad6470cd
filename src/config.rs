//! Line-based `key = value` configuration, the small bespoke grammar this
//! crate uses instead of pulling in a schema-driven config crate for four
//! scalar knobs.
//!
//! ```text
//! # comment
//! port = 9981
//! threads = 4
//! use = epoll
//! logfile = /var/log/asuka.log
//! ```

use std::fs;
use std::io::{self, BufRead};
use std::path::Path;

use crate::error::ConfigError;

const DEFAULT_PORT: u16 = 0;
const DEFAULT_THREADS: usize = 0;
const DEFAULT_USE: &str = "epoll";

/// Parsed, validated configuration. Construct with [`Config::from_file`] or
/// [`Config::from_reader`]; every field omitted from the source falls back to
/// its documented default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    port: u16,
    threads: usize,
    use_epoll: bool,
    logfile: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: DEFAULT_PORT,
            threads: DEFAULT_THREADS,
            use_epoll: DEFAULT_USE == "epoll",
            logfile: String::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Config> {
        let text = fs::read_to_string(path)?;
        Config::from_reader(text.as_bytes()).map_err(io::Error::from)
    }

    pub fn from_reader(reader: impl io::Read) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        let mut seen = std::collections::HashSet::new();

        for (lineno, line) in io::BufReader::new(reader).lines().enumerate() {
            let line = line.map_err(|e| ConfigError::new(format!("line {}: {e}", lineno + 1)))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                ConfigError::new(format!("line {}: expected `key = value`, got {:?}", lineno + 1, line))
            })?;
            let key = key.trim();
            let value = value.trim();

            if !seen.insert(key.to_string()) {
                return Err(ConfigError::new(format!("line {}: duplicate key {:?}", lineno + 1, key)));
            }

            match key {
                "port" => {
                    config.port = value
                        .parse()
                        .map_err(|_| ConfigError::new(format!("line {}: invalid port {:?}", lineno + 1, value)))?;
                }
                "threads" => {
                    config.threads = value.parse().map_err(|_| {
                        ConfigError::new(format!("line {}: invalid thread count {:?}", lineno + 1, value))
                    })?;
                }
                "use" => match value {
                    "epoll" => config.use_epoll = true,
                    "poll" => config.use_epoll = false,
                    other => {
                        return Err(ConfigError::new(format!(
                            "line {}: `use` must be \"epoll\" or \"poll\", got {:?}",
                            lineno + 1,
                            other
                        )))
                    }
                },
                "logfile" => config.logfile = value.to_string(),
                other => {
                    return Err(ConfigError::new(format!("line {}: unrecognized key {:?}", lineno + 1, other)))
                }
            }
        }

        Ok(config)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Which [`crate::poller::Demultiplexer`] back end to construct the loop with.
    pub fn use_epoll(&self) -> bool {
        self.use_epoll
    }

    pub fn logfile(&self) -> &str {
        &self.logfile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = Config::from_reader("".as_bytes()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.port(), 0);
        assert_eq!(config.threads(), 0);
        assert!(config.use_epoll());
        assert_eq!(config.logfile(), "");
    }

    #[test]
    fn parses_all_keys() {
        let text = "\
# a comment
port = 9981
threads = 4
use = poll
logfile = /tmp/asuka.log
";
        let config = Config::from_reader(text.as_bytes()).unwrap();
        assert_eq!(config.port(), 9981);
        assert_eq!(config.threads(), 4);
        assert!(!config.use_epoll());
        assert_eq!(config.logfile(), "/tmp/asuka.log");
    }

    #[test]
    fn rejects_unknown_key() {
        let err = Config::from_reader("bogus = 1".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unrecognized key"));
    }

    #[test]
    fn rejects_malformed_port() {
        let err = Config::from_reader("port = not-a-number".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("invalid port"));
    }

    #[test]
    fn rejects_bad_use_value() {
        let err = Config::from_reader("use = select".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("must be"));
    }

    #[test]
    fn rejects_duplicate_key() {
        let err = Config::from_reader("port = 1\nport = 2\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn ignores_blank_lines_and_whitespace() {
        let config = Config::from_reader("\n  \n  port   =   42  \n".as_bytes()).unwrap();
        assert_eq!(config.port(), 42);
    }
}
