//! Server configuration.
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 8080
//! development = true
//! ```
//!
//! Every field is optional. Environment variables override the file:
//!
//! | Variable | Field |
//! |---|---|
//! | `AERO_HOST` | `host` |
//! | `AERO_PORT` | `port` |
//! | `AERO_ENV` | `development` (`development` turns it on, anything else off) |

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::Error;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Exposes error messages in default 500 responses.
    pub development: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 3000,
            development: false,
        }
    }
}

impl ServerConfig {
    pub fn from_toml(source: &str) -> Result<Self, Error> {
        Ok(toml::from_str(source)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let source = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&source)
    }

    /// Applies `AERO_*` environment overrides.
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup("AERO_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("AERO_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!(value = %port, "ignoring invalid AERO_PORT"),
            }
        }
        if let Some(env) = lookup("AERO_ENV") {
            self.development = env.eq_ignore_ascii_case("development");
        }
        self
    }
}
