use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Daemon configuration, read from the environment after `dotenvy` has had
/// a chance to populate it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server listens on. `COURIER_PORT`, default 3000.
    pub port: u16,
    /// SQLite database file. `COURIER_DB`, default `~/.courier/courier.db`.
    pub database_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("COURIER_PORT") {
            Ok(value) => value
                .parse()
                .context("COURIER_PORT is not a valid port number")?,
            Err(_) => 3000,
        };

        let database_path = match std::env::var("COURIER_DB") {
            Ok(value) => PathBuf::from(value),
            Err(_) => {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                Path::new(&home).join(".courier").join("courier.db")
            }
        };

        Ok(Self {
            port,
            database_path,
        })
    }
}
