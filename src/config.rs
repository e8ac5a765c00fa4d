//! Application configuration
//!
//! Read from `PHARMADESK_*` environment variables (a `.env` file is loaded
//! first when present).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_HTTP_PORT: u16 = 3030;
pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// External REST API base URL, without trailing slash
    pub api_base_url: String,
    /// Port of the local HTTP surface
    pub http_port: u16,
    /// Where local storage lives
    pub data_dir: PathBuf,
    pub page_size: u32,
    /// Printed on prescription headers
    pub clinic_name: String,
    pub request_timeout: Duration,
    pub low_stock_threshold: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            data_dir: default_data_dir(),
            page_size: DEFAULT_PAGE_SIZE,
            clinic_name: "OPD Clinic".to_string(),
            request_timeout: Duration::from_secs(30),
            low_stock_threshold: 10,
        }
    }
}

impl AppConfig {
    /// Loads `.env` (if any) and reads the environment.
    pub fn load() -> AppResult<Self> {
        match dotenvy::dotenv() {
            Ok(path) => log::info!("[config] loaded {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => log::warn!("[config] ignoring .env: {}", e),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("PHARMADESK_API_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(AppError::Config(format!(
                    "PHARMADESK_API_URL must be an http(s) URL, got '{}'",
                    url
                )));
            }
            config.api_base_url = url;
        }
        if let Some(port) = parse_var::<u16>(&lookup, "PHARMADESK_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(dir) = lookup("PHARMADESK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(size) = parse_var::<u32>(&lookup, "PHARMADESK_PAGE_SIZE")? {
            if size == 0 {
                return Err(AppError::Config("PHARMADESK_PAGE_SIZE must be at least 1".into()));
            }
            config.page_size = size;
        }
        if let Some(name) = lookup("PHARMADESK_CLINIC_NAME") {
            config.clinic_name = name;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PHARMADESK_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(threshold) = parse_var::<i64>(&lookup, "PHARMADESK_LOW_STOCK_THRESHOLD")? {
            config.low_stock_threshold = threshold;
        }

        Ok(config)
    }

    pub fn storage_path(&self) -> PathBuf {
        self.data_dir.join("storage.db")
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> AppResult<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{} has an invalid value '{}'", key, raw))),
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pharmadesk")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_base_url, DEFAULT_API_URL);
        assert_eq!(config.http_port, 3030);
        assert_eq!(config.page_size, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PHARMADESK_API_URL", "https://api.example.com/"),
            ("PHARMADESK_HTTP_PORT", "8080"),
            ("PHARMADESK_PAGE_SIZE", "25"),
            ("PHARMADESK_DATA_DIR", "/tmp/pd"),
        ]))
        .unwrap();
        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.page_size, 25);
        assert_eq!(config.storage_path(), PathBuf::from("/tmp/pd/storage.db"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(AppConfig::from_lookup(lookup(&[("PHARMADESK_HTTP_PORT", "abc")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("PHARMADESK_PAGE_SIZE", "0")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("PHARMADESK_API_URL", "localhost")])).is_err());
    }
}
