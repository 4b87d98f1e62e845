use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::proxy::DEFAULT_STICKY_TTL;
use crate::render::RenderConfig;

/// Process-wide settings: defaults, then an optional TOML file, then the
/// environment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Comma-separated proxy URLs, credentials allowed as `user:pass@`.
    pub proxy_pool: String,
    pub proxy_sticky_ttl_ms: u64,
    pub human_mode: bool,
    /// Hides phase diagnostics from API responses.
    pub production: bool,
    pub chrome_path: Option<PathBuf>,
    pub static_dir: PathBuf,
    pub rate_limit_per_window: u32,
    pub rate_limit_window_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            proxy_pool: String::new(),
            proxy_sticky_ttl_ms: DEFAULT_STICKY_TTL.as_millis() as u64,
            human_mode: false,
            production: false,
            chrome_path: None,
            static_dir: PathBuf::from("./public"),
            rate_limit_per_window: 300,
            rate_limit_window_secs: 15 * 60,
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Override fields from environment-style variables.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(host) = get("HOST") {
            self.host = host;
        }
        parse_into(&mut self.port, "PORT", get("PORT"));
        if let Some(pool) = get("PROXY_POOL") {
            self.proxy_pool = pool;
        }
        parse_into(
            &mut self.proxy_sticky_ttl_ms,
            "PROXY_STICKY_TTL_MS",
            get("PROXY_STICKY_TTL_MS"),
        );
        if let Some(v) = get("HUMAN_MODE") {
            self.human_mode = is_truthy(&v);
        }
        if let Some(env) = get("APP_ENV").or_else(|| get("NODE_ENV")) {
            self.production = env.eq_ignore_ascii_case("production");
        }
        if let Some(path) = get("CHROME_PATH") {
            self.chrome_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = get("STATIC_DIR") {
            self.static_dir = PathBuf::from(dir);
        }
        parse_into(
            &mut self.rate_limit_per_window,
            "RATE_LIMIT_PER_WINDOW",
            get("RATE_LIMIT_PER_WINDOW"),
        );
        parse_into(
            &mut self.rate_limit_window_secs,
            "RATE_LIMIT_WINDOW_SECS",
            get("RATE_LIMIT_WINDOW_SECS"),
        );
    }

    pub fn diagnostics_enabled(&self) -> bool {
        !self.production
    }

    pub fn sticky_ttl(&self) -> Duration {
        Duration::from_millis(self.proxy_sticky_ttl_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs.max(1))
    }

    pub fn render_config(&self) -> RenderConfig {
        RenderConfig {
            chrome_path: self.chrome_path.clone(),
            human_mode: self.human_mode,
            ..RenderConfig::default()
        }
    }
}

fn parse_into<T: FromStr>(target: &mut T, key: &str, value: Option<String>) {
    let Some(value) = value else {
        return;
    };
    match value.parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => log::warn!("Ignoring invalid {}={:?}", key, value),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = AppConfig::default();
        assert_eq!(c.port, 3000);
        assert_eq!(c.proxy_sticky_ttl_ms, 900_000);
        assert_eq!(c.rate_limit_per_window, 300);
        assert!(c.diagnostics_enabled());
    }

    #[test]
    fn test_env_overrides() {
        let mut c = AppConfig::default();
        c.apply_env(env(&[
            ("PORT", "8081"),
            ("PROXY_POOL", "http://a:1,http://b:2"),
            ("HUMAN_MODE", "true"),
            ("NODE_ENV", "production"),
            ("PROXY_STICKY_TTL_MS", "1000"),
        ]));
        assert_eq!(c.port, 8081);
        assert_eq!(c.proxy_pool, "http://a:1,http://b:2");
        assert!(c.human_mode);
        assert!(!c.diagnostics_enabled());
        assert_eq!(c.sticky_ttl(), Duration::from_secs(1));
        assert!(c.render_config().human_mode);
    }

    #[test]
    fn test_app_env_takes_precedence_over_node_env() {
        let mut c = AppConfig::default();
        c.apply_env(env(&[("APP_ENV", "development"), ("NODE_ENV", "production")]));
        assert!(c.diagnostics_enabled());
    }

    #[test]
    fn test_invalid_numbers_keep_previous_value() {
        let mut c = AppConfig::default();
        c.apply_env(env(&[("PORT", "eighty"), ("RATE_LIMIT_PER_WINDOW", "")]));
        assert_eq!(c.port, 3000);
        assert_eq!(c.rate_limit_per_window, 300);
    }

    #[test]
    fn test_toml_file_then_env() {
        let path = std::env::temp_dir().join(format!("scraper-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "port = 9000\nhuman_mode = true\nstatic_dir = \"/srv/ui\"\n").unwrap();

        let mut c = AppConfig::from_file(&path).unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.static_dir, PathBuf::from("/srv/ui"));

        c.apply_env(env(&[("PORT", "9100")]));
        assert_eq!(c.port, 9100);
        assert!(c.human_mode);

        std::fs::remove_file(&path).unwrap();
    }
}
