use std::collections::HashMap;

use anyhow::{Result, anyhow};
use dotenv::*;


/// Source of string configuration values, looked up by key.
///
/// Implementations are cloned into request state, hence `clone_box_dyn`.
pub trait Config: Send + Sync{
    fn get(&self, key: &str) -> Result<String>;
    fn clone_box_dyn(&self) -> Box<dyn Config>;

    /// Like `get`, but treats a missing or empty value as `None`.
    fn get_opt(&self, key: &str) -> Option<String> {
        self.get(key)
        .ok()
        .filter(|v|!v.trim().is_empty())
    }
}

impl Clone for Box<dyn Config> {
    fn clone(&self) -> Self {
        self.clone_box_dyn()
    }
}

impl <C> Config for &C
where C: Config + ?Sized
{
    fn get(&self, key: &str) -> Result<String> {
        (**self).get(key)
    }

    fn clone_box_dyn(&self) -> Box<dyn Config> {
        (**self).clone_box_dyn()
    }
}

#[derive(Clone)]
pub struct CompositeConfig {
    main: Box<dyn Config>,
    fallback: Box<dyn Config>,
}

impl CompositeConfig {
    pub fn from_configs(main: Box<dyn Config>, fallback: Box<dyn Config>) -> CompositeConfig {
        CompositeConfig{ main, fallback }
    }
}

impl Config for CompositeConfig {
    fn get(&self, key: &str) -> Result<String> {
        self.main
        .get(key)
        .or_else(|_e| self.fallback.get(key))
    }

    fn clone_box_dyn(&self) -> Box<dyn Config> {
        Box::new(CompositeConfig {
            main: self.main.clone_box_dyn(),
            fallback: self.fallback.clone_box_dyn()
        })
    }
}



#[derive(Clone)]
pub struct EnvConfig;

impl EnvConfig {
    /// Reads the process environment, after merging in a `.env` file if one
    /// is found. A missing `.env` file is not an error.
    pub fn from_env() -> EnvConfig {
        let _ = dotenv();
        EnvConfig
    }
}

/// Values used when neither the environment nor a secret store provide one.
pub fn default_config() -> impl Config {
    let default_values = [
        ("BIND_ADDRESS", "127.0.0.1:8787"),
        ("UNSPLASH_API_URL", "https://api.unsplash.com"),
        ("KV_CORRUPT_ENTRY", "fail"),
        // only a proxy in front of the service makes these headers reliable
        ("TRUST_FORWARDED_HEADERS", "false"),
    ];
    let mut default_config = HashMap::<String,String>::new();
    for (k,v) in default_values {
        default_config.insert(k.to_string(), v.to_string());
    }
    HashMapConfig::new(default_config)
}

impl Config for EnvConfig{
    fn get(&self, key: &str) -> Result<String> {
        std::env::var(key).map_err(|_| anyhow!("no such environment variable {key}"))
    }
    fn clone_box_dyn(&self) -> Box<dyn Config> {
        Box::new(self.clone())
    }
}

#[derive(Clone, Default)]
pub struct HashMapConfig {
    map: HashMap<String,String>
}

impl HashMapConfig {
    pub fn new(map: HashMap<String,String>) -> HashMapConfig {
        Self {map}
    }

    pub fn with(mut self, key: &str, value: &str) -> HashMapConfig {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

impl Config for HashMapConfig {
    fn get(&self, key: &str) -> Result<String> {
        self.map
        .get(key)
        .map(String::clone)
        .ok_or_else(||anyhow!("key '{key}' not found"))
    }

    fn clone_box_dyn(&self) -> Box<dyn Config> {
        Box::new(self.clone())
    }
}

#[test]
fn test_composite_falls_back() {
    let main = HashMapConfig::default().with("CLIENT_ID", "from-env");
    let config = CompositeConfig::from_configs(Box::new(main), Box::new(default_config()));

    assert_eq!(config.get("CLIENT_ID").unwrap(), "from-env");
    assert_eq!(config.get("BIND_ADDRESS").unwrap(), "127.0.0.1:8787");
    assert_eq!(config.get("TRUST_FORWARDED_HEADERS").unwrap(), "false");
    assert!(config.get("PG_ADDRESS").is_err());
}

#[test]
fn test_main_overrides_default() {
    let main = HashMapConfig::default().with("BIND_ADDRESS", "0.0.0.0:9000");
    let config = CompositeConfig::from_configs(Box::new(main), Box::new(default_config()));

    assert_eq!(config.get("BIND_ADDRESS").unwrap(), "0.0.0.0:9000");
    assert_eq!(config.clone_box_dyn().get("BIND_ADDRESS").unwrap(), "0.0.0.0:9000");
}

#[test]
fn test_get_opt_ignores_blank_values() {
    let config = HashMapConfig::default()
    .with("ALLOWED_ORIGINS", "  ")
    .with("KV_CACHE_TTL", "30");

    assert_eq!(config.get_opt("ALLOWED_ORIGINS"), None);
    assert_eq!(config.get_opt("KV_CACHE_TTL").as_deref(), Some("30"));
    assert_eq!(config.get_opt("MISSING"), None);
}
