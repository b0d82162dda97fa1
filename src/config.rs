use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Assets pre-cached by every generation unless the config file lists its own.
pub const DEFAULT_MANIFEST: &[&str] = &[
  "/",
  "/index.html",
  "/destination.html",
  "/crew.html",
  "/technology.html",
  "/design-system.html",
  "/404.html",
  "/index.css",
  "/booking.css",
  "/features.css",
  "/navigation.js",
  "/tabs.js",
  "/transitions.js",
  "/utils.js",
  "/enhancements.js",
  "/booking.js",
  "/countdown.js",
  "/faq.js",
  "/testimonials.js",
  "/manifest.json",
  "/assets/favicon-32x32.png",
  "/assets/shared/logo.svg",
];

const DEFAULT_ORIGIN: &str = "http://localhost:8080";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Site origin; requests to any other origin are never intercepted
  #[serde(default = "default_origin")]
  pub origin: String,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Cache database path (defaults to $XDG_DATA_HOME/orbit/cache.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Prefix shared by both store names
  #[serde(default = "default_prefix")]
  pub prefix: String,
  /// Version tag; bump it whenever the manifest changes
  #[serde(default = "default_version")]
  pub version: String,
  /// Page served for failed navigations while offline
  #[serde(default = "default_fallback_path")]
  pub fallback_path: String,
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  /// Take over from the previous generation as soon as install completes
  #[serde(default = "default_true")]
  pub skip_waiting_on_install: bool,
}

fn default_origin() -> String {
  DEFAULT_ORIGIN.to_string()
}

fn default_prefix() -> String {
  "space-tourism".to_string()
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_fallback_path() -> String {
  "/404.html".to_string()
}

fn default_manifest() -> Vec<String> {
  DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
  true
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: default_prefix(),
      version: default_version(),
      fallback_path: default_fallback_path(),
      manifest: default_manifest(),
      skip_waiting_on_install: true,
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      cache: CacheConfig::default(),
      database: None,
    }
  }
}

/// Immutable configuration of one cache generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
  pub origin: Url,
  pub static_cache_name: String,
  pub runtime_cache_name: String,
  pub manifest: Vec<String>,
  pub fallback_path: String,
  pub skip_waiting_on_install: bool,
}

impl ControllerConfig {
  /// Whether `name` belongs to this generation.
  pub fn owns_cache(&self, name: &str) -> bool {
    name == self.static_cache_name || name == self.runtime_cache_name
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./orbit.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/orbit/config.yaml
  ///
  /// Built-in defaults apply when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("orbit.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("orbit").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Static store name for a version, e.g. `space-tourism-v1`.
  pub fn static_cache_name(&self, version: &str) -> String {
    format!("{}-{}", self.cache.prefix, version)
  }

  /// Runtime store name for a version, e.g. `space-tourism-runtime-v1`.
  pub fn runtime_cache_name(&self, version: &str) -> String {
    format!("{}-runtime-{}", self.cache.prefix, version)
  }

  /// Build the configuration of one generation.
  ///
  /// `version` overrides the configured version tag. The fallback page is
  /// always part of the manifest so it is available offline.
  pub fn controller_config(&self, version: Option<&str>) -> Result<ControllerConfig> {
    let origin =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    if origin.cannot_be_a_base() || origin.host().is_none() {
      return Err(eyre!("Origin must be an absolute http(s) URL: {}", self.origin));
    }

    let version = version.unwrap_or(&self.cache.version);
    if version.trim().is_empty() {
      return Err(eyre!("Cache version must not be empty"));
    }

    for path in self.cache.manifest.iter().chain([&self.cache.fallback_path]) {
      validate_path(path)?;
    }

    let mut manifest = self.cache.manifest.clone();
    if !manifest.contains(&self.cache.fallback_path) {
      manifest.push(self.cache.fallback_path.clone());
    }

    Ok(ControllerConfig {
      origin,
      static_cache_name: self.static_cache_name(version),
      runtime_cache_name: self.runtime_cache_name(version),
      manifest,
      fallback_path: self.cache.fallback_path.clone(),
      skip_waiting_on_install: self.cache.skip_waiting_on_install,
    })
  }

  /// Cache database location.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => crate::cache::SqliteStorage::default_path(),
    }
  }
}

/// Manifest entries are same-origin absolute paths.
fn validate_path(path: &str) -> Result<()> {
  if !path.starts_with('/') || path.starts_with("//") {
    return Err(eyre!(
      "Cached path must be an absolute same-origin path: {}",
      path
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_site() {
    let config = Config::default();
    let controller = config.controller_config(None).unwrap();

    assert_eq!(controller.static_cache_name, "space-tourism-v1");
    assert_eq!(controller.runtime_cache_name, "space-tourism-runtime-v1");
    assert_eq!(controller.fallback_path, "/404.html");
    assert_eq!(controller.manifest.len(), DEFAULT_MANIFEST.len());
    assert!(controller.skip_waiting_on_install);
    assert!(controller.owns_cache("space-tourism-runtime-v1"));
    assert!(!controller.owns_cache("space-tourism-v0"));
  }

  #[test]
  fn test_version_override() {
    let controller = Config::default().controller_config(Some("v2")).unwrap();
    assert_eq!(controller.static_cache_name, "space-tourism-v2");
    assert_eq!(controller.runtime_cache_name, "space-tourism-runtime-v2");
  }

  #[test]
  fn test_parse_partial_yaml() {
    let yaml = r#"
origin: "https://space-tourism.test"
cache:
  version: v3
  manifest: ["/a.html", "/b.css"]
  fallback_path: /offline.html
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.cache.prefix, "space-tourism");
    assert!(config.cache.skip_waiting_on_install);

    let controller = config.controller_config(None).unwrap();
    assert_eq!(controller.origin.as_str(), "https://space-tourism.test/");
    assert_eq!(controller.static_cache_name, "space-tourism-v3");
    // Fallback page is appended to the manifest
    assert_eq!(
      controller.manifest,
      vec!["/a.html", "/b.css", "/offline.html"]
    );
  }

  #[test]
  fn test_rejects_cross_origin_manifest_entry() {
    let mut config = Config::default();
    config.cache.manifest = vec!["https://cdn.example.com/lib.js".to_string()];
    assert!(config.controller_config(None).is_err());

    config.cache.manifest = vec!["//cdn.example.com/lib.js".to_string()];
    assert!(config.controller_config(None).is_err());
  }

  #[test]
  fn test_rejects_bad_origin() {
    let config = Config {
      origin: "not a url".to_string(),
      ..Config::default()
    };
    assert!(config.controller_config(None).is_err());
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orbit.yaml");
    std::fs::write(&path, "origin: https://space-tourism.test\ncache:\n  prefix: orbit\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.static_cache_name("v1"), "orbit-v1");

    let missing = dir.path().join("missing.yaml");
    assert!(Config::load(Some(&missing)).is_err());
  }
}
