use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub kv: KvConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub routing: RoutingConfig,
    pub derivatives: DerivativeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Whole-request deadline applied by the HTTP layer.
    pub request_timeout_seconds: u64,
    /// Drain window for detached background tasks on shutdown.
    pub shutdown_drain_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_seconds: 60,
            shutdown_drain_seconds: 10,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Host of the transformation endpoint, e.g. "https://cdn.example.com".
    /// Transform URLs are `{host}/cdn-cgi/media/{params}/{origin}`.
    pub transform_host: String,
    /// Origin used for pass-through patterns (no rewrite template).
    pub default_origin: String,
    /// Origin query parameters preserved on the asynchronous path.
    /// The synchronous path strips all origin query parameters.
    pub async_query_allowlist: Vec<String>,
    /// Deadline for each upstream fetch (transform endpoint and origin).
    pub upstream_timeout_seconds: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            transform_host: "https://cdn.example.com".to_string(),
            default_origin: "https://videos.example.com".to_string(),
            async_query_allowlist: vec!["debug".to_string()],
            upstream_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Redis URL. When unset, the in-memory store is used (single node).
    pub url: Option<String>,
    /// Key prefix shared by the three namespaces.
    pub key_prefix: String,
    /// Maximum stored value size. Larger bodies are rejected at `put`.
    pub max_value_bytes: usize,
    /// Deadline for each KV operation.
    pub op_timeout_seconds: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: "vidgate".to_string(),
            max_value_bytes: 25 * 1024 * 1024,
            op_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for stored artifacts unless the matched pattern overrides it.
    pub default_ttl_seconds: u64,
    /// Refresh the TTL once this fraction of it has elapsed.
    pub refresh_elapsed_fraction: f64,
    /// Never refresh when less than this many seconds remain.
    pub refresh_min_remaining_seconds: u64,
    /// Bounded retries for refresh writes hitting backend rate limits.
    pub refresh_max_retries: usize,
    /// Query parameters that bypass the cache, in addition to the
    /// built-in `debug`, `nocache` and `bypass`.
    pub bypass_params: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 86_400,
            refresh_elapsed_fraction: 0.10,
            refresh_min_remaining_seconds: 60,
            refresh_max_retries: 3,
            bypass_params: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Query parameters that always bypass the cache.
    pub const BUILTIN_BYPASS_PARAMS: &'static [&'static str] = &["debug", "nocache", "bypass"];

    /// Whether the presence of `key` in the query string bypasses the
    /// cache. Bypassed requests are handler-produced and never stored.
    #[must_use]
    pub fn is_bypass_param(&self, key: &str) -> bool {
        Self::BUILTIN_BYPASS_PARAMS.contains(&key)
            || self.bypass_params.iter().any(|p| p == key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty".
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub patterns: Vec<PathPatternConfig>,
}

/// One ordered routing rule. Priorities are total-ordered within a ruleset;
/// ties are broken by declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathPatternConfig {
    pub name: String,
    /// Regex matched against the normalized request path. An empty matcher
    /// is permitted; compilation failures skip the rule.
    pub matcher: String,
    /// When false the pattern matches but the request is passed through to
    /// the origin untransformed.
    pub process_path: bool,
    /// Origin URL template with `${1}`-style numeric and `${name}` named
    /// substitutions. `None` signals "no rewrite, pass through".
    pub origin_url_template: Option<String>,
    pub capture_group_names: Vec<String>,
    /// Higher first. Defaults to 0.
    pub priority: Option<i32>,
    pub auth: Option<PatternAuthConfig>,
    pub ttl: Option<PatternTtlConfig>,
    /// Alternative origin sources, tried by ascending priority number.
    pub sources: Vec<OriginSourceConfig>,
}

impl Default for PathPatternConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            matcher: String::new(),
            process_path: true,
            origin_url_template: None,
            capture_group_names: Vec::new(),
            priority: None,
            auth: None,
            ttl: None,
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginSourceConfig {
    pub name: String,
    pub url_template: String,
    pub priority: i32,
    pub auth: Option<PatternAuthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternAuthConfig {
    /// Signer kind, e.g. "aws-s3-presigned-url".
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternTtlConfig {
    /// TTL for 2xx responses cached under this pattern.
    pub ok_seconds: u64,
}

impl Default for PatternTtlConfig {
    fn default() -> Self {
        Self { ok_seconds: 86_400 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivativeConfig {
    /// Named presets, e.g. mobile/tablet/desktop.
    pub presets: Vec<DerivativePreset>,
    /// Ordered half-open intervals on effective width. Each interval runs
    /// from the previous `max_width` (exclusive) to its own (inclusive);
    /// the last entry may omit `max_width` to be unbounded.
    pub breakpoints: Vec<BreakpointConfig>,
    /// Bounded size of the derivative decision cache.
    pub decision_cache_size: usize,
    /// Effective-width cap applied when the client sends Save-Data.
    pub save_data_width_cap: u32,
}

impl Default for DerivativeConfig {
    fn default() -> Self {
        Self {
            presets: vec![
                DerivativePreset {
                    name: "mobile".to_string(),
                    width: 854,
                    height: 480,
                    quality: Some("low".to_string()),
                },
                DerivativePreset {
                    name: "tablet".to_string(),
                    width: 1280,
                    height: 720,
                    quality: Some("medium".to_string()),
                },
                DerivativePreset {
                    name: "desktop".to_string(),
                    width: 1920,
                    height: 1080,
                    quality: Some("high".to_string()),
                },
            ],
            breakpoints: vec![
                BreakpointConfig {
                    max_width: Some(854),
                    derivative: "mobile".to_string(),
                },
                BreakpointConfig {
                    max_width: Some(1280),
                    derivative: "tablet".to_string(),
                },
                BreakpointConfig {
                    max_width: None,
                    derivative: "desktop".to_string(),
                },
            ],
            decision_cache_size: 1024,
            save_data_width_cap: 854,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivativePreset {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub quality: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointConfig {
    pub max_width: Option<u32>,
    pub derivative: String,
}

impl Config {
    /// Load configuration from an optional TOML file layered under
    /// `VIDGATE_`-prefixed environment variables, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: Self = builder
            .add_source(Environment::with_prefix("VIDGATE").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate().map_err(ConfigError::Message)?;
        Ok(config)
    }

    /// Validate cross-field invariants. Pattern regexes are compiled by the
    /// ruleset at startup with per-rule non-fatal handling, so they are not
    /// checked here.
    pub fn validate(&self) -> Result<(), String> {
        if self.media.transform_host.is_empty() {
            return Err("media.transform_host must not be empty".to_string());
        }
        if !(0.0..1.0).contains(&self.cache.refresh_elapsed_fraction) {
            return Err(format!(
                "cache.refresh_elapsed_fraction must be in [0, 1), got {}",
                self.cache.refresh_elapsed_fraction
            ));
        }
        if self.kv.max_value_bytes == 0 {
            return Err("kv.max_value_bytes must be positive".to_string());
        }
        self.derivatives.validate()?;
        Ok(())
    }
}

impl DerivativeConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.presets.is_empty() {
            return Err("derivatives.presets must not be empty".to_string());
        }
        for preset in &self.presets {
            if preset.width == 0 || preset.height == 0 {
                return Err(format!(
                    "derivative '{}' must have non-zero dimensions",
                    preset.name
                ));
            }
        }

        // Breakpoint intervals are half-open and must be non-overlapping:
        // ascending max_width, at most one unbounded tail entry.
        let mut previous: Option<u32> = None;
        for (i, bp) in self.breakpoints.iter().enumerate() {
            if !self.presets.iter().any(|p| p.name == bp.derivative) {
                return Err(format!(
                    "breakpoint references unknown derivative '{}'",
                    bp.derivative
                ));
            }
            match bp.max_width {
                Some(max) => {
                    if let Some(prev) = previous {
                        if max <= prev {
                            return Err(format!(
                                "breakpoint intervals must be ascending; {max} follows {prev}"
                            ));
                        }
                    }
                    previous = Some(max);
                }
                None => {
                    if i + 1 != self.breakpoints.len() {
                        return Err(
                            "only the last breakpoint may be unbounded".to_string()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn preset(&self, name: &str) -> Option<&DerivativePreset> {
        self.presets.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_derivatives() {
        let config = DerivativeConfig::default();
        let mobile = config.preset("mobile").unwrap();
        assert_eq!(mobile.width, 854);
        assert_eq!(mobile.height, 480);
        assert!(config.preset("cinema").is_none());
    }

    #[test]
    fn test_breakpoints_must_ascend() {
        let mut config = DerivativeConfig::default();
        config.breakpoints[1].max_width = Some(500);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unbounded_breakpoint_must_be_last() {
        let mut config = DerivativeConfig::default();
        config.breakpoints[0].max_width = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_breakpoint_must_reference_known_derivative() {
        let mut config = DerivativeConfig::default();
        config.breakpoints[0].derivative = "cinema".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bypass_params_combine_builtin_and_configured() {
        let mut config = CacheConfig::default();
        config.bypass_params = vec!["preview".to_string()];
        assert!(config.is_bypass_param("debug"));
        assert!(config.is_bypass_param("nocache"));
        assert!(config.is_bypass_param("preview"));
        assert!(!config.is_bypass_param("width"));
    }

    #[test]
    fn test_refresh_fraction_bounds() {
        let mut config = Config::default();
        config.cache.refresh_elapsed_fraction = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9090

[cache]
default_ttl_seconds = 3600

[[routing.patterns]]
name = "videos"
matcher = "^/videos/(?P<videoId>[^/]+)$"
origin_url_template = "https://storage.example.com/videos/${{videoId}}"
priority = 10
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.cache.default_ttl_seconds, 3600);
        assert_eq!(config.routing.patterns.len(), 1);
        assert_eq!(config.routing.patterns[0].name, "videos");
        assert_eq!(config.routing.patterns[0].priority, Some(10));
    }
}
