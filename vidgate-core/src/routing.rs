//! Path routing: prioritised regex rules mapping request paths to origin
//! URL templates.
//!
//! Patterns compile once at startup. A rule whose regex fails to compile is
//! skipped with a warning; the rest of the ruleset stays usable.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::config::{PathPatternConfig, PatternTtlConfig, RoutingConfig};

/// Auth descriptor attached to a pattern or source. Opaque to the pipeline;
/// the signer seam interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternAuth {
    AwsS3PresignedUrl,
    Other(String),
}

impl PatternAuth {
    fn from_kind(kind: &str) -> Self {
        match kind {
            "aws-s3-presigned-url" => PatternAuth::AwsS3PresignedUrl,
            other => PatternAuth::Other(other.to_string()),
        }
    }
}

/// One origin source for a pattern. Sources are tried by ascending
/// priority number; the 404 retry excludes the source that failed.
#[derive(Debug, Clone)]
pub struct OriginSource {
    pub name: String,
    pub url_template: String,
    pub priority: i32,
    pub auth: Option<PatternAuth>,
}

/// A compiled routing rule.
#[derive(Debug)]
pub struct PathPattern {
    pub name: String,
    matcher: Option<Regex>,
    pub process_path: bool,
    pub origin_url_template: Option<String>,
    pub capture_group_names: Vec<String>,
    pub priority: i32,
    pub auth: Option<PatternAuth>,
    pub ttl: Option<PatternTtlConfig>,
    /// Sorted by ascending priority number.
    pub sources: Vec<OriginSource>,
}

impl PathPattern {
    fn from_config(config: &PathPatternConfig) -> Self {
        let matcher = match Regex::new(&config.matcher) {
            Ok(regex) => Some(regex),
            Err(err) => {
                tracing::warn!(
                    pattern = %config.name,
                    error = %err,
                    "pattern regex failed to compile; rule skipped"
                );
                None
            }
        };

        let mut sources: Vec<OriginSource> = config
            .sources
            .iter()
            .map(|s| OriginSource {
                name: s.name.clone(),
                url_template: s.url_template.clone(),
                priority: s.priority,
                auth: s.auth.as_ref().map(|a| PatternAuth::from_kind(&a.kind)),
            })
            .collect();
        sources.sort_by_key(|s| s.priority);

        let auth = config.auth.as_ref().map(|a| PatternAuth::from_kind(&a.kind));

        // A lone origin_url_template is equivalent to a single source.
        if sources.is_empty() {
            if let Some(template) = &config.origin_url_template {
                sources.push(OriginSource {
                    name: "origin".to_string(),
                    url_template: template.clone(),
                    priority: 0,
                    auth: auth.clone(),
                });
            }
        }

        Self {
            name: config.name.clone(),
            matcher,
            process_path: config.process_path,
            origin_url_template: config.origin_url_template.clone(),
            capture_group_names: config.capture_group_names.clone(),
            priority: config.priority.unwrap_or(0),
            auth,
            ttl: config.ttl.clone(),
            sources,
        }
    }

    /// Whether this pattern rewrites to an origin at all. Patterns with no
    /// template and no sources, or with `process_path` off, signal
    /// "no rewrite, pass through".
    #[must_use]
    pub fn is_pass_through(&self) -> bool {
        !self.process_path || self.sources.is_empty()
    }

    fn matches(&self, path: &str) -> bool {
        self.matcher.as_ref().is_some_and(|m| m.is_match(path))
    }

    fn captures(&self, path: &str) -> Option<PathCaptures> {
        let matcher = self.matcher.as_ref()?;
        let caps = matcher.captures(path)?;

        let mut numeric = Vec::new();
        for i in 1..caps.len() {
            numeric.push(caps.get(i).map(|m| m.as_str().to_string()));
        }

        let mut named = HashMap::new();
        for name in matcher.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                named.insert(name.to_string(), m.as_str().to_string());
            }
        }
        // Configured group names map onto positional captures in order.
        for (i, name) in self.capture_group_names.iter().enumerate() {
            if let Some(Some(value)) = numeric.get(i) {
                named.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }

        Some(PathCaptures { numeric, named })
    }
}

/// Captures extracted from a matched path: positional (`"1"`, `"2"`, ...)
/// and named.
#[derive(Debug, Clone, Default)]
pub struct PathCaptures {
    numeric: Vec<Option<String>>,
    named: HashMap<String, String>,
}

impl PathCaptures {
    /// Positional capture, 1-based like regex group numbering.
    #[must_use]
    pub fn positional(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.numeric
            .get(index - 1)
            .and_then(|v| v.as_deref())
    }

    #[must_use]
    pub fn named(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }
}

/// An ordered ruleset. Rules are scanned in descending priority; ties keep
/// declaration order.
pub struct PatternRuleset {
    rules: Vec<Arc<PathPattern>>,
}

impl PatternRuleset {
    #[must_use]
    pub fn from_config(config: &RoutingConfig) -> Self {
        let mut rules: Vec<Arc<PathPattern>> = config
            .patterns
            .iter()
            .map(|p| Arc::new(PathPattern::from_config(p)))
            .collect();
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        Self { rules }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule whose matcher compiled and matches `path`.
    #[must_use]
    pub fn find_matching_pattern(&self, path: &str) -> Option<&Arc<PathPattern>> {
        self.rules.iter().find(|r| r.matches(path))
    }

    /// Like [`find_matching_pattern`](Self::find_matching_pattern), also
    /// returning numeric and named captures.
    #[must_use]
    pub fn match_with_captures(&self, path: &str) -> Option<(Arc<PathPattern>, PathCaptures)> {
        for rule in &self.rules {
            if let Some(captures) = rule.captures(path) {
                return Some((rule.clone(), captures));
            }
        }
        None
    }
}

/// Collapse consecutive slashes after the protocol-host segment and trim a
/// trailing slash except when the path is `/`. Idempotent.
#[must_use]
pub fn normalize_path(raw: &str) -> String {
    let (prefix, path) = match raw.find("://") {
        Some(idx) => {
            let after_scheme = idx + 3;
            match raw[after_scheme..].find('/') {
                Some(slash) => raw.split_at(after_scheme + slash),
                None => (raw, ""),
            }
        }
        None => ("", raw),
    };

    let mut out = String::with_capacity(raw.len());
    out.push_str(prefix);
    let mut previous_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        out.push(ch);
    }

    if out.len() > prefix.len() + 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Prefer the `videoId` named capture, else the first positional capture.
#[must_use]
pub fn extract_video_id(captures: &PathCaptures) -> Option<String> {
    captures
        .named("videoId")
        .or_else(|| captures.positional(1))
        .map(str::to_string)
}

/// Substitute `${1}`-style numeric and `${name}` named captures into an
/// origin URL template. `${path}` expands to the full normalized path.
#[must_use]
pub fn substitute_template(template: &str, captures: &PathCaptures, path: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        match rest.find('}') {
            Some(end) => {
                let key = &rest[..end];
                let value = if key == "path" {
                    Some(path)
                } else if let Ok(index) = key.parse::<usize>() {
                    captures.positional(index)
                } else {
                    captures.named(key)
                };
                out.push_str(value.unwrap_or(""));
                rest = &rest[end + 1..];
            }
            None => {
                out.push_str("${");
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OriginSourceConfig;

    fn pattern(name: &str, matcher: &str, priority: i32) -> PathPatternConfig {
        PathPatternConfig {
            name: name.to_string(),
            matcher: matcher.to_string(),
            origin_url_template: Some(format!("https://origin.example.com{}", "${path}")),
            priority: Some(priority),
            ..Default::default()
        }
    }

    fn ruleset(patterns: Vec<PathPatternConfig>) -> PatternRuleset {
        PatternRuleset::from_config(&RoutingConfig { patterns })
    }

    #[test]
    fn test_higher_priority_matches_first() {
        let rules = ruleset(vec![
            pattern("catchall", "^/videos/.*", 0),
            pattern("popular", "^/videos/popular/.*", 10),
        ]);

        let matched = rules.find_matching_pattern("/videos/popular/a.mp4").unwrap();
        assert_eq!(matched.name, "popular");
        let matched = rules.find_matching_pattern("/videos/b.mp4").unwrap();
        assert_eq!(matched.name, "catchall");
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let rules = ruleset(vec![
            pattern("first", "^/videos/.*", 5),
            pattern("second", "^/videos/.*", 5),
        ]);
        assert_eq!(
            rules.find_matching_pattern("/videos/a.mp4").unwrap().name,
            "first"
        );
    }

    #[test]
    fn test_invalid_regex_is_skipped_not_fatal() {
        let rules = ruleset(vec![
            pattern("broken", "^/videos/([", 10),
            pattern("good", "^/videos/.*", 0),
        ]);
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules.find_matching_pattern("/videos/a.mp4").unwrap().name,
            "good"
        );
    }

    #[test]
    fn test_empty_matcher_does_not_panic() {
        let rules = ruleset(vec![pattern("empty", "", 0)]);
        let _ = rules.find_matching_pattern("/videos/a.mp4");
    }

    #[test]
    fn test_named_and_numeric_captures() {
        let rules = ruleset(vec![pattern(
            "videos",
            "^/videos/(?P<videoId>[^/]+)/(\\d+)$",
            0,
        )]);
        let (_, caps) = rules.match_with_captures("/videos/abc.mp4/42").unwrap();
        assert_eq!(caps.named("videoId"), Some("abc.mp4"));
        assert_eq!(caps.positional(1), Some("abc.mp4"));
        assert_eq!(caps.positional(2), Some("42"));
        assert_eq!(extract_video_id(&caps), Some("abc.mp4".to_string()));
    }

    #[test]
    fn test_configured_group_names_map_onto_positionals() {
        let mut config = pattern("videos", "^/videos/([^/]+)$", 0);
        config.capture_group_names = vec!["videoId".to_string()];
        let rules = ruleset(vec![config]);
        let (_, caps) = rules.match_with_captures("/videos/x.mp4").unwrap();
        assert_eq!(caps.named("videoId"), Some("x.mp4"));
    }

    #[test]
    fn test_fallback_to_first_positional_capture() {
        let rules = ruleset(vec![pattern("videos", "^/videos/([^/]+)$", 0)]);
        let (_, caps) = rules.match_with_captures("/videos/clip.mp4").unwrap();
        assert_eq!(extract_video_id(&caps), Some("clip.mp4".to_string()));
    }

    #[test]
    fn test_normalize_path_collapses_and_trims() {
        assert_eq!(normalize_path("/videos//a//b/"), "/videos/a/b");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/videos/a.mp4"), "/videos/a.mp4");
        assert_eq!(
            normalize_path("https://host.example.com//videos//a/"),
            "https://host.example.com/videos/a"
        );
    }

    #[test]
    fn test_normalize_path_is_idempotent() {
        for path in ["/videos//a//b/", "/", "https://h.example.com//x//y/", "/a"] {
            let once = normalize_path(path);
            assert_eq!(normalize_path(&once), once);
        }
    }

    #[test]
    fn test_template_substitution() {
        let rules = ruleset(vec![pattern(
            "videos",
            "^/videos/(?P<videoId>[^/]+)$",
            0,
        )]);
        let (_, caps) = rules.match_with_captures("/videos/abc.mp4").unwrap();

        assert_eq!(
            substitute_template(
                "https://storage.example.com/v/${videoId}",
                &caps,
                "/videos/abc.mp4"
            ),
            "https://storage.example.com/v/abc.mp4"
        );
        assert_eq!(
            substitute_template("https://storage.example.com/v/${1}", &caps, "/x"),
            "https://storage.example.com/v/abc.mp4"
        );
        assert_eq!(
            substitute_template("https://o.example.com${path}", &caps, "/videos/abc.mp4"),
            "https://o.example.com/videos/abc.mp4"
        );
    }

    #[test]
    fn test_pass_through_pattern() {
        let config = PathPatternConfig {
            name: "passthrough".to_string(),
            matcher: "^/raw/.*".to_string(),
            origin_url_template: None,
            ..Default::default()
        };
        let rules = ruleset(vec![config]);
        let matched = rules.find_matching_pattern("/raw/a.mp4").unwrap();
        assert!(matched.is_pass_through());
    }

    #[test]
    fn test_unprocessed_path_is_pass_through() {
        let config = PathPatternConfig {
            name: "raw".to_string(),
            matcher: "^/raw/.*".to_string(),
            process_path: false,
            origin_url_template: Some("https://o.example.com${path}".to_string()),
            ..Default::default()
        };
        let rules = ruleset(vec![config]);
        assert!(rules.find_matching_pattern("/raw/a.mp4").unwrap().is_pass_through());
    }

    #[test]
    fn test_sources_sorted_by_priority() {
        let config = PathPatternConfig {
            name: "videos".to_string(),
            matcher: "^/videos/.*".to_string(),
            sources: vec![
                OriginSourceConfig {
                    name: "remote".to_string(),
                    url_template: "https://remote.example.com${path}".to_string(),
                    priority: 2,
                    auth: None,
                },
                OriginSourceConfig {
                    name: "r2".to_string(),
                    url_template: "https://r2.example.com${path}".to_string(),
                    priority: 1,
                    auth: None,
                },
            ],
            ..Default::default()
        };
        let rules = ruleset(vec![config]);
        let matched = rules.find_matching_pattern("/videos/a.mp4").unwrap();
        assert_eq!(matched.sources[0].name, "r2");
        assert_eq!(matched.sources[1].name, "remote");
    }
}
