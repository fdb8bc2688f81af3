//! Transformation options: validation, vendor alias translation, and
//! media-endpoint URL construction.

use std::sync::LazyLock;

use indexmap::IndexMap;
use parking_lot::RwLock;
use regex::Regex;

use crate::derivative::Resolution;
use crate::error::{Error, Result};

/// Client-supplied `time` must stay within the first 30 seconds.
const MAX_TIME_SECS: f64 = 30.0;
const MAX_DIMENSION: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Video,
    Frame,
    Spritesheet,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Video => "video",
            Mode::Frame => "frame",
            Mode::Spritesheet => "spritesheet",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "video" => Ok(Mode::Video),
            "frame" => Ok(Mode::Frame),
            "spritesheet" => Ok(Mode::Spritesheet),
            other => Err(Error::validation("mode", format!("unknown mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    Cover,
    Contain,
    ScaleDown,
}

impl Fit {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Fit::Cover => "cover",
            Fit::Contain => "contain",
            Fit::ScaleDown => "scale-down",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "cover" => Ok(Fit::Cover),
            "contain" => Ok(Fit::Contain),
            "scale-down" => Ok(Fit::ScaleDown),
            // Vendor obj-fit values.
            "crop" => Ok(Fit::Cover),
            "fill" => Ok(Fit::Contain),
            other => Err(Error::validation("fit", format!("unknown fit '{other}'"))),
        }
    }
}

/// Normalised transformation parameter bag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mode: Option<Mode>,
    pub fit: Option<Fit>,
    pub audio: Option<bool>,
    pub quality: Option<String>,
    pub compression: Option<String>,
    pub duration: Option<f64>,
    pub time: Option<f64>,
    pub loop_playback: Option<bool>,
    pub autoplay: Option<bool>,
    pub muted: Option<bool>,
    pub preload: Option<String>,
    pub format: Option<String>,
    pub derivative: Option<String>,
    pub version: Option<u32>,
    /// Set when width/height/quality came from a derivative preset rather
    /// than the client; such dimensions are implied by the derivative name
    /// and excluded from the canonical option set.
    dimensions_from_derivative: bool,
}

impl TransformOptions {
    /// Parse options from query pairs, translating vendor aliases.
    pub fn from_query(query: &[(String, String)]) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in query {
            let value = value.as_str();
            match key.as_str() {
                "width" | "w" => options.width = Some(parse_dimension("width", value)?),
                "height" | "h" => options.height = Some(parse_dimension("height", value)?),
                "mode" => options.mode = Some(Mode::parse(value)?),
                "fit" | "obj-fit" => options.fit = Some(Fit::parse(value)?),
                "audio" => options.audio = Some(parse_bool("audio", value)?),
                // `mute=true` means audio off.
                "mute" => options.audio = Some(!parse_bool("mute", value)?),
                "quality" => options.quality = Some(value.to_string()),
                "compression" => options.compression = Some(value.to_string()),
                "duration" | "dur" => {
                    options.duration = Some(parse_time_expr("duration", value)?);
                }
                "time" | "start" => options.time = Some(parse_time_expr("time", value)?),
                "loop" => options.loop_playback = Some(parse_bool("loop", value)?),
                "autoplay" => options.autoplay = Some(parse_bool("autoplay", value)?),
                "muted" => options.muted = Some(parse_bool("muted", value)?),
                "preload" => options.preload = Some(value.to_string()),
                "format" | "f" => options.format = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(options)
    }

    /// Fold the derivative resolver's decision into the option set.
    /// Explicit query dimensions always win.
    pub fn apply_resolution(&mut self, resolution: &Resolution) {
        match resolution {
            Resolution::Explicit { width, height } => {
                self.width.get_or_insert(*width);
                self.height.get_or_insert(*height);
            }
            Resolution::Derivative {
                name,
                width,
                height,
                quality,
            } => {
                if self.width.is_none() && self.height.is_none() {
                    self.width = Some(*width);
                    self.height = Some(*height);
                    if self.quality.is_none() {
                        self.quality.clone_from(quality);
                    }
                    self.derivative = Some(name.clone());
                    self.dimensions_from_derivative = true;
                }
            }
        }
    }

    /// Enforce the option invariants, clamping duration to the currently
    /// discovered limits.
    pub fn validate(&mut self, limits: &TransformLimits) -> Result<()> {
        if self.format.is_some() && self.mode != Some(Mode::Frame) {
            return Err(Error::validation(
                "format",
                "only valid when mode=frame",
            ));
        }
        if self.loop_playback.is_some()
            && !matches!(self.mode, None | Some(Mode::Video))
        {
            return Err(Error::validation("loop", "only valid when mode=video"));
        }
        if self.autoplay == Some(true) && self.audio == Some(true) {
            self.muted = Some(true);
        }
        if let Some(time) = self.time {
            if !(0.0..=MAX_TIME_SECS).contains(&time) {
                return Err(Error::validation(
                    "time",
                    format!("must be between 0s and {MAX_TIME_SECS}s"),
                ));
            }
        }
        if let Some(duration) = self.duration {
            let snapshot = limits.snapshot();
            if duration <= 0.0 {
                return Err(Error::validation("duration", "must be positive"));
            }
            if duration < snapshot.min_duration_secs {
                return Err(Error::validation(
                    "duration",
                    format!("must be at least {}s", snapshot.min_duration_secs),
                ));
            }
            self.duration = Some(limits.clamp_duration(duration));
        }
        Ok(())
    }

    /// Parameters for the media-endpoint URL, in insertion order.
    /// The derivative name and cache version are key-space concerns and
    /// never reach the endpoint.
    #[must_use]
    pub fn params(&self) -> IndexMap<String, String> {
        let mut params = IndexMap::new();
        if let Some(width) = self.width {
            params.insert("width".to_string(), width.to_string());
        }
        if let Some(height) = self.height {
            params.insert("height".to_string(), height.to_string());
        }
        if let Some(mode) = self.mode {
            params.insert("mode".to_string(), mode.as_str().to_string());
        }
        if let Some(fit) = self.fit {
            params.insert("fit".to_string(), fit.as_str().to_string());
        }
        if let Some(audio) = self.audio {
            params.insert("audio".to_string(), audio.to_string());
        }
        if let Some(muted) = self.muted {
            params.insert("muted".to_string(), muted.to_string());
        }
        if let Some(quality) = &self.quality {
            params.insert("quality".to_string(), quality.clone());
        }
        if let Some(compression) = &self.compression {
            params.insert("compression".to_string(), compression.clone());
        }
        if let Some(duration) = self.duration {
            params.insert("duration".to_string(), format_time_expr(duration));
        }
        if let Some(time) = self.time {
            params.insert("time".to_string(), format_time_expr(time));
        }
        if let Some(looped) = self.loop_playback {
            params.insert("loop".to_string(), looped.to_string());
        }
        if let Some(autoplay) = self.autoplay {
            params.insert("autoplay".to_string(), autoplay.to_string());
        }
        if let Some(preload) = &self.preload {
            params.insert("preload".to_string(), preload.clone());
        }
        if let Some(format) = &self.format {
            params.insert("format".to_string(), format.clone());
        }
        params
    }

    /// The canonical option set for cache keys: every set field except the
    /// version, with derivative-implied dimensions folded into the name.
    #[must_use]
    pub fn canonical_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(derivative) = &self.derivative {
            pairs.push(("derivative".to_string(), derivative.clone()));
        }
        for (key, value) in self.params() {
            if self.dimensions_from_derivative
                && matches!(key.as_str(), "width" | "height" | "quality")
            {
                continue;
            }
            pairs.push((key, value));
        }
        pairs
    }
}

fn parse_dimension(param: &'static str, raw: &str) -> Result<u32> {
    let value: u32 = raw
        .parse()
        .map_err(|_| Error::validation(param, format!("'{raw}' is not a number")))?;
    if value == 0 || value > MAX_DIMENSION {
        return Err(Error::validation(
            param,
            format!("must be between 1 and {MAX_DIMENSION}"),
        ));
    }
    Ok(value)
}

fn parse_bool(param: &'static str, raw: &str) -> Result<bool> {
    match raw {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        other => Err(Error::validation(
            param,
            format!("'{other}' is not a boolean"),
        )),
    }
}

/// Parse a time expression: `<number>s`, `<number>m`, or a bare number of
/// seconds. Returns seconds.
pub fn parse_time_expr(param: &'static str, raw: &str) -> Result<f64> {
    let raw = raw.trim();
    let (number, unit) = match raw.strip_suffix("ms") {
        Some(n) => (n, 0.001),
        None => match raw.strip_suffix('s') {
            Some(n) => (n, 1.0),
            None => match raw.strip_suffix('m') {
                Some(n) => (n, 60.0),
                None => (raw, 1.0),
            },
        },
    };
    let value: f64 = number
        .parse()
        .map_err(|_| Error::validation(param, format!("'{raw}' is not a time value")))?;
    if !value.is_finite() {
        return Err(Error::validation(param, "must be finite"));
    }
    Ok(value * unit)
}

/// Format seconds as a time expression. Whole minutes at or above one
/// minute render as `<n>m`, everything else as `<n>s`.
#[must_use]
pub fn format_time_expr(seconds: f64) -> String {
    if seconds >= 60.0 && seconds % 60.0 == 0.0 {
        return format!("{}m", (seconds / 60.0) as u64);
    }
    if seconds.fract() == 0.0 {
        format!("{}s", seconds as i64)
    } else {
        format!("{seconds}s")
    }
}

// ------------------------------------------------------------------
// Runtime-discovered transform limits
// ------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitsSnapshot {
    pub min_duration_secs: f64,
    pub max_duration_secs: Option<f64>,
    pub max_input_bytes: Option<u64>,
}

impl Default for LimitsSnapshot {
    fn default() -> Self {
        Self {
            min_duration_secs: 0.1,
            max_duration_secs: None,
            max_input_bytes: None,
        }
    }
}

#[allow(clippy::unwrap_used)]
static DURATION_LIMITS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"duration:\s*attribute must be between\s+(\d+(?:\.\d+)?)(ms|s|m)\s+and\s+(\d+(?:\.\d+)?)(ms|s|m)",
    )
    .unwrap()
});

#[allow(clippy::unwrap_used)]
static INPUT_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[Ii]nput video must be less than\s+(\d+)\s+bytes").unwrap()
});

/// Duration and input-size limits of the transformation endpoint,
/// discovered at runtime by mining its error messages.
#[derive(Debug, Default)]
pub struct TransformLimits {
    inner: RwLock<LimitsSnapshot>,
}

impl TransformLimits {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> LimitsSnapshot {
        *self.inner.read()
    }

    /// Mine an upstream error message for limit declarations. Returns true
    /// when a limit was learned.
    pub fn observe_error_message(&self, message: &str) -> bool {
        let mut learned = false;

        if let Some(caps) = DURATION_LIMITS_RE.captures(message) {
            let min = parse_mined_value(&caps[1], &caps[2]);
            let max = parse_mined_value(&caps[3], &caps[4]);
            if let (Some(min), Some(max)) = (min, max) {
                let mut inner = self.inner.write();
                inner.min_duration_secs = min;
                inner.max_duration_secs = Some(max);
                learned = true;
                tracing::info!(
                    min_duration_secs = min,
                    max_duration_secs = max,
                    "discovered transform duration limits"
                );
            }
        }

        if let Some(caps) = INPUT_SIZE_RE.captures(message) {
            if let Ok(bytes) = caps[1].parse::<u64>() {
                self.inner.write().max_input_bytes = Some(bytes);
                learned = true;
                tracing::info!(max_input_bytes = bytes, "discovered transform input size limit");
            }
        }

        learned
    }

    /// Clamp a duration to the discovered maximum, whole seconds.
    #[must_use]
    pub fn clamp_duration(&self, duration: f64) -> f64 {
        match self.inner.read().max_duration_secs {
            Some(max) => duration.min(max.floor()),
            None => duration,
        }
    }
}

fn parse_mined_value(number: &str, unit: &str) -> Option<f64> {
    let value: f64 = number.parse().ok()?;
    Some(match unit {
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        _ => value,
    })
}

// ------------------------------------------------------------------
// Media-endpoint URL construction
// ------------------------------------------------------------------

/// Which path builds the URL. The synchronous (cached) path strips origin
/// query parameters so cache keys stay stable; the asynchronous path —
/// bypassed, handler-produced requests that are never stored — preserves
/// an allow-listed subset (e.g. `debug=view`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlMode {
    Sync,
    Async,
}

/// Build the transformation-endpoint URL:
/// `{host}/cdn-cgi/media/{k=v,k=v,...}/{originUrl}`.
#[must_use]
pub fn build_media_url(
    host: &str,
    options: &TransformOptions,
    origin_url: &str,
    mode: UrlMode,
    query_allowlist: &[String],
) -> String {
    let params = options
        .params()
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");

    let origin = match origin_url.split_once('?') {
        Some((base, query)) => match mode {
            UrlMode::Sync => base.to_string(),
            UrlMode::Async => {
                let kept: Vec<&str> = query
                    .split('&')
                    .filter(|pair| {
                        let key = pair.split('=').next().unwrap_or(pair);
                        query_allowlist.iter().any(|allowed| allowed == key)
                    })
                    .collect();
                if kept.is_empty() {
                    base.to_string()
                } else {
                    format!("{base}?{}", kept.join("&"))
                }
            }
        },
        None => origin_url.to_string(),
    };

    format!("{}/cdn-cgi/media/{params}/{origin}", host.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_vendor_alias_translation() {
        let options = TransformOptions::from_query(&query(&[
            ("w", "640"),
            ("h", "360"),
            ("obj-fit", "crop"),
            ("start", "5s"),
            ("dur", "30s"),
            ("mute", "true"),
            ("f", "jpg"),
        ]))
        .unwrap();

        assert_eq!(options.width, Some(640));
        assert_eq!(options.height, Some(360));
        assert_eq!(options.fit, Some(Fit::Cover));
        assert_eq!(options.time, Some(5.0));
        assert_eq!(options.duration, Some(30.0));
        assert_eq!(options.audio, Some(false));
        assert_eq!(options.format, Some("jpg".to_string()));
    }

    #[test]
    fn test_obj_fit_fill_maps_to_contain() {
        let options =
            TransformOptions::from_query(&query(&[("obj-fit", "fill")])).unwrap();
        assert_eq!(options.fit, Some(Fit::Contain));
    }

    #[test]
    fn test_format_requires_frame_mode() {
        let mut options =
            TransformOptions::from_query(&query(&[("format", "jpg")])).unwrap();
        let err = options.validate(&TransformLimits::new()).unwrap_err();
        assert!(err.to_string().contains("format"));

        let mut options =
            TransformOptions::from_query(&query(&[("format", "jpg"), ("mode", "frame")]))
                .unwrap();
        assert!(options.validate(&TransformLimits::new()).is_ok());
    }

    #[test]
    fn test_loop_requires_video_mode() {
        let mut options = TransformOptions::from_query(&query(&[
            ("loop", "true"),
            ("mode", "spritesheet"),
        ]))
        .unwrap();
        assert!(options.validate(&TransformLimits::new()).is_err());

        let mut options =
            TransformOptions::from_query(&query(&[("loop", "true")])).unwrap();
        assert!(options.validate(&TransformLimits::new()).is_ok());
    }

    #[test]
    fn test_autoplay_with_audio_forces_muted() {
        let mut options = TransformOptions::from_query(&query(&[
            ("autoplay", "true"),
            ("audio", "true"),
        ]))
        .unwrap();
        options.validate(&TransformLimits::new()).unwrap();
        assert_eq!(options.muted, Some(true));
    }

    #[test]
    fn test_time_bounds() {
        let mut options =
            TransformOptions::from_query(&query(&[("time", "31s")])).unwrap();
        assert!(options.validate(&TransformLimits::new()).is_err());

        let mut options =
            TransformOptions::from_query(&query(&[("time", "30s")])).unwrap();
        assert!(options.validate(&TransformLimits::new()).is_ok());
    }

    #[test]
    fn test_zero_duration_is_invalid() {
        let mut options =
            TransformOptions::from_query(&query(&[("duration", "0s")])).unwrap();
        let err = options.validate(&TransformLimits::new()).unwrap_err();
        assert!(err.to_string().contains("duration"));
    }

    #[test]
    fn test_time_expressions() {
        assert_eq!(parse_time_expr("time", "5s").unwrap(), 5.0);
        assert_eq!(parse_time_expr("time", "2m").unwrap(), 120.0);
        assert_eq!(parse_time_expr("time", "500ms").unwrap(), 0.5);
        assert_eq!(parse_time_expr("time", "7").unwrap(), 7.0);
        assert!(parse_time_expr("time", "abc").is_err());

        assert_eq!(format_time_expr(5.0), "5s");
        assert_eq!(format_time_expr(120.0), "2m");
        assert_eq!(format_time_expr(90.0), "90s");
        assert_eq!(format_time_expr(46.5), "46.5s");
    }

    #[test]
    fn test_duration_limit_discovery_and_clamp() {
        let limits = TransformLimits::new();
        assert!(limits.observe_error_message(
            "duration: attribute must be between 100ms and 46.066933s"
        ));

        let snapshot = limits.snapshot();
        assert_eq!(snapshot.min_duration_secs, 0.1);
        assert_eq!(snapshot.max_duration_secs, Some(46.066933));

        // Adjustments clamp to floor(max) seconds.
        let mut options =
            TransformOptions::from_query(&query(&[("duration", "100s")])).unwrap();
        options.validate(&limits).unwrap();
        assert_eq!(options.duration, Some(46.0));
    }

    #[test]
    fn test_input_size_discovery() {
        let limits = TransformLimits::new();
        assert!(limits.observe_error_message("Input video must be less than 268435456 bytes"));
        assert_eq!(limits.snapshot().max_input_bytes, Some(268_435_456));
    }

    #[test]
    fn test_unrecognised_message_learns_nothing() {
        let limits = TransformLimits::new();
        assert!(!limits.observe_error_message("internal error"));
        assert_eq!(limits.snapshot(), LimitsSnapshot::default());
    }

    #[test]
    fn test_media_url_construction() {
        let options = TransformOptions::from_query(&query(&[
            ("width", "854"),
            ("height", "480"),
        ]))
        .unwrap();

        let url = build_media_url(
            "https://cdn.example.com",
            &options,
            "https://storage.example.com/videos/abc.mp4",
            UrlMode::Sync,
            &[],
        );
        assert_eq!(
            url,
            "https://cdn.example.com/cdn-cgi/media/width=854,height=480/https://storage.example.com/videos/abc.mp4"
        );
    }

    #[test]
    fn test_sync_path_strips_origin_query() {
        let options = TransformOptions::default();
        let url = build_media_url(
            "https://cdn.example.com",
            &options,
            "https://o.example.com/v.mp4?token=abc&debug=view",
            UrlMode::Sync,
            &["debug".to_string()],
        );
        assert!(!url.contains("token"));
        assert!(!url.contains("debug"));
    }

    #[test]
    fn test_async_path_keeps_allowlisted_query() {
        let options = TransformOptions::default();
        let url = build_media_url(
            "https://cdn.example.com",
            &options,
            "https://o.example.com/v.mp4?token=abc&debug=view",
            UrlMode::Async,
            &["debug".to_string()],
        );
        assert!(!url.contains("token"));
        assert!(url.contains("debug=view"));
    }

    #[test]
    fn test_params_keep_insertion_order_and_skip_unset() {
        let options = TransformOptions::from_query(&query(&[
            ("height", "480"),
            ("width", "854"),
            ("quality", "low"),
        ]))
        .unwrap();
        let params: Vec<String> = options.params().keys().cloned().collect();
        assert_eq!(params, vec!["width", "height", "quality"]);
    }

    #[test]
    fn test_canonical_pairs_fold_derivative_dimensions() {
        let mut options = TransformOptions::default();
        options.apply_resolution(&Resolution::Derivative {
            name: "mobile".to_string(),
            width: 854,
            height: 480,
            quality: Some("low".to_string()),
        });
        let pairs = options.canonical_pairs();
        assert_eq!(
            pairs,
            vec![("derivative".to_string(), "mobile".to_string())]
        );

        // Explicit dimensions stay in the canonical set.
        let options = TransformOptions::from_query(&query(&[
            ("width", "640"),
            ("height", "360"),
        ]))
        .unwrap();
        let pairs = options.canonical_pairs();
        assert_eq!(pairs.len(), 2);
    }
}
