//! Derivative resolution: map client sizing hints to a named preset.
//!
//! Deterministic and pure aside from a bounded LRU cache keyed on rounded
//! inputs, so jittery clients resolve to stable cache keys.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::{DerivativeConfig, DerivativePreset};

/// Aspect-ratio weight in the snapping score.
const ASPECT_WEIGHT: f64 = 0.25;
/// Acceptable snapping score; expanded once before giving up.
const SNAP_THRESHOLD: f64 = 0.25;
const SNAP_THRESHOLD_EXPANDED: f64 = 0.375;
/// Safe default when every resolution path fails: 480p.
const DEFAULT_WIDTH: u32 = 854;
const DEFAULT_HEIGHT: u32 = 480;

/// CDN-injected device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceClass {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mobile" => Some(DeviceClass::Mobile),
            "tablet" => Some(DeviceClass::Tablet),
            "desktop" => Some(DeviceClass::Desktop),
            _ => None,
        }
    }

    fn preset_name(self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
        }
    }
}

/// Sizing inputs gathered from the query string and request headers.
/// Vendor IMQuery aliases are folded into their client-hint equivalents
/// during parsing.
#[derive(Debug, Clone, Default)]
pub struct ClientHints {
    pub explicit_width: Option<u32>,
    pub explicit_height: Option<u32>,
    pub viewport_width: Option<f64>,
    pub hint_height: Option<f64>,
    pub dpr: Option<f64>,
    pub save_data: bool,
    pub ect: Option<String>,
    pub downlink: Option<f64>,
    pub device_class: Option<DeviceClass>,
    pub user_agent: Option<String>,
}

impl ClientHints {
    #[must_use]
    pub fn from_request(headers: &http::HeaderMap, query: &[(String, String)]) -> Self {
        let mut hints = Self::default();

        for (key, value) in query {
            match key.as_str() {
                "width" => hints.explicit_width = value.parse().ok(),
                "height" => hints.explicit_height = value.parse().ok(),
                // IMQuery aliases map to client-hint equivalents.
                "imwidth" => {
                    hints.viewport_width = hints.viewport_width.or_else(|| value.parse().ok());
                }
                "imheight" => {
                    hints.hint_height = hints.hint_height.or_else(|| value.parse().ok());
                }
                "im-viewwidth" => {
                    hints.viewport_width = hints.viewport_width.or_else(|| value.parse().ok());
                }
                "im-density" => {
                    hints.dpr = hints.dpr.or_else(|| value.parse().ok());
                }
                "imref" => hints.apply_imref(value),
                _ => {}
            }
        }

        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };

        if let Some(value) = header("sec-ch-viewport-width") {
            hints.viewport_width = hints.viewport_width.or_else(|| value.parse().ok());
        }
        if let Some(value) = header("sec-ch-dpr") {
            hints.dpr = hints.dpr.or_else(|| value.parse().ok());
        }
        if let Some(value) = header("sec-ch-save-data") {
            hints.save_data |= matches!(value, "on" | "?1" | "1" | "true");
        }
        if let Some(value) = header("ect") {
            hints.ect = Some(value.to_string());
        }
        if let Some(value) = header("downlink") {
            hints.downlink = value.parse().ok();
        }
        if let Some(value) = header("cf-device-type") {
            hints.device_class = DeviceClass::parse(value);
        }
        if let Some(value) = header("user-agent") {
            hints.user_agent = Some(value.to_string());
        }

        hints
    }

    /// `imref=k=v,k=v,...` carries the same hints in one parameter.
    fn apply_imref(&mut self, raw: &str) {
        for part in raw.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "w" | "vw" => {
                    self.viewport_width = self.viewport_width.or_else(|| value.parse().ok());
                }
                "h" => {
                    self.hint_height = self.hint_height.or_else(|| value.parse().ok());
                }
                "dpr" => {
                    self.dpr = self.dpr.or_else(|| value.parse().ok());
                }
                _ => {}
            }
        }
    }

    fn has_size_hints(&self) -> bool {
        self.viewport_width.is_some() || self.hint_height.is_some()
    }

    /// Save-Data, a slow effective connection type, or sub-1 Mbps downlink
    /// all cap the effective width.
    fn is_constrained(&self) -> bool {
        self.save_data
            || matches!(self.ect.as_deref(), Some("slow-2g" | "2g"))
            || self.downlink.is_some_and(|mbps| mbps < 1.0)
    }
}

/// What the resolver decided for this request.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Both dimensions came from the query; no derivative name.
    Explicit { width: u32, height: u32 },
    /// A named preset.
    Derivative {
        name: String,
        width: u32,
        height: u32,
        quality: Option<String>,
    },
}

impl Resolution {
    fn from_preset(preset: &DerivativePreset) -> Self {
        Resolution::Derivative {
            name: preset.name.clone(),
            width: preset.width,
            height: preset.height,
            quality: preset.quality.clone(),
        }
    }

    #[must_use]
    pub fn derivative_name(&self) -> Option<&str> {
        match self {
            Resolution::Derivative { name, .. } => Some(name),
            Resolution::Explicit { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionKey {
    rounded_width: Option<u32>,
    rounded_height: Option<u32>,
    save_data: bool,
    device_class: Option<DeviceClass>,
}

/// Half-open interval on effective width: `lower < w <= upper`.
#[derive(Debug, Clone)]
struct Interval {
    lower: u32,
    upper: Option<u32>,
    derivative: String,
}

impl Interval {
    fn contains(&self, width: u32) -> bool {
        width > self.lower && self.upper.is_none_or(|upper| width <= upper)
    }

    /// Distance from `width` to the nearest edge of the interval.
    fn distance(&self, width: u32) -> u32 {
        if self.contains(width) {
            return 0;
        }
        if width <= self.lower {
            return self.lower + 1 - width;
        }
        match self.upper {
            Some(upper) => width - upper,
            None => 0,
        }
    }
}

/// Resolves sizing hints to a derivative, caching decisions by rounded
/// inputs.
pub struct DerivativeResolver {
    config: DerivativeConfig,
    intervals: Vec<Interval>,
    cache: Mutex<LruCache<DecisionKey, Option<String>>>,
}

impl DerivativeResolver {
    #[must_use]
    pub fn new(config: DerivativeConfig) -> Self {
        let mut intervals = Vec::with_capacity(config.breakpoints.len());
        let mut lower = 0u32;
        for bp in &config.breakpoints {
            intervals.push(Interval {
                lower,
                upper: bp.max_width,
                derivative: bp.derivative.clone(),
            });
            if let Some(max) = bp.max_width {
                lower = max;
            }
        }
        let capacity = NonZeroUsize::new(config.decision_cache_size.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            intervals,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Resolve hints to a derivative (or verbatim explicit dimensions).
    /// Every failure path lands on the safe 480p default.
    pub fn resolve(&self, hints: &ClientHints) -> Resolution {
        if let (Some(width), Some(height)) = (hints.explicit_width, hints.explicit_height) {
            return Resolution::Explicit { width, height };
        }

        if hints.has_size_hints() {
            let dpr = hints.dpr.unwrap_or(1.0).max(0.1);
            let mut effective_width = hints.viewport_width.map(|vw| vw * dpr);
            if hints.is_constrained() {
                let cap = f64::from(self.config.save_data_width_cap);
                effective_width = effective_width.map(|w| w.min(cap));
            }

            let key = DecisionKey {
                rounded_width: effective_width.map(round_to_ten),
                rounded_height: hints.hint_height.map(round_to_ten),
                save_data: hints.save_data,
                device_class: hints.device_class,
            };

            if let Some(cached) = self.cache.lock().get(&key).cloned() {
                return self.resolution_for(cached.as_deref());
            }
            let snapped = self.snap(key.rounded_width, key.rounded_height);
            self.cache.lock().put(key, snapped.clone());
            return self.resolution_for(snapped.as_deref());
        }

        if let Some(class) = hints.device_class {
            return self.resolution_for(Some(class.preset_name()));
        }

        if let Some(ua) = &hints.user_agent {
            return self.resolution_for(Some(user_agent_class(ua).preset_name()));
        }

        self.default_resolution()
    }

    fn resolution_for(&self, name: Option<&str>) -> Resolution {
        name.and_then(|n| self.config.preset(n))
            .map(Resolution::from_preset)
            .unwrap_or_else(|| self.default_resolution())
    }

    fn default_resolution(&self) -> Resolution {
        self.config
            .presets
            .iter()
            .find(|p| p.width == DEFAULT_WIDTH)
            .map(Resolution::from_preset)
            .unwrap_or(Resolution::Explicit {
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
            })
    }

    /// Snap rounded dimensions to a derivative name, or `None` when no
    /// preset is an acceptable match.
    fn snap(&self, width: Option<u32>, height: Option<u32>) -> Option<String> {
        match (width, height) {
            (Some(w), Some(h)) if h > 0 => self.snap_both(w, h),
            (Some(w), None) => self.snap_width(w),
            // Height alone implies a width via the common 16:9 frame.
            (None, Some(h)) => self.snap_width(round_to_ten(f64::from(h) * 16.0 / 9.0)),
            _ => None,
        }
    }

    fn snap_width(&self, width: u32) -> Option<String> {
        if let Some(interval) = self.intervals.iter().find(|i| i.contains(width)) {
            return Some(interval.derivative.clone());
        }
        // Outside all intervals: nearest interval by distance to its edge.
        self.intervals
            .iter()
            .min_by_key(|i| i.distance(width))
            .map(|i| i.derivative.clone())
    }

    fn snap_both(&self, width: u32, height: u32) -> Option<String> {
        let aspect = f64::from(width) / f64::from(height);
        let mut best: Option<(f64, &DerivativePreset)> = None;
        for preset in &self.config.presets {
            let pw = f64::from(preset.width);
            let ph = f64::from(preset.height);
            let preset_aspect = pw / ph;
            let score = (f64::from(width) - pw).abs() / pw
                + (f64::from(height) - ph).abs() / ph
                + ASPECT_WEIGHT * (aspect - preset_aspect).abs();
            if best.is_none_or(|(s, _)| score < s) {
                best = Some((score, preset));
            }
        }

        let (score, preset) = best?;
        if score <= SNAP_THRESHOLD {
            return Some(preset.name.clone());
        }
        if score <= SNAP_THRESHOLD_EXPANDED {
            return Some(preset.name.clone());
        }
        None
    }
}

fn round_to_ten(value: f64) -> u32 {
    let rounded = (value / 10.0).round() * 10.0;
    rounded.clamp(0.0, f64::from(u32::MAX)) as u32
}

fn user_agent_class(ua: &str) -> DeviceClass {
    let lower = ua.to_ascii_lowercase();
    if lower.contains("mobi") || lower.contains("android") {
        DeviceClass::Mobile
    } else if lower.contains("ipad") || lower.contains("tablet") {
        DeviceClass::Tablet
    } else {
        DeviceClass::Desktop
    }
}
