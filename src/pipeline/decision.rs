//! Decision extraction — pulls the delay value out of analyzer output.
//!
//! The analyzer is asked for `{"delay": "..."}` but answers in free text, so
//! extraction degrades through four tiers:
//! 1. strict JSON parse of the whole output
//! 2. smallest `{...}` fragment mentioning `"delay"`
//! 3. permissive `delay: value` / `delay 2 hours` scan
//! 4. `delay = "0"` (respond now)

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::FailureKind;

/// Analyzer decision: how long to hold the response back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Delay as the analyzer phrased it (`"0"`, `"30 mins"`, `"2 hours"`).
    pub delay: String,
}

impl Decision {
    pub fn new(delay: impl Into<String>) -> Self {
        let delay = delay.into();
        let trimmed = delay.trim();
        Self {
            delay: if trimmed.is_empty() {
                "0".to_string()
            } else {
                trimmed.to_string()
            },
        }
    }

    /// No deferral.
    pub fn respond_now() -> Self {
        Self::new("0")
    }

    /// The delay as a duration. Unparseable text counts as zero.
    pub fn duration(&self) -> Duration {
        parse_delay(&self.delay).unwrap_or(Duration::ZERO)
    }

    /// Whether this decision arms a deferred dispatch.
    pub fn is_deferred(&self) -> bool {
        !self.duration().is_zero()
    }
}

/// Which extraction tier produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionTier {
    Strict,
    Fragment,
    Permissive,
    Default,
}

#[derive(Deserialize)]
struct DelayFragment {
    delay: serde_json::Value,
}

static FRAGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{[^{}]*"delay"[^{}]*\}"#).expect("valid fragment regex"));

static LABELED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)["']?delay["']?\s*[:=]\s*["']?([^"'},\n]*)"#).expect("valid labeled regex")
});

static PROSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bdelay\s+(?:of\s+|is\s+)?(\d+\s*[a-z]*)").expect("valid prose regex")
});

static COMPONENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?|\ban?\b)\s*([a-z]*)\.?").expect("valid duration regex")
});

/// Extract the decision from raw analyzer output. Never fails.
pub fn extract_delay(text: &str) -> Decision {
    extract_delay_with_tier(text).0
}

/// Like [`extract_delay`], also reporting which tier matched.
pub fn extract_delay_with_tier(text: &str) -> (Decision, ExtractionTier) {
    let (decision, tier) = extract_tiered(text.trim());
    if parse_delay(&decision.delay).is_none() {
        warn!(delay = %decision.delay, "Delay not understood, responding now");
    }
    (decision, tier)
}

fn extract_tiered(trimmed: &str) -> (Decision, ExtractionTier) {

    if let Some(delay) = parse_fragment(trimmed) {
        debug!(delay = %delay, "Decision parsed strictly");
        return (Decision::new(delay), ExtractionTier::Strict);
    }

    for fragment in FRAGMENT_RE.find_iter(trimmed) {
        if let Some(delay) = parse_fragment(fragment.as_str()) {
            debug!(delay = %delay, "Decision parsed from embedded fragment");
            return (Decision::new(delay), ExtractionTier::Fragment);
        }
    }

    if let Some(delay) = scan_permissive(trimmed) {
        debug!(delay = %delay, "Decision recovered by permissive scan");
        return (Decision::new(delay), ExtractionTier::Permissive);
    }

    warn!(
        cause = %FailureKind::AnalysisParseError,
        raw = %trimmed.chars().take(200).collect::<String>(),
        "No delay found in analyzer output, responding now"
    );
    (Decision::respond_now(), ExtractionTier::Default)
}

fn parse_fragment(candidate: &str) -> Option<String> {
    let fragment: DelayFragment = serde_json::from_str(candidate).ok()?;
    match fragment.delay {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Null => Some("0".to_string()),
        _ => None,
    }
}

fn scan_permissive(text: &str) -> Option<String> {
    if let Some(caps) = LABELED_RE.captures(text) {
        let value = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    PROSE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Parse a delay phrase such as `"2 hours"`, `"1.5 hrs"`, `"1 hr 30 mins"`,
/// `"a month"`.
///
/// A bare number is seconds. Months are 30 days. Components may be joined
/// by commas or `and`; any other leftover word makes the whole phrase
/// unparseable.
pub fn parse_delay(text: &str) -> Option<Duration> {
    let mut total_secs = 0f64;
    let mut components = 0;
    for caps in COMPONENT_RE.captures_iter(text) {
        let count: f64 = match caps[1].to_ascii_lowercase().as_str() {
            "a" | "an" => 1.0,
            number => number.parse().ok()?,
        };
        let unit_secs = unit_seconds(&caps[2].to_ascii_lowercase())?;
        total_secs += count * unit_secs as f64;
        components += 1;
    }
    if components == 0 {
        return None;
    }

    let leftover = COMPONENT_RE.replace_all(text, " ");
    let only_joiners = leftover
        .split(|c: char| c.is_whitespace() || c == ',')
        .all(|word| word.is_empty() || word.eq_ignore_ascii_case("and"));
    if !only_joiners {
        return None;
    }

    Some(Duration::try_from_secs_f64(total_secs).unwrap_or(Duration::MAX))
}

fn unit_seconds(unit: &str) -> Option<u64> {
    let secs = match unit {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "wk" | "wks" | "week" | "weeks" => 604_800,
        "mo" | "month" | "months" => 2_592_000,
        _ => return None,
    };
    Some(secs)
}
