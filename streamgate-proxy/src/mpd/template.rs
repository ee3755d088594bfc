//! SegmentTemplate placeholder expansion
//!
//! Handles `$Number$`, `$Time$`, `$Bandwidth$` and `$RepresentationID$`,
//! each with an optional printf-style width spec (e.g. `$Number%05d$`).

use std::sync::LazyLock;

use regex::{Captures, Regex};

static RE_BANDWIDTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$Bandwidth(%[^$]+)?\$").expect("valid template regex"));
static RE_REP_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$RepresentationID(%[^$]+)?\$").expect("valid template regex"));
static RE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$Number(%[^$]+)?\$").expect("valid template regex"));
static RE_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$Time(%[^$]+)?\$").expect("valid template regex"));

/// Expand a SegmentTemplate URL. Placeholders whose value is not supplied
/// are left untouched.
#[must_use]
pub fn expand(
    template: &str,
    rep_id: &str,
    bandwidth: Option<u64>,
    number: Option<u64>,
    time: Option<u64>,
) -> String {
    let mut url = template.to_string();

    if let Some(bandwidth) = bandwidth {
        url = RE_BANDWIDTH
            .replace_all(&url, |caps: &Captures<'_>| format_spec(caps, bandwidth))
            .into_owned();
    }

    url = RE_REP_ID
        .replace_all(&url, |_caps: &Captures<'_>| rep_id.to_string())
        .into_owned();

    if let Some(number) = number {
        url = RE_NUMBER
            .replace_all(&url, |caps: &Captures<'_>| format_spec(caps, number))
            .into_owned();
    }

    if let Some(time) = time {
        url = RE_TIME
            .replace_all(&url, |caps: &Captures<'_>| format_spec(caps, time))
            .into_owned();
    }

    url
}

/// Apply a `%0Nd`-style conversion spec captured alongside the placeholder.
/// Unsupported specs fall back to plain decimal.
fn format_spec(caps: &Captures<'_>, value: u64) -> String {
    let Some(spec) = caps.get(1).map(|m| m.as_str()) else {
        return value.to_string();
    };

    static RE_WIDTH: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^%0?(\d+)?d$").expect("valid width regex"));

    if let Some(width_caps) = RE_WIDTH.captures(spec) {
        let width = width_caps
            .get(1)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .unwrap_or(0);
        let zero_pad = spec.starts_with("%0");
        if zero_pad {
            return format!("{value:0width$}");
        }
        return format!("{value:width$}");
    }

    if spec == "%x" {
        return format!("{value:x}");
    }

    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_all_placeholders() {
        let url = expand(
            "$RepresentationID$/seg-$Number$-$Time$-$Bandwidth$.m4s",
            "video_720",
            Some(1_500_000),
            Some(42),
            Some(84_000),
        );
        assert_eq!(url, "video_720/seg-42-84000-1500000.m4s");
    }

    #[test]
    fn printf_width_specs() {
        assert_eq!(
            expand("seg-$Number%05d$.m4s", "r", None, Some(7), None),
            "seg-00007.m4s"
        );
        assert_eq!(
            expand("t-$Time%08d$.m4s", "r", None, None, Some(123)),
            "t-00000123.m4s"
        );
    }

    #[test]
    fn missing_values_leave_placeholders() {
        assert_eq!(
            expand("seg-$Number$.m4s", "r", None, None, None),
            "seg-$Number$.m4s"
        );
    }

    #[test]
    fn unsupported_spec_falls_back_to_decimal() {
        assert_eq!(
            expand("seg-$Number%u$.m4s", "r", None, Some(9), None),
            "seg-9.m4s"
        );
    }
}
