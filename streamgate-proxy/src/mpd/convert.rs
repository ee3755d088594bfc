//! MPD → HLS conversion
//!
//! Builds an HLS master playlist from the manifest's adaptation sets and a
//! media playlist per representation, expanding SegmentTemplate addressing
//! and applying the live-edge policy (DVR window, hold-back, media
//! sequence, program-date-time).

use std::fmt::Write;

use chrono::{DateTime, Utc};
use url::Url;

use super::model::{ContentKind, Mpd, SegmentTemplate};
use super::template;
use crate::encode_query_value;

/// Segments withheld from the live edge; the origin may still be writing
/// them.
pub const HOLD_BACK_SEGMENTS: usize = 3;

/// DVR window applied to dynamic manifests without `timeShiftBufferDepth`.
pub const DEFAULT_DVR_WINDOW_SECS: f64 = 180.0;

/// Segment count assumed for live manifests with neither a timeline nor a
/// period duration.
const DEFAULT_SEGMENT_COUNT: u64 = 10;

const DEFAULT_TARGET_DURATION: u64 = 6;

#[derive(Debug, thiserror::Error)]
pub enum MpdConvertError {
    #[error("Representation not found: {0}")]
    RepresentationNotFound(String),
    #[error("SegmentTemplate required (SegmentList is not supported)")]
    MissingSegmentTemplate,
    #[error("SegmentTemplate carries no media template")]
    MissingMediaTemplate,
}

/// Inputs shared by master and media playlist generation.
pub struct ConvertOptions<'a> {
    /// Public base of this proxy.
    pub proxy_base: &'a str,
    /// MPD URL after redirects; segment URLs resolve against it.
    pub manifest_url: &'a str,
    /// Pre-built `&h_*=…&api_password=…` query suffix appended to every
    /// generated URI.
    pub extra_params: &'a str,
    /// `(key_id_hex, key_hex)` enabling server-side ClearKey decryption.
    pub clearkey: Option<(&'a str, &'a str)>,
}

#[derive(Debug, Clone)]
struct Segment {
    number: u64,
    /// Presentation time in timescale units.
    time: u64,
    duration: f64,
    discontinuity: bool,
}

/// Generate the HLS master playlist: one `#EXT-X-MEDIA` per audio/subtitle
/// representation and one `#EXT-X-STREAM-INF` per video representation.
#[must_use]
pub fn master_playlist(mpd: &Mpd, opts: &ConvertOptions<'_>) -> String {
    let mut lines = vec!["#EXTM3U".to_string(), "#EXT-X-VERSION:6".to_string()];

    let mut video = Vec::new();
    let mut audio = Vec::new();
    let mut subtitles = Vec::new();
    for period in &mpd.periods {
        for aset in &period.adaptation_sets {
            match aset.content_kind() {
                ContentKind::Video => video.push(aset),
                ContentKind::Audio => audio.push(aset),
                ContentKind::Subtitles => subtitles.push(aset),
                ContentKind::Other => {}
            }
        }
    }

    let mut audio_index = 0usize;
    for aset in &audio {
        let lang = aset.lang.as_deref().unwrap_or("und");
        for rep in &aset.representations {
            let Some(rep_id) = rep.id.as_deref() else {
                continue;
            };
            let bandwidth = rep.bandwidth.unwrap_or(128_000);
            let default = if audio_index == 0 { "YES" } else { "NO" };
            lines.push(format!(
                "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",NAME=\"Audio {} ({}k)\",LANGUAGE=\"{}\",DEFAULT={},AUTOSELECT=YES,URI=\"{}\"",
                lang.to_uppercase(),
                bandwidth / 1000,
                lang,
                default,
                media_playlist_url(rep_id, opts),
            ));
            audio_index += 1;
        }
    }

    let mut has_subtitles = false;
    for aset in &subtitles {
        let lang = aset.lang.as_deref().unwrap_or("und");
        for rep in &aset.representations {
            let Some(rep_id) = rep.id.as_deref() else {
                continue;
            };
            lines.push(format!(
                "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"Sub {}\",LANGUAGE=\"{}\",AUTOSELECT=YES,URI=\"{}\"",
                lang.to_uppercase(),
                lang,
                media_playlist_url(rep_id, opts),
            ));
            has_subtitles = true;
        }
    }

    for aset in &video {
        for rep in &aset.representations {
            let Some(rep_id) = rep.id.as_deref() else {
                continue;
            };
            let mut inf = format!("BANDWIDTH={}", rep.bandwidth.unwrap_or(0));
            if let (Some(width), Some(height)) = (rep.width, rep.height) {
                let _ = write!(inf, ",RESOLUTION={width}x{height}");
            }
            if let Some(frame_rate) = rep.frame_rate.as_deref().and_then(format_frame_rate) {
                let _ = write!(inf, ",FRAME-RATE={frame_rate}");
            }
            if let Some(codecs) = rep.codecs.as_deref().or(aset.codecs.as_deref()) {
                let _ = write!(inf, ",CODECS=\"{codecs}\"");
            }
            if audio_index > 0 {
                inf.push_str(",AUDIO=\"audio\"");
            }
            if has_subtitles {
                inf.push_str(",SUBTITLES=\"subs\"");
            }
            lines.push(format!("#EXT-X-STREAM-INF:{inf}"));
            lines.push(media_playlist_url(rep_id, opts));
        }
    }

    lines.join("\n")
}

/// Generate the HLS media playlist for one representation.
pub fn media_playlist(
    mpd: &Mpd,
    rep_id: &str,
    opts: &ConvertOptions<'_>,
) -> Result<String, MpdConvertError> {
    let (aset, rep) = mpd
        .find_representation(rep_id)
        .ok_or_else(|| MpdConvertError::RepresentationNotFound(rep_id.to_string()))?;

    let template = rep
        .segment_template
        .as_ref()
        .or(aset.segment_template.as_ref())
        .ok_or(MpdConvertError::MissingSegmentTemplate)?;
    let media_template = template
        .media
        .as_deref()
        .ok_or(MpdConvertError::MissingMediaTemplate)?;

    let timescale = template.timescale.unwrap_or(1).max(1);
    let start_number = template.start_number.unwrap_or(1);
    let bandwidth = rep.bandwidth;
    let base_url = resolve_base_url(mpd, opts.manifest_url);
    let is_live = mpd.is_live();

    let mut segments = build_segments(mpd, template, timescale, start_number);

    if is_live {
        let window = mpd
            .time_shift_buffer_secs()
            .filter(|w| *w > 0.0)
            .unwrap_or(DEFAULT_DVR_WINDOW_SECS);
        apply_dvr_window(&mut segments, window);
        apply_hold_back(&mut segments);
    }

    let target_duration = segments
        .iter()
        .map(|s| s.duration)
        .fold(0.0f64, f64::max)
        .ceil() as u64;

    let mut lines = vec![
        "#EXTM3U".to_string(),
        "#EXT-X-VERSION:6".to_string(),
        format!(
            "#EXT-X-TARGETDURATION:{}",
            if target_duration == 0 {
                DEFAULT_TARGET_DURATION
            } else {
                target_duration
            }
        ),
    ];

    if is_live {
        if let Some(first) = segments.first() {
            lines.push(format!("#EXT-X-MEDIA-SEQUENCE:{}", first.number));
        }
    } else {
        lines.push("#EXT-X-PLAYLIST-TYPE:VOD".to_string());
    }

    // Initialization segment
    let mut init_absolute = None;
    if let Some(init_template) = template.initialization.as_deref() {
        let init_path = template::expand(init_template, rep_id, bandwidth, None, None);
        let absolute = join_url(&base_url, &init_path);
        let uri = if let Some((key_id, key)) = opts.clearkey {
            format!(
                "{}/decrypt/segment.mp4?url={}&key={}&key_id={}{}",
                opts.proxy_base,
                encode_query_value(&absolute),
                key,
                key_id,
                opts.extra_params,
            )
        } else {
            format!(
                "{}/segment/{}?base_url={}{}",
                opts.proxy_base,
                basename(&init_path),
                encode_query_value(&absolute),
                opts.extra_params,
            )
        };
        lines.push(format!("#EXT-X-MAP:URI=\"{uri}\""));
        init_absolute = Some(absolute);
    }

    let availability_start = mpd
        .availability_start_time
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));

    for segment in &segments {
        if segment.discontinuity {
            lines.push("#EXT-X-DISCONTINUITY".to_string());
        }

        if let Some(start) = availability_start {
            let offset_micros = (segment.time as f64 / timescale as f64 * 1e6).round() as i64;
            let when = start + chrono::Duration::microseconds(offset_micros);
            lines.push(format!(
                "#EXT-X-PROGRAM-DATE-TIME:{}",
                when.format("%Y-%m-%dT%H:%M:%S%.6fZ")
            ));
        }

        lines.push(format!("#EXTINF:{:.6},", segment.duration));

        let media_path = template::expand(
            media_template,
            rep_id,
            bandwidth,
            Some(segment.number),
            Some(segment.time),
        );
        let absolute = join_url(&base_url, &media_path);

        if let Some((key_id, key)) = opts.clearkey {
            let init_param = init_absolute
                .as_deref()
                .map(|init| format!("&init_url={}", encode_query_value(init)))
                .unwrap_or_default();
            lines.push(format!(
                "{}/decrypt/segment.mp4?url={}{}&key={}&key_id={}{}",
                opts.proxy_base,
                encode_query_value(&absolute),
                init_param,
                key,
                key_id,
                opts.extra_params,
            ));
        } else {
            lines.push(format!(
                "{}/segment/{}?base_url={}{}",
                opts.proxy_base,
                basename(&media_path),
                encode_query_value(&absolute),
                opts.extra_params,
            ));
        }
    }

    if !is_live {
        lines.push("#EXT-X-ENDLIST".to_string());
    }

    Ok(lines.join("\n"))
}

fn media_playlist_url(rep_id: &str, opts: &ConvertOptions<'_>) -> String {
    format!(
        "{}/proxy/mpd/manifest.m3u8?d={}&rep_id={}{}",
        opts.proxy_base,
        encode_query_value(opts.manifest_url),
        encode_query_value(rep_id),
        opts.extra_params,
    )
}

fn build_segments(
    mpd: &Mpd,
    template: &SegmentTemplate,
    timescale: u64,
    start_number: u64,
) -> Vec<Segment> {
    let mut segments = Vec::new();

    if let Some(timeline) = template.segment_timeline.as_ref() {
        let mut current_time = 0u64;
        let mut current_number = start_number;
        let mut pending_discontinuity = false;

        for entry in &timeline.segments {
            if let Some(t) = entry.t {
                // A forward jump of more than one second breaks continuity.
                if !segments.is_empty() && t > current_time + timescale {
                    pending_discontinuity = true;
                }
                current_time = t;
            }

            let repeats = entry.r.unwrap_or(0).max(0) as u64 + 1;
            let duration = entry.d as f64 / timescale as f64;

            for _ in 0..repeats {
                segments.push(Segment {
                    number: current_number,
                    time: current_time,
                    duration,
                    discontinuity: std::mem::take(&mut pending_discontinuity),
                });
                current_time += entry.d;
                current_number += 1;
            }
        }
    } else if let Some(duration) = template.duration.filter(|d| *d > 0) {
        let segment_duration = duration as f64 / timescale as f64;
        let total_duration = mpd
            .periods
            .first()
            .and_then(|p| p.duration.as_deref())
            .map(super::model::parse_iso8601_duration)
            .filter(|d| *d > 0.0)
            .or_else(|| {
                mpd.media_presentation_duration
                    .as_deref()
                    .map(super::model::parse_iso8601_duration)
                    .filter(|d| *d > 0.0)
            });

        let count = total_duration
            .map(|total| (total / segment_duration) as u64)
            .unwrap_or(DEFAULT_SEGMENT_COUNT);

        for i in 0..count {
            segments.push(Segment {
                number: start_number + i,
                time: (start_number + i) * duration,
                duration: segment_duration,
                discontinuity: false,
            });
        }
    }

    segments
}

/// Drop the oldest segments until the accumulation from the newest end
/// first reaches the window.
fn apply_dvr_window(segments: &mut Vec<Segment>, window: f64) {
    let total: f64 = segments.iter().map(|s| s.duration).sum();
    if total <= window {
        return;
    }

    let mut accumulated = 0.0;
    let mut keep_from = segments.len();
    for (index, segment) in segments.iter().enumerate().rev() {
        accumulated += segment.duration;
        keep_from = index;
        if accumulated >= window {
            break;
        }
    }
    segments.drain(..keep_from);
}

/// Withhold the newest segments the origin may still be writing.
fn apply_hold_back(segments: &mut Vec<Segment>) {
    let len = segments.len();
    segments.truncate(len.saturating_sub(HOLD_BACK_SEGMENTS));
}

fn resolve_base_url(mpd: &Mpd, manifest_url: &str) -> String {
    let joined = mpd
        .base_url
        .as_ref()
        .and_then(|b| b.value.as_deref())
        .and_then(|text| {
            Url::parse(manifest_url)
                .ok()?
                .join(text.trim())
                .ok()
                .map(|u| u.to_string())
        });

    let mut base = joined.unwrap_or_else(|| {
        manifest_url
            .rsplit_once('/')
            .map_or_else(|| manifest_url.to_string(), |(dir, _)| dir.to_string())
    });
    if !base.ends_with('/') {
        base.push('/');
    }
    base
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    Url::parse(base)
        .and_then(|b| b.join(path))
        .map_or_else(|_| format!("{base}{path}"), |u| u.to_string())
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Rewrite an MPD for pass-through serving: every `<BaseURL>` is resolved
/// to an absolute URL against the (post-redirect) manifest URL, so clients
/// address segments directly. Manifests without a `BaseURL` get one
/// pointing at the manifest directory.
#[must_use]
pub fn passthrough_rewrite(content: &str, manifest_url: &str) -> String {
    static BASE_URL_TAG: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"<BaseURL>([^<]*)</BaseURL>").expect("valid BaseURL regex")
    });

    let directory = {
        let mut dir = manifest_url
            .rsplit_once('/')
            .map_or_else(|| manifest_url.to_string(), |(d, _)| d.to_string());
        if !dir.ends_with('/') {
            dir.push('/');
        }
        dir
    };

    if BASE_URL_TAG.is_match(content) {
        return BASE_URL_TAG
            .replace_all(content, |caps: &regex::Captures<'_>| {
                let absolute = join_url(&directory, caps[1].trim());
                format!("<BaseURL>{absolute}</BaseURL>")
            })
            .into_owned();
    }

    // Insert an MPD-level BaseURL right after the opening <MPD …> tag.
    if let Some(open) = content.find("<MPD") {
        if let Some(close) = content[open..].find('>') {
            let insert_at = open + close + 1;
            let mut out = String::with_capacity(content.len() + directory.len() + 20);
            out.push_str(&content[..insert_at]);
            out.push_str(&format!("<BaseURL>{directory}</BaseURL>"));
            out.push_str(&content[insert_at..]);
            return out;
        }
    }
    content.to_string()
}

/// HLS FRAME-RATE must be decimal; convert `30000/1001`-style rates.
fn format_frame_rate(raw: &str) -> Option<String> {
    if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        let rate = format!("{:.3}", num / den);
        return Some(rate.trim_end_matches('0').trim_end_matches('.').to_string());
    }
    raw.parse::<f64>().ok()?;
    Some(raw.to_string())
}
