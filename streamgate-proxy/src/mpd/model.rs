//! Serde model of the MPD manifest
//!
//! Only the subset of the DASH schema the converter consumes. Unknown
//! elements and attributes are ignored by serde during deserialization.

use serde::Deserialize;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Mpd {
    #[serde(rename = "@type")]
    pub mpd_type: Option<String>,
    #[serde(rename = "@availabilityStartTime")]
    pub availability_start_time: Option<String>,
    #[serde(rename = "@timeShiftBufferDepth")]
    pub time_shift_buffer_depth: Option<String>,
    #[serde(rename = "@minBufferTime")]
    pub min_buffer_time: Option<String>,
    #[serde(rename = "@mediaPresentationDuration")]
    pub media_presentation_duration: Option<String>,
    #[serde(rename = "BaseURL")]
    pub base_url: Option<BaseUrl>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct BaseUrl {
    #[serde(rename = "$text")]
    pub value: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Period {
    #[serde(rename = "@duration")]
    pub duration: Option<String>,
    #[serde(rename = "BaseURL")]
    pub base_url: Option<BaseUrl>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct AdaptationSet {
    #[serde(rename = "@mimeType")]
    pub mime_type: Option<String>,
    #[serde(rename = "@contentType")]
    pub content_type: Option<String>,
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "SegmentTemplate")]
    pub segment_template: Option<SegmentTemplate>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "@width")]
    pub width: Option<u64>,
    #[serde(rename = "@height")]
    pub height: Option<u64>,
    #[serde(rename = "@frameRate")]
    pub frame_rate: Option<String>,
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mime_type: Option<String>,
    #[serde(rename = "@audioSamplingRate")]
    pub audio_sampling_rate: Option<u64>,
    #[serde(rename = "SegmentTemplate")]
    pub segment_template: Option<SegmentTemplate>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct SegmentTemplate {
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@startNumber")]
    pub start_number: Option<u64>,
    #[serde(rename = "@duration")]
    pub duration: Option<u64>,
    #[serde(rename = "SegmentTimeline")]
    pub segment_timeline: Option<SegmentTimeline>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub segments: Vec<TimelineEntry>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct TimelineEntry {
    #[serde(rename = "@t")]
    pub t: Option<u64>,
    #[serde(rename = "@d")]
    pub d: u64,
    #[serde(rename = "@r")]
    pub r: Option<i64>,
}

/// How an adaptation set's content is classified for the master playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Video,
    Audio,
    Subtitles,
    Other,
}

impl Mpd {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.mpd_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("dynamic"))
    }

    /// DVR window in seconds when declared on a dynamic manifest.
    #[must_use]
    pub fn time_shift_buffer_secs(&self) -> Option<f64> {
        self.time_shift_buffer_depth
            .as_deref()
            .map(parse_iso8601_duration)
    }

    /// Find a representation (and its adaptation set) by id anywhere in the
    /// manifest. Exactly one representation is addressed per media-playlist
    /// request.
    #[must_use]
    pub fn find_representation(&self, rep_id: &str) -> Option<(&AdaptationSet, &Representation)> {
        for period in &self.periods {
            for aset in &period.adaptation_sets {
                for rep in &aset.representations {
                    if rep.id.as_deref() == Some(rep_id) {
                        return Some((aset, rep));
                    }
                }
            }
        }
        None
    }
}

impl AdaptationSet {
    /// Classify by MIME or content type, falling back to the child
    /// representations' MIME.
    #[must_use]
    pub fn content_kind(&self) -> ContentKind {
        let mime = self.mime_type.as_deref().unwrap_or("");
        let content = self.content_type.as_deref().unwrap_or("");

        if mime.contains("video") || content.contains("video") {
            return ContentKind::Video;
        }
        if mime.contains("audio") || content.contains("audio") {
            return ContentKind::Audio;
        }
        if mime.contains("text") || content.contains("subtitles") || mime == "application/ttml+xml"
        {
            return ContentKind::Subtitles;
        }

        for rep in &self.representations {
            match rep.mime_type.as_deref() {
                Some(m) if m.contains("video") => return ContentKind::Video,
                Some(m) if m.contains("audio") => return ContentKind::Audio,
                _ => {}
            }
        }

        ContentKind::Other
    }
}

/// Parse an MPD document. A missing default namespace is tolerated.
pub fn parse_mpd(content: &str) -> Result<Mpd, quick_xml::de::DeError> {
    quick_xml::de::from_str(content)
}

/// Parse an ISO-8601 duration of the `PT[nH][nM][n.nS]` form into seconds.
/// Malformed input yields 0.
#[must_use]
pub fn parse_iso8601_duration(raw: &str) -> f64 {
    static RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?$")
            .expect("valid duration regex")
    });

    let Some(captures) = RE.captures(raw.trim()) else {
        return 0.0;
    };
    let part = |i: usize| {
        captures
            .get(i)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    part(1) * 3600.0 + part(2) * 60.0 + part(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic"
     availabilityStartTime="2024-01-01T00:00:00Z" timeShiftBufferDepth="PT60S"
     minBufferTime="PT2S">
  <Period>
    <AdaptationSet mimeType="video/mp4" segmentAlignment="true">
      <SegmentTemplate timescale="1000" initialization="$RepresentationID$/init.mp4"
                       media="$RepresentationID$/seg-$Number$.m4s" startNumber="1">
        <SegmentTimeline>
          <S t="0" d="2000" r="39"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="video_720" bandwidth="1500000" width="1280" height="720"
                      frameRate="25" codecs="avc1.64001F"/>
    </AdaptationSet>
    <AdaptationSet mimeType="audio/mp4" lang="en">
      <Representation id="audio_en" bandwidth="128000" audioSamplingRate="48000"
                      codecs="mp4a.40.2"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn parses_core_structure() {
        let mpd = parse_mpd(SAMPLE).unwrap();
        assert!(mpd.is_live());
        assert_eq!(mpd.time_shift_buffer_secs(), Some(60.0));
        assert_eq!(mpd.periods.len(), 1);
        assert_eq!(mpd.periods[0].adaptation_sets.len(), 2);

        let (aset, rep) = mpd.find_representation("video_720").unwrap();
        assert_eq!(aset.content_kind(), ContentKind::Video);
        assert_eq!(rep.bandwidth, Some(1_500_000));

        let template = aset.segment_template.as_ref().unwrap();
        let timeline = template.segment_timeline.as_ref().unwrap();
        assert_eq!(timeline.segments.len(), 1);
        assert_eq!(timeline.segments[0].d, 2000);
        assert_eq!(timeline.segments[0].r, Some(39));
    }

    #[test]
    fn unknown_representation_is_none() {
        let mpd = parse_mpd(SAMPLE).unwrap();
        assert!(mpd.find_representation("nope").is_none());
    }

    #[test]
    fn classification_falls_back_to_child_mime() {
        let xml = r#"<MPD><Period><AdaptationSet>
            <Representation id="a" mimeType="audio/mp4" bandwidth="64000"/>
        </AdaptationSet></Period></MPD>"#;
        let mpd = parse_mpd(xml).unwrap();
        assert_eq!(
            mpd.periods[0].adaptation_sets[0].content_kind(),
            ContentKind::Audio
        );
    }

    #[test]
    fn iso8601_durations() {
        assert_eq!(parse_iso8601_duration("PT60S"), 60.0);
        assert_eq!(parse_iso8601_duration("PT1H1M1S"), 3661.0);
        assert_eq!(parse_iso8601_duration("PT10.5S"), 10.5);
        assert_eq!(parse_iso8601_duration("PT2M"), 120.0);
        assert_eq!(parse_iso8601_duration("garbage"), 0.0);
    }
}
