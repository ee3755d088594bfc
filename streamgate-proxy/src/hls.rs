//! HLS playlist rewriting
//!
//! Rewrites every URI-bearing line of an HLS playlist so it routes back
//! through this proxy: variant playlists and media segments to the proxy
//! endpoints, AES-128 keys to the key relay. Relative URIs are resolved
//! against the upstream manifest URL before rewriting, and forwarded
//! headers travel as `h_<name>=` query parameters.

use std::collections::HashMap;

use url::Url;

use crate::encode_query_value;

/// Extensions that always denote binary media payloads.
const SEGMENT_EXTENSIONS: [&str; 7] = [".ts", ".m4s", ".mp4", ".m4a", ".m4v", ".m4i", ".aac"];

/// Inputs for one playlist rewrite.
pub struct RewriteOptions<'a> {
    /// Manifest URL the playlist was fetched from (post-redirect); base for
    /// relative URI resolution.
    pub upstream_url: &'a str,
    /// Public base of this proxy, e.g. `https://proxy.example`.
    pub proxy_base: &'a str,
    /// Headers to propagate to child requests as `h_*` parameters.
    pub forward_headers: &'a HashMap<String, String>,
    /// The client's original channel URL; attached to key URIs so a failing
    /// key fetch can invalidate the extractor cache for the channel.
    pub original_url: &'a str,
    pub api_password: Option<&'a str>,
    /// Suppress the `original_channel_url` back-reference on key URIs.
    pub no_bypass: bool,
}

impl RewriteOptions<'_> {
    /// `&h_<name>=<value>…&api_password=…` suffix shared by all rewritten
    /// URIs. Header order is sorted for deterministic output.
    fn query_suffix(&self) -> String {
        let mut names: Vec<&String> = self.forward_headers.keys().collect();
        names.sort();

        let mut suffix = String::new();
        for name in names {
            suffix.push_str("&h_");
            suffix.push_str(&encode_query_value(name));
            suffix.push('=');
            suffix.push_str(&encode_query_value(&self.forward_headers[name]));
        }
        if let Some(password) = self.api_password {
            suffix.push_str("&api_password=");
            suffix.push_str(&encode_query_value(password));
        }
        suffix
    }
}

/// Rewrite a full playlist. Unknown tags pass through untouched; lines that
/// already point at this proxy are left alone, making the rewrite a fixed
/// point on its own output.
#[must_use]
pub fn rewrite_playlist(manifest: &str, opts: &RewriteOptions<'_>) -> String {
    let base = Url::parse(opts.upstream_url).ok();
    let suffix = opts.query_suffix();
    let mut output = String::with_capacity(manifest.len() * 2);

    for line in manifest.lines() {
        if let Some(rest) = line.strip_prefix('#') {
            if rest.starts_with("EXT-X-KEY") && line.contains("METHOD=AES-128") {
                output.push_str(&rewrite_uri_attribute(line, |uri| {
                    key_proxy_url(&make_absolute(uri, base.as_ref()), opts, &suffix)
                }));
            } else if line.contains("URI=\"") {
                output.push_str(&rewrite_uri_attribute(line, |uri| {
                    proxied_url(&make_absolute(uri, base.as_ref()), opts, &suffix)
                }));
            } else {
                output.push_str(line);
            }
        } else {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                output.push_str(line);
            } else {
                let absolute = make_absolute(trimmed, base.as_ref());
                output.push_str(&proxied_url(&absolute, opts, &suffix));
            }
        }
        output.push('\n');
    }

    output
}

/// Pick the proxy endpoint for an upstream URI by path extension.
fn endpoint_for(url: &str) -> &'static str {
    let path = Url::parse(url).map_or_else(|_| url.to_string(), |u| u.path().to_string());
    if path.ends_with(".m3u8") {
        "/proxy/hls/manifest.m3u8"
    } else if path.ends_with(".mpd") {
        "/proxy/mpd/manifest.m3u8"
    } else if SEGMENT_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        "/proxy/stream"
    } else {
        // Extension-less or masked URIs go to the HLS endpoint, whose
        // content sniffing serves binaries as-is.
        "/proxy/hls/manifest.m3u8"
    }
}

fn proxied_url(absolute: &str, opts: &RewriteOptions<'_>, suffix: &str) -> String {
    if is_already_proxied(absolute, opts.proxy_base) {
        return absolute.to_string();
    }
    format!(
        "{}{}?d={}{}",
        opts.proxy_base,
        endpoint_for(absolute),
        encode_query_value(absolute),
        suffix
    )
}

fn key_proxy_url(absolute: &str, opts: &RewriteOptions<'_>, suffix: &str) -> String {
    if is_already_proxied(absolute, opts.proxy_base) {
        return absolute.to_string();
    }
    let mut url = format!(
        "{}/key?key_url={}{}",
        opts.proxy_base,
        encode_query_value(absolute),
        suffix
    );
    if !opts.no_bypass && !opts.original_url.is_empty() {
        url.push_str("&original_channel_url=");
        url.push_str(&encode_query_value(opts.original_url));
    }
    url
}

fn is_already_proxied(url: &str, proxy_base: &str) -> bool {
    url.starts_with(proxy_base) && (url.contains("?d=") || url.contains("key_url=") || url.contains("&d="))
}

/// Resolve a possibly-relative URI against the manifest URL.
fn make_absolute(raw: &str, base: Option<&Url>) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    if let Some(base) = base {
        if let Ok(joined) = base.join(raw) {
            return joined.to_string();
        }
    }
    raw.to_string()
}

/// Rewrite every `URI="…"` attribute value in a tag line through `map`.
fn rewrite_uri_attribute(line: &str, map: impl Fn(&str) -> String) -> String {
    let pattern = "URI=\"";
    let mut result = String::with_capacity(line.len());
    let mut remaining = line;

    while let Some(start) = remaining.find(pattern) {
        result.push_str(&remaining[..start + pattern.len()]);
        remaining = &remaining[start + pattern.len()..];

        if let Some(end) = remaining.find('"') {
            result.push_str(&map(&remaining[..end]));
            result.push('"');
            remaining = &remaining[end + 1..];
        } else {
            result.push_str(remaining);
            remaining = "";
        }
    }

    result.push_str(remaining);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts<'a>(headers: &'a HashMap<String, String>) -> RewriteOptions<'a> {
        RewriteOptions {
            upstream_url: "https://o.example/pl.m3u8",
            proxy_base: "https://p.example",
            forward_headers: headers,
            original_url: "https://o.example/pl.m3u8",
            api_password: None,
            no_bypass: false,
        }
    }

    #[test]
    fn rewrites_key_and_segment_lines() {
        let headers = HashMap::new();
        let manifest = "#EXTM3U\n\
                        #EXT-X-VERSION:3\n\
                        #EXT-X-KEY:METHOD=AES-128,URI=\"https://o.example/k/1.bin\"\n\
                        #EXTINF:6.0,\n\
                        https://o.example/s/seg1.ts\n";
        let rewritten = rewrite_playlist(manifest, &opts(&headers));
        let lines: Vec<&str> = rewritten.lines().collect();

        assert!(lines[2].starts_with(
            "#EXT-X-KEY:METHOD=AES-128,URI=\"https://p.example/key?key_url=https%3A%2F%2Fo.example%2Fk%2F1.bin"
        ));
        assert!(lines[4].starts_with(
            "https://p.example/proxy/stream?d=https%3A%2F%2Fo.example%2Fs%2Fseg1.ts"
        ));
    }

    #[test]
    fn resolves_relative_uris_against_manifest_url() {
        let headers = HashMap::new();
        let rewritten = rewrite_playlist("#EXTINF:4.0,\nsub/seg2.ts\n", &opts(&headers));
        assert!(rewritten
            .lines()
            .nth(1)
            .unwrap()
            .contains("d=https%3A%2F%2Fo.example%2Fsub%2Fseg2.ts"));
    }

    #[test]
    fn variant_playlists_route_to_hls_endpoint() {
        let headers = HashMap::new();
        let manifest = "#EXT-X-STREAM-INF:BANDWIDTH=1280000\nlow/index.m3u8\n";
        let rewritten = rewrite_playlist(manifest, &opts(&headers));
        assert!(rewritten
            .lines()
            .nth(1)
            .unwrap()
            .starts_with("https://p.example/proxy/hls/manifest.m3u8?d="));
    }

    #[test]
    fn media_tag_uri_attribute_is_rewritten() {
        let headers = HashMap::new();
        let manifest =
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"en\",URI=\"audio/en.m3u8\"\n";
        let rewritten = rewrite_playlist(manifest, &opts(&headers));
        assert!(rewritten.contains(
            "URI=\"https://p.example/proxy/hls/manifest.m3u8?d=https%3A%2F%2Fo.example%2Faudio%2Fen.m3u8"
        ));
    }

    #[test]
    fn map_tag_follows_segment_rule() {
        let headers = HashMap::new();
        let manifest = "#EXT-X-MAP:URI=\"init.mp4\"\n";
        let rewritten = rewrite_playlist(manifest, &opts(&headers));
        assert!(rewritten.contains(
            "URI=\"https://p.example/proxy/stream?d=https%3A%2F%2Fo.example%2Finit.mp4"
        ));
    }

    #[test]
    fn headers_and_password_travel_as_query_params() {
        let mut headers = HashMap::new();
        headers.insert("referer".to_string(), "https://o.example/".to_string());
        headers.insert("user-agent".to_string(), "Mozilla/5.0".to_string());
        let mut options = opts(&headers);
        options.api_password = Some("s3cret");

        let rewritten = rewrite_playlist("#EXTINF:6.0,\nseg.ts\n", &options);
        let line = rewritten.lines().nth(1).unwrap();
        assert!(line.contains("h_referer=https%3A%2F%2Fo.example%2F"));
        assert!(line.contains("h_user-agent=Mozilla%2F5.0"));
        assert!(line.contains("api_password=s3cret"));
    }

    #[test]
    fn every_rewritten_line_carries_d_or_key_url() {
        let headers = HashMap::new();
        let manifest = "#EXTM3U\n\
                        #EXT-X-MEDIA:TYPE=AUDIO,URI=\"a.m3u8\"\n\
                        #EXT-X-STREAM-INF:BANDWIDTH=1\n\
                        v.m3u8\n\
                        #EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"\n\
                        #EXTINF:2.0,\n\
                        s.ts\n";
        let rewritten = rewrite_playlist(manifest, &opts(&headers));
        for line in rewritten.lines() {
            if line.is_empty() || (line.starts_with('#') && !line.contains("URI=\"")) {
                continue;
            }
            assert!(
                line.contains("d=") || line.contains("key_url="),
                "line lacks proxy parameter: {line}"
            );
            assert!(line.contains("https://p.example"), "not proxied: {line}");
        }
    }

    #[test]
    fn rewriting_is_a_fixed_point_on_proxied_playlists() {
        let headers = HashMap::new();
        let manifest = "#EXTM3U\n#EXTINF:6.0,\nhttps://o.example/s/seg1.ts\n";
        let once = rewrite_playlist(manifest, &opts(&headers));
        let twice = rewrite_playlist(&once, &opts(&headers));
        assert_eq!(once, twice);
    }

    #[test]
    fn mpd_uris_route_to_mpd_endpoint() {
        let headers = HashMap::new();
        let rewritten = rewrite_playlist("#EXTINF:6.0,\nstream.mpd\n", &opts(&headers));
        assert!(rewritten
            .lines()
            .nth(1)
            .unwrap()
            .starts_with("https://p.example/proxy/mpd/manifest.m3u8?d="));
    }

    #[test]
    fn key_line_keeps_other_attributes() {
        let headers = HashMap::new();
        let manifest =
            "#EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\",IV=0x9c7db8778570d05c3f9285652d88de36\n";
        let rewritten = rewrite_playlist(manifest, &opts(&headers));
        assert!(rewritten.contains(",IV=0x9c7db8778570d05c3f9285652d88de36"));
        assert!(rewritten.contains("original_channel_url="));
    }

    #[test]
    fn no_bypass_omits_channel_backreference() {
        let headers = HashMap::new();
        let mut options = opts(&headers);
        options.no_bypass = true;
        let rewritten = rewrite_playlist(
            "#EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"\n",
            &options,
        );
        assert!(!rewritten.contains("original_channel_url="));
    }
}
