//! Media proxy data plane
//!
//! Playlist rewriting, DASH→HLS conversion, CENC ClearKey decryption and the
//! segment pipeline. Pure transformation code lives here; the HTTP surface
//! in `streamgate-api` drives it.

pub mod cenc;
pub mod hls;
pub mod license;
pub mod mpd;
pub mod remux;
pub mod segment;

/// Percent-encoding set for URL query parameter values: everything except
/// unreserved characters is escaped.
pub const QUERY_VALUE: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode a query parameter value.
#[must_use]
pub fn encode_query_value(input: &str) -> String {
    percent_encoding::utf8_percent_encode(input, QUERY_VALUE).to_string()
}
