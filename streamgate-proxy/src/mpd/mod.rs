//! DASH manifest handling
//!
//! `model` parses the MPD XML into serde structs; `convert` turns a parsed
//! manifest into HLS master/media playlists; `template` expands DASH
//! SegmentTemplate placeholders.

pub mod convert;
pub mod model;
pub mod template;

pub use convert::{
    master_playlist, media_playlist, passthrough_rewrite, ConvertOptions, MpdConvertError,
};
pub use model::{parse_mpd, Mpd};
