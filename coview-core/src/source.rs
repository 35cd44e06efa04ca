use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

lazy_static! {
    static ref URL_SCHEME_REGEX: Regex = Regex::new(r"^(https?://)?").unwrap();
}

/// The kind of video source a url points to, used as the engine's mime hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    YouTube,
    /// An HLS playlist
    Hls,
    /// A plain video file
    Direct,
}

impl SourceKind {
    pub fn detect(input: &str) -> Self {
        let normalized = URL_SCHEME_REGEX.replace(input.trim(), "https://");

        match Url::parse(&normalized) {
            Ok(url) => {
                let host = url.host_str().unwrap_or_default();

                if host == "youtu.be" || host == "youtube.com" || host.ends_with(".youtube.com") {
                    return Self::YouTube;
                }

                if url.path().ends_with(".m3u8") {
                    return Self::Hls;
                }

                Self::Direct
            }
            // Not a url we understand, fall back to substring checks
            Err(_) => {
                if input.contains("youtube.com") || input.contains("youtu.be") {
                    Self::YouTube
                } else if input.contains(".m3u8") {
                    Self::Hls
                } else {
                    Self::Direct
                }
            }
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::YouTube => "video/youtube",
            Self::Hls => "application/x-mpegURL",
            Self::Direct => "video/mp4",
        }
    }
}
