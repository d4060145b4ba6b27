//! Known file extension classes.
//!
//! Extensions are stored lowercased with a leading dot, matching
//! [`crate::media::extension_of`].

/// Video extensions.
pub const VIDEO: &[&str] = &[
    ".mp4", ".m4v", ".mkv", ".webm", ".mov", ".avi", ".wmv", ".flv", ".mpg", ".mpeg", ".ts",
    ".m2ts", ".3gp", ".ogv",
];

/// Image extensions.
pub const IMAGE: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".tiff", ".heic", ".avif", ".svg", ".jfif",
];

/// Audio extensions.
pub const AUDIO: &[&str] = &[
    ".mp3", ".m4a", ".flac", ".wav", ".ogg", ".opus", ".aac", ".wma", ".aiff",
];

/// Text formats for which an `html`/`text` Content-Type is acceptable.
pub const TEXT: &[&str] = &[".txt", ".html", ".htm", ".md", ".json", ".csv", ".srt", ".vtt"];

/// Returns true if `ext` (lowercased, with dot) is a video extension.
#[must_use]
pub fn is_video(ext: &str) -> bool {
    VIDEO.contains(&ext)
}

/// Returns true if `ext` is an image extension.
#[must_use]
pub fn is_image(ext: &str) -> bool {
    IMAGE.contains(&ext)
}

/// Returns true if `ext` is an audio extension.
#[must_use]
pub fn is_audio(ext: &str) -> bool {
    AUDIO.contains(&ext)
}

/// Returns true if `ext` is a text format.
#[must_use]
pub fn is_text(ext: &str) -> bool {
    TEXT.contains(&ext)
}

/// Returns true if `ext` belongs to any known media class.
#[must_use]
pub fn is_media(ext: &str) -> bool {
    is_video(ext) || is_image(ext) || is_audio(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_extensions_classified() {
        assert!(is_video(".mp4"));
        assert!(is_media(".mp4"));
        assert!(!is_video(".jpg"));
    }

    #[test]
    fn test_text_extensions_classified() {
        assert!(is_text(".html"));
        assert!(!is_text(".mp4"));
    }

    #[test]
    fn test_unknown_extension_is_not_media() {
        assert!(!is_media(".exe"));
        assert!(!is_media(""));
    }
}
