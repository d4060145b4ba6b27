//! Input URL parsing.
//!
//! Input is UTF-8 text, one or more URLs per line. `#` starts a comment
//! line, a line holding `#` alone toggles a block-comment region, and lines
//! starting with `---` or `===` open a named group whose name becomes the
//! `parent_title` of every following item until the next header. URLs are
//! regex-extracted so whole paragraphs or forum markup can be pasted in
//! verbatim.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};
use url::Url;

/// One URL from the input with the group it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEntry {
    /// The extracted URL.
    pub url: Url,
    /// Group name from the preceding `---`/`===` header, if any.
    pub group: Option<String>,
}

/// Everything parsed from one input text.
#[derive(Debug, Default)]
pub struct ParsedInput {
    /// URLs in input order.
    pub entries: Vec<InputEntry>,
    /// Distinct group names seen.
    pub groups: Vec<String>,
}

impl ParsedInput {
    /// Returns true when no URLs were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of URLs found.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn link_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    REGEX.get_or_init(|| {
        Regex::new(r#"https?://[^\s"'<>\[\]]+"#).expect("static URL regex is valid")
    })
}

/// Extracts every URL from one line.
///
/// Comment lines yield nothing. Thumbnail-style `.md.` infixes are folded
/// back to the original asset name.
pub fn extract_urls(line: &str) -> Vec<Url> {
    let line = line.trim();
    if line.starts_with('#') {
        return Vec::new();
    }

    link_regex()
        .find_iter(line)
        .filter_map(|found| {
            let candidate = found.as_str().replace(".md.", ".");
            match Url::parse(&candidate) {
                Ok(url) => Some(url),
                Err(error) => {
                    warn!(candidate, error = %error, "unable to parse URL from input");
                    None
                }
            }
        })
        .collect()
}

/// Parses a full input text into grouped URL entries.
#[must_use]
pub fn parse_input(text: &str) -> ParsedInput {
    let mut parsed = ParsedInput::default();
    let mut block_comment = false;
    let mut current_group: Option<String> = None;

    for line in text.lines() {
        if line.starts_with("---") || line.starts_with("===") {
            let name = line.replace("---", "").replace("===", "");
            let name = name.trim();
            current_group = if name.is_empty() {
                None
            } else {
                if !parsed.groups.iter().any(|existing| existing == name) {
                    parsed.groups.push(name.to_string());
                }
                Some(name.to_string())
            };
            continue;
        }

        if line.trim() == "#" {
            block_comment = !block_comment;
            continue;
        }
        if block_comment {
            continue;
        }

        for url in extract_urls(line) {
            parsed.entries.push(InputEntry {
                url,
                group: current_group.clone(),
            });
        }
    }

    debug!(
        urls = parsed.entries.len(),
        groups = parsed.groups.len(),
        "parsed input"
    );
    parsed
}

/// Reads and parses an input file.
///
/// # Errors
///
/// Returns the IO error when the file cannot be read.
pub async fn parse_input_file(path: &std::path::Path) -> std::io::Result<ParsedInput> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(parse_input(&text))
}
