//! HTML mail bodies to plain text.

use std::sync::OnceLock;

use regex::Regex;

use crate::util::collapse_whitespace;

/// Wide enough that html2text never wraps a paragraph; deadline extraction
/// works line by line.
const RENDER_WIDTH: usize = 1000;

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"))
}

/// Render `html` as text with one non-empty, whitespace-collapsed line per
/// block.
pub fn strip_html(html: &str) -> String {
    let rendered = match html2text::from_read(html.as_bytes(), RENDER_WIDTH) {
        Ok(text) => text,
        Err(e) => {
            log::debug!("html2text failed ({}); stripping tags", e);
            tag_re().replace_all(html, "\n").into_owned()
        }
    };

    rendered
        .lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
