//! Markdown-aware text helpers shared by generation and checks.

use pulldown_cmark::{Event, Parser, TagEnd};

/// The readable text of a markdown document with markup removed.
///
/// Block boundaries become blank lines so phrases never run across a
/// heading or paragraph break.
#[must_use]
pub fn plain_text(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    for event in Parser::new(markdown) {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push(' '),
            Event::End(
                TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item | TagEnd::CodeBlock,
            ) => out.push_str("\n\n"),
            _ => {}
        }
    }
    out
}

/// Whitespace-separated words of already plain text.
pub fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
}

/// Number of prose words in a markdown document.
#[must_use]
pub fn word_count(markdown: &str) -> usize {
    words(&plain_text(markdown)).count()
}

/// Removes every ASCII-case-insensitive occurrence of `phrase`.
#[must_use]
pub fn strip_phrase(text: &str, phrase: &str) -> String {
    if phrase.is_empty() {
        return text.to_owned();
    }
    // ASCII lowering keeps byte offsets aligned with `text`.
    let haystack = text.to_ascii_lowercase();
    let needle = phrase.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, _) in haystack.match_indices(&needle) {
        out.push_str(&text[last..start]);
        last = start + needle.len();
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_drops_markup() {
        let text = plain_text("## The Harbor\n\nShe *ran* to the `dock`.\n\n- one\n- two");

        assert!(text.contains("The Harbor"));
        assert!(text.contains("She ran to the dock."));
        assert!(!text.contains('#'));
        assert!(!text.contains('*'));
    }

    #[test]
    fn test_word_count_ignores_markup_tokens() {
        assert_eq!(word_count("## Title\n\nOne two **three**."), 4);
    }

    #[test]
    fn test_word_count_of_empty_text_is_zero() {
        assert_eq!(word_count(""), 0);
    }

    #[test]
    fn test_strip_phrase_is_case_insensitive() {
        let stripped = strip_phrase("Suddenly it rained. Then, suddenly, it stopped.", "suddenly");

        assert_eq!(stripped, " it rained. Then, , it stopped.");
    }

    #[test]
    fn test_strip_empty_phrase_keeps_text() {
        assert_eq!(strip_phrase("unchanged", ""), "unchanged");
    }
}
