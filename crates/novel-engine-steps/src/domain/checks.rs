//! Continuity and style checks.
//!
//! Each check turns a draft (or the facts extracted from it) into a
//! [`CheckReport`]. A report passes when none of its findings is an error;
//! warnings and infos are advisory.

use novel_engine_core::error::DomainError;
use novel_engine_core::payload::ExtractedFact;
use novel_engine_core::records::{Fact, Finding, Severity, StoryConstraint};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::domain::generation::FORBIDDEN_PHRASE_KEY;
use crate::domain::prose;

pub const CONTINUITY: &str = "continuity";
pub const STYLE: &str = "style";

const MIN_CONFIDENCE: f64 = 0.7;
const PASSIVE_LIMIT: usize = 5;
const ADVERB_PERCENT_LIMIT: usize = 3;
const PASSIVE_MARKERS: [&str; 4] = ["was being", "were being", "had been", "has been"];
const THIRD_PERSON_MARKERS: [&str; 3] = [" he said", " she said", " they said"];

/// Outcome of one check kind against one draft.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub kind: &'static str,
    pub passed: bool,
    pub findings: Vec<Finding>,
}

impl CheckReport {
    fn from_findings(kind: &'static str, findings: Vec<Finding>) -> Self {
        let passed = !findings.iter().any(|f| f.severity == Severity::Error);
        Self {
            kind,
            passed,
            findings,
        }
    }
}

/// Style rules read from a project's style bible.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StyleGuide {
    pub min_word_count: usize,
    pub max_word_count: usize,
    pub forbidden_words: Vec<String>,
    /// Narrative point of view, `"first"` or `"third"`.
    pub pov: String,
}

impl Default for StyleGuide {
    fn default() -> Self {
        Self {
            min_word_count: 100,
            max_word_count: 5000,
            forbidden_words: Vec::new(),
            pov: "third".to_owned(),
        }
    }
}

impl StyleGuide {
    /// Reads the guide from style bible content; missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidArgument` if the content is not an
    /// object or a known key has the wrong type.
    pub fn from_bible(content: &Value) -> Result<Self, DomainError> {
        Self::deserialize(content)
            .map_err(|e| DomainError::InvalidArgument(format!("malformed style bible: {e}")))
    }
}

/// Checks extracted facts for doubtful confidence, required characters and
/// contradictions with facts recorded for earlier drafts.
#[must_use]
pub fn continuity_check(
    facts: &[ExtractedFact],
    constraints: &[StoryConstraint],
    previous: &[Fact],
) -> CheckReport {
    let mut findings = Vec::new();

    for fact in facts.iter().filter(|f| f.confidence < MIN_CONFIDENCE) {
        findings.push(
            Finding::new(
                Severity::Warning,
                format!(
                    "Low confidence fact ({:.2}): {}",
                    fact.confidence, fact.predicate
                ),
                "Consider clarifying or removing ambiguous information",
            )
            .with_details(json!({ "fact_type": fact.fact_type })),
        );
    }

    for constraint in constraints
        .iter()
        .filter(|c| c.constraint_type == CONTINUITY)
    {
        let rule = &constraint.rule;
        if rule.get("type").and_then(Value::as_str) != Some("character_must_appear") {
            continue;
        }
        let character = rule.get("character_id").cloned().unwrap_or(Value::Null);
        let appears = facts.iter().any(|f| {
            f.subject_type == "character"
                && f.subject_id
                    .is_some_and(|id| character.as_str() == Some(id.to_string().as_str()))
        });
        if !appears {
            findings.push(
                Finding::new(
                    constraint.severity,
                    format!("Required character {character} does not appear in scene"),
                    "Add the character to the scene",
                )
                .with_details(json!({ "constraint_id": constraint.id })),
            );
        }
    }

    for fact in facts {
        for earlier in previous.iter().filter(|p| {
            p.subject_type == fact.subject_type
                && p.subject_id == fact.subject_id
                && p.predicate == fact.predicate
                && p.object != fact.object
        }) {
            findings.push(
                Finding::new(
                    Severity::Error,
                    format!(
                        "Potential contradiction: {} differs from a previous fact",
                        fact.predicate
                    ),
                    "Reconcile the contradiction or justify the change",
                )
                .with_details(json!({
                    "current": fact.object,
                    "previous": earlier.object,
                    "previous_fact_id": earlier.id,
                })),
            );
        }
    }

    CheckReport::from_findings(CONTINUITY, findings)
}

/// Checks draft prose against a style guide. Markdown markup is ignored.
#[must_use]
pub fn style_check(draft_text: &str, guide: &StyleGuide) -> CheckReport {
    let mut findings = Vec::new();
    let plain = prose::plain_text(draft_text);
    let lower = plain.to_ascii_lowercase();
    let words: Vec<&str> = prose::words(&plain).collect();
    let word_count = words.len();

    if word_count < guide.min_word_count {
        findings.push(Finding::new(
            Severity::Warning,
            format!(
                "Draft is too short ({word_count} words, minimum {})",
                guide.min_word_count
            ),
            format!("Expand the draft to at least {} words", guide.min_word_count),
        ));
    }
    if word_count > guide.max_word_count {
        findings.push(Finding::new(
            Severity::Warning,
            format!(
                "Draft is too long ({word_count} words, maximum {})",
                guide.max_word_count
            ),
            format!(
                "Consider splitting the scene or trimming to {} words",
                guide.max_word_count
            ),
        ));
    }

    let passive: usize = PASSIVE_MARKERS
        .iter()
        .map(|marker| lower.matches(marker).count())
        .sum();
    if passive > PASSIVE_LIMIT {
        findings.push(Finding::new(
            Severity::Info,
            format!("High passive voice usage ({passive} instances detected)"),
            "Consider using more active voice for stronger prose",
        ));
    }

    let adverbs = words.iter().filter(|w| is_adverb(w)).count();
    if adverbs * 100 > word_count.max(1) * ADVERB_PERCENT_LIMIT {
        findings.push(Finding::new(
            Severity::Info,
            format!("Consider reducing adverb usage ({adverbs} adverbs in {word_count} words)"),
            "Replace adverbs with stronger verbs where possible",
        ));
    }

    for phrase in &guide.forbidden_words {
        if !phrase.is_empty() && lower.contains(&phrase.to_ascii_lowercase()) {
            findings.push(
                Finding::new(
                    Severity::Error,
                    format!("Forbidden word or phrase found: '{phrase}'"),
                    "Remove or replace this word or phrase",
                )
                .with_details(json!({ FORBIDDEN_PHRASE_KEY: phrase })),
            );
        }
    }

    if guide.pov == "first" {
        for marker in THIRD_PERSON_MARKERS {
            if lower.contains(marker) {
                findings.push(Finding::new(
                    Severity::Warning,
                    format!(
                        "Possible POV break: '{}' in first-person narrative",
                        marker.trim()
                    ),
                    "Keep the narration in first person",
                ));
            }
        }
    }

    CheckReport::from_findings(STYLE, findings)
}

fn is_adverb(word: &str) -> bool {
    let word = word.trim_matches(|c: char| !c.is_alphanumeric());
    word.len() > 4 && word.to_ascii_lowercase().ends_with("ly")
}
