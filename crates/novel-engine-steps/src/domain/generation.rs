//! Deterministic stand-ins for the language-model calls.
//!
//! Everything here is pure: the same scene card, plan or draft text always
//! produces the same output. Text-derived values are seeded by a SHA-256
//! digest of the text.

use novel_engine_core::payload::{Beat, ExtractedFact, ScenePlan};
use novel_engine_core::records::{ElementKind, Finding, StoryElement};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::domain::prose;

const DEFAULT_TITLE: &str = "Untitled Scene";
const DEFAULT_TONE: &str = "dramatic";
const DEFAULT_PACING: &str = "medium";
const DEFAULT_WORD_TARGET: u32 = 1500;

const BEATS: [&str; 5] = [
    "Opening hook: establish the setting and the tension in it",
    "Introduce the characters through dialogue",
    "Rising action: the conflict surfaces",
    "Climactic moment",
    "Resolution and transition to what comes next",
];

const PASSAGES: [&str; 5] = [
    "The {tone} quiet of the opening settles over the room before anyone speaks. \
     Every object in it seems to wait, and the light falls at an angle that makes \
     the familiar look briefly strange.",
    "\"I did not think you would come back,\" the first voice says, carrying years \
     of history in a handful of words. The answer takes its time, measured and \
     careful, giving nothing away.",
    "Small disagreements sharpen into something harder. What began as polite \
     conversation turns into a contest neither side can afford to lose, and the \
     space between them narrows.",
    "At the height of it a choice arrives that cannot be put off any longer. One \
     of them makes it, and the weight of that decision stays in the room after \
     the words are gone.",
    "The scene closes on a question left open on purpose, a thread for a later \
     chapter to pull. Outside, the ordinary world carries on as if nothing has \
     changed.",
];

/// Finding detail key naming a phrase the style guide forbids.
pub const FORBIDDEN_PHRASE_KEY: &str = "forbidden_phrase";

/// Short hex digest of `text`.
#[must_use]
pub fn digest(text: &str) -> String {
    let hash = Sha256::digest(text.as_bytes());
    hex::encode(&hash[..4])
}

fn card_str<'a>(card: &'a Value, key: &str, default: &'a str) -> &'a str {
    card.get(key).and_then(Value::as_str).unwrap_or(default)
}

/// Outlines a scene from its card. `tone`, `pacing` and `word_target` are
/// taken from the card when present.
#[must_use]
pub fn plan_scene(card: &Value) -> ScenePlan {
    let word_target = card
        .get("word_target")
        .and_then(Value::as_u64)
        .and_then(|target| u32::try_from(target).ok())
        .unwrap_or(DEFAULT_WORD_TARGET);
    ScenePlan {
        beats: (1..)
            .zip(BEATS)
            .map(|(order, description)| Beat {
                order,
                description: description.to_owned(),
            })
            .collect(),
        tone: card_str(card, "tone", DEFAULT_TONE).to_owned(),
        pacing: card_str(card, "pacing", DEFAULT_PACING).to_owned(),
        word_target,
    }
}

/// Writes a markdown draft following `plan`, one passage per beat.
///
/// With a `base` text the new passages are appended to it, so the draft
/// builds on the one the iteration started from.
#[must_use]
pub fn draft_scene(card: &Value, plan: &ScenePlan, base: Option<&str>) -> String {
    let title = card_str(card, "title", DEFAULT_TITLE);
    let mut beats: Vec<&Beat> = plan.beats.iter().collect();
    beats.sort_by_key(|beat| beat.order);

    let mut body = match base {
        Some(_) => format!("## {title} (continued)\n\n"),
        None => format!("## {title}\n\n"),
    };
    for beat in beats {
        let index = usize::try_from(beat.order.saturating_sub(1)).unwrap_or(0) % PASSAGES.len();
        body.push_str(&PASSAGES[index].replace("{tone}", &plan.tone));
        body.push_str("\n\n");
    }
    body.push_str(&format!(
        "*Drafted from a plan of {} beats at {} pacing.*",
        plan.beats.len(),
        plan.pacing
    ));

    match base {
        Some(base) => format!("{base}\n\n{body}"),
        None => body,
    }
}

/// Produces a revision of `current` that addresses `findings`.
///
/// Forbidden phrases reported by the style check are removed from the text;
/// every finding is acknowledged in a revision note appended to the draft.
#[must_use]
pub fn revise_draft(current: &str, findings: &[Finding]) -> String {
    let mut text = current.to_owned();
    let mut notes = Vec::with_capacity(findings.len());
    for finding in findings {
        let phrase = finding
            .details
            .as_ref()
            .and_then(|details| details.get(FORBIDDEN_PHRASE_KEY))
            .and_then(Value::as_str);
        if let Some(phrase) = phrase {
            text = prose::strip_phrase(&text, phrase);
            notes.push("Removed a forbidden phrase".to_owned());
        } else {
            notes.push(format!("Addressed: {}", finding.message));
        }
    }

    text.push_str("\n\n---\n\n**Revision notes**\n\n");
    if notes.is_empty() {
        text.push_str("No findings to address.\n");
    }
    for (n, note) in notes.iter().enumerate() {
        text.push_str(&format!("{}. {note}\n", n + 1));
    }
    text
}

/// Extracts facts from a draft: one mention fact for every cataloged
/// character or location named in the text, plus the generic scene facts.
#[must_use]
pub fn extract_facts(draft_text: &str, elements: &[StoryElement]) -> Vec<ExtractedFact> {
    let lowered = draft_text.to_lowercase();
    let mut facts: Vec<ExtractedFact> = elements
        .iter()
        .filter(|element| mentions(&lowered, &element.name.to_lowercase()))
        .map(element_fact)
        .collect();
    facts.extend(scene_facts());
    facts
}

fn element_fact(element: &StoryElement) -> ExtractedFact {
    let (fact_type, predicate, confidence) = match element.kind {
        ElementKind::Character => ("character_trait", "appears_in_scene", 0.9),
        ElementKind::Location => ("location_detail", "setting", 0.8),
    };
    ExtractedFact {
        id: None,
        fact_type: fact_type.to_owned(),
        subject_type: element.kind.as_str().to_owned(),
        subject_id: Some(element.id),
        predicate: predicate.to_owned(),
        object: json!({ "name": element.name }),
        confidence,
    }
}

/// Whether `name` occurs in `text` as whole words. Both are lowercase.
fn mentions(text: &str, name: &str) -> bool {
    let name = name.trim();
    if name.is_empty() {
        return false;
    }
    text.match_indices(name).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + name.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn scene_facts() -> [ExtractedFact; 3] {
    [
        ExtractedFact {
            id: None,
            fact_type: "character_trait".to_owned(),
            subject_type: "character".to_owned(),
            subject_id: None,
            predicate: "appears_in_scene".to_owned(),
            object: json!({ "action": "speaks" }),
            confidence: 0.95,
        },
        ExtractedFact {
            id: None,
            fact_type: "location_detail".to_owned(),
            subject_type: "location".to_owned(),
            subject_id: None,
            predicate: "setting".to_owned(),
            object: json!({ "description": "interior" }),
            confidence: 0.85,
        },
        ExtractedFact {
            id: None,
            fact_type: "event".to_owned(),
            subject_type: "scene".to_owned(),
            subject_id: None,
            predicate: "contains_event".to_owned(),
            object: json!({ "event_type": "dialogue" }),
            confidence: 0.90,
        },
    ]
}

/// One-line summary of a draft.
#[must_use]
pub fn summarize(draft_text: &str) -> String {
    format!(
        "Scene summary ({} words, digest {}): character interactions and plot development.",
        prose::word_count(draft_text),
        digest(draft_text)
    )
}

#[cfg(test)]
mod tests {
    use novel_engine_core::records::Severity;

    use super::*;

    #[test]
    fn test_digest_is_stable_and_short() {
        assert_eq!(digest("abc"), digest("abc"));
        assert_ne!(digest("abc"), digest("abd"));
        assert_eq!(digest("abc").len(), 8);
    }

    #[test]
    fn test_plan_uses_card_values_with_defaults() {
        // Arrange
        let card = json!({ "title": "Storm", "tone": "bleak", "word_target": 900 });

        // Act
        let plan = plan_scene(&card);

        // Assert
        assert_eq!(plan.beats.len(), 5);
        assert_eq!(plan.beats[0].order, 1);
        assert_eq!(plan.tone, "bleak");
        assert_eq!(plan.pacing, "medium");
        assert_eq!(plan.word_target, 900);
    }

    #[test]
    fn test_draft_is_deterministic_and_titled() {
        let card = json!({ "title": "Storm" });
        let plan = plan_scene(&card);

        let first = draft_scene(&card, &plan, None);
        let second = draft_scene(&card, &plan, None);

        assert_eq!(first, second);
        assert!(first.starts_with("## Storm\n"));
        assert!(prose::word_count(&first) > 100);
    }

    #[test]
    fn test_draft_builds_on_base_text() {
        let card = json!({});
        let plan = plan_scene(&card);

        let draft = draft_scene(&card, &plan, Some("An earlier opening."));

        assert!(draft.starts_with("An earlier opening.\n\n## Untitled Scene (continued)"));
    }

    #[test]
    fn test_revision_removes_forbidden_phrases_and_lists_findings() {
        // Arrange
        let findings = vec![
            Finding::new(Severity::Error, "Forbidden phrase found: 'suddenly'", "Remove it")
                .with_details(json!({ FORBIDDEN_PHRASE_KEY: "suddenly" })),
            Finding::new(Severity::Warning, "Draft is too short", "Expand it"),
        ];

        // Act
        let revised = revise_draft("Suddenly the door opened.", &findings);

        // Assert
        assert!(!revised.to_ascii_lowercase().contains("suddenly"));
        assert!(revised.contains("1. Removed a forbidden phrase"));
        assert!(revised.contains("2. Addressed: Draft is too short"));
    }

    #[test]
    fn test_revision_without_findings_still_changes_text() {
        let revised = revise_draft("Text.", &[]);

        assert_ne!(revised, "Text.");
        assert!(revised.contains("No findings to address."));
    }

    fn element(kind: ElementKind, name: &str) -> StoryElement {
        let now = chrono::Utc::now();
        StoryElement {
            id: uuid::Uuid::new_v4(),
            project_id: uuid::Uuid::new_v4(),
            kind,
            name: name.to_owned(),
            data: json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_extraction_reports_confident_facts() {
        let facts = extract_facts("anything", &[]);

        assert_eq!(facts.len(), 3);
        assert!(facts.iter().all(|f| f.confidence >= 0.7 && f.id.is_none()));
    }

    #[test]
    fn test_extraction_records_named_elements() {
        // Arrange
        let mara = element(ElementKind::Character, "Mara");
        let tom = element(ElementKind::Character, "Tom");
        let harbor = element(ElementKind::Location, "the Old Harbor");
        let text = "MARA waited at the old harbor. Tomorrow would be different.";

        // Act
        let facts = extract_facts(text, &[mara.clone(), tom, harbor.clone()]);

        // Assert
        assert_eq!(facts.len(), 5);
        assert_eq!(facts[0].subject_type, "character");
        assert_eq!(facts[0].subject_id, Some(mara.id));
        assert_eq!(facts[0].predicate, "appears_in_scene");
        assert_eq!(facts[1].subject_type, "location");
        assert_eq!(facts[1].subject_id, Some(harbor.id));
        assert_eq!(facts[1].object, json!({ "name": "the Old Harbor" }));
    }

    #[test]
    fn test_summary_mentions_word_count_and_digest() {
        let summary = summarize("one two three");

        assert!(summary.contains("3 words"));
        assert!(summary.contains(&digest("one two three")));
    }
}
