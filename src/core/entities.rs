//! Rule-based entity extraction.
//!
//! Finds emails, amounts, dates, times and locations in a goal and replaces
//! them with placeholder tokens (`{LOCATION}`, `{LOCATION_2}`, ...). The
//! resulting template text is what the plan cache embeds, so "fly to Paris"
//! and "fly to Tokyo" map onto the same template.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Email,
    Amount,
    Date,
    Time,
    Location,
}

impl EntityKind {
    /// Extraction order; earlier kinds claim overlapping text first
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Email,
        EntityKind::Amount,
        EntityKind::Date,
        EntityKind::Time,
        EntityKind::Location,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Email => "EMAIL",
            EntityKind::Amount => "AMOUNT",
            EntityKind::Date => "DATE",
            EntityKind::Time => "TIME",
            EntityKind::Location => "LOCATION",
        }
    }

    fn pattern(&self) -> &'static Regex {
        static EMAIL: OnceLock<Regex> = OnceLock::new();
        static AMOUNT: OnceLock<Regex> = OnceLock::new();
        static DATE: OnceLock<Regex> = OnceLock::new();
        static TIME: OnceLock<Regex> = OnceLock::new();
        static LOCATION: OnceLock<Regex> = OnceLock::new();

        match self {
            EntityKind::Email => EMAIL.get_or_init(|| {
                Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid email regex")
            }),
            EntityKind::Amount => AMOUNT.get_or_init(|| {
                Regex::new(
                    r"(?i)(?:[$€£]\s?\d[\d,]*(?:\.\d+)?|\b\d[\d,]*(?:\.\d+)?\s?(?:usd|eur|gbp|dollars|euros|pounds)\b)",
                )
                .expect("valid amount regex")
            }),
            EntityKind::Date => DATE.get_or_init(|| {
                Regex::new(
                    r"(?i)\b(?:today|tomorrow|yesterday|(?:next\s+|this\s+)?(?:monday|tuesday|wednesday|thursday|friday|saturday|sunday)|\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}(?:/\d{2,4})?|(?:jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\s+\d{1,2}(?:st|nd|rd|th)?)\b",
                )
                .expect("valid date regex")
            }),
            EntityKind::Time => TIME.get_or_init(|| {
                Regex::new(r"(?i)\b(?:\d{1,2}:\d{2}(?:\s?[ap]m)?|\d{1,2}\s?[ap]m|noon|midnight)\b")
                    .expect("valid time regex")
            }),
            // Capitalised word run after a preposition; group 1 is the place
            EntityKind::Location => LOCATION.get_or_init(|| {
                Regex::new(r"\b(?:to|in|from|at|near)\s+([A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)*)")
                    .expect("valid location regex")
            }),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One extracted surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub value: String,
    /// Placeholder token that stands for this entity, e.g. `{DATE_2}`
    pub placeholder: String,
    pub start: usize,
    pub end: usize,
}

/// Result of running extraction over a goal
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Extraction {
    /// Entities in text order
    pub entities: Vec<Entity>,

    /// Goal with every entity replaced by its placeholder
    pub template_text: String,
}

impl Extraction {
    /// Placeholder -> surface value
    pub fn bindings(&self) -> BTreeMap<String, String> {
        self.entities
            .iter()
            .map(|e| (e.placeholder.clone(), e.value.clone()))
            .collect()
    }
}

/// Extract entities and build the template text
pub fn extract(text: &str) -> Extraction {
    let mut found: Vec<(EntityKind, usize, usize)> = Vec::new();

    for kind in EntityKind::ALL {
        let pattern = kind.pattern();
        for captures in pattern.captures_iter(text) {
            let Some(m) = captures.get(1).or_else(|| captures.get(0)) else {
                continue;
            };
            let overlaps = found.iter().any(|&(_, s, e)| m.start() < e && s < m.end());
            if !overlaps {
                found.push((kind, m.start(), m.end()));
            }
        }
    }
    found.sort_by_key(|&(_, start, _)| start);

    let mut counts: BTreeMap<EntityKind, usize> = BTreeMap::new();
    let mut entities = Vec::with_capacity(found.len());
    let mut template_text = String::with_capacity(text.len());
    let mut cursor = 0;

    for (kind, start, end) in found {
        let n = counts.entry(kind).or_insert(0);
        *n += 1;
        let placeholder = placeholder_token(kind, *n);

        template_text.push_str(&text[cursor..start]);
        template_text.push_str(&placeholder);
        cursor = end;

        entities.push(Entity {
            kind,
            value: text[start..end].to_string(),
            placeholder,
            start,
            end,
        });
    }
    template_text.push_str(&text[cursor..]);

    Extraction {
        entities,
        template_text,
    }
}

/// `{KIND}` for the first occurrence, `{KIND_n}` after that
pub fn placeholder_token(kind: EntityKind, occurrence: usize) -> String {
    if occurrence <= 1 {
        format!("{{{}}}", kind.as_str())
    } else {
        format!("{{{}_{}}}", kind.as_str(), occurrence)
    }
}

fn placeholder_pattern() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(r"\{(?:EMAIL|AMOUNT|DATE|TIME|LOCATION)(?:_\d+)?\}").expect("valid placeholder regex")
    })
}

/// Placeholder tokens appearing in a string, in order
pub fn placeholders_in(text: &str) -> Vec<String> {
    placeholder_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Role of each placeholder in a template text: the lower-cased word in
/// front of it plus the placeholder, e.g. `from {LOCATION}`.
///
/// Two templates with the same words can still disagree on which entity
/// plays which part ("from {LOCATION} to {LOCATION_2}" against
/// "to {LOCATION} from {LOCATION_2}"); their signatures differ.
pub fn slot_signature(template_text: &str) -> Vec<String> {
    placeholder_pattern()
        .find_iter(template_text)
        .map(|m| {
            let lead = template_text[..m.start()]
                .split_whitespace()
                .last()
                .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
                .unwrap_or_default();
            format!("{} {}", lead, m.as_str()).trim_start().to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_and_date() {
        let extraction = extract("Book a flight to Paris tomorrow");

        assert_eq!(extraction.template_text, "Book a flight to {LOCATION} {DATE}");
        let bindings = extraction.bindings();
        assert_eq!(bindings["{LOCATION}"], "Paris");
        assert_eq!(bindings["{DATE}"], "tomorrow");
    }

    #[test]
    fn test_same_template_for_different_cities() {
        let paris = extract("Book a flight to Paris tomorrow");
        let tokyo = extract("Book a flight to Tokyo tomorrow");
        assert_eq!(paris.template_text, tokyo.template_text);
    }

    #[test]
    fn test_repeated_kind_is_numbered() {
        let extraction = extract("Fly from New York to San Francisco on 2024-05-01 at 9:30am");

        assert_eq!(
            extraction.template_text,
            "Fly from {LOCATION} to {LOCATION_2} on {DATE} at {TIME}"
        );
        assert_eq!(extraction.bindings()["{LOCATION_2}"], "San Francisco");
    }

    #[test]
    fn test_email_and_amount_claim_text_first() {
        let extraction = extract("Send $1,250.00 to bob@example.com");

        let kinds: Vec<EntityKind> = extraction.entities.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EntityKind::Amount, EntityKind::Email]);
        assert_eq!(extraction.template_text, "Send {AMOUNT} to {EMAIL}");
    }

    #[test]
    fn test_no_entities() {
        let extraction = extract("summarise the report");
        assert!(extraction.entities.is_empty());
        assert_eq!(extraction.template_text, "summarise the report");
    }

    #[test]
    fn test_placeholders_in() {
        assert_eq!(
            placeholders_in("{LOCATION} on {DATE_2} {UNKNOWN}"),
            vec!["{LOCATION}", "{DATE_2}"]
        );
    }

    #[test]
    fn test_slot_signature_tracks_roles() {
        let outbound = extract("Fly from Paris to Tokyo");
        let reversed = extract("Fly to Paris from Tokyo");

        // Same words, same placeholders, opposite roles
        assert_eq!(
            slot_signature(&outbound.template_text),
            vec!["from {LOCATION}", "to {LOCATION_2}"]
        );
        assert_eq!(
            slot_signature(&reversed.template_text),
            vec!["to {LOCATION}", "from {LOCATION_2}"]
        );
        assert_eq!(slot_signature("{DATE}: standup"), vec!["{DATE}"]);
        assert!(slot_signature("summarise the report").is_empty());
    }
}
