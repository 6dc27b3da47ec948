//! Classification rules
//!
//! A rule pairs a typed predicate with the label it votes for. Rules are kept
//! in evaluation order: priority descending, then declaration order.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Translation label assigned to a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    HumanTranslation,
    MachineConverted,
    Unclassified,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::HumanTranslation => "human_translation",
            Label::MachineConverted => "machine_converted",
            Label::Unclassified => "unclassified",
        }
    }

    /// Name used for the organizer's output folder and the human report.
    pub fn display_name(&self) -> &'static str {
        match self {
            Label::HumanTranslation => "Human Translation",
            Label::MachineConverted => "Machine Converted",
            Label::Unclassified => "Unclassified",
        }
    }

    pub fn is_definite(&self) -> bool {
        !matches!(self, Label::Unclassified)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How competing labels among matched rules are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The earliest matching rule in evaluation order decides.
    #[default]
    FirstMatch,
    /// Any disagreement yields `Unclassified`.
    Unclassified,
}

/// What a rule tests. Keyword matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Any keyword occurs in `file stem + " " + title`.
    TitleContains { keywords: Vec<String> },
    /// Any keyword occurs in the file name.
    FileNameContains { keywords: Vec<String> },
    /// A translator credit marker occurs in the author or title.
    TranslatorCredit { markers: Vec<String> },
    ChapterCountAtLeast { min: u32 },
    ChapterCountAtMost { max: u32 },
    /// Enrichment data carries this translation hint.
    EnrichmentSuggests { label: Label },
}

/// A single classification rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub label: Label,
    pub base_confidence: f64,
    #[serde(default)]
    pub priority: i32,
    #[serde(flatten)]
    pub predicate: Predicate,
}

impl Rule {
    pub fn new(id: &str, label: Label, base_confidence: f64, predicate: Predicate) -> Self {
        Self {
            id: id.to_string(),
            label,
            base_confidence,
            priority: 0,
            predicate,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Rules in evaluation order plus the policy used to combine them
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
    pub conflict_policy: ConflictPolicy,
    pub corroboration_bonus: f64,
    pub confidence_cap: f64,
}

impl RuleSet {
    pub fn new(
        mut rules: Vec<Rule>,
        conflict_policy: ConflictPolicy,
        corroboration_bonus: f64,
        confidence_cap: f64,
    ) -> Self {
        // sort_by_key is stable: equal priorities keep declaration order.
        rules.sort_by_key(|rule| std::cmp::Reverse(rule.priority));
        Self {
            rules,
            conflict_policy,
            corroboration_bonus,
            confidence_cap,
        }
    }

    /// Rules with the default combination policy.
    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self::new(rules, ConflictPolicy::FirstMatch, 0.05, 0.99)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::with_rules(default_rules())
    }
}

fn words(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Built-in keyword heuristics for Vietnamese web-novel EPUBs.
///
/// The machine rule is declared first: "dịch máy" also contains "dịch".
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "machine-keywords",
            Label::MachineConverted,
            0.85,
            Predicate::TitleContains {
                keywords: words(&[
                    "convert",
                    "converted",
                    "mtl",
                    "machine translation",
                    "auto translate",
                    "google translate",
                    "dịch máy",
                ]),
            },
        ),
        Rule::new(
            "human-keywords",
            Label::HumanTranslation,
            0.85,
            Predicate::TitleContains {
                keywords: words(&[
                    "dịch",
                    "dich",
                    "translated",
                    "human translation",
                    "dịch bởi",
                    "dich boi",
                    "translator",
                    "dịch giả",
                ]),
            },
        ),
        Rule::new(
            "translator-credit",
            Label::HumanTranslation,
            0.8,
            Predicate::TranslatorCredit {
                markers: words(&["dịch giả", "người dịch", "dịch bởi", "translated by", "translator"]),
            },
        ),
        Rule::new(
            "enrichment-machine",
            Label::MachineConverted,
            0.7,
            Predicate::EnrichmentSuggests {
                label: Label::MachineConverted,
            },
        ),
        Rule::new(
            "enrichment-human",
            Label::HumanTranslation,
            0.7,
            Predicate::EnrichmentSuggests {
                label: Label::HumanTranslation,
            },
        ),
        Rule::new(
            "bulk-chapters",
            Label::MachineConverted,
            0.6,
            Predicate::ChapterCountAtLeast { min: 1500 },
        ),
    ]
}

/// Reject rule sets that cannot be evaluated meaningfully.
pub fn validate_rules(rules: &[Rule]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for rule in rules {
        if rule.id.trim().is_empty() {
            return Err("rule id must not be empty".to_string());
        }
        if !seen.insert(rule.id.as_str()) {
            return Err(format!("duplicate rule id '{}'", rule.id));
        }
        if !(0.0..=1.0).contains(&rule.base_confidence) {
            return Err(format!(
                "rule '{}': base_confidence must be within [0, 1], got {}",
                rule.id, rule.base_confidence
            ));
        }
        if !rule.label.is_definite() {
            return Err(format!("rule '{}': label must not be unclassified", rule.id));
        }
        match &rule.predicate {
            Predicate::TitleContains { keywords: list }
            | Predicate::FileNameContains { keywords: list }
            | Predicate::TranslatorCredit { markers: list } => {
                if list.is_empty() || list.iter().any(|k| k.trim().is_empty()) {
                    return Err(format!("rule '{}': keywords must be non-empty", rule.id));
                }
            }
            Predicate::EnrichmentSuggests { label } if !label.is_definite() => {
                return Err(format!(
                    "rule '{}': enrichment hint must be a definite label",
                    rule.id
                ));
            }
            _ => {}
        }
    }
    Ok(())
}
