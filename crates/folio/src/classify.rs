//! Classification engine
//!
//! Pure function from metadata (plus optional enrichment) to a label. Rules
//! are walked in the rule set's evaluation order; the first match decides the
//! label and every later match that agrees adds a corroboration bonus.

use crate::document::DocumentMetadata;
use crate::enrichment::EnrichmentData;
use crate::rules::{ConflictPolicy, Label, Predicate, Rule, RuleSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: Label,
    pub confidence: f64,
    /// Ids of the rules supporting `label`, in evaluation order.
    pub reasons: Vec<String>,
    pub metadata: DocumentMetadata,
}

/// Lower-cased views of the metadata that predicates match against.
struct MatchContext<'a> {
    title_text: String,
    file_name: String,
    credit_text: String,
    chapter_count: u32,
    enrichment: Option<&'a EnrichmentData>,
}

impl<'a> MatchContext<'a> {
    fn new(metadata: &DocumentMetadata, enrichment: Option<&'a EnrichmentData>) -> Self {
        let title = metadata.title.as_deref().unwrap_or("");
        let author = metadata.author.as_deref().unwrap_or("");
        Self {
            title_text: format!("{} {}", metadata.file_stem(), title).to_lowercase(),
            file_name: metadata.file_name.to_lowercase(),
            credit_text: format!("{} {}", author, title).to_lowercase(),
            chapter_count: metadata.chapter_count,
            enrichment,
        }
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|needle| haystack.contains(needle.to_lowercase().as_str()))
}

impl Predicate {
    fn matches(&self, ctx: &MatchContext<'_>) -> bool {
        match self {
            Predicate::TitleContains { keywords } => contains_any(&ctx.title_text, keywords),
            Predicate::FileNameContains { keywords } => contains_any(&ctx.file_name, keywords),
            Predicate::TranslatorCredit { markers } => contains_any(&ctx.credit_text, markers),
            Predicate::ChapterCountAtLeast { min } => ctx.chapter_count >= *min,
            Predicate::ChapterCountAtMost { max } => ctx.chapter_count <= *max,
            Predicate::EnrichmentSuggests { label } => ctx
                .enrichment
                .and_then(|data| data.translation_hint)
                .map(|hint| hint == *label)
                .unwrap_or(false),
        }
    }
}

/// Classify one document against `rules`.
pub fn classify(
    metadata: &DocumentMetadata,
    rules: &RuleSet,
    enrichment: Option<&EnrichmentData>,
) -> ClassificationResult {
    let ctx = MatchContext::new(metadata, enrichment);
    let matched: Vec<&Rule> = rules
        .rules()
        .iter()
        .filter(|rule| rule.predicate.matches(&ctx))
        .collect();

    let Some(winner) = matched.first() else {
        return unclassified(metadata, Vec::new());
    };

    let conflicting = matched.iter().any(|rule| rule.label != winner.label);
    if conflicting && rules.conflict_policy == ConflictPolicy::Unclassified {
        tracing::debug!(
            file = %metadata.file_name,
            matched = matched.len(),
            "Competing labels; leaving unclassified"
        );
        return unclassified(metadata, matched.iter().map(|r| r.id.clone()).collect());
    }

    let reasons: Vec<String> = matched
        .iter()
        .filter(|rule| rule.label == winner.label)
        .map(|rule| rule.id.clone())
        .collect();
    let corroborating = reasons.len().saturating_sub(1) as f64;
    let raw = winner.base_confidence + rules.corroboration_bonus * corroborating;
    let confidence = round4(raw.min(rules.confidence_cap));

    ClassificationResult {
        label: winner.label,
        confidence,
        reasons,
        metadata: metadata.clone(),
    }
}

fn unclassified(metadata: &DocumentMetadata, reasons: Vec<String>) -> ClassificationResult {
    ClassificationResult {
        label: Label::Unclassified,
        confidence: 0.0,
        reasons,
        metadata: metadata.clone(),
    }
}

/// Round to four decimals so summed bonuses print stably.
fn round4(value: f64) -> f64 {
    (value.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::default_rules;

    fn meta(file_name: &str, title: Option<&str>) -> DocumentMetadata {
        DocumentMetadata {
            file_name: file_name.to_string(),
            title: title.map(str::to_string),
            author: None,
            chapter_count: 100,
            file_size_bytes: 1024,
            content_hash: String::new(),
        }
    }

    fn scenario_rules() -> RuleSet {
        RuleSet::with_rules(vec![
            Rule::new(
                "rule-dich",
                Label::HumanTranslation,
                0.9,
                Predicate::TitleContains {
                    keywords: vec!["dịch".to_string()],
                },
            ),
            Rule::new(
                "rule-convert",
                Label::MachineConverted,
                0.8,
                Predicate::TitleContains {
                    keywords: vec!["convert".to_string()],
                },
            ),
        ])
    }

    #[test]
    fn test_three_file_scenario() {
        let rules = scenario_rules();

        let a = classify(&meta("a.epub", Some("Tiên Nghịch (bản dịch)")), &rules, None);
        assert_eq!(a.label, Label::HumanTranslation);
        assert_eq!(a.confidence, 0.9);
        assert_eq!(a.reasons, vec!["rule-dich"]);

        let b = classify(&meta("b.epub", Some("Plain Title")), &rules, None);
        assert_eq!(b.label, Label::Unclassified);
        assert_eq!(b.confidence, 0.0);
        assert!(b.reasons.is_empty());

        let c = classify(&meta("c.epub", Some("Bản dịch từ convert")), &rules, None);
        assert_eq!(c.label, Label::HumanTranslation);
        assert_eq!(c.confidence, 0.9);
        assert_eq!(c.reasons, vec!["rule-dich"]);
    }

    #[test]
    fn test_matching_is_case_insensitive_and_uses_file_stem() {
        let rules = scenario_rules();
        let result = classify(&meta("Vo Luyen CONVERT.epub", None), &rules, None);
        assert_eq!(result.label, Label::MachineConverted);
    }

    #[test]
    fn test_unclassified_policy_on_conflict() {
        let mut rules = scenario_rules();
        rules.conflict_policy = ConflictPolicy::Unclassified;
        let result = classify(&meta("c.epub", Some("dịch convert")), &rules, None);
        assert_eq!(result.label, Label::Unclassified);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_confidence_grows_with_corroboration_and_is_capped() {
        let rules = RuleSet::with_rules(vec![
            Rule::new(
                "kw",
                Label::HumanTranslation,
                0.85,
                Predicate::TitleContains {
                    keywords: vec!["dịch".to_string()],
                },
            ),
            Rule::new(
                "credit",
                Label::HumanTranslation,
                0.8,
                Predicate::TranslatorCredit {
                    markers: vec!["dịch giả".to_string()],
                },
            ),
            Rule::new(
                "hint",
                Label::HumanTranslation,
                0.7,
                Predicate::EnrichmentSuggests {
                    label: Label::HumanTranslation,
                },
            ),
        ]);

        let mut m = meta("x.epub", Some("Truyện dịch"));
        let one = classify(&m, &rules, None);
        assert_eq!(one.confidence, 0.85);

        m.author = Some("Dịch giả: Minh".to_string());
        let two = classify(&m, &rules, None);
        assert_eq!(two.confidence, 0.9);
        assert_eq!(two.reasons, vec!["kw", "credit"]);

        let hint = EnrichmentData {
            translation_hint: Some(Label::HumanTranslation),
            ..EnrichmentData::default()
        };
        let three = classify(&m, &rules, Some(&hint));
        assert_eq!(three.confidence, 0.95);
        assert_eq!(three.reasons, vec!["kw", "credit", "hint"]);

        let mut capped = rules.clone();
        capped.confidence_cap = 0.9;
        assert_eq!(classify(&m, &capped, Some(&hint)).confidence, 0.9);
    }

    #[test]
    fn test_enrichment_only_adds_reasons() {
        let rules = RuleSet::default();
        let m = meta("Kiếm Lai convert.epub", Some("Kiếm Lai"));
        let without = classify(&m, &rules, None);
        let hint = EnrichmentData {
            translation_hint: Some(Label::MachineConverted),
            ..EnrichmentData::default()
        };
        let with = classify(&m, &rules, Some(&hint));

        assert_eq!(without.label, Label::MachineConverted);
        assert_eq!(with.label, without.label);
        assert!(with.confidence >= without.confidence);
        assert_eq!(with.reasons[..without.reasons.len()], without.reasons[..]);
    }

    #[test]
    fn test_default_rules_prefer_machine_phrase() {
        let rules = RuleSet::with_rules(default_rules());
        let result = classify(&meta("x.epub", Some("Bản dịch máy")), &rules, None);
        assert_eq!(result.label, Label::MachineConverted);
        assert_eq!(result.reasons, vec!["machine-keywords"]);
    }

    #[test]
    fn test_deterministic() {
        let rules = RuleSet::default();
        let m = meta("Đế Bá dịch.epub", Some("Đế Bá - Translated by Team"));
        assert_eq!(classify(&m, &rules, None), classify(&m, &rules, None));
    }
}
