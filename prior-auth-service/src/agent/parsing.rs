//! Lenient readers for model output. Models wrap JSON in prose and code fences,
//! or skip JSON entirely, so each reader tries progressively looser shapes.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::capabilities::CoverageDraft;
use crate::error::CapabilityError;
use crate::models::{
    clamp_relevance, parse_policy_date, CoverageStatus, CriteriaMatch, DocumentCategory,
    PolicyDocument, Requirement, RequestValidation, SearchResult,
};
use crate::pipeline::defaults::DEFAULT_REQUIREMENT_CONFIDENCE;

static MARKDOWN_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]]+)\]\((https?://[^)\s]+)\)").expect("markdown link pattern is valid")
});

const BARE_DOMAINS: [&str; 5] = ["cms.gov", "medicare.gov", "fda.gov", "nccn.org", "asco.org"];
const MARKDOWN_BASE_RELEVANCE: i64 = 85;
const DEFAULT_TEXT_RELEVANCE: i64 = 80;

fn strip_fences(text: &str) -> String {
    text.replace("```json", "").replace("```", "")
}

/// Outermost `[...]` slice, if any.
pub fn json_array_slice(text: &str) -> Option<String> {
    let text = strip_fences(text);
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (start < end).then(|| text[start..=end].to_string())
}

/// Outermost `{...}` slice, if any.
pub fn json_object_slice(text: &str) -> Option<String> {
    let text = strip_fences(text);
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| text[start..=end].to_string())
}

fn malformed(what: &str, text: &str) -> CapabilityError {
    let preview: String = text.chars().take(120).collect();
    CapabilityError::Malformed(format!("{what}: {preview}"))
}

#[derive(Debug, Deserialize)]
struct RawSearchHit {
    #[serde(default)]
    title: String,
    #[serde(default, alias = "link")]
    url: String,
    #[serde(default, alias = "description")]
    snippet: String,
    #[serde(default, alias = "relevance_score", alias = "score")]
    relevance: Option<Value>,
    #[serde(default, rename = "type", alias = "category")]
    kind: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

fn relevance_of(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .unwrap_or(DEFAULT_TEXT_RELEVANCE),
        Some(Value::String(s)) => s
            .trim()
            .trim_end_matches('%')
            .parse()
            .unwrap_or(DEFAULT_TEXT_RELEVANCE),
        _ => DEFAULT_TEXT_RELEVANCE,
    }
}

/// Search hits from a model reply: a JSON array, else markdown links, else
/// `Title:`/`URL:` blocks. Replies with none of these yield no hits.
pub fn parse_search_results(text: &str, query: &str) -> Vec<SearchResult> {
    if let Some(slice) = json_array_slice(text) {
        let cleaned = MARKDOWN_LINK.replace_all(&slice, "$1");
        if let Ok(hits) = serde_json::from_str::<Vec<RawSearchHit>>(&cleaned) {
            return hits
                .into_iter()
                .filter(|hit| !hit.url.trim().is_empty() || !hit.title.trim().is_empty())
                .map(|hit| SearchResult {
                    title: hit.title.trim().to_string(),
                    url: hit.url.trim().to_string(),
                    snippet: hit.snippet,
                    category: hit
                        .kind
                        .as_deref()
                        .map(DocumentCategory::from_label)
                        .unwrap_or(DocumentCategory::PolicyDocument),
                    relevance: clamp_relevance(relevance_of(hit.relevance.as_ref())),
                    source: hit.source.unwrap_or_default(),
                })
                .collect();
        }
    }

    let linked = parse_markdown_links(text, query);
    if !linked.is_empty() {
        return linked;
    }
    parse_labelled_blocks(text)
}

fn parse_markdown_links(text: &str, query: &str) -> Vec<SearchResult> {
    MARKDOWN_LINK
        .captures_iter(text)
        .filter_map(|caps| {
            let title = caps.get(1)?.as_str().trim();
            let url = caps.get(2)?.as_str().trim();
            if BARE_DOMAINS.contains(&title.to_ascii_lowercase().as_str()) {
                return None;
            }
            Some((title.to_string(), url.to_string()))
        })
        .enumerate()
        .map(|(i, (title, url))| {
            SearchResult::new(
                title,
                url,
                DocumentCategory::PolicyDocument,
                MARKDOWN_BASE_RELEVANCE - 5 * i as i64,
            )
            .with_snippet(format!("Policy document related to {query}"))
            .with_source("web search")
        })
        .collect()
}

fn parse_labelled_blocks(text: &str) -> Vec<SearchResult> {
    let mut results = Vec::new();
    let mut current: Option<SearchResult> = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match label.trim().to_ascii_lowercase().as_str() {
            "title" | "name" => {
                if let Some(done) = current.take() {
                    results.push(done);
                }
                current = Some(SearchResult::new(
                    value,
                    "",
                    DocumentCategory::PolicyDocument,
                    DEFAULT_TEXT_RELEVANCE,
                ));
            }
            "url" | "link" => {
                if let Some(result) = current.as_mut() {
                    result.url = value.to_string();
                }
            }
            "snippet" | "description" => {
                if let Some(result) = current.as_mut() {
                    result.snippet = value.to_string();
                }
            }
            "relevance" | "score" => {
                if let Some(result) = current.as_mut() {
                    let parsed = value.trim_end_matches('%').trim().parse().unwrap_or(DEFAULT_TEXT_RELEVANCE);
                    result.relevance = clamp_relevance(parsed);
                }
            }
            "type" | "category" => {
                if let Some(result) = current.as_mut() {
                    result.category = DocumentCategory::from_label(value);
                }
            }
            "source" | "provider" => {
                if let Some(result) = current.as_mut() {
                    result.source = value.to_string();
                }
            }
            _ => {}
        }
    }
    results.extend(current);
    results.retain(|r| !r.url.is_empty());
    results
}

/// Accepts a string or a list of strings.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(map) => map
                    .get("requirement")
                    .or_else(|| map.get("description"))
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn text_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Structured reading of one document. The search hit supplies anything the
/// model left out.
pub fn parse_policy_document(text: &str, result: &SearchResult) -> Result<PolicyDocument, CapabilityError> {
    let mut document = PolicyDocument::fallback_for(result);
    document.requirements.clear();
    document.clinical_criteria.clear();
    document.documentation_needed.clear();

    let parsed = json_object_slice(text)
        .and_then(|slice| serde_json::from_str::<serde_json::Map<String, Value>>(&slice).ok());

    match parsed {
        Some(map) => {
            if let Some(title) = text_field(&map, "title") {
                document.title = title;
            }
            if let Some(source) = text_field(&map, "source") {
                document.source = source;
            }
            if let Some(kind) = text_field(&map, "document_type") {
                let category = DocumentCategory::from_label(&kind);
                if category != DocumentCategory::Other {
                    document.document_type = category;
                }
            }
            document.requirements = string_list(map.get("requirements"));
            document.clinical_criteria = string_list(map.get("clinical_criteria"));
            document.documentation_needed = string_list(map.get("documentation_needed"));
            document.limitations = string_list(map.get("limitations"));
            document.applicable_codes = string_list(
                map.get("applicable_codes")
                    .or_else(|| map.get("cpt_codes"))
                    .or_else(|| map.get("codes")),
            );
            if let Some(basis) = text_field(&map, "evidence_basis") {
                document.evidence_basis = basis;
            }
            if let Some(status) = text_field(&map, "coverage_status") {
                document.coverage_status = CoverageStatus::from_label(&status);
            }
            document.effective_date = text_field(&map, "effective_date").and_then(|d| parse_policy_date(&d));
            document.revision_date = text_field(&map, "revision_date").and_then(|d| parse_policy_date(&d));
            Ok(document)
        }
        None => {
            document.requirements = bulleted_section(text, "requirements");
            document.clinical_criteria = bulleted_section(text, "criteria");
            if document.requirements.is_empty() {
                return Err(malformed("policy document reply had no structure", text));
            }
            Ok(document)
        }
    }
}

/// Dash bullets following the first `...<heading>...:` line, up to a blank line.
fn bulleted_section(text: &str, heading: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut inside = false;
    for line in text.lines().map(str::trim) {
        if !inside {
            inside = line.to_lowercase().contains(heading) && line.contains(':');
            continue;
        }
        if line.is_empty() {
            break;
        }
        if let Some(item) = line.strip_prefix('-').or_else(|| line.strip_prefix('*')) {
            let item = item.trim();
            if !item.is_empty() {
                items.push(item.to_string());
            }
        }
    }
    items
}

#[derive(Debug, Default, Deserialize)]
struct RawRequirement {
    #[serde(default, alias = "requirement", alias = "type")]
    requirement_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    evidence_basis: String,
    #[serde(default)]
    documentation_needed: Value,
    #[serde(default)]
    clinical_criteria: Value,
    #[serde(default)]
    source_document: String,
    #[serde(default)]
    confidence_score: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMedicareFlags {
    #[serde(default)]
    ncd_applicable: Option<bool>,
    #[serde(default)]
    lcd_applicable: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCoverage {
    #[serde(default)]
    coverage_status: Option<String>,
    #[serde(default)]
    coverage_details: Option<String>,
    #[serde(default)]
    requirements: Vec<RawRequirement>,
    #[serde(default)]
    confidence_score: Option<f64>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    ncd_applicable: Option<bool>,
    #[serde(default)]
    lcd_applicable: Option<bool>,
    #[serde(default)]
    medicare_specific: Option<RawMedicareFlags>,
}

pub fn parse_coverage_draft(text: &str) -> Result<CoverageDraft, CapabilityError> {
    let raw: RawCoverage = json_object_slice(text)
        .and_then(|slice| serde_json::from_str(&slice).ok())
        .ok_or_else(|| malformed("coverage reply was not a JSON object", text))?;

    let flags = raw.medicare_specific.unwrap_or_default();
    let requirements = raw
        .requirements
        .into_iter()
        .filter(|r| !r.requirement_type.trim().is_empty())
        .map(|r| Requirement {
            description: if r.description.trim().is_empty() {
                format!("Requirement for {}", r.requirement_type.trim().to_lowercase())
            } else {
                r.description
            },
            requirement_type: r.requirement_type.trim().to_string(),
            evidence_basis: r.evidence_basis,
            documentation_needed: string_list(Some(&r.documentation_needed)),
            clinical_criteria: string_list(Some(&r.clinical_criteria)),
            source_document: r.source_document,
            confidence_score: r
                .confidence_score
                .unwrap_or(DEFAULT_REQUIREMENT_CONFIDENCE)
                .clamp(0.0, 1.0),
        })
        .collect();

    Ok(CoverageDraft {
        coverage_status: raw.coverage_status.as_deref().map(CoverageStatus::from_label),
        coverage_details: raw.coverage_details,
        requirements,
        confidence_score: raw.confidence_score,
        recommendations: raw.recommendations,
        ncd_applicable: raw.ncd_applicable.or(flags.ncd_applicable),
        lcd_applicable: raw.lcd_applicable.or(flags.lcd_applicable),
    })
}

fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "met" => Some(true),
            "false" | "no" | "unmet" | "not met" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// `{"<requirement type>": true|false, ...}`; keys that are not requirements are kept as-is.
pub fn parse_criteria(text: &str) -> Result<CriteriaMatch, CapabilityError> {
    let map: BTreeMap<String, Value> = json_object_slice(text)
        .and_then(|slice| serde_json::from_str(&slice).ok())
        .ok_or_else(|| malformed("criteria reply was not a JSON object", text))?;
    Ok(map
        .into_iter()
        .filter_map(|(key, value)| truthy(&value).map(|met| (key, met)))
        .collect())
}

#[derive(Debug, Default, Deserialize)]
struct RawValidationBody {
    #[serde(default)]
    is_valid: Option<bool>,
    #[serde(default)]
    missing_documents: Vec<String>,
    #[serde(default)]
    validation_notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawValidation {
    #[serde(default)]
    request_validation: Option<RawValidationBody>,
    #[serde(default)]
    is_valid: Option<bool>,
    #[serde(default)]
    missing_documents: Vec<String>,
    #[serde(default)]
    clinician_message: Option<String>,
}

/// Accepts both `{"request_validation": {...}, "clinician_message": ...}` and a flat shape.
pub fn parse_validation(text: &str) -> Result<RequestValidation, CapabilityError> {
    let raw: RawValidation = json_object_slice(text)
        .and_then(|slice| serde_json::from_str(&slice).ok())
        .ok_or_else(|| malformed("validation reply was not a JSON object", text))?;

    let body = raw.request_validation.unwrap_or_default();
    let is_valid = body
        .is_valid
        .or(raw.is_valid)
        .ok_or_else(|| malformed("validation reply had no is_valid flag", text))?;
    let mut missing_documents = body.missing_documents;
    missing_documents.extend(raw.missing_documents);

    Ok(RequestValidation {
        is_valid,
        missing_documents,
        clinician_message: raw.clinician_message,
        notes: body.validation_notes,
    })
}

/// A JSON array of strings, else bulleted or numbered lines.
pub fn parse_recommendations(text: &str) -> Vec<String> {
    if let Some(items) = json_array_slice(text).and_then(|slice| serde_json::from_str::<Vec<String>>(&slice).ok()) {
        return items;
    }
    text.lines()
        .map(str::trim)
        .filter(|line| {
            line.starts_with('-')
                || line.starts_with('•')
                || line.chars().next().is_some_and(|c| c.is_ascii_digit())
        })
        .map(|line| {
            line.trim_start_matches(|c: char| c == '-' || c == '•' || c == '.' || c == ')' || c.is_ascii_digit() || c.is_whitespace())
                .trim()
                .to_string()
        })
        .filter(|item| item.len() > 10)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_json_inside_code_fence() {
        let reply = "Here you go:\n```json\n[{\"title\": \"LCD L38974\", \"url\": \"https://cms.gov/l38974\", \"type\": \"lcd\", \"relevance\": 140}]\n```";
        let hits = parse_search_results(reply, "q");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, DocumentCategory::Lcd);
        assert_eq!(hits[0].relevance, 100);
    }

    #[test]
    fn test_search_markdown_links_skip_bare_domains() {
        let reply = "See [cms.gov](https://cms.gov) and [LCD Genetic Testing](https://cms.gov/lcd/1) \
                     plus [NCD 90.2](https://cms.gov/ncd/90.2).";
        let hits = parse_search_results(reply, "Medicare LCD 81162");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "LCD Genetic Testing");
        assert_eq!(hits[0].relevance, 85);
        assert_eq!(hits[1].relevance, 80);
        assert_eq!(hits[0].category, DocumentCategory::PolicyDocument);
    }

    #[test]
    fn test_search_labelled_blocks() {
        let reply = "Title: Aetna Genetic Testing Policy\nURL: https://aetna.com/cpb/0140\nRelevance: 92%\nType: policy_document\n\nTitle: No link here\n";
        let hits = parse_search_results(reply, "q");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].relevance, 92);
    }

    #[test]
    fn test_search_prose_yields_nothing() {
        assert!(parse_search_results("I could not find anything relevant.", "q").is_empty());
    }

    #[test]
    fn test_policy_document_json() {
        let result = SearchResult::new("NCD 90.2", "https://cms.gov/ncd", DocumentCategory::Ncd, 90);
        let reply = r#"{"requirements": ["Genetic counseling"], "cpt_codes": ["81162"],
            "coverage_status": "Covered with prior authorization", "effective_date": "N/A",
            "revision_date": "2024-02-01"}"#;
        let doc = parse_policy_document(reply, &result).unwrap();
        assert_eq!(doc.title, "NCD 90.2");
        assert_eq!(doc.applicable_codes, vec!["81162".to_string()]);
        assert_eq!(doc.coverage_status, CoverageStatus::PriorAuthorizationRequired);
        assert_eq!(doc.effective_date, None);
        assert!(doc.revision_date.is_some());
    }

    #[test]
    fn test_policy_document_bullets_then_malformed() {
        let result = SearchResult::new("LCD", "https://cms.gov/lcd", DocumentCategory::Lcd, 90);
        let bullets = "Key requirements:\n- Genetic counseling\n- Family history\n\nOther text";
        let doc = parse_policy_document(bullets, &result).unwrap();
        assert_eq!(doc.requirements.len(), 2);

        let err = parse_policy_document("Nothing useful", &result).unwrap_err();
        assert!(matches!(err, CapabilityError::Malformed(_)));
    }

    #[test]
    fn test_coverage_draft_nested_flags() {
        let reply = r#"{"coverage_status": "covered", "confidence_score": 0.7,
            "requirements": [{"requirement_type": "Family history", "documentation_needed": "Pedigree"}],
            "medicare_specific": {"ncd_applicable": true}}"#;
        let draft = parse_coverage_draft(reply).unwrap();
        assert_eq!(draft.coverage_status, Some(CoverageStatus::Covered));
        assert_eq!(draft.requirements[0].documentation_needed, vec!["Pedigree".to_string()]);
        assert_eq!(draft.ncd_applicable, Some(true));
        assert_eq!(draft.lcd_applicable, None);
    }

    #[test]
    fn test_criteria_and_validation_shapes() {
        let criteria = parse_criteria(r#"{"Family history": "yes", "Genetic counseling": false}"#).unwrap();
        assert!(criteria.is_met("Family history"));
        assert!(!criteria.is_met("Genetic counseling"));

        let nested = parse_validation(
            r#"{"request_validation": {"is_valid": false, "missing_documents": ["Pedigree"]}, "clinician_message": "Send it"}"#,
        )
        .unwrap();
        assert!(!nested.is_valid);
        assert_eq!(nested.missing_documents, vec!["Pedigree".to_string()]);
        assert_eq!(nested.clinician_message.as_deref(), Some("Send it"));

        assert!(parse_validation(r#"{"missing_documents": []}"#).is_err());
    }

    #[test]
    fn test_recommendations_from_bullets() {
        let reply = "1. Attach the genetic counseling note\n- Too short\n• Verify provider network participation";
        let items = parse_recommendations(reply);
        assert_eq!(
            items,
            vec![
                "Attach the genetic counseling note".to_string(),
                "Verify provider network participation".to_string()
            ]
        );
    }
}
