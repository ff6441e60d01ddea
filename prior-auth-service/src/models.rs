use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known patient fact names consulted by the criteria rules.
pub mod facts {
    pub const HAS_GENETIC_COUNSELING: &str = "has_genetic_counseling";
    pub const HAS_FAMILY_HISTORY: &str = "has_family_history";
    pub const HAS_CLINICAL_INDICATION: &str = "has_clinical_indication";
    pub const PROVIDER_CREDENTIALS_VALID: &str = "provider_credentials_valid";
    pub const PATIENT_STATE: &str = "patient_state";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fact {
    Flag(bool),
    Number(f64),
    Text(String),
}

/// Named facts about the patient. Unknown names are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientContext(BTreeMap<String, Fact>);

impl PatientContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.0.insert(name.into(), Fact::Flag(value));
        self
    }

    pub fn with_text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), Fact::Text(value.into()));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, fact: Fact) {
        self.0.insert(name.into(), fact);
    }

    /// Boolean view of a fact. Text values "true"/"yes" and "false"/"no" are accepted.
    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.0.get(name)? {
            Fact::Flag(value) => Some(*value),
            Fact::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" => Some(true),
                "false" | "no" | "n" => Some(false),
                _ => None,
            },
            Fact::Number(_) => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.0.get(name)? {
            Fact::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    /// Returns a copy with `other`'s facts layered on top.
    pub fn overlay(&self, other: &PatientContext) -> PatientContext {
        let mut merged = self.0.clone();
        for (name, fact) in &other.0 {
            merged.insert(name.clone(), fact.clone());
        }
        PatientContext(merged)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jurisdiction {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub website: Option<String>,
}

/// A prior-authorization case as submitted. Never mutated after submission;
/// facts supplied during a pause are layered on in the workflow context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    pub procedure_code: String,
    pub payer: String,
    #[serde(default)]
    pub service_category: String,
    #[serde(default)]
    pub patient_context: PatientContext,
    #[serde(default)]
    pub jurisdiction: Option<Jurisdiction>,
}

/// Submission payload for a new case; the id is assigned on acceptance.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCase {
    pub procedure_code: String,
    pub payer: String,
    #[serde(default)]
    pub service_category: String,
    #[serde(default)]
    pub patient_context: PatientContext,
    #[serde(default)]
    pub jurisdiction: Option<Jurisdiction>,
}

impl NewCase {
    pub fn into_case(self) -> Case {
        Case {
            id: Uuid::new_v4().to_string(),
            procedure_code: self.procedure_code.trim().to_string(),
            payer: self.payer.trim().to_string(),
            service_category: self.service_category.trim().to_string(),
            patient_context: self.patient_context,
            jurisdiction: self.jurisdiction,
        }
    }
}

impl Case {
    pub fn new(
        procedure_code: impl Into<String>,
        payer: impl Into<String>,
        service_category: impl Into<String>,
    ) -> Self {
        NewCase {
            procedure_code: procedure_code.into(),
            payer: payer.into(),
            service_category: service_category.into(),
            patient_context: PatientContext::default(),
            jurisdiction: None,
        }
        .into_case()
    }

    pub fn with_patient_context(mut self, context: PatientContext) -> Self {
        self.patient_context = context;
        self
    }

    pub fn with_jurisdiction(mut self, jurisdiction: Jurisdiction) -> Self {
        self.jurisdiction = Some(jurisdiction);
        self
    }

    /// Checks the fields every stage relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("case id must not be empty".to_string());
        }
        if self.procedure_code.trim().is_empty() {
            return Err("procedure_code must not be empty".to_string());
        }
        if self.payer.trim().is_empty() {
            return Err("payer must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    PolicyDocument,
    CoverageDetermination,
    Ncd,
    Lcd,
    Lca,
    ClinicalGuideline,
    Regulatory,
    #[serde(other)]
    Other,
}

/// Where a document sits in the national/local precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyTier {
    National,
    Local,
    General,
}

impl DocumentCategory {
    pub fn from_label(label: &str) -> Self {
        let normalized: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "policy_document" | "policy" | "medical_policy" => Self::PolicyDocument,
            "coverage_determination" => Self::CoverageDetermination,
            "ncd" | "national_coverage_determination" => Self::Ncd,
            "lcd" | "local_coverage_determination" => Self::Lcd,
            "lca" | "local_coverage_article" => Self::Lca,
            "clinical_guideline" | "guideline" => Self::ClinicalGuideline,
            "regulatory" | "regulatory_approval" => Self::Regulatory,
            _ => Self::Other,
        }
    }

    /// Categories worth a deep read during extraction.
    pub fn is_extractable(self) -> bool {
        matches!(
            self,
            Self::PolicyDocument | Self::CoverageDetermination | Self::Ncd | Self::Lcd | Self::Lca
        )
    }

    pub fn tier(self) -> PolicyTier {
        match self {
            Self::Ncd => PolicyTier::National,
            Self::Lcd | Self::Lca => PolicyTier::Local,
            _ => PolicyTier::General,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(rename = "type")]
    pub category: DocumentCategory,
    /// Clamped to 0..=100.
    pub relevance: u8,
    #[serde(default)]
    pub source: String,
}

impl SearchResult {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        category: DocumentCategory,
        relevance: i64,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: String::new(),
            category,
            relevance: clamp_relevance(relevance),
            source: String::new(),
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

pub fn clamp_relevance(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageStatus {
    Covered,
    NotCovered,
    PriorAuthorizationRequired,
    Unknown,
}

impl CoverageStatus {
    pub fn from_label(label: &str) -> Self {
        let lowered = label.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        if lowered.contains("prior auth") || lowered.contains("authorization required") {
            Self::PriorAuthorizationRequired
        } else if lowered.contains("not covered") || lowered.contains("non covered") {
            Self::NotCovered
        } else if lowered.contains("covered") {
            Self::Covered
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for CoverageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Covered => "covered",
            Self::NotCovered => "not covered",
            Self::PriorAuthorizationRequired => "prior authorization required",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub source: String,
    pub document_type: DocumentCategory,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub evidence_basis: String,
    #[serde(default)]
    pub clinical_criteria: Vec<String>,
    pub coverage_status: CoverageStatus,
    #[serde(default)]
    pub applicable_codes: Vec<String>,
    #[serde(default)]
    pub documentation_needed: Vec<String>,
    #[serde(default)]
    pub limitations: Vec<String>,
    #[serde(default)]
    pub effective_date: Option<NaiveDate>,
    #[serde(default)]
    pub revision_date: Option<NaiveDate>,
}

impl PolicyDocument {
    /// Minimal document built from the search hit when the deep read is unusable.
    pub fn fallback_for(result: &SearchResult) -> Self {
        Self {
            title: result.title.clone(),
            url: result.url.clone(),
            source: result.source.clone(),
            document_type: result.category,
            requirements: vec!["Standard medical necessity criteria apply".to_string()],
            evidence_basis: "Based on clinical studies and medical literature".to_string(),
            clinical_criteria: vec!["Appropriate clinical indication".to_string()],
            coverage_status: CoverageStatus::PriorAuthorizationRequired,
            applicable_codes: Vec::new(),
            documentation_needed: vec!["Clinical documentation".to_string()],
            limitations: vec!["Standard policy limitations apply".to_string()],
            effective_date: None,
            revision_date: None,
        }
    }

    pub fn addresses_code(&self, code: &str) -> bool {
        let code = code.trim();
        if code.is_empty() {
            return false;
        }
        self.applicable_codes
            .iter()
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(code))
            || self.title.to_ascii_lowercase().contains(&code.to_ascii_lowercase())
    }

    /// Tier from the declared type, falling back to the title wording.
    pub fn tier(&self) -> PolicyTier {
        match self.document_type.tier() {
            PolicyTier::General => {
                let title = self.title.to_ascii_lowercase();
                if title.contains("national coverage determination") || title.contains("ncd") {
                    PolicyTier::National
                } else if title.contains("local coverage") || title.contains("lcd") || title.contains("lca") {
                    PolicyTier::Local
                } else {
                    PolicyTier::General
                }
            }
            tier => tier,
        }
    }
}

/// Lenient date parsing; anything unrecognized (e.g. "N/A") becomes `None`.
pub fn parse_policy_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%B %d, %Y", "%b %d, %Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub requirement_type: String,
    pub description: String,
    #[serde(default)]
    pub evidence_basis: String,
    #[serde(default)]
    pub documentation_needed: Vec<String>,
    #[serde(default)]
    pub clinical_criteria: Vec<String>,
    #[serde(default)]
    pub source_document: String,
    pub confidence_score: f64,
}

/// Requirement type to met/unmet. A type that is absent counts as unmet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CriteriaMatch(BTreeMap<String, bool>);

impl CriteriaMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, requirement_type: impl Into<String>, met: bool) {
        self.0.insert(requirement_type.into(), met);
    }

    pub fn is_met(&self, requirement_type: &str) -> bool {
        self.0.get(requirement_type).copied().unwrap_or(false)
    }

    pub fn get(&self, requirement_type: &str) -> Option<bool> {
        self.0.get(requirement_type).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, bool)> for CriteriaMatch {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageAnalysis {
    pub coverage_status: CoverageStatus,
    pub coverage_details: String,
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub criteria_match: CriteriaMatch,
    pub confidence_score: f64,
    #[serde(default)]
    pub sources: Vec<SearchResult>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub ncd_applicable: bool,
    #[serde(default)]
    pub lcd_applicable: bool,
}

/// Outcome of the external request validation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestValidation {
    pub is_valid: bool,
    #[serde(default)]
    pub missing_documents: Vec<String>,
    #[serde(default)]
    pub clinician_message: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Paused {
        clinician_message: String,
        missing_documents: Vec<String>,
    },
    Completed,
    Failed {
        reason: String,
    },
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. } | Self::Cancelled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused { .. } => "paused",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Point-in-time view of a case handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseStatus {
    pub case_id: String,
    #[serde(flatten)]
    pub state: WorkflowState,
    pub progress: u8,
    pub message: String,
    pub degraded: bool,
    pub updated_at: DateTime<Utc>,
}

/// Final artifact of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorAuthSubmission {
    pub case_id: String,
    pub procedure_code: String,
    pub payer: String,
    pub service_category: String,
    pub coverage_status: CoverageStatus,
    pub requirements_met: Vec<String>,
    pub supporting_documents: Vec<String>,
    pub recommendations: Vec<String>,
    pub confidence_score: f64,
    pub prepared_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_labels_are_lenient() {
        assert_eq!(DocumentCategory::from_label("NCD"), DocumentCategory::Ncd);
        assert_eq!(
            DocumentCategory::from_label("coverage determination"),
            DocumentCategory::CoverageDetermination
        );
        assert_eq!(DocumentCategory::from_label("press release"), DocumentCategory::Other);

        let parsed: DocumentCategory = serde_json::from_str("\"blog_post\"").unwrap();
        assert_eq!(parsed, DocumentCategory::Other);
    }

    #[test]
    fn test_relevance_is_clamped() {
        assert_eq!(SearchResult::new("a", "b", DocumentCategory::Lcd, 250).relevance, 100);
        assert_eq!(SearchResult::new("a", "b", DocumentCategory::Lcd, -4).relevance, 0);
    }

    #[test]
    fn test_policy_dates_parse_leniently() {
        assert_eq!(
            parse_policy_date("2024-01-15"),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(
            parse_policy_date("03/01/2023"),
            NaiveDate::from_ymd_opt(2023, 3, 1)
        );
        assert_eq!(parse_policy_date("N/A"), None);
    }

    #[test]
    fn test_coverage_status_from_label() {
        assert_eq!(
            CoverageStatus::from_label("Prior Authorization Required"),
            CoverageStatus::PriorAuthorizationRequired
        );
        assert_eq!(CoverageStatus::from_label("not covered"), CoverageStatus::NotCovered);
        assert_eq!(CoverageStatus::from_label("Covered"), CoverageStatus::Covered);
        assert_eq!(CoverageStatus::from_label("???"), CoverageStatus::Unknown);
    }

    #[test]
    fn test_overlay_prefers_supplied_facts() {
        let base = PatientContext::new()
            .with_flag(facts::HAS_GENETIC_COUNSELING, false)
            .with_text(facts::PATIENT_STATE, "OH");
        let supplied = PatientContext::new().with_flag(facts::HAS_GENETIC_COUNSELING, true);

        let merged = base.overlay(&supplied);
        assert_eq!(merged.flag(facts::HAS_GENETIC_COUNSELING), Some(true));
        assert_eq!(merged.text(facts::PATIENT_STATE), Some("OH"));
        assert_eq!(base.flag(facts::HAS_GENETIC_COUNSELING), Some(false));
    }

    #[test]
    fn test_missing_criteria_count_as_unmet() {
        let mut criteria = CriteriaMatch::new();
        criteria.set("Provider credentials", true);
        assert!(criteria.is_met("Provider credentials"));
        assert!(!criteria.is_met("Genetic counseling"));
    }

    #[test]
    fn test_case_validation() {
        assert!(Case::new("81162", "Medicare", "genetic testing").validate().is_ok());
        assert!(Case::new("  ", "Medicare", "").validate().is_err());
        assert!(Case::new("81162", "", "").validate().is_err());
    }
}
