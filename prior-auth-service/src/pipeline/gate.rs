use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capabilities::CriteriaCapability;
use crate::models::{Case, CoverageAnalysis, CriteriaMatch, PatientContext, PolicyDocument, facts};
use crate::pipeline::criteria::RequirementCategory;

const VALIDATION_UNAVAILABLE_ENTRY: &str = "Policy validation could not be completed; full supporting documentation";
const UNSPECIFIED_VALIDATION_ENTRY: &str = "Additional documentation requested by policy validation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Valid,
    Invalid,
}

/// Whether the case may proceed to submission, and if not, what is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub is_valid: bool,
    pub missing_documents: Vec<String>,
    /// Present exactly when the decision is invalid.
    pub clinician_message: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl GateDecision {
    pub fn valid(notes: Option<String>) -> Self {
        Self {
            is_valid: true,
            missing_documents: Vec::new(),
            clinician_message: None,
            notes,
        }
    }

    pub fn state(&self) -> GateState {
        if self.is_valid {
            GateState::Valid
        } else {
            GateState::Invalid
        }
    }
}

pub struct ValidationGate {
    capability: Arc<dyn CriteriaCapability>,
    timeout: Duration,
    pause_when_unavailable: bool,
}

impl ValidationGate {
    pub fn new(capability: Arc<dyn CriteriaCapability>, timeout: Duration, pause_when_unavailable: bool) -> Self {
        Self {
            capability,
            timeout,
            pause_when_unavailable,
        }
    }

    pub async fn evaluate(
        &self,
        case: &Case,
        analysis: &CoverageAnalysis,
        criteria: &CriteriaMatch,
        documents: &[PolicyDocument],
        context: &PatientContext,
    ) -> GateDecision {
        let mut missing = local_missing_documents(analysis, criteria);
        missing.extend(undocumented_facts(context, &missing));
        let mut external_message = None;
        let mut notes = None;

        let external = if self.capability.is_available() {
            let call = self.capability.validate_request(analysis, documents, context);
            match tokio::time::timeout(self.timeout, call).await {
                Ok(Ok(validation)) => Some(validation),
                Ok(Err(e)) => {
                    warn!(case_id = %case.id, error = %e, "Request validation failed");
                    None
                }
                Err(_) => {
                    warn!(case_id = %case.id, "Request validation timed out");
                    None
                }
            }
        } else {
            None
        };

        match external {
            Some(validation) => {
                notes = validation.notes;
                if !validation.is_valid {
                    if validation.missing_documents.is_empty() {
                        missing.push(UNSPECIFIED_VALIDATION_ENTRY.to_string());
                    }
                    missing.extend(validation.missing_documents);
                    external_message = validation.clinician_message.filter(|m| !m.trim().is_empty());
                }
            }
            None if self.pause_when_unavailable => {
                missing.push(VALIDATION_UNAVAILABLE_ENTRY.to_string());
            }
            None => {}
        }

        let missing = dedupe(missing);
        if missing.is_empty() {
            info!(case_id = %case.id, "Validation gate passed");
            return GateDecision::valid(notes);
        }

        info!(case_id = %case.id, missing = missing.len(), "Validation gate requires clinician input");
        let message = external_message.unwrap_or_else(|| clinician_message(case, &missing));
        GateDecision {
            is_valid: false,
            missing_documents: missing,
            clinician_message: Some(message),
            notes,
        }
    }
}

/// One entry per unmet requirement, named by what should be supplied.
pub fn local_missing_documents(analysis: &CoverageAnalysis, criteria: &CriteriaMatch) -> Vec<String> {
    analysis
        .requirements
        .iter()
        .filter(|r| !criteria.is_met(&r.requirement_type))
        .map(|r| {
            let category = RequirementCategory::classify(&r.requirement_type);
            let detail = if r.documentation_needed.is_empty() {
                r.requirement_type.clone()
            } else {
                r.documentation_needed.join(", ")
            };
            format!("{}: {}", category.label(), detail)
        })
        .collect()
}

/// Patient facts checked regardless of which requirements the analysis
/// produced, with whether an absent fact counts as missing.
const REQUIRED_FACTS: [(RequirementCategory, &str, bool); 4] = [
    (RequirementCategory::Counseling, facts::HAS_GENETIC_COUNSELING, true),
    (RequirementCategory::History, facts::HAS_FAMILY_HISTORY, true),
    (RequirementCategory::Indication, facts::HAS_CLINICAL_INDICATION, false),
    (RequirementCategory::Credential, facts::PROVIDER_CREDENTIALS_VALID, false),
];

/// Entries for categories whose fact is not documented, skipping categories
/// already reported by an unmet requirement.
pub fn undocumented_facts(context: &PatientContext, reported: &[String]) -> Vec<String> {
    REQUIRED_FACTS
        .iter()
        .filter(|(_, fact, absent_is_missing)| match context.flag(fact) {
            Some(value) => !value,
            None => *absent_is_missing,
        })
        .filter(|(category, _, _)| !reported.iter().any(|entry| entry.starts_with(category.label())))
        .map(|(category, fact, _)| format!("{}: {} not documented", category.label(), fact))
        .collect()
}

pub fn clinician_message(case: &Case, missing: &[String]) -> String {
    let items = missing
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Dear Provider,\n\nThe prior authorization request for {} ({}) cannot be submitted yet. Please provide:\n\n{}\n\nOnce these are supplied the request will be re-checked automatically.\n\nThank you,\nPrior Authorization Team",
        case.procedure_code, case.payer, items
    )
}

fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.trim().is_empty() && seen.insert(item.trim().to_lowercase()))
        .collect()
}
