use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capabilities::CriteriaCapability;
use crate::models::{facts, CriteriaMatch, PatientContext, Requirement};

/// How a requirement matching none of the known categories is judged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnclassifiedPolicy {
    #[default]
    AssumeMet,
    AssumeUnmet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementCategory {
    Counseling,
    History,
    Indication,
    Credential,
    Unclassified,
}

impl RequirementCategory {
    pub fn classify(requirement_type: &str) -> Self {
        let lowered = requirement_type.to_lowercase();
        if lowered.contains("counsel") {
            Self::Counseling
        } else if lowered.contains("history") {
            Self::History
        } else if lowered.contains("indication") || lowered.contains("medical necessity") {
            Self::Indication
        } else if lowered.contains("credential") {
            Self::Credential
        } else {
            Self::Unclassified
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Counseling => "Genetic counseling documentation",
            Self::History => "Family history documentation",
            Self::Indication => "Clinical indication documentation",
            Self::Credential => "Provider credential verification",
            Self::Unclassified => "Additional policy requirement",
        }
    }

    /// Rule verdict given the patient's facts.
    fn evaluate(self, context: &PatientContext, policy: UnclassifiedPolicy) -> bool {
        match self {
            Self::Counseling => context.flag(facts::HAS_GENETIC_COUNSELING).unwrap_or(false),
            Self::History => context.flag(facts::HAS_FAMILY_HISTORY).unwrap_or(false),
            Self::Indication => context.flag(facts::HAS_CLINICAL_INDICATION).unwrap_or(true),
            Self::Credential => context
                .flag(facts::PROVIDER_CREDENTIALS_VALID)
                .unwrap_or(true),
            Self::Unclassified => policy == UnclassifiedPolicy::AssumeMet,
        }
    }
}

/// Rule-based judgment of every requirement against the patient's facts.
pub fn match_criteria(
    requirements: &[Requirement],
    context: &PatientContext,
    policy: UnclassifiedPolicy,
) -> CriteriaMatch {
    requirements
        .iter()
        .map(|requirement| {
            let met = RequirementCategory::classify(&requirement.requirement_type)
                .evaluate(context, policy);
            (requirement.requirement_type.clone(), met)
        })
        .collect()
}

pub struct CriteriaMatcher {
    capability: Arc<dyn CriteriaCapability>,
    timeout: Duration,
    policy: UnclassifiedPolicy,
}

impl CriteriaMatcher {
    pub fn new(
        capability: Arc<dyn CriteriaCapability>,
        timeout: Duration,
        policy: UnclassifiedPolicy,
    ) -> Self {
        Self {
            capability,
            timeout,
            policy,
        }
    }

    /// External judgment when reachable, otherwise the local rules. Every
    /// requirement type appears in the result.
    pub async fn evaluate(
        &self,
        requirements: &[Requirement],
        context: &PatientContext,
    ) -> CriteriaMatch {
        if requirements.is_empty() {
            return CriteriaMatch::new();
        }
        if !self.capability.is_available() {
            debug!("Criteria capability unavailable, applying local rules");
            return match_criteria(requirements, context, self.policy);
        }

        match tokio::time::timeout(self.timeout, self.capability.check(requirements, context)).await
        {
            Ok(Ok(answer)) => requirements
                .iter()
                .map(|r| {
                    let met = answer.is_met(&r.requirement_type);
                    (r.requirement_type.clone(), met)
                })
                .collect(),
            Ok(Err(e)) => {
                warn!(error = %e, "Criteria check failed, applying local rules");
                match_criteria(requirements, context, self.policy)
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Criteria check timed out, applying local rules");
                match_criteria(requirements, context, self.policy)
            }
        }
    }
}
