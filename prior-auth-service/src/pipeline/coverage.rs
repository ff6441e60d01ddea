use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::capabilities::{AnalysisCapability, CoverageDraft, CoverageRequest};
use crate::models::{
    Case, CoverageAnalysis, CoverageStatus, CriteriaMatch, PolicyDocument, PolicyTier, Requirement,
};
use crate::pipeline::defaults::{
    default_analysis, default_recommendations, default_requirements,
    DEFAULT_REQUIREMENT_CONFIDENCE, DOCUMENT_FALLBACK_CONFIDENCE,
};

/// The documents that will inform a decision, after national/local precedence.
#[derive(Debug, Clone)]
pub struct AuthoritativeDocuments {
    pub documents: Vec<PolicyDocument>,
    pub national: bool,
    pub local: bool,
}

/// National determinations that address the code win; local ones are only
/// consulted when none does.
pub fn select_authoritative(procedure_code: &str, documents: &[PolicyDocument]) -> AuthoritativeDocuments {
    let national_addresses = documents
        .iter()
        .any(|d| d.tier() == PolicyTier::National && d.addresses_code(procedure_code));

    let selected: Vec<PolicyDocument> = documents
        .iter()
        .filter(|d| !(national_addresses && d.tier() == PolicyTier::Local))
        .cloned()
        .collect();

    AuthoritativeDocuments {
        national: national_addresses,
        local: !national_addresses && selected.iter().any(|d| d.tier() == PolicyTier::Local),
        documents: selected,
    }
}

pub struct CoverageAnalyzer {
    capability: Arc<dyn AnalysisCapability>,
    timeout: Duration,
}

impl CoverageAnalyzer {
    pub fn new(capability: Arc<dyn AnalysisCapability>, timeout: Duration) -> Self {
        Self {
            capability,
            timeout,
        }
    }

    pub async fn analyze(&self, case: &Case, documents: &[PolicyDocument]) -> CoverageAnalysis {
        let jurisdiction = case.jurisdiction.as_ref().map(|j| j.name.clone());
        if documents.is_empty() {
            info!(case_id = %case.id, "No policy documents, using default coverage analysis");
            return default_analysis(&case.procedure_code, &case.payer, jurisdiction);
        }

        let selected = select_authoritative(&case.procedure_code, documents);
        if selected.national {
            info!(case_id = %case.id, "National determination addresses the code, local policies set aside");
        }

        if !self.capability.is_available() {
            return from_documents(case, &selected);
        }

        let request = CoverageRequest {
            procedure_code: &case.procedure_code,
            payer: &case.payer,
            service_category: &case.service_category,
            documents: &selected.documents,
            patient_context: &case.patient_context,
            jurisdiction: case.jurisdiction.as_ref(),
        };
        match tokio::time::timeout(self.timeout, self.capability.analyze_coverage(request)).await {
            Ok(Ok(draft)) => from_draft(case, &selected, draft),
            Ok(Err(e)) => {
                warn!(case_id = %case.id, error = %e, "Coverage synthesis failed, deriving from documents");
                from_documents(case, &selected)
            }
            Err(_) => {
                warn!(case_id = %case.id, "Coverage synthesis timed out, deriving from documents");
                from_documents(case, &selected)
            }
        }
    }
}

fn from_draft(case: &Case, selected: &AuthoritativeDocuments, draft: CoverageDraft) -> CoverageAnalysis {
    let mut requirements = dedupe_requirements(draft.requirements);
    if requirements.is_empty() {
        requirements = requirements_from_documents(&selected.documents);
    }
    if requirements.is_empty() {
        requirements = default_requirements();
    }
    let coverage_status = draft
        .coverage_status
        .unwrap_or(CoverageStatus::PriorAuthorizationRequired);

    CoverageAnalysis {
        coverage_status,
        coverage_details: draft
            .coverage_details
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| summary(case, coverage_status, selected.documents.len())),
        requirements,
        criteria_match: CriteriaMatch::new(),
        confidence_score: draft
            .confidence_score
            .unwrap_or(DEFAULT_REQUIREMENT_CONFIDENCE)
            .clamp(0.0, 1.0),
        sources: Vec::new(),
        recommendations: draft.recommendations,
        jurisdiction: case.jurisdiction.as_ref().map(|j| j.name.clone()),
        ncd_applicable: draft.ncd_applicable.unwrap_or(selected.national),
        lcd_applicable: draft.lcd_applicable.unwrap_or(selected.local),
    }
}

fn from_documents(case: &Case, selected: &AuthoritativeDocuments) -> CoverageAnalysis {
    let coverage_status = selected
        .documents
        .iter()
        .map(|d| d.coverage_status)
        .find(|s| *s != CoverageStatus::Unknown)
        .unwrap_or(CoverageStatus::PriorAuthorizationRequired);
    let mut requirements = requirements_from_documents(&selected.documents);
    if requirements.is_empty() {
        requirements = default_requirements();
    }

    CoverageAnalysis {
        coverage_status,
        coverage_details: summary(case, coverage_status, selected.documents.len()),
        requirements,
        criteria_match: CriteriaMatch::new(),
        confidence_score: DOCUMENT_FALLBACK_CONFIDENCE,
        sources: Vec::new(),
        recommendations: default_recommendations(),
        jurisdiction: case.jurisdiction.as_ref().map(|j| j.name.clone()),
        ncd_applicable: selected.national,
        lcd_applicable: selected.local,
    }
}

fn summary(case: &Case, status: CoverageStatus, document_count: usize) -> String {
    format!(
        "{} under {}: {} (based on {} policy document{})",
        case.procedure_code,
        case.payer,
        status,
        document_count,
        if document_count == 1 { "" } else { "s" }
    )
}

/// One requirement per distinct requirement string across the documents.
pub fn requirements_from_documents(documents: &[PolicyDocument]) -> Vec<Requirement> {
    let requirements = documents.iter().flat_map(|doc| {
        doc.requirements.iter().map(move |text| Requirement {
            requirement_type: text.trim().to_string(),
            description: format!("Requirement for {}", text.trim().to_lowercase()),
            evidence_basis: doc.evidence_basis.clone(),
            documentation_needed: doc.documentation_needed.clone(),
            clinical_criteria: doc.clinical_criteria.clone(),
            source_document: doc.title.clone(),
            confidence_score: DOCUMENT_FALLBACK_CONFIDENCE,
        })
    });
    dedupe_requirements(requirements.filter(|r| !r.requirement_type.is_empty()).collect())
}

fn dedupe_requirements(requirements: Vec<Requirement>) -> Vec<Requirement> {
    let mut seen = HashSet::new();
    requirements
        .into_iter()
        .filter(|r| seen.insert(r.requirement_type.to_lowercase()))
        .map(|mut r| {
            r.confidence_score = r.confidence_score.clamp(0.0, 1.0);
            r
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::CapabilityError;
    use crate::models::{DocumentCategory, PatientContext, SearchResult};

    struct FailingAnalysis;

    #[async_trait]
    impl AnalysisCapability for FailingAnalysis {
        async fn analyze_coverage(
            &self,
            _request: CoverageRequest<'_>,
        ) -> Result<CoverageDraft, CapabilityError> {
            Err(CapabilityError::Malformed("prose instead of json".to_string()))
        }

        async fn recommend(
            &self,
            _analysis: &CoverageAnalysis,
            _criteria: &CriteriaMatch,
            _patient_context: &PatientContext,
        ) -> Result<Vec<String>, CapabilityError> {
            Ok(Vec::new())
        }
    }

    struct ConfidentAnalysis;

    #[async_trait]
    impl AnalysisCapability for ConfidentAnalysis {
        async fn analyze_coverage(
            &self,
            _request: CoverageRequest<'_>,
        ) -> Result<CoverageDraft, CapabilityError> {
            Ok(CoverageDraft {
                coverage_status: Some(CoverageStatus::Covered),
                confidence_score: Some(1.7),
                ..CoverageDraft::default()
            })
        }

        async fn recommend(
            &self,
            _analysis: &CoverageAnalysis,
            _criteria: &CriteriaMatch,
            _patient_context: &PatientContext,
        ) -> Result<Vec<String>, CapabilityError> {
            Ok(Vec::new())
        }
    }

    fn document(title: &str, category: DocumentCategory, codes: &[&str], requirements: &[&str]) -> PolicyDocument {
        let mut doc = PolicyDocument::fallback_for(&SearchResult::new(title, title, category, 80));
        doc.applicable_codes = codes.iter().map(|c| c.to_string()).collect();
        doc.requirements = requirements.iter().map(|r| r.to_string()).collect();
        doc
    }

    #[tokio::test]
    async fn test_no_documents_gives_defaults() {
        let analyzer = CoverageAnalyzer::new(Arc::new(FailingAnalysis), Duration::from_secs(1));
        let case = Case::new("81162", "Medicare", "genetic testing");
        let analysis = analyzer.analyze(&case, &[]).await;

        assert_eq!(analysis.coverage_status, CoverageStatus::PriorAuthorizationRequired);
        assert_eq!(analysis.requirements.len(), 4);
        assert!((analysis.confidence_score - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_national_determination_sets_local_aside() {
        let documents = vec![
            document("LCD Genetic Testing", DocumentCategory::Lcd, &["81162"], &["Local rule"]),
            document("NCD 90.2", DocumentCategory::Ncd, &["81162"], &["National rule"]),
        ];
        let selected = select_authoritative("81162", &documents);
        assert!(selected.national);
        assert!(!selected.local);
        assert_eq!(selected.documents.len(), 1);
        assert_eq!(selected.documents[0].title, "NCD 90.2");
    }

    #[test]
    fn test_local_consulted_when_national_is_silent() {
        let documents = vec![
            document("LCD Genetic Testing", DocumentCategory::Lcd, &["81162"], &["Local rule"]),
            document("NCD 90.2", DocumentCategory::Ncd, &["81479"], &["National rule"]),
        ];
        let selected = select_authoritative("81162", &documents);
        assert!(!selected.national);
        assert!(selected.local);
        assert_eq!(selected.documents.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_synthesis_derives_from_documents() {
        let analyzer = CoverageAnalyzer::new(Arc::new(FailingAnalysis), Duration::from_secs(1));
        let case = Case::new("81162", "Medicare", "genetic testing");
        let documents = vec![document(
            "LCD Genetic Testing",
            DocumentCategory::Lcd,
            &["81162"],
            &["Genetic counseling", "Family history", "genetic counseling"],
        )];
        let analysis = analyzer.analyze(&case, &documents).await;

        assert!((analysis.confidence_score - 0.85).abs() < f64::EPSILON);
        let types: Vec<_> = analysis.requirements.iter().map(|r| r.requirement_type.as_str()).collect();
        assert_eq!(types, vec!["Genetic counseling", "Family history"]);
        assert!(analysis.lcd_applicable);
        assert!(!analysis.ncd_applicable);
    }

    #[tokio::test]
    async fn test_confidence_is_capped_and_requirements_filled() {
        let analyzer = CoverageAnalyzer::new(Arc::new(ConfidentAnalysis), Duration::from_secs(1));
        let case = Case::new("81162", "Aetna", "genetic testing");
        let documents = vec![document("Aetna policy", DocumentCategory::PolicyDocument, &[], &[])];
        let analysis = analyzer.analyze(&case, &documents).await;

        assert_eq!(analysis.coverage_status, CoverageStatus::Covered);
        assert!((analysis.confidence_score - 1.0).abs() < f64::EPSILON);
        assert!(!analysis.requirements.is_empty());
    }
}
