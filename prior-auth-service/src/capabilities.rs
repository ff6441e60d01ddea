//! Seams between the pipeline and whatever answers its questions.
//!
//! Stages only see these traits. Production wires in [`crate::agent::LlmPolicyAgent`];
//! tests wire in scripted fakes.

use async_trait::async_trait;

use crate::error::CapabilityError;
use crate::models::{
    CoverageAnalysis, CoverageStatus, CriteriaMatch, Jurisdiction, PatientContext, PolicyDocument,
    Requirement, RequestValidation, SearchResult,
};

#[async_trait]
pub trait SearchCapability: Send + Sync {
    /// `false` when calls are known to fail without trying (no credentials).
    fn is_available(&self) -> bool {
        true
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, CapabilityError>;
}

#[async_trait]
pub trait ExtractionCapability: Send + Sync {
    /// `Malformed` means the document was reached but could not be read into structure.
    async fn analyze_document(&self, result: &SearchResult) -> Result<PolicyDocument, CapabilityError>;
}

/// Inputs to a coverage synthesis call.
#[derive(Debug, Clone, Copy)]
pub struct CoverageRequest<'a> {
    pub procedure_code: &'a str,
    pub payer: &'a str,
    pub service_category: &'a str,
    pub documents: &'a [PolicyDocument],
    pub patient_context: &'a PatientContext,
    pub jurisdiction: Option<&'a Jurisdiction>,
}

/// Partial coverage answer; the analyzer fills whatever is missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageDraft {
    pub coverage_status: Option<CoverageStatus>,
    pub coverage_details: Option<String>,
    pub requirements: Vec<Requirement>,
    pub confidence_score: Option<f64>,
    pub recommendations: Vec<String>,
    pub ncd_applicable: Option<bool>,
    pub lcd_applicable: Option<bool>,
}

#[async_trait]
pub trait AnalysisCapability: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    async fn analyze_coverage(
        &self,
        request: CoverageRequest<'_>,
    ) -> Result<CoverageDraft, CapabilityError>;

    async fn recommend(
        &self,
        analysis: &CoverageAnalysis,
        criteria: &CriteriaMatch,
        patient_context: &PatientContext,
    ) -> Result<Vec<String>, CapabilityError>;
}

#[async_trait]
pub trait CriteriaCapability: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    async fn check(
        &self,
        requirements: &[Requirement],
        patient_context: &PatientContext,
    ) -> Result<CriteriaMatch, CapabilityError>;

    async fn validate_request(
        &self,
        analysis: &CoverageAnalysis,
        documents: &[PolicyDocument],
        patient_context: &PatientContext,
    ) -> Result<RequestValidation, CapabilityError>;
}
