//! Capability implementations backed by a language model.

pub mod parsing;
pub mod prompts;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::capabilities::{
    AnalysisCapability, CoverageDraft, CoverageRequest, CriteriaCapability, ExtractionCapability,
    SearchCapability,
};
use crate::error::CapabilityError;
use crate::llm::{LlmBackend, LlmRequest};
use crate::models::{
    CoverageAnalysis, CriteriaMatch, PatientContext, PolicyDocument, Requirement,
    RequestValidation, SearchResult,
};

/// Serves every capability role by prompting one [`LlmBackend`].
pub struct LlmPolicyAgent {
    backend: Arc<dyn LlmBackend>,
}

impl LlmPolicyAgent {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    async fn ask(&self, request: LlmRequest) -> Result<String, CapabilityError> {
        let response = self.backend.complete(request).await?;
        debug!(
            backend = self.backend.name(),
            response_len = response.len(),
            "Received model response"
        );
        Ok(response)
    }
}

#[async_trait]
impl SearchCapability for LlmPolicyAgent {
    fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, CapabilityError> {
        let response = self
            .ask(LlmRequest::search(prompts::SEARCH_PREAMBLE, prompts::search_prompt(query)))
            .await?;
        let results = parsing::parse_search_results(&response, query);
        info!(query, results = results.len(), "Parsed search results");
        Ok(results)
    }
}

#[async_trait]
impl ExtractionCapability for LlmPolicyAgent {
    async fn analyze_document(&self, result: &SearchResult) -> Result<PolicyDocument, CapabilityError> {
        let response = self
            .ask(LlmRequest::analysis(
                prompts::ANALYST_PREAMBLE,
                prompts::document_prompt(result),
            ))
            .await?;
        parsing::parse_policy_document(&response, result)
    }
}

#[async_trait]
impl AnalysisCapability for LlmPolicyAgent {
    fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    async fn analyze_coverage(
        &self,
        request: CoverageRequest<'_>,
    ) -> Result<CoverageDraft, CapabilityError> {
        let response = self
            .ask(LlmRequest::analysis(
                prompts::ANALYST_PREAMBLE,
                prompts::coverage_prompt(&request),
            ))
            .await?;
        parsing::parse_coverage_draft(&response)
    }

    async fn recommend(
        &self,
        analysis: &CoverageAnalysis,
        criteria: &CriteriaMatch,
        patient_context: &PatientContext,
    ) -> Result<Vec<String>, CapabilityError> {
        let response = self
            .ask(LlmRequest::analysis(
                prompts::ANALYST_PREAMBLE,
                prompts::recommendations_prompt(analysis, criteria, patient_context),
            ))
            .await?;
        Ok(parsing::parse_recommendations(&response))
    }
}

#[async_trait]
impl CriteriaCapability for LlmPolicyAgent {
    fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    async fn check(
        &self,
        requirements: &[Requirement],
        patient_context: &PatientContext,
    ) -> Result<CriteriaMatch, CapabilityError> {
        let response = self
            .ask(LlmRequest::analysis(
                prompts::ANALYST_PREAMBLE,
                prompts::criteria_prompt(requirements, patient_context),
            ))
            .await?;
        parsing::parse_criteria(&response)
    }

    async fn validate_request(
        &self,
        analysis: &CoverageAnalysis,
        documents: &[PolicyDocument],
        patient_context: &PatientContext,
    ) -> Result<RequestValidation, CapabilityError> {
        let response = self
            .ask(LlmRequest::analysis(
                prompts::ANALYST_PREAMBLE,
                prompts::validation_prompt(analysis, documents, patient_context),
            ))
            .await?;
        parsing::parse_validation(&response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::llm::LlmPurpose;
    use crate::models::DocumentCategory;

    struct CannedBackend {
        reply: String,
        purposes: Mutex<Vec<LlmPurpose>>,
    }

    #[async_trait]
    impl LlmBackend for CannedBackend {
        fn name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, request: LlmRequest) -> Result<String, CapabilityError> {
            self.purposes.lock().unwrap().push(request.purpose);
            Ok(self.reply.clone())
        }
    }

    fn agent(reply: &str) -> (LlmPolicyAgent, Arc<CannedBackend>) {
        let backend = Arc::new(CannedBackend {
            reply: reply.to_string(),
            purposes: Mutex::new(Vec::new()),
        });
        (LlmPolicyAgent::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_search_uses_search_model() {
        let (agent, backend) = agent(r#"[{"title": "NCD 90.2", "url": "https://cms.gov/ncd", "type": "ncd", "relevance": 95}]"#);
        let results = agent.search("Medicare NCD 81162").await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].category, DocumentCategory::Ncd);
        assert_eq!(backend.purposes.lock().unwrap().as_slice(), &[LlmPurpose::Search]);
    }

    #[tokio::test]
    async fn test_unstructured_document_reply_is_malformed() {
        let (agent, _) = agent("Sorry, I cannot open that page.");
        let result = SearchResult::new("LCD", "https://cms.gov/lcd", DocumentCategory::Lcd, 80);
        let err = agent.analyze_document(&result).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Malformed(_)));
    }
}
