use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::PolicyCache;
use crate::capabilities::ExtractionCapability;
use crate::error::CapabilityError;
use crate::models::{PolicyDocument, SearchResult};

#[derive(Debug, Clone)]
pub enum ExtractionOutcome {
    Parsed(PolicyDocument),
    /// Reached but unreadable; built from the search hit instead.
    Fallback(PolicyDocument),
    Dropped(CapabilityError),
}

impl ExtractionOutcome {
    fn into_document(self) -> Option<PolicyDocument> {
        match self {
            Self::Parsed(doc) | Self::Fallback(doc) => Some(doc),
            Self::Dropped(_) => None,
        }
    }
}

pub struct DocumentExtractor {
    capability: Arc<dyn ExtractionCapability>,
    cache: Arc<PolicyCache>,
    top_k: usize,
    per_call_timeout: Duration,
}

impl DocumentExtractor {
    pub fn new(
        capability: Arc<dyn ExtractionCapability>,
        cache: Arc<PolicyCache>,
        top_k: usize,
        per_call_timeout: Duration,
    ) -> Self {
        Self {
            capability,
            cache,
            top_k,
            per_call_timeout,
        }
    }

    /// Deep-reads the top qualifying results concurrently, in relevance order.
    pub async fn extract(&self, results: &[SearchResult]) -> Vec<PolicyDocument> {
        let mut candidates: Vec<&SearchResult> = results
            .iter()
            .filter(|r| r.category.is_extractable())
            .collect();
        candidates.sort_by(|a, b| b.relevance.cmp(&a.relevance));
        candidates.truncate(self.top_k);

        if candidates.is_empty() {
            info!(total = results.len(), "No search results qualify for extraction");
            return Vec::new();
        }

        let mut slots: Vec<Option<ExtractionOutcome>> = vec![None; candidates.len()];
        let mut set = JoinSet::new();
        for (index, result) in candidates.iter().enumerate() {
            if let Some(cached) = self.cache.document(&result.url) {
                debug!(url = %result.url, "Using cached policy document");
                slots[index] = Some(ExtractionOutcome::Parsed(cached));
                continue;
            }
            let capability = Arc::clone(&self.capability);
            let result = (*result).clone();
            let timeout = self.per_call_timeout;
            set.spawn(async move {
                let outcome = read_document(capability, &result, timeout).await;
                (index, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let ExtractionOutcome::Parsed(doc) = &outcome {
                        self.cache.store_document(&candidates[index].url, doc.clone());
                    }
                    slots[index] = Some(outcome);
                }
                Err(e) => warn!(error = %e, "Extraction task aborted"),
            }
        }

        let documents: Vec<PolicyDocument> = slots
            .into_iter()
            .flatten()
            .filter_map(ExtractionOutcome::into_document)
            .collect();
        info!(
            candidates = candidates.len(),
            extracted = documents.len(),
            "Policy document extraction completed"
        );
        documents
    }
}

async fn read_document(
    capability: Arc<dyn ExtractionCapability>,
    result: &SearchResult,
    timeout: Duration,
) -> ExtractionOutcome {
    match tokio::time::timeout(timeout, capability.analyze_document(result)).await {
        Ok(Ok(mut document)) => {
            if document.title.trim().is_empty() {
                document.title = result.title.clone();
            }
            if document.url.trim().is_empty() {
                document.url = result.url.clone();
            }
            ExtractionOutcome::Parsed(document)
        }
        Ok(Err(CapabilityError::Malformed(reason))) => {
            warn!(url = %result.url, %reason, "Unreadable policy document, using search summary");
            ExtractionOutcome::Fallback(PolicyDocument::fallback_for(result))
        }
        Ok(Err(e)) => {
            warn!(url = %result.url, error = %e, transient = e.is_transient(), "Dropping policy document");
            ExtractionOutcome::Dropped(e)
        }
        Err(_) => {
            warn!(url = %result.url, "Policy document extraction timed out");
            ExtractionOutcome::Dropped(CapabilityError::Timeout {
                operation: "extraction",
                after: timeout,
            })
        }
    }
}
