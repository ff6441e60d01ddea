use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{PolicyCache, SearchKey};
use crate::capabilities::SearchCapability;
use crate::error::CapabilityError;
use crate::models::{Case, SearchResult};
use crate::pipeline::planner::SearchQuery;

/// What one dispatched query produced.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Hits(Vec<SearchResult>),
    NoHits,
    Failed(CapabilityError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedQuery {
    pub query: String,
    pub reason: String,
}

/// Merged result of one search fan-out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchBatch {
    pub results: Vec<SearchResult>,
    pub failed: Vec<FailedQuery>,
    pub dispatched: usize,
    /// No capability was reachable, so nothing was searched.
    pub degraded: bool,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchSettings {
    pub query_budget: usize,
    pub top_n: usize,
    pub per_call_timeout: Duration,
}

pub struct SearchExecutor {
    capability: Arc<dyn SearchCapability>,
    cache: Arc<PolicyCache>,
    settings: SearchSettings,
}

impl SearchExecutor {
    pub fn new(
        capability: Arc<dyn SearchCapability>,
        cache: Arc<PolicyCache>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            capability,
            cache,
            settings,
        }
    }

    pub fn is_available(&self) -> bool {
        self.capability.is_available()
    }

    /// Cached variant of [`execute`](Self::execute) keyed by the case's search identity.
    pub async fn execute_for_case(&self, case: &Case, queries: &[SearchQuery]) -> SearchBatch {
        let key = SearchKey::for_case(case);
        if let Some(results) = self.cache.search(&key) {
            info!(case_id = %case.id, results = results.len(), "Using cached search results");
            return SearchBatch {
                results,
                from_cache: true,
                ..SearchBatch::default()
            };
        }

        let batch = self.execute(queries).await;
        if !batch.degraded && !batch.results.is_empty() {
            self.cache.store_search(key, batch.results.clone());
            debug!(cached_searches = self.cache.search_entries(), "Search results cached");
        }
        batch
    }

    /// Runs the highest-priority queries within budget concurrently and merges
    /// their hits. Individual failures never fail the batch.
    pub async fn execute(&self, queries: &[SearchQuery]) -> SearchBatch {
        if !self.capability.is_available() {
            warn!("Search capability unavailable, skipping policy search");
            return SearchBatch {
                degraded: true,
                ..SearchBatch::default()
            };
        }

        let mut selected: Vec<&SearchQuery> = queries.iter().collect();
        selected.sort_by_key(|q| q.priority);
        selected.truncate(self.settings.query_budget);

        let timeout = self.settings.per_call_timeout;
        let mut set = JoinSet::new();
        for (index, query) in selected.iter().enumerate() {
            let capability = Arc::clone(&self.capability);
            let text = query.text.clone();
            set.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, capability.search(&text)).await {
                    Ok(Ok(hits)) if hits.is_empty() => QueryOutcome::NoHits,
                    Ok(Ok(hits)) => QueryOutcome::Hits(hits),
                    Ok(Err(e)) => QueryOutcome::Failed(e),
                    Err(_) => QueryOutcome::Failed(CapabilityError::Timeout {
                        operation: "search",
                        after: timeout,
                    }),
                };
                (index, outcome)
            });
        }

        // Slots keep query order regardless of completion order.
        let mut slots: Vec<Option<QueryOutcome>> = vec![None; selected.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!(error = %e, "Search task aborted"),
            }
        }

        let mut merged = Vec::new();
        let mut failed = Vec::new();
        for (query, slot) in selected.iter().zip(slots) {
            match slot {
                Some(QueryOutcome::Hits(hits)) => {
                    debug!(query = %query.text, hits = hits.len(), "Search query returned hits");
                    merged.extend(hits);
                }
                Some(QueryOutcome::NoHits) => {
                    debug!(query = %query.text, "Search query returned nothing");
                }
                Some(QueryOutcome::Failed(e)) => {
                    warn!(query = %query.text, error = %e, transient = e.is_transient(), "Search query failed");
                    failed.push(FailedQuery {
                        query: query.text.clone(),
                        reason: e.to_string(),
                    });
                }
                None => failed.push(FailedQuery {
                    query: query.text.clone(),
                    reason: "search task aborted".to_string(),
                }),
            }
        }

        let mut results = rank(dedupe(merged));
        results.truncate(self.settings.top_n);

        info!(
            dispatched = selected.len(),
            failed = failed.len(),
            kept = results.len(),
            "Policy search completed"
        );
        SearchBatch {
            results,
            failed,
            dispatched: selected.len(),
            degraded: false,
            from_cache: false,
        }
    }
}

pub fn normalize_url(url: &str) -> String {
    url.trim().to_ascii_lowercase().trim_end_matches('/').to_string()
}

pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drops later results whose normalized url or normalized title was already seen.
pub fn dedupe(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut urls = HashSet::new();
    let mut titles = HashSet::new();
    results
        .into_iter()
        .filter(|result| {
            let url = normalize_url(&result.url);
            let title = normalize_title(&result.title);
            if urls.contains(&url) || titles.contains(&title) {
                return false;
            }
            urls.insert(url);
            titles.insert(title);
            true
        })
        .collect()
}

/// Relevance descending; ties keep arrival order.
pub fn rank(mut results: Vec<SearchResult>) -> Vec<SearchResult> {
    results.sort_by(|a, b| b.relevance.cmp(&a.relevance));
    results
}
