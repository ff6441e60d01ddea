use dashmap::DashMap;
use tracing::debug;

use crate::models::{Case, PolicyDocument, SearchResult};

const NO_JURISDICTION: &str = "no_jurisdiction";

/// Identity of a search: the same payer, code, service and jurisdiction share results.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchKey {
    payer: String,
    procedure_code: String,
    service_category: String,
    jurisdiction: String,
}

impl SearchKey {
    pub fn for_case(case: &Case) -> Self {
        Self {
            payer: case.payer.trim().to_ascii_lowercase(),
            procedure_code: case.procedure_code.trim().to_ascii_uppercase(),
            service_category: case.service_category.trim().to_ascii_lowercase(),
            jurisdiction: case
                .jurisdiction
                .as_ref()
                .map(|j| j.id.trim().to_ascii_lowercase())
                .unwrap_or_else(|| NO_JURISDICTION.to_string()),
        }
    }
}

/// Process-wide memo of search batches and extracted documents.
///
/// Entries are never evicted; the working set is bounded by the number of
/// distinct cases a process sees.
#[derive(Debug, Default)]
pub struct PolicyCache {
    searches: DashMap<SearchKey, Vec<SearchResult>>,
    documents: DashMap<String, PolicyDocument>,
}

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn search(&self, key: &SearchKey) -> Option<Vec<SearchResult>> {
        let hit = self.searches.get(key).map(|entry| entry.value().clone());
        debug!(?key, hit = hit.is_some(), "Search cache lookup");
        hit
    }

    pub fn store_search(&self, key: SearchKey, results: Vec<SearchResult>) {
        self.searches.insert(key, results);
    }

    pub fn document(&self, url: &str) -> Option<PolicyDocument> {
        self.documents
            .get(&document_key(url))
            .map(|entry| entry.value().clone())
    }

    pub fn store_document(&self, url: &str, document: PolicyDocument) {
        self.documents.insert(document_key(url), document);
    }

    pub fn search_entries(&self) -> usize {
        self.searches.len()
    }

    pub fn document_entries(&self) -> usize {
        self.documents.len()
    }
}

fn document_key(url: &str) -> String {
    crate::pipeline::search::normalize_url(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentCategory, Jurisdiction};

    #[test]
    fn test_search_key_ignores_case_and_padding() {
        let a = Case::new("81162", "Medicare", "Genetic Testing");
        let b = Case::new(" 81162 ", "medicare", "genetic testing");
        assert_eq!(SearchKey::for_case(&a), SearchKey::for_case(&b));

        let with_mac = a.clone().with_jurisdiction(Jurisdiction {
            id: "J15".to_string(),
            name: "CGS Administrators".to_string(),
            website: None,
        });
        assert_ne!(SearchKey::for_case(&a), SearchKey::for_case(&with_mac));
    }

    #[test]
    fn test_documents_keyed_by_normalized_url() {
        let cache = PolicyCache::new();
        let result = SearchResult::new("LCD L38974", "https://cms.gov/l38974/", DocumentCategory::Lcd, 90);
        cache.store_document(&result.url, PolicyDocument::fallback_for(&result));

        assert!(cache.document("HTTPS://CMS.GOV/L38974").is_some());
        assert!(cache.document("https://cms.gov/other").is_none());
        assert_eq!(cache.document_entries(), 1);
    }
}
