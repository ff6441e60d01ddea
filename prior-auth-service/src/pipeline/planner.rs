use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{Case, Jurisdiction};

const PRIMARY_PAYER_MARKERS: [&str; 2] = ["medicare", "cms"];

// Placeholders: {code} {service} {payer}
const PRIMARY_CORE: &[&str] = &[
    "Medicare NCD {code} {service}",
    "Medicare LCD {code} {service}",
    "Medicare LCA {code} {service}",
];

// Placeholders: {code} {service} {mac} {mac_id}
const PRIMARY_JURISDICTION: &[&str] = &[
    "{mac} LCD {code} {service}",
    "{mac} LCA {code} {service}",
    "MAC {mac_id} {code} {service}",
];

const PRIMARY_DATABASE: &[&str] = &[
    "site:cms.gov Medicare Coverage Database {code}",
    "site:cms.gov NCD {code} {service}",
    "site:cms.gov LCD {code} {service}",
];

const PRIMARY_NECESSITY: &[&str] = &[
    "Medicare medical necessity {code} {service}",
    "Medicare coverage policy {code} {service}",
    "Medicare coverage determination {code} {service}",
];

const PRIMARY_MANAGED: &[&str] = &[
    "{payer} Medicare Advantage medical policy {code} {service}",
    "{payer} Medicare Advantage prior authorization {code}",
    "{payer} Medicare Advantage coverage determination {code}",
];

const PRIMARY_SUPPORTING: &[&str] = &[
    "Medicare documentation requirements {code} {service}",
    "Medicare clinical guidelines {code} {service}",
    "NCCN guidelines {code} {service}",
    "FDA approval {code} {service}",
];

const PAYER_CORE: &[&str] = &[
    "{payer} medical policy {code} {service} coverage requirements",
    "{payer} prior authorization requirements {code} {service}",
    "{payer} coverage determination {service} policy document",
    "{payer} medical necessity criteria {code} {service}",
    "{payer} clinical policy {code} {service}",
];

const PAYER_JURISDICTION: &[&str] = &["{payer} {mac} medical policy {code} {service}"];

const PAYER_SUPPORTING: &[&str] = &[
    "{payer} utilization management {code} {service}",
    "{payer} clinical guidelines {code} {service}",
    "{payer} technology assessment {code} {service}",
    "{payer} FDA approval {code} {service}",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    /// Lower runs first; equal to the position in the plan.
    pub priority: usize,
}

/// True for government primary-coverage payers, which get the national/local
/// determination query family.
pub fn is_primary_payer(payer: &str) -> bool {
    let lowered = payer.to_ascii_lowercase();
    PRIMARY_PAYER_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn is_managed_variant(payer: &str) -> bool {
    payer.to_ascii_lowercase().contains("advantage")
}

struct Placeholders<'a> {
    code: &'a str,
    service: &'a str,
    payer: &'a str,
    jurisdiction: Option<&'a Jurisdiction>,
}

impl Placeholders<'_> {
    fn render(&self, template: &str) -> String {
        let mut text = template
            .replace("{code}", self.code)
            .replace("{service}", self.service)
            .replace("{payer}", self.payer);
        if let Some(jurisdiction) = self.jurisdiction {
            text = text
                .replace("{mac}", &jurisdiction.name)
                .replace("{mac_id}", &jurisdiction.id);
        }
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryPlanner;

impl QueryPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Ordered, duplicate-free search plan for a case. Never empty.
    pub fn plan_queries(&self, case: &Case) -> Vec<SearchQuery> {
        let placeholders = Placeholders {
            code: case.procedure_code.trim(),
            service: case.service_category.trim(),
            payer: case.payer.trim(),
            jurisdiction: case.jurisdiction.as_ref(),
        };

        let mut templates: Vec<&str> = Vec::new();
        let mut site_query = None;
        if is_primary_payer(&case.payer) {
            templates.extend(PRIMARY_CORE);
            if let Some(jurisdiction) = case.jurisdiction.as_ref() {
                templates.extend(PRIMARY_JURISDICTION);
                site_query = jurisdiction
                    .website
                    .as_deref()
                    .filter(|site| !site.trim().is_empty())
                    .map(|site| format!("site:{} {{code}} {{service}}", site.trim()));
            }
            templates.extend(PRIMARY_DATABASE);
            templates.extend(PRIMARY_NECESSITY);
            if is_managed_variant(&case.payer) {
                templates.extend(PRIMARY_MANAGED);
            }
            templates.extend(PRIMARY_SUPPORTING);
        } else {
            templates.extend(PAYER_CORE);
            if case.jurisdiction.is_some() {
                templates.extend(PAYER_JURISDICTION);
            }
            templates.extend(PAYER_SUPPORTING);
        }

        let mut rendered: Vec<String> = templates.iter().map(|t| placeholders.render(t)).collect();
        if let Some(site) = site_query {
            // Right after the jurisdiction block.
            let position = (PRIMARY_CORE.len() + PRIMARY_JURISDICTION.len()).min(rendered.len());
            rendered.insert(position, placeholders.render(&site));
        }

        let mut seen = std::collections::HashSet::new();
        let queries: Vec<SearchQuery> = rendered
            .into_iter()
            .filter(|text| !text.is_empty() && seen.insert(text.to_ascii_lowercase()))
            .enumerate()
            .map(|(priority, text)| SearchQuery { text, priority })
            .collect();

        debug!(
            case_id = %case.id,
            primary_payer = is_primary_payer(&case.payer),
            query_count = queries.len(),
            "Planned search queries"
        );
        queries
    }
}
