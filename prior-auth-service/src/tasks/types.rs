/// Keys under which stage outputs live in the workflow context.
pub mod session_keys {
    pub const CASE: &str = "case";
    pub const QUERIES: &str = "search_queries";
    pub const SEARCH_BATCH: &str = "search_batch";
    pub const DOCUMENTS: &str = "policy_documents";
    pub const ANALYSIS: &str = "coverage_analysis";
    pub const CRITERIA_MATCH: &str = "criteria_match";
    pub const GATE_DECISION: &str = "gate_decision";
    /// Facts supplied by the clinician while paused; layered over the case's patient context.
    pub const SUPPLIED_FACTS: &str = "supplied_facts";
    /// Set when new facts arrive, cleared once the gate has re-evaluated.
    pub const MISSING_INFO_SUPPLIED: &str = "missing_info_supplied";
    pub const DEGRADED: &str = "degraded";
    pub const SUBMISSION: &str = "submission";
}

/// Progress checkpoints reported after each stage.
pub mod progress {
    pub const PLANNED: u8 = 10;
    pub const SEARCHED: u8 = 30;
    pub const EXTRACTED: u8 = 40;
    pub const ANALYZED: u8 = 45;
    pub const MATCHED: u8 = 48;
    pub const RECOMMENDED: u8 = 49;
    pub const VALIDATED: u8 = 50;
    pub const COMPLETED: u8 = 100;
}
