use crate::capabilities::CoverageRequest;
use crate::models::{
    CoverageAnalysis, CriteriaMatch, PatientContext, PolicyDocument, Requirement, SearchResult, facts,
};

pub const SEARCH_PREAMBLE: &str = "You research payer coverage policy on the live web. \
Report only documents that really exist; an empty list is better than an invented one.";

pub const ANALYST_PREAMBLE: &str = "You are a medical policy analyst working on prior authorization requests. \
Answer strictly in the JSON shape you are asked for.";

pub fn search_prompt(query: &str) -> String {
    format!(
        r#"Find coverage policy documents for: {query}

Prefer, in order: national coverage determinations, local coverage determinations and articles,
contractor policies, payer medical policies, clinical practice guidelines, regulatory approvals.

Answer with a JSON array only. Each element:
{{"title": string, "url": string, "snippet": string, "relevance": 0-100,
  "type": "ncd" | "lcd" | "lca" | "policy_document" | "coverage_determination" | "clinical_guideline" | "regulatory",
  "source": string}}

If nothing real turns up, answer []."#
    )
}

pub fn document_prompt(result: &SearchResult) -> String {
    format!(
        r#"Read this policy document and extract what a prior authorization reviewer needs.

Title: {title}
URL: {url}
Summary: {snippet}

Answer with one JSON object:
{{"title": string, "source": string, "document_type": string,
  "requirements": [string], "evidence_basis": string, "clinical_criteria": [string],
  "coverage_status": "covered" | "not covered" | "prior authorization required" | "unknown",
  "applicable_codes": [string], "documentation_needed": [string], "limitations": [string],
  "effective_date": "YYYY-MM-DD" | null, "revision_date": "YYYY-MM-DD" | null}}"#,
        title = result.title,
        url = result.url,
        snippet = result.snippet,
    )
}

fn describe_patient(context: &PatientContext) -> String {
    serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".to_string())
}

fn describe_documents(documents: &[PolicyDocument]) -> String {
    documents
        .iter()
        .map(|doc| {
            format!(
                "- {} ({:?}, {})\n  status: {}\n  codes: {}\n  requirements: {}\n  documentation: {}",
                doc.title,
                doc.document_type,
                doc.url,
                doc.coverage_status,
                doc.applicable_codes.join(", "),
                doc.requirements.join("; "),
                doc.documentation_needed.join("; "),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_requirements(requirements: &[Requirement]) -> String {
    requirements
        .iter()
        .map(|r| format!("- {}: {}", r.requirement_type, r.description))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn coverage_prompt(request: &CoverageRequest<'_>) -> String {
    let jurisdiction = request
        .jurisdiction
        .map(|j| format!("{} ({})", j.name, j.id))
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        r#"Decide coverage for procedure code {code} ({service}) under {payer}.
Contractor jurisdiction: {jurisdiction}
Patient state: {state}

Policy documents:
{documents}

Patient facts:
{patient}

When a national determination addresses the code it overrides local policies.

Answer with one JSON object:
{{"coverage_status": "covered" | "not covered" | "prior authorization required" | "unknown",
  "coverage_details": string,
  "requirements": [{{"requirement_type": string, "description": string, "evidence_basis": string,
                     "documentation_needed": [string], "clinical_criteria": [string],
                     "source_document": string, "confidence_score": 0.0-1.0}}],
  "confidence_score": 0.0-1.0,
  "recommendations": [string],
  "ncd_applicable": boolean, "lcd_applicable": boolean}}"#,
        code = request.procedure_code,
        service = request.service_category,
        payer = request.payer,
        state = request.patient_context.text(facts::PATIENT_STATE).unwrap_or("unknown"),
        documents = describe_documents(request.documents),
        patient = describe_patient(request.patient_context),
    )
}

pub fn criteria_prompt(requirements: &[Requirement], context: &PatientContext) -> String {
    format!(
        r#"Judge whether the patient satisfies each requirement. Be conservative: without evidence, answer false.

Requirements:
{requirements}

Patient facts:
{patient}

Answer with one JSON object mapping each requirement type, spelled exactly as above, to true or false."#,
        requirements = describe_requirements(requirements),
        patient = describe_patient(context),
    )
}

pub fn validation_prompt(
    analysis: &CoverageAnalysis,
    documents: &[PolicyDocument],
    context: &PatientContext,
) -> String {
    format!(
        r#"Check whether this prior authorization request can be submitted as it stands.

Coverage: {status}
Requirements:
{requirements}

Policy documents:
{documents}

Patient facts:
{patient}

Answer with one JSON object:
{{"request_validation": {{"is_valid": boolean, "missing_documents": [string], "validation_notes": string}},
  "clinician_message": string}}
The clinician message addresses the ordering provider and lists what to supply; leave it empty when valid."#,
        status = analysis.coverage_status,
        requirements = describe_requirements(&analysis.requirements),
        documents = describe_documents(documents),
        patient = describe_patient(context),
    )
}

pub fn recommendations_prompt(
    analysis: &CoverageAnalysis,
    criteria: &CriteriaMatch,
    context: &PatientContext,
) -> String {
    let unmet: Vec<&str> = criteria
        .iter()
        .filter(|(_, met)| !met)
        .map(|(name, _)| name)
        .collect();
    format!(
        r#"Suggest 5 to 7 concrete next steps to get this prior authorization approved.

Coverage: {status}
Details: {details}
Requirements:
{requirements}
Unmet: {unmet}

Patient facts:
{patient}

Answer with a JSON array of strings."#,
        status = analysis.coverage_status,
        details = analysis.coverage_details,
        requirements = describe_requirements(&analysis.requirements),
        unmet = if unmet.is_empty() { "none".to_string() } else { unmet.join("; ") },
        patient = describe_patient(context),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(patient_context: &PatientContext) -> CoverageRequest<'_> {
        CoverageRequest {
            procedure_code: "81162",
            payer: "Medicare",
            service_category: "genetic testing",
            documents: &[],
            patient_context,
            jurisdiction: None,
        }
    }

    #[test]
    fn test_coverage_prompt_names_patient_state() {
        let context = PatientContext::new().with_text(facts::PATIENT_STATE, "OH");
        let prompt = coverage_prompt(&request(&context));
        assert!(prompt.contains("Patient state: OH"));
        assert!(prompt.contains("81162"));

        let prompt = coverage_prompt(&request(&PatientContext::new()));
        assert!(prompt.contains("Patient state: unknown"));
    }
}
