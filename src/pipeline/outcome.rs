//! Structured stage outcomes parsed from worker output.
//!
//! Workers are free-form; the pipeline only trusts what it can parse:
//! - Breakdown → [`BreakdownPlan`] (objective list; unparseable = stage
//!   failure, there is nothing to execute)
//! - Design → [`DesignEdict`] (advisory; unparseable = no edicts)
//! - Review → [`ReviewVerdict`] (advisory; unparseable = pass)
//! - Test → [`TestReport`] (advisory; unparseable = pass)
//!
//! The JSON payload may be the whole output, a fenced ```json block, or
//! embedded in surrounding prose.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedObjective {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakdownPlan {
    #[serde(default)]
    pub analysis: Option<String>,
    pub objectives: Vec<PlannedObjective>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignDecision {
    pub title: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceNote {
    pub module: String,
    #[serde(default)]
    pub definition: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesignEdict {
    #[serde(default)]
    pub decisions: Vec<DesignDecision>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceNote>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDisposition {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFinding {
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub verdict: ReviewDisposition,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    /// Any entry here forces a required checkpoint, pass or fail.
    #[serde(default)]
    pub security_concerns: Vec<String>,
}

impl ReviewVerdict {
    pub fn passed(&self) -> bool {
        self.verdict == ReviewDisposition::Approve
    }

    /// Feedback text injected into the retry worker's context.
    pub fn feedback_text(&self) -> String {
        let mut lines = vec![format!("Review rejected: {}", self.summary)];
        for finding in &self.findings {
            lines.push(format!(
                "- [{}] {} ({}): {}",
                finding.severity, finding.category, finding.file, finding.description
            ));
        }
        lines.join("\n")
    }

    /// Diagnostic payload for security and escalation checkpoints.
    pub fn payload_text(&self) -> String {
        let mut lines = vec![
            format!("**Verdict**: {:?}", self.verdict),
            format!("**Summary**: {}", self.summary),
        ];
        if !self.security_concerns.is_empty() {
            lines.push("**Security concerns:**".into());
            for concern in &self.security_concerns {
                lines.push(format!("- {concern}"));
            }
        }
        if !self.findings.is_empty() {
            lines.push("**Findings:**".into());
            for finding in &self.findings {
                lines.push(format!(
                    "- [{}] {} ({}): {}",
                    finding.severity, finding.category, finding.file, finding.description
                ));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestDisposition {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    /// "pass", "fail", or "error".
    pub status: String,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub verdict: TestDisposition,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub checks: Vec<CheckOutcome>,
    #[serde(default)]
    pub failure_details: Option<String>,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.verdict == TestDisposition::Pass
    }

    pub fn feedback_text(&self) -> String {
        let mut lines = vec![format!("Tests failed: {}", self.summary)];
        for check in self.checks.iter().filter(|c| c.status != "pass") {
            let mut line = format!("- {}: {}", check.name, check.status);
            if !check.output.is_empty() {
                line.push_str(": ");
                line.push_str(&check.output.chars().take(300).collect::<String>());
            }
            lines.push(line);
        }
        if let Some(details) = &self.failure_details {
            lines.push(details.chars().take(500).collect());
        }
        lines.join("\n")
    }
}

/// Pull the JSON document out of free-form worker output.
fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }
    // Fenced block, e.g. ```json ... ```
    if let Some(start) = raw.find("```json") {
        let body = &raw[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }
    // Embedded object: outermost braces.
    let first = raw.find('{')?;
    let last = raw.rfind('}')?;
    (first < last).then(|| raw[first..=last].trim())
}

fn parse<T: serde::de::DeserializeOwned>(raw: &str) -> Option<T> {
    serde_json::from_str(extract_json(raw)?).ok()
}

pub fn parse_breakdown(raw: &str) -> Option<BreakdownPlan> {
    parse::<BreakdownPlan>(raw).filter(|plan| !plan.objectives.is_empty())
}

pub fn parse_design(raw: &str) -> Option<DesignEdict> {
    parse(raw)
}

pub fn parse_review(raw: &str) -> Option<ReviewVerdict> {
    parse(raw)
}

pub fn parse_test_report(raw: &str) -> Option<TestReport> {
    parse(raw)
}

/// Checkpoint payload shown when approving a breakdown plan.
pub fn plan_payload(goal: &str, plan: &BreakdownPlan) -> String {
    let mut lines = vec![format!(
        "Breakdown of '{}' into {} objective(s):",
        goal,
        plan.objectives.len()
    )];
    if let Some(analysis) = &plan.analysis {
        lines.push(format!("**Analysis**: {analysis}"));
    }
    for (i, objective) in plan.objectives.iter().enumerate() {
        lines.push(format!("{}. **{}**", i + 1, objective.title));
        if !objective.description.is_empty() {
            lines.push(format!("   {}", objective.description));
        }
        for criterion in &objective.acceptance_criteria {
            lines.push(format!("   - {criterion}"));
        }
    }
    lines.join("\n")
}

/// Checkpoint payload shown when approving a design.
pub fn design_payload(edict: &DesignEdict) -> String {
    let mut lines = Vec::new();
    if !edict.decisions.is_empty() {
        lines.push("**Design decisions:**".to_string());
        for decision in &edict.decisions {
            lines.push(format!("- **{}**: {}", decision.title, decision.rationale));
        }
    }
    if !edict.interfaces.is_empty() {
        lines.push("**Interfaces:**".to_string());
        for interface in &edict.interfaces {
            lines.push(format!("- **{}**: {}", interface.module, interface.definition));
        }
    }
    if !edict.concerns.is_empty() {
        lines.push("**Concerns:**".to_string());
        for concern in &edict.concerns {
            lines.push(format!("- {concern}"));
        }
    }
    if let Some(notes) = &edict.notes {
        lines.push(format!("**Notes:** {notes}"));
    }
    if lines.is_empty() {
        lines.push("(no structured design output)".to_string());
    }
    lines.join("\n")
}

/// Design guidance injected into implementer contexts.
pub fn design_context(edict: &DesignEdict) -> Option<String> {
    if edict.decisions.is_empty() && edict.interfaces.is_empty() && edict.concerns.is_empty() {
        return None;
    }
    let mut lines = vec![
        "## Architecture Guidance".to_string(),
        "Approved design decisions. Follow them during implementation.".to_string(),
    ];
    lines.push(design_payload(edict));
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakdown_parses_bare_json() {
        let raw = r#"{"analysis": "two pieces", "objectives": [
            {"title": "schema", "description": "create tables"},
            {"title": "api", "acceptance_criteria": ["returns 200"]}
        ]}"#;
        let plan = parse_breakdown(raw).unwrap();
        assert_eq!(plan.objectives.len(), 2);
        assert_eq!(plan.objectives[0].title, "schema");
        assert_eq!(plan.objectives[1].acceptance_criteria, vec!["returns 200"]);
    }

    #[test]
    fn breakdown_parses_fenced_block_in_prose() {
        let raw = "Here is my plan:\n```json\n{\"objectives\": [{\"title\": \"only one\"}]}\n```\nDone.";
        let plan = parse_breakdown(raw).unwrap();
        assert_eq!(plan.objectives.len(), 1);
    }

    #[test]
    fn empty_plan_is_rejected() {
        assert!(parse_breakdown(r#"{"objectives": []}"#).is_none());
        assert!(parse_breakdown("no json at all").is_none());
    }

    #[test]
    fn review_verdict_roundtrip() {
        let raw = r#"{"verdict": "reject", "summary": "unsafe unwrap",
            "findings": [{"severity": "error", "category": "correctness",
                          "file": "src/auth.rs", "description": "unwrap on user input"}]}"#;
        let review = parse_review(raw).unwrap();
        assert!(!review.passed());
        let feedback = review.feedback_text();
        assert!(feedback.contains("unsafe unwrap"));
        assert!(feedback.contains("src/auth.rs"));
    }

    #[test]
    fn review_with_security_concerns_can_still_approve() {
        let raw = r#"{"verdict": "approve", "summary": "ok but",
            "security_concerns": ["token logged in plaintext"]}"#;
        let review = parse_review(raw).unwrap();
        assert!(review.passed());
        assert_eq!(review.security_concerns.len(), 1);
        assert!(review.payload_text().contains("token logged"));
    }

    #[test]
    fn malformed_review_is_none() {
        assert!(parse_review("LGTM!").is_none());
        assert!(parse_review(r#"{"no_verdict": true}"#).is_none());
    }

    #[test]
    fn test_report_collects_failing_checks() {
        let raw = r#"{"verdict": "fail", "summary": "2 of 5 failed", "checks": [
            {"name": "login_ok", "status": "pass"},
            {"name": "login_rejects_bad_password", "status": "fail", "output": "expected 401, got 200"},
            {"name": "token_expiry", "status": "error", "output": "panicked"}
        ]}"#;
        let report = parse_test_report(raw).unwrap();
        assert!(!report.passed());
        let feedback = report.feedback_text();
        assert!(feedback.contains("login_rejects_bad_password"));
        assert!(feedback.contains("expected 401"));
        assert!(!feedback.contains("login_ok:"));
    }

    #[test]
    fn design_context_absent_without_content() {
        assert!(design_context(&DesignEdict::default()).is_none());

        let edict = DesignEdict {
            decisions: vec![DesignDecision {
                title: "hexagonal layout".into(),
                rationale: "isolates the store".into(),
            }],
            ..DesignEdict::default()
        };
        let context = design_context(&edict).unwrap();
        assert!(context.contains("Architecture Guidance"));
        assert!(context.contains("hexagonal layout"));
    }

    #[test]
    fn plan_payload_lists_objectives_in_order() {
        let plan = BreakdownPlan {
            analysis: Some("sequential".into()),
            objectives: vec![
                PlannedObjective {
                    title: "first".into(),
                    description: "desc".into(),
                    acceptance_criteria: vec!["done".into()],
                },
                PlannedObjective {
                    title: "second".into(),
                    description: String::new(),
                    acceptance_criteria: vec![],
                },
            ],
        };
        let payload = plan_payload("build it", &plan);
        let first = payload.find("1. **first**").unwrap();
        let second = payload.find("2. **second**").unwrap();
        assert!(first < second);
    }
}
