//! Worker context assembly.
//!
//! Each stage invocation receives role-specific standing instructions plus
//! an assembled context: the campaign goal, the objective at hand, design
//! edicts from the Design stage, prior-attempt failure feedback, queued
//! human guidance, and relevant memory excerpts.

use crate::memory_gateway::MemoryFact;
use crate::model::{Objective, Role};
use crate::pipeline::outcome::{DesignEdict, design_context};

/// Standing instructions per role, including the structured-result
/// contract every unit must honor.
pub fn role_instructions(role: Role) -> &'static str {
    match role {
        Role::Planner => {
            "You are the planner. Decompose the campaign goal into a short, \
             ordered list of objectives that build on each other. Emit a single \
             JSON object: {\"analysis\": \"...\", \"objectives\": [{\"title\", \
             \"description\", \"acceptance_criteria\": []}]} followed by a result \
             line {\"success\": true, \"summary\": \"...\"}."
        }
        Role::Architect => {
            "You are the architect. Review the approved plan against the \
             workspace and record the design decisions implementers must follow. \
             Emit a single JSON object: {\"decisions\": [{\"title\", \
             \"rationale\"}], \"interfaces\": [{\"module\", \"definition\"}], \
             \"concerns\": [], \"notes\": \"...\"} followed by a result line \
             {\"success\": true, \"summary\": \"...\"}."
        }
        Role::Implementer => {
            "You are the implementer. Complete the objective in the shared \
             workspace, honoring the architecture guidance and any prior-attempt \
             feedback. Finish with a result line {\"success\": true|false, \
             \"summary\": \"...\", \"artifacts\": [\"path\", ...]}."
        }
        Role::Reviewer => {
            "You are the reviewer. Inspect the changes for this objective for \
             correctness, style, and security. Emit a single JSON object: \
             {\"verdict\": \"approve\"|\"reject\", \"summary\": \"...\", \
             \"findings\": [{\"severity\", \"category\", \"file\", \
             \"description\"}], \"security_concerns\": []} followed by a result \
             line {\"success\": true, \"summary\": \"...\"}."
        }
        Role::Verifier => {
            "You are the verifier. Run the checks that prove the objective's \
             acceptance criteria hold. Emit a single JSON object: {\"verdict\": \
             \"pass\"|\"fail\", \"summary\": \"...\", \"checks\": [{\"name\", \
             \"status\", \"output\"}], \"failure_details\": \"...\"} followed by \
             a result line {\"success\": true, \"summary\": \"...\"}."
        }
    }
}

/// Assembles the context document handed to a worker.
#[derive(Default)]
pub struct ContextBuilder {
    sections: Vec<String>,
}

impl ContextBuilder {
    pub fn new(goal: &str) -> Self {
        Self {
            sections: vec![format!("## Campaign Goal\n{goal}")],
        }
    }

    pub fn objective(mut self, objective: &Objective) -> Self {
        let mut section = format!(
            "## Objective\n**{}**\n{}",
            objective.title, objective.description
        );
        if !objective.acceptance_criteria.is_empty() {
            section.push_str("\n\nAcceptance criteria:");
            for criterion in &objective.acceptance_criteria {
                section.push_str(&format!("\n- {criterion}"));
            }
        }
        self.sections.push(section);
        self
    }

    pub fn design(mut self, edict: Option<&DesignEdict>) -> Self {
        if let Some(context) = edict.and_then(design_context) {
            self.sections.push(context);
        }
        self
    }

    pub fn feedback(mut self, feedback: Option<&str>) -> Self {
        if let Some(feedback) = feedback.filter(|f| !f.is_empty()) {
            self.sections.push(format!(
                "## Prior Attempt Feedback\nThe previous attempt was rejected. \
                 Address every point below.\n{feedback}"
            ));
        }
        self
    }

    pub fn guidance(mut self, notes: &[String]) -> Self {
        if !notes.is_empty() {
            let mut section = String::from("## Operator Guidance");
            for note in notes {
                section.push_str(&format!("\n- {note}"));
            }
            self.sections.push(section);
        }
        self
    }

    pub fn memory(mut self, facts: &[MemoryFact]) -> Self {
        if !facts.is_empty() {
            let mut section = String::from(
                "## Relevant Memory\nFacts retained from earlier work on this codebase:",
            );
            for fact in facts {
                section.push_str(&format!("\n- {}", fact.text));
            }
            self.sections.push(section);
        }
        self
    }

    /// Accumulated artifact references, for review/test passes.
    pub fn artifacts(mut self, artifacts: &[String]) -> Self {
        if !artifacts.is_empty() {
            let mut section = String::from("## Changed Files");
            for artifact in artifacts {
                section.push_str(&format!("\n- {artifact}"));
            }
            self.sections.push(section);
        }
        self
    }

    pub fn build(self) -> String {
        self.sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::outcome::DesignDecision;

    #[test]
    fn every_role_states_the_result_contract() {
        for role in [
            Role::Planner,
            Role::Architect,
            Role::Implementer,
            Role::Reviewer,
            Role::Verifier,
        ] {
            assert!(
                role_instructions(role).contains("\"success\""),
                "{role} instructions missing result contract"
            );
        }
    }

    #[test]
    fn context_includes_goal_and_objective() {
        let objective = {
            let mut o = Objective::new("cmp_1", "Add login", "POST /login", 0);
            o.acceptance_criteria.push("returns a JWT".into());
            o
        };
        let context = ContextBuilder::new("ship auth")
            .objective(&objective)
            .build();
        assert!(context.contains("## Campaign Goal\nship auth"));
        assert!(context.contains("**Add login**"));
        assert!(context.contains("- returns a JWT"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let context = ContextBuilder::new("goal")
            .design(None)
            .feedback(None)
            .guidance(&[])
            .memory(&[])
            .artifacts(&[])
            .build();
        assert_eq!(context, "## Campaign Goal\ngoal");
    }

    #[test]
    fn feedback_and_design_sections_appear_when_present() {
        let edict = DesignEdict {
            decisions: vec![DesignDecision {
                title: "one store".into(),
                rationale: "simplicity".into(),
            }],
            ..DesignEdict::default()
        };
        let context = ContextBuilder::new("goal")
            .design(Some(&edict))
            .feedback(Some("fix the off-by-one"))
            .guidance(&["stay on branch main".into()])
            .build();
        assert!(context.contains("Architecture Guidance"));
        assert!(context.contains("Prior Attempt Feedback"));
        assert!(context.contains("fix the off-by-one"));
        assert!(context.contains("stay on branch main"));
    }
}
