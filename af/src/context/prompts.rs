//! Phase-specific system prompts
//!
//! Embedded Handlebars templates, one per phase. Terminal phases reuse the
//! verify prompt (the executor refuses to step terminal tasks anyway).

use eyre::Result;
use handlebars::Handlebars;
use serde::Serialize;
use statestore::Phase;

const BASE_TEMPLATE: &str = "\
You are an autonomous code-modification agent working on task {{task_id}}.
Goal: {{goal}}

You operate one step at a time with a bounded context. Everything you know
is in this message; state persists on disk between steps.

{{phase_directive}}

Respond with exactly ONE action in a fenced block:
```action
action: action_name
parameters:
  key: value
reasoning: brief explanation
```";

fn phase_directive(phase: Phase) -> &'static str {
    match phase {
        Phase::Init => {
            "You are in the INIT phase. Orient yourself: read the target file or \
             load precomputed context before changing anything."
        }
        Phase::Analyze => {
            "You are in the ANALYZE phase. Build understanding of the code and the \
             violation. Read files and run checks; do not modify code yet."
        }
        Phase::Plan => {
            "You are in the PLAN phase. Record a concrete fix approach with \
             plan_fix, then move on to implementation."
        }
        Phase::Implement => {
            "You are in the IMPLEMENT phase. Make the code change. Prefer semantic \
             refactoring tools (extract_function, simplify_conditional) over raw \
             text edits; they are verified against the tests automatically."
        }
        Phase::Verify | Phase::Complete | Phase::Failed | Phase::Escalated => {
            "You are in the VERIFY phase. Run the conformance check and the tests. \
             If both pass, use complete; if the fix is not achievable, use \
             cannot_fix with a reason."
        }
    }
}

#[derive(Serialize)]
struct PromptData<'a> {
    task_id: &'a str,
    goal: &'a str,
    task_type: &'a str,
    phase: String,
    phase_directive: &'static str,
}

/// Renders the per-phase system message
pub struct PromptRegistry {
    handlebars: Handlebars<'static>,
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRegistry {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string("system", BASE_TEMPLATE)
            .expect("embedded system template");
        Self { handlebars }
    }

    pub fn system_prompt(&self, phase: Phase, task_id: &str, goal: &str, task_type: &str) -> Result<String> {
        let data = PromptData {
            task_id,
            goal,
            task_type,
            phase: phase.to_string(),
            phase_directive: phase_directive(phase),
        };
        Ok(self.handlebars.render("system", &data)?)
    }
}
