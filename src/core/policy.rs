use crate::core::session::SessionMode;

/// Tool name the provider uses to ask the user an interactive question.
pub const QUESTION_TOOL: &str = "AskUser";

const EDIT_TOOLS: [&str; 2] = ["Edit", "Write"];
const EXEC_TOOLS: [&str; 2] = ["Bash", "Execute"];
const FILE_TOOLS: [&str; 3] = ["Edit", "Write", "Read"];
/// Denied outright in plan mode regardless of input.
const PLAN_BLOCKED_TOOLS: [&str; 3] = ["Bash", "Execute", "Delete"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyContext {
    pub mode: SessionMode,
    /// Chat-only embedding: no file or execution tools at all.
    pub restricted: bool,
    /// Unattended run: nobody is present to answer questions.
    pub automation: bool,
}

impl PolicyContext {
    pub fn for_mode(mode: SessionMode) -> Self {
        Self {
            mode,
            restricted: false,
            automation: false,
        }
    }
}

/// Outcome of one policy. `Allow` forwards the (possibly rewritten)
/// input to the next policy in the chain.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyStep {
    Allow(serde_json::Value),
    Deny { message: String },
    Ask(serde_json::Value),
}

/// Final decision after the whole chain has run.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Allow { input: serde_json::Value },
    Deny { message: String },
    /// Requires an interactive approval before the call may proceed.
    Ask { input: serde_json::Value },
}

pub type Policy =
    Box<dyn Fn(&str, serde_json::Value, &PolicyContext) -> PolicyStep + Send + Sync>;

/// Ordered policy chain: policies run left-to-right, the first denial
/// wins, and each policy may rewrite the call input before the next
/// sees it.
pub struct PolicyChain {
    policies: Vec<Policy>,
}

impl PolicyChain {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    /// The standing chain: input repair first so later policies judge
    /// the corrected input, then mode restrictions, then the
    /// interactive-question gate.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(input_repair_policy),
            Box::new(restricted_mode_policy),
            Box::new(automation_mode_policy),
            Box::new(plan_mode_policy),
            Box::new(question_tool_policy),
        ])
    }

    pub fn evaluate(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: &PolicyContext,
    ) -> PolicyDecision {
        let mut current = input;
        for policy in &self.policies {
            match policy(name, current, ctx) {
                PolicyStep::Allow(rewritten) => current = rewritten,
                PolicyStep::Deny { message } => return PolicyDecision::Deny { message },
                PolicyStep::Ask(input) => return PolicyDecision::Ask { input },
            }
        }
        PolicyDecision::Allow { input: current }
    }
}

/// Certain model families emit near-miss parameter names; fix the known
/// ones before any policy inspects the input.
fn input_repair_policy(
    _name: &str,
    mut input: serde_json::Value,
    _ctx: &PolicyContext,
) -> PolicyStep {
    if let Some(map) = input.as_object_mut() {
        for (wrong, right) in [("file_path", "path"), ("filepath", "path"), ("cmd", "command")] {
            if map.contains_key(wrong) && !map.contains_key(right) {
                if let Some(value) = map.remove(wrong) {
                    map.insert(right.to_string(), value);
                }
            }
        }
    }
    PolicyStep::Allow(input)
}

fn restricted_mode_policy(
    name: &str,
    input: serde_json::Value,
    ctx: &PolicyContext,
) -> PolicyStep {
    if !ctx.restricted {
        return PolicyStep::Allow(input);
    }
    if FILE_TOOLS.contains(&name) || EXEC_TOOLS.contains(&name) {
        return PolicyStep::Deny {
            message: format!("{name} is not available in restricted chat mode."),
        };
    }
    PolicyStep::Allow(input)
}

fn automation_mode_policy(
    name: &str,
    input: serde_json::Value,
    ctx: &PolicyContext,
) -> PolicyStep {
    if ctx.automation && name == QUESTION_TOOL {
        return PolicyStep::Deny {
            message: "Interactive questions are disabled in automation mode.".to_string(),
        };
    }
    PolicyStep::Allow(input)
}

fn plan_mode_policy(name: &str, input: serde_json::Value, ctx: &PolicyContext) -> PolicyStep {
    if ctx.mode != SessionMode::Plan {
        return PolicyStep::Allow(input);
    }
    if PLAN_BLOCKED_TOOLS.contains(&name) {
        return PolicyStep::Deny {
            message: format!("{name} is blocked in plan mode."),
        };
    }
    if EDIT_TOOLS.contains(&name) {
        let path = input
            .get("path")
            .and_then(|value| value.as_str())
            .unwrap_or("");
        if !path.to_ascii_lowercase().ends_with(".md") {
            return PolicyStep::Deny {
                message: format!(
                    "Plan mode only permits edits to .md files; refusing {name} on {path:?}."
                ),
            };
        }
    }
    PolicyStep::Allow(input)
}

fn question_tool_policy(
    name: &str,
    input: serde_json::Value,
    _ctx: &PolicyContext,
) -> PolicyStep {
    if name == QUESTION_TOOL {
        return PolicyStep::Ask(input);
    }
    PolicyStep::Allow(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(mode: SessionMode) -> PolicyContext {
        PolicyContext::for_mode(mode)
    }

    #[test]
    fn plan_mode_allows_markdown_edits_only() {
        let chain = PolicyChain::standard();
        let plan = ctx(SessionMode::Plan);

        let decision = chain.evaluate("Edit", serde_json::json!({"path": "notes.md"}), &plan);
        assert!(matches!(decision, PolicyDecision::Allow { .. }));

        let decision = chain.evaluate("Edit", serde_json::json!({"path": "app.ts"}), &plan);
        match decision {
            PolicyDecision::Deny { message } => assert!(message.contains(".md")),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn plan_mode_blocks_fixed_tool_set_outright() {
        let chain = PolicyChain::standard();
        let decision = chain.evaluate(
            "Bash",
            serde_json::json!({"command": "ls"}),
            &ctx(SessionMode::Plan),
        );
        assert!(matches!(decision, PolicyDecision::Deny { .. }));
    }

    #[test]
    fn agent_mode_is_unrestricted_for_edits() {
        let chain = PolicyChain::standard();
        let decision = chain.evaluate(
            "Edit",
            serde_json::json!({"path": "app.ts"}),
            &ctx(SessionMode::Agent),
        );
        assert!(matches!(decision, PolicyDecision::Allow { .. }));
    }

    #[test]
    fn restricted_mode_denies_file_and_exec_tools() {
        let chain = PolicyChain::standard();
        let mut restricted = ctx(SessionMode::Agent);
        restricted.restricted = true;

        for tool in ["Edit", "Write", "Read", "Bash", "Execute"] {
            let decision = chain.evaluate(tool, serde_json::json!({}), &restricted);
            assert!(
                matches!(decision, PolicyDecision::Deny { .. }),
                "{tool} should be denied"
            );
        }
        let decision = chain.evaluate("Search", serde_json::json!({}), &restricted);
        assert!(matches!(decision, PolicyDecision::Allow { .. }));
    }

    #[test]
    fn automation_mode_denies_questions_before_ask() {
        let chain = PolicyChain::standard();
        let mut automation = ctx(SessionMode::Agent);
        automation.automation = true;

        let decision = chain.evaluate(QUESTION_TOOL, serde_json::json!({}), &automation);
        assert!(matches!(decision, PolicyDecision::Deny { .. }));
    }

    #[test]
    fn question_tool_asks_in_interactive_runs() {
        let chain = PolicyChain::standard();
        let decision = chain.evaluate(
            QUESTION_TOOL,
            serde_json::json!({"question": "deploy?"}),
            &ctx(SessionMode::Agent),
        );
        assert!(matches!(decision, PolicyDecision::Ask { .. }));
    }

    #[test]
    fn ask_decision_carries_repaired_input() {
        let chain = PolicyChain::standard();
        let decision = chain.evaluate(
            QUESTION_TOOL,
            serde_json::json!({"question": "deploy?", "cmd": "deploy"}),
            &ctx(SessionMode::Agent),
        );
        match decision {
            PolicyDecision::Ask { input } => {
                assert_eq!(
                    input.get("question").and_then(|v| v.as_str()),
                    Some("deploy?")
                );
                // Repairs made by earlier policies survive into the ask.
                assert_eq!(input.get("command").and_then(|v| v.as_str()), Some("deploy"));
                assert!(input.get("cmd").is_none());
            }
            other => panic!("expected ask, got {other:?}"),
        }
    }

    #[test]
    fn input_repair_runs_before_plan_mode_inspection() {
        let chain = PolicyChain::standard();
        // file_path must be rewritten to path before plan mode reads it.
        let decision = chain.evaluate(
            "Edit",
            serde_json::json!({"file_path": "notes.md"}),
            &ctx(SessionMode::Plan),
        );
        match decision {
            PolicyDecision::Allow { input } => {
                assert_eq!(input.get("path").and_then(|v| v.as_str()), Some("notes.md"));
                assert!(input.get("file_path").is_none());
            }
            other => panic!("expected allow, got {other:?}"),
        }
    }
}
