//! Reversibility tagging and the pre-execution simulation gate.

use std::sync::LazyLock;

use regex::RegexSet;
use serde::Deserialize;
use serde_json::Value;

use crate::executor::{BoxFuture, ToolCall, ToolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reversibility {
    Reversible,
    Irreversible,
    Destructive,
}

const IRREVERSIBLE_TOOLS: &[&str] = &["write", "edit", "exec", "send_message", "ask_agent"];
const DESTRUCTIVE_TOOLS: &[&str] = &["delete", "remove", "drop_session"];
const MESSAGE_TOOLS: &[&str] = &["send_message", "ask_agent"];
const PROMPT_INPUT_CHARS: usize = 500;

static DESTRUCTIVE_COMMANDS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"\brm\s+(-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\b",
        r"\bdd\b.*\bof=/dev/",
        r"\bmkfs(\.\w+)?\b",
        r"\b(shutdown|reboot|poweroff|halt)\b",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
});

/// Tag a call. `exec` escalates to `Destructive` when its command matches a
/// destructive pattern. Unlisted tools are reversible.
#[must_use]
pub fn classify(name: &str, input: &Value) -> Reversibility {
    if DESTRUCTIVE_TOOLS.contains(&name) {
        return Reversibility::Destructive;
    }
    if name == "exec"
        && let Some(cmd) = input.get("command").and_then(Value::as_str)
        && is_destructive_command(cmd)
    {
        return Reversibility::Destructive;
    }
    if IRREVERSIBLE_TOOLS.contains(&name) {
        Reversibility::Irreversible
    } else {
        Reversibility::Reversible
    }
}

#[must_use]
pub fn is_destructive_command(command: &str) -> bool {
    DESTRUCTIVE_COMMANDS.is_match(command)
}

/// Why a call needs simulation before it runs, or `None` when it can run directly.
#[must_use]
pub fn simulation_requirement(call: &ToolCall, operator: &str) -> Option<String> {
    match classify(&call.name, &call.input) {
        Reversibility::Reversible => None,
        Reversibility::Destructive => Some(format!("`{}` is destructive", call.name)),
        Reversibility::Irreversible => {
            if MESSAGE_TOOLS.contains(&call.name.as_str()) {
                let recipient = call.str_arg("to").unwrap_or_default();
                (recipient != operator)
                    .then(|| format!("outbound message to `{recipient}` is not the operator"))
            } else {
                None
            }
        }
    }
}

/// Prompt asking a reviewer model whether the call should proceed.
#[must_use]
pub fn simulation_prompt(call: &ToolCall, reason: &str) -> String {
    let input = call.input.to_string();
    let shown = if input.chars().count() > PROMPT_INPUT_CHARS {
        let head: String = input.chars().take(PROMPT_INPUT_CHARS).collect();
        format!("{head}...")
    } else {
        input
    };
    format!(
        "An agent is about to run the tool `{name}`.\n\
         Reason for review: {reason}\n\
         Input: {shown}\n\n\
         Predict the effect of this call and decide whether it should proceed.\n\
         Answer with JSON only: {{\"proceed\": true|false, \"reasoning\": \"...\"}}",
        name = call.name,
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulationVerdict {
    pub proceed: bool,
    #[serde(default)]
    pub reasoning: String,
}

impl SimulationVerdict {
    /// Extract the verdict from a model reply. Unparseable replies deny.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let candidate = match (text.find('{'), text.rfind('}')) {
            (Some(start), Some(end)) if start < end => &text[start..=end],
            _ => text,
        };
        serde_json::from_str(candidate).unwrap_or_else(|_| Self {
            proceed: false,
            reasoning: "simulation reply was not a valid verdict".into(),
        })
    }
}

/// Backend that answers simulation prompts, typically a model call.
pub trait Simulator: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the reviewer could not be reached.
    fn simulate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, ToolError>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn table_lookup() {
        assert_eq!(classify("read", &json!({})), Reversibility::Reversible);
        assert_eq!(classify("write", &json!({})), Reversibility::Irreversible);
        assert_eq!(classify("delete", &json!({})), Reversibility::Destructive);
        assert_eq!(classify("mystery", &json!({})), Reversibility::Reversible);
    }

    #[test]
    fn exec_escalates_on_destructive_command() {
        for cmd in [
            "rm -rf build",
            "rm -r old",
            "sudo dd if=/dev/zero of=/dev/sda",
            "mkfs.ext4 /dev/sdb1",
            "shutdown -h now",
            "reboot",
        ] {
            assert_eq!(
                classify("exec", &json!({ "command": cmd })),
                Reversibility::Destructive,
                "{cmd}"
            );
        }
        assert_eq!(
            classify("exec", &json!({"command": "ls -la"})),
            Reversibility::Irreversible
        );
        assert_eq!(
            classify("exec", &json!({"command": "rm notes.txt"})),
            Reversibility::Irreversible
        );
    }

    #[test]
    fn message_to_operator_skips_simulation() {
        let call = ToolCall::new("1", "send_message", json!({"to": "owner", "content": "hi"}));
        assert!(simulation_requirement(&call, "owner").is_none());
        let call = ToolCall::new("2", "send_message", json!({"to": "stranger", "content": "hi"}));
        assert!(simulation_requirement(&call, "owner").is_some());
    }

    #[test]
    fn plain_write_needs_no_simulation() {
        let call = ToolCall::new("1", "write", json!({"path": "a", "content": "b"}));
        assert!(simulation_requirement(&call, "owner").is_none());
    }

    #[test]
    fn destructive_always_simulated() {
        let call = ToolCall::new("1", "exec", json!({"command": "rm -rf ./cache"}));
        assert!(simulation_requirement(&call, "owner").is_some());
    }

    #[test]
    fn prompt_truncates_input() {
        let call = ToolCall::new("1", "exec", json!({"command": "x".repeat(2000)}));
        let prompt = simulation_prompt(&call, "test");
        assert!(prompt.contains("`exec`"));
        assert!(prompt.contains("..."));
        assert!(prompt.len() < 1200);
    }

    #[test]
    fn verdict_parse_embedded_json() {
        let v = SimulationVerdict::parse("Sure.\n{\"proceed\": true, \"reasoning\": \"safe\"}\nDone");
        assert!(v.proceed);
        assert_eq!(v.reasoning, "safe");
    }

    #[test]
    fn verdict_parse_garbage_denies() {
        assert!(!SimulationVerdict::parse("yes go ahead").proceed);
        assert!(!SimulationVerdict::parse("{\"proceed\": \"maybe\"}").proceed);
    }
}
