//! Output truncation for storage and for the next model context.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_STORAGE_LIMIT: usize = 50_000;
pub const DEFAULT_CONTEXT_BUDGET: usize = 100_000;

const HEAD_NUMERATOR: usize = 7;
const TAIL_NUMERATOR: usize = 3;
const DENOMINATOR: usize = 10;
const NOTE_RESERVE: usize = 64;

fn default_storage_limit() -> usize {
    DEFAULT_STORAGE_LIMIT
}

fn default_context_budget() -> usize {
    DEFAULT_CONTEXT_BUDGET
}

fn default_per_tool() -> HashMap<String, usize> {
    HashMap::from([("exec".to_owned(), 30_000), ("web_fetch".to_owned(), 20_000)])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLimits {
    #[serde(default = "default_storage_limit")]
    pub default_limit: usize,
    #[serde(default = "default_per_tool")]
    pub per_tool: HashMap<String, usize>,
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            default_limit: default_storage_limit(),
            per_tool: default_per_tool(),
            context_budget: default_context_budget(),
        }
    }
}

impl OutputLimits {
    #[must_use]
    pub fn storage_limit_for(&self, tool: &str) -> usize {
        self.per_tool
            .get(tool)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Keep a 70% head and a 30% tail of `limit` bytes with an omission marker between.
#[must_use]
pub fn truncate_for_storage(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_owned();
    }
    let head_end = floor_boundary(output, limit * HEAD_NUMERATOR / DENOMINATOR);
    let tail_start = ceil_boundary(output, output.len() - limit * TAIL_NUMERATOR / DENOMINATOR);
    let omitted = output[head_end..tail_start].chars().count();
    format!(
        "{}\n[... {omitted} chars omitted ...]\n{}",
        &output[..head_end],
        &output[tail_start..]
    )
}

/// Shape-aware truncation for model context. JSON arrays and objects keep
/// their leading members; other text keeps whole leading and trailing lines.
#[must_use]
pub fn truncate_for_context(output: &str, budget: usize) -> String {
    if output.len() <= budget {
        return output.to_owned();
    }
    match serde_json::from_str::<Value>(output.trim()) {
        Ok(Value::Array(items)) => truncate_json_array(&items, budget),
        Ok(Value::Object(map)) => truncate_json_object(&map, budget),
        _ => truncate_lines(output, budget),
    }
}

fn truncate_json_array(items: &[Value], budget: usize) -> String {
    let limit = budget.saturating_sub(NOTE_RESERVE);
    let mut kept = Vec::new();
    let mut used = 2;
    for item in items {
        let rendered = item.to_string();
        if used + rendered.len() + 1 > limit {
            break;
        }
        used += rendered.len() + 1;
        kept.push(rendered);
    }
    format!(
        "[{}]\n[... {} of {} items omitted ...]",
        kept.join(","),
        items.len() - kept.len(),
        items.len()
    )
}

fn truncate_json_object(map: &serde_json::Map<String, Value>, budget: usize) -> String {
    let limit = budget.saturating_sub(NOTE_RESERVE);
    let mut kept = Vec::new();
    let mut used = 2;
    for (key, value) in map {
        let rendered = format!("{}:{value}", Value::String(key.clone()));
        if used + rendered.len() + 1 > limit {
            break;
        }
        used += rendered.len() + 1;
        kept.push(rendered);
    }
    format!(
        "{{{}}}\n[... {} of {} keys omitted ...]",
        kept.join(","),
        map.len() - kept.len(),
        map.len()
    )
}

fn truncate_lines(output: &str, budget: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= 2 {
        return truncate_for_storage(output, budget);
    }
    let usable = budget.saturating_sub(NOTE_RESERVE);
    let head_budget = usable * HEAD_NUMERATOR / DENOMINATOR;
    let tail_budget = usable * TAIL_NUMERATOR / DENOMINATOR;

    let mut head = 0;
    let mut used = 0;
    while head < lines.len() && used + lines[head].len() + 1 <= head_budget {
        used += lines[head].len() + 1;
        head += 1;
    }
    let mut tail = lines.len();
    used = 0;
    while tail > head && used + lines[tail - 1].len() + 1 <= tail_budget {
        used += lines[tail - 1].len() + 1;
        tail -= 1;
    }
    if head == 0 && tail == lines.len() {
        return truncate_for_storage(output, budget);
    }
    format!(
        "{}\n[... {} lines omitted ...]\n{}",
        lines[..head].join("\n"),
        tail - head,
        lines[tail..].join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_passthrough_under_limit() {
        assert_eq!(truncate_for_storage("short", 100), "short");
        let exact = "a".repeat(100);
        assert_eq!(truncate_for_storage(&exact, 100), exact);
    }

    #[test]
    fn storage_keeps_head_and_tail() {
        let input = format!("{}{}", "h".repeat(1000), "t".repeat(1000));
        let out = truncate_for_storage(&input, 100);
        assert!(out.starts_with(&"h".repeat(70)));
        assert!(out.ends_with(&"t".repeat(30)));
        assert!(out.contains("[... 1900 chars omitted ...]"));
    }

    #[test]
    fn storage_respects_char_boundaries() {
        let input = "é".repeat(500);
        let out = truncate_for_storage(&input, 101);
        assert!(out.contains("chars omitted"));
    }

    #[test]
    fn per_tool_limits() {
        let limits = OutputLimits::default();
        assert_eq!(limits.storage_limit_for("exec"), 30_000);
        assert_eq!(limits.storage_limit_for("web_fetch"), 20_000);
        assert_eq!(limits.storage_limit_for("read"), 50_000);
    }

    #[test]
    fn context_json_array_keeps_leading_items() {
        let items: Vec<Value> = (0..500).map(|i| serde_json::json!({ "id": i })).collect();
        let input = Value::Array(items).to_string();
        let out = truncate_for_context(&input, 400);
        assert!(out.starts_with("[{\"id\":0},{\"id\":1}"));
        assert!(out.contains("items omitted"));
        assert!(out.contains("of 500 items"));
    }

    #[test]
    fn context_json_object_keeps_leading_keys() {
        let map: serde_json::Map<String, Value> = (0..200)
            .map(|i| (format!("k{i:03}"), Value::String("v".repeat(20))))
            .collect();
        let out = truncate_for_context(&Value::Object(map).to_string(), 300);
        assert!(out.starts_with("{\"k000\":"));
        assert!(out.contains("of 200 keys omitted"));
    }

    #[test]
    fn context_lines_keep_whole_lines() {
        let input: String = (0..1000).map(|i| format!("line {i}\n")).collect();
        let out = truncate_for_context(&input, 500);
        assert!(out.starts_with("line 0\nline 1\n"));
        assert!(out.ends_with("line 999"));
        assert!(out.contains("lines omitted"));
        assert!(out.len() < 600);
    }

    #[test]
    fn context_single_long_line_falls_back() {
        let input = "x".repeat(5000);
        let out = truncate_for_context(&input, 1000);
        assert!(out.contains("chars omitted"));
    }
}
