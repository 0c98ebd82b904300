//! Grouping of tool calls into ordered, concurrency-safe batches.

use std::collections::HashSet;

use serde_json::Value;

use crate::executor::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// No side effects; may share a batch with anything except `Never`.
    Always,
    /// Must run alone.
    Never,
    /// Parallel unless another call in the batch touches the same resource key.
    Conditional,
}

/// How a tool may be scheduled relative to other calls in the same round.
///
/// `resource_key` names the input field holding the resource a `Conditional`
/// tool touches. A conditional tool without a declared key never conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelPolicy {
    pub class: Parallelism,
    pub resource_key: Option<&'static str>,
}

impl ParallelPolicy {
    pub const ALWAYS: Self = Self {
        class: Parallelism::Always,
        resource_key: None,
    };

    pub const NEVER: Self = Self {
        class: Parallelism::Never,
        resource_key: None,
    };

    #[must_use]
    pub const fn conditional(resource_key: &'static str) -> Self {
        Self {
            class: Parallelism::Conditional,
            resource_key: Some(resource_key),
        }
    }

    fn key_of(&self, call: &ToolCall) -> Option<String> {
        let field = self.resource_key?;
        match call.input.get(field)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

pub type ToolBatch = Vec<ToolCall>;

/// Split `calls` into batches that must run strictly in order; calls inside
/// one batch may run concurrently.
///
/// Order across batches follows the input order exactly.
pub fn plan_batches<F>(calls: Vec<ToolCall>, policy_for: F) -> Vec<ToolBatch>
where
    F: Fn(&str) -> ParallelPolicy,
{
    let mut batches = Vec::new();
    let mut current: ToolBatch = Vec::new();
    let mut touched: HashSet<String> = HashSet::new();

    for call in calls {
        let policy = policy_for(&call.name);
        match policy.class {
            Parallelism::Always => current.push(call),
            Parallelism::Never => {
                if !current.is_empty() {
                    batches.push(std::mem::take(&mut current));
                }
                touched.clear();
                batches.push(vec![call]);
            }
            Parallelism::Conditional => {
                if let Some(key) = policy.key_of(&call) {
                    if touched.contains(&key) {
                        batches.push(std::mem::take(&mut current));
                        touched.clear();
                    }
                    touched.insert(key);
                }
                current.push(call);
            }
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn policy(name: &str) -> ParallelPolicy {
        match name {
            "read" => ParallelPolicy::ALWAYS,
            "write" => ParallelPolicy::conditional("path"),
            _ => ParallelPolicy::NEVER,
        }
    }

    fn call(name: &str, path: &str) -> ToolCall {
        ToolCall::new(format!("{name}-{path}"), name, json!({ "path": path }))
    }

    fn names(batches: &[ToolBatch]) -> Vec<Vec<String>> {
        batches
            .iter()
            .map(|b| b.iter().map(|c| c.id.clone()).collect())
            .collect()
    }

    #[test]
    fn mixed_sequence_yields_two_groups() {
        let calls = vec![
            call("read", "a"),
            call("write", "a"),
            call("read", "b"),
            call("exec", "c"),
        ];
        let batches = plan_batches(calls, policy);
        assert_eq!(
            names(&batches),
            vec![
                vec!["read-a".to_owned(), "write-a".into(), "read-b".into()],
                vec!["exec-c".to_owned()],
            ]
        );
    }

    #[test]
    fn same_key_conditional_splits() {
        let batches = plan_batches(vec![call("write", "a"), call("write", "a")], policy);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn distinct_keys_share_batch() {
        let batches = plan_batches(vec![call("write", "a"), call("write", "b")], policy);
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn empty_and_single() {
        assert!(plan_batches(vec![], policy).is_empty());
        let single = plan_batches(vec![call("exec", "x")], policy);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].len(), 1);
    }

    #[test]
    fn never_resets_touched_keys() {
        let batches = plan_batches(
            vec![call("write", "a"), call("exec", "x"), call("write", "a")],
            policy,
        );
        assert_eq!(batches.len(), 3);
    }

    #[test]
    fn conditional_without_key_never_conflicts() {
        let batches = plan_batches(
            vec![
                ToolCall::new("1", "write", json!({})),
                ToolCall::new("2", "write", json!({})),
            ],
            policy,
        );
        assert_eq!(batches.len(), 1);
    }

    fn arb_call() -> impl Strategy<Value = ToolCall> {
        (prop_oneof!["read", "write", "exec"], "[abc]", 0u32..1000).prop_map(|(name, path, n)| {
            ToolCall::new(format!("{name}{n}"), name, json!({ "path": path }))
        })
    }

    proptest! {
        #[test]
        fn batches_preserve_order_and_isolation(calls in proptest::collection::vec(arb_call(), 0..24)) {
            let batches = plan_batches(calls.clone(), policy);

            let flat: Vec<ToolCall> = batches.iter().flatten().cloned().collect();
            prop_assert_eq!(&flat, &calls);

            for batch in &batches {
                prop_assert!(!batch.is_empty());
                let has_never = batch.iter().any(|c| policy(&c.name).class == Parallelism::Never);
                if has_never {
                    prop_assert_eq!(batch.len(), 1);
                }
                let mut keys = HashSet::new();
                for c in batch.iter().filter(|c| policy(&c.name).class == Parallelism::Conditional) {
                    let key = c.input["path"].as_str().unwrap().to_owned();
                    prop_assert!(keys.insert(key));
                }
            }
        }
    }
}
