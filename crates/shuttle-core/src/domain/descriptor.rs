//! Workflow descriptor: 型付きの DAG 定義
//!
//! 入力は JSON の形そのまま:
//!
//! ```json
//! {
//!   "starts": ["split:array"],
//!   "tasks": {
//!     "split:array": {
//!       "queue": "split-array",
//!       "starts_manually": ["print:array"],
//!       "starts_with_params": {
//!         "report:success": { "nr_tasks": { "count": "print:array" } }
//!       }
//!     },
//!     "print:array": { "queue": "print-array" },
//!     "report:success": {
//!       "queue": "report-success",
//!       "waits_for": {
//!         "print:array": { "condition": { "param": "nr_tasks", "function": "eq_completed" } }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! 構造の検証は [`DescriptorValidator`](super::validator::DescriptorValidator) が
//! 型変換の前に行います。ここでの型は検証済みの descriptor だけを表します。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub starts: Vec<String>,
    pub tasks: BTreeMap<String, TaskSpec>,
}

/// One task type's entry in the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub queue: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub starts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub starts_parallel: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub starts_manually: Vec<String>,
    /// target task type → (param name → computed source)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub starts_with_params: BTreeMap<String, BTreeMap<String, ParamSource>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub waits_for: BTreeMap<String, WaitSpec>,
}

/// A computed parameter injected into a parametrized fan-out.
///
/// Serialized as a single-entry map `{"<function>": "<source task type>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamSource {
    /// Number of `source` tasks under the parent's lineage.
    Count(String),
}

impl ParamSource {
    pub const FUNCTIONS: &'static [&'static str] = &["count"];

    pub fn source(&self) -> &str {
        match self {
            Self::Count(source) => source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitSpec {
    pub condition: SyncCondition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    pub function: SyncFunction,
}

/// Closed set of join conditions a sync task can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFunction {
    /// The sibling count must reach `payload[param]` and all must be completed.
    EqCompleted,
    /// At least one sibling must exist and all must be completed.
    Completed,
}

impl SyncFunction {
    pub const NAMES: &'static [&'static str] = &["eq_completed", "completed"];

    pub fn requires_param(&self) -> bool {
        matches!(self, Self::EqCompleted)
    }
}

impl Descriptor {
    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.get(name)
    }

    pub fn is_task_name(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// 最初に見つかった、`name` を起動する task type
    pub fn parent_of(&self, name: &str) -> Option<&str> {
        self.tasks
            .iter()
            .find(|(_, spec)| spec.children().any(|child| child == name))
            .map(|(parent, _)| parent.as_str())
    }

    /// `ancestor` から `target` へ降りる task type の列（`ancestor` 自身は含まない）
    ///
    /// `target == ancestor` なら空の列。`target` が `ancestor` の子孫でなければ `None`。
    pub fn path_from_ancestor(&self, ancestor: &str, target: &str) -> Option<Vec<String>> {
        let mut path = vec![target.to_string()];
        let mut current = target;
        while current != ancestor {
            // 検証済みなら循環しないが、未検証の descriptor でも止まるようにする
            if path.len() > self.tasks.len() {
                return None;
            }
            current = self.parent_of(current)?;
            path.push(current.to_string());
        }
        path.pop();
        path.reverse();
        Some(path)
    }
}

impl TaskSpec {
    /// Every task type this one can start, in declaration order.
    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.starts
            .iter()
            .chain(&self.starts_parallel)
            .chain(&self.starts_manually)
            .map(String::as_str)
            .chain(self.starts_with_params.keys().map(String::as_str))
    }

    /// Targets of a split: `starts_parallel` ∪ `starts_manually`, de-duplicated.
    pub fn split_targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = Vec::new();
        for name in self.starts_parallel.iter().chain(&self.starts_manually) {
            if !targets.contains(&name.as_str()) {
                targets.push(name);
            }
        }
        targets
    }
}
