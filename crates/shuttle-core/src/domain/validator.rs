//! DescriptorValidator - workflow descriptor の構造検証
//!
//! 入力は型のない `serde_json::Value` です。エラーは最初の1件で止めずに全部
//! 集めます。検証は panic せず、必ず結果を返します。
//!
//! # 検査項目
//! 1. descriptor が map、`starts` が配列、`tasks` が map
//! 2. `starts` が空でなく、すべて `tasks` に存在する
//! 3. `tasks` が空でない
//! 4. 各 task type: `queue` が文字列、キーが許可された集合のみ、参照フィールドの形、
//!    参照先の存在、param/sync 関数名が既知のもの
//! 5. `starts_with_params` の param に対応する `waits_for` の condition がある
//! 6. 起動元の task type がひとつだけ（diamond を拒否）、start グラフが循環しない

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use super::descriptor::{Descriptor, ParamSource, SyncFunction};
use super::errors::{Result, ShuttleError};

pub const ALLOWED_KEYS: &[&str] = &[
    "queue",
    "waits_for",
    "starts",
    "starts_parallel",
    "starts_manually",
    "starts_with_params",
];

const SEQUENCE_KEYS: &[&str] = &["starts", "starts_parallel", "starts_manually"];
const MAPPING_KEYS: &[&str] = &["starts_with_params", "waits_for"];

#[derive(Debug, Clone)]
pub struct DescriptorValidator<'a> {
    descriptor: &'a Value,
    errors: Vec<String>,
}

impl<'a> DescriptorValidator<'a> {
    pub fn new(descriptor: &'a Value) -> Self {
        let mut validator = Self {
            descriptor,
            errors: Vec::new(),
        };
        validator.validate();
        validator
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// 検証に通れば型付きの [`Descriptor`] に変換する
    pub fn into_descriptor(mut self) -> Result<Descriptor> {
        if !self.errors.is_empty() {
            return Err(ShuttleError::InvalidDescriptor(self.errors));
        }
        serde_json::from_value(self.descriptor.clone()).map_err(|e| {
            self.errors.push(format!("descriptor could not be read: {e}"));
            ShuttleError::InvalidDescriptor(self.errors)
        })
    }

    fn validate(&mut self) {
        let descriptor = self.descriptor;
        let Some(root) = descriptor.as_object() else {
            self.errors.push("Descriptor type must be a Hash.".into());
            return;
        };

        let entry_points = root.get("starts").and_then(Value::as_array);
        let tasks = root.get("tasks").and_then(Value::as_object);
        if entry_points.is_none() {
            self.errors.push("Entry points (starts) must be an Array.".into());
        }
        if tasks.is_none() {
            self.errors.push("Tasks must be a Hash.".into());
        }

        let empty = Map::new();
        let tasks = tasks.unwrap_or(&empty);

        let entry_points_ok = entry_points.is_some_and(|starts| {
            !starts.is_empty()
                && starts
                    .iter()
                    .all(|name| name.as_str().is_some_and(|n| is_task(tasks, n)))
        });
        if !entry_points_ok {
            self.errors.push(
                "There must be at least 1 entry point, and all entry points must exist in the tasks Hash."
                    .into(),
            );
        }
        if tasks.is_empty() {
            self.errors
                .push("There must be at least 1 task in the tasks Hash.".into());
        }

        for (name, spec) in tasks {
            self.validate_task(tasks, name, spec);
        }
        self.validate_lineage(tasks);
    }

    fn validate_task(&mut self, tasks: &Map<String, Value>, name: &str, spec: &Value) {
        let Some(spec) = spec.as_object() else {
            self.errors.push(format!("{name} must be a Hash"));
            return;
        };

        if !spec.get("queue").is_some_and(|q| q.as_str().is_some_and(|q| !q.is_empty())) {
            self.errors.push(format!("{name} must have a valid queue"));
        }
        if !spec.keys().all(|key| ALLOWED_KEYS.contains(&key.as_str())) {
            self.errors.push(format!(
                "{name} must only contain the following keys: {ALLOWED_KEYS:?}"
            ));
        }

        let formats_ok = SEQUENCE_KEYS
            .iter()
            .all(|key| spec.get(*key).is_none_or(Value::is_array))
            && MAPPING_KEYS
                .iter()
                .all(|key| spec.get(*key).is_none_or(Value::is_object));
        if !formats_ok {
            self.errors
                .push(format!("{name} must follow the reference declaration format"));
            // 参照の形が壊れていると以降の検査は意味を持たない
            return;
        }

        if !references(spec).all(|target| is_task(tasks, target)) {
            self.errors
                .push(format!("{name} must list existing tasks in its references"));
        }

        self.validate_params(tasks, name, spec);
        self.validate_waits(name, spec);
    }

    fn validate_params(&mut self, tasks: &Map<String, Value>, name: &str, spec: &Map<String, Value>) {
        let Some(params) = spec.get("starts_with_params").and_then(Value::as_object) else {
            return;
        };

        let mut matched = true;
        for (target, param_config) in params {
            let Some(param_config) = param_config.as_object() else {
                self.errors
                    .push(format!("{name} must declare params for {target} as a Hash"));
                continue;
            };
            for (param_name, source) in param_config {
                match single_entry(source) {
                    Some((function, source)) => {
                        if !ParamSource::FUNCTIONS.contains(&function) {
                            self.errors
                                .push(format!("{name} uses unknown param function {function:?}"));
                        }
                        if !source.as_str().is_some_and(|s| is_task(tasks, s)) {
                            self.errors.push(format!(
                                "{name} must list existing tasks in its references"
                            ));
                        }
                    }
                    None => self.errors.push(format!(
                        "{name} must declare param {param_name} as {{function: task}}"
                    )),
                }
                if !waits_on_param(tasks, target, param_name) {
                    matched = false;
                }
            }
        }
        if !matched {
            self.errors
                .push(format!("{name} must pass the correct parameters to the sync task"));
        }
    }

    fn validate_waits(&mut self, name: &str, spec: &Map<String, Value>) {
        let Some(waits_for) = spec.get("waits_for").and_then(Value::as_object) else {
            return;
        };

        for (waited, wait) in waits_for {
            let condition = wait.get("condition").and_then(Value::as_object);
            let Some(condition) = condition else {
                self.errors
                    .push(format!("{name} must declare a condition for {waited}"));
                continue;
            };
            let function = condition.get("function").and_then(Value::as_str);
            let Some(function) = function.filter(|f| SyncFunction::NAMES.contains(f)) else {
                self.errors.push(format!(
                    "{name} must use one of {:?} to wait for {waited}",
                    SyncFunction::NAMES
                ));
                continue;
            };
            let has_param = condition.get("param").is_some_and(Value::is_string);
            if function == "eq_completed" && !has_param {
                self.errors
                    .push(format!("{name} must name the param compared by eq_completed"));
            }
        }
    }

    /// 祖先パスが一意に決まることを保証する
    fn validate_lineage(&mut self, tasks: &Map<String, Value>) {
        let mut parents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, spec) in tasks {
            let Some(spec) = spec.as_object() else {
                continue;
            };
            for child in starts_of(spec) {
                parents.entry(child).or_default().insert(name.as_str());
                children.entry(name.as_str()).or_default().push(child);
            }
        }

        for (child, from) in &parents {
            if from.len() > 1 {
                self.errors.push(format!(
                    "{child} must be started by a single task type, found {from:?}"
                ));
            }
        }

        for name in children.keys() {
            if reaches(&children, name, name) {
                self.errors
                    .push(format!("{name} is part of a cycle in the start graph"));
            }
        }
    }
}

fn reaches(children: &BTreeMap<&str, Vec<&str>>, from: &str, target: &str) -> bool {
    let mut stack: Vec<&str> = children.get(from).cloned().unwrap_or_default();
    let mut seen = BTreeSet::new();
    while let Some(name) = stack.pop() {
        if name == target {
            return true;
        }
        if seen.insert(name) {
            stack.extend(children.get(name).into_iter().flatten());
        }
    }
    false
}

fn is_task(tasks: &Map<String, Value>, name: &str) -> bool {
    tasks.get(name).is_some_and(Value::is_object)
}

fn single_entry(value: &Value) -> Option<(&str, &Value)> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.iter().next().map(|(k, v)| (k.as_str(), v))
}

/// Task types started by `spec`, including parametrized targets.
fn starts_of(spec: &Map<String, Value>) -> impl Iterator<Item = &str> {
    SEQUENCE_KEYS
        .iter()
        .filter_map(move |key| spec.get(*key).and_then(Value::as_array))
        .flatten()
        .filter_map(Value::as_str)
        .chain(
            spec.get("starts_with_params")
                .and_then(Value::as_object)
                .into_iter()
                .flat_map(|params| params.keys().map(String::as_str)),
        )
}

/// Every task type named anywhere in `spec`'s reference fields.
fn references(spec: &Map<String, Value>) -> impl Iterator<Item = &str> {
    starts_of(spec).chain(
        spec.get("waits_for")
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|waits| waits.keys().map(String::as_str)),
    )
}

fn waits_on_param(tasks: &Map<String, Value>, target: &str, param_name: &str) -> bool {
    tasks
        .get(target)
        .and_then(|t| t.get("waits_for"))
        .and_then(Value::as_object)
        .is_some_and(|waits| {
            waits.values().any(|wait| {
                wait.pointer("/condition/param").and_then(Value::as_str) == Some(param_name)
            })
        })
}
