//! Payload helpers.
//!
//! Payload は JSON object です。job の payload には task type 名をキーにした
//! 上書き用の sub-map を入れられます。task を作るときにそれを展開します。

use serde_json::{Map, Value};

use super::descriptor::Descriptor;

pub type Payload = Map<String, Value>;

/// Payload for a task of type `task_name`.
///
/// task type 名のキーを全部取り除いてから、`task_name` の sub-map を上書きで
/// マージする。他の task type 向けの sub-map は兄弟の payload に漏れない。
pub fn scope_for_task(descriptor: &Descriptor, payload: &Payload, task_name: &str) -> Payload {
    let mut scoped: Payload = payload
        .iter()
        .filter(|(key, _)| !descriptor.is_task_name(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(Value::Object(overrides)) = payload.get(task_name) {
        for (k, v) in overrides {
            scoped.insert(k.clone(), v.clone());
        }
    }
    scoped
}

/// Shallow merge; keys of `overlay` win.
pub fn merge(base: &Payload, overlay: &Payload) -> Payload {
    let mut merged = base.clone();
    for (k, v) in overlay {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Converts an arbitrary JSON value into a payload map.
pub fn from_value(value: Value) -> Option<Payload> {
    match value {
        Value::Object(map) => Some(map),
        Value::Null => Some(Payload::new()),
        _ => None,
    }
}
