//! Desired-over-live merging for create-or-update.
//!
//! The desired object only names the fields this operator manages. A live
//! object "matches" when every managed field already has the desired value,
//! so fields the platform or other controllers add never trigger writes.

use serde_json::{Map, Value};

use crate::crds::validation::parse_quantity;
use crate::store::WorkloadKind;

/// Keys whose values are maps of resource quantities.
const QUANTITY_MAPS: [&str; 2] = ["requests", "limits"];

/// Fields that cannot change after creation, by kind.
fn immutable_paths(kind: WorkloadKind) -> &'static [&'static [&'static str]] {
    match kind {
        WorkloadKind::StatefulSet => &[
            &["spec", "selector"],
            &["spec", "serviceName"],
            &["spec", "volumeClaimTemplates"],
            &["spec", "podManagementPolicy"],
        ],
        WorkloadKind::Deployment => &[&["spec", "selector"]],
        WorkloadKind::Service => &[&["spec", "clusterIP"], &["spec", "clusterIPs"]],
    }
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

fn set(value: &mut Value, path: &[&str], new: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = value;
    for key in parents {
        let Some(obj) = cursor.as_object_mut() else {
            return;
        };
        cursor = obj
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Some(obj) = cursor.as_object_mut() {
        obj.insert(last.to_string(), new);
    }
}

fn remove(value: &mut Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = value;
    for key in parents {
        match cursor.get_mut(key) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Some(obj) = cursor.as_object_mut() {
        obj.remove(*last);
    }
}

/// Carry immutable fields over from the live object so an update never
/// tries to change them.
pub fn preserve_immutable(kind: WorkloadKind, desired: &mut Value, live: &Value) {
    for path in immutable_paths(kind) {
        match lookup(live, path) {
            Some(v) => set(desired, path, v.clone()),
            None => remove(desired, path),
        }
    }
}

/// Whether every field present in `desired` has the same value in `live`.
///
/// Objects compare key by key, arrays element by element with equal length.
/// `null` in `desired` matches a missing field. Entries of `requests` and
/// `limits` compare by quantity value, since the API server stores them in
/// canonical form (`0.5` comes back as `500m`, `1024Mi` as `1Gi`).
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    subset(desired, live, false)
}

fn subset(desired: &Value, live: &Value, quantities: bool) -> bool {
    match (desired, live) {
        (Value::Null, _) => true,
        (Value::Object(d), Value::Object(l)) => d.iter().all(|(k, dv)| match l.get(k) {
            Some(lv) => subset(dv, lv, QUANTITY_MAPS.contains(&k.as_str())),
            None => dv.is_null(),
        }),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| subset(dv, lv, false))
        }
        (Value::String(d), Value::String(l)) if quantities && d != l => same_quantity(d, l),
        (d, l) => d == l,
    }
}

fn same_quantity(a: &str, b: &str) -> bool {
    match (parse_quantity(a), parse_quantity(b)) {
        (Ok(a), Ok(b)) => (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()) * 4.0,
        _ => false,
    }
}

/// Overlay `desired` onto `live`.
///
/// Objects merge recursively; arrays and scalars from `desired` replace the
/// live value. Everything `desired` does not mention is kept, including
/// `metadata.resourceVersion`, which makes the resulting update conditional.
pub fn merge(live: &Value, desired: &Value) -> Value {
    match (live, desired) {
        (Value::Object(l), Value::Object(d)) => {
            let mut out = l.clone();
            for (k, dv) in d {
                if dv.is_null() {
                    continue;
                }
                let merged = match l.get(k) {
                    Some(lv) => merge(lv, dv),
                    None => dv.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (_, d) => d.clone(),
    }
}

/// Top-level keys of `desired` that differ from `live`, for logging.
pub fn changed_fields(desired: &Value, live: &Value) -> Vec<String> {
    let (Some(d), Some(l)) = (desired.as_object(), live.as_object()) else {
        return vec![];
    };
    let mut out = vec![];
    for (section, dv) in d {
        let lv = l.get(section).unwrap_or(&Value::Null);
        match (dv.as_object(), lv.as_object()) {
            (Some(dsub), Some(lsub)) => {
                for (k, v) in dsub {
                    if !is_subset(v, lsub.get(k).unwrap_or(&Value::Null)) {
                        out.push(format!("{section}.{k}"));
                    }
                }
            }
            _ if !is_subset(dv, lv) => out.push(section.clone()),
            _ => {}
        }
    }
    out
}
