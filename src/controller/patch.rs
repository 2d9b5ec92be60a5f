//! JSON helpers for change detection and merge patches

use serde_json::{Map, Value};

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Whether every field set in `desired` holds the same value in `live`.
///
/// Fields only present in `live` (server defaults, status) are ignored.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d.iter().all(|(k, v)| match l.get(k) {
            Some(lv) => is_subset(v, lv),
            None => is_empty_value(v),
        }),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(a, b)| is_subset(a, b))
        }
        (d, l) => d == l,
    }
}

/// JSON merge patch (RFC 7386) turning `old` into `new`, `None` when equal
pub fn merge_patch_diff(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            let mut patch = Map::new();
            for (k, nv) in n {
                match o.get(k) {
                    Some(ov) => {
                        if let Some(p) = merge_patch_diff(ov, nv) {
                            patch.insert(k.clone(), p);
                        }
                    }
                    None => {
                        patch.insert(k.clone(), nv.clone());
                    }
                }
            }
            for k in o.keys() {
                if !n.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        (o, n) if o == n => None,
        (_, n) => Some(n.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subset_ignores_server_fields() {
        let desired = json!({"spec": {"image": "a", "args": ["x"]}});
        let live = json!({"spec": {"image": "a", "args": ["x"], "policy": "Always"}, "status": {}});
        assert!(is_subset(&desired, &live));

        let changed = json!({"spec": {"image": "b", "args": ["x"]}});
        assert!(!is_subset(&changed, &live));

        let empty_list = json!({"spec": {"image": "a", "volumes": []}});
        assert!(is_subset(&empty_list, &live));
    }

    #[test]
    fn test_merge_patch_diff() {
        let old = json!({"moduleLoader": {"desiredNumber": 1, "availableNumber": 1}, "devicePlugin": {"desiredNumber": 1}});
        let new = json!({"moduleLoader": {"desiredNumber": 2, "availableNumber": 1}});
        assert_eq!(
            merge_patch_diff(&old, &new),
            Some(json!({"moduleLoader": {"desiredNumber": 2}, "devicePlugin": null}))
        );
        assert_eq!(merge_patch_diff(&new, &new), None);
    }
}
