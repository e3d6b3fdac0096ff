use serde::Serialize;
use serde_json::Value;

/// Serialize explicit options, dropping every field the caller left unset
///
/// Unset options (`null`) and empty collections are removed so they do not
/// shadow values from lower configuration layers.
pub fn strip_unset<T: Serialize>(input: T) -> Value {
    let mut value = serde_json::to_value(input).unwrap_or(Value::Null);
    strip_unset_recursive(&mut value);
    value
}

fn strip_unset_recursive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let keys_to_remove: Vec<String> = map
                .iter()
                .filter_map(|(k, v)| match v {
                    Value::Null => Some(k.clone()),
                    Value::Array(arr) if arr.is_empty() => Some(k.clone()),
                    Value::Object(obj) if obj.is_empty() => Some(k.clone()),
                    _ => None,
                })
                .collect();

            for key in keys_to_remove {
                map.remove(&key);
            }

            for (_, v) in map.iter_mut() {
                strip_unset_recursive(v);
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                strip_unset_recursive(item);
            }
        }
        _ => {}
    }
}
