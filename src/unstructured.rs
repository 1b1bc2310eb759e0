use serde_json::{Map, Value};

pub fn nested_field<'a>(document: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(document, |current, key| current.as_object()?.get(*key))
}

pub fn has_nested_field(document: &Value, path: &[&str]) -> bool {
    nested_field(document, path).is_some()
}

pub fn nested_i64(document: &Value, path: &[&str]) -> Option<i64> {
    nested_field(document, path).and_then(Value::as_i64)
}

// Non-objects along the path are replaced by objects.
pub fn set_nested_field(document: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *document = value;
        return;
    };

    let mut current = document;
    for key in parents {
        current = ensure_object(current)
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(current).insert(last.to_string(), value);
}

pub fn remove_nested_field(document: &mut Value, path: &[&str]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut current = document;
    for key in parents {
        current = current.as_object_mut()?.get_mut(*key)?;
    }
    current.as_object_mut()?.remove(*last)
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}
