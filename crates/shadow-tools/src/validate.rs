use serde_json::Value;

/// Structural validation against a tool's `input_schema`: required fields
/// present, primitive types match. Mirrors the Stream Processor's repair-path
/// validator — kept as a separate small copy here so this crate doesn't need
/// to depend on `shadow-provider` just for one helper.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let input_schema = &schema["input_schema"];
    let Some(properties) = input_schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    if let Some(required) = input_schema.get("required").and_then(Value::as_array) {
        for field in required {
            let Some(field_name) = field.as_str() else { continue };
            if args.get(field_name).is_none() {
                return Err(format!("missing required field `{field_name}`"));
            }
        }
    }

    for (name, prop_schema) in properties {
        let Some(value) = args.get(name) else { continue };
        let Some(expected_type) = prop_schema.get("type").and_then(Value::as_str) else {
            continue;
        };
        if !type_matches(expected_type, value) {
            return Err(format!(
                "field `{name}` expected type `{expected_type}`, got `{value}`"
            ));
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_missing_required() {
        let schema = json!({"input_schema": {"type": "object", "properties": {"a": {"type": "string"}}, "required": ["a"]}});
        assert!(validate_args(&schema, &json!({})).is_err());
    }
}
