use serde_json::Value;

/// Minimal structural validation against a tool's JSON input_schema: checks
/// that every field named in `required` is present and, where the schema
/// names a primitive `type`, that the value's JSON type matches. This is not
/// a full JSON Schema implementation — the closed tool set never needs
/// `oneOf`/`$ref`/pattern constraints, just "is this call well-formed enough
/// to execute".
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
