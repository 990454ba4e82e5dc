//! Schema conversion
//!
//! Turns a provider's declared tools into the typed API description embedded
//! in generated worker programs, and accounts schema sizes for the
//! efficiency metrics.

use serde_json::Value;

use crate::protocol::ToolDescriptor;

/// Synthesize the typed API text for a tool set.
///
/// The output is a TypeScript-flavored description: one async function
/// declaration per tool with its input object type and a doc line from the
/// tool description. It is reference text for whoever writes snippets, not
/// compiled code.
#[must_use]
pub fn typed_api_text(tools: &[ToolDescriptor]) -> String {
    let mut out = String::from("// Tools available via the `tools` proxy\n");
    for tool in tools {
        out.push('\n');
        if let Some(ref description) = tool.description {
            for line in description.lines().take(3) {
                out.push_str("// ");
                out.push_str(line.trim());
                out.push('\n');
            }
        }
        out.push_str(&format!(
            "async function {}(input: {}): Promise<any>;\n",
            sanitize_identifier(&tool.name),
            input_type(&tool.input_schema),
        ));
    }
    out
}

/// Mechanically sanitize a tool name into a valid identifier.
///
/// Every character outside `[A-Za-z0-9_$]` becomes `_`; a leading digit is
/// prefixed. Names stay opaque at the protocol layer; this is only for
/// synthesized program text.
#[must_use]
pub fn sanitize_identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if ident.is_empty() || ident.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}

/// Render the input object type for a tool's JSON schema
fn input_type(schema: &Value) -> String {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return "{}".to_string();
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut fields: Vec<String> = Vec::with_capacity(properties.len());
    for (name, prop) in properties {
        let marker = if required.contains(&name.as_str()) { "" } else { "?" };
        fields.push(format!("{name}{marker}: {}", field_type(prop)));
    }
    format!("{{{}}}", fields.join(", "))
}

/// Render a single property type
fn field_type(prop: &Value) -> String {
    match prop.get("type").and_then(Value::as_str) {
        Some("string") => {
            if let Some(options) = prop.get("enum").and_then(Value::as_array) {
                let variants: Vec<String> = options
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|v| format!("\"{v}\""))
                    .collect();
                if variants.is_empty() {
                    "string".to_string()
                } else {
                    variants.join(" | ")
                }
            } else {
                "string".to_string()
            }
        }
        Some("number" | "integer") => "number".to_string(),
        Some("boolean") => "boolean".to_string(),
        Some("array") => {
            let item = prop.get("items").map_or("any".to_string(), field_type);
            format!("{item}[]")
        }
        Some("object") => input_type(prop),
        _ => "any".to_string(),
    }
}

/// Character count of one tool's serialized descriptor
#[must_use]
pub fn tool_schema_chars(tool: &ToolDescriptor) -> usize {
    serde_json::to_string(tool).map_or(0, |s| s.len())
}

/// Character count of a whole tool set's serialized descriptors
#[must_use]
pub fn total_schema_chars(tools: &[ToolDescriptor]) -> usize {
    tools.iter().map(tool_schema_chars).sum()
}
