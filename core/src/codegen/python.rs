//! Python source emission for one tool.
//!
//! Every generated module is a pure function of the tool declaration:
//! properties are walked in sorted order and nothing time- or
//! session-dependent is embedded, so regenerating from an identical tool
//! list produces byte-identical files.

use std::fmt::Write as _;

use pybox_wire::Schema;
use pybox_wire::ToolDecl;
use serde_json::Value;
use sha1::Digest;
use sha1::Sha1;

/// Module names longer than this get truncated with a hash suffix.
const MAX_MODULE_NAME_LENGTH: usize = 64;

/// Python keywords a tool name must not shadow as a module or function.
const PYTHON_KEYWORDS: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del", "elif",
    "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

/// Sanitizes a tool or provider name into a Python module name:
/// `[^a-zA-Z0-9_]` becomes `_`, the result is lowercased, keywords and
/// leading digits get a suffix/prefix, and over-long names are truncated
/// with a stable hash so distinct tools cannot collide.
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_lowercase();
    if sanitized.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    if PYTHON_KEYWORDS.contains(&sanitized.as_str()) {
        sanitized.push('_');
    }
    if sanitized.len() > MAX_MODULE_NAME_LENGTH {
        let mut hasher = Sha1::new();
        hasher.update(sanitized.as_bytes());
        let sha1 = format!("{:x}", hasher.finalize());
        let prefix_len = MAX_MODULE_NAME_LENGTH - sha1.len();
        sanitized = format!("{}{sha1}", &sanitized[..prefix_len]);
    }
    sanitized
}

/// Emits the complete module source for one tool.
pub fn tool_module_source(provider: &str, tool: &ToolDecl) -> String {
    let mut models = Vec::new();
    collect_model(&mut models, "Params", &tool.input_schema);
    let structured = tool.output_schema.is_some();
    if let Some(output_schema) = &tool.output_schema {
        collect_model(&mut models, "Result", output_schema);
    }

    let description = tool
        .description
        .as_deref()
        .unwrap_or("No description provided.")
        .replace("\"\"\"", "\\\"\\\"\\\"");

    let mut src = String::new();
    let _ = writeln!(
        src,
        "\"\"\"Bindings for the `{}` tool of provider `{provider}`.\n\nGenerated from the provider's declared schemas; regenerate instead of\nediting.\n\"\"\"",
        tool.name
    );
    src.push('\n');
    src.push_str("from __future__ import annotations\n\n");
    if !structured {
        src.push_str("import json\n");
    }
    src.push_str("from typing import Any, Literal, Optional, Union\n\n");
    src.push_str("from pydantic import BaseModel, Field\n\n");
    src.push_str("from tools._preamble import invoke_tool\n\n");

    for model in &models {
        src.push('\n');
        src.push_str(model);
    }

    src.push('\n');
    if structured {
        let _ = write!(
            src,
            "\ndef run(params: Params) -> Result:\n    \"\"\"{description}\"\"\"\n    result = invoke_tool(\"{provider}\", \"{tool_name}\", params.model_dump(by_alias=True, exclude_none=True))\n    return Result.model_validate(result)\n",
            tool_name = tool.name,
        );
    } else {
        let _ = write!(
            src,
            "\ndef run(params: Params) -> str:\n    \"\"\"{description}\"\"\"\n    result = invoke_tool(\"{provider}\", \"{tool_name}\", params.model_dump(by_alias=True, exclude_none=True))\n    return result if isinstance(result, str) else json.dumps(result)\n\n\ndef run_parsed(params: Params) -> str:\n    \"\"\"Parsed variant of `run`.\n\n    Regenerated against recorded sample outputs when available; identity\n    over the raw text until then.\n    \"\"\"\n    return run(params)\n",
            tool_name = tool.name,
        );
    }
    src
}

/// Walks the schema depth-first and appends model class definitions,
/// dependencies before dependents.
fn collect_model(models: &mut Vec<String>, class_name: &str, schema: &Schema) {
    let mut body = String::new();
    let _ = writeln!(body, "class {class_name}(BaseModel):");
    if let Some(description) = &schema.description {
        let _ = writeln!(body, "    \"\"\"{}\"\"\"", description.replace("\"\"\"", "\\\"\\\"\\\""));
    }

    let Some(properties) = schema.properties.as_ref().filter(|p| !p.is_empty()) else {
        body.push_str("    pass\n");
        models.push(body);
        return;
    };

    let mut fields = String::new();
    for (field, field_schema) in properties {
        let required = schema
            .required
            .as_ref()
            .is_some_and(|r| r.iter().any(|f| f == field));
        let py_type = python_type(models, class_name, field, field_schema);
        let _ = writeln!(
            fields,
            "    {}",
            render_field(field, &py_type, field_schema, required)
        );
    }
    body.push_str(&fields);
    models.push(body);
}

/// Maps a schema node to a Python type expression, emitting nested model
/// classes as needed.
fn python_type(
    models: &mut Vec<String>,
    parent_class: &str,
    field: &str,
    schema: &Schema,
) -> String {
    if let Some(variants) = &schema.any_of {
        let parts: Vec<String> = variants
            .iter()
            .enumerate()
            .map(|(idx, s)| python_type(models, parent_class, &format!("{field}{idx}"), s))
            .collect();
        return format!("Union[{}]", parts.join(", "));
    }
    if let Some(values) = &schema.enum_values {
        let parts: Vec<String> = values.iter().map(python_literal).collect();
        return format!("Literal[{}]", parts.join(", "));
    }
    match schema.schema_type.as_deref() {
        Some("string") => "str".to_string(),
        Some("integer") => "int".to_string(),
        Some("number") => "float".to_string(),
        Some("boolean") => "bool".to_string(),
        Some("null") => "None".to_string(),
        Some("array") => {
            let inner = match &schema.items {
                Some(items) => python_type(models, parent_class, &format!("{field}Item"), items),
                None => "Any".to_string(),
            };
            format!("list[{inner}]")
        }
        Some("object") => {
            if schema.properties.as_ref().is_some_and(|p| !p.is_empty()) {
                let nested = format!("{parent_class}{}", camel_case(field));
                collect_model(models, &nested, schema);
                nested
            } else {
                "dict[str, Any]".to_string()
            }
        }
        _ => "Any".to_string(),
    }
}

fn render_field(field: &str, py_type: &str, schema: &Schema, required: bool) -> String {
    let name = python_identifier(field);
    let alias = (name != field).then(|| format!("alias=\"{field}\""));

    let mut field_args: Vec<String> = Vec::new();
    if let Some(alias) = alias {
        field_args.push(alias);
    }
    if let Some(min) = schema.minimum {
        field_args.push(format!("ge={min}"));
    }
    if let Some(max) = schema.maximum {
        field_args.push(format!("le={max}"));
    }

    let default = match (&schema.default, required) {
        (Some(value), _) => Some(python_literal(value)),
        (None, false) => Some("None".to_string()),
        (None, true) => None,
    };

    let annotation = if required {
        py_type.to_string()
    } else {
        format!("Optional[{py_type}]")
    };

    match (default, field_args.is_empty()) {
        (None, true) => format!("{name}: {annotation}"),
        (None, false) => format!("{name}: {annotation} = Field({})", field_args.join(", ")),
        (Some(default), true) => format!("{name}: {annotation} = {default}"),
        (Some(default), false) => {
            let mut args = vec![format!("default={default}")];
            args.extend(field_args);
            format!("{name}: {annotation} = Field({})", args.join(", "))
        }
    }
}

fn python_identifier(field: &str) -> String {
    let mut name: String = field
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    if name.is_empty() {
        name.push('_');
    }
    if PYTHON_KEYWORDS.contains(&name.as_str()) {
        name.push('_');
    }
    name
}

fn camel_case(field: &str) -> String {
    field
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn python_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        // JSON string escapes are a subset of Python's.
        Value::String(_) => serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string()),
        Value::Array(entries) => {
            let parts: Vec<String> = entries.iter().map(python_literal).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", serde_json::to_string(k).unwrap_or_default(), python_literal(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}
