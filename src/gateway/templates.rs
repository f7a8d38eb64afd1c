//! Prompt template rendering

use crate::error::{GatewayError, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt::Write as _;

/// Prompt kind whose template is a JSON step plan
pub const HIGHER_ORDER_TOOL_KIND: &str = "higher_order_tool";

static TAG_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\{\s*([^}\s]+)\s*\}\}\}|\{\{\s*(&\s*)?([^}\s]+)\s*\}\}").expect("Invalid regex pattern")
});

/// Render a prompt template.
///
/// An empty engine returns the template unchanged. The `mustache` engine
/// substitutes `{{name}}` (HTML-escaped), `{{{name}}}` and `{{& name}}`
/// (raw); dotted names reach into nested objects and unknown names render empty.
pub fn render_template(
    template: &str,
    kind: &str,
    engine: &str,
    arguments: Option<&Map<String, Value>>,
) -> Result<String> {
    let prompt = if kind == HIGHER_ORDER_TOOL_KIND {
        render_higher_order_tool(template)?
    } else {
        template.to_string()
    };

    match engine {
        "" => Ok(prompt),
        "mustache" => Ok(render_mustache(&prompt, arguments)),
        other => Err(GatewayError::bad_request(format!(
            "unsupported template engine: {}",
            other
        ))),
    }
}

fn render_mustache(template: &str, arguments: Option<&Map<String, Value>>) -> String {
    TAG_REGEX
        .replace_all(template, |caps: &Captures<'_>| {
            let (name, raw) = match (caps.get(1), caps.get(3)) {
                (Some(name), _) => (name.as_str(), true),
                (None, Some(name)) => (name.as_str(), caps.get(2).is_some()),
                _ => return String::new(),
            };
            let text = lookup(arguments, name).map(value_text).unwrap_or_default();
            if raw {
                text
            } else {
                escape_html(&text)
            }
        })
        .into_owned()
}

fn lookup<'a>(arguments: Option<&'a Map<String, Value>>, name: &str) -> Option<&'a Value> {
    let mut parts = name.split('.');
    let mut current = arguments?.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct HigherOrderTool {
    tool_name: String,
    purpose: String,
    inputs: Vec<HigherOrderInput>,
    steps: Vec<HigherOrderStep>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HigherOrderInput {
    name: String,
    description: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HigherOrderStep {
    tool: String,
    instructions: String,
    inputs: Vec<String>,
}

/// Turn a JSON step plan into an instruction prompt
fn render_higher_order_tool(template: &str) -> Result<String> {
    let plan: HigherOrderTool = serde_json::from_str(template)
        .map_err(|e| GatewayError::bad_request(format!("failed to unmarshal prompt: {}", e)))?;

    let mut inputs = String::new();
    for input in &plan.inputs {
        let _ = writeln!(inputs, "  <Input name=\"{}\" description=\"{}\" />", input.name, input.description);
    }
    if inputs.is_empty() {
        inputs.push_str("  No inputs needed\n");
    }

    let mut steps = String::new();
    for step in &plan.steps {
        let mut step_inputs = String::new();
        for input in &step.inputs {
            let _ = writeln!(step_inputs, "    <Input name=\"{}\" />", input);
        }
        let instruction = format!("  <Instruction>{}</Instruction>\n{}", step.instructions, step_inputs);
        if step.tool.is_empty() {
            steps.push_str(&instruction);
        } else {
            let _ = write!(
                steps,
                "  <CallTool tool_name=\"{}\">\n  {}  </CallTool>\n",
                step.tool, instruction
            );
        }
    }

    Ok(format!(
        "<Purpose>\n  <Instruction>\n    - The following is a step-by-step plan to achieve a <Purpose>. It relies on executing other tools available in context to achieve the desired purpose\n    - Do NOT use this tool ({}) again when executing the plan.\n    - You will be provided with a <Purpose>, a list of <Inputs>, and a <Plan>. Your goal is to use the <Plan> and <Inputs> to complete the <Purpose>.\n  </Instruction>\n  <Purpose>\n    {}\n  </Purpose>\n</Purpose>\n<Inputs>\n  <Instruction>\n    Ask me for each of these inputs before proceeding with the <Plan> below.\n  </Instruction>\n{}</Inputs>\n<Plan>\n{}</Plan>",
        plan.tool_name, plan.purpose, inputs, steps
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_mustache_substitution() {
        let a = args(json!({"name": "Jane", "user": {"city": "Oslo"}, "count": 3}));
        let out = render_template(
            "Hi {{name}} from {{ user.city }}, {{count}} items, {{missing}}.",
            "prompt",
            "mustache",
            Some(&a),
        )
        .unwrap();
        assert_eq!(out, "Hi Jane from Oslo, 3 items, .");
    }

    #[test]
    fn test_escaping_and_raw_tags() {
        let a = args(json!({"html": "<b>x</b>"}));
        let out = render_template("{{html}}|{{{html}}}|{{& html}}", "prompt", "mustache", Some(&a)).unwrap();
        assert_eq!(out, "&lt;b&gt;x&lt;/b&gt;|<b>x</b>|<b>x</b>");
    }

    #[test]
    fn test_engine_selection() {
        assert_eq!(render_template("{{a}}", "prompt", "", None).unwrap(), "{{a}}");
        assert!(matches!(
            render_template("x", "prompt", "jinja", None),
            Err(GatewayError::BadRequest { .. })
        ));
    }

    #[test]
    fn test_higher_order_tool() {
        let template = json!({
            "toolName": "onboard",
            "purpose": "Onboard a customer",
            "inputs": [{"name": "email", "description": "Customer email"}],
            "steps": [
                {"tool": "create_user", "instructions": "Create the user", "inputs": ["email"]},
                {"instructions": "Say hello"}
            ]
        })
        .to_string();
        let out = render_template(&template, HIGHER_ORDER_TOOL_KIND, "mustache", None).unwrap();
        assert!(out.contains("Do NOT use this tool (onboard)"));
        assert!(out.contains("<Input name=\"email\" description=\"Customer email\" />"));
        assert!(out.contains("<CallTool tool_name=\"create_user\">"));
        assert!(out.contains("<Instruction>Say hello</Instruction>"));
    }
}
