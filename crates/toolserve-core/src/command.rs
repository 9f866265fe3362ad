use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

static INPUT_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{in:([^}]+)\}").expect("input placeholder pattern is valid"));

/// Substitute `${in:<name>}` placeholders with request values.
///
/// Values are inserted verbatim, without quoting or escaping, and the result goes
/// to the shell as-is. Placeholders naming an absent input stay literal.
pub fn build_command(template: &str, inputs: &Map<String, Value>) -> String {
    INPUT_PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match inputs.get(&caps[1]) {
            Some(value) => render_argument(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Canonical text of a value inside a command line
pub fn render_argument(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
