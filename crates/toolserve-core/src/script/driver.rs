//! The fixed program hook snippets run inside.
//!
//! The snippet arrives on stdin, the current output variables in
//! `TOOLSERVE_OUTPUT_VARS`. The only name bound for the snippet is
//! `output_vars`. The driver writes exactly one JSON document describing how the
//! snippet ended to the path in `TOOLSERVE_RESULT_FILE`.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

pub const RESULT_FILE_ENV: &str = "TOOLSERVE_RESULT_FILE";
pub const OUTPUT_VARS_ENV: &str = "TOOLSERVE_OUTPUT_VARS";

pub const DRIVER_SOURCE: &str = r#"
import json
import os
import sys
import traceback


def _emit(document):
    with open(os.environ["TOOLSERVE_RESULT_FILE"], "w", encoding="utf-8") as handle:
        json.dump(document, handle, default=str, allow_nan=False)


def _main():
    source = sys.stdin.read()
    output_vars = json.loads(os.environ.get("TOOLSERVE_OUTPUT_VARS") or "{}")
    try:
        exec(compile(source, "<hook>", "exec"), {"output_vars": output_vars})
    except ModuleNotFoundError as exc:
        _emit({"status": "missing_module", "module": exc.name or "", "message": str(exc)})
        return
    except SystemExit as exc:
        if exc.code not in (None, 0):
            _emit({
                "status": "raised",
                "kind": "SystemExit",
                "message": "exit status " + str(exc.code),
                "traceback": traceback.format_exc(),
            })
            return
    except BaseException as exc:
        _emit({
            "status": "raised",
            "kind": type(exc).__name__,
            "message": str(exc),
            "traceback": traceback.format_exc(),
        })
        return
    try:
        _emit({"status": "completed", "output_vars": output_vars})
    except (TypeError, ValueError) as exc:
        _emit({
            "status": "raised",
            "kind": type(exc).__name__,
            "message": "output_vars could not be serialized: " + str(exc),
            "traceback": traceback.format_exc(),
        })


_main()
"#;

static OUTPUT_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{out:(\w+)\}").expect("output placeholder pattern is valid"));

static MISSING_MODULE_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"No module named ['"]([^'"]+)['"]"#).expect("missing module pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScriptOutcome {
    Completed {
        output_vars: Map<String, Value>,
    },
    MissingModule {
        module: String,
        message: String,
    },
    Raised {
        kind: String,
        message: String,
        #[serde(default)]
        traceback: String,
    },
}

/// Resolve `${dir:tool}` and `${out:<name>}` in a hook snippet.
pub fn render_script(source: &str, tool_dir: &Path) -> String {
    let tool_dir = tool_dir.to_string_lossy().replace('\\', "/");
    let source = source.replace("${dir:tool}", &tool_dir);
    OUTPUT_PLACEHOLDER
        .replace_all(&source, "output_vars['$1']")
        .into_owned()
}

/// Installable name for a failed import: the top-level package.
///
/// Falls back to parsing the interpreter message when the exception carried no
/// module name.
pub fn installable_module(module: &str, message: &str) -> Option<String> {
    let full = if module.is_empty() {
        MISSING_MODULE_MESSAGE
            .captures(message)
            .map(|caps| caps[1].to_string())?
    } else {
        module.to_string()
    };
    full.split('.')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}
