//! Loading the RCE tool-integration JSON the server is started with.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::schema::EndpointSpec;

/// Top-level keys an RCE tool integration document may carry
pub const KNOWN_KEYS: &[&str] = &[
    "commandScriptLinux",
    "commandScriptWindows",
    "copyToolBehavior",
    "deleteWorkingDirectoriesAfterWorkflowExecution",
    "deleteWorkingDirectoriesKeep",
    "deleteWorkingDirectoriesNever",
    "deleteWorkingDirectoriesOnce",
    "docFilePath",
    "documentationFilePath",
    "dontCrashOnNonZeroExitCodes",
    "dynamicInputs",
    "dynamicOutputs",
    "enableCommandScriptLinux",
    "enableCommandScriptWindows",
    "groupName",
    "imitationScript",
    "imitationToolOutputFilename",
    "inputs",
    "integrationType",
    "isActive",
    "keepOnFailure",
    "launchSettings",
    "outputs",
    "postScript",
    "preScript",
    "setToolDirAsWorkingDir",
    "toolDescription",
    "toolIconPath",
    "toolIntegrationVersion",
    "toolIntegratorE-Mail",
    "toolIntegratorName",
    "toolName",
    "toolProperties",
    "uploadIcon",
];

/// Closest known key counts as a suggestion only within this edit distance
const SUGGESTION_DISTANCE: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid file type: {}. Expected a .json file.", .0.display())]
    InvalidFileType(PathBuf),

    #[error("The file '{}' does not exist.", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid JSON syntax in file '{}': {source}", path.display())]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("The configuration file '{}' must contain a JSON object.", .0.display())]
    NotAnObject(PathBuf),

    #[error("The configuration file contains invalid keys: {keys:?}{hint}")]
    InvalidKeys { keys: Vec<String>, hint: String },

    #[error("Command script execution is disabled in configuration file.")]
    CommandScriptDisabled,

    #[error("No command script specified in the configuration file.")]
    MissingCommandScript,

    #[error("No tool directory specified in the configuration file.")]
    MissingToolDirectory,

    #[error("No inputs specified in the configuration file.")]
    MissingInputs,

    #[error("Invalid {section} endpoint at index {index}: {reason}")]
    InvalidEndpoint {
        section: &'static str,
        index: usize,
        reason: String,
    },

    #[error("Failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    tool_name: String,
    #[serde(default)]
    command_script_linux: String,
    #[serde(default)]
    command_script_windows: String,
    #[serde(default)]
    enable_command_script_linux: bool,
    #[serde(default)]
    enable_command_script_windows: bool,
    #[serde(default)]
    set_tool_dir_as_working_dir: bool,
    #[serde(default)]
    launch_settings: Vec<RawLaunchSettings>,
    #[serde(default)]
    pre_script: String,
    #[serde(default)]
    post_script: String,
    #[serde(default)]
    inputs: Vec<Value>,
    #[serde(default)]
    outputs: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLaunchSettings {
    #[serde(default)]
    tool_directory: String,
}

/// The parts of a tool integration the engine acts on
#[derive(Debug, Clone, Serialize)]
pub struct ToolConfiguration {
    pub tool_name: String,
    /// Command line for the running platform, with `${in:<name>}` placeholders
    pub command_template: String,
    /// Run the tool in `tool_directory` rather than the server's directory
    pub use_tool_directory: bool,
    pub tool_directory: Option<PathBuf>,
    pub pre_script: Option<String>,
    pub post_script: Option<String>,
    pub inputs: Vec<EndpointSpec>,
    pub outputs: Vec<EndpointSpec>,
}

impl ToolConfiguration {
    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_template.trim().is_empty() {
            return Err(ConfigError::MissingCommandScript);
        }
        if self.use_tool_directory && self.tool_directory.is_none() {
            return Err(ConfigError::MissingToolDirectory);
        }
        if self.inputs.is_empty() {
            return Err(ConfigError::MissingInputs);
        }
        Ok(())
    }

    pub fn has_hooks(&self) -> bool {
        self.pre_script.is_some() || self.post_script.is_some()
    }
}

/// A validated configuration together with the document it came from
#[derive(Debug, Clone)]
pub struct LoadedConfiguration {
    pub tool: ToolConfiguration,
    pub document: Value,
    pub path: PathBuf,
}

pub fn load(path: &Path) -> Result<LoadedConfiguration, ConfigError> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
        return Err(ConfigError::InvalidFileType(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let document: Value = serde_json::from_str(&text).map_err(|source| ConfigError::InvalidJson {
        path: path.to_path_buf(),
        source,
    })?;

    let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
    let base_dir = std::path::absolute(parent.unwrap_or_else(|| Path::new("."))).map_err(|source| {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let tool = from_document(&document, &base_dir, path)?;

    tracing::debug!(
        tool = %tool.tool_name,
        inputs = tool.inputs.len(),
        outputs = tool.outputs.len(),
        "Loaded tool configuration from {}",
        path.display()
    );

    Ok(LoadedConfiguration {
        tool,
        document,
        path: path.to_path_buf(),
    })
}

/// Build a [`ToolConfiguration`] from an already parsed document.
///
/// A relative tool directory is taken relative to `base_dir`.
pub fn from_document(
    document: &Value,
    base_dir: &Path,
    origin: &Path,
) -> Result<ToolConfiguration, ConfigError> {
    let Some(object) = document.as_object() else {
        return Err(ConfigError::NotAnObject(origin.to_path_buf()));
    };
    check_keys(object)?;

    let raw: RawConfig =
        serde_json::from_value(document.clone()).map_err(|source| ConfigError::InvalidJson {
            path: origin.to_path_buf(),
            source,
        })?;

    let (enabled, command) = if cfg!(windows) {
        (raw.enable_command_script_windows, raw.command_script_windows)
    } else {
        (raw.enable_command_script_linux, raw.command_script_linux)
    };
    if !enabled {
        return Err(ConfigError::CommandScriptDisabled);
    }

    let tool_directory = raw
        .launch_settings
        .first()
        .map(|settings| settings.tool_directory.trim())
        .filter(|dir| !dir.is_empty())
        .map(|dir| base_dir.join(dir));

    let tool = ToolConfiguration {
        tool_name: raw.tool_name,
        command_template: command,
        use_tool_directory: raw.set_tool_dir_as_working_dir,
        tool_directory,
        pre_script: non_blank(raw.pre_script),
        post_script: non_blank(raw.post_script),
        inputs: endpoints("inputs", raw.inputs)?,
        outputs: endpoints("outputs", raw.outputs)?,
    };
    tool.validate()?;
    Ok(tool)
}

fn check_keys(object: &Map<String, Value>) -> Result<(), ConfigError> {
    let invalid: Vec<String> = object
        .keys()
        .filter(|key| !KNOWN_KEYS.contains(&key.as_str()))
        .cloned()
        .collect();
    if invalid.is_empty() {
        return Ok(());
    }

    let suggestions: Vec<String> = invalid
        .iter()
        .filter_map(|key| suggest_key(key).map(|known| format!("'{key}' -> '{known}'")))
        .collect();
    let hint = if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {})", suggestions.join(", "))
    };
    Err(ConfigError::InvalidKeys { keys: invalid, hint })
}

fn suggest_key(key: &str) -> Option<&'static str> {
    KNOWN_KEYS
        .iter()
        .map(|known| (strsim::levenshtein(key, known), *known))
        .filter(|(distance, _)| *distance <= SUGGESTION_DISTANCE)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, known)| known)
}

fn endpoints(section: &'static str, values: Vec<Value>) -> Result<Vec<EndpointSpec>, ConfigError> {
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            let endpoint: EndpointSpec =
                serde_json::from_value(value).map_err(|e| ConfigError::InvalidEndpoint {
                    section,
                    index,
                    reason: e.to_string(),
                })?;
            if endpoint.name.trim().is_empty() {
                return Err(ConfigError::InvalidEndpoint {
                    section,
                    index,
                    reason: "endpointName is empty".to_string(),
                });
            }
            Ok(endpoint)
        })
        .collect()
}

fn non_blank(script: String) -> Option<String> {
    if script.trim().is_empty() {
        None
    } else {
        Some(script)
    }
}
