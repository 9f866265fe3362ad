use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Anything that looks like a file or directory path: non-empty, single line, and
/// free of characters no mainstream filesystem accepts.
static PATH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^[^\x00\r\n<>|"?*]+$"#).expect("path pattern is valid"));

/// Declared type of an input or output endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
    FileReference,
    List,
    Map,
}

impl DataType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Integer => "Integer",
            Self::Float => "Float",
            Self::Boolean => "Boolean",
            Self::FileReference => "FileReference",
            Self::List => "List",
            Self::Map => "Map",
        }
    }

    /// Whether `value` satisfies this type.
    ///
    /// Integers satisfy `Float`; booleans never satisfy `Integer` or `Float`.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::FileReference => value.as_str().is_some_and(|s| PATH_PATTERN.is_match(s)),
            Self::List => value.is_array(),
            Self::Map => value.is_object(),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported endpoint data type: {0}")]
pub struct UnknownDataType(pub String);

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" | "shorttext" => Ok(Self::String),
            "integer" => Ok(Self::Integer),
            "float" => Ok(Self::Float),
            "boolean" => Ok(Self::Boolean),
            "file" | "filereference" | "file-reference" | "file_reference"
            | "directoryreference" => Ok(Self::FileReference),
            "list" | "array" | "vector" => Ok(Self::List),
            "map" => Ok(Self::Map),
            _ => Err(UnknownDataType(s.to_string())),
        }
    }
}

/// A named, typed endpoint from the tool's input or output declaration.
///
/// The data type is kept as written so an unknown type surfaces per request
/// rather than at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    #[serde(rename = "endpointName")]
    pub name: String,
    #[serde(rename = "endpointDataType")]
    pub data_type: String,
}

impl EndpointSpec {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    pub fn parsed_type(&self) -> Result<DataType, UnknownDataType> {
        self.data_type.parse()
    }
}

/// JSON type name used in mismatch messages
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
