//! Request input and hook output validation against the declared endpoints.
//!
//! Input validation runs the checks in a fixed order (unexpected keys, missing
//! keys, empty values, types) and stops at the first category that fails. Each
//! category is a separate function so it can be exercised on its own.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::schema::{json_type_name, DataType, EndpointSpec};

pub fn validate_inputs(inputs: &Map<String, Value>, schema: &[EndpointSpec]) -> Result<()> {
    check_unexpected_inputs(inputs, schema)?;
    check_missing_inputs(inputs, schema)?;
    check_empty_inputs(inputs, schema)?;
    check_input_types(inputs, schema)
}

pub fn check_unexpected_inputs(inputs: &Map<String, Value>, schema: &[EndpointSpec]) -> Result<()> {
    let names = undeclared_keys(inputs, schema);
    if names.is_empty() {
        Ok(())
    } else {
        Err(Error::UnexpectedInput { names })
    }
}

pub fn check_missing_inputs(inputs: &Map<String, Value>, schema: &[EndpointSpec]) -> Result<()> {
    match schema.iter().find(|spec| !inputs.contains_key(&spec.name)) {
        Some(spec) => Err(Error::MissingInput {
            name: spec.name.clone(),
        }),
        None => Ok(()),
    }
}

pub fn check_empty_inputs(inputs: &Map<String, Value>, schema: &[EndpointSpec]) -> Result<()> {
    for spec in schema {
        if inputs.get(&spec.name).is_some_and(Value::is_null) {
            return Err(Error::EmptyInput {
                name: spec.name.clone(),
            });
        }
    }
    Ok(())
}

pub fn check_input_types(inputs: &Map<String, Value>, schema: &[EndpointSpec]) -> Result<()> {
    for spec in schema {
        let Some(value) = inputs.get(&spec.name) else {
            continue;
        };
        let expected = declared_type(spec)?;
        if !expected.matches(value) {
            return Err(Error::InputTypeMismatch {
                name: spec.name.clone(),
                expected,
                found: json_type_name(value),
                value: render_value(value),
            });
        }
    }
    Ok(())
}

/// Validate the variables a post-script produced.
///
/// Only produced keys are checked: a declared output the script never set is
/// not an error here.
pub fn validate_outputs(outputs: &Map<String, Value>, schema: &[EndpointSpec]) -> Result<()> {
    let names = undeclared_keys(outputs, schema);
    if !names.is_empty() {
        return Err(Error::UnexpectedOutput { names });
    }

    for spec in schema {
        let Some(value) = outputs.get(&spec.name) else {
            continue;
        };
        if value.is_null() {
            return Err(Error::EmptyOutput {
                name: spec.name.clone(),
            });
        }
        let expected = declared_type(spec)?;
        if !expected.matches(value) {
            return Err(Error::OutputTypeMismatch {
                name: spec.name.clone(),
                expected,
                found: json_type_name(value),
                value: render_value(value),
            });
        }
    }
    Ok(())
}

fn undeclared_keys(values: &Map<String, Value>, schema: &[EndpointSpec]) -> Vec<String> {
    let declared: HashSet<&str> = schema.iter().map(|spec| spec.name.as_str()).collect();
    let mut names: Vec<String> = values
        .keys()
        .filter(|key| !declared.contains(key.as_str()))
        .cloned()
        .collect();
    names.sort();
    names
}

fn declared_type(spec: &EndpointSpec) -> Result<DataType> {
    spec.parsed_type().map_err(|_| Error::UnsupportedDataType {
        name: spec.name.clone(),
        data_type: spec.data_type.clone(),
    })
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
