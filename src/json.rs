//! Conversions between [`Value`] and `serde_json` data.
//!
//! JSON carries data only: strings stay strings and are never read as
//! symbols, so nothing built from JSON is evaluable.

use crate::Error;
use crate::ast::{Keywords, Value};
use crate::evaluator::Environment;

impl Value {
    /// Convert JSON data. Numbers must be integers that fit in an `i64`.
    pub fn from_json(json: serde_json::Value) -> Result<Value, Error> {
        match json {
            serde_json::Value::Null => Ok(Value::Nil),
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::Number(n) => n.as_i64().map(Value::Number).ok_or_else(|| {
                Error::TypeError(format!("Number too large or not integer: {n}"))
            }),
            serde_json::Value::String(s) => Ok(Value::String(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Value::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            serde_json::Value::Object(obj) => obj
                .into_iter()
                .map(|(k, v)| Value::from_json(v).map(|v| (k, v)))
                .collect::<Result<Keywords, Error>>()
                .map(Value::Map),
        }
    }

    /// Convert to JSON data. Stacks become arrays, bottom first. Code values
    /// (symbols, call nodes, quotes, callables and combinators) are rejected.
    pub fn to_json(&self) -> Result<serde_json::Value, Error> {
        match self {
            Value::Nil => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Number(n) => Ok(serde_json::Value::Number(serde_json::Number::from(*n))),
            Value::String(s) => Ok(serde_json::Value::String(s.clone())),
            Value::List(items) => items
                .iter()
                .map(Value::to_json)
                .collect::<Result<Vec<_>, _>>()
                .map(serde_json::Value::Array),
            Value::Stack(stack) => stack
                .to_vec()
                .iter()
                .map(Value::to_json)
                .collect::<Result<Vec<_>, _>>()
                .map(serde_json::Value::Array),
            Value::Map(map) => map
                .iter()
                .map(|(k, v)| v.to_json().map(|v| (k.to_owned(), v)))
                .collect::<Result<serde_json::Map<_, _>, Error>>()
                .map(serde_json::Value::Object),
            other => Err(Error::TypeError(format!(
                "cannot convert {} to JSON: {other}",
                other.type_name()
            ))),
        }
    }
}

impl Environment {
    /// An environment binding each key of a JSON object to its value
    pub fn from_json_object(json: serde_json::Value) -> Result<Environment, Error> {
        let mut env = Environment::new();
        env.define_json_object(json)?;
        Ok(env)
    }

    /// Parse `input` as a JSON object and bind its keys
    pub fn from_json_str(input: &str) -> Result<Environment, Error> {
        let json: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| Error::TypeError(format!("Invalid JSON: {e}")))?;
        Environment::from_json_object(json)
    }

    /// Bind each key of a JSON object in this scope
    pub fn define_json_object(&mut self, json: serde_json::Value) -> Result<(), Error> {
        let serde_json::Value::Object(obj) = json else {
            return Err(Error::TypeError(format!(
                "expected a JSON object, got {json}"
            )));
        };
        for (name, value) in obj {
            self.define(&name, Value::from_json(value)?);
        }
        Ok(())
    }
}
