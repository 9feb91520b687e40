//! Schema-less document decoding
//!
//! Documents are parsed with yaml-rust2 and converted to `serde_json::Value`,
//! so any kind can be handled without a compiled schema.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use k3sd_common::{Error, Result};

/// Parse a single YAML document into a JSON value.
///
/// Empty input yields `Value::Null`; additional documents are ignored.
pub fn parse_yaml(input: &str) -> Result<Value> {
    let docs = YamlLoader::load_from_str(input)
        .map_err(|e| Error::serialization(format!("invalid YAML: {}", e)))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

fn yaml_to_json(yaml: Yaml) -> Result<Value> {
    Ok(match yaml {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::Number(i.into()),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|_| Error::serialization(format!("invalid float '{}'", s)))?;
            Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => Value::Array(
            items
                .into_iter()
                .map(yaml_to_json)
                .collect::<Result<Vec<_>>>()?,
        ),
        Yaml::Hash(map) => {
            let mut object = Map::with_capacity(map.len());
            for (k, v) in map {
                object.insert(yaml_key(k)?, yaml_to_json(v)?);
            }
            Value::Object(object)
        }
        Yaml::Alias(_) => return Err(Error::serialization("YAML aliases are not supported")),
        Yaml::BadValue => return Err(Error::serialization("bad YAML value")),
    })
}

fn yaml_key(key: Yaml) -> Result<String> {
    match key {
        Yaml::String(s) | Yaml::Real(s) => Ok(s),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Boolean(b) => Ok(b.to_string()),
        Yaml::Null => Ok("null".to_string()),
        _ => Err(Error::serialization("unsupported YAML key type")),
    }
}

/// A decoded document with the identity fields the applier needs
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestObject {
    /// `apiVersion`, e.g. `apps/v1`
    pub api_version: String,
    /// `kind`, e.g. `Deployment`
    pub kind: String,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, if set and non-empty
    pub namespace: Option<String>,
    /// The whole document
    pub value: Value,
}

impl ManifestObject {
    /// Decode one document, requiring `apiVersion`, `kind` and `metadata.name`
    pub fn decode(document: &str) -> Result<Self> {
        let value = parse_yaml(document)?;
        if !value.is_object() {
            return Err(Error::serialization("document is not a mapping"));
        }

        let field = |pointer: &str| {
            value
                .pointer(pointer)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let missing = |name: &str| Error::serialization(format!("document has no {}", name));

        let api_version = field("/apiVersion").ok_or_else(|| missing("apiVersion"))?;
        let kind = field("/kind").ok_or_else(|| missing("kind"))?;
        let name = field("/metadata/name").ok_or_else(|| missing("metadata.name"))?;
        let namespace = field("/metadata/namespace");

        Ok(Self {
            api_version,
            kind,
            name,
            namespace,
            value,
        })
    }

    /// `Kind/name` for log lines
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}
