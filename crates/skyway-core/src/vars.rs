//! `((var))` interpolation over JSON values.
//!
//! References look like `((name))`, `((name.field))` or
//! `((source:path.field))`. Lookup is async (credential managers live behind
//! network calls), so interpolation collects every reference first, resolves
//! them, then substitutes.

use crate::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

fn var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\(\(([-/.\w:\x22' ]+)\)\)").expect("variable pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarRef {
    pub source: Option<String>,
    pub path: String,
    pub fields: Vec<String>,
}

impl VarRef {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let (source, rest) = match raw.split_once(':') {
            Some((s, r)) => (Some(s.to_string()), r),
            None => (None, raw),
        };
        let mut parts = rest.split('.').map(|p| p.trim_matches('"').to_string());
        let path = parts.next().unwrap_or_default();
        Self {
            source,
            path,
            fields: parts.collect(),
        }
    }

    pub fn name(&self) -> String {
        let mut name = match &self.source {
            Some(s) => format!("{s}:{}", self.path),
            None => self.path.clone(),
        };
        for field in &self.fields {
            name.push('.');
            name.push_str(field);
        }
        name
    }
}

/// A source of variable values.
#[async_trait]
pub trait Variables: Send + Sync {
    /// Look up the value at `var.path`; fields are applied by the caller.
    async fn get(&self, var: &VarRef) -> Result<Option<Value>>;
}

/// Fixed variables, as passed to `set_pipeline` via `vars:`.
#[derive(Debug, Clone, Default)]
pub struct StaticVariables(Map<String, Value>);

impl StaticVariables {
    pub fn new(vars: Map<String, Value>) -> Self {
        Self(vars)
    }
}

#[async_trait]
impl Variables for StaticVariables {
    async fn get(&self, var: &VarRef) -> Result<Option<Value>> {
        if var.source.is_some() {
            return Ok(None);
        }
        Ok(self.0.get(&var.path).cloned())
    }
}

/// Tries each source in turn.
pub struct MultiVariables(Vec<std::sync::Arc<dyn Variables>>);

impl MultiVariables {
    pub fn new(sources: Vec<std::sync::Arc<dyn Variables>>) -> Self {
        Self(sources)
    }
}

#[async_trait]
impl Variables for MultiVariables {
    async fn get(&self, var: &VarRef) -> Result<Option<Value>> {
        for source in &self.0 {
            if let Some(v) = source.get(var).await? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }
}

/// Result of interpolation; `secrets` lists every resolved string value, for
/// output redaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpolated {
    pub value: Value,
    pub secrets: Vec<String>,
}

pub async fn interpolate(value: &Value, vars: &dyn Variables) -> Result<Interpolated> {
    let mut refs = BTreeSet::new();
    collect_refs(value, &mut refs);
    if refs.is_empty() {
        return Ok(Interpolated {
            value: value.clone(),
            secrets: Vec::new(),
        });
    }

    let mut resolved = BTreeMap::new();
    let mut secrets = Vec::new();
    for raw in refs {
        let var = VarRef::parse(&raw);
        let found = vars
            .get(&var)
            .await?
            .ok_or_else(|| Error::SecretNotFound(var.name()))?;
        let leaf = select_fields(found, &var)?;
        collect_secrets(&leaf, &mut secrets);
        resolved.insert(raw, leaf);
    }

    Ok(Interpolated {
        value: substitute(value, &resolved),
        secrets,
    })
}

/// Interpolate a map, such as a resource's `source`.
pub async fn interpolate_map(map: &Map<String, Value>, vars: &dyn Variables) -> Result<(Map<String, Value>, Vec<String>)> {
    let out = interpolate(&Value::Object(map.clone()), vars).await?;
    match out.value {
        Value::Object(m) => Ok((m, out.secrets)),
        _ => Err(Error::Internal("interpolated map is no longer a map".to_string())),
    }
}

fn collect_refs(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for caps in var_regex().captures_iter(s) {
                if let Some(m) = caps.get(1) {
                    out.insert(m.as_str().to_string());
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        Value::Object(map) => {
            for (k, v) in map {
                collect_refs(&Value::String(k.clone()), out);
                collect_refs(v, out);
            }
        }
        _ => {}
    }
}

fn select_fields(mut value: Value, var: &VarRef) -> Result<Value> {
    for field in &var.fields {
        value = value
            .get(field)
            .cloned()
            .ok_or_else(|| Error::SecretNotFound(var.name()))?;
    }
    Ok(value)
}

fn collect_secrets(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_secrets(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_secrets(v, out)),
        _ => {}
    }
}

fn substitute(value: &Value, resolved: &BTreeMap<String, Value>) -> Value {
    match value {
        Value::String(s) => substitute_str(s, resolved),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, resolved)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let key = match substitute_str(k, resolved) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (key, substitute(v, resolved))
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(s: &str, resolved: &BTreeMap<String, Value>) -> Value {
    let re = var_regex();
    // A string that is exactly one reference takes the value's own type.
    if let Some(caps) = re.captures(s) {
        if let Some(whole) = caps.get(0) {
            if whole.start() == 0 && whole.end() == s.len() {
                if let Some(v) = caps.get(1).and_then(|m| resolved.get(m.as_str())) {
                    return v.clone();
                }
            }
        }
    }
    let replaced = re.replace_all(s, |caps: &regex::Captures| {
        let key = caps.get(1).map_or("", |m| m.as_str());
        match resolved.get(key) {
            Some(Value::String(v)) => v.clone(),
            Some(other) => other.to_string(),
            None => caps.get(0).map_or("", |m| m.as_str()).to_string(),
        }
    });
    Value::String(replaced.into_owned())
}
