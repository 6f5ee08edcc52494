use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::glob::ValuePattern;
use crate::error::RuleError;

/// A `valid` entry as written in the rule-set JSON.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSource {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub query_param: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Body-path equality check.
#[derive(Debug, Clone)]
pub struct BodyEquals {
    path: Vec<String>,
    value: String,
}

/// Body-path regular-expression check.
#[derive(Debug, Clone)]
pub struct BodyRegex {
    path: Vec<String>,
    regex: Regex,
}

/// Query-parameter allow-list.
#[derive(Debug, Clone)]
pub struct QueryAllowList {
    param: String,
    allowed: Vec<ValuePattern>,
}

/// Compiled validations of one rule, grouped by category in evaluation order.
#[derive(Debug, Clone, Default)]
pub struct Validations {
    body_equals: Vec<BodyEquals>,
    body_regex: Vec<BodyRegex>,
    query: Vec<QueryAllowList>,
    declared: usize,
}

impl Validations {
    pub fn compile(sources: Vec<ValidationSource>) -> Result<Self, RuleError> {
        let mut validations = Self {
            declared: sources.len(),
            ..Self::default()
        };

        for source in sources {
            match (source.path.filter(|p| !p.is_empty()), source.query_param) {
                (Some(path), _) => {
                    let segments = path.split('.').map(str::to_string).collect();
                    match source.regex.filter(|r| !r.is_empty()) {
                        Some(pattern) => {
                            let regex =
                                Regex::new(&pattern).map_err(|source| RuleError::BodyRegex {
                                    path: path.clone(),
                                    pattern: pattern.clone(),
                                    source,
                                })?;
                            validations.body_regex.push(BodyRegex {
                                path: segments,
                                regex,
                            });
                        }
                        None => validations.body_equals.push(BodyEquals {
                            path: segments,
                            value: source.value.unwrap_or_default(),
                        }),
                    }
                }
                (None, Some(param)) if !param.is_empty() => {
                    validations.query.push(QueryAllowList {
                        param,
                        allowed: source.values.iter().map(|v| ValuePattern::compile(v)).collect(),
                    });
                }
                _ => {}
            }
        }

        Ok(validations)
    }

    /// Number of `valid` entries the rule declared, recognised or not.
    #[must_use]
    pub const fn declared(&self) -> usize {
        self.declared
    }

    /// True when entries were declared but none fell into a known category.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.declared > 0 && !self.has_body() && self.query.is_empty()
    }

    fn has_body(&self) -> bool {
        !self.body_equals.is_empty() || !self.body_regex.is_empty()
    }

    /// Evaluates the validations against a request body and query.
    ///
    /// Body equality checks are tried first, then body regex checks; either
    /// succeeding accepts. Otherwise every query allow-list must pass.
    pub fn check(&self, body: &[u8], query: &[(String, String)]) -> bool {
        let parsed: Option<Value> = if self.has_body() {
            serde_json::from_slice(body).ok()
        } else {
            None
        };

        if let Some(parsed) = &parsed {
            if self
                .body_equals
                .iter()
                .any(|check| match_path(parsed, &check.path, &|leaf: &str| leaf == check.value))
            {
                return true;
            }
            if self
                .body_regex
                .iter()
                .any(|check| match_path(parsed, &check.path, &|leaf: &str| check.regex.is_match(leaf)))
            {
                return true;
            }
        }

        if self.query.is_empty() {
            return false;
        }

        self.query.iter().all(|list| {
            let value = query
                .iter()
                .find(|(name, _)| *name == list.param)
                .map_or("", |(_, value)| value.as_str());
            list.allowed.iter().any(|pattern| pattern.matches(value))
        })
    }
}

/// Walks `path` through `data`; a `*` component fans out over every array
/// element or object value and succeeds if any branch does.
fn match_path(data: &Value, path: &[String], check: &dyn Fn(&str) -> bool) -> bool {
    let Some((head, rest)) = path.split_first() else {
        return check(&leaf_string(data));
    };

    if head == "*" {
        return match data {
            Value::Array(items) => items.iter().any(|item| match_path(item, rest, check)),
            Value::Object(map) => map.values().any(|item| match_path(item, rest, check)),
            _ => false,
        };
    }

    match data {
        Value::Object(map) => map
            .get(head.as_str())
            .is_some_and(|item| match_path(item, rest, check)),
        _ => false,
    }
}

fn leaf_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
