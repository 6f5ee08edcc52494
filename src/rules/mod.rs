//! Declarative request filtering.
//!
//! A rule set holds two ordered rule lists: `public` governs traffic entering
//! from outside, `private` governs traffic leaving toward the internal target.
//! Within a list the first matching rule wins.

mod glob;
mod template;
mod validation;

use std::{borrow::Cow, fmt, path::Path};

use percent_encoding::percent_decode_str;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::error::RuleError;
pub use glob::ValuePattern;
pub use template::compile_path;
pub use validation::{ValidationSource, Validations};

/// Which rule list to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Public,
    Private,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => f.write_str("public"),
            Self::Private => f.write_str("private"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RuleSource {
    method: String,
    path: String,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default)]
    valid: Vec<ValidationSource>,
}

#[derive(Debug, Default, Deserialize)]
struct RuleSetSource {
    #[serde(default)]
    public: Vec<RuleSource>,
    #[serde(default)]
    private: Vec<RuleSource>,
}

/// A compiled, immutable access-control entry.
#[derive(Debug, Clone)]
pub struct Rule {
    method: String,
    path: Regex,
    origin: Option<String>,
    validations: Validations,
}

impl Rule {
    fn compile(source: RuleSource) -> Result<Self, RuleError> {
        let path = compile_path(&source.path)?;
        let validations = Validations::compile(source.valid)?;
        if validations.is_inert() {
            warn!(
                method = %source.method,
                path = %source.path,
                "Rule declares validations none of which are recognised; rule matches unconditionally"
            );
        }

        Ok(Self {
            method: source.method,
            path,
            origin: source.origin.filter(|o| !o.is_empty()),
            validations,
        })
    }

    /// Origin override, still carrying any unexpanded `${VAR}` references.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    #[must_use]
    pub fn matches(&self, request: &FilterRequest<'_>) -> bool {
        if !self.method.eq_ignore_ascii_case(request.method) && !self.method.eq_ignore_ascii_case("any")
        {
            return false;
        }
        if !self.path.is_match(request.path) {
            return false;
        }
        if self.validations.declared() == 0 || self.validations.is_inert() {
            return true;
        }
        self.validations.check(request.body, request.query)
    }
}

/// The parts of a request a rule is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct FilterRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub body: &'a [u8],
    pub query: &'a [(String, String)],
}

/// Splits a tunnel request URL (`/path?query`) into its percent-decoded path
/// and decoded query pairs. Rules always see the decoded path; the raw URL is
/// what gets forwarded.
#[must_use]
pub fn split_url(url: &str) -> (Cow<'_, str>, Vec<(String, String)>) {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let path = percent_decode_str(path).decode_utf8_lossy();
    let pairs = url::form_urlencoded::parse(query.as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    (path, pairs)
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    public: Vec<Rule>,
    private: Vec<Rule>,
}

impl RuleSet {
    /// Parses and compiles a rule-set JSON document.
    pub fn compile(source: &[u8]) -> Result<Self, RuleError> {
        let source: RuleSetSource = serde_json::from_slice(source)?;
        Ok(Self {
            public: source
                .public
                .into_iter()
                .map(Rule::compile)
                .collect::<Result<_, _>>()?,
            private: source
                .private
                .into_iter()
                .map(Rule::compile)
                .collect::<Result<_, _>>()?,
        })
    }

    /// Reads and compiles a rule-set file.
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let data = std::fs::read(path).map_err(|source| RuleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::compile(&data)
    }

    #[must_use]
    pub fn rules(&self, direction: Direction) -> &[Rule] {
        match direction {
            Direction::Public => &self.public,
            Direction::Private => &self.private,
        }
    }

    /// Returns the first rule in `direction` that accepts the request.
    #[must_use]
    pub fn find(&self, direction: Direction, request: &FilterRequest<'_>) -> Option<&Rule> {
        self.rules(direction).iter().find(|rule| rule.matches(request))
    }
}
