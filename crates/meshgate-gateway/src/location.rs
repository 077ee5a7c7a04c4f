//! Path-based location matching for upstream rewrites.

use regex::RegexBuilder;
use serde::Deserialize;

use crate::error::GatewayError;

/// One configured location: a pattern and the upstream path it rewrites to.
///
/// Pattern syntax follows the usual location conventions: `= /path` is an
/// exact match, `~ expr` a regex, `~* expr` a case-insensitive regex, and
/// anything else a prefix match.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationRule {
    pub pattern: String,
    pub rewrite: String,
}

#[derive(Debug)]
enum CompiledMatch {
    Exact(String),
    Prefix(String),
    Regex(regex::Regex),
}

impl CompiledMatch {
    fn accepts(&self, path: &str) -> bool {
        match self {
            CompiledMatch::Exact(p) => path == p,
            CompiledMatch::Prefix(p) => path.starts_with(p.as_str()),
            CompiledMatch::Regex(re) => re.is_match(path),
        }
    }
}

/// Compiled, ordered location set. First match wins.
#[derive(Debug, Default)]
pub struct LocationMatcher {
    locations: Vec<(CompiledMatch, String)>,
}

impl LocationMatcher {
    pub fn new(rules: &[LocationRule]) -> Result<Self, GatewayError> {
        let mut locations = Vec::with_capacity(rules.len());
        for rule in rules {
            let compiled = compile_pattern(&rule.pattern)?;
            locations.push((compiled, rule.rewrite.clone()));
        }
        Ok(Self { locations })
    }

    /// Returns the rewrite path of the first location accepting `path`.
    #[must_use]
    pub fn pick(&self, path: &str) -> Option<&str> {
        self.locations
            .iter()
            .find(|(m, _)| m.accepts(path))
            .map(|(_, rewrite)| rewrite.as_str())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

fn compile_pattern(pattern: &str) -> Result<CompiledMatch, GatewayError> {
    if let Some(path) = pattern.strip_prefix("= ") {
        return Ok(CompiledMatch::Exact(path.trim().to_owned()));
    }
    if let Some(expr) = pattern.strip_prefix("~* ") {
        let re = RegexBuilder::new(expr.trim())
            .case_insensitive(true)
            .build()
            .map_err(|e| GatewayError::Config(format!("bad location pattern {pattern:?}: {e}")))?;
        return Ok(CompiledMatch::Regex(re));
    }
    if let Some(expr) = pattern.strip_prefix("~ ") {
        let re = RegexBuilder::new(expr.trim())
            .build()
            .map_err(|e| GatewayError::Config(format!("bad location pattern {pattern:?}: {e}")))?;
        return Ok(CompiledMatch::Regex(re));
    }
    Ok(CompiledMatch::Prefix(pattern.trim().to_owned()))
}
