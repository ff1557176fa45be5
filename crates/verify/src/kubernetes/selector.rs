use std::collections::{BTreeMap, BTreeSet};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    NotExists(String),
}

/// Client side label selector used by the in-memory cluster, e.g.
/// `app=web,tier!=cache,!skip,env in (prod,staging)`.
///
/// The live client hands selectors to the API server untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

/// Splits on commas outside of parentheses.
fn terms(selector: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&selector[start..]);
    out.into_iter().map(str::trim).filter(|t| !t.is_empty()).collect()
}

fn set_requirement(term: &str) -> Option<Result<Requirement>> {
    let (key, rest, negated) = if let Some((key, rest)) = term.split_once(" notin ") {
        (key, rest, true)
    } else if let Some((key, rest)) = term.split_once(" in ") {
        (key, rest, false)
    } else {
        return None;
    };

    let values = rest
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'));
    let Some(values) = values else {
        return Some(Err(Error::Validation(format!(
            "invalid selector term '{}': values must be in parentheses",
            term
        ))));
    };
    let values: BTreeSet<String> = values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    let key = key.trim().to_string();
    Some(Ok(if negated {
        Requirement::NotIn(key, values)
    } else {
        Requirement::In(key, values)
    }))
}

impl LabelSelector {
    pub fn parse(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in terms(selector) {
            let requirement = if let Some(requirement) = set_requirement(term) {
                requirement?
            } else if let Some((key, value)) = term.split_once("!=") {
                Requirement::NotEquals(key.trim().to_string(), value.trim().to_string())
            } else if let Some((key, value)) = term.split_once("==") {
                Requirement::Equals(key.trim().to_string(), value.trim().to_string())
            } else if let Some((key, value)) = term.split_once('=') {
                Requirement::Equals(key.trim().to_string(), value.trim().to_string())
            } else if let Some(key) = term.strip_prefix('!') {
                Requirement::NotExists(key.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };
            if let Requirement::Equals(key, _)
            | Requirement::NotEquals(key, _)
            | Requirement::In(key, _)
            | Requirement::NotIn(key, _)
            | Requirement::Exists(key)
            | Requirement::NotExists(key) = &requirement
            {
                if key.is_empty() || key.contains(' ') {
                    return Err(Error::Validation(format!("invalid selector term '{}'", term)));
                }
            }
            requirements.push(requirement);
        }
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, values) => labels.get(k).map_or(false, |v| values.contains(v)),
            Requirement::NotIn(k, values) => labels.get(k).map_or(true, |v| !values.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::parse("").unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[])));
    }

    #[test]
    fn test_equality_and_existence_terms() {
        let selector = LabelSelector::parse("app=jx-bdd, tier!=cache,!tekton.dev/pipelineRun").unwrap();
        assert!(selector.matches(&labels(&[("app", "jx-bdd")])));
        assert!(!selector.matches(&labels(&[("app", "jx-bdd"), ("tier", "cache")])));
        assert!(!selector.matches(&labels(&[
            ("app", "jx-bdd"),
            ("tekton.dev/pipelineRun", "run-1")
        ])));
        assert!(!selector.matches(&labels(&[("app", "other")])));
    }

    #[test]
    fn test_set_terms() {
        let selector = LabelSelector::parse("env in (prod, staging),tier notin (cache),app").unwrap();
        assert!(selector.matches(&labels(&[("env", "prod"), ("app", "web")])));
        assert!(selector.matches(&labels(&[("env", "staging"), ("app", "web"), ("tier", "front")])));
        assert!(!selector.matches(&labels(&[("env", "dev"), ("app", "web")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("app", "web"), ("tier", "cache")])));
        assert!(!selector.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_rejects_malformed_terms() {
        assert!(LabelSelector::parse("=value").is_err());
        assert!(LabelSelector::parse("bad key=x").is_err());
        assert!(LabelSelector::parse("env in prod").is_err());
    }
}
