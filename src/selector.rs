//! Label selectors in the `key=value,key!=value,key,!key` form.
//!
//! Kubernetes evaluates the selector server-side; Docker only understands
//! equality and existence filters, so every record is re-checked here
//! before it enters a snapshot.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    Absent(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut requirements = Vec::new();
        for clause in input.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let requirement = if let Some((key, value)) = clause.split_once("!=") {
                Requirement::NotEquals(valid_key(key)?, value.trim().to_string())
            } else if let Some((key, value)) = clause.split_once('=') {
                // tolerate the `key==value` spelling
                let value = value.strip_prefix('=').unwrap_or(value);
                Requirement::Equals(valid_key(key)?, value.trim().to_string())
            } else if let Some(key) = clause.strip_prefix('!') {
                Requirement::Absent(valid_key(key)?)
            } else {
                Requirement::Exists(valid_key(clause)?)
            };
            requirements.push(requirement);
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::Absent(k) => !labels.contains_key(k),
        })
    }

    /// Docker `label` filters for the clauses Docker can evaluate.
    pub fn docker_filters(&self) -> Vec<String> {
        self.requirements
            .iter()
            .filter_map(|req| match req {
                Requirement::Equals(k, v) => Some(format!("{}={}", k, v)),
                Requirement::Exists(k) => Some(k.clone()),
                _ => None,
            })
            .collect()
    }
}

fn valid_key(key: &str) -> Result<String, ConfigError> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(ConfigError::Invalid(format!("invalid label key {:?}", key)));
    }
    Ok(key.to_string())
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clauses: Vec<String> = self
            .requirements
            .iter()
            .map(|req| match req {
                Requirement::Equals(k, v) => format!("{}={}", k, v),
                Requirement::NotEquals(k, v) => format!("{}!={}", k, v),
                Requirement::Exists(k) => k.clone(),
                Requirement::Absent(k) => format!("!{}", k),
            })
            .collect();
        f.write_str(&clauses.join(","))
    }
}
