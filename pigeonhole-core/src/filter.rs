//! Regex filter evaluation for range queries.
//!
//! A filter set maps field names to regular expressions. Names starting
//! with `_` address reserved attributes (`_id`, `_cidr`, `_network`,
//! `_type`, `_address`, `_pool`); anything else matches against an
//! annotation of the same name. An entity passes only when every filter
//! matches; a field the entity does not carry fails the whole set.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled set of field filters with AND semantics.
#[derive(Debug)]
pub struct FilterSet {
    filters: Vec<(String, Regex)>,
}

impl FilterSet {
    /// Compile the raw field → pattern mapping. An invalid pattern is an
    /// argument error, surfaced before any entity is inspected.
    ///
    /// `_type` patterns are lowercased so `FIXED` and `fixed` both match
    /// the stored pool type.
    pub fn compile(raw: &HashMap<String, String>) -> Result<Self> {
        let mut filters = Vec::with_capacity(raw.len());
        for (field, pattern) in raw {
            let normalized = if field == "_type" {
                pattern.to_lowercase()
            } else {
                pattern.clone()
            };
            let regex = Regex::new(&normalized).map_err(|e| Error::InvalidFilter {
                filter: pattern.clone(),
                message: e.to_string(),
            })?;
            filters.push((field.clone(), regex));
        }
        Ok(Self { filters })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Evaluate against an entity via `lookup`, which maps a field name to
    /// its value (`None` for fields the entity does not carry — those fail).
    pub fn matches<F>(&self, lookup: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        self.filters.iter().all(|(field, regex)| {
            let value = match lookup(field) {
                Some(value) => value,
                None => return false,
            };
            let value = if field == "_type" {
                value.to_lowercase()
            } else {
                value
            };
            regex.is_match(&value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn entity(field: &str) -> Option<String> {
        match field {
            "_id" => Some("pool-7".to_string()),
            "_type" => Some("FIXED".to_string()),
            "env" => Some("production".to_string()),
            _ => None,
        }
    }

    #[test]
    fn all_filters_must_match() {
        let set = FilterSet::compile(&filters(&[("_id", "pool-"), ("env", "^prod")])).unwrap();
        assert!(set.matches(entity));

        let set = FilterSet::compile(&filters(&[("_id", "pool-"), ("env", "^stag")])).unwrap();
        assert!(!set.matches(entity));
    }

    #[test]
    fn unknown_field_fails_the_set() {
        let set = FilterSet::compile(&filters(&[("owner", ".*")])).unwrap();
        assert!(!set.matches(entity));
    }

    #[test]
    fn type_matching_ignores_case() {
        let set = FilterSet::compile(&filters(&[("_type", "FIXED")])).unwrap();
        assert!(set.matches(entity));
        let set = FilterSet::compile(&filters(&[("_type", "fixed")])).unwrap();
        assert!(set.matches(entity));
        let set = FilterSet::compile(&filters(&[("_type", "dynamic")])).unwrap();
        assert!(!set.matches(entity));
    }

    #[test]
    fn invalid_pattern_is_an_argument_error() {
        let err = FilterSet::compile(&filters(&[("_id", "(unclosed")])).unwrap_err();
        assert!(matches!(err, Error::InvalidFilter { .. }));
    }

    #[test]
    fn empty_set_matches_everything() {
        let set = FilterSet::compile(&HashMap::new()).unwrap();
        assert!(set.is_empty());
        assert!(set.matches(|_| None));
    }
}
