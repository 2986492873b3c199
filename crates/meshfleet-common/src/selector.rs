//! Label selector evaluation
//!
//! Matching is delegated to kube's [`Selector`] with one difference for
//! injection policies: an absent or empty selector matches nothing.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};
use tracing::debug;

/// True when the selector has neither labels nor expressions
pub fn is_empty(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().is_none_or(|m| m.is_empty())
        && selector
            .match_expressions
            .as_ref()
            .is_none_or(|e| e.is_empty())
}

/// Evaluate `selector` against `labels`; empty, absent or unparseable
/// selectors never match.
pub fn matches(selector: Option<&LabelSelector>, labels: &BTreeMap<String, String>) -> bool {
    let Some(selector) = selector else {
        return false;
    };
    if is_empty(selector) {
        return false;
    }

    match Selector::try_from(selector.clone()) {
        Ok(parsed) => parsed.matches(labels),
        Err(e) => {
            debug!(error = %e, "label selector not understood, matching nothing");
            false
        }
    }
}

/// Render the selector's `matchLabels` as a list-call label selector string
pub fn to_label_query(selector: &LabelSelector) -> String {
    selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selector(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(labels(pairs)),
            match_expressions: None,
        }
    }

    #[test]
    fn absent_or_empty_selector_matches_nothing() {
        let pod = labels(&[("app", "cart")]);
        assert!(!matches(None, &pod));
        assert!(!matches(Some(&LabelSelector::default()), &pod));
        assert!(!matches(Some(&selector(&[])), &pod));
    }

    #[test]
    fn match_labels_must_all_be_present() {
        let sel = selector(&[("app", "cart"), ("tier", "web")]);
        assert!(matches(
            Some(&sel),
            &labels(&[("app", "cart"), ("tier", "web"), ("x", "y")])
        ));
        assert!(!matches(Some(&sel), &labels(&[("app", "cart")])));
    }

    #[test]
    fn expressions_follow_kubernetes_operators() {
        let sel = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "env".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["prod".to_string(), "staging".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "legacy".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
            ]),
        };
        assert!(matches(Some(&sel), &labels(&[("env", "prod")])));
        assert!(!matches(Some(&sel), &labels(&[("env", "dev")])));
        assert!(!matches(
            Some(&sel),
            &labels(&[("env", "prod"), ("legacy", "true")])
        ));
    }

    #[test]
    fn unknown_operator_matches_nothing() {
        let sel = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "env".to_string(),
                operator: "Near".to_string(),
                values: Some(vec!["prod".to_string()]),
            }]),
        };
        assert!(!matches(Some(&sel), &labels(&[("env", "prod")])));
    }

    #[test]
    fn label_query_joins_pairs() {
        assert_eq!(
            to_label_query(&selector(&[("app", "cart"), ("tier", "web")])),
            "app=cart,tier=web"
        );
    }
}
