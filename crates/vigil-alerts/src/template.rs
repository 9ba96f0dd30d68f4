//! Annotation templates.
//!
//! Annotations may reference the triggering value and the instance labels:
//!
//! - `{{ $value }}` expands to the value, or `NoData` when there is none
//! - `{{ $labels.route }}` expands to the `route` label, or an empty string
//!
//! Any other text, including unknown placeholders, is kept as is.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use vigil_metrics::LabelSet;

static PLACEHOLDER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\$(?:(value)|labels\.([A-Za-z_][A-Za-z0-9_]*))\s*\}\}").ok()
});

/// Formats a value for humans: integers without a fraction, others with up to
/// four decimals.
#[must_use]
pub fn format_value(value: Option<f64>) -> String {
    match value {
        None => "NoData".to_string(),
        Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{v:.0}"),
        Some(v) => {
            let s = format!("{v:.4}");
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        }
    }
}

/// Expands the placeholders of a single template.
#[must_use]
pub fn expand(template: &str, value: Option<f64>, labels: &LabelSet) -> String {
    let Some(re) = PLACEHOLDER.as_ref() else {
        return template.to_string();
    };

    re.replace_all(template, |caps: &Captures<'_>| {
        if caps.get(1).is_some() {
            format_value(value)
        } else {
            caps.get(2)
                .and_then(|name| labels.get(name.as_str()))
                .unwrap_or_default()
                .to_string()
        }
    })
    .into_owned()
}

/// Expands every annotation of a rule.
#[must_use]
pub fn expand_all(
    annotations: &BTreeMap<String, String>,
    value: Option<f64>,
    labels: &LabelSet,
) -> BTreeMap<String, String> {
    annotations
        .iter()
        .map(|(k, v)| (k.clone(), expand(v, value, labels)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Some(5.0) => "5")]
    #[test_case(Some(0.0712) => "0.0712")]
    #[test_case(Some(0.071_234_9) => "0.0712")]
    #[test_case(Some(1.5) => "1.5")]
    #[test_case(None => "NoData")]
    fn test_format(value: Option<f64>) -> String {
        format_value(value)
    }

    #[test]
    fn test_expands_value_and_labels() {
        let labels = LabelSet::new().with("route", "/login");
        let out = expand(
            "error rate on {{ $labels.route }} is {{$value}}",
            Some(0.07),
            &labels,
        );
        assert_eq!(out, "error rate on /login is 0.07");
    }

    #[test]
    fn test_missing_label_is_empty() {
        let out = expand("pod={{ $labels.pod }}", None, &LabelSet::new());
        assert_eq!(out, "pod=");
    }

    #[test]
    fn test_unknown_placeholders_kept() {
        let out = expand("{{ $externalURL }} {{ value }}", Some(1.0), &LabelSet::new());
        assert_eq!(out, "{{ $externalURL }} {{ value }}");
    }

    #[test]
    fn test_expand_all_annotations() {
        let annotations = BTreeMap::from([
            ("summary".to_string(), "value {{ $value }}".to_string()),
            ("runbook".to_string(), "https://runbooks/errors".to_string()),
        ]);
        let out = expand_all(&annotations, Some(3.0), &LabelSet::new());
        assert_eq!(out["summary"], "value 3");
        assert_eq!(out["runbook"], "https://runbooks/errors");
    }
}
