//! Query-string overrides read from the page URL of the current request.
use serde_json::Value;
use url::Url;

const FEATURE_PREFIX: &str = "gb~";

/// Value forced by a `gb~<feature key>` query parameter.
///
/// The raw value is read as JSON when possible (`true`, `12`, `{"a":1}`), `on`/`off` map to
/// booleans, and anything else is served as a plain string.
pub(crate) fn feature_override(url: &Url, feature_key: &str) -> Option<Value> {
    let raw = query_value(url, |name| {
        name.strip_prefix(FEATURE_PREFIX) == Some(feature_key)
    })?;

    Some(match serde_json::from_str::<Value>(&raw) {
        Ok(value) => value,
        Err(_) => match raw.as_str() {
            "on" => Value::Bool(true),
            "off" => Value::Bool(false),
            _ => Value::String(raw),
        },
    })
}

/// Variation index forced by a `<experiment key>=<index>` query parameter.
///
/// Indices outside `0..num_variations` are ignored.
pub(crate) fn variation_override(
    url: &Url,
    experiment_key: &str,
    num_variations: usize,
) -> Option<usize> {
    let raw = query_value(url, |name| name == experiment_key)?;
    raw.parse::<usize>()
        .ok()
        .filter(|index| *index < num_variations)
}

fn query_value(url: &Url, mut matches: impl FnMut(&str) -> bool) -> Option<String> {
    url.query_pairs()
        .find(|(name, _)| matches(name))
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use url::Url;

    use super::{feature_override, variation_override};

    #[test]
    fn feature_values_are_typed() {
        let url = Url::parse(
            "https://example.com/?gb~dark-mode=true&gb~limit=12&gb~banner=off&gb~color=blue&gb~cfg=%7B%22a%22%3A1%7D",
        )
        .unwrap();
        assert_eq!(feature_override(&url, "dark-mode"), Some(json!(true)));
        assert_eq!(feature_override(&url, "limit"), Some(json!(12)));
        assert_eq!(feature_override(&url, "banner"), Some(json!(false)));
        assert_eq!(feature_override(&url, "color"), Some(json!("blue")));
        assert_eq!(feature_override(&url, "cfg"), Some(json!({"a": 1})));
        assert_eq!(feature_override(&url, "missing"), None);
    }

    #[test]
    fn variation_index_must_be_in_range() {
        let url = Url::parse("https://example.com/?checkout=1&pricing=5&other=x").unwrap();
        assert_eq!(variation_override(&url, "checkout", 2), Some(1));
        assert_eq!(variation_override(&url, "pricing", 2), None);
        assert_eq!(variation_override(&url, "other", 2), None);
        assert_eq!(variation_override(&url, "absent", 2), None);
    }
}
