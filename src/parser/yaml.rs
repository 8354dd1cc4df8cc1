//! Helpers shared by the YAML dialect parsers.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::error::{Result, TranslateError};
use crate::vendor::Vendor;

/// Parses `text` into a root mapping with YAML merge keys (`<<`) resolved.
///
/// # Errors
///
/// Returns a document-scoped error when the text is not YAML or its root is
/// not a mapping.
pub fn load_document(text: &str, vendor: Vendor) -> Result<Mapping> {
    let mut value: Value = serde_yaml::from_str(text).map_err(|e| TranslateError::Document {
        vendor,
        message: e.to_string(),
    })?;
    value.apply_merge().map_err(|e| TranslateError::Document {
        vendor,
        message: e.to_string(),
    })?;

    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Err(TranslateError::Document {
            vendor,
            message: "document is empty".to_string(),
        }),
        _ => Err(TranslateError::Document {
            vendor,
            message: "document root is not a mapping".to_string(),
        }),
    }
}

/// Deserializes one source unit, turning serde errors into a message.
pub fn decode<T: DeserializeOwned>(value: &Value) -> std::result::Result<T, String> {
    serde_yaml::from_value(value.clone()).map_err(|e| e.to_string())
}

/// Renders a scalar as a string; `None` for null, sequences and mappings.
pub fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Tagged(tagged) => scalar(&tagged.value),
        _ => None,
    }
}

/// Key of a mapping entry as a string.
pub fn key_str(key: &Value) -> Option<String> {
    scalar(key)
}

/// Looks up `key` in `mapping`.
pub fn get<'a>(mapping: &'a Mapping, key: &str) -> Option<&'a Value> {
    mapping.get(Value::String(key.to_string()))
}

/// A value that may be written as a single item or a list of items.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

/// Scalars of any YAML type, kept as their string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text(pub String);

impl<'de> Deserialize<'de> for Text {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        scalar(&value)
            .map(Text)
            .ok_or_else(|| serde::de::Error::custom("expected a scalar value"))
    }
}

impl From<Text> for String {
    fn from(text: Text) -> Self {
        text.0
    }
}

/// Converts a mapping of scalars into `(name, value)` string pairs.
pub fn string_pairs(value: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Mapping(mapping)) = value else {
        return Vec::new();
    };
    mapping
        .iter()
        .filter_map(|(k, v)| Some((key_str(k)?, scalar(v).unwrap_or_default())))
        .collect()
}

/// Parses a duration such as `30m`, `1h 30m`, `90` (minutes) or `2 hours` into minutes.
pub fn duration_minutes(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Ok(minutes) = text.parse::<u32>() {
        return Some(minutes);
    }

    let mut total_seconds: u64 = 0;
    let mut number = String::new();
    let mut seen_unit = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        if c.is_whitespace() {
            continue;
        }
        let mut unit = String::from(c);
        while let Some(next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(*next);
                chars.next();
            } else {
                break;
            }
        }
        let amount: u64 = number.parse().ok()?;
        number.clear();
        let factor = match unit.to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
            "d" | "day" | "days" => 86_400,
            _ => return None,
        };
        total_seconds = total_seconds.checked_add(amount.checked_mul(factor)?)?;
        seen_unit = true;
    }

    if !number.is_empty() || !seen_unit {
        return None;
    }
    u32::try_from(total_seconds.div_ceil(60)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(test)]
    mod load_document {
        use super::*;

        #[test]
        fn resolves_merge_keys() {
            let text = "base: &base\n  image: node\nstep:\n  <<: *base\n  script: test\n";
            let doc = load_document(text, Vendor::BitbucketPipelines).unwrap();
            let step = get(&doc, "step").and_then(Value::as_mapping).unwrap();
            assert_eq!(get(step, "image").and_then(scalar), Some("node".to_string()));
        }

        #[test]
        fn rejects_non_mapping_root() {
            let err = load_document("- a\n- b\n", Vendor::GitlabCi).unwrap_err();
            assert!(matches!(err, TranslateError::Document { .. }));
        }

        #[test]
        fn rejects_invalid_yaml() {
            assert!(load_document("jobs: [unclosed", Vendor::GithubActions).is_err());
        }

        #[test]
        fn rejects_empty_document() {
            assert!(load_document("", Vendor::GithubActions).is_err());
        }
    }

    #[test]
    fn test_duration_minutes() {
        assert_eq!(duration_minutes("45"), Some(45));
        assert_eq!(duration_minutes("1h 30m"), Some(90));
        assert_eq!(duration_minutes("2 hours"), Some(120));
        assert_eq!(duration_minutes("90s"), Some(2), "Should round seconds up");
        assert_eq!(duration_minutes("soon"), None);
    }

    #[test]
    fn test_duration_minutes_out_of_range() {
        assert_eq!(duration_minutes("999999999999999999d"), None, "Should reject overflowing products");
        assert_eq!(duration_minutes("18446744073709551615s 1s"), None, "Should reject overflowing sums");
        assert_eq!(duration_minutes("99999999999h"), None, "Should reject minutes beyond u32");
    }

    #[test]
    fn test_one_or_many() {
        let one: OneOrMany<String> = serde_yaml::from_str("main").unwrap();
        let many: OneOrMany<String> = serde_yaml::from_str("[a, b]").unwrap();
        assert_eq!(one.into_vec(), vec!["main"]);
        assert_eq!(many.into_vec(), vec!["a", "b"]);
    }

    #[test]
    fn test_text_accepts_numbers() {
        let values: Vec<Text> = serde_yaml::from_str("[18, 3.10, true, x]").unwrap();
        let strings: Vec<String> = values.into_iter().map(String::from).collect();
        assert_eq!(strings, vec!["18", "3.1", "true", "x"]);
    }
}
