//! Deterministic cache keys from request parameters.
//!
//! Logically identical requests issued from different call sites must end up on the same key,
//! otherwise they are neither served from the cache nor coalesced onto the same fetch. Parameters
//! are therefore rendered as canonical JSON: object members are sorted by name and members that
//! are `null` (or `None` in a serialized struct) are left out entirely.

use serde::Serialize;
use serde_json::Value;

use crate::error::KeyError;

/// Renders `params` as a canonical cache key.
///
/// Object members are sorted and `null` members dropped at every nesting level. Array elements
/// keep their position, including `null` elements.
pub fn normalize_key(params: &Value) -> String {
    let mut key = String::new();
    write_canonical(params, &mut key);
    key
}

/// Serializes `params` and renders them as a canonical cache key, see [`normalize_key`].
pub fn normalize_params<P: Serialize + ?Sized>(params: &P) -> Result<String, KeyError> {
    let value = serde_json::to_value(params)?;
    Ok(normalize_key(&value))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut members: Vec<_> = map.iter().filter(|(_, v)| !v.is_null()).collect();
            members.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

            out.push('{');
            for (i, (name, member)) in members.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // `Value`'s `Display` takes care of escaping.
                out.push_str(&Value::from(name.as_str()).to_string());
                out.push(':');
                write_canonical(member, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Serialize)]
    struct ScrapeParams<'a> {
        url: &'a str,
        formats: Vec<&'a str>,
        wait_for: Option<u32>,
    }

    #[test]
    fn test_member_order() {
        assert_eq!(
            normalize_key(&json!({"b": 2, "a": 1})),
            normalize_key(&json!({"a": 1, "b": 2}))
        );
    }

    #[test]
    fn test_null_members() {
        assert_eq!(
            normalize_key(&json!({"a": 1, "b": null})),
            normalize_key(&json!({"a": 1}))
        );
        assert_eq!(normalize_key(&json!({})), "{}");
        assert_eq!(normalize_key(&json!({"a": null, "b": null})), "{}");
    }

    #[test]
    fn test_nested() {
        insta::assert_snapshot!(
            normalize_key(&json!({
                "query": "rust \"engineer\"",
                "filters": {"remote": true, "location": null, "country": "DE"},
                "pages": [2, null, 1],
            })),
            @r#"{"filters":{"country":"DE","remote":true},"pages":[2,null,1],"query":"rust \"engineer\""}"#
        );
    }

    #[test]
    fn test_scalars() {
        assert_eq!(normalize_key(&json!("jane@example.com")), r#""jane@example.com""#);
        assert_eq!(normalize_key(&json!(42)), "42");
        assert_eq!(normalize_key(&Value::Null), "null");
    }

    #[test]
    fn test_params() {
        let params = ScrapeParams {
            url: "https://example.com/jobs",
            formats: vec!["markdown"],
            wait_for: None,
        };
        let key = normalize_params(&params).unwrap();
        assert_eq!(
            key,
            normalize_key(&json!({"formats": ["markdown"], "url": "https://example.com/jobs"}))
        );

        #[derive(Serialize)]
        struct Empty {}
        assert_eq!(normalize_params(&Empty {}).unwrap(), "{}");
    }

    #[test]
    fn test_unrepresentable_params() {
        // JSON object keys have to be strings
        let params = std::collections::BTreeMap::from([((1, 2), "tuple key")]);
        assert!(normalize_params(&params).is_err());
    }
}
