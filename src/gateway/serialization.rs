//! OpenAPI parameter serialization for path, query and header values
//!
//! Numbers are rendered from their source text, so integers beyond 2^53 and
//! long decimals reach the upstream unchanged.

use crate::toolconfig::HttpParameter;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
}

impl ParamLocation {
    fn default_style(self) -> &'static str {
        match self {
            ParamLocation::Path | ParamLocation::Header => "simple",
            ParamLocation::Query => "form",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    style: String,
    explode: bool,
    allow_empty_value: bool,
}

impl Settings {
    fn resolve(location: ParamLocation, param: Option<&HttpParameter>) -> Self {
        let style = param
            .map(|p| p.style.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(location.default_style())
            .to_string();
        let explode = param
            .and_then(|p| p.explode)
            .unwrap_or(style == "form");
        Self {
            style,
            explode,
            allow_empty_value: param.map(|p| p.allow_empty_value).unwrap_or(false),
        }
    }
}

/// Text form of a scalar. Nested containers fall back to their JSON text.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn encode_path_component(value: &str, location: ParamLocation) -> String {
    match location {
        ParamLocation::Path => urlencoding::encode(value).into_owned(),
        _ => value.to_string(),
    }
}

fn array_items(items: &[Value], location: ParamLocation) -> Vec<String> {
    items
        .iter()
        .filter_map(scalar_text)
        .map(|s| encode_path_component(&s, location))
        .collect()
}

fn object_pairs(map: &Map<String, Value>, location: ParamLocation) -> Vec<(String, String)> {
    map.iter()
        .filter_map(|(k, v)| {
            scalar_text(v).map(|s| {
                (
                    encode_path_component(k, location),
                    encode_path_component(&s, location),
                )
            })
        })
        .collect()
}

/// Serialize a path or header parameter (`simple`, `label`, `matrix`).
///
/// Returns `None` when the value has nothing to render.
pub fn serialize_path_or_header(
    name: &str,
    value: &Value,
    param: Option<&HttpParameter>,
    location: ParamLocation,
) -> Option<String> {
    let settings = Settings::resolve(location, param);
    let style = match settings.style.as_str() {
        "simple" => "simple",
        "label" | "matrix" if location == ParamLocation::Path => settings.style.as_str(),
        other => {
            warn!(http_param_name = %name, style = %other, "unsupported parameter style, using simple");
            "simple"
        }
    };
    let explode = settings.explode;

    let rendered = match value {
        Value::Null => return None,
        Value::Array(items) => {
            let items = array_items(items, location);
            if items.is_empty() {
                return None;
            }
            match (style, explode) {
                ("label", false) => format!(".{}", items.join(",")),
                ("label", true) => format!(".{}", items.join(".")),
                ("matrix", false) => format!(";{}={}", name, items.join(",")),
                ("matrix", true) => items
                    .iter()
                    .map(|item| format!(";{}={}", name, item))
                    .collect::<String>(),
                _ => items.join(","),
            }
        }
        Value::Object(map) => {
            let pairs = object_pairs(map, location);
            if pairs.is_empty() {
                return None;
            }
            let flat = || {
                pairs
                    .iter()
                    .flat_map(|(k, v)| [k.clone(), v.clone()])
                    .collect::<Vec<_>>()
                    .join(",")
            };
            let assigned = |sep: &str| {
                pairs
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(sep)
            };
            match (style, explode) {
                ("label", false) => format!(".{}", flat()),
                ("label", true) => format!(".{}", assigned(".")),
                ("matrix", false) => format!(";{}={}", name, flat()),
                ("matrix", true) => format!(";{}", assigned(";")),
                (_, true) => assigned(","),
                (_, false) => flat(),
            }
        }
        scalar => {
            let text = scalar_text(scalar)?;
            if text.is_empty() && !settings.allow_empty_value {
                return None;
            }
            let text = encode_path_component(&text, location);
            match style {
                "label" => format!(".{}", text),
                "matrix" => format!(";{}={}", name, text),
                _ => text,
            }
        }
    };

    Some(rendered)
}

/// Query values keyed by name, kept sorted for stable encoding
pub type QueryValues = BTreeMap<String, Vec<String>>;

fn push(values: &mut QueryValues, key: String, value: String) {
    values.entry(key).or_default().push(value);
}

fn deep_object(values: &mut QueryValues, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                deep_object(values, &format!("{}[{}]", prefix, k), v);
            }
        }
        Value::Array(items) => {
            for item in items {
                if let Some(text) = scalar_text(item) {
                    push(values, prefix.to_string(), text);
                }
            }
        }
        scalar => {
            if let Some(text) = scalar_text(scalar) {
                push(values, prefix.to_string(), text);
            }
        }
    }
}

/// Serialize a query parameter into name/value pairs
/// (`form`, `spaceDelimited`, `pipeDelimited`, `deepObject`).
pub fn serialize_query(name: &str, value: &Value, param: Option<&HttpParameter>) -> QueryValues {
    let mut settings = Settings::resolve(ParamLocation::Query, param);
    if !matches!(
        settings.style.as_str(),
        "form" | "spaceDelimited" | "pipeDelimited" | "deepObject"
    ) {
        warn!(http_param_name = %name, style = %settings.style, "unsupported query style, using form");
        settings.style = "form".to_string();
        settings.explode = true;
    }

    let mut values = QueryValues::new();
    let delimiter = match settings.style.as_str() {
        "spaceDelimited" => " ",
        "pipeDelimited" => "|",
        _ => ",",
    };

    match value {
        Value::Null => {}
        Value::Array(items) => {
            let items = array_items(items, ParamLocation::Query);
            if settings.explode && settings.style != "deepObject" {
                for item in items {
                    push(&mut values, name.to_string(), item);
                }
            } else if !items.is_empty() {
                push(&mut values, name.to_string(), items.join(delimiter));
            }
        }
        Value::Object(map) => {
            if settings.style == "deepObject" {
                deep_object(&mut values, name, value);
            } else if settings.explode {
                for (k, v) in object_pairs(map, ParamLocation::Query) {
                    push(&mut values, k, v);
                }
            } else {
                let flat: Vec<String> = object_pairs(map, ParamLocation::Query)
                    .into_iter()
                    .flat_map(|(k, v)| [k, v])
                    .collect();
                if !flat.is_empty() {
                    push(&mut values, name.to_string(), flat.join(delimiter));
                }
            }
        }
        scalar => {
            if let Some(text) = scalar_text(scalar) {
                if !text.is_empty() || settings.allow_empty_value {
                    push(&mut values, name.to_string(), text);
                }
            }
        }
    }

    values
}

/// `application/x-www-form-urlencoded` encoding, keys sorted
pub fn encode_query(values: &QueryValues) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, items) in values {
        for item in items {
            serializer.append_pair(key, item);
        }
    }
    serializer.finish()
}

/// Flatten a JSON object into form fields: arrays as `key[i]`, objects as `key[field]`
pub fn form_encode_body(body: &Map<String, Value>) -> String {
    let mut values = QueryValues::new();
    for (key, value) in body {
        form_encode_value(&mut values, key.clone(), value);
    }
    encode_query(&values)
}

fn form_encode_value(values: &mut QueryValues, key: String, value: &Value) {
    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                form_encode_value(values, format!("{}[{}]", key, i), item);
            }
        }
        Value::Object(map) => {
            for (field, item) in map {
                form_encode_value(values, format!("{}[{}]", key, field), item);
            }
        }
        Value::Null => {
            values.insert(key, vec![String::new()]);
        }
        scalar => {
            let text = scalar_text(scalar).unwrap_or_default();
            values.insert(key, vec![text]);
        }
    }
}

/// Replace `{name}` placeholders with serialized values; unknown placeholders stay intact
pub fn insert_path_params(path: &str, params: &std::collections::HashMap<String, String>) -> String {
    if params.is_empty() {
        return path.to_string();
    }
    crate::toolconfig::PATH_PARAM_REGEX
        .replace_all(path, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            params
                .get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn param(style: &str, explode: Option<bool>) -> HttpParameter {
        HttpParameter {
            name: "p".into(),
            style: style.into(),
            explode,
            allow_empty_value: false,
        }
    }

    fn parse(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_large_integer_path_param() {
        let value = parse("9007199254740993");
        let out = serialize_path_or_header("id", &value, None, ParamLocation::Path).unwrap();
        assert_eq!(out, "9007199254740993");

        let decimal = parse("0.1000000000000000055511151231257827");
        let out = serialize_path_or_header("d", &decimal, None, ParamLocation::Header).unwrap();
        assert_eq!(out, "0.1000000000000000055511151231257827");
    }

    #[test]
    fn test_path_styles() {
        let arr = json!(["a", "b"]);
        let obj = parse(r#"{"g":2,"r":1}"#);

        assert_eq!(serialize_path_or_header("p", &arr, None, ParamLocation::Path).unwrap(), "a,b");
        assert_eq!(
            serialize_path_or_header("p", &obj, Some(&param("simple", Some(true))), ParamLocation::Path).unwrap(),
            "g=2,r=1"
        );
        assert_eq!(
            serialize_path_or_header("p", &arr, Some(&param("label", Some(true))), ParamLocation::Path).unwrap(),
            ".a.b"
        );
        assert_eq!(
            serialize_path_or_header("p", &arr, Some(&param("matrix", Some(true))), ParamLocation::Path).unwrap(),
            ";p=a;p=b"
        );
        assert_eq!(
            serialize_path_or_header("p", &obj, Some(&param("matrix", Some(false))), ParamLocation::Path).unwrap(),
            ";p=g,2,r,1"
        );
        assert_eq!(
            serialize_path_or_header("p", &json!("a b/c"), None, ParamLocation::Path).unwrap(),
            "a%20b%2Fc"
        );
    }

    #[test]
    fn test_query_styles() {
        let arr = json!([1, 2, 3]);
        let form = serialize_query("ids", &arr, None);
        assert_eq!(form["ids"], vec!["1", "2", "3"]);
        assert_eq!(encode_query(&form), "ids=1&ids=2&ids=3");

        let form = serialize_query("ids", &arr, Some(&param("form", Some(false))));
        assert_eq!(encode_query(&form), "ids=1%2C2%2C3");

        let space = serialize_query("ids", &arr, Some(&param("spaceDelimited", Some(false))));
        assert_eq!(space["ids"], vec!["1 2 3"]);

        let pipe = serialize_query("ids", &arr, Some(&param("pipeDelimited", Some(false))));
        assert_eq!(pipe["ids"], vec!["1|2|3"]);

        let deep = serialize_query(
            "filter",
            &json!({"name": "x", "range": {"min": 1}}),
            Some(&param("deepObject", Some(true))),
        );
        assert_eq!(deep["filter[name]"], vec!["x"]);
        assert_eq!(deep["filter[range][min]"], vec!["1"]);
    }

    #[test]
    fn test_unknown_query_style_falls_back_to_form() {
        let out = serialize_query("ids", &json!(["a", "b"]), Some(&param("weird", Some(false))));
        assert_eq!(out["ids"], vec!["a", "b"]);
    }

    #[test]
    fn test_empty_values() {
        assert!(serialize_query("q", &json!(""), None).is_empty());
        let allowed = HttpParameter {
            allow_empty_value: true,
            ..param("form", None)
        };
        assert_eq!(serialize_query("q", &json!(""), Some(&allowed))["q"], vec![""]);
        assert!(serialize_path_or_header("p", &Value::Null, None, ParamLocation::Path).is_none());
    }

    #[test]
    fn test_form_body() {
        let body = parse(r#"{"name":"a b","tags":["x","y"],"meta":{"n":12345678901234567890}}"#);
        let encoded = form_encode_body(body.as_object().unwrap());
        assert_eq!(
            encoded,
            "meta%5Bn%5D=12345678901234567890&name=a+b&tags%5B0%5D=x&tags%5B1%5D=y"
        );
    }

    #[test]
    fn test_insert_path_params() {
        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        assert_eq!(insert_path_params("/users/{id}/posts/{post}", &params), "/users/42/posts/{post}");
        assert_eq!(insert_path_params("/users/{id}", &HashMap::new()), "/users/{id}");
    }
}
