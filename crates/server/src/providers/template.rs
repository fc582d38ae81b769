//! URL templates and upstream response decoding shared by all providers.

use crate::error::SsoError;
use serde_json::Value;
use std::collections::HashMap;
use url::Url;

/// Expand `{name}` placeholders in `template` with URL-encoded values.
///
/// Unknown placeholders are left untouched. A result that is not already an
/// absolute http(s) URL is resolved against `server`.
pub fn expand(template: &str, server: &str, vars: &[(&str, &str)]) -> Result<String, SsoError> {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let Some(close) = tail.find('}') else {
            out.push_str(tail);
            rest = "";
            break;
        };

        let key = &tail[1..close];
        match vars.iter().find(|(name, _)| *name == key) {
            Some((_, value)) => out.push_str(&urlencoding::encode(value)),
            None => out.push_str(&tail[..=close]),
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);

    if is_absolute(&out) {
        return Ok(out);
    }
    resolve(server, &out)
}

fn is_absolute(url: &str) -> bool {
    let lower = url.get(..8).unwrap_or(url).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn resolve(server: &str, relative: &str) -> Result<String, SsoError> {
    if server.is_empty() {
        return Err(SsoError::Internal(format!(
            "relative provider url `{relative}` without a server"
        )));
    }

    let base = if server.ends_with('/') {
        server.to_string()
    } else {
        format!("{server}/")
    };
    let base = Url::parse(&base)
        .map_err(|e| SsoError::Internal(format!("invalid provider server `{server}`: {e}")))?;
    let joined = base
        .join(relative.trim_start_matches('/'))
        .map_err(|e| SsoError::Internal(format!("invalid provider url `{relative}`: {e}")))?;
    Ok(joined.to_string())
}

/// Decode an upstream response body into flat string fields.
///
/// Providers answer in JSON, JSONP (`callback( {...} );`) or form encoding.
/// Nested objects are flattened: a leaf key is kept unless the outer level
/// already defined it. Arrays and nulls are dropped.
pub fn parse_response(body: &str) -> HashMap<String, String> {
    let body = body.trim();
    let mut fields = HashMap::new();

    if let Some(json) = json_payload(body) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(json) {
            flatten(&map, &mut fields);
        }
        return fields;
    }

    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        fields.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }
    fields
}

fn json_payload(body: &str) -> Option<&str> {
    if body.starts_with('{') {
        return Some(body);
    }

    // JSONP
    let open = body.find('(')?;
    let close = body.rfind(')')?;
    let inner = body.get(open + 1..close)?.trim();
    inner.starts_with('{').then_some(inner)
}

fn flatten(map: &serde_json::Map<String, Value>, out: &mut HashMap<String, String>) {
    let mut nested = Vec::new();
    for (key, value) in map {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Object(inner) => {
                nested.push(inner);
                continue;
            }
            Value::Array(_) | Value::Null => continue,
        };
        out.entry(key.to_lowercase()).or_insert(text);
    }
    for inner in nested {
        flatten(inner, out);
    }
}

/// First non-empty value among `keys`.
pub fn first<'a>(fields: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| fields.get(*k))
        .map(String::as_str)
        .find(|v| !v.is_empty())
}

/// Fail when a response carries a non-zero `errcode`.
pub fn check_errcode(fields: &HashMap<String, String>) -> Result<(), SsoError> {
    let code = fields
        .get("errcode")
        .and_then(|c| c.parse::<i64>().ok())
        .unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    Err(SsoError::UpstreamApi {
        code,
        message: fields.get("errmsg").cloned().unwrap_or_default(),
    })
}
