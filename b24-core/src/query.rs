// Query-string encoding for batch commands.
// Nested parameters use bracket notation: filter[>ID]=5&select[0]=ID

use serde_json::Value;
use url::form_urlencoded::byte_serialize;

/// Encode an object of parameters into a query string.
///
/// Nulls and empty containers are omitted, booleans become `1`/`0`.
pub fn build_query(params: &Value) -> String {
    let mut pairs = Vec::new();
    if let Value::Object(map) = params {
        for (key, value) in map {
            collect(&encode(key), value, &mut pairs);
        }
    }
    pairs.join("&")
}

/// Serialize a command into the `method?query` form used inside a batch
pub fn command_line(method: &str, params: &Value) -> String {
    let query = build_query(params);
    if query.is_empty() {
        method.to_string()
    } else {
        format!("{}?{}", method, query)
    }
}

fn collect(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push(format!("{}={}", prefix, if *b { 1 } else { 0 })),
        Value::Number(n) => out.push(format!("{}={}", prefix, n)),
        Value::String(s) => out.push(format!("{}={}", prefix, encode(s))),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect(&format!("{}[{}]", prefix, i), item, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                collect(&format!("{}[{}]", prefix, encode(key)), item, out);
            }
        }
    }
}

fn encode(s: &str) -> String {
    byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_params() {
        let q = build_query(&json!({"id": 5, "name": "a b"}));
        assert_eq!(q, "id=5&name=a+b");
    }

    #[test]
    fn test_nested_params() {
        let q = build_query(&json!({
            "filter": {">ID": 10},
            "select": ["ID", "TITLE"]
        }));
        assert_eq!(q, "filter[%3EID]=10&select[0]=ID&select[1]=TITLE");
    }

    #[test]
    fn test_skips_null_and_encodes_bools() {
        let q = build_query(&json!({"a": null, "b": true, "c": false}));
        assert_eq!(q, "b=1&c=0");
    }

    #[test]
    fn test_command_line_without_params() {
        assert_eq!(command_line("user.current", &json!({})), "user.current");
        assert_eq!(
            command_line("crm.deal.get", &json!({"id": 1})),
            "crm.deal.get?id=1"
        );
    }

    #[test]
    fn test_reference_tokens_survive_encoding() {
        let q = build_query(&json!({"id": "$result[deal][ID]"}));
        assert_eq!(q, "id=%24result%5Bdeal%5D%5BID%5D");
    }
}
