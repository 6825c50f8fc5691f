// Back-references between batch commands: `$result[Name][path...]`.
//
// Resolution is two-phase. References to commands that already ran in an
// earlier chunk are substituted on the client; references inside the same
// chunk stay as tokens for the server.

use crate::command::Command;
use crate::error::B24Error;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::ops::Range;

const TOKEN_PREFIX: &str = "$result[";

/// One `$result[...]` token found inside a string parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackReference {
    pub target: String,
    pub path: Vec<String>,
    /// Byte range of the token inside the source string
    pub span: Range<usize>,
}

impl BackReference {
    pub fn to_token(&self) -> String {
        token(&self.target, &self.path)
    }
}

fn token(target: &str, path: &[String]) -> String {
    let mut out = format!("{}{}]", TOKEN_PREFIX, target);
    for seg in path {
        out.push('[');
        out.push_str(seg);
        out.push(']');
    }
    out
}

/// Find all back-reference tokens in a string
pub fn parse_references(s: &str) -> Vec<BackReference> {
    let mut refs = Vec::new();
    let mut offset = 0;

    while let Some(found) = s[offset..].find(TOKEN_PREFIX) {
        let start = offset + found;
        let mut cursor = start + TOKEN_PREFIX.len();
        let Some(close) = s[cursor..].find(']') else {
            break;
        };
        let target = s[cursor..cursor + close].to_string();
        cursor += close + 1;

        let mut path = Vec::new();
        while s[cursor..].starts_with('[') {
            match s[cursor + 1..].find(']') {
                Some(end) => {
                    path.push(s[cursor + 1..cursor + 1 + end].to_string());
                    cursor += end + 2;
                }
                None => break,
            }
        }

        if !target.is_empty() {
            refs.push(BackReference {
                target,
                path,
                span: start..cursor,
            });
        }
        offset = cursor;
    }

    refs
}

/// Collect references from every string inside a parameter tree
pub fn collect_references(params: &Value) -> Vec<BackReference> {
    let mut out = Vec::new();
    walk(params, &mut out);
    out
}

fn walk(value: &Value, out: &mut Vec<BackReference>) {
    match value {
        Value::String(s) => out.extend(parse_references(s)),
        Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
        Value::Object(map) => map.values().for_each(|v| walk(v, out)),
        _ => {}
    }
}

/// Check that every reference targets a command declared earlier.
///
/// Runs before anything is sent; forward, self and unknown references are
/// configuration errors.
pub fn validate_references(entries: &[(String, Command)]) -> Result<(), B24Error> {
    let all: HashSet<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
    let mut declared: HashSet<&str> = HashSet::new();

    for (name, cmd) in entries {
        for reference in collect_references(&cmd.params) {
            let target = reference.target.as_str();
            if declared.contains(target) {
                continue;
            }
            let reason = if target == name {
                "refers to itself"
            } else if all.contains(target) {
                "refers to a command declared later"
            } else {
                "refers to an unknown command"
            };
            return Err(B24Error::configuration(format!(
                "command '{}' {}: {}",
                name,
                reason,
                reference.to_token()
            )));
        }
        declared.insert(name.as_str());
    }

    Ok(())
}

/// Results of commands that finished in earlier chunks; `None` marks a
/// command that failed
pub type KnownResults = HashMap<String, Option<Value>>;

/// Outcome of resolving one command before sending its chunk
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Ready(Command),
    /// An earlier-chunk target failed, so the command cannot run
    Blocked { target: String },
}

/// Substitute cross-chunk references and rename same-chunk ones.
///
/// `local_name` maps a same-chunk target to the name the server sees
/// inside the physical batch.
pub fn resolve_command(
    cmd: &Command,
    known: &KnownResults,
    local_name: &dyn Fn(&str) -> Option<String>,
) -> Result<Resolution, B24Error> {
    let mut blocked = None;
    let params = rewrite(&cmd.params, &mut |reference: &BackReference| {
        match known.get(&reference.target) {
            Some(Some(result)) => Ok(lookup(result, &reference.path)),
            Some(None) => {
                blocked.get_or_insert_with(|| reference.target.clone());
                Ok(Value::Null)
            }
            None => match local_name(&reference.target) {
                Some(local) => Ok(Value::String(token(&local, &reference.path))),
                None => Err(B24Error::configuration(format!(
                    "reference {} has no resolvable target",
                    reference.to_token()
                ))),
            },
        }
    })?;

    Ok(match blocked {
        Some(target) => Resolution::Blocked { target },
        None => Resolution::Ready(Command {
            method: cmd.method.clone(),
            params,
        }),
    })
}

fn rewrite(
    value: &Value,
    resolve: &mut dyn FnMut(&BackReference) -> Result<Value, B24Error>,
) -> Result<Value, B24Error> {
    match value {
        Value::String(s) => {
            let refs = parse_references(s);
            if refs.is_empty() {
                return Ok(value.clone());
            }
            // a whole-string token keeps the referenced value's type
            if refs.len() == 1 && refs[0].span == (0..s.len()) {
                return resolve(&refs[0]);
            }
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for reference in &refs {
                out.push_str(&s[last..reference.span.start]);
                out.push_str(&render(&resolve(reference)?));
                last = reference.span.end;
            }
            out.push_str(&s[last..]);
            Ok(Value::String(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| rewrite(v, resolve))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), rewrite(v, resolve)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Walk `path` through a result; missing segments yield `Null`
pub fn lookup(result: &Value, path: &[String]) -> Value {
    let mut current = result;
    for seg in path {
        let next = match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_local(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_simple_reference() {
        let refs = parse_references("$result[deal][ID]");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].target, "deal");
        assert_eq!(refs[0].path, vec!["ID"]);
        assert_eq!(refs[0].span, 0..17);
    }

    #[test]
    fn test_parse_embedded_references() {
        let refs = parse_references("id=$result[a][0][ID] and $result[b]");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].path, vec!["0", "ID"]);
        assert_eq!(refs[1].target, "b");
        assert!(refs[1].path.is_empty());
    }

    #[test]
    fn test_parse_ignores_unterminated() {
        assert!(parse_references("$result[abc").is_empty());
        assert!(parse_references("plain text").is_empty());
    }

    #[test]
    fn test_validate_rejects_forward_reference() {
        let entries = vec![
            (
                "a".to_string(),
                Command::new("crm.deal.get", json!({"id": "$result[b][ID]"})),
            ),
            ("b".to_string(), Command::bare("crm.deal.add")),
        ];
        let err = validate_references(&entries).unwrap_err();
        assert!(err.to_string().contains("declared later"));
    }

    #[test]
    fn test_validate_rejects_unknown_and_self() {
        let unknown = vec![(
            "a".to_string(),
            Command::new("m", json!({"x": "$result[zzz]"})),
        )];
        assert!(validate_references(&unknown).is_err());

        let itself = vec![("a".to_string(), Command::new("m", json!({"x": "$result[a]"})))];
        assert!(validate_references(&itself)
            .unwrap_err()
            .to_string()
            .contains("itself"));
    }

    #[test]
    fn test_validate_accepts_backward_reference() {
        let entries = vec![
            ("a".to_string(), Command::bare("user.current")),
            (
                "b".to_string(),
                Command::new("user.get", json!({"ID": "$result[a][ID]"})),
            ),
        ];
        assert!(validate_references(&entries).is_ok());
    }

    #[test]
    fn test_resolve_substitutes_known_result() {
        let mut known = KnownResults::new();
        known.insert("a".to_string(), Some(json!({"ID": 42, "tags": [1, 2]})));

        let cmd = Command::new(
            "crm.deal.get",
            json!({"id": "$result[a][ID]", "note": "owner $result[a][ID]!", "tags": "$result[a][tags]"}),
        );
        let Resolution::Ready(resolved) = resolve_command(&cmd, &known, &no_local).unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(resolved.params["id"], json!(42));
        assert_eq!(resolved.params["note"], json!("owner 42!"));
        assert_eq!(resolved.params["tags"], json!([1, 2]));
    }

    #[test]
    fn test_resolve_leaves_same_chunk_tokens() {
        let known = KnownResults::new();
        let cmd = Command::new("m", json!({"id": "$result[5][ID]"}));
        let local = |name: &str| (name == "5").then(|| "1".to_string());
        let Resolution::Ready(resolved) = resolve_command(&cmd, &known, &local).unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(resolved.params["id"], json!("$result[1][ID]"));
    }

    #[test]
    fn test_resolve_blocked_by_failed_target() {
        let mut known = KnownResults::new();
        known.insert("a".to_string(), None);
        let cmd = Command::new("m", json!({"id": "$result[a][ID]"}));
        assert_eq!(
            resolve_command(&cmd, &known, &no_local).unwrap(),
            Resolution::Blocked {
                target: "a".to_string()
            }
        );
    }

    #[test]
    fn test_lookup_paths() {
        let v = json!({"items": [{"id": 7}]});
        assert_eq!(lookup(&v, &["items".into(), "0".into(), "id".into()]), json!(7));
        assert_eq!(lookup(&v, &["missing".into()]), Value::Null);
    }
}
