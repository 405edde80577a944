use serde_json::{Deserializer, Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("empty status output")]
    Empty,
    #[error("status output is not a JSON object")]
    NotObject,
    #[error("failed to parse JSON object from status output")]
    NoObject,
}

/// Parses status command output as a JSON object.
///
/// Output that is not clean JSON is scanned for embedded objects starting at every `{`;
/// the one spanning the most bytes wins, which skips log noise printed around the payload.
pub fn extract_json_object(output: &str) -> Result<Map<String, Value>, ExtractError> {
    let text = output.trim();
    if text.is_empty() {
        return Err(ExtractError::Empty);
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return match value {
            Value::Object(map) => Ok(map),
            _ => Err(ExtractError::NotObject),
        };
    }

    let mut best: Option<(usize, Map<String, Value>)> = None;
    for (start, _) in text.match_indices('{') {
        let mut stream = Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(map))) = stream.next() {
            let span = stream.byte_offset();
            if best.as_ref().map_or(true, |(best_span, _)| span > *best_span) {
                best = Some((span, map));
            }
        }
    }
    best.map(|(_, map)| map).ok_or(ExtractError::NoObject)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_object_parses_directly() {
        let map = extract_json_object(" {\"pid\": 1}\n").expect("object");
        assert_eq!(Value::Object(map), json!({"pid": 1}));
    }

    #[test]
    fn non_object_and_empty_output_are_reported() {
        assert_eq!(extract_json_object("  \n"), Err(ExtractError::Empty));
        assert_eq!(extract_json_object("[1, 2]"), Err(ExtractError::NotObject));
        assert_eq!(
            extract_json_object("no json here"),
            Err(ExtractError::NoObject)
        );
    }

    #[test]
    fn largest_embedded_object_wins() {
        let output = "booting {\"x\":1}\nstatus: {\"running\": true, \"inner\": {\"a\": 2}} done";
        let map = extract_json_object(output).expect("object");
        assert_eq!(
            Value::Object(map),
            json!({"running": true, "inner": {"a": 2}})
        );
    }
}
