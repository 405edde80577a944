use serde_json::Value;

const RENDER_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathToken {
    Key(String),
    Index(usize),
}

/// Parses a restricted JSONPath (`$`, `.key`, `[n]`). Returns `None` for anything else.
pub fn parse_path(path: &str) -> Option<Vec<PathToken>> {
    let text = path.trim();
    let rest = text.strip_prefix('$')?;

    let mut tokens = Vec::new();
    let mut chars = rest.char_indices().peekable();
    while let Some((_, current)) = chars.next() {
        match current {
            '.' => {
                let mut key = String::new();
                while let Some((_, ch)) = chars.peek() {
                    if *ch == '.' || *ch == '[' {
                        break;
                    }
                    key.push(*ch);
                    chars.next();
                }
                if key.is_empty() {
                    return None;
                }
                tokens.push(PathToken::Key(key));
            }
            '[' => {
                let mut digits = String::new();
                while let Some((_, ch)) = chars.peek() {
                    if !ch.is_ascii_digit() {
                        break;
                    }
                    digits.push(*ch);
                    chars.next();
                }
                if digits.is_empty() {
                    return None;
                }
                match chars.next() {
                    Some((_, ']')) => {}
                    _ => return None,
                }
                tokens.push(PathToken::Index(digits.parse().ok()?));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let tokens = parse_path(path)?;
    let mut node = root;
    for token in &tokens {
        node = match (token, node) {
            (PathToken::Index(index), Value::Array(items)) => items.get(*index)?,
            (PathToken::Key(key), Value::Object(map)) => map.get(key)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Display text for a bound value: `-` when absent or null, compact JSON for
/// structured values (clipped to 200 chars), raw text otherwise.
pub fn render_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(structured @ (Value::Array(_) | Value::Object(_))) => {
            let text = structured.to_string();
            if text.chars().count() <= RENDER_MAX_CHARS {
                text
            } else {
                let clipped: String = text.chars().take(RENDER_MAX_CHARS - 3).collect();
                format!("{clipped}...")
            }
        }
        Some(scalar) => scalar.to_string(),
    }
}

/// `"a.b"` becomes `"$.a.b"`; blank segments are dropped.
pub fn dot_key_to_jsonpath(key: &str) -> String {
    let parts: Vec<&str> = key
        .split('.')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        return "$".to_string();
    }
    format!("$.{}", parts.join("."))
}
