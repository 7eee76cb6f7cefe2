//! Tolerant JSON for model output.
//!
//! Models wrap JSON in prose or markdown fences, forget commas, leave trailing
//! commas, use single or full-width quotes, and get cut off by `max_tokens`.
//! [`extract_outermost_object`] isolates the payload by its first `{` and last
//! `}`; [`parse`] returns `Ok` for valid JSON and otherwise a best-effort
//! [`PartialValue`] built by a recursive-descent parser that records every
//! recovery it applied.

use serde_json::{Map, Number, Value};

const MAX_DEPTH: usize = 128;

/// Recovery applied while reading malformed input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Repair {
    LeadingText,
    TrailingText,
    TrailingComma,
    MissingComma,
    MissingColon,
    MissingValue,
    SingleQuotes,
    FullWidthPunctuation,
    UnescapedQuote,
    BareKey,
    UnquotedString,
    ControlCharacter,
    Comment,
    PythonLiteral,
    SkippedGarbage,
    DroppedDanglingKey,
    Truncated,
    DepthLimit,
}

/// Best-effort value recovered from malformed input.
#[derive(Clone, Debug, PartialEq)]
pub struct PartialValue {
    pub value: Value,
    pub repairs: Vec<Repair>,
}

impl PartialValue {
    pub fn is_empty(&self) -> bool {
        match &self.value {
            Value::Null => true,
            Value::Object(m) => m.is_empty(),
            Value::Array(a) => a.is_empty(),
            _ => false,
        }
    }
}

/// Substring from the first `{` to the last `}` inclusive.
pub fn extract_outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Like [`extract_outermost_object`], but starts from whichever of `{` / `[`
/// comes first so bare top-level arrays survive.
pub fn extract_outermost(text: &str) -> Option<&str> {
    let obj = text.find('{');
    let arr = text.find('[');
    match (obj, arr) {
        (Some(o), Some(a)) if a < o => {
            let end = text.rfind(']')?;
            (end > a).then(|| &text[a..=end])
        }
        (None, Some(a)) => {
            let end = text.rfind(']')?;
            (end > a).then(|| &text[a..=end])
        }
        _ => extract_outermost_object(text),
    }
}

/// Strict parse first, then recovery.
pub fn parse(text: &str) -> Result<Value, PartialValue> {
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        return Ok(v);
    }
    let mut p = Parser::new(text);
    let value = p.parse_document();
    Err(PartialValue { value, repairs: p.repairs })
}

/// [`parse`] with both branches collapsed into a value.
pub fn parse_lenient(text: &str) -> Value {
    match parse(text) {
        Ok(v) => v,
        Err(partial) => partial.value,
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
    repairs: Vec<Repair>,
}

fn is_comma(c: char) -> bool {
    c == ',' || c == '，'
}

fn is_colon(c: char) -> bool {
    c == ':' || c == '：'
}

fn closing_quote(open: char) -> Option<char> {
    match open {
        '"' => Some('"'),
        '\'' => Some('\''),
        '“' => Some('”'),
        '‘' => Some('’'),
        _ => None,
    }
}

impl Parser {
    fn new(text: &str) -> Self {
        Self { chars: text.chars().collect(), pos: 0, depth: 0, repairs: Vec::new() }
    }

    fn note(&mut self, r: Repair) {
        if !self.repairs.contains(&r) {
            self.repairs.push(r);
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => self.pos += 1,
                Some('/') if self.peek_at(1) == Some('/') => {
                    self.note(Repair::Comment);
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.note(Repair::Comment);
                    self.pos += 2;
                    loop {
                        match self.bump() {
                            None => break,
                            Some('*') if self.peek() == Some('/') => {
                                self.pos += 1;
                                break;
                            }
                            _ => {}
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn parse_document(&mut self) -> Value {
        let first_container = self.chars.iter().position(|c| *c == '{' || *c == '[');
        if let Some(idx) = first_container {
            if self.chars[..idx].iter().any(|c| !c.is_whitespace()) {
                self.note(Repair::LeadingText);
            }
            self.pos = idx;
        }
        let value = self.parse_value().unwrap_or(Value::Null);
        self.skip_ws();
        if self.pos < self.chars.len() {
            self.note(Repair::TrailingText);
        }
        value
    }

    /// `None` means input ended before a value started.
    fn parse_value(&mut self) -> Option<Value> {
        loop {
            self.skip_ws();
            let c = match self.peek() {
                Some(c) => c,
                None => {
                    self.note(Repair::Truncated);
                    return None;
                }
            };
            return match c {
                '{' => Some(self.parse_object()),
                '[' => Some(self.parse_array()),
                '"' | '\'' | '“' | '‘' => Some(Value::String(self.parse_string(false))),
                '-' | '0'..='9' => Some(self.parse_number()),
                '}' | ']' => {
                    self.note(Repair::MissingValue);
                    Some(Value::Null)
                }
                c if is_comma(c) => {
                    self.note(Repair::MissingValue);
                    Some(Value::Null)
                }
                c if c.is_alphabetic() || c == '_' => Some(self.parse_bare_value()),
                _ => {
                    self.note(Repair::SkippedGarbage);
                    self.pos += 1;
                    continue;
                }
            };
        }
    }

    fn enter(&mut self) -> bool {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.note(Repair::DepthLimit);
            return false;
        }
        true
    }

    fn parse_object(&mut self) -> Value {
        self.pos += 1; // '{'
        let mut map = Map::new();
        if !self.enter() {
            self.pos = self.chars.len();
            self.depth -= 1;
            return Value::Object(map);
        }
        let mut after_comma = false;
        loop {
            self.skip_ws();
            match self.peek() {
                None => {
                    self.note(Repair::Truncated);
                    break;
                }
                Some('}') => {
                    if after_comma {
                        self.note(Repair::TrailingComma);
                    }
                    self.pos += 1;
                    break;
                }
                Some(']') => {
                    // Mismatched close; treat as the end of this object.
                    self.note(Repair::SkippedGarbage);
                    self.pos += 1;
                    break;
                }
                Some(c) if is_comma(c) => {
                    if c == '，' {
                        self.note(Repair::FullWidthPunctuation);
                    }
                    self.note(Repair::TrailingComma);
                    self.pos += 1;
                    after_comma = true;
                    continue;
                }
                _ => {}
            }

            let key = match self.parse_key() {
                Some(k) => k,
                None => continue,
            };

            self.skip_ws();
            match self.peek() {
                None => {
                    self.note(Repair::Truncated);
                    self.note(Repair::DroppedDanglingKey);
                    break;
                }
                Some(c) if is_colon(c) => {
                    if c == '：' {
                        self.note(Repair::FullWidthPunctuation);
                    }
                    self.pos += 1;
                }
                _ => self.note(Repair::MissingColon),
            }

            match self.parse_value() {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    self.note(Repair::DroppedDanglingKey);
                    break;
                }
            }

            self.skip_ws();
            after_comma = false;
            match self.peek() {
                Some(c) if is_comma(c) => {
                    if c == '，' {
                        self.note(Repair::FullWidthPunctuation);
                    }
                    self.pos += 1;
                    after_comma = true;
                }
                Some('}') | None => {}
                Some(_) => self.note(Repair::MissingComma),
            }
        }
        self.depth -= 1;
        Value::Object(map)
    }

    /// Reads a quoted or bare key. Returns `None` after skipping a stray char.
    fn parse_key(&mut self) -> Option<String> {
        let c = self.peek()?;
        if closing_quote(c).is_some() {
            return Some(self.parse_string(true));
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || is_colon(c) || is_comma(c) || matches!(c, '{' | '}' | '[' | ']' | '"') {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            self.note(Repair::SkippedGarbage);
            self.pos += 1;
            return None;
        }
        self.note(Repair::BareKey);
        Some(self.chars[start..self.pos].iter().collect())
    }

    fn parse_array(&mut self) -> Value {
        self.pos += 1; // '['
        let mut items = Vec::new();
        if !self.enter() {
            self.pos = self.chars.len();
            self.depth -= 1;
            return Value::Array(items);
        }
        let mut after_comma = false;
        loop {
            self.skip_ws();
            match self.peek() {
                None => {
                    self.note(Repair::Truncated);
                    break;
                }
                Some(']') => {
                    if after_comma {
                        self.note(Repair::TrailingComma);
                    }
                    self.pos += 1;
                    break;
                }
                Some('}') => {
                    self.note(Repair::SkippedGarbage);
                    self.pos += 1;
                    break;
                }
                Some(c) if is_comma(c) => {
                    if c == '，' {
                        self.note(Repair::FullWidthPunctuation);
                    }
                    self.note(Repair::TrailingComma);
                    self.pos += 1;
                    after_comma = true;
                    continue;
                }
                _ => {}
            }

            match self.parse_value() {
                Some(v) => items.push(v),
                None => break,
            }

            self.skip_ws();
            after_comma = false;
            match self.peek() {
                Some(c) if is_comma(c) => {
                    if c == '，' {
                        self.note(Repair::FullWidthPunctuation);
                    }
                    self.pos += 1;
                    after_comma = true;
                }
                Some(']') | None => {}
                Some(_) => self.note(Repair::MissingComma),
            }
        }
        self.depth -= 1;
        Value::Array(items)
    }

    /// `key` marks object-key position, where a full-width colon may follow.
    fn parse_string(&mut self, key: bool) -> String {
        let open = self.bump().unwrap_or('"');
        let close = closing_quote(open).unwrap_or('"');
        match open {
            '\'' => self.note(Repair::SingleQuotes),
            '“' | '‘' => self.note(Repair::FullWidthPunctuation),
            _ => {}
        }

        let mut out = String::new();
        loop {
            let c = match self.bump() {
                Some(c) => c,
                None => {
                    self.note(Repair::Truncated);
                    return out;
                }
            };
            if c == close || (open == '“' && c == '"') {
                if open == '"' && !self.quote_ends_string(key) {
                    self.note(Repair::UnescapedQuote);
                    out.push(c);
                    continue;
                }
                return out;
            }
            match c {
                '\\' => self.read_escape(&mut out),
                '\n' | '\r' | '\t' => {
                    self.note(Repair::ControlCharacter);
                    out.push(c);
                }
                c if c.is_control() => {
                    self.note(Repair::ControlCharacter);
                    out.push(c);
                }
                c => out.push(c),
            }
        }
    }

    /// A `"` closes the string only if what follows can continue the structure.
    ///
    /// Full-width `，` counts only before a closing bracket or the next quoted
    /// key, and full-width `：` only after a key: both are common inside
    /// Chinese prose right after a quoted word.
    fn quote_ends_string(&self, key: bool) -> bool {
        let Some(i) = self.next_significant(self.pos) else { return true };
        match self.chars[i] {
            ',' | ':' | '}' | ']' => true,
            '/' => matches!(self.chars.get(i + 1), Some('/') | Some('*')),
            '：' => key,
            '，' => match self.next_significant(i + 1) {
                None => true,
                Some(j) => matches!(self.chars[j], '}' | ']') || self.quoted_key_at(j),
            },
            // missing comma before the next member
            c if closing_quote(c).is_some() => self.quoted_key_at(i),
            _ => false,
        }
    }

    fn next_significant(&self, mut i: usize) -> Option<usize> {
        while let Some(c) = self.chars.get(i) {
            if !c.is_whitespace() {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// True if a quoted string starts at `i`, stays on one line, and is
    /// followed by a colon.
    fn quoted_key_at(&self, i: usize) -> bool {
        let Some(close) = self.chars.get(i).copied().and_then(closing_quote) else { return false };
        let mut j = i + 1;
        while let Some(&c) = self.chars.get(j) {
            match c {
                '\\' => j += 2,
                '\n' => return false,
                c if c == close || (close == '”' && c == '"') => {
                    return self.next_significant(j + 1).is_some_and(|k| is_colon(self.chars[k]));
                }
                _ => j += 1,
            }
        }
        false
    }

    fn read_escape(&mut self, out: &mut String) {
        let c = match self.bump() {
            Some(c) => c,
            None => {
                self.note(Repair::Truncated);
                return;
            }
        };
        match c {
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            '/' => out.push('/'),
            'b' => out.push('\u{0008}'),
            'f' => out.push('\u{000C}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'u' => {
                let Some(hi) = self.read_hex4() else {
                    self.note(Repair::Truncated);
                    return;
                };
                if (0xD800..0xDC00).contains(&hi)
                    && self.peek() == Some('\\')
                    && self.peek_at(1) == Some('u')
                {
                    self.pos += 2;
                    if let Some(lo) = self.read_hex4() {
                        if (0xDC00..0xE000).contains(&lo) {
                            let code = 0x10000 + ((hi - 0xD800) << 10) + (lo - 0xDC00);
                            out.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                        } else {
                            // unpaired high surrogate; keep the escape that followed
                            out.push('\u{FFFD}');
                            out.push(char::from_u32(lo).unwrap_or('\u{FFFD}'));
                        }
                        return;
                    }
                }
                out.push(char::from_u32(hi).unwrap_or('\u{FFFD}'));
            }
            other => out.push(other),
        }
    }

    fn read_hex4(&mut self) -> Option<u32> {
        if self.pos + 4 > self.chars.len() {
            self.pos = self.chars.len();
            return None;
        }
        let s: String = self.chars[self.pos..self.pos + 4].iter().collect();
        let v = u32::from_str_radix(&s, 16).ok()?;
        self.pos += 4;
        Some(v)
    }

    fn parse_number(&mut self) -> Value {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let raw: String = self.chars[start..self.pos].iter().collect();
        if self.peek().is_none() {
            // A number at EOF may be cut short; what we have is still usable.
            self.note(Repair::Truncated);
        }
        number_value(&raw).unwrap_or_else(|| {
            let trimmed = raw.trim_end_matches(|c: char| !c.is_ascii_digit());
            number_value(trimmed).unwrap_or(Value::Null)
        })
    }

    /// Unquoted token in value position: literals, or a bare string up to the next delimiter.
    fn parse_bare_value(&mut self) -> Value {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        let boundary = self.peek().map_or(true, |c| c.is_whitespace() || is_comma(c) || matches!(c, '}' | ']'));
        if boundary {
            match word.as_str() {
                "true" => return Value::Bool(true),
                "false" => return Value::Bool(false),
                "null" => return Value::Null,
                "True" => {
                    self.note(Repair::PythonLiteral);
                    return Value::Bool(true);
                }
                "False" => {
                    self.note(Repair::PythonLiteral);
                    return Value::Bool(false);
                }
                "None" | "undefined" | "NaN" => {
                    self.note(Repair::PythonLiteral);
                    return Value::Null;
                }
                _ => {}
            }
        }

        while let Some(c) = self.peek() {
            if is_comma(c) || matches!(c, '}' | ']' | '\n') {
                break;
            }
            self.pos += 1;
        }
        self.note(Repair::UnquotedString);
        let text: String = self.chars[start..self.pos].iter().collect();
        Value::String(text.trim().to_string())
    }
}

fn number_value(raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Value::Number(Number::from(i)));
    }
    raw.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number)
}
