//! LVM2 text metadata parser.
//!
//! The format is a tree of sections (`name { ... }`) holding
//! `key = value` assignments. Values are integers, double-quoted strings
//! with backslash escapes, or bracketed arrays of either. `#` starts a
//! comment that runs to the end of the line.

use std::fmt;

use vms_error::{Result, VmsError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Int(i64),
    Str(String),
    Array(Vec<ConfigValue>),
    Section(ConfigSection),
}

impl ConfigValue {
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[ConfigValue]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_section(&self) -> Option<&ConfigSection> {
        match self {
            Self::Section(v) => Some(v),
            _ => None,
        }
    }
}

/// Ordered list of entries. Keys may repeat; lookups return the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSection {
    entries: Vec<(String, ConfigValue)>,
}

impl ConfigSection {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[must_use]
    pub fn entries(&self) -> &[(String, ConfigValue)] {
        &self.entries
    }

    /// Child sections in file order.
    pub fn sections(&self) -> impl Iterator<Item = (&str, &ConfigSection)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_section().map(|s| (k.as_str(), s)))
    }

    #[must_use]
    pub fn section(&self, key: &str) -> Option<&ConfigSection> {
        self.get(key).and_then(ConfigValue::as_section)
    }

    #[must_use]
    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(ConfigValue::as_int)
    }

    #[must_use]
    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ConfigValue::as_str)
    }

    /// Integer that must be present and non-negative.
    pub fn require_u64(&self, key: &str, context: &str) -> Result<u64> {
        let value = self
            .int(key)
            .ok_or_else(|| VmsError::corruption(context, format!("missing integer `{key}`")))?;
        u64::try_from(value)
            .map_err(|_| VmsError::corruption(context, format!("`{key}` is negative: {value}")))
    }

    pub fn require_str(&self, key: &str, context: &str) -> Result<&str> {
        self.str(key)
            .ok_or_else(|| VmsError::corruption(context, format!("missing string `{key}`")))
    }

    /// String array such as `status = ["READ", "WRITE"]`.
    #[must_use]
    pub fn str_list(&self, key: &str) -> Vec<&str> {
        self.get(key)
            .and_then(ConfigValue::as_array)
            .map(|items| items.iter().filter_map(ConfigValue::as_str).collect())
            .unwrap_or_default()
    }

    fn push(&mut self, key: String, value: ConfigValue) {
        self.entries.push((key, value));
    }
}

/// Parse a full metadata text into its root section.
pub fn parse(text: &str) -> Result<ConfigSection> {
    let mut parser = Parser {
        src: text.as_bytes(),
        pos: 0,
        line: 1,
    };
    let root = parser.section_body(0)?;
    parser.skip_blank();
    if parser.pos < parser.src.len() {
        return Err(parser.error("unexpected `}` at top level"));
    }
    Ok(root)
}

const MAX_NESTING: usize = 32;

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
}

impl Parser<'_> {
    fn error(&self, detail: impl fmt::Display) -> VmsError {
        VmsError::corruption("LVM metadata", format!("line {}: {detail}", self.line))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    /// Skip whitespace and comments. Metadata buffers are NUL padded.
    fn skip_blank(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b'#' => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                b' ' | b'\t' | b'\r' | b'\n' | 0 => {
                    self.bump();
                }
                _ => break,
            }
        }
    }

    fn section_body(&mut self, depth: usize) -> Result<ConfigSection> {
        if depth > MAX_NESTING {
            return Err(self.error("sections nested too deeply"));
        }
        let mut section = ConfigSection::default();
        loop {
            self.skip_blank();
            match self.peek() {
                None | Some(b'}') => return Ok(section),
                Some(_) => {}
            }
            let key = self.identifier()?;
            self.skip_blank();
            match self.bump() {
                Some(b'{') => {
                    let child = self.section_body(depth + 1)?;
                    self.skip_blank();
                    if self.bump() != Some(b'}') {
                        return Err(self.error(format!("section `{key}` is not closed")));
                    }
                    section.push(key, ConfigValue::Section(child));
                }
                Some(b'=') => {
                    self.skip_blank();
                    let value = self.value()?;
                    section.push(key, value);
                }
                other => {
                    return Err(self.error(format!(
                        "expected `=` or `{{` after `{key}`, found {}",
                        describe(other)
                    )));
                }
            }
        }
    }

    fn identifier(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'.' | b'+') {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error(format!("expected a name, found {}", describe(self.peek()))));
        }
        Ok(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn value(&mut self) -> Result<ConfigValue> {
        match self.peek() {
            Some(b'"') => self.string().map(ConfigValue::Str),
            Some(b'[') => {
                self.bump();
                let mut items = Vec::new();
                loop {
                    self.skip_blank();
                    match self.peek() {
                        Some(b']') => {
                            self.bump();
                            return Ok(ConfigValue::Array(items));
                        }
                        Some(b',') => {
                            self.bump();
                        }
                        None => return Err(self.error("unterminated array")),
                        Some(_) => {
                            let item = self.value()?;
                            if matches!(item, ConfigValue::Array(_)) {
                                return Err(self.error("nested arrays are not allowed"));
                            }
                            items.push(item);
                        }
                    }
                }
            }
            Some(c) if c == b'-' || c.is_ascii_digit() => self.integer().map(ConfigValue::Int),
            other => Err(self.error(format!("expected a value, found {}", describe(other)))),
        }
    }

    fn string(&mut self) -> Result<String> {
        self.bump();
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) => out.push(c),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn integer(&mut self) -> Result<i64> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        // Floats never appear in VG metadata; the fractional part is dropped.
        if self.peek() == Some(b'.') {
            let int_end = self.pos;
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
            return self.parse_int(start, int_end);
        }
        self.parse_int(start, self.pos)
    }

    fn parse_int(&self, start: usize, end: usize) -> Result<i64> {
        std::str::from_utf8(&self.src[start..end])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.error("malformed integer"))
    }
}

fn describe(c: Option<u8>) -> String {
    match c {
        None => "end of input".to_owned(),
        Some(c) => format!("`{}`", char::from(c)),
    }
}
