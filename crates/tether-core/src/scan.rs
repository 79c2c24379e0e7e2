//! Structural scan of JSON text into a flat arena.
//!
//! Containers hold the arena indices of their children, so neither scanning
//! nor dropping the result recurses, whatever the nesting depth. Scalars are
//! validated here and decoded later from their byte span.

use std::ops::Range;

use serde::de::IgnoredAny;

use crate::CoreError;

/// One JSON value of the scanned text.
#[derive(Debug)]
pub(crate) struct Item {
    /// Byte range of the value's text.
    pub span: Range<usize>,
    pub body: Body,
}

#[derive(Debug)]
pub(crate) enum Body {
    /// String, number, `true`, `false` or `null`.
    Scalar,
    Array(Vec<usize>),
    /// Members in text order.
    Object(Vec<(String, usize)>),
}

/// Scans `text`, which must hold exactly one JSON value. The root is item 0.
pub(crate) fn scan(text: &str) -> Result<Vec<Item>, CoreError> {
    let mut cursor = Cursor { text, pos: 0 };
    let mut items: Vec<Item> = Vec::new();
    let mut open: Vec<usize> = Vec::new();
    let mut pending_key: Option<String> = None;

    loop {
        cursor.skip_whitespace();
        let index = items.len();
        let start = cursor.pos;
        let (body, closer) = match cursor.peek() {
            Some(b'[') => (Body::Array(Vec::new()), Some(b']')),
            Some(b'{') => (Body::Object(Vec::new()), Some(b'}')),
            Some(_) => {
                cursor.skip_scalar()?;
                (Body::Scalar, None)
            }
            None => return Err(cursor.error("expected a value")),
        };

        if let Some(&parent) = open.last() {
            match &mut items[parent].body {
                Body::Array(children) => children.push(index),
                Body::Object(members) => {
                    let key = pending_key.take().ok_or_else(|| cursor.error("expected a key"))?;
                    members.push((key, index));
                }
                Body::Scalar => return Err(cursor.error("scalar cannot hold values")),
            }
        }
        items.push(Item {
            span: start..cursor.pos,
            body,
        });

        if let Some(closer) = closer {
            cursor.pos += 1;
            cursor.skip_whitespace();
            if cursor.eat(closer) {
                items[index].span.end = cursor.pos;
            } else {
                open.push(index);
                if closer == b'}' {
                    pending_key = Some(cursor.key()?);
                }
                continue;
            }
        }

        // A value just ended: close finished containers until a separator.
        loop {
            cursor.skip_whitespace();
            let Some(&parent) = open.last() else {
                if cursor.pos != text.len() {
                    return Err(cursor.error("trailing characters"));
                }
                return Ok(items);
            };
            let in_array = matches!(items[parent].body, Body::Array(_));
            match cursor.next_byte() {
                Some(b',') => {
                    if !in_array {
                        pending_key = Some(cursor.key()?);
                    }
                    break;
                }
                Some(b']') if in_array => {
                    open.pop();
                    items[parent].span.end = cursor.pos;
                }
                Some(b'}') if !in_array => {
                    open.pop();
                    items[parent].span.end = cursor.pos;
                }
                _ => return Err(cursor.error("expected `,` or a closing bracket")),
            }
        }
    }
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn next_byte(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    /// Skips one scalar and checks it with serde_json.
    fn skip_scalar(&mut self) -> Result<(), CoreError> {
        let start = self.pos;
        match self.peek() {
            Some(b'"') => self.skip_string()?,
            Some(b'-' | b'0'..=b'9' | b't' | b'f' | b'n') => {
                while matches!(
                    self.peek(),
                    Some(b'-' | b'+' | b'.' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
                ) {
                    self.pos += 1;
                }
            }
            _ => return Err(self.error("expected a value")),
        }
        serde_json::from_str::<IgnoredAny>(&self.text[start..self.pos])
            .map(|_| ())
            .map_err(|err| self.error(&err.to_string()))
    }

    fn skip_string(&mut self) -> Result<(), CoreError> {
        self.pos += 1;
        loop {
            match self.next_byte() {
                Some(b'"') => return Ok(()),
                Some(b'\\') => {
                    if self.next_byte().is_none() {
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
        Err(self.error("unterminated string"))
    }

    /// Reads `"key" :` and returns the decoded key.
    fn key(&mut self) -> Result<String, CoreError> {
        self.skip_whitespace();
        if self.peek() != Some(b'"') {
            return Err(self.error("expected a key"));
        }
        let start = self.pos;
        self.skip_string()?;
        let key = serde_json::from_str::<String>(&self.text[start..self.pos])
            .map_err(|err| self.error(&err.to_string()))?;
        self.skip_whitespace();
        if !self.eat(b':') {
            return Err(self.error("expected `:`"));
        }
        Ok(key)
    }

    fn error(&self, message: &str) -> CoreError {
        CoreError::InvalidJson(format!("{message} at byte {}", self.pos))
    }
}
