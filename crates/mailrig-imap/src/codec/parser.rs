//! Response parsing.
//!
//! Parses one complete response unit (a server line with its literals
//! already inlined by the framing reader) into a [`Response`]. The grammar
//! covered here is the generic surface of RFC 3501/9051 responses: tag,
//! command, and an attribute tree of atoms, numbers, quoted strings,
//! literals, lists and the bracketed-section/trailing-text shape of status
//! responses. Command-specific interpretation is left to callers.

#![allow(clippy::missing_errors_doc)]

use bytes::Bytes;

use super::response::{Response, is_status_command};
use super::value::Value;
use crate::{Error, Result};

/// Parses a complete response unit.
pub fn parse_response(input: &[u8]) -> Result<Response> {
    Parser::new(input).parse()
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    const fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(mut self) -> Result<Response> {
        let tag = self.read_token()?;

        if tag == "+" {
            self.eat(b' ');
            return Ok(Response::continuation(self.rest_text()));
        }

        self.skip_spaces();
        let command = self.read_token()?;
        let mut response = Response::new(tag, command);

        if is_status_command(&response.command) {
            self.parse_status_attributes(&mut response)?;
        } else {
            loop {
                self.skip_spaces();
                if self.is_eof() {
                    break;
                }
                let value = self.parse_value(false)?;
                response.attributes.push(value);
            }
        }

        Ok(response)
    }

    /// Status responses carry an optional bracketed section followed by
    /// free-form human text.
    fn parse_status_attributes(&mut self, response: &mut Response) -> Result<()> {
        self.skip_spaces();
        if self.is_eof() {
            return Ok(());
        }

        if self.peek() == Some(b'[') {
            let section = self.parse_section()?;
            response.attributes.push(Value::Section(section));
            self.skip_spaces();
        }

        if !self.is_eof() {
            response.attributes.push(Value::Text(self.rest_text()));
        }

        Ok(())
    }

    fn parse_value(&mut self, in_section: bool) -> Result<Value> {
        match self.peek() {
            None => Err(self.error("unexpected end of response")),
            Some(b'(') => self.parse_list(in_section),
            Some(b'"') => self.parse_quoted(),
            Some(b'{') => self.parse_literal(),
            Some(_) => self.parse_atom(in_section),
        }
    }

    fn parse_list(&mut self, in_section: bool) -> Result<Value> {
        self.advance();
        let mut items = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek() {
                None => return Err(self.error("unterminated list")),
                Some(b')') => {
                    self.advance();
                    return Ok(Value::List(items));
                }
                Some(_) => items.push(self.parse_value(in_section)?),
            }
        }
    }

    fn parse_section(&mut self) -> Result<Vec<Value>> {
        self.advance();
        let mut items = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek() {
                None => return Err(self.error("unterminated section")),
                Some(b']') => {
                    self.advance();
                    return Ok(items);
                }
                Some(_) => items.push(self.parse_value(true)?),
            }
        }
    }

    fn parse_quoted(&mut self) -> Result<Value> {
        self.advance();
        let mut content = Vec::new();
        loop {
            match self.next_byte() {
                None => return Err(self.error("unterminated quoted string")),
                Some(b'"') => break,
                Some(b'\\') => match self.next_byte() {
                    None => return Err(self.error("unterminated escape")),
                    Some(b) => content.push(b),
                },
                Some(b) => content.push(b),
            }
        }
        Ok(Value::Quoted(String::from_utf8_lossy(&content).into_owned()))
    }

    fn parse_literal(&mut self) -> Result<Value> {
        self.advance();

        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.advance();
        }
        if self.pos == digits_start {
            return Err(self.error("literal length missing"));
        }
        let digits = std::str::from_utf8(&self.input[digits_start..self.pos])
            .map_err(|_| self.error("literal length not ASCII"))?;
        let length: usize = digits
            .parse()
            .map_err(|_| self.error("literal length out of range"))?;

        self.eat(b'+');
        if !self.eat(b'}') {
            return Err(self.error("expected '}' after literal length"));
        }
        self.eat(b'\r');
        if !self.eat(b'\n') {
            return Err(self.error("expected CRLF after literal announcement"));
        }

        if self.input.len() - self.pos < length {
            return Err(self.error("literal payload truncated"));
        }
        let payload = Bytes::copy_from_slice(&self.input[self.pos..self.pos + length]);
        self.pos += length;
        Ok(Value::Literal(payload))
    }

    fn parse_atom(&mut self, in_section: bool) -> Result<Value> {
        let mut atom = Vec::new();
        loop {
            match self.peek() {
                None | Some(b' ' | b'(' | b')' | b'"' | b'{') => break,
                Some(b']') if in_section => break,
                // A bracketed run attached to an atom (BODY[HEADER.FIELDS
                // (DATE)], BODY[]<0.100>) stays part of the atom, spaces
                // included.
                Some(b'[') if !in_section => {
                    atom.push(b'[');
                    self.advance();
                    let mut depth = 1usize;
                    while depth > 0 {
                        match self.next_byte() {
                            None => return Err(self.error("unterminated bracket in atom")),
                            Some(b'[') => {
                                depth += 1;
                                atom.push(b'[');
                            }
                            Some(b']') => {
                                depth -= 1;
                                atom.push(b']');
                            }
                            Some(b) => atom.push(b),
                        }
                    }
                }
                Some(b) => {
                    atom.push(b);
                    self.advance();
                }
            }
        }

        if atom.is_empty() {
            return Err(self.error("empty atom"));
        }
        if atom.eq_ignore_ascii_case(b"NIL") {
            return Ok(Value::Nil);
        }
        let text = String::from_utf8_lossy(&atom).into_owned();
        if atom.iter().all(u8::is_ascii_digit)
            && let Ok(n) = text.parse::<u64>()
        {
            return Ok(Value::Number(n));
        }
        Ok(Value::Atom(text))
    }

    fn read_token(&mut self) -> Result<String> {
        let start = self.pos;
        while !matches!(self.peek(), None | Some(b' ')) {
            self.advance();
        }
        if self.pos == start {
            return Err(self.error("expected token"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn rest_text(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.input[self.pos..]).into_owned();
        self.pos = self.input.len();
        text
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn next_byte(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.advance();
        }
    }

    const fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn error(&self, message: &str) -> Error {
        Error::Parse {
            position: self.pos,
            message: message.to_string(),
        }
    }
}
