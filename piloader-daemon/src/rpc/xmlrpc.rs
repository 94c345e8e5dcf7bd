// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! XML-RPC wire encoding.
//!
//! Hand-rolled on top of quick-xml events: the protocol surface used by
//! the control clients is small (scalars, base64 blobs, structs, arrays,
//! nil) and a fixed envelope, so a full serde mapping would be more
//! machinery than the format.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use std::collections::BTreeMap;
use thiserror::Error;

/// An XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Bool(bool),
    Str(String),
    Double(f64),
    Base64(Vec<u8>),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
    Nil,
}

impl Value {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(i32::from(*v)),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_base64(&self) -> Option<&[u8]> {
        match self {
            Value::Base64(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// A method fault sent back to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("fault {code}: {message}")]
pub struct Fault {
    pub code: i32,
    pub message: String,
}

impl Fault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum XmlRpcError {
    #[error("request is not valid UTF-8")]
    NotUtf8,
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("unexpected element '{0}'")]
    Unexpected(String),
    #[error("unknown value type '{0}'")]
    UnknownType(String),
    #[error("invalid scalar '{0}'")]
    InvalidScalar(String),
    #[error("truncated document")]
    Truncated,
}

/// Parse a `<methodCall>` envelope into method name and parameters.
pub fn parse_method_call(body: &[u8]) -> Result<(String, Vec<Value>), XmlRpcError> {
    let text = std::str::from_utf8(body).map_err(|_| XmlRpcError::NotUtf8)?;
    let mut parser = Parser::new(text);

    parser.expect_start("methodCall")?;
    parser.expect_start("methodName")?;
    let (name, consumed_end) = parser.text_until_end("methodName")?;
    if !consumed_end {
        parser.expect_end("methodName")?;
    }

    let mut params = Vec::new();
    match parser.next()? {
        Event::Start(e) if e.name().as_ref() == b"params" => {
            loop {
                match parser.next()? {
                    Event::Start(e) if e.name().as_ref() == b"param" => {
                        parser.expect_start("value")?;
                        params.push(parser.parse_value()?);
                        parser.expect_end("param")?;
                    }
                    Event::End(e) if e.name().as_ref() == b"params" => break,
                    other => return Err(unexpected(&other)),
                }
            }
            parser.expect_end("methodCall")?;
        }
        Event::End(e) if e.name().as_ref() == b"methodCall" => {}
        other => return Err(unexpected(&other)),
    }

    Ok((name, params))
}

/// Serialize a successful `<methodResponse>`.
pub fn write_method_response(value: &Value) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodResponse><params><param>");
    write_value(&mut out, value);
    out.push_str("</param></params></methodResponse>");
    out
}

/// Serialize a `<fault>` response.
pub fn write_fault(fault: &Fault) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodResponse><fault>");
    let mut members = BTreeMap::new();
    members.insert("faultCode".to_string(), Value::Int(fault.code));
    members.insert("faultString".to_string(), Value::Str(fault.message.clone()));
    write_value(&mut out, &Value::Struct(members));
    out.push_str("</fault></methodResponse>");
    out
}

/// Serialize a `<methodCall>`; used by tests and client tooling.
pub fn write_method_call(name: &str, params: &[Value]) -> String {
    let mut out = format!(
        "<?xml version=\"1.0\"?>\n<methodCall><methodName>{}</methodName><params>",
        escape(name)
    );
    for param in params {
        out.push_str("<param>");
        write_value(&mut out, param);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Parse a `<methodResponse>`; used by tests and client tooling.
pub fn parse_method_response(body: &[u8]) -> Result<Result<Value, Fault>, XmlRpcError> {
    let text = std::str::from_utf8(body).map_err(|_| XmlRpcError::NotUtf8)?;
    let mut parser = Parser::new(text);

    parser.expect_start("methodResponse")?;
    match parser.next()? {
        Event::Start(e) if e.name().as_ref() == b"params" => {
            parser.expect_start("param")?;
            parser.expect_start("value")?;
            let value = parser.parse_value()?;
            Ok(Ok(value))
        }
        Event::Start(e) if e.name().as_ref() == b"fault" => {
            parser.expect_start("value")?;
            let value = parser.parse_value()?;
            let Value::Struct(members) = value else {
                return Err(XmlRpcError::Unexpected("fault without struct".into()));
            };
            let code = members
                .get("faultCode")
                .and_then(Value::as_int)
                .unwrap_or(0);
            let message = members
                .get("faultString")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            Ok(Err(Fault { code, message }))
        }
        other => Err(unexpected(&other)),
    }
}

fn write_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Int(v) => out.push_str(&format!("<int>{v}</int>")),
        Value::Bool(v) => out.push_str(&format!("<boolean>{}</boolean>", u8::from(*v))),
        Value::Str(v) => out.push_str(&format!("<string>{}</string>", escape(v.as_str()))),
        Value::Double(v) => out.push_str(&format!("<double>{v}</double>")),
        Value::Base64(bytes) => {
            out.push_str("<base64>");
            out.push_str(&BASE64.encode(bytes));
            out.push_str("</base64>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str(&format!("<member><name>{}</name>", escape(name.as_str())));
                write_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
        Value::Nil => out.push_str("<nil/>"),
    }
    out.push_str("</value>");
}

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);
        Self { reader }
    }

    /// Next structural event, skipping declaration and comments.
    fn next(&mut self) -> Result<Event<'a>, XmlRpcError> {
        loop {
            match self.reader.read_event()? {
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => return Err(XmlRpcError::Truncated),
                event => return Ok(event),
            }
        }
    }

    fn expect_start(&mut self, tag: &str) -> Result<(), XmlRpcError> {
        match self.next()? {
            Event::Start(e) if e.name().as_ref() == tag.as_bytes() => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn expect_end(&mut self, tag: &str) -> Result<(), XmlRpcError> {
        match self.next()? {
            Event::End(e) if e.name().as_ref() == tag.as_bytes() => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Text content up to the closing tag. Returns the text and whether
    /// the closing tag was already consumed.
    fn text_until_end(&mut self, tag: &str) -> Result<(String, bool), XmlRpcError> {
        match self.next()? {
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| XmlRpcError::InvalidScalar(e.to_string()))?
                    .into_owned();
                Ok((text, false))
            }
            Event::End(e) if e.name().as_ref() == tag.as_bytes() => Ok((String::new(), true)),
            other => Err(unexpected(&other)),
        }
    }

    /// Parse the content after an opening `<value>` tag, consuming the
    /// matching `</value>`.
    fn parse_value(&mut self) -> Result<Value, XmlRpcError> {
        let value = match self.next()? {
            // <value>plain text</value> carries an implicit string
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| XmlRpcError::InvalidScalar(e.to_string()))?
                    .into_owned();
                self.expect_end("value")?;
                return Ok(Value::Str(text));
            }
            Event::End(e) if e.name().as_ref() == b"value" => {
                return Ok(Value::Str(String::new()));
            }
            Event::Empty(e) => {
                let value = match e.name().as_ref() {
                    b"nil" => Value::Nil,
                    b"string" => Value::Str(String::new()),
                    b"base64" => Value::Base64(Vec::new()),
                    other => {
                        return Err(XmlRpcError::UnknownType(
                            String::from_utf8_lossy(other).into_owned(),
                        ));
                    }
                };
                self.expect_end("value")?;
                return Ok(value);
            }
            Event::Start(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match tag.as_str() {
                    "i4" | "int" => {
                        let text = self.scalar_text(&tag)?;
                        Value::Int(
                            text.trim()
                                .parse()
                                .map_err(|_| XmlRpcError::InvalidScalar(text))?,
                        )
                    }
                    "boolean" => {
                        let text = self.scalar_text(&tag)?;
                        match text.trim() {
                            "1" | "true" => Value::Bool(true),
                            "0" | "false" => Value::Bool(false),
                            _ => return Err(XmlRpcError::InvalidScalar(text)),
                        }
                    }
                    "string" => Value::Str(self.scalar_text(&tag)?),
                    "double" => {
                        let text = self.scalar_text(&tag)?;
                        Value::Double(
                            text.trim()
                                .parse()
                                .map_err(|_| XmlRpcError::InvalidScalar(text))?,
                        )
                    }
                    "base64" => {
                        let text = self.scalar_text(&tag)?;
                        let compact: String = text.split_whitespace().collect();
                        Value::Base64(
                            BASE64
                                .decode(compact.as_bytes())
                                .map_err(|_| XmlRpcError::InvalidScalar(text))?,
                        )
                    }
                    "nil" => {
                        self.expect_end("nil")?;
                        Value::Nil
                    }
                    "array" => self.parse_array()?,
                    "struct" => self.parse_struct()?,
                    other => return Err(XmlRpcError::UnknownType(other.to_string())),
                }
            }
            other => return Err(unexpected(&other)),
        };
        self.expect_end("value")?;
        Ok(value)
    }

    /// Text of a scalar element, consuming its closing tag.
    fn scalar_text(&mut self, tag: &str) -> Result<String, XmlRpcError> {
        let (text, consumed_end) = self.text_until_end(tag)?;
        if !consumed_end {
            self.expect_end(tag)?;
        }
        Ok(text)
    }

    /// Content after `<array>`, consuming `</array>`.
    fn parse_array(&mut self) -> Result<Value, XmlRpcError> {
        self.expect_start("data")?;
        let mut items = Vec::new();
        loop {
            match self.next()? {
                Event::Start(e) if e.name().as_ref() == b"value" => {
                    items.push(self.parse_value()?);
                }
                Event::End(e) if e.name().as_ref() == b"data" => break,
                other => return Err(unexpected(&other)),
            }
        }
        self.expect_end("array")?;
        Ok(Value::Array(items))
    }

    /// Content after `<struct>`, consuming `</struct>`.
    fn parse_struct(&mut self) -> Result<Value, XmlRpcError> {
        let mut members = BTreeMap::new();
        loop {
            match self.next()? {
                Event::Start(e) if e.name().as_ref() == b"member" => {
                    self.expect_start("name")?;
                    let (name, consumed_end) = self.text_until_end("name")?;
                    if !consumed_end {
                        self.expect_end("name")?;
                    }
                    self.expect_start("value")?;
                    let value = self.parse_value()?;
                    self.expect_end("member")?;
                    members.insert(name, value);
                }
                Event::End(e) if e.name().as_ref() == b"struct" => break,
                other => return Err(unexpected(&other)),
            }
        }
        Ok(Value::Struct(members))
    }
}

fn unexpected(event: &Event<'_>) -> XmlRpcError {
    XmlRpcError::Unexpected(format!("{event:?}"))
}
