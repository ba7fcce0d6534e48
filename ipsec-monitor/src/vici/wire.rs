// VICI message encoding

//! VICI message elements
//!
//! A message is a flat stream of typed elements: key/value pairs, lists of
//! values, and named sections that nest further elements. Keys are always
//! text; values are kept as raw bytes and decoded by the caller.

use crate::error::ViciError;
use bytes::{Buf, BufMut, BytesMut};

const SECTION_START: u8 = 1;
const SECTION_END: u8 = 2;
const KEY_VALUE: u8 = 3;
const LIST_START: u8 = 4;
const LIST_ITEM: u8 = 5;
const LIST_END: u8 = 6;

/// A single value in a VICI message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Raw key/value payload
    Str(Vec<u8>),
    /// Ordered list of raw values
    List(Vec<Vec<u8>>),
    /// Nested section
    Section(Message),
}

/// Ordered VICI message (or section body)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    entries: Vec<(String, Value)>,
}

impl Message {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key/value pair
    pub fn with_str(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.entries
            .push((key.to_string(), Value::Str(value.into())));
        self
    }

    /// Append a list
    pub fn with_list<I, T>(mut self, key: &str, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        let items = items.into_iter().map(Into::into).collect();
        self.entries.push((key.to_string(), Value::List(items)));
        self
    }

    /// Append a nested section
    pub fn with_section(mut self, key: &str, section: Message) -> Self {
        self.entries
            .push((key.to_string(), Value::Section(section)));
        self
    }

    /// Look up the first value stored under `key`
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Raw bytes of a key/value entry
    pub fn str(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(Value::Str(v)) => Some(v),
            _ => None,
        }
    }

    /// Items of a list entry
    pub fn list(&self, key: &str) -> Option<&[Vec<u8>]> {
        match self.get(key) {
            Some(Value::List(items)) => Some(items),
            _ => None,
        }
    }

    /// Body of a section entry
    pub fn section(&self, key: &str) -> Option<&Message> {
        match self.get(key) {
            Some(Value::Section(s)) => Some(s),
            _ => None,
        }
    }

    /// Iterate entries in wire order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate only the section entries, in wire order
    pub fn sections(&self) -> impl Iterator<Item = (&str, &Message)> {
        self.iter().filter_map(|(k, v)| match v {
            Value::Section(s) => Some((k, s)),
            _ => None,
        })
    }

    /// True if the message has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize all elements into `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ViciError> {
        for (key, value) in &self.entries {
            match value {
                Value::Str(v) => {
                    buf.put_u8(KEY_VALUE);
                    put_name(buf, key)?;
                    put_value(buf, v)?;
                }
                Value::List(items) => {
                    buf.put_u8(LIST_START);
                    put_name(buf, key)?;
                    for item in items {
                        buf.put_u8(LIST_ITEM);
                        put_value(buf, item)?;
                    }
                    buf.put_u8(LIST_END);
                }
                Value::Section(section) => {
                    buf.put_u8(SECTION_START);
                    put_name(buf, key)?;
                    section.encode(buf)?;
                    buf.put_u8(SECTION_END);
                }
            }
        }
        Ok(())
    }

    /// Parse elements until `buf` is exhausted
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ViciError> {
        // Parents of the section currently being filled, with the child's name
        let mut stack: Vec<(String, Message)> = Vec::new();
        let mut current = Message::new();

        while buf.has_remaining() {
            match buf.get_u8() {
                SECTION_START => {
                    let name = read_name(buf)?;
                    stack.push((name, std::mem::take(&mut current)));
                }
                SECTION_END => {
                    let (name, parent) = stack
                        .pop()
                        .ok_or_else(|| ViciError::protocol("section end without start"))?;
                    let section = std::mem::replace(&mut current, parent);
                    current.entries.push((name, Value::Section(section)));
                }
                KEY_VALUE => {
                    let name = read_name(buf)?;
                    let value = read_value(buf)?;
                    current.entries.push((name, Value::Str(value)));
                }
                LIST_START => {
                    let name = read_name(buf)?;
                    let items = read_list(buf, &name)?;
                    current.entries.push((name, Value::List(items)));
                }
                other => {
                    return Err(ViciError::protocol(format!(
                        "unknown message element type {}",
                        other
                    )))
                }
            }
        }

        if let Some((name, _)) = stack.last() {
            return Err(ViciError::protocol(format!(
                "section '{}' is not terminated",
                name
            )));
        }

        Ok(current)
    }
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<(), ViciError> {
    let len = u8::try_from(name.len())
        .map_err(|_| ViciError::protocol(format!("name too long: {} bytes", name.len())))?;
    buf.put_u8(len);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &[u8]) -> Result<(), ViciError> {
    let len = u16::try_from(value.len())
        .map_err(|_| ViciError::protocol(format!("value too long: {} bytes", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

fn ensure_remaining<B: Buf>(buf: &B, needed: usize) -> Result<(), ViciError> {
    if buf.remaining() < needed {
        return Err(ViciError::protocol(format!(
            "truncated message: need {} bytes, {} left",
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn read_name<B: Buf>(buf: &mut B) -> Result<String, ViciError> {
    ensure_remaining(buf, 1)?;
    let len = buf.get_u8() as usize;
    ensure_remaining(buf, len)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ViciError::protocol("element name is not UTF-8"))
}

fn read_value<B: Buf>(buf: &mut B) -> Result<Vec<u8>, ViciError> {
    ensure_remaining(buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure_remaining(buf, len)?;
    Ok(buf.copy_to_bytes(len).to_vec())
}

fn read_list<B: Buf>(buf: &mut B, name: &str) -> Result<Vec<Vec<u8>>, ViciError> {
    let mut items = Vec::new();
    loop {
        ensure_remaining(buf, 1)?;
        match buf.get_u8() {
            LIST_ITEM => items.push(read_value(buf)?),
            LIST_END => return Ok(items),
            other => {
                return Err(ViciError::protocol(format!(
                    "unexpected element type {} in list '{}'",
                    other, name
                )))
            }
        }
    }
}
