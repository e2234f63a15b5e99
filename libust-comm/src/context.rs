// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Context fields: values attached to every event of a channel.

use crate::error::ContextError;
use crate::procname::{self, PROCNAME_LEN};

pub const PROCNAME_FIELD: &str = "procname";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    None,
    Utf8,
    Ascii,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerType {
    pub size_bits: u32,
    pub alignment_bits: u32,
    pub signed: bool,
    pub base: u32,
    pub encoding: StringEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer(IntegerType),
    Array { element: IntegerType, length: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: &'static str,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    Integer(i64),
    Str(String),
}

/// Destination of a serialized event.
pub trait EventWriter {
    fn align(&mut self, alignment: usize);
    fn write(&mut self, bytes: &[u8]);
}

pub trait ContextProvider: Send + Sync {
    fn description(&self) -> &FieldDescription;

    /// Bytes needed to record the field at `offset`, padding included.
    fn size(&self, offset: usize) -> usize;

    fn record(&self, writer: &mut dyn EventWriter);

    /// Value for filters.
    fn value(&self) -> ContextValue;
}

fn align_padding(offset: usize, alignment: usize) -> usize {
    offset.wrapping_neg() & (alignment - 1)
}

/// Name of the process, as 17 bytes NUL-padded.
pub struct ProcnameContext {
    description: FieldDescription,
}

impl Default for ProcnameContext {
    fn default() -> Self {
        ProcnameContext {
            description: FieldDescription {
                name: PROCNAME_FIELD,
                field_type: FieldType::Array {
                    element: IntegerType {
                        size_bits: 8,
                        alignment_bits: 8,
                        signed: true,
                        base: 10,
                        encoding: StringEncoding::Utf8,
                    },
                    length: PROCNAME_LEN,
                },
            },
        }
    }
}

impl ContextProvider for ProcnameContext {
    fn description(&self) -> &FieldDescription {
        &self.description
    }

    fn size(&self, offset: usize) -> usize {
        align_padding(offset, 1) + PROCNAME_LEN
    }

    fn record(&self, writer: &mut dyn EventWriter) {
        let name = procname::get();
        writer.align(1);
        writer.write(&name);
    }

    fn value(&self) -> ContextValue {
        let name = procname::get();
        ContextValue::Str(String::from_utf8_lossy(procname::as_bytes(&name)).into_owned())
    }
}

/// Context fields of a channel, in recording order.
#[derive(Default)]
pub struct ContextFields {
    fields: Vec<Box<dyn ContextProvider>>,
}

impl ContextFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, name: &str) -> Option<&dyn ContextProvider> {
        self.fields
            .iter()
            .find(|field| field.description().name == name)
            .map(|field| field.as_ref())
    }

    pub fn append(&mut self, field: Box<dyn ContextProvider>) -> Result<(), ContextError> {
        let name = field.description().name;
        if self.find(name).is_some() {
            return Err(ContextError::AlreadyExists(name));
        }
        self.fields
            .try_reserve(1)
            .map_err(|_| ContextError::OutOfMemory)?;
        self.fields.push(field);
        Ok(())
    }

    pub fn add_procname(&mut self) -> Result<(), ContextError> {
        self.append(Box::<ProcnameContext>::default())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn ContextProvider> {
        self.fields.iter().map(|field| field.as_ref())
    }

    /// Bytes needed to record every field starting at `offset`.
    pub fn size(&self, mut offset: usize) -> usize {
        let start = offset;
        for field in &self.fields {
            offset += field.size(offset);
        }
        offset - start
    }

    pub fn record(&self, writer: &mut dyn EventWriter) {
        for field in &self.fields {
            field.record(writer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Buffer {
        bytes: Vec<u8>,
    }

    impl EventWriter for Buffer {
        fn align(&mut self, alignment: usize) {
            let padding = align_padding(self.bytes.len(), alignment);
            self.bytes.resize(self.bytes.len() + padding, 0);
        }

        fn write(&mut self, bytes: &[u8]) {
            self.bytes.extend_from_slice(bytes);
        }
    }

    #[test]
    fn test_procname_is_added_once() {
        let mut fields = ContextFields::new();
        fields.add_procname().unwrap();
        assert!(matches!(
            fields.add_procname(),
            Err(ContextError::AlreadyExists(PROCNAME_FIELD))
        ));
        assert_eq!(1, fields.len());
        assert!(fields.find(PROCNAME_FIELD).is_some());
        assert!(fields.find("vpid").is_none());
    }

    #[test]
    fn test_procname_description() {
        let context = ProcnameContext::default();
        let FieldType::Array { element, length } = context.description().field_type else {
            panic!("procname is an array");
        };
        assert_eq!(PROCNAME_LEN, length);
        assert_eq!(8, element.size_bits);
        assert!(element.signed);
        assert_eq!(10, element.base);
        assert_eq!(StringEncoding::Utf8, element.encoding);
    }

    #[test]
    fn test_procname_record_matches_size() {
        let mut fields = ContextFields::new();
        fields.add_procname().unwrap();
        let mut buffer = Buffer::default();
        buffer.write(&[1, 2, 3]);
        assert_eq!(PROCNAME_LEN, fields.size(buffer.bytes.len()));

        fields.record(&mut buffer);
        assert_eq!(3 + PROCNAME_LEN, buffer.bytes.len());
        assert_eq!(procname::get(), buffer.bytes[3..]);

        let ContextValue::Str(value) = fields.iter().next().unwrap().value() else {
            panic!("procname is a string");
        };
        assert_eq!(procname::as_bytes(&procname::get()), value.as_bytes());
    }

    #[test]
    fn test_align_padding() {
        assert_eq!(0, align_padding(8, 8));
        assert_eq!(7, align_padding(9, 8));
        assert_eq!(0, align_padding(13, 1));
    }
}
