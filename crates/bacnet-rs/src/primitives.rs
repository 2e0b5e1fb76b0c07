// crates/bacnet-rs/src/primitives.rs
//! Minimal primitive value codec for the services the engine speaks.
//!
//! Tag octet layout (ASHRAE 135, Clause 20.2.1.3):
//! bits 7-4 tag number, bit 3 class (0 = application, 1 = context),
//! bits 2-0 length/value/type. Tag number 15 and length 5 escape to
//! extension octets; lengths 6 and 7 mark opening and closing tags.

use crate::error::BacnetError;
use crate::pdu::Pdu;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// Application tag numbers (ASHRAE 135, Clause 20.2.1.4).
pub mod application_tag {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const UNSIGNED_INT: u8 = 2;
    pub const SIGNED_INT: u8 = 3;
    pub const REAL: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const OCTET_STRING: u8 = 6;
    pub const CHARACTER_STRING: u8 = 7;
    pub const BIT_STRING: u8 = 8;
    pub const ENUMERATED: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const OBJECT_ID: u8 = 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Application,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagContent {
    /// Length of the content octets, or the value itself for application
    /// booleans.
    Value(u32),
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub class: TagClass,
    pub number: u8,
    pub content: TagContent,
}

impl Tag {
    /// Content length in octets; opening and closing tags carry none.
    pub fn length(&self) -> usize {
        match self.content {
            TagContent::Value(len) => len as usize,
            _ => 0,
        }
    }
}

/// A BACnetObjectIdentifier: ten bits of type, twenty-two of instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectId {
    pub object_type: u16,
    pub instance: u32,
}

impl ObjectId {
    pub const MAX_INSTANCE: u32 = 0x3F_FFFF;

    pub fn new(object_type: u16, instance: u32) -> Self {
        ObjectId {
            object_type,
            instance,
        }
    }

    pub fn to_wire(self) -> u32 {
        ((self.object_type as u32) << 22) | (self.instance & Self::MAX_INSTANCE)
    }

    pub fn from_wire(value: u32) -> Self {
        ObjectId {
            object_type: (value >> 22) as u16,
            instance: value & Self::MAX_INSTANCE,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

/// Object types used by the engine.
pub mod object_type {
    pub const ANALOG_INPUT: u16 = 0;
    pub const ANALOG_OUTPUT: u16 = 1;
    pub const ANALOG_VALUE: u16 = 2;
    pub const BINARY_INPUT: u16 = 3;
    pub const BINARY_VALUE: u16 = 5;
    pub const DEVICE: u16 = 8;
    pub const OCTETSTRING_VALUE: u16 = 47;
}

fn write_tag(pdu: &mut Pdu, class: TagClass, number: u8, lvt: u8, length: Option<u32>) {
    let mut octet0 = lvt;
    if class == TagClass::Context {
        octet0 |= 0x08;
    }
    if number <= 14 {
        octet0 |= number << 4;
        pdu.put(octet0);
    } else {
        pdu.put(octet0 | 0xF0);
        pdu.put(number);
    }
    if let Some(len) = length {
        if len <= 253 {
            pdu.put(len as u8);
        } else if len <= u16::MAX as u32 {
            pdu.put(254);
            pdu.put_short(len as u16);
        } else {
            pdu.put(255);
            pdu.put_long(len);
        }
    }
}

/// Write a tag whose content is `length` octets long.
pub fn encode_tag(pdu: &mut Pdu, class: TagClass, number: u8, length: u32) {
    if length <= 4 {
        write_tag(pdu, class, number, length as u8, None);
    } else {
        write_tag(pdu, class, number, 5, Some(length));
    }
}

pub fn encode_opening_tag(pdu: &mut Pdu, number: u8) {
    write_tag(pdu, TagClass::Context, number, 6, None);
}

pub fn encode_closing_tag(pdu: &mut Pdu, number: u8) {
    write_tag(pdu, TagClass::Context, number, 7, None);
}

/// Read the next tag header.
pub fn decode_tag(pdu: &mut Pdu) -> Result<Tag, BacnetError> {
    let octet0 = pdu.get()?;
    let class = if octet0 & 0x08 != 0 {
        TagClass::Context
    } else {
        TagClass::Application
    };
    let number = if octet0 & 0xF0 == 0xF0 {
        pdu.get()?
    } else {
        octet0 >> 4
    };
    let content = match octet0 & 0x07 {
        6 => TagContent::Opening,
        7 => TagContent::Closing,
        5 => {
            let first = pdu.get()?;
            let len = match first {
                254 => pdu.get_short()? as u32,
                255 => pdu.get_long()?,
                direct => direct as u32,
            };
            TagContent::Value(len)
        }
        direct => TagContent::Value(direct as u32),
    };
    Ok(Tag {
        class,
        number,
        content,
    })
}

/// Look at the next tag without consuming it.
pub fn peek_tag(pdu: &Pdu) -> Option<Tag> {
    let mut probe = pdu.clone();
    decode_tag(&mut probe).ok()
}

/// True when the next tag is the context tag `number` (any shape).
pub fn next_is_context(pdu: &Pdu, number: u8) -> bool {
    matches!(
        peek_tag(pdu),
        Some(Tag {
            class: TagClass::Context,
            number: n,
            ..
        }) if n == number
    )
}

/// True when the next tag opens the constructed context `number`.
pub fn next_is_opening(pdu: &Pdu, number: u8) -> bool {
    matches!(
        peek_tag(pdu),
        Some(Tag {
            class: TagClass::Context,
            number: n,
            content: TagContent::Opening,
        }) if n == number
    )
}

/// True when the next tag closes the constructed context `number`.
pub fn next_is_closing(pdu: &Pdu, number: u8) -> bool {
    matches!(
        peek_tag(pdu),
        Some(Tag {
            class: TagClass::Context,
            number: n,
            content: TagContent::Closing,
        }) if n == number
    )
}

pub fn expect_opening_tag(pdu: &mut Pdu, number: u8) -> Result<(), BacnetError> {
    let tag = decode_tag(pdu)?;
    if tag.class == TagClass::Context && tag.number == number && tag.content == TagContent::Opening
    {
        Ok(())
    } else {
        Err(BacnetError::InvalidTag)
    }
}

pub fn expect_closing_tag(pdu: &mut Pdu, number: u8) -> Result<(), BacnetError> {
    let tag = decode_tag(pdu)?;
    if tag.class == TagClass::Context && tag.number == number && tag.content == TagContent::Closing
    {
        Ok(())
    } else {
        Err(BacnetError::InvalidTag)
    }
}

fn unsigned_content(value: u32) -> Vec<u8> {
    let octets = value.to_be_bytes();
    let skip = match value {
        0..=0xFF => 3,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 1,
        _ => 0,
    };
    octets[skip..].to_vec()
}

fn unsigned_from_content(content: &[u8]) -> Result<u32, BacnetError> {
    if content.is_empty() || content.len() > 4 {
        return Err(BacnetError::InvalidTag);
    }
    let mut value: u32 = 0;
    for octet in content {
        value = (value << 8) | *octet as u32;
    }
    Ok(value)
}

fn expect_value_tag(pdu: &mut Pdu, class: TagClass, number: u8) -> Result<usize, BacnetError> {
    let tag = decode_tag(pdu)?;
    if tag.class != class || tag.number != number {
        return Err(BacnetError::InvalidTag);
    }
    match tag.content {
        TagContent::Value(len) => Ok(len as usize),
        _ => Err(BacnetError::InvalidTag),
    }
}

pub fn encode_application_null(pdu: &mut Pdu) {
    encode_tag(pdu, TagClass::Application, application_tag::NULL, 0);
}

pub fn encode_application_boolean(pdu: &mut Pdu, value: bool) {
    // Application booleans carry the value in the L/V/T field itself.
    write_tag(
        pdu,
        TagClass::Application,
        application_tag::BOOLEAN,
        value as u8,
        None,
    );
}

pub fn encode_application_unsigned(pdu: &mut Pdu, value: u32) {
    let content = unsigned_content(value);
    encode_tag(
        pdu,
        TagClass::Application,
        application_tag::UNSIGNED_INT,
        content.len() as u32,
    );
    pdu.put_data(&content);
}

pub fn decode_application_unsigned(pdu: &mut Pdu) -> Result<u32, BacnetError> {
    let len = expect_value_tag(pdu, TagClass::Application, application_tag::UNSIGNED_INT)?;
    unsigned_from_content(&pdu.get_data(len)?)
}

pub fn encode_application_enumerated(pdu: &mut Pdu, value: u32) {
    let content = unsigned_content(value);
    encode_tag(
        pdu,
        TagClass::Application,
        application_tag::ENUMERATED,
        content.len() as u32,
    );
    pdu.put_data(&content);
}

pub fn decode_application_enumerated(pdu: &mut Pdu) -> Result<u32, BacnetError> {
    let len = expect_value_tag(pdu, TagClass::Application, application_tag::ENUMERATED)?;
    unsigned_from_content(&pdu.get_data(len)?)
}

pub fn encode_application_real(pdu: &mut Pdu, value: f32) {
    encode_tag(pdu, TagClass::Application, application_tag::REAL, 4);
    pdu.put_data(&value.to_be_bytes());
}

pub fn decode_application_real(pdu: &mut Pdu) -> Result<f32, BacnetError> {
    let len = expect_value_tag(pdu, TagClass::Application, application_tag::REAL)?;
    if len != 4 {
        return Err(BacnetError::InvalidTag);
    }
    let content = pdu.get_data(4)?;
    Ok(f32::from_be_bytes([
        content[0], content[1], content[2], content[3],
    ]))
}

pub fn encode_application_octet_string(pdu: &mut Pdu, value: &[u8]) {
    encode_tag(
        pdu,
        TagClass::Application,
        application_tag::OCTET_STRING,
        value.len() as u32,
    );
    pdu.put_data(value);
}

pub fn decode_application_octet_string(pdu: &mut Pdu) -> Result<Vec<u8>, BacnetError> {
    let len = expect_value_tag(pdu, TagClass::Application, application_tag::OCTET_STRING)?;
    pdu.get_data(len)
}

pub fn encode_application_character_string(pdu: &mut Pdu, value: &str) {
    // One leading octet selects the character set; 0 is UTF-8.
    encode_tag(
        pdu,
        TagClass::Application,
        application_tag::CHARACTER_STRING,
        value.len() as u32 + 1,
    );
    pdu.put(0);
    pdu.put_data(value.as_bytes());
}

pub fn decode_application_character_string(pdu: &mut Pdu) -> Result<String, BacnetError> {
    let len = expect_value_tag(
        pdu,
        TagClass::Application,
        application_tag::CHARACTER_STRING,
    )?;
    if len == 0 {
        return Err(BacnetError::InvalidTag);
    }
    let content = pdu.get_data(len)?;
    if content[0] != 0 {
        // only UTF-8 is supported
        return Err(BacnetError::InvalidTag);
    }
    String::from_utf8(content[1..].to_vec()).map_err(|_| BacnetError::InvalidTag)
}

pub fn encode_application_object_id(pdu: &mut Pdu, value: ObjectId) {
    encode_tag(pdu, TagClass::Application, application_tag::OBJECT_ID, 4);
    pdu.put_long(value.to_wire());
}

pub fn decode_application_object_id(pdu: &mut Pdu) -> Result<ObjectId, BacnetError> {
    let len = expect_value_tag(pdu, TagClass::Application, application_tag::OBJECT_ID)?;
    if len != 4 {
        return Err(BacnetError::InvalidTag);
    }
    Ok(ObjectId::from_wire(pdu.get_long()?))
}

pub fn encode_context_unsigned(pdu: &mut Pdu, number: u8, value: u32) {
    let content = unsigned_content(value);
    encode_tag(pdu, TagClass::Context, number, content.len() as u32);
    pdu.put_data(&content);
}

pub fn decode_context_unsigned(pdu: &mut Pdu, number: u8) -> Result<u32, BacnetError> {
    let len = expect_value_tag(pdu, TagClass::Context, number)?;
    unsigned_from_content(&pdu.get_data(len)?)
}

pub fn encode_context_enumerated(pdu: &mut Pdu, number: u8, value: u32) {
    encode_context_unsigned(pdu, number, value);
}

pub fn decode_context_enumerated(pdu: &mut Pdu, number: u8) -> Result<u32, BacnetError> {
    decode_context_unsigned(pdu, number)
}

pub fn encode_context_object_id(pdu: &mut Pdu, number: u8, value: ObjectId) {
    encode_tag(pdu, TagClass::Context, number, 4);
    pdu.put_long(value.to_wire());
}

pub fn decode_context_object_id(pdu: &mut Pdu, number: u8) -> Result<ObjectId, BacnetError> {
    let len = expect_value_tag(pdu, TagClass::Context, number)?;
    if len != 4 {
        return Err(BacnetError::InvalidTag);
    }
    Ok(ObjectId::from_wire(pdu.get_long()?))
}

pub fn encode_context_character_string(pdu: &mut Pdu, number: u8, value: &str) {
    encode_tag(pdu, TagClass::Context, number, value.len() as u32 + 1);
    pdu.put(0);
    pdu.put_data(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    #[test]
    fn test_unsigned_roundtrip_all_widths() {
        for value in [0u32, 1, 255, 256, 65535, 65536, 0xFF_FFFF, 0x0100_0000] {
            let mut pdu = Pdu::new();
            encode_application_unsigned(&mut pdu, value);
            assert_eq!(decode_application_unsigned(&mut pdu).unwrap(), value);
            assert!(pdu.is_empty());
        }
    }

    #[test]
    fn test_unsigned_wire_form() {
        let mut pdu = Pdu::new();
        encode_application_unsigned(&mut pdu, 1024);
        // tag 2, length 2, then 0x0400
        assert_eq!(pdu.octets(), &[0x22, 0x04, 0x00]);
    }

    #[test]
    fn test_object_id_roundtrip() {
        let id = ObjectId::new(object_type::ANALOG_INPUT, 1);
        let mut pdu = Pdu::new();
        encode_application_object_id(&mut pdu, id);
        assert_eq!(pdu.octets(), &[0xC4, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(decode_application_object_id(&mut pdu).unwrap(), id);

        let device = ObjectId::new(object_type::DEVICE, 0x3F_FFFF);
        assert_eq!(ObjectId::from_wire(device.to_wire()), device);
    }

    #[test]
    fn test_context_tags_roundtrip() {
        let mut pdu = Pdu::new();
        encode_context_unsigned(&mut pdu, 0, 300);
        encode_context_object_id(&mut pdu, 1, ObjectId::new(object_type::DEVICE, 7));
        assert!(next_is_context(&pdu, 0));
        assert_eq!(decode_context_unsigned(&mut pdu, 0).unwrap(), 300);
        assert_eq!(
            decode_context_object_id(&mut pdu, 1).unwrap(),
            ObjectId::new(object_type::DEVICE, 7)
        );
    }

    #[test]
    fn test_wrong_context_number_is_invalid_tag() {
        let mut pdu = Pdu::new();
        encode_context_unsigned(&mut pdu, 0, 5);
        assert_eq!(
            decode_context_unsigned(&mut pdu, 1),
            Err(BacnetError::InvalidTag)
        );
    }

    #[test]
    fn test_opening_closing_tags() {
        let mut pdu = Pdu::new();
        encode_opening_tag(&mut pdu, 3);
        encode_application_real(&mut pdu, 72.5);
        encode_closing_tag(&mut pdu, 3);

        assert!(next_is_opening(&pdu, 3));
        expect_opening_tag(&mut pdu, 3).unwrap();
        assert_eq!(decode_application_real(&mut pdu).unwrap(), 72.5);
        assert!(next_is_closing(&pdu, 3));
        expect_closing_tag(&mut pdu, 3).unwrap();
        assert!(pdu.is_empty());
    }

    #[test]
    fn test_character_string_roundtrip() {
        let mut pdu = Pdu::new();
        encode_application_character_string(&mut pdu, "device-900");
        assert_eq!(
            decode_application_character_string(&mut pdu).unwrap(),
            "device-900".to_string()
        );
    }

    #[test]
    fn test_long_octet_string_uses_extended_length() {
        let value = vec![0x5A; 600];
        let mut pdu = Pdu::new();
        encode_application_octet_string(&mut pdu, &value);
        // tag 6, extended length escape, 254 marker, u16 length
        assert_eq!(pdu.octets()[0], 0x65);
        assert_eq!(pdu.octets()[1], 254);
        assert_eq!(decode_application_octet_string(&mut pdu).unwrap(), value);
    }

    #[test]
    fn test_boolean_value_lives_in_the_tag() {
        let mut pdu = Pdu::new();
        encode_application_boolean(&mut pdu, true);
        assert_eq!(pdu.octets(), &[0x11]);
        let tag = decode_tag(&mut pdu).unwrap();
        assert_eq!(tag.content, TagContent::Value(1));
    }
}
