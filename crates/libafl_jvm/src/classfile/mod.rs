//! A minimal JVM class file model (JVMS chapter 4).
//!
//! Only method bodies are decoded; everything else is carried through as raw attributes.

use std::borrow::Cow;

use crate::Error;

pub mod code;
pub mod constpool;
pub mod descriptor;
pub mod frame;
pub mod insn;
pub mod opcodes;
pub mod reader;

use code::Code;
use constpool::ConstantPool;
use reader::{ByteReader, WriteBytes, u16_len};

/// `0xCAFEBABE`
pub const MAGIC: u32 = 0xCAFE_BABE;

/// An attribute, with its contents left undecoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    /// Name, as a `Utf8` constant
    pub name_index: u16,
    /// The attribute body
    pub info: Vec<u8>,
}

impl AttributeInfo {
    /// Reads name, length and body
    pub fn parse(reader: &mut ByteReader) -> Result<Self, Error> {
        let name_index = reader.u16("attribute_name_index")?;
        let length = reader.u32("attribute_length")?;
        let info = reader.bytes(length as usize, "attribute info")?.to_vec();
        Ok(Self { name_index, info })
    }

    /// Writes name, length and body
    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        out.put_u16(self.name_index);
        out.put_u32(u32::try_from(self.info.len())?);
        out.extend_from_slice(&self.info);
        Ok(())
    }
}

/// The position of the attribute called `name`, if present
pub fn find_attribute(
    attributes: &[AttributeInfo],
    pool: &ConstantPool,
    name: &str,
) -> Result<Option<usize>, Error> {
    for (i, attribute) in attributes.iter().enumerate() {
        if pool.utf8(attribute.name_index)? == name {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// A field or method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Access flags
    pub access_flags: u16,
    /// Name, as a `Utf8` constant
    pub name_index: u16,
    /// Descriptor, as a `Utf8` constant
    pub descriptor_index: u16,
    /// Attributes, `Code` among them for methods with a body
    pub attributes: Vec<AttributeInfo>,
}

impl MemberInfo {
    fn parse(reader: &mut ByteReader) -> Result<Self, Error> {
        let access_flags = reader.u16("access_flags")?;
        let name_index = reader.u16("name_index")?;
        let descriptor_index = reader.u16("descriptor_index")?;
        let count = reader.u16("attributes_count")?;
        let attributes = (0..count)
            .map(|_| AttributeInfo::parse(reader))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        })
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        out.put_u16(self.access_flags);
        out.put_u16(self.name_index);
        out.put_u16(self.descriptor_index);
        write_attributes(out, &self.attributes)
    }
}

fn write_attributes(out: &mut Vec<u8>, attributes: &[AttributeInfo]) -> Result<(), Error> {
    out.put_u16(u16_len(attributes.len(), "attributes")?);
    for attribute in attributes {
        attribute.write(out)?;
    }
    Ok(())
}

/// A parsed class file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFile {
    /// Minor version
    pub minor_version: u16,
    /// Major version, `52` for Java 8
    pub major_version: u16,
    /// The constant pool
    pub pool: ConstantPool,
    /// Class access flags
    pub access_flags: u16,
    /// This class, as a `Class` constant
    pub this_class: u16,
    /// The super class, `0` for `java/lang/Object`
    pub super_class: u16,
    /// Implemented interfaces, as `Class` constants
    pub interfaces: Vec<u16>,
    /// Fields
    pub fields: Vec<MemberInfo>,
    /// Methods
    pub methods: Vec<MemberInfo>,
    /// Class attributes
    pub attributes: Vec<AttributeInfo>,
}

impl ClassFile {
    /// An empty public class
    pub fn new(major_version: u16, name: &str, super_name: &str) -> Result<Self, Error> {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class(name)?;
        let super_class = pool.add_class(super_name)?;
        Ok(Self {
            minor_version: 0,
            major_version,
            pool,
            access_flags: 0x0021,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            attributes: vec![],
        })
    }

    /// Parses a complete class file, rejecting trailing bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.u32("magic")?;
        if magic != MAGIC {
            return Err(Error::structural(format!("bad magic {magic:#x}")));
        }
        let minor_version = reader.u16("minor_version")?;
        let major_version = reader.u16("major_version")?;
        let pool = ConstantPool::parse(&mut reader)?;
        let access_flags = reader.u16("access_flags")?;
        let this_class = reader.u16("this_class")?;
        let super_class = reader.u16("super_class")?;
        let interface_count = reader.u16("interfaces_count")?;
        let interfaces = (0..interface_count)
            .map(|_| reader.u16("interface"))
            .collect::<Result<_, _>>()?;
        let field_count = reader.u16("fields_count")?;
        let fields = (0..field_count)
            .map(|_| MemberInfo::parse(&mut reader))
            .collect::<Result<_, _>>()?;
        let method_count = reader.u16("methods_count")?;
        let methods = (0..method_count)
            .map(|_| MemberInfo::parse(&mut reader))
            .collect::<Result<_, _>>()?;
        let attribute_count = reader.u16("attributes_count")?;
        let attributes = (0..attribute_count)
            .map(|_| AttributeInfo::parse(&mut reader))
            .collect::<Result<_, _>>()?;
        reader.finish("class file")?;

        let class = Self {
            minor_version,
            major_version,
            pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        };
        class.name()?;
        Ok(class)
    }

    /// Serializes the class
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = vec![];
        out.put_u32(MAGIC);
        out.put_u16(self.minor_version);
        out.put_u16(self.major_version);
        self.pool.write(&mut out);
        out.put_u16(self.access_flags);
        out.put_u16(self.this_class);
        out.put_u16(self.super_class);
        out.put_u16(u16_len(self.interfaces.len(), "interfaces")?);
        for interface in &self.interfaces {
            out.put_u16(*interface);
        }
        for members in [&self.fields, &self.methods] {
            out.put_u16(u16_len(members.len(), "class members")?);
            for member in members {
                member.write(&mut out)?;
            }
        }
        write_attributes(&mut out, &self.attributes)?;
        Ok(out)
    }

    /// Internal name of this class
    pub fn name(&self) -> Result<Cow<'_, str>, Error> {
        self.pool.class_name(self.this_class)
    }

    /// Appends a method with the given body
    pub fn add_method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: &Code,
    ) -> Result<(), Error> {
        let name_index = self.pool.add_utf8(name)?;
        let descriptor_index = self.pool.add_utf8(descriptor)?;
        let info = code.encode(&mut self.pool)?;
        let code_name = self.pool.add_utf8("Code")?;
        self.methods.push(MemberInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes: vec![AttributeInfo {
                name_index: code_name,
                info,
            }],
        });
        Ok(())
    }
}
