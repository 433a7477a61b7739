//! The constant pool, as defined in JVMS 4.4

use std::borrow::Cow;

use crate::{
    Error,
    classfile::reader::{ByteReader, WriteBytes},
};

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

/// A single constant pool entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    /// Modified UTF-8 bytes, kept verbatim
    Utf8(Vec<u8>),
    /// `CONSTANT_Integer`
    Integer(i32),
    /// `CONSTANT_Float`, as raw bits
    Float(u32),
    /// `CONSTANT_Long`
    Long(i64),
    /// `CONSTANT_Double`, as raw bits
    Double(u64),
    /// `CONSTANT_Class`
    Class {
        /// Index of the internal name
        name_index: u16,
    },
    /// `CONSTANT_String`
    String {
        /// Index of the string contents
        string_index: u16,
    },
    /// `CONSTANT_Fieldref`
    Fieldref {
        /// Index of the owning class
        class_index: u16,
        /// Index of the name and type
        name_and_type_index: u16,
    },
    /// `CONSTANT_Methodref`
    Methodref {
        /// Index of the owning class
        class_index: u16,
        /// Index of the name and type
        name_and_type_index: u16,
    },
    /// `CONSTANT_InterfaceMethodref`
    InterfaceMethodref {
        /// Index of the owning interface
        class_index: u16,
        /// Index of the name and type
        name_and_type_index: u16,
    },
    /// `CONSTANT_NameAndType`
    NameAndType {
        /// Index of the member name
        name_index: u16,
        /// Index of the member descriptor
        descriptor_index: u16,
    },
    /// `CONSTANT_MethodHandle`
    MethodHandle {
        /// The handle kind (1..=9)
        reference_kind: u8,
        /// Index of the referenced member
        reference_index: u16,
    },
    /// `CONSTANT_MethodType`
    MethodType {
        /// Index of the method descriptor
        descriptor_index: u16,
    },
    /// `CONSTANT_Dynamic`
    Dynamic {
        /// Index into the `BootstrapMethods` attribute
        bootstrap_method_attr_index: u16,
        /// Index of the name and type
        name_and_type_index: u16,
    },
    /// `CONSTANT_InvokeDynamic`
    InvokeDynamic {
        /// Index into the `BootstrapMethods` attribute
        bootstrap_method_attr_index: u16,
        /// Index of the name and type
        name_and_type_index: u16,
    },
    /// `CONSTANT_Module`
    Module {
        /// Index of the module name
        name_index: u16,
    },
    /// `CONSTANT_Package`
    Package {
        /// Index of the package name
        name_index: u16,
    },
    /// Slot zero, and the second slot taken by every `Long` and `Double`
    Unusable,
}

/// A field or method reference, resolved to strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef<'a> {
    /// Internal name of the owning class
    pub owner: Cow<'a, str>,
    /// Member name
    pub name: Cow<'a, str>,
    /// Member descriptor
    pub descriptor: Cow<'a, str>,
}

/// The constant pool of a class. Indices are 1-based, like in the class file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    /// An empty pool
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    /// Parses `constant_pool_count` and the following entries
    pub fn parse(reader: &mut ByteReader) -> Result<Self, Error> {
        let count = reader.u16("constant_pool_count")?;
        if count == 0 {
            return Err(Error::structural("constant_pool_count must be at least 1"));
        }
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);
        while entries.len() < count as usize {
            let index = entries.len();
            let tag = reader.u8("constant tag")?;
            let constant = match tag {
                TAG_UTF8 => {
                    let len = reader.u16("utf8 length")?;
                    Constant::Utf8(reader.bytes(len as usize, "utf8 bytes")?.to_vec())
                }
                TAG_INTEGER => Constant::Integer(reader.i32("integer constant")?),
                TAG_FLOAT => Constant::Float(reader.u32("float constant")?),
                TAG_LONG => Constant::Long(reader.u64("long constant")? as i64),
                TAG_DOUBLE => Constant::Double(reader.u64("double constant")?),
                TAG_CLASS => Constant::Class {
                    name_index: reader.u16("class name")?,
                },
                TAG_STRING => Constant::String {
                    string_index: reader.u16("string")?,
                },
                TAG_FIELDREF | TAG_METHODREF | TAG_INTERFACE_METHODREF => {
                    let class_index = reader.u16("member class")?;
                    let name_and_type_index = reader.u16("member name and type")?;
                    match tag {
                        TAG_FIELDREF => Constant::Fieldref {
                            class_index,
                            name_and_type_index,
                        },
                        TAG_METHODREF => Constant::Methodref {
                            class_index,
                            name_and_type_index,
                        },
                        _ => Constant::InterfaceMethodref {
                            class_index,
                            name_and_type_index,
                        },
                    }
                }
                TAG_NAME_AND_TYPE => Constant::NameAndType {
                    name_index: reader.u16("name")?,
                    descriptor_index: reader.u16("descriptor")?,
                },
                TAG_METHOD_HANDLE => Constant::MethodHandle {
                    reference_kind: reader.u8("reference kind")?,
                    reference_index: reader.u16("reference")?,
                },
                TAG_METHOD_TYPE => Constant::MethodType {
                    descriptor_index: reader.u16("method type")?,
                },
                TAG_DYNAMIC | TAG_INVOKE_DYNAMIC => {
                    let bootstrap_method_attr_index = reader.u16("bootstrap method")?;
                    let name_and_type_index = reader.u16("dynamic name and type")?;
                    if tag == TAG_DYNAMIC {
                        Constant::Dynamic {
                            bootstrap_method_attr_index,
                            name_and_type_index,
                        }
                    } else {
                        Constant::InvokeDynamic {
                            bootstrap_method_attr_index,
                            name_and_type_index,
                        }
                    }
                }
                TAG_MODULE => Constant::Module {
                    name_index: reader.u16("module name")?,
                },
                TAG_PACKAGE => Constant::Package {
                    name_index: reader.u16("package name")?,
                },
                _ => {
                    return Err(Error::structural(format!(
                        "unknown constant pool tag {tag} at index {index}"
                    )));
                }
            };
            let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
            entries.push(constant);
            if wide {
                if entries.len() >= count as usize {
                    return Err(Error::structural(format!(
                        "8-byte constant at index {index} overruns the constant pool"
                    )));
                }
                entries.push(Constant::Unusable);
            }
        }
        Ok(Self { entries })
    }

    /// Appends `constant_pool_count` and all entries
    pub fn write(&self, out: &mut Vec<u8>) {
        // `push` keeps the count below 65536
        out.put_u16(self.entries.len() as u16);
        for constant in &self.entries {
            match constant {
                Constant::Unusable => {}
                Constant::Utf8(bytes) => {
                    out.put_u8(TAG_UTF8);
                    out.put_u16(bytes.len() as u16);
                    out.extend_from_slice(bytes);
                }
                Constant::Integer(v) => {
                    out.put_u8(TAG_INTEGER);
                    out.put_i32(*v);
                }
                Constant::Float(bits) => {
                    out.put_u8(TAG_FLOAT);
                    out.put_u32(*bits);
                }
                Constant::Long(v) => {
                    out.put_u8(TAG_LONG);
                    out.put_u64(*v as u64);
                }
                Constant::Double(bits) => {
                    out.put_u8(TAG_DOUBLE);
                    out.put_u64(*bits);
                }
                Constant::Class { name_index } => {
                    out.put_u8(TAG_CLASS);
                    out.put_u16(*name_index);
                }
                Constant::String { string_index } => {
                    out.put_u8(TAG_STRING);
                    out.put_u16(*string_index);
                }
                Constant::Fieldref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.put_u8(TAG_FIELDREF);
                    out.put_u16(*class_index);
                    out.put_u16(*name_and_type_index);
                }
                Constant::Methodref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.put_u8(TAG_METHODREF);
                    out.put_u16(*class_index);
                    out.put_u16(*name_and_type_index);
                }
                Constant::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.put_u8(TAG_INTERFACE_METHODREF);
                    out.put_u16(*class_index);
                    out.put_u16(*name_and_type_index);
                }
                Constant::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    out.put_u8(TAG_NAME_AND_TYPE);
                    out.put_u16(*name_index);
                    out.put_u16(*descriptor_index);
                }
                Constant::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    out.put_u8(TAG_METHOD_HANDLE);
                    out.put_u8(*reference_kind);
                    out.put_u16(*reference_index);
                }
                Constant::MethodType { descriptor_index } => {
                    out.put_u8(TAG_METHOD_TYPE);
                    out.put_u16(*descriptor_index);
                }
                Constant::Dynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    out.put_u8(TAG_DYNAMIC);
                    out.put_u16(*bootstrap_method_attr_index);
                    out.put_u16(*name_and_type_index);
                }
                Constant::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    out.put_u8(TAG_INVOKE_DYNAMIC);
                    out.put_u16(*bootstrap_method_attr_index);
                    out.put_u16(*name_and_type_index);
                }
                Constant::Module { name_index } => {
                    out.put_u8(TAG_MODULE);
                    out.put_u16(*name_index);
                }
                Constant::Package { name_index } => {
                    out.put_u8(TAG_PACKAGE);
                    out.put_u16(*name_index);
                }
            }
        }
    }

    /// The value of `constant_pool_count`, one more than the highest index
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// The entry at `index`
    pub fn get(&self, index: u16) -> Result<&Constant, Error> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(Error::structural(format!(
                "invalid constant pool index {index}"
            ))),
            Some(constant) => Ok(constant),
        }
    }

    /// The string stored at a `CONSTANT_Utf8` index
    pub fn utf8(&self, index: u16) -> Result<Cow<'_, str>, Error> {
        match self.get(index)? {
            Constant::Utf8(bytes) => decode_modified_utf8(bytes),
            other => Err(Error::structural(format!(
                "constant {index} is not Utf8 but {other:?}"
            ))),
        }
    }

    /// The internal name of the class at a `CONSTANT_Class` index
    pub fn class_name(&self, index: u16) -> Result<Cow<'_, str>, Error> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            other => Err(Error::structural(format!(
                "constant {index} is not a Class but {other:?}"
            ))),
        }
    }

    /// The name and descriptor at a `CONSTANT_NameAndType` index
    pub fn name_and_type(&self, index: u16) -> Result<(Cow<'_, str>, Cow<'_, str>), Error> {
        match self.get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            other => Err(Error::structural(format!(
                "constant {index} is not a NameAndType but {other:?}"
            ))),
        }
    }

    /// Resolves a field, method or interface method reference
    pub fn member_ref(&self, index: u16) -> Result<MemberRef<'_>, Error> {
        match self.get(index)? {
            Constant::Fieldref {
                class_index,
                name_and_type_index,
            }
            | Constant::Methodref {
                class_index,
                name_and_type_index,
            }
            | Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => {
                let owner = self.class_name(*class_index)?;
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok(MemberRef {
                    owner,
                    name,
                    descriptor,
                })
            }
            other => Err(Error::structural(format!(
                "constant {index} is not a member reference but {other:?}"
            ))),
        }
    }

    /// Returns the index of `constant`, appending it if the pool does not hold it yet
    pub fn push(&mut self, constant: Constant) -> Result<u16, Error> {
        if let Some(index) = self.entries.iter().position(|c| *c == constant) {
            return Ok(index as u16);
        }
        let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
        let needed = if wide { 2 } else { 1 };
        if self.entries.len() + needed > u16::MAX as usize {
            return Err(Error::capacity(format!(
                "constant pool is full ({} entries)",
                self.entries.len()
            )));
        }
        let index = self.entries.len() as u16;
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    /// Adds (or finds) a `CONSTANT_Utf8`
    pub fn add_utf8(&mut self, value: &str) -> Result<u16, Error> {
        let bytes = encode_modified_utf8(value);
        if bytes.len() > u16::MAX as usize {
            return Err(Error::capacity(format!(
                "string constant of {} bytes does not fit a Utf8 entry",
                bytes.len()
            )));
        }
        self.push(Constant::Utf8(bytes))
    }

    /// Adds (or finds) a `CONSTANT_Class` for an internal name
    pub fn add_class(&mut self, name: &str) -> Result<u16, Error> {
        let name_index = self.add_utf8(name)?;
        self.push(Constant::Class { name_index })
    }

    /// Adds (or finds) a `CONSTANT_NameAndType`
    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, Error> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.push(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    /// Adds (or finds) a `CONSTANT_Fieldref`
    pub fn add_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, Error> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.push(Constant::Fieldref {
            class_index,
            name_and_type_index,
        })
    }

    /// Adds (or finds) a `CONSTANT_Methodref`
    pub fn add_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, Error> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.push(Constant::Methodref {
            class_index,
            name_and_type_index,
        })
    }

    /// Adds (or finds) a `CONSTANT_InterfaceMethodref`
    pub fn add_interface_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, Error> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.push(Constant::InterfaceMethodref {
            class_index,
            name_and_type_index,
        })
    }

    /// Adds (or finds) a `CONSTANT_Integer`
    pub fn add_integer(&mut self, value: i32) -> Result<u16, Error> {
        self.push(Constant::Integer(value))
    }
}

/// Decodes the JVM's modified UTF-8. Plain UTF-8 is borrowed as-is.
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<Cow<'_, str>, Error> {
    if let Ok(s) = core::str::from_utf8(bytes) {
        return Ok(Cow::Borrowed(s));
    }
    let invalid = || Error::structural(format!("invalid modified utf-8: {bytes:x?}"));
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(u16::from(b));
            i += 1;
        } else if b & 0xe0 == 0xc0 {
            let b2 = *bytes.get(i + 1).ok_or_else(invalid)?;
            units.push((u16::from(b & 0x1f) << 6) | u16::from(b2 & 0x3f));
            i += 2;
        } else if b & 0xf0 == 0xe0 {
            let b2 = *bytes.get(i + 1).ok_or_else(invalid)?;
            let b3 = *bytes.get(i + 2).ok_or_else(invalid)?;
            units.push(
                (u16::from(b & 0x0f) << 12) | (u16::from(b2 & 0x3f) << 6) | u16::from(b3 & 0x3f),
            );
            i += 3;
        } else {
            return Err(invalid());
        }
    }
    String::from_utf16(&units)
        .map(Cow::Owned)
        .map_err(|_| invalid())
}

/// Encodes a string as modified UTF-8: NUL becomes `C0 80` and supplementary
/// characters are written as surrogate pairs.
#[must_use]
pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    if value.bytes().all(|b| b != 0 && b < 0x80) {
        return value.as_bytes().to_vec();
    }
    let mut out = Vec::with_capacity(value.len() + 4);
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}
