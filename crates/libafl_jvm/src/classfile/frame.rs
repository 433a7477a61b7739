//! `StackMapTable` frames (JVMS 4.7.4).
//!
//! Frames are always kept expanded: every [`Frame`] lists all locals and all stack entries,
//! and frames are written back as `full_frame`s. This keeps them independent of each other,
//! so code can be inserted anywhere and frames can be copied to new labels.

use std::collections::HashMap;

use crate::{
    Error,
    classfile::{
        constpool::ConstantPool,
        descriptor::{FieldType, MethodDescriptor},
        insn::Label,
        reader::{ByteReader, WriteBytes, u16_len},
    },
};

const ITEM_TOP: u8 = 0;
const ITEM_INTEGER: u8 = 1;
const ITEM_FLOAT: u8 = 2;
const ITEM_DOUBLE: u8 = 3;
const ITEM_LONG: u8 = 4;
const ITEM_NULL: u8 = 5;
const ITEM_UNINITIALIZED_THIS: u8 = 6;
const ITEM_OBJECT: u8 = 7;
const ITEM_UNINITIALIZED: u8 = 8;

const FULL_FRAME: u8 = 255;

/// A verification type, as listed in a stack map frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationType {
    /// Unusable slot
    Top,
    /// `int`, `short`, `char`, `byte`, `boolean`
    Integer,
    /// `float`
    Float,
    /// `double`, takes two slots
    Double,
    /// `long`, takes two slots
    Long,
    /// `null`
    Null,
    /// `this` in a constructor before the super constructor call
    UninitializedThis,
    /// An instance of the class at this constant pool index
    Object(u16),
    /// The result of the `new` instruction at this label, not yet initialized
    Uninitialized(Label),
}

impl VerificationType {
    /// Number of local variable slots this entry covers
    #[must_use]
    pub fn slots(&self) -> u16 {
        match self {
            Self::Double | Self::Long => 2,
            _ => 1,
        }
    }

    /// The verification type of a parameter of the given field type
    pub fn of_field_type(pool: &mut ConstantPool, ty: &FieldType) -> Result<Self, Error> {
        Ok(match ty {
            FieldType::Byte
            | FieldType::Char
            | FieldType::Int
            | FieldType::Short
            | FieldType::Boolean => Self::Integer,
            FieldType::Float => Self::Float,
            FieldType::Double => Self::Double,
            FieldType::Long => Self::Long,
            FieldType::Object(name) | FieldType::Array(name) => Self::Object(pool.add_class(name)?),
        })
    }

    fn parse(reader: &mut ByteReader) -> Result<Self, Error> {
        let tag = reader.u8("verification type")?;
        Ok(match tag {
            ITEM_TOP => Self::Top,
            ITEM_INTEGER => Self::Integer,
            ITEM_FLOAT => Self::Float,
            ITEM_DOUBLE => Self::Double,
            ITEM_LONG => Self::Long,
            ITEM_NULL => Self::Null,
            ITEM_UNINITIALIZED_THIS => Self::UninitializedThis,
            ITEM_OBJECT => Self::Object(reader.u16("object type")?),
            ITEM_UNINITIALIZED => Self::Uninitialized(Label(u32::from(
                reader.u16("uninitialized offset")?,
            ))),
            _ => {
                return Err(Error::structural(format!(
                    "unknown verification type tag {tag}"
                )));
            }
        })
    }

    fn write(&self, out: &mut Vec<u8>, labels: &HashMap<Label, u32>) -> Result<(), Error> {
        match self {
            Self::Top => out.put_u8(ITEM_TOP),
            Self::Integer => out.put_u8(ITEM_INTEGER),
            Self::Float => out.put_u8(ITEM_FLOAT),
            Self::Double => out.put_u8(ITEM_DOUBLE),
            Self::Long => out.put_u8(ITEM_LONG),
            Self::Null => out.put_u8(ITEM_NULL),
            Self::UninitializedThis => out.put_u8(ITEM_UNINITIALIZED_THIS),
            Self::Object(index) => {
                out.put_u8(ITEM_OBJECT);
                out.put_u16(*index);
            }
            Self::Uninitialized(label) => {
                let offset = labels.get(label).ok_or_else(|| {
                    Error::illegal_state(format!("uninitialized type refers to unplaced {label:?}"))
                })?;
                out.put_u8(ITEM_UNINITIALIZED);
                out.put_u16(*offset as u16);
            }
        }
        Ok(())
    }
}

/// The expanded verification state at a label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Where this frame holds
    pub label: Label,
    /// Locals, one entry per value (`long`/`double` entries cover two slots)
    pub locals: Vec<VerificationType>,
    /// The operand stack, bottom first
    pub stack: Vec<VerificationType>,
}

impl Frame {
    /// Number of local variable slots covered by [`Self::locals`]
    #[must_use]
    pub fn local_slots(&self) -> u32 {
        self.locals.iter().map(|t| u32::from(t.slots())).sum()
    }

    /// Declares `slot` to hold `ty`, padding unused slots in between with [`VerificationType::Top`].
    ///
    /// `slot` has to lie at or past the last slot the frame declares.
    pub fn append_local(&mut self, slot: u16, ty: VerificationType) -> Result<(), Error> {
        let mut used = self.local_slots();
        if used > u32::from(slot) {
            return Err(Error::structural(format!(
                "frame at {:?} declares {used} local slots, more than max_locals = {slot}",
                self.label
            )));
        }
        while used < u32::from(slot) {
            self.locals.push(VerificationType::Top);
            used += 1;
        }
        self.locals.push(ty);
        Ok(())
    }
}

/// Static facts about a method needed to interpret its frames
#[derive(Debug, Clone, Copy)]
pub struct MethodContext<'a> {
    /// Constant pool index of the declaring class
    pub this_class: u16,
    /// Internal name of the declaring class
    pub class_name: &'a str,
    /// Method access flags
    pub access_flags: u16,
    /// Method name
    pub name: &'a str,
    /// Method descriptor
    pub descriptor: &'a str,
    /// Class file major version
    pub major_version: u16,
}

/// `ACC_STATIC`
pub const ACC_STATIC: u16 = 0x0008;

impl MethodContext<'_> {
    /// The locals of the implicit frame at method entry
    pub fn initial_locals(&self, pool: &mut ConstantPool) -> Result<Vec<VerificationType>, Error> {
        let descriptor = MethodDescriptor::parse(self.descriptor)?;
        let mut locals = Vec::with_capacity(descriptor.params.len() + 1);
        if self.access_flags & ACC_STATIC == 0 {
            if self.name == "<init>" && self.class_name != "java/lang/Object" {
                locals.push(VerificationType::UninitializedThis);
            } else {
                locals.push(VerificationType::Object(self.this_class));
            }
        }
        for param in &descriptor.params {
            locals.push(VerificationType::of_field_type(pool, param)?);
        }
        Ok(locals)
    }
}

/// Decodes a `StackMapTable` attribute body into expanded frames.
///
/// Frame labels, and labels of uninitialized types, are `Label(offset)` of the original code.
pub fn parse_stack_map_table(
    info: &[u8],
    initial_locals: Vec<VerificationType>,
) -> Result<Vec<Frame>, Error> {
    let mut reader = ByteReader::new(info);
    let count = reader.u16("number_of_entries")?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut locals = initial_locals;
    let mut offset: Option<u32> = None;

    for _ in 0..count {
        let frame_type = reader.u8("frame_type")?;
        let (delta, stack) = match frame_type {
            0..=63 => (u32::from(frame_type), vec![]),
            64..=127 => (
                u32::from(frame_type - 64),
                vec![VerificationType::parse(&mut reader)?],
            ),
            247 => {
                let delta = u32::from(reader.u16("offset_delta")?);
                (delta, vec![VerificationType::parse(&mut reader)?])
            }
            248..=250 => {
                let delta = u32::from(reader.u16("offset_delta")?);
                let chop = (251 - frame_type) as usize;
                if chop > locals.len() {
                    return Err(Error::structural(format!(
                        "chop frame removes {chop} locals from {}",
                        locals.len()
                    )));
                }
                locals.truncate(locals.len() - chop);
                (delta, vec![])
            }
            251 => (u32::from(reader.u16("offset_delta")?), vec![]),
            252..=254 => {
                let delta = u32::from(reader.u16("offset_delta")?);
                for _ in 0..(frame_type - 251) {
                    locals.push(VerificationType::parse(&mut reader)?);
                }
                (delta, vec![])
            }
            FULL_FRAME => {
                let delta = u32::from(reader.u16("offset_delta")?);
                let n_locals = reader.u16("number_of_locals")?;
                locals = (0..n_locals)
                    .map(|_| VerificationType::parse(&mut reader))
                    .collect::<Result<_, _>>()?;
                let n_stack = reader.u16("number_of_stack_items")?;
                let stack = (0..n_stack)
                    .map(|_| VerificationType::parse(&mut reader))
                    .collect::<Result<_, _>>()?;
                (delta, stack)
            }
            _ => {
                return Err(Error::structural(format!(
                    "reserved stack map frame type {frame_type}"
                )));
            }
        };
        let current = match offset {
            None => delta,
            Some(prev) => prev + delta + 1,
        };
        offset = Some(current);
        frames.push(Frame {
            label: Label(current),
            locals: locals.clone(),
            stack,
        });
    }
    reader.finish("StackMapTable")?;
    Ok(frames)
}

/// Encodes frames as a `StackMapTable` body of `full_frame`s.
///
/// Frames are sorted by their resolved offset; two frames at one offset must be identical.
pub fn write_stack_map_table(
    frames: &[Frame],
    labels: &HashMap<Label, u32>,
) -> Result<Vec<u8>, Error> {
    let mut placed = Vec::with_capacity(frames.len());
    for frame in frames {
        let offset = *labels.get(&frame.label).ok_or_else(|| {
            Error::illegal_state(format!("frame refers to unplaced {:?}", frame.label))
        })?;
        placed.push((offset, frame));
    }
    placed.sort_by_key(|(offset, _)| *offset);
    placed.dedup_by(|(off_b, frame_b), (off_a, frame_a)| {
        *off_a == *off_b && frame_a.locals == frame_b.locals && frame_a.stack == frame_b.stack
    });

    let mut out = vec![];
    out.put_u16(u16_len(placed.len(), "stack map frames")?);
    let mut prev: Option<u32> = None;
    for (offset, frame) in placed {
        let delta = match prev {
            None => offset,
            Some(p) if offset > p => offset - p - 1,
            Some(_) => {
                return Err(Error::illegal_state(format!(
                    "conflicting stack map frames at offset {offset}"
                )));
            }
        };
        prev = Some(offset);
        out.put_u8(FULL_FRAME);
        out.put_u16(delta as u16);
        out.put_u16(u16_len(frame.locals.len(), "frame locals")?);
        for ty in &frame.locals {
            ty.write(&mut out, labels)?;
        }
        out.put_u16(u16_len(frame.stack.len(), "frame stack items")?);
        for ty in &frame.stack {
            ty.write(&mut out, labels)?;
        }
    }
    Ok(out)
}
