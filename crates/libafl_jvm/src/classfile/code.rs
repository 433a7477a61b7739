//! The `Code` attribute, decoded into a label-based instruction list

use std::collections::{BTreeSet, HashMap};

use crate::{
    Error,
    classfile::{
        AttributeInfo,
        constpool::ConstantPool,
        frame::{Frame, MethodContext, VerificationType, parse_stack_map_table, write_stack_map_table},
        insn::{Insn, Label, decode},
        opcodes::{GOTO, JSR},
        reader::{ByteReader, WriteBytes, u16_len},
    },
};

/// Largest code array the JVM accepts
pub const MAX_CODE_LENGTH: u32 = 65535;

/// An entry of the exception table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// First covered instruction
    pub start: Label,
    /// End of the covered range, exclusive
    pub end: Label,
    /// Handler entry
    pub handler: Label,
    /// Caught class, `0` for any
    pub catch_type: u16,
}

/// An entry of the `LineNumberTable`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumber {
    /// First instruction of the line
    pub start: Label,
    /// Source line
    pub line: u16,
}

/// An entry of the `LocalVariableTable` or `LocalVariableTypeTable`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariable {
    /// Start of the live range
    pub start: Label,
    /// End of the live range, exclusive
    pub end: Label,
    /// Name, as a `Utf8` constant
    pub name_index: u16,
    /// Descriptor or signature, as a `Utf8` constant
    pub descriptor_index: u16,
    /// Local variable slot
    pub index: u16,
}

/// A method body
#[derive(Debug, Clone)]
pub struct Code {
    /// Operand stack depth
    pub max_stack: u16,
    /// Local variable slots
    pub max_locals: u16,
    /// Instructions interleaved with [`Insn::Label`]s
    pub insns: Vec<Insn>,
    /// The exception table, in priority order
    pub handlers: Vec<ExceptionHandler>,
    /// Expanded stack map frames
    pub frames: Vec<Frame>,
    /// Whether the method has to carry a `StackMapTable`
    pub track_frames: bool,
    /// Line numbers
    pub line_numbers: Vec<LineNumber>,
    /// Local variable names
    pub local_variables: Vec<LocalVariable>,
    /// Local variable generic signatures
    pub local_variable_types: Vec<LocalVariable>,
    /// Any other attribute, kept verbatim
    pub attributes: Vec<AttributeInfo>,
    next_label: u32,
}

impl Code {
    /// An empty body
    #[must_use]
    pub fn new(max_stack: u16, max_locals: u16) -> Self {
        Self {
            max_stack,
            max_locals,
            insns: vec![],
            handlers: vec![],
            frames: vec![],
            track_frames: false,
            line_numbers: vec![],
            local_variables: vec![],
            local_variable_types: vec![],
            attributes: vec![],
            next_label: 0,
        }
    }

    /// A label not used anywhere in this method yet
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// The frame declared at `label`, if any
    #[must_use]
    pub fn frame_at(&self, label: Label) -> Option<&Frame> {
        self.frames.iter().find(|f| f.label == label)
    }

    /// Decodes the body of a `Code` attribute.
    ///
    /// Every branch target, handler boundary and frame has to sit on an instruction boundary.
    /// Type annotations are dropped, since their offsets cannot be kept valid.
    pub fn parse(
        pool: &mut ConstantPool,
        info: &[u8],
        ctx: &MethodContext,
    ) -> Result<Self, Error> {
        let mut reader = ByteReader::new(info);
        let max_stack = reader.u16("max_stack")?;
        let max_locals = reader.u16("max_locals")?;
        let code_length = reader.u32("code_length")?;
        if code_length == 0 || code_length > MAX_CODE_LENGTH {
            return Err(Error::structural(format!(
                "invalid code length {code_length}"
            )));
        }
        let decoded = decode(reader.bytes(code_length as usize, "code")?)?;
        let boundaries: BTreeSet<u32> = decoded
            .iter()
            .map(|(pc, _)| *pc)
            .chain([code_length])
            .collect();
        let check = |offset: u32, what: &str| {
            if boundaries.contains(&offset) {
                Ok(Label(offset))
            } else {
                Err(Error::structural(format!(
                    "{what} at offset {offset} is not an instruction boundary"
                )))
            }
        };

        let mut labels = BTreeSet::new();
        for (_, insn) in &decoded {
            for target in insn.targets() {
                check(target.0, "branch target")?;
                labels.insert(target.0);
            }
        }

        let handler_count = reader.u16("exception_table_length")?;
        let mut handlers = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            let handler = ExceptionHandler {
                start: check(u32::from(reader.u16("start_pc")?), "handler start")?,
                end: check(u32::from(reader.u16("end_pc")?), "handler end")?,
                handler: check(u32::from(reader.u16("handler_pc")?), "handler entry")?,
                catch_type: reader.u16("catch_type")?,
            };
            if handler.start >= handler.end || handler.handler.0 == code_length {
                return Err(Error::structural(format!(
                    "malformed exception handler {handler:?}"
                )));
            }
            labels.extend([handler.start.0, handler.end.0, handler.handler.0]);
            handlers.push(handler);
        }

        let mut code = Self::new(max_stack, max_locals);
        code.handlers = handlers;
        code.track_frames = ctx.major_version >= 51;

        let attribute_count = reader.u16("attributes_count")?;
        for _ in 0..attribute_count {
            let attribute = AttributeInfo::parse(&mut reader)?;
            let name = pool.utf8(attribute.name_index)?.into_owned();
            match name.as_str() {
                "StackMapTable" => {
                    let initial = ctx.initial_locals(pool)?;
                    code.frames = parse_stack_map_table(&attribute.info, initial)?;
                    code.track_frames = true;
                    for frame in &code.frames {
                        if frame.label.0 == code_length {
                            return Err(Error::structural("stack map frame past the code end"));
                        }
                        check(frame.label.0, "stack map frame")?;
                        labels.insert(frame.label.0);
                        for ty in frame.locals.iter().chain(&frame.stack) {
                            if let VerificationType::Uninitialized(l) = ty {
                                check(l.0, "uninitialized type")?;
                                labels.insert(l.0);
                            }
                        }
                    }
                }
                "LineNumberTable" => {
                    let mut table = ByteReader::new(&attribute.info);
                    for _ in 0..table.u16("line_number_table_length")? {
                        let start = u32::from(table.u16("line start_pc")?);
                        let line = table.u16("line_number")?;
                        if boundaries.contains(&start) && start != code_length {
                            labels.insert(start);
                            code.line_numbers.push(LineNumber {
                                start: Label(start),
                                line,
                            });
                        } else {
                            log::warn!("dropping line number {line} at offset {start}");
                        }
                    }
                    table.finish("LineNumberTable")?;
                }
                "LocalVariableTable" | "LocalVariableTypeTable" => {
                    let mut table = ByteReader::new(&attribute.info);
                    let mut entries = vec![];
                    for _ in 0..table.u16("local_variable_table_length")? {
                        let start = u32::from(table.u16("local start_pc")?);
                        let end = start + u32::from(table.u16("local length")?);
                        let name_index = table.u16("local name_index")?;
                        let descriptor_index = table.u16("local descriptor_index")?;
                        let index = table.u16("local index")?;
                        if boundaries.contains(&start) && boundaries.contains(&end) {
                            labels.extend([start, end]);
                            entries.push(LocalVariable {
                                start: Label(start),
                                end: Label(end),
                                name_index,
                                descriptor_index,
                                index,
                            });
                        } else {
                            log::warn!("dropping local variable {index} at {start}..{end}");
                        }
                    }
                    table.finish(&name)?;
                    if name == "LocalVariableTable" {
                        code.local_variables = entries;
                    } else {
                        code.local_variable_types = entries;
                    }
                }
                "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                    log::warn!("dropping {name} of code attribute");
                }
                _ => code.attributes.push(attribute),
            }
        }
        reader.finish("Code")?;

        code.insns.reserve(decoded.len() + labels.len());
        for (pc, insn) in decoded {
            if labels.contains(&pc) {
                code.insns.push(Insn::Label(Label(pc)));
            }
            code.insns.push(insn);
        }
        if labels.contains(&code_length) {
            code.insns.push(Insn::Label(Label(code_length)));
        }
        code.next_label = code_length + 1;
        Ok(code)
    }

    /// Assigns offsets, widening `goto`/`jsr` that do not reach with 16 bits.
    ///
    /// Returns the per-instruction offsets and wide flags, the label offsets and the code length.
    fn layout(&self) -> Result<(Vec<u32>, Vec<bool>, HashMap<Label, u32>, u32), Error> {
        let mut wide = vec![false; self.insns.len()];
        loop {
            let mut offsets = Vec::with_capacity(self.insns.len());
            let mut labels = HashMap::new();
            let mut pc: u32 = 0;
            for (insn, wide) in self.insns.iter().zip(&wide) {
                if let Insn::Label(label) = insn {
                    if labels.insert(*label, pc).is_some() {
                        return Err(Error::illegal_state(format!("{label:?} placed twice")));
                    }
                }
                offsets.push(pc);
                pc += insn.size(pc, *wide);
            }
            if pc > MAX_CODE_LENGTH {
                return Err(Error::capacity(format!(
                    "code length {pc} exceeds {MAX_CODE_LENGTH}"
                )));
            }

            let mut widened = false;
            for (i, insn) in self.insns.iter().enumerate() {
                let Insn::Jump { opcode, target } = insn else {
                    continue;
                };
                if wide[i] {
                    continue;
                }
                let to = *labels.get(target).ok_or_else(|| {
                    Error::illegal_state(format!("branch to unplaced {target:?}"))
                })?;
                let delta = i64::from(to) - i64::from(offsets[i]);
                if i16::try_from(delta).is_ok() {
                    continue;
                }
                if *opcode == GOTO || *opcode == JSR {
                    wide[i] = true;
                    widened = true;
                } else {
                    return Err(Error::capacity(format!(
                        "conditional branch offset {delta} does not fit 16 bits"
                    )));
                }
            }
            if !widened {
                return Ok((offsets, wide, labels, pc));
            }
        }
    }

    /// Encodes this body as `Code` attribute contents
    pub fn encode(&self, pool: &mut ConstantPool) -> Result<Vec<u8>, Error> {
        let (offsets, wide, labels, code_length) = self.layout()?;
        let resolve = |label: &Label| -> Result<u16, Error> {
            labels
                .get(label)
                .map(|offset| *offset as u16)
                .ok_or_else(|| Error::illegal_state(format!("unplaced {label:?}")))
        };

        let mut out = Vec::with_capacity(code_length as usize + 64);
        out.put_u16(self.max_stack);
        out.put_u16(self.max_locals);
        out.put_u32(code_length);
        let start = out.len();
        for ((insn, pc), wide) in self.insns.iter().zip(&offsets).zip(&wide) {
            insn.write(&mut out, *pc, &labels, *wide)?;
        }
        debug_assert_eq!(out.len() - start, code_length as usize);

        out.put_u16(u16_len(self.handlers.len(), "exception table")?);
        for handler in &self.handlers {
            out.put_u16(resolve(&handler.start)?);
            out.put_u16(resolve(&handler.end)?);
            out.put_u16(resolve(&handler.handler)?);
            out.put_u16(handler.catch_type);
        }

        let mut attributes = vec![];
        if self.track_frames && !self.frames.is_empty() {
            attributes.push(AttributeInfo {
                name_index: pool.add_utf8("StackMapTable")?,
                info: write_stack_map_table(&self.frames, &labels)?,
            });
        }
        if !self.line_numbers.is_empty() {
            let mut info = vec![];
            info.put_u16(u16_len(self.line_numbers.len(), "line numbers")?);
            for entry in &self.line_numbers {
                info.put_u16(resolve(&entry.start)?);
                info.put_u16(entry.line);
            }
            attributes.push(AttributeInfo {
                name_index: pool.add_utf8("LineNumberTable")?,
                info,
            });
        }
        for (name, table) in [
            ("LocalVariableTable", &self.local_variables),
            ("LocalVariableTypeTable", &self.local_variable_types),
        ] {
            if table.is_empty() {
                continue;
            }
            let mut info = vec![];
            info.put_u16(u16_len(table.len(), name)?);
            for entry in table {
                let start = resolve(&entry.start)?;
                info.put_u16(start);
                info.put_u16(resolve(&entry.end)? - start);
                info.put_u16(entry.name_index);
                info.put_u16(entry.descriptor_index);
                info.put_u16(entry.index);
            }
            attributes.push(AttributeInfo {
                name_index: pool.add_utf8(name)?,
                info,
            });
        }
        attributes.extend(self.attributes.iter().cloned());

        out.put_u16(u16_len(attributes.len(), "code attributes")?);
        for attribute in &attributes {
            attribute.write(&mut out)?;
        }
        Ok(out)
    }
}
