//! A label-based view of JVM bytecode.
//!
//! Branch offsets are replaced by [`Label`]s so instructions can be inserted freely;
//! offsets are only computed again when the code is encoded.

use std::collections::HashMap;

use crate::{
    Error,
    classfile::{
        opcodes::*,
        reader::{ByteReader, WriteBytes},
    },
};

/// A symbolic position in a method's code.
///
/// Labels of decoded code are named after their original byte offset, new labels are
/// handed out by [`super::Code::new_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// One instruction, or a [`Insn::Label`] pseudo instruction marking a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// Marks the position of the following instruction
    Label(Label),
    /// An instruction without operands
    Op(u8),
    /// `bipush`
    BiPush(i8),
    /// `sipush`
    SiPush(i16),
    /// `ldc` or `ldc_w`, picked by index
    Ldc(u16),
    /// `ldc2_w`
    Ldc2(u16),
    /// `xload`, `xstore` or `ret`, always with the long form opcode
    Var {
        /// One of `ILOAD..=ALOAD`, `ISTORE..=ASTORE`, `RET`
        opcode: u8,
        /// The local variable slot
        var: u16,
    },
    /// `iinc`
    Iinc {
        /// The local variable slot
        var: u16,
        /// The increment
        delta: i16,
    },
    /// A branch; `goto_w` and `jsr_w` are folded into `GOTO` and `JSR`
    Jump {
        /// The branch opcode
        opcode: u8,
        /// Where to jump to
        target: Label,
    },
    /// `tableswitch`
    TableSwitch {
        /// Target for keys outside `low..=low + targets.len() - 1`
        default: Label,
        /// Key of the first target
        low: i32,
        /// One target per key
        targets: Vec<Label>,
    },
    /// `lookupswitch`
    LookupSwitch {
        /// Target for keys not listed
        default: Label,
        /// Sorted `(key, target)` pairs
        pairs: Vec<(i32, Label)>,
    },
    /// `getstatic`, `putstatic`, `getfield`, `putfield`
    Field {
        /// The field opcode
        opcode: u8,
        /// Constant pool index of the field reference
        index: u16,
    },
    /// `invokevirtual`, `invokespecial`, `invokestatic`
    Invoke {
        /// The invoke opcode
        opcode: u8,
        /// Constant pool index of the method reference
        index: u16,
    },
    /// `invokeinterface`
    InvokeInterface {
        /// Constant pool index of the interface method reference
        index: u16,
        /// Argument slots including the receiver
        count: u8,
    },
    /// `invokedynamic`
    InvokeDynamic {
        /// Constant pool index of the `InvokeDynamic` constant
        index: u16,
    },
    /// `new`, `anewarray`, `checkcast`, `instanceof`
    Type {
        /// The opcode
        opcode: u8,
        /// Constant pool index of the class
        index: u16,
    },
    /// `newarray`
    NewArray(u8),
    /// `multianewarray`
    MultiANewArray {
        /// Constant pool index of the array class
        index: u16,
        /// Number of dimensions to create
        dimensions: u8,
    },
}

impl Insn {
    /// Whether execution can continue with the next instruction
    #[must_use]
    pub fn falls_through(&self) -> bool {
        match self {
            Self::Op(op) => !is_exit(*op),
            Self::Jump { opcode, .. } => *opcode != GOTO,
            Self::Var { opcode, .. } => *opcode != RET,
            Self::TableSwitch { .. } | Self::LookupSwitch { .. } => false,
            _ => true,
        }
    }

    /// `*return` or `athrow`
    #[must_use]
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Op(op) if is_exit(*op))
    }

    /// The constant pool index of the invoked method, for method calls
    #[must_use]
    pub fn invoked_method(&self) -> Option<u16> {
        match self {
            Self::Invoke { index, .. } | Self::InvokeInterface { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// All labels this instruction may branch to, in operand order (may repeat)
    #[must_use]
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Self::Jump { target, .. } => vec![*target],
            Self::TableSwitch {
                default, targets, ..
            } => {
                let mut all = Vec::with_capacity(targets.len() + 1);
                all.push(*default);
                all.extend_from_slice(targets);
                all
            }
            Self::LookupSwitch { default, pairs } => {
                let mut all = Vec::with_capacity(pairs.len() + 1);
                all.push(*default);
                all.extend(pairs.iter().map(|(_, l)| *l));
                all
            }
            _ => vec![],
        }
    }

    /// Replaces every branch to `from` with a branch to `to`
    pub fn retarget(&mut self, from: Label, to: Label) {
        let swap = |l: &mut Label| {
            if *l == from {
                *l = to;
            }
        };
        match self {
            Self::Jump { target, .. } => swap(target),
            Self::TableSwitch {
                default, targets, ..
            } => {
                swap(default);
                targets.iter_mut().for_each(swap);
            }
            Self::LookupSwitch { default, pairs } => {
                swap(default);
                pairs.iter_mut().for_each(|(_, l)| swap(l));
            }
            _ => {}
        }
    }

    /// Encoded size in bytes when placed at `pc`
    #[must_use]
    pub fn size(&self, pc: u32, wide_jump: bool) -> u32 {
        match self {
            Self::Label(_) => 0,
            Self::Op(_) => 1,
            Self::BiPush(_) | Self::NewArray(_) => 2,
            Self::SiPush(_)
            | Self::Ldc2(_)
            | Self::Field { .. }
            | Self::Invoke { .. }
            | Self::Type { .. } => 3,
            Self::Ldc(index) => {
                if *index <= 0xff {
                    2
                } else {
                    3
                }
            }
            Self::Var { opcode, var } => {
                if *var <= 3 && *opcode != RET {
                    1
                } else if *var <= 0xff {
                    2
                } else {
                    4
                }
            }
            Self::Iinc { var, delta } => {
                if *var <= 0xff && i8::try_from(*delta).is_ok() {
                    3
                } else {
                    6
                }
            }
            Self::Jump { .. } => {
                if wide_jump {
                    5
                } else {
                    3
                }
            }
            Self::TableSwitch { targets, .. } => {
                1 + switch_padding(pc) + 12 + 4 * targets.len() as u32
            }
            Self::LookupSwitch { pairs, .. } => {
                1 + switch_padding(pc) + 8 + 8 * pairs.len() as u32
            }
            Self::InvokeInterface { .. } | Self::InvokeDynamic { .. } => 5,
            Self::MultiANewArray { .. } => 4,
        }
    }

    /// Appends the encoding of this instruction, placed at `pc`
    pub fn write(
        &self,
        out: &mut Vec<u8>,
        pc: u32,
        labels: &HashMap<Label, u32>,
        wide_jump: bool,
    ) -> Result<(), Error> {
        let offset = |label: &Label| -> Result<i32, Error> {
            let target = labels
                .get(label)
                .ok_or_else(|| Error::illegal_state(format!("branch to unplaced {label:?}")))?;
            Ok(*target as i32 - pc as i32)
        };
        match self {
            Self::Label(_) => {}
            Self::Op(op) => out.put_u8(*op),
            Self::BiPush(v) => {
                out.put_u8(BIPUSH);
                out.put_u8(*v as u8);
            }
            Self::SiPush(v) => {
                out.put_u8(SIPUSH);
                out.put_u16(*v as u16);
            }
            Self::Ldc(index) => {
                if *index <= 0xff {
                    out.put_u8(LDC);
                    out.put_u8(*index as u8);
                } else {
                    out.put_u8(LDC_W);
                    out.put_u16(*index);
                }
            }
            Self::Ldc2(index) => {
                out.put_u8(LDC2_W);
                out.put_u16(*index);
            }
            Self::Var { opcode, var } => {
                if *var <= 3 && *opcode != RET {
                    let short = if *opcode < ISTORE {
                        ILOAD_0 + (opcode - ILOAD) * 4
                    } else {
                        ISTORE_0 + (opcode - ISTORE) * 4
                    };
                    out.put_u8(short + *var as u8);
                } else if *var <= 0xff {
                    out.put_u8(*opcode);
                    out.put_u8(*var as u8);
                } else {
                    out.put_u8(WIDE);
                    out.put_u8(*opcode);
                    out.put_u16(*var);
                }
            }
            Self::Iinc { var, delta } => {
                if *var <= 0xff && i8::try_from(*delta).is_ok() {
                    out.put_u8(IINC);
                    out.put_u8(*var as u8);
                    out.put_u8(*delta as u8);
                } else {
                    out.put_u8(WIDE);
                    out.put_u8(IINC);
                    out.put_u16(*var);
                    out.put_u16(*delta as u16);
                }
            }
            Self::Jump { opcode, target } => {
                let delta = offset(target)?;
                if wide_jump {
                    out.put_u8(if *opcode == JSR { JSR_W } else { GOTO_W });
                    out.put_i32(delta);
                } else {
                    let delta = i16::try_from(delta).map_err(|_| {
                        Error::illegal_state(format!("branch offset {delta} needs a wide jump"))
                    })?;
                    out.put_u8(*opcode);
                    out.put_u16(delta as u16);
                }
            }
            Self::TableSwitch {
                default,
                low,
                targets,
            } => {
                out.put_u8(TABLESWITCH);
                out.resize(out.len() + switch_padding(pc) as usize, 0);
                out.put_i32(offset(default)?);
                out.put_i32(*low);
                out.put_i32(*low + targets.len() as i32 - 1);
                for target in targets {
                    out.put_i32(offset(target)?);
                }
            }
            Self::LookupSwitch { default, pairs } => {
                out.put_u8(LOOKUPSWITCH);
                out.resize(out.len() + switch_padding(pc) as usize, 0);
                out.put_i32(offset(default)?);
                out.put_i32(pairs.len() as i32);
                for (key, target) in pairs {
                    out.put_i32(*key);
                    out.put_i32(offset(target)?);
                }
            }
            Self::Field { opcode, index }
            | Self::Invoke { opcode, index }
            | Self::Type { opcode, index } => {
                out.put_u8(*opcode);
                out.put_u16(*index);
            }
            Self::InvokeInterface { index, count } => {
                out.put_u8(INVOKEINTERFACE);
                out.put_u16(*index);
                out.put_u8(*count);
                out.put_u8(0);
            }
            Self::InvokeDynamic { index } => {
                out.put_u8(INVOKEDYNAMIC);
                out.put_u16(*index);
                out.put_u16(0);
            }
            Self::NewArray(atype) => {
                out.put_u8(NEWARRAY);
                out.put_u8(*atype);
            }
            Self::MultiANewArray { index, dimensions } => {
                out.put_u8(MULTIANEWARRAY);
                out.put_u16(*index);
                out.put_u8(*dimensions);
            }
        }
        Ok(())
    }
}

/// Zero bytes between a switch opcode at `pc` and its 4-byte aligned operands
#[must_use]
pub fn switch_padding(pc: u32) -> u32 {
    (4 - (pc + 1) % 4) % 4
}

fn jump_label(pc: u32, delta: i32) -> Result<Label, Error> {
    let target = i64::from(pc) + i64::from(delta);
    u32::try_from(target)
        .map(Label)
        .map_err(|_| Error::structural(format!("branch at {pc} jumps before the code start")))
}

/// Decodes raw bytecode into `(offset, instruction)` pairs.
///
/// Branch targets become `Label(target_offset)`; no [`Insn::Label`]s are emitted.
pub fn decode(code: &[u8]) -> Result<Vec<(u32, Insn)>, Error> {
    let mut reader = ByteReader::new(code);
    let mut insns = Vec::with_capacity(code.len() / 2);
    while reader.remaining() > 0 {
        let pc = reader.position() as u32;
        let opcode = reader.u8("opcode")?;
        let insn = match opcode {
            _ if is_simple(opcode) => Insn::Op(opcode),
            BIPUSH => Insn::BiPush(reader.i8("bipush operand")?),
            SIPUSH => Insn::SiPush(reader.i16("sipush operand")?),
            LDC => Insn::Ldc(u16::from(reader.u8("ldc index")?)),
            LDC_W => Insn::Ldc(reader.u16("ldc_w index")?),
            LDC2_W => Insn::Ldc2(reader.u16("ldc2_w index")?),
            ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Insn::Var {
                opcode,
                var: u16::from(reader.u8("local index")?),
            },
            ILOAD_0..=ALOAD_3 => Insn::Var {
                opcode: ILOAD + (opcode - ILOAD_0) / 4,
                var: u16::from((opcode - ILOAD_0) % 4),
            },
            ISTORE_0..=ASTORE_3 => Insn::Var {
                opcode: ISTORE + (opcode - ISTORE_0) / 4,
                var: u16::from((opcode - ISTORE_0) % 4),
            },
            IINC => Insn::Iinc {
                var: u16::from(reader.u8("iinc index")?),
                delta: i16::from(reader.i8("iinc delta")?),
            },
            IFEQ..=JSR | IFNULL | IFNONNULL => {
                let delta = i32::from(reader.i16("branch offset")?);
                Insn::Jump {
                    opcode,
                    target: jump_label(pc, delta)?,
                }
            }
            GOTO_W | JSR_W => {
                let delta = reader.i32("wide branch offset")?;
                Insn::Jump {
                    opcode: if opcode == GOTO_W { GOTO } else { JSR },
                    target: jump_label(pc, delta)?,
                }
            }
            TABLESWITCH => {
                reader.skip(switch_padding(pc) as usize, "tableswitch padding")?;
                let default = jump_label(pc, reader.i32("tableswitch default")?)?;
                let low = reader.i32("tableswitch low")?;
                let high = reader.i32("tableswitch high")?;
                if high < low {
                    return Err(Error::structural(format!(
                        "tableswitch at {pc} has high {high} < low {low}"
                    )));
                }
                let n = (i64::from(high) - i64::from(low) + 1) as usize;
                if n * 4 > reader.remaining() {
                    return Err(Error::structural(format!(
                        "tableswitch at {pc} claims {n} targets"
                    )));
                }
                let targets = (0..n)
                    .map(|_| jump_label(pc, reader.i32("tableswitch target")?))
                    .collect::<Result<_, _>>()?;
                Insn::TableSwitch {
                    default,
                    low,
                    targets,
                }
            }
            LOOKUPSWITCH => {
                reader.skip(switch_padding(pc) as usize, "lookupswitch padding")?;
                let default = jump_label(pc, reader.i32("lookupswitch default")?)?;
                let npairs = reader.i32("lookupswitch npairs")?;
                let n = usize::try_from(npairs).map_err(|_| {
                    Error::structural(format!("lookupswitch at {pc} has {npairs} pairs"))
                })?;
                if n * 8 > reader.remaining() {
                    return Err(Error::structural(format!(
                        "lookupswitch at {pc} claims {n} pairs"
                    )));
                }
                let pairs = (0..n)
                    .map(|_| {
                        let key = reader.i32("lookupswitch key")?;
                        Ok((key, jump_label(pc, reader.i32("lookupswitch target")?)?))
                    })
                    .collect::<Result<_, Error>>()?;
                Insn::LookupSwitch { default, pairs }
            }
            GETSTATIC..=PUTFIELD => Insn::Field {
                opcode,
                index: reader.u16("field index")?,
            },
            INVOKEVIRTUAL..=INVOKESTATIC => Insn::Invoke {
                opcode,
                index: reader.u16("method index")?,
            },
            INVOKEINTERFACE => {
                let index = reader.u16("interface method index")?;
                let count = reader.u8("invokeinterface count")?;
                reader.u8("invokeinterface zero")?;
                Insn::InvokeInterface { index, count }
            }
            INVOKEDYNAMIC => {
                let index = reader.u16("invokedynamic index")?;
                reader.u16("invokedynamic zero")?;
                Insn::InvokeDynamic { index }
            }
            NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => Insn::Type {
                opcode,
                index: reader.u16("class index")?,
            },
            NEWARRAY => Insn::NewArray(reader.u8("newarray type")?),
            MULTIANEWARRAY => Insn::MultiANewArray {
                index: reader.u16("multianewarray index")?,
                dimensions: reader.u8("multianewarray dimensions")?,
            },
            WIDE => {
                let widened = reader.u8("wide opcode")?;
                match widened {
                    ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Insn::Var {
                        opcode: widened,
                        var: reader.u16("wide local index")?,
                    },
                    IINC => Insn::Iinc {
                        var: reader.u16("wide iinc index")?,
                        delta: reader.i16("wide iinc delta")?,
                    },
                    _ => {
                        return Err(Error::structural(format!(
                            "wide at {pc} modifies opcode {widened:#x}"
                        )));
                    }
                }
            }
            _ => {
                return Err(Error::structural(format!(
                    "illegal opcode {opcode:#x} at {pc}"
                )));
            }
        };
        insns.push((pc, insn));
    }
    Ok(insns)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::classfile::{
        insn::{Insn, Label, decode, switch_padding},
        opcodes::*,
    };

    #[test]
    fn test_decode_short_and_wide_forms() {
        let code = [
            ILOAD_0 + 2, // iload_2
            WIDE,
            ASTORE,
            0x01,
            0x00,
            IINC,
            3,
            0xff,
            GOTO,
            0xff,
            0xf8,
        ];
        let insns = decode(&code).unwrap();
        assert_eq!(
            insns,
            vec![
                (0, Insn::Var { opcode: ILOAD, var: 2 }),
                (1, Insn::Var { opcode: ASTORE, var: 256 }),
                (5, Insn::Iinc { var: 3, delta: -1 }),
                (8, Insn::Jump { opcode: GOTO, target: Label(0) }),
            ]
        );
    }

    #[test]
    fn test_encode_canonical_forms() {
        let labels = HashMap::new();
        let mut out = vec![];
        for insn in [
            Insn::Var { opcode: ASTORE, var: 3 },
            Insn::Var { opcode: ALOAD, var: 4 },
            Insn::Var { opcode: ILOAD, var: 300 },
            Insn::Ldc(7),
            Insn::Ldc(700),
        ] {
            let pc = out.len() as u32;
            let size = insn.size(pc, false);
            insn.write(&mut out, pc, &labels, false).unwrap();
            assert_eq!(out.len() as u32, pc + size);
        }
        assert_eq!(
            out,
            vec![
                ASTORE_3, ALOAD, 4, WIDE, ILOAD, 0x01, 0x2c, LDC, 7, LDC_W, 0x02, 0xbc
            ]
        );
    }

    #[test]
    fn test_tableswitch_roundtrip_alignment() {
        let switch = Insn::TableSwitch {
            default: Label(10),
            low: 1,
            targets: vec![Label(20), Label(30)],
        };
        let labels: HashMap<_, _> = [(Label(10), 33), (Label(20), 43), (Label(30), 53)].into();
        let mut out = vec![0; 5];
        switch.write(&mut out, 5, &labels, false).unwrap();
        assert_eq!(switch_padding(5), 2);
        assert_eq!(out.len() as u32, 5 + switch.size(5, false));

        let mut code = vec![NOP; 5];
        code.extend_from_slice(&out[5..]);
        let decoded = decode(&code).unwrap();
        assert_eq!(
            decoded.last().unwrap().1,
            Insn::TableSwitch {
                default: Label(33),
                low: 1,
                targets: vec![Label(43), Label(53)],
            }
        );
    }

    #[test]
    fn test_illegal_opcode() {
        assert!(decode(&[0xfe]).is_err());
        assert!(decode(&[BIPUSH]).is_err());
    }
}
