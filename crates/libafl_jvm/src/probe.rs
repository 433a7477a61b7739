//! The bytecode that bumps one coverage map counter.
//!
//! A probe for edge `id` with the map in local `slot` reads
//!
//! ```text
//! aload slot; push id; dup2; invokevirtual ByteBuffer.get(I)B
//! push 0xff; iand; push 1; iadd; dup; push 8; ishr; iadd
//! invokevirtual ByteBuffer.put(IB)Ljava/nio/ByteBuffer;; pop
//! ```
//!
//! which is [`crate::saturating_increment`] on the counter at `id`.

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    Error,
    classfile::{constpool::ConstantPool, frame::VerificationType, insn::Insn, opcodes::*},
    coverage::EdgeId,
    instrumentor::InstrumentationMode,
};

/// Operand stack slots a probe needs on top of the method's own usage
pub const PROBE_STACK_SIZE: u16 = 5;
/// Operand stack slots the map-loading prologue needs
pub const LOAD_MAP_STACK_SIZE: u16 = 1;
/// Operand stack slots a call-site probe needs
pub const CALL_PROBE_STACK_SIZE: u16 = PROBE_STACK_SIZE;

/// Internal name of the map's runtime type
pub const BYTE_BUFFER: &str = "java/nio/ByteBuffer";
const BYTE_BUFFER_DESCRIPTOR: &str = "Ljava/nio/ByteBuffer;";

/// Where instrumented code finds the coverage map at runtime
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Serialize, Deserialize)]
pub struct CoverageMapTarget {
    /// Internal name of the class holding the map
    #[builder(default = "libafl/jvm/runtime/CoverageMap".to_string(), setter(into))]
    pub class_name: String,
    /// Name of its `static java.nio.ByteBuffer` field
    #[builder(default = "mem".to_string(), setter(into))]
    pub field_name: String,
    /// Static `()V` method called after every probe in testing mode
    #[builder(default = "updated".to_string(), setter(into))]
    pub notify_method: String,
}

impl Default for CoverageMapTarget {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Constant pool indices a probe refers to, resolved once per class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConstants {
    map_field: u16,
    get: u16,
    put: u16,
    buffer_class: u16,
    notify: Option<u16>,
}

impl ProbeConstants {
    /// Adds (or finds) everything a probe needs in `pool`
    pub fn resolve(
        pool: &mut ConstantPool,
        target: &CoverageMapTarget,
        mode: InstrumentationMode,
    ) -> Result<Self, Error> {
        let map_field =
            pool.add_field_ref(&target.class_name, &target.field_name, BYTE_BUFFER_DESCRIPTOR)?;
        let get = pool.add_method_ref(BYTE_BUFFER, "get", "(I)B")?;
        let put = pool.add_method_ref(BYTE_BUFFER, "put", "(IB)Ljava/nio/ByteBuffer;")?;
        let buffer_class = pool.add_class(BYTE_BUFFER)?;
        let notify = match mode {
            InstrumentationMode::Testing => {
                Some(pool.add_method_ref(&target.class_name, &target.notify_method, "()V")?)
            }
            InstrumentationMode::Production => None,
        };
        Ok(Self {
            map_field,
            get,
            put,
            buffer_class,
            notify,
        })
    }

    /// The verification type of the map local
    #[must_use]
    pub fn map_type(&self) -> VerificationType {
        VerificationType::Object(self.buffer_class)
    }
}

/// The shortest instruction pushing `value`
pub fn push_int(pool: &mut ConstantPool, value: i32) -> Result<Insn, Error> {
    Ok(match value {
        -1..=5 => Insn::Op((i32::from(ICONST_0) + value) as u8),
        _ if i8::try_from(value).is_ok() => Insn::BiPush(value as i8),
        _ if i16::try_from(value).is_ok() => Insn::SiPush(value as i16),
        _ => Insn::Ldc(pool.add_integer(value)?),
    })
}

/// Emits probes and the map-loading prologue for one class
#[derive(Debug, Clone, Copy)]
pub struct ProbeGenerator {
    constants: ProbeConstants,
}

impl ProbeGenerator {
    /// A generator over resolved constants
    #[must_use]
    pub fn new(constants: ProbeConstants) -> Self {
        Self { constants }
    }

    /// The resolved constants
    #[must_use]
    pub fn constants(&self) -> &ProbeConstants {
        &self.constants
    }

    /// `getstatic <map>; astore slot`
    #[must_use]
    pub fn emit_load_map(&self, slot: u16) -> Vec<Insn> {
        vec![
            Insn::Field {
                opcode: GETSTATIC,
                index: self.constants.map_field,
            },
            Insn::Var {
                opcode: ASTORE,
                var: slot,
            },
        ]
    }

    /// Code bumping the counter of `edge_id`, with the map in local `slot`
    pub fn emit_probe(
        &self,
        pool: &mut ConstantPool,
        edge_id: EdgeId,
        slot: u16,
    ) -> Result<Vec<Insn>, Error> {
        let id = i32::try_from(edge_id)
            .map_err(|_| Error::capacity(format!("edge id {edge_id} exceeds the int range")))?;
        let mut probe = Vec::with_capacity(16);
        probe.push(Insn::Var {
            opcode: ALOAD,
            var: slot,
        });
        probe.push(push_int(pool, id)?);
        probe.push(Insn::Op(DUP2));
        probe.push(Insn::Invoke {
            opcode: INVOKEVIRTUAL,
            index: self.constants.get,
        });
        probe.push(Insn::SiPush(0xff));
        probe.push(Insn::Op(IAND));
        probe.push(Insn::Op(ICONST_1));
        probe.push(Insn::Op(IADD));
        probe.push(Insn::Op(DUP));
        probe.push(Insn::BiPush(8));
        probe.push(Insn::Op(ISHR));
        probe.push(Insn::Op(IADD));
        probe.push(Insn::Invoke {
            opcode: INVOKEVIRTUAL,
            index: self.constants.put,
        });
        probe.push(Insn::Op(POP));
        if let Some(notify) = self.constants.notify {
            probe.push(Insn::Invoke {
                opcode: INVOKESTATIC,
                index: notify,
            });
        }
        Ok(probe)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        classfile::{constpool::ConstantPool, insn::Insn, opcodes::*},
        instrumentor::InstrumentationMode,
        probe::{CoverageMapTarget, ProbeConstants, ProbeGenerator, push_int},
    };

    #[test]
    fn test_push_int_shortest() {
        let mut pool = ConstantPool::new();
        assert_eq!(push_int(&mut pool, -1).unwrap(), Insn::Op(ICONST_M1));
        assert_eq!(push_int(&mut pool, 5).unwrap(), Insn::Op(ICONST_5));
        assert_eq!(push_int(&mut pool, 6).unwrap(), Insn::BiPush(6));
        assert_eq!(push_int(&mut pool, -128).unwrap(), Insn::BiPush(-128));
        assert_eq!(push_int(&mut pool, 128).unwrap(), Insn::SiPush(128));
        assert_eq!(push_int(&mut pool, 32767).unwrap(), Insn::SiPush(32767));
        let Insn::Ldc(index) = push_int(&mut pool, 32768).unwrap() else {
            panic!("expected ldc");
        };
        assert_eq!(push_int(&mut pool, 32768).unwrap(), Insn::Ldc(index));
    }

    #[test]
    fn test_probe_shape() {
        let mut pool = ConstantPool::new();
        let target = CoverageMapTarget::default();
        let production = ProbeGenerator::new(
            ProbeConstants::resolve(&mut pool, &target, InstrumentationMode::Production).unwrap(),
        );
        let probe = production.emit_probe(&mut pool, 7, 3).unwrap();
        assert_eq!(probe.len(), 14);
        assert_eq!(probe[0], Insn::Var { opcode: ALOAD, var: 3 });
        assert_eq!(probe[1], Insn::BiPush(7));
        assert_eq!(probe[4], Insn::SiPush(0xff));
        assert_eq!(probe[13], Insn::Op(POP));

        let testing = ProbeGenerator::new(
            ProbeConstants::resolve(&mut pool, &target, InstrumentationMode::Testing).unwrap(),
        );
        let probe = testing.emit_probe(&mut pool, 7, 3).unwrap();
        assert_eq!(probe.len(), 15);
        assert!(matches!(probe[14], Insn::Invoke { opcode: INVOKESTATIC, .. }));
    }

    #[test]
    fn test_target_builder() {
        let target = CoverageMapTarget::builder()
            .class_name("com/example/Map")
            .build();
        assert_eq!(target.class_name, "com/example/Map");
        assert_eq!(target.field_name, "mem");
        assert_eq!(target.notify_method, "updated");
    }
}
