//! Shared helpers: assembling small test classes and running their bytecode.
#![allow(dead_code)]

use std::collections::HashMap;

use libafl_jvm::{
    CoverageMap,
    classfile::{
        ClassFile,
        code::Code,
        constpool::{Constant, ConstantPool},
        descriptor::MethodDescriptor,
        find_attribute,
        frame::{ACC_STATIC, Frame, MethodContext, VerificationType},
        insn::{Insn, Label},
        opcodes::*,
    },
};

pub const SUBJECT: &str = "test/Subject";
pub const MAP_CLASS: &str = "libafl/jvm/runtime/CoverageMap";

pub fn subject() -> ClassFile {
    ClassFile::new(52, SUBJECT, "java/lang/Object").unwrap()
}

fn frame(label: Label, locals: usize) -> Frame {
    Frame {
        label,
        locals: vec![VerificationType::Integer; locals],
        stack: vec![],
    }
}

/// `static int pick(int x) { int r; if (x != 0) r = 1; else r = 2; return r; }`
pub fn add_pick(class: &mut ClassFile) {
    let mut code = Code::new(1, 2);
    code.track_frames = true;
    let (other, join) = (code.new_label(), code.new_label());
    code.insns = vec![
        Insn::Var { opcode: ILOAD, var: 0 },
        Insn::Jump { opcode: IFEQ, target: other },
        Insn::Op(ICONST_1),
        Insn::Var { opcode: ISTORE, var: 1 },
        Insn::Jump { opcode: GOTO, target: join },
        Insn::Label(other),
        Insn::Op(ICONST_2),
        Insn::Var { opcode: ISTORE, var: 1 },
        Insn::Label(join),
        Insn::Var { opcode: ILOAD, var: 1 },
        Insn::Op(IRETURN),
    ];
    code.frames = vec![frame(other, 1), frame(join, 2)];
    class.add_method(ACC_STATIC, "pick", "(I)I", &code).unwrap();
}

/// `static int sum(int n) { int s = 0; while (n > 0) { s += n; n--; } return s; }`
pub fn add_sum(class: &mut ClassFile) {
    let mut code = Code::new(2, 2);
    code.track_frames = true;
    let (top, done) = (code.new_label(), code.new_label());
    code.insns = vec![
        Insn::Op(ICONST_0),
        Insn::Var { opcode: ISTORE, var: 1 },
        Insn::Label(top),
        Insn::Var { opcode: ILOAD, var: 0 },
        Insn::Jump { opcode: IFLE, target: done },
        Insn::Var { opcode: ILOAD, var: 1 },
        Insn::Var { opcode: ILOAD, var: 0 },
        Insn::Op(IADD),
        Insn::Var { opcode: ISTORE, var: 1 },
        Insn::Iinc { var: 0, delta: -1 },
        Insn::Jump { opcode: GOTO, target: top },
        Insn::Label(done),
        Insn::Var { opcode: ILOAD, var: 1 },
        Insn::Op(IRETURN),
    ];
    code.frames = vec![frame(top, 2), frame(done, 2)];
    class.add_method(ACC_STATIC, "sum", "(I)I", &code).unwrap();
}

/// `static int twice(int x) { return x * 2; }`
pub fn add_twice(class: &mut ClassFile) {
    let mut code = Code::new(2, 1);
    code.insns = vec![
        Insn::Var { opcode: ILOAD, var: 0 },
        Insn::Op(ICONST_2),
        Insn::Op(IMUL),
        Insn::Op(IRETURN),
    ];
    class.add_method(ACC_STATIC, "twice", "(I)I", &code).unwrap();
}

/// `static int calls(int x) { return twice(Math.abs(x)); }`
pub fn add_calls(class: &mut ClassFile) {
    let abs = class.pool.add_method_ref("java/lang/Math", "abs", "(I)I").unwrap();
    let twice = class.pool.add_method_ref(SUBJECT, "twice", "(I)I").unwrap();
    let mut code = Code::new(1, 1);
    code.insns = vec![
        Insn::Var { opcode: ILOAD, var: 0 },
        Insn::Invoke { opcode: INVOKESTATIC, index: abs },
        Insn::Invoke { opcode: INVOKESTATIC, index: twice },
        Insn::Op(IRETURN),
    ];
    class.add_method(ACC_STATIC, "calls", "(I)I", &code).unwrap();
}

/// `static void touch() { CoverageMap.updated(); }`, a call into the runtime itself
pub fn add_touch(class: &mut ClassFile) {
    let updated = class.pool.add_method_ref(MAP_CLASS, "updated", "()V").unwrap();
    let mut code = Code::new(0, 0);
    code.insns = vec![
        Insn::Invoke { opcode: INVOKESTATIC, index: updated },
        Insn::Op(RETURN),
    ];
    class.add_method(ACC_STATIC, "touch", "()V", &code).unwrap();
}

/// A class with `pick`, `sum`, `twice` and `calls`
pub fn full_subject() -> Vec<u8> {
    let mut class = subject();
    add_pick(&mut class);
    add_sum(&mut class);
    add_twice(&mut class);
    add_calls(&mut class);
    class.to_bytes().unwrap()
}

/// Decodes the body of the method called `name`
pub fn method_code(class: &ClassFile, name: &str) -> Code {
    let mut pool = class.pool.clone();
    let method = class
        .methods
        .iter()
        .find(|m| pool.utf8(m.name_index).unwrap() == name)
        .unwrap_or_else(|| panic!("no method {name}"));
    let class_name = class.name().unwrap().into_owned();
    let descriptor = pool.utf8(method.descriptor_index).unwrap().into_owned();
    let index = find_attribute(&method.attributes, &pool, "Code").unwrap().unwrap();
    let ctx = MethodContext {
        this_class: class.this_class,
        class_name: &class_name,
        access_flags: method.access_flags,
        name,
        descriptor: &descriptor,
        major_version: class.major_version,
    };
    Code::parse(&mut pool, &method.attributes[index].info, &ctx).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value {
    Int(i32),
    Map,
}

impl Value {
    fn int(self) -> i32 {
        match self {
            Value::Int(v) => v,
            Value::Map => panic!("expected an int, found the coverage map"),
        }
    }
}

/// A tiny interpreter for the int-only code the test classes contain.
///
/// It understands the coverage map field and `ByteBuffer.get`/`put`, and checks that the
/// operand stack and locals stay within the declared limits.
pub struct Machine<'a> {
    class: &'a ClassFile,
    pool: ConstantPool,
    map: &'a CoverageMap,
    /// Calls of the map's `updated()` notification
    pub notifications: usize,
}

impl<'a> Machine<'a> {
    pub fn new(class: &'a ClassFile, map: &'a CoverageMap) -> Self {
        Self {
            class,
            pool: class.pool.clone(),
            map,
            notifications: 0,
        }
    }

    /// Runs a static method of the class, returning its result for non-void methods
    pub fn call(&mut self, name: &str, args: &[i32]) -> Option<i32> {
        let code = method_code(self.class, name);
        let mut labels = HashMap::new();
        for (index, insn) in code.insns.iter().enumerate() {
            if let Insn::Label(label) = insn {
                labels.insert(*label, index);
            }
        }

        let mut locals: Vec<Option<Value>> = vec![None; code.max_locals as usize];
        for (slot, arg) in args.iter().enumerate() {
            locals[slot] = Some(Value::Int(*arg));
        }
        let mut stack: Vec<Value> = vec![];
        let mut pc = 0;

        loop {
            let insn = &code.insns[pc];
            pc += 1;
            match insn {
                Insn::Label(_) => continue,
                Insn::Op(op) => match *op {
                    NOP => {}
                    ICONST_M1..=ICONST_5 => stack.push(Value::Int(i32::from(*op) - 3)),
                    IADD | ISUB | IMUL | IAND | ISHR => {
                        let b = stack.pop().unwrap().int();
                        let a = stack.pop().unwrap().int();
                        stack.push(Value::Int(match *op {
                            IADD => a.wrapping_add(b),
                            ISUB => a.wrapping_sub(b),
                            IMUL => a.wrapping_mul(b),
                            IAND => a & b,
                            _ => a >> (b & 31),
                        }));
                    }
                    DUP => {
                        let top = *stack.last().unwrap();
                        stack.push(top);
                    }
                    DUP2 => {
                        let len = stack.len();
                        let (a, b) = (stack[len - 2], stack[len - 1]);
                        stack.push(a);
                        stack.push(b);
                    }
                    POP => {
                        stack.pop().unwrap();
                    }
                    IRETURN => return Some(stack.pop().unwrap().int()),
                    RETURN => return None,
                    other => panic!("unsupported opcode {other:#x}"),
                },
                Insn::BiPush(v) => stack.push(Value::Int(i32::from(*v))),
                Insn::SiPush(v) => stack.push(Value::Int(i32::from(*v))),
                Insn::Ldc(index) => match self.pool.get(*index).unwrap() {
                    Constant::Integer(v) => stack.push(Value::Int(*v)),
                    other => panic!("unsupported constant {other:?}"),
                },
                Insn::Var { opcode, var } => {
                    let slot = *var as usize;
                    assert!(slot < locals.len(), "local {slot} beyond max_locals");
                    match *opcode {
                        ILOAD | ALOAD => stack.push(locals[slot].expect("unset local")),
                        ISTORE | ASTORE => locals[slot] = Some(stack.pop().unwrap()),
                        other => panic!("unsupported local opcode {other:#x}"),
                    }
                }
                Insn::Iinc { var, delta } => {
                    let slot = *var as usize;
                    let value = locals[slot].unwrap().int();
                    locals[slot] = Some(Value::Int(value + i32::from(*delta)));
                }
                Insn::Jump { opcode, target } => {
                    let taken = match *opcode {
                        GOTO => true,
                        IFEQ..=IFLE => {
                            let v = stack.pop().unwrap().int();
                            match *opcode {
                                IFEQ => v == 0,
                                IFNE => v != 0,
                                IFLT => v < 0,
                                IFGE => v >= 0,
                                IFGT => v > 0,
                                _ => v <= 0,
                            }
                        }
                        IF_ICMPEQ..=IF_ICMPLE => {
                            let b = stack.pop().unwrap().int();
                            let a = stack.pop().unwrap().int();
                            match *opcode {
                                IF_ICMPEQ => a == b,
                                IF_ICMPNE => a != b,
                                IF_ICMPLT => a < b,
                                IF_ICMPGE => a >= b,
                                IF_ICMPGT => a > b,
                                _ => a <= b,
                            }
                        }
                        other => panic!("unsupported jump {other:#x}"),
                    };
                    if taken {
                        pc = labels[target];
                    }
                }
                Insn::TableSwitch {
                    default,
                    low,
                    targets,
                } => {
                    let key = stack.pop().unwrap().int();
                    let target = usize::try_from(key - low)
                        .ok()
                        .and_then(|i| targets.get(i))
                        .unwrap_or(default);
                    pc = labels[target];
                }
                Insn::Field { opcode, index } => {
                    let field = self.pool.member_ref(*index).unwrap();
                    assert_eq!(*opcode, GETSTATIC);
                    assert_eq!(field.owner, MAP_CLASS);
                    assert_eq!(field.name, "mem");
                    stack.push(Value::Map);
                }
                Insn::Invoke { opcode, index } => {
                    let callee = self.pool.member_ref(*index).unwrap();
                    let (owner, name, descriptor) = (
                        callee.owner.into_owned(),
                        callee.name.into_owned(),
                        callee.descriptor.into_owned(),
                    );
                    let params = MethodDescriptor::parse(&descriptor).unwrap().params.len();
                    let mut args: Vec<Value> = stack.split_off(stack.len() - params);
                    if *opcode != INVOKESTATIC {
                        let receiver = stack.pop().unwrap();
                        args.insert(0, receiver);
                    }
                    match (owner.as_str(), name.as_str()) {
                        ("java/nio/ByteBuffer", "get") => {
                            assert_eq!(args[0], Value::Map);
                            let value = self.map.get(args[1].int() as usize).unwrap();
                            stack.push(Value::Int(i32::from(value as i8)));
                        }
                        ("java/nio/ByteBuffer", "put") => {
                            assert_eq!(args[0], Value::Map);
                            self.map
                                .put(args[1].int() as usize, args[2].int() as u8)
                                .unwrap();
                            stack.push(Value::Map);
                        }
                        (MAP_CLASS, "updated") => self.notifications += 1,
                        ("java/lang/Math", "abs") => stack.push(Value::Int(args[0].int().abs())),
                        (SUBJECT, _) => {
                            let ints: Vec<i32> = args.iter().map(|v| v.int()).collect();
                            if let Some(result) = self.call(&name, &ints) {
                                stack.push(Value::Int(result));
                            }
                        }
                        other => panic!("unsupported call {other:?}"),
                    }
                }
                other => panic!("unsupported instruction {other:?}"),
            }
            assert!(
                stack.len() <= code.max_stack as usize,
                "stack depth {} exceeds max_stack {} at {pc}",
                stack.len(),
                code.max_stack
            );
        }
    }
}
