//! Where control-flow probes go.
//!
//! [`ControlFlowProbes`] walks a method body and asks an [`EdgeProbes`] sink for probe code
//! wherever an edge needs to be recorded. [`LabelFlowProbes`] places probes the way JaCoCo
//! does: only at labels with more than one way in, and at method exits, so every probe marks
//! a distinct edge while straight-line code stays untouched.

use core::fmt::Debug;
use std::collections::HashMap;

use crate::{
    Error,
    classfile::{
        code::Code,
        frame::Frame,
        insn::{Insn, Label},
        opcodes::{GOTO, is_conditional_jump},
    },
};

/// Receives the probe sites found by a [`ControlFlowProbes`] pass
pub trait EdgeProbes {
    /// Appends the code of one control-flow probe to `out`
    fn probe(&mut self, out: &mut Vec<Insn>) -> Result<(), Error>;

    /// Called with every original instruction right before it is re-emitted
    fn before_insn(&mut self, _insn: &Insn, _out: &mut Vec<Insn>) -> Result<(), Error> {
        Ok(())
    }
}

/// Inserts control-flow probes into a method body
pub trait ControlFlowProbes: Debug {
    /// Rewrites `code` in place, returning how many probes were inserted
    fn insert_probes(&self, code: &mut Code, probes: &mut dyn EdgeProbes) -> Result<usize, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
struct LabelInfo {
    /// Ways into the label: fall-through, branches, handlers
    marks: u32,
    /// Reached by falling through from the previous instruction
    successor: bool,
}

impl LabelInfo {
    fn is_multi_target(self) -> bool {
        self.marks > 1
    }
}

fn analyze(code: &Code) -> HashMap<Label, LabelInfo> {
    let mut info: HashMap<Label, LabelInfo> = HashMap::new();
    for handler in &code.handlers {
        // a probe right at the start of every try block
        info.entry(handler.start).or_default().marks += 1;
        info.entry(handler.handler).or_default().marks += 1;
    }

    let mut first = true;
    let mut successor = false;
    for insn in &code.insns {
        match insn {
            Insn::Label(label) => {
                let entry = info.entry(*label).or_default();
                if first {
                    entry.marks += 1;
                }
                if successor {
                    entry.marks += 1;
                    entry.successor = true;
                }
            }
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => {
                for target in distinct(insn.targets()) {
                    info.entry(target).or_default().marks += 1;
                }
                first = false;
                successor = false;
            }
            _ => {
                for target in insn.targets() {
                    info.entry(target).or_default().marks += 1;
                }
                first = false;
                successor = insn.falls_through();
            }
        }
    }
    info
}

/// Drops repeated labels, keeping the first occurrence
fn distinct(labels: Vec<Label>) -> Vec<Label> {
    let mut seen = Vec::with_capacity(labels.len());
    for label in labels {
        if !seen.contains(&label) {
            seen.push(label);
        }
    }
    seen
}

/// JaCoCo-style probe placement over label flow.
///
/// A label is a multi-target when it can be entered more than one way. Probes go
/// - before every `*return` and `athrow`,
/// - before a `goto` to a multi-target,
/// - on the fall-through path right before a multi-target.
///
/// Conditional branches and switches to a multi-target are redirected to a trampoline
/// (`probe; goto target`) appended after the last instruction, which carries a copy of the
/// target's frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct LabelFlowProbes;

struct Trampolines {
    insns: Vec<Insn>,
    frames: Vec<Frame>,
}

impl Trampolines {
    fn add(
        &mut self,
        code: &mut Code,
        target: Label,
        probes: &mut dyn EdgeProbes,
    ) -> Result<Label, Error> {
        let label = code.new_label();
        if code.track_frames {
            let frame = code.frame_at(target).ok_or_else(|| {
                Error::structural(format!("branch target {target:?} has no stack map frame"))
            })?;
            self.frames.push(Frame {
                label,
                ..frame.clone()
            });
        }
        self.insns.push(Insn::Label(label));
        probes.probe(&mut self.insns)?;
        self.insns.push(Insn::Jump {
            opcode: GOTO,
            target,
        });
        Ok(label)
    }
}

impl ControlFlowProbes for LabelFlowProbes {
    fn insert_probes(&self, code: &mut Code, probes: &mut dyn EdgeProbes) -> Result<usize, Error> {
        let info = analyze(code);
        let is_multi = |label: &Label| info.get(label).is_some_and(|i| i.is_multi_target());

        let original = core::mem::take(&mut code.insns);
        let mut out = Vec::with_capacity(original.len() * 2);
        let mut trampolines = Trampolines {
            insns: vec![],
            frames: vec![],
        };
        let mut count = 0;

        for mut insn in original {
            if let Insn::Label(label) = insn {
                if info.get(&label).is_some_and(|i| i.successor) && is_multi(&label) {
                    probes.probe(&mut out)?;
                    count += 1;
                }
                out.push(insn);
                continue;
            }

            probes.before_insn(&insn, &mut out)?;
            if insn.is_exit() {
                probes.probe(&mut out)?;
                count += 1;
            } else if let Insn::Jump { opcode, target } = insn {
                if is_multi(&target) {
                    if opcode == GOTO {
                        probes.probe(&mut out)?;
                        count += 1;
                    } else if is_conditional_jump(opcode) {
                        let via = trampolines.add(code, target, probes)?;
                        insn.retarget(target, via);
                        count += 1;
                    }
                }
            } else if matches!(insn, Insn::TableSwitch { .. } | Insn::LookupSwitch { .. }) {
                for target in distinct(insn.targets()) {
                    if is_multi(&target) {
                        let via = trampolines.add(code, target, probes)?;
                        insn.retarget(target, via);
                        count += 1;
                    }
                }
            }
            out.push(insn);
        }

        if !trampolines.insns.is_empty() {
            let last = out.iter().rev().find(|i| !matches!(i, Insn::Label(_)));
            if last.is_some_and(Insn::falls_through) {
                return Err(Error::structural("code falls off its last instruction"));
            }
            out.append(&mut trampolines.insns);
            code.frames.append(&mut trampolines.frames);
        }
        code.insns = out;
        Ok(count)
    }
}
