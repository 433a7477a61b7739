//! Rewrites whole class files: every method body gets a map-loading prologue plus
//! control-flow and call-site probes.

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    Error,
    classfile::{
        ClassFile,
        code::Code,
        constpool::ConstantPool,
        find_attribute,
        frame::MethodContext,
        insn::Insn,
    },
    coverage::{CoverageState, EdgeId},
    filter::CallSiteFilter,
    flow::{ControlFlowProbes, EdgeProbes, LabelFlowProbes},
    probe::{
        CALL_PROBE_STACK_SIZE, CoverageMapTarget, LOAD_MAP_STACK_SIZE, PROBE_STACK_SIZE,
        ProbeConstants, ProbeGenerator,
    },
};

/// How instrumented code is meant to run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentationMode {
    /// Regular fuzzing: the map grows, the instrumentation's own classes are left alone
    #[default]
    Production,
    /// Self-tests: the map has a fixed size, every probe notifies the map class, and calls
    /// into the instrumentation's own classes are probed too
    Testing,
}

/// Transforms class file bytes
pub trait Instrumentor {
    /// Returns the rewritten class
    fn instrument(&self, bytecode: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Probes placed in one method
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodReport {
    /// Method name
    pub name: String,
    /// Method descriptor
    pub descriptor: String,
    /// Control-flow probes
    pub edge_probes: usize,
    /// Probes in front of method calls
    pub call_probes: usize,
    /// Ids of all probes, in the order they were allocated
    pub edge_ids: Vec<EdgeId>,
}

/// Probes placed in one class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassReport {
    /// Internal class name
    pub class_name: String,
    /// One report per method with a body
    pub methods: Vec<MethodReport>,
}

impl ClassReport {
    /// Probes of all kinds in all methods
    #[must_use]
    pub fn total_probes(&self) -> usize {
        self.methods
            .iter()
            .map(|m| m.edge_probes + m.call_probes)
            .sum()
    }
}

/// The probe sink for one method: allocates ids and emits probe code
struct MethodRewriter<'a> {
    pool: &'a mut ConstantPool,
    state: &'a CoverageState,
    generator: ProbeGenerator,
    filter: &'a CallSiteFilter,
    slot: u16,
    edge_ids: Vec<EdgeId>,
    call_probes: usize,
}

impl EdgeProbes for MethodRewriter<'_> {
    fn probe(&mut self, out: &mut Vec<Insn>) -> Result<(), Error> {
        let id = self.state.next_edge_id()?;
        self.edge_ids.push(id);
        out.extend(self.generator.emit_probe(self.pool, id, self.slot)?);
        Ok(())
    }

    fn before_insn(&mut self, insn: &Insn, out: &mut Vec<Insn>) -> Result<(), Error> {
        let Some(index) = insn.invoked_method() else {
            return Ok(());
        };
        let callee = self.pool.member_ref(index)?;
        if !self
            .filter
            .needs_call_edge(&callee.owner, &callee.name, &callee.descriptor)
        {
            return Ok(());
        }
        self.call_probes += 1;
        self.probe(out)
    }
}

/// Adds edge coverage to classes.
///
/// ```rust,ignore
/// let instrumentor = EdgeCoverageInstrumentor::builder()
///     .state(&state)
///     .filter(filter)
///     .build();
/// let rewritten = instrumentor.instrument(&class_bytes)?;
/// ```
#[derive(Debug, TypedBuilder)]
pub struct EdgeCoverageInstrumentor<'a> {
    /// Edge id allocation and the map; fixed exactly when the filter is in testing mode
    #[builder(default = CoverageState::global())]
    state: &'a CoverageState,
    /// Which calls get a probe; also carries the [`InstrumentationMode`]
    #[builder(default)]
    filter: CallSiteFilter,
    /// Where probes find the map
    #[builder(default)]
    target: CoverageMapTarget,
    /// Control-flow probe placement
    #[builder(default = Box::new(LabelFlowProbes))]
    flow: Box<dyn ControlFlowProbes + Send + Sync>,
}

impl Instrumentor for EdgeCoverageInstrumentor<'_> {
    fn instrument(&self, bytecode: &[u8]) -> Result<Vec<u8>, Error> {
        self.instrument_with_report(bytecode).map(|(bytes, _)| bytes)
    }
}

impl EdgeCoverageInstrumentor<'_> {
    /// The mode probes are generated for
    #[must_use]
    pub fn mode(&self) -> InstrumentationMode {
        self.filter.mode()
    }

    /// The state edge ids come from
    #[must_use]
    pub fn state(&self) -> &CoverageState {
        self.state
    }

    /// Rewrites a class, also reporting where probes went
    pub fn instrument_with_report(&self, bytecode: &[u8]) -> Result<(Vec<u8>, ClassReport), Error> {
        self.check_mode()?;
        let mut class = ClassFile::parse(bytecode)?;
        let class_name = class.name()?.into_owned();
        let mut report = ClassReport {
            class_name: class_name.clone(),
            methods: vec![],
        };

        let mut has_body = false;
        for method in &class.methods {
            if find_attribute(&method.attributes, &class.pool, "Code")?.is_some() {
                has_body = true;
                break;
            }
        }
        if !has_body {
            log::debug!("{class_name} has no method bodies, leaving it untouched");
            return Ok((bytecode.to_vec(), report));
        }

        let generator = ProbeGenerator::new(ProbeConstants::resolve(
            &mut class.pool,
            &self.target,
            self.mode(),
        )?);

        let mut methods = core::mem::take(&mut class.methods);
        for method in &mut methods {
            let Some(code_index) = find_attribute(&method.attributes, &class.pool, "Code")? else {
                continue;
            };
            let name = class.pool.utf8(method.name_index)?.into_owned();
            let descriptor = class.pool.utf8(method.descriptor_index)?.into_owned();
            let ctx = MethodContext {
                this_class: class.this_class,
                class_name: &class_name,
                access_flags: method.access_flags,
                name: &name,
                descriptor: &descriptor,
                major_version: class.major_version,
            };
            let attribute = &mut method.attributes[code_index];
            let (info, mut method_report) = self
                .instrument_method(&mut class.pool, &ctx, generator, &attribute.info)
                .map_err(|err| err.in_method(&class_name, &name, &descriptor))?;
            attribute.info = info;

            log::debug!(
                "{class_name}.{name}{descriptor}: {} edge probes, {} call probes",
                method_report.edge_probes,
                method_report.call_probes
            );
            method_report.name = name;
            method_report.descriptor = descriptor;
            report.methods.push(method_report);
        }
        class.methods = methods;

        let bytes = class.to_bytes()?;
        log::info!(
            "instrumented {class_name}: {} methods, {} probes",
            report.methods.len(),
            report.total_probes()
        );
        Ok((bytes, report))
    }

    /// Testing mode runs on a fixed map, production mode on a growable one
    fn check_mode(&self) -> Result<(), Error> {
        let mode = self.mode();
        let fixed = self.state.is_fixed();
        match (mode, fixed) {
            (InstrumentationMode::Testing, true) | (InstrumentationMode::Production, false) => {
                Ok(())
            }
            _ => Err(Error::illegal_argument(format!(
                "{mode:?} mode does not match a {} coverage map",
                if fixed { "fixed" } else { "growable" }
            ))),
        }
    }

    fn instrument_method(
        &self,
        pool: &mut ConstantPool,
        ctx: &MethodContext,
        generator: ProbeGenerator,
        info: &[u8],
    ) -> Result<(Vec<u8>, MethodReport), Error> {
        let mut code = Code::parse(pool, info, ctx)?;

        let slot = code.max_locals;
        if slot == u16::MAX {
            return Err(Error::capacity(
                "all 65535 local variable slots are taken, none left for the coverage map",
            ));
        }
        let map_type = generator.constants().map_type();
        for frame in &mut code.frames {
            frame.append_local(slot, map_type.clone())?;
        }

        let mut rewriter = MethodRewriter {
            pool,
            state: self.state,
            generator,
            filter: &self.filter,
            slot,
            edge_ids: vec![],
            call_probes: 0,
        };
        let edge_probes = self.flow.insert_probes(&mut code, &mut rewriter)?;
        let MethodRewriter {
            pool,
            edge_ids,
            call_probes,
            ..
        } = rewriter;

        let mut insns = generator.emit_load_map(slot);
        insns.append(&mut code.insns);
        code.insns = insns;
        code.max_stack = code
            .max_stack
            .checked_add(PROBE_STACK_SIZE.max(CALL_PROBE_STACK_SIZE))
            .ok_or_else(|| Error::capacity("max_stack overflows with probes"))?
            .max(LOAD_MAP_STACK_SIZE);
        code.max_locals = slot + 1;

        let info = code.encode(pool)?;
        Ok((
            info,
            MethodReport {
                edge_probes,
                call_probes,
                edge_ids,
                ..MethodReport::default()
            },
        ))
    }
}
