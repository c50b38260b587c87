//! Native JIT pipeline for VCODE units.
//!
//! One call to [`Jit::compile`] takes a unit through storage planning
//! (frame layout, per-register analysis, assignment), prologue and
//! per-block code emission into an executable page, and jump fixup, then
//! parks the result in the cache and hands back the entry point.
//!
//! Compilation is single-threaded per unit: the register file and all
//! working state belong to the one active compile. Finished pages are
//! never written again and may be executed from any thread.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod cache;
pub mod emit;
pub mod plan;
pub mod regs;

pub use buffer::{CodeBuffer, DEFAULT_CODE_SIZE};
pub use cache::JitCache;
pub use emit::Patch;
pub use plan::{Plan, PlanAnnotator, Storage};
pub use regs::{Gpr, RegisterFile};

use plan::F_PARAMETER;
use silica_vcode::{BlockId, DumpAnnotator, RegId, Unit, UnitId, UnitKind};
use std::sync::Arc;

// =============================================================================
// Fatal diagnostics
// =============================================================================

/// Abort compilation: dump the in-progress unit with the offending op
/// marked and whatever storage decisions exist, then panic.
pub(crate) fn fatal(
    unit: &Unit,
    plan: Option<&Plan>,
    mark: Option<(BlockId, usize)>,
    msg: String,
) -> ! {
    let mut text = String::new();
    let result = match plan {
        Some(plan) => unit.dump_with(&mut text, mark, &mut PlanAnnotator::new(plan)),
        None => unit.dump_with(&mut text, mark, &mut silica_vcode::NoAnnotations),
    };
    if result.is_ok() {
        eprint!("{text}");
    }
    panic!("{msg}");
}

fn verbose_dumps_enabled() -> bool {
    std::env::var_os("NVC_JIT_VERBOSE").is_some_and(|value| !value.is_empty())
}

/// Annotates dumps of a compiled unit with storage decisions and the
/// code offset each op was emitted at.
struct CompiledAnnotator<'a> {
    storage: PlanAnnotator<'a>,
    op_offsets: &'a [Vec<u32>],
}

impl silica_vcode::DumpAnnotator for CompiledAnnotator<'_> {
    fn annotate_reg(
        &mut self,
        out: &mut dyn std::fmt::Write,
        reg: RegId,
    ) -> std::fmt::Result {
        self.storage.annotate_reg(out, reg)
    }

    fn annotate_op(
        &mut self,
        out: &mut dyn std::fmt::Write,
        block: BlockId,
        op: usize,
    ) -> std::fmt::Result {
        match self.op_offsets.get(block.index()).and_then(|b| b.get(op)) {
            Some(offset) => write!(out, "    @{offset:#x}"),
            None => Ok(()),
        }
    }
}

// =============================================================================
// JIT State
// =============================================================================

/// Everything a compiled unit owns: its executable code and the
/// planning/emission records that describe it.
pub struct JitState {
    unit_id: UnitId,
    name: Box<str>,
    code: CodeBuffer,
    plan: Plan,
    block_ptrs: Vec<u32>,
    patches: Vec<Patch>,
    op_offsets: Vec<Vec<u32>>,
}

impl JitState {
    /// Identity of the compiled unit.
    #[inline]
    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    /// Unit name, for symbolization.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Executable entry point.
    #[inline]
    pub fn code_base(&self) -> *const u8 {
        self.code.as_ptr()
    }

    /// Emitted code length in bytes.
    #[inline]
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Does `addr` fall inside this unit's code?
    #[inline]
    pub fn contains(&self, addr: *const u8) -> bool {
        self.code.contains(addr)
    }

    /// The storage plan the code was emitted against.
    #[inline]
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Start offset of a block within the code.
    #[inline]
    pub fn block_offset(&self, block: BlockId) -> u32 {
        self.block_ptrs[block.index()]
    }

    /// Code offset where an op's instructions begin.
    #[inline]
    pub fn op_offset(&self, block: BlockId, op: usize) -> u32 {
        self.op_offsets[block.index()][op]
    }

    /// Branch patches recorded during emission (already resolved).
    #[inline]
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Reinterpret the entry point as a callable of type `F`.
    ///
    /// # Safety
    /// `F` must be a function-pointer type matching the compiled unit's
    /// signature under the System V ABI.
    pub unsafe fn entry<F: Copy>(&self) -> F {
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const u8>(),
            "F must be a function pointer"
        );
        let base = self.code.as_ptr();
        unsafe { std::mem::transmute_copy(&base) }
    }
}

// =============================================================================
// Entry Points
// =============================================================================

/// The JIT: owns the cache of compiled units.
#[derive(Default)]
pub struct Jit {
    cache: JitCache,
}

impl Jit {
    pub fn new() -> Self {
        Jit {
            cache: JitCache::new(),
        }
    }

    /// The unit cache.
    #[inline]
    pub fn cache(&self) -> &JitCache {
        &self.cache
    }

    /// Compile `unit` to native code and return its executable entry
    /// point. The state is retained in the cache until [`Jit::free`].
    pub fn compile(&self, unit: &Unit) -> *const u8 {
        let mut plan = Plan::new(unit);
        let mut file = RegisterFile::new();

        if unit.kind() == UnitKind::Function {
            bind_params(unit, &mut plan, &mut file);
        }

        plan::frame::layout_frame(unit, &mut plan);
        plan::analyse::analyse(unit, &mut plan);
        plan::assign::assign_storage(unit, &mut plan, &mut file);

        let mut code = CodeBuffer::new(DEFAULT_CODE_SIZE)
            .unwrap_or_else(|err| panic!("failed to allocate executable memory: {err}"));
        let emitted = emit::emit_unit(unit, &plan, &file, &mut code);

        if verbose_dumps_enabled() {
            let mut annot = CompiledAnnotator {
                storage: PlanAnnotator::new(&plan),
                op_offsets: &emitted.op_offsets,
            };
            let mut text = String::new();
            if unit.dump_with(&mut text, None, &mut annot).is_ok() {
                eprint!("{text}");
            }
        }

        let state = Arc::new(JitState {
            unit_id: unit.id(),
            name: unit.name().into(),
            code,
            plan,
            block_ptrs: emitted.block_ptrs,
            patches: emitted.patches,
            op_offsets: emitted.op_offsets,
        });
        let base = state.code_base();
        self.cache.insert(state);
        base
    }

    /// Find the compiled unit owning `addr` (for stack-trace
    /// symbolization).
    pub fn find(&self, addr: *const u8) -> Option<Arc<JitState>> {
        self.cache.find_by_addr(addr)
    }

    /// Release the unit whose code starts at `code_base`. Its page is
    /// unmapped once the last outstanding handle drops.
    ///
    /// # Panics
    /// Panics if `code_base` does not belong to any cached unit; freeing
    /// unknown code is a programming error.
    pub fn free(&self, code_base: *const u8) {
        let state = match self.cache.find_by_addr(code_base) {
            Some(state) => state,
            None => panic!("{code_base:?} is not in the JIT cache"),
        };
        self.cache.remove(state.unit_id());
    }
}

/// Pre-bind function parameters to their System V argument registers so
/// analysis sees them defined on entry and the allocator keeps them
/// resident while they are live.
fn bind_params(unit: &Unit, plan: &mut Plan, file: &mut RegisterFile) {
    for i in 0..unit.count_params() {
        let reg = RegId(i as u32);
        let gpr = match regs::arg_reg(i) {
            Some(gpr) => gpr,
            None => fatal(
                unit,
                Some(plan),
                None,
                format!("cannot pass parameter {i} in a register"),
            ),
        };
        let state = plan.reg_mut(reg);
        state.flags |= F_PARAMETER;
        state.storage = Storage::Reg(gpr);
        file.assign(gpr, reg);
    }
}

// =============================================================================
// Tests
// =============================================================================
