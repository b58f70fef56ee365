//! Element-wise index generation.
//!
//! The index generator produces the per-lane addressing for element-wise
//! expression loops: one byte offset register walks the output, operands the
//! same size as the prototype follow it, smaller operands wrap around with
//! their own offset register, and scalars are addressed without an index.

use iced_x86::code_asm::CodeLabel;

use crate::error::{CompileError, CompileResult};
use crate::express::VarKind;
use crate::flow::Type;
use crate::masm::{gp, MacroAssembler, INSTANCE_REGISTER};
use crate::network::{Network, StepId};
use crate::tensor::TensorId;

/// Iteration behavior for one operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterKind {
    /// Same extent as the prototype; follows the main offset register.
    Simple,
    /// Single element; addressed without an index.
    Scalar,
    /// Smaller extent dividing the prototype; wraps with its own register.
    Repeat,
}

/// Address of one operand lane: either a memory reference relative to a
/// base register or a RIP-relative constant-pool label.
#[derive(Clone, Copy, Debug)]
pub enum AddrOperand {
    Mem {
        base: u8,
        disp: i32,
        index: Option<u8>,
    },
    Label(CodeLabel),
}

#[derive(Clone, Debug)]
struct Locator {
    tensor: TensorId,
    kind: IterKind,
    /// Iteration extent in bytes.
    bytes: usize,
    /// Base register for constants and references.
    needs_base: bool,
    base: Option<u8>,
    repeat_reg: Option<u8>,
    /// Displacement from the instance register when no base is needed.
    instance_offset: i32,
}

/// Index generator for element-wise loops over a step's operands.
pub struct ElementwiseIndexGenerator {
    step_name: String,
    ty: Type,
    /// Total bytes to iterate over, from the prototype's aligned size.
    loop_bytes: usize,
    vecsize: usize,
    single: bool,
    inputs: Vec<Locator>,
    outputs: Vec<Locator>,
    offset_reg: Option<u8>,
    simd_regs: Vec<u8>,
    simd_aux: Vec<u8>,
    gp_regs: Vec<u8>,
    gp_aux: Vec<u8>,
    begin: Option<CodeLabel>,
}

impl ElementwiseIndexGenerator {
    /// Build locators for a step. The prototype is the first output, or the
    /// first non-scalar input when the output is a scalar (reductions).
    pub fn new(net: &Network, step: StepId) -> CompileResult<ElementwiseIndexGenerator> {
        let s = net.step(step);
        let step_name = s.name.clone();
        let unsupported = |reason: String| CompileError::UnsupportedExpression {
            step: step_name.clone(),
            reason,
        };

        let assign_target = s.outdegree() == 0;
        let out0 = if assign_target {
            *s.inputs.first().ok_or_else(|| {
                unsupported("assignment step without target".to_string())
            })?
        } else {
            s.outputs[0]
        };
        let mut proto = out0;
        if net.tensor(out0).is_scalar() {
            for &input in &s.inputs {
                if !net.tensor(input).is_scalar() {
                    proto = input;
                    break;
                }
            }
        }
        let ty = net.tensor(proto).ty;
        let loop_bytes = net.tensor(proto).size;

        let locate = |id: TensorId, output: bool| -> CompileResult<Locator> {
            let t = net.tensor(id);
            let bytes = t.size;
            let kind = if t.is_scalar() {
                IterKind::Scalar
            } else if bytes == loop_bytes {
                IterKind::Simple
            } else if !output && bytes > 0 && loop_bytes % bytes == 0 {
                IterKind::Repeat
            } else {
                return Err(unsupported(format!(
                    "operand {} does not broadcast over the loop",
                    t.name
                )));
            };
            let needs_base = t.is_constant() || t.is_ref;
            let instance_offset = if needs_base {
                0
            } else {
                t.offset.unwrap_or(0) as i32
            };
            Ok(Locator {
                tensor: id,
                kind,
                bytes,
                needs_base,
                base: None,
                repeat_reg: None,
                instance_offset,
            })
        };

        let mut inputs = Vec::with_capacity(s.indegree());
        for &input in &s.inputs {
            inputs.push(locate(input, false)?);
        }
        let mut outputs = Vec::new();
        if assign_target {
            outputs.push(locate(s.inputs[0], true)?);
        } else {
            for &output in &s.outputs {
                outputs.push(locate(output, true)?);
            }
        }

        Ok(ElementwiseIndexGenerator {
            step_name,
            ty,
            loop_bytes,
            vecsize: ty.size(),
            single: false,
            inputs,
            outputs,
            offset_reg: None,
            simd_regs: Vec::new(),
            simd_aux: Vec::new(),
            gp_regs: Vec::new(),
            gp_aux: Vec::new(),
            begin: None,
        })
    }

    /// Set the bytes consumed per loop iteration.
    pub fn set_vector_size(&mut self, vecsize: usize) {
        self.vecsize = vecsize;
        self.single = self.loop_bytes <= vecsize;
    }

    pub fn element_type(&self) -> Type {
        self.ty
    }

    pub fn loop_bytes(&self) -> usize {
        self.loop_bytes
    }

    /// Whether only one iteration is needed.
    pub fn single(&self) -> bool {
        self.single
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Whether an expression variable is a scalar operand.
    pub fn is_scalar_var(&self, kind: VarKind, id: i32) -> bool {
        match self.locator(kind, id) {
            Some(loc) => loc.kind == IterKind::Scalar,
            None => false,
        }
    }

    fn locator(&self, kind: VarKind, id: i32) -> Option<&Locator> {
        match kind {
            VarKind::Input | VarKind::Const => self.inputs.get(id as usize),
            VarKind::Output => self.outputs.get(id as usize),
            _ => None,
        }
    }

    /// Number of general-purpose registers the loop addressing needs.
    pub fn register_demand(&self) -> usize {
        let bases = self
            .inputs
            .iter()
            .chain(&self.outputs)
            .filter(|l| l.needs_base)
            .count();
        let repeats = self
            .inputs
            .iter()
            .filter(|l| l.kind == IterKind::Repeat)
            .count();
        // Offset register, bases, repeat counters, instance register.
        1 + bases + repeats + 1
    }

    /// Allocate all loop registers: the offset register, operand bases,
    /// repeat counters, and the expression registers requested by the
    /// generator.
    pub fn allocate_registers(
        &mut self,
        masm: &mut MacroAssembler,
        simd_temps: usize,
        simd_aux: usize,
        gp_temps: usize,
        gp_aux: usize,
    ) -> CompileResult<()> {
        let step = self.step_name.clone();
        let overflow = || CompileError::RegisterOverflow { step: step.clone() };
        if !self.single {
            self.offset_reg = Some(masm.rr().alloc().ok_or_else(overflow)?);
        }
        for loc in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if loc.needs_base && loc.base.is_none() {
                loc.base = Some(masm.rr().alloc().ok_or_else(overflow)?);
            }
            if loc.kind == IterKind::Repeat && loc.repeat_reg.is_none() {
                loc.repeat_reg = Some(masm.rr().alloc().ok_or_else(overflow)?);
            }
        }
        for _ in 0..simd_temps {
            let r = masm.mm().alloc().ok_or_else(overflow)?;
            self.simd_regs.push(r);
        }
        for _ in 0..simd_aux {
            let r = masm.mm().alloc().ok_or_else(overflow)?;
            self.simd_aux.push(r);
        }
        for _ in 0..gp_temps {
            let r = masm.rr().alloc().ok_or_else(overflow)?;
            self.gp_regs.push(r);
        }
        for _ in 0..gp_aux {
            let r = masm.rr().alloc().ok_or_else(overflow)?;
            self.gp_aux.push(r);
        }
        Ok(())
    }

    /// SIMD register for an expression register index.
    pub fn simd(&self, idx: i32) -> u8 {
        self.simd_regs[idx as usize]
    }

    /// Auxiliary SIMD register.
    pub fn simd_aux(&self, idx: usize) -> u8 {
        self.simd_aux[idx]
    }

    pub fn num_simd_aux(&self) -> usize {
        self.simd_aux.len()
    }

    /// General-purpose register for an expression register index.
    pub fn gp_temp(&self, idx: i32) -> u8 {
        self.gp_regs[idx as usize]
    }

    /// Auxiliary general-purpose register.
    pub fn gp_aux(&self, idx: usize) -> u8 {
        self.gp_aux[idx]
    }

    /// Load base registers for constant and reference operands.
    pub fn emit_base_loads(&self, net: &Network, masm: &mut MacroAssembler) -> CompileResult<()> {
        for loc in self.inputs.iter().chain(&self.outputs) {
            if let Some(base) = loc.base {
                masm.load_tensor_address(base, net.tensor(loc.tensor))?;
            }
        }
        Ok(())
    }

    /// Start the loop: clear index registers and bind the loop label.
    pub fn begin_loop(&mut self, masm: &mut MacroAssembler) -> CompileResult<()> {
        if self.single {
            return Ok(());
        }
        let ofs = self.offset_reg.expect("loop without offset register");
        masm.asm().xor(gp(ofs), gp(ofs))?;
        for loc in self.inputs.iter().chain(&self.outputs) {
            if let Some(repeat) = loc.repeat_reg {
                masm.asm().xor(gp(repeat), gp(repeat))?;
            }
        }
        let mut begin = masm.create_label();
        masm.bind(&mut begin)?;
        self.begin = Some(begin);
        Ok(())
    }

    /// Finish the loop: advance and wrap repeat counters, advance the main
    /// offset, and branch back while there are elements left.
    pub fn end_loop(&mut self, masm: &mut MacroAssembler) -> CompileResult<()> {
        if self.single {
            return Ok(());
        }
        let vec = self.vecsize as i32;
        for loc in self.inputs.clone() {
            if let Some(repeat) = loc.repeat_reg {
                masm.asm().add(gp(repeat), vec)?;
                masm.asm().cmp(gp(repeat), loc.bytes as i32)?;
                let mut keep = masm.create_label();
                masm.asm().jb(keep)?;
                masm.asm().xor(gp(repeat), gp(repeat))?;
                masm.bind(&mut keep)?;
            }
        }
        let ofs = self.offset_reg.expect("loop without offset register");
        masm.asm().add(gp(ofs), vec)?;
        masm.asm().cmp(gp(ofs), self.loop_bytes as i32)?;
        let begin = self.begin.expect("loop not started");
        masm.asm().jb(begin)?;
        Ok(())
    }

    /// Memory operand for an expression variable.
    pub fn addr(&self, kind: VarKind, id: i32) -> CompileResult<AddrOperand> {
        let loc = self.locator(kind, id).ok_or_else(|| {
            CompileError::UnsupportedExpression {
                step: self.step_name.clone(),
                reason: format!("expression variable {kind:?} {id} out of range"),
            }
        })?;
        let (base, disp) = match loc.base {
            Some(base) => (base, 0),
            None => (INSTANCE_REGISTER, loc.instance_offset),
        };
        let index = match loc.kind {
            IterKind::Scalar => None,
            IterKind::Simple => {
                if self.single {
                    None
                } else {
                    self.offset_reg
                }
            }
            IterKind::Repeat => loc.repeat_reg,
        };
        Ok(AddrOperand::Mem { base, disp, index })
    }
}
