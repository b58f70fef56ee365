//! Expression code generators.
//!
//! A generator lowers a compiled expression program to machine code for one
//! (element type, vector width) combination. Selection walks the available
//! generators best-first and picks the first one whose type, operation and
//! size support predicates hold for the expression and the host CPU.

pub mod index;
mod scalar_flt;
mod scalar_int;
mod vector_flt;

use crate::error::{CompileError, CompileResult};
use crate::express::{Express, Model, OpKind, VarKind};
use crate::flow::Type;
use crate::masm::MacroAssembler;

pub use index::{AddrOperand, ElementwiseIndexGenerator};
pub use scalar_flt::ScalarFltSse;
pub use scalar_int::ScalarInt;
pub use vector_flt::VectorFltAvx256;

/// CPU features relevant to generator selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuFeature {
    Sse41,
    Avx,
    Avx2,
}

#[cfg(target_arch = "x86_64")]
pub fn cpu_has(feature: CpuFeature) -> bool {
    match feature {
        CpuFeature::Sse41 => std::arch::is_x86_feature_detected!("sse4.1"),
        CpuFeature::Avx => std::arch::is_x86_feature_detected!("avx"),
        CpuFeature::Avx2 => std::arch::is_x86_feature_detected!("avx2"),
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cpu_has(_feature: CpuFeature) -> bool {
    false
}

/// A compiled expression program: the instruction-form expression with
/// section markers and the register count from a dry-run allocation.
pub struct Program {
    pub instrs: Express,
    pub ty: Type,
    /// Number of expression registers needed.
    pub num_regs: usize,
}

impl Program {
    /// Lower an expression into instruction form for a generator: cache
    /// multiply-used operands, lower reductions into accumulator form,
    /// rewrite to the generator's instruction model, and allocate virtual
    /// registers.
    pub fn compile(
        expr: &Express,
        ty: Type,
        generator: &dyn ExpressionGenerator,
    ) -> CompileResult<Program> {
        let mut e = expr.clone();
        e.eliminate_common_subexpressions();
        e.cache_results();
        e.lower_reductions();
        let mut instrs = e.rewrite(&generator.model())?;
        instrs.compute_live_ranges();
        let num_regs = instrs.allocate_registers();
        Ok(Program {
            instrs,
            ty,
            num_regs,
        })
    }

    /// Operation slots in the loop-invariant init section.
    pub fn init_ops(&self) -> &[usize] {
        &self.instrs.order()[..self.instrs.body]
    }

    /// Operation slots in the loop body.
    pub fn body_ops(&self) -> &[usize] {
        &self.instrs.order()[self.instrs.body..self.instrs.tail_start()]
    }

    /// Operation slots in the loop epilogue.
    pub fn tail_ops(&self) -> &[usize] {
        &self.instrs.order()[self.instrs.tail_start()..]
    }

    /// Constant and number variables referenced by the program, in first-use
    /// order.
    pub fn constant_vars(&self) -> Vec<(VarKind, i32)> {
        let mut seen = Vec::new();
        for &op in self.instrs.order() {
            for &arg in &self.instrs.op(op).args {
                let v = self.instrs.var(arg);
                if matches!(v.kind, VarKind::Const | VarKind::Number)
                    && !seen.contains(&(v.kind, v.id))
                {
                    seen.push((v.kind, v.id));
                }
            }
        }
        seen
    }
}

/// Code generator for expressions of one type/width class.
pub trait ExpressionGenerator: Sync {
    /// Generator name, recorded as the step variant.
    fn name(&self) -> &'static str;

    /// Bytes consumed per loop iteration.
    fn vector_size(&self, ty: Type) -> usize;

    /// Instruction model the expression is rewritten against.
    fn model(&self) -> Model;

    fn supported_type(&self, ty: Type) -> bool;

    fn supported_op(&self, op: OpKind, ty: Type) -> bool;

    fn supports_reductions(&self) -> bool {
        true
    }

    /// Check the generator fits the loop size of the prototype.
    fn fits(&self, _elements: i64, _ty: Type) -> bool {
        true
    }

    /// Registers the generator needs for a program, including residents.
    fn register_plan(&self, prog: &Program, index: &ElementwiseIndexGenerator) -> RegisterPlan;

    /// Emit the full expression: init section, loop, body, epilogue.
    fn generate(
        &self,
        prog: &Program,
        index: &mut ElementwiseIndexGenerator,
        masm: &mut MacroAssembler,
    ) -> CompileResult<()>;
}

/// Resolved operand of an expression instruction.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Opnd {
    /// Expression register index; mapped to a physical register by the
    /// generator's bank.
    Temp(i32),
    /// Physical register holding a loop-resident value.
    Phys(u8),
    /// Memory operand.
    Mem(AddrOperand),
}

/// Little-endian bytes of a system number in a given element type.
pub(crate) fn number_bytes(ty: Type, id: i32) -> Vec<u8> {
    let value = crate::express::number_value(id);
    match ty {
        Type::Float32 => (value as f32).to_le_bytes().to_vec(),
        Type::Float64 => value.to_le_bytes().to_vec(),
        Type::Int32 => (value as i32).to_le_bytes().to_vec(),
        Type::Int64 => (value as i64).to_le_bytes().to_vec(),
        Type::Int16 => (value as i16).to_le_bytes().to_vec(),
        Type::Int8 => (value as i8).to_le_bytes().to_vec(),
        Type::Uint8 => (value as u8).to_le_bytes().to_vec(),
        Type::Uint16 => (value as u16).to_le_bytes().to_vec(),
        Type::Bool => vec![(value != 0.0) as u8],
    }
}

/// Resolve one argument of an instruction to a register or memory operand.
pub(crate) fn operand(
    prog: &Program,
    op_ref: usize,
    argnum: usize,
    index: &ElementwiseIndexGenerator,
    residents: &std::collections::HashMap<(VarKind, i32), u8>,
    masm: &mut MacroAssembler,
) -> CompileResult<Opnd> {
    let op = prog.instrs.op(op_ref);
    let arg = op.args[argnum];
    let v = prog.instrs.var(arg);
    if v.kind == VarKind::Temp {
        let reg = if op.first_is_dest {
            match argnum {
                0 => op.dst,
                1 => op.src,
                _ => op.src2,
            }
        } else {
            match argnum {
                0 => op.src,
                _ => op.src2,
            }
        };
        if reg < 0 {
            return Err(CompileError::RegisterOverflow {
                step: index.step_name().to_string(),
            });
        }
        return Ok(Opnd::Temp(reg));
    }
    if let Some(&phys) = residents.get(&(v.kind, v.id)) {
        return Ok(Opnd::Phys(phys));
    }
    if v.kind == VarKind::Number {
        let bytes = number_bytes(prog.ty, v.id);
        return Ok(Opnd::Mem(AddrOperand::Label(masm.pool_constant(&bytes))));
    }
    Ok(Opnd::Mem(index.addr(v.kind, v.id)?))
}

/// How many registers a generator needs from each bank.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterPlan {
    pub simd_temps: usize,
    pub simd_aux: usize,
    pub gp_temps: usize,
    pub gp_aux: usize,
}

static VECTOR_FLT_AVX256: VectorFltAvx256 = VectorFltAvx256;
static SCALAR_FLT_SSE: ScalarFltSse = ScalarFltSse;
static SCALAR_INT: ScalarInt = ScalarInt;

/// All generators in selection preference order: widest first.
fn generators() -> [&'static dyn ExpressionGenerator; 3] {
    [&VECTOR_FLT_AVX256, &SCALAR_FLT_SSE, &SCALAR_INT]
}

/// Select the best available generator for an expression. `elements` is the
/// inner loop size: the minimum common size between the prototype and all
/// non-scalar inputs.
pub fn select(
    expr: &Express,
    ty: Type,
    elements: i64,
) -> Option<&'static dyn ExpressionGenerator> {
    let has_reduction = expr.has_reduction();
    'outer: for generator in generators() {
        if !generator.supported_type(ty) {
            continue;
        }
        if has_reduction && !generator.supports_reductions() {
            continue;
        }
        if !generator.fits(elements, ty) {
            continue;
        }
        for &op in expr.order() {
            let kind = expr.op(op).kind;
            let probe = if kind.is_reduction() {
                kind.accumulator()
            } else {
                kind
            };
            if probe != OpKind::Mov && !generator.supported_op(probe, ty) {
                continue 'outer;
            }
        }
        return Some(generator);
    }
    None
}

/// Selection failure with a readable reason, for error reporting.
pub fn select_or_explain(
    expr: &Express,
    ty: Type,
    elements: i64,
    step: &str,
) -> CompileResult<&'static dyn ExpressionGenerator> {
    select(expr, ty, elements).ok_or_else(|| CompileError::UnsupportedExpression {
        step: step.to_string(),
        reason: format!("no generator for type {} and recipe {}", ty, expr.as_recipe()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(recipe: &str) -> Express {
        let mut e = Express::new();
        e.parse(recipe).unwrap();
        e
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_select_prefers_vector_for_large_float() {
        let expr = parse("@0=Add(%0,%1)");
        let generator = select(&expr, Type::Float32, 128).unwrap();
        if cpu_has(CpuFeature::Avx) {
            assert_eq!(generator.name(), "VFltAVX256");
        } else {
            assert_eq!(generator.name(), "FltSSE");
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_select_scalar_for_reductions() {
        let expr = parse("@0=Sum(%0)");
        let generator = select(&expr, Type::Float32, 1024).unwrap();
        assert_eq!(generator.name(), "FltSSE");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_select_int_generator() {
        let expr = parse("@0=Add(%0,%1)");
        let generator = select(&expr, Type::Int32, 16).unwrap();
        assert_eq!(generator.name(), "IntScalar");
    }

    #[test]
    fn test_select_rejects_transcendentals() {
        let expr = parse("@0=Tanh(%0)");
        assert!(select(&expr, Type::Float32, 16).is_none());
    }

    #[test]
    fn test_program_sections() {
        let generator: &dyn ExpressionGenerator = &SCALAR_FLT_SSE;
        let expr = parse("@0=Sum(%0)");
        let prog = Program::compile(&expr, Type::Float32, generator).unwrap();
        assert!(!prog.init_ops().is_empty());
        assert!(!prog.body_ops().is_empty());
        assert!(!prog.tail_ops().is_empty());
    }
}
