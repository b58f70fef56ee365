//! Scalar float expression generator using SSE XMM scalar operations.
//!
//! Processes one f32 or f64 element per iteration. This is the fallback
//! generator for float expressions and the only bundled float generator
//! that handles reductions, using a register accumulator seeded before the
//! loop and stored after it.

use std::collections::HashMap;

use iced_x86::code_asm::{dword_ptr, qword_ptr, AsmMemoryOperand};

use crate::error::{CompileError, CompileResult};
use crate::express::{Model, OpKind, VarKind, NUM_ONE, NUM_ZERO};
use crate::flow::Type;
use crate::masm::{gp, xmm, MacroAssembler};

use super::index::{AddrOperand, ElementwiseIndexGenerator};
use super::{cpu_has, number_bytes, operand, CpuFeature, ExpressionGenerator, Opnd, Program, RegisterPlan};

pub(crate) fn mem4(a: &AddrOperand) -> AsmMemoryOperand {
    match *a {
        AddrOperand::Mem { base, disp, index } => match index {
            Some(i) => dword_ptr(gp(base) + gp(i) + disp),
            None => dword_ptr(gp(base) + disp),
        },
        AddrOperand::Label(l) => dword_ptr(l),
    }
}

pub(crate) fn mem8(a: &AddrOperand) -> AsmMemoryOperand {
    match *a {
        AddrOperand::Mem { base, disp, index } => match index {
            Some(i) => qword_ptr(gp(base) + gp(i) + disp),
            None => qword_ptr(gp(base) + disp),
        },
        AddrOperand::Label(l) => qword_ptr(l),
    }
}

/// Two-operand scalar float op: dst = op(dst, src).
macro_rules! sse_op {
    ($masm:ident, $ty:expr, $dst:expr, $src:expr, $index:expr, $op32:ident, $op64:ident) => {
        match ($ty, $src) {
            (Type::Float32, Opnd::Temp(r)) => $masm.asm().$op32(xmm($dst), xmm($index.simd(r)))?,
            (Type::Float32, Opnd::Phys(r)) => $masm.asm().$op32(xmm($dst), xmm(r))?,
            (Type::Float32, Opnd::Mem(m)) => $masm.asm().$op32(xmm($dst), mem4(&m))?,
            (_, Opnd::Temp(r)) => $masm.asm().$op64(xmm($dst), xmm($index.simd(r)))?,
            (_, Opnd::Phys(r)) => $masm.asm().$op64(xmm($dst), xmm(r))?,
            (_, Opnd::Mem(m)) => $masm.asm().$op64(xmm($dst), mem8(&m))?,
        }
    };
}

/// Scalar float comparison with predicate immediate.
macro_rules! sse_cmp {
    ($masm:ident, $ty:expr, $dst:expr, $src:expr, $index:expr, $pred:expr) => {
        match ($ty, $src) {
            (Type::Float32, Opnd::Temp(r)) => {
                $masm.asm().cmpss(xmm($dst), xmm($index.simd(r)), $pred)?
            }
            (Type::Float32, Opnd::Phys(r)) => $masm.asm().cmpss(xmm($dst), xmm(r), $pred)?,
            (Type::Float32, Opnd::Mem(m)) => $masm.asm().cmpss(xmm($dst), mem4(&m), $pred)?,
            (_, Opnd::Temp(r)) => $masm.asm().cmpsd_3(xmm($dst), xmm($index.simd(r)), $pred)?,
            (_, Opnd::Phys(r)) => $masm.asm().cmpsd_3(xmm($dst), xmm(r), $pred)?,
            (_, Opnd::Mem(m)) => $masm.asm().cmpsd_3(xmm($dst), mem8(&m), $pred)?,
        }
    };
}

/// Scalar float expression generator for SSE.
pub struct ScalarFltSse;

impl ScalarFltSse {
    /// Ops that need the scratch auxiliary register.
    fn needs_scratch(prog: &Program) -> bool {
        prog.instrs.order().iter().any(|&op| {
            matches!(
                prog.instrs.op(op).kind,
                OpKind::Rsqrt
                    | OpKind::Neg
                    | OpKind::Abs
                    | OpKind::Not
                    | OpKind::And
                    | OpKind::Or
                    | OpKind::AndNot
            )
        })
    }

    /// Constants hoisted into registers for the whole loop, bounded by the
    /// SIMD register headroom left after expression temporaries.
    fn residents(&self, prog: &Program, index: &ElementwiseIndexGenerator) -> Vec<(VarKind, i32)> {
        let scratch = Self::needs_scratch(prog) as usize;
        let spare = 16usize.saturating_sub(prog.num_regs + scratch);
        prog.constant_vars()
            .into_iter()
            .filter(|&(kind, id)| match kind {
                VarKind::Number => true,
                VarKind::Const => index.is_scalar_var(kind, id),
                _ => false,
            })
            .take(spare)
            .collect()
    }

    /// Move the unary source into the destination register.
    fn load_unary_src(
        &self,
        prog: &Program,
        op_ref: usize,
        dst: u8,
        index: &ElementwiseIndexGenerator,
        residents: &HashMap<(VarKind, i32), u8>,
        masm: &mut MacroAssembler,
    ) -> CompileResult<()> {
        let ty = prog.ty;
        match operand(prog, op_ref, 0, index, residents, masm)? {
            Opnd::Temp(r) => {
                let r = index.simd(r);
                if r != dst {
                    masm.asm().movaps(xmm(dst), xmm(r))?;
                }
            }
            Opnd::Phys(r) => masm.asm().movaps(xmm(dst), xmm(r))?,
            Opnd::Mem(m) => match ty {
                Type::Float32 => masm.asm().movss(xmm(dst), mem4(&m))?,
                _ => masm.asm().movsd_2(xmm(dst), mem8(&m))?,
            },
        }
        Ok(())
    }

    /// Force the second operand of a 128-bit logical op into a register.
    fn logic_src(
        &self,
        prog: &Program,
        op_ref: usize,
        scratch: u8,
        index: &ElementwiseIndexGenerator,
        residents: &HashMap<(VarKind, i32), u8>,
        masm: &mut MacroAssembler,
    ) -> CompileResult<u8> {
        Ok(match operand(prog, op_ref, 1, index, residents, masm)? {
            Opnd::Temp(r) => index.simd(r),
            Opnd::Phys(r) => r,
            Opnd::Mem(m) => {
                match prog.ty {
                    Type::Float32 => masm.asm().movss(xmm(scratch), mem4(&m))?,
                    _ => masm.asm().movsd_2(xmm(scratch), mem8(&m))?,
                }
                scratch
            }
        })
    }

    fn emit_op(
        &self,
        prog: &Program,
        op_ref: usize,
        index: &ElementwiseIndexGenerator,
        residents: &HashMap<(VarKind, i32), u8>,
        masm: &mut MacroAssembler,
    ) -> CompileResult<()> {
        let ty = prog.ty;
        let kind = prog.instrs.op(op_ref).kind;
        let scratch = if index.num_simd_aux() > 0 {
            index.simd_aux(0)
        } else {
            0
        };
        match kind {
            OpKind::Mov => {
                let op = prog.instrs.op(op_ref);
                if op.nop() {
                    return Ok(());
                }
                let result = op.result.expect("move without result");
                let rv = prog.instrs.var(result);
                if rv.kind == VarKind::Temp {
                    let dst = index.simd(op.dst);
                    self.load_unary_src(prog, op_ref, dst, index, residents, masm)?;
                } else {
                    // Store to the output operand.
                    let m = index.addr(rv.kind, rv.id)?;
                    match operand(prog, op_ref, 0, index, residents, masm)? {
                        Opnd::Temp(r) => match ty {
                            Type::Float32 => masm.asm().movss(mem4(&m), xmm(index.simd(r)))?,
                            _ => masm.asm().movsd_2(mem8(&m), xmm(index.simd(r)))?,
                        },
                        Opnd::Phys(r) => match ty {
                            Type::Float32 => masm.asm().movss(mem4(&m), xmm(r))?,
                            _ => masm.asm().movsd_2(mem8(&m), xmm(r))?,
                        },
                        Opnd::Mem(_) => {
                            return Err(CompileError::Encoding(
                                "memory to memory move in expression".to_string(),
                            ))
                        }
                    }
                }
            }
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::Minimum
            | OpKind::Maximum => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let src = operand(prog, op_ref, 1, index, residents, masm)?;
                match kind {
                    OpKind::Add => sse_op!(masm, ty, dst, src, index, addss, addsd),
                    OpKind::Sub => sse_op!(masm, ty, dst, src, index, subss, subsd),
                    OpKind::Mul => sse_op!(masm, ty, dst, src, index, mulss, mulsd),
                    OpKind::Div => sse_op!(masm, ty, dst, src, index, divss, divsd),
                    OpKind::Minimum => sse_op!(masm, ty, dst, src, index, minss, minsd),
                    _ => sse_op!(masm, ty, dst, src, index, maxss, maxsd),
                }
            }
            OpKind::Equal
            | OpKind::NotEqual
            | OpKind::Less
            | OpKind::LessEqual
            | OpKind::Greater
            | OpKind::GreaterEqual => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let src = operand(prog, op_ref, 1, index, residents, masm)?;
                let pred = match kind {
                    OpKind::Equal => 0,
                    OpKind::Less => 1,
                    OpKind::LessEqual => 2,
                    OpKind::NotEqual => 4,
                    OpKind::GreaterEqual => 5,
                    _ => 6,
                };
                sse_cmp!(masm, ty, dst, src, index, pred);
            }
            OpKind::And | OpKind::Or | OpKind::AndNot => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let src = self.logic_src(prog, op_ref, scratch, index, residents, masm)?;
                match kind {
                    OpKind::And => masm.asm().andps(xmm(dst), xmm(src))?,
                    OpKind::Or => masm.asm().orps(xmm(dst), xmm(src))?,
                    _ => masm.asm().andnps(xmm(dst), xmm(src))?,
                }
            }
            OpKind::Relu => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                self.load_unary_src(prog, op_ref, dst, index, residents, masm)?;
                let zero = masm.pool_constant(&number_bytes(ty, NUM_ZERO));
                match ty {
                    Type::Float32 => masm.asm().maxss(xmm(dst), dword_ptr(zero))?,
                    _ => masm.asm().maxsd(xmm(dst), qword_ptr(zero))?,
                }
            }
            OpKind::Neg | OpKind::Abs => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                self.load_unary_src(prog, op_ref, dst, index, residents, masm)?;
                masm.asm().xorps(xmm(scratch), xmm(scratch))?;
                match ty {
                    Type::Float32 => masm.asm().subss(xmm(scratch), xmm(dst))?,
                    _ => masm.asm().subsd(xmm(scratch), xmm(dst))?,
                }
                if kind == OpKind::Neg {
                    masm.asm().movaps(xmm(dst), xmm(scratch))?;
                } else {
                    // abs(x) = max(x, -x)
                    match ty {
                        Type::Float32 => masm.asm().maxss(xmm(dst), xmm(scratch))?,
                        _ => masm.asm().maxsd(xmm(dst), xmm(scratch))?,
                    }
                }
            }
            OpKind::Not => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                self.load_unary_src(prog, op_ref, dst, index, residents, masm)?;
                masm.asm().pcmpeqd(xmm(scratch), xmm(scratch))?;
                masm.asm().xorps(xmm(dst), xmm(scratch))?;
            }
            OpKind::Sqrt => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let src = operand(prog, op_ref, 0, index, residents, masm)?;
                sse_op!(masm, ty, dst, src, index, sqrtss, sqrtsd);
            }
            OpKind::Reciprocal => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let one = masm.pool_constant(&number_bytes(ty, NUM_ONE));
                match ty {
                    Type::Float32 => masm.asm().movss(xmm(dst), dword_ptr(one))?,
                    _ => masm.asm().movsd_2(xmm(dst), qword_ptr(one))?,
                }
                let src = operand(prog, op_ref, 0, index, residents, masm)?;
                sse_op!(masm, ty, dst, src, index, divss, divsd);
            }
            OpKind::Rsqrt => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let src = operand(prog, op_ref, 0, index, residents, masm)?;
                sse_op!(masm, ty, dst, src, index, sqrtss, sqrtsd);
                let one = masm.pool_constant(&number_bytes(ty, NUM_ONE));
                match ty {
                    Type::Float32 => {
                        masm.asm().movss(xmm(scratch), dword_ptr(one))?;
                        masm.asm().divss(xmm(scratch), xmm(dst))?;
                    }
                    _ => {
                        masm.asm().movsd_2(xmm(scratch), qword_ptr(one))?;
                        masm.asm().divsd(xmm(scratch), xmm(dst))?;
                    }
                }
                masm.asm().movaps(xmm(dst), xmm(scratch))?;
            }
            OpKind::Floor => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let src = operand(prog, op_ref, 0, index, residents, masm)?;
                match (ty, src) {
                    (Type::Float32, Opnd::Temp(r)) => {
                        masm.asm().roundss(xmm(dst), xmm(index.simd(r)), 1)?
                    }
                    (Type::Float32, Opnd::Phys(r)) => masm.asm().roundss(xmm(dst), xmm(r), 1)?,
                    (Type::Float32, Opnd::Mem(m)) => masm.asm().roundss(xmm(dst), mem4(&m), 1)?,
                    (_, Opnd::Temp(r)) => masm.asm().roundsd(xmm(dst), xmm(index.simd(r)), 1)?,
                    (_, Opnd::Phys(r)) => masm.asm().roundsd(xmm(dst), xmm(r), 1)?,
                    (_, Opnd::Mem(m)) => masm.asm().roundsd(xmm(dst), mem8(&m), 1)?,
                }
            }
            other => {
                return Err(CompileError::UnsupportedExpression {
                    step: index.step_name().to_string(),
                    reason: format!("operation {} not supported by {}", other.name(), self.name()),
                })
            }
        }
        Ok(())
    }
}

impl ExpressionGenerator for ScalarFltSse {
    fn name(&self) -> &'static str {
        "FltSSE"
    }

    fn vector_size(&self, ty: Type) -> usize {
        ty.size()
    }

    fn model(&self) -> Model {
        Model {
            mov_reg_reg: true,
            mov_reg_mem: true,
            mov_mem_reg: true,
            op_reg_reg: true,
            op_reg_mem: true,
            func_reg_reg: true,
            func_reg_mem: true,
            ..Default::default()
        }
    }

    fn supported_type(&self, ty: Type) -> bool {
        matches!(ty, Type::Float32 | Type::Float64)
    }

    fn supported_op(&self, op: OpKind, _ty: Type) -> bool {
        match op {
            OpKind::Mov
            | OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::Div
            | OpKind::Minimum
            | OpKind::Maximum
            | OpKind::Neg
            | OpKind::Abs
            | OpKind::Relu
            | OpKind::Sqrt
            | OpKind::Rsqrt
            | OpKind::Reciprocal
            | OpKind::Equal
            | OpKind::NotEqual
            | OpKind::Less
            | OpKind::LessEqual
            | OpKind::Greater
            | OpKind::GreaterEqual
            | OpKind::And
            | OpKind::Or
            | OpKind::AndNot
            | OpKind::Not => true,
            OpKind::Floor => cpu_has(CpuFeature::Sse41),
            _ => false,
        }
    }

    fn register_plan(&self, prog: &Program, index: &ElementwiseIndexGenerator) -> RegisterPlan {
        let scratch = Self::needs_scratch(prog) as usize;
        RegisterPlan {
            simd_temps: prog.num_regs,
            simd_aux: scratch + self.residents(prog, index).len(),
            gp_temps: 0,
            gp_aux: 0,
        }
    }

    fn generate(
        &self,
        prog: &Program,
        index: &mut ElementwiseIndexGenerator,
        masm: &mut MacroAssembler,
    ) -> CompileResult<()> {
        let scratch = Self::needs_scratch(prog) as usize;
        let resident_list = self.residents(prog, index);
        let mut residents = HashMap::new();
        for (i, &key) in resident_list.iter().enumerate() {
            residents.insert(key, index.simd_aux(scratch + i));
        }

        // Load loop-resident constants.
        for &(kind, id) in &resident_list {
            let phys = residents[&(kind, id)];
            let m = if kind == VarKind::Number {
                AddrOperand::Label(masm.pool_constant(&number_bytes(prog.ty, id)))
            } else {
                index.addr(kind, id)?
            };
            match prog.ty {
                Type::Float32 => masm.asm().movss(xmm(phys), mem4(&m))?,
                _ => masm.asm().movsd_2(xmm(phys), mem8(&m))?,
            }
        }

        for &op in prog.init_ops() {
            self.emit_op(prog, op, index, &residents, masm)?;
        }
        index.begin_loop(masm)?;
        for &op in prog.body_ops() {
            self.emit_op(prog, op, index, &residents, masm)?;
        }
        index.end_loop(masm)?;
        for &op in prog.tail_ops() {
            self.emit_op(prog, op, index, &residents, masm)?;
        }
        Ok(())
    }
}
