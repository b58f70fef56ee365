//! Scalar integer expression generator using general-purpose registers.
//!
//! Processes one i32 or i64 element per iteration. Expression temporaries
//! live in general-purpose registers, which is also why no constants are
//! hoisted: the remaining registers are needed for loop indexing.

use std::collections::HashMap;

use crate::error::{CompileError, CompileResult};
use crate::express::{Model, OpKind, VarKind};
use crate::flow::Type;
use crate::masm::{gp, gp32, MacroAssembler};

use super::index::ElementwiseIndexGenerator;
use super::scalar_flt::{mem4, mem8};
use super::{operand, ExpressionGenerator, Opnd, Program, RegisterPlan};

/// Two-operand integer op: dst = op(dst, src).
macro_rules! int_op {
    ($masm:ident, $ty:expr, $dst:expr, $src:expr, $index:expr, $op:ident) => {
        match ($ty, $src) {
            (Type::Int32, Opnd::Temp(r)) => {
                $masm.asm().$op(gp32($dst), gp32($index.gp_temp(r)))?
            }
            (Type::Int32, Opnd::Phys(r)) => $masm.asm().$op(gp32($dst), gp32(r))?,
            (Type::Int32, Opnd::Mem(m)) => $masm.asm().$op(gp32($dst), mem4(&m))?,
            (_, Opnd::Temp(r)) => $masm.asm().$op(gp($dst), gp($index.gp_temp(r)))?,
            (_, Opnd::Phys(r)) => $masm.asm().$op(gp($dst), gp(r))?,
            (_, Opnd::Mem(m)) => $masm.asm().$op(gp($dst), mem8(&m))?,
        }
    };
}

/// Scalar integer expression generator.
pub struct ScalarInt;

impl ScalarInt {
    fn needs_aux(prog: &Program) -> bool {
        prog.instrs
            .order()
            .iter()
            .any(|&op| prog.instrs.op(op).kind == OpKind::Abs)
    }

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
                let r = index.gp_temp(r);
                if r != dst {
                    match ty {
                        Type::Int32 => masm.asm().mov(gp32(dst), gp32(r))?,
                        _ => masm.asm().mov(gp(dst), gp(r))?,
                    }
                }
            }
            Opnd::Phys(r) => match ty {
                Type::Int32 => masm.asm().mov(gp32(dst), gp32(r))?,
                _ => masm.asm().mov(gp(dst), gp(r))?,
            },
            Opnd::Mem(m) => match ty {
                Type::Int32 => masm.asm().mov(gp32(dst), mem4(&m))?,
                _ => masm.asm().mov(gp(dst), mem8(&m))?,
            },
        }
        Ok(())
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
        match kind {
            OpKind::Mov => {
                let op = prog.instrs.op(op_ref);
                if op.nop() {
                    return Ok(());
                }
                let result = op.result.expect("move without result");
                let rv = prog.instrs.var(result);
                if rv.kind == VarKind::Temp {
                    let dst = index.gp_temp(op.dst);
                    self.load_unary_src(prog, op_ref, dst, index, residents, masm)?;
                } else {
                    let m = index.addr(rv.kind, rv.id)?;
                    match operand(prog, op_ref, 0, index, residents, masm)? {
                        Opnd::Temp(r) => match ty {
                            Type::Int32 => masm.asm().mov(mem4(&m), gp32(index.gp_temp(r)))?,
                            _ => masm.asm().mov(mem8(&m), gp(index.gp_temp(r)))?,
                        },
                        Opnd::Phys(r) => match ty {
                            Type::Int32 => masm.asm().mov(mem4(&m), gp32(r))?,
                            _ => masm.asm().mov(mem8(&m), gp(r))?,
                        },
                        Opnd::Mem(_) => {
                            return Err(CompileError::Encoding(
                                "memory to memory move in expression".to_string(),
                            ))
                        }
                    }
                }
            }
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::And | OpKind::Or => {
                let op = prog.instrs.op(op_ref);
                let dst = index.gp_temp(op.dst);
                let src = operand(prog, op_ref, 1, index, residents, masm)?;
                match kind {
                    OpKind::Add => int_op!(masm, ty, dst, src, index, add),
                    OpKind::Sub => int_op!(masm, ty, dst, src, index, sub),
                    OpKind::Mul => int_op!(masm, ty, dst, src, index, imul_2),
                    OpKind::And => int_op!(masm, ty, dst, src, index, and),
                    _ => int_op!(masm, ty, dst, src, index, or),
                }
            }
            OpKind::AndNot => {
                // Arguments arrive swapped, so dst holds the negated side.
                let op = prog.instrs.op(op_ref);
                let dst = index.gp_temp(op.dst);
                match ty {
                    Type::Int32 => masm.asm().not(gp32(dst))?,
                    _ => masm.asm().not(gp(dst))?,
                }
                let src = operand(prog, op_ref, 1, index, residents, masm)?;
                int_op!(masm, ty, dst, src, index, and);
            }
            OpKind::Minimum | OpKind::Maximum => {
                let op = prog.instrs.op(op_ref);
                let dst = index.gp_temp(op.dst);
                let src = operand(prog, op_ref, 1, index, residents, masm)?;
                int_op!(masm, ty, dst, src, index, cmp);
                match (kind, src) {
                    (OpKind::Minimum, _) => int_op!(masm, ty, dst, src, index, cmovg),
                    _ => int_op!(masm, ty, dst, src, index, cmovl),
                }
            }
            OpKind::Neg => {
                let op = prog.instrs.op(op_ref);
                let dst = index.gp_temp(op.dst);
                self.load_unary_src(prog, op_ref, dst, index, residents, masm)?;
                match ty {
                    Type::Int32 => masm.asm().neg(gp32(dst))?,
                    _ => masm.asm().neg(gp(dst))?,
                }
            }
            OpKind::Not => {
                let op = prog.instrs.op(op_ref);
                let dst = index.gp_temp(op.dst);
                self.load_unary_src(prog, op_ref, dst, index, residents, masm)?;
                match ty {
                    Type::Int32 => masm.asm().not(gp32(dst))?,
                    _ => masm.asm().not(gp(dst))?,
                }
            }
            OpKind::Abs => {
                let op = prog.instrs.op(op_ref);
                let dst = index.gp_temp(op.dst);
                let aux = index.gp_aux(0);
                self.load_unary_src(prog, op_ref, dst, index, residents, masm)?;
                match ty {
                    Type::Int32 => {
                        masm.asm().mov(gp32(aux), gp32(dst))?;
                        masm.asm().sar(gp32(aux), 31)?;
                        masm.asm().xor(gp32(dst), gp32(aux))?;
                        masm.asm().sub(gp32(dst), gp32(aux))?;
                    }
                    _ => {
                        masm.asm().mov(gp(aux), gp(dst))?;
                        masm.asm().sar(gp(aux), 63)?;
                        masm.asm().xor(gp(dst), gp(aux))?;
                        masm.asm().sub(gp(dst), gp(aux))?;
                    }
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

impl ExpressionGenerator for ScalarInt {
    fn name(&self) -> &'static str {
        "IntScalar"
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
        matches!(ty, Type::Int32 | Type::Int64)
    }

    fn supported_op(&self, op: OpKind, _ty: Type) -> bool {
        matches!(
            op,
            OpKind::Mov
                | OpKind::Add
                | OpKind::Sub
                | OpKind::Mul
                | OpKind::Minimum
                | OpKind::Maximum
                | OpKind::Neg
                | OpKind::Abs
                | OpKind::And
                | OpKind::Or
                | OpKind::AndNot
                | OpKind::Not
        )
    }

    fn register_plan(&self, prog: &Program, _index: &ElementwiseIndexGenerator) -> RegisterPlan {
        RegisterPlan {
            simd_temps: 0,
            simd_aux: 0,
            gp_temps: prog.num_regs,
            gp_aux: Self::needs_aux(prog) as usize,
        }
    }

    fn generate(
        &self,
        prog: &Program,
        index: &mut ElementwiseIndexGenerator,
        masm: &mut MacroAssembler,
    ) -> CompileResult<()> {
        let residents = HashMap::new();
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
