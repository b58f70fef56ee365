//! Vector float expression generator using AVX-256 YMM operations.
//!
//! Processes 32 bytes per iteration (8 f32 or 4 f64 lanes). Scalar
//! operands and numbers are broadcast into loop-resident registers before
//! the loop. Reductions fall back to the scalar generator.

use std::collections::HashMap;

use iced_x86::code_asm::{ymmword_ptr, AsmMemoryOperand};

use crate::error::{CompileError, CompileResult};
use crate::express::{Model, OpKind, VarKind};
use crate::flow::Type;
use crate::masm::{gp, ymm, MacroAssembler};

use super::index::{AddrOperand, ElementwiseIndexGenerator};
use super::scalar_flt::{mem4, mem8};
use super::{number_bytes, operand, ExpressionGenerator, Opnd, Program, RegisterPlan};

fn mem32(a: &AddrOperand) -> AsmMemoryOperand {
    match *a {
        AddrOperand::Mem { base, disp, index } => match index {
            Some(i) => ymmword_ptr(gp(base) + gp(i) + disp),
            None => ymmword_ptr(gp(base) + disp),
        },
        AddrOperand::Label(l) => ymmword_ptr(l),
    }
}

/// 32-byte mask patterns for logical float ops.
fn sign_mask(ty: Type) -> Vec<u8> {
    match ty {
        Type::Float32 => 0x8000_0000u32.to_le_bytes().repeat(8),
        _ => 0x8000_0000_0000_0000u64.to_le_bytes().repeat(4),
    }
}

fn abs_mask(ty: Type) -> Vec<u8> {
    match ty {
        Type::Float32 => 0x7fff_ffffu32.to_le_bytes().repeat(8),
        _ => 0x7fff_ffff_ffff_ffffu64.to_le_bytes().repeat(4),
    }
}

fn ones_mask() -> Vec<u8> {
    vec![0xff; 32]
}

fn zero_mask() -> Vec<u8> {
    vec![0; 32]
}

fn ones_value(ty: Type) -> Vec<u8> {
    match ty {
        Type::Float32 => 1.0f32.to_le_bytes().repeat(8),
        _ => 1.0f64.to_le_bytes().repeat(4),
    }
}

/// Three-operand vector float op: dst = op(src1, src2).
macro_rules! avx_op {
    ($masm:ident, $ty:expr, $dst:expr, $src1:expr, $src2:expr, $index:expr, $op32:ident, $op64:ident) => {
        match ($ty, $src2) {
            (Type::Float32, Opnd::Temp(r)) => {
                $masm.asm().$op32(ymm($dst), ymm($src1), ymm($index.simd(r)))?
            }
            (Type::Float32, Opnd::Phys(r)) => $masm.asm().$op32(ymm($dst), ymm($src1), ymm(r))?,
            (Type::Float32, Opnd::Mem(m)) => $masm.asm().$op32(ymm($dst), ymm($src1), mem32(&m))?,
            (_, Opnd::Temp(r)) => $masm.asm().$op64(ymm($dst), ymm($src1), ymm($index.simd(r)))?,
            (_, Opnd::Phys(r)) => $masm.asm().$op64(ymm($dst), ymm($src1), ymm(r))?,
            (_, Opnd::Mem(m)) => $masm.asm().$op64(ymm($dst), ymm($src1), mem32(&m))?,
        }
    };
}

/// Vector float expression generator for AVX-256.
pub struct VectorFltAvx256;

impl VectorFltAvx256 {
    fn needs_ones(prog: &Program) -> bool {
        prog.instrs
            .order()
            .iter()
            .any(|&op| matches!(prog.instrs.op(op).kind, OpKind::Rsqrt | OpKind::Reciprocal))
    }

    /// Scalars and numbers must live in broadcast registers for the whole
    /// loop; a memory lane load would read eight distinct elements.
    fn residents(&self, prog: &Program, index: &ElementwiseIndexGenerator) -> Vec<(VarKind, i32)> {
        let mut list = Vec::new();
        for &op in prog.instrs.order() {
            for &arg in &prog.instrs.op(op).args {
                let v = prog.instrs.var(arg);
                let needed = match v.kind {
                    VarKind::Number => true,
                    VarKind::Input | VarKind::Const => index.is_scalar_var(v.kind, v.id),
                    _ => false,
                };
                if needed && !list.contains(&(v.kind, v.id)) {
                    list.push((v.kind, v.id));
                }
            }
        }
        list
    }

    /// Source register for a unary op, loading from memory into dst first
    /// when needed.
    fn unary_src(
        &self,
        prog: &Program,
        op_ref: usize,
        dst: u8,
        index: &ElementwiseIndexGenerator,
        residents: &HashMap<(VarKind, i32), u8>,
        masm: &mut MacroAssembler,
    ) -> CompileResult<u8> {
        Ok(match operand(prog, op_ref, 0, index, residents, masm)? {
            Opnd::Temp(r) => index.simd(r),
            Opnd::Phys(r) => r,
            Opnd::Mem(m) => {
                masm.asm().vmovups(ymm(dst), mem32(&m))?;
                dst
            }
        })
    }

    fn emit_op(
        &self,
        prog: &Program,
        op_ref: usize,
        index: &ElementwiseIndexGenerator,
        residents: &HashMap<(VarKind, i32), u8>,
        ones: Option<u8>,
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
                    let dst = index.simd(op.dst);
                    match operand(prog, op_ref, 0, index, residents, masm)? {
                        Opnd::Temp(r) => {
                            let r = index.simd(r);
                            if r != dst {
                                masm.asm().vmovaps(ymm(dst), ymm(r))?;
                            }
                        }
                        Opnd::Phys(r) => masm.asm().vmovaps(ymm(dst), ymm(r))?,
                        Opnd::Mem(m) => masm.asm().vmovups(ymm(dst), mem32(&m))?,
                    }
                } else {
                    let m = index.addr(rv.kind, rv.id)?;
                    match operand(prog, op_ref, 0, index, residents, masm)? {
                        Opnd::Temp(r) => masm.asm().vmovups(mem32(&m), ymm(index.simd(r)))?,
                        Opnd::Phys(r) => masm.asm().vmovups(mem32(&m), ymm(r))?,
                        Opnd::Mem(_) => {
                            return Err(CompileError::Encoding(
                                "memory to memory move in expression".to_string(),
                            ))
                        }
                    }
                }
            }
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::Minimum
            | OpKind::Maximum | OpKind::And | OpKind::Or | OpKind::AndNot => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let src1 = match operand(prog, op_ref, 0, index, residents, masm)? {
                    Opnd::Temp(r) => index.simd(r),
                    Opnd::Phys(r) => r,
                    Opnd::Mem(_) => {
                        return Err(CompileError::Encoding(
                            "first operand of vector op not in a register".to_string(),
                        ))
                    }
                };
                let src2 = operand(prog, op_ref, 1, index, residents, masm)?;
                match kind {
                    OpKind::Add => avx_op!(masm, ty, dst, src1, src2, index, vaddps, vaddpd),
                    OpKind::Sub => avx_op!(masm, ty, dst, src1, src2, index, vsubps, vsubpd),
                    OpKind::Mul => avx_op!(masm, ty, dst, src1, src2, index, vmulps, vmulpd),
                    OpKind::Div => avx_op!(masm, ty, dst, src1, src2, index, vdivps, vdivpd),
                    OpKind::Minimum => avx_op!(masm, ty, dst, src1, src2, index, vminps, vminpd),
                    OpKind::Maximum => avx_op!(masm, ty, dst, src1, src2, index, vmaxps, vmaxpd),
                    OpKind::And => avx_op!(masm, ty, dst, src1, src2, index, vandps, vandpd),
                    OpKind::Or => avx_op!(masm, ty, dst, src1, src2, index, vorps, vorpd),
                    _ => avx_op!(masm, ty, dst, src1, src2, index, vandnps, vandnpd),
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
                let src1 = match operand(prog, op_ref, 0, index, residents, masm)? {
                    Opnd::Temp(r) => index.simd(r),
                    Opnd::Phys(r) => r,
                    Opnd::Mem(_) => {
                        return Err(CompileError::Encoding(
                            "first operand of vector compare not in a register".to_string(),
                        ))
                    }
                };
                let pred = match kind {
                    OpKind::Equal => 0,
                    OpKind::Less => 1,
                    OpKind::LessEqual => 2,
                    OpKind::NotEqual => 4,
                    OpKind::GreaterEqual => 5,
                    _ => 6,
                };
                match (ty, operand(prog, op_ref, 1, index, residents, masm)?) {
                    (Type::Float32, Opnd::Temp(r)) => {
                        masm.asm().vcmpps(ymm(dst), ymm(src1), ymm(index.simd(r)), pred)?
                    }
                    (Type::Float32, Opnd::Phys(r)) => {
                        masm.asm().vcmpps(ymm(dst), ymm(src1), ymm(r), pred)?
                    }
                    (Type::Float32, Opnd::Mem(m)) => {
                        masm.asm().vcmpps(ymm(dst), ymm(src1), mem32(&m), pred)?
                    }
                    (_, Opnd::Temp(r)) => {
                        masm.asm().vcmppd(ymm(dst), ymm(src1), ymm(index.simd(r)), pred)?
                    }
                    (_, Opnd::Phys(r)) => masm.asm().vcmppd(ymm(dst), ymm(src1), ymm(r), pred)?,
                    (_, Opnd::Mem(m)) => {
                        masm.asm().vcmppd(ymm(dst), ymm(src1), mem32(&m), pred)?
                    }
                }
            }
            OpKind::Relu => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let src = self.unary_src(prog, op_ref, dst, index, residents, masm)?;
                let zero = masm.pool_constant(&zero_mask());
                match ty {
                    Type::Float32 => masm.asm().vmaxps(ymm(dst), ymm(src), ymmword_ptr(zero))?,
                    _ => masm.asm().vmaxpd(ymm(dst), ymm(src), ymmword_ptr(zero))?,
                }
            }
            OpKind::Neg => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let src = self.unary_src(prog, op_ref, dst, index, residents, masm)?;
                let mask = masm.pool_constant(&sign_mask(ty));
                match ty {
                    Type::Float32 => masm.asm().vxorps(ymm(dst), ymm(src), ymmword_ptr(mask))?,
                    _ => masm.asm().vxorpd(ymm(dst), ymm(src), ymmword_ptr(mask))?,
                }
            }
            OpKind::Abs => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let src = self.unary_src(prog, op_ref, dst, index, residents, masm)?;
                let mask = masm.pool_constant(&abs_mask(ty));
                match ty {
                    Type::Float32 => masm.asm().vandps(ymm(dst), ymm(src), ymmword_ptr(mask))?,
                    _ => masm.asm().vandpd(ymm(dst), ymm(src), ymmword_ptr(mask))?,
                }
            }
            OpKind::Not => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let src = self.unary_src(prog, op_ref, dst, index, residents, masm)?;
                let mask = masm.pool_constant(&ones_mask());
                match ty {
                    Type::Float32 => masm.asm().vxorps(ymm(dst), ymm(src), ymmword_ptr(mask))?,
                    _ => masm.asm().vxorpd(ymm(dst), ymm(src), ymmword_ptr(mask))?,
                }
            }
            OpKind::Sqrt => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                match (ty, operand(prog, op_ref, 0, index, residents, masm)?) {
                    (Type::Float32, Opnd::Temp(r)) => {
                        masm.asm().vsqrtps(ymm(dst), ymm(index.simd(r)))?
                    }
                    (Type::Float32, Opnd::Phys(r)) => masm.asm().vsqrtps(ymm(dst), ymm(r))?,
                    (Type::Float32, Opnd::Mem(m)) => masm.asm().vsqrtps(ymm(dst), mem32(&m))?,
                    (_, Opnd::Temp(r)) => masm.asm().vsqrtpd(ymm(dst), ymm(index.simd(r)))?,
                    (_, Opnd::Phys(r)) => masm.asm().vsqrtpd(ymm(dst), ymm(r))?,
                    (_, Opnd::Mem(m)) => masm.asm().vsqrtpd(ymm(dst), mem32(&m))?,
                }
            }
            OpKind::Reciprocal => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let ones = ones.expect("reciprocal without ones register");
                let src = operand(prog, op_ref, 0, index, residents, masm)?;
                avx_op!(masm, ty, dst, ones, src, index, vdivps, vdivpd);
            }
            OpKind::Rsqrt => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                let ones = ones.expect("rsqrt without ones register");
                match (ty, operand(prog, op_ref, 0, index, residents, masm)?) {
                    (Type::Float32, Opnd::Temp(r)) => {
                        masm.asm().vsqrtps(ymm(dst), ymm(index.simd(r)))?
                    }
                    (Type::Float32, Opnd::Phys(r)) => masm.asm().vsqrtps(ymm(dst), ymm(r))?,
                    (Type::Float32, Opnd::Mem(m)) => masm.asm().vsqrtps(ymm(dst), mem32(&m))?,
                    (_, Opnd::Temp(r)) => masm.asm().vsqrtpd(ymm(dst), ymm(index.simd(r)))?,
                    (_, Opnd::Phys(r)) => masm.asm().vsqrtpd(ymm(dst), ymm(r))?,
                    (_, Opnd::Mem(m)) => masm.asm().vsqrtpd(ymm(dst), mem32(&m))?,
                }
                match ty {
                    Type::Float32 => masm.asm().vdivps(ymm(dst), ymm(ones), ymm(dst))?,
                    _ => masm.asm().vdivpd(ymm(dst), ymm(ones), ymm(dst))?,
                }
            }
            OpKind::Floor => {
                let op = prog.instrs.op(op_ref);
                let dst = index.simd(op.dst);
                match (ty, operand(prog, op_ref, 0, index, residents, masm)?) {
                    (Type::Float32, Opnd::Temp(r)) => {
                        masm.asm().vroundps(ymm(dst), ymm(index.simd(r)), 1)?
                    }
                    (Type::Float32, Opnd::Phys(r)) => masm.asm().vroundps(ymm(dst), ymm(r), 1)?,
                    (Type::Float32, Opnd::Mem(m)) => masm.asm().vroundps(ymm(dst), mem32(&m), 1)?,
                    (_, Opnd::Temp(r)) => masm.asm().vroundpd(ymm(dst), ymm(index.simd(r)), 1)?,
                    (_, Opnd::Phys(r)) => masm.asm().vroundpd(ymm(dst), ymm(r), 1)?,
                    (_, Opnd::Mem(m)) => masm.asm().vroundpd(ymm(dst), mem32(&m), 1)?,
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

impl ExpressionGenerator for VectorFltAvx256 {
    fn name(&self) -> &'static str {
        "VFltAVX256"
    }

    fn vector_size(&self, _ty: Type) -> usize {
        32
    }

    fn model(&self) -> Model {
        Model {
            mov_reg_reg: true,
            mov_reg_mem: true,
            mov_mem_reg: true,
            op_reg_reg_reg: true,
            op_reg_reg_mem: true,
            func_reg_reg: true,
            func_reg_mem: true,
            ..Default::default()
        }
    }

    fn supported_type(&self, ty: Type) -> bool {
        matches!(ty, Type::Float32 | Type::Float64) && super::cpu_has(super::CpuFeature::Avx)
    }

    fn supported_op(&self, op: OpKind, _ty: Type) -> bool {
        matches!(
            op,
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
                | OpKind::Floor
                | OpKind::Equal
                | OpKind::NotEqual
                | OpKind::Less
                | OpKind::LessEqual
                | OpKind::Greater
                | OpKind::GreaterEqual
                | OpKind::And
                | OpKind::Or
                | OpKind::AndNot
                | OpKind::Not
        )
    }

    fn supports_reductions(&self) -> bool {
        false
    }

    fn fits(&self, elements: i64, _ty: Type) -> bool {
        // Scalars stay on the scalar generator; everything else is padded
        // to full vectors by the adjust phase.
        elements > 1
    }

    fn register_plan(&self, prog: &Program, index: &ElementwiseIndexGenerator) -> RegisterPlan {
        RegisterPlan {
            simd_temps: prog.num_regs,
            simd_aux: Self::needs_ones(prog) as usize + self.residents(prog, index).len(),
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
        masm.set_avx_used();
        let needs_ones = Self::needs_ones(prog);
        let ones = if needs_ones {
            Some(index.simd_aux(0))
        } else {
            None
        };
        let resident_list = self.residents(prog, index);
        let mut residents = HashMap::new();
        for (i, &key) in resident_list.iter().enumerate() {
            residents.insert(key, index.simd_aux(needs_ones as usize + i));
        }

        // Load the constant one vector and broadcast loop residents.
        if let Some(ones) = ones {
            let label = masm.pool_constant(&ones_value(prog.ty));
            masm.asm().vmovups(ymm(ones), ymmword_ptr(label))?;
        }
        for &(kind, id) in &resident_list {
            let phys = residents[&(kind, id)];
            let m = if kind == VarKind::Number {
                AddrOperand::Label(masm.pool_constant(&number_bytes(prog.ty, id)))
            } else {
                index.addr(kind, id)?
            };
            match prog.ty {
                Type::Float32 => masm.asm().vbroadcastss(ymm(phys), mem4(&m))?,
                _ => masm.asm().vbroadcastsd(ymm(phys), mem8(&m))?,
            }
        }

        for &op in prog.init_ops() {
            self.emit_op(prog, op, index, &residents, ones, masm)?;
        }
        index.begin_loop(masm)?;
        for &op in prog.body_ops() {
            self.emit_op(prog, op, index, &residents, ones, masm)?;
        }
        index.end_loop(masm)?;
        for &op in prog.tail_ops() {
            self.emit_op(prog, op, index, &residents, ones, masm)?;
        }
        Ok(())
    }
}
