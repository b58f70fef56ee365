//! Macro assembler for generating cell code.
//!
//! Wraps an iced-x86 [`CodeAssembler`] with the register bookkeeping the
//! code-emission driver and the kernels need: a general-purpose register
//! allocator aware of callee-saved registers, a SIMD register allocator, a
//! deduplicated RIP-relative constant pool, tensor addressing relative to
//! the instance register, and task start/wait trampolines.
//!
//! Everything emitted is position-independent: label references are
//! RIP-relative and runtime entry points are materialized as absolute
//! immediates, so the assembled bytes can be copied to any executable
//! mapping without relocation.

use std::collections::HashMap;

use iced_x86::code_asm::*;

use crate::error::{CompileError, CompileResult};
use crate::runtime::Task;
use crate::tensor::Tensor;

/// General-purpose registers by encoding order.
const GP64: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

const XMM: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
    xmm14, xmm15,
];

const YMM: [AsmRegisterYmm; 16] = [
    ymm0, ymm1, ymm2, ymm3, ymm4, ymm5, ymm6, ymm7, ymm8, ymm9, ymm10, ymm11, ymm12, ymm13,
    ymm14, ymm15,
];

const GP32: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

/// Map a register code to a 64-bit general-purpose register.
pub fn gp(code: u8) -> AsmRegister64 {
    GP64[code as usize]
}

/// Map a register code to a 32-bit general-purpose register.
pub fn gp32(code: u8) -> AsmRegister32 {
    GP32[code as usize]
}

/// Map a register code to an XMM register.
pub fn xmm(code: u8) -> AsmRegisterXmm {
    XMM[code as usize]
}

/// Map a register code to a YMM register.
pub fn ymm(code: u8) -> AsmRegisterYmm {
    YMM[code as usize]
}

const RAX_CODE: u8 = 0;
const RBX_CODE: u8 = 3;
const RSP_CODE: u8 = 4;
const RBP_CODE: u8 = 5;
const RDI_CODE: u8 = 7;
const R12_CODE: u8 = 12;
const R13_CODE: u8 = 13;
const R14_CODE: u8 = 14;
const R15_CODE: u8 = 15;

/// Register used as base for the data instance.
pub const INSTANCE_REGISTER: u8 = RBP_CODE;

/// General-purpose register allocation for a cell.
///
/// Callee-saved registers are unavailable until reserved through `usage`,
/// which also tells the prologue which registers to save.
pub struct Registers {
    used: u16,
    saved: u16,
}

const PRESERVED: u16 = (1 << RBX_CODE)
    | (1 << RSP_CODE)
    | (1 << RBP_CODE)
    | (1 << R12_CODE)
    | (1 << R13_CODE)
    | (1 << R14_CODE)
    | (1 << R15_CODE);

impl Registers {
    pub fn new() -> Self {
        Registers {
            used: PRESERVED,
            saved: 0,
        }
    }

    /// Allocate a free register.
    pub fn alloc(&mut self) -> Option<u8> {
        (0..16u8).find(|&r| !self.is_used(r)).map(|r| {
            self.use_reg(r);
            r
        })
    }

    /// Allocate a specific register; it must be free.
    pub fn alloc_fixed(&mut self, r: u8) -> Option<u8> {
        if self.is_used(r) {
            return None;
        }
        self.use_reg(r);
        Some(r)
    }

    pub fn use_reg(&mut self, r: u8) {
        self.used |= 1 << r;
    }

    pub fn release(&mut self, r: u8) {
        self.used &= !(1 << r);
    }

    pub fn is_used(&self, r: u8) -> bool {
        self.used & (1 << r) != 0
    }

    /// Reset allocations for the next step.
    pub fn reset(&mut self) {
        self.used = PRESERVED & !self.saved;
    }

    /// Reserve a callee-saved register for allocation; the prologue will
    /// save it.
    fn reserve(&mut self, r: u8) {
        self.saved |= 1 << r;
        self.used &= !(1 << r);
    }

    /// Check if a register must be saved by the prologue.
    pub fn is_saved(&self, r: u8) -> bool {
        self.saved & (1 << r) != 0
    }

    pub fn is_preserved(r: u8) -> bool {
        PRESERVED & (1 << r) != 0
    }

    /// Declare the number of registers needed. Eight caller-saved registers
    /// are always available; up to five callee-saved registers are reserved
    /// on top of that.
    pub fn usage(&mut self, n: usize) -> bool {
        if n > 13 {
            return false;
        }
        if n >= 9 && !self.is_saved(RBX_CODE) {
            self.reserve(RBX_CODE);
        }
        if n >= 10 && !self.is_saved(R12_CODE) {
            self.reserve(R12_CODE);
        }
        if n >= 11 && !self.is_saved(R13_CODE) {
            self.reserve(R13_CODE);
        }
        if n >= 12 && !self.is_saved(R14_CODE) {
            self.reserve(R14_CODE);
        }
        if n >= 13 && !self.is_saved(R15_CODE) {
            self.reserve(R15_CODE);
        }
        true
    }

    /// Number of free registers.
    pub fn free_count(&self) -> usize {
        (0..16u8).filter(|&r| !self.is_used(r)).count()
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

/// SIMD register allocation for a cell.
pub struct SimdRegisters {
    used: u16,
}

impl SimdRegisters {
    pub fn new() -> Self {
        SimdRegisters { used: 0 }
    }

    pub fn alloc(&mut self) -> Option<u8> {
        (0..16u8).find(|&r| self.used & (1 << r) == 0).map(|r| {
            self.used |= 1 << r;
            r
        })
    }

    pub fn release(&mut self, r: u8) {
        self.used &= !(1 << r);
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn free_count(&self) -> usize {
        (0..16u8).filter(|&r| self.used & (1 << r) == 0).count()
    }
}

impl Default for SimdRegisters {
    fn default() -> Self {
        Self::new()
    }
}

/// Macro assembler for one cell.
pub struct MacroAssembler {
    asm: CodeAssembler,
    rr: Registers,
    mm: SimdRegisters,
    pool: Vec<(CodeLabel, Vec<u8>)>,
    pool_index: HashMap<Vec<u8>, usize>,
    avx_used: bool,
}

impl MacroAssembler {
    pub fn new() -> CompileResult<Self> {
        Ok(MacroAssembler {
            asm: CodeAssembler::new(64)?,
            rr: Registers::new(),
            mm: SimdRegisters::new(),
            pool: Vec::new(),
            pool_index: HashMap::new(),
            avx_used: false,
        })
    }

    /// Direct access to the instruction stream for kernels and generators.
    pub fn asm(&mut self) -> &mut CodeAssembler {
        &mut self.asm
    }

    pub fn rr(&mut self) -> &mut Registers {
        &mut self.rr
    }

    pub fn mm(&mut self) -> &mut SimdRegisters {
        &mut self.mm
    }

    /// The instance data register.
    pub fn instance(&self) -> AsmRegister64 {
        gp(INSTANCE_REGISTER)
    }

    /// Mark that AVX instructions were emitted; the epilogue will insert
    /// vzeroupper.
    pub fn set_avx_used(&mut self) {
        self.avx_used = true;
    }

    pub fn create_label(&mut self) -> CodeLabel {
        self.asm.create_label()
    }

    pub fn bind(&mut self, label: &mut CodeLabel) -> CompileResult<()> {
        self.asm.set_label(label)?;
        Ok(())
    }

    /// Emit a breakpoint.
    pub fn breakpoint(&mut self) -> CompileResult<()> {
        self.asm.int3()?;
        Ok(())
    }

    /// Generate the function prologue: save the instance register and any
    /// reserved callee-saved registers, then load the instance pointer from
    /// the first argument.
    pub fn prolog(&mut self) -> CompileResult<()> {
        self.asm.push(gp(RBP_CODE))?;
        self.asm.mov(gp(RBP_CODE), gp(RDI_CODE))?;
        if self.rr.is_saved(RBX_CODE) {
            self.asm.push(gp(RBX_CODE))?;
        }
        if self.rr.is_saved(R12_CODE) {
            self.asm.push(gp(R12_CODE))?;
        }
        if self.rr.is_saved(R13_CODE) {
            self.asm.push(gp(R13_CODE))?;
        }
        if self.rr.is_saved(R14_CODE) {
            self.asm.push(gp(R14_CODE))?;
        }
        if self.rr.is_saved(R15_CODE) {
            self.asm.push(gp(R15_CODE))?;
        }
        Ok(())
    }

    /// Generate the function epilogue.
    pub fn epilog(&mut self) -> CompileResult<()> {
        if self.rr.is_saved(R15_CODE) {
            self.asm.pop(gp(R15_CODE))?;
        }
        if self.rr.is_saved(R14_CODE) {
            self.asm.pop(gp(R14_CODE))?;
        }
        if self.rr.is_saved(R13_CODE) {
            self.asm.pop(gp(R13_CODE))?;
        }
        if self.rr.is_saved(R12_CODE) {
            self.asm.pop(gp(R12_CODE))?;
        }
        if self.rr.is_saved(RBX_CODE) {
            self.asm.pop(gp(RBX_CODE))?;
        }
        self.asm.pop(gp(RBP_CODE))?;
        if self.avx_used {
            self.asm.vzeroupper()?;
        }
        self.asm.ret()?;
        Ok(())
    }

    /// Load the address of a tensor's data into a register.
    pub fn load_tensor_address(&mut self, dst: u8, tensor: &Tensor) -> CompileResult<()> {
        if tensor.is_constant() {
            let data = tensor.data.ok_or_else(|| {
                CompileError::Encoding(format!("constant {} has no placed data", tensor.name))
            })?;
            self.asm.mov(gp(dst), data.ptr() as u64)?;
            return Ok(());
        }
        let offset = tensor.offset.unwrap_or(0) as i32;
        if tensor.is_ref {
            self.asm
                .mov(gp(dst), qword_ptr(gp(RBP_CODE) + offset))?;
        } else if offset == 0 {
            self.asm.mov(gp(dst), gp(RBP_CODE))?;
        } else {
            self.asm.lea(gp(dst), qword_ptr(gp(RBP_CODE) + offset))?;
        }
        Ok(())
    }

    /// Call a runtime function with the instance pointer as argument.
    pub fn call_instance_function(&mut self, func: Option<usize>) -> CompileResult<()> {
        if let Some(addr) = func {
            self.asm.mov(gp(RDI_CODE), gp(RBP_CODE))?;
            self.asm.mov(gp(RAX_CODE), addr as u64)?;
            self.asm.call(gp(RAX_CODE))?;
        }
        Ok(())
    }

    /// Fill out a task structure in the instance and call the runtime's
    /// start-task function. The task body is at `entry` within this code
    /// buffer.
    pub fn start_task(
        &mut self,
        offset: usize,
        id: i32,
        index: i32,
        entry: CodeLabel,
        start_fn: usize,
    ) -> CompileResult<()> {
        self.asm.lea(gp(RDI_CODE), qword_ptr(gp(RBP_CODE) + offset as i32))?;
        self.asm.lea(gp(RAX_CODE), qword_ptr(entry))?;
        self.asm.mov(
            qword_ptr(gp(RDI_CODE) + std::mem::offset_of!(Task, func) as i32),
            gp(RAX_CODE),
        )?;
        self.asm.mov(
            qword_ptr(gp(RDI_CODE) + std::mem::offset_of!(Task, arg) as i32),
            gp(RBP_CODE),
        )?;
        self.asm.mov(
            dword_ptr(gp(RDI_CODE) + std::mem::offset_of!(Task, id) as i32),
            id,
        )?;
        self.asm.mov(
            dword_ptr(gp(RDI_CODE) + std::mem::offset_of!(Task, index) as i32),
            index,
        )?;
        self.asm.mov(gp(RAX_CODE), start_fn as u64)?;
        self.asm.call(gp(RAX_CODE))?;
        Ok(())
    }

    /// Call the runtime's wait-task function for the task structure at the
    /// given instance offset.
    pub fn wait_task(&mut self, offset: usize, wait_fn: usize) -> CompileResult<()> {
        self.asm.lea(gp(RDI_CODE), qword_ptr(gp(RBP_CODE) + offset as i32))?;
        self.asm.mov(gp(RAX_CODE), wait_fn as u64)?;
        self.asm.call(gp(RAX_CODE))?;
        Ok(())
    }

    /// Intern constant bytes in the RIP-relative data pool; returns the
    /// label of the data.
    pub fn pool_constant(&mut self, bytes: &[u8]) -> CodeLabel {
        if let Some(&idx) = self.pool_index.get(bytes) {
            return self.pool[idx].0;
        }
        let label = self.asm.create_label();
        self.pool_index.insert(bytes.to_vec(), self.pool.len());
        self.pool.push((label, bytes.to_vec()));
        label
    }

    /// Emit the constant pool and assemble the code buffer into executable
    /// memory.
    pub fn finalize(mut self) -> CompileResult<Code> {
        let pool = std::mem::take(&mut self.pool);
        for (mut label, bytes) in pool {
            self.asm.set_label(&mut label)?;
            self.asm.db(&bytes)?;
        }
        // Position-independent code can be assembled at any base.
        let bytes = self.asm.assemble(0)?;
        Code::from_bytes(&bytes)
    }
}

/// Executable code for a compiled cell.
pub struct Code {
    map: Option<memmap2::Mmap>,
    len: usize,
}

impl Code {
    /// Empty code object for cells that have not been generated.
    pub fn empty() -> Self {
        Code { map: None, len: 0 }
    }

    /// Copy assembled bytes into an executable mapping.
    pub fn from_bytes(bytes: &[u8]) -> CompileResult<Code> {
        let mut map = memmap2::MmapMut::map_anon(bytes.len().max(1)).map_err(|e| {
            CompileError::Allocation {
                reason: format!("cannot map code buffer: {e}"),
            }
        })?;
        map[..bytes.len()].copy_from_slice(bytes);
        let map = map.make_exec().map_err(|e| CompileError::Allocation {
            reason: format!("cannot make code executable: {e}"),
        })?;
        Ok(Code {
            map: Some(map),
            len: bytes.len(),
        })
    }

    pub fn entry(&self) -> *const u8 {
        match &self.map {
            Some(map) => map.as_ptr(),
            None => std::ptr::null(),
        }
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[..self.len],
            None => &[],
        }
    }

    /// Run the generated code on an instance data block.
    ///
    /// # Safety
    ///
    /// The instance must match the cell this code was compiled for and must
    /// be valid for the duration of the call.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn execute(&self, instance: *mut u8) {
        debug_assert!(!self.entry().is_null());
        let func: unsafe extern "sysv64" fn(*mut u8) = std::mem::transmute(self.entry());
        func(instance);
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub unsafe fn execute(&self, _instance: *mut u8) {
        unreachable!("generated code requires an x86-64 host");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_allocation_order() {
        let mut rr = Registers::new();
        // Caller-saved registers come first; rsp/rbp are never handed out.
        let first = rr.alloc().unwrap();
        assert_eq!(first, RAX_CODE);
        let mut seen = vec![first];
        while let Some(r) = rr.alloc() {
            assert!(!Registers::is_preserved(r));
            seen.push(r);
        }
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_register_usage_reserves_callee_saved() {
        let mut rr = Registers::new();
        assert!(rr.usage(10));
        assert!(rr.is_saved(RBX_CODE));
        assert!(rr.is_saved(R12_CODE));
        assert!(!rr.is_saved(R13_CODE));
        // Reserved registers become allocatable.
        let mut found_rbx = false;
        while let Some(r) = rr.alloc() {
            if r == RBX_CODE {
                found_rbx = true;
            }
        }
        assert!(found_rbx);
        assert!(!rr.usage(14));
    }

    #[test]
    fn test_register_reset_keeps_saved() {
        let mut rr = Registers::new();
        rr.usage(9);
        while rr.alloc().is_some() {}
        rr.reset();
        assert!(!rr.is_used(RBX_CODE));
        assert!(rr.is_used(RBP_CODE));
    }

    #[test]
    fn test_simd_register_allocation() {
        let mut mm = SimdRegisters::new();
        for expect in 0..16 {
            assert_eq!(mm.alloc(), Some(expect));
        }
        assert_eq!(mm.alloc(), None);
        mm.release(5);
        assert_eq!(mm.alloc(), Some(5));
    }

    #[test]
    fn test_assemble_simple_function() {
        // mov rax <- instance; ret. Just validates the assembler plumbing.
        let mut masm = MacroAssembler::new().unwrap();
        masm.prolog().unwrap();
        masm.epilog().unwrap();
        let code = masm.finalize().unwrap();
        assert!(code.size() > 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_execute_increments_memory() {
        // Generated code adds 1 to the u64 at instance offset 0.
        let mut masm = MacroAssembler::new().unwrap();
        masm.prolog().unwrap();
        masm.asm().inc(qword_ptr(gp(INSTANCE_REGISTER))).unwrap();
        masm.epilog().unwrap();
        let code = masm.finalize().unwrap();
        let mut value: u64 = 41;
        unsafe { code.execute(&mut value as *mut u64 as *mut u8) };
        assert_eq!(value, 42);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_pool_constant_load() {
        // movss xmm0, [pool]; movss [instance], xmm0.
        let mut masm = MacroAssembler::new().unwrap();
        masm.prolog().unwrap();
        let label = masm.pool_constant(&3.5f32.to_le_bytes());
        masm.asm().movss(xmm(0), dword_ptr(label)).unwrap();
        masm.asm()
            .movss(dword_ptr(gp(INSTANCE_REGISTER)), xmm(0))
            .unwrap();
        masm.epilog().unwrap();
        let code = masm.finalize().unwrap();
        let mut value: f32 = 0.0;
        unsafe { code.execute(&mut value as *mut f32 as *mut u8) };
        assert_eq!(value, 3.5);
    }
}
