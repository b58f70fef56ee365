//! Runtime support for networks.
//!
//! The [`Runtime`] trait is the narrow interface the generated code and the
//! instance machinery call into: instance and channel memory life-cycle,
//! cooperative task hooks, and device transfer emission. Two runtimes are
//! bundled: [`BasicRuntime`] runs everything serially on the calling thread
//! and [`ThreadedRuntime`] runs auxiliary tasks on their own OS threads.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::thread::JoinHandle;

use crate::error::{CompileError, CompileResult};
use crate::masm::MacroAssembler;
use crate::network::Cell;
use crate::tensor::TensorId;

/// A task is an asynchronous function that can run in parallel with the
/// main computation. Task structures are embedded in instance blocks and
/// filled out by generated code, so the layout is fixed.
#[repr(C)]
pub struct Task {
    /// Entry point for the task body within the cell's code buffer.
    pub func: Option<unsafe extern "sysv64" fn(*mut u8)>,
    /// Argument for the task body; the instance pointer.
    pub arg: *mut u8,
    /// Runtime state slot, e.g. a parked thread handle.
    pub state: *mut u8,
    /// Task id from the flow.
    pub id: i32,
    /// Task index within the cell.
    pub index: i32,
}

/// Function called by generated code with a task structure.
pub type TaskFunc = unsafe extern "sysv64" fn(*mut Task);

/// Function called by generated code with the instance pointer.
pub type InstanceFunc = unsafe extern "sysv64" fn(*mut u8);

/// Direction of a host/device tensor transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

/// A tensor transfer the code emission driver asks the runtime to emit.
#[derive(Clone, Copy, Debug)]
pub struct Transfer {
    pub tensor: TensorId,
    pub direction: TransferDirection,
    /// Task index of the consumers, or -1 when consumed by several tasks.
    pub task: i32,
}

/// Runtime support functions for a network.
pub trait Runtime: Send + Sync {
    /// Return runtime description.
    fn description(&self) -> &str {
        ""
    }

    /// Allocate a zeroed instance data block.
    fn allocate_instance(&self, size: usize, align: usize) -> CompileResult<*mut u8>;

    /// Deallocate an instance data block.
    fn free_instance(&self, data: *mut u8, size: usize, align: usize);

    /// Clear an instance data block.
    fn clear_instance(&self, data: *mut u8, size: usize);

    /// Allocate a zeroed channel data block.
    fn allocate_channel(&self, size: usize, align: usize) -> CompileResult<*mut u8> {
        self.allocate_instance(size, align)
    }

    /// Clear part of a channel data block.
    fn clear_channel(&self, data: *mut u8, size: usize) {
        self.clear_instance(data, size);
    }

    /// Deallocate a channel data block.
    fn free_channel(&self, data: *mut u8, size: usize, align: usize) {
        self.free_instance(data, size, align);
    }

    /// Check if the runtime supports asynchronous execution of steps.
    fn supports_async(&self) -> bool;

    /// Runtime function for starting a task.
    fn start_task_func(&self) -> TaskFunc;

    /// Runtime function for waiting for task completion.
    fn wait_task_func(&self) -> TaskFunc;

    /// Runtime function for synchronizing the main task, if needed.
    fn sync_main_func(&self) -> Option<InstanceFunc> {
        None
    }

    /// Extra bytes reserved at the beginning of each instance block.
    fn extra_instance_data(&self, _cell: &Cell) -> usize {
        0
    }

    /// Emit code for host/device tensor transfers; a no-op for host-only
    /// runtimes.
    fn emit_tensor_transfers(
        &self,
        _xfers: &[Transfer],
        _cell: &Cell,
        _masm: &mut MacroAssembler,
    ) -> CompileResult<()> {
        Ok(())
    }

    /// Runtime function for starting profiling, if supported.
    fn start_profiler_func(&self) -> Option<InstanceFunc> {
        None
    }

    /// Runtime function for stopping profiling, if supported.
    fn stop_profiler_func(&self) -> Option<InstanceFunc> {
        None
    }
}

fn layout(size: usize, align: usize) -> CompileResult<Layout> {
    Layout::from_size_align(size.max(1), align.max(1)).map_err(|e| CompileError::Allocation {
        reason: format!("invalid layout: {e}"),
    })
}

fn allocate_zeroed(size: usize, align: usize) -> CompileResult<*mut u8> {
    let layout = layout(size, align)?;
    let data = unsafe { alloc_zeroed(layout) };
    if data.is_null() {
        return Err(CompileError::Allocation {
            reason: format!("cannot allocate {size} bytes"),
        });
    }
    Ok(data)
}

unsafe extern "sysv64" fn start_task_serial(task: *mut Task) {
    if let Some(func) = (*task).func {
        func((*task).arg);
    }
}

unsafe extern "sysv64" fn wait_task_serial(_task: *mut Task) {}

/// Basic runtime for serial execution of cells on a single CPU thread.
#[derive(Default)]
pub struct BasicRuntime;

impl BasicRuntime {
    pub fn new() -> Self {
        BasicRuntime
    }
}

impl Runtime for BasicRuntime {
    fn description(&self) -> &str {
        "serial host runtime"
    }

    fn allocate_instance(&self, size: usize, align: usize) -> CompileResult<*mut u8> {
        allocate_zeroed(size, align)
    }

    fn free_instance(&self, data: *mut u8, size: usize, align: usize) {
        if let Ok(layout) = layout(size, align) {
            unsafe { dealloc(data, layout) };
        }
    }

    fn clear_instance(&self, data: *mut u8, size: usize) {
        unsafe { std::ptr::write_bytes(data, 0, size) };
    }

    fn supports_async(&self) -> bool {
        false
    }

    fn start_task_func(&self) -> TaskFunc {
        start_task_serial
    }

    fn wait_task_func(&self) -> TaskFunc {
        wait_task_serial
    }
}

struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

unsafe extern "sysv64" fn start_task_threaded(task: *mut Task) {
    let func = match (*task).func {
        Some(func) => func,
        None => return,
    };
    let arg = SendPtr((*task).arg);
    let handle = std::thread::spawn(move || {
        let arg = arg;
        unsafe { func(arg.0) };
    });
    (*task).state = Box::into_raw(Box::new(handle)) as *mut u8;
}

unsafe extern "sysv64" fn wait_task_threaded(task: *mut Task) {
    let state = (*task).state;
    if state.is_null() {
        return;
    }
    (*task).state = std::ptr::null_mut();
    let handle = Box::from_raw(state as *mut JoinHandle<()>);
    let _ = handle.join();
}

/// Runtime that runs each auxiliary task on its own OS thread. The thread
/// handle is parked in the task structure between start and wait.
#[derive(Default)]
pub struct ThreadedRuntime;

impl ThreadedRuntime {
    pub fn new() -> Self {
        ThreadedRuntime
    }
}

impl Runtime for ThreadedRuntime {
    fn description(&self) -> &str {
        "threaded host runtime"
    }

    fn allocate_instance(&self, size: usize, align: usize) -> CompileResult<*mut u8> {
        allocate_zeroed(size, align)
    }

    fn free_instance(&self, data: *mut u8, size: usize, align: usize) {
        if let Ok(layout) = layout(size, align) {
            unsafe { dealloc(data, layout) };
        }
    }

    fn clear_instance(&self, data: *mut u8, size: usize) {
        unsafe { std::ptr::write_bytes(data, 0, size) };
    }

    fn supports_async(&self) -> bool {
        true
    }

    fn start_task_func(&self) -> TaskFunc {
        start_task_threaded
    }

    fn wait_task_func(&self) -> TaskFunc {
        wait_task_threaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_layout_is_fixed() {
        assert_eq!(std::mem::offset_of!(Task, func), 0);
        assert_eq!(std::mem::offset_of!(Task, arg), 8);
        assert_eq!(std::mem::offset_of!(Task, state), 16);
        assert_eq!(std::mem::offset_of!(Task, id), 24);
        assert_eq!(std::mem::offset_of!(Task, index), 28);
    }

    #[test]
    fn test_basic_runtime_alloc_roundtrip() {
        let rt = BasicRuntime::new();
        let data = rt.allocate_instance(256, 64).unwrap();
        assert_eq!(data as usize % 64, 0);
        unsafe {
            assert!(std::slice::from_raw_parts(data, 256).iter().all(|&b| b == 0));
            *data = 7;
        }
        rt.clear_instance(data, 256);
        unsafe { assert_eq!(*data, 0) };
        rt.free_instance(data, 256, 64);
    }

    #[test]
    fn test_threaded_runtime_runs_task() {
        static mut FLAG: u64 = 0;
        unsafe extern "sysv64" fn body(arg: *mut u8) {
            unsafe { *(arg as *mut u64) += 1 };
        }
        let rt = ThreadedRuntime::new();
        let mut task = Task {
            func: Some(body),
            arg: std::ptr::addr_of_mut!(FLAG) as *mut u8,
            state: std::ptr::null_mut(),
            id: 1,
            index: 0,
        };
        unsafe {
            rt.start_task_func()(&mut task);
            rt.wait_task_func()(&mut task);
            assert_eq!(*std::ptr::addr_of!(FLAG), 1);
        }
    }
}
