//! Instances and channels.
//!
//! An [`Instance`] holds the input, output, and intermediate parameters for
//! one invocation of a compiled cell: an aligned byte block laid out by the
//! memory planner. A [`Channel`] is a growable array of connector-shaped
//! elements used to feed one cell's outputs to another cell's inputs
//! through reference tensors.

use std::fmt;

use crate::error::CompileResult;
use crate::flow::{Element, Type};
use crate::network::{CellId, ConnectorId, Network};
use crate::runtime::Task;
use crate::tensor::TensorId;

/// An instance of a cell's data block.
pub struct Instance<'n> {
    network: &'n Network,
    cell: CellId,
    data: *mut u8,
    size: usize,
    alignment: usize,
}

// Instances hold raw memory only touched through &mut self.
unsafe impl Send for Instance<'_> {}

impl<'n> Instance<'n> {
    /// Allocate a cleared instance for a cell.
    pub fn new(network: &'n Network, cell: CellId) -> CompileResult<Instance<'n>> {
        let c = network.cell(cell);
        let size = c.instance_size.max(1);
        let alignment = c.instance_alignment;
        let data = network.runtime().allocate_instance(size, alignment)?;
        Ok(Instance {
            network,
            cell,
            data,
            size,
            alignment,
        })
    }

    /// Clear the instance data.
    pub fn clear(&mut self) {
        self.network.runtime().clear_instance(self.data, self.size);
    }

    /// Run the cell computation on the instance.
    pub fn compute(&mut self) {
        unsafe { self.network.cell(self.cell).code.execute(self.data) };
    }

    pub fn data(&self) -> *mut u8 {
        self.data
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    pub fn network(&self) -> &'n Network {
        self.network
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn num_tasks(&self) -> usize {
        self.network.cell(self.cell).num_tasks()
    }

    /// Task structure embedded in the instance.
    pub fn task(&self, index: usize) -> *mut Task {
        let offset = self.network.cell(self.cell).task_offset(index);
        unsafe { self.data.add(offset) as *mut Task }
    }

    fn address(&self, tensor: TensorId) -> *mut u8 {
        let t = self.network.tensor(tensor);
        debug_assert!(!t.is_constant(), "constant tensor {}", t.name);
        debug_assert_eq!(t.cell, Some(self.cell), "tensor {} of another cell", t.name);
        let offset = t.offset.expect("tensor without host offset");
        unsafe { self.data.add(offset) }
    }

    /// Typed access to a parameter in the instance.
    pub fn get<T: Element>(&mut self, tensor: TensorId) -> &mut T {
        debug_assert_eq!(self.network.tensor(tensor).ty, T::TYPE);
        debug_assert!(!self.network.tensor(tensor).is_ref);
        unsafe { &mut *(self.address(tensor) as *mut T) }
    }

    /// Typed access to a row element of a parameter.
    pub fn get_at<T: Element>(&mut self, tensor: TensorId, r: usize) -> &mut T {
        debug_assert_eq!(self.network.tensor(tensor).ty, T::TYPE);
        let offset = self.network.tensor(tensor).offset_of(r);
        unsafe { &mut *(self.address(tensor).add(offset) as *mut T) }
    }

    /// Typed access to a matrix element of a parameter.
    pub fn get_at2<T: Element>(&mut self, tensor: TensorId, r: usize, c: usize) -> &mut T {
        debug_assert_eq!(self.network.tensor(tensor).ty, T::TYPE);
        let offset = self.network.tensor(tensor).offset_of2(r, c);
        unsafe { &mut *(self.address(tensor).add(offset) as *mut T) }
    }

    /// Bind a reference tensor to an element of a channel.
    pub fn set_channel(&mut self, tensor: TensorId, channel: &Channel, index: usize) {
        debug_assert!(self.network.tensor(tensor).is_ref);
        let slot = self.address(tensor) as *mut *mut u8;
        unsafe { *slot = channel.at(index) };
    }

    /// Format one parameter as text.
    pub fn tensor_to_string(&self, tensor: TensorId) -> String {
        let t = self.network.tensor(tensor);
        let mut p = unsafe { self.data.add(t.offset.unwrap_or(0)) } as *const u8;
        if t.is_ref {
            p = unsafe { *(p as *const *const u8) };
            if p.is_null() {
                return "null".to_string();
            }
        }
        if t.shape.partial() {
            return "*".to_string();
        }
        match t.rank() {
            0 => format_element(t.ty, p),
            1 => {
                let mut s = String::from("[");
                for r in 0..t.dim(0).max(0) as usize {
                    if r > 0 {
                        s.push(',');
                    }
                    s.push_str(&format_element(t.ty, unsafe { p.add(t.offset_of(r)) }));
                }
                s.push(']');
                s
            }
            2 => {
                let mut s = String::from("[");
                for r in 0..t.dim(0).max(0) as usize {
                    if r > 0 {
                        s.push(',');
                    }
                    s.push('[');
                    for c in 0..t.dim(1).max(0) as usize {
                        if c > 0 {
                            s.push(',');
                        }
                        s.push_str(&format_element(t.ty, unsafe { p.add(t.offset_of2(r, c)) }));
                    }
                    s.push(']');
                }
                s.push(']');
                s
            }
            rank => format!("<<{rank}D tensor>>"),
        }
    }
}

impl fmt::Display for Instance<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for t in self.network.tensors() {
            if t.cell == Some(self.cell) && t.shared.is_none() && !t.is_constant() {
                writeln!(f, "{} = {}", t.name, self.tensor_to_string(t.id))?;
            }
        }
        Ok(())
    }
}

impl Drop for Instance<'_> {
    fn drop(&mut self) {
        self.network
            .runtime()
            .free_instance(self.data, self.size, self.alignment);
    }
}

fn format_element(ty: Type, p: *const u8) -> String {
    unsafe {
        match ty {
            Type::Float32 => format!("{}", *(p as *const f32)),
            Type::Float64 => format!("{}", *(p as *const f64)),
            Type::Int8 => format!("{}", *(p as *const i8)),
            Type::Int16 => format!("{}", *(p as *const i16)),
            Type::Int32 => format!("{}", *(p as *const i32)),
            Type::Int64 => format!("{}", *(p as *const i64)),
            Type::Uint8 => format!("{}", *p),
            Type::Uint16 => format!("{}", *(p as *const u16)),
            Type::Bool => format!("{}", *p != 0),
        }
    }
}

/// A growable array of connector-shaped elements.
pub struct Channel<'n> {
    network: &'n Network,
    connector: ConnectorId,
    data: *mut u8,
    len: usize,
    capacity: usize,
}

unsafe impl Send for Channel<'_> {}

impl<'n> Channel<'n> {
    /// Create an empty channel for a connector.
    pub fn new(network: &'n Network, connector: ConnectorId) -> Channel<'n> {
        Channel {
            network,
            connector,
            data: std::ptr::null_mut(),
            len: 0,
            capacity: 0,
        }
    }

    /// Size of one channel element in bytes.
    pub fn element_size(&self) -> usize {
        let type_tensor = self.network.connector(self.connector).type_tensor;
        self.network.tensor(type_tensor).size
    }

    pub fn alignment(&self) -> usize {
        self.network.connector(self.connector).alignment
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to a channel element.
    pub fn at(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.len);
        unsafe { self.data.add(index * self.element_size()) }
    }

    /// Remove all elements.
    pub fn clear(&mut self) -> CompileResult<()> {
        self.resize(0)
    }

    /// Change the number of elements, growing with amortized reallocation.
    pub fn resize(&mut self, n: usize) -> CompileResult<()> {
        if n > self.capacity {
            let cap = (self.capacity * 2).max(n).max(8);
            self.reserve(cap)?;
        }
        if n > self.len {
            let elem = self.element_size();
            self.network
                .runtime()
                .clear_channel(unsafe { self.data.add(self.len * elem) }, (n - self.len) * elem);
        }
        self.len = n;
        Ok(())
    }

    /// Reserve space for channel elements; never shrinks.
    pub fn reserve(&mut self, n: usize) -> CompileResult<()> {
        if n < self.len || n == self.capacity {
            return Ok(());
        }
        let elem = self.element_size();
        let buffer = self
            .network
            .runtime()
            .allocate_channel(n * elem, self.alignment())?;
        if !self.data.is_null() {
            unsafe { std::ptr::copy_nonoverlapping(self.data, buffer, self.len * elem) };
            self.network
                .runtime()
                .free_channel(self.data, self.capacity * elem, self.alignment());
        }
        self.data = buffer;
        self.capacity = n;
        Ok(())
    }

    /// Add an element to the channel and return it.
    pub fn push(&mut self) -> CompileResult<*mut u8> {
        self.resize(self.len + 1)?;
        Ok(self.at(self.len - 1))
    }

    /// Remove the last element.
    pub fn pop(&mut self) -> CompileResult<()> {
        if self.len > 0 {
            self.resize(self.len - 1)?;
        }
        Ok(())
    }
}

impl Drop for Channel<'_> {
    fn drop(&mut self) {
        if !self.data.is_null() {
            let elem = self.element_size();
            self.network
                .runtime()
                .free_channel(self.data, self.capacity * elem, self.alignment());
        }
    }
}
