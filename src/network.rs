//! Compiled networks.
//!
//! A [`Network`] is the compiled form of a flow: cells with generated code,
//! tensors with planned layout, and steps bound to kernels. Compilation
//! runs in phases: tensor and cell construction, kernel selection, the
//! kernel adjust phase, memory planning, constant placement, and finally
//! code emission through the macro assembler.

use std::alloc::Layout;
use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::error::{CompileError, CompileResult};
use crate::flow::{Attributes, Flow, Transformer, VarId};
use crate::masm::{Code, MacroAssembler};
use crate::runtime::{Runtime, Transfer, TransferDirection};
use crate::tensor::{ConstData, Order, Placement, Tensor, TensorId, MIN_DATA_ALIGNMENT};

/// Cache line size assumed for instance and constant alignment.
pub const CACHE_LINE_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StepId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CellId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectorId(pub usize);

/// Code generator for one kind of operation.
pub trait Kernel {
    /// Descriptive name for the kernel.
    fn name(&self) -> &str;

    /// Name of the operation supported by the kernel.
    fn operation(&self) -> &str;

    /// Location of the kernel computation.
    fn location(&self) -> Placement {
        Placement::Host
    }

    /// Check if the kernel supports generating code for a step.
    fn supports(&self, net: &Network, step: StepId) -> bool;

    /// Let the kernel declare layout constraints for a step.
    fn adjust(&self, _net: &mut Network, _step: StepId) -> CompileResult<()> {
        Ok(())
    }

    /// Generate code for a step.
    fn generate(&self, net: &Network, step: StepId, masm: &mut MacroAssembler)
        -> CompileResult<()>;

    /// Number of numeric operations the kernel performs for a step.
    fn complexity(&self, _net: &Network, _step: StepId) -> i64 {
        -1
    }
}

/// Registry of kernels and flow transformers passed to the compiler.
#[derive(Default)]
pub struct Library {
    kernels: HashMap<String, Vec<Box<dyn Kernel>>>,
    transformers: Vec<Box<dyn Transformer>>,
    noops: Vec<String>,
}

impl Library {
    pub fn new() -> Self {
        Library::default()
    }

    /// Register a kernel. Selection tries kernels for an operation in
    /// registration order and picks the first supporting one.
    pub fn register(&mut self, kernel: Box<dyn Kernel>) {
        trace!("add {} for {}", kernel.name(), kernel.operation());
        self.kernels
            .entry(kernel.operation().to_string())
            .or_default()
            .push(kernel);
    }

    pub fn register_transformer(&mut self, transformer: Box<dyn Transformer>) {
        self.transformers.push(transformer);
    }

    /// Register an identity operation that can be eliminated from flows.
    pub fn register_noop(&mut self, op: &str) {
        self.noops.push(op.to_string());
    }

    pub fn lookup(&self, op: &str) -> &[Box<dyn Kernel>] {
        self.kernels.get(op).map(|k| k.as_slice()).unwrap_or(&[])
    }

    pub fn transformers(&self) -> &[Box<dyn Transformer>] {
        &self.transformers
    }

    pub fn noops(&self) -> &[String] {
        &self.noops
    }
}

/// A compiled operation within a cell.
pub struct Step {
    pub id: StepId,
    pub name: String,
    /// Operation type.
    pub kind: String,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub attrs: Attributes,
    pub cell: CellId,
    /// Task index within the cell; -1 is the main task.
    pub task_index: i32,
    /// Index of the selected kernel in the library's list for `kind`.
    pub kernel_index: usize,
    pub kernel_name: String,
    /// Generator variant chosen during the adjust phase.
    pub variant: String,
}

impl Step {
    pub fn indegree(&self) -> usize {
        self.inputs.len()
    }

    pub fn outdegree(&self) -> usize {
        self.outputs.len()
    }

    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name)
    }
}

/// Task bookkeeping for a cell.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    /// Task id from the flow.
    pub task: i32,
    /// Instance offset of the task structure.
    pub offset: usize,
    /// Placement of the task computation.
    pub placement: Placement,
}

/// A compiled flow function: generated code plus instance layout.
pub struct Cell {
    pub id: CellId,
    pub name: String,
    pub steps: Vec<StepId>,
    pub tasks: Vec<TaskInfo>,
    /// General-purpose registers needed by the cell.
    pub register_usage: usize,
    pub code: Code,
    pub instance_size: usize,
    pub instance_alignment: usize,
    pub device_instance_size: usize,
    pub device_instance_alignment: usize,
}

impl Cell {
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_offset(&self, index: usize) -> usize {
        self.tasks[index].offset
    }

    /// Write the generated code to a file for offline disassembly.
    pub fn write_code_to_file(&self, filename: &str) -> std::io::Result<()> {
        std::fs::write(filename, self.code.bytes())
    }
}

/// A connector describes the element type of a channel and the reference
/// tensors bound to it.
pub struct Connector {
    pub id: ConnectorId,
    pub name: String,
    /// Tensor describing the element type of the channel.
    pub type_tensor: TensorId,
    pub links: Vec<TensorId>,
    /// Channel array alignment in bytes.
    pub alignment: usize,
}

/// Compilation options for a network.
#[derive(Clone, Copy, Debug)]
pub struct NetworkOptions {
    /// Default element order for parameters.
    pub parameter_element_order: Order,
    /// Insert a breakpoint at the beginning of each cell.
    pub debug: bool,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        NetworkOptions {
            parameter_element_order: Order::RowMajor,
            debug: false,
        }
    }
}

/// Aligned memory block owned by the network. Blocks hold constant tensor
/// data which is written during compilation and immutable afterwards.
struct MemoryBlock {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    fn alloc(size: usize, align: usize) -> CompileResult<MemoryBlock> {
        let layout =
            Layout::from_size_align(size.max(1), align).map_err(|e| CompileError::Allocation {
                reason: format!("invalid constant layout: {e}"),
            })?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(CompileError::Allocation {
                reason: format!("cannot allocate {size} bytes for constants"),
            });
        }
        Ok(MemoryBlock { ptr, layout })
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

/// A network is a collection of compiled cells and tensors.
pub struct Network {
    pub(crate) cells: Vec<Cell>,
    pub(crate) steps: Vec<Step>,
    pub(crate) tensors: Vec<Tensor>,
    pub(crate) connectors: Vec<Connector>,
    names: HashMap<String, TensorId>,
    memory: Vec<MemoryBlock>,
    runtime: Box<dyn Runtime>,
    pub(crate) options: NetworkOptions,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network").finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Active,
    Completed,
}

impl Network {
    /// Compile a flow into a network. The flow is analyzed (transformed and
    /// ordered) first and is consumed in the sense that it may be rewritten.
    pub fn compile(
        flow: &mut Flow,
        library: &Library,
        runtime: Box<dyn Runtime>,
        options: NetworkOptions,
    ) -> CompileResult<Network> {
        flow.analyze(library)?;

        let mut net = Network {
            cells: Vec::new(),
            steps: Vec::new(),
            tensors: Vec::new(),
            connectors: Vec::new(),
            names: HashMap::new(),
            memory: Vec::new(),
            runtime,
            options,
        };

        // Create tensors for all variables.
        let mut tensor_of: HashMap<VarId, TensorId> = HashMap::new();
        let mut const_data: HashMap<TensorId, Vec<u8>> = HashMap::new();
        for var in flow.vars() {
            let id = TensorId(net.tensors.len());
            let mut tensor = Tensor::new(id, &var.name, var.ty, var.shape.clone());
            tensor.is_ref = var.is_ref;
            tensor.input = var.input;
            tensor.output = var.output;
            if let Some(data) = &var.data {
                tensor.constant = true;
                const_data.insert(id, data.clone());
            } else {
                tensor.required_order = options.parameter_element_order;
            }
            if var.input || var.output {
                tensor.placement = tensor.placement.add(Placement::Host);
            }
            net.names.insert(var.name.clone(), id);
            for alias in &var.aliases {
                net.names.insert(alias.clone(), id);
            }
            tensor_of.insert(var.id, id);
            net.tensors.push(tensor);
        }

        // Create connectors.
        for cnx in flow.cnxs() {
            if cnx.links.is_empty() {
                warn!("skipping empty connector: {}", cnx.name);
                continue;
            }
            let prototype = tensor_of[&cnx.links[0]];
            let id = TensorId(net.tensors.len());
            let proto = &net.tensors[prototype.0];
            let mut shape = proto.shape.clone();
            if shape.rank() > 0 {
                shape.set(0, -1);
            }
            let mut type_tensor = Tensor::new(id, &cnx.name, proto.ty, shape);
            type_tensor.required_order = Order::RowMajor;
            type_tensor.alignment = proto.alignment.clone();
            type_tensor.byte_alignment = proto.byte_alignment;
            net.tensors.push(type_tensor);

            let connector_id = ConnectorId(net.connectors.len());
            let mut links = Vec::new();
            for &link in &cnx.links {
                let linked = tensor_of[&link];
                if !net.tensors[linked.0].is_ref {
                    return Err(CompileError::MalformedFlow {
                        reason: format!(
                            "connector {} links non-reference variable {}",
                            cnx.name, net.tensors[linked.0].name
                        ),
                    });
                }
                net.tensors[linked.0].link = Some(id);
                links.push(linked);
            }
            net.connectors.push(Connector {
                id: connector_id,
                name: cnx.name.clone(),
                type_tensor: id,
                links,
                alignment: MIN_DATA_ALIGNMENT,
            });
        }

        // Create cells and steps, and select kernels.
        let mut cell_of_func: HashMap<usize, CellId> = HashMap::new();
        for &op_id in flow.ops_in_order() {
            let op = flow.op(op_id);
            let func = op.func.ok_or_else(|| CompileError::MalformedFlow {
                reason: format!("operation {} is not part of a function", op.name),
            })?;
            let cell_id = match cell_of_func.get(&func.0) {
                Some(&cell) => cell,
                None => {
                    let cell = CellId(net.cells.len());
                    net.cells.push(Cell {
                        id: cell,
                        name: flow.func(func).name.clone(),
                        steps: Vec::new(),
                        tasks: Vec::new(),
                        register_usage: 0,
                        code: Code::empty(),
                        instance_size: 0,
                        instance_alignment: MIN_DATA_ALIGNMENT,
                        device_instance_size: 0,
                        device_instance_alignment: MIN_DATA_ALIGNMENT,
                    });
                    cell_of_func.insert(func.0, cell);
                    cell
                }
            };

            let step_id = StepId(net.steps.len());
            let mut step = Step {
                id: step_id,
                name: op.name.clone(),
                kind: op.kind.clone(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                attrs: op.attrs.clone(),
                cell: cell_id,
                task_index: -1,
                kernel_index: 0,
                kernel_name: String::new(),
                variant: String::new(),
            };

            for &input in &op.inputs {
                let tensor = tensor_of[&input];
                step.inputs.push(tensor);
                net.tensors[tensor.0].consumers.push(step_id);
                let is_const = const_data.contains_key(&tensor);
                net.assign_tensor_to_cell(tensor, cell_id, &op.name, is_const)?;
            }
            for &output in &op.outputs {
                let tensor = tensor_of[&output];
                step.outputs.push(tensor);
                if net.tensors[tensor.0].producer.is_some() {
                    return Err(CompileError::MalformedFlow {
                        reason: format!(
                            "variable {} has multiple producers",
                            net.tensors[tensor.0].name
                        ),
                    });
                }
                net.tensors[tensor.0].producer = Some(step_id);
                let is_const = const_data.contains_key(&tensor);
                net.assign_tensor_to_cell(tensor, cell_id, &op.name, is_const)?;
            }

            // Assign the step to a task when the runtime can run it in
            // parallel.
            if net.runtime.supports_async() && op.task != 0 {
                let cell = &mut net.cells[cell_id.0];
                let taskidx = match cell.tasks.iter().position(|t| t.task == op.task) {
                    Some(idx) => idx,
                    None => {
                        cell.tasks.push(TaskInfo {
                            task: op.task,
                            offset: 0,
                            placement: Placement::Nowhere,
                        });
                        cell.tasks.len() - 1
                    }
                };
                step.task_index = taskidx as i32;
            }

            net.steps.push(step);
            net.cells[cell_id.0].steps.push(step_id);

            // Select the first registered kernel that supports the step and
            // whose location is compatible with the task placement.
            let mut selected = None;
            for (index, kernel) in library.lookup(&net.steps[step_id.0].kind).iter().enumerate() {
                if !kernel.supports(&net, step_id) {
                    trace!(
                        "{} does not support {}",
                        kernel.name(),
                        net.steps[step_id.0].name
                    );
                    continue;
                }
                let task_index = net.steps[step_id.0].task_index;
                if task_index >= 0 {
                    let task = &mut net.cells[cell_id.0].tasks[task_index as usize];
                    if task.placement == Placement::Nowhere {
                        task.placement = kernel.location();
                    } else if task.placement != kernel.location() {
                        trace!("{} cannot run with task placement", kernel.name());
                        continue;
                    }
                }
                selected = Some((index, kernel.name().to_string()));
                break;
            }
            match selected {
                Some((index, name)) => {
                    debug!("step {} implemented by {}", net.steps[step_id.0].name, name);
                    net.steps[step_id.0].kernel_index = index;
                    net.steps[step_id.0].kernel_name = name;
                }
                None => {
                    return Err(CompileError::NoKernel {
                        step: net.steps[step_id.0].name.clone(),
                        op: net.steps[step_id.0].kind.clone(),
                    })
                }
            }
        }

        // Let kernels adjust layout constraints.
        for step_id in (0..net.steps.len()).map(StepId) {
            let kind = net.steps[step_id.0].kind.clone();
            let index = net.steps[step_id.0].kernel_index;
            library.lookup(&kind)[index].adjust(&mut net, step_id)?;
        }

        // Plan instance memory.
        crate::planner::plan(&mut net)?;

        // Copy and align constants.
        net.place_constants(&const_data)?;

        // Generate code for each cell.
        emit_cells(&mut net, library)?;

        crate::planner::validate(&net)?;

        Ok(net)
    }

    fn assign_tensor_to_cell(
        &mut self,
        tensor: TensorId,
        cell: CellId,
        op_name: &str,
        is_const: bool,
    ) -> CompileResult<()> {
        // Constants can be shared between cells; parameters cannot.
        if is_const {
            return Ok(());
        }
        match self.tensors[tensor.0].cell {
            None => {
                self.tensors[tensor.0].cell = Some(cell);
                Ok(())
            }
            Some(existing) if existing == cell => Ok(()),
            Some(existing) => Err(CompileError::MalformedFlow {
                reason: format!(
                    "{} used by op {} belongs to both {} and {}",
                    self.tensors[tensor.0].name,
                    op_name,
                    self.cells[existing.0].name,
                    self.cells[cell.0].name
                ),
            }),
        }
    }

    /// Copy constant data into aligned network-owned memory.
    fn place_constants(&mut self, const_data: &HashMap<TensorId, Vec<u8>>) -> CompileResult<()> {
        for (&tensor_id, data) in const_data {
            let (size, alignment, rank, dims, strides, elem_size, dense) = {
                let t = &self.tensors[tensor_id.0];
                let mut alignment = t.byte_alignment.max(MIN_DATA_ALIGNMENT);
                if alignment < CACHE_LINE_SIZE {
                    alignment = CACHE_LINE_SIZE;
                }
                let dims: Vec<usize> = (0..t.rank()).map(|d| t.dim(d).max(0) as usize).collect();
                let strides: Vec<usize> =
                    (0..t.rank()).map(|d| t.stride.dim(d) as usize).collect();
                let dense = t.aligned == t.shape && t.order == Order::RowMajor;
                (
                    t.size,
                    alignment,
                    t.rank(),
                    dims,
                    strides,
                    t.element_size(),
                    dense,
                )
            };
            let block = MemoryBlock::alloc(size, alignment)?;
            let dst = block.ptr;
            if rank <= 1 || dense {
                let n = data.len().min(size);
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, n) };
            } else if rank == 2 {
                // Copy element by element honoring stride and order. The
                // source data is densely packed in row-major order.
                let available = data.len() / elem_size.max(1);
                let mut element = 0usize;
                'copy: for r in 0..dims[0] {
                    for c in 0..dims[1] {
                        if element >= available {
                            break 'copy;
                        }
                        let offset = r * strides[0] + c * strides[1];
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                data.as_ptr().add(element * elem_size),
                                dst.add(offset),
                                elem_size,
                            );
                        }
                        element += 1;
                    }
                }
            } else {
                return Err(CompileError::MalformedFlow {
                    reason: format!(
                        "{}D constant tensor with padding not supported: {}",
                        rank, self.tensors[tensor_id.0].name
                    ),
                });
            }
            self.tensors[tensor_id.0].data = Some(ConstData::new(dst, size));
            self.tensors[tensor_id.0].placement =
                self.tensors[tensor_id.0].placement.add(Placement::Host);
            self.memory.push(block);
        }
        Ok(())
    }

    pub fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    pub fn options(&self) -> &NetworkOptions {
        &self.options
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id.0]
    }

    /// Mutable access to a pair of distinct tensors.
    pub fn tensor_pair_mut(&mut self, a: TensorId, b: TensorId) -> (&mut Tensor, &mut Tensor) {
        debug_assert_ne!(a, b);
        if a.0 < b.0 {
            let (lo, hi) = self.tensors.split_at_mut(b.0);
            (&mut lo[a.0], &mut hi[0])
        } else {
            let (lo, hi) = self.tensors.split_at_mut(a.0);
            (&mut hi[0], &mut lo[b.0])
        }
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.0]
    }

    pub fn step_mut(&mut self, id: StepId) -> &mut Step {
        &mut self.steps[id.0]
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id.0]
    }

    pub fn cell_mut(&mut self, id: CellId) -> &mut Cell {
        &mut self.cells[id.0]
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn connector(&self, id: ConnectorId) -> &Connector {
        &self.connectors[id.0]
    }

    pub fn find_cell(&self, name: &str) -> Option<CellId> {
        self.cells.iter().find(|c| c.name == name).map(|c| c.id)
    }

    pub fn find_tensor(&self, name: &str) -> Option<TensorId> {
        self.names.get(name).copied()
    }

    pub fn find_connector(&self, name: &str) -> Option<ConnectorId> {
        self.connectors
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id)
    }

    pub fn step_input(&self, step: StepId, index: usize) -> &Tensor {
        &self.tensors[self.steps[step.0].inputs[index].0]
    }

    pub fn step_output(&self, step: StepId, index: usize) -> &Tensor {
        &self.tensors[self.steps[step.0].outputs[index].0]
    }

    pub(crate) fn step_kernel<'l>(&self, library: &'l Library, step: StepId) -> &'l dyn Kernel {
        let s = &self.steps[step.0];
        library.lookup(&s.kind)[s.kernel_index].as_ref()
    }

    /// Declare the number of general-purpose registers needed by a step.
    pub fn set_step_register_usage(&mut self, step: StepId, regs: usize) {
        let cell = self.steps[step.0].cell;
        if self.cells[cell.0].register_usage < regs {
            self.cells[cell.0].register_usage = regs;
        }
    }

    /// Declare the number of preserved registers needed by a step; there are
    /// eight caller-saved registers on top.
    pub fn set_step_preserved_register_usage(&mut self, step: StepId, regs: usize) {
        self.set_step_register_usage(step, 8 + regs);
    }

    /// Allow in-place operation between an input and an output of a step.
    /// Returns true if in-place reuse is possible: the step must be the only
    /// consumer of the input and reference kinds must match.
    pub fn allow_in_place(&mut self, step: StepId, input: usize, output: usize) -> bool {
        let input_id = self.steps[step.0].inputs[input];
        let output_id = self.steps[step.0].outputs[output];
        {
            let input_tensor = &self.tensors[input_id.0];
            let output_tensor = &self.tensors[output_id.0];
            if input_tensor.consumers.len() != 1 {
                return false;
            }
            if input_tensor.is_ref != output_tensor.is_ref {
                return false;
            }
            if input_tensor.is_constant() {
                return false;
            }
            if output_tensor.shared.is_some() {
                return false;
            }
        }
        self.tensors[output_id.0].shared = Some(input_id);
        if self.tensors[output_id.0].shape == self.tensors[input_id.0].shape
            && self.tensors[output_id.0].link.is_none()
        {
            self.tensors[output_id.0].link = Some(input_id);
        }
        true
    }

    /// Link two tensors so the planner gives them identical alignment.
    pub fn link_tensors(&mut self, a: TensorId, b: TensorId) {
        if a != b && self.tensors[a.0].link.is_none() {
            self.tensors[a.0].link = Some(b);
        }
    }

    /// Require two step operands to share alignment requirements.
    pub fn same_align(&mut self, a: TensorId, b: TensorId) {
        if a == b {
            return;
        }
        let (ta, tb) = self.tensor_pair_mut(a, b);
        crate::tensor::same_align(ta, tb);
    }

    /// Require two step operands to have broadcast-compatible alignment.
    pub fn compatible_align(&mut self, a: TensorId, b: TensorId) {
        if a == b {
            return;
        }
        let (ta, tb) = self.tensor_pair_mut(a, b);
        crate::tensor::compatible_align(ta, tb);
    }

    /// Return the task index shared by all consumers of a tensor, or -1 if
    /// it is consumed by steps in different tasks.
    pub fn consumer_task(&self, tensor: TensorId) -> i32 {
        let mut consumer_task = -2;
        for &step in &self.tensors[tensor.0].consumers {
            let task = self.steps[step.0].task_index;
            if consumer_task == -2 {
                consumer_task = task;
            } else if consumer_task != task {
                return -1;
            }
        }
        if consumer_task == -2 {
            -1
        } else {
            consumer_task
        }
    }

    /// A host step in the main task that consumes tensors produced on the
    /// device needs synchronization before executing.
    pub fn needs_synchronization(&self, step: StepId) -> bool {
        let s = &self.steps[step.0];
        if s.task_index != -1 {
            return false;
        }
        for &input in &s.inputs {
            if let Some(producer) = self.tensors[input.0].producer {
                if self.steps[producer.0].task_index == -1
                    && !self.step_placement(producer).on_host()
                {
                    return true;
                }
            }
        }
        false
    }

    /// Placement of a step's computation. All bundled kernels run on the
    /// host; device kernels would report their own location.
    pub fn step_placement(&self, _step: StepId) -> Placement {
        Placement::Host
    }

    /// Describe a cell's instance layout and steps in text form.
    pub fn cell_to_string(&self, cell: CellId) -> String {
        use std::fmt::Write;
        let c = &self.cells[cell.0];
        let mut s = String::new();
        let _ = writeln!(s, "cell {} {{  // size {}", c.name, c.instance_size);

        let mut fields: Vec<&Tensor> = self
            .tensors
            .iter()
            .filter(|t| t.cell == Some(cell) && !t.is_constant())
            .collect();
        fields.sort_by_key(|t| t.offset.unwrap_or(usize::MAX));
        let mut prev_offset = None;
        for t in &fields {
            if t.placement.on_host() && t.offset.is_some() {
                if t.offset == prev_offset {
                    let _ = write!(s, "    union ");
                } else {
                    let _ = write!(s, "  var ");
                }
                let _ = writeln!(
                    s,
                    "{}: {}  // offset {} size {}",
                    t.name,
                    t.type_string(),
                    t.offset.unwrap_or(0),
                    t.space
                );
                prev_offset = t.offset;
            }
        }

        let mut constants: Vec<&Tensor> = Vec::new();
        for &step in &c.steps {
            for &input in &self.steps[step.0].inputs {
                let t = &self.tensors[input.0];
                if t.is_constant() && !constants.iter().any(|k| k.id == t.id) {
                    constants.push(t);
                }
            }
        }
        if !constants.is_empty() {
            let _ = writeln!(s);
            for t in constants {
                let _ = writeln!(s, "  const {}: {}   // size {}", t.name, t.type_string(), t.size);
            }
        }

        if !c.steps.is_empty() {
            let _ = writeln!(s);
            for &step in &c.steps {
                let st = &self.steps[step.0];
                let _ = write!(s, "  ");
                if !st.outputs.is_empty() {
                    for (i, &output) in st.outputs.iter().enumerate() {
                        if i > 0 {
                            let _ = write!(s, ", ");
                        }
                        let _ = write!(s, "{}", self.tensors[output.0].name);
                    }
                    let _ = write!(s, " = ");
                }
                let _ = write!(s, "{}(", st.kernel_name);
                for (i, &input) in st.inputs.iter().enumerate() {
                    if i > 0 {
                        let _ = write!(s, ", ");
                    }
                    let _ = write!(s, "{}", self.tensors[input.0].name);
                }
                let _ = writeln!(s, ")");
            }
        }
        s.push_str("}\n");
        s
    }
}

/// Tensor transfers needed for a cell: tensors placed everywhere must be
/// copied to the side they were not produced on.
fn collect_transfers(net: &Network, cell: CellId) -> Vec<Transfer> {
    let mut xfers = Vec::new();
    for tensor in &net.tensors {
        if tensor.cell != Some(cell) || tensor.placement != Placement::Everywhere {
            continue;
        }
        let produced_on_host = match tensor.producer {
            Some(producer) => net.step_placement(producer).on_host(),
            None => true,
        };
        xfers.push(Transfer {
            tensor: tensor.id,
            direction: if produced_on_host {
                TransferDirection::HostToDevice
            } else {
                TransferDirection::DeviceToHost
            },
            task: net.consumer_task(tensor.id),
        });
    }
    xfers
}

/// Generate code for every cell in the network.
fn emit_cells(net: &mut Network, library: &Library) -> CompileResult<()> {
    let cell_ids: Vec<CellId> = (0..net.cells.len()).map(CellId).collect();
    for cell_id in cell_ids {
        let mut masm = MacroAssembler::new()?;
        if !masm.rr().usage(net.cells[cell_id.0].register_usage) {
            return Err(CompileError::RegisterOverflow {
                step: net.cells[cell_id.0].name.clone(),
            });
        }
        if net.options.debug {
            masm.breakpoint()?;
        }
        masm.prolog()?;
        if let Some(func) = net.runtime.start_profiler_func() {
            masm.call_instance_function(Some(func as usize))?;
        }

        // Transfers for tensors that must be available on both sides.
        let xfers = collect_transfers(net, cell_id);
        net.runtime
            .emit_tensor_transfers(&xfers, &net.cells[cell_id.0], &mut masm)?;
        let mut sync = xfers.iter().any(|x| x.task == -1);

        let num_tasks = net.cells[cell_id.0].tasks.len();
        let entries: Vec<_> = (0..num_tasks).map(|_| masm.create_label()).collect();
        let mut states = vec![TaskState::Pending; num_tasks];
        let wait_fn = net.runtime.wait_task_func() as usize;
        let start_fn = net.runtime.start_task_func() as usize;
        let sync_fn = net.runtime.sync_main_func().map(|f| f as usize);

        let steps = net.cells[cell_id.0].steps.clone();
        for &step_id in &steps {
            let task_index = net.steps[step_id.0].task_index;
            if task_index == -1 {
                // Wait for completion of all inputs produced by tasks.
                for input in net.steps[step_id.0].inputs.clone() {
                    let producer = match net.tensors[input.0].producer {
                        Some(p) => p,
                        None => continue,
                    };
                    let tidx = net.steps[producer.0].task_index;
                    if tidx < 0 {
                        continue;
                    }
                    let tidx = tidx as usize;
                    debug_assert!(states[tidx] != TaskState::Pending);
                    if states[tidx] == TaskState::Active {
                        masm.wait_task(net.cells[cell_id.0].tasks[tidx].offset, wait_fn)?;
                        states[tidx] = TaskState::Completed;
                    }
                }

                // Synchronize the main task if needed before the step runs.
                if sync && net.needs_synchronization(step_id) {
                    masm.call_instance_function(sync_fn)?;
                    sync = false;
                }

                let kernel = net.step_kernel(library, step_id);
                kernel.generate(net, step_id, &mut masm)?;

                // No registers are preserved between steps.
                masm.rr().reset();
                masm.mm().reset();
            } else {
                let tidx = task_index as usize;
                debug_assert!(states[tidx] != TaskState::Completed);
                if states[tidx] == TaskState::Pending {
                    if sync {
                        masm.call_instance_function(sync_fn)?;
                        sync = false;
                    }
                    let info = net.cells[cell_id.0].tasks[tidx].clone();
                    masm.start_task(info.offset, info.task, task_index, entries[tidx], start_fn)?;
                    states[tidx] = TaskState::Active;
                }
            }
        }

        // Make sure all tasks have completed.
        for tidx in 0..num_tasks {
            if states[tidx] == TaskState::Active {
                masm.wait_task(net.cells[cell_id.0].tasks[tidx].offset, wait_fn)?;
                states[tidx] = TaskState::Completed;
            }
        }
        if sync {
            masm.call_instance_function(sync_fn)?;
        }
        if let Some(func) = net.runtime.stop_profiler_func() {
            masm.call_instance_function(Some(func as usize))?;
        }
        masm.epilog()?;

        // Generate code for parallel task bodies at secondary entry points.
        for (tidx, entry) in entries.iter().enumerate() {
            let mut entry = *entry;
            masm.bind(&mut entry)?;
            masm.prolog()?;
            for &step_id in &steps {
                if net.steps[step_id.0].task_index == tidx as i32 {
                    let kernel = net.step_kernel(library, step_id);
                    kernel.generate(net, step_id, &mut masm)?;
                    masm.rr().reset();
                    masm.mm().reset();
                }
            }
            masm.epilog()?;
        }

        let code = masm.finalize()?;
        debug!(
            "cell {}: code size {}, instance size {}",
            net.cells[cell_id.0].name,
            code.size(),
            net.cells[cell_id.0].instance_size
        );
        net.cells[cell_id.0].code = code;
    }
    Ok(())
}
