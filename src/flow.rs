//! Flow graph model.
//!
//! A flow is a directed acyclic graph of variables and operations that
//! describes a computation over tensors. Flows are built programmatically,
//! rewritten by transformers, and finally consumed by [`crate::network`]
//! which compiles each flow function into executable code.
//!
//! Nodes live in tombstoned vectors owned by the [`Flow`] and reference each
//! other through the [`VarId`]/[`OpId`]/[`FuncId`]/[`CnxId`] index types, so
//! graph surgery never invalidates outstanding ids.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use log::debug;

use crate::error::{CompileError, CompileResult};
use crate::network::Library;

/// Element data types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Bool,
}

impl Type {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Type::Float32 => 4,
            Type::Float64 => 8,
            Type::Int8 => 1,
            Type::Int16 => 2,
            Type::Int32 => 4,
            Type::Int64 => 8,
            Type::Uint8 => 1,
            Type::Uint16 => 2,
            Type::Bool => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Type::Float32 => "float32",
            Type::Float64 => "float64",
            Type::Int8 => "int8",
            Type::Int16 => "int16",
            Type::Int32 => "int32",
            Type::Int64 => "int64",
            Type::Uint8 => "uint8",
            Type::Uint16 => "uint16",
            Type::Bool => "bool",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Type::Float32 | Type::Float64)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maps Rust scalar types to flow element types for typed instance access.
pub trait Element: Copy + Default + 'static {
    const TYPE: Type;
}

impl Element for f32 {
    const TYPE: Type = Type::Float32;
}
impl Element for f64 {
    const TYPE: Type = Type::Float64;
}
impl Element for i8 {
    const TYPE: Type = Type::Int8;
}
impl Element for i16 {
    const TYPE: Type = Type::Int16;
}
impl Element for i32 {
    const TYPE: Type = Type::Int32;
}
impl Element for i64 {
    const TYPE: Type = Type::Int64;
}
impl Element for u8 {
    const TYPE: Type = Type::Uint8;
}
impl Element for u16 {
    const TYPE: Type = Type::Uint16;
}

/// Tensor shape: an ordered list of dimension sizes. A dimension of -1 means
/// an unbounded batch dimension.
#[derive(Clone, Debug, Default, Eq)]
pub struct Shape {
    dims: Vec<i64>,
}

impl Shape {
    /// Scalar shape (rank 0).
    pub fn scalar() -> Self {
        Shape { dims: Vec::new() }
    }

    pub fn new(dims: &[i64]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, d: usize) -> i64 {
        self.dims[d]
    }

    pub fn set(&mut self, d: usize, size: i64) {
        self.dims[d] = size;
    }

    pub fn add(&mut self, size: i64) {
        self.dims.push(size);
    }

    /// Set all dimensions of a given rank to the same size.
    pub fn fill(&mut self, rank: usize, size: i64) {
        self.dims.clear();
        self.dims.resize(rank, size);
    }

    /// Total number of elements, or -1 if some dimension is unbounded.
    pub fn elements(&self) -> i64 {
        let mut n = 1i64;
        for &d in &self.dims {
            if d == -1 {
                return -1;
            }
            n *= d;
        }
        n
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Some dimension has zero size.
    pub fn undefined(&self) -> bool {
        self.elements() == 0
    }

    /// Some dimension has unspecified (-1) size.
    pub fn partial(&self) -> bool {
        self.elements() == -1
    }

    /// Shape equality where unbounded dimensions match anything.
    pub fn same_size(&self, other: &Shape) -> bool {
        if self.rank() != other.rank() {
            return false;
        }
        self.dims
            .iter()
            .zip(&other.dims)
            .all(|(&a, &b)| a == -1 || b == -1 || a == b)
    }

    /// Broadcast compatibility: trailing dimensions must match, where 1 and
    /// -1 match anything.
    pub fn compatible(&self, other: &Shape) -> bool {
        let mut d1 = self.rank() as isize - 1;
        let mut d2 = other.rank() as isize - 1;
        while d1 >= 0 && d2 >= 0 {
            let s1 = self.dim(d1 as usize);
            let s2 = other.dim(d2 as usize);
            d1 -= 1;
            d2 -= 1;
            if s1 == -1 || s1 == 1 {
                continue;
            }
            if s2 == -1 || s2 == 1 {
                continue;
            }
            if s1 != s2 {
                return false;
            }
        }
        true
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.same_size(other)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for &d in &self.dims {
            if !first {
                f.write_str("x")?;
            }
            first = false;
            if d == -1 {
                f.write_str("?")?;
            } else {
                write!(f, "{d}")?;
            }
        }
        Ok(())
    }
}

/// Key/value attribute list for operations.
#[derive(Clone, Debug, Default)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn set(&mut self, name: &str, value: &str) {
        for (n, v) in &mut self.0 {
            if n == name {
                *v = value.to_string();
                return;
            }
        }
        self.0.push((name.to_string(), value.to_string()));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FuncId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CnxId(pub usize);

/// Flow variable.
#[derive(Clone, Debug)]
pub struct Variable {
    pub id: VarId,
    pub name: String,
    pub aliases: Vec<String>,
    pub ty: Type,
    pub shape: Shape,
    /// Variable is a reference to data owned elsewhere (channel element).
    pub is_ref: bool,
    /// Constant data, owned by the variable.
    pub data: Option<Vec<u8>>,
    /// Variable is a function input.
    pub input: bool,
    /// Variable is externally observable.
    pub output: bool,
    pub producer: Option<OpId>,
    pub consumers: Vec<OpId>,
}

impl Variable {
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn elements(&self) -> i64 {
        self.shape.elements()
    }

    pub fn constant(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar() || self.elements() == 1
    }

    pub fn type_string(&self) -> String {
        let mut s = String::new();
        if self.is_ref {
            s.push('&');
        }
        s.push_str(self.ty.name());
        if !self.shape.is_scalar() {
            s.push('[');
            s.push_str(&self.shape.to_string());
            s.push(']');
        }
        s
    }

    /// Read the constant value as a scalar of type T.
    pub fn scalar_value<T: Element>(&self) -> Option<T> {
        let data = self.data.as_deref()?;
        if data.len() < std::mem::size_of::<T>() {
            return None;
        }
        let mut value = T::default();
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                &mut value as *mut T as *mut u8,
                std::mem::size_of::<T>(),
            );
        }
        Some(value)
    }
}

/// Flow operation.
#[derive(Clone, Debug)]
pub struct Operation {
    pub id: OpId,
    pub name: String,
    /// Operation type, e.g. "Add" or "Calculate".
    pub kind: String,
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
    pub attrs: Attributes,
    pub func: Option<FuncId>,
    /// Task id for parallel placement; 0 is the main task.
    pub task: i32,
}

impl Operation {
    pub fn indegree(&self) -> usize {
        self.inputs.len()
    }

    pub fn outdegree(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_input(&self, var: VarId) -> bool {
        self.inputs.contains(&var)
    }

    pub fn is_output(&self, var: VarId) -> bool {
        self.outputs.contains(&var)
    }

    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name)
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        self.attrs.set(name, value);
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.has(name)
    }
}

/// Flow function: one compilation unit.
#[derive(Clone, Debug)]
pub struct Function {
    pub id: FuncId,
    pub name: String,
    pub ops: Vec<OpId>,
}

/// Flow connector: a set of reference variables that share a channel type.
#[derive(Clone, Debug)]
pub struct FlowConnector {
    pub id: CnxId,
    pub name: String,
    pub links: Vec<VarId>,
}

/// Component type for applying rewrites to a flow. A transformer may choose
/// not to rewrite, but every rewrite it makes must preserve the
/// output-observable semantics of the flow.
pub trait Transformer {
    /// Descriptive name used in diagnostics.
    fn name(&self) -> &str;

    /// Apply rewrites to the flow; return true if anything changed.
    fn transform(&self, flow: &mut Flow) -> CompileResult<bool>;
}

/// Flow graph for computation.
#[derive(Default)]
pub struct Flow {
    vars: Vec<Option<Variable>>,
    ops: Vec<Option<Operation>>,
    funcs: Vec<Function>,
    cnxs: Vec<FlowConnector>,
    names: HashMap<String, VarId>,
    /// Execution order established by `sort`.
    order: Vec<OpId>,
    pub batch_size: i64,
}

impl Flow {
    pub fn new() -> Self {
        Flow {
            batch_size: -1,
            ..Default::default()
        }
    }

    /// Allocate a data buffer owned by the caller; kept for symmetry with
    /// constant rewrites that replace variable data.
    pub fn allocate_memory(&mut self, size: usize) -> Vec<u8> {
        vec![0u8; size]
    }

    pub fn add_var(&mut self, name: &str, ty: Type, shape: Shape) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(Some(Variable {
            id,
            name: name.to_string(),
            aliases: Vec::new(),
            ty,
            shape,
            is_ref: false,
            data: None,
            input: false,
            output: false,
            producer: None,
            consumers: Vec::new(),
        }));
        self.names.insert(name.to_string(), id);
        id
    }

    /// Add a constant variable with the given little-endian data.
    pub fn add_const(&mut self, name: &str, ty: Type, shape: Shape, data: Vec<u8>) -> VarId {
        let id = self.add_var(name, ty, shape);
        self.var_mut(id).data = Some(data);
        id
    }

    pub fn add_func(&mut self, name: &str) -> FuncId {
        let id = FuncId(self.funcs.len());
        self.funcs.push(Function {
            id,
            name: name.to_string(),
            ops: Vec::new(),
        });
        id
    }

    pub fn add_connector(&mut self, name: &str) -> CnxId {
        let id = CnxId(self.cnxs.len());
        self.cnxs.push(FlowConnector {
            id,
            name: name.to_string(),
            links: Vec::new(),
        });
        id
    }

    pub fn add_link(&mut self, cnx: CnxId, var: VarId) {
        self.cnxs[cnx.0].links.push(var);
    }

    pub fn add_op(&mut self, func: FuncId, name: &str, kind: &str) -> OpId {
        let id = OpId(self.ops.len());
        self.ops.push(Some(Operation {
            id,
            name: name.to_string(),
            kind: kind.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: Attributes::default(),
            func: Some(func),
            task: 0,
        }));
        self.funcs[func.0].ops.push(id);
        id
    }

    pub fn add_op_with(
        &mut self,
        func: FuncId,
        name: &str,
        kind: &str,
        inputs: &[VarId],
        outputs: &[VarId],
    ) -> OpId {
        let op = self.add_op(func, name, kind);
        for &input in inputs {
            self.add_input(op, input);
        }
        for &output in outputs {
            self.add_output(op, output);
        }
        op
    }

    pub fn var(&self, id: VarId) -> &Variable {
        self.vars[id.0].as_ref().expect("dead variable")
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut Variable {
        self.vars[id.0].as_mut().expect("dead variable")
    }

    pub fn op(&self, id: OpId) -> &Operation {
        self.ops[id.0].as_ref().expect("dead operation")
    }

    /// Check whether an operation is still part of the flow.
    pub fn op_alive(&self, id: OpId) -> bool {
        self.ops.get(id.0).map(|o| o.is_some()).unwrap_or(false)
    }

    /// Check whether a variable is still part of the flow.
    pub fn var_alive(&self, id: VarId) -> bool {
        self.vars.get(id.0).map(|v| v.is_some()).unwrap_or(false)
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Operation {
        self.ops[id.0].as_mut().expect("dead operation")
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.funcs[id.0]
    }

    pub fn funcs(&self) -> impl Iterator<Item = &Function> {
        self.funcs.iter()
    }

    pub fn cnxs(&self) -> impl Iterator<Item = &FlowConnector> {
        self.cnxs.iter()
    }

    pub fn vars(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter().filter_map(|v| v.as_ref())
    }

    pub fn ops(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter().filter_map(|o| o.as_ref())
    }

    pub fn var_ids(&self) -> Vec<VarId> {
        self.vars().map(|v| v.id).collect()
    }

    pub fn op_ids(&self) -> Vec<OpId> {
        self.ops().map(|o| o.id).collect()
    }

    /// Operations in execution order; valid after `sort`.
    pub fn ops_in_order(&self) -> &[OpId] {
        &self.order
    }

    pub fn find_var(&self, name: &str) -> Option<VarId> {
        self.names.get(name).copied().filter(|id| {
            self.vars[id.0].is_some()
        })
    }

    pub fn find_op(&self, name: &str) -> Option<OpId> {
        self.ops().find(|o| o.name == name).map(|o| o.id)
    }

    pub fn add_input(&mut self, op: OpId, var: VarId) {
        self.op_mut(op).inputs.push(var);
        self.var_mut(var).consumers.push(op);
    }

    pub fn add_output(&mut self, op: OpId, var: VarId) {
        debug_assert!(self.var(var).producer.is_none(), "variable already produced");
        self.op_mut(op).outputs.push(var);
        self.var_mut(var).producer = Some(op);
    }

    pub fn remove_input(&mut self, op: OpId, var: VarId) {
        let inputs = &mut self.op_mut(op).inputs;
        if let Some(pos) = inputs.iter().position(|&v| v == var) {
            inputs.remove(pos);
        }
        let consumers = &mut self.var_mut(var).consumers;
        if let Some(pos) = consumers.iter().position(|&o| o == op) {
            consumers.remove(pos);
        }
    }

    pub fn remove_output(&mut self, op: OpId, var: VarId) {
        let outputs = &mut self.op_mut(op).outputs;
        if let Some(pos) = outputs.iter().position(|&v| v == var) {
            outputs.remove(pos);
        }
        self.var_mut(var).producer = None;
    }

    /// Add an alias name for a variable.
    pub fn add_alias(&mut self, var: VarId, alias: &str) {
        self.var_mut(var).aliases.push(alias.to_string());
        self.names.insert(alias.to_string(), var);
    }

    /// Replace one input edge with another variable, keeping its position.
    pub fn replace_input(&mut self, op: OpId, from: VarId, to: VarId) {
        for i in 0..self.op(op).inputs.len() {
            if self.op(op).inputs[i] == from {
                self.op_mut(op).inputs[i] = to;
                let consumers = &mut self.var_mut(from).consumers;
                if let Some(pos) = consumers.iter().position(|&o| o == op) {
                    consumers.remove(pos);
                }
                self.var_mut(to).consumers.push(op);
                return;
            }
        }
    }

    /// Delete a variable; it must be fully detached.
    pub fn delete_var(&mut self, id: VarId) {
        let name = {
            let var = self.var(id);
            debug_assert!(var.producer.is_none() && var.consumers.is_empty());
            var.name.clone()
        };
        // The name may have been re-pointed to a surviving variable.
        if self.names.get(&name) == Some(&id) {
            self.names.remove(&name);
        }
        self.vars[id.0] = None;
    }

    /// Delete an operation, detaching all edges.
    pub fn delete_op(&mut self, id: OpId) {
        let inputs = self.op(id).inputs.clone();
        let outputs = self.op(id).outputs.clone();
        for var in inputs {
            self.remove_input(id, var);
        }
        for var in outputs {
            self.remove_output(id, var);
        }
        if let Some(func) = self.op(id).func {
            self.funcs[func.0].ops.retain(|&o| o != id);
        }
        self.ops[id.0] = None;
    }

    /// Remove an identity-like operation, bypassing it: all consumers of its
    /// output are redirected to its input. The op must have exactly one input
    /// and one output.
    pub fn eliminate(&mut self, id: OpId) {
        debug_assert_eq!(self.op(id).indegree(), 1);
        debug_assert_eq!(self.op(id).outdegree(), 1);
        let input = self.op(id).inputs[0];
        let output = self.op(id).outputs[0];
        for consumer in self.var(output).consumers.clone() {
            self.replace_input(consumer, output, input);
        }
        if self.var(output).output {
            let name = self.var(output).name.clone();
            self.var_mut(input).output = true;
            self.add_alias(input, &name);
        }
        self.delete_op(id);
        self.delete_var(output);
    }

    /// Check whether `var` transitively depends on `op`.
    pub fn depends_on(&self, var: VarId, op: OpId) -> bool {
        let mut queue = VecDeque::new();
        if let Some(producer) = self.var(var).producer {
            queue.push_back(producer);
        }
        let mut seen = vec![false; self.ops.len()];
        while let Some(cur) = queue.pop_front() {
            if cur == op {
                return true;
            }
            if seen[cur.0] {
                continue;
            }
            seen[cur.0] = true;
            for &input in &self.op(cur).inputs {
                if let Some(producer) = self.var(input).producer {
                    queue.push_back(producer);
                }
            }
        }
        false
    }

    /// Find a chain of operations matching a pattern. Each element is an op
    /// type, optionally prefixed with `i:` to require that the predecessor's
    /// first output feeds input `i` of the successor, e.g.
    /// `["Neg", "1:Add"]` matches a Neg whose output is input 1 of an Add.
    /// Returns the first matching chain.
    pub fn find(&self, pattern: &[&str]) -> Option<Vec<OpId>> {
        'candidates: for op in self.ops() {
            if op.kind != pattern[0] {
                continue;
            }
            let mut chain = vec![op.id];
            let mut cur = op.id;
            for step in &pattern[1..] {
                let (slot, kind) = match step.split_once(':') {
                    Some((idx, kind)) => (idx.parse::<usize>().ok(), kind),
                    None => (None, *step),
                };
                if self.op(cur).outputs.is_empty() {
                    continue 'candidates;
                }
                let out = self.op(cur).outputs[0];
                let next = self.var(out).consumers.iter().copied().find(|&c| {
                    let cop = self.op(c);
                    cop.kind == kind
                        && match slot {
                            Some(i) => cop.inputs.get(i) == Some(&out),
                            None => true,
                        }
                });
                match next {
                    Some(next) => {
                        chain.push(next);
                        cur = next;
                    }
                    None => continue 'candidates,
                }
            }
            return Some(chain);
        }
        None
    }

    /// Fuse two operations into a combined op of the given type. The first
    /// op absorbs the second: inputs of the second that are outputs of the
    /// first become internal (and are deleted when unobserved), shared inputs
    /// are unified, remaining inputs and all outputs of the second are
    /// appended in order. Returns the id of the combined op (the first).
    pub fn fuse(&mut self, first: OpId, second: OpId, combined: &str) -> OpId {
        let second_inputs = self.op(second).inputs.clone();
        for &var in &second_inputs {
            self.remove_input(second, var);
        }
        let mut seen: Vec<VarId> = Vec::new();
        for &var in &second_inputs {
            if seen.contains(&var) {
                continue;
            }
            seen.push(var);
            if self.op(first).is_output(var) {
                // Internal edge. Delete the variable entirely when the
                // second op was its only consumer and it is not observable.
                let observable = self.var(var).output || !self.var(var).consumers.is_empty();
                if !observable {
                    self.remove_output(first, var);
                    self.delete_var(var);
                }
            } else if !self.op(first).is_input(var) {
                self.add_input(first, var);
            }
        }
        let second_outputs = self.op(second).outputs.clone();
        for var in second_outputs {
            self.remove_output(second, var);
            self.add_output(first, var);
        }
        self.op_mut(first).kind = combined.to_string();
        self.delete_op(second);
        first
    }

    /// Extract the dependency closure of `outputs`, stopping at `inputs`,
    /// into a new function of `sub`. Constant data is cloned. Used for
    /// constant folding.
    pub fn extract(
        &self,
        name: &str,
        inputs: &[VarId],
        outputs: &[VarId],
        sub: &mut Flow,
    ) -> FuncId {
        let func = sub.add_func(name);
        let mut varmap: HashMap<VarId, VarId> = HashMap::new();
        let mut copy_var = |flow: &Flow, sub: &mut Flow, id: VarId, map: &mut HashMap<VarId, VarId>| {
            if let Some(&mapped) = map.get(&id) {
                return mapped;
            }
            let var = flow.var(id);
            let new_id = sub.add_var(&var.name, var.ty, var.shape.clone());
            sub.var_mut(new_id).data = var.data.clone();
            map.insert(id, new_id);
            new_id
        };

        // Walk back from the outputs, collecting ops until an input boundary.
        let mut pending: Vec<VarId> = outputs.to_vec();
        let mut visited: Vec<OpId> = Vec::new();
        while let Some(var) = pending.pop() {
            if inputs.contains(&var) {
                continue;
            }
            if let Some(op) = self.var(var).producer {
                if visited.contains(&op) {
                    continue;
                }
                visited.push(op);
                for &input in &self.op(op).inputs {
                    pending.push(input);
                }
            }
        }
        visited.reverse();
        for op_id in visited {
            let op = self.op(op_id);
            let new_op = sub.add_op(func, &op.name, &op.kind);
            sub.op_mut(new_op).attrs = op.attrs.clone();
            for &input in &op.inputs {
                let mapped = copy_var(self, sub, input, &mut varmap);
                sub.add_input(new_op, mapped);
            }
            for &output in &op.outputs {
                let mapped = copy_var(self, sub, output, &mut varmap);
                sub.add_output(new_op, mapped);
            }
        }
        for &input in inputs {
            if let Some(&mapped) = varmap.get(&input) {
                sub.var_mut(mapped).input = true;
            }
        }
        for &output in outputs {
            if let Some(&mapped) = varmap.get(&output) {
                sub.var_mut(mapped).output = true;
            }
        }
        func
    }

    /// Infer which variables are function inputs and outputs.
    fn infer_inputs_and_outputs(&mut self) {
        let ids = self.var_ids();
        for id in ids {
            let var = self.var(id);
            if var.producer.is_none() && !var.constant() {
                self.var_mut(id).input = true;
            } else if var.producer.is_some() && var.consumers.is_empty() {
                self.var_mut(id).output = true;
            }
        }
    }

    /// Sort operations in topological order of computation. Fails on cycles.
    pub fn sort(&mut self) -> CompileResult<()> {
        let ids = self.op_ids();
        let mut indegree: HashMap<OpId, usize> = HashMap::new();
        for &id in &ids {
            let mut n = 0;
            for &input in &self.op(id).inputs {
                if self.var(input).producer.is_some() {
                    n += 1;
                }
            }
            indegree.insert(id, n);
        }
        let mut ready: VecDeque<OpId> = ids
            .iter()
            .copied()
            .filter(|id| indegree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for &output in &self.op(id).outputs {
                for &consumer in &self.var(output).consumers {
                    let n = indegree.get_mut(&consumer).expect("unknown consumer");
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(consumer);
                    }
                }
            }
        }
        if order.len() != ids.len() {
            return Err(CompileError::MalformedFlow {
                reason: "cycle in flow graph".to_string(),
            });
        }
        // Re-sort each function's op list to match the global order.
        for func in &mut self.funcs {
            let members: Vec<OpId> = order
                .iter()
                .copied()
                .filter(|&id| self.ops[id.0].as_ref().map(|o| o.func) == Some(Some(func.id)))
                .collect();
            func.ops = members;
        }
        self.order = order;
        Ok(())
    }

    /// Analyze the flow: infer inputs/outputs, run the transformer pipeline
    /// from the library, and establish execution order.
    pub fn analyze(&mut self, library: &Library) -> CompileResult<()> {
        self.infer_inputs_and_outputs();
        crate::transform::run_pipeline(self, library)?;
        self.sort()?;
        if let Err(reason) = self.check_consistent() {
            return Err(CompileError::MalformedFlow { reason });
        }
        debug!(
            "analyzed flow: {} vars, {} ops, {} funcs",
            self.vars().count(),
            self.ops().count(),
            self.funcs.len()
        );
        Ok(())
    }

    /// Check graph consistency: edge symmetry and single producers.
    pub fn check_consistent(&self) -> Result<(), String> {
        for op in self.ops() {
            for &input in &op.inputs {
                if !self.var(input).consumers.contains(&op.id) {
                    return Err(format!(
                        "input {} of {} missing consumer edge",
                        self.var(input).name,
                        op.name
                    ));
                }
            }
            for &output in &op.outputs {
                if self.var(output).producer != Some(op.id) {
                    return Err(format!(
                        "output {} of {} has wrong producer",
                        self.var(output).name,
                        op.name
                    ));
                }
            }
        }
        for var in self.vars() {
            for &consumer in &var.consumers {
                if !self.op(consumer).inputs.contains(&var.id) {
                    return Err(format!(
                        "consumer edge from {} to dead input",
                        var.name
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for var in self.vars() {
            write!(f, "var {}: {}", var.name, var.type_string())?;
            if var.input {
                write!(f, " in")?;
            }
            if var.output {
                write!(f, " out")?;
            }
            if var.constant() {
                write!(f, " const")?;
            }
            writeln!(f)?;
        }
        for op in self.ops() {
            write!(f, "op {}: {}(", op.name, op.kind)?;
            for (i, &input) in op.inputs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", self.var(input).name)?;
            }
            write!(f, ") -> (")?;
            for (i, &output) in op.outputs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", self.var(output).name)?;
            }
            writeln!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_flow() -> (Flow, FuncId) {
        let mut flow = Flow::new();
        let func = flow.add_func("f");
        (flow, func)
    }

    #[test]
    fn test_shape_elements() {
        assert_eq!(Shape::new(&[8, 16]).elements(), 128);
        assert_eq!(Shape::scalar().elements(), 1);
        assert_eq!(Shape::new(&[-1, 4]).elements(), -1);
        assert_eq!(Shape::new(&[0, 4]).elements(), 0);
    }

    #[test]
    fn test_shape_compatibility() {
        let a = Shape::new(&[8, 16]);
        let b = Shape::new(&[16]);
        let c = Shape::new(&[8]);
        assert!(a.compatible(&b));
        assert!(!a.compatible(&c));
        assert!(a.compatible(&Shape::scalar()));
    }

    #[test]
    fn test_edge_symmetry() {
        let (mut flow, func) = simple_flow();
        let x = flow.add_var("x", Type::Float32, Shape::new(&[4]));
        let y = flow.add_var("y", Type::Float32, Shape::new(&[4]));
        let op = flow.add_op_with(func, "neg", "Neg", &[x], &[y]);
        assert_eq!(flow.var(x).consumers, vec![op]);
        assert_eq!(flow.var(y).producer, Some(op));
        flow.check_consistent().unwrap();
    }

    #[test]
    fn test_eliminate_bypasses_op() {
        let (mut flow, func) = simple_flow();
        let x = flow.add_var("x", Type::Float32, Shape::new(&[4]));
        let t = flow.add_var("t", Type::Float32, Shape::new(&[4]));
        let y = flow.add_var("y", Type::Float32, Shape::new(&[4]));
        let id_op = flow.add_op_with(func, "id", "Identity", &[x], &[t]);
        let neg = flow.add_op_with(func, "neg", "Neg", &[t], &[y]);
        flow.eliminate(id_op);
        assert_eq!(flow.op(neg).inputs, vec![x]);
        assert_eq!(flow.var(x).consumers, vec![neg]);
        flow.check_consistent().unwrap();
    }

    #[test]
    fn test_find_pattern_with_slot() {
        let (mut flow, func) = simple_flow();
        let a = flow.add_var("a", Type::Float32, Shape::new(&[4]));
        let b = flow.add_var("b", Type::Float32, Shape::new(&[4]));
        let nb = flow.add_var("nb", Type::Float32, Shape::new(&[4]));
        let y = flow.add_var("y", Type::Float32, Shape::new(&[4]));
        let neg = flow.add_op_with(func, "neg", "Neg", &[b], &[nb]);
        let add = flow.add_op_with(func, "add", "Add", &[a, nb], &[y]);
        assert_eq!(flow.find(&["Neg", "1:Add"]), Some(vec![neg, add]));
        assert_eq!(flow.find(&["Neg", "0:Add"]), None);
    }

    #[test]
    fn test_fuse_removes_intermediate() {
        let (mut flow, func) = simple_flow();
        let a = flow.add_var("a", Type::Float32, Shape::new(&[4]));
        let b = flow.add_var("b", Type::Float32, Shape::new(&[4]));
        let t = flow.add_var("t", Type::Float32, Shape::new(&[4]));
        let c = flow.add_var("c", Type::Float32, Shape::new(&[4]));
        let y = flow.add_var("y", Type::Float32, Shape::new(&[4]));
        let mul = flow.add_op_with(func, "mul", "Mul", &[a, b], &[t]);
        let add = flow.add_op_with(func, "add", "Add", &[t, c], &[y]);
        let fused = flow.fuse(mul, add, "Calculate");
        assert_eq!(fused, mul);
        assert_eq!(flow.op(fused).kind, "Calculate");
        assert_eq!(flow.op(fused).inputs, vec![a, b, c]);
        assert_eq!(flow.op(fused).outputs, vec![y]);
        assert!(flow.find_var("t").is_none());
        flow.check_consistent().unwrap();
    }

    #[test]
    fn test_sort_topological() {
        let (mut flow, func) = simple_flow();
        let a = flow.add_var("a", Type::Float32, Shape::new(&[4]));
        let t = flow.add_var("t", Type::Float32, Shape::new(&[4]));
        let y = flow.add_var("y", Type::Float32, Shape::new(&[4]));
        // Add in reverse dependency order.
        let second = flow.add_op_with(func, "second", "Relu", &[t], &[y]);
        let first = flow.add_op_with(func, "first", "Neg", &[a], &[t]);
        flow.sort().unwrap();
        assert_eq!(flow.ops_in_order(), &[first, second]);
    }

    #[test]
    fn test_depends_on() {
        let (mut flow, func) = simple_flow();
        let a = flow.add_var("a", Type::Float32, Shape::new(&[4]));
        let t = flow.add_var("t", Type::Float32, Shape::new(&[4]));
        let y = flow.add_var("y", Type::Float32, Shape::new(&[4]));
        let first = flow.add_op_with(func, "first", "Neg", &[a], &[t]);
        let _second = flow.add_op_with(func, "second", "Relu", &[t], &[y]);
        assert!(flow.depends_on(y, first));
        assert!(!flow.depends_on(t, flow.find_op("second").unwrap()));
    }
}
