//! Expression intermediate representation.
//!
//! An expression is a list of operations over typed variables in static
//! single assignment form. Expressions are the payload of fused `Calculate`
//! operations: they are stored on the op as a textual *recipe* and parsed
//! back into structured form on each touch.
//!
//! The following variable kinds are supported:
//!
//! ```text
//!   %n: input variable
//!   #n: constant input variable
//!   @n: output variable
//!   $n: temporary variable
//!   _n: system number
//! ```
//!
//! A recipe has the grammar:
//!
//! ```text
//!   <recipe> := <assignment> | <assignment> ';' <recipe>
//!   <assignment> := <variable> '=' <expression>
//!   <expression> := <variable> | <operation>
//!   <operation> := <name> '(' <arg list> ')'
//!   <arg list> := <arg> | <arg> ',' <arg list>
//!   <arg> := <variable> | <expression>
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::error::{CompileError, CompileResult};

/// Variable kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VarKind {
    Input,
    Const,
    Output,
    Temp,
    Number,
}

/// Operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Mov,

    Add,
    Sub,
    Mul,
    Div,
    Minimum,
    Maximum,

    Neg,
    Abs,
    Relu,
    Sqrt,
    Rsqrt,
    Reciprocal,
    Floor,

    Log,
    Exp,
    Sigmoid,
    Tanh,

    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,

    And,
    Or,
    AndNot,
    Not,

    // Reductions over all elements.
    Sum,
    Product,
    Min,
    Max,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Mov => "Id",
            OpKind::Add => "Add",
            OpKind::Sub => "Sub",
            OpKind::Mul => "Mul",
            OpKind::Div => "Div",
            OpKind::Minimum => "Minimum",
            OpKind::Maximum => "Maximum",
            OpKind::Neg => "Neg",
            OpKind::Abs => "Abs",
            OpKind::Relu => "Relu",
            OpKind::Sqrt => "Sqrt",
            OpKind::Rsqrt => "Rsqrt",
            OpKind::Reciprocal => "Reciprocal",
            OpKind::Floor => "Floor",
            OpKind::Log => "Log",
            OpKind::Exp => "Exp",
            OpKind::Sigmoid => "Sigmoid",
            OpKind::Tanh => "Tanh",
            OpKind::Equal => "Equal",
            OpKind::NotEqual => "NotEqual",
            OpKind::Less => "Less",
            OpKind::LessEqual => "LessEqual",
            OpKind::Greater => "Greater",
            OpKind::GreaterEqual => "GreaterEqual",
            OpKind::And => "And",
            OpKind::Or => "Or",
            OpKind::AndNot => "AndNot",
            OpKind::Not => "Not",
            OpKind::Sum => "Sum",
            OpKind::Product => "Product",
            OpKind::Min => "Min",
            OpKind::Max => "Max",
        }
    }

    /// Look up op kind for op name.
    pub fn lookup(name: &str) -> Option<OpKind> {
        use OpKind::*;
        Some(match name {
            "Id" => Mov,
            "Add" => Add,
            "Sub" => Sub,
            "Mul" => Mul,
            "Div" => Div,
            "Minimum" => Minimum,
            "Maximum" => Maximum,
            "Neg" => Neg,
            "Abs" => Abs,
            "Relu" => Relu,
            "Sqrt" => Sqrt,
            "Rsqrt" => Rsqrt,
            "Reciprocal" => Reciprocal,
            "Floor" => Floor,
            "Log" => Log,
            "Exp" => Exp,
            "Sigmoid" => Sigmoid,
            "Tanh" => Tanh,
            "Equal" => Equal,
            "NotEqual" => NotEqual,
            "Less" => Less,
            "LessEqual" => LessEqual,
            "Greater" => Greater,
            "GreaterEqual" => GreaterEqual,
            "And" => And,
            "Or" => Or,
            "AndNot" => AndNot,
            "Not" => Not,
            "Sum" => Sum,
            "Product" => Product,
            "Min" => Min,
            "Max" => Max,
            _ => return None,
        })
    }

    pub fn commutative(self) -> bool {
        matches!(
            self,
            OpKind::Add
                | OpKind::Mul
                | OpKind::Minimum
                | OpKind::Maximum
                | OpKind::And
                | OpKind::Or
        )
    }

    /// Reduction over all elements of the argument.
    pub fn is_reduction(self) -> bool {
        matches!(
            self,
            OpKind::Sum | OpKind::Product | OpKind::Min | OpKind::Max
        )
    }

    /// Element-wise accumulator op for a reduction.
    pub fn accumulator(self) -> OpKind {
        match self {
            OpKind::Sum => OpKind::Add,
            OpKind::Product => OpKind::Mul,
            OpKind::Min => OpKind::Minimum,
            OpKind::Max => OpKind::Maximum,
            _ => self,
        }
    }

    /// Identity number for a reduction accumulator.
    pub fn identity(self) -> i32 {
        match self {
            OpKind::Sum => NUM_ZERO,
            OpKind::Product => NUM_ONE,
            OpKind::Min => NUM_PLUS_INF,
            OpKind::Max => NUM_MINUS_INF,
            _ => NUM_ZERO,
        }
    }
}

// System-defined numbers, referenced from recipes as `_n`.
pub const NUM_ZERO: i32 = 0;
pub const NUM_ONE: i32 = 1;
pub const NUM_HALF: i32 = 2;
pub const NUM_MINUS_INF: i32 = 3;
pub const NUM_PLUS_INF: i32 = 4;

/// Value of a system number as f64; generators narrow as needed.
pub fn number_value(id: i32) -> f64 {
    match id {
        NUM_ZERO => 0.0,
        NUM_ONE => 1.0,
        NUM_HALF => 0.5,
        NUM_MINUS_INF => f64::NEG_INFINITY,
        NUM_PLUS_INF => f64::INFINITY,
        _ => 0.0,
    }
}

/// Slot reference to a variable in an expression.
pub type VarRef = usize;

/// Slot reference to an operation in an expression.
pub type OpRef = usize;

/// Variable in an expression.
#[derive(Clone, Debug)]
pub struct Var {
    pub kind: VarKind,
    /// Variable id; -1 for unassigned temps.
    pub id: i32,
    pub producer: Option<OpRef>,
    pub consumers: Vec<OpRef>,
    /// Live range as positions in evaluation order.
    pub first: Option<usize>,
    pub last: Option<usize>,
}

/// Operation in an expression.
#[derive(Clone, Debug)]
pub struct Op {
    pub kind: OpKind,
    pub result: Option<VarRef>,
    pub args: Vec<VarRef>,

    // Virtual register assignment for operands.
    pub dst: i32,
    pub src: i32,
    pub src2: i32,
    /// First argument is also the destination (two-operand form).
    pub first_is_dest: bool,
}

impl Op {
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Move where source and destination registers coincide.
    pub fn nop(&self) -> bool {
        self.kind == OpKind::Mov && self.dst != -1 && self.src == self.dst
    }
}

/// Instruction model describing the operand forms supported by a target
/// expression generator. Expressions are rewritten to use only supported
/// forms before emission.
#[derive(Clone, Copy, Debug, Default)]
pub struct Model {
    // Move instruction formats.
    pub mov_reg_reg: bool,
    pub mov_reg_imm: bool,
    pub mov_reg_mem: bool,
    pub mov_mem_reg: bool,

    // Two-operand instruction formats.
    pub op_reg_reg: bool,
    pub op_reg_imm: bool,
    pub op_reg_mem: bool,
    pub op_mem_reg: bool,
    pub op_mem_imm: bool,

    // Three-operand instruction formats.
    pub op_reg_reg_reg: bool,
    pub op_reg_reg_imm: bool,
    pub op_reg_reg_mem: bool,

    // Unary function instruction formats.
    pub func_reg_reg: bool,
    pub func_reg_imm: bool,
    pub func_reg_mem: bool,
    pub func_mem_reg: bool,
    pub func_mem_imm: bool,
}

/// Expression: a list of operations over variables.
#[derive(Clone, Debug, Default)]
pub struct Express {
    vars: Vec<Option<Var>>,
    ops: Vec<Option<Op>>,
    /// Operation slots in evaluation order.
    order: Vec<OpRef>,
    /// Index into `order` where the loop body begins; everything before is
    /// loop-invariant initialization.
    pub body: usize,
    /// Index into `order` where the loop epilogue begins, or `usize::MAX`
    /// when the body extends to the end.
    pub tail: usize,
}

impl Express {
    pub fn new() -> Self {
        Express {
            tail: usize::MAX,
            ..Default::default()
        }
    }

    pub fn var(&self, r: VarRef) -> &Var {
        self.vars[r].as_ref().expect("dead expression variable")
    }

    pub fn var_mut(&mut self, r: VarRef) -> &mut Var {
        self.vars[r].as_mut().expect("dead expression variable")
    }

    pub fn op(&self, r: OpRef) -> &Op {
        self.ops[r].as_ref().expect("dead expression op")
    }

    pub fn op_mut(&mut self, r: OpRef) -> &mut Op {
        self.ops[r].as_mut().expect("dead expression op")
    }

    pub fn var_refs(&self) -> Vec<VarRef> {
        (0..self.vars.len()).filter(|&r| self.vars[r].is_some()).collect()
    }

    /// Operation slots in evaluation order.
    pub fn order(&self) -> &[OpRef] {
        &self.order
    }

    /// Index into `order` where the epilogue begins.
    pub fn tail_start(&self) -> usize {
        self.tail.min(self.order.len())
    }

    /// Find an existing variable.
    pub fn find_variable(&self, kind: VarKind, id: i32) -> Option<VarRef> {
        (0..self.vars.len()).find(|&r| {
            self.vars[r]
                .as_ref()
                .map(|v| v.kind == kind && v.id == id)
                .unwrap_or(false)
        })
    }

    /// Look up a variable or add a new one. Variables with id -1 are always
    /// new.
    pub fn variable(&mut self, kind: VarKind, id: i32) -> VarRef {
        if id != -1 {
            for r in 0..self.vars.len() {
                if let Some(v) = &self.vars[r] {
                    if v.kind == kind && v.id == id {
                        return r;
                    }
                }
            }
        }
        let r = self.vars.len();
        self.vars.push(Some(Var {
            kind,
            id,
            producer: None,
            consumers: Vec::new(),
            first: None,
            last: None,
        }));
        r
    }

    /// Add a new unassigned temporary variable.
    pub fn new_temp(&mut self) -> VarRef {
        self.variable(VarKind::Temp, -1)
    }

    /// Add a system number variable.
    pub fn number(&mut self, id: i32) -> VarRef {
        self.variable(VarKind::Number, id)
    }

    /// Append a new operation to the evaluation order.
    pub fn operation(&mut self, kind: OpKind) -> OpRef {
        let r = self.push_op(kind);
        self.order.push(r);
        r
    }

    /// Insert a new operation at a position in the evaluation order.
    pub fn operation_at(&mut self, pos: usize, kind: OpKind) -> OpRef {
        let r = self.push_op(kind);
        self.order.insert(pos, r);
        r
    }

    fn push_op(&mut self, kind: OpKind) -> OpRef {
        let r = self.ops.len();
        self.ops.push(Some(Op {
            kind,
            result: None,
            args: Vec::new(),
            dst: -1,
            src: -1,
            src2: -1,
            first_is_dest: false,
        }));
        r
    }

    /// Build an operation from a kind and argument list.
    pub fn function(&mut self, kind: OpKind, args: &[VarRef]) -> OpRef {
        let op = self.operation(kind);
        for &arg in args {
            self.add_arg(op, arg);
        }
        op
    }

    /// Assign the result of an operation to a variable.
    pub fn assign(&mut self, op: OpRef, var: VarRef, reassign: bool) {
        if let Some(prev) = self.op(op).result {
            self.var_mut(prev).producer = None;
        }
        debug_assert!(reassign || self.var(var).producer.is_none());
        self.op_mut(op).result = Some(var);
        self.var_mut(var).producer = Some(op);
    }

    pub fn add_arg(&mut self, op: OpRef, arg: VarRef) {
        self.var_mut(arg).consumers.push(op);
        self.op_mut(op).args.push(arg);
    }

    pub fn clear_args(&mut self, op: OpRef) {
        let args = std::mem::take(&mut self.op_mut(op).args);
        for arg in args {
            let consumers = &mut self.var_mut(arg).consumers;
            if let Some(pos) = consumers.iter().position(|&o| o == op) {
                consumers.remove(pos);
            }
        }
    }

    /// Remove an operation from the expression.
    pub fn remove_op(&mut self, op: OpRef) {
        if let Some(result) = self.op(op).result {
            debug_assert_eq!(self.var(result).producer, Some(op));
            self.var_mut(result).producer = None;
        }
        self.clear_args(op);
        if let Some(pos) = self.order.iter().position(|&o| o == op) {
            self.order.remove(pos);
        }
        self.ops[op] = None;
    }

    /// Remove an unused variable.
    pub fn remove_var(&mut self, var: VarRef) {
        debug_assert!(self.var(var).producer.is_none());
        debug_assert!(self.var(var).consumers.is_empty());
        self.vars[var] = None;
    }

    /// Redirect all consumers of a variable to another variable.
    pub fn redirect(&mut self, from: VarRef, to: VarRef) {
        let consumers = std::mem::take(&mut self.var_mut(from).consumers);
        for op in &consumers {
            let args = &mut self.op_mut(*op).args;
            for arg in args.iter_mut() {
                if *arg == from {
                    *arg = to;
                }
            }
        }
        self.var_mut(to).consumers.extend(consumers);
    }

    pub fn num_vars(&self, kind: VarKind) -> usize {
        self.vars
            .iter()
            .filter_map(|v| v.as_ref())
            .filter(|v| v.kind == kind)
            .count()
    }

    pub fn num_ops(&self, kind: OpKind) -> usize {
        self.order.iter().filter(|&&o| self.op(o).kind == kind).count()
    }

    pub fn has(&self, kind: OpKind) -> bool {
        self.num_ops(kind) > 0
    }

    pub fn has_reduction(&self) -> bool {
        self.order.iter().any(|&o| self.op(o).kind.is_reduction())
    }

    /// A temporary variable only needed in a single context, rendered inline
    /// in recipes.
    pub fn inlined(&self, var: VarRef) -> bool {
        let v = self.var(var);
        v.kind == VarKind::Temp && v.consumers.len() == 1 && v.producer.is_some()
    }

    /// Compact temporary variable ids; returns the number of temporaries.
    pub fn compact_temp_vars(&mut self) -> usize {
        let mut n = 0;
        for slot in self.vars.iter_mut().filter_map(|v| v.as_mut()) {
            if slot.kind == VarKind::Temp {
                slot.id = n;
                n += 1;
            }
        }
        n as usize
    }

    // ---------------------------------------------------------------------
    // Recipes
    // ---------------------------------------------------------------------

    /// Parse a recipe and add it to the expression.
    pub fn parse(&mut self, recipe: &str) -> CompileResult<()> {
        let mut parser = RecipeParser {
            bytes: recipe.as_bytes(),
            pos: 0,
            recipe,
        };
        parser.parse(self)?;
        self.compact_temp_vars();
        Ok(())
    }

    fn var_recipe(&self, var: VarRef, out: &mut String) {
        let v = self.var(var);
        let sigil = match v.kind {
            VarKind::Input => '%',
            VarKind::Const => '#',
            VarKind::Output => '@',
            VarKind::Temp => '$',
            VarKind::Number => '_',
        };
        out.push(sigil);
        out.push_str(&v.id.to_string());
    }

    fn op_recipe(&self, op: OpRef, out: &mut String) {
        let o = self.op(op);
        out.push_str(o.kind.name());
        out.push('(');
        for (i, &arg) in o.args.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            if self.inlined(arg) {
                self.op_recipe(self.var(arg).producer.expect("inlined without producer"), out);
            } else {
                self.var_recipe(arg, out);
            }
        }
        out.push(')');
    }

    /// Return the recipe for the expression.
    pub fn as_recipe(&self) -> String {
        let mut recipe = String::new();
        let mut first = true;
        for &op in &self.order {
            let result = match self.op(op).result {
                Some(r) => r,
                None => continue,
            };
            if self.inlined(result) {
                continue;
            }
            if !first {
                recipe.push(';');
            }
            first = false;
            self.var_recipe(result, &mut recipe);
            recipe.push('=');
            self.op_recipe(op, &mut recipe);
        }
        recipe
    }

    // ---------------------------------------------------------------------
    // Structural passes
    // ---------------------------------------------------------------------

    /// Merge the variables and operations of another expression into this
    /// one. `mapping` maps variable refs of `other` to variable refs of this
    /// expression; unmapped variables are imported.
    pub fn merge(&mut self, other: &Express, mapping: &HashMap<VarRef, VarRef>) {
        let mut slotmap: HashMap<VarRef, VarRef> = HashMap::new();
        let mut temps_moved = false;
        for r in other.var_refs() {
            if let Some(&target) = mapping.get(&r) {
                slotmap.insert(r, target);
            } else {
                let v = other.var(r);
                let imported = self.vars.len();
                self.vars.push(Some(Var {
                    kind: v.kind,
                    id: v.id,
                    producer: None,
                    consumers: Vec::new(),
                    first: None,
                    last: None,
                }));
                slotmap.insert(r, imported);
                if v.kind == VarKind::Temp {
                    temps_moved = true;
                }
            }
        }
        for &op in other.order() {
            let o = other.op(op);
            let new_op = self.operation(o.kind);
            if let Some(result) = o.result {
                self.assign(new_op, slotmap[&result], true);
            }
            for &arg in &o.args {
                self.add_arg(new_op, slotmap[&arg]);
            }
        }
        if temps_moved {
            self.compact_temp_vars();
        }
    }

    /// Eliminate common subexpressions.
    pub fn eliminate_common_subexpressions(&mut self) {
        let mut iterations = 0;
        while self.try_to_eliminate_ops() {
            iterations += 1;
        }
        if iterations > 0 {
            self.compact_temp_vars();
        }
    }

    fn op_equal(&self, a: OpRef, b: OpRef) -> bool {
        let (oa, ob) = (self.op(a), self.op(b));
        oa.kind == ob.kind && oa.args == ob.args
    }

    fn try_to_eliminate_ops(&mut self) -> bool {
        for i in 0..self.order.len() {
            for j in i + 1..self.order.len() {
                let (op1, op2) = (self.order[i], self.order[j]);
                if !self.op_equal(op1, op2) {
                    continue;
                }
                let v1 = self.op(op1).result.expect("op without result");
                let v2 = self.op(op2).result.expect("op without result");
                if self.var(v1).kind == VarKind::Temp {
                    // Eliminate the first op; keep the later one so output
                    // assignments stay in place.
                    self.order.swap(i, j);
                    self.redirect(v1, v2);
                    self.remove_op(op1);
                    self.remove_var(v1);
                    return true;
                } else if self.var(v2).kind == VarKind::Temp {
                    self.redirect(v2, v1);
                    self.remove_op(op2);
                    self.remove_var(v2);
                    return true;
                } else {
                    // Two outputs computing the same value; turn the second
                    // into a move from the first.
                    self.redirect(v2, v1);
                    self.op_mut(op2).kind = OpKind::Mov;
                    self.clear_args(op2);
                    self.add_arg(op2, v1);
                    return true;
                }
            }
        }
        false
    }

    /// Remove redundant moves left over from merges: moves into
    /// temporaries forward their source, and a move from a single-use
    /// temporary folds into the op producing it.
    pub fn eliminate_redundant_moves(&mut self) {
        loop {
            let mut removed = false;
            for pos in 0..self.order.len() {
                let op = self.order[pos];
                if self.op(op).kind != OpKind::Mov || self.op(op).arity() != 1 {
                    continue;
                }
                let result = match self.op(op).result {
                    Some(r) => r,
                    None => continue,
                };
                let source = self.op(op).args[0];
                if self.var(result).kind == VarKind::Temp {
                    self.remove_op(op);
                    self.redirect(result, source);
                    self.remove_var(result);
                    removed = true;
                    break;
                }
                let sv = self.var(source);
                if sv.kind == VarKind::Temp && sv.consumers.len() == 1 && sv.producer.is_some() {
                    let producer = sv.producer.expect("checked above");
                    self.remove_op(op);
                    self.assign(producer, result, true);
                    self.remove_var(source);
                    removed = true;
                    break;
                }
            }
            if !removed {
                break;
            }
        }
        self.compact_temp_vars();
    }

    /// Cache inputs and outputs used in multiple operations in temporary
    /// variables so that every memory operand is touched once.
    pub fn cache_results(&mut self) {
        let mut cached = 0;
        for var in self.var_refs() {
            let kind = self.var(var).kind;
            if kind == VarKind::Output && !self.var(var).consumers.is_empty() {
                // Compute into a temp and move it to the output once.
                let producer = self.var(var).producer.expect("consumed output without producer");
                self.var_mut(var).producer = None;
                let temp = self.new_temp();
                self.op_mut(producer).result = Some(temp);
                self.var_mut(temp).producer = Some(producer);
                let consumers = std::mem::take(&mut self.var_mut(var).consumers);
                for &op in &consumers {
                    for arg in self.op_mut(op).args.iter_mut() {
                        if *arg == var {
                            *arg = temp;
                        }
                    }
                }
                self.var_mut(temp).consumers = consumers;
                let pos = self
                    .order
                    .iter()
                    .position(|&o| o == producer)
                    .expect("producer not in order");
                let assign = self.operation_at(pos + 1, OpKind::Mov);
                self.assign(assign, var, false);
                self.add_arg(assign, temp);
                cached += 1;
            } else if kind != VarKind::Temp && self.var(var).consumers.len() > 1 {
                // Load into a temp before its first use.
                let temp = self.new_temp();
                let consumers = std::mem::take(&mut self.var_mut(var).consumers);
                let mut first = None;
                for &pos_op in &self.order {
                    if consumers.contains(&pos_op) {
                        first = Some(pos_op);
                        break;
                    }
                }
                for &op in &consumers {
                    for arg in self.op_mut(op).args.iter_mut() {
                        if *arg == var {
                            *arg = temp;
                        }
                    }
                }
                self.var_mut(temp).consumers = consumers;
                let first = first.expect("consumer not in order");
                let pos = self
                    .order
                    .iter()
                    .position(|&o| o == first)
                    .expect("first consumer not in order");
                let assign = self.operation_at(pos, OpKind::Mov);
                self.assign(assign, temp, false);
                self.add_arg(assign, var);
                cached += 1;
            }
        }
        if cached > 0 {
            self.compact_temp_vars();
        }
    }

    /// Lower reduction ops into an init/accumulate/store form: the
    /// accumulator is seeded before the loop, updated element-wise in the
    /// body, and stored to the output after the loop.
    pub fn lower_reductions(&mut self) {
        let reductions: Vec<OpRef> = self
            .order
            .iter()
            .copied()
            .filter(|&o| self.op(o).kind.is_reduction())
            .collect();
        if reductions.is_empty() {
            return;
        }
        let mut stores = Vec::new();
        for op in reductions {
            let kind = self.op(op).kind;
            let output = self.op(op).result.expect("reduction without result");
            let acc = self.new_temp();

            // Seed the accumulator in the init section.
            let identity = self.number(kind.identity());
            let init = self.operation_at(self.body, OpKind::Mov);
            self.assign(init, acc, false);
            self.add_arg(init, identity);
            self.body += 1;

            // Rewrite the reduction into its element-wise accumulator.
            let arg = self.op(op).args[0];
            self.clear_args(op);
            self.op_mut(op).kind = kind.accumulator();
            self.add_arg(op, acc);
            self.add_arg(op, arg);
            self.assign(op, acc, true);

            stores.push((output, acc));
        }
        self.tail = self.order.len();
        for (output, acc) in stores {
            let store = self.operation(OpKind::Mov);
            self.assign(store, output, true);
            self.add_arg(store, acc);
        }
        self.compact_temp_vars();
    }

    /// Compute the live range for each variable as positions in the
    /// evaluation order.
    pub fn compute_live_ranges(&mut self) {
        for var in self.var_refs() {
            self.var_mut(var).first = None;
            self.var_mut(var).last = None;
        }
        for pos in 0..self.order.len() {
            let op = self.order[pos];
            if let Some(result) = self.op(op).result {
                if self.var(result).first.is_none() {
                    self.var_mut(result).first = Some(pos);
                }
                self.var_mut(result).last = Some(pos);
            }
            for i in 0..self.op(op).arity() {
                let arg = self.op(op).args[i];
                if self.var(arg).first.is_none() {
                    self.var_mut(arg).first = Some(pos);
                }
                self.var_mut(arg).last = Some(pos);
            }
        }
        // Values touched in the init section stay resident across loop
        // iterations.
        if self.body > 0 {
            let end = self.order.len().saturating_sub(1);
            for var in self.var_refs() {
                let v = self.var(var);
                if v.kind == VarKind::Temp {
                    if let (Some(first), Some(last)) = (v.first, v.last) {
                        if first < self.body && last < self.tail_start() {
                            self.var_mut(var).last = Some(end);
                        }
                    }
                }
            }
        }
    }

    /// Allocate virtual registers for operands. Returns the number of
    /// registers used. Live ranges must be computed first.
    pub fn allocate_registers(&mut self) -> usize {
        let mut regs = RegisterTracker::default();
        for pos in 0..self.order.len() {
            let op = self.order[pos];
            let result = self.op(op).result.expect("op without result");
            if self.op(op).kind == OpKind::Mov {
                // Allocate destination register for the move.
                if self.var(result).kind == VarKind::Temp {
                    let dst = if self.var(result).first == Some(pos) {
                        let arg = self.op(op).args[0];
                        if self.var(arg).kind == VarKind::Temp && self.var(arg).last == Some(pos) {
                            // Steal the register from the source.
                            let transferred = regs.transfer(arg, result);
                            self.op_mut(op).src = transferred;
                            transferred
                        } else {
                            regs.allocate(result)
                        }
                    } else {
                        regs.get(result)
                    };
                    debug_assert!(dst != -1);
                    self.op_mut(op).dst = dst;
                }
                let arg = self.op(op).args[0];
                if self.var(arg).kind == VarKind::Temp && self.op(op).src == -1 {
                    let src = regs.get(arg);
                    debug_assert!(src != -1);
                    self.op_mut(op).src = src;
                }
                if self.var(arg).kind == VarKind::Temp && self.var(arg).last == Some(pos) {
                    regs.free(arg);
                }
            } else {
                if self.var(result).kind == VarKind::Temp {
                    let dst = if self.var(result).first == Some(pos) {
                        regs.allocate(result)
                    } else {
                        regs.get(result)
                    };
                    debug_assert!(dst != -1);
                    self.op_mut(op).dst = dst;
                }
                let first = if self.op(op).first_is_dest { 1 } else { 0 };
                let second = first + 1;
                if self.op(op).arity() > first {
                    let arg = self.op(op).args[first];
                    if self.var(arg).kind == VarKind::Temp {
                        let src = regs.get(arg);
                        debug_assert!(src != -1);
                        self.op_mut(op).src = src;
                    }
                }
                if self.op(op).arity() > second {
                    let arg = self.op(op).args[second];
                    if self.var(arg).kind == VarKind::Temp {
                        let src2 = regs.get(arg);
                        debug_assert!(src2 != -1);
                        self.op_mut(op).src2 = src2;
                    }
                }
                for argnum in [first, second] {
                    if self.op(op).arity() > argnum {
                        let arg = self.op(op).args[argnum];
                        if self.var(arg).kind == VarKind::Temp && self.var(arg).last == Some(pos) {
                            regs.free(arg);
                        }
                    }
                }
            }
        }
        regs.max()
    }

    /// Number of registers used by the expression after allocation.
    pub fn num_regs(&self) -> usize {
        let mut n = 0i32;
        for &op in &self.order {
            let o = self.op(op);
            n = n.max(o.dst + 1).max(o.src + 1).max(o.src2 + 1);
        }
        n as usize
    }

    /// Number of primitive operations needed to compute the expression,
    /// not counting moves.
    pub fn complexity(&self) -> i64 {
        self.order
            .iter()
            .filter(|&&o| self.op(o).kind != OpKind::Mov)
            .count() as i64
    }

    // ---------------------------------------------------------------------
    // Instruction-form rewriting
    // ---------------------------------------------------------------------

    /// Rewrite the expression to match the instruction forms supported by a
    /// target model, inserting temporaries so only supported forms remain.
    pub fn rewrite(&self, model: &Model) -> CompileResult<Express> {
        let mut out = Express::new();
        let mut success = true;
        for pos in 0..self.order.len() {
            if pos == self.body {
                out.body = out.order.len();
            }
            if pos == self.tail_start() && self.tail != usize::MAX {
                out.tail = out.order.len();
            }
            let op = self.op(self.order[pos]);
            let kind = op.kind;
            let result = op.result.expect("op without result");
            let mut args = op.args.clone();
            let mut source = None;
            let mut source2 = None;
            let mut destination = None;
            let mut first_is_dest = false;

            if op.arity() == 1 && kind == OpKind::Mov {
                match self.var(result).kind {
                    VarKind::Temp => match self.var(args[0]).kind {
                        VarKind::Input | VarKind::Output => {
                            if !model.mov_reg_mem {
                                success = false;
                            }
                        }
                        VarKind::Temp => {
                            if !model.mov_reg_reg {
                                success = false;
                            }
                        }
                        VarKind::Const | VarKind::Number => {
                            if !model.mov_reg_imm && !model.mov_reg_mem {
                                success = false;
                            }
                        }
                    },
                    VarKind::Output => match self.var(args[0]).kind {
                        VarKind::Input => {
                            source = Some(out.new_temp());
                        }
                        VarKind::Output => {
                            destination = Some(out.new_temp());
                        }
                        VarKind::Temp => {
                            if !model.mov_mem_reg {
                                success = false;
                            }
                        }
                        VarKind::Const | VarKind::Number => {
                            // Stores of immediates go through a register.
                            destination = Some(out.new_temp());
                            if !model.mov_reg_imm && !model.mov_reg_mem {
                                success = false;
                            }
                        }
                    },
                    _ => success = false,
                }
            } else if op.arity() == 1 {
                // Unary operator.
                match self.var(result).kind {
                    VarKind::Temp => match self.var(args[0]).kind {
                        VarKind::Input | VarKind::Output => {
                            if !model.func_reg_mem {
                                source = Some(out.new_temp());
                                if !model.func_reg_reg {
                                    success = false;
                                }
                            }
                        }
                        VarKind::Temp => {
                            if !model.func_reg_reg {
                                success = false;
                            }
                        }
                        VarKind::Const | VarKind::Number => {
                            if !model.func_reg_imm {
                                source = Some(out.new_temp());
                                if !model.func_reg_reg {
                                    success = false;
                                }
                            }
                        }
                    },
                    VarKind::Output => match self.var(args[0]).kind {
                        VarKind::Input | VarKind::Output => {
                            if model.func_reg_mem {
                                destination = Some(out.new_temp());
                            } else if model.func_mem_reg {
                                source = Some(out.new_temp());
                            } else {
                                destination = Some(out.new_temp());
                                source = Some(out.new_temp());
                                if !model.func_reg_reg {
                                    success = false;
                                }
                            }
                        }
                        VarKind::Temp => {
                            if !model.func_mem_reg {
                                destination = Some(out.new_temp());
                                if !model.func_reg_reg {
                                    success = false;
                                }
                            }
                        }
                        VarKind::Const | VarKind::Number => {
                            if !model.func_mem_imm {
                                destination = Some(out.new_temp());
                                if !model.func_reg_imm {
                                    source = Some(out.new_temp());
                                    if !model.func_reg_reg {
                                        success = false;
                                    }
                                }
                            }
                        }
                    },
                    _ => success = false,
                }
            } else if op.arity() == 2 {
                // Binary operator. The and-not instruction forms compute
                // NOT(first) AND second, so AndNot(a, b) = a AND NOT(b)
                // lowers with its arguments swapped.
                if kind == OpKind::AndNot {
                    args.swap(0, 1);
                }
                match self.var(result).kind {
                    VarKind::Temp | VarKind::Output => {
                        if model.op_reg_reg_reg {
                            // Three-operand form; put the memory operand
                            // last when the operation commutes.
                            if model.op_reg_reg_mem
                                && kind.commutative()
                                && self.var(args[0]).kind != VarKind::Temp
                                && self.var(args[1]).kind == VarKind::Temp
                            {
                                args.swap(0, 1);
                            }
                            if self.var(result).kind == VarKind::Output {
                                destination = Some(out.new_temp());
                            }
                            if self.var(args[0]).kind != VarKind::Temp {
                                source = Some(out.new_temp());
                            }
                            if self.var(args[1]).kind != VarKind::Temp && !model.op_reg_reg_mem {
                                source2 = Some(out.new_temp());
                            }
                        } else if model.op_reg_reg {
                            // Two-operand form: destination doubles as the
                            // first operand.
                            first_is_dest = true;
                            if model.op_reg_mem
                                && kind.commutative()
                                && self.var(args[0]).kind != VarKind::Temp
                                && self.var(args[1]).kind == VarKind::Temp
                            {
                                args.swap(0, 1);
                            }
                            if result != args[0] || !model.op_mem_reg {
                                if self.var(result).kind == VarKind::Output {
                                    destination = Some(out.new_temp());
                                }
                                // Move first argument to the destination.
                                let mov = out.operation(OpKind::Mov);
                                let target = match destination {
                                    Some(temp) => temp,
                                    None => {
                                        let v = self.var(result);
                                        out.variable(v.kind, v.id)
                                    }
                                };
                                out.assign(mov, target, true);
                                let arg0 = {
                                    let v = self.var(args[0]);
                                    out.variable(v.kind, v.id)
                                };
                                out.add_arg(mov, arg0);
                                match self.var(args[0]).kind {
                                    VarKind::Input | VarKind::Output => {
                                        if !model.mov_reg_mem {
                                            success = false;
                                        }
                                    }
                                    VarKind::Temp => {
                                        if !model.mov_reg_reg {
                                            success = false;
                                        }
                                    }
                                    VarKind::Const | VarKind::Number => {
                                        if !model.mov_reg_imm && !model.mov_reg_mem {
                                            success = false;
                                        }
                                    }
                                }
                                // The first operand is now the destination.
                                args[0] = usize::MAX; // marker: use destination
                            }
                            // Make the second operand available.
                            match self.var(args[1]).kind {
                                VarKind::Input | VarKind::Output => {
                                    if !model.op_reg_mem {
                                        source2 = Some(out.new_temp());
                                    }
                                }
                                VarKind::Temp => {}
                                VarKind::Const | VarKind::Number => {
                                    if !model.op_reg_imm && !model.op_reg_mem {
                                        source2 = Some(out.new_temp());
                                    }
                                }
                            }
                        } else {
                            success = false;
                        }
                    }
                    _ => success = false,
                }
            } else {
                success = false;
            }

            // Load operands that must live in registers.
            if let Some(source) = source {
                if !model.mov_reg_mem {
                    success = false;
                }
                let mov = out.operation(OpKind::Mov);
                out.assign(mov, source, true);
                let arg = {
                    let v = self.var(args[0]);
                    out.variable(v.kind, v.id)
                };
                out.add_arg(mov, arg);
                args[0] = usize::MAX - 1; // marker: use source temp
            }
            if let Some(source2) = source2 {
                if !model.mov_reg_mem {
                    success = false;
                }
                let mov = out.operation(OpKind::Mov);
                out.assign(mov, source2, true);
                let arg = {
                    let v = self.var(args[1]);
                    out.variable(v.kind, v.id)
                };
                out.add_arg(mov, arg);
                args[1] = usize::MAX - 2; // marker: use source2 temp
            }

            // Translate the operation itself.
            let instr = out.operation(kind);
            out.op_mut(instr).first_is_dest = first_is_dest;
            if let Some(destination) = destination {
                // Compute into the temporary, then store it to the result.
                if !model.mov_mem_reg {
                    success = false;
                }
                out.assign(instr, destination, true);
                let mov = out.operation(OpKind::Mov);
                let target = {
                    let v = self.var(result);
                    out.variable(v.kind, v.id)
                };
                out.assign(mov, target, true);
                out.add_arg(mov, destination);
            } else {
                let target = {
                    let v = self.var(result);
                    out.variable(v.kind, v.id)
                };
                out.assign(instr, target, true);
            }
            for &arg in &args {
                let mapped = if arg == usize::MAX {
                    // First operand became the destination.
                    match destination {
                        Some(temp) => temp,
                        None => {
                            let v = self.var(result);
                            out.variable(v.kind, v.id)
                        }
                    }
                } else if arg == usize::MAX - 1 {
                    source.expect("missing source temp")
                } else if arg == usize::MAX - 2 {
                    source2.expect("missing source2 temp")
                } else {
                    let v = self.var(arg);
                    out.variable(v.kind, v.id)
                };
                out.add_arg(instr, mapped);
            }
        }
        if self.tail == usize::MAX {
            out.tail = usize::MAX;
        }
        out.compact_temp_vars();
        if !success {
            return Err(CompileError::ExpressionSyntax {
                message: format!(
                    "expression cannot be rewritten for target model: {}",
                    self.as_recipe()
                ),
            });
        }
        Ok(out)
    }
}

impl fmt::Display for Express {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_recipe())
    }
}

/// Virtual register tracker used during operand allocation.
#[derive(Default)]
struct RegisterTracker {
    regs: Vec<Option<VarRef>>,
}

impl RegisterTracker {
    fn allocate(&mut self, var: VarRef) -> i32 {
        let mut free = None;
        for (r, slot) in self.regs.iter().enumerate() {
            if *slot == Some(var) {
                return r as i32;
            }
            if free.is_none() && slot.is_none() {
                free = Some(r);
            }
        }
        match free {
            Some(r) => {
                self.regs[r] = Some(var);
                r as i32
            }
            None => {
                self.regs.push(Some(var));
                (self.regs.len() - 1) as i32
            }
        }
    }

    fn transfer(&mut self, src: VarRef, dst: VarRef) -> i32 {
        for (r, slot) in self.regs.iter_mut().enumerate() {
            if *slot == Some(src) {
                *slot = Some(dst);
                return r as i32;
            }
        }
        -1
    }

    fn get(&self, var: VarRef) -> i32 {
        for (r, slot) in self.regs.iter().enumerate() {
            if *slot == Some(var) {
                return r as i32;
            }
        }
        -1
    }

    fn free(&mut self, var: VarRef) {
        for slot in self.regs.iter_mut() {
            if *slot == Some(var) {
                *slot = None;
            }
        }
    }

    fn max(&self) -> usize {
        self.regs.len()
    }
}

/// Recursive-descent parser for expression recipes.
struct RecipeParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    recipe: &'a str,
}

impl<'a> RecipeParser<'a> {
    fn parse(&mut self, expr: &mut Express) -> CompileResult<()> {
        self.parse_assignment(expr)?;
        while self.is(b';') {
            self.pos += 1;
            self.parse_assignment(expr)?;
        }
        if self.more() {
            return Err(self.error("syntax error in expression"));
        }
        Ok(())
    }

    fn parse_assignment(&mut self, expr: &mut Express) -> CompileResult<()> {
        let var = self.parse_variable(expr)?;
        if matches!(expr.var(var).kind, VarKind::Input | VarKind::Number) {
            return Err(self.error("cannot assign to input variable"));
        }
        if !self.is(b'=') {
            return Err(self.error("expected '=' in expression"));
        }
        self.pos += 1;
        let op = self.parse_expression(expr)?;
        expr.assign(op, var, false);
        Ok(())
    }

    fn parse_expression(&mut self, expr: &mut Express) -> CompileResult<OpRef> {
        if !self.is_letter() {
            return Err(self.error("operation name expected in expression"));
        }
        let start = self.pos;
        while self.is_letter() || self.is_digit() {
            self.pos += 1;
        }
        let name = &self.recipe[start..self.pos];
        let kind = OpKind::lookup(name)
            .ok_or_else(|| self.error(&format!("unknown operation '{name}'")))?;
        if !self.is(b'(') {
            return Err(self.error("expected '(' in expression"));
        }
        self.pos += 1;
        let mut args = vec![self.parse_argument(expr)?];
        while self.is(b',') {
            self.pos += 1;
            args.push(self.parse_argument(expr)?);
        }
        if !self.is(b')') {
            return Err(self.error("expected ')' in expression"));
        }
        self.pos += 1;
        Ok(expr.function(kind, &args))
    }

    fn parse_argument(&mut self, expr: &mut Express) -> CompileResult<VarRef> {
        if self.is_var() {
            self.parse_variable(expr)
        } else {
            // Nested expression assigned to an intermediate variable.
            let op = self.parse_expression(expr)?;
            let temp = expr.new_temp();
            expr.assign(op, temp, false);
            Ok(temp)
        }
    }

    fn parse_variable(&mut self, expr: &mut Express) -> CompileResult<VarRef> {
        let kind = match self.current() {
            Some(b'%') => VarKind::Input,
            Some(b'#') => VarKind::Const,
            Some(b'@') => VarKind::Output,
            Some(b'$') => VarKind::Temp,
            Some(b'_') => VarKind::Number,
            _ => return Err(self.error("unknown variable type in expression")),
        };
        self.pos += 1;
        let mut id = 0i32;
        let mut digits = 0;
        while let Some(c) = self.current() {
            if !c.is_ascii_digit() {
                break;
            }
            id = id * 10 + (c - b'0') as i32;
            self.pos += 1;
            digits += 1;
        }
        if digits == 0 {
            return Err(self.error("variable id expected in expression"));
        }
        Ok(expr.variable(kind, id))
    }

    fn error(&self, msg: &str) -> CompileError {
        CompileError::ExpressionSyntax {
            message: format!(
                "{msg}: {}\u{27a4}{}",
                &self.recipe[..self.pos],
                &self.recipe[self.pos..]
            ),
        }
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn is(&self, ch: u8) -> bool {
        self.current() == Some(ch)
    }

    fn is_digit(&self) -> bool {
        self.current().map(|c| c.is_ascii_digit()).unwrap_or(false)
    }

    fn is_letter(&self) -> bool {
        self.current().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
    }

    fn is_var(&self) -> bool {
        matches!(self.current(), Some(b'%' | b'#' | b'@' | b'$' | b'_'))
    }

    fn more(&self) -> bool {
        self.pos < self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(recipe: &str) -> String {
        let mut expr = Express::new();
        expr.parse(recipe).unwrap();
        expr.as_recipe()
    }

    #[test]
    fn test_recipe_roundtrip_simple() {
        assert_eq!(roundtrip("@0=Add(%0,%1)"), "@0=Add(%0,%1)");
        assert_eq!(roundtrip("@0=Relu(Add(Mul(%0,%1),%2))"), "@0=Relu(Add(Mul(%0,%1),%2))");
        assert_eq!(roundtrip("@0=Sub(#0,_1)"), "@0=Sub(#0,_1)");
    }

    #[test]
    fn test_recipe_roundtrip_multi_assignment() {
        assert_eq!(
            roundtrip("$0=Add(%0,%1);@0=Mul($0,$0)"),
            "$0=Add(%0,%1);@0=Mul($0,$0)"
        );
    }

    #[test]
    fn test_recipe_temp_inlining() {
        // A single-use temp renders inline.
        let mut expr = Express::new();
        expr.parse("$0=Mul(%0,%1);@0=Add($0,%2)").unwrap();
        assert_eq!(expr.as_recipe(), "@0=Add(Mul(%0,%1),%2)");
    }

    #[test]
    fn test_parse_errors() {
        let mut expr = Express::new();
        assert!(expr.parse("@0=Bogus(%0)").is_err());
        let mut expr = Express::new();
        assert!(expr.parse("%0=Add(%1,%2)").is_err());
        let mut expr = Express::new();
        assert!(expr.parse("@0=Add(%0,%1").is_err());
    }

    #[test]
    fn test_common_subexpression_elimination() {
        let mut expr = Express::new();
        expr.parse("$0=Mul(%0,%1);$1=Mul(%0,%1);@0=Add($0,$0);@1=Add($1,$1)")
            .unwrap();
        expr.eliminate_common_subexpressions();
        assert_eq!(expr.num_ops(OpKind::Mul), 1);
    }

    #[test]
    fn test_merge_with_mapping() {
        // First: @0=Add(%0,%1); second: @0=Relu(%0) where second's %0 is
        // first's @0, demoted to a temp.
        let mut first = Express::new();
        first.parse("@0=Add(%0,%1)").unwrap();
        let mut second = Express::new();
        second.parse("@0=Relu(%0)").unwrap();

        let old_out = first.variable(VarKind::Output, 0);
        first.var_mut(old_out).kind = VarKind::Temp;
        first.compact_temp_vars();

        let mut mapping = HashMap::new();
        let sec_in = second.variable(VarKind::Input, 0);
        let sec_out = second.variable(VarKind::Output, 0);
        mapping.insert(sec_in, old_out);
        let new_out = first.variable(VarKind::Output, 0);
        mapping.insert(sec_out, new_out);

        first.merge(&second, &mapping);
        assert_eq!(first.as_recipe(), "@0=Relu(Add(%0,%1))");
    }

    #[test]
    fn test_live_ranges_and_registers() {
        let mut expr = Express::new();
        expr.parse("$0=Add(%0,%1);$1=Mul($0,%2);@0=Add($1,$0)").unwrap();
        expr.compute_live_ranges();
        let n = expr.allocate_registers();
        // $0 and $1 are simultaneously live.
        assert_eq!(n, 2);
    }

    #[test]
    fn test_register_reuse_after_death() {
        let mut expr = Express::new();
        expr.parse("$0=Add(%0,%1);@0=Relu($0);$1=Mul(%2,%3);@1=Relu($1)").unwrap();
        expr.compute_live_ranges();
        let n = expr.allocate_registers();
        // $1 reuses the register of the dead $0.
        assert_eq!(n, 1);
    }

    #[test]
    fn test_complexity_ignores_moves() {
        let mut expr = Express::new();
        expr.parse("$0=Id(%0);@0=Add($0,%1)").unwrap();
        assert_eq!(expr.complexity(), 1);
    }

    #[test]
    fn test_lower_reductions_sections() {
        let mut expr = Express::new();
        expr.parse("@0=Sum(%0)").unwrap();
        expr.lower_reductions();
        assert_eq!(expr.body, 1);
        assert_eq!(expr.tail_start(), 2);
        assert!(!expr.has_reduction());
        assert_eq!(expr.num_ops(OpKind::Add), 1);
    }

    #[test]
    fn test_rewrite_two_operand_model() {
        // SSE-like model: dst must equal first operand; memory operands
        // allowed on the second operand.
        let model = Model {
            mov_reg_reg: true,
            mov_reg_mem: true,
            mov_mem_reg: true,
            op_reg_reg: true,
            op_reg_mem: true,
            func_reg_reg: true,
            func_reg_mem: true,
            ..Default::default()
        };
        let mut expr = Express::new();
        expr.parse("@0=Add(%0,%1)").unwrap();
        let rewritten = expr.rewrite(&model).unwrap();
        // Expect: $0=Id(%0); $0=Add($0,%1); @0=Id($0)  (modulo inlining).
        assert!(rewritten.num_ops(OpKind::Mov) >= 2);
        rewritten.order().iter().for_each(|&op| {
            if rewritten.op(op).kind == OpKind::Add {
                assert!(rewritten.op(op).first_is_dest);
            }
        });
    }

    #[test]
    fn test_rewrite_three_operand_model() {
        // AVX-like model: three-operand ops with memory last.
        let model = Model {
            mov_reg_reg: true,
            mov_reg_mem: true,
            mov_mem_reg: true,
            op_reg_reg_reg: true,
            op_reg_reg_mem: true,
            func_reg_reg: true,
            func_reg_mem: true,
            ..Default::default()
        };
        let mut expr = Express::new();
        expr.parse("@0=Add(%0,%1)").unwrap();
        let rewritten = expr.rewrite(&model).unwrap();
        // One load for the first operand, the add, and the store.
        assert_eq!(rewritten.num_ops(OpKind::Add), 1);
        let mut expr2 = Express::new();
        expr2.parse("@0=Relu(%0)").unwrap();
        let rewritten2 = expr2.rewrite(&model).unwrap();
        assert_eq!(rewritten2.num_ops(OpKind::Relu), 1);
    }

    #[test]
    fn test_rewrite_register_allocation() {
        let model = Model {
            mov_reg_reg: true,
            mov_reg_mem: true,
            mov_mem_reg: true,
            op_reg_reg: true,
            op_reg_mem: true,
            func_reg_reg: true,
            func_reg_mem: true,
            ..Default::default()
        };
        let mut expr = Express::new();
        expr.parse("@0=Relu(Add(Mul(%0,%1),%2))").unwrap();
        let mut rewritten = expr.rewrite(&model).unwrap();
        rewritten.compute_live_ranges();
        let n = rewritten.allocate_registers();
        assert!(n >= 1 && n <= 4, "unexpected register count {n}");
    }

    #[test]
    fn test_eliminate_redundant_moves() {
        let mut expr = Express::new();
        expr.parse("$0=Id(%0);@0=Add($0,%1)").unwrap();
        expr.eliminate_redundant_moves();
        assert_eq!(expr.as_recipe(), "@0=Add(%0,%1)");
    }
}
