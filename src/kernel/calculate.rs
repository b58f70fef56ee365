//! Expression kernels.
//!
//! The `Calculate` kernel generates code for fused element-wise
//! expressions; the same kernel implements the single-op aliases (`Add`,
//! `Relu`, ...) and the `Assign` variant, which stores through its first
//! input instead of a separate output.

use log::trace;

use crate::error::{CompileError, CompileResult};
use crate::express::{Express, OpKind, VarKind, VarRef};
use crate::flow::Type;
use crate::generator::{self, ElementwiseIndexGenerator, Program};
use crate::masm::MacroAssembler;
use crate::network::{Kernel, Network, StepId};

/// Build the expression computed by a step.
fn init_expression(net: &Network, step: StepId) -> CompileResult<Express> {
    let s = net.step(step);
    let mut expr = Express::new();
    if s.kind == "Calculate" || s.kind == "Assign" {
        let recipe = s.get_attr("expr").unwrap_or("@0=Id(%1)");
        expr.parse(recipe)?;
    } else {
        let kind = OpKind::lookup(&s.kind).ok_or_else(|| CompileError::MalformedFlow {
            reason: format!("step {} is not an expression op", s.name),
        })?;
        let args: Vec<VarRef> = (0..s.indegree())
            .map(|i| expr.variable(VarKind::Input, i as i32))
            .collect();
        let func = expr.function(kind, &args);
        let out = expr.variable(VarKind::Output, 0);
        expr.assign(func, out, false);
        expr.compact_temp_vars();
    }
    for i in 0..s.indegree() {
        if net.step_input(step, i).is_constant() {
            if let Some(var) = expr.find_variable(VarKind::Input, i as i32) {
                expr.var_mut(var).kind = VarKind::Const;
            }
        }
    }
    Ok(expr)
}

/// Element type and loop size for a step: taken from the first output, or
/// the first non-scalar input when the output is a scalar.
fn prototype(net: &Network, step: StepId) -> (Type, i64) {
    let s = net.step(step);
    let out = if s.outdegree() > 0 {
        s.outputs[0]
    } else {
        s.inputs[0]
    };
    let mut proto = out;
    if net.tensor(out).is_scalar() {
        for &input in &s.inputs {
            if !net.tensor(input).is_scalar() {
                proto = input;
                break;
            }
        }
    }
    let t = net.tensor(proto);
    (t.ty, t.elements())
}

/// Check if an input broadcasts over the prototype through the repeat
/// iterator: it must be a scalar or match a trailing suffix of the
/// prototype shape.
fn broadcastable(input: &crate::tensor::Tensor, proto: &crate::tensor::Tensor) -> bool {
    if input.is_scalar() {
        return true;
    }
    let ir = input.rank();
    let pr = proto.rank();
    ir <= pr && (0..ir).all(|d| input.dim(d) == proto.dim(pr - ir + d))
}

/// Check that every variable referenced by the expression is a valid step
/// operand, that reduction results stay unconsumed, and that scalar
/// outputs only hold reduction results when the loop is vector-sized.
fn check_expression(net: &Network, step: StepId, expr: &Express) -> bool {
    let s = net.step(step);
    let num_outputs = s.outdegree().max(1);
    for var in expr.var_refs() {
        let v = expr.var(var);
        match v.kind {
            VarKind::Input | VarKind::Const => {
                if v.id < 0 || v.id as usize >= s.indegree() {
                    return false;
                }
            }
            VarKind::Output => {
                if v.id < 0 || v.id as usize >= num_outputs {
                    return false;
                }
            }
            _ => {}
        }
    }
    let (_, elements) = prototype(net, step);
    for &op in expr.order() {
        let o = expr.op(op);
        if o.kind.is_reduction() {
            if let Some(result) = o.result {
                if !expr.var(result).consumers.is_empty() {
                    return false;
                }
            }
            continue;
        }
        if elements > 1 {
            if let Some(result) = o.result {
                let v = expr.var(result);
                if v.kind == VarKind::Output {
                    let tensor = if s.outdegree() == 0 {
                        s.inputs[0]
                    } else {
                        s.outputs[v.id as usize]
                    };
                    if net.tensor(tensor).is_scalar() {
                        return false;
                    }
                }
            }
        }
    }
    true
}

/// Kernel for computing element-wise expressions.
pub struct Calculate {
    name: &'static str,
    operation: &'static str,
}

impl Calculate {
    pub fn new(name: &'static str, operation: &'static str) -> Self {
        Calculate { name, operation }
    }
}

impl Kernel for Calculate {
    fn name(&self) -> &str {
        self.name
    }

    fn operation(&self) -> &str {
        self.operation
    }

    fn supports(&self, net: &Network, step: StepId) -> bool {
        let s = net.step(step);
        if s.kind != self.operation {
            return false;
        }
        if s.indegree() < 1 {
            return false;
        }
        let assign = s.kind == "Assign";
        if !assign && s.outdegree() < 1 {
            return false;
        }
        if assign && s.indegree() < 2 && s.get_attr("expr").is_none() {
            return false;
        }

        // All operands must share the element type; outputs must match the
        // prototype shape or be scalar reduction results; inputs must
        // broadcast over the prototype.
        let mut proto_id = if assign { s.inputs[0] } else { s.outputs[0] };
        if net.tensor(proto_id).is_scalar() {
            for &input in &s.inputs {
                if !net.tensor(input).is_scalar() {
                    proto_id = input;
                    break;
                }
            }
        }
        let proto = net.tensor(proto_id);
        let ty = proto.ty;
        for &input in &s.inputs {
            let t = net.tensor(input);
            if t.ty != ty || !broadcastable(t, proto) {
                return false;
            }
        }
        for &output in &s.outputs {
            let t = net.tensor(output);
            if t.ty != ty {
                return false;
            }
            if !t.has_same_shape(proto) && !t.is_scalar() {
                return false;
            }
        }

        let expr = match init_expression(net, step) {
            Ok(expr) => expr,
            Err(_) => return false,
        };
        if !check_expression(net, step, &expr) {
            return false;
        }
        let (ty, elements) = prototype(net, step);
        generator::select(&expr, ty, elements).is_some()
    }

    fn adjust(&self, net: &mut Network, step: StepId) -> CompileResult<()> {
        let expr = init_expression(net, step)?;
        let (ty, elements) = prototype(net, step);
        let gen = generator::select_or_explain(&expr, ty, elements, &net.step(step).name)?;
        net.step_mut(step).variant = gen.name().to_string();
        trace!("step {} uses generator {}", net.step(step).name, gen.name());

        // Pad all non-scalar operands to whole vectors so the flat loop can
        // run over aligned sizes.
        let vecsize = gen.vector_size(ty);
        let lanes = (vecsize / ty.size()).max(1) as i64;
        let operands: Vec<_> = net
            .step(step)
            .inputs
            .iter()
            .chain(net.step(step).outputs.iter())
            .copied()
            .collect();
        for tensor in operands {
            if !net.tensor(tensor).is_scalar() {
                net.tensor_mut(tensor).set_minimum_alignment(vecsize);
                net.tensor_mut(tensor).align_last(lanes);
            }
        }

        // Enable in-place reuse of inputs for same-shaped outputs.
        for i in 0..net.step(step).indegree() {
            let mut done = false;
            for j in 0..net.step(step).outdegree() {
                let same = {
                    let input = net.step_input(step, i);
                    let output = net.step_output(step, j);
                    input.shape == output.shape
                };
                if same && net.allow_in_place(step, i, j) {
                    done = true;
                    break;
                }
            }
            if done {
                break;
            }
        }

        // Declare register needs so the cell prologue saves enough
        // callee-saved registers. Layout is not planned yet, so the loop
        // register demand is derived from shapes: instance and offset
        // registers, a base per constant or reference operand, and a wrap
        // counter per broadcast input.
        let index = ElementwiseIndexGenerator::new(net, step)?;
        let prog = Program::compile(&expr, ty, gen)?;
        let plan = gen.register_plan(&prog, &index);
        let mut demand = 2 + plan.gp_temps + plan.gp_aux;
        let inputs = net.step(step).inputs.clone();
        let outputs = net.step(step).outputs.clone();
        for &tensor in inputs.iter().chain(outputs.iter()) {
            let t = net.tensor(tensor);
            if t.is_constant() || t.is_ref {
                demand += 1;
            }
        }
        for &tensor in &inputs {
            let t = net.tensor(tensor);
            if !t.is_scalar() && t.elements() >= 0 && t.elements() < elements {
                demand += 1;
            }
        }
        net.set_step_register_usage(step, demand);
        Ok(())
    }

    fn generate(
        &self,
        net: &Network,
        step: StepId,
        masm: &mut MacroAssembler,
    ) -> CompileResult<()> {
        let expr = init_expression(net, step)?;
        let (ty, elements) = prototype(net, step);
        if elements == 0 {
            // Zero-length tensors produce no work.
            return Ok(());
        }
        let gen = generator::select_or_explain(&expr, ty, elements, &net.step(step).name)?;
        let mut index = ElementwiseIndexGenerator::new(net, step)?;
        index.set_vector_size(gen.vector_size(ty));
        let prog = Program::compile(&expr, ty, gen)?;
        let plan = gen.register_plan(&prog, &index);
        index.allocate_registers(
            masm,
            plan.simd_temps,
            plan.simd_aux,
            plan.gp_temps,
            plan.gp_aux,
        )?;
        index.emit_base_loads(net, masm)?;
        gen.generate(&prog, &mut index, masm)
    }

    fn complexity(&self, net: &Network, step: StepId) -> i64 {
        let expr = match init_expression(net, step) {
            Ok(expr) => expr,
            Err(_) => return -1,
        };
        let (_, elements) = prototype(net, step);
        elements.max(0) * expr.complexity()
    }
}
