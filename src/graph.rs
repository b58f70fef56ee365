//! Graphviz output for flow graphs.

use std::fmt::Write as _;

use crate::flow::Flow;

/// Options for flow graph rendering.
pub struct GraphOptions {
    pub direction: &'static str,
    pub op_shape: &'static str,
    pub var_shape: &'static str,
    /// Include constant variables in the graph.
    pub include_constants: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        GraphOptions {
            direction: "BT",
            op_shape: "box",
            var_shape: "ellipse",
            include_constants: true,
        }
    }
}

/// Render a flow as a Graphviz dot graph.
pub fn flow_to_dot(flow: &Flow, options: &GraphOptions) -> String {
    let mut dot = String::new();
    let _ = writeln!(dot, "digraph flow {{");
    let _ = writeln!(dot, "  rankdir={};", options.direction);

    for op in flow.ops() {
        let _ = writeln!(
            dot,
            "  op{} [label=\"{}\\n{}\" shape={}];",
            op.id.0, op.kind, op.name, options.op_shape
        );
    }
    for var in flow.vars() {
        if var.constant() && !options.include_constants {
            continue;
        }
        let _ = writeln!(
            dot,
            "  var{} [label=\"{}\" shape={}];",
            var.id.0, var.name, options.var_shape
        );
    }
    for op in flow.ops() {
        for &input in &op.inputs {
            let _ = writeln!(dot, "  var{} -> op{};", input.0, op.id.0);
        }
        for &output in &op.outputs {
            let _ = writeln!(dot, "  op{} -> var{};", op.id.0, output.0);
        }
    }
    dot.push_str("}\n");
    dot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Shape, Type};

    #[test]
    fn test_dot_output_lists_nodes_and_edges() {
        let mut flow = Flow::new();
        let func = flow.add_func("f");
        let x = flow.add_var("x", Type::Float32, Shape::new(&[4]));
        let y = flow.add_var("y", Type::Float32, Shape::new(&[4]));
        flow.add_op_with(func, "relu", "Relu", &[x], &[y]);
        let dot = flow_to_dot(&flow, &GraphOptions::default());
        assert!(dot.contains("digraph flow"));
        assert!(dot.contains("Relu"));
        assert!(dot.contains("->"));
    }
}
