//! Compilation structure and planner invariant tests.

use myelin::flow::{Flow, Shape, Type};
use myelin::kernel;
use myelin::network::{Library, Network, NetworkOptions};
use myelin::runtime::BasicRuntime;
use myelin::tensor::Order;

fn library() -> Library {
    let mut library = Library::new();
    kernel::register_arithmetic(&mut library);
    library
}

fn compile(flow: &mut Flow) -> Network {
    Network::compile(
        flow,
        &library(),
        Box::new(BasicRuntime::new()),
        NetworkOptions::default(),
    )
    .expect("compilation failed")
}

fn chain_flow() -> Flow {
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let a = flow.add_var("a", Type::Float32, Shape::new(&[8, 16]));
    let b = flow.add_var("b", Type::Float32, Shape::new(&[8, 16]));
    let c = flow.add_var("c", Type::Float32, Shape::new(&[8, 16]));
    let t0 = flow.add_var("t0", Type::Float32, Shape::new(&[8, 16]));
    let t1 = flow.add_var("t1", Type::Float32, Shape::new(&[8, 16]));
    let y = flow.add_var("y", Type::Float32, Shape::new(&[8, 16]));
    flow.var_mut(y).output = true;
    flow.add_op_with(func, "mul", "Mul", &[a, b], &[t0]);
    flow.add_op_with(func, "add", "Add", &[t0, c], &[t1]);
    flow.add_op_with(func, "relu", "Relu", &[t1], &[y]);
    flow
}

#[test]
fn test_planner_invariants_hold() {
    let mut flow = chain_flow();
    let net = compile(&mut flow);
    for tensor in net.tensors() {
        // Aligned dims dominate the shape and respect their alignment.
        for d in 0..tensor.rank() {
            if tensor.dim(d) >= 0 {
                assert!(tensor.aligned.dim(d) >= tensor.dim(d));
            }
            assert_eq!(tensor.aligned.dim(d) % tensor.alignment.dim(d), 0);
        }
        // Host tensors stay inside their cell's instance.
        if let (Some(cell), Some(offset)) = (tensor.cell, tensor.offset) {
            let cell = net.cell(cell);
            assert!(offset + tensor.space <= cell.instance_size);
            if tensor.shared.is_none() {
                assert_eq!(offset % tensor.byte_alignment, 0);
            }
        }
        // Shared chains end in an unshared root.
        if let Some(mut root) = tensor.shared {
            while let Some(next) = net.tensor(root).shared {
                root = next;
            }
            assert!(net.tensor(root).shared.is_none());
            assert_eq!(tensor.offset, net.tensor(root).offset);
        }
        // Linked tensors agree on alignment.
        if let Some(link) = tensor.link {
            assert_eq!(tensor.byte_alignment, net.tensor(link).byte_alignment);
        }
    }
}

#[test]
fn test_row_major_strides() {
    let mut flow = chain_flow();
    let net = compile(&mut flow);
    let y = net.tensor(net.find_tensor("y").unwrap());
    assert_eq!(y.order, Order::RowMajor);
    // stride[d] = stride[d+1] * aligned[d+1]
    assert_eq!(y.stride.dim(1), 4);
    assert_eq!(y.stride.dim(0), 4 * y.aligned.dim(1));
    assert_eq!(y.size, (y.stride.dim(0) * y.aligned.dim(0)) as usize);
}

#[test]
fn test_instance_alignment_is_cache_line() {
    let mut flow = chain_flow();
    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    assert!(net.cell(cell).instance_alignment >= 64);
}

#[test]
fn test_unknown_op_reports_no_kernel() {
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let x = flow.add_var("x", Type::Float32, Shape::new(&[4]));
    let y = flow.add_var("y", Type::Float32, Shape::new(&[4]));
    flow.var_mut(y).output = true;
    flow.add_op_with(func, "conv", "Conv2D", &[x], &[y]);
    let err = Network::compile(
        &mut flow,
        &library(),
        Box::new(BasicRuntime::new()),
        NetworkOptions::default(),
    )
    .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Conv2D"), "unexpected error: {message}");
}

#[test]
fn test_type_mismatch_reports_no_kernel() {
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let a = flow.add_var("a", Type::Float32, Shape::new(&[4]));
    let b = flow.add_var("b", Type::Int32, Shape::new(&[4]));
    let y = flow.add_var("y", Type::Float32, Shape::new(&[4]));
    flow.var_mut(y).output = true;
    flow.add_op_with(func, "add", "Add", &[a, b], &[y]);
    assert!(Network::compile(
        &mut flow,
        &library(),
        Box::new(BasicRuntime::new()),
        NetworkOptions::default(),
    )
    .is_err());
}

#[test]
fn test_multiple_cells_from_multiple_functions() {
    let mut flow = Flow::new();
    let f = flow.add_func("first");
    let g = flow.add_func("second");
    let a = flow.add_var("a", Type::Float32, Shape::new(&[8]));
    let y1 = flow.add_var("y1", Type::Float32, Shape::new(&[8]));
    let b = flow.add_var("b", Type::Float32, Shape::new(&[8]));
    let y2 = flow.add_var("y2", Type::Float32, Shape::new(&[8]));
    flow.var_mut(y1).output = true;
    flow.var_mut(y2).output = true;
    flow.add_op_with(f, "relu1", "Relu", &[a], &[y1]);
    flow.add_op_with(g, "relu2", "Relu", &[b], &[y2]);
    let net = compile(&mut flow);
    assert!(net.find_cell("first").is_some());
    assert!(net.find_cell("second").is_some());
    assert_eq!(net.cells().len(), 2);
}

#[test]
fn test_cell_dump_lists_steps_and_vars() {
    let mut flow = chain_flow();
    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    let dump = net.cell_to_string(cell);
    assert!(dump.starts_with("cell f {"));
    assert!(dump.contains("var "));
    assert!(dump.contains("Calculate("));
}

#[test]
fn test_generated_code_is_nonempty_and_writable() {
    let mut flow = chain_flow();
    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    assert!(net.cell(cell).code.size() > 0);
    let path = std::env::temp_dir().join("myelin_cell_code.bin");
    net.cell(cell)
        .write_code_to_file(path.to_str().unwrap())
        .unwrap();
    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), net.cell(cell).code.size());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_step_complexity_scales_with_elements() {
    let mut flow = chain_flow();
    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    let lib = library();
    let step = net.cell(cell).steps[0];
    let kernel = lib.lookup("Calculate").first().unwrap();
    // Three fused ops over 8x16 elements.
    assert_eq!(kernel.complexity(&net, step), 3 * 8 * 16);
}

#[test]
fn test_fused_recipe_round_trips() {
    let mut flow = chain_flow();
    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    let step = &net.steps()[net.cell(cell).steps[0].0];
    let recipe = step.get_attr("expr").unwrap();
    let mut expr = myelin::express::Express::new();
    expr.parse(recipe).unwrap();
    assert_eq!(expr.as_recipe(), recipe);
}
