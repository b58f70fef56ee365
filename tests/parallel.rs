//! Parallel task execution tests.
//!
//! Steps with a nonzero task id run on auxiliary tasks when the runtime
//! supports asynchronous execution: the generated code fills a task
//! structure, calls the runtime's start hook, and waits before consuming
//! the task's outputs.

#![cfg(target_arch = "x86_64")]

use myelin::flow::{Flow, Shape, Type};
use myelin::instance::Instance;
use myelin::kernel;
use myelin::network::{Library, Network, NetworkOptions};
use myelin::runtime::{BasicRuntime, ThreadedRuntime};

fn library() -> Library {
    let mut library = Library::new();
    kernel::register_arithmetic(&mut library);
    library
}

fn parallel_flow() -> Flow {
    // Two independent branches placed on tasks 1 and 2, joined on the main
    // task. The nomerge annotations keep the branches as separate steps.
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let a = flow.add_var("a", Type::Float32, Shape::new(&[32]));
    let b = flow.add_var("b", Type::Float32, Shape::new(&[32]));
    let y1 = flow.add_var("y1", Type::Float32, Shape::new(&[32]));
    let y2 = flow.add_var("y2", Type::Float32, Shape::new(&[32]));
    let z = flow.add_var("z", Type::Float32, Shape::new(&[32]));
    flow.var_mut(z).output = true;
    let relu = flow.add_op_with(func, "branch1", "Relu", &[a], &[y1]);
    let neg = flow.add_op_with(func, "branch2", "Neg", &[b], &[y2]);
    let join = flow.add_op_with(func, "join", "Add", &[y1, y2], &[z]);
    flow.op_mut(relu).task = 1;
    flow.op_mut(relu).set_attr("nomerge", "1");
    flow.op_mut(neg).task = 2;
    flow.op_mut(neg).set_attr("nomerge", "1");
    flow.op_mut(join).set_attr("nomerge", "1");
    flow
}

fn check(net: &Network) {
    let cell = net.find_cell("f").unwrap();
    let ta = net.find_tensor("a").unwrap();
    let tb = net.find_tensor("b").unwrap();
    let tz = net.find_tensor("z").unwrap();
    let mut data = Instance::new(net, cell).unwrap();
    for i in 0..32 {
        *data.get_at::<f32>(ta, i) = i as f32 - 16.0;
        *data.get_at::<f32>(tb, i) = 2.0 * i as f32;
    }
    data.compute();
    for i in 0..32 {
        let expected = (i as f32 - 16.0).max(0.0) - 2.0 * i as f32;
        assert_eq!(*data.get_at::<f32>(tz, i), expected, "lane {i}");
    }
}

#[test]
fn test_tasks_run_on_threads() {
    let mut flow = parallel_flow();
    let net = Network::compile(
        &mut flow,
        &library(),
        Box::new(ThreadedRuntime::new()),
        NetworkOptions::default(),
    )
    .unwrap();
    let cell = net.find_cell("f").unwrap();
    // Both auxiliary tasks have task structures in the instance.
    assert_eq!(net.cell(cell).num_tasks(), 2);
    assert!(net.cell(cell).task_offset(1) > net.cell(cell).task_offset(0));
    check(&net);
}

#[test]
fn test_task_ids_ignored_without_async_runtime() {
    let mut flow = parallel_flow();
    let net = Network::compile(
        &mut flow,
        &library(),
        Box::new(BasicRuntime::new()),
        NetworkOptions::default(),
    )
    .unwrap();
    let cell = net.find_cell("f").unwrap();
    assert_eq!(net.cell(cell).num_tasks(), 0);
    check(&net);
}

#[test]
fn test_repeated_computation_is_stable() {
    let mut flow = parallel_flow();
    let net = Network::compile(
        &mut flow,
        &library(),
        Box::new(ThreadedRuntime::new()),
        NetworkOptions::default(),
    )
    .unwrap();
    for _ in 0..10 {
        check(&net);
    }
}
