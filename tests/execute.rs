//! End-to-end compilation and execution tests.
//!
//! These tests compile small flows to machine code and run them on concrete
//! inputs, comparing against scalar reference computations.

#![cfg(target_arch = "x86_64")]

use myelin::flow::{Flow, Shape, Type};
use myelin::instance::Instance;
use myelin::kernel;
use myelin::network::{Library, Network, NetworkOptions};
use myelin::runtime::BasicRuntime;

fn library() -> Library {
    let _ = env_logger::builder().is_test(true).try_init();
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

#[test]
fn test_elementwise_fusion_executes() {
    // y = Relu(Add(Mul(a, b), c)) with float32 [8, 16] operands.
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

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();

    // The whole chain collapsed into one fused step.
    assert_eq!(net.cell(cell).steps.len(), 1);
    let step = &net.steps()[net.cell(cell).steps[0].0];
    assert_eq!(step.kind, "Calculate");
    assert_eq!(step.get_attr("expr"), Some("@0=Relu(Add(Mul(%0,%1),%2))"));

    // The instance must at least hold the output.
    assert!(net.cell(cell).instance_size >= 4 * 8 * 16);

    let ta = net.find_tensor("a").unwrap();
    let tb = net.find_tensor("b").unwrap();
    let tc = net.find_tensor("c").unwrap();
    let ty = net.find_tensor("y").unwrap();

    let mut data = Instance::new(&net, cell).unwrap();
    let mut expected = vec![0f32; 8 * 16];
    for r in 0..8 {
        for col in 0..16 {
            let va = (r as f32) - 3.5 + (col as f32) * 0.25;
            let vb = 1.5 - (col as f32) * 0.5;
            let vc = ((r + col) % 5) as f32 - 2.0;
            *data.get_at2::<f32>(ta, r, col) = va;
            *data.get_at2::<f32>(tb, r, col) = vb;
            *data.get_at2::<f32>(tc, r, col) = vc;
            expected[r * 16 + col] = (va * vb + vc).max(0.0);
        }
    }
    data.compute();
    for r in 0..8 {
        for col in 0..16 {
            assert_eq!(
                *data.get_at2::<f32>(ty, r, col),
                expected[r * 16 + col],
                "mismatch at [{r},{col}]"
            );
        }
    }
}

#[test]
fn test_div_sqrt_becomes_rsqrt() {
    // y = 1 / Sqrt(x) with float32 [1024].
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let x = flow.add_var("x", Type::Float32, Shape::new(&[1024]));
    let s = flow.add_var("s", Type::Float32, Shape::new(&[1024]));
    let one = flow.add_const("one", Type::Float32, Shape::scalar(), 1.0f32.to_le_bytes().to_vec());
    let y = flow.add_var("y", Type::Float32, Shape::new(&[1024]));
    flow.var_mut(y).output = true;
    flow.add_op_with(func, "sqrt", "Sqrt", &[x], &[s]);
    flow.add_op_with(func, "div", "Div", &[one, s], &[y]);

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();

    // No division or square root step survives the transforms.
    for &step in &net.cell(cell).steps {
        let kind = &net.steps()[step.0].kind;
        assert!(kind != "Div" && kind != "Sqrt", "unexpected step {kind}");
    }

    let tx = net.find_tensor("x").unwrap();
    let ty = net.find_tensor("y").unwrap();
    let mut data = Instance::new(&net, cell).unwrap();
    for i in 0..1024 {
        *data.get_at::<f32>(tx, i) = 0.5 + i as f32;
    }
    data.compute();
    for i in 0..1024 {
        let x = 0.5 + i as f32;
        let expected = 1.0 / x.sqrt();
        let got = *data.get_at::<f32>(ty, i);
        let err = (got - expected).abs() / expected;
        assert!(err < 1e-6, "rsqrt({x}) = {got}, want {expected}");
    }
}

#[test]
fn test_in_place_sharing_reuses_storage() {
    // t = Mul(a, b); u = Add(t, c) with t consumed only by the addition.
    // Fusion is blocked so the planner's in-place reuse kicks in.
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let a = flow.add_var("a", Type::Float32, Shape::new(&[64]));
    let b = flow.add_var("b", Type::Float32, Shape::new(&[64]));
    let c = flow.add_var("c", Type::Float32, Shape::new(&[64]));
    let t = flow.add_var("t", Type::Float32, Shape::new(&[64]));
    let u = flow.add_var("u", Type::Float32, Shape::new(&[64]));
    flow.var_mut(u).output = true;
    let mul = flow.add_op_with(func, "mul", "Mul", &[a, b], &[t]);
    let add = flow.add_op_with(func, "add", "Add", &[t, c], &[u]);
    flow.op_mut(mul).set_attr("nomerge", "1");
    flow.op_mut(add).set_attr("nomerge", "1");

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    assert_eq!(net.cell(cell).steps.len(), 2);

    let tt = net.find_tensor("t").unwrap();
    let tu = net.find_tensor("u").unwrap();
    assert_eq!(net.tensor(tu).shared, Some(tt));
    assert_eq!(net.tensor(tu).offset, net.tensor(tt).offset);

    // One shared buffer, not two: a, b, c, and t/u united.
    assert!(net.cell(cell).instance_size < 5 * 64 * 4 + 256);

    let ta = net.find_tensor("a").unwrap();
    let tb = net.find_tensor("b").unwrap();
    let tc = net.find_tensor("c").unwrap();
    let mut data = Instance::new(&net, cell).unwrap();
    for i in 0..64 {
        *data.get_at::<f32>(ta, i) = i as f32;
        *data.get_at::<f32>(tb, i) = 2.0;
        *data.get_at::<f32>(tc, i) = -10.0;
    }
    data.compute();
    for i in 0..64 {
        assert_eq!(*data.get_at::<f32>(tu, i), i as f32 * 2.0 - 10.0);
    }

    // The cell dump shows the union.
    let dump = net.cell_to_string(cell);
    assert!(dump.contains("union"), "no union in:\n{dump}");
}

#[test]
fn test_assignment_absorption_executes() {
    // target <- Add(a, b) through an absorbed assignment.
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let a = flow.add_var("a", Type::Float32, Shape::new(&[32]));
    let b = flow.add_var("b", Type::Float32, Shape::new(&[32]));
    let c = flow.add_var("c", Type::Float32, Shape::new(&[32]));
    let target = flow.add_var("target", Type::Float32, Shape::new(&[32]));
    flow.var_mut(target).input = true;
    let calc = flow.add_op_with(func, "calc", "Calculate", &[a, b], &[c]);
    flow.op_mut(calc).set_attr("expr", "@0=Add(%0,%1)");
    flow.add_op_with(func, "assign", "Assign", &[target, c], &[]);

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    assert_eq!(net.cell(cell).steps.len(), 1);
    let step = &net.steps()[net.cell(cell).steps[0].0];
    assert_eq!(step.kind, "Assign");
    // The assignment target stays at input index 0.
    assert_eq!(step.inputs[0], net.find_tensor("target").unwrap());

    let ta = net.find_tensor("a").unwrap();
    let tb = net.find_tensor("b").unwrap();
    let tt = net.find_tensor("target").unwrap();
    let mut data = Instance::new(&net, cell).unwrap();
    for i in 0..32 {
        *data.get_at::<f32>(ta, i) = i as f32;
        *data.get_at::<f32>(tb, i) = 100.0;
    }
    data.compute();
    for i in 0..32 {
        assert_eq!(*data.get_at::<f32>(tt, i), i as f32 + 100.0);
    }
}

#[test]
fn test_sum_reduction_executes() {
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let x = flow.add_var("x", Type::Float32, Shape::new(&[100]));
    let s = flow.add_var("s", Type::Float32, Shape::scalar());
    flow.var_mut(s).output = true;
    flow.add_op_with(func, "sum", "Sum", &[x], &[s]);

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    let tx = net.find_tensor("x").unwrap();
    let ts = net.find_tensor("s").unwrap();

    let mut data = Instance::new(&net, cell).unwrap();
    let mut expected = 0f32;
    for i in 0..100 {
        let v = (i as f32) * 0.5 - 10.0;
        *data.get_at::<f32>(tx, i) = v;
        expected += v;
    }
    data.compute();
    assert_eq!(*data.get::<f32>(ts), expected);
}

#[test]
fn test_reduction_guard_keeps_three_steps() {
    // s = Sum(x); y = Add(s, 1); z = Mul(y, x): the sum result is consumed
    // further, so nothing fuses across it.
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let x = flow.add_var("x", Type::Float32, Shape::new(&[16]));
    let s = flow.add_var("s", Type::Float32, Shape::scalar());
    let one = flow.add_const("one", Type::Float32, Shape::scalar(), 1.0f32.to_le_bytes().to_vec());
    let y = flow.add_var("y", Type::Float32, Shape::scalar());
    let z = flow.add_var("z", Type::Float32, Shape::new(&[16]));
    flow.var_mut(z).output = true;
    flow.add_op_with(func, "sum", "Sum", &[x], &[s]);
    flow.add_op_with(func, "add", "Add", &[s, one], &[y]);
    flow.add_op_with(func, "mul", "Mul", &[y, x], &[z]);

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    assert_eq!(net.cell(cell).steps.len(), 3);

    let tx = net.find_tensor("x").unwrap();
    let tz = net.find_tensor("z").unwrap();
    let mut data = Instance::new(&net, cell).unwrap();
    let mut sum = 0f32;
    for i in 0..16 {
        *data.get_at::<f32>(tx, i) = i as f32;
        sum += i as f32;
    }
    data.compute();
    for i in 0..16 {
        assert_eq!(*data.get_at::<f32>(tz, i), (sum + 1.0) * i as f32);
    }
}

#[test]
fn test_scalar_broadcast_operand() {
    // y = Mul(x, g) with a runtime scalar gain.
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let x = flow.add_var("x", Type::Float32, Shape::new(&[48]));
    let g = flow.add_var("g", Type::Float32, Shape::scalar());
    let y = flow.add_var("y", Type::Float32, Shape::new(&[48]));
    flow.var_mut(y).output = true;
    flow.add_op_with(func, "scale", "Mul", &[x, g], &[y]);

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    let tx = net.find_tensor("x").unwrap();
    let tg = net.find_tensor("g").unwrap();
    let ty = net.find_tensor("y").unwrap();

    let mut data = Instance::new(&net, cell).unwrap();
    for i in 0..48 {
        *data.get_at::<f32>(tx, i) = i as f32;
    }
    *data.get::<f32>(tg) = 0.25;
    data.compute();
    for i in 0..48 {
        assert_eq!(*data.get_at::<f32>(ty, i), i as f32 * 0.25);
    }
}

#[test]
fn test_int32_expression_executes() {
    // y = Add(Mul(a, b), c) over int32.
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let a = flow.add_var("a", Type::Int32, Shape::new(&[24]));
    let b = flow.add_var("b", Type::Int32, Shape::new(&[24]));
    let c = flow.add_var("c", Type::Int32, Shape::new(&[24]));
    let t = flow.add_var("t", Type::Int32, Shape::new(&[24]));
    let y = flow.add_var("y", Type::Int32, Shape::new(&[24]));
    flow.var_mut(y).output = true;
    flow.add_op_with(func, "mul", "Mul", &[a, b], &[t]);
    flow.add_op_with(func, "add", "Add", &[t, c], &[y]);

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    let ta = net.find_tensor("a").unwrap();
    let tb = net.find_tensor("b").unwrap();
    let tc = net.find_tensor("c").unwrap();
    let ty = net.find_tensor("y").unwrap();

    let mut data = Instance::new(&net, cell).unwrap();
    for i in 0..24 {
        *data.get_at::<i32>(ta, i) = i as i32 - 12;
        *data.get_at::<i32>(tb, i) = 3;
        *data.get_at::<i32>(tc, i) = 1000;
    }
    data.compute();
    for i in 0..24 {
        assert_eq!(*data.get_at::<i32>(ty, i), (i as i32 - 12) * 3 + 1000);
    }
}

#[test]
fn test_float64_executes() {
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let a = flow.add_var("a", Type::Float64, Shape::new(&[16]));
    let b = flow.add_var("b", Type::Float64, Shape::new(&[16]));
    let y = flow.add_var("y", Type::Float64, Shape::new(&[16]));
    flow.var_mut(y).output = true;
    flow.add_op_with(func, "sub", "Sub", &[a, b], &[y]);

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    let ta = net.find_tensor("a").unwrap();
    let tb = net.find_tensor("b").unwrap();
    let ty = net.find_tensor("y").unwrap();
    let mut data = Instance::new(&net, cell).unwrap();
    for i in 0..16 {
        *data.get_at::<f64>(ta, i) = i as f64 * 1.5;
        *data.get_at::<f64>(tb, i) = 0.25;
    }
    data.compute();
    for i in 0..16 {
        assert_eq!(*data.get_at::<f64>(ty, i), i as f64 * 1.5 - 0.25);
    }
}

#[test]
fn test_channel_reference_input() {
    // The cell reads its input through a channel-bound reference tensor.
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let xref = flow.add_var("xref", Type::Float32, Shape::new(&[1, 8]));
    flow.var_mut(xref).is_ref = true;
    flow.var_mut(xref).input = true;
    let y = flow.add_var("y", Type::Float32, Shape::new(&[1, 8]));
    flow.var_mut(y).output = true;
    flow.add_op_with(func, "relu", "Relu", &[xref], &[y]);
    let cnx = flow.add_connector("steps");
    flow.add_link(cnx, xref);

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    let connector = net.find_connector("steps").unwrap();
    let txref = net.find_tensor("xref").unwrap();
    let ty = net.find_tensor("y").unwrap();

    // Reference slots take pointer-sized space in the instance.
    assert_eq!(net.tensor(txref).space, std::mem::size_of::<*const u8>());

    let mut channel = myelin::instance::Channel::new(&net, connector);
    channel.resize(2).unwrap();
    let elem = channel.element_size();
    assert!(elem >= 8 * 4);
    unsafe {
        let slot = channel.at(1) as *mut f32;
        for i in 0..8 {
            *slot.add(i) = i as f32 - 4.0;
        }
    }

    let mut data = Instance::new(&net, cell).unwrap();
    data.set_channel(txref, &channel, 1);
    data.compute();
    for i in 0..8 {
        let expected = (i as f32 - 4.0).max(0.0);
        assert_eq!(*data.get_at2::<f32>(ty, 0, i), expected);
    }
}

#[test]
fn test_zero_length_tensor_produces_no_work() {
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let x = flow.add_var("x", Type::Float32, Shape::new(&[0, 4]));
    let y = flow.add_var("y", Type::Float32, Shape::new(&[0, 4]));
    flow.var_mut(y).output = true;
    flow.add_op_with(func, "relu", "Relu", &[x], &[y]);

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    let mut data = Instance::new(&net, cell).unwrap();
    data.compute();
}

#[test]
fn test_instance_formatting() {
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let x = flow.add_var("x", Type::Float32, Shape::new(&[3]));
    let y = flow.add_var("y", Type::Float32, Shape::new(&[3]));
    flow.var_mut(y).output = true;
    flow.add_op_with(func, "neg", "Neg", &[x], &[y]);

    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    let tx = net.find_tensor("x").unwrap();
    let mut data = Instance::new(&net, cell).unwrap();
    *data.get_at::<f32>(tx, 0) = 1.0;
    *data.get_at::<f32>(tx, 1) = 2.0;
    *data.get_at::<f32>(tx, 2) = 3.0;
    let before = data.to_string();
    assert!(before.contains("x = [1,2,3]"), "unexpected dump:\n{before}");
    data.compute();
    // The output reuses the input storage in place, so only the root of
    // the shared pair appears in the dump.
    let ty = net.find_tensor("y").unwrap();
    assert_eq!(data.tensor_to_string(ty), "[-1,-2,-3]");
}

#[test]
fn test_network_is_shareable_across_threads() {
    let mut flow = Flow::new();
    let func = flow.add_func("f");
    let x = flow.add_var("x", Type::Float32, Shape::new(&[16]));
    let y = flow.add_var("y", Type::Float32, Shape::new(&[16]));
    flow.var_mut(y).output = true;
    flow.add_op_with(func, "relu", "Relu", &[x], &[y]);
    let net = compile(&mut flow);
    let cell = net.find_cell("f").unwrap();
    let tx = net.find_tensor("x").unwrap();
    let ty = net.find_tensor("y").unwrap();

    // Each thread runs its own instance against the shared network.
    std::thread::scope(|scope| {
        for worker in 0..4 {
            let net = &net;
            scope.spawn(move || {
                let mut data = Instance::new(net, cell).unwrap();
                for i in 0..16 {
                    *data.get_at::<f32>(tx, i) = worker as f32 - i as f32;
                }
                data.compute();
                for i in 0..16 {
                    let expected = (worker as f32 - i as f32).max(0.0);
                    assert_eq!(*data.get_at::<f32>(ty, i), expected);
                }
            });
        }
    });
}
