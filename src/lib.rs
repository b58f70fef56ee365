//! Myelin - JIT compiler and runtime for dataflow graphs of tensor
//! operations.
//!
//! Myelin takes a flow - a graph of tensor operations - and compiles it
//! into executable machine code specialized to the host CPU. Element-wise
//! operations are fused into combined expressions, tensors are packed into
//! per-cell instance blocks by the memory planner, and kernels emit code
//! through a macro assembler. At run time an [`instance::Instance`] holds
//! one invocation's parameters and jumps into the generated code.
//!
//! # Usage
//!
//! ```no_run
//! use myelin::flow::{Flow, Shape, Type};
//! use myelin::instance::Instance;
//! use myelin::network::{Library, Network, NetworkOptions};
//! use myelin::runtime::BasicRuntime;
//!
//! let mut flow = Flow::new();
//! let func = flow.add_func("f");
//! let a = flow.add_var("a", Type::Float32, Shape::new(&[8]));
//! let b = flow.add_var("b", Type::Float32, Shape::new(&[8]));
//! let y = flow.add_var("y", Type::Float32, Shape::new(&[8]));
//! flow.add_op_with(func, "add", "Add", &[a, b], &[y]);
//!
//! let mut library = Library::new();
//! myelin::kernel::register_arithmetic(&mut library);
//! let net = Network::compile(
//!     &mut flow,
//!     &library,
//!     Box::new(BasicRuntime::new()),
//!     NetworkOptions::default(),
//! ).unwrap();
//!
//! let cell = net.find_cell("f").unwrap();
//! let mut data = Instance::new(&net, cell).unwrap();
//! data.compute();
//! ```
//!
//! # Architecture
//!
//! - [`flow`] - the input graph model and graph surgery
//! - [`transform`] - the transformer pipeline and expression fusion
//! - [`express`] - the expression IR behind fused operations
//! - [`network`] - compiled networks, kernels, and the emission driver
//! - [`generator`] - expression code generators and operand indexing
//! - [`masm`] - the macro assembler and executable code buffers
//! - [`runtime`] - the runtime contract and bundled runtimes
//! - [`instance`] - instances and channels

pub mod error;
pub mod express;
pub mod flow;
pub mod generator;
pub mod graph;
pub mod instance;
pub mod kernel;
pub mod masm;
pub mod network;
pub(crate) mod planner;
pub mod runtime;
pub mod tensor;
pub mod transform;

pub use error::{CompileError, CompileResult};
pub use flow::{Flow, Shape, Type};
pub use instance::{Channel, Instance};
pub use network::{Cell, Kernel, Library, Network, NetworkOptions, Step};
pub use runtime::{BasicRuntime, Runtime, ThreadedRuntime};
pub use tensor::{Order, Placement, Tensor};
