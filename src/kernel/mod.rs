//! Kernel registration.

mod calculate;

pub use calculate::Calculate;

use crate::network::Library;
use crate::transform::{
    AddNegToSub, ConstantFolding, DivTransformer, ExpressionTransformer, LogicTransformer,
    RemoveUnusedInputs,
};

/// Register the expression kernels and the fusion transformer. This is the
/// kernel set constant folding compiles against, so it must not register
/// the constant folder itself.
pub fn register_calculate(library: &mut Library) {
    library.register_transformer(Box::new(ExpressionTransformer));
    library.register(Box::new(Calculate::new("Calculate", "Calculate")));
    library.register(Box::new(Calculate::new("AssignExpr", "Assign")));
    library.register(Box::new(Calculate::new("AddExpr", "Add")));
    library.register(Box::new(Calculate::new("SubExpr", "Sub")));
    library.register(Box::new(Calculate::new("MulExpr", "Mul")));
    library.register(Box::new(Calculate::new("DivExpr", "Div")));
    library.register(Box::new(Calculate::new("MaxExpr", "Maximum")));
    library.register(Box::new(Calculate::new("MinExpr", "Minimum")));
    library.register(Box::new(Calculate::new("NegExpr", "Neg")));
    library.register(Box::new(Calculate::new("AbsExpr", "Abs")));
    library.register(Box::new(Calculate::new("ReluExpr", "Relu")));
    library.register(Box::new(Calculate::new("SqrtExpr", "Sqrt")));
    library.register(Box::new(Calculate::new("RsqrtExpr", "Rsqrt")));
    library.register(Box::new(Calculate::new("ReciprocalExpr", "Reciprocal")));
    library.register(Box::new(Calculate::new("FloorExpr", "Floor")));
    library.register(Box::new(Calculate::new("LogExpr", "Log")));
    library.register(Box::new(Calculate::new("ExpExpr", "Exp")));
    library.register(Box::new(Calculate::new("SigmoidExpr", "Sigmoid")));
    library.register(Box::new(Calculate::new("TanhExpr", "Tanh")));
    library.register(Box::new(Calculate::new("EqualExpr", "Equal")));
    library.register(Box::new(Calculate::new("NotEqualExpr", "NotEqual")));
    library.register(Box::new(Calculate::new("LessExpr", "Less")));
    library.register(Box::new(Calculate::new("LessEqualExpr", "LessEqual")));
    library.register(Box::new(Calculate::new("GreaterExpr", "Greater")));
    library.register(Box::new(Calculate::new("GreaterEqualExpr", "GreaterEqual")));
    library.register(Box::new(Calculate::new("AndExpr", "And")));
    library.register(Box::new(Calculate::new("OrExpr", "Or")));
    library.register(Box::new(Calculate::new("AndNotExpr", "AndNot")));
    library.register(Box::new(Calculate::new("NotExpr", "Not")));
    library.register(Box::new(Calculate::new("SumExpr", "Sum")));
    library.register(Box::new(Calculate::new("ProductExpr", "Product")));
    library.register(Box::new(Calculate::new("MinRedExpr", "Min")));
    library.register(Box::new(Calculate::new("MaxRedExpr", "Max")));
}

/// Register the full arithmetic kernel and transformer set.
pub fn register_arithmetic(library: &mut Library) {
    library.register_noop("Identity");
    library.register_transformer(Box::new(ConstantFolding));
    library.register_transformer(Box::new(DivTransformer));
    library.register_transformer(Box::new(AddNegToSub));
    library.register_transformer(Box::new(LogicTransformer));
    register_calculate(library);
    library.register_transformer(Box::new(RemoveUnusedInputs));
}
