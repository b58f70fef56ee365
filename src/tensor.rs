//! Compiled tensors.
//!
//! A tensor is the compiled shadow of a flow variable: a multi-dimensional
//! array with a planned memory layout. Kernels declare layout constraints on
//! tensors during the adjust phase; the memory planner resolves them into
//! offsets, strides and element order.

use crate::flow::{Shape, Type};

/// Element order for tensor data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Any,
    RowMajor,
    ColumnMajor,
    Conflicting,
}

/// Combine two order requirements.
pub fn combined_order(a: Order, b: Order) -> Order {
    use Order::*;
    match (a, b) {
        (Any, other) | (other, Any) => other,
        (RowMajor, RowMajor) => RowMajor,
        (ColumnMajor, ColumnMajor) => ColumnMajor,
        _ => Conflicting,
    }
}

/// Placement of data and computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Nowhere,
    Host,
    Device,
    Everywhere,
}

impl Placement {
    fn bits(self) -> u8 {
        match self {
            Placement::Nowhere => 0,
            Placement::Host => 1,
            Placement::Device => 2,
            Placement::Everywhere => 3,
        }
    }

    fn from_bits(bits: u8) -> Placement {
        match bits {
            0 => Placement::Nowhere,
            1 => Placement::Host,
            2 => Placement::Device,
            _ => Placement::Everywhere,
        }
    }

    /// Add a location to the placement.
    pub fn add(self, place: Placement) -> Placement {
        Placement::from_bits(self.bits() | place.bits())
    }

    pub fn on_host(self) -> bool {
        self.bits() & 1 != 0
    }

    pub fn on_device(self) -> bool {
        self.bits() & 2 != 0
    }
}

/// Minimum data alignment in the instance block.
pub const MIN_DATA_ALIGNMENT: usize = std::mem::size_of::<*const u8>();

/// Round n up to a power-of-two alignment.
pub fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

/// Pointer to immutable constant data owned by the network arena. The data
/// is written once during compilation and read-only afterwards, so sharing
/// across threads is sound.
#[derive(Clone, Copy, Debug)]
pub struct ConstData {
    ptr: *const u8,
    len: usize,
}

unsafe impl Send for ConstData {}
unsafe impl Sync for ConstData {}

impl ConstData {
    pub fn new(ptr: *const u8, len: usize) -> Self {
        ConstData { ptr, len }
    }

    pub fn ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// A compiled tensor with planned layout.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub id: TensorId,
    pub name: String,
    pub ty: Type,
    pub shape: Shape,

    /// Alignment requirement for each dimension.
    pub alignment: Shape,
    /// Shape after alignment.
    pub aligned: Shape,
    /// Byte stride for each dimension.
    pub stride: Shape,
    /// Total size in bytes.
    pub size: usize,
    /// Bytes allocated in the instance; one pointer for references.
    pub space: usize,
    /// Minimum byte alignment in the instance block.
    pub byte_alignment: usize,

    pub order: Order,
    pub required_order: Order,

    /// Tensor is a pointer to data owned elsewhere.
    pub is_ref: bool,
    /// Tensor holds constant data; `data` is filled once layout is known.
    pub constant: bool,
    /// Offset in the host instance block.
    pub offset: Option<usize>,
    /// Offset in the device instance block.
    pub device_offset: Option<usize>,
    /// Aligned constant data in the network arena.
    pub data: Option<ConstData>,

    /// Tensor whose storage backs this one (in-place reuse).
    pub shared: Option<TensorId>,
    /// Tensor with which alignment must be identical.
    pub link: Option<TensorId>,

    pub cell: Option<crate::network::CellId>,
    pub producer: Option<crate::network::StepId>,
    pub consumers: Vec<crate::network::StepId>,
    pub placement: Placement,

    /// Variable was a function input / output in the flow.
    pub input: bool,
    pub output: bool,
}

impl Tensor {
    pub fn new(id: TensorId, name: &str, ty: Type, shape: Shape) -> Self {
        let rank = shape.rank();
        let mut alignment = Shape::scalar();
        alignment.fill(rank, 1);
        let mut stride = Shape::scalar();
        stride.fill(rank, 0);
        Tensor {
            id,
            name: name.to_string(),
            ty,
            aligned: shape.clone(),
            shape,
            alignment,
            stride,
            size: 0,
            space: 0,
            byte_alignment: ty.size(),
            order: Order::RowMajor,
            required_order: Order::Any,
            is_ref: false,
            constant: false,
            offset: None,
            device_offset: None,
            data: None,
            shared: None,
            link: None,
            cell: None,
            producer: None,
            consumers: Vec::new(),
            placement: Placement::Nowhere,
            input: false,
            output: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dim(&self, d: usize) -> i64 {
        self.shape.dim(d)
    }

    pub fn elements(&self) -> i64 {
        self.shape.elements()
    }

    pub fn element_size(&self) -> usize {
        self.ty.size()
    }

    pub fn is_scalar(&self) -> bool {
        self.rank() == 0 || self.elements() == 1
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// Set alignment constraints for the tensor.
    pub fn align(&mut self, align: &Shape) {
        debug_assert!(align.rank() <= self.alignment.rank());
        for d in 0..align.rank() {
            if align.dim(d) > self.alignment.dim(d) {
                self.alignment.set(d, align.dim(d));
            }
        }
    }

    /// Set the alignment constraint for the last dimension.
    pub fn align_last(&mut self, align: i64) {
        let rank = self.rank();
        if rank > 0 && align > self.alignment.dim(rank - 1) {
            self.alignment.set(rank - 1, align);
        }
    }

    /// Set the minimum byte alignment for the tensor.
    pub fn set_minimum_alignment(&mut self, alignment: usize) {
        if alignment > self.byte_alignment {
            self.byte_alignment = alignment;
        }
    }

    /// Check if the tensor can support an element order.
    pub fn supports_order(&self, order: Order) -> bool {
        combined_order(self.required_order, order) != Order::Conflicting
    }

    /// Add a required element order.
    pub fn set_required_order(&mut self, order: Order) {
        self.required_order = combined_order(self.required_order, order);
    }

    pub fn has_same_shape(&self, other: &Tensor) -> bool {
        self.shape == other.shape
    }

    /// Broadcast compatibility with another tensor.
    pub fn compatible(&self, other: &Tensor) -> bool {
        self.shape.compatible(&other.shape)
    }

    /// Byte offset of a row.
    pub fn offset_of(&self, r: usize) -> usize {
        r * self.stride.dim(0) as usize
    }

    /// Byte offset of an element in a matrix.
    pub fn offset_of2(&self, r: usize, c: usize) -> usize {
        r * self.stride.dim(0) as usize + c * self.stride.dim(1) as usize
    }

    /// Read a scalar value from constant data.
    pub fn value<T: crate::flow::Element>(&self) -> Option<T> {
        let data = self.data?;
        if data.len() < std::mem::size_of::<T>() || self.ty != T::TYPE {
            return None;
        }
        let mut value = T::default();
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.ptr(),
                &mut value as *mut T as *mut u8,
                std::mem::size_of::<T>(),
            );
        }
        Some(value)
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
}

/// Give two tensors the same per-dimension alignment.
pub fn same_align(a: &mut Tensor, b: &mut Tensor) {
    let align_b = b.alignment.clone();
    a.align(&align_b);
    let align_a = a.alignment.clone();
    b.align(&align_a);
}

/// Give two tensors compatible alignment modulo broadcasting: trailing
/// dimensions take the maximum of both requirements.
pub fn compatible_align(a: &mut Tensor, b: &mut Tensor) {
    let mut d1 = a.rank() as isize - 1;
    let mut d2 = b.rank() as isize - 1;
    while d1 >= 0 && d2 >= 0 {
        let align = a.alignment.dim(d1 as usize).max(b.alignment.dim(d2 as usize));
        a.alignment.set(d1 as usize, align);
        b.alignment.set(d2 as usize, align);
        d1 -= 1;
        d2 -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_order_table() {
        use Order::*;
        assert_eq!(combined_order(Any, RowMajor), RowMajor);
        assert_eq!(combined_order(RowMajor, RowMajor), RowMajor);
        assert_eq!(combined_order(RowMajor, ColumnMajor), Conflicting);
        assert_eq!(combined_order(ColumnMajor, Any), ColumnMajor);
        assert_eq!(combined_order(Conflicting, Any), Conflicting);
    }

    #[test]
    fn test_placement_accumulation() {
        let p = Placement::Nowhere.add(Placement::Host);
        assert!(p.on_host());
        assert!(!p.on_device());
        let p = p.add(Placement::Device);
        assert_eq!(p, Placement::Everywhere);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(17, 16), 32);
    }

    #[test]
    fn test_alignment_accumulates_max() {
        let mut t = Tensor::new(
            TensorId(0),
            "t",
            crate::flow::Type::Float32,
            Shape::new(&[8, 16]),
        );
        t.align_last(4);
        t.align_last(2);
        assert_eq!(t.alignment.dim(1), 4);
        t.set_minimum_alignment(16);
        t.set_minimum_alignment(8);
        assert_eq!(t.byte_alignment, 16);
    }

    #[test]
    fn test_compatible_align_trailing() {
        let mut a = Tensor::new(
            TensorId(0),
            "a",
            crate::flow::Type::Float32,
            Shape::new(&[8, 16]),
        );
        let mut b = Tensor::new(
            TensorId(1),
            "b",
            crate::flow::Type::Float32,
            Shape::new(&[16]),
        );
        a.align_last(8);
        compatible_align(&mut a, &mut b);
        assert_eq!(b.alignment.dim(0), 8);
        assert_eq!(a.alignment.dim(0), 1);
    }
}
