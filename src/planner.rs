//! Instance memory planner.
//!
//! Given the compiled steps of each cell and the layout constraints the
//! kernels declared during the adjust phase, the planner resolves element
//! order, computes aligned shapes and strides, and assigns every tensor an
//! offset in its cell's host (and, where placed, device) instance block.
//!
//! Constraint resolution is a fixpoint propagation over `link` edges; all
//! merges are monotone maxima, so the result equals the per-class solution
//! of a union-find over linked tensors.

use log::trace;

use crate::error::{CompileError, CompileResult};
use crate::network::{Network, CACHE_LINE_SIZE};
use crate::runtime::Task;
use crate::tensor::{align_up, Order, TensorId, MIN_DATA_ALIGNMENT};

/// Plan instance memory for all cells in the network.
pub(crate) fn plan(net: &mut Network) -> CompileResult<()> {
    propagate_shared_alignment(net);
    propagate_links(net)?;
    compute_layout(net)?;
    size_connectors(net);
    assign_offsets(net)?;
    Ok(())
}

/// Propagate byte alignment requirements down shared-storage chains.
fn propagate_shared_alignment(net: &mut Network) {
    for t in 0..net.tensors.len() {
        let byte_alignment = net.tensors[t].byte_alignment;
        let mut next = net.tensors[t].shared;
        while let Some(target) = next {
            if net.tensors[target.0].byte_alignment < byte_alignment {
                net.tensors[target.0].byte_alignment = byte_alignment;
            }
            next = net.tensors[target.0].shared;
        }
    }
}

/// Propagate alignment, order, and byte alignment constraints between
/// linked tensors until the fixpoint.
fn propagate_links(net: &mut Network) -> CompileResult<()> {
    let mut again = true;
    while again {
        again = false;
        for t in 0..net.tensors.len() {
            let link = match net.tensors[t].link {
                Some(link) => link,
                None => continue,
            };
            let l = link.0;

            if net.tensors[t].ty != net.tensors[l].ty
                || !net.tensors[t].shape.compatible(&net.tensors[l].shape)
            {
                return Err(CompileError::IncompatibleLink {
                    tensor: net.tensors[t].name.clone(),
                    tensor_type: net.tensors[t].type_string(),
                    link: net.tensors[l].name.clone(),
                    link_type: net.tensors[l].type_string(),
                });
            }

            // Propagate per-dimension alignment over trailing dimensions.
            let mut dt = net.tensors[t].rank() as isize - 1;
            let mut dl = net.tensors[l].rank() as isize - 1;
            while dt >= 0 && dl >= 0 {
                let (dti, dli) = (dt as usize, dl as usize);
                if net.tensors[t].dim(dti) != -1 && net.tensors[l].dim(dli) != -1 {
                    let at = net.tensors[t].alignment.dim(dti);
                    let al = net.tensors[l].alignment.dim(dli);
                    if at > al {
                        net.tensors[l].alignment.set(dli, at);
                        again = true;
                    } else if at < al {
                        net.tensors[t].alignment.set(dti, al);
                        again = true;
                    }
                }
                dt -= 1;
                dl -= 1;
            }

            // Propagate order requirements.
            let combined = crate::tensor::combined_order(
                net.tensors[t].required_order,
                net.tensors[l].required_order,
            );
            if net.tensors[t].required_order != combined
                || net.tensors[l].required_order != combined
            {
                net.tensors[t].required_order = combined;
                net.tensors[l].required_order = combined;
                again = true;
            }

            // Propagate byte alignment.
            let bt = net.tensors[t].byte_alignment;
            let bl = net.tensors[l].byte_alignment;
            if bt < bl {
                net.tensors[t].byte_alignment = bl;
                again = true;
            } else if bt > bl {
                net.tensors[l].byte_alignment = bt;
                again = true;
            }
        }
    }
    Ok(())
}

/// Resolve element order and compute aligned shape, strides, size and
/// placement for every tensor.
fn compute_layout(net: &mut Network) -> CompileResult<()> {
    for t in 0..net.tensors.len() {
        {
            let tensor = &mut net.tensors[t];
            match tensor.required_order {
                Order::ColumnMajor => tensor.order = Order::ColumnMajor,
                Order::Any | Order::RowMajor => {}
                Order::Conflicting => {
                    return Err(CompileError::ConflictingOrder {
                        tensor: tensor.name.clone(),
                    });
                }
            }

            let mut size = tensor.element_size();
            let rank = tensor.rank();
            let dims: Vec<usize> = if tensor.order == Order::RowMajor {
                (0..rank).rev().collect()
            } else {
                (0..rank).collect()
            };
            for d in dims {
                tensor.stride.set(d, size as i64);
                let mut dim = tensor.shape.dim(d);
                if dim == -1 {
                    dim = 1;
                }
                let aligned = align_up(dim as usize, tensor.alignment.dim(d) as usize);
                tensor.aligned.set(d, aligned as i64);
                size *= aligned;
            }
            tensor.size = size;
            tensor.space = if tensor.is_ref {
                MIN_DATA_ALIGNMENT
            } else {
                size
            };
        }

        // A tensor is placed where it is produced and everywhere it is
        // consumed.
        if let Some(producer) = net.tensors[t].producer {
            let place = net.step_placement(producer);
            net.tensors[t].placement = net.tensors[t].placement.add(place);
        }
        for consumer in net.tensors[t].consumers.clone() {
            let place = net.step_placement(consumer);
            net.tensors[t].placement = net.tensors[t].placement.add(place);
        }

        let tensor = &net.tensors[t];
        trace!(
            "tensor {}: {} alignment {}:{} aligned {} size {} stride {}",
            tensor.name,
            tensor.type_string(),
            tensor.alignment,
            tensor.byte_alignment,
            tensor.aligned,
            tensor.space,
            tensor.stride,
        );
    }
    Ok(())
}

/// Compute channel element alignment for connectors.
fn size_connectors(net: &mut Network) {
    for c in 0..net.connectors.len() {
        let type_tensor = net.connectors[c].type_tensor;
        let byte_alignment = net.tensors[type_tensor.0].byte_alignment;
        let alignment = byte_alignment.max(CACHE_LINE_SIZE);
        net.connectors[c].alignment = alignment;
    }
}

/// Lay out instance blocks: runtime prefix, task structures, then tensors
/// ordered by descending alignment.
fn assign_offsets(net: &mut Network) -> CompileResult<()> {
    // Reserve the runtime prefix and task structures.
    for c in 0..net.cells.len() {
        if net.cells[c].instance_alignment < CACHE_LINE_SIZE {
            net.cells[c].instance_alignment = CACHE_LINE_SIZE;
        }
        let extra = net.runtime().extra_instance_data(&net.cells[c]);
        net.cells[c].instance_size = extra;
        for task in 0..net.cells[c].tasks.len() {
            let offset = align_up(net.cells[c].instance_size, MIN_DATA_ALIGNMENT);
            net.cells[c].tasks[task].offset = offset;
            net.cells[c].instance_size = offset + std::mem::size_of::<Task>();
        }
    }

    // Assign offsets to unshared tensors, largest alignment first so each
    // alignment class pays for at most one gap.
    let mut order: Vec<TensorId> = (0..net.tensors.len()).map(TensorId).collect();
    order.sort_by_key(|t| std::cmp::Reverse(net.tensors[t.0].byte_alignment));
    for &t in &order {
        let cell = match net.tensors[t.0].cell {
            Some(cell) => cell,
            None => continue,
        };
        if net.tensors[t.0].is_constant() || net.tensors[t.0].shared.is_some() {
            continue;
        }
        let align = if net.tensors[t.0].is_ref {
            MIN_DATA_ALIGNMENT
        } else {
            net.tensors[t.0].byte_alignment
        };
        if net.tensors[t.0].placement.on_host() {
            let offset = align_up(net.cells[cell.0].instance_size, align);
            net.tensors[t.0].offset = Some(offset);
            net.cells[cell.0].instance_size = offset + net.tensors[t.0].space;
            if net.tensors[t.0].byte_alignment > net.cells[cell.0].instance_alignment {
                net.cells[cell.0].instance_alignment = net.tensors[t.0].byte_alignment;
            }
        }
        if net.tensors[t.0].placement.on_device() {
            let offset = align_up(net.cells[cell.0].device_instance_size, align);
            net.tensors[t.0].device_offset = Some(offset);
            net.cells[cell.0].device_instance_size = offset + net.tensors[t.0].space;
            if net.tensors[t.0].byte_alignment > net.cells[cell.0].device_instance_alignment {
                net.cells[cell.0].device_instance_alignment = net.tensors[t.0].byte_alignment;
            }
        }
    }

    // Shared tensors adopt the offset of their storage root.
    for t in 0..net.tensors.len() {
        if net.tensors[t].shared.is_none() {
            continue;
        }
        let mut root = TensorId(t);
        let mut hops = 0;
        while let Some(next) = net.tensors[root.0].shared {
            root = next;
            hops += 1;
            if hops > net.tensors.len() {
                return Err(CompileError::MalformedFlow {
                    reason: format!("sharing cycle at tensor {}", net.tensors[t].name),
                });
            }
        }
        net.tensors[t].offset = net.tensors[root.0].offset;
        net.tensors[t].device_offset = net.tensors[root.0].device_offset;
        trace!(
            "share {} with {}",
            net.tensors[t].name,
            net.tensors[root.0].name
        );
    }
    Ok(())
}

/// Live range of a tensor within its cell's step order: from the first step
/// that reads or writes it to the last step that reads it.
fn live_range(net: &Network, t: TensorId) -> Option<(usize, usize)> {
    let cell = net.tensors[t.0].cell?;
    let steps = &net.cells[cell.0].steps;
    let position = |step: crate::network::StepId| steps.iter().position(|&s| s == step);
    let mut first = None;
    let mut last = None;
    if let Some(producer) = net.tensors[t.0].producer {
        first = position(producer);
        last = first;
    }
    for &consumer in &net.tensors[t.0].consumers {
        if let Some(pos) = position(consumer) {
            if first.map(|f| pos < f).unwrap_or(true) {
                first = Some(pos);
            }
            if last.map(|l| pos > l).unwrap_or(true) {
                last = Some(pos);
            }
        }
    }
    match (first, last) {
        (Some(first), Some(last)) => Some((first, last)),
        _ => None,
    }
}

/// Check the planning invariants for a compiled network.
pub(crate) fn validate(net: &Network) -> CompileResult<()> {
    let fail = |reason: String| -> CompileResult<()> {
        Err(CompileError::MalformedFlow { reason })
    };

    for tensor in net.tensors() {
        for d in 0..tensor.rank() {
            if tensor.dim(d) != -1 && tensor.aligned.dim(d) < tensor.dim(d) {
                return fail(format!("tensor {} under-aligned dim {}", tensor.name, d));
            }
            if tensor.aligned.dim(d) % tensor.alignment.dim(d) != 0 {
                return fail(format!(
                    "tensor {} aligned dim {} not a multiple of its alignment",
                    tensor.name, d
                ));
            }
        }

        if let (Some(cell), Some(offset)) = (tensor.cell, tensor.offset) {
            let cell = net.cell(cell);
            if offset + tensor.space > cell.instance_size {
                return fail(format!(
                    "tensor {} exceeds instance of cell {}",
                    tensor.name, cell.name
                ));
            }
            if tensor.shared.is_none() {
                let align = if tensor.is_ref {
                    MIN_DATA_ALIGNMENT
                } else {
                    tensor.byte_alignment
                };
                if offset % align != 0 {
                    return fail(format!("tensor {} misaligned at {}", tensor.name, offset));
                }
            }
        }

        if tensor.is_ref && tensor.space != MIN_DATA_ALIGNMENT {
            return fail(format!("reference tensor {} has non-pointer space", tensor.name));
        }

        // Linked tensors share trailing alignment.
        if let Some(link) = tensor.link {
            let l = net.tensor(link);
            let mut dt = tensor.rank() as isize - 1;
            let mut dl = l.rank() as isize - 1;
            while dt >= 0 && dl >= 0 {
                if tensor.dim(dt as usize) != -1
                    && l.dim(dl as usize) != -1
                    && tensor.alignment.dim(dt as usize) != l.alignment.dim(dl as usize)
                {
                    return fail(format!(
                        "linked tensors {} and {} have different alignment",
                        tensor.name, l.name
                    ));
                }
                dt -= 1;
                dl -= 1;
            }
            if tensor.byte_alignment != l.byte_alignment {
                return fail(format!(
                    "linked tensors {} and {} have different byte alignment",
                    tensor.name, l.name
                ));
            }
        }

        // Shared chains resolve to an unshared root, and in-place pairs
        // have non-overlapping live ranges: the source's last read must not
        // come after the target's first write.
        if let Some(target) = tensor.shared {
            let mut root = target;
            while let Some(next) = net.tensor(root).shared {
                root = next;
            }
            if net.tensor(root).shared.is_some() {
                return fail(format!("shared root of {} is itself shared", tensor.name));
            }
            if tensor.placement.on_host() && !net.tensor(root).placement.on_host() {
                return fail(format!(
                    "shared root of host tensor {} is not on the host",
                    tensor.name
                ));
            }
            if let (Some((first_def, _)), Some((_, last_use))) =
                (live_range(net, tensor.id), live_range(net, target))
            {
                if last_use > first_def {
                    return fail(format!(
                        "tensors {} and {} share storage with overlapping live ranges",
                        tensor.name,
                        net.tensor(target).name
                    ));
                }
            }
        }
    }
    Ok(())
}
