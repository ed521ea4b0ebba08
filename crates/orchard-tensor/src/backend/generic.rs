//! Generic (naive loop-based) backend implementation.

use super::{Backend, KernelInput, KernelOp, KernelOutput, Launch};
use crate::error::KernelError;
use crate::layout::Layout;

/// Generic backend using strided host loops.
///
/// This backend is always available and serves as the fallback for every
/// accelerated launch. Accumulation runs in logical row-major order in `f32`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericBackend;

#[derive(Clone, Copy)]
struct Src {
    ptr: *const f32,
    layout: Layout,
}

#[derive(Clone, Copy)]
struct Dst {
    ptr: *mut f32,
    layout: Layout,
}

impl Backend for GenericBackend {
    fn name(&self) -> &str {
        "generic"
    }

    unsafe fn launch(&self, op: &KernelOp, launch: &Launch<'_>) -> Result<(), KernelError> {
        let name = op.name();
        if launch.inputs.len() != op.arity() {
            return Err(KernelError::InvalidLaunch {
                op: name,
                reason: "wrong number of inputs",
            });
        }
        let inputs = launch
            .inputs
            .iter()
            .map(|input| src(name, input))
            .collect::<Result<Vec<_>, _>>()?;
        let out = dst(name, &launch.output)?;
        if out.layout.numel() != launch.numel {
            return Err(KernelError::InvalidLaunch {
                op: name,
                reason: "element count does not match output layout",
            });
        }

        // SAFETY (all arms): the caller guarantees every pointer is valid at
        // each offset its layout addresses.
        unsafe {
            match *op {
                KernelOp::Add => binary(name, inputs[0], inputs[1], out, |a, b| a + b),
                KernelOp::Mul => binary(name, inputs[0], inputs[1], out, |a, b| a * b),
                KernelOp::Div { safe: true } => {
                    binary(name, inputs[0], inputs[1], out, |a, b| if b == 0.0 { 0.0 } else { a / b })
                }
                KernelOp::Div { safe: false } => binary(name, inputs[0], inputs[1], out, |a, b| a / b),
                KernelOp::DivScalar { scalar, safe } => {
                    if safe && scalar == 0.0 {
                        unary(name, inputs[0], out, |_| 0.0)
                    } else {
                        unary(name, inputs[0], out, |a| a / scalar)
                    }
                }
                KernelOp::Copy => unary(name, inputs[0], out, |a| a),
                KernelOp::Fill { value } => {
                    for offset in out.layout.offsets() {
                        *out.ptr.add(offset) = value;
                    }
                    Ok(())
                }
                KernelOp::Sum => reduce_all(inputs[0], out, false),
                KernelOp::Mean => reduce_all(inputs[0], out, true),
                KernelOp::SumAxis { axis } => reduce_axis(name, inputs[0], out, axis, false),
                KernelOp::MeanAxis { axis } => reduce_axis(name, inputs[0], out, axis, true),
                KernelOp::Matmul => matmul(name, inputs[0], inputs[1], out),
            }
        }
    }
}

fn src(op: &'static str, input: &KernelInput) -> Result<Src, KernelError> {
    let layout = Layout::from_packed(&input.layout).ok_or(KernelError::InvalidLaunch {
        op,
        reason: "malformed input layout",
    })?;
    if input.ptr.is_null() {
        return Err(KernelError::InvalidLaunch {
            op,
            reason: "null input pointer",
        });
    }
    Ok(Src {
        ptr: input.ptr,
        layout,
    })
}

fn dst(op: &'static str, output: &KernelOutput) -> Result<Dst, KernelError> {
    let layout = Layout::from_packed(&output.layout).ok_or(KernelError::InvalidLaunch {
        op,
        reason: "malformed output layout",
    })?;
    if output.ptr.is_null() {
        return Err(KernelError::InvalidLaunch {
            op,
            reason: "null output pointer",
        });
    }
    Ok(Dst {
        ptr: output.ptr,
        layout,
    })
}

fn same_extents(op: &'static str, a: &Layout, b: &Layout) -> Result<(), KernelError> {
    if a.dims() != b.dims() {
        return Err(KernelError::InvalidLaunch {
            op,
            reason: "operand extents differ from output extents",
        });
    }
    Ok(())
}

unsafe fn binary(
    op: &'static str,
    lhs: Src,
    rhs: Src,
    out: Dst,
    f: impl Fn(f32, f32) -> f32,
) -> Result<(), KernelError> {
    same_extents(op, &lhs.layout, &out.layout)?;
    same_extents(op, &rhs.layout, &out.layout)?;
    let offsets = lhs
        .layout
        .offsets()
        .zip(rhs.layout.offsets())
        .zip(out.layout.offsets());
    for ((a, b), o) in offsets {
        // SAFETY: offsets stay within the spans the caller vouched for.
        unsafe { *out.ptr.add(o) = f(*lhs.ptr.add(a), *rhs.ptr.add(b)) };
    }
    Ok(())
}

unsafe fn unary(op: &'static str, input: Src, out: Dst, f: impl Fn(f32) -> f32) -> Result<(), KernelError> {
    same_extents(op, &input.layout, &out.layout)?;
    for (a, o) in input.layout.offsets().zip(out.layout.offsets()) {
        // SAFETY: as in `binary`. Reading before writing keeps in-place launches correct.
        unsafe { *out.ptr.add(o) = f(*input.ptr.add(a)) };
    }
    Ok(())
}

unsafe fn reduce_all(input: Src, out: Dst, mean: bool) -> Result<(), KernelError> {
    if out.layout.numel() != 1 {
        return Err(KernelError::InvalidLaunch {
            op: if mean { "mean" } else { "sum" },
            reason: "whole-tensor reduction writes one element",
        });
    }
    let mut acc = 0.0f32;
    for offset in input.layout.offsets() {
        // SAFETY: as in `binary`.
        acc += unsafe { *input.ptr.add(offset) };
    }
    if mean {
        acc /= input.layout.numel() as f32;
    }
    // SAFETY: as in `binary`.
    unsafe { *out.ptr.add(out.layout.offset()) = acc };
    Ok(())
}

unsafe fn reduce_axis(
    op: &'static str,
    input: Src,
    out: Dst,
    axis: usize,
    mean: bool,
) -> Result<(), KernelError> {
    let invalid = |reason| KernelError::InvalidLaunch { op, reason };
    if axis >= input.layout.rank() {
        return Err(invalid("axis out of range"));
    }
    // Base offsets of every reduced line: the input with `axis` pinned to 0.
    let bases = input
        .layout
        .slice(axis, 0, 1, 1)
        .map_err(|_| invalid("axis out of range"))?;
    same_extents(op, &bases, &out.layout)?;
    let len = input.layout.dims()[axis];
    let stride = input.layout.strides()[axis];
    for (base, o) in bases.offsets().zip(out.layout.offsets()) {
        let mut acc = 0.0f32;
        for step in 0..len {
            // SAFETY: as in `binary`.
            acc += unsafe { *input.ptr.add(base + step * stride) };
        }
        if mean {
            acc /= len as f32;
        }
        // SAFETY: as in `binary`.
        unsafe { *out.ptr.add(o) = acc };
    }
    Ok(())
}

unsafe fn matmul(op: &'static str, lhs: Src, rhs: Src, out: Dst) -> Result<(), KernelError> {
    let invalid = |reason| KernelError::InvalidLaunch { op, reason };
    let (a, b, c) = (&lhs.layout, &rhs.layout, &out.layout);
    if a.rank() != 2 || b.rank() != 2 || c.rank() != 2 {
        return Err(invalid("matmul operands must be rank 2"));
    }
    let (m, k, n) = (a.dims()[0], a.dims()[1], b.dims()[1]);
    if b.dims()[0] != k || c.dims() != [m, n] {
        return Err(invalid("inner or output dimensions disagree"));
    }
    let (sa, sb, sc) = (a.strides(), b.strides(), c.strides());
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                // SAFETY: as in `binary`.
                unsafe {
                    acc += *lhs.ptr.add(a.offset() + i * sa[0] + p * sa[1])
                        * *rhs.ptr.add(b.offset() + p * sb[0] + j * sb[1]);
                }
            }
            // SAFETY: as in `binary`.
            unsafe { *out.ptr.add(c.offset() + i * sc[0] + j * sc[1]) = acc };
        }
    }
    Ok(())
}
