//! Element-wise reduction over little-endian byte slices, used by the
//! in-process network backend.

use crate::error::{HostStageError, Result};
use crate::types::{DataType, Element, ReduceOp};
use std::num::Wrapping;
use std::ops::{Add, Mul};

/// Integer combiners wrap on overflow.
fn int_combiner<T>(op: ReduceOp) -> fn(T, T) -> T
where
    T: Ord,
    Wrapping<T>: Add<Output = Wrapping<T>> + Mul<Output = Wrapping<T>>,
{
    match op {
        ReduceOp::Sum => |a, b| (Wrapping(a) + Wrapping(b)).0,
        ReduceOp::Prod => |a, b| (Wrapping(a) * Wrapping(b)).0,
        ReduceOp::Min => |a: T, b: T| a.min(b),
        ReduceOp::Max => |a: T, b: T| a.max(b),
    }
}

/// Float min/max keep the left operand when the comparison is unordered.
fn float_combiner<T>(op: ReduceOp) -> fn(T, T) -> T
where
    T: PartialOrd + Add<Output = T> + Mul<Output = T>,
{
    match op {
        ReduceOp::Sum => |a, b| a + b,
        ReduceOp::Prod => |a, b| a * b,
        ReduceOp::Min => |a, b| if b < a { b } else { a },
        ReduceOp::Max => |a, b| if b > a { b } else { a },
    }
}

fn fold<T: Element>(dst: &mut [u8], src: &[u8], count: usize, combine: fn(T, T) -> T) {
    let size = T::DTYPE.size_in_bytes();
    for (d, s) in dst.chunks_exact_mut(size).zip(src.chunks_exact(size)).take(count) {
        combine(T::read_le(d), T::read_le(s)).write_le(d);
    }
}

/// `dst[i] = op(dst[i], src[i])` for `count` elements of `dtype`.
pub(crate) fn reduce_slice(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    let expected = count * dtype.size_in_bytes();
    if dst.len() < expected || src.len() < expected {
        return Err(HostStageError::BufferSizeMismatch {
            expected,
            actual: dst.len().min(src.len()),
        });
    }
    match dtype {
        DataType::F32 => fold(dst, src, count, float_combiner::<f32>(op)),
        DataType::F64 => fold(dst, src, count, float_combiner::<f64>(op)),
        DataType::I8 => fold(dst, src, count, int_combiner::<i8>(op)),
        DataType::I32 => fold(dst, src, count, int_combiner::<i32>(op)),
        DataType::I64 => fold(dst, src, count, int_combiner::<i64>(op)),
        DataType::U8 => fold(dst, src, count, int_combiner::<u8>(op)),
        DataType::U32 => fold(dst, src, count, int_combiner::<u32>(op)),
        DataType::U64 => fold(dst, src, count, int_combiner::<u64>(op)),
    }
    Ok(())
}
