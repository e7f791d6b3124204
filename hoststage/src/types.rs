/// Rank of a participant in a communicator group (0-indexed).
pub type Rank = u32;

/// Element types a staged collective can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    I8 = 2,
    I32 = 3,
    I64 = 4,
    U8 = 5,
    U32 = 6,
    U64 = 7,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A Rust scalar that maps onto a [`DataType`].
///
/// Values cross the host/device boundary as little-endian bytes, so staging
/// buffers never need to be aligned for `Self`.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DataType;

    fn read_le(bytes: &[u8]) -> Self;

    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_element {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DataType = DataType::$dt;

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Self::from_le_bytes(raw)
                }

                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_element!(
    f32 => F32,
    f64 => F64,
    i8 => I8,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u32 => U32,
    u64 => U64,
);

/// Encode a typed slice as little-endian bytes.
pub fn to_bytes<T: Element>(values: &[T]) -> Vec<u8> {
    let size = T::DTYPE.size_in_bytes();
    let mut out = vec![0u8; values.len() * size];
    for (chunk, v) in out.chunks_exact_mut(size).zip(values) {
        v.write_le(chunk);
    }
    out
}

/// Decode little-endian bytes into typed values. Trailing partial elements are ignored.
pub fn from_bytes<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::DTYPE.size_in_bytes())
        .map(T::read_le)
        .collect()
}

/// Reduction applied per element when blocks from different ranks meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
}

impl ReduceOp {
    pub const ALL: [ReduceOp; 4] = [ReduceOp::Sum, ReduceOp::Prod, ReduceOp::Min, ReduceOp::Max];

    pub const fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Prod => "prod",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
        }
    }
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque reduction token understood by a network backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeOp(pub u32);

const NATIVE_SUM: u32 = 0x5801;
const NATIVE_PROD: u32 = 0x5802;
const NATIVE_MIN: u32 = 0x5803;
const NATIVE_MAX: u32 = 0x5804;

/// Default translation from [`ReduceOp`] to the backend's native token.
pub const fn to_native_op(op: ReduceOp) -> NativeOp {
    match op {
        ReduceOp::Sum => NativeOp(NATIVE_SUM),
        ReduceOp::Prod => NativeOp(NATIVE_PROD),
        ReduceOp::Min => NativeOp(NATIVE_MIN),
        ReduceOp::Max => NativeOp(NATIVE_MAX),
    }
}

/// Inverse of [`to_native_op`]; `None` for tokens the default table never produces.
pub const fn from_native_op(op: NativeOp) -> Option<ReduceOp> {
    match op.0 {
        NATIVE_SUM => Some(ReduceOp::Sum),
        NATIVE_PROD => Some(ReduceOp::Prod),
        NATIVE_MIN => Some(ReduceOp::Min),
        NATIVE_MAX => Some(ReduceOp::Max),
        _ => None,
    }
}
