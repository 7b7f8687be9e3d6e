//! The closed set of element types that can travel over a channel.
//!
//! Only two datatypes exist, mirroring `MPI_BYTE` and `MPI_DOUBLE`. The byte width of a
//! message is computed from the concrete Rust type instead of a runtime tag, and the
//! [`Element`] trait is sealed so the set cannot grow outside this crate.

use bytemuck::Pod;

mod sealed {
    pub trait Sealed {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    /// One raw byte (`MPI_BYTE`)
    Byte,
    /// One IEEE-754 binary64 value (`MPI_DOUBLE`)
    Double,
}

impl Datatype {
    /// Width of one element on the wire, in bytes.
    pub const fn size(self) -> usize {
        match self {
            Datatype::Byte => std::mem::size_of::<u8>(),
            Datatype::Double => std::mem::size_of::<f64>(),
        }
    }
}

/// An element type that may be sent, received or gathered.
///
/// Implemented for [`u8`] and [`f64`] only. Values are transmitted in native byte
/// order with no envelope, so both ends of a channel must agree on type and count.
pub trait Element: sealed::Sealed + Pod {
    const DATATYPE: Datatype;
}

impl sealed::Sealed for u8 {}
impl Element for u8 {
    const DATATYPE: Datatype = Datatype::Byte;
}

impl sealed::Sealed for f64 {}
impl Element for f64 {
    const DATATYPE: Datatype = Datatype::Double;
}

/// Number of bytes occupied by `count` elements of `T`.
pub fn byte_len<T: Element>(count: usize) -> usize {
    count * T::DATATYPE.size()
}

pub(crate) fn as_bytes<T: Element>(buf: &[T]) -> &[u8] {
    bytemuck::cast_slice(buf)
}

pub(crate) fn as_bytes_mut<T: Element>(buf: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(buf)
}
