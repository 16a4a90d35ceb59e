//! Element types and byte order

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dimension size marking an unlimited (growable) axis
pub const UNLIMITED: u64 = u64::MAX;

/// Byte order of stored numeric units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
    /// Opaque or structured data that is never swapped
    NotApplicable,
}

impl ByteOrder {
    /// Byte order of the running host
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        }
    }

    /// Whether units in this order must be swapped to reach host order
    pub fn needs_swap(&self) -> bool {
        match self {
            ByteOrder::NotApplicable => false,
            order => *order != Self::native(),
        }
    }
}

/// Storage type of one logical dataset element.
///
/// An element is `factor` consecutive units of `unit_size` bytes. Scalars
/// have a factor of 1; fixed-size array types such as `int32[3]` have a
/// unit of 4 bytes and a factor of 3. Byte swapping works per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementType {
    pub unit_size: usize,
    pub factor: usize,
    pub byte_order: ByteOrder,
}

impl ElementType {
    pub fn new(unit_size: usize, byte_order: ByteOrder) -> Self {
        Self {
            unit_size,
            factor: 1,
            byte_order,
        }
    }

    /// Fixed-size array of `count` units
    pub fn array(unit_size: usize, count: usize, byte_order: ByteOrder) -> Self {
        Self {
            unit_size,
            factor: count,
            byte_order,
        }
    }

    /// Structured record of `size` bytes, decoded through a compound layout
    pub fn compound(size: usize) -> Self {
        Self {
            unit_size: size,
            factor: 1,
            byte_order: ByteOrder::NotApplicable,
        }
    }

    pub fn little_endian(unit_size: usize) -> Self {
        Self::new(unit_size, ByteOrder::LittleEndian)
    }

    pub fn big_endian(unit_size: usize) -> Self {
        Self::new(unit_size, ByteOrder::BigEndian)
    }

    /// Bytes occupied by one logical element
    pub fn size_in_bytes(&self) -> usize {
        self.unit_size * self.factor
    }

    /// Whether copies need per-unit byte reversal
    pub fn needs_swap(&self) -> bool {
        self.unit_size > 1 && self.byte_order.needs_swap()
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.factor == 1 {
            write!(f, "{}-byte {:?}", self.unit_size, self.byte_order)
        } else {
            write!(
                f,
                "{}x{}-byte {:?}",
                self.factor, self.unit_size, self.byte_order
            )
        }
    }
}

/// Plain numeric types that typed reads can produce
pub trait Element: Copy + Default + Send + Sync + 'static {
    /// Size of one value in bytes
    const SIZE: usize;

    /// Decode from exactly `SIZE` host-order bytes
    fn from_ne_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty),*) => {
        $(
            impl Element for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_ne_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(ElementType::little_endian(4).size_in_bytes(), 4);
        assert_eq!(
            ElementType::array(2, 3, ByteOrder::LittleEndian).size_in_bytes(),
            6
        );
        assert_eq!(ElementType::compound(12).size_in_bytes(), 12);
    }

    #[test]
    fn test_swap_rules() {
        let foreign = if ByteOrder::native() == ByteOrder::LittleEndian {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        };

        assert!(ElementType::new(4, foreign).needs_swap());
        assert!(!ElementType::new(1, foreign).needs_swap());
        assert!(!ElementType::new(4, ByteOrder::native()).needs_swap());
        assert!(!ElementType::compound(8).needs_swap());
    }

    #[test]
    fn test_element_decode() {
        let value = 0x0102_0304_i32;
        assert_eq!(i32::from_ne_slice(&value.to_ne_bytes()), value);
        assert_eq!(f64::from_ne_slice(&1.5f64.to_ne_bytes()), 1.5);
    }
}
