use bytemuck::Pod;
use derive_more::Display;
use std::{fmt::Debug, str::FromStr};

mod sealed {
    #[doc(hidden)]
    pub trait Sealed {}
}
use sealed::Sealed;

/// Numerical types that can cross the host / device boundary.
#[allow(missing_docs)]
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Display)]
pub enum ScalarType {
    U8 = 1,
    I8 = 2,
    U16 = 3,
    I16 = 4,
    U32 = 5,
    I32 = 6,
    F32 = 7,
    U64 = 8,
    I64 = 9,
    F64 = 10,
}

impl ScalarType {
    /// All scalar types, narrowest first.
    pub fn iter() -> impl Iterator<Item = Self> {
        use ScalarType::*;
        [U8, I8, U16, I16, U32, I32, F32, U64, I64, F64].into_iter()
    }
    /// Size of the type in bytes.
    pub const fn size(&self) -> usize {
        use ScalarType::*;
        match self {
            U8 | I8 => 1,
            U16 | I16 => 2,
            U32 | I32 | F32 => 4,
            U64 | I64 | F64 => 8,
        }
    }
    /// Name of the type.
    ///
    /// Lowercase, ie "u8", "i32", etc.
    pub const fn name(&self) -> &'static str {
        use ScalarType::*;
        match self {
            U8 => "u8",
            I8 => "i8",
            U16 => "u16",
            I16 => "i16",
            U32 => "u32",
            I32 => "i32",
            F32 => "f32",
            U64 => "u64",
            I64 => "i64",
            F64 => "f64",
        }
    }
    /// Name of the type in OpenCL C, ie "uchar", "int", etc.
    pub const fn cl_name(&self) -> &'static str {
        use ScalarType::*;
        match self {
            U8 => "uchar",
            I8 => "char",
            U16 => "ushort",
            I16 => "short",
            U32 => "uint",
            I32 => "int",
            F32 => "float",
            U64 => "ulong",
            I64 => "long",
            F64 => "double",
        }
    }
    /// Is a floating point type.
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
    /// Is a signed integer or floating point type.
    pub const fn is_signed(&self) -> bool {
        use ScalarType::*;
        matches!(self, I8 | I16 | I32 | I64 | F32 | F64)
    }
    /// The unsigned type of the same width.
    ///
    /// Floats are returned unchanged.
    pub const fn to_unsigned(&self) -> Self {
        use ScalarType::*;
        match self {
            I8 => U8,
            I16 => U16,
            I32 => U32,
            I64 => U64,
            _ => *self,
        }
    }
}

/// Parses the rust name ("u32"), the variant ("U32") or the OpenCL C name ("uint").
impl FromStr for ScalarType {
    type Err = ();
    fn from_str(input: &str) -> Result<Self, ()> {
        Self::iter()
            .find(|x| x.to_string() == input || x.name() == input || x.cl_name() == input)
            .ok_or(())
    }
}

/// Base trait for numerical types.
pub trait Scalar: Default + Copy + Pod + Debug + PartialEq + Send + Sync + 'static + Sealed {
    /// The [`ScalarType`] of the scalar.
    const SCALAR_TYPE: ScalarType;
    /// The [`ScalarType`] of the scalar.
    fn scalar_type() -> ScalarType {
        Self::SCALAR_TYPE
    }
    /// Wraps self in a [`ScalarElem`].
    fn scalar_elem(self) -> ScalarElem;
}

/// A scalar value tagged with its type.
///
/// Used wherever the width of a value must travel with it, for example
/// kernel arguments.
#[allow(missing_docs)]
#[derive(Clone, Copy, PartialEq, Debug, Display)]
pub enum ScalarElem {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl<T: Scalar> From<T> for ScalarElem {
    fn from(x: T) -> Self {
        x.scalar_elem()
    }
}

macro_rules! impl_scalar {
    ($($t:ident => $E:ident),+ $(,)?) => {
        $(
            impl Sealed for $t {}

            impl Scalar for $t {
                const SCALAR_TYPE: ScalarType = ScalarType::$E;
                #[inline]
                fn scalar_elem(self) -> ScalarElem {
                    ScalarElem::$E(self)
                }
            }
        )+

        impl ScalarElem {
            /// The [`ScalarType`].
            #[inline]
            pub fn scalar_type(&self) -> ScalarType {
                match self {
                    $(Self::$E(_) => ScalarType::$E,)+
                }
            }
            /// The bytes as a slice, in native byte order.
            ///
            /// See [`bytemuck::bytes_of`].
            #[inline]
            pub fn as_bytes(&self) -> &[u8] {
                match self {
                    $(Self::$E(x) => bytemuck::bytes_of(x),)+
                }
            }
        }
    };
}

impl_scalar!(
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    f32 => F32,
    u64 => U64,
    i64 => I64,
    f64 => F64,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_type_from_str() {
        assert_eq!("uint".parse::<ScalarType>(), Ok(ScalarType::U32));
        assert_eq!("I64".parse::<ScalarType>(), Ok(ScalarType::I64));
        assert_eq!("f32".parse::<ScalarType>(), Ok(ScalarType::F32));
        assert!("half".parse::<ScalarType>().is_err());
    }

    #[test]
    fn scalar_elem_bytes() {
        let elem = ScalarElem::from(7u32);
        assert_eq!(elem.scalar_type(), ScalarType::U32);
        assert_eq!(elem.as_bytes().len(), 4);
        assert_eq!(elem.as_bytes(), 7u32.to_ne_bytes());
        assert_eq!(ScalarElem::from(-1i8).as_bytes(), [0xff]);
    }
}
