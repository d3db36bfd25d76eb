//! Schema-driven record encoding.
//!
//! A record is an ordered list of fields, each with a primitive [`Kind`] and
//! its own [`Mode`]. Fields are written back to back with no framing of
//! their own. The generic encoder works on any schema; the [`record!`] macro
//! declares a struct together with its schema and wires it to the encoder:
//!
//! ```
//! use iproto_protocol::{pack, record, unpack, Mode};
//!
//! record! {
//!     #[derive(Debug, PartialEq)]
//!     pub struct Greeting {
//!         #[ber]
//!         pub count: u32,
//!         pub name: String,
//!     }
//! }
//!
//! let greeting = Greeting { count: 258, name: "world".into() };
//! let bytes = pack(&greeting, Mode::Default).unwrap();
//! assert_eq!(&bytes[..], b"\x82\x02\x05\x00\x00\x00world");
//!
//! let (decoded, _) = unpack::<Greeting>(&bytes, Mode::Default).unwrap();
//! assert_eq!(decoded, greeting);
//! ```
//!
//! [`record!`]: crate::record!

use crate::error::PackError;
use crate::pack::{Mode, Pack, Unpack};
use bytes::{Buf, BufMut, Bytes};
use std::fmt;

/// Primitive kinds a record field can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    Bool,
    String,
    Bytes,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::U8 => "u8",
            Kind::U16 => "u16",
            Kind::U32 => "u32",
            Kind::U64 => "u64",
            Kind::I8 => "i8",
            Kind::I16 => "i16",
            Kind::I32 => "i32",
            Kind::I64 => "i64",
            Kind::Bool => "bool",
            Kind::String => "string",
            Kind::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Bool(bool),
    String(String),
    Bytes(Bytes),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::U8(_) => Kind::U8,
            Value::U16(_) => Kind::U16,
            Value::U32(_) => Kind::U32,
            Value::U64(_) => Kind::U64,
            Value::I8(_) => Kind::I8,
            Value::I16(_) => Kind::I16,
            Value::I32(_) => Kind::I32,
            Value::I64(_) => Kind::I64,
            Value::Bool(_) => Kind::Bool,
            Value::String(_) => Kind::String,
            Value::Bytes(_) => Kind::Bytes,
        }
    }

    fn unpack_kind<B: Buf>(kind: Kind, src: &mut B, mode: Mode) -> Result<Self, PackError> {
        Ok(match kind {
            Kind::U8 => Value::U8(u8::unpack(src, mode)?),
            Kind::U16 => Value::U16(u16::unpack(src, mode)?),
            Kind::U32 => Value::U32(u32::unpack(src, mode)?),
            Kind::U64 => Value::U64(u64::unpack(src, mode)?),
            Kind::I8 => Value::I8(i8::unpack(src, mode)?),
            Kind::I16 => Value::I16(i16::unpack(src, mode)?),
            Kind::I32 => Value::I32(i32::unpack(src, mode)?),
            Kind::I64 => Value::I64(i64::unpack(src, mode)?),
            Kind::Bool => Value::Bool(bool::unpack(src, mode)?),
            Kind::String => Value::String(String::unpack(src, mode)?),
            Kind::Bytes => Value::Bytes(Bytes::unpack(src, mode)?),
        })
    }
}

impl Pack for Value {
    fn pack<B: BufMut>(&self, dst: &mut B, mode: Mode) -> Result<(), PackError> {
        match self {
            Value::U8(v) => v.pack(dst, mode),
            Value::U16(v) => v.pack(dst, mode),
            Value::U32(v) => v.pack(dst, mode),
            Value::U64(v) => v.pack(dst, mode),
            Value::I8(v) => v.pack(dst, mode),
            Value::I16(v) => v.pack(dst, mode),
            Value::I32(v) => v.pack(dst, mode),
            Value::I64(v) => v.pack(dst, mode),
            Value::Bool(v) => v.pack(dst, mode),
            Value::String(v) => v.pack(dst, mode),
            Value::Bytes(v) => v.pack(dst, mode),
        }
    }
}

/// One entry of a record schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub kind: Kind,
    pub mode: Mode,
}

impl Field {
    pub const fn new(name: &'static str, kind: Kind, mode: Mode) -> Self {
        Self { name, kind, mode }
    }
}

/// Rust types that map onto a [`Kind`].
pub trait Primitive: Sized {
    const KIND: Kind;

    fn to_value(&self) -> Value;

    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_primitive {
    ($($ty:ty => $variant:ident,)*) => {$(
        impl Primitive for $ty {
            const KIND: Kind = Kind::$variant;

            fn to_value(&self) -> Value {
                Value::$variant(self.clone())
            }

            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    )*};
}

impl_primitive! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    bool => Bool,
    String => String,
    Bytes => Bytes,
}

/// A struct with a fixed schema. Usually implemented by [`record!`].
///
/// [`record!`]: crate::record!
pub trait Record: Sized {
    const FIELDS: &'static [Field];

    fn to_values(&self) -> Vec<Value>;

    fn from_values(values: Vec<Value>) -> Result<Self, PackError>;
}

/// Packs `values` according to `schema`.
///
/// Each value must match its field's kind; the field's mode applies.
pub fn pack_record<B: BufMut>(
    schema: &[Field],
    values: &[Value],
    dst: &mut B,
) -> Result<(), PackError> {
    if schema.len() != values.len() {
        return Err(PackError::Unsupported(format!(
            "record has {} fields, got {} values",
            schema.len(),
            values.len()
        )));
    }

    for (field, value) in schema.iter().zip(values) {
        if value.kind() != field.kind {
            return Err(PackError::Unsupported(format!(
                "field `{}` expects {}, got {}",
                field.name,
                field.kind,
                value.kind()
            )));
        }
        value.pack(dst, field.mode)?;
    }
    Ok(())
}

/// Unpacks one value per field of `schema`, in order.
pub fn unpack_record<B: Buf>(schema: &[Field], src: &mut B) -> Result<Vec<Value>, PackError> {
    schema
        .iter()
        .map(|field| Value::unpack_kind(field.kind, src, field.mode))
        .collect()
}

#[doc(hidden)]
pub fn take_field<T: Primitive>(
    values: &mut impl Iterator<Item = Value>,
    name: &'static str,
) -> Result<T, PackError> {
    let value = values
        .next()
        .ok_or_else(|| PackError::Unsupported(format!("missing field `{}`", name)))?;
    let kind = value.kind();
    T::from_value(value).ok_or_else(|| {
        PackError::Unsupported(format!(
            "field `{}` expects {}, got {}",
            name,
            T::KIND,
            kind
        ))
    })
}

/// Declares a record struct and implements [`Record`], [`Pack`] and
/// [`Unpack`] for it.
///
/// Fields are packed in declaration order. A field marked `#[ber]` uses
/// [`Mode::Ber`]; all others use [`Mode::Default`]. Other field attributes,
/// doc comments included, are kept on the struct field. The mode passed to
/// `pack`/`unpack` on the record itself is ignored.
///
/// Every field must be one of the [`Primitive`] types. Sequences and nested
/// records are not field kinds: pack a `Vec<T>` of records at the top level,
/// or write the extra value after the record.
#[macro_export]
macro_rules! record {
    (@mode ber) => {
        $crate::Mode::Ber
    };
    (@mode default) => {
        $crate::Mode::Default
    };

    // Field list exhausted.
    (@fields $hdr:tt $name:ident [$($done:tt)*] [$($attrs:tt)*] $mode:ident) => {
        $crate::record!(@emit $hdr $name [$($done)*]);
    };
    (@fields $hdr:tt $name:ident [$($done:tt)*] [$($attrs:tt)*] $mode:ident
        #[ber] $($rest:tt)*
    ) => {
        $crate::record!(@fields $hdr $name [$($done)*] [$($attrs)*] ber $($rest)*);
    };
    (@fields $hdr:tt $name:ident [$($done:tt)*] [$($attrs:tt)*] $mode:ident
        #[$($attr:tt)*] $($rest:tt)*
    ) => {
        $crate::record!(@fields $hdr $name [$($done)*] [$($attrs)* #[$($attr)*]] $mode $($rest)*);
    };
    (@fields $hdr:tt $name:ident [$($done:tt)*] [$($attrs:tt)*] $mode:ident
        $fvis:vis $field:ident : $fty:ty $(, $($rest:tt)*)?
    ) => {
        $crate::record!(@fields $hdr $name
            [$($done)* { [$($attrs)* $fvis] $mode $field $fty }]
            [] default $($($rest)*)?
        );
    };

    (@emit { $($hdr:tt)* } $name:ident [
        $( { [ $($fpre:tt)* ] $fmode:ident $field:ident $fty:ty } )*
    ]) => {
        $($hdr)* $name {
            $( $($fpre)* $field: $fty, )*
        }

        impl $crate::record::Record for $name {
            const FIELDS: &'static [$crate::record::Field] = &[
                $(
                    $crate::record::Field::new(
                        stringify!($field),
                        <$fty as $crate::record::Primitive>::KIND,
                        $crate::record!(@mode $fmode),
                    ),
                )*
            ];

            fn to_values(&self) -> ::std::vec::Vec<$crate::record::Value> {
                ::std::vec![
                    $( $crate::record::Primitive::to_value(&self.$field), )*
                ]
            }

            fn from_values(
                values: ::std::vec::Vec<$crate::record::Value>,
            ) -> ::std::result::Result<Self, $crate::PackError> {
                #[allow(unused_mut, unused_variables)]
                let mut values = values.into_iter();
                ::std::result::Result::Ok(Self {
                    $( $field: $crate::record::take_field(&mut values, stringify!($field))?, )*
                })
            }
        }

        impl $crate::Pack for $name {
            fn pack<B: $crate::bytes::BufMut>(
                &self,
                dst: &mut B,
                _mode: $crate::Mode,
            ) -> ::std::result::Result<(), $crate::PackError> {
                let values = <Self as $crate::record::Record>::to_values(self);
                $crate::record::pack_record(
                    <Self as $crate::record::Record>::FIELDS,
                    &values,
                    dst,
                )
            }
        }

        impl $crate::Unpack for $name {
            const MIN_WIRE_LEN: usize = <Self as $crate::record::Record>::FIELDS.len();

            fn unpack<B: $crate::bytes::Buf>(
                src: &mut B,
                _mode: $crate::Mode,
            ) -> ::std::result::Result<Self, $crate::PackError> {
                let values = $crate::record::unpack_record(
                    <Self as $crate::record::Record>::FIELDS,
                    src,
                )?;
                <Self as $crate::record::Record>::from_values(values)
            }
        }
    };

    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident { $($body:tt)* }
    ) => {
        $crate::record!(@fields { $(#[$meta])* $vis struct } $name [] [] default $($body)*);
    };
}
