//! Type tags and tagged values.
//!
//! Every value that crosses the process boundary carries a [`TypeTag`].
//! Numeric payloads are little-endian at the declared width, variable-length
//! payloads carry a `u32` little-endian length prefix, and nothing is ever
//! inferred or coerced: a value only encodes under its own tag.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;

const TAG_BOOL: u8 = 0x10;
const TAG_TEXT: u8 = 0x11;
const TAG_BYTES: u8 = 0x12;
const TAG_ARRAY: u8 = 0x20;
const TAG_MATRIX: u8 = 0x21;

/// Fixed-width numeric kinds, shared by scalars and numeric sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl ScalarKind {
    pub const ALL: [ScalarKind; 10] = [
        Self::I8,
        Self::I16,
        Self::I32,
        Self::I64,
        Self::U8,
        Self::U16,
        Self::U32,
        Self::U64,
        Self::F32,
        Self::F64,
    ];

    /// Encoded width of one element in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::I8 => 0x01,
            Self::I16 => 0x02,
            Self::I32 => 0x03,
            Self::I64 => 0x04,
            Self::U8 => 0x05,
            Self::U16 => 0x06,
            Self::U32 => 0x07,
            Self::U64 => 0x08,
            Self::F32 => 0x09,
            Self::F64 => 0x0a,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Discriminator that says how a payload must be decoded.
///
/// On the wire a tag is one byte, or two for sequences (container byte then
/// element kind byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Scalar(ScalarKind),
    Bool,
    /// UTF-8 text.
    Text,
    /// Opaque byte sequence.
    Bytes,
    /// Homogeneous 1-D numeric sequence.
    Array(ScalarKind),
    /// Homogeneous, rectangular, row-major 2-D numeric sequence.
    Matrix(ScalarKind),
}

impl TypeTag {
    pub const I8: TypeTag = TypeTag::Scalar(ScalarKind::I8);
    pub const I16: TypeTag = TypeTag::Scalar(ScalarKind::I16);
    pub const I32: TypeTag = TypeTag::Scalar(ScalarKind::I32);
    pub const I64: TypeTag = TypeTag::Scalar(ScalarKind::I64);
    pub const U8: TypeTag = TypeTag::Scalar(ScalarKind::U8);
    pub const U16: TypeTag = TypeTag::Scalar(ScalarKind::U16);
    pub const U32: TypeTag = TypeTag::Scalar(ScalarKind::U32);
    pub const U64: TypeTag = TypeTag::Scalar(ScalarKind::U64);
    pub const F32: TypeTag = TypeTag::Scalar(ScalarKind::F32);
    pub const F64: TypeTag = TypeTag::Scalar(ScalarKind::F64);

    pub(crate) fn write(self, dst: &mut BytesMut) {
        match self {
            Self::Scalar(kind) => dst.put_u8(kind.code()),
            Self::Bool => dst.put_u8(TAG_BOOL),
            Self::Text => dst.put_u8(TAG_TEXT),
            Self::Bytes => dst.put_u8(TAG_BYTES),
            Self::Array(kind) => {
                dst.put_u8(TAG_ARRAY);
                dst.put_u8(kind.code());
            }
            Self::Matrix(kind) => {
                dst.put_u8(TAG_MATRIX);
                dst.put_u8(kind.code());
            }
        }
    }

    pub(crate) fn read(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        need(src, 1)?;
        let code = src.get_u8();
        match code {
            TAG_BOOL => Ok(Self::Bool),
            TAG_TEXT => Ok(Self::Text),
            TAG_BYTES => Ok(Self::Bytes),
            TAG_ARRAY => Ok(Self::Array(read_element_kind(src)?)),
            TAG_MATRIX => Ok(Self::Matrix(read_element_kind(src)?)),
            other => ScalarKind::from_code(other)
                .map(Self::Scalar)
                .ok_or(ProtocolError::UnknownTag(other)),
        }
    }
}

fn read_element_kind(src: &mut impl Buf) -> Result<ScalarKind, ProtocolError> {
    need(src, 1)?;
    let code = src.get_u8();
    ScalarKind::from_code(code).ok_or(ProtocolError::UnknownTag(code))
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(kind) => write!(f, "{kind}"),
            Self::Bool => f.write_str("bool"),
            Self::Text => f.write_str("text"),
            Self::Bytes => f.write_str("bytes"),
            Self::Array(kind) => write!(f, "array<{kind}>"),
            Self::Matrix(kind) => write!(f, "matrix<{kind}>"),
        }
    }
}

/// Element types that can live in a [`NumericArray`].
pub trait Element: Copy + Sized {
    const KIND: ScalarKind;

    fn slice(array: &NumericArray) -> Option<&[Self]>;
    fn into_vec(array: NumericArray) -> Option<Vec<Self>>;
    fn wrap(values: Vec<Self>) -> NumericArray;
}

/// Extraction of a typed Rust value out of a tagged [`Value`].
///
/// Fails with [`ProtocolError::TagMismatch`] instead of converting between
/// kinds. `Vec<u8>` maps to opaque [`TypeTag::Bytes`]; use [`NumericArray`]
/// for an `array<u8>`.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, ProtocolError>;
}

macro_rules! numeric_types {
    ($($variant:ident($ty:ty) put $put:ident get $get:ident;)*) => {
        /// Homogeneous 1-D numeric sequence.
        #[derive(Debug, Clone)]
        pub enum NumericArray {
            $($variant(Vec<$ty>),)*
        }

        impl NumericArray {
            pub fn kind(&self) -> ScalarKind {
                match self {
                    $(Self::$variant(_) => ScalarKind::$variant,)*
                }
            }

            pub fn len(&self) -> usize {
                match self {
                    $(Self::$variant(values) => values.len(),)*
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
                T::slice(self)
            }

            fn put_elements(&self, dst: &mut BytesMut) {
                match self {
                    $(Self::$variant(values) => {
                        for value in values {
                            dst.$put(*value);
                        }
                    })*
                }
            }

            fn get_elements(
                kind: ScalarKind,
                count: usize,
                src: &mut impl Buf,
            ) -> Result<Self, ProtocolError> {
                let len = count
                    .checked_mul(kind.width())
                    .ok_or(ProtocolError::TooLong(count))?;
                need(src, len)?;
                Ok(match kind {
                    $(ScalarKind::$variant => {
                        Self::$variant((0..count).map(|_| src.$get()).collect())
                    })*
                })
            }
        }

        $(
            impl Element for $ty {
                const KIND: ScalarKind = ScalarKind::$variant;

                fn slice(array: &NumericArray) -> Option<&[Self]> {
                    match array {
                        NumericArray::$variant(values) => Some(values),
                        _ => None,
                    }
                }

                fn into_vec(array: NumericArray) -> Option<Vec<Self>> {
                    match array {
                        NumericArray::$variant(values) => Some(values),
                        _ => None,
                    }
                }

                fn wrap(values: Vec<Self>) -> NumericArray {
                    NumericArray::$variant(values)
                }
            }

            impl From<Vec<$ty>> for NumericArray {
                fn from(values: Vec<$ty>) -> Self {
                    Self::$variant(values)
                }
            }

            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }

            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self, ProtocolError> {
                    match value {
                        Value::$variant(x) => Ok(x),
                        other => Err(mismatch(TypeTag::Scalar(ScalarKind::$variant), &other)),
                    }
                }
            }

            impl FromValue for Vec<Vec<$ty>> {
                fn from_value(value: Value) -> Result<Self, ProtocolError> {
                    let expected = TypeTag::Matrix(ScalarKind::$variant);
                    match value {
                        Value::Matrix(matrix) => {
                            let found = TypeTag::Matrix(matrix.kind());
                            matrix
                                .into_rows::<$ty>()
                                .ok_or(ProtocolError::TagMismatch { expected, found })
                        }
                        other => Err(mismatch(expected, &other)),
                    }
                }
            }
        )*

        /// A value together with its tag.
        ///
        /// Equality is exact: floating-point payloads compare bit-for-bit, so
        /// a NaN equals the same NaN and `0.0 != -0.0`.
        #[derive(Debug, Clone)]
        pub enum Value {
            $($variant($ty),)*
            Bool(bool),
            Text(String),
            Bytes(Vec<u8>),
            Array(NumericArray),
            Matrix(Matrix),
        }

        impl Value {
            pub fn tag(&self) -> TypeTag {
                match self {
                    $(Self::$variant(_) => TypeTag::Scalar(ScalarKind::$variant),)*
                    Self::Bool(_) => TypeTag::Bool,
                    Self::Text(_) => TypeTag::Text,
                    Self::Bytes(_) => TypeTag::Bytes,
                    Self::Array(array) => TypeTag::Array(array.kind()),
                    Self::Matrix(matrix) => TypeTag::Matrix(matrix.kind()),
                }
            }

            fn put_body(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
                match self {
                    $(Self::$variant(x) => dst.$put(*x),)*
                    Self::Bool(b) => dst.put_u8(u8::from(*b)),
                    Self::Text(text) => put_bytes(dst, text.as_bytes())?,
                    Self::Bytes(bytes) => put_bytes(dst, bytes)?,
                    Self::Array(array) => {
                        put_len(dst, array.len())?;
                        array.put_elements(dst);
                    }
                    Self::Matrix(matrix) => {
                        put_len(dst, matrix.rows)?;
                        put_len(dst, matrix.cols)?;
                        matrix.data.put_elements(dst);
                    }
                }
                Ok(())
            }

            fn get_body(tag: TypeTag, src: &mut impl Buf) -> Result<Self, ProtocolError> {
                match tag {
                    $(TypeTag::Scalar(ScalarKind::$variant) => {
                        need(src, ScalarKind::$variant.width())?;
                        Ok(Self::$variant(src.$get()))
                    })*
                    TypeTag::Bool => {
                        need(src, 1)?;
                        match src.get_u8() {
                            0 => Ok(Self::Bool(false)),
                            1 => Ok(Self::Bool(true)),
                            other => Err(ProtocolError::InvalidBool(other)),
                        }
                    }
                    TypeTag::Text => Ok(Self::Text(get_string(src, "text value")?)),
                    TypeTag::Bytes => Ok(Self::Bytes(get_bytes(src)?)),
                    TypeTag::Array(kind) => {
                        let count = get_len(src)?;
                        Ok(Self::Array(NumericArray::get_elements(kind, count, src)?))
                    }
                    TypeTag::Matrix(kind) => {
                        let rows = get_len(src)?;
                        let cols = get_len(src)?;
                        let count = rows
                            .checked_mul(cols)
                            .ok_or(ProtocolError::TooLong(rows))?;
                        let data = NumericArray::get_elements(kind, count, src)?;
                        Ok(Self::Matrix(Matrix { rows, cols, data }))
                    }
                }
            }
        }
    };
}

numeric_types! {
    I8(i8) put put_i8 get get_i8;
    I16(i16) put put_i16_le get get_i16_le;
    I32(i32) put put_i32_le get get_i32_le;
    I64(i64) put put_i64_le get get_i64_le;
    U8(u8) put put_u8 get get_u8;
    U16(u16) put put_u16_le get get_u16_le;
    U32(u32) put put_u32_le get get_u32_le;
    U64(u64) put put_u64_le get get_u64_le;
    F32(f32) put put_f32_le get get_f32_le;
    F64(f64) put put_f64_le get get_f64_le;
}

// `Vec<u8>` is opaque bytes, so the sequence conversions skip it.
macro_rules! array_conversions {
    ($($ty:ty),*) => {
        $(
            impl From<Vec<$ty>> for Value {
                fn from(values: Vec<$ty>) -> Self {
                    Self::Array(NumericArray::from(values))
                }
            }

            impl FromValue for Vec<$ty> {
                fn from_value(value: Value) -> Result<Self, ProtocolError> {
                    let expected = TypeTag::Array(<$ty as Element>::KIND);
                    match value {
                        Value::Array(array) => {
                            let found = TypeTag::Array(array.kind());
                            <$ty as Element>::into_vec(array)
                                .ok_or(ProtocolError::TagMismatch { expected, found })
                        }
                        other => Err(mismatch(expected, &other)),
                    }
                }
            }
        )*
    };
}

array_conversions!(i8, i16, i32, i64, u16, u32, u64, f32, f64);

impl PartialEq for NumericArray {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::I8(a), Self::I8(b)) => a == b,
            (Self::I16(a), Self::I16(b)) => a == b,
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::U8(a), Self::U8(b)) => a == b,
            (Self::U16(a), Self::U16(b)) => a == b,
            (Self::U32(a), Self::U32(b)) => a == b,
            (Self::U64(a), Self::U64(b)) => a == b,
            (Self::F32(a), Self::F32(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Self::F64(a), Self::F64(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::I8(a), Self::I8(b)) => a == b,
            (Self::I16(a), Self::I16(b)) => a == b,
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::U8(a), Self::U8(b)) => a == b,
            (Self::U16(a), Self::U16(b)) => a == b,
            (Self::U32(a), Self::U32(b)) => a == b,
            (Self::U64(a), Self::U64(b)) => a == b,
            (Self::F32(a), Self::F32(b)) => a.to_bits() == b.to_bits(),
            (Self::F64(a), Self::F64(b)) => a.to_bits() == b.to_bits(),
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Matrix(a), Self::Matrix(b)) => a == b,
            _ => false,
        }
    }
}

/// Rectangular row-major 2-D numeric sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: NumericArray,
}

impl Matrix {
    /// Build from flat row-major data; `rows * cols` must equal its length.
    pub fn new(
        rows: usize,
        cols: usize,
        data: impl Into<NumericArray>,
    ) -> Result<Self, ProtocolError> {
        let data = data.into();
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(ProtocolError::ShapeMismatch {
                rows,
                cols,
                len: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Build from nested rows. Ragged input is rejected, never padded.
    pub fn from_rows<T: Element>(rows: Vec<Vec<T>>) -> Result<Self, ProtocolError> {
        let cols = rows.first().map_or(0, Vec::len);
        let num_rows = rows.len();
        let mut flat = Vec::with_capacity(num_rows * cols);
        for (row, values) in rows.into_iter().enumerate() {
            if values.len() != cols {
                return Err(ProtocolError::NonRectangular {
                    row,
                    expected: cols,
                    found: values.len(),
                });
            }
            flat.extend(values);
        }
        Ok(Self {
            rows: num_rows,
            cols,
            data: T::wrap(flat),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn kind(&self) -> ScalarKind {
        self.data.kind()
    }

    pub fn data(&self) -> &NumericArray {
        &self.data
    }

    /// Typed view of the flat row-major data.
    pub fn values<T: Element>(&self) -> Option<&[T]> {
        T::slice(&self.data)
    }

    pub fn into_rows<T: Element>(self) -> Option<Vec<Vec<T>>> {
        let (rows, cols) = (self.rows, self.cols);
        let flat = T::into_vec(self.data)?;
        if cols == 0 {
            return Some(vec![Vec::new(); rows]);
        }
        Some(flat.chunks(cols).map(<[T]>::to_vec).collect())
    }
}

impl Value {
    /// Matrix value from nested rows; fails on ragged input.
    pub fn matrix<T: Element>(rows: Vec<Vec<T>>) -> Result<Self, ProtocolError> {
        Matrix::from_rows(rows).map(Self::Matrix)
    }

    pub fn into_typed<T: FromValue>(self) -> Result<T, ProtocolError> {
        T::from_value(self)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<NumericArray> for Value {
    fn from(value: NumericArray) -> Self {
        Self::Array(value)
    }
}

impl From<Matrix> for Value {
    fn from(value: Matrix) -> Self {
        Self::Matrix(value)
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch(TypeTag::Bool, &other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Text(text) => Ok(text),
            other => Err(mismatch(TypeTag::Text, &other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(mismatch(TypeTag::Bytes, &other)),
        }
    }
}

impl FromValue for NumericArray {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Array(array) => Ok(array),
            other => Err(ProtocolError::Expected {
                expected: "array",
                found: other.tag(),
            }),
        }
    }
}

impl FromValue for Matrix {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Matrix(matrix) => Ok(matrix),
            other => Err(ProtocolError::Expected {
                expected: "matrix",
                found: other.tag(),
            }),
        }
    }
}

fn mismatch(expected: TypeTag, found: &Value) -> ProtocolError {
    ProtocolError::TagMismatch {
        expected,
        found: found.tag(),
    }
}

/// Encode `value` under `tag`. The payload does not include the tag itself.
pub fn encode(value: &Value, tag: TypeTag) -> Result<Bytes, ProtocolError> {
    let mut dst = BytesMut::new();
    encode_body(value, tag, &mut dst)?;
    Ok(dst.freeze())
}

/// Decode a payload produced by [`encode`] under the same tag.
///
/// The whole input must be consumed.
pub fn decode(bytes: &[u8], tag: TypeTag) -> Result<Value, ProtocolError> {
    let mut src = bytes;
    let value = Value::get_body(tag, &mut src)?;
    if src.has_remaining() {
        return Err(ProtocolError::TrailingBytes(src.remaining()));
    }
    Ok(value)
}

fn encode_body(value: &Value, tag: TypeTag, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let found = value.tag();
    if found != tag {
        return Err(ProtocolError::TagMismatch {
            expected: tag,
            found,
        });
    }
    value.put_body(dst)
}

/// Tag followed by payload, as carried inside messages.
pub(crate) fn put_tagged(dst: &mut BytesMut, value: &Value) -> Result<(), ProtocolError> {
    let tag = value.tag();
    tag.write(dst);
    encode_body(value, tag, dst)
}

pub(crate) fn get_tagged(src: &mut impl Buf) -> Result<Value, ProtocolError> {
    let tag = TypeTag::read(src)?;
    Value::get_body(tag, src)
}

pub(crate) fn need(src: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if src.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: src.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn put_len(dst: &mut BytesMut, len: usize) -> Result<(), ProtocolError> {
    let len = u32::try_from(len).map_err(|_| ProtocolError::TooLong(len))?;
    dst.put_u32_le(len);
    Ok(())
}

pub(crate) fn get_len(src: &mut impl Buf) -> Result<usize, ProtocolError> {
    need(src, 4)?;
    Ok(src.get_u32_le() as usize)
}

pub(crate) fn put_bytes(dst: &mut BytesMut, bytes: &[u8]) -> Result<(), ProtocolError> {
    put_len(dst, bytes.len())?;
    dst.put_slice(bytes);
    Ok(())
}

pub(crate) fn get_bytes(src: &mut impl Buf) -> Result<Vec<u8>, ProtocolError> {
    let len = get_len(src)?;
    need(src, len)?;
    let mut bytes = vec![0; len];
    src.copy_to_slice(&mut bytes);
    Ok(bytes)
}

pub(crate) fn get_string(src: &mut impl Buf, what: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(get_bytes(src)?).map_err(|_| ProtocolError::InvalidUtf8(what))
}
