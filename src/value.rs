//! Typed values.
//!
//! `Value` is a closed sum over every kind the encoding engine understands.
//! Accessors fail with `TypeMismatch` unless the held kind answers the
//! request; the only implicit conversion is widening a zone-naive temporal
//! value to the UTC offset.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc};
use rust_decimal::Decimal;
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Maximum number of array dimensions the server accepts.
pub const MAX_ARRAY_DIMENSIONS: usize = 6;

// ============================================================================
// Kinds
// ============================================================================

/// The kind of datum a `Value` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Null,
    Boolean,
    Short,
    Integer,
    Long,
    Float,
    Double,
    Decimal,
    String,
    Bytes,
    Date,
    Time,
    OffsetTime,
    Timestamp,
    OffsetTimestamp,
    Array,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::Null => "null",
            Kind::Boolean => "boolean",
            Kind::Short => "short",
            Kind::Integer => "integer",
            Kind::Long => "long",
            Kind::Float => "float",
            Kind::Double => "double",
            Kind::Decimal => "decimal",
            Kind::String => "string",
            Kind::Bytes => "bytes",
            Kind::Date => "date",
            Kind::Time => "time",
            Kind::OffsetTime => "offset time",
            Kind::Timestamp => "timestamp",
            Kind::OffsetTimestamp => "offset timestamp",
            Kind::Array => "array",
        }
    }

    /// Kinds that may be the element kind of an array.
    pub fn is_scalar(self) -> bool {
        !matches!(self, Kind::Null | Kind::Array)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Time with zone
// ============================================================================

/// A time of day with a fixed UTC offset (`timetz`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetTime {
    pub time: NaiveTime,
    pub offset: FixedOffset,
}

impl OffsetTime {
    pub fn new(time: NaiveTime, offset: FixedOffset) -> Self {
        Self { time, offset }
    }

    /// The same wall-clock time at `+00:00`.
    pub fn utc(time: NaiveTime) -> Self {
        Self {
            time,
            offset: Utc.fix(),
        }
    }
}

impl fmt::Display for OffsetTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.time, self.offset)
    }
}

// ============================================================================
// Arrays
// ============================================================================

/// Extent of one array dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimension {
    pub len: i32,
    pub lower_bound: i32,
}

impl Dimension {
    pub fn new(len: i32) -> Self {
        Self {
            len,
            lower_bound: 1,
        }
    }
}

/// Length of one dimension as the wire carries it.
fn dimension_len(len: usize) -> Result<i32> {
    i32::try_from(len)
        .map_err(|_| Error::InvalidArray(format!("{} elements exceed one dimension", len)))
}

/// A kind-homogeneous array. Elements are stored in row-major order; NULL
/// elements are `Value::Null`. A zero-element array has no dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    element: Kind,
    dimensions: SmallVec<[Dimension; 2]>,
    elements: Vec<Value>,
}

impl Array {
    /// Build a one-dimensional array with lower bound 1.
    pub fn new(element: Kind, elements: Vec<Value>) -> Result<Self> {
        let dimensions = if elements.is_empty() {
            Vec::new()
        } else {
            vec![Dimension::new(dimension_len(elements.len())?)]
        };
        Self::with_dimensions(element, dimensions, elements)
    }

    /// Build an array with explicit dimensions.
    pub fn with_dimensions(
        element: Kind,
        dimensions: Vec<Dimension>,
        elements: Vec<Value>,
    ) -> Result<Self> {
        if !element.is_scalar() {
            return Err(Error::InvalidArray(format!(
                "{} is not a valid element kind",
                element
            )));
        }
        if dimensions.len() > MAX_ARRAY_DIMENSIONS {
            return Err(Error::InvalidArray(format!(
                "{} dimensions exceed the maximum of {}",
                dimensions.len(),
                MAX_ARRAY_DIMENSIONS
            )));
        }

        let mut count: usize = if dimensions.is_empty() { 0 } else { 1 };
        for dim in &dimensions {
            let len = usize::try_from(dim.len)
                .map_err(|_| Error::InvalidArray(format!("negative dimension {}", dim.len)))?;
            count = count
                .checked_mul(len)
                .ok_or_else(|| Error::InvalidArray("dimensions overflow".to_string()))?;
        }
        if count != elements.len() {
            return Err(Error::InvalidArray(format!(
                "dimensions describe {} elements, got {}",
                count,
                elements.len()
            )));
        }

        for (index, value) in elements.iter().enumerate() {
            let found = value.kind();
            if found != Kind::Null && found != element {
                return Err(Error::ArrayElementMismatch {
                    index,
                    expected: element,
                    found,
                });
            }
        }

        let dimensions = if count == 0 {
            SmallVec::new()
        } else {
            SmallVec::from_vec(dimensions)
        };

        Ok(Self {
            element,
            dimensions,
            elements,
        })
    }

    /// Elements already known to be `element` or NULL.
    ///
    /// A length past `i32::MAX` saturates; the array codec rejects the
    /// resulting count mismatch with `InvalidArray`.
    fn from_trusted(element: Kind, elements: Vec<Value>) -> Self {
        let mut dimensions = SmallVec::new();
        if !elements.is_empty() {
            let len = dimension_len(elements.len()).unwrap_or(i32::MAX);
            dimensions.push(Dimension::new(len));
        }
        Self {
            element,
            dimensions,
            elements,
        }
    }

    pub fn element_kind(&self) -> Kind {
        self.element
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn elements(&self) -> &[Value] {
        &self.elements
    }

    pub fn into_elements(self) -> Vec<Value> {
        self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn has_nulls(&self) -> bool {
        self.elements.iter().any(Value::is_null)
    }
}

// ============================================================================
// Values
// ============================================================================

/// One decoded datum.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Short(i16),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    OffsetTime(OffsetTime),
    Timestamp(NaiveDateTime),
    OffsetTimestamp(DateTime<FixedOffset>),
    Array(Array),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Boolean(_) => Kind::Boolean,
            Value::Short(_) => Kind::Short,
            Value::Integer(_) => Kind::Integer,
            Value::Long(_) => Kind::Long,
            Value::Float(_) => Kind::Float,
            Value::Double(_) => Kind::Double,
            Value::Decimal(_) => Kind::Decimal,
            Value::String(_) => Kind::String,
            Value::Bytes(_) => Kind::Bytes,
            Value::Date(_) => Kind::Date,
            Value::Time(_) => Kind::Time,
            Value::OffsetTime(_) => Kind::OffsetTime,
            Value::Timestamp(_) => Kind::Timestamp,
            Value::OffsetTimestamp(_) => Kind::OffsetTimestamp,
            Value::Array(_) => Kind::Array,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// One-dimensional array of non-null natives.
    pub fn array<T: Native>(items: impl IntoIterator<Item = T>) -> Value {
        let elements = items.into_iter().map(Native::into_value).collect();
        Value::Array(Array::from_trusted(T::KIND, elements))
    }

    /// One-dimensional array where `None` becomes a NULL element.
    pub fn nullable_array<T: Native>(items: impl IntoIterator<Item = Option<T>>) -> Value {
        let elements = items
            .into_iter()
            .map(|item| item.map_or(Value::Null, Native::into_value))
            .collect();
        Value::Array(Array::from_trusted(T::KIND, elements))
    }

    fn mismatch(&self, requested: Kind) -> Error {
        Error::TypeMismatch {
            requested,
            actual: self.kind(),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Boolean(v) => Ok(*v),
            _ => Err(self.mismatch(Kind::Boolean)),
        }
    }

    pub fn as_i16(&self) -> Result<i16> {
        match self {
            Value::Short(v) => Ok(*v),
            _ => Err(self.mismatch(Kind::Short)),
        }
    }

    pub fn as_i32(&self) -> Result<i32> {
        match self {
            Value::Integer(v) => Ok(*v),
            _ => Err(self.mismatch(Kind::Integer)),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Long(v) => Ok(*v),
            _ => Err(self.mismatch(Kind::Long)),
        }
    }

    pub fn as_f32(&self) -> Result<f32> {
        match self {
            Value::Float(v) => Ok(*v),
            _ => Err(self.mismatch(Kind::Float)),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Double(v) => Ok(*v),
            _ => Err(self.mismatch(Kind::Double)),
        }
    }

    pub fn as_decimal(&self) -> Result<Decimal> {
        match self {
            Value::Decimal(v) => Ok(*v),
            _ => Err(self.mismatch(Kind::Decimal)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(v) => Ok(v),
            _ => Err(self.mismatch(Kind::String)),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(v) => Ok(v),
            _ => Err(self.mismatch(Kind::Bytes)),
        }
    }

    pub fn as_date(&self) -> Result<NaiveDate> {
        match self {
            Value::Date(v) => Ok(*v),
            _ => Err(self.mismatch(Kind::Date)),
        }
    }

    pub fn as_time(&self) -> Result<NaiveTime> {
        match self {
            Value::Time(v) => Ok(*v),
            _ => Err(self.mismatch(Kind::Time)),
        }
    }

    /// A plain `Time` answers with the UTC offset attached.
    pub fn as_offset_time(&self) -> Result<OffsetTime> {
        match self {
            Value::OffsetTime(v) => Ok(*v),
            Value::Time(v) => Ok(OffsetTime::utc(*v)),
            _ => Err(self.mismatch(Kind::OffsetTime)),
        }
    }

    pub fn as_timestamp(&self) -> Result<NaiveDateTime> {
        match self {
            Value::Timestamp(v) => Ok(*v),
            _ => Err(self.mismatch(Kind::Timestamp)),
        }
    }

    /// A plain `Timestamp` answers with the same reading at `+00:00`.
    pub fn as_offset_timestamp(&self) -> Result<DateTime<FixedOffset>> {
        match self {
            Value::OffsetTimestamp(v) => Ok(*v),
            Value::Timestamp(v) => Ok(v.and_utc().fixed_offset()),
            _ => Err(self.mismatch(Kind::OffsetTimestamp)),
        }
    }

    pub fn as_array(&self) -> Result<&Array> {
        match self {
            Value::Array(v) => Ok(v),
            _ => Err(self.mismatch(Kind::Array)),
        }
    }

    /// Extract every element as `T`, NULL elements as `None`.
    ///
    /// Fails with `TypeMismatch` when the declared element kind cannot be
    /// viewed as `T`, and with `ArrayElementMismatch` when an element's kind
    /// disagrees with the declared one.
    pub fn array_of<T: FromValue>(&self) -> Result<Vec<Option<T>>> {
        let array = self.as_array()?;
        let declared = array.element_kind();
        if !T::accepts(declared) {
            return Err(Error::TypeMismatch {
                requested: T::KIND,
                actual: declared,
            });
        }

        let mut out = Vec::with_capacity(array.len());
        for (index, element) in array.elements().iter().enumerate() {
            match element {
                Value::Null => out.push(None),
                other if other.kind() != declared => {
                    return Err(Error::ArrayElementMismatch {
                        index,
                        expected: declared,
                        found: other.kind(),
                    })
                }
                other => out.push(Some(T::from_value(other)?)),
            }
        }
        Ok(out)
    }

    pub fn as_bool_array(&self) -> Result<Vec<Option<bool>>> {
        self.array_of()
    }

    pub fn as_i16_array(&self) -> Result<Vec<Option<i16>>> {
        self.array_of()
    }

    pub fn as_i32_array(&self) -> Result<Vec<Option<i32>>> {
        self.array_of()
    }

    pub fn as_i64_array(&self) -> Result<Vec<Option<i64>>> {
        self.array_of()
    }

    pub fn as_f32_array(&self) -> Result<Vec<Option<f32>>> {
        self.array_of()
    }

    pub fn as_f64_array(&self) -> Result<Vec<Option<f64>>> {
        self.array_of()
    }

    pub fn as_decimal_array(&self) -> Result<Vec<Option<Decimal>>> {
        self.array_of()
    }

    pub fn as_string_array(&self) -> Result<Vec<Option<String>>> {
        self.array_of()
    }

    pub fn as_bytes_array(&self) -> Result<Vec<Option<Vec<u8>>>> {
        self.array_of()
    }

    pub fn as_date_array(&self) -> Result<Vec<Option<NaiveDate>>> {
        self.array_of()
    }

    pub fn as_time_array(&self) -> Result<Vec<Option<NaiveTime>>> {
        self.array_of()
    }

    pub fn as_offset_time_array(&self) -> Result<Vec<Option<OffsetTime>>> {
        self.array_of()
    }

    pub fn as_timestamp_array(&self) -> Result<Vec<Option<NaiveDateTime>>> {
        self.array_of()
    }

    pub fn as_offset_timestamp_array(&self) -> Result<Vec<Option<DateTime<FixedOffset>>>> {
        self.array_of()
    }
}

// ============================================================================
// Native data
// ============================================================================

/// A Rust type that is the datum of exactly one scalar `Kind`.
pub trait Native: Sized {
    const KIND: Kind;

    fn into_value(self) -> Value;

    /// Borrow the datum if `value` holds this kind.
    fn borrow_from(value: &Value) -> Option<&Self>;
}

macro_rules! native {
    ($($ty:ty => $variant:ident),* $(,)?) => {$(
        impl Native for $ty {
            const KIND: Kind = Kind::$variant;

            #[inline]
            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            #[inline]
            fn borrow_from(value: &Value) -> Option<&Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    )*};
}

native! {
    bool => Boolean,
    i16 => Short,
    i32 => Integer,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    Decimal => Decimal,
    String => String,
    Vec<u8> => Bytes,
    NaiveDate => Date,
    NaiveTime => Time,
    OffsetTime => OffsetTime,
    NaiveDateTime => Timestamp,
    DateTime<FixedOffset> => OffsetTimestamp,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::OffsetTimestamp(v.fixed_offset())
    }
}

impl From<Array> for Value {
    fn from(v: Array) -> Self {
        Value::Array(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Types that can be read out of a `Value` through its accessors.
pub trait FromValue: Sized {
    /// Kind reported in a `TypeMismatch`.
    const KIND: Kind;

    /// Whether a value of `kind` can be viewed as `Self`.
    fn accepts(kind: Kind) -> bool {
        kind == Self::KIND
    }

    fn from_value(value: &Value) -> Result<Self>;
}

macro_rules! from_value {
    ($($ty:ty => $kind:ident, $accessor:ident),* $(,)?) => {$(
        impl FromValue for $ty {
            const KIND: Kind = Kind::$kind;

            fn from_value(value: &Value) -> Result<Self> {
                value.$accessor()
            }
        }
    )*};
}

from_value! {
    bool => Boolean, as_bool,
    i16 => Short, as_i16,
    i32 => Integer, as_i32,
    i64 => Long, as_i64,
    f32 => Float, as_f32,
    f64 => Double, as_f64,
    Decimal => Decimal, as_decimal,
    NaiveDate => Date, as_date,
    NaiveTime => Time, as_time,
    NaiveDateTime => Timestamp, as_timestamp,
}

impl FromValue for String {
    const KIND: Kind = Kind::String;

    fn from_value(value: &Value) -> Result<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl FromValue for Vec<u8> {
    const KIND: Kind = Kind::Bytes;

    fn from_value(value: &Value) -> Result<Self> {
        value.as_bytes().map(<[u8]>::to_vec)
    }
}

impl FromValue for OffsetTime {
    const KIND: Kind = Kind::OffsetTime;

    fn accepts(kind: Kind) -> bool {
        matches!(kind, Kind::OffsetTime | Kind::Time)
    }

    fn from_value(value: &Value) -> Result<Self> {
        value.as_offset_time()
    }
}

impl FromValue for DateTime<FixedOffset> {
    const KIND: Kind = Kind::OffsetTimestamp;

    fn accepts(kind: Kind) -> bool {
        matches!(kind, Kind::OffsetTimestamp | Kind::Timestamp)
    }

    fn from_value(value: &Value) -> Result<Self> {
        value.as_offset_timestamp()
    }
}

impl FromValue for Array {
    const KIND: Kind = Kind::Array;

    fn from_value(value: &Value) -> Result<Self> {
        value.as_array().cloned()
    }
}

impl FromValue for Value {
    const KIND: Kind = Kind::Null;

    fn accepts(_: Kind) -> bool {
        true
    }

    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const KIND: Kind = T::KIND;

    fn accepts(kind: Kind) -> bool {
        kind == Kind::Null || T::accepts(kind)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<Option<T>> {
    const KIND: Kind = Kind::Array;

    fn from_value(value: &Value) -> Result<Self> {
        value.array_of()
    }
}
