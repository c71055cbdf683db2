//! PostgreSQL type identifiers.
//!
//! Reference: https://github.com/postgres/postgres/blob/master/src/include/catalog/pg_type.dat

use std::fmt;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub i32);

impl Oid {
    /// Lets the server infer the parameter type (used for NULL parameters).
    pub const UNSPECIFIED: Oid = Oid(0);

    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // JSON / XML, carried as text
    pub const JSON: Oid = Oid(114);
    pub const XML: Oid = Oid(142);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    // String types
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const TIMETZ: Oid = Oid(1266);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

    // Array types
    pub const XML_ARRAY: Oid = Oid(143);
    pub const JSON_ARRAY: Oid = Oid(199);
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const NAME_ARRAY: Oid = Oid(1003);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const BPCHAR_ARRAY: Oid = Oid(1014);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIME_ARRAY: Oid = Oid(1183);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const NUMERIC_ARRAY: Oid = Oid(1231);
    pub const TIMETZ_ARRAY: Oid = Oid(1270);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// The array type whose elements are of this type.
    pub fn array_type(self) -> Option<Oid> {
        ARRAY_TYPES
            .iter()
            .find(|(element, _)| *element == self)
            .map(|(_, array)| *array)
    }

    /// The element type if this is an array type.
    pub fn element_type(self) -> Option<Oid> {
        ARRAY_TYPES
            .iter()
            .find(|(_, array)| *array == self)
            .map(|(element, _)| *element)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `pg_type.typarray` for every element type with a registered encoding.
const ARRAY_TYPES: &[(Oid, Oid)] = &[
    (Oid::BOOL, Oid::BOOL_ARRAY),
    (Oid::BYTEA, Oid::BYTEA_ARRAY),
    (Oid::NAME, Oid::NAME_ARRAY),
    (Oid::INT2, Oid::INT2_ARRAY),
    (Oid::INT4, Oid::INT4_ARRAY),
    (Oid::INT8, Oid::INT8_ARRAY),
    (Oid::TEXT, Oid::TEXT_ARRAY),
    (Oid::JSON, Oid::JSON_ARRAY),
    (Oid::XML, Oid::XML_ARRAY),
    (Oid::FLOAT4, Oid::FLOAT4_ARRAY),
    (Oid::FLOAT8, Oid::FLOAT8_ARRAY),
    (Oid::BPCHAR, Oid::BPCHAR_ARRAY),
    (Oid::VARCHAR, Oid::VARCHAR_ARRAY),
    (Oid::DATE, Oid::DATE_ARRAY),
    (Oid::TIME, Oid::TIME_ARRAY),
    (Oid::TIMESTAMP, Oid::TIMESTAMP_ARRAY),
    (Oid::TIMESTAMPTZ, Oid::TIMESTAMPTZ_ARRAY),
    (Oid::TIMETZ, Oid::TIMETZ_ARRAY),
    (Oid::NUMERIC, Oid::NUMERIC_ARRAY),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_type_mapping() {
        assert_eq!(Oid::INT4.array_type(), Some(Oid::INT4_ARRAY));
        assert_eq!(Oid::INT4_ARRAY.element_type(), Some(Oid::INT4));
        assert_eq!(Oid::TIMETZ.array_type(), Some(Oid(1270)));
        assert_eq!(Oid::XML_ARRAY.element_type(), Some(Oid::XML));
        assert_eq!(Oid::INT4_ARRAY.array_type(), None);
        assert_eq!(Oid(600).element_type(), None);
    }

    #[test]
    fn test_array_table_is_a_bijection() {
        for (element, array) in ARRAY_TYPES {
            assert_eq!(element.array_type(), Some(*array));
            assert_eq!(array.element_type(), Some(*element));
            assert_eq!(array.array_type(), None);
        }
    }
}
