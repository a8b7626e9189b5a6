//! IRIS column type to PostgreSQL type OID mapping.
//!
//! All values are sent to clients in text format, so only the OID and the
//! declared type size matter for RowDescription.

pub const OID_BOOL: i32 = 16;
pub const OID_BYTEA: i32 = 17;
pub const OID_INT8: i32 = 20;
pub const OID_INT2: i32 = 21;
pub const OID_INT4: i32 = 23;
pub const OID_TEXT: i32 = 25;
pub const OID_FLOAT4: i32 = 700;
pub const OID_FLOAT8: i32 = 701;
pub const OID_BPCHAR: i32 = 1042;
pub const OID_VARCHAR: i32 = 1043;
pub const OID_DATE: i32 = 1082;
pub const OID_TIME: i32 = 1083;
pub const OID_TIMESTAMP: i32 = 1114;
pub const OID_NUMERIC: i32 = 1700;
/// OID advertised for IRIS VECTOR columns. There is no catalog entry for
/// it; clients read the values as text.
pub const OID_VECTOR: i32 = 16388;

/// Map an IRIS type name to the PostgreSQL OID announced in RowDescription.
/// Unknown types degrade to text.
pub fn pg_oid_for_iris_type(iris_type: &str) -> i32 {
    match iris_type.to_ascii_uppercase().as_str() {
        "INTEGER" | "INT" => OID_INT4,
        "BIGINT" => OID_INT8,
        "SMALLINT" | "TINYINT" => OID_INT2,
        "DOUBLE" => OID_FLOAT8,
        "FLOAT" => OID_FLOAT4,
        "NUMERIC" | "DECIMAL" | "MONEY" => OID_NUMERIC,
        "VARCHAR" => OID_VARCHAR,
        "CHAR" => OID_BPCHAR,
        "LONGVARCHAR" | "TEXT" => OID_TEXT,
        "DATE" => OID_DATE,
        "TIME" => OID_TIME,
        "TIMESTAMP" | "POSIXTIME" => OID_TIMESTAMP,
        "BIT" | "BOOLEAN" => OID_BOOL,
        "VARBINARY" | "BINARY" | "LONGVARBINARY" => OID_BYTEA,
        "VECTOR" => OID_VECTOR,
        _ => OID_TEXT,
    }
}

/// The fixed on-wire size for an OID, or -1 for variable-width types.
pub fn type_size(oid: i32) -> i16 {
    match oid {
        OID_BOOL => 1,
        OID_INT2 => 2,
        OID_INT4 | OID_FLOAT4 | OID_DATE => 4,
        OID_INT8 | OID_FLOAT8 | OID_TIME | OID_TIMESTAMP => 8,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_types() {
        assert_eq!(pg_oid_for_iris_type("INTEGER"), 23);
        assert_eq!(pg_oid_for_iris_type("bigint"), 20);
        assert_eq!(pg_oid_for_iris_type("VarChar"), 1043);
        assert_eq!(pg_oid_for_iris_type("VECTOR"), 16388);
    }

    #[test]
    fn test_unknown_type_degrades_to_text() {
        assert_eq!(pg_oid_for_iris_type("%Library.DynamicObject"), 25);
        assert_eq!(type_size(25), -1);
    }
}
