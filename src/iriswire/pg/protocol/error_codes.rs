// Postgres error codes used by this server
// Class 00 — Successful Completion
pub const SUCCESSFUL_COMPLETION: &str = "00000"; // successful_completion
// Class 01 — Warning
pub const WARNING: &str = "01000"; // warning
// Class 08 — Connection Exception
pub const CONNECTION_EXCEPTION: &str = "08000"; // connection_exception
pub const CONNECTION_FAILURE: &str = "08006"; // connection_failure
pub const PROTOCOL_VIOLATION: &str = "08P01"; // protocol_violation
// Class 0A — Feature Not Supported
pub const FEATURE_NOT_SUPPORTED: &str = "0A000"; // feature_not_supported
// Class 22 — Data Exception
pub const INVALID_TEXT_REPRESENTATION: &str = "22P02"; // invalid_text_representation
pub const BAD_COPY_FILE_FORMAT: &str = "22P04"; // bad_copy_file_format
// Class 25 — Invalid Transaction State
pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02"; // in_failed_sql_transaction
// Class 26 — Invalid SQL Statement Name
pub const INVALID_SQL_STATEMENT_NAME: &str = "26000"; // invalid_sql_statement_name
// Class 28 — Invalid Authorization Specification
pub const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000"; // invalid_authorization_specification
pub const INVALID_PASSWORD: &str = "28P01"; // invalid_password
// Class 34 — Invalid Cursor Name
pub const INVALID_CURSOR_NAME: &str = "34000"; // invalid_cursor_name
// Class 42 — Syntax Error or Access Rule Violation
pub const SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION: &str = "42000"; // syntax_error_or_access_rule_violation
pub const SYNTAX_ERROR: &str = "42601"; // syntax_error
// Class 53 — Insufficient Resources
pub const OUT_OF_MEMORY: &str = "53200"; // out_of_memory
// Class 57 — Operator Intervention
pub const QUERY_CANCELED: &str = "57014"; // query_canceled
pub const ADMIN_SHUTDOWN: &str = "57P01"; // admin_shutdown
// Class XX — Internal Error
pub const INTERNAL_ERROR: &str = "XX000"; // internal_error
