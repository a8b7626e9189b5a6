use crate::iriswire::config::TranslationPolicy;
use crate::iriswire::sql::Translator;

fn translator() -> Translator {
    Translator::new(TranslationPolicy::Hybrid, 64)
}

fn translate(sql: &str) -> String {
    translator().translate(sql).unwrap().translated_sql.clone()
}

#[test]
fn test_transaction_verbs() {
    assert_eq!(translate("BEGIN"), "START TRANSACTION");
    assert_eq!(translate("BEGIN TRANSACTION"), "START TRANSACTION");
    assert_eq!(translate("begin work"), "START TRANSACTION");
    assert_eq!(translate("START TRANSACTION"), "START TRANSACTION");
    assert_eq!(translate("COMMIT"), "COMMIT");
    assert_eq!(translate("END"), "COMMIT");
    assert_eq!(translate("ROLLBACK"), "ROLLBACK");
    assert_eq!(translate("SAVEPOINT sp1"), "SAVEPOINT sp1");
    assert_eq!(translate("RELEASE SAVEPOINT sp1"), "RELEASE SAVEPOINT sp1");
    assert_eq!(
        translate("ROLLBACK TO SAVEPOINT sp1"),
        "ROLLBACK TO SAVEPOINT sp1"
    );
}

#[test]
fn test_quoted_identifiers_preserved() {
    // lowercase quoted identifiers are safe to unquote
    assert_eq!(
        translate("SELECT \"name\" FROM \"users\""),
        "SELECT name FROM users"
    );
    // mixed case and specials stay quoted verbatim
    assert_eq!(
        translate("SELECT \"MixedCase\", \"with space\" FROM t"),
        "SELECT \"MixedCase\", \"with space\" FROM t"
    );
}

#[test]
fn test_date_literals() {
    assert_eq!(
        translate("SELECT * FROM t WHERE d = DATE '2024-01-15'"),
        "SELECT * FROM t WHERE d = TO_DATE('2024-01-15', 'YYYY-MM-DD')"
    );
    assert_eq!(
        translate("SELECT TIMESTAMP '2024-01-15 10:30:00'"),
        "SELECT TO_TIMESTAMP('2024-01-15 10:30:00', 'YYYY-MM-DD HH24:MI:SS')"
    );
    // functions pass through
    assert_eq!(translate("SELECT CURRENT_TIMESTAMP"), "SELECT CURRENT_TIMESTAMP");
    assert_eq!(
        translate("SELECT EXTRACT(EPOCH FROM NOW())"),
        "SELECT EXTRACT(EPOCH FROM NOW())"
    );
    // a malformed literal is left for IRIS to reject
    assert_eq!(translate("SELECT DATE 'nonsense'"), "SELECT DATE 'nonsense'");
}

#[test]
fn test_top_rewritten_to_limit() {
    assert_eq!(
        translate("SELECT TOP 5 id FROM t ORDER BY id"),
        "SELECT  id FROM t ORDER BY id LIMIT 5"
    );
    // LIMIT is already IRIS-compatible
    assert_eq!(
        translate("SELECT id FROM t LIMIT 10"),
        "SELECT id FROM t LIMIT 10"
    );
}

#[test]
fn test_top_limit_respects_for_update() {
    let out = translate("SELECT TOP 3 id FROM t ORDER BY id FOR UPDATE");
    assert!(
        out.contains("LIMIT 3 FOR UPDATE"),
        "LIMIT must precede FOR UPDATE: {}",
        out
    );
}

#[test]
fn test_vector_operators() {
    assert_eq!(
        translate("SELECT id FROM t ORDER BY emb <-> '[1,2,3]' LIMIT 5"),
        "SELECT id FROM t ORDER BY VECTOR_COSINE(emb, TO_VECTOR('[1,2,3]')) LIMIT 5"
    );
    assert_eq!(
        translate("SELECT id FROM t ORDER BY emb <=> $1"),
        "SELECT id FROM t ORDER BY VECTOR_COSINE(emb, TO_VECTOR($1))"
    );
    assert_eq!(
        translate("SELECT id FROM t ORDER BY emb <#> '[1,2]'"),
        "SELECT id FROM t ORDER BY (- VECTOR_DOT_PRODUCT(emb, TO_VECTOR('[1,2]')))"
    );
}

#[test]
fn test_vector_operand_forms() {
    // qualified column on the left
    assert_eq!(
        translate("SELECT 1 FROM t ORDER BY t.emb <-> '[1]'"),
        "SELECT 1 FROM t ORDER BY VECTOR_COSINE(t.emb, TO_VECTOR('[1]'))"
    );
    // an existing TO_VECTOR call is not re-wrapped
    assert_eq!(
        translate("SELECT 1 FROM t ORDER BY emb <-> TO_VECTOR('[1,2]', FLOAT)"),
        "SELECT 1 FROM t ORDER BY VECTOR_COSINE(emb, TO_VECTOR('[1,2]', FLOAT))"
    );
}

#[test]
fn test_iris_function_aliases() {
    assert_eq!(translate("SELECT %SQLUPPER(name) FROM t"), "SELECT UPPER(name) FROM t");
    assert_eq!(translate("SELECT %SQLLOWER(name) FROM t"), "SELECT LOWER(name) FROM t");
    assert_eq!(
        translate("SELECT %SQLSTRING(x) FROM t"),
        "SELECT CAST(x AS VARCHAR) FROM t"
    );
    assert_eq!(translate("SELECT %HOROLOG()"), "SELECT EXTRACT(EPOCH FROM NOW())");
    assert_eq!(translate("SELECT %SYSTEM.Version.GetNumber()"), "SELECT version()");
    assert_eq!(translate("SELECT %SYSTEM.Security.GetUser()"), "SELECT current_user");
    assert_eq!(
        translate("SELECT DATEDIFF_MICROSECONDS(a, b) FROM t"),
        "SELECT EXTRACT(MICROSECONDS FROM (b - a)) FROM t"
    );
}

#[test]
fn test_unknown_system_construct_is_rejected_under_hybrid() {
    let err = translator()
        .translate("SELECT %SYSTEM.Process.Terminate(1)")
        .unwrap_err();
    assert_eq!(err.sqlstate(), "0A000");
}

#[test]
fn test_unknown_percent_function_warns_under_hybrid() {
    let result = translator().translate("SELECT %ODBCOUT(x) FROM t").unwrap();
    assert_eq!(result.translated_sql, "SELECT %ODBCOUT(x) FROM t");
    assert_eq!(result.warnings.len(), 1);
}

#[test]
fn test_unknown_constructs_pass_under_ignore_policy() {
    let translator = Translator::new(TranslationPolicy::Ignore, 16);
    let result = translator
        .translate("SELECT %SYSTEM.Process.Terminate(1)")
        .unwrap();
    assert!(result.warnings.is_empty());
    assert_eq!(result.translated_sql, "SELECT %SYSTEM.Process.Terminate(1)");
}

#[test]
fn test_json_functions() {
    assert_eq!(
        translate("SELECT JSON_OBJECT('a', 1)"),
        "SELECT jsonb_build_object('a', 1)"
    );
    assert_eq!(translate("SELECT JSON_ARRAY(1, 2)"), "SELECT jsonb_build_array(1, 2)");
    assert_eq!(
        translate("SELECT JSON_EXTRACT(doc, '{a,b}') FROM t"),
        "SELECT (doc #>> '{a,b}') FROM t"
    );
    assert_eq!(
        translate("SELECT JSON_ARRAY_LENGTH(doc) FROM t"),
        "SELECT jsonb_array_length(doc) FROM t"
    );
    assert_eq!(
        translate("SELECT JSON_EXISTS(doc, '$.a') FROM t"),
        "SELECT jsonb_path_exists(doc, '$.a') FROM t"
    );
}

#[test]
fn test_ddl_type_mapping() {
    assert_eq!(
        translate("CREATE TABLE t (a LONGVARCHAR, b VARBINARY(16), c ROWVERSION)"),
        "CREATE TABLE t (a TEXT, b BYTEA(16), c BYTEA)"
    );
    assert_eq!(
        translate("CREATE TABLE t (tags %List, emb VECTOR(128), id SERIAL)"),
        "CREATE TABLE t (tags TEXT[], emb VECTOR(128), id SERIAL)"
    );
    // outside DDL the words are untouched
    assert_eq!(
        translate("SELECT binary FROM t"),
        "SELECT binary FROM t"
    );
}

#[test]
fn test_never_rewrites_inside_literals_and_comments() {
    assert_eq!(
        translate("SELECT '%SQLUPPER(x)' FROM t -- %SQLLOWER(y)"),
        "SELECT '%SQLUPPER(x)' FROM t -- %SQLLOWER(y)"
    );
    assert_eq!(
        translate("SELECT 'a <-> b' FROM t"),
        "SELECT 'a <-> b' FROM t"
    );
}

#[test]
fn test_trailing_semicolon_stripped() {
    assert_eq!(translate("SELECT 1;"), "SELECT 1");
    assert_eq!(translate("SELECT 1"), "SELECT 1");
}

#[test]
fn test_translation_is_idempotent_for_iris_sql() {
    let cases = [
        "SELECT id FROM t ORDER BY VECTOR_COSINE(emb, TO_VECTOR('[1,2,3]')) LIMIT 5",
        "START TRANSACTION",
        "SELECT UPPER(name) FROM t",
        "SELECT TO_DATE('2024-01-15', 'YYYY-MM-DD')",
        "SELECT id FROM t LIMIT 10",
    ];
    let translator = translator();
    for sql in cases {
        let once = translator.translate(sql).unwrap().translated_sql.clone();
        let twice = translator.translate(&once).unwrap().translated_sql.clone();
        assert_eq!(once, twice, "not a fixed point: {}", sql);
    }
}

#[test]
fn test_cache_hit_and_eviction() {
    let translator = Translator::new(TranslationPolicy::Hybrid, 2);
    let first = translator.translate("SELECT 1").unwrap();
    assert!(!first.metrics.cache_hit);
    let again = translator.translate("SELECT 1").unwrap();
    assert!(again.metrics.cache_hit);
    assert_eq!(again.translated_sql, first.translated_sql);

    // capacity 2: inserting two more evicts the least recently used
    translator.translate("SELECT 2").unwrap();
    translator.translate("SELECT 3").unwrap();
    assert_eq!(translator.cache_len(), 2);
}

#[test]
fn test_mappings_record_spans() {
    let result = translator().translate("BEGIN").unwrap();
    assert_eq!(result.mappings.len(), 1);
    let mapping = &result.mappings[0];
    assert_eq!(mapping.kind, "transaction_verb");
    assert_eq!(mapping.original_span, (0, 5));
    assert_eq!(mapping.replacement_span, (0, 17));
    assert!(mapping.confidence > 0.9);
}

#[test]
fn test_latency_monitor_counts_violations() {
    let translator = translator();
    for _ in 0..30 {
        translator.translate("SELECT 1").unwrap();
    }
    // translation of a trivial cached statement never breaches 5ms
    assert!(!translator.monitor.is_regressed());
}
