//! Vector query rewrite for IRIS HNSW compatibility.
//!
//! IRIS only uses an HNSW index when the target vector in an ORDER BY
//! clause is a literal, not a bind parameter. This pass runs after
//! translation and inlines `TO_VECTOR(?)` / `TO_VECTOR($n)` calls that
//! appear under `ORDER BY VECTOR_*`, removing the consumed parameters from
//! the positional list.

use std::time::Instant;

use regex::Regex;
use tracing::{debug, warn};

use crate::iriswire::sql::tokenizer::{tokenize, TokenKind};
use crate::iriswire::sql::translator::LatencyMonitor;

const MAX_VECTOR_DIMENSIONS: usize = 65536;

pub struct VectorOptimizer {
    pattern: Regex,
    order_by: Regex,
    pub monitor: LatencyMonitor,
}

pub struct OptimizedQuery {
    pub sql: String,
    pub params: Vec<Option<String>>,
    pub transformed: usize,
}

impl VectorOptimizer {
    pub fn new() -> Self {
        // VECTOR_FN(column, TO_VECTOR(<param>[, TYPE]))
        let pattern = Regex::new(
            r"(?i)(VECTOR_(?:COSINE|DOT_PRODUCT|L2))\s*\(\s*([A-Za-z_%][A-Za-z0-9_.]*)\s*,\s*(TO_VECTOR\s*\(\s*(\$[0-9]+|\?)\s*(?:,\s*([A-Za-z0-9]+))?\s*\))",
        )
        .expect("vector pattern must compile");
        let order_by = Regex::new(r"(?i)\bORDER\s+BY\b").expect("order by pattern must compile");
        VectorOptimizer {
            pattern,
            order_by,
            monitor: LatencyMonitor::new("vector_optimizer", 5.0),
        }
    }

    /// Rewrite parameterised vector expressions under ORDER BY into literal
    /// form. Unknown parameter encodings leave the SQL unchanged. Returns
    /// the rewritten SQL and the parameter list with consumed positions
    /// removed, the remaining ones keeping their relative order.
    pub fn optimize(&self, sql: &str, params: Vec<Option<String>>) -> OptimizedQuery {
        let started = Instant::now();
        let unchanged = |params| OptimizedQuery {
            sql: sql.to_string(),
            params,
            transformed: 0,
        };
        if params.is_empty() {
            return unchanged(params);
        }
        let Some(order_by_at) = self.order_by.find(sql).map(|m| m.start()) else {
            return unchanged(params);
        };

        struct Rewrite {
            start: usize,
            end: usize,
            replacement: String,
            param_ordinal: usize, // 1-based
        }
        let mut rewrites: Vec<Rewrite> = Vec::new();
        for caps in self.pattern.captures_iter(sql) {
            let whole = caps.get(0).unwrap();
            if whole.start() < order_by_at {
                // never touch vector parameters outside ORDER BY
                continue;
            }
            let to_vector = caps.get(3).unwrap();
            let placeholder = caps.get(4).unwrap().as_str();
            let data_type = caps.get(5).map(|m| m.as_str()).unwrap_or("FLOAT");

            let ordinal = if let Some(n) = placeholder.strip_prefix('$') {
                match n.parse::<usize>() {
                    Ok(n) if n >= 1 => n,
                    _ => continue,
                }
            } else {
                // `?` markers are positional: count the ones before this match
                count_question_marks(&sql[..to_vector.start()]) + 1
            };
            let Some(Some(value)) = params.get(ordinal - 1) else {
                warn!(ordinal, total = params.len(), "vector parameter index out of range");
                continue;
            };
            let Some(literal) = vector_literal(value) else {
                debug!(ordinal, "vector parameter in unknown encoding, left as a bind");
                continue;
            };
            rewrites.push(Rewrite {
                start: to_vector.start(),
                end: to_vector.end(),
                replacement: format!("TO_VECTOR('{}', {})", literal, data_type),
                param_ordinal: ordinal,
            });
        }
        if rewrites.is_empty() {
            return unchanged(params);
        }

        // apply in reverse to keep positions stable
        let mut out = sql.to_string();
        let mut consumed: Vec<usize> = Vec::new();
        for r in rewrites.iter().rev() {
            out.replace_range(r.start..r.end, &r.replacement);
            consumed.push(r.param_ordinal);
        }
        consumed.sort_unstable();
        consumed.dedup();

        // drop consumed parameters, preserving relative order of the rest
        let remaining: Vec<Option<String>> = params
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !consumed.contains(&(i + 1)))
            .map(|(_, v)| v)
            .collect();

        // renumber surviving $n placeholders to match the shortened list
        let out = renumber_params(&out, &consumed);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.monitor.record(elapsed_ms);
        debug!(
            transformed = consumed.len(),
            params_remaining = remaining.len(),
            elapsed_ms,
            "vector query optimized"
        );
        OptimizedQuery {
            sql: out,
            params: remaining,
            transformed: consumed.len(),
        }
    }
}

impl Default for VectorOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

fn count_question_marks(prefix: &str) -> usize {
    tokenize(prefix)
        .iter()
        .filter(|t| t.kind == TokenKind::Param && t.text(prefix) == "?")
        .count()
}

/// Shift `$n` placeholders down for every consumed ordinal below them.
fn renumber_params(sql: &str, consumed: &[usize]) -> String {
    let tokens = tokenize(sql);
    let mut out = String::with_capacity(sql.len());
    let mut last = 0usize;
    for tok in &tokens {
        if tok.kind != TokenKind::Param {
            continue;
        }
        let text = tok.text(sql);
        let Some(n) = text.strip_prefix('$').and_then(|s| s.parse::<usize>().ok()) else {
            continue;
        };
        let shift = consumed.iter().filter(|&&c| c < n).count();
        if shift == 0 {
            continue;
        }
        out.push_str(&sql[last..tok.start]);
        out.push_str(&format!("${}", n - shift));
        last = tok.end;
    }
    out.push_str(&sql[last..]);
    out
}

/// Convert a bound vector parameter to a JSON array literal.
/// Supports `[a,b,c]` pass-through, bare comma-delimited values, and
/// `base64:` little-endian float32 payloads. Returns None for anything else.
fn vector_literal(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    if value.starts_with('[') && value.ends_with(']') {
        return Some(value.to_string());
    }
    if let Some(b64) = value.strip_prefix("base64:") {
        if b64.is_empty() {
            return None;
        }
        let binary = base64::decode(b64).ok()?;
        if binary.is_empty() || binary.len() % 4 != 0 {
            return None;
        }
        let count = binary.len() / 4;
        if count > MAX_VECTOR_DIMENSIONS {
            warn!(dimensions = count, "suspiciously large vector parameter");
            return None;
        }
        let mut parts = Vec::with_capacity(count);
        for chunk in binary.chunks_exact(4) {
            let v = f32::from_le_bytes(chunk.try_into().unwrap());
            parts.push(v.to_string());
        }
        return Some(format!("[{}]", parts.join(",")));
    }
    if value.contains(',') {
        return Some(format!("[{}]", value));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn test_inlines_json_array_param() {
        let opt = VectorOptimizer::new();
        let sql = "SELECT id FROM t ORDER BY VECTOR_COSINE(emb, TO_VECTOR($1)) LIMIT 5";
        let out = opt.optimize(sql, vec![some("[1,2,3]")]);
        assert_eq!(
            out.sql,
            "SELECT id FROM t ORDER BY VECTOR_COSINE(emb, TO_VECTOR('[1,2,3]', FLOAT)) LIMIT 5"
        );
        assert!(out.params.is_empty());
        assert_eq!(out.transformed, 1);
    }

    #[test]
    fn test_comma_delimited_param_is_wrapped() {
        let opt = VectorOptimizer::new();
        let sql = "SELECT id FROM t ORDER BY VECTOR_L2(emb, TO_VECTOR(?, DOUBLE))";
        let out = opt.optimize(sql, vec![some("0.5,0.25,0.125")]);
        assert!(out.sql.contains("TO_VECTOR('[0.5,0.25,0.125]', DOUBLE)"));
    }

    #[test]
    fn test_base64_param_is_decoded() {
        let opt = VectorOptimizer::new();
        let mut bytes = Vec::new();
        for v in [1.0f32, 2.0, 3.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let param = format!("base64:{}", base64::encode(&bytes));
        let sql = "SELECT id FROM t ORDER BY VECTOR_COSINE(emb, TO_VECTOR($1))";
        let out = opt.optimize(sql, vec![Some(param)]);
        assert!(out.sql.contains("TO_VECTOR('[1,2,3]', FLOAT)"), "{}", out.sql);
        assert!(out.params.is_empty());
    }

    #[test]
    fn test_unknown_encoding_is_left_alone() {
        let opt = VectorOptimizer::new();
        let sql = "SELECT id FROM t ORDER BY VECTOR_COSINE(emb, TO_VECTOR($1))";
        let out = opt.optimize(sql, vec![some("not a vector")]);
        assert_eq!(out.sql, sql);
        assert_eq!(out.params.len(), 1);
        assert_eq!(out.transformed, 0);
    }

    #[test]
    fn test_never_rewrites_outside_order_by() {
        let opt = VectorOptimizer::new();
        let sql = "SELECT VECTOR_COSINE(emb, TO_VECTOR($1)) FROM t";
        let out = opt.optimize(sql, vec![some("[1,2]")]);
        assert_eq!(out.sql, sql);
        assert_eq!(out.params.len(), 1);
    }

    #[test]
    fn test_remaining_params_are_renumbered() {
        let opt = VectorOptimizer::new();
        let sql =
            "SELECT id FROM t WHERE grp = $1 ORDER BY VECTOR_COSINE(emb, TO_VECTOR($2)) LIMIT $3";
        let out = opt.optimize(sql, vec![some("7"), some("[1,2]"), some("5")]);
        assert!(out.sql.contains("TO_VECTOR('[1,2]', FLOAT)"));
        assert!(out.sql.contains("LIMIT $2"), "{}", out.sql);
        assert_eq!(out.params, vec![some("7"), some("5")]);
    }
}
