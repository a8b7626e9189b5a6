use crate::iriswire::sql::tokenizer::{tokenize, TokenKind};
use crate::iriswire::{Error, Result};

/// A statement created by Parse. Named statements live until explicit
/// Close or connection end; the unnamed statement ("") is replaced by any
/// new Parse with an empty name.
pub struct PreparedStatement {
    pub original_sql: String,
    pub translated_sql: String,
    pub param_oids: Vec<i32>,
    pub warnings: Vec<String>,
}

/// A bound, executable instance of a prepared statement, created by Bind.
pub struct Portal {
    pub statement: String,
    pub params: Vec<Option<String>>,
    pub result_formats: Vec<i16>,
    /// Describe was issued on this portal; Execute emits RowDescription
    /// (or NoData) before the first DataRow.
    pub describe_requested: bool,
}

/// Inline bound parameter values into `$n` / `?` placeholders. Strings are
/// single-quoted with doubled inner quotes, numbers are bare, NULL is the
/// literal NULL. Runs after translation, so placeholders inside string
/// literals are never touched.
pub fn substitute_params(sql: &str, params: &[Option<String>]) -> Result<String> {
    let tokens = tokenize(sql);
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut last = 0usize;
    let mut next_positional = 0usize;
    for tok in &tokens {
        if tok.kind != TokenKind::Param {
            continue;
        }
        let text = tok.text(sql);
        let index = if let Some(n) = text.strip_prefix('$') {
            let n: usize = n
                .parse()
                .map_err(|_| Error::protocol_error(format!("bad parameter reference {}", text)))?;
            if n == 0 {
                return Err(Error::protocol_error("parameter references are 1-based"));
            }
            n - 1
        } else {
            let n = next_positional;
            next_positional += 1;
            n
        };
        let value = params.get(index).ok_or_else(|| {
            Error::protocol_error(format!(
                "there is no parameter {} (have {})",
                index + 1,
                params.len()
            ))
        })?;
        out.push_str(&sql[last..tok.start]);
        out.push_str(&render_value(value.as_deref()));
        last = tok.end;
    }
    out.push_str(&sql[last..]);
    Ok(out)
}

fn render_value(value: Option<&str>) -> String {
    match value {
        None => "NULL".to_string(),
        Some(v) if is_numeric(v) => v.to_string(),
        Some(v) => format!("'{}'", v.replace('\'', "''")),
    }
}

fn is_numeric(v: &str) -> bool {
    !v.is_empty() && v.parse::<f64>().is_ok() && !v.contains(|c: char| c.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn test_numbered_substitution() {
        let out = substitute_params(
            "SELECT * FROM t WHERE id = $1 AND name = $2",
            &[some("42"), some("o'brien")],
        )
        .unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE id = 42 AND name = 'o''brien'");
    }

    #[test]
    fn test_null_and_repeated_refs() {
        let out = substitute_params("SELECT $1, $1, $2", &[some("1"), None]).unwrap();
        assert_eq!(out, "SELECT 1, 1, NULL");
    }

    #[test]
    fn test_placeholder_inside_literal_is_preserved() {
        let out = substitute_params("SELECT '$1', $1", &[some("7")]).unwrap();
        assert_eq!(out, "SELECT '$1', 7");
    }

    #[test]
    fn test_missing_param_is_an_error() {
        assert!(substitute_params("SELECT $2", &[some("1")]).is_err());
    }
}
