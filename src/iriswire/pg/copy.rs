//! COPY subprotocol support: statement parsing and the CSV codec used for
//! both COPY FROM STDIN and COPY TO STDOUT.

use crate::iriswire::pg::protocol::error_codes;
use crate::iriswire::sql::tokenizer::{tokenize, Token, TokenKind};
use crate::iriswire::{Error, Result};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CopyOptions {
    pub header: bool,
    pub delimiter: u8,
    pub quote: u8,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions {
            header: false,
            delimiter: b',',
            quote: b'"',
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CopyCommand {
    /// COPY table [(cols)] FROM STDIN [WITH (...)]
    In {
        table: String,
        columns: Vec<String>,
        options: CopyOptions,
    },
    /// COPY table [(cols)] TO STDOUT or COPY (query) TO STDOUT
    Out {
        table: String,
        columns: Vec<String>,
        query: Option<String>,
        options: CopyOptions,
    },
}

fn copy_syntax_error(sql: &str) -> Error {
    Error::sql(
        error_codes::SYNTAX_ERROR,
        format!("unsupported COPY syntax: {}", sql.trim()),
    )
}

/// Parse a COPY statement. Returns None when the statement is not COPY.
pub fn parse_copy(sql: &str) -> Result<Option<CopyCommand>> {
    let tokens: Vec<Token> = tokenize(sql)
        .into_iter()
        .filter(|t| {
            !matches!(
                t.kind,
                TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
            )
        })
        .collect();
    let word = |pos: usize| -> Option<String> {
        tokens.get(pos).and_then(|t| {
            if t.kind == TokenKind::Word {
                Some(t.text(sql).to_ascii_uppercase())
            } else {
                None
            }
        })
    };
    if word(0).as_deref() != Some("COPY") {
        return Ok(None);
    }

    let mut pos = 1usize;
    let mut table = String::new();
    let mut columns = Vec::new();
    let mut query = None;

    if tokens.get(pos).map(|t| t.kind) == Some(TokenKind::LParen) {
        // COPY (SELECT ...) TO STDOUT
        let mut depth = 1i32;
        let start = tokens[pos].end;
        pos += 1;
        let mut end = start;
        while depth > 0 {
            let Some(tok) = tokens.get(pos) else {
                return Err(copy_syntax_error(sql));
            };
            match tok.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        end = tok.start;
                    }
                }
                _ => (),
            }
            pos += 1;
        }
        query = Some(sql[start..end].trim().to_string());
    } else {
        // table name, optionally schema-qualified
        let Some(tok) = tokens.get(pos) else {
            return Err(copy_syntax_error(sql));
        };
        match tok.kind {
            TokenKind::Word | TokenKind::QuotedIdent => {
                let mut end = tok.end;
                let start = tok.start;
                pos += 1;
                while tokens.get(pos).map(|t| t.kind) == Some(TokenKind::Dot) {
                    pos += 2;
                    end = tokens
                        .get(pos - 1)
                        .map(|t| t.end)
                        .ok_or_else(|| copy_syntax_error(sql))?;
                }
                table = sql[start..end].to_string();
            }
            _ => return Err(copy_syntax_error(sql)),
        }
        // optional column list
        if tokens.get(pos).map(|t| t.kind) == Some(TokenKind::LParen) {
            pos += 1;
            loop {
                let Some(tok) = tokens.get(pos) else {
                    return Err(copy_syntax_error(sql));
                };
                match tok.kind {
                    TokenKind::RParen => {
                        pos += 1;
                        break;
                    }
                    TokenKind::Comma => pos += 1,
                    TokenKind::Word => {
                        columns.push(tok.text(sql).to_string());
                        pos += 1;
                    }
                    TokenKind::QuotedIdent => {
                        let text = tok.text(sql);
                        columns.push(text[1..text.len() - 1].replace("\"\"", "\""));
                        pos += 1;
                    }
                    _ => return Err(copy_syntax_error(sql)),
                }
            }
        }
    }

    let direction = word(pos).ok_or_else(|| copy_syntax_error(sql))?;
    pos += 1;
    let target = word(pos).ok_or_else(|| copy_syntax_error(sql))?;
    pos += 1;

    let options = parse_options(sql, &tokens, pos)?;

    match (direction.as_str(), target.as_str()) {
        ("FROM", "STDIN") => {
            if query.is_some() {
                return Err(copy_syntax_error(sql));
            }
            Ok(Some(CopyCommand::In {
                table,
                columns,
                options,
            }))
        }
        ("TO", "STDOUT") => Ok(Some(CopyCommand::Out {
            table,
            columns,
            query,
            options,
        })),
        _ => Err(Error::sql(
            error_codes::FEATURE_NOT_SUPPORTED,
            "COPY only supports FROM STDIN and TO STDOUT",
        )),
    }
}

/// `WITH (FORMAT csv, HEADER true, DELIMITER ';')` and the legacy bare
/// `WITH CSV HEADER` form.
fn parse_options(sql: &str, tokens: &[Token], mut pos: usize) -> Result<CopyOptions> {
    let mut options = CopyOptions::default();
    let word = |pos: usize| -> Option<String> {
        tokens.get(pos).and_then(|t| {
            if t.kind == TokenKind::Word {
                Some(t.text(sql).to_ascii_uppercase())
            } else {
                None
            }
        })
    };
    if word(pos).as_deref() == Some("WITH") {
        pos += 1;
    }
    if tokens.get(pos).map(|t| t.kind) == Some(TokenKind::LParen) {
        pos += 1;
        while let Some(tok) = tokens.get(pos) {
            if tok.kind == TokenKind::RParen {
                break;
            }
            if tok.kind == TokenKind::Comma {
                pos += 1;
                continue;
            }
            let key = word(pos).ok_or_else(|| copy_syntax_error(sql))?;
            pos += 1;
            match key.as_str() {
                "FORMAT" => {
                    let format = word(pos).ok_or_else(|| copy_syntax_error(sql))?;
                    if format != "CSV" && format != "TEXT" {
                        return Err(Error::sql(
                            error_codes::FEATURE_NOT_SUPPORTED,
                            format!("COPY format {} is not supported", format),
                        ));
                    }
                    pos += 1;
                }
                "HEADER" => {
                    // optional boolean argument
                    match word(pos).as_deref() {
                        Some("TRUE") | Some("ON") => {
                            options.header = true;
                            pos += 1;
                        }
                        Some("FALSE") | Some("OFF") => {
                            options.header = false;
                            pos += 1;
                        }
                        _ => options.header = true,
                    }
                }
                "DELIMITER" => {
                    options.delimiter = char_option(sql, tokens.get(pos))?;
                    pos += 1;
                }
                "QUOTE" => {
                    options.quote = char_option(sql, tokens.get(pos))?;
                    pos += 1;
                }
                _ => {
                    return Err(Error::sql(
                        error_codes::FEATURE_NOT_SUPPORTED,
                        format!("COPY option {} is not supported", key),
                    ))
                }
            }
        }
    } else {
        // legacy: WITH CSV HEADER
        while let Some(key) = word(pos) {
            match key.as_str() {
                "CSV" => (),
                "HEADER" => options.header = true,
                _ => return Err(copy_syntax_error(sql)),
            }
            pos += 1;
        }
    }
    Ok(options)
}

fn char_option(sql: &str, tok: Option<&Token>) -> Result<u8> {
    let tok = tok.ok_or_else(|| copy_syntax_error(sql))?;
    if tok.kind != TokenKind::Str {
        return Err(copy_syntax_error(sql));
    }
    let inner = &sql[tok.start + 1..tok.end - 1];
    let bytes = inner.as_bytes();
    if bytes.len() != 1 {
        return Err(Error::sql(
            error_codes::SYNTAX_ERROR,
            "COPY delimiter must be a single one-byte character",
        ));
    }
    Ok(bytes[0])
}

fn csv_error(line: u64, msg: &str) -> Error {
    Error::sql(
        error_codes::BAD_COPY_FILE_FORMAT,
        format!("malformed CSV on line {}: {}", line, msg),
    )
}

/// Incremental CSV decoder over concatenated CopyData payloads. Complete
/// rows are drained as they become available; a trailing partial line stays
/// buffered until more data or finish().
pub struct CsvDecoder {
    options: CopyOptions,
    buffer: Vec<u8>,
    line: u64,
    header_pending: bool,
    /// column count fixed by the first data row when no column list was given
    expected_columns: Option<usize>,
}

impl CsvDecoder {
    pub fn new(options: CopyOptions, expected_columns: Option<usize>) -> Self {
        let header_pending = options.header;
        CsvDecoder {
            options,
            buffer: Vec::new(),
            line: 0,
            header_pending,
            expected_columns,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Parse all complete lines out of the buffer.
    pub fn drain_rows(&mut self) -> Result<Vec<Vec<Option<String>>>> {
        let mut rows = Vec::new();
        loop {
            let Some(line_end) = self.find_line_end()? else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..line_end + 1).collect();
            let mut line_slice = &line[..line.len() - 1];
            if line_slice.last() == Some(&b'\r') {
                line_slice = &line_slice[..line_slice.len() - 1];
            }
            self.consume_line(line_slice, &mut rows)?;
        }
        Ok(rows)
    }

    /// Flush the trailing line (no newline terminator) at CopyDone.
    pub fn finish(&mut self) -> Result<Vec<Vec<Option<String>>>> {
        let mut rows = self.drain_rows()?;
        if !self.buffer.is_empty() {
            let line: Vec<u8> = std::mem::take(&mut self.buffer);
            let mut line_slice = &line[..];
            if line_slice.last() == Some(&b'\r') {
                line_slice = &line_slice[..line_slice.len() - 1];
            }
            if !line_slice.is_empty() {
                self.consume_line(line_slice, &mut rows)?;
            }
        }
        Ok(rows)
    }

    fn consume_line(&mut self, line: &[u8], rows: &mut Vec<Vec<Option<String>>>) -> Result<()> {
        self.line += 1;
        if line.is_empty() {
            return Ok(());
        }
        let fields = self.parse_line(line)?;
        if self.header_pending {
            self.header_pending = false;
            return Ok(());
        }
        match self.expected_columns {
            Some(expected) if fields.len() != expected => Err(csv_error(
                self.line,
                &format!("expected {} columns, found {}", expected, fields.len()),
            )),
            Some(_) => {
                rows.push(fields);
                Ok(())
            }
            None => {
                self.expected_columns = Some(fields.len());
                rows.push(fields);
                Ok(())
            }
        }
    }

    /// Position of the next row-terminating newline, respecting quotes.
    /// None if the buffered data ends inside a row.
    fn find_line_end(&self) -> Result<Option<usize>> {
        let mut in_quotes = false;
        let mut i = 0usize;
        let quote = self.options.quote;
        while i < self.buffer.len() {
            let b = self.buffer[i];
            if in_quotes {
                if b == quote {
                    if self.buffer.get(i + 1) == Some(&quote) {
                        i += 2;
                        continue;
                    }
                    in_quotes = false;
                }
            } else if b == quote {
                in_quotes = true;
            } else if b == b'\n' {
                return Ok(Some(i));
            }
            i += 1;
        }
        Ok(None)
    }

    fn parse_line(&self, line: &[u8]) -> Result<Vec<Option<String>>> {
        let delimiter = self.options.delimiter;
        let quote = self.options.quote;
        let mut fields = Vec::new();
        let mut field = Vec::new();
        let mut i = 0usize;
        let mut quoted = false; // current field was quoted
        let mut in_quotes = false;
        loop {
            let b = line.get(i).copied();
            match b {
                None => {
                    if in_quotes {
                        return Err(csv_error(self.line, "unterminated quoted field"));
                    }
                    fields.push(Self::take_field(&mut field, quoted));
                    break;
                }
                Some(b) if in_quotes => {
                    if b == quote {
                        if line.get(i + 1) == Some(&quote) {
                            field.push(quote);
                            i += 2;
                            continue;
                        }
                        in_quotes = false;
                    } else {
                        field.push(b);
                    }
                    i += 1;
                }
                Some(b) if b == quote && field.is_empty() && !quoted => {
                    in_quotes = true;
                    quoted = true;
                    i += 1;
                }
                Some(b) if b == delimiter => {
                    fields.push(Self::take_field(&mut field, quoted));
                    quoted = false;
                    i += 1;
                }
                Some(b) => {
                    field.push(b);
                    i += 1;
                }
            }
        }
        // invalid UTF-8 anywhere in the row is a CSV error with the line number
        fields
            .into_iter()
            .map(|f| match f {
                None => Ok(None),
                Some(bytes) => String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|_| csv_error(self.line, "invalid UTF-8")),
            })
            .collect()
    }

    /// Unquoted empty fields are NULL; quoted empty fields are ''.
    fn take_field(field: &mut Vec<u8>, quoted: bool) -> Option<Vec<u8>> {
        let bytes = std::mem::take(field);
        if bytes.is_empty() && !quoted {
            None
        } else {
            Some(bytes)
        }
    }
}

/// Render one result row as a CSV line (used by COPY TO STDOUT).
pub fn encode_csv_row(row: &[Option<String>], options: &CopyOptions) -> String {
    let delimiter = options.delimiter as char;
    let quote = options.quote as char;
    let mut out = String::new();
    for (i, field) in row.iter().enumerate() {
        if i > 0 {
            out.push(delimiter);
        }
        match field {
            None => (),
            Some(v) => {
                if v.contains(delimiter) || v.contains(quote) || v.contains('\n') || v.contains('\r')
                {
                    out.push(quote);
                    for c in v.chars() {
                        if c == quote {
                            out.push(quote);
                        }
                        out.push(c);
                    }
                    out.push(quote);
                } else {
                    out.push_str(v);
                }
            }
        }
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_copy_from_stdin() {
        let cmd = parse_copy("COPY t(id,v) FROM STDIN WITH (FORMAT csv, HEADER true)")
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            CopyCommand::In {
                table: "t".to_string(),
                columns: vec!["id".to_string(), "v".to_string()],
                options: CopyOptions {
                    header: true,
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn test_parse_copy_to_stdout_with_query() {
        let cmd = parse_copy("COPY (SELECT id FROM t LIMIT 3) TO STDOUT").unwrap().unwrap();
        match cmd {
            CopyCommand::Out { query, .. } => {
                assert_eq!(query.as_deref(), Some("SELECT id FROM t LIMIT 3"));
            }
            _ => panic!("expected Out"),
        }
    }

    #[test]
    fn test_non_copy_statement() {
        assert!(parse_copy("SELECT 1").unwrap().is_none());
    }

    #[test]
    fn test_decoder_basic_rows() {
        let mut dec = CsvDecoder::new(CopyOptions::default(), Some(2));
        dec.push(b"1,a\n2,");
        let rows = dec.drain_rows().unwrap();
        assert_eq!(rows, vec![vec![Some("1".to_string()), Some("a".to_string())]]);
        dec.push(b"b\n");
        let rows = dec.drain_rows().unwrap();
        assert_eq!(rows, vec![vec![Some("2".to_string()), Some("b".to_string())]]);
    }

    #[test]
    fn test_decoder_header_and_quotes() {
        let mut dec = CsvDecoder::new(
            CopyOptions {
                header: true,
                ..Default::default()
            },
            Some(2),
        );
        dec.push(b"id,v\n1,\"a,\"\"b\"\n");
        let rows = dec.drain_rows().unwrap();
        assert_eq!(
            rows,
            vec![vec![Some("1".to_string()), Some("a,\"b".to_string())]]
        );
    }

    #[test]
    fn test_decoder_null_vs_empty_string() {
        let mut dec = CsvDecoder::new(CopyOptions::default(), Some(2));
        dec.push(b",\"\"\n");
        let rows = dec.drain_rows().unwrap();
        assert_eq!(rows, vec![vec![None, Some(String::new())]]);
    }

    #[test]
    fn test_decoder_column_count_mismatch_reports_line() {
        let mut dec = CsvDecoder::new(CopyOptions::default(), Some(2));
        dec.push(b"1,a\n1,a,extra\n");
        let err = dec.drain_rows().unwrap_err();
        assert_eq!(err.sqlstate(), error_codes::BAD_COPY_FILE_FORMAT);
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn test_decoder_unterminated_quote_at_finish() {
        let mut dec = CsvDecoder::new(CopyOptions::default(), Some(1));
        dec.push(b"\"unterminated");
        assert!(dec.drain_rows().unwrap().is_empty());
        assert!(dec.finish().is_err());
    }

    #[test]
    fn test_header_only_copy_is_zero_rows() {
        let mut dec = CsvDecoder::new(
            CopyOptions {
                header: true,
                ..Default::default()
            },
            Some(2),
        );
        dec.push(b"id,v\n");
        assert!(dec.drain_rows().unwrap().is_empty());
        assert!(dec.finish().unwrap().is_empty());
    }

    #[test]
    fn test_encode_round_trips_quoting() {
        let row = vec![Some("a,b".to_string()), None, Some("c\"d".to_string())];
        let line = encode_csv_row(&row, &CopyOptions::default());
        assert_eq!(line, "\"a,b\",,\"c\"\"d\"\n");
    }
}
