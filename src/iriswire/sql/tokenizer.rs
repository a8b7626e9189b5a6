//! A small hand-written SQL tokenizer with explicit state for single-quoted
//! strings, double-quoted identifiers, dollar-quoted strings, line comments
//! and block comments. This is the only lexer the translator needs: rules
//! operate on token spans so they can never rewrite inside a literal or a
//! comment.

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TokenKind {
    /// Identifier or keyword, including IRIS `%` names.
    Word,
    /// Double-quoted identifier, quotes included in the span.
    QuotedIdent,
    /// Single-quoted string literal, quotes included in the span.
    Str,
    /// Dollar-quoted string ($$..$$ or $tag$..$tag$).
    DollarStr,
    /// Positional bind marker: $1, $2, ... or a bare `?`.
    Param,
    Number,
    Op,
    Comma,
    Dot,
    LParen,
    RParen,
    Semicolon,
    LineComment,
    BlockComment,
    Whitespace,
}

#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }

    pub fn is_word(&self, src: &str, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text(src).eq_ignore_ascii_case(word)
    }
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'%'
}

fn is_word_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_operator_char(b: u8) -> bool {
    matches!(
        b,
        b'+' | b'-' | b'*' | b'/' | b'<' | b'>' | b'=' | b'~' | b'!' | b'@' | b'#' | b'^' | b'&'
            | b'|' | b'`' | b'%' | b'[' | b']' | b':'
    )
}

pub struct Tokenizer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: &'a str) -> Self {
        Tokenizer {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        while let Some(tok) = self.next_token() {
            tokens.push(tok);
        }
        tokens
    }

    fn peek(&self, ahead: usize) -> u8 {
        *self.bytes.get(self.pos + ahead).unwrap_or(&0)
    }

    fn token(&mut self, kind: TokenKind, start: usize) -> Token {
        Token {
            kind,
            start,
            end: self.pos,
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        let start = self.pos;
        let b = *self.bytes.get(self.pos)?;

        if b.is_ascii_whitespace() {
            while self.peek(0).is_ascii_whitespace() {
                self.pos += 1;
            }
            return Some(self.token(TokenKind::Whitespace, start));
        }
        if b == b'\'' {
            return Some(self.single_quoted(start));
        }
        if b == b'"' {
            return Some(self.quoted_ident(start));
        }
        if b == b'-' && self.peek(1) == b'-' {
            while self.pos < self.bytes.len() && self.peek(0) != b'\n' {
                self.pos += 1;
            }
            return Some(self.token(TokenKind::LineComment, start));
        }
        if b == b'/' && self.peek(1) == b'*' {
            return Some(self.block_comment(start));
        }
        if b == b'$' {
            return Some(self.dollar(start));
        }
        if b == b'?' {
            self.pos += 1;
            return Some(self.token(TokenKind::Param, start));
        }
        if b.is_ascii_digit() || (b == b'.' && self.peek(1).is_ascii_digit()) {
            return Some(self.number(start));
        }
        if is_word_start(b) {
            self.pos += 1;
            while is_word_continue(self.peek(0)) {
                self.pos += 1;
            }
            return Some(self.token(TokenKind::Word, start));
        }
        match b {
            b',' => {
                self.pos += 1;
                Some(self.token(TokenKind::Comma, start))
            }
            b'.' => {
                self.pos += 1;
                Some(self.token(TokenKind::Dot, start))
            }
            b'(' => {
                self.pos += 1;
                Some(self.token(TokenKind::LParen, start))
            }
            b')' => {
                self.pos += 1;
                Some(self.token(TokenKind::RParen, start))
            }
            b';' => {
                self.pos += 1;
                Some(self.token(TokenKind::Semicolon, start))
            }
            _ if is_operator_char(b) => {
                while is_operator_char(self.peek(0)) {
                    // stop before a comment introducer hidden in an operator run
                    if (self.peek(0) == b'-' && self.peek(1) == b'-')
                        || (self.peek(0) == b'/' && self.peek(1) == b'*')
                    {
                        break;
                    }
                    self.pos += 1;
                }
                if self.pos == start {
                    self.pos += 1;
                }
                Some(self.token(TokenKind::Op, start))
            }
            _ => {
                // any other byte (including multi-byte utf-8 in identifiers we
                // don't care about) is passed through as a one-byte op token
                let ch_len = self.src[self.pos..]
                    .chars()
                    .next()
                    .map(|c| c.len_utf8())
                    .unwrap_or(1);
                self.pos += ch_len;
                Some(self.token(TokenKind::Op, start))
            }
        }
    }

    fn single_quoted(&mut self, start: usize) -> Token {
        self.pos += 1;
        while self.pos < self.bytes.len() {
            if self.peek(0) == b'\'' {
                if self.peek(1) == b'\'' {
                    self.pos += 2; // escaped quote
                    continue;
                }
                self.pos += 1;
                break;
            }
            self.pos += 1;
        }
        self.token(TokenKind::Str, start)
    }

    fn quoted_ident(&mut self, start: usize) -> Token {
        self.pos += 1;
        while self.pos < self.bytes.len() {
            if self.peek(0) == b'"' {
                if self.peek(1) == b'"' {
                    self.pos += 2;
                    continue;
                }
                self.pos += 1;
                break;
            }
            self.pos += 1;
        }
        self.token(TokenKind::QuotedIdent, start)
    }

    fn block_comment(&mut self, start: usize) -> Token {
        self.pos += 2;
        let mut depth = 1u32;
        while self.pos < self.bytes.len() && depth > 0 {
            if self.peek(0) == b'/' && self.peek(1) == b'*' {
                depth += 1;
                self.pos += 2;
            } else if self.peek(0) == b'*' && self.peek(1) == b'/' {
                depth -= 1;
                self.pos += 2;
            } else {
                self.pos += 1;
            }
        }
        self.token(TokenKind::BlockComment, start)
    }

    fn number(&mut self, start: usize) -> Token {
        while self.peek(0).is_ascii_digit()
            || self.peek(0) == b'.'
            || self.peek(0) == b'e'
            || self.peek(0) == b'E'
        {
            if (self.peek(0) == b'e' || self.peek(0) == b'E')
                && !(self.peek(1).is_ascii_digit() || self.peek(1) == b'+' || self.peek(1) == b'-')
            {
                break;
            }
            if self.peek(0) == b'e' || self.peek(0) == b'E' {
                self.pos += 1; // consume sign after exponent if present
                if self.peek(0) == b'+' || self.peek(0) == b'-' {
                    self.pos += 1;
                }
                continue;
            }
            self.pos += 1;
        }
        self.token(TokenKind::Number, start)
    }

    fn dollar(&mut self, start: usize) -> Token {
        // $1 style bind marker
        if self.peek(1).is_ascii_digit() {
            self.pos += 1;
            while self.peek(0).is_ascii_digit() {
                self.pos += 1;
            }
            return self.token(TokenKind::Param, start);
        }
        // $tag$ ... $tag$ dollar-quoted string
        let mut i = self.pos + 1;
        while i < self.bytes.len()
            && (self.bytes[i].is_ascii_alphanumeric() || self.bytes[i] == b'_')
        {
            i += 1;
        }
        if i < self.bytes.len() && self.bytes[i] == b'$' {
            let delim = &self.src[self.pos..=i];
            if let Some(close) = self.src[i + 1..].find(delim) {
                self.pos = i + 1 + close + delim.len();
            } else {
                self.pos = self.bytes.len();
            }
            return self.token(TokenKind::DollarStr, start);
        }
        // lone dollar sign
        self.pos += 1;
        self.token(TokenKind::Op, start)
    }
}

pub fn tokenize(sql: &str) -> Vec<Token> {
    Tokenizer::new(sql).tokenize()
}

/// Split a multi-statement query on semicolons that are outside of strings,
/// quoted identifiers and comments. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let tokens = tokenize(sql);
    let mut statements = Vec::new();
    let mut stmt_start = 0usize;
    for tok in &tokens {
        if tok.kind == TokenKind::Semicolon {
            let stmt = sql[stmt_start..tok.start].trim();
            if !stmt.is_empty() {
                statements.push(stmt);
            }
            stmt_start = tok.end;
        }
    }
    let tail = sql[stmt_start..].trim();
    if !tail.is_empty() {
        statements.push(tail);
    }
    statements
}

/// Count positional bind markers ($n or ?) outside literals and comments.
pub fn count_params(sql: &str) -> usize {
    tokenize(sql)
        .iter()
        .filter(|t| t.kind == TokenKind::Param)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        tokenize(sql)
            .into_iter()
            .filter(|t| t.kind != TokenKind::Whitespace)
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_words_and_strings() {
        let toks = tokenize("SELECT 'it''s' FROM t");
        let texts: Vec<_> = toks
            .iter()
            .filter(|t| t.kind != TokenKind::Whitespace)
            .map(|t| t.text("SELECT 'it''s' FROM t"))
            .collect();
        assert_eq!(texts, vec!["SELECT", "'it''s'", "FROM", "t"]);
    }

    #[test]
    fn test_percent_names_are_words() {
        let sql = "SELECT %SQLUPPER(name) FROM t";
        let toks = tokenize(sql);
        let word = toks
            .iter()
            .find(|t| t.text(sql).starts_with('%'))
            .expect("expected %-word");
        assert_eq!(word.kind, TokenKind::Word);
        assert_eq!(word.text(sql), "%SQLUPPER");
    }

    #[test]
    fn test_vector_operator_is_single_token() {
        let sql = "a <-> b";
        let toks: Vec<_> = tokenize(sql)
            .into_iter()
            .filter(|t| t.kind == TokenKind::Op)
            .collect();
        assert_eq!(toks.len(), 1);
        assert_eq!(toks[0].text(sql), "<->");
    }

    #[test]
    fn test_split_statements_respects_quotes_and_comments() {
        let sql = "SELECT 'a;b'; -- trailing; comment\nSELECT 2 /* ; */; SELECT 3";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0], "SELECT 'a;b'");
        assert!(stmts[1].starts_with("-- trailing"));
        assert_eq!(stmts[2], "SELECT 3");
    }

    #[test]
    fn test_params() {
        assert_eq!(count_params("SELECT $1, $2, '?' -- $3"), 2);
        assert_eq!(count_params("SELECT ? + ?"), 2);
    }

    #[test]
    fn test_dollar_quoted_string() {
        let sql = "SELECT $body$ '; $ $body$ , 1";
        assert_eq!(
            kinds(sql),
            vec![
                TokenKind::Word,
                TokenKind::DollarStr,
                TokenKind::Comma,
                TokenKind::Number
            ]
        );
    }
}
