use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, warn};

use crate::iriswire::config::TranslationPolicy;
use crate::iriswire::pg::protocol::error_codes;
use crate::iriswire::sql::tokenizer::{tokenize, Token, TokenKind};
use crate::iriswire::{Error, Result};

/// One translated span. Spans are byte offsets: `original_span` into the
/// rule's input text, `replacement_span` into its output text. Unmodified
/// text is implied identical.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub kind: &'static str,
    pub original_span: (usize, usize),
    pub replacement_span: (usize, usize),
    pub confidence: f32,
}

#[derive(Debug, Clone, Default)]
pub struct TranslationMetrics {
    pub parse_ms: f64,
    pub map_ms: f64,
    pub cache_hit: bool,
}

#[derive(Debug, Clone)]
pub struct TranslationResult {
    pub translated_sql: String,
    pub mappings: Vec<Mapping>,
    pub metrics: TranslationMetrics,
    pub warnings: Vec<String>,
}

/// Tracks how often an operation exceeds its latency target. Recording is
/// lock-free and never blocks the request being measured.
pub struct LatencyMonitor {
    name: &'static str,
    threshold_ms: f64,
    total: AtomicU64,
    violations: AtomicU64,
}

impl LatencyMonitor {
    pub fn new(name: &'static str, threshold_ms: f64) -> Self {
        LatencyMonitor {
            name,
            threshold_ms,
            total: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        }
    }

    pub fn record(&self, elapsed_ms: f64) {
        self.total.fetch_add(1, Relaxed);
        if elapsed_ms > self.threshold_ms {
            let violations = self.violations.fetch_add(1, Relaxed) + 1;
            warn!(
                monitor = self.name,
                elapsed_ms, threshold_ms = self.threshold_ms, violations, "latency target exceeded"
            );
        }
    }

    pub fn violation_rate(&self) -> f64 {
        let total = self.total.load(Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.violations.load(Relaxed) as f64 / total as f64
    }

    /// A violation rate above 5% signals a regression.
    pub fn is_regressed(&self) -> bool {
        self.total.load(Relaxed) >= 20 && self.violation_rate() > 0.05
    }
}

/// Bounded LRU cache over immutable translation results.
struct TranslationCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, (u64, Arc<TranslationResult>)>,
}

impl TranslationCache {
    fn new(capacity: usize) -> Self {
        TranslationCache {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::with_capacity(capacity.min(4096)),
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<TranslationResult>> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|entry| {
            entry.0 = tick;
            entry.1.clone()
        })
    }

    fn insert(&mut self, key: String, value: Arc<TranslationResult>) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            // evict the least recently used entry
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (tick, _))| *tick)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.tick += 1;
        self.entries.insert(key, (self.tick, value));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Rewrites a single PostgreSQL-dialect statement into IRIS-dialect SQL.
/// Pure per call; the only shared state is the bounded result cache and the
/// latency monitor, both behind short-lived locks.
pub struct Translator {
    policy: TranslationPolicy,
    cache: Mutex<TranslationCache>,
    pub monitor: LatencyMonitor,
}

struct Edit {
    start: usize,
    end: usize,
    replacement: String,
    kind: &'static str,
    confidence: f32,
}

fn apply_edits(src: &str, mut edits: Vec<Edit>, mappings: &mut Vec<Mapping>) -> String {
    if edits.is_empty() {
        return src.to_string();
    }
    edits.sort_by_key(|e| e.start);
    let mut out = String::with_capacity(src.len() + 32);
    let mut last = 0usize;
    for e in edits {
        if e.start < last {
            continue; // overlapping edit, first one wins
        }
        out.push_str(&src[last..e.start]);
        let rep_start = out.len();
        out.push_str(&e.replacement);
        mappings.push(Mapping {
            kind: e.kind,
            original_span: (e.start, e.end),
            replacement_span: (rep_start, out.len()),
            confidence: e.confidence,
        });
        last = e.end;
    }
    out.push_str(&src[last..]);
    out
}

fn significant(tokens: &[Token]) -> Vec<usize> {
    tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| {
            !matches!(
                t.kind,
                TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
            )
        })
        .map(|(i, _)| i)
        .collect()
}

impl Translator {
    pub fn new(policy: TranslationPolicy, cache_size: usize) -> Self {
        Translator {
            policy,
            cache: Mutex::new(TranslationCache::new(cache_size)),
            monitor: LatencyMonitor::new("sql_translation", 5.0),
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Translate one statement. Results for identical input are served from
    /// the cache with `metrics.cache_hit` set.
    pub fn translate(&self, sql: &str) -> Result<Arc<TranslationResult>> {
        if let Some(mut hit) = self.cache.lock().unwrap().get(sql) {
            let result = Arc::make_mut(&mut hit);
            result.metrics.cache_hit = true;
            return Ok(hit);
        }

        let started = Instant::now();
        let mut mappings = Vec::new();
        let mut warnings = Vec::new();

        let parse_started = Instant::now();
        // one throwaway pass validates the statement lexes at all
        let _ = tokenize(sql);
        let parse_ms = parse_started.elapsed().as_secs_f64() * 1000.0;

        // Rule order is part of the contract.
        let mut text = rule_transaction_verbs(sql, &mut mappings);
        text = rule_identifier_case(&text, &mut mappings);
        text = rule_date_literals(&text, &mut mappings);
        text = rule_top_to_limit(&text, &mut mappings);
        text = rule_vector_operators(&text, &mut mappings);
        text = rule_iris_functions(&text, self.policy, &mut mappings, &mut warnings)?;
        text = rule_json_functions(&text, &mut mappings);
        text = rule_ddl_types(&text, &mut mappings);
        text = rule_strip_trailing_semicolon(&text, &mut mappings);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.monitor.record(elapsed_ms);
        debug!(
            original_len = sql.len(),
            translated_len = text.len(),
            constructs = mappings.len(),
            elapsed_ms,
            "sql translation completed"
        );

        let result = Arc::new(TranslationResult {
            translated_sql: text,
            mappings,
            metrics: TranslationMetrics {
                parse_ms,
                map_ms: elapsed_ms - parse_ms,
                cache_hit: false,
            },
            warnings,
        });
        self.cache
            .lock()
            .unwrap()
            .insert(sql.to_string(), result.clone());
        Ok(result)
    }
}

// --- rule 1: transaction verbs ---

fn rule_transaction_verbs(sql: &str, mappings: &mut Vec<Mapping>) -> String {
    let tokens = tokenize(sql);
    let sig = significant(&tokens);
    let Some(&i0) = sig.first() else {
        return sql.to_string();
    };
    let t0 = tokens[i0];
    let mut edits = Vec::new();
    if t0.is_word(sql, "BEGIN") {
        let mut end = t0.end;
        if let Some(&i1) = sig.get(1) {
            let t1 = tokens[i1];
            if t1.is_word(sql, "TRANSACTION") || t1.is_word(sql, "WORK") {
                end = t1.end;
            }
        }
        edits.push(Edit {
            start: t0.start,
            end,
            replacement: "START TRANSACTION".to_string(),
            kind: "transaction_verb",
            confidence: 1.0,
        });
    } else if t0.is_word(sql, "END") {
        let mut end = t0.end;
        if let Some(&i1) = sig.get(1) {
            let t1 = tokens[i1];
            if t1.is_word(sql, "TRANSACTION") || t1.is_word(sql, "WORK") {
                end = t1.end;
            }
        }
        edits.push(Edit {
            start: t0.start,
            end,
            replacement: "COMMIT".to_string(),
            kind: "transaction_verb",
            confidence: 1.0,
        });
    }
    // START TRANSACTION, COMMIT, ROLLBACK, SAVEPOINT and RELEASE pass through
    apply_edits(sql, edits, mappings)
}

// --- rule 2: identifier case normalization ---

// Postgres folds unquoted identifiers to lowercase, so ORMs quote
// everything. A quoted identifier that is a plain lowercase name means the
// same thing unquoted, and IRIS resolves the unquoted form case-insensitively.
fn rule_identifier_case(sql: &str, mappings: &mut Vec<Mapping>) -> String {
    let tokens = tokenize(sql);
    let mut edits = Vec::new();
    for tok in &tokens {
        if tok.kind != TokenKind::QuotedIdent {
            continue;
        }
        let inner = &sql[tok.start + 1..tok.end - 1];
        let plain = !inner.is_empty()
            && inner
                .bytes()
                .next()
                .map(|b| b.is_ascii_lowercase() || b == b'_')
                .unwrap_or(false)
            && inner
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if plain {
            edits.push(Edit {
                start: tok.start,
                end: tok.end,
                replacement: inner.to_string(),
                kind: "identifier_case",
                confidence: 0.9,
            });
        }
        // anything else stays quoted verbatim, including case and specials
    }
    apply_edits(sql, edits, mappings)
}

// --- rule 3: date/time literals ---

fn rule_date_literals(sql: &str, mappings: &mut Vec<Mapping>) -> String {
    let tokens = tokenize(sql);
    let sig = significant(&tokens);
    let mut edits = Vec::new();
    for w in sig.windows(2) {
        let (a, b) = (tokens[w[0]], tokens[w[1]]);
        if b.kind != TokenKind::Str {
            continue;
        }
        let literal = &sql[b.start + 1..b.end - 1];
        if a.is_word(sql, "DATE") && NaiveDate::parse_from_str(literal, "%Y-%m-%d").is_ok() {
            edits.push(Edit {
                start: a.start,
                end: b.end,
                replacement: format!("TO_DATE('{}', 'YYYY-MM-DD')", literal),
                kind: "date_literal",
                confidence: 1.0,
            });
        } else if a.is_word(sql, "TIMESTAMP")
            && (NaiveDateTime::parse_from_str(literal, "%Y-%m-%d %H:%M:%S").is_ok()
                || NaiveDateTime::parse_from_str(literal, "%Y-%m-%d %H:%M:%S%.f").is_ok())
        {
            edits.push(Edit {
                start: a.start,
                end: b.end,
                replacement: format!("TO_TIMESTAMP('{}', 'YYYY-MM-DD HH24:MI:SS')", literal),
                kind: "date_literal",
                confidence: 1.0,
            });
        }
        // CURRENT_DATE / CURRENT_TIMESTAMP / NOW() / EXTRACT(EPOCH FROM NOW())
        // pass through untouched
    }
    apply_edits(sql, edits, mappings)
}

// --- rule 4: TOP <-> LIMIT ---

// Postgres LIMIT is kept (IRIS accepts it). Incoming IRIS-dialect TOP n is
// relocated to a trailing LIMIT n, before any FOR UPDATE tail.
fn rule_top_to_limit(sql: &str, mappings: &mut Vec<Mapping>) -> String {
    let tokens = tokenize(sql);
    let sig = significant(&tokens);
    let mut top: Option<(Token, Token)> = None;
    for (pos, &i) in sig.iter().enumerate() {
        if tokens[i].is_word(sql, "SELECT") {
            if let (Some(&j), Some(&k)) = (sig.get(pos + 1), sig.get(pos + 2)) {
                if tokens[j].is_word(sql, "TOP") && tokens[k].kind == TokenKind::Number {
                    top = Some((tokens[j], tokens[k]));
                }
            }
            break; // only the outermost SELECT
        }
    }
    let Some((top_tok, n_tok)) = top else {
        return sql.to_string();
    };
    let n = sql[n_tok.start..n_tok.end].to_string();

    // insertion point: before a top-level FOR UPDATE, else end of statement
    let mut insert_at = sql.len();
    let mut depth = 0i32;
    for &i in &sig {
        match tokens[i].kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            TokenKind::Word if depth == 0 && tokens[i].is_word(sql, "FOR") => {
                insert_at = tokens[i].start;
            }
            TokenKind::Semicolon if depth == 0 => {
                if insert_at == sql.len() {
                    insert_at = tokens[i].start;
                }
            }
            _ => (),
        }
    }

    let edits = vec![
        Edit {
            start: top_tok.start,
            end: n_tok.end,
            replacement: String::new(),
            kind: "top_limit",
            confidence: 1.0,
        },
        Edit {
            start: insert_at,
            end: insert_at,
            replacement: if insert_at == sql.len() {
                format!(" LIMIT {}", n)
            } else {
                format!("LIMIT {} ", n)
            },
            kind: "top_limit",
            confidence: 1.0,
        },
    ];
    apply_edits(sql, edits, mappings)
}

// --- rule 5: pgvector operators ---

/// span of the operand to the left/right of an operator token, including a
/// whole function call or dotted identifier chain
fn operand_left(tokens: &[Token], sig: &[usize], op_pos: usize) -> Option<(usize, usize)> {
    let mut p = op_pos.checked_sub(1)?;
    let end = tokens[sig[p]].end;
    let mut start;
    match tokens[sig[p]].kind {
        TokenKind::RParen => {
            let mut depth = 1i32;
            loop {
                p = p.checked_sub(1)?;
                match tokens[sig[p]].kind {
                    TokenKind::RParen => depth += 1,
                    TokenKind::LParen => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => (),
                }
            }
            start = tokens[sig[p]].start;
            // include the function name ahead of the parens
            if p > 0 && tokens[sig[p - 1]].kind == TokenKind::Word {
                p -= 1;
                start = tokens[sig[p]].start;
            }
        }
        TokenKind::Word | TokenKind::QuotedIdent | TokenKind::Str | TokenKind::Param
        | TokenKind::Number => {
            start = tokens[sig[p]].start;
        }
        _ => return None,
    }
    // dotted qualifiers: t.emb
    while p >= 2
        && tokens[sig[p - 1]].kind == TokenKind::Dot
        && matches!(
            tokens[sig[p - 2]].kind,
            TokenKind::Word | TokenKind::QuotedIdent
        )
    {
        p -= 2;
        start = tokens[sig[p]].start;
    }
    Some((start, end))
}

fn operand_right(tokens: &[Token], sig: &[usize], op_pos: usize) -> Option<(usize, usize)> {
    let mut p = op_pos + 1;
    if p >= sig.len() {
        return None;
    }
    let start = tokens[sig[p]].start;
    match tokens[sig[p]].kind {
        TokenKind::Str | TokenKind::Param | TokenKind::Number | TokenKind::DollarStr => {
            Some((start, tokens[sig[p]].end))
        }
        TokenKind::Word | TokenKind::QuotedIdent => {
            // dotted chain and/or call
            let mut end = tokens[sig[p]].end;
            loop {
                if p + 2 < sig.len()
                    && tokens[sig[p + 1]].kind == TokenKind::Dot
                    && matches!(
                        tokens[sig[p + 2]].kind,
                        TokenKind::Word | TokenKind::QuotedIdent
                    )
                {
                    p += 2;
                    end = tokens[sig[p]].end;
                    continue;
                }
                break;
            }
            if p + 1 < sig.len() && tokens[sig[p + 1]].kind == TokenKind::LParen {
                p += 1;
                let mut depth = 1i32;
                while depth > 0 {
                    p += 1;
                    if p >= sig.len() {
                        return None;
                    }
                    match tokens[sig[p]].kind {
                        TokenKind::LParen => depth += 1,
                        TokenKind::RParen => depth -= 1,
                        _ => (),
                    }
                }
                end = tokens[sig[p]].end;
            }
            Some((start, end))
        }
        _ => None,
    }
}

fn rule_vector_operators(sql: &str, mappings: &mut Vec<Mapping>) -> String {
    let mut text = sql.to_string();
    // rewrite one operator per pass; chained expressions terminate quickly
    for _ in 0..32 {
        let tokens = tokenize(&text);
        let sig = significant(&tokens);
        let mut edit = None;
        for (pos, &i) in sig.iter().enumerate() {
            if tokens[i].kind != TokenKind::Op {
                continue;
            }
            let op = tokens[i].text(&text);
            let distance = match op {
                "<->" | "<=>" => "cosine",
                "<#>" => "dot",
                _ => continue,
            };
            let Some((ls, le)) = operand_left(&tokens, &sig, pos) else {
                continue;
            };
            let Some((rs, re)) = operand_right(&tokens, &sig, pos) else {
                continue;
            };
            let left = text[ls..le].to_string();
            let right = text[rs..re].to_string();
            let wrapped = if right.len() >= 9 && right[..9].eq_ignore_ascii_case("TO_VECTOR") {
                right
            } else {
                format!("TO_VECTOR({})", right)
            };
            let replacement = match distance {
                "cosine" => format!("VECTOR_COSINE({}, {})", left, wrapped),
                _ => format!("(- VECTOR_DOT_PRODUCT({}, {}))", left, wrapped),
            };
            edit = Some(Edit {
                start: ls,
                end: re,
                replacement,
                kind: "vector_operator",
                confidence: 1.0,
            });
            break;
        }
        match edit {
            Some(e) => text = apply_edits(&text, vec![e], mappings),
            None => break,
        }
    }
    text
}

// --- rule 6: IRIS function aliases ---

/// Find the span of a balanced argument list starting at the LParen token
/// index in sig; returns (span of contents, end of RParen).
fn call_args(tokens: &[Token], sig: &[usize], lparen_pos: usize) -> Option<(usize, usize, usize)> {
    let contents_start = tokens[sig[lparen_pos]].end;
    let mut depth = 1i32;
    let mut p = lparen_pos;
    while depth > 0 {
        p += 1;
        if p >= sig.len() {
            return None;
        }
        match tokens[sig[p]].kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            _ => (),
        }
    }
    Some((contents_start, tokens[sig[p]].start, tokens[sig[p]].end))
}

/// Split a top-level argument list on commas outside parens.
fn split_args(args: &str) -> Vec<String> {
    let tokens = tokenize(args);
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for tok in &tokens {
        match tok.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            TokenKind::Comma if depth == 0 => {
                out.push(args[start..tok.start].trim().to_string());
                start = tok.end;
            }
            _ => (),
        }
    }
    let tail = args[start..].trim();
    if !tail.is_empty() || !out.is_empty() {
        out.push(tail.to_string());
    }
    out
}

fn rule_iris_functions(
    sql: &str,
    policy: TranslationPolicy,
    mappings: &mut Vec<Mapping>,
    warnings: &mut Vec<String>,
) -> Result<String> {
    let tokens = tokenize(sql);
    let sig = significant(&tokens);
    let mut edits = Vec::new();
    let mut pos = 0usize;
    while pos < sig.len() {
        let tok = tokens[sig[pos]];
        if tok.kind != TokenKind::Word {
            pos += 1;
            continue;
        }
        let word = tok.text(sql);
        let upper = word.to_ascii_uppercase();

        // %SYSTEM.Class.Method() chains
        if upper == "%SYSTEM" {
            let mut end_pos = pos;
            while end_pos + 2 < sig.len()
                && tokens[sig[end_pos + 1]].kind == TokenKind::Dot
                && tokens[sig[end_pos + 2]].kind == TokenKind::Word
            {
                end_pos += 2;
            }
            let chain: String = sql[tok.start..tokens[sig[end_pos]].end].to_string();
            let chain_upper = chain.to_ascii_uppercase();
            let has_call =
                end_pos + 1 < sig.len() && tokens[sig[end_pos + 1]].kind == TokenKind::LParen;
            let mut end = tokens[sig[end_pos]].end;
            if has_call {
                if let Some((_, _, rparen_end)) = call_args(&tokens, &sig, end_pos + 1) {
                    end = rparen_end;
                }
            }
            let replacement = match chain_upper.as_str() {
                "%SYSTEM.VERSION.GETNUMBER" => Some("version()"),
                "%SYSTEM.SECURITY.GETUSER" => Some("current_user"),
                _ => None,
            };
            match replacement {
                Some(rep) => edits.push(Edit {
                    start: tok.start,
                    end,
                    replacement: rep.to_string(),
                    kind: "iris_function",
                    confidence: 1.0,
                }),
                None => {
                    // unknown system class methods are administrative
                    match policy {
                        TranslationPolicy::Error | TranslationPolicy::Hybrid => {
                            return Err(Error::sql(
                                error_codes::FEATURE_NOT_SUPPORTED,
                                format!("unsupported IRIS construct: {}", chain),
                            ));
                        }
                        TranslationPolicy::Warning => {
                            warnings.push(format!("unsupported IRIS construct: {}", chain));
                        }
                        TranslationPolicy::Ignore => (),
                    }
                }
            }
            pos = end_pos + 1;
            continue;
        }

        let is_call = pos + 1 < sig.len() && tokens[sig[pos + 1]].kind == TokenKind::LParen;
        match upper.as_str() {
            "%SQLUPPER" if is_call => edits.push(Edit {
                start: tok.start,
                end: tok.end,
                replacement: "UPPER".to_string(),
                kind: "iris_function",
                confidence: 1.0,
            }),
            "%SQLLOWER" if is_call => edits.push(Edit {
                start: tok.start,
                end: tok.end,
                replacement: "LOWER".to_string(),
                kind: "iris_function",
                confidence: 1.0,
            }),
            "%SQLSTRING" if is_call => {
                if let Some((args_start, args_end, rparen_end)) = call_args(&tokens, &sig, pos + 1)
                {
                    let args = sql[args_start..args_end].trim();
                    edits.push(Edit {
                        start: tok.start,
                        end: rparen_end,
                        replacement: format!("CAST({} AS VARCHAR)", args),
                        kind: "iris_function",
                        confidence: 1.0,
                    });
                }
            }
            "%HOROLOG" => {
                let mut end = tok.end;
                if is_call {
                    if let Some((_, _, rparen_end)) = call_args(&tokens, &sig, pos + 1) {
                        end = rparen_end;
                    }
                }
                edits.push(Edit {
                    start: tok.start,
                    end,
                    replacement: "EXTRACT(EPOCH FROM NOW())".to_string(),
                    kind: "iris_function",
                    confidence: 1.0,
                });
            }
            "DATEDIFF_MICROSECONDS" if is_call => {
                if let Some((args_start, args_end, rparen_end)) = call_args(&tokens, &sig, pos + 1)
                {
                    let args = split_args(&sql[args_start..args_end]);
                    if args.len() == 2 {
                        edits.push(Edit {
                            start: tok.start,
                            end: rparen_end,
                            replacement: format!(
                                "EXTRACT(MICROSECONDS FROM ({} - {}))",
                                args[1], args[0]
                            ),
                            kind: "iris_function",
                            confidence: 1.0,
                        });
                    }
                }
            }
            // %List is a data type, rewritten by the DDL type rule
            "%LIST" => (),
            _ if upper.starts_with('%') => {
                let leading = pos == 0;
                match policy {
                    TranslationPolicy::Error => {
                        return Err(Error::sql(
                            error_codes::FEATURE_NOT_SUPPORTED,
                            format!("unsupported IRIS construct: {}", word),
                        ));
                    }
                    TranslationPolicy::Hybrid if leading => {
                        // a statement-leading %verb is administrative
                        return Err(Error::sql(
                            error_codes::FEATURE_NOT_SUPPORTED,
                            format!("unsupported IRIS construct: {}", word),
                        ));
                    }
                    TranslationPolicy::Hybrid | TranslationPolicy::Warning => {
                        warnings.push(format!("unrecognized IRIS function: {}", word));
                    }
                    TranslationPolicy::Ignore => (),
                }
            }
            _ => (),
        }
        pos += 1;
    }
    Ok(apply_edits(sql, edits, mappings))
}

// --- rule 7: JSON / document accessors ---

fn rule_json_functions(sql: &str, mappings: &mut Vec<Mapping>) -> String {
    let tokens = tokenize(sql);
    let sig = significant(&tokens);
    let mut edits = Vec::new();
    for (pos, &i) in sig.iter().enumerate() {
        let tok = tokens[i];
        if tok.kind != TokenKind::Word {
            continue;
        }
        let is_call = pos + 1 < sig.len() && tokens[sig[pos + 1]].kind == TokenKind::LParen;
        if !is_call {
            continue;
        }
        let rename = match tok.text(sql).to_ascii_uppercase().as_str() {
            "JSON_OBJECT" => Some("jsonb_build_object"),
            "JSON_ARRAY" => Some("jsonb_build_array"),
            "JSON_ARRAY_LENGTH" => Some("jsonb_array_length"),
            "JSON_EXISTS" => Some("jsonb_path_exists"),
            "JSON_TABLE" => Some("jsonb_to_recordset"),
            "JSON_EXTRACT" => None, // handled below, needs arg rewrite
            _ => continue,
        };
        match rename {
            Some(name) => edits.push(Edit {
                start: tok.start,
                end: tok.end,
                replacement: name.to_string(),
                kind: "json_function",
                confidence: if name == "jsonb_to_recordset" { 0.7 } else { 1.0 },
            }),
            None => {
                if let Some((args_start, args_end, rparen_end)) = call_args(&tokens, &sig, pos + 1)
                {
                    let args = split_args(&sql[args_start..args_end]);
                    if args.len() == 2 {
                        edits.push(Edit {
                            start: tok.start,
                            end: rparen_end,
                            replacement: format!("({} #>> {})", args[0], args[1]),
                            kind: "json_function",
                            confidence: 1.0,
                        });
                    }
                }
            }
        }
    }
    apply_edits(sql, edits, mappings)
}

// --- rule 8: DDL data types ---

fn rule_ddl_types(sql: &str, mappings: &mut Vec<Mapping>) -> String {
    let tokens = tokenize(sql);
    let sig = significant(&tokens);
    let Some(&i0) = sig.first() else {
        return sql.to_string();
    };
    if !(tokens[i0].is_word(sql, "CREATE") || tokens[i0].is_word(sql, "ALTER")) {
        return sql.to_string();
    }
    let mut edits = Vec::new();
    for &i in &sig {
        let tok = tokens[i];
        if tok.kind != TokenKind::Word {
            continue;
        }
        let replacement = match tok.text(sql).to_ascii_uppercase().as_str() {
            "LONGVARCHAR" => "TEXT",
            "VARBINARY" | "BINARY" | "ROWVERSION" => "BYTEA",
            "%LIST" => "TEXT[]",
            // VECTOR(N) and SERIAL are preserved
            _ => continue,
        };
        edits.push(Edit {
            start: tok.start,
            end: tok.end,
            replacement: replacement.to_string(),
            kind: "data_type",
            confidence: 1.0,
        });
    }
    apply_edits(sql, edits, mappings)
}

// --- rule 9: trailing semicolon ---

// parameter substitution happens after translation, so a dangling `;`
// would end up inside the statement text sent to IRIS
fn rule_strip_trailing_semicolon(sql: &str, mappings: &mut Vec<Mapping>) -> String {
    let trimmed = sql.trim_end();
    if let Some(stripped) = trimmed.strip_suffix(';') {
        mappings.push(Mapping {
            kind: "trailing_semicolon",
            original_span: (trimmed.len() - 1, trimmed.len()),
            replacement_span: (stripped.len(), stripped.len()),
            confidence: 1.0,
        });
        stripped.trim_end().to_string()
    } else {
        sql.to_string()
    }
}
