//! SQL gatekeeper: conservative lexical validation of spec-supplied SQL.
//!
//! Not a SQL parser. The scanner walks the statement once, tracking quoted
//! regions and paren depth, and is sufficient to stop multi-statement
//! injection and DDL while staying oblivious to the rest of the grammar.
//! `validate` is pure: identical input yields an identical decision and hash.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::template::Scope;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlMode {
    /// `INSERT | UPDATE | DELETE`
    Exec,
    /// `SELECT | WITH`; a top-level `LIMIT 100` is appended when missing.
    Query,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("sql_empty")]
    Empty,
    #[error("sql_verb_not_allowed: {0}")]
    VerbNotAllowed(String),
    #[error("sql_forbidden_word: {0}")]
    ForbiddenWord(String),
    #[error("sql_multi_statement")]
    MultiStatement,
    #[error("sql_bind_missing: {0}")]
    BindMissing(String),
}

/// Validated statement ready for the driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedSql {
    /// Statement with `:name` placeholders rewritten to `$1..$N`.
    pub sql: String,
    /// Bind names in `$N` order (deduplicated, first occurrence wins).
    pub params: Vec<String>,
    /// Stable 64-bit hash of the whitespace-collapsed input; recorded in
    /// events in place of the SQL text.
    pub hash: u64,
}

const FORBIDDEN: &[&str] = &[
    "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE", "COPY", "VACUUM",
];

/// Validate `sql` for `mode` and rewrite binds. Placeholder names must come
/// from `{bot_id, user_id}` or `vars`.
pub fn validate(sql: &str, mode: SqlMode, vars: &Scope) -> Result<PreparedSql, GateError> {
    let hash = stable_hash(sql);
    let scan = scan(sql);

    let first = scan.words.first().ok_or(GateError::Empty)?;
    let verb_ok = match mode {
        SqlMode::Exec => matches_any(&first.upper, &["INSERT", "UPDATE", "DELETE"]),
        SqlMode::Query => matches_any(&first.upper, &["SELECT", "WITH"]),
    };
    if !verb_ok {
        return Err(GateError::VerbNotAllowed(first.upper.clone()));
    }

    for w in &scan.words {
        if FORBIDDEN.contains(&w.upper.as_str()) {
            return Err(GateError::ForbiddenWord(w.upper.clone()));
        }
    }

    // A terminator is only tolerated at the very end of the statement.
    for semi_pos in &scan.semicolons {
        if scan.words.iter().any(|w| w.start > *semi_pos) {
            return Err(GateError::MultiStatement);
        }
    }

    let mut allowed: BTreeSet<&str> = vars.keys().map(String::as_str).collect();
    allowed.insert("bot_id");
    allowed.insert("user_id");
    for p in &scan.placeholders {
        if !allowed.contains(p.name.as_str()) {
            return Err(GateError::BindMissing(p.name.clone()));
        }
    }

    let (mut rewritten, params) = rewrite_placeholders(sql, &scan.placeholders);
    // Drop a tolerated trailing terminator so LIMIT can be appended safely.
    while rewritten.trim_end().ends_with(';') {
        let trimmed = rewritten.trim_end().trim_end_matches(';').to_string();
        rewritten = trimmed;
    }
    if mode == SqlMode::Query && !scan.top_level_limit {
        rewritten = format!("{} LIMIT 100", rewritten.trim_end());
    }

    Ok(PreparedSql {
        sql: rewritten,
        params,
        hash,
    })
}

/// 64-bit hash of the whitespace-collapsed, case-preserved statement.
pub fn stable_hash(sql: &str) -> u64 {
    let normalized: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    fxhash::hash64(&normalized)
}

fn matches_any(word: &str, set: &[&str]) -> bool {
    set.contains(&word)
}

struct Word {
    start: usize,
    upper: String,
}

struct Placeholder {
    start: usize,
    /// Length of the `:name` token in bytes.
    len: usize,
    name: String,
}

#[derive(Default)]
struct ScanResult {
    words: Vec<Word>,
    semicolons: Vec<usize>,
    placeholders: Vec<Placeholder>,
    top_level_limit: bool,
}

/// One pass over the statement, skipping single-quoted strings (with `''`
/// escape) and double-quoted identifiers.
fn scan(sql: &str) -> ScanResult {
    let bytes = sql.as_bytes();
    let mut out = ScanResult::default();
    let mut i = 0usize;
    let mut depth = 0i32;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\'' {
                        if bytes.get(i + 1) == Some(&b'\'') {
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            '"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += 1;
                }
                i += 1;
            }
            '(' => {
                depth += 1;
                i += 1;
            }
            ')' => {
                depth -= 1;
                i += 1;
            }
            ';' => {
                out.semicolons.push(i);
                i += 1;
            }
            ':' => {
                if bytes.get(i + 1) == Some(&b':') {
                    // postgres cast, not a placeholder
                    i += 2;
                    continue;
                }
                let start = i;
                i += 1;
                let name_start = i;
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                if i > name_start {
                    out.placeholders.push(Placeholder {
                        start,
                        len: i - start,
                        name: sql[name_start..i].to_string(),
                    });
                }
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                let upper = sql[start..i].to_ascii_uppercase();
                if depth == 0 && upper == "LIMIT" {
                    out.top_level_limit = true;
                }
                out.words.push(Word { start, upper });
            }
            _ => i += 1,
        }
    }
    out
}

fn is_ident_byte(b: u8) -> bool {
    (b as char).is_ascii_alphanumeric() || b == b'_'
}

/// Replace each `:name` with `$N`, assigning numbers by first occurrence.
fn rewrite_placeholders(sql: &str, placeholders: &[Placeholder]) -> (String, Vec<String>) {
    let mut params: Vec<String> = Vec::new();
    let mut out = String::with_capacity(sql.len());
    let mut last = 0usize;
    for p in placeholders {
        out.push_str(&sql[last..p.start]);
        let idx = match params.iter().position(|n| n == &p.name) {
            Some(i) => i,
            None => {
                params.push(p.name.clone());
                params.len() - 1
            }
        };
        out.push_str(&format!("${}", idx + 1));
        last = p.start + p.len;
    }
    out.push_str(&sql[last..]);
    (out, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(v: serde_json::Value) -> Scope {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn query_allows_select_and_with() {
        let v = vars(json!({}));
        assert!(validate("SELECT 1", SqlMode::Query, &v).is_ok());
        assert!(validate("WITH x AS (SELECT 1) SELECT * FROM x", SqlMode::Query, &v).is_ok());
    }

    #[test]
    fn exec_allows_dml_only() {
        let v = vars(json!({}));
        assert!(validate("INSERT INTO t (a) VALUES (1)", SqlMode::Exec, &v).is_ok());
        assert!(validate("UPDATE t SET a = 1 WHERE bot_id = :bot_id", SqlMode::Exec, &v).is_ok());
        assert!(validate("DELETE FROM t WHERE bot_id = :bot_id", SqlMode::Exec, &v).is_ok());
        assert!(matches!(
            validate("SELECT 1", SqlMode::Exec, &v),
            Err(GateError::VerbNotAllowed(_))
        ));
        assert!(matches!(
            validate("INSERT INTO t VALUES (1)", SqlMode::Query, &v),
            Err(GateError::VerbNotAllowed(_))
        ));
    }

    #[test]
    fn forbidden_words_rejected_case_insensitive() {
        let v = vars(json!({}));
        for sql in [
            "SELECT 1; DROP TABLE t",
            "select * from t where a = drop",
            "SELECT Truncate(x) FROM t",
        ] {
            let r = validate(sql, SqlMode::Query, &v);
            assert!(
                matches!(r, Err(GateError::ForbiddenWord(_)) | Err(GateError::MultiStatement)),
                "{sql} -> {r:?}"
            );
        }
    }

    #[test]
    fn forbidden_word_inside_string_literal_is_fine() {
        let v = vars(json!({}));
        let r = validate("SELECT 'please do not DROP me' AS note", SqlMode::Query, &v);
        assert!(r.is_ok(), "{r:?}");
    }

    #[test]
    fn multi_statement_rejected_trailing_semicolon_ok() {
        let v = vars(json!({}));
        assert!(matches!(
            validate("SELECT 1; SELECT 2", SqlMode::Query, &v),
            Err(GateError::MultiStatement)
        ));
        let p = validate("SELECT a FROM t;", SqlMode::Query, &v).unwrap();
        assert!(!p.sql.contains(';'));
    }

    #[test]
    fn placeholders_rewritten_in_first_occurrence_order() {
        let v = vars(json!({"service": "massage"}));
        let p = validate(
            "SELECT * FROM bookings WHERE bot_id = :bot_id AND user_id = :user_id AND service = :service AND owner = :user_id",
            SqlMode::Query,
            &v,
        )
        .unwrap();
        assert_eq!(p.params, vec!["bot_id", "user_id", "service"]);
        assert!(p.sql.contains("bot_id = $1"));
        assert!(p.sql.contains("user_id = $2"));
        assert!(p.sql.contains("service = $3"));
        assert!(p.sql.contains("owner = $2"));
    }

    #[test]
    fn unknown_bind_name_fails() {
        let v = vars(json!({}));
        assert_eq!(
            validate("SELECT * FROM t WHERE a = :mystery", SqlMode::Query, &v),
            Err(GateError::BindMissing("mystery".to_string()))
        );
    }

    #[test]
    fn cast_is_not_a_placeholder() {
        let v = vars(json!({}));
        let p = validate("SELECT a::text FROM t WHERE bot_id = :bot_id", SqlMode::Query, &v).unwrap();
        assert_eq!(p.params, vec!["bot_id"]);
        assert!(p.sql.contains("a::text"));
    }

    #[test]
    fn limit_appended_only_when_missing_at_top_level() {
        let v = vars(json!({}));
        let p = validate("SELECT a FROM t", SqlMode::Query, &v).unwrap();
        assert!(p.sql.ends_with("LIMIT 100"), "{}", p.sql);

        let p = validate("SELECT a FROM t LIMIT 5", SqlMode::Query, &v).unwrap();
        assert!(!p.sql.ends_with("LIMIT 100"));

        // LIMIT inside a subquery does not count as top-level
        let p = validate(
            "SELECT a FROM (SELECT a FROM t LIMIT 5) sub",
            SqlMode::Query,
            &v,
        )
        .unwrap();
        assert!(p.sql.ends_with("LIMIT 100"), "{}", p.sql);
    }

    #[test]
    fn exec_gets_no_limit() {
        let v = vars(json!({}));
        let p = validate("DELETE FROM t WHERE bot_id = :bot_id", SqlMode::Exec, &v).unwrap();
        assert!(!p.sql.contains("LIMIT"));
    }

    #[test]
    fn hash_is_stable_and_whitespace_insensitive() {
        let a = stable_hash("SELECT  a\n FROM t");
        let b = stable_hash("SELECT a FROM t");
        let c = stable_hash("select a from t");
        assert_eq!(a, b);
        assert_ne!(a, c); // case-preserved
        let v = vars(json!({}));
        let p1 = validate("SELECT a FROM t", SqlMode::Query, &v).unwrap();
        let p2 = validate("SELECT a FROM t", SqlMode::Query, &v).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn placeholder_inside_string_untouched() {
        let v = vars(json!({}));
        let p = validate("SELECT ':not_a_bind' FROM t", SqlMode::Query, &v).unwrap();
        assert!(p.params.is_empty());
        assert!(p.sql.contains(":not_a_bind"));
    }
}
