//! Boundary helpers: typed confirmation phrases for destructive actions and the
//! read-only guard for ad-hoc diagnostic SQL. The engine itself never calls these;
//! the layer that talks to operators does, before invoking the engine.

use crate::{Branch, EngineError};

/// Keywords that disqualify a statement from the read-only console.
const BLOCKED_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT",
    "REVOKE", "COPY", "VACUUM", "ANALYZE", "CALL", "DO", "LOCK", "COMMENT", "REINDEX", "CLUSTER",
    "REFRESH", "EXECUTE", "PREPARE", "DISCARD", "RESET", "LISTEN", "NOTIFY",
];

/// Accepts a single `SELECT` or `WITH` statement without data-modifying keywords.
/// String literals, quoted identifiers and comments are ignored when scanning.
pub fn ensure_read_only(sql: &str) -> Result<(), EngineError> {
    let (words, statements) = scan(sql);
    let first = match words.first() {
        Some(w) => w.as_str(),
        None => return Err(EngineError::InvalidArgument("empty query".into())),
    };
    if first != "SELECT" && first != "WITH" {
        return Err(EngineError::InvalidArgument(format!(
            "only SELECT or WITH statements are allowed (got {first})"
        )));
    }
    if statements > 1 {
        return Err(EngineError::InvalidArgument("multiple statements are not allowed".into()));
    }
    if let Some(kw) = words.iter().find(|w| BLOCKED_KEYWORDS.contains(&w.as_str())) {
        return Err(EngineError::InvalidArgument(format!("keyword {kw} is not allowed")));
    }
    Ok(())
}

/// Uppercased bare words plus the number of non-empty statements.
fn scan(sql: &str) -> (Vec<String>, usize) {
    let chars: Vec<char> = sql.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();
    let mut statements = 0usize;
    let mut statement_has_content = false;
    let mut i = 0;

    let flush = |current: &mut String, words: &mut Vec<String>| {
        if !current.is_empty() {
            words.push(current.to_ascii_uppercase());
            current.clear();
        }
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '-' if next == Some('-') => {
                flush(&mut current, &mut words);
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                flush(&mut current, &mut words);
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
                continue;
            }
            '\'' | '"' => {
                flush(&mut current, &mut words);
                statement_has_content = true;
                i += 1;
                while i < chars.len() {
                    if chars[i] == c {
                        // doubled quote is an escaped quote
                        if chars.get(i + 1) == Some(&c) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            ';' => {
                flush(&mut current, &mut words);
                if statement_has_content {
                    statements += 1;
                }
                statement_has_content = false;
            }
            c if c.is_alphanumeric() || c == '_' => {
                current.push(c);
                statement_has_content = true;
            }
            c => {
                flush(&mut current, &mut words);
                if !c.is_whitespace() {
                    statement_has_content = true;
                }
            }
        }
        i += 1;
    }
    flush(&mut current, &mut words);
    if statement_has_content {
        statements += 1;
    }
    (words, statements)
}

/// Phrase an operator must type before a destructive action on a protected branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    phrase: String,
}

impl Confirmation {
    /// `ROLLBACK PROD`
    pub fn rollback(branch: Branch) -> Self {
        Self { phrase: format!("ROLLBACK {}", branch.as_str().to_ascii_uppercase()) }
    }

    /// `SYNC TO PROD`
    pub fn sync(to: Branch) -> Self {
        Self { phrase: format!("SYNC TO {}", to.as_str().to_ascii_uppercase()) }
    }

    /// Every destructive action aimed at a protected branch needs a typed phrase.
    pub fn requires_confirmation(branch: Branch) -> bool {
        branch.is_protected()
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// Exact match after trimming surrounding whitespace; case matters.
    pub fn verify(&self, input: &str) -> Result<(), EngineError> {
        if input.trim() == self.phrase {
            Ok(())
        } else {
            Err(EngineError::InvalidArgument(format!(
                "confirmation phrase mismatch: type '{}' to proceed",
                self.phrase
            )))
        }
    }

    /// Returns `Ok` without checking when `branch` is not protected.
    pub fn verify_if_protected(&self, branch: Branch, input: Option<&str>) -> Result<(), EngineError> {
        if !Self::requires_confirmation(branch) {
            return Ok(());
        }
        self.verify(input.unwrap_or_default())
    }
}
