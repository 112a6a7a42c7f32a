use sha2::{Digest, Sha256};
use switchyard_core::{SwitchyardError, SwitchyardResult};

/// Statements that would escape or tamper with the sandbox transaction.
const FORBIDDEN: &[&str] = &[
    "BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE", "ATTACH", "DETACH", "PRAGMA",
    "VACUUM",
];

/// SHA-256 of the trimmed statement text, hex encoded.
pub fn statement_digest(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.trim().as_bytes()))
}

/// Reject empty input, multiple statements, and transaction-control or
/// database-level statements.
pub fn screen(sql: &str) -> SwitchyardResult<()> {
    let scan = scan(sql)?;
    let Some(keyword) = scan.first_keyword else {
        return Err(SwitchyardError::Validation("statement is empty".into()));
    };
    if scan.trailing_statement {
        return Err(SwitchyardError::Validation(
            "only a single statement is allowed".into(),
        ));
    }
    let upper = keyword.to_ascii_uppercase();
    if FORBIDDEN.contains(&upper.as_str()) {
        return Err(SwitchyardError::Validation(format!(
            "{upper} statements are not allowed in the sandbox"
        )));
    }
    Ok(())
}

struct Scan {
    first_keyword: Option<String>,
    trailing_statement: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum Lex {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

fn scan(sql: &str) -> SwitchyardResult<Scan> {
    let chars: Vec<char> = sql.chars().collect();
    let mut state = Lex::Code;
    let mut first_keyword: Option<String> = None;
    let mut seen_semicolon = false;
    let mut trailing_statement = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            Lex::Code => match c {
                '-' if next == Some('-') => {
                    state = Lex::LineComment;
                    i += 1;
                }
                '/' if next == Some('*') => {
                    state = Lex::BlockComment;
                    i += 1;
                }
                ';' => seen_semicolon = true,
                c if c.is_whitespace() => {}
                c => {
                    if seen_semicolon {
                        trailing_statement = true;
                    }
                    match c {
                        '\'' | '"' | '`' => state = Lex::Quoted(c),
                        '[' => state = Lex::Quoted(']'),
                        c if first_keyword.is_none() && c.is_ascii_alphabetic() => {
                            let word: String = chars[i..]
                                .iter()
                                .take_while(|ch| ch.is_ascii_alphanumeric() || **ch == '_')
                                .collect();
                            i += word.len() - 1;
                            first_keyword = Some(word);
                        }
                        _ => {}
                    }
                }
            },
            Lex::Quoted(close) => {
                if c == close {
                    // A doubled quote is an escaped quote, not the end.
                    if close != ']' && next == Some(close) {
                        i += 1;
                    } else {
                        state = Lex::Code;
                    }
                }
            }
            Lex::LineComment => {
                if c == '\n' {
                    state = Lex::Code;
                }
            }
            Lex::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = Lex::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    if let Lex::Quoted(close) = state {
        return Err(SwitchyardError::Validation(format!(
            "unterminated quoted text (expected {close})"
        )));
    }
    Ok(Scan {
        first_keyword,
        trailing_statement,
    })
}
