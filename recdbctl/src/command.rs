//! Shell command grammar.

use recdb_storage::{field_position, Cookie, Criteria, RecNo, Record};
use thiserror::Error;

/// One parsed shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Find(Criteria),
    Read(RecNo),
    Create(Record),
    Update { rec_no: RecNo, cookie: Cookie, record: Record },
    Delete { rec_no: RecNo, cookie: Cookie },
    Lock(RecNo),
    Unlock { rec_no: RecNo, cookie: Cookie },
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown command `{0}`; try find, read, create, update, delete, lock, unlock or exit")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("`{0}` is not a number")]
    BadNumber(String),
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("expected 6 `|`-separated fields, got {0}")]
    FieldCount(usize),
}

const FIND_USAGE: &str = "find [field=prefix ...]";
const READ_USAGE: &str = "read <n>";
const CREATE_USAGE: &str = "create f1|f2|f3|f4|f5|f6";
const UPDATE_USAGE: &str = "update <n> <cookie> f1|f2|f3|f4|f5|f6";
const DELETE_USAGE: &str = "delete <n> <cookie>";
const LOCK_USAGE: &str = "lock <n>";
const UNLOCK_USAGE: &str = "unlock <n> <cookie>";

/// Parse a non-empty shell line.
pub fn parse(line: &str) -> Result<ShellCommand, ParseError> {
    let line = line.trim();
    let (word, rest) = line
        .split_once(char::is_whitespace)
        .map(|(w, r)| (w, r.trim_start()))
        .unwrap_or((line, ""));
    match word.to_ascii_lowercase().as_str() {
        "exit" | "quit" | "\\q" => Ok(ShellCommand::Exit),
        "find" => parse_criteria(rest).map(ShellCommand::Find),
        "read" => {
            let [n] = args::<1>(rest, READ_USAGE)?;
            Ok(ShellCommand::Read(number(n)?))
        }
        "lock" => {
            let [n] = args::<1>(rest, LOCK_USAGE)?;
            Ok(ShellCommand::Lock(number(n)?))
        }
        "unlock" => {
            let [n, c] = args::<2>(rest, UNLOCK_USAGE)?;
            Ok(ShellCommand::Unlock { rec_no: number(n)?, cookie: number(c)? })
        }
        "delete" => {
            let [n, c] = args::<2>(rest, DELETE_USAGE)?;
            Ok(ShellCommand::Delete { rec_no: number(n)?, cookie: number(c)? })
        }
        "create" => {
            if rest.is_empty() {
                return Err(ParseError::Usage(CREATE_USAGE));
            }
            parse_record(rest).map(ShellCommand::Create)
        }
        "update" => {
            let mut parts = rest.splitn(3, char::is_whitespace);
            let (Some(n), Some(c), Some(fields)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(ParseError::Usage(UPDATE_USAGE));
            };
            Ok(ShellCommand::Update {
                rec_no: number(n)?,
                cookie: number(c)?,
                record: parse_record(fields.trim_start())?,
            })
        }
        other => Err(ParseError::UnknownCommand(other.to_string())),
    }
}

fn args<'a, const N: usize>(rest: &'a str, usage: &'static str) -> Result<[&'a str; N], ParseError> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    words.try_into().map_err(|_| ParseError::Usage(usage))
}

fn number(word: &str) -> Result<u64, ParseError> {
    word.parse().map_err(|_| ParseError::BadNumber(word.to_string()))
}

fn parse_record(text: &str) -> Result<Record, ParseError> {
    let fields: Vec<String> = text.split('|').map(|f| f.trim().to_string()).collect();
    let count = fields.len();
    fields.try_into().map_err(|_| ParseError::FieldCount(count))
}

fn parse_criteria(rest: &str) -> Result<Criteria, ParseError> {
    let mut criteria = Criteria::default();
    for term in rest.split_whitespace() {
        let (field, prefix) = term.split_once('=').ok_or(ParseError::Usage(FIND_USAGE))?;
        let pos = field_position(field).ok_or_else(|| ParseError::UnknownField(field.to_string()))?;
        criteria[pos] = Some(prefix.to_string());
    }
    Ok(criteria)
}
