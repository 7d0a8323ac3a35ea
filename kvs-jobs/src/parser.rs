//! Job-file command reader.
//!
//! Turns the line-oriented job syntax into [`Command`] values:
//!
//! ```text
//! WRITE [(key,value)(key2,value2)]
//! READ [key,key2]
//! DELETE [key,key2]
//! SHOW
//! WAIT <delay_ms>
//! BACKUP
//! HELP
//! # comment
//! ```
//!
//! Size limits ([`MAX_WRITE_SIZE`], [`MAX_STRING_SIZE`]) are enforced here so
//! the store never has to.

use std::io::{self, BufRead};

use crate::command::{Command, MAX_STRING_SIZE, MAX_WRITE_SIZE};

/// Lazily reads commands from a job file, one line at a time.
///
/// Yields [`Command::End`] once the input is exhausted.
pub struct CommandReader<R> {
    reader: R,
    line: String,
}

impl<R: BufRead> CommandReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    /// Reads and parses the next command.
    pub fn next_command(&mut self) -> io::Result<Command> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(Command::End);
        }
        Ok(parse_line(&self.line))
    }
}

/// Parses one line of job syntax.
///
/// Unknown keywords become [`Command::Invalid`]; known keywords with bad
/// arguments become empty batches or `Wait(None)`.
pub fn parse_line(line: &str) -> Command {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Command::Empty;
    }

    let (keyword, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (trimmed, ""),
    };

    match keyword {
        "WRITE" => Command::Write(parse_pairs(rest).unwrap_or_default()),
        "READ" => Command::Read(parse_keys(rest).unwrap_or_default()),
        "DELETE" => Command::Delete(parse_keys(rest).unwrap_or_default()),
        "WAIT" => Command::Wait(rest.parse().ok()),
        "SHOW" if rest.is_empty() => Command::Show,
        "BACKUP" if rest.is_empty() => Command::Backup,
        "HELP" if rest.is_empty() => Command::Help,
        _ => Command::Invalid,
    }
}

/// Strips the surrounding `[` `]` of a batch argument.
fn bracketed(arg: &str) -> Option<&str> {
    arg.strip_prefix('[')?.strip_suffix(']')
}

fn valid_item(item: &str) -> Option<String> {
    let item = item.trim();
    (!item.is_empty() && item.len() <= MAX_STRING_SIZE).then(|| item.to_string())
}

/// Parses `[(k,v)(k2,v2)...]`.
fn parse_pairs(arg: &str) -> Option<Vec<(String, String)>> {
    let mut body = bracketed(arg)?.trim();
    let mut pairs = Vec::new();
    while !body.is_empty() {
        let inner = body.strip_prefix('(')?;
        let (pair, remaining) = inner.split_once(')')?;
        let (key, value) = pair.split_once(',')?;
        if value.contains(',') || pairs.len() == MAX_WRITE_SIZE {
            return None;
        }
        pairs.push((valid_item(key)?, valid_item(value)?));
        body = remaining.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
    }
    Some(pairs)
}

/// Parses `[k1,k2,...]`.
fn parse_keys(arg: &str) -> Option<Vec<String>> {
    let body = bracketed(arg)?.trim();
    if body.is_empty() {
        return Some(Vec::new());
    }
    let keys = body.split(',').map(valid_item).collect::<Option<Vec<_>>>()?;
    (keys.len() <= MAX_WRITE_SIZE).then_some(keys)
}
