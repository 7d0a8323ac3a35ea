/// Maximum number of pairs or keys accepted in a single batch.
pub const MAX_WRITE_SIZE: usize = 256;

/// Maximum length, in bytes, of a key or value.
pub const MAX_STRING_SIZE: usize = 40;

/// One command read from a job file.
///
/// Batches that fail to parse arrive as empty vectors and a `WAIT` with a bad
/// delay as `Wait(None)`; the interpreter turns both into error records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Write(Vec<(String, String)>),
    Read(Vec<String>),
    Delete(Vec<String>),
    Show,
    /// Delay in milliseconds.
    Wait(Option<u64>),
    Backup,
    Help,
    Empty,
    Invalid,
    End,
}

impl Command {
    /// Keyword used as the prefix of this command's output records.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Write(_) => "WRITE",
            Command::Read(_) => "READ",
            Command::Delete(_) => "DELETE",
            Command::Show => "SHOW",
            Command::Wait(_) => "WAIT",
            Command::Backup => "BACKUP",
            Command::Help => "HELP",
            Command::Empty => "EMPTY",
            Command::Invalid => "INVALID",
            Command::End => "END",
        }
    }
}
