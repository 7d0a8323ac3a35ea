//! Executes job commands against the shared store and writes one output
//! record per command.
//!
//! An [`Interpreter`] belongs to exactly one job and runs on that job's worker
//! thread, so its backup counter needs no synchronization.

use std::ffi::OsString;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::backup::{BackupHandle, BackupTask};
use crate::command::Command;
use crate::parser::CommandReader;
use crate::store::KvStore;

const HELP_TEXT: &str = "\
Available commands:
  WRITE [(key,value)(key2,value2),...]
  READ [key,key2,...]
  DELETE [key,key2,...]
  SHOW
  WAIT <delay_ms>
  BACKUP
  HELP
";

/// Whether the command loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    End,
}

/// Per-job counters, logged when the job finishes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobStats {
    pub commands: usize,
    pub errors: usize,
    pub backups: usize,
}

pub struct Interpreter<'a, W: Write> {
    store: &'a KvStore,
    backups: &'a BackupHandle,
    out: W,
    backup_base: PathBuf,
    last_backup: u32,
    stats: JobStats,
}

impl<'a, W: Write> Interpreter<'a, W> {
    /// `backup_base` is the job's output path without its extension; backup
    /// files are named `<backup_base>-<n>.bck`.
    pub fn new(
        store: &'a KvStore,
        backups: &'a BackupHandle,
        out: W,
        backup_base: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            backups,
            out,
            backup_base: backup_base.into(),
            last_backup: 0,
            stats: JobStats::default(),
        }
    }

    /// Executes commands from `reader` until [`Command::End`], then flushes
    /// the output.
    pub fn run<R: BufRead>(&mut self, reader: &mut CommandReader<R>) -> Result<JobStats> {
        while self.execute(reader.next_command()?)? == Flow::Continue {}
        self.out.flush()?;
        Ok(self.stats.clone())
    }

    /// Executes a single command.
    pub fn execute(&mut self, command: Command) -> Result<Flow> {
        if !matches!(command, Command::Empty | Command::End) {
            self.stats.commands += 1;
        }
        let name = command.name();

        match command {
            Command::Write(pairs) if pairs.is_empty() => self.error_record(name)?,
            Command::Write(pairs) => {
                self.store.write(&pairs)?;
                writeln!(self.out, "WRITE: OK")?;
            }
            Command::Read(keys) if keys.is_empty() => self.error_record(name)?,
            Command::Read(keys) => {
                let results = self.store.read(&keys)?;
                write!(self.out, "READ: [")?;
                for (key, value) in results {
                    match value {
                        Some(value) => write!(self.out, "({key},{value})")?,
                        None => write!(self.out, "({key},KVSERROR)")?,
                    }
                }
                writeln!(self.out, "]")?;
            }
            Command::Delete(keys) if keys.is_empty() => self.error_record(name)?,
            Command::Delete(keys) => {
                let missing: Vec<String> = self
                    .store
                    .delete(&keys)?
                    .into_iter()
                    .filter_map(|(key, removed)| (!removed).then_some(key))
                    .collect();
                if missing.is_empty() {
                    writeln!(self.out, "DELETE: OK")?;
                } else {
                    write!(self.out, "DELETE: [")?;
                    for key in missing {
                        write!(self.out, "({key},KVSMISSING)")?;
                    }
                    writeln!(self.out, "]")?;
                }
            }
            Command::Show => {
                let entries = self.store.snapshot()?;
                writeln!(self.out, "SHOW: BEGIN")?;
                for (key, value) in entries {
                    writeln!(self.out, "({key}, {value})")?;
                }
                writeln!(self.out, "SHOW: END")?;
            }
            Command::Wait(None) => self.error_record(name)?,
            Command::Wait(Some(delay_ms)) => {
                debug!(delay_ms, "waiting");
                thread::sleep(Duration::from_millis(delay_ms));
                writeln!(self.out, "WAIT: OK")?;
            }
            Command::Backup => self.backup()?,
            Command::Help => self.out.write_all(HELP_TEXT.as_bytes())?,
            Command::Empty => {}
            Command::Invalid => {
                self.stats.errors += 1;
                writeln!(self.out, "INVALID COMMAND")?;
            }
            Command::End => return Ok(Flow::End),
        }
        Ok(Flow::Continue)
    }

    pub fn stats(&self) -> &JobStats {
        &self.stats
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn backup(&mut self) -> Result<()> {
        self.last_backup += 1;
        let task = BackupTask {
            path: backup_path(&self.backup_base, self.last_backup),
            sequence: self.last_backup,
        };

        match self.backups.enqueue(task) {
            Ok(()) => {
                self.stats.backups += 1;
                writeln!(self.out, "BACKUP: OK")?;
            }
            Err(err) => {
                warn!(error = %err, "late backup");
                self.error_record(Command::Backup.name())?;
            }
        }
        Ok(())
    }

    fn error_record(&mut self, name: &str) -> Result<()> {
        self.stats.errors += 1;
        writeln!(self.out, "{name}: ERROR")?;
        Ok(())
    }
}

/// `<base>-<sequence>.bck`
pub fn backup_path(base: &Path, sequence: u32) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(format!("-{sequence}.bck"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    use super::*;
    use crate::backup::BackupPipeline;
    use crate::parser::parse_line;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    /// Runs `script` through a fresh interpreter and returns its output.
    fn run_script(
        store: &KvStore,
        backups: &BackupHandle,
        base: &Path,
        script: &str,
    ) -> Result<String> {
        let mut interpreter = Interpreter::new(store, backups, Vec::new(), base);
        let mut reader = CommandReader::new(script.as_bytes());
        interpreter.run(&mut reader)?;
        Ok(String::from_utf8(interpreter.into_output())?)
    }

    fn with_pipeline<T>(
        f: impl FnOnce(&Arc<KvStore>, &BackupHandle, &Path) -> Result<T>,
    ) -> Result<T> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(KvStore::new());
        let pipeline = BackupPipeline::spawn(Arc::clone(&store), nz(4), nz(1))?;
        let handle = pipeline.handle();
        let result = f(&store, &handle, &dir.path().join("job"));
        pipeline.shutdown();
        result
    }

    #[test]
    fn test_write_read_delete_show() -> Result<()> {
        with_pipeline(|store, backups, base| {
            let output = run_script(
                store,
                backups,
                base,
                "WRITE [(a,1)(b,2)]\nREAD [a,c]\nDELETE [b]\nSHOW\n",
            )?;
            assert_eq!(
                output,
                "WRITE: OK\nREAD: [(a,1)(c,KVSERROR)]\nDELETE: OK\nSHOW: BEGIN\n(a, 1)\nSHOW: END\n"
            );
            Ok(())
        })
    }

    #[test]
    fn test_read_output_is_sorted() -> Result<()> {
        with_pipeline(|store, backups, base| {
            let output = run_script(store, backups, base, "WRITE [(b,2)(a,1)]\nREAD [b,a]\n")?;
            assert_eq!(output, "WRITE: OK\nREAD: [(a,1)(b,2)]\n");
            Ok(())
        })
    }

    #[test]
    fn test_duplicate_keys_are_not_collapsed() -> Result<()> {
        // Duplicated keys in one request are treated as separate requests.
        with_pipeline(|store, backups, base| {
            let script = "WRITE [(a,1)]\nREAD [a,a]\nDELETE [a,a]\n";
            let output = run_script(store, backups, base, script)?;
            assert_eq!(output, "WRITE: OK\nREAD: [(a,1)(a,1)]\nDELETE: [(a,KVSMISSING)]\n");
            Ok(())
        })
    }

    #[test]
    fn test_delete_missing_keys() -> Result<()> {
        with_pipeline(|store, backups, base| {
            let script = "WRITE [(a,1)]\nDELETE [x,a,y]\nREAD [a]\n";
            let output = run_script(store, backups, base, script)?;
            assert_eq!(
                output,
                "WRITE: OK\nDELETE: [(x,KVSMISSING)(y,KVSMISSING)]\nREAD: [(a,KVSERROR)]\n"
            );
            Ok(())
        })
    }

    #[test]
    fn test_command_errors_do_not_stop_job() -> Result<()> {
        with_pipeline(|store, backups, base| {
            let mut interpreter = Interpreter::new(store, backups, Vec::new(), base);
            let lines = [
                "WRITE []",
                "READ []",
                "DELETE",
                "WAIT later",
                "FROB",
                "",
                "WRITE [(k,v)]",
            ];
            for line in lines {
                assert_eq!(interpreter.execute(parse_line(line))?, Flow::Continue);
            }
            assert_eq!(interpreter.execute(Command::End)?, Flow::End);
            assert_eq!(interpreter.stats().errors, 5);
            assert_eq!(interpreter.stats().commands, 6);

            let output = String::from_utf8(interpreter.into_output())?;
            assert_eq!(
                output,
                "WRITE: ERROR\nREAD: ERROR\nDELETE: ERROR\nWAIT: ERROR\nINVALID COMMAND\n\
                 WRITE: OK\n"
            );
            assert_eq!(store.read(&["k"])?[0].1.as_deref(), Some("v"));
            Ok(())
        })
    }

    #[test]
    fn test_empty_write_leaves_store_untouched() -> Result<()> {
        with_pipeline(|store, backups, base| {
            run_script(store, backups, base, "WRITE [(a,1)(b)]\n")?;
            assert!(store.is_empty()?);
            Ok(())
        })
    }

    #[test]
    fn test_wait_and_help() -> Result<()> {
        with_pipeline(|store, backups, base| {
            let started = std::time::Instant::now();
            let output = run_script(store, backups, base, "WAIT 30\nHELP\n")?;
            assert!(started.elapsed() >= Duration::from_millis(30));
            assert!(output.starts_with("WAIT: OK\nAvailable commands:\n"));
            assert!(output.contains("  BACKUP\n"));
            Ok(())
        })
    }

    #[test]
    fn test_backups_are_numbered_per_job() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(KvStore::new());
        let pipeline = BackupPipeline::spawn(Arc::clone(&store), nz(1), nz(1))?;
        let handle = pipeline.handle();

        let first = dir.path().join("first");
        let second = dir.path().join("second");
        let out = run_script(&store, &handle, &first, "WRITE [(a,1)]\nBACKUP\nBACKUP\nBACKUP\n")?;
        assert_eq!(out, "WRITE: OK\nBACKUP: OK\nBACKUP: OK\nBACKUP: OK\n");
        // A second job starts counting from 1 again.
        run_script(&store, &handle, &second, "BACKUP\n")?;

        let report = pipeline.shutdown();
        assert_eq!(report.written, 4);
        for sequence in 1..=3 {
            assert!(backup_path(&first, sequence).exists());
        }
        assert!(!backup_path(&first, 4).exists());
        assert!(backup_path(&second, 1).exists());
        assert!(!backup_path(&second, 2).exists());
        Ok(())
    }

    #[test]
    fn test_backup_after_shutdown_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(KvStore::new());
        let pipeline = BackupPipeline::spawn(Arc::clone(&store), nz(1), nz(1))?;
        let handle = pipeline.handle();
        pipeline.shutdown();

        let output = run_script(&store, &handle, &dir.path().join("late"), "BACKUP\n")?;
        assert_eq!(output, "BACKUP: ERROR\n");
        assert!(!dir.path().join("late-1.bck").exists());
        Ok(())
    }

    #[test]
    fn test_terminated_store_fails_job() -> Result<()> {
        with_pipeline(|store, backups, base| {
            store.terminate()?;
            let result = run_script(store, backups, base, "SHOW\n");
            assert!(result.is_err());
            Ok(())
        })
    }

    #[test]
    fn test_show_on_terminated_store_writes_nothing() -> Result<()> {
        with_pipeline(|store, backups, base| {
            let mut interpreter = Interpreter::new(store, backups, Vec::new(), base);
            interpreter.execute(parse_line("WRITE [(a,1)]"))?;
            store.terminate()?;

            assert!(interpreter.execute(Command::Show).is_err());
            let output = String::from_utf8(interpreter.into_output())?;
            assert_eq!(output, "WRITE: OK\n");
            Ok(())
        })
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/jobs/test"), 3),
            PathBuf::from("/jobs/test-3.bck")
        );
    }
}
