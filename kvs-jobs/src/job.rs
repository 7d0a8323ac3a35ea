//! Job discovery and the per-job driver.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::backup::BackupHandle;
use crate::interpreter::{Interpreter, JobStats};
use crate::parser::CommandReader;
use crate::store::KvStore;

/// Extension of job input files.
pub const JOB_EXTENSION: &str = "job";
/// Extension of job output files.
pub const OUTPUT_EXTENSION: &str = "out";

/// One job: the command file to read and the file its results go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl JobDescriptor {
    /// Pairs `input` with `<stem>.out` in the same directory.
    pub fn for_input(input: impl Into<PathBuf>) -> Self {
        let input = input.into();
        let output = input.with_extension(OUTPUT_EXTENSION);
        Self { input, output }
    }

    /// Output path without its extension; backups are named after it.
    pub fn backup_base(&self) -> PathBuf {
        self.output.with_extension("")
    }
}

impl fmt::Display for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.input.display())
    }
}

fn is_job_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == JOB_EXTENSION)
}

/// Finds the jobs under `target`.
///
/// A directory yields every `.job` file directly inside it, sorted by name so
/// the dispatch order is stable for a run. A single `.job` file yields itself.
pub fn discover_jobs(target: &Path) -> Result<Vec<JobDescriptor>> {
    let metadata = fs::metadata(target)
        .with_context(|| format!("cannot access {}", target.display()))?;

    if metadata.is_file() {
        if !is_job_file(target) {
            bail!("{} is not a .{JOB_EXTENSION} file", target.display());
        }
        return Ok(vec![JobDescriptor::for_input(target)]);
    }

    let mut inputs = Vec::new();
    let dir = fs::read_dir(target)
        .with_context(|| format!("cannot read directory {}", target.display()))?;
    for entry in dir {
        let entry = entry.with_context(|| format!("cannot read entry in {}", target.display()))?;
        let path = entry.path();
        if is_job_file(&path) && entry.file_type().is_ok_and(|t| t.is_file()) {
            inputs.push(path);
        }
    }
    inputs.sort();

    Ok(inputs.into_iter().map(JobDescriptor::for_input).collect())
}

/// Runs one job to completion: reads its commands, executes them against
/// `store` and writes the results to the job's output file.
pub fn run_job(job: &JobDescriptor, store: &KvStore, backups: &BackupHandle) -> Result<JobStats> {
    let input = File::open(&job.input)
        .with_context(|| format!("cannot open job file {}", job.input.display()))?;
    let output = File::create(&job.output)
        .with_context(|| format!("cannot create output file {}", job.output.display()))?;

    let mut reader = CommandReader::new(BufReader::new(input));
    let mut interpreter =
        Interpreter::new(store, backups, BufWriter::new(output), job.backup_base());
    let stats = interpreter
        .run(&mut reader)
        .with_context(|| format!("job {} aborted", job.input.display()))?;

    info!(
        commands = stats.commands,
        errors = stats.errors,
        backups = stats.backups,
        output = %job.output.display(),
        "job output written"
    );
    Ok(stats)
}
