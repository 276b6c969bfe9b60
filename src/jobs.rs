//! Bounded registry of background jobs.

use crate::error::ShellError;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fmt;

const TRUNCATION_MARKER: &str = "...";

/// Identifier of a background job, assigned from 1 upwards and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tracked background process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    /// Lead process of the job.
    pub pid: Pid,
    /// The command line as typed, space-joined and length-capped.
    pub display_text: String,
}

/// Background jobs of a session, keyed by job id.
///
/// Ids grow with every successful registration regardless of removals, so
/// iterating in key order is registration order.
#[derive(Debug, Clone)]
pub struct JobTable {
    capacity: usize,
    max_display_len: usize,
    next_id: u64,
    jobs: BTreeMap<JobId, Job>,
}

impl JobTable {
    pub fn new(capacity: usize, max_display_len: usize) -> Self {
        Self {
            capacity,
            max_display_len,
            next_id: 1,
            jobs: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.capacity
    }

    /// Tracks `pid` under the next job id.
    ///
    /// Fails without touching existing entries when the table is full; the
    /// id counter only advances on success.
    pub fn register(&mut self, pid: Pid, argv: &[String]) -> Result<&Job, ShellError> {
        if self.is_full() {
            return Err(ShellError::Capacity);
        }
        let id = JobId(self.next_id);
        self.next_id += 1;
        let job = Job {
            id,
            pid,
            display_text: display_text(argv, self.max_display_len),
        };
        Ok(self.jobs.entry(id).or_insert(job))
    }

    /// Removes the job whose lead process is `pid`, if tracked.
    pub fn remove_by_pid(&mut self, pid: Pid) -> Option<Job> {
        let id = self.jobs.values().find(|job| job.pid == pid)?.id;
        self.jobs.remove(&id)
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// Jobs from most to least recently registered.
    pub fn iter_recent_first(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values().rev()
    }
}

/// Joins `argv` with spaces, cutting it to `max_len` bytes with a visible marker.
pub fn display_text(argv: &[String], max_len: usize) -> String {
    let mut text = argv.join(" ");
    if text.len() > max_len {
        let mut cut = max_len.saturating_sub(TRUNCATION_MARKER.len());
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str(TRUNCATION_MARKER);
    }
    text
}
