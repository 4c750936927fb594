//! Readers for the process's own /proc entries

use std::fs;
use std::io;
use std::path::Path;

/// Scheduler view of one thread, from `/proc/<pid>/task/<tid>/stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskStat {
    pub tid: u32,
    pub comm: String,
    pub state: char,
    /// User time in clock ticks
    pub utime: u64,
    /// System time in clock ticks
    pub stime: u64,
}

impl TaskStat {
    pub fn cpu_ticks(&self) -> u64 {
        self.utime + self.stime
    }
}

/// Parse a `stat` line.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// and `)`, so fields are counted from the last `)`.
pub(crate) fn parse_task_stat(content: &str) -> Option<TaskStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close < open {
        return None;
    }

    let tid = content[..open].trim().parse().ok()?;
    let comm = content[open + 1..close].to_string();

    // rest[0] is field 3 (state); utime and stime are fields 14 and 15.
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    let state = rest.first()?.chars().next()?;
    let utime = rest.get(11)?.parse().ok()?;
    let stime = rest.get(12)?.parse().ok()?;

    Some(TaskStat {
        tid,
        comm,
        state,
        utime,
        stime,
    })
}

/// Read every thread of the process rooted at `proc_root` (normally
/// `/proc/self`). Threads exiting while the directory is walked are skipped.
pub(crate) fn read_tasks(proc_root: &Path) -> io::Result<Vec<TaskStat>> {
    let mut tasks: Vec<TaskStat> = fs::read_dir(proc_root.join("task"))?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let content = fs::read_to_string(entry.path().join("stat")).ok()?;
            parse_task_stat(&content)
        })
        .collect();
    tasks.sort_by_key(|t| t.tid);
    Ok(tasks)
}

/// Name of the process itself, from `comm`.
pub(crate) fn process_name(proc_root: &Path) -> String {
    fs::read_to_string(proc_root.join("comm"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

pub(crate) fn clock_ticks_per_second() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

pub(crate) fn state_name(state: char) -> &'static str {
    match state {
        'R' => "running",
        'S' => "sleeping",
        'D' => "disk-sleep",
        'Z' => "zombie",
        'T' => "stopped",
        't' => "tracing-stop",
        'X' | 'x' => "dead",
        'I' => "idle",
        'W' => "paging",
        'P' => "parked",
        _ => "unknown",
    }
}
