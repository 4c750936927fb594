//! Diagnostics for the current process, read from /proc
//!
//! CPU profiles are per-thread CPU time in collapsed-stack form
//! (`<process>;<thread> (<tid>) <microseconds>`), one line per thread and
//! sample that consumed CPU, which flamegraph tooling can fold directly.
//! Traces are thread scheduler-state transitions over time.

use super::procfs::{self, TaskStat};
use super::{Capture, CaptureKind, CaptureSink, Diagnostics, DiagnosticsError};
use async_trait::async_trait;
use blazesym::symbolize::source::{Process, Source};
use blazesym::symbolize::{Input, Symbolized, Symbolizer};
use blazesym::Pid;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

/// Sampling cadence for captures.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// How often /proc is sampled
    pub sample_interval: Duration,
    /// How often buffered output is pushed to the stream
    pub flush_interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(10),
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// [`Diagnostics`] backed by `/proc/self`.
#[derive(Debug)]
pub struct ProcessDiagnostics {
    proc_root: PathBuf,
    sampler: SamplerConfig,
    cpu_running: Arc<AtomicBool>,
    trace_running: Arc<AtomicBool>,
}

impl ProcessDiagnostics {
    pub fn new(sampler: SamplerConfig) -> Self {
        Self::with_proc_root("/proc/self", sampler)
    }

    /// Read process information from `proc_root` instead of `/proc/self`.
    pub fn with_proc_root(proc_root: impl Into<PathBuf>, sampler: SamplerConfig) -> Self {
        Self {
            proc_root: proc_root.into(),
            sampler,
            cpu_running: Arc::new(AtomicBool::new(false)),
            trace_running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn running_flag(&self, kind: CaptureKind) -> &Arc<AtomicBool> {
        match kind {
            CaptureKind::Cpu => &self.cpu_running,
            CaptureKind::Trace => &self.trace_running,
        }
    }

    fn read_proc_file(&self, name: &str) -> Result<Vec<u8>, DiagnosticsError> {
        let path = self.proc_root.join(name);
        fs::read(&path).map_err(|e| DiagnosticsError::io(format!("read {}", path.display()), e))
    }

    fn threads_profile(&self, debug: i32) -> Result<Vec<u8>, DiagnosticsError> {
        let tasks = procfs::read_tasks(&self.proc_root)
            .map_err(|e| DiagnosticsError::io("read threads", e))?;
        let ticks = procfs::clock_ticks_per_second();

        let mut out = format!("threads: {}\n", tasks.len());
        for t in &tasks {
            if debug > 0 {
                let _ = writeln!(
                    out,
                    "{} {} {} utime_ms={} stime_ms={}",
                    t.tid,
                    t.comm,
                    procfs::state_name(t.state),
                    t.utime * 1000 / ticks,
                    t.stime * 1000 / ticks,
                );
            } else {
                let _ = writeln!(out, "{} {}", t.tid, t.comm);
            }
        }
        Ok(out.into_bytes())
    }

    fn fds_profile(&self, debug: i32) -> Result<Vec<u8>, DiagnosticsError> {
        let dir = self.proc_root.join("fd");
        let mut fds: Vec<(u32, PathBuf)> = fs::read_dir(&dir)
            .map_err(|e| DiagnosticsError::io(format!("read {}", dir.display()), e))?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let fd = entry.file_name().to_string_lossy().parse().ok()?;
                let target = fs::read_link(entry.path()).unwrap_or_default();
                Some((fd, target))
            })
            .collect();
        fds.sort_by_key(|(fd, _)| *fd);

        let mut out = format!("fds: {}\n", fds.len());
        if debug > 0 {
            for (fd, target) in &fds {
                let _ = writeln!(out, "{} -> {}", fd, target.display());
            }
        }
        Ok(out.into_bytes())
    }

    fn heap_profile(&self, gc_before_read: bool) -> Result<Vec<u8>, DiagnosticsError> {
        if gc_before_read {
            release_free_memory();
        }
        let status = self.read_proc_file("status")?;
        let status = String::from_utf8_lossy(&status);

        let mut out = String::from("heap profile:\n");
        for line in status
            .lines()
            .filter(|l| l.starts_with("Vm") || l.starts_with("Rss"))
        {
            out.push_str(line);
            out.push('\n');
        }
        Ok(out.into_bytes())
    }
}

impl Diagnostics for ProcessDiagnostics {
    fn command_line(&self) -> String {
        std::env::args_os()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("\0")
    }

    fn start_capture(
        &self,
        kind: CaptureKind,
        sink: CaptureSink,
    ) -> Result<Box<dyn Capture>, DiagnosticsError> {
        let guard = RunningGuard::acquire(self.running_flag(kind))
            .ok_or(DiagnosticsError::AlreadyRunning(kind))?;

        // Fail here rather than on an already-open stream.
        let baseline = procfs::read_tasks(&self.proc_root)
            .map_err(|e| DiagnosticsError::io("read threads", e))?;

        let cancel = CancellationToken::new();
        let sampler = Sampler {
            proc_root: self.proc_root.clone(),
            config: self.sampler.clone(),
            cancel: cancel.clone(),
        };
        let task = match kind {
            CaptureKind::Cpu => tokio::spawn(sampler.run_cpu(baseline, sink)),
            CaptureKind::Trace => tokio::spawn(sampler.run_trace(baseline, sink)),
        };
        debug!(%kind, "sampler started");

        Ok(Box::new(SamplerCapture {
            kind,
            cancel: cancel.clone(),
            _cancel_on_drop: cancel.drop_guard(),
            task,
            _guard: guard,
        }))
    }

    fn symbol(&self, addr: u64) -> Result<String, DiagnosticsError> {
        let src = Source::Process(Process::new(Pid::Slf));
        let symbolizer = Symbolizer::new();
        match symbolizer.symbolize_single(&src, Input::AbsAddr(addr)) {
            Ok(Symbolized::Sym(sym)) => Ok(sym.name.to_string()),
            Ok(_) => {
                debug!(addr = format_args!("{:#x}", addr), "address not symbolized");
                Err(DiagnosticsError::SymbolNotFound(addr))
            }
            Err(err) => {
                debug!(addr = format_args!("{:#x}", addr), error = %err, "symbolization failed");
                Err(DiagnosticsError::SymbolNotFound(addr))
            }
        }
    }

    fn lookup(
        &self,
        name: &str,
        debug: i32,
        gc_before_read: bool,
    ) -> Result<Vec<u8>, DiagnosticsError> {
        match name {
            "threads" => self.threads_profile(debug),
            "maps" => self.read_proc_file("maps"),
            "status" => self.read_proc_file("status"),
            "fds" => self.fds_profile(debug),
            "heap" => self.heap_profile(gc_before_read),
            other => Err(DiagnosticsError::ProfileNotFound(other.to_string())),
        }
    }
}

/// Closest thing to a collection before reading heap numbers: hand freed
/// allocator pages back to the OS.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn release_free_memory() {
    // SAFETY: malloc_trim only walks allocator state.
    let released = unsafe { libc::malloc_trim(0) };
    debug!(released = released != 0, "malloc_trim before heap read");
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn release_free_memory() {
    debug!("no allocator trim available; reading heap as is");
}

/// Marks a capture kind busy for as long as it lives.
#[derive(Debug)]
struct RunningGuard(Arc<AtomicBool>);

impl RunningGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard(flag.clone()))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct SamplerCapture {
    kind: CaptureKind,
    cancel: CancellationToken,
    // Abandoned captures stop their sampler too.
    _cancel_on_drop: DropGuard,
    task: JoinHandle<io::Result<()>>,
    _guard: RunningGuard,
}

#[async_trait]
impl Capture for SamplerCapture {
    async fn stop(self: Box<Self>) -> Result<(), DiagnosticsError> {
        let this = *self;
        this.cancel.cancel();
        let context = format!("{} capture", this.kind);
        match this.task.await {
            Ok(Ok(())) => {
                info!(kind = %this.kind, "capture stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(DiagnosticsError::io(context, e)),
            Err(join) => Err(DiagnosticsError::io(
                context,
                io::Error::new(io::ErrorKind::Other, join),
            )),
        }
    }
}

struct Sampler {
    proc_root: PathBuf,
    config: SamplerConfig,
    cancel: CancellationToken,
}

impl Sampler {
    async fn run_cpu(self, baseline: Vec<TaskStat>, sink: CaptureSink) -> io::Result<()> {
        let mut out = BufWriter::new(sink);
        let mut profile = CpuDeltas::new(
            procfs::process_name(&self.proc_root),
            procfs::clock_ticks_per_second(),
        );
        profile.baseline(&baseline);

        self.sample_until_cancelled(&mut out, |tasks, _| profile.observe(tasks))
            .await
    }

    async fn run_trace(self, baseline: Vec<TaskStat>, sink: CaptureSink) -> io::Result<()> {
        let mut out = BufWriter::new(sink);
        let header = format!(
            "# rpcprof thread-state trace interval_us={}\n",
            self.config.sample_interval.as_micros()
        );
        out.write_all(header.as_bytes()).await?;

        let mut trace = StateTrace::default();
        let initial = trace.observe(Duration::ZERO, &baseline);
        out.write_all(initial.as_bytes()).await?;

        self.sample_until_cancelled(&mut out, |tasks, elapsed| trace.observe(elapsed, tasks))
            .await
    }

    /// Sample every `sample_interval` until cancelled, writing what `observe`
    /// renders. One last sample is taken after cancellation so the tail of the
    /// window is not lost.
    async fn sample_until_cancelled<F>(
        &self,
        out: &mut BufWriter<CaptureSink>,
        mut observe: F,
    ) -> io::Result<()>
    where
        F: FnMut(&[TaskStat], Duration) -> String,
    {
        let started = Instant::now();
        let mut sample = tokio::time::interval(self.config.sample_interval);
        sample.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut flush = tokio::time::interval(self.config.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sample.tick() => {
                    let tasks = procfs::read_tasks(&self.proc_root)?;
                    let rendered = observe(&tasks, started.elapsed());
                    out.write_all(rendered.as_bytes()).await?;
                }
                _ = flush.tick() => out.flush().await?,
            }
        }

        let tasks = procfs::read_tasks(&self.proc_root)?;
        let rendered = observe(&tasks, started.elapsed());
        out.write_all(rendered.as_bytes()).await?;
        out.shutdown().await
    }
}

/// CPU time per thread between consecutive samples.
#[derive(Debug)]
struct CpuDeltas {
    process: String,
    ticks_per_second: u64,
    last: HashMap<u32, u64>,
}

impl CpuDeltas {
    fn new(process: String, ticks_per_second: u64) -> Self {
        Self {
            process: collapsed_frame(&process),
            ticks_per_second: ticks_per_second.max(1),
            last: HashMap::new(),
        }
    }

    fn baseline(&mut self, tasks: &[TaskStat]) {
        self.last = tasks.iter().map(|t| (t.tid, t.cpu_ticks())).collect();
    }

    /// Collapsed lines for every thread that used CPU since the last call.
    /// Threads first seen here are charged their whole CPU time.
    fn observe(&mut self, tasks: &[TaskStat]) -> String {
        let mut out = String::new();
        let mut seen = HashMap::with_capacity(tasks.len());
        for t in tasks {
            let total = t.cpu_ticks();
            let delta = match self.last.get(&t.tid) {
                Some(prev) => total.saturating_sub(*prev),
                None => total,
            };
            if delta > 0 {
                let _ = writeln!(
                    out,
                    "{};{} ({}) {}",
                    self.process,
                    collapsed_frame(&t.comm),
                    t.tid,
                    delta * 1_000_000 / self.ticks_per_second,
                );
            }
            seen.insert(t.tid, total);
        }
        self.last = seen;
        out
    }
}

/// Frames are `;`-separated in collapsed stacks.
fn collapsed_frame(name: &str) -> String {
    name.replace(';', ":")
}

/// Scheduler state of every thread as of the last sample.
#[derive(Debug, Default)]
struct StateTrace {
    last: HashMap<u32, (String, char)>,
}

impl StateTrace {
    fn observe(&mut self, elapsed: Duration, tasks: &[TaskStat]) -> String {
        let micros = elapsed.as_micros();
        let mut out = String::new();
        let mut seen = HashMap::with_capacity(tasks.len());

        for t in tasks {
            let changed = match self.last.get(&t.tid) {
                Some((_, state)) => *state != t.state,
                None => true,
            };
            if changed {
                let _ = writeln!(
                    out,
                    "{} {} {} {}",
                    micros,
                    t.tid,
                    t.comm,
                    procfs::state_name(t.state)
                );
            }
            seen.insert(t.tid, (t.comm.clone(), t.state));
        }

        let mut exited: Vec<_> = self
            .last
            .iter()
            .filter(|(tid, _)| !seen.contains_key(*tid))
            .collect();
        exited.sort_by_key(|(tid, _)| **tid);
        for (tid, (comm, _)) in exited {
            let _ = writeln!(out, "{} {} {} exited", micros, tid, comm);
        }

        self.last = seen;
        out
    }
}
