//! Unit of work dispatched by the scheduler.
//!
//! A job owns an opaque payload and one of three bodies: a pre-resolved
//! empty body, an external process, or a caller-defined closure. `start`
//! runs the body on a dedicated worker thread and posts the job's uid on the
//! scheduler's completion channel when the body finished, panicked, or was
//! skipped because the job was already interrupted. The driver and the
//! worker share status, timing, and the interruption flag behind a per-job
//! lock.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::status::JobStatus;

/// Process-wide insertion counter; breaks priority ties deterministically in
/// favor of jobs created first.
static INDEX_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Start/stop timestamps and elapsed time of one job execution.
///
/// `duration` is `stop - start` once the job finished, `now - start` while
/// it runs, and zero before it ever started.
#[derive(Debug, Clone, Copy)]
pub struct TimingInfo {
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct JobState {
    status: JobStatus,
    interrupted: bool,
    slot: Option<usize>,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    child_pid: Option<u32>,
}

/// View of the shared job state handed to closure bodies, so long-running
/// work can poll for interruption and bail out early.
#[derive(Clone)]
pub struct JobSignals {
    state: Arc<Mutex<JobState>>,
}

impl JobSignals {
    pub fn interrupted(&self) -> bool {
        self.state.lock().unwrap().interrupted
    }

    /// Slot number assigned for this execution, unique among active jobs.
    pub fn slot(&self) -> Option<usize> {
        self.state.lock().unwrap().slot
    }
}

/// External command spawned by a process job.
#[derive(Debug, Clone)]
pub struct JobCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl JobCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.env.push((name.to_string(), value.to_string()));
        self
    }
}

type RunFn = Box<dyn FnMut(&JobSignals) -> JobStatus + Send>;

enum JobBody {
    /// Pre-resolved status; the scheduler never dispatches these.
    Empty,
    /// Spawns an external process; interruption kills its process tree.
    Process(JobCommand),
    /// Caller-defined body. Shared behind a mutex so a requeued job can run
    /// the same body again.
    Run(Arc<Mutex<RunFn>>),
}

impl JobBody {
    fn snapshot(&self) -> JobBody {
        match self {
            JobBody::Empty => JobBody::Empty,
            JobBody::Process(command) => JobBody::Process(command.clone()),
            JobBody::Run(body) => JobBody::Run(Arc::clone(body)),
        }
    }
}

/// A schedulable unit of work tied to a DAG vertex.
pub struct Job<D> {
    uid: String,
    data: Option<D>,
    /// Queue this job consumes tokens from.
    pub queue_name: String,
    /// Tokens held while the job is active.
    pub tokens: usize,
    /// Higher priorities dispatch first within a queue.
    pub priority: i32,
    should_skip: bool,
    index: u64,
    notify_end: Sender<String>,
    body: JobBody,
    state: Arc<Mutex<JobState>>,
    handle: Option<JoinHandle<()>>,
}

impl<D> Job<D> {
    fn base(
        uid: &str,
        data: Option<D>,
        notify_end: Sender<String>,
        body: JobBody,
        should_skip: bool,
        status: JobStatus,
    ) -> Self {
        let state = JobState {
            status,
            ..JobState::default()
        };
        Self {
            uid: uid.to_string(),
            data,
            queue_name: "default".to_string(),
            tokens: 1,
            priority: 0,
            should_skip,
            index: INDEX_COUNTER.fetch_add(1, Ordering::SeqCst),
            notify_end,
            body,
            state: Arc::new(Mutex::new(state)),
            handle: None,
        }
    }

    /// Job with a caller-defined body returning the final status.
    pub fn new(
        uid: &str,
        data: Option<D>,
        notify_end: Sender<String>,
        body: impl FnMut(&JobSignals) -> JobStatus + Send + 'static,
    ) -> Self {
        Self::base(
            uid,
            data,
            notify_end,
            JobBody::Run(Arc::new(Mutex::new(Box::new(body)))),
            false,
            JobStatus::Unknown,
        )
    }

    /// Job that spawns an external process; its exit code is mapped through
    /// [`JobStatus::from_exit_code`].
    pub fn process(uid: &str, data: Option<D>, notify_end: Sender<String>, command: JobCommand) -> Self {
        Self::base(
            uid,
            data,
            notify_end,
            JobBody::Process(command),
            false,
            JobStatus::Unknown,
        )
    }

    /// Job carrying a pre-decided status. `should_skip` is set: the
    /// scheduler collects it without dispatching.
    pub fn empty(uid: &str, data: Option<D>, notify_end: Sender<String>, status: JobStatus) -> Self {
        Self::base(uid, data, notify_end, JobBody::Empty, true, status)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn data(&self) -> Option<&D> {
        self.data.as_ref()
    }

    /// Global insertion index, assigned at construction.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn should_skip(&self) -> bool {
        self.should_skip
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().unwrap().status
    }

    pub fn interrupted(&self) -> bool {
        self.state.lock().unwrap().interrupted
    }

    pub fn slot(&self) -> Option<usize> {
        self.state.lock().unwrap().slot
    }

    pub fn timing_info(&self) -> TimingInfo {
        let state = self.state.lock().unwrap();
        let duration = match (state.started_at, state.stopped_at) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        TimingInfo {
            start_time: state.start_time,
            stop_time: state.stop_time,
            duration,
        }
    }

    /// Launch the job body on a worker thread.
    ///
    /// The start timestamps are recorded here, on the driver thread, so a
    /// requeued job atomically gets a fresh start/stop pair.
    pub(crate) fn start(&mut self, slot: usize) {
        {
            let mut state = self.state.lock().unwrap();
            state.slot = Some(slot);
            state.start_time = Some(Utc::now());
            state.started_at = Some(Instant::now());
            state.stop_time = None;
            state.stopped_at = None;
        }
        let uid = self.uid.clone();
        let state = Arc::clone(&self.state);
        let notify_end = self.notify_end.clone();
        let body = self.body.snapshot();
        self.handle = Some(
            thread::Builder::new()
                .name(uid.clone())
                .spawn(move || worker(uid, state, notify_end, body))
                .expect("failed to spawn job worker thread"),
        );
    }

    /// Interrupt the job. Idempotent; true on the first call only.
    ///
    /// For process jobs the recorded child process group is killed.
    pub fn interrupt(&self) -> bool {
        let (first, child_pid) = {
            let mut state = self.state.lock().unwrap();
            let first = !state.interrupted;
            state.interrupted = true;
            (first, state.child_pid)
        };
        if first {
            debug!(uid = %self.uid, "interrupting job");
            if let Some(pid) = child_pid {
                kill_process_tree(pid);
            }
        }
        first
    }

    pub(crate) fn take_handle(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }
}

fn worker(uid: String, state: Arc<Mutex<JobState>>, notify_end: Sender<String>, body: JobBody) {
    let interrupted = state.lock().unwrap().interrupted;
    if interrupted {
        debug!(uid = %uid, "job was interrupted before it started");
    } else {
        let signals = JobSignals {
            state: Arc::clone(&state),
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            execute(&uid, &body, &state, &signals)
        }));
        let status = match outcome {
            Ok(status) => status,
            Err(_) => {
                warn!(uid = %uid, "job body panicked");
                JobStatus::Failure
            }
        };
        state.lock().unwrap().status = status;
    }
    {
        let mut state = state.lock().unwrap();
        state.stop_time = Some(Utc::now());
        state.stopped_at = Some(Instant::now());
    }
    // The receiver may already be gone when the run was aborted.
    let _ = notify_end.send(uid);
}

fn execute(
    uid: &str,
    body: &JobBody,
    state: &Arc<Mutex<JobState>>,
    signals: &JobSignals,
) -> JobStatus {
    match body {
        JobBody::Empty => state.lock().unwrap().status,
        JobBody::Run(body) => {
            let mut body = body.lock().unwrap();
            (*body)(signals)
        }
        JobBody::Process(command) => run_process(uid, command, state),
    }
}

fn run_process(uid: &str, command: &JobCommand, state: &Arc<Mutex<JobState>>) -> JobStatus {
    let mut process = Command::new(&command.program);
    process.args(&command.args);
    if let Some(cwd) = &command.cwd {
        process.current_dir(cwd);
    }
    process.envs(command.env.iter().map(|(k, v)| (k, v)));
    // Give the child its own process group so interruption reaches the
    // whole tree.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        process.process_group(0);
    }

    // Spawn and record the pid in one critical section: interruption either
    // sees no pid (and the spawn is refused) or a pid it can kill.
    let mut child = {
        let mut state = state.lock().unwrap();
        if state.interrupted {
            return JobStatus::Failure;
        }
        let child = match process.spawn() {
            Ok(child) => child,
            Err(error) => {
                warn!(uid = %uid, program = %command.program, %error, "failed to spawn process");
                return JobStatus::Failure;
            }
        };
        state.child_pid = Some(child.id());
        child
    };

    let waited = child.wait();
    state.lock().unwrap().child_pid = None;
    match waited {
        Ok(exit) => match exit.code() {
            Some(code) => JobStatus::from_exit_code(code),
            // Killed by a signal.
            None => JobStatus::Failure,
        },
        Err(error) => {
            warn!(uid = %uid, %error, "failed to wait for process");
            JobStatus::Failure
        }
    }
}

#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    let pgid = pid as i32;
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    // Short grace period, then make sure.
    thread::sleep(Duration::from_millis(50));
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_tree(pid: u32) {
    warn!(pid, "process tree kill is only implemented on unix");
}
