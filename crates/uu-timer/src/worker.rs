use std::{
    collections::{BTreeMap, HashMap},
    io,
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicU64, Ordering},
    thread::{self, JoinHandle},
    time::Duration,
};

use tokio::{
    runtime,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{sleep_until, Instant},
};
use tracing::{debug, error};
use uu_core::timer::{Task, TaskId, TimerWorker};

/// Deadline used when `now + delay` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

enum Command {
    Post {
        id: TaskId,
        deadline: Instant,
        task: Task,
    },
    Remove(TaskId),
}

/// Timer worker backed by a current-thread tokio runtime on one dedicated OS thread.
///
/// All posted work runs on that thread, one task at a time, ordered by
/// deadline and then by posting order. The thread stops when the worker is
/// dropped; work still pending at that point never runs.
pub struct TokioTimerWorker {
    commands: Option<UnboundedSender<Command>>,
    next_id: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

impl TokioTimerWorker {
    /// Start the worker thread under `name`.
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let runtime = runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (commands, inbox) = mpsc::unbounded_channel();

        let name = name.into();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            runtime.block_on(run_queue(inbox));
            debug!(worker = %name, "timer worker stopped");
        })?;

        Ok(Self {
            commands: Some(commands),
            next_id: AtomicU64::new(0),
            thread: Some(thread),
        })
    }

    fn send(&self, command: Command) {
        let sent = self
            .commands
            .as_ref()
            .is_some_and(|commands| commands.send(command).is_ok());
        if !sent {
            debug!("timer worker already stopped, dropping command");
        }
    }
}

impl TimerWorker for TokioTimerWorker {
    fn post_delayed(&self, delay: Duration, task: Task) -> TaskId {
        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.send(Command::Post {
            id,
            deadline: deadline_after(delay),
            task,
        });
        id
    }

    fn remove(&self, id: TaskId) {
        self.send(Command::Remove(id));
    }
}

impl Drop for TokioTimerWorker {
    fn drop(&mut self) {
        // Closing the channel ends the queue loop.
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

async fn run_queue(mut inbox: UnboundedReceiver<Command>) {
    let mut queue: BTreeMap<(Instant, TaskId), Task> = BTreeMap::new();
    let mut deadlines: HashMap<TaskId, Instant> = HashMap::new();

    loop {
        let next_deadline = queue.keys().next().map(|(deadline, _)| *deadline);
        tokio::select! {
            biased;
            command = inbox.recv() => match command {
                Some(Command::Post { id, deadline, task }) => {
                    queue.insert((deadline, id), task);
                    deadlines.insert(id, deadline);
                }
                Some(Command::Remove(id)) => {
                    if let Some(deadline) = deadlines.remove(&id) {
                        queue.remove(&(deadline, id));
                    }
                }
                None => break,
            },
            _ = wait_until(next_deadline) => {
                let now = Instant::now();
                while let Some(entry) = queue.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    let ((_, id), task) = entry.remove_entry();
                    deadlines.remove(&id);
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(task = id.get(), "timer task panicked");
                    }
                }
            }
        }
    }
}

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
