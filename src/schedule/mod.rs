//! Token-dataflow task pool
//!
//! The driver expresses its task graph through zero-width dependency
//! tokens: each task declares `(token, Read | Write)` accesses and the
//! pool enforces the standard read/write exclusion — conflicting tasks
//! execute in submission order, disjoint tasks in any order. Two
//! priorities; high-priority runnable tasks dispatch ahead of normal
//! ones. Tasks may block their worker thread (kernel completion, MPI
//! progress), so the pool must be sized at least lookahead + 2 to keep
//! the pipeline deadlock-free.

use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Handle to a dependency token
pub type TokenId = usize;

type TaskId = usize;
type TaskBody = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// How a task touches a token
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    /// Shared; concurrent with other reads of the same token
    Read,
    /// Exclusive; orders against every earlier access of the token
    Write,
}

/// Task priority; the pool runs high-priority runnable tasks first
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Trailing-update work
    Normal,
    /// Panel and lookahead work on the critical path
    High,
}

struct TaskNode {
    body: Option<TaskBody>,
    waiting_on: usize,
    dependents: Vec<TaskId>,
    priority: Priority,
}

#[derive(Default)]
struct TokenState {
    last_writer: Option<TaskId>,
    readers: Vec<TaskId>,
}

#[derive(Default)]
struct State {
    tokens: Vec<TokenState>,
    tasks: HashMap<TaskId, TaskNode>,
    ready_high: VecDeque<TaskId>,
    ready_normal: VecDeque<TaskId>,
    next_task: TaskId,
    pending: usize,
    error: Option<Error>,
    shutdown: bool,
}

impl State {
    fn enqueue(&mut self, id: TaskId) {
        match self.tasks[&id].priority {
            Priority::High => self.ready_high.push_back(id),
            Priority::Normal => self.ready_normal.push_back(id),
        }
    }

    fn pop_ready(&mut self) -> Option<TaskId> {
        self.ready_high
            .pop_front()
            .or_else(|| self.ready_normal.pop_front())
    }

    fn complete(&mut self, id: TaskId) {
        let node = self.tasks.remove(&id).expect("completing unknown task");
        for dep in node.dependents {
            if let Some(n) = self.tasks.get_mut(&dep) {
                n.waiting_on -= 1;
                if n.waiting_on == 0 {
                    self.enqueue(dep);
                }
            }
        }
        self.pending -= 1;
    }
}

struct Shared {
    state: Mutex<State>,
    work_ready: Condvar,
    quiesced: Condvar,
}

/// A cooperative worker pool executing a token-ordered task graph
///
/// One "master" thread (the driver) submits tasks; the worker team
/// executes them in dependency order. A fatal task error is latched,
/// the remaining graph drains as no-ops, and [`wait_all`](Self::wait_all)
/// surfaces the first error. Cancellation mid-task is not supported.
pub struct TaskPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawn a pool of `workers` threads (at least one)
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            work_ready: Condvar::new(),
            quiesced: Condvar::new(),
        });
        let workers = (0..workers.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(shared))
            })
            .collect();
        Self { shared, workers }
    }

    /// Create a fresh dependency token
    pub fn token(&self) -> TokenId {
        let mut tokens = self.tokens(1);
        tokens.pop().unwrap()
    }

    /// Create `n` fresh dependency tokens
    pub fn tokens(&self, n: usize) -> Vec<TokenId> {
        let mut state = self.shared.state.lock().unwrap();
        let first = state.tokens.len();
        state.tokens.extend((0..n).map(|_| TokenState::default()));
        (first..first + n).collect()
    }

    /// Submit a task with its token accesses
    ///
    /// The task becomes runnable once every earlier conflicting task has
    /// completed. Duplicate tokens in `deps` are allowed; `Write` wins.
    pub fn submit<F>(&self, priority: Priority, deps: &[(TokenId, Access)], body: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        let id = state.next_task;
        state.next_task += 1;

        let mut preds: Vec<TaskId> = Vec::new();
        for &(token, access) in deps {
            let ts = &state.tokens[token];
            let mut candidates: Vec<TaskId> = Vec::new();
            if let Some(w) = ts.last_writer {
                candidates.push(w);
            }
            if access == Access::Write {
                candidates.extend_from_slice(&ts.readers);
            }
            for c in candidates {
                if state.tasks.contains_key(&c) && !preds.contains(&c) {
                    preds.push(c);
                }
            }
        }
        for &(token, access) in deps {
            let ts = &mut state.tokens[token];
            match access {
                Access::Read => ts.readers.push(id),
                Access::Write => {
                    ts.last_writer = Some(id);
                    ts.readers.clear();
                }
            }
        }

        let waiting_on = preds.len();
        state.tasks.insert(
            id,
            TaskNode {
                body: Some(Box::new(body)),
                waiting_on,
                dependents: Vec::new(),
                priority,
            },
        );
        for p in preds {
            state.tasks.get_mut(&p).unwrap().dependents.push(id);
        }
        state.pending += 1;
        if waiting_on == 0 {
            state.enqueue(id);
            self.shared.work_ready.notify_one();
        }
    }

    /// Block until every submitted task has completed
    ///
    /// Returns the first fatal error raised by a task, if any; later
    /// tasks behind a latched error are drained without running.
    pub fn wait_all(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        while state.pending > 0 {
            state = self.shared.quiesced.wait(state).unwrap();
        }
        match state.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.work_ready.notify_all();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let (id, body, skip) = {
            let mut state = shared.state.lock().unwrap();
            let id = loop {
                if let Some(id) = state.pop_ready() {
                    break id;
                }
                if state.shutdown {
                    return;
                }
                state = shared.work_ready.wait(state).unwrap();
            };
            let body = state
                .tasks
                .get_mut(&id)
                .and_then(|n| n.body.take())
                .expect("ready task without body");
            (id, body, state.error.is_some())
        };

        let result = if skip { Ok(()) } else { body() };

        let mut state = shared.state.lock().unwrap();
        if let Err(e) = result {
            if state.error.is_none() {
                state.error = Some(e);
            }
        }
        state.complete(id);
        if state.pending == 0 {
            shared.quiesced.notify_all();
        }
        // A completion may have made several tasks runnable.
        shared.work_ready.notify_all();
        drop(state);
    }
}
