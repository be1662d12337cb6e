//! Worker pool
//!
//! A fixed-size thread pool draining a `Mutex<VecDeque<Task>>` + `Condvar`
//! task queue — deliberately not the same ring as the completion channel
//! channel, which runs the other direction and must never block a worker on
//! a full queue. Each worker pops a task, runs the dispatch chain against
//! the owned request/message snapshot, writes any reply directly to the
//! connection's socket (serialized per FD by the pending-worker marker in
//! [`Connection`]), and posts a completion so the reactor thread applies
//! generation-checked bookkeeping.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use mio::event::Source;
use mio::{Token, Waker};

use crate::connection::Connection;
use crate::dispatch::{DispatchContext, DispatchRegistry, Outcome};
use crate::log::{Level, LogSink};
use crate::mpsc::BoundedMpsc;
use crate::net::tcp_stream::TcpStream;

/// A unit of deferred work: a complete HTTP request or WS message tied to
/// the connection it arrived on.
pub struct Task<S>
where
    S: TcpStream + Read + Write + Source,
{
    /// The connection the work belongs to. Locked only for the brief
    /// window needed to queue a reply.
    pub connection: Arc<Mutex<Connection<S>>>,
    /// Slab token, duplicated here so a worker can post a completion
    /// without re-locking the connection first.
    pub token: Token,
    /// Generation at submission time; stale by the time the worker posts
    /// its completion if the slot has been reused.
    pub generation: u64,
    /// The message to dispatch.
    pub work: DispatchContext,
}

/// Outcome of a worker task, posted back to the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Resume normal processing.
    Ok,
    /// Log and resume; the request itself failed but the connection
    /// stays open.
    FailKeep,
    /// Close the connection.
    FailClose,
}

/// A completion message: FD (via `Token`), generation, and outcome.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Which connection slot this completion applies to.
    pub token: Token,
    /// Generation at submission time; the reactor drops this completion
    /// if the slot's current generation has since advanced.
    pub generation: u64,
    /// What the worker's dispatch run decided.
    pub outcome: CompletionOutcome,
}

/// The worker task queue: mutex + condvar, intentionally distinct from
/// the worker-to-reactor completion ring.
pub struct TaskQueue<S>
where
    S: TcpStream + Read + Write + Source,
{
    state: Mutex<VecDeque<Task<S>>>,
    signal: Condvar,
    stop: Mutex<bool>,
}

impl<S> Default for TaskQueue<S>
where
    S: TcpStream + Read + Write + Source,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> TaskQueue<S>
where
    S: TcpStream + Read + Write + Source,
{
    /// An empty queue, open for business.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            stop: Mutex::new(false),
        }
    }

    /// Appends a task and wakes one waiting worker.
    pub fn push(&self, task: Task<S>) {
        self.state.lock().unwrap().push_back(task);
        self.signal.notify_one();
    }

    /// Blocks until a task is available or the queue is shut down, in
    /// which case it returns `None`.
    pub fn pop(&self) -> Option<Task<S>> {
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(task) = guard.pop_front() {
                return Some(task);
            }
            if *self.stop.lock().unwrap() {
                return None;
            }
            guard = self.signal.wait(guard).unwrap();
        }
    }

    /// Requests shutdown and wakes every blocked worker so it can observe
    /// the stop flag and exit.
    pub fn shutdown(&self) {
        *self.stop.lock().unwrap() = true;
        self.signal.notify_all();
    }
}

/// One thread driving tasks to completion.
pub struct Worker<S>
where
    S: TcpStream + Read + Write + Source,
{
    queue: Arc<TaskQueue<S>>,
    completions: Arc<BoundedMpsc<Completion>>,
    registry: Arc<DispatchRegistry>,
    waker: Arc<Waker>,
    log: LogSink,
}

impl<S> Worker<S>
where
    S: TcpStream + Read + Write + Source + Send + 'static,
{
    /// Builds a worker; call [`spawn`](Self::spawn) (or `run` directly on
    /// the current thread) to start it.
    pub fn new(
        queue: Arc<TaskQueue<S>>,
        completions: Arc<BoundedMpsc<Completion>>,
        registry: Arc<DispatchRegistry>,
        waker: Arc<Waker>,
        log: LogSink,
    ) -> Self {
        Self {
            queue,
            completions,
            registry,
            waker,
            log,
        }
    }

    /// Spawns this worker on its own OS thread.
    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    /// Pops and executes tasks until the queue shuts down.
    pub fn run(mut self) {
        while let Some(task) = self.queue.pop() {
            let token = task.token;
            let generation = task.generation;
            let outcome = self.process(task);
            self.post(Completion {
                token,
                generation,
                outcome,
            });
        }
    }

    fn process(&mut self, task: Task<S>) -> CompletionOutcome {
        let (outcome, reply) = self.registry.dispatch_deferred(&task.work);
        task.connection.lock().unwrap().apply_reply(reply);

        match outcome {
            Outcome::Ok => CompletionOutcome::Ok,
            Outcome::FailKeep => {
                self.log.write(Level::Warn, "deferred handler failed, connection kept open");
                CompletionOutcome::FailKeep
            }
            Outcome::FailClose => CompletionOutcome::FailClose,
            Outcome::Deferred => {
                self.log.write(Level::Warn, "handler deferred twice; treating as failure");
                CompletionOutcome::FailKeep
            }
        }
    }

    fn post(&self, completion: Completion) {
        let mut completion = completion;
        while let Err(rejected) = self.completions.push(completion) {
            completion = rejected;
            thread::yield_now();
        }
        let _ = self.waker.wake();
    }
}
