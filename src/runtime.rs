//! # Session worker runtime
//!
//! Owns a [`Session`] on a dedicated thread. Producers clone the
//! [`SessionHandle`]; the worker serializes everything the session does, so
//! the ARQ core never needs a lock. The loop sleeps on the task channel with
//! a deadline taken from the core's own pacing, which keeps retransmit
//! timers honest without a busy spin.
//!
//! Dropping the runtime triggers a graceful shutdown of the worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use quanta::{Clock, Instant};
use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::session::{
    ConnectionRegistry, Session, SessionHandle, SessionListener, SessionScheduler, SessionTask,
};
use crate::transport::{seq_diff, OutputSink};

/// Scheduler backed by the worker's task channel. A full or disconnected
/// channel means the worker is gone; the task is dropped.
struct ChannelScheduler {
    tx: Sender<SessionTask>,
}

impl SessionScheduler for ChannelScheduler {
    fn schedule(&self, task: SessionTask) {
        if self.tx.send(task).is_err() {
            trace!("session worker gone, task dropped");
        }
    }
}

/// Millisecond clock with an arbitrary epoch, wrapping at `u32::MAX` the
/// way the wire timestamps do.
struct MonoClock {
    clock: Clock,
    epoch: Instant,
}

impl MonoClock {
    fn new() -> Self {
        let clock = Clock::new();
        let epoch = clock.now();
        MonoClock { clock, epoch }
    }

    fn now_ms(&self) -> u32 {
        self.clock.now().duration_since(self.epoch).as_millis() as u32
    }
}

/// A session and the thread that runs it.
pub struct SessionRuntime {
    handle: SessionHandle,
    task_tx: Sender<SessionTask>,
    shutdown: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SessionRuntime {
    /// Validate `cfg`, build the session and spawn its worker. `sink` is
    /// where outbound datagrams go; feed inbound ones through
    /// [`SessionHandle::input`].
    pub fn spawn(
        cfg: SessionConfig,
        listener: Box<dyn SessionListener>,
        registry: Option<Arc<dyn ConnectionRegistry>>,
        sink: Box<dyn OutputSink>,
    ) -> anyhow::Result<SessionRuntime> {
        cfg.validate().context("invalid session config")?;

        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        let scheduler: Arc<dyn SessionScheduler> = Arc::new(ChannelScheduler {
            tx: task_tx.clone(),
        });

        let clock = MonoClock::new();
        let (session, handle) = Session::new(
            &cfg,
            listener,
            registry,
            scheduler,
            sink,
            clock.now_ms(),
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_worker = Arc::clone(&shutdown);
        let worker = thread::Builder::new()
            .name(format!("rill-session-{}", cfg.conv))
            .spawn(move || worker_loop(session, task_rx, shutdown_worker, clock))
            .context("failed to spawn session worker")?;

        Ok(SessionRuntime {
            handle,
            task_tx,
            shutdown,
            worker: Some(worker),
        })
    }

    /// Producer-side view of the session. Clone freely.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn conv(&self) -> u32 {
        self.handle.conv()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    /// Close the session and join the worker. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.task_tx.send(SessionTask::Close);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    mut session: Session,
    tasks: Receiver<SessionTask>,
    shutdown: Arc<AtomicBool>,
    clock: MonoClock,
) {
    let conv = session.conv();
    session.start(clock.now_ms());

    loop {
        if shutdown.load(Ordering::Relaxed) && !session.is_released() {
            session.internal_close(clock.now_ms());
        }
        if session.is_released() {
            break;
        }

        let now = clock.now_ms();
        let wait = seq_diff(session.next_update(), now).max(0) as u64;
        match tasks.recv_timeout(Duration::from_millis(wait)) {
            Ok(task) => {
                let now = clock.now_ms();
                session.handle_task(task, now);
                // Batch whatever else is already queued before sleeping.
                while let Ok(task) = tasks.try_recv() {
                    session.handle_task(task, clock.now_ms());
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                session.update(clock.now_ms());
            }
            Err(RecvTimeoutError::Disconnected) => {
                session.internal_close(clock.now_ms());
                break;
            }
        }

        // Tick if a task batch ran past the deadline.
        let now = clock.now_ms();
        if !session.is_released() && seq_diff(now, session.next_update()) >= 0 {
            session.update(now);
        }
    }
    debug!(conv, "session worker exited");
}
