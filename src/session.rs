//! # Session orchestration
//!
//! Glue between producer threads and the single-owner ARQ core. Producers
//! talk to a cloneable [`SessionHandle`]; the [`Session`] itself is owned by
//! exactly one execution context (see [`crate::runtime`]) which feeds it
//! tasks and clock ticks.
//!
//! Queue discipline, mirroring the reference orchestration this crate grew
//! from: the write queue is MPSC and unbounded by default (a configured
//! bound makes overflow fatal); the read queue is bounded and overflow
//! drops the payload without killing the session. Each direction carries a
//! single-flight flag so at most one drain task is ever outstanding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::error::TransportError;
use crate::fec::{FecDecoder, FecEncoder, FecWrappingSink};
use crate::stats::{MetricsSnapshot, TransportMetrics};
use crate::transport::{seq_diff, OutputSink, TransportCore};
use crate::wire::{FecHeader, FEC_DATA_OVERHEAD};

// ─── Seams ───────────────────────────────────────────────────────────────────

/// Session lifecycle and data callbacks. Invoked from the owning context,
/// never concurrently.
pub trait SessionListener: Send {
    fn on_connected(&mut self, _conv: u32) {}
    fn on_data(&mut self, conv: u32, payload: Bytes);
    /// Fires exactly once, when the session releases its resources.
    fn on_closed(&mut self, conv: u32);
}

/// Whoever tracks live conversations. Deregistration happens exactly once,
/// during release.
pub trait ConnectionRegistry: Send + Sync {
    fn deregister(&self, conv: u32);
}

/// Hands tasks to the context that owns the [`Session`].
pub trait SessionScheduler: Send + Sync {
    fn schedule(&self, task: SessionTask);
}

/// Work items for the owning context.
#[derive(Debug, Clone)]
pub enum SessionTask {
    /// A datagram arrived from the network.
    Input(Bytes),
    /// The write queue has payloads to drain into the core.
    WriteReady,
    /// The read queue has payloads to hand to the listener.
    ReadReady,
    /// Close the session: final flush, then release.
    Close,
}

// ─── Shared state ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SessionShared {
    conv: u32,
    active: AtomicBool,
    write_pending: AtomicBool,
    read_pending: AtomicBool,
    writable: AtomicBool,
    write_cap: Option<usize>,
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// Cheap-to-clone producer-side view of a session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    write_tx: Sender<Bytes>,
    scheduler: Arc<dyn SessionScheduler>,
    metrics: Arc<TransportMetrics>,
}

impl SessionHandle {
    pub fn conv(&self) -> u32 {
        self.shared.conv
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Send-side writability as of the last core tick. Hysteresis applies:
    /// once this reports `false` it stays `false` until the backlog halves.
    pub fn can_write(&self) -> bool {
        self.is_active() && self.shared.writable.load(Ordering::Relaxed)
    }

    /// Queue a payload for transmission. Any thread may call this; the
    /// payload is fragmented and sent by the owning context.
    pub fn write(&self, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::SessionClosed {
                conv: self.shared.conv,
            });
        }
        match self.write_tx.try_send(payload) {
            Ok(()) => {
                self.notify_write();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                // Bounded queue overflow is unrecoverable backpressure.
                self.scheduler.schedule(SessionTask::Close);
                Err(TransportError::WriteQueueFull {
                    capacity: self.shared.write_cap.unwrap_or(0),
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(TransportError::SessionClosed {
                conv: self.shared.conv,
            }),
        }
    }

    /// Feed a datagram received from the network.
    pub fn input(&self, datagram: Bytes) {
        self.scheduler.schedule(SessionTask::Input(datagram));
    }

    pub fn close(&self) {
        self.scheduler.schedule(SessionTask::Close);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn notify_write(&self) {
        if self
            .shared
            .write_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.scheduler.schedule(SessionTask::WriteReady);
        }
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

pub struct Session {
    core: TransportCore,
    fec_decoder: Option<FecDecoder>,
    fec_flush_on_close: bool,
    stream: bool,
    fast_flush: bool,
    ack_nodelay: bool,
    timeout_ms: u32,

    shared: Arc<SessionShared>,
    write_rx: Receiver<Bytes>,
    read_tx: Sender<Bytes>,
    read_rx: Receiver<Bytes>,
    listener: Box<dyn SessionListener>,
    registry: Option<Arc<dyn ConnectionRegistry>>,
    scheduler: Arc<dyn SessionScheduler>,
    metrics: Arc<TransportMetrics>,

    last_recv: u32,
    next_update: u32,
    released: bool,
}

impl Session {
    /// Wire up a session and its producer handle. `cfg` is assumed valid
    /// (see [`SessionConfig::validate`]); `now` seeds the idle-timeout clock.
    pub fn new(
        cfg: &SessionConfig,
        listener: Box<dyn SessionListener>,
        registry: Option<Arc<dyn ConnectionRegistry>>,
        scheduler: Arc<dyn SessionScheduler>,
        sink: Box<dyn OutputSink>,
        now: u32,
    ) -> (Session, SessionHandle) {
        let metrics = Arc::new(TransportMetrics::default());

        let (sink, fec_decoder) = match &cfg.fec {
            Some(fec) => {
                let encoder = FecEncoder::new(fec, Arc::clone(&metrics));
                let wrapped: Box<dyn OutputSink> = Box::new(FecWrappingSink::new(sink, encoder));
                (wrapped, Some(FecDecoder::new(fec, Arc::clone(&metrics))))
            }
            None => (sink, None),
        };

        let mut core = TransportCore::new(cfg.conv, sink, Arc::clone(&metrics));
        core.configure(cfg);
        if cfg.fec.is_some() {
            core.set_reserved(FEC_DATA_OVERHEAD);
        }

        let (write_tx, write_rx) = match cfg.write_queue_cap {
            Some(cap) => crossbeam_channel::bounded(cap),
            None => crossbeam_channel::unbounded(),
        };
        let (read_tx, read_rx) = crossbeam_channel::bounded(cfg.read_queue_cap);

        let shared = Arc::new(SessionShared {
            conv: cfg.conv,
            active: AtomicBool::new(true),
            write_pending: AtomicBool::new(false),
            read_pending: AtomicBool::new(false),
            writable: AtomicBool::new(true),
            write_cap: cfg.write_queue_cap,
        });

        let handle = SessionHandle {
            shared: Arc::clone(&shared),
            write_tx,
            scheduler: Arc::clone(&scheduler),
            metrics: Arc::clone(&metrics),
        };

        let session = Session {
            core,
            fec_decoder,
            fec_flush_on_close: cfg.fec.map(|f| f.flush_partial_group).unwrap_or(false),
            stream: cfg.stream,
            fast_flush: cfg.fast_flush,
            ack_nodelay: cfg.ack_nodelay,
            timeout_ms: cfg.timeout_ms,
            shared,
            write_rx,
            read_tx,
            read_rx,
            listener,
            registry,
            scheduler,
            metrics,
            last_recv: now,
            next_update: now,
            released: false,
        };
        (session, handle)
    }

    pub fn conv(&self) -> u32 {
        self.shared.conv
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Next timestamp at which the owning context should tick
    /// [`update`](Self::update).
    pub fn next_update(&self) -> u32 {
        self.next_update
    }

    /// Announce the session to its listener. Called once by the owning
    /// context before the first tick.
    pub fn start(&mut self, now: u32) {
        self.last_recv = now;
        self.listener.on_connected(self.shared.conv);
        debug!(conv = self.shared.conv, "session started");
    }

    pub fn handle_task(&mut self, task: SessionTask, now: u32) {
        match task {
            SessionTask::Input(datagram) => self.input(datagram, now),
            SessionTask::WriteReady => self.drain_write(now),
            SessionTask::ReadReady => self.drain_read(),
            SessionTask::Close => self.internal_close(now),
        }
    }

    // ─── Input path ──────────────────────────────────────────────────────────

    /// Process one received datagram. Framing errors are absorbed here:
    /// they are counted and logged, never allowed to take the network loop
    /// down.
    pub fn input(&mut self, datagram: Bytes, now: u32) {
        if self.released {
            return;
        }
        match self.demux(datagram, now) {
            Ok(()) => self.last_recv = now,
            Err(err) => {
                // Rejected datagrams must not keep an idle session alive.
                self.metrics.on_framing_error();
                debug!(conv = self.shared.conv, %err, "datagram rejected");
            }
        }
        self.deliver_received();
        if self.ack_nodelay || self.fast_flush {
            self.next_update = self.core.flush(now);
        } else {
            self.next_update = self.core.check(now);
        }
        self.refresh_writable();
    }

    fn demux(&mut self, mut datagram: Bytes, now: u32) -> Result<(), TransportError> {
        let Some(decoder) = self.fec_decoder.as_mut() else {
            return self.core.input(datagram, true, now);
        };

        let hdr = FecHeader::decode(&mut datagram)?;
        if hdr.is_data() {
            if datagram.len() < 2 {
                return Err(TransportError::TruncatedHeader {
                    got: datagram.len(),
                    need: 2,
                });
            }
            // The shard body keeps its length prefix for the decoder; the
            // core sees only the transport bytes behind it. Padding shards
            // from a partial-group flush carry no transport bytes, and a
            // bad segment must not keep the shard from the decoder.
            let shard_body = datagram.clone();
            let transport = datagram.slice(2..);
            let fed = if transport.is_empty() {
                Ok(())
            } else {
                self.core.input(transport, true, now)
            };
            for recovered in decoder.decode(hdr, shard_body) {
                Self::input_recovered(&mut self.core, recovered, now);
            }
            fed?;
        } else if hdr.is_parity() {
            for recovered in decoder.decode(hdr, datagram) {
                Self::input_recovered(&mut self.core, recovered, now);
            }
        } else {
            warn!(flag = hdr.flag, "unknown shard type, datagram dropped");
            self.metrics.on_framing_error();
        }
        Ok(())
    }

    fn input_recovered(core: &mut TransportCore, datagram: Bytes, now: u32) {
        // Recovered copies never drive flow control.
        if let Err(err) = core.input(datagram, false, now) {
            debug!(%err, "recovered datagram rejected");
        }
    }

    fn deliver_received(&mut self) {
        let mut ready = false;
        if self.stream {
            if let Some(buf) = self.core.merge_recv() {
                self.enqueue_read(buf);
                ready = true;
            }
        } else {
            let mut messages = Vec::new();
            self.core.recv(&mut messages);
            for msg in messages {
                self.enqueue_read(msg);
                ready = true;
            }
        }
        if ready {
            self.notify_read();
        }
    }

    fn enqueue_read(&mut self, payload: Bytes) {
        match self.read_tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(p)) => {
                // Consumer is behind; shedding here keeps the ack clock
                // honest instead of stalling the whole conversation.
                self.metrics.on_read_drop();
                let err = TransportError::ReadQueueFull { size: p.len() };
                warn!(conv = self.shared.conv, %err, "inbound payload dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn notify_read(&self) {
        if self
            .shared
            .read_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.scheduler.schedule(SessionTask::ReadReady);
        }
    }

    // ─── Drain tasks ─────────────────────────────────────────────────────────

    /// Hand queued inbound payloads to the listener.
    pub fn drain_read(&mut self) {
        while let Ok(payload) = self.read_rx.try_recv() {
            trace!(conv = self.shared.conv, len = payload.len(), "deliver");
            self.listener.on_data(self.shared.conv, payload);
        }
        self.shared.read_pending.store(false, Ordering::Release);
        // Re-arm if something slipped in between the drain and the clear.
        if !self.read_rx.is_empty() {
            self.notify_read();
        }
    }

    /// Pull queued outbound payloads into the core and flush.
    pub fn drain_write(&mut self, now: u32) {
        if self.released {
            self.shared.write_pending.store(false, Ordering::Release);
            return;
        }
        self.pull_writes();
        self.shared.write_pending.store(false, Ordering::Release);
        if !self.write_rx.is_empty() {
            // Producer enqueued while we were clearing the flag.
            if self
                .shared
                .write_pending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.scheduler.schedule(SessionTask::WriteReady);
            }
        }
        if self.fast_flush {
            self.next_update = self.core.flush(now);
        } else {
            self.next_update = self.core.check(now);
        }
        self.refresh_writable();
    }

    fn pull_writes(&mut self) {
        while let Ok(payload) = self.write_rx.try_recv() {
            if let Err(err) = self.core.send(payload) {
                // Caller bug (oversized payload); the write is dropped but
                // the session survives.
                warn!(conv = self.shared.conv, %err, "write rejected");
            }
        }
    }

    // ─── Clock ───────────────────────────────────────────────────────────────

    /// Periodic tick: timeouts, dead-link detection, core pacing.
    pub fn update(&mut self, now: u32) -> u32 {
        if self.released {
            return now.wrapping_add(u32::MAX / 2);
        }
        if let Some(err) = self.core.link_failure() {
            warn!(conv = self.shared.conv, %err, "peer unreachable, closing");
            self.internal_close(now);
            return self.next_update;
        }
        if self.timeout_ms > 0 && seq_diff(now, self.last_recv.wrapping_add(self.timeout_ms)) >= 0
        {
            warn!(
                conv = self.shared.conv,
                timeout_ms = self.timeout_ms,
                "idle timeout, closing"
            );
            self.internal_close(now);
            return self.next_update;
        }
        self.next_update = self.core.update(now);
        self.refresh_writable();
        self.next_update
    }

    fn refresh_writable(&self) {
        let prev = self.shared.writable.load(Ordering::Relaxed);
        self.shared
            .writable
            .store(self.core.can_send(prev), Ordering::Relaxed);
    }

    // ─── Close ───────────────────────────────────────────────────────────────

    /// Tear the session down: stop accepting writes, drain what is queued
    /// into one final flush, notify, deregister, release. Safe to call any
    /// number of times; everything past the first is a no-op.
    pub fn internal_close(&mut self, now: u32) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.active.store(false, Ordering::Release);

        // Last chance for queued writes to make the wire.
        self.pull_writes();
        self.core.flush(now);
        if self.fec_flush_on_close {
            self.core.flush_output();
        }

        // Deliver anything already reassembled before announcing the close.
        while let Ok(payload) = self.read_rx.try_recv() {
            self.listener.on_data(self.shared.conv, payload);
        }
        self.listener.on_closed(self.shared.conv);

        if let Some(registry) = self.registry.take() {
            registry.deregister(self.shared.conv);
        }

        // Release queued buffers.
        while self.write_rx.try_recv().is_ok() {}
        while self.read_rx.try_recv().is_ok() {}
        debug!(conv = self.shared.conv, "session released");
    }
}
