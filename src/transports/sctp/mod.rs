pub mod arena;
pub mod association;
pub mod chunk;
pub mod control;
pub mod destination;
pub mod fragment;
pub mod output;
pub mod packet;
pub mod prsctp;
pub mod retransmit;
pub mod rto;
pub mod sack;
pub mod stream;
pub mod wheel;

pub use association::{
    AckOutcome, AssocState, Association, AssociationParams, AuthParams, PeerCapabilities, Stats,
};
pub use chunk::NetId;
pub use destination::{Destination, ReachState};
pub use output::SendReason;
pub use packet::{ChannelSink, OutgoingPacket, PacketOptions, PacketSink, RecordingSink, SendStatus};
pub use sack::AckReport;
pub use stream::{AppendMode, PrPolicy, SendOptions};

use crate::config::EngineConfig;
use crate::error::{SctpError, SctpResult};
use association::lock;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// The association plus the sink its packets go to, guarded together.
struct Engine {
    assoc: Association,
    sink: Box<dyn PacketSink>,
}

fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// One send's progress through its message. Dropping it before the whole
/// message is queued settles the unfinished tail.
struct PartialCopy<'a> {
    handle: &'a SctpAssociation,
    sid: u16,
    data: Bytes,
    offset: usize,
    msg_id: Option<u64>,
    /// The first piece created the message rather than extending an open record.
    owned: bool,
    complete: bool,
}

impl<'a> PartialCopy<'a> {
    fn new(handle: &'a SctpAssociation, sid: u16, data: Bytes) -> Self {
        Self {
            handle,
            sid,
            data,
            offset: 0,
            msg_id: None,
            owned: false,
            complete: true,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

impl Drop for PartialCopy<'_> {
    fn drop(&mut self) {
        let Some(msg_id) = self.msg_id else {
            return;
        };
        if self.offset >= self.data.len() {
            return;
        }
        let rest = self.data.slice(self.offset..);
        self.handle
            .cancel_copy(self.sid, msg_id, rest, self.owned, self.complete);
    }
}

/// Shared handle to one association for application tasks.
#[derive(Clone)]
pub struct SctpAssociation {
    engine: Arc<Mutex<Engine>>,
    /// Held by a send for as long as it copies its message in.
    send_gate: Arc<AsyncMutex<()>>,
    /// Signalled whenever send buffer bytes are retired or the association dies.
    space_available: Arc<Notify>,
    /// Wakes the timer loop when deadlines may have moved.
    timers_changed: Arc<Notify>,
}

impl SctpAssociation {
    pub fn new(assoc: Association, sink: Box<dyn PacketSink>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(Engine { assoc, sink })),
            send_gate: Arc::new(AsyncMutex::new(())),
            space_available: Arc::new(Notify::new()),
            timers_changed: Arc::new(Notify::new()),
        }
    }

    pub fn with_association<R>(&self, f: impl FnOnce(&mut Association) -> R) -> R {
        let mut engine = lock(&self.engine);
        f(&mut engine.assoc)
    }

    pub fn buffered_amount(&self) -> usize {
        lock(&self.engine).assoc.buffered_amount()
    }

    pub fn state(&self) -> AssocState {
        lock(&self.engine).assoc.state()
    }

    fn output(engine: &mut Engine, reason: SendReason, now: Instant) -> SctpResult<()> {
        let Engine { assoc, sink } = engine;
        assoc.chunk_output(reason, sink.as_mut(), now)
    }

    fn after_change(&self) {
        self.space_available.notify_waiters();
        self.timers_changed.notify_one();
    }

    /// Queues as much of the rest of `copy` as the buffer takes. False when
    /// nothing could be queued yet.
    fn offer(
        &self,
        copy: &mut PartialCopy<'_>,
        opts: &SendOptions,
        allow_partial: bool,
    ) -> SctpResult<bool> {
        let now = clock();
        let mut engine = lock(&self.engine);
        let remaining = copy.remaining();
        engine.assoc.check_send(copy.sid, remaining, opts)?;

        let config: EngineConfig = engine.assoc.config().clone();
        let ceiling = config.send_buffer_ceiling;
        let used = engine.assoc.buffered_amount();
        if used + remaining > ceiling && config.prsctp_drain {
            let priority = match opts.pr_policy {
                PrPolicy::Buf(p) => p,
                _ => 0,
            };
            if engine.assoc.prune_prsctp(used + remaining - ceiling, priority, now) > 0 {
                self.space_available.notify_waiters();
            }
        }

        let free = ceiling.saturating_sub(engine.assoc.buffered_amount());
        copy.complete = !config.explicit_eor || opts.eor;
        let (taken, mode) = if remaining <= free {
            let mode = AppendMode {
                complete: copy.complete,
                copying: false,
                continues: copy.msg_id,
            };
            (remaining, mode)
        } else if allow_partial
            && remaining > config.add_more_threshold
            && free >= config.add_more_threshold
        {
            let mode = AppendMode {
                complete: false,
                copying: true,
                continues: copy.msg_id,
            };
            (free, mode)
        } else {
            return Ok(false);
        };

        let piece = copy.data.slice(copy.offset..copy.offset + taken);
        if let Some((msg_id, created)) = engine.assoc.append(copy.sid, piece, opts, mode, now)? {
            if copy.msg_id.is_none() {
                copy.owned = created;
            }
            copy.msg_id = Some(msg_id);
        }
        copy.offset += taken;

        if let Err(e) = Self::output(&mut engine, SendReason::UserSend, now) {
            drop(engine);
            self.after_change();
            return Err(e);
        }
        drop(engine);
        self.timers_changed.notify_one();
        Ok(true)
    }

    /// Settles a message whose send was dropped part way through copying.
    fn cancel_copy(&self, sid: u16, msg_id: u64, rest: Bytes, owned: bool, complete: bool) {
        let now = clock();
        {
            let mut engine = lock(&self.engine);
            let freed = engine
                .assoc
                .cancel_partial(sid, msg_id, rest, owned, complete, now);
            debug!(
                "send on stream {} stopped mid-message, {} bytes released",
                sid, freed
            );
            if let Err(e) = Self::output(&mut engine, SendReason::UserSend, now) {
                debug!("output after a stopped send failed: {}", e);
            }
        }
        self.after_change();
    }

    /// Queues a message, waiting for send buffer space. Large messages are
    /// copied in pieces as space frees up; sends on one association are
    /// serialized so pieces of different messages never mix. Dropping the
    /// future part way withdraws or settles the unfinished message.
    pub async fn send(&self, sid: u16, data: Bytes, opts: SendOptions) -> SctpResult<()> {
        let _gate = self.send_gate.lock().await;
        let mut copy = PartialCopy::new(self, sid, data);
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.offer(&mut copy, &opts, true)? {
                if copy.remaining() == 0 {
                    return Ok(());
                }
                continue;
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`send`](Self::send): the whole message is
    /// queued or nothing is. Fails with `WouldBlock` while another send is
    /// still copying.
    pub fn try_send(&self, sid: u16, data: Bytes, opts: SendOptions) -> SctpResult<()> {
        let Ok(_gate) = self.send_gate.try_lock() else {
            return Err(SctpError::WouldBlock);
        };
        let mut copy = PartialCopy::new(self, sid, data);
        if !self.offer(&mut copy, &opts, false)? {
            return Err(SctpError::WouldBlock);
        }
        Ok(())
    }

    /// Feeds a SACK from the reception path and sends whatever it allows.
    pub fn handle_sack(&self, cum_tsn: u32, gaps: &[(u16, u16)], a_rwnd: u32) -> SctpResult<AckOutcome> {
        let now = clock();
        let result = {
            let mut engine = lock(&self.engine);
            let outcome = engine.assoc.mark_acked(cum_tsn, gaps, a_rwnd, now);
            Self::output(&mut engine, SendReason::SackReceived, now).map(|_| outcome)
        };
        self.after_change();
        result
    }

    /// Runs an output pass for control traffic queued through
    /// [`with_association`](Self::with_association).
    pub fn flush(&self, reason: SendReason) -> SctpResult<()> {
        let now = clock();
        let result = Self::output(&mut lock(&self.engine), reason, now);
        self.timers_changed.notify_one();
        result
    }

    pub fn shutdown(&self) -> SctpResult<()> {
        let now = clock();
        let result = {
            let mut engine = lock(&self.engine);
            engine.assoc.shutdown()?;
            Self::output(&mut engine, SendReason::Control, now)
        };
        self.after_change();
        result
    }

    /// Sends ABORT and tears the association down; blocked senders fail.
    pub fn abort(&self, cause: Option<Bytes>) {
        {
            let mut engine = lock(&self.engine);
            let Engine { assoc, sink } = &mut *engine;
            assoc.abort(sink.as_mut(), cause);
        }
        self.after_change();
    }

    /// Drives retransmission timers until the association is aborted.
    pub fn spawn_timer_loop(&self) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.run_timer_loop().await {
                debug!("SCTP timer loop finished: {}", e);
            }
        })
    }

    async fn run_timer_loop(&self) -> anyhow::Result<()> {
        loop {
            let changed = self.timers_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let next = {
                let engine = lock(&self.engine);
                if engine.assoc.state() == AssocState::Aborted {
                    return Ok(());
                }
                engine.assoc.next_timeout()
            };
            let Some((net, deadline)) = next else {
                changed.await;
                continue;
            };

            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                _ = &mut changed => continue,
            }

            let now = clock();
            let result = {
                let mut engine = lock(&self.engine);
                let due = engine
                    .assoc
                    .destination(net)
                    .and_then(|d| d.t3_deadline)
                    .is_some_and(|t| t <= now);
                if !due {
                    continue;
                }
                engine.assoc.t3_expired(net, now);
                Self::output(&mut engine, SendReason::T3Timeout, now)
            };
            if let Err(e) = result {
                if e.is_fatal() {
                    self.after_change();
                    return Err(anyhow::Error::new(e).context("retransmission timer"));
                }
                debug!("T3 output for {:?} failed: {}", net, e);
            }
            self.space_available.notify_waiters();
        }
    }
}
