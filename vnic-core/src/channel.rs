//! Per-consumer channel state.
//!
//! A [`Channel`] carries its negotiation state, a receive queue of upstream
//! messages with a byte high-water mark, and a write queue of frames waiting
//! for the service step. Lifetime across blocking or list-walking operations
//! is extended with a [`ChannelHold`]; teardown waits until every hold has
//! been dropped.

use bitflags::bitflags;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::budget::Charge;
use crate::instance::Instance;
use crate::primitive::{DlState, Upstream};
use crate::sync::{lock, wait, wait_timeout};

/// Channel identifier: the lowest unused value at open time
pub type ChannelId = usize;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChannelFlags: u8 {
        /// Receives every frame when bound to key 0
        const PROMISC = 0b0000_0001;
        /// Receives exact frames instead of unit-data indications
        const RAW = 0b0000_0010;
        /// Registered bridging channel
        const SERVICE = 0b0000_0100;
    }
}

impl fmt::Display for ChannelFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        bitflags::parser::to_writer(self, f)
    }
}

/// Negotiation state guarded by the channel lock
#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    pub(crate) dl_state: DlState,
    pub(crate) sap: u16,
    pub(crate) flags: ChannelFlags,
    /// Non-owning link to the attached instance
    pub(crate) instance: Option<Weak<Instance>>,
}

impl ChannelState {
    pub(crate) fn instance(&self) -> Option<Arc<Instance>> {
        self.instance.as_ref().and_then(Weak::upgrade)
    }
}

/// Point-in-time view of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub id: ChannelId,
    pub state: DlState,
    pub sap: u16,
    pub flags: ChannelFlags,
    pub ppa: Option<u32>,
    pub queued_bytes: usize,
    pub recv_hiwat: usize,
}

struct Queued {
    msg: Upstream,
    _charge: Option<Charge>,
}

struct ReadQueue {
    items: VecDeque<Queued>,
    bytes: usize,
    hiwat: usize,
    /// Mark restored when the channel stops bridging
    default_hiwat: usize,
}

pub struct Channel {
    id: ChannelId,
    pub(crate) state: Mutex<ChannelState>,

    holds: Mutex<usize>,
    drained: Condvar,
    closing: AtomicBool,

    read: Mutex<ReadQueue>,
    readable: Condvar,

    write: Mutex<VecDeque<Bytes>>,
    scheduled: AtomicBool,
    /// Held by the one service call currently draining the write queue
    draining: AtomicBool,
    /// Set by every service call; the drainer makes another pass if it is
    /// set when it lets go
    drain_requested: AtomicBool,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, recv_hiwat: usize) -> Self {
        Self {
            id,
            state: Mutex::new(ChannelState::default()),
            holds: Mutex::new(0),
            drained: Condvar::new(),
            closing: AtomicBool::new(false),
            read: Mutex::new(ReadQueue {
                items: VecDeque::new(),
                bytes: 0,
                hiwat: recv_hiwat,
                default_hiwat: recv_hiwat,
            }),
            readable: Condvar::new(),
            write: Mutex::new(VecDeque::new()),
            scheduled: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            drain_requested: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ChannelState> {
        lock(&self.state)
    }

    pub fn status(&self) -> ChannelStatus {
        let (state, sap, flags, ppa) = {
            let st = self.state();
            (st.dl_state, st.sap, st.flags, st.instance().map(|inst| inst.ppa()))
        };
        let q = lock(&self.read);
        ChannelStatus {
            id: self.id,
            state,
            sap,
            flags,
            ppa,
            queued_bytes: q.bytes,
            recv_hiwat: q.hiwat,
        }
    }

    /// Extend this channel's lifetime. Refused once teardown has started.
    pub(crate) fn hold(self: &Arc<Self>) -> Option<ChannelHold> {
        let mut holds = lock(&self.holds);
        if self.closing.load(Ordering::Acquire) {
            return None;
        }
        *holds += 1;
        Some(ChannelHold {
            channel: Arc::clone(self),
        })
    }

    /// Outstanding holds on this channel
    pub fn hold_count(&self) -> usize {
        *lock(&self.holds)
    }

    /// Mark the channel as closing. Returns false if it already was.
    pub(crate) fn begin_close(&self) -> bool {
        let _holds = lock(&self.holds);
        !self.closing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Block until every outstanding hold has been released
    pub(crate) fn wait_drained(&self) {
        let mut holds = lock(&self.holds);
        while *holds > 0 {
            holds = wait(&self.drained, holds);
        }
    }

    fn release_hold(&self) {
        let mut holds = lock(&self.holds);
        *holds = holds.saturating_sub(1);
        if *holds == 0 {
            self.drained.notify_all();
        }
    }

    // ---- receive side ----

    /// Whether the receive queue accepts more data
    pub fn can_put(&self) -> bool {
        let q = lock(&self.read);
        q.bytes < q.hiwat
    }

    /// Queue a message for the consumer. Flow control is the caller's job
    /// (see [`Channel::can_put`]); acknowledgments always go through.
    pub(crate) fn put(&self, msg: Upstream, charge: Option<Charge>) {
        let mut q = lock(&self.read);
        q.bytes += msg.len();
        q.items.push_back(Queued {
            msg,
            _charge: charge,
        });
        self.readable.notify_one();
    }

    pub(crate) fn set_recv_hiwat(&self, hiwat: usize) {
        lock(&self.read).hiwat = hiwat;
    }

    /// Back to the mark the channel was opened with
    pub(crate) fn reset_recv_hiwat(&self) {
        let mut q = lock(&self.read);
        q.hiwat = q.default_hiwat;
    }

    pub fn recv_hiwat(&self) -> usize {
        lock(&self.read).hiwat
    }

    pub fn try_read(&self) -> Option<Upstream> {
        let mut q = lock(&self.read);
        Self::pop(&mut q)
    }

    /// Wait up to `timeout` for the next message
    pub fn read_timeout(&self, timeout: Duration) -> Option<Upstream> {
        let deadline = Instant::now() + timeout;
        let mut q = lock(&self.read);
        loop {
            if let Some(msg) = Self::pop(&mut q) {
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = wait_timeout(&self.readable, q, deadline - now);
            q = guard;
        }
    }

    fn pop(q: &mut ReadQueue) -> Option<Upstream> {
        let Queued { msg, _charge } = q.items.pop_front()?;
        q.bytes = q.bytes.saturating_sub(msg.len());
        Some(msg)
    }

    /// Drop everything still queued toward the consumer
    pub(crate) fn flush_read(&self) {
        let mut q = lock(&self.read);
        q.items.clear();
        q.bytes = 0;
    }

    // ---- write side ----

    pub(crate) fn push_write(&self, frame: Bytes) {
        lock(&self.write).push_back(frame);
    }

    pub(crate) fn pop_write(&self) -> Option<Bytes> {
        lock(&self.write).pop_front()
    }

    pub(crate) fn flush_write(&self) -> usize {
        let mut q = lock(&self.write);
        let n = q.len();
        q.clear();
        n
    }

    /// Mark the channel as scheduled for service. Returns false if it
    /// already was.
    pub(crate) fn try_schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    /// Ask for the write queue to be drained and try to become the drainer.
    ///
    /// Returns false when another call is draining; that call sees the
    /// request and makes one more pass before it lets go.
    pub(crate) fn begin_drain(&self) -> bool {
        self.drain_requested.store(true, Ordering::SeqCst);
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Consume the pending drain request at the start of a pass
    pub(crate) fn take_drain_request(&self) -> bool {
        self.drain_requested.swap(false, Ordering::SeqCst)
    }

    /// Let go of the drain. Returns true if a request arrived during the
    /// last pass and the drain was taken back for another one.
    pub(crate) fn end_drain(&self) -> bool {
        self.draining.store(false, Ordering::SeqCst);
        self.drain_requested.load(Ordering::SeqCst)
            && self
                .draining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}

/// Counted reference to a live channel
pub struct ChannelHold {
    channel: Arc<Channel>,
}

impl ChannelHold {
    pub(crate) fn arc(&self) -> &Arc<Channel> {
        &self.channel
    }
}

impl Deref for ChannelHold {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for ChannelHold {
    fn drop(&mut self) {
        self.channel.release_hold();
    }
}

impl fmt::Debug for ChannelHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelHold").field(&self.channel.id).finish()
    }
}
