//! Engine entry points.
//!
//! [`Engine`] owns the channel registry, the instance table, the message
//! budget and the service queue. Consumers get an [`Endpoint`] from
//! [`Engine::open`]; the engine itself can also be driven by channel id.
//!
//! Control requests are handled synchronously. Outbound frames are queued
//! on the sending channel and processed later by the service step
//! ([`Engine::run_pending`] or a [`ServiceWorker`]), which loops them back
//! through fan-out and forwards them to the bridging channel.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::addr::MacAddr;
use crate::budget::Budget;
use crate::channel::{Channel, ChannelFlags, ChannelId, ChannelStatus};
use crate::control::{Counters, EngineConfig, EngineStats};
use crate::distribute::{fan_out, send_to_bridge};
use crate::frame::{EtherHeader, ETHER_HEADER_LEN};
use crate::instance::{InstanceError, InstanceTable};
use crate::negotiate::{self, Step};
use crate::primitive::{DlError, DlState, Ioctl, Request, Upstream};
use crate::registry::{Registry, RegistryError};
use crate::sync::{lock, wait_timeout};

/// How long an idle service worker sleeps before rechecking its stop flag
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Engine errors. Negotiation failures are not errors here; they are
/// delivered to the channel as negative acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

/// Channels with queued outbound frames, in scheduling order
#[derive(Debug, Default)]
struct ServiceQueue {
    pending: Mutex<VecDeque<ChannelId>>,
    ready: Condvar,
}

impl ServiceQueue {
    fn schedule(&self, channel: &Channel) {
        if channel.try_schedule() {
            lock(&self.pending).push_back(channel.id());
            self.ready.notify_one();
        }
    }

    fn pop(&self) -> Option<ChannelId> {
        lock(&self.pending).pop_front()
    }

    fn wait_pop(&self, timeout: Duration) -> Option<ChannelId> {
        let mut pending = lock(&self.pending);
        if pending.is_empty() {
            pending = wait_timeout(&self.ready, pending, timeout).0;
        }
        pending.pop_front()
    }

    fn wake_all(&self) {
        self.ready.notify_all();
    }
}

pub struct Engine {
    config: EngineConfig,
    registry: Registry,
    instances: InstanceTable,
    budget: Arc<Budget>,
    counters: Counters,
    service: ServiceQueue,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let budget = Budget::new(config.message_budget);
        Arc::new(Self {
            config,
            registry: Registry::new(),
            instances: InstanceTable::new(),
            budget,
            counters: Counters::default(),
            service: ServiceQueue::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- instances ----

    /// Create instance `ppa` with a generated address
    pub fn create_instance(&self, ppa: u32) -> Result<MacAddr, EngineError> {
        Ok(self.instances.create(ppa)?.addr())
    }

    pub fn create_instance_with_addr(&self, ppa: u32, addr: MacAddr) -> Result<(), EngineError> {
        self.instances.create_with_addr(ppa, addr)?;
        Ok(())
    }

    /// Destroy instance `ppa`; fails while any channel is attached
    pub fn destroy_instance(&self, ppa: u32) -> Result<(), EngineError> {
        Ok(self.instances.destroy(ppa)?)
    }

    pub fn instance_addr(&self, ppa: u32) -> Option<MacAddr> {
        self.instances.get(ppa).map(|inst| inst.addr())
    }

    /// Bridging channel currently registered on `ppa`
    pub fn bridge_of(&self, ppa: u32) -> Option<ChannelId> {
        self.instances.get(ppa).and_then(|inst| inst.bridge_id())
    }

    /// Drops since the bridge of `ppa` went away
    pub fn link_warnings(&self, ppa: u32) -> Option<u32> {
        self.instances.get(ppa).map(|inst| inst.link_warnings())
    }

    /// Channels attached to `ppa`, in attach order
    pub fn members(&self, ppa: u32) -> Vec<ChannelId> {
        self.instances
            .get(ppa)
            .map(|inst| inst.members().snapshot().iter().map(|ch| ch.id()).collect())
            .unwrap_or_default()
    }

    // ---- channels ----

    /// Open a channel with the lowest free identifier
    pub fn open(self: &Arc<Self>) -> Endpoint {
        let channel = self.registry.allocate(self.config.recv_hiwat);
        debug!("Channel {} opened", channel.id());
        Endpoint {
            engine: Arc::clone(self),
            channel,
            closed: false,
        }
    }

    /// Tear down a channel: leave the bridging slot and the instance, then
    /// wait for every outstanding hold before the identifier is freed.
    pub fn close(&self, id: ChannelId) -> Result<(), EngineError> {
        let hold = self.registry.find_by_id(id)?;
        {
            let mut st = hold.state();
            if let Some(instance) = st.instance() {
                if instance.unregister_bridge(id) {
                    info!("Instance {}: bridge channel {} closed", instance.ppa(), id);
                }
                instance.members().remove(id);
            }
            st.instance = None;
            st.dl_state = DlState::Unattached;
            st.sap = 0;
            st.flags = ChannelFlags::empty();
        }
        let discarded = hold.flush_write();
        if discarded > 0 {
            debug!("Channel {}: discarded {} queued frame(s) on close", id, discarded);
        }
        let channel = Arc::clone(hold.arc());
        drop(hold);

        self.registry.release(id)?;
        channel.flush_read();
        debug!("Channel {} closed", id);
        Ok(())
    }

    pub fn channel_status(&self, id: ChannelId) -> Result<ChannelStatus, EngineError> {
        Ok(self.registry.find_by_id(id)?.status())
    }

    pub fn channel_count(&self) -> usize {
        self.registry.len()
    }

    /// Issue a control request. The outcome arrives on the channel's receive
    /// queue, except for a successful send, which is queued for service.
    pub fn request(&self, id: ChannelId, req: Request) -> Result<(), EngineError> {
        let hold = self.registry.find_by_id(id)?;
        match negotiate::handle(hold.arc(), &self.instances, &self.budget, req) {
            Step::Reply(msg) => hold.put(msg, None),
            Step::Alloc(msg, charge) => hold.put(msg, Some(charge)),
            Step::Dropped(primitive) => {
                warn!(
                    "Channel {}: no message space for {:?} acknowledgment, request dropped",
                    id, primitive
                );
                Counters::bump(&self.counters.acks_dropped);
            }
            Step::Transmit(frame) => {
                hold.push_write(frame);
                self.service.schedule(&hold);
            }
            Step::Inconsistent(primitive) => {
                let state = hold.state().dl_state;
                error!(
                    "Channel {}: {:?} in state {} but no instance link",
                    id, primitive, state
                );
                Counters::bump(&self.counters.invariant_violations);
                hold.put(
                    Upstream::ErrorAck {
                        primitive,
                        error: DlError::SysErr,
                    },
                    None,
                );
            }
        }
        Ok(())
    }

    pub fn ioctl(&self, id: ChannelId, op: Ioctl) -> Result<(), EngineError> {
        let hold = self.registry.find_by_id(id)?;
        let reply = negotiate::ioctl(hold.arc(), op, self.config.bridge_recv_hiwat);
        hold.put(reply, None);
        Ok(())
    }

    /// Write a complete Ethernet frame on a channel. It is serviced like a
    /// send request. Frames from unattached channels and runts are dropped.
    pub fn send_frame(&self, id: ChannelId, frame: Bytes) -> Result<(), EngineError> {
        let hold = self.registry.find_by_id(id)?;
        if frame.len() < ETHER_HEADER_LEN {
            debug!("Channel {}: dropping {}-byte runt write", id, frame.len());
            Counters::bump(&self.counters.runt_dropped);
            return Ok(());
        }
        if hold.state().dl_state == DlState::Unattached {
            warn!("Channel {}: raw write before attach, dropped", id);
            return Ok(());
        }
        hold.push_write(frame);
        self.service.schedule(&hold);
        Ok(())
    }

    /// Fan a frame received on instance `ppa` out to its channels.
    /// Returns the number of copies delivered.
    pub fn receive(&self, ppa: u32, frame: Bytes) -> Result<usize, EngineError> {
        let instance = self
            .instances
            .get(ppa)
            .ok_or(InstanceError::NotFound(ppa))?;
        Ok(fan_out(&instance, &frame, &self.budget, &self.counters))
    }

    // ---- service ----

    /// Drain one channel's write queue. Returns the number of frames
    /// processed by this call.
    ///
    /// Only one call drains a given channel at a time, so frames leave in
    /// the order they were written. A call that finds the channel already
    /// being drained returns 0 and the running drainer picks up its frames.
    pub fn service(&self, id: ChannelId) -> Result<usize, EngineError> {
        let hold = self.registry.find_by_id(id)?;
        if !hold.begin_drain() {
            return Ok(0);
        }

        let mut processed = 0;
        loop {
            hold.take_drain_request();
            hold.clear_scheduled();
            processed += self.drain_writes(&hold);
            if !hold.end_drain() {
                break;
            }
        }
        Ok(processed)
    }

    fn drain_writes(&self, channel: &Channel) -> usize {
        let id = channel.id();
        let mut processed = 0;
        while let Some(frame) = channel.pop_write() {
            let (instance, is_bridge) = {
                let st = channel.state();
                (st.instance(), st.flags.contains(ChannelFlags::SERVICE))
            };
            let Some(instance) = instance else {
                debug!("Channel {}: detached with frames queued, dropping", id);
                continue;
            };
            if let Ok(header) = EtherHeader::parse(&frame) {
                debug!(
                    "Channel {}: {} -> {} type 0x{:04x}, {} bytes",
                    id,
                    header.src,
                    header.dst,
                    header.ethertype,
                    frame.len()
                );
            }

            fan_out(&instance, &frame, &self.budget, &self.counters);
            // frames written by the bridge came from the hub
            if !is_bridge {
                send_to_bridge(&instance, frame, &self.counters);
            }
            processed += 1;
        }
        processed
    }

    /// Service every scheduled channel. Returns the number of frames
    /// processed.
    pub fn run_pending(&self) -> usize {
        let mut processed = 0;
        while let Some(id) = self.service.pop() {
            processed += self.service(id).unwrap_or(0);
        }
        processed
    }

    /// Start a thread that services channels as they are scheduled
    pub fn spawn_service_worker(self: &Arc<Self>) -> std::io::Result<ServiceWorker> {
        let stop = Arc::new(AtomicBool::new(false));
        let engine = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("vnic-service".to_string())
            .spawn(move || {
                debug!("Service worker started");
                while !flag.load(Ordering::Acquire) {
                    if let Some(id) = engine.service.wait_pop(WORKER_IDLE_WAIT) {
                        if let Err(e) = engine.service(id) {
                            debug!("Service of channel {} skipped: {}", id, e);
                        }
                    }
                }
                debug!("Service worker stopped");
            })?;
        Ok(ServiceWorker {
            engine: Arc::clone(self),
            stop,
            handle: Some(handle),
        })
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    /// Bytes currently charged against the message budget
    pub fn budget_used(&self) -> usize {
        self.budget.used()
    }
}

/// Background service thread; stopped and joined on drop
pub struct ServiceWorker {
    engine: Arc<Engine>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ServiceWorker {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.engine.service.wake_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Service worker panicked");
            }
        }
    }
}

impl Drop for ServiceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A consumer's open channel. Closed on drop.
pub struct Endpoint {
    engine: Arc<Engine>,
    channel: Arc<Channel>,
    closed: bool,
}

impl Endpoint {
    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn request(&self, req: Request) -> Result<(), EngineError> {
        self.engine.request(self.id(), req)
    }

    pub fn ioctl(&self, op: Ioctl) -> Result<(), EngineError> {
        self.engine.ioctl(self.id(), op)
    }

    pub fn send_frame(&self, frame: Bytes) -> Result<(), EngineError> {
        self.engine.send_frame(self.id(), frame)
    }

    pub fn try_read(&self) -> Option<Upstream> {
        self.channel.try_read()
    }

    pub fn read_timeout(&self, timeout: Duration) -> Option<Upstream> {
        self.channel.read_timeout(timeout)
    }

    /// Read everything currently queued
    pub fn drain(&self) -> Vec<Upstream> {
        std::iter::from_fn(|| self.channel.try_read()).collect()
    }

    pub fn status(&self) -> ChannelStatus {
        self.channel.status()
    }

    pub fn close(mut self) -> Result<(), EngineError> {
        self.closed = true;
        self.engine.close(self.id())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.engine.close(self.id()) {
                debug!("Channel {}: close on drop: {}", self.id(), e);
            }
        }
    }
}
