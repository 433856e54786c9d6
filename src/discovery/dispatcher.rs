//! Event dispatcher
//!
//! Events run asynchronously with respect to whoever raised them. Each port
//! has two FIFO lanes, each drained by its own task:
//!
//! ```text
//! port N ─┬─ device lane:  Add, Delete            (chained work)
//!         └─ domain lane:  Discover, Revalidate,  (link and host triggers)
//!                          Suspend, Resume
//! ```
//!
//! Keeping device events off the domain lane lets a discovery that is
//! waiting for a port to drain run while the Delete events it waits on
//! make progress. A semaphore bounds how many events execute at once
//! across all lanes. A discovery drains before taking its permit, so any
//! number of ports can wait for their previous occupants at once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::device::Device;
use super::host::HostAdapter;
use super::port::PendingEvents;
use crate::domain::events::DeviceEventKind;
use crate::domain::ports::PortId;
use crate::error::{Error, Result};

/// Port-level events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainEventKind {
    Discover,
    Revalidate,
    Suspend,
    Resume,
}

impl DomainEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainEventKind::Discover => "discover",
            DomainEventKind::Revalidate => "revalidate",
            DomainEventKind::Suspend => "suspend",
            DomainEventKind::Resume => "resume",
        }
    }

    /// The pending bit this event coalesces on, if any.
    pub(crate) fn pending_bit(&self) -> Option<PendingEvents> {
        match self {
            DomainEventKind::Discover => None,
            DomainEventKind::Revalidate => Some(PendingEvents::REVALIDATE),
            DomainEventKind::Suspend => Some(PendingEvents::SUSPEND),
            DomainEventKind::Resume => Some(PendingEvents::RESUME),
        }
    }
}

impl std::fmt::Display for DomainEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of queued work.
pub(crate) enum Event {
    /// Holds a counted reference on the device until it has run
    Device {
        kind: DeviceEventKind,
        device: Arc<Device>,
    },
    Domain {
        kind: DomainEventKind,
        port: PortId,
    },
}

impl Event {
    fn lane(&self) -> Lane {
        match self {
            Event::Device { .. } => Lane::Device,
            Event::Domain { .. } => Lane::Domain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Lane {
    Device,
    Domain,
}

struct DispatchState {
    in_flight: AtomicUsize,
    idle: Notify,
    permits: Semaphore,
}

impl DispatchState {
    fn complete(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Per-port FIFO lanes with bounded concurrency.
pub struct EventDispatcher {
    lanes: DashMap<(PortId, Lane), mpsc::UnboundedSender<Event>>,
    state: Arc<DispatchState>,
    closed: AtomicBool,
    stop: CancellationToken,
}

impl EventDispatcher {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            lanes: DashMap::new(),
            state: Arc::new(DispatchState {
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                permits: Semaphore::new(max_concurrent.max(1)),
            }),
            closed: AtomicBool::new(false),
            stop: CancellationToken::new(),
        }
    }

    /// Queue an event on its port's lane, spawning the lane on first use.
    ///
    /// After shutdown has begun only device events chained from running
    /// work are accepted.
    pub(crate) fn submit(&self, host: &Arc<HostAdapter>, port: PortId, event: Event) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let lane = event.lane();
        if lane == Lane::Domain && self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let sender = self
            .lanes
            .entry((port, lane))
            .or_insert_with(|| self.spawn_lane(host, port, lane))
            .clone();

        self.state.in_flight.fetch_add(1, Ordering::AcqRel);
        if sender.send(event).is_err() {
            self.state.complete();
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn spawn_lane(&self, host: &Arc<HostAdapter>, port: PortId, lane: Lane) -> mpsc::UnboundedSender<Event> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let host = Arc::downgrade(host);
        let state = self.state.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let Some(host) = host.upgrade() else {
                    state.complete();
                    break;
                };
                host.execute(event, &state.permits).await;
                drop(host);
                state.complete();
            }
            debug!(port = %port, lane = ?lane, "event lane stopped");
        });

        tx
    }

    /// Number of queued or running events.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no event is queued or running.
    pub async fn flush(&self) {
        loop {
            let idle = self.state.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Refuse new domain events, drain, then stop every lane.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.flush().await;
        self.stop.cancel();
        self.lanes.clear();
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("lanes", &self.lanes.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

// =============================================================================
// Event Execution
// =============================================================================

impl HostAdapter {
    /// Run one event to completion under an execution permit.
    pub(crate) async fn execute(self: &Arc<Self>, event: Event, permits: &Semaphore) {
        match event {
            Event::Device { kind, device } => {
                self.metrics.record_device_event(kind);
                match permits.acquire().await {
                    Ok(_permit) => match kind {
                        DeviceEventKind::Add => self.add_device(&device).await,
                        DeviceEventKind::Delete => self.del_device(&device).await,
                    },
                    Err(_) => warn!(device = %device.handle(), "event permits closed; dropping event"),
                }
                self.registry.release(&device);
            }
            Event::Domain { kind, port } => {
                self.metrics.record_domain_event(kind.as_str());
                match self.run_domain_event(kind, port, permits).await {
                    Ok(()) => {}
                    Err(e) if e.is_deferral() => debug!(port = %port, event = %kind, "{}", e),
                    Err(e) => warn!(port = %port, event = %kind, error = %e, "domain event failed"),
                }
            }
        }
    }

    async fn run_domain_event(
        self: &Arc<Self>,
        kind: DomainEventKind,
        port: PortId,
        permits: &Semaphore,
    ) -> Result<()> {
        let port_ref = self.port(port)?;
        if kind == DomainEventKind::Discover {
            self.drain_port(&port_ref).await?;
        }

        let _permit = permits.acquire().await.map_err(|_| Error::ShuttingDown)?;
        match kind {
            DomainEventKind::Discover => self.discover_drained(&port_ref).await.map(|_| ()),
            DomainEventKind::Revalidate => self.revalidate_domain(port).await,
            DomainEventKind::Suspend => self.suspend_devices(port).await,
            DomainEventKind::Resume => self.resume_devices(port).await,
        }
    }
}
