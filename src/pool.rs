//! Bounded pool of multiplexed backend connections.
//!
//! The pool keeps at most `max_connections` live connections and lets up to
//! `max_streams_per_connection` logical requests share each one. A single
//! semaphore with `max_connections × max_streams_per_connection` permits
//! bounds total in-flight requests; callers beyond that wait in
//! [`ConnectionPool::acquire`] rather than queueing without limit.
//!
//! Checkout picks the least-loaded healthy connection, opening a new one
//! only when every existing connection is saturated. The returned
//! [`PooledConnection`] releases its stream slot and permit on drop, on
//! every exit path including cancellation. A connection marked broken is
//! evicted when its last user lets go; idle connections above `max_idle`
//! are closed as they become idle.
//!
//! # Locking
//!
//! There is no pool-wide lock. Live connections sit in a [`DashMap`] keyed
//! by slot id, and each slot claims and releases streams with a
//! compare-and-swap on its own counter. A slot is retired by swapping its
//! counter from zero to a sentinel, after which no checkout can claim it.
//!
//! A connection may carry fewer streams than configured; see
//! [`BackendConnection::stream_capacity`].

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::backend::{BackendConnection, BackendError, Connector};
use crate::config::PoolConfig;

/// `in_flight` value of a slot that has left the pool.
const RETIRED: usize = usize::MAX;

/// One live connection and its load.
struct Slot<T> {
    id: u64,
    conn: T,
    in_flight: AtomicUsize,
    broken: AtomicBool,
}

impl<T> Slot<T> {
    fn load(&self) -> usize {
        match self.in_flight.load(Ordering::Acquire) {
            RETIRED => 0,
            n => n,
        }
    }

    fn is_retired(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == RETIRED
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Claim one stream if fewer than `limit` are in use.
    fn try_claim(&self, limit: usize) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Give back one stream; returns the streams still in use.
    fn unclaim(&self) -> usize {
        self.in_flight.fetch_sub(1, Ordering::AcqRel) - 1
    }

    fn try_retire(&self) -> bool {
        self.in_flight
            .compare_exchange(0, RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub connections: usize,
    pub idle: usize,
    pub in_flight: usize,
    /// Connections currently being opened.
    pub opening: usize,
    pub available_permits: usize,
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    max_connections: usize,
    max_idle: usize,
    max_streams: usize,
    permits: Semaphore,
    slots: DashMap<u64, Arc<Slot<C::Conn>>>,
    opening: AtomicUsize,
    changed: Notify,
    next_id: AtomicU64,
}

enum Checkout<T> {
    Ready(Arc<Slot<T>>),
    Open,
    Wait,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: &PoolConfig) -> Self {
        let max_connections = config.max_connections.max(1);
        let max_streams = config.max_streams_per_connection.max(1);
        Self {
            connector,
            max_connections,
            max_idle: config.max_idle.min(max_connections),
            max_streams,
            permits: Semaphore::new(max_connections * max_streams),
            slots: DashMap::new(),
            opening: AtomicUsize::new(0),
            changed: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Check out a connection, opening one if needed.
    ///
    /// Waits while the pool is at capacity. Fails only if opening a new
    /// connection fails.
    pub async fn acquire(&self) -> Result<PooledConnection<'_, C>, BackendError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BackendError::other("connection pool closed"))?;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.checkout() {
                Checkout::Ready(slot) => {
                    return Ok(PooledConnection {
                        pool: self,
                        slot,
                        _permit: permit,
                    })
                }
                Checkout::Open => return self.open(permit).await,
                Checkout::Wait => notified.await,
            }
        }
    }

    fn stream_limit(&self, slot: &Slot<C::Conn>) -> usize {
        slot.conn
            .stream_capacity()
            .map_or(self.max_streams, |c| c.clamp(1, self.max_streams))
    }

    fn checkout(&self) -> Checkout<C::Conn> {
        let mut candidates: Vec<Arc<Slot<C::Conn>>> = self
            .slots
            .iter()
            .filter(|s| !s.is_broken() && !s.is_retired())
            .map(|s| Arc::clone(s.value()))
            .collect();
        candidates.sort_by_key(|s| s.load());

        if let Some(slot) = candidates
            .into_iter()
            .find(|s| s.try_claim(self.stream_limit(s)))
        {
            return Checkout::Ready(slot);
        }

        let reserved = self
            .opening
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |opening| {
                (self.slots.len() + opening < self.max_connections).then_some(opening + 1)
            })
            .is_ok();
        if reserved {
            Checkout::Open
        } else {
            Checkout::Wait
        }
    }

    async fn open<'a>(
        &'a self,
        permit: SemaphorePermit<'a>,
    ) -> Result<PooledConnection<'a, C>, BackendError> {
        let mut reservation = OpenReservation {
            pool: self,
            armed: true,
        };
        let result = self.connector.connect().await;
        reservation.armed = false;

        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                self.opening.fetch_sub(1, Ordering::AcqRel);
                self.changed.notify_waiters();
                warn!(error = %e, "failed to open backend connection");
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            id,
            conn,
            in_flight: AtomicUsize::new(1),
            broken: AtomicBool::new(false),
        });
        // Insert first: `slots.len() + opening` must never undercount.
        self.slots.insert(id, Arc::clone(&slot));
        self.opening.fetch_sub(1, Ordering::AcqRel);
        debug!(id, connections = self.slots.len(), "opened pooled connection");
        self.changed.notify_waiters();

        Ok(PooledConnection {
            pool: self,
            slot,
            _permit: permit,
        })
    }

    fn release(&self, slot: &Slot<C::Conn>) {
        if slot.unclaim() == 0 {
            if slot.is_broken() {
                if slot.try_retire() {
                    self.slots.remove(&slot.id);
                    warn!(id = slot.id, "evicted broken connection");
                }
            } else {
                let idle = self.slots.iter().filter(|s| s.load() == 0).count();
                if idle > self.max_idle && slot.try_retire() {
                    self.slots.remove(&slot.id);
                    debug!(id = slot.id, idle, "closed idle connection above max_idle");
                }
            }
        }
        self.changed.notify_waiters();
    }

    pub fn stats(&self) -> PoolStats {
        let loads: Vec<usize> = self
            .slots
            .iter()
            .filter(|s| !s.is_retired())
            .map(|s| s.load())
            .collect();
        PoolStats {
            connections: loads.len(),
            idle: loads.iter().filter(|l| **l == 0).count(),
            in_flight: loads.iter().sum(),
            opening: self.opening.load(Ordering::Acquire),
            available_permits: self.permits.available_permits(),
        }
    }
}

/// Gives back an `opening` reservation if `open` is cancelled mid-connect.
struct OpenReservation<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    armed: bool,
}

impl<C: Connector> Drop for OpenReservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.opening.fetch_sub(1, Ordering::AcqRel);
            self.pool.changed.notify_waiters();
        }
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PooledConnection<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    slot: Arc<Slot<C::Conn>>,
    _permit: SemaphorePermit<'a>,
}

impl<'a, C: Connector> PooledConnection<'a, C> {
    /// Flag the connection as unusable. It is evicted once every request
    /// sharing it has finished, and receives no new requests meanwhile.
    pub fn mark_broken(&self) {
        if !self.slot.broken.swap(true, Ordering::AcqRel) {
            debug!(id = self.slot.id, "connection marked broken");
        }
    }

    pub fn id(&self) -> u64 {
        self.slot.id
    }
}

impl<'a, C: Connector> Deref for PooledConnection<'a, C> {
    type Target = C::Conn;

    fn deref(&self) -> &Self::Target {
        &self.slot.conn
    }
}

impl<'a, C: Connector> Drop for PooledConnection<'a, C> {
    fn drop(&mut self) {
        self.pool.release(&self.slot);
    }
}
