//! Readiness bookkeeping as a plain state machine.
//!
//! [`Distribution`] holds one record per connection and the in-flight
//! registry. It never performs I/O: every operation takes the current time,
//! and the readiness values that must be sent to brokers are collected with
//! [`Distribution::take_updates`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use rand::seq::IndexedRandom;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::ConnectionId;
use crate::error::{NsqError, Result};
use crate::protocol::MessageId;

/// Per-connection readiness record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// Readiness the connection should hold.
    pub ready: u64,
    /// Messages delivered and not yet settled.
    pub in_flight: u64,
    /// Failure counter driving backoff.
    pub failures: u32,
    /// Readiness is suppressed until this instant.
    pub backoff_until: Option<Instant>,
    /// Broker-side readiness cap.
    pub max_ready: Option<u64>,
    /// Last readiness handed out for sending.
    announced: Option<u64>,
}

impl ConnectionRecord {
    fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }

    fn clamp(&self, ready: u64) -> u64 {
        self.max_ready.map_or(ready, |max| ready.min(max))
    }
}

/// Read-only view of the distribution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionSnapshot {
    /// Configured budget.
    pub max_in_flight: u64,
    /// Current per-connection share.
    pub ideal: u64,
    /// Records by connection.
    pub connections: BTreeMap<ConnectionId, ConnectionRecord>,
    /// Size of the in-flight registry.
    pub in_flight: usize,
}

impl DistributionSnapshot {
    /// Sum of readiness across connections.
    pub fn total_ready(&self) -> u64 {
        self.connections.values().map(|record| record.ready).sum()
    }

    /// Sum of in-flight counters across connections.
    pub fn total_in_flight(&self) -> u64 {
        self.connections.values().map(|record| record.in_flight).sum()
    }
}

/// Readiness distribution across the connections of one consumer.
///
/// With at least one unit of budget per connection (normal mode) every
/// connection gets `ideal - in_flight`. With fewer units than connections
/// (scarce mode) at most `max_in_flight` connections hold readiness 1 at a
/// time, handed out from a stack of waiting connections and rotated by
/// [`Distribution::rotate`].
#[derive(Debug)]
pub struct Distribution {
    max_in_flight: u64,
    backoff_interval: Option<Duration>,
    ideal: u64,
    records: BTreeMap<ConnectionId, ConnectionRecord>,
    in_flight: HashMap<MessageId, ConnectionId>,
    waiters: Vec<ConnectionId>,
}

impl Distribution {
    /// Create an empty distribution.
    pub fn new(max_in_flight: u64, backoff_interval: Option<Duration>) -> Self {
        Self {
            max_in_flight,
            backoff_interval,
            ideal: 0,
            records: BTreeMap::new(),
            in_flight: HashMap::new(),
            waiters: Vec::new(),
        }
    }

    /// Per-connection share of the budget.
    #[inline]
    pub fn ideal(&self) -> u64 {
        self.ideal
    }

    /// Check if there are fewer budget units than connections.
    #[inline]
    pub fn is_scarce(&self) -> bool {
        !self.records.is_empty() && self.ideal < 1
    }

    /// Number of registered connections.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no connection is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record for `connection`.
    pub fn record(&self, connection: &ConnectionId) -> Option<&ConnectionRecord> {
        self.records.get(connection)
    }

    /// Add a connection and redistribute.
    pub fn add_connection(&mut self, connection: ConnectionId, max_ready: Option<u64>, now: Instant) {
        let record = ConnectionRecord {
            max_ready,
            ..Default::default()
        };
        self.records.insert(connection, record);
        self.redistribute(now);
    }

    /// Remove a connection and its in-flight entries, then redistribute.
    ///
    /// Returns the message IDs that were in flight on it.
    pub fn remove_connection(&mut self, connection: &ConnectionId, now: Instant) -> Result<Vec<MessageId>> {
        if self.records.remove(connection).is_none() {
            return Err(lookup_connection(connection));
        }
        let purged = self.purge_in_flight(connection);
        self.redistribute(now);
        Ok(purged)
    }

    /// Forget broker-side state for a connection that reconnected.
    ///
    /// Clears its in-flight entries and announced readiness, then
    /// redistributes. Returns the purged message IDs.
    pub fn reset_connection(&mut self, connection: &ConnectionId, now: Instant) -> Result<Vec<MessageId>> {
        let record = self
            .records
            .get_mut(connection)
            .ok_or_else(|| lookup_connection(connection))?;
        record.in_flight = 0;
        record.announced = None;
        let purged = self.purge_in_flight(connection);
        self.redistribute(now);
        Ok(purged)
    }

    /// Record a delivered message.
    ///
    /// Fails with [`NsqError::AlreadyInFlight`] when the ID is already
    /// registered and with [`NsqError::LookupFailed`] for an unknown
    /// connection. Readiness is recomputed but not announced.
    pub fn register_message(&mut self, id: MessageId, connection: &ConnectionId, now: Instant) -> Result<()> {
        if self.in_flight.contains_key(&id) {
            return Err(NsqError::AlreadyInFlight(id));
        }
        let record = self
            .records
            .get_mut(connection)
            .ok_or_else(|| lookup_connection(connection))?;
        record.in_flight += 1;
        self.in_flight.insert(id, connection.clone());
        self.calculate_ready(connection, now);
        Ok(())
    }

    /// Remove a settled message and recompute readiness for its connection.
    ///
    /// Returns the connection it was delivered on.
    pub fn unregister_message(&mut self, id: &MessageId, now: Instant) -> Result<ConnectionId> {
        let connection = self
            .in_flight
            .remove(id)
            .ok_or_else(|| NsqError::LookupFailed(format!("message {} is not in flight", id)))?;
        if let Some(record) = self.records.get_mut(&connection) {
            record.in_flight = record.in_flight.saturating_sub(1);
        }
        self.calculate_ready(&connection, now);
        if self.is_scarce() {
            self.grant_next(now);
        }
        Ok(connection)
    }

    /// Connection a message was delivered on.
    pub fn in_flight_lookup(&self, id: &MessageId) -> Result<&ConnectionId> {
        self.in_flight
            .get(id)
            .ok_or_else(|| NsqError::LookupFailed(format!("message {} is not in flight", id)))
    }

    /// Number of registered in-flight messages.
    #[inline]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Count a processing failure on `connection`, starting or extending
    /// its backoff window.
    pub fn failure(&mut self, connection: &ConnectionId, now: Instant) -> Result<()> {
        let Some(interval) = self.backoff_interval else {
            return Ok(());
        };
        let record = self
            .records
            .get_mut(connection)
            .ok_or_else(|| lookup_connection(connection))?;
        record.failures += 1;
        record.backoff_until = Some(now + interval * record.failures);
        debug!(%connection, failures = record.failures, "backing off");
        self.calculate_ready(connection, now);
        Ok(())
    }

    /// Count a processing success on `connection`, shrinking its backoff.
    pub fn success(&mut self, connection: &ConnectionId, now: Instant) -> Result<()> {
        let Some(interval) = self.backoff_interval else {
            return Ok(());
        };
        let record = self
            .records
            .get_mut(connection)
            .ok_or_else(|| lookup_connection(connection))?;
        record.failures = record.failures.saturating_sub(1);
        record.backoff_until = match record.failures {
            0 => None,
            failures => Some(now + interval * failures),
        };
        self.calculate_ready(connection, now);
        Ok(())
    }

    /// Earliest pending backoff expiry.
    pub fn next_backoff_deadline(&self) -> Option<Instant> {
        self.records
            .values()
            .filter_map(|record| record.backoff_until)
            .min()
    }

    /// Release connections whose backoff window has elapsed.
    pub fn expire_backoff(&mut self, now: Instant) {
        let expired: Vec<ConnectionId> = self
            .records
            .iter_mut()
            .filter(|(_, record)| record.backoff_until.is_some_and(|until| until <= now))
            .map(|(connection, record)| {
                record.backoff_until = None;
                connection.clone()
            })
            .collect();
        if expired.is_empty() {
            return;
        }
        if self.is_scarce() {
            while self.ready_holders() < self.max_in_flight && self.grant_next(now) {}
        } else {
            for connection in &expired {
                self.calculate_ready(connection, now);
            }
        }
    }

    /// Move readiness from a random holder to the next waiter.
    ///
    /// Only meaningful in scarce mode; does nothing otherwise.
    pub fn rotate<R: Rng + ?Sized>(&mut self, rng: &mut R, now: Instant) {
        if !self.is_scarce() {
            return;
        }
        let holders: Vec<ConnectionId> = self
            .records
            .iter()
            .filter(|(_, record)| record.ready > 0)
            .map(|(connection, _)| connection.clone())
            .collect();
        match holders.choose(rng) {
            Some(connection) => {
                debug!(%connection, "rotating readiness away");
                if let Some(record) = self.records.get_mut(connection) {
                    record.ready = 0;
                }
            }
            None => warn!("no connection holds readiness to rotate"),
        }
        if !self.grant_next(now) {
            debug!("no connection waiting for readiness");
        }
    }

    /// Recompute `ideal` and reassign readiness for every connection.
    pub fn redistribute(&mut self, now: Instant) {
        self.ideal = match self.records.len() as u64 {
            0 => 0,
            n => self.max_in_flight / n,
        };
        debug!(ideal = self.ideal, connections = self.records.len(), "redistributing");

        if self.is_scarce() {
            for record in self.records.values_mut() {
                record.ready = 0;
            }
            for _ in 0..self.max_in_flight {
                if !self.grant_next(now) {
                    break;
                }
            }
        } else {
            self.waiters.clear();
            let connections: Vec<ConnectionId> = self.records.keys().cloned().collect();
            for connection in &connections {
                self.calculate_ready(connection, now);
            }
        }
    }

    /// Readiness values that changed since they were last taken.
    pub fn take_updates(&mut self) -> Vec<(ConnectionId, u64)> {
        self.records
            .iter_mut()
            .filter(|(_, record)| record.announced != Some(record.ready))
            .map(|(connection, record)| {
                record.announced = Some(record.ready);
                (connection.clone(), record.ready)
            })
            .collect()
    }

    /// Copy the current state.
    pub fn snapshot(&self) -> DistributionSnapshot {
        DistributionSnapshot {
            max_in_flight: self.max_in_flight,
            ideal: self.ideal,
            connections: self.records.clone(),
            in_flight: self.in_flight.len(),
        }
    }

    fn calculate_ready(&mut self, connection: &ConnectionId, now: Instant) {
        let scarce = self.is_scarce();
        let ideal = self.ideal;
        if let Some(record) = self.records.get_mut(connection) {
            record.ready = if scarce || record.in_backoff(now) {
                0
            } else {
                record.clamp(ideal.saturating_sub(record.in_flight))
            };
        }
    }

    fn ready_holders(&self) -> u64 {
        self.records.values().filter(|record| record.ready > 0).count() as u64
    }

    fn is_waiting(&self, connection: &ConnectionId, now: Instant) -> bool {
        self.records.get(connection).is_some_and(|record| {
            record.ready < 1 && record.in_flight < 1 && !record.in_backoff(now)
        })
    }

    /// Give readiness 1 to the next waiting connection.
    ///
    /// The stack is refilled once when it runs dry; entries that stopped
    /// waiting since the refill are skipped.
    fn grant_next(&mut self, now: Instant) -> bool {
        if self.ready_holders() >= self.max_in_flight {
            return false;
        }
        let mut refilled = false;
        loop {
            while let Some(connection) = self.waiters.pop() {
                if self.is_waiting(&connection, now) {
                    if let Some(record) = self.records.get_mut(&connection) {
                        record.ready = record.clamp(1);
                    }
                    return true;
                }
            }
            if refilled {
                return false;
            }
            self.waiters = self
                .records
                .keys()
                .filter(|connection| self.is_waiting(connection, now))
                .cloned()
                .collect();
            refilled = true;
        }
    }

    fn purge_in_flight(&mut self, connection: &ConnectionId) -> Vec<MessageId> {
        let purged: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, owner)| *owner == connection)
            .map(|(id, _)| *id)
            .collect();
        for id in &purged {
            self.in_flight.remove(id);
        }
        purged
    }
}

fn lookup_connection(connection: &ConnectionId) -> NsqError {
    NsqError::LookupFailed(format!("connection {} is not registered", connection))
}
