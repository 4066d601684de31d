//! Sole writer of the service and backend tables.
//!
//! The connect4 program reads both tables at any instant and never locks, so
//! every multi-entry change is ordered such that the master `count` never
//! covers a slot that is not populated:
//!
//! * scale up: write the new slots, then raise `count`;
//! * scale down: lower `count`, then delete the orphaned slots;
//! * withdraw: delete the master, then its slots.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use svclb_common::{
    Backend4Key, Backend4Value, BackendId, ConnectTuple, Service4Key, Service4Value, Verdict,
    resolve,
};
use tracing::{debug, info, warn};

use crate::metrics::{TableMetrics, TableName, TableOp};
use crate::tables::{BpfMap, BpfState, Tables};
use crate::{Error, Result};

pub type ServiceState<S> = BpfState<S, Service4Key, Service4Value>;
pub type BackendState<B> = BpfState<B, Backend4Key, Backend4Value>;

pub struct TableManager<S, B>
where
    S: BpfMap<Service4Key, Service4Value>,
    B: BpfMap<Backend4Key, Backend4Value>,
{
    services: ServiceState<S>,
    backends: BackendState<B>,
    metrics: TableMetrics,
}

impl<S, B> TableManager<S, B>
where
    S: BpfMap<Service4Key, Service4Value>,
    B: BpfMap<Backend4Key, Backend4Value>,
{
    pub fn new(service_map: S, backend_map: B) -> Self {
        Self {
            services: BpfState::new(service_map),
            backends: BpfState::new(backend_map),
            metrics: TableMetrics::default(),
        }
    }

    /// Picks up entries left in pinned maps by an earlier run.
    pub fn try_from_maps(service_map: S, backend_map: B) -> Result<Self> {
        Ok(Self {
            services: BpfState::try_from_map(service_map)?,
            backends: BpfState::try_from_map(backend_map)?,
            metrics: TableMetrics::default(),
        })
    }

    pub fn with_metrics(mut self, metrics: TableMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Writes one service entry.
    ///
    /// A master record is only accepted once every slot it covers exists; a
    /// slot entry is only accepted once its backend exists.
    pub fn upsert_service(&mut self, key: Service4Key, value: Service4Value) -> Result<()> {
        let checked = if key.is_master() {
            self.check_slots_populated(&key, &value, &HashSet::new())
        } else {
            self.check_backend_exists(value.backend_id)
        };
        if let Err(e) = checked {
            self.metrics.count_failure(TableName::Service, &e);
            return Err(e);
        }

        if let Err(e) = self.services.update(key, value) {
            self.metrics.count_failure(TableName::Service, &e);
            return Err(e);
        }
        self.metrics
            .count_write(TableName::Service, TableOp::Upsert, 1);
        debug!(service = %service_name(&key), slot = key.backend_slot, ?value, "upserted service entry");
        Ok(())
    }

    /// Writes several service entries as one unit: slots first, master records
    /// last. If the map rejects any write, entries already written by this call
    /// are put back to what they were before.
    pub fn batch_upsert_services(
        &mut self,
        keys: &[Service4Key],
        values: &[Service4Value],
    ) -> Result<()> {
        if keys.len() != values.len() {
            let e = Error::BatchLength {
                keys: keys.len(),
                values: values.len(),
            };
            self.metrics.count_failure(TableName::Service, &e);
            return Err(e);
        }

        let (masters, slots): (Vec<_>, Vec<_>) = keys
            .iter()
            .copied()
            .zip(values.iter().copied())
            .partition(|(key, _)| key.is_master());

        let pending: HashSet<Service4Key> = slots.iter().map(|(key, _)| *key).collect();
        let checked = slots
            .iter()
            .try_for_each(|(_, value)| self.check_backend_exists(value.backend_id))
            .and_then(|_| {
                masters
                    .iter()
                    .try_for_each(|(key, value)| self.check_slots_populated(key, value, &pending))
            });
        if let Err(e) = checked {
            self.metrics.count_failure(TableName::Service, &e);
            return Err(e);
        }

        // masters first so a rollback hides the service before touching slots
        let previous: Vec<(Service4Key, Option<Service4Value>)> = masters
            .iter()
            .chain(slots.iter())
            .map(|(key, _)| (*key, self.services.get_from_cache(key).copied()))
            .collect();

        let written = self
            .services
            .batch_update(&slots)
            .and_then(|_| self.services.batch_update(&masters));
        if let Err(e) = written {
            self.metrics.count_failure(TableName::Service, &e);
            self.rollback(&previous);
            return Err(e);
        }

        self.metrics
            .count_write(TableName::Service, TableOp::Upsert, keys.len());
        debug!(entries = keys.len(), "applied service batch");
        Ok(())
    }

    /// Removes a service entry.
    ///
    /// Removing a master withdraws the whole service: the master goes first so
    /// connections fall back to the original destination, then its slots. A
    /// single slot can only be removed once the master no longer covers it.
    pub fn remove_service(&mut self, key: &Service4Key) -> Result<()> {
        if !key.is_master() {
            let master = self.services.get_from_cache(&key.with_slot(0)).copied();
            if let Some(master) = master
                && key.backend_slot < master.count
            {
                let e = Error::SlotInUse {
                    service: service_name(key),
                    slot: key.backend_slot,
                };
                self.metrics.count_failure(TableName::Service, &e);
                return Err(e);
            }
            if self.services.get_from_cache(key).is_some() {
                self.delete_service(key)?;
            }
            return Ok(());
        }

        if self.services.get_from_cache(key).is_none() {
            debug!(service = %service_name(key), "service not registered, nothing to remove");
            return Ok(());
        }
        self.delete_service(key)?;

        let mut slots: Vec<Service4Key> = self
            .services
            .cache()
            .keys()
            .filter(|k| !k.is_master() && same_service(k, key))
            .copied()
            .collect();
        slots.sort_by_key(|k| k.backend_slot);
        for slot in slots {
            self.delete_service(&slot)?;
        }
        info!(service = %service_name(key), "withdrew service");
        Ok(())
    }

    /// Inserts or updates a backend in place. Service slots refer to backends
    /// by id, so moving a backend never touches the service table.
    pub fn upsert_backend(&mut self, key: Backend4Key, value: Backend4Value) -> Result<()> {
        if let Err(e) = self.backends.update(key, value) {
            self.metrics.count_failure(TableName::Backend, &e);
            return Err(e);
        }
        self.metrics
            .count_write(TableName::Backend, TableOp::Upsert, 1);
        debug!(id = key.id, address = %value.ip(), port = value.port(), "upserted backend");
        Ok(())
    }

    /// Removes a backend no service slot refers to any more.
    pub fn remove_backend(&mut self, key: &Backend4Key) -> Result<()> {
        let references = self
            .services
            .cache()
            .iter()
            .filter(|(k, v)| !k.is_master() && v.backend_id == key.id)
            .count();
        if references > 0 {
            let e = Error::BackendInUse {
                id: key.id,
                references,
            };
            self.metrics.count_failure(TableName::Backend, &e);
            return Err(e);
        }
        if self.backends.get_from_cache(key).is_none() {
            return Ok(());
        }
        if let Err(e) = self.backends.delete(key) {
            self.metrics.count_failure(TableName::Backend, &e);
            return Err(e);
        }
        self.metrics
            .count_write(TableName::Backend, TableOp::Delete, 1);
        debug!(id = key.id, "removed backend");
        Ok(())
    }

    /// Points the service at exactly `backend_ids`, growing or shrinking its
    /// slot list in the order the connect4 program can tolerate. An empty list
    /// leaves the service registered with `count == 0`, which fails
    /// connections instead of passing them through.
    pub fn set_backends(
        &mut self,
        address: Ipv4Addr,
        port: u16,
        backend_ids: &[BackendId],
        rev_nat: u16,
    ) -> Result<()> {
        let master_key = Service4Key::master(address, port);
        let new_count = if backend_ids.is_empty() {
            0
        } else {
            u16::try_from(backend_ids.len() + 1).map_err(|e| {
                Error::ConversionError(format!("too many backends for one service: {e}"))
            })?
        };
        // nothing is written unless every slot can be filled
        let checked = backend_ids
            .iter()
            .try_for_each(|id| self.check_backend_exists(*id));
        if let Err(e) = checked {
            self.metrics.count_failure(TableName::Service, &e);
            return Err(e);
        }
        let previous_master = self.services.get_from_cache(&master_key).copied();
        let old_count = previous_master.map_or(0, |v| v.count);

        let mut keys = Vec::with_capacity(backend_ids.len() + 1);
        let mut values = Vec::with_capacity(backend_ids.len() + 1);
        for (idx, id) in backend_ids.iter().enumerate() {
            let slot = u16::try_from(idx + 1)
                .map_err(|e| Error::ConversionError(format!("failed to convert slot: {e}")))?;
            keys.push(master_key.with_slot(slot));
            values.push(Service4Value::slot(*id, rev_nat));
        }
        let master_value = Service4Value::master(new_count, rev_nat);

        if new_count >= old_count {
            keys.push(master_key);
            values.push(master_value);
            self.batch_upsert_services(&keys, &values)?;
        } else {
            self.upsert_service(master_key, master_value)?;
            if let Err(e) = self.batch_upsert_services(&keys, &values) {
                self.rollback(&[(master_key, previous_master)]);
                return Err(e);
            }
            for slot in new_count.max(1)..old_count {
                let key = master_key.with_slot(slot);
                if self.services.get_from_cache(&key).is_some() {
                    self.delete_service(&key)?;
                }
            }
        }

        info!(
            service = %service_name(&master_key),
            old_count,
            new_count,
            "updated service backends"
        );
        Ok(())
    }

    /// Reloads both caches from the maps and publishes their sizes.
    pub fn resync(&mut self) -> Result<()> {
        self.services.resync()?;
        self.backends.resync()?;
        self.metrics
            .set_entries(TableName::Service, self.services.cache().len());
        self.metrics
            .set_entries(TableName::Backend, self.backends.cache().len());
        Ok(())
    }

    /// Deletes slots no master record covers, as left behind by a writer that
    /// stopped between lowering `count` and deleting the tail, or between
    /// writing slots and publishing the master. Only safe while no other
    /// writer is active.
    pub fn prune_stale_slots(&mut self) -> Result<usize> {
        let mut stale: Vec<Service4Key> = self
            .services
            .cache()
            .keys()
            .filter(|key| !key.is_master())
            .filter(|key| {
                self.services
                    .get_from_cache(&key.with_slot(0))
                    .is_none_or(|master| key.backend_slot >= master.count)
            })
            .copied()
            .collect();
        stale.sort_by_key(|key| (key.address, key.port, key.backend_slot));
        for key in &stale {
            self.delete_service(key)?;
            debug!(service = %service_name(key), slot = key.backend_slot, "pruned stale slot");
        }
        Ok(stale.len())
    }

    pub fn services(&self) -> &ahash::HashMap<Service4Key, Service4Value> {
        self.services.cache()
    }

    pub fn backends(&self) -> &ahash::HashMap<Backend4Key, Backend4Value> {
        self.backends.cache()
    }

    /// Read view over the live maps, as the connect4 program sees them.
    pub fn snapshot(&self) -> Tables<'_, S, B> {
        Tables::new(self.services.map(), self.backends.map())
    }

    pub fn resolve(&self, tuple: &ConnectTuple, entropy: u32) -> Verdict {
        resolve(&self.snapshot(), tuple, entropy)
    }

    fn delete_service(&mut self, key: &Service4Key) -> Result<()> {
        if let Err(e) = self.services.delete(key) {
            self.metrics.count_failure(TableName::Service, &e);
            return Err(e);
        }
        self.metrics
            .count_write(TableName::Service, TableOp::Delete, 1);
        Ok(())
    }

    fn rollback(&mut self, previous: &[(Service4Key, Option<Service4Value>)]) {
        for (key, value) in previous {
            // keys the batch never reached may not exist in the map
            if let Err(e) = self.services.restore(*key, *value) {
                warn!(%e, service = %service_name(key), slot = key.backend_slot, "failed to roll back service entry");
            }
        }
        self.metrics
            .count_write(TableName::Service, TableOp::Rollback, previous.len());
    }

    fn check_backend_exists(&self, id: BackendId) -> Result<()> {
        if self.backends.get_from_cache(&Backend4Key { id }).is_none() {
            return Err(Error::BackendNotFound(id));
        }
        Ok(())
    }

    fn check_slots_populated(
        &self,
        key: &Service4Key,
        value: &Service4Value,
        pending: &HashSet<Service4Key>,
    ) -> Result<()> {
        for slot in 1..value.count {
            let slot_key = key.with_slot(slot);
            if self.services.get_from_cache(&slot_key).is_none() && !pending.contains(&slot_key) {
                return Err(Error::SlotsNotPopulated {
                    service: service_name(key),
                    count: value.count,
                    slot,
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn service_name(key: &Service4Key) -> String {
    format!("{}:{}", key.ip(), key.port())
}

fn same_service(a: &Service4Key, b: &Service4Key) -> bool {
    a.address == b.address && a.port == b.port
}
