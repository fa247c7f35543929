//! The advertised device pool.
//!
//! Devices here are opaque capacity units, not hardware: a pool entry exists
//! so the kubelet has an id to hand back in an `Allocate` call. Ids are
//! minted as UUIDs and every entry is always healthy.

use std::collections::BTreeSet;
use std::sync::Mutex;

use kubelet_pb::device_plugin::Device;
use kubelet_pb::HEALTHY;
use uuid::Uuid;

fn mint_device() -> Device {
    Device {
        id: Uuid::new_v4().to_string(),
        health: HEALTHY.to_string(),
        topology: None,
    }
}

/// Ordered set of advertised devices behind a single lock, owned by exactly
/// one plugin instance. Readers take snapshot copies; writers extend or
/// replace the contents wholesale. The lock is never held across an await.
///
/// `spare_capacity` is how many freshly minted, never-assigned devices each
/// replenish or rebuild appends, so the next allocation always finds free
/// capacity. A zero is clamped to one; the pool must never advertise empty
/// once seeded.
#[derive(Debug)]
pub struct DevicePool {
    devices: Mutex<Vec<Device>>,
    spare_capacity: usize,
}

impl DevicePool {
    pub fn new(spare_capacity: usize) -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            spare_capacity: spare_capacity.max(1),
        }
    }

    /// Number of devices currently advertised.
    pub fn len(&self) -> usize {
        self.devices.lock().expect("device pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current pool, in advertisement order.
    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.lock().expect("device pool lock").clone()
    }

    /// Append `spare_capacity` freshly minted devices and return their ids.
    /// Used to seed the pool at start and to replace capacity consumed by an
    /// allocation.
    pub fn replenish(&self) -> Vec<String> {
        let spares: Vec<Device> = (0..self.spare_capacity).map(|_| mint_device()).collect();
        let minted: Vec<String> = spares.iter().map(|device| device.id.clone()).collect();
        self.devices
            .lock()
            .expect("device pool lock")
            .extend(spares);
        minted
    }

    /// Replace the pool wholesale: one healthy device per assigned id, in
    /// sorted order, with `spare_capacity` fresh spares appended. Returns
    /// the minted spare ids.
    pub fn rebuild(&self, assigned: BTreeSet<String>) -> Vec<String> {
        let mut next: Vec<Device> = assigned
            .into_iter()
            .map(|id| Device {
                id,
                health: HEALTHY.to_string(),
                topology: None,
            })
            .collect();
        let spares: Vec<Device> = (0..self.spare_capacity).map(|_| mint_device()).collect();
        let minted: Vec<String> = spares.iter().map(|device| device.id.clone()).collect();
        next.extend(spares);
        *self.devices.lock().expect("device pool lock") = next;
        minted
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use similar_asserts::assert_eq;

    use super::*;

    fn ids(pool: &DevicePool) -> Vec<String> {
        pool.snapshot().into_iter().map(|d| d.id).collect()
    }

    #[test]
    fn test_new_pool_is_empty() {
        let pool = DevicePool::new(1);
        assert!(pool.is_empty(), "a fresh pool should advertise nothing");
    }

    #[test]
    fn test_replenish_appends_spare_capacity() {
        let pool = DevicePool::new(2);
        let minted = pool.replenish();
        assert_eq!(minted.len(), 2, "replenish should mint spare_capacity ids");
        assert_eq!(pool.len(), 2);

        pool.replenish();
        assert_eq!(pool.len(), 4, "replenish should append, not replace");
    }

    #[test]
    fn test_zero_spare_capacity_is_clamped() {
        let pool = DevicePool::new(0);
        pool.replenish();
        assert_eq!(
            pool.len(),
            1,
            "a zero spare capacity must still keep the pool non-empty"
        );
    }

    #[test]
    fn test_minted_devices_are_healthy_and_unique() {
        let pool = DevicePool::new(3);
        pool.replenish();
        pool.replenish();

        let snapshot = pool.snapshot();
        assert!(
            snapshot.iter().all(|d| d.health == HEALTHY),
            "every advertised device should be healthy"
        );
        let unique: HashSet<&str> = snapshot.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            unique.len(),
            snapshot.len(),
            "advertised ids must be unique within a snapshot"
        );
    }

    #[test]
    fn test_rebuild_replaces_pool_with_assigned_plus_spares() {
        let pool = DevicePool::new(1);
        pool.replenish();
        let before = ids(&pool);

        let assigned = BTreeSet::from(["b".to_string(), "a".to_string()]);
        let minted = pool.rebuild(assigned);

        let after = ids(&pool);
        assert_eq!(after.len(), 3, "two assigned ids plus one spare");
        assert_eq!(
            &after[..2],
            ["a", "b"],
            "assigned ids should lead the pool in sorted order"
        );
        assert_eq!(after[2], minted[0], "the spare should trail the pool");
        assert!(
            !after.contains(&before[0]),
            "rebuild should discard previously advertised spares"
        );
    }

    #[test]
    fn test_rebuild_with_no_assignments_keeps_spares_only() {
        let pool = DevicePool::new(2);
        pool.replenish();
        pool.replenish();
        assert_eq!(pool.len(), 4);

        pool.rebuild(BTreeSet::new());
        assert_eq!(
            pool.len(),
            2,
            "with nothing assigned the pool shrinks back to its spares"
        );
    }

    #[test]
    fn test_rebuild_is_stable_for_same_assignments() {
        let pool = DevicePool::new(1);
        let assigned = BTreeSet::from(["x".to_string(), "y".to_string()]);

        pool.rebuild(assigned.clone());
        let first: Vec<String> = ids(&pool).into_iter().take(2).collect();
        pool.rebuild(assigned);
        let second: Vec<String> = ids(&pool).into_iter().take(2).collect();

        assert_eq!(
            first, second,
            "the assigned prefix should be identical across rebuilds"
        );
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let pool = DevicePool::new(1);
        pool.replenish();

        let mut snapshot = pool.snapshot();
        snapshot.clear();
        assert_eq!(pool.len(), 1, "mutating a snapshot must not touch the pool");
    }
}
