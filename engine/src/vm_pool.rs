//! Bounded pool of RandomX VMs sharing one epoch's cache/dataset.
//!
//! A VM is bound at creation to a specific cache+dataset pair, so the pool
//! tags its contents with the epoch generation and drains itself whenever a
//! caller arrives with a newer snapshot. Each VM is handed to exactly one
//! consumer at a time; hashing on a VM is never concurrent.

use parking_lot::Mutex;
use randomx_rs::RandomXVM;

use crate::epoch::EpochSnapshot;
use crate::error::PowError;
use crate::flags;

pub struct VmPool {
    slots: Mutex<PoolSlots>,
    capacity: usize,
}

struct PoolSlots {
    vms: Vec<RandomXVM>,
    generation: u64,
}

impl VmPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(PoolSlots {
                vms: Vec::with_capacity(capacity),
                generation: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Pop a pooled VM for the snapshot's epoch, or create a fresh one.
    pub fn get(&self, snapshot: &EpochSnapshot) -> Result<RandomXVM, PowError> {
        {
            let mut slots = self.slots.lock();
            if slots.generation != snapshot.generation {
                // Epoch rotated: pooled VMs reference the old cache.
                slots.vms.clear();
                slots.generation = snapshot.generation;
            } else if let Some(vm) = slots.vms.pop() {
                return Ok(vm);
            }
        }
        create_vm(snapshot)
    }

    /// Return a VM to the pool; dropped if the pool is full or the epoch
    /// rotated while the VM was out.
    pub fn put(&self, vm: RandomXVM, generation: u64) {
        let mut slots = self.slots.lock();
        if slots.generation == generation && slots.vms.len() < self.capacity {
            slots.vms.push(vm);
        }
        // else: vm drops here and the native instance is destroyed
    }

    /// Destroy every pooled VM.
    pub fn close(&self) {
        self.slots.lock().vms.clear();
    }
}

/// Create a VM bound to the snapshot's cache and, when present, dataset.
pub fn create_vm(snapshot: &EpochSnapshot) -> Result<RandomXVM, PowError> {
    let flags = flags::vm_flags(snapshot.dataset.is_some());
    RandomXVM::new(flags, Some(snapshot.cache.clone()), snapshot.dataset.clone())
        .map_err(|e| PowError::VmCreateFailed(e.to_string()))
}
