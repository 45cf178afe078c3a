//! Simulated memory backend
//!
//! A reference [`MemoryBackend`] over a synthetic virtual-address space.
//! It models the pieces of the kernel-mode driver the engine depends on:
//! address-range reservation, a task-count completion model driven by
//! explicit `submit_work`/`complete_up_to` calls, residency bookkeeping,
//! deferred-free coordination, and failure injection.
//!
//! The test suites, the benches, and the stress binary all run against this
//! backend; no GPU is required.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::trace;

use super::record::{
    AllocationId, DeviceAddress, MemoryRecord, MemoryType, OsHandle, ReserveRequest,
};
use super::MemoryBackend;
use crate::error::{PoolResult, UnipoolError};

/// Page granularity of the synthetic address space
const SIM_PAGE_SIZE: u64 = 4096;

/// Guard gap left between reservations so adjacent allocations never touch
const SIM_GUARD_GAP: u64 = SIM_PAGE_SIZE;

/// First address handed out; low addresses stay free so null-ish values
/// never alias a live allocation
const SIM_BASE_VA: u64 = 0x0001_0000_0000;

#[derive(Debug)]
struct SimAllocation {
    record: MemoryRecord,
    /// Task count of the last device work referencing this allocation;
    /// 0 means never used
    last_task: u64,
}

#[derive(Debug, Default)]
struct SimCounters {
    reserves: u64,
    releases: u64,
    make_resident: u64,
    evicts: u64,
    exports: u64,
    waits: u64,
}

#[derive(Debug)]
struct SimState {
    allocations: HashMap<AllocationId, SimAllocation>,
    by_base: BTreeMap<DeviceAddress, AllocationId>,
    next_va: u64,
    device_memory_total: u64,
    device_memory_used: u64,
    resident: HashSet<AllocationId>,
    deferred_free_types: HashSet<MemoryType>,
    fail_next_reserves: u32,
    fail_writes: bool,
    written: HashMap<AllocationId, Vec<(u64, Vec<u8>)>>,
    counters: SimCounters,
}

/// Simulated raw allocator and device-progress collaborator.
#[derive(Debug)]
pub struct SimBackend {
    state: Mutex<SimState>,
    next_task: AtomicU64,
    completed_task: AtomicU64,
}

impl SimBackend {
    /// Create a backend with 1 GiB of simulated device memory.
    pub fn new() -> Self {
        Self::with_device_memory(1024 * 1024 * 1024)
    }

    /// Create a backend with an explicit device memory budget.
    pub fn with_device_memory(bytes: u64) -> Self {
        SimBackend {
            state: Mutex::new(SimState {
                allocations: HashMap::new(),
                by_base: BTreeMap::new(),
                next_va: SIM_BASE_VA,
                device_memory_total: bytes,
                device_memory_used: 0,
                resident: HashSet::new(),
                deferred_free_types: HashSet::new(),
                fail_next_reserves: 0,
                fail_writes: false,
                written: HashMap::new(),
                counters: SimCounters::default(),
            }),
            next_task: AtomicU64::new(0),
            completed_task: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        // A poisoned sim state means a test already panicked; propagating
        // the panic keeps the failure local to that test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- simulation controls -------------------------------------------

    /// Record device work referencing the given allocations and return the
    /// submission's task count. The allocations stay "in use" until
    /// [`complete_up_to`](Self::complete_up_to) passes that count.
    pub fn submit_work(&self, records: &[&MemoryRecord]) -> u64 {
        let task = self.next_task.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.lock();
        for record in records {
            if let Some(alloc) = state.allocations.get_mut(&record.id) {
                alloc.last_task = task;
            }
        }
        task
    }

    /// Mark all device work up to and including `task` as complete.
    pub fn complete_up_to(&self, task: u64) {
        self.completed_task.fetch_max(task, Ordering::SeqCst);
    }

    /// Mark all submitted device work as complete.
    pub fn complete_all(&self) {
        let submitted = self.next_task.load(Ordering::SeqCst);
        self.completed_task.fetch_max(submitted, Ordering::SeqCst);
    }

    /// Make the next `n` reserve calls fail.
    pub fn fail_next_reserves(&self, n: u32) {
        self.lock().fail_next_reserves = n;
    }

    /// Make `write_initial_data` fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Mark a memory type as having pending deferred frees.
    pub fn set_deferred_frees(&self, memory_type: MemoryType, pending: bool) {
        let mut state = self.lock();
        if pending {
            state.deferred_free_types.insert(memory_type);
        } else {
            state.deferred_free_types.remove(&memory_type);
        }
    }

    // ---- inspection ----------------------------------------------------

    /// Number of currently live backing allocations.
    pub fn live_allocations(&self) -> usize {
        self.lock().allocations.len()
    }

    pub fn reserve_calls(&self) -> u64 {
        self.lock().counters.reserves
    }

    pub fn release_calls(&self) -> u64 {
        self.lock().counters.releases
    }

    pub fn make_resident_calls(&self) -> u64 {
        self.lock().counters.make_resident
    }

    pub fn evict_calls(&self) -> u64 {
        self.lock().counters.evicts
    }

    pub fn export_calls(&self) -> u64 {
        self.lock().counters.exports
    }

    pub fn wait_calls(&self) -> u64 {
        self.lock().counters.waits
    }

    pub fn resident_count(&self) -> usize {
        self.lock().resident.len()
    }

    /// Bytes written into an allocation via `write_initial_data`, flattened
    /// in write order.
    pub fn written_data(&self, id: AllocationId) -> Option<Vec<u8>> {
        let state = self.lock();
        state.written.get(&id).map(|chunks| {
            let mut out = Vec::new();
            for (_, data) in chunks {
                out.extend_from_slice(data);
            }
            out
        })
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

impl MemoryBackend for SimBackend {
    fn reserve(&self, request: ReserveRequest) -> PoolResult<MemoryRecord> {
        if request.size == 0 {
            return Err(UnipoolError::ReserveFailed(
                "zero-size reservation".to_string(),
            ));
        }

        let mut state = self.lock();
        state.counters.reserves += 1;

        if state.fail_next_reserves > 0 {
            state.fail_next_reserves -= 1;
            return Err(UnipoolError::ReserveFailed(
                "injected reservation failure".to_string(),
            ));
        }

        if request.memory_type == MemoryType::Device
            && state.device_memory_used + request.size > state.device_memory_total
        {
            return Err(UnipoolError::ReserveFailed(format!(
                "out of device memory: {} used of {}, requested {}",
                state.device_memory_used, state.device_memory_total, request.size
            )));
        }

        let alignment = request.alignment.max(SIM_PAGE_SIZE);
        if !alignment.is_power_of_two() {
            return Err(UnipoolError::ReserveFailed(format!(
                "alignment {} is not a power of two",
                alignment
            )));
        }

        let base = align_up(state.next_va, alignment);
        state.next_va = align_up(base + request.size, SIM_PAGE_SIZE) + SIM_GUARD_GAP;
        if request.memory_type == MemoryType::Device {
            state.device_memory_used += request.size;
        }

        let id = AllocationId::fresh();
        let record = MemoryRecord {
            id,
            alloc_id: id,
            base: DeviceAddress(base),
            size: request.size,
            alignment,
            memory_type: request.memory_type,
            flags: request.flags,
            compression: request.compression,
            imported: false,
            internal: false,
        };

        trace!(id = record.id.0, base = %record.base, size = record.size, "sim reserve");
        state.by_base.insert(record.base, record.id);
        state.allocations.insert(
            record.id,
            SimAllocation {
                record: record.clone(),
                last_task: 0,
            },
        );
        Ok(record)
    }

    fn release(&self, record: MemoryRecord) {
        let mut state = self.lock();
        state.counters.releases += 1;
        if let Some(alloc) = state.allocations.remove(&record.id) {
            state.by_base.remove(&alloc.record.base);
            state.resident.remove(&record.id);
            if alloc.record.memory_type == MemoryType::Device {
                state.device_memory_used =
                    state.device_memory_used.saturating_sub(alloc.record.size);
            }
            trace!(id = record.id.0, base = %record.base, "sim release");
        }
    }

    fn query_record(&self, addr: DeviceAddress) -> Option<MemoryRecord> {
        let state = self.lock();
        let (_, id) = state.by_base.range(..=addr).next_back()?;
        let alloc = state.allocations.get(id)?;
        if alloc.record.contains(addr) {
            Some(alloc.record.clone())
        } else {
            None
        }
    }

    fn make_resident(&self, record: &MemoryRecord) -> PoolResult<()> {
        let mut state = self.lock();
        state.counters.make_resident += 1;
        if !state.allocations.contains_key(&record.id) {
            return Err(UnipoolError::Backend(format!(
                "make_resident on unknown allocation {}",
                record.id
            )));
        }
        state.resident.insert(record.id);
        Ok(())
    }

    fn evict(&self, record: &MemoryRecord) -> PoolResult<()> {
        let mut state = self.lock();
        state.counters.evicts += 1;
        state.resident.remove(&record.id);
        Ok(())
    }

    fn is_completed(&self, record: &MemoryRecord) -> bool {
        let state = self.lock();
        match state.allocations.get(&record.id) {
            Some(alloc) => alloc.last_task <= self.completed_task.load(Ordering::SeqCst),
            // Unknown allocations have no pending work by definition
            None => true,
        }
    }

    fn wait_for_completion(&self, record: &MemoryRecord) {
        let mut state = self.lock();
        state.counters.waits += 1;
        if let Some(alloc) = state.allocations.get_mut(&record.id) {
            alloc.last_task = 0;
        }
    }

    fn available_device_memory(&self) -> u64 {
        let state = self.lock();
        state.device_memory_total - state.device_memory_used
    }

    fn has_deferred_frees(&self, memory_type: MemoryType) -> bool {
        self.lock().deferred_free_types.contains(&memory_type)
    }

    fn write_initial_data(
        &self,
        record: &MemoryRecord,
        offset: u64,
        data: &[u8],
    ) -> PoolResult<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(UnipoolError::Backend(
                "injected write failure".to_string(),
            ));
        }
        if offset + data.len() as u64 > record.size {
            return Err(UnipoolError::Backend(format!(
                "write of {} bytes at offset {} exceeds allocation size {}",
                data.len(),
                offset,
                record.size
            )));
        }
        state
            .written
            .entry(record.id)
            .or_default()
            .push((offset, data.to_vec()));
        Ok(())
    }

    fn export_handle(&self, record: &MemoryRecord) -> PoolResult<OsHandle> {
        let mut state = self.lock();
        if !state.allocations.contains_key(&record.id) {
            return Err(UnipoolError::Backend(format!(
                "export of unknown allocation {}",
                record.id
            )));
        }
        state.counters.exports += 1;
        Ok(OsHandle(0x5000_0000_0000 | record.id.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserve(backend: &SimBackend, size: u64) -> MemoryRecord {
        backend
            .reserve(ReserveRequest::new(size, 0, MemoryType::Device))
            .expect("sim reserve failed")
    }

    #[test]
    fn test_reserve_respects_alignment_and_gaps() {
        let backend = SimBackend::new();
        let a = reserve(&backend, 100);
        let b = reserve(&backend, 100);

        assert_eq!(a.base.0 % SIM_PAGE_SIZE, 0);
        assert_eq!(b.base.0 % SIM_PAGE_SIZE, 0);
        assert!(b.base.0 >= a.base.0 + a.size + SIM_GUARD_GAP);
    }

    #[test]
    fn test_query_record_bridges_interior_addresses() {
        let backend = SimBackend::new();
        let record = reserve(&backend, 4096);

        let found = backend.query_record(record.base.add(100)).unwrap();
        assert_eq!(found.id, record.id);
        assert!(backend.query_record(record.base.add(4096)).is_none());
        assert!(backend.query_record(DeviceAddress(1)).is_none());
    }

    #[test]
    fn test_device_memory_accounting() {
        let backend = SimBackend::with_device_memory(10 * 4096);
        let record = reserve(&backend, 4 * 4096);
        assert_eq!(backend.available_device_memory(), 6 * 4096);

        backend.release(record);
        assert_eq!(backend.available_device_memory(), 10 * 4096);
    }

    #[test]
    fn test_reserve_fails_when_out_of_memory() {
        let backend = SimBackend::with_device_memory(4096);
        let result = backend.reserve(ReserveRequest::new(8192, 0, MemoryType::Device));
        assert!(matches!(result, Err(UnipoolError::ReserveFailed(_))));

        // Host reservations are not bounded by device memory
        let host = backend.reserve(ReserveRequest::new(8192, 0, MemoryType::Host));
        assert!(host.is_ok());
    }

    #[test]
    fn test_injected_reserve_failure() {
        let backend = SimBackend::new();
        backend.fail_next_reserves(1);
        assert!(backend
            .reserve(ReserveRequest::new(4096, 0, MemoryType::Device))
            .is_err());
        assert!(backend
            .reserve(ReserveRequest::new(4096, 0, MemoryType::Device))
            .is_ok());
    }

    #[test]
    fn test_task_completion_model() {
        let backend = SimBackend::new();
        let record = reserve(&backend, 4096);

        // Never used: complete by definition
        assert!(backend.is_completed(&record));

        let task = backend.submit_work(&[&record]);
        assert!(!backend.is_completed(&record));

        backend.complete_up_to(task - 1);
        assert!(!backend.is_completed(&record));

        backend.complete_up_to(task);
        assert!(backend.is_completed(&record));
    }

    #[test]
    fn test_wait_for_completion_clears_in_use() {
        let backend = SimBackend::new();
        let record = reserve(&backend, 4096);
        backend.submit_work(&[&record]);

        assert!(!backend.is_completed(&record));
        backend.wait_for_completion(&record);
        assert!(backend.is_completed(&record));
        assert_eq!(backend.wait_calls(), 1);
    }

    #[test]
    fn test_residency_bookkeeping() {
        let backend = SimBackend::new();
        let record = reserve(&backend, 4096);

        backend.make_resident(&record).unwrap();
        assert_eq!(backend.resident_count(), 1);
        backend.evict(&record).unwrap();
        assert_eq!(backend.resident_count(), 0);
        assert_eq!(backend.make_resident_calls(), 1);
        assert_eq!(backend.evict_calls(), 1);
    }

    #[test]
    fn test_write_initial_data_bounds_and_failure() {
        let backend = SimBackend::new();
        let record = reserve(&backend, 4096);

        backend
            .write_initial_data(&record, 0, &[1, 2, 3])
            .unwrap();
        assert_eq!(backend.written_data(record.id), Some(vec![1, 2, 3]));

        assert!(backend
            .write_initial_data(&record, 4095, &[1, 2])
            .is_err());

        backend.set_fail_writes(true);
        assert!(backend.write_initial_data(&record, 0, &[1]).is_err());
    }

    #[test]
    fn test_export_handle_is_stable() {
        let backend = SimBackend::new();
        let record = reserve(&backend, 4096);

        let h1 = backend.export_handle(&record).unwrap();
        let h2 = backend.export_handle(&record).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(backend.export_calls(), 2);
    }
}
