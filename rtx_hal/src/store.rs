//! The object store segment.
//!
//! ```text
//! [HalData 128][slot table: capacity x {id, off}][arena heap ...]
//! ```
//!
//! Every object lives in the arena and is reached through the slot table,
//! which keeps creation order. Deleting an object tombstones its slot; the
//! table is compacted when it fills up, unless an iteration is running.
//! Structural changes happen under the store mutex ([`HalGuard`]); value
//! cells are atomics and are read and written without it.

use crate::error::{HalError, HalResult};
use crate::object::{HalName, HalObject, ObjectFilter, ObjectFlags, ObjectHeader, ObjectRef, ObjectType, Visit};
use crate::value::ValueCell;
use rtx_common::consts::{DEFAULT_EPSILON, MAX_EPSILON};
use rtx_shared_memory::{
    Heap, HeapHeader, HeapStats, Segment, SegmentKey, SegmentManager, ShmError, ShmMutex,
    ShmMutexGuard, ShmOff, SpinBudget,
};
use std::ptr::addr_of_mut;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Magic of the object store segment.
pub const HAL_MAGIC: u32 = 0x4841_4C21;

/// Layout version of [`HalData`].
pub const HAL_LAYOUT_VERSION: u32 = 1;

const HAL_DATA_SIZE: usize = 128;
const MIN_ARENA: usize = 4096;

/// `HalData::state` once the table and heap are initialised.
const STORE_READY: u32 = 0x5245_4459;
const READY_ATTEMPTS: u32 = 20;
const READY_INTERVAL: Duration = Duration::from_millis(25);

/// Store bookkeeping at the start of the segment data.
#[repr(C, align(64))]
pub struct HalData {
    mutex: ShmMutex,
    next_id: AtomicU32,
    object_count: AtomicU32,
    slot_count: AtomicU32,
    slot_capacity: u32,
    table_off: u32,
    threads_running: AtomicU32,
    iterating: AtomicU32,
    epsilon: [AtomicU64; MAX_EPSILON],
    heap: HeapHeader,
    created_ts: u64,
    state: AtomicU32,
    _reserved: [u8; 12],
}

static_assertions::const_assert_eq!(std::mem::size_of::<HalData>(), HAL_DATA_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ObjectSlot {
    id: u32,
    off: u32,
}

/// Offset of the arena heap for `capacity` slots in `size` data bytes.
fn heap_start(size: usize, capacity: u32) -> HalResult<usize> {
    let start = (HAL_DATA_SIZE + capacity as usize * std::mem::size_of::<ObjectSlot>())
        .next_multiple_of(64);
    if capacity == 0 || start + MIN_ARENA > size {
        return Err(HalError::InvalidArgument(format!(
            "{size} bytes cannot hold {capacity} object slots"
        )));
    }
    Ok(start)
}

/// Marks a running `foreach`; released even if the callback panics.
struct Iteration<'s>(&'s AtomicU32);

impl<'s> Iteration<'s> {
    fn enter(counter: &'s AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for Iteration<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle to an object store.
pub struct HalStore {
    segment: Arc<Segment>,
}

impl HalStore {
    /// Create the object store segment of `instance`.
    pub fn create(
        mgr: &SegmentManager,
        instance: u8,
        size: usize,
        capacity: u32,
    ) -> HalResult<Self> {
        heap_start(size, capacity)?;
        let segment = Arc::new(mgr.create(
            SegmentKey::hal(instance),
            size,
            HAL_MAGIC,
            HAL_LAYOUT_VERSION,
        )?);
        let store = match Self::init(Arc::clone(&segment), capacity) {
            Ok(store) => store,
            Err(e) => {
                if let Err(unlink) = segment.unlink() {
                    warn!("Object store of instance {} left behind: {}", instance, unlink);
                }
                return Err(e);
            }
        };
        info!(
            "Object store of instance {} created ({} bytes, {} slots)",
            instance, size, capacity
        );
        Ok(store)
    }

    /// Attach to the object store of `instance`.
    ///
    /// Waits a short, bounded time for a store that is still being
    /// initialised; fails with [`ShmError::StartupTimeout`] after that.
    pub fn attach(mgr: &SegmentManager, instance: u8) -> HalResult<Self> {
        let key = SegmentKey::hal(instance);
        let segment = mgr.attach(key, HAL_MAGIC, HAL_LAYOUT_VERSION)?;
        if segment.data_size() < HAL_DATA_SIZE {
            return Err(ShmError::InvalidSize {
                size: segment.data_size(),
            }
            .into());
        }
        let store = Self {
            segment: Arc::new(segment),
        };
        for attempt in 0..READY_ATTEMPTS {
            if store.is_ready() {
                debug!("Attached object store of instance {} after {} attempts", instance, attempt + 1);
                return Ok(store);
            }
            std::thread::sleep(READY_INTERVAL);
        }
        Err(ShmError::StartupTimeout {
            name: key.file_name(),
            attempts: READY_ATTEMPTS,
        }
        .into())
    }

    /// Table and heap are initialised.
    pub fn is_ready(&self) -> bool {
        // SAFETY: atomic in the header.
        unsafe { (*self.hd()).state.load(Ordering::Acquire) == STORE_READY }
    }

    /// Process-local store in an anonymous mapping.
    pub fn in_memory(size: usize, capacity: u32) -> HalResult<Self> {
        let segment = SegmentManager::create_anonymous(
            SegmentKey::hal(0),
            size,
            HAL_MAGIC,
            HAL_LAYOUT_VERSION,
        )?;
        Self::init(Arc::new(segment), capacity)
    }

    fn init(segment: Arc<Segment>, capacity: u32) -> HalResult<Self> {
        let table_off = HAL_DATA_SIZE;
        let heap_start = heap_start(segment.data_size(), capacity)?;
        let hd = segment.data_ptr() as *mut HalData;
        // SAFETY: fresh zeroed segment of sufficient size. Attachers ignore
        // it until the state word below is published.
        unsafe {
            (*hd).next_id.store(1, Ordering::Relaxed);
            (*hd).slot_capacity = capacity;
            (*hd).table_off = table_off as u32;
            for eps in &(*hd).epsilon {
                eps.store(DEFAULT_EPSILON.to_bits(), Ordering::Relaxed);
            }
            (*hd).created_ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            Heap::init(
                segment.data_ptr(),
                addr_of_mut!((*hd).heap),
                heap_start as u32,
                segment.data_size() as u32,
            );
            (*hd).state.store(STORE_READY, Ordering::Release);
        }
        Ok(Self { segment })
    }

    /// Underlying segment.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Remove the segment name. Mappings stay valid.
    pub fn unlink(&self) -> HalResult<()> {
        Ok(self.segment.unlink()?)
    }

    fn hd(&self) -> *mut HalData {
        self.segment.data_ptr() as *mut HalData
    }

    fn mutex(&self) -> &ShmMutex {
        // SAFETY: the mutex field is valid for the segment lifetime.
        unsafe { &(*self.hd()).mutex }
    }

    /// Take the store mutex with the non-realtime budget.
    pub fn lock(&self) -> HalResult<HalGuard<'_>> {
        let lock = self.mutex().lock(SpinBudget::USER, "object store")?;
        Ok(HalGuard { store: self, _lock: lock })
    }

    /// Take the store mutex with the realtime budget (never sleeps).
    pub fn try_lock_rt(&self) -> HalResult<HalGuard<'_>> {
        let lock = self.mutex().lock(SpinBudget::RT, "object store")?;
        Ok(HalGuard { store: self, _lock: lock })
    }

    /// Float tolerance at `index`.
    pub fn epsilon(&self, index: u8) -> f64 {
        // SAFETY: atomics in the header.
        let table = unsafe { &(*self.hd()).epsilon };
        table
            .get(index as usize)
            .map(|e| f64::from_bits(e.load(Ordering::Relaxed)))
            .unwrap_or(DEFAULT_EPSILON)
    }

    /// Change the float tolerance at `index`.
    pub fn set_epsilon(&self, index: u8, value: f64) -> HalResult<()> {
        // SAFETY: atomics in the header.
        let table = unsafe { &(*self.hd()).epsilon };
        let slot = table.get(index as usize).ok_or_else(|| {
            HalError::InvalidArgument(format!("epsilon index {index} >= {MAX_EPSILON}"))
        })?;
        if !(value >= 0.0) {
            return Err(HalError::InvalidArgument(format!("epsilon {value} is negative")));
        }
        slot.store(value.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Whether scheduled threads run their functions.
    pub fn threads_running(&self) -> bool {
        // SAFETY: atomic in the header.
        unsafe { (*self.hd()).threads_running.load(Ordering::Acquire) != 0 }
    }

    /// Start or stop function execution on all threads.
    pub fn set_threads_running(&self, running: bool) {
        // SAFETY: atomic in the header.
        unsafe {
            (*self.hd())
                .threads_running
                .store(running as u32, Ordering::Release)
        }
    }

    fn next_id(&self) -> &AtomicU32 {
        // SAFETY: header atomics are valid for the segment lifetime.
        unsafe { &(*self.hd()).next_id }
    }

    fn objects(&self) -> &AtomicU32 {
        // SAFETY: as above.
        unsafe { &(*self.hd()).object_count }
    }

    fn slots_used(&self) -> &AtomicU32 {
        // SAFETY: as above.
        unsafe { &(*self.hd()).slot_count }
    }

    fn iterating(&self) -> &AtomicU32 {
        // SAFETY: as above.
        unsafe { &(*self.hd()).iterating }
    }

    /// Value cell at `off`, usable without the mutex.
    pub(crate) fn cell(&self, off: u32) -> &ValueCell {
        // SAFETY: value offsets handed out by the store point at ValueCells
        // inside live objects.
        unsafe { &*(self.segment.data_ptr().add(off as usize) as *const ValueCell) }
    }

    /// Object at `off`, usable without the mutex for its atomic fields.
    pub(crate) fn object<T: HalObject>(&self, off: u32) -> &T {
        // SAFETY: offsets come from the slot table and point at live objects of T.
        unsafe { &*(self.segment.data_ptr().add(off as usize) as *const T) }
    }
}

/// Exclusive access to the store structure. Releases the mutex on drop.
pub struct HalGuard<'a> {
    store: &'a HalStore,
    _lock: ShmMutexGuard<'a>,
}

impl<'a> HalGuard<'a> {
    /// The store this guard locks.
    pub fn store(&self) -> &'a HalStore {
        self.store
    }

    fn hd(&self) -> *mut HalData {
        self.store.hd()
    }

    fn heap(&self) -> Heap<'_> {
        let hd = self.hd();
        // SAFETY: initialised at creation; the mutex makes this the only view.
        unsafe { Heap::from_raw(self.store.segment.data_ptr(), addr_of_mut!((*hd).heap)) }
    }

    fn slot_count(&self) -> u32 {
        self.store.slots_used().load(Ordering::Relaxed)
    }

    fn slot_ptr(&self, index: u32) -> *mut ObjectSlot {
        // SAFETY: index < capacity, table lies inside the data area.
        unsafe {
            self.store
                .segment
                .data_ptr()
                .add((*self.hd()).table_off as usize)
                .cast::<ObjectSlot>()
                .add(index as usize)
        }
    }

    fn slot(&self, index: u32) -> ObjectSlot {
        // SAFETY: see slot_ptr; slots only change under the mutex.
        unsafe { self.slot_ptr(index).read() }
    }

    fn set_slot(&mut self, index: u32, slot: ObjectSlot) {
        // SAFETY: see slot_ptr.
        unsafe { self.slot_ptr(index).write(slot) }
    }

    /// Header of `r`.
    pub fn header(&self, r: ObjectRef) -> &ObjectHeader {
        self.header_at(r.off)
    }

    fn header_at(&self, off: u32) -> &ObjectHeader {
        // SAFETY: every object starts with an ObjectHeader.
        unsafe { &*(self.store.segment.data_ptr().add(off as usize) as *const ObjectHeader) }
    }

    /// Body of `r` as `T`.
    pub fn get<T: HalObject>(&self, r: ObjectRef) -> &T {
        debug_assert_eq!(r.object_type, T::TYPE);
        self.store.object(r.off)
    }

    /// Live objects.
    pub fn object_count(&self) -> u32 {
        self.store.objects().load(Ordering::Relaxed)
    }

    /// Create an object named `name` of type `T`, owned by `owner_id`.
    pub fn insert<T: HalObject>(
        &mut self,
        name: &str,
        owner_id: u32,
        make: impl FnOnce(ObjectHeader) -> T,
    ) -> HalResult<ObjectRef> {
        let hname = HalName::new(name)?;
        if self.find(T::TYPE, name).is_some() {
            return Err(HalError::AlreadyExists {
                kind: T::TYPE.as_str(),
                name: name.to_string(),
            });
        }
        self.reserve_slot()?;
        let off = self
            .heap()
            .alloc(std::mem::size_of::<T>())
            .map_err(|_| HalError::AllocationExhausted { what: "heap" })?;
        let id = self.store.next_id().fetch_add(1, Ordering::Relaxed);
        let obj = make(ObjectHeader::new(id, T::TYPE, owner_id, hname));
        // SAFETY: off is a fresh allocation of size_of::<T>() bytes, 8-aligned.
        unsafe {
            (self.store.segment.data_ptr().add(off as usize) as *mut T).write(obj);
        }
        let index = self.store.slots_used().fetch_add(1, Ordering::Relaxed);
        self.set_slot(index, ObjectSlot { id, off });
        self.store.objects().fetch_add(1, Ordering::Relaxed);
        Ok(ObjectRef {
            id,
            off,
            object_type: T::TYPE,
        })
    }

    // Make room for one more slot, compacting tombstones when allowed.
    fn reserve_slot(&mut self) -> HalResult<()> {
        // SAFETY: constant after creation.
        let capacity = unsafe { (*self.hd()).slot_capacity };
        let used = self.slot_count();
        if used < capacity {
            return Ok(());
        }
        if self.store.iterating().load(Ordering::Relaxed) != 0
            || self.object_count() == used
        {
            return Err(HalError::AllocationExhausted {
                what: "object table",
            });
        }
        let mut keep = 0;
        for i in 0..used {
            let s = self.slot(i);
            if s.id != 0 {
                self.set_slot(keep, s);
                keep += 1;
            }
        }
        self.store.slots_used().store(keep, Ordering::Relaxed);
        debug!("Compacted object table: {} -> {} slots", used, keep);
        Ok(())
    }

    /// Delete `r` and release its memory.
    pub fn remove(&mut self, r: ObjectRef) -> HalResult<()> {
        let index = (0..self.slot_count())
            .find(|&i| self.slot(i).id == r.id)
            .ok_or_else(|| HalError::InvalidArgument(format!("object id {} not live", r.id)))?;
        if self.slot(index).off != r.off {
            return Err(HalError::InvalidArgument(format!(
                "object id {} is not at offset {}",
                r.id, r.off
            )));
        }
        self.heap().free(r.off)?;
        self.set_slot(index, ObjectSlot { id: 0, off: 0 });
        self.store.objects().fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Object of `ty` named `name`.
    pub fn find(&self, ty: ObjectType, name: &str) -> Option<ObjectRef> {
        (0..self.slot_count())
            .map(|i| self.slot(i))
            .filter(|s| s.id != 0)
            .find(|s| {
                let h = self.header_at(s.off);
                h.object_type == ty as u8 && h.name() == name
            })
            .map(|s| ObjectRef {
                id: s.id,
                off: s.off,
                object_type: ty,
            })
    }

    /// Object of `ty` named `name`, or `NotFound`.
    pub fn lookup(&self, ty: ObjectType, name: &str) -> HalResult<ObjectRef> {
        self.find(ty, name)
            .ok_or_else(|| HalError::not_found(ty.as_str(), name))
    }

    /// Object with `id`.
    pub fn find_by_id(&self, id: u32) -> Option<ObjectRef> {
        if id == 0 {
            return None;
        }
        (0..self.slot_count())
            .map(|i| self.slot(i))
            .find(|s| s.id == id)
            .and_then(|s| {
                Some(ObjectRef {
                    id,
                    off: s.off,
                    object_type: self.header_at(s.off).object_type()?,
                })
            })
    }

    /// Name of the object with `id`, empty if none.
    pub fn name_of(&self, id: u32) -> String {
        self.find_by_id(id)
            .map(|r| self.header(r).name().to_string())
            .unwrap_or_default()
    }

    /// Visit matching objects in creation order until `f` returns [`Visit::Stop`].
    ///
    /// `f` may delete objects, including the visited one. The table is not
    /// compacted while an iteration runs, so inserts may fail when it is full.
    /// Returns the number of objects visited.
    pub fn foreach(
        &mut self,
        filter: &ObjectFilter,
        mut f: impl FnMut(&mut HalGuard<'a>, ObjectRef) -> Visit,
    ) -> usize {
        let store = self.store;
        let _iteration = Iteration::enter(store.iterating());
        let mut visited = 0;
        let mut i = 0;
        while i < self.slot_count() {
            let s = self.slot(i);
            i += 1;
            if s.id == 0 {
                continue;
            }
            let hdr = self.header_at(s.off);
            if !filter.matches(hdr) {
                continue;
            }
            let Some(object_type) = hdr.object_type() else {
                continue;
            };
            visited += 1;
            let r = ObjectRef {
                id: s.id,
                off: s.off,
                object_type,
            };
            if f(self, r) == Visit::Stop {
                break;
            }
        }
        visited
    }

    /// Matching objects in creation order.
    pub fn collect(&mut self, filter: &ObjectFilter) -> Vec<ObjectRef> {
        let mut out = Vec::new();
        self.foreach(filter, |_, r| {
            out.push(r);
            Visit::Continue
        });
        out
    }

    /// Number of matching objects.
    pub fn count(&mut self, filter: &ObjectFilter) -> usize {
        self.foreach(filter, |_, _| Visit::Continue)
    }

    /// Names of matching objects in creation order.
    pub fn names(&mut self, filter: &ObjectFilter) -> Vec<String> {
        self.collect(filter)
            .into_iter()
            .map(|r| self.header(r).name().to_string())
            .collect()
    }

    /// Set the memory ordering hints of `r`.
    pub fn set_flags(&mut self, r: ObjectRef, flags: ObjectFlags) {
        self.header(r).flags.store(flags.bits(), Ordering::Relaxed);
    }

    /// Copy `bytes` into the arena.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> HalResult<ShmOff> {
        let off = self
            .heap()
            .alloc(bytes.len().max(1))
            .map_err(|_| HalError::AllocationExhausted { what: "heap" })?;
        // SAFETY: fresh allocation of at least bytes.len() bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.store.segment.data_ptr().add(off as usize),
                bytes.len(),
            );
        }
        Ok(off)
    }

    /// Raw arena allocation of `size` zeroed bytes.
    pub fn alloc_raw(&mut self, size: usize) -> HalResult<ShmOff> {
        self.heap()
            .alloc(size)
            .map_err(|_| HalError::AllocationExhausted { what: "heap" })
    }

    /// Read `len` bytes at `off`.
    pub fn read_bytes(&self, off: ShmOff, len: usize) -> Vec<u8> {
        // SAFETY: off/len were produced by alloc_bytes.
        unsafe {
            std::slice::from_raw_parts(self.store.segment.data_ptr().add(off as usize), len)
        }
        .to_vec()
    }

    /// Return an arena allocation.
    pub fn free_bytes(&mut self, off: ShmOff) -> HalResult<()> {
        Ok(self.heap().free(off)?)
    }

    /// Arena usage.
    pub fn heap_stats(&self) -> HeapStats {
        self.heap().stats()
    }
}
