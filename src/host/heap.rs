//! Mark-and-sweep object heap for the reference host.
//!
//! Objects live in fixed-size chunks of slots. A slot carries a generation
//! counter so stale ids (weak references to collected objects) are detected
//! instead of aliasing whatever reused the slot. Collection marks from an
//! explicit root set and hands swept objects back to the caller, which runs
//! their finalizers once no heap borrow is held.

// ============================================================================
// ChunkBitmask - 256-bit mark set for one chunk
// ============================================================================

const CHUNK_CAPACITY: usize = 256;
const WORDS: usize = CHUNK_CAPACITY / 64;

#[derive(Clone, Copy, Default)]
struct ChunkBitmask {
    bits: [u64; WORDS],
}

impl ChunkBitmask {
    #[inline]
    fn set(&mut self, index: usize) {
        if let Some(word) = self.bits.get_mut(index >> 6) {
            *word |= 1 << (index & 63);
        }
    }

    #[inline]
    fn get(&self, index: usize) -> bool {
        self.bits
            .get(index >> 6)
            .is_some_and(|word| word & (1 << (index & 63)) != 0)
    }

    #[inline]
    fn clear(&mut self) {
        self.bits = [0; WORDS];
    }

    /// Indices below `len` whose bit is clear.
    fn iter_unmarked(&self, len: usize) -> impl Iterator<Item = usize> + '_ {
        UnmarkedIter {
            bitmask: self,
            len,
            current_word: 0,
            current_bits: !self.bits.first().copied().unwrap_or(u64::MAX),
            base_index: 0,
        }
    }
}

struct UnmarkedIter<'a> {
    bitmask: &'a ChunkBitmask,
    len: usize,
    current_word: usize,
    // Inverted bits (1 = unmarked)
    current_bits: u64,
    base_index: usize,
}

impl Iterator for UnmarkedIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current_bits != 0 {
                let index = self.base_index + self.current_bits.trailing_zeros() as usize;
                self.current_bits &= self.current_bits - 1;
                if index < self.len {
                    return Some(index);
                }
            }

            self.current_word += 1;
            self.base_index = self.current_word << 6;
            if self.current_word >= WORDS || self.base_index >= self.len {
                return None;
            }
            self.current_bits = !self.bitmask.bits.get(self.current_word).copied()?;
        }
    }
}

// ============================================================================
// Object ids and tracing
// ============================================================================

/// Generation-checked slot address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    fn index(self) -> usize {
        self.index as usize
    }
}

/// Heap objects report the objects they point at.
pub(crate) trait Traceable {
    fn trace(&self, visitor: &mut dyn FnMut(ObjectId));
}

struct Slot<T> {
    generation: u32,
    data: Option<T>,
}

// ============================================================================
// Heap
// ============================================================================

/// Statistics about the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct GcStats {
    /// Total number of slots (including pooled)
    pub total_objects: usize,
    /// Slots on the free list, available for reuse
    pub pooled_objects: usize,
    pub live_objects: usize,
}

pub(crate) struct Heap<T: Traceable> {
    chunks: Vec<Vec<Slot<T>>>,
    marked_chunks: Vec<ChunkBitmask>,
    free_list: Vec<usize>,
    // Persistent mark stack, keeps its capacity between cycles
    mark_stack: Vec<ObjectId>,
    net_allocs: usize,
    gc_threshold: usize,
}

impl<T: Traceable> Heap<T> {
    /// `gc_threshold` of 0 disables automatic collection.
    pub(crate) fn new(gc_threshold: usize) -> Self {
        Self {
            chunks: Vec::new(),
            marked_chunks: Vec::new(),
            free_list: Vec::new(),
            mark_stack: Vec::new(),
            net_allocs: 0,
            gc_threshold,
        }
    }

    fn slot(&self, index: usize) -> Option<&Slot<T>> {
        self.chunks
            .get(index / CHUNK_CAPACITY)?
            .get(index % CHUNK_CAPACITY)
    }

    fn slot_mut(&mut self, index: usize) -> Option<&mut Slot<T>> {
        self.chunks
            .get_mut(index / CHUNK_CAPACITY)?
            .get_mut(index % CHUNK_CAPACITY)
    }

    pub(crate) fn alloc(&mut self, data: T) -> ObjectId {
        self.net_allocs += 1;

        while let Some(index) = self.free_list.pop() {
            if let Some(slot) = self.slot_mut(index) {
                slot.generation = slot.generation.wrapping_add(1);
                slot.data = Some(data);
                return ObjectId {
                    index: index as u32,
                    generation: slot.generation,
                };
            }
        }

        if self.chunks.last().is_none_or(|chunk| chunk.len() >= CHUNK_CAPACITY) {
            self.chunks.push(Vec::with_capacity(CHUNK_CAPACITY));
            self.marked_chunks.push(ChunkBitmask::default());
        }
        let chunk_index = self.chunks.len() - 1;
        let mut id = ObjectId {
            index: 0,
            generation: 0,
        };
        if let Some(chunk) = self.chunks.last_mut() {
            id.index = (chunk_index * CHUNK_CAPACITY + chunk.len()) as u32;
            chunk.push(Slot {
                generation: 0,
                data: Some(data),
            });
        }
        id
    }

    pub(crate) fn get(&self, id: ObjectId) -> Option<&T> {
        self.slot(id.index())
            .filter(|slot| slot.generation == id.generation)?
            .data
            .as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Option<&mut T> {
        self.slot_mut(id.index())
            .filter(|slot| slot.generation == id.generation)?
            .data
            .as_mut()
    }

    pub(crate) fn is_alive(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn should_collect(&self) -> bool {
        self.gc_threshold > 0 && self.net_allocs >= self.gc_threshold
    }

    pub(crate) fn set_gc_threshold(&mut self, threshold: usize) {
        self.gc_threshold = threshold;
    }

    /// Mark from `roots`, sweep everything unreachable and return it.
    pub(crate) fn collect(&mut self, roots: impl IntoIterator<Item = ObjectId>) -> Vec<T> {
        self.mark(roots);
        let swept = self.sweep();
        self.net_allocs = 0;
        swept
    }

    fn mark(&mut self, roots: impl IntoIterator<Item = ObjectId>) {
        for bitmask in &mut self.marked_chunks {
            bitmask.clear();
        }

        let mut stack = std::mem::take(&mut self.mark_stack);
        stack.clear();
        stack.extend(roots);

        while let Some(id) = stack.pop() {
            let chunk_idx = id.index() / CHUNK_CAPACITY;
            let index_in_chunk = id.index() % CHUNK_CAPACITY;
            let Some(bitmask) = self.marked_chunks.get_mut(chunk_idx) else {
                continue;
            };
            if bitmask.get(index_in_chunk) {
                continue;
            }
            // Stale ids (collected targets) must not keep a reused slot alive
            let Some(data) = self.slot(id.index())
                .filter(|slot| slot.generation == id.generation)
                .and_then(|slot| slot.data.as_ref())
            else {
                continue;
            };
            data.trace(&mut |child| stack.push(child));
            if let Some(bitmask) = self.marked_chunks.get_mut(chunk_idx) {
                bitmask.set(index_in_chunk);
            }
        }

        self.mark_stack = stack;
    }

    fn sweep(&mut self) -> Vec<T> {
        let mut swept = Vec::new();
        for (chunk_idx, (chunk, bitmask)) in self
            .chunks
            .iter_mut()
            .zip(self.marked_chunks.iter())
            .enumerate()
        {
            for index_in_chunk in bitmask.iter_unmarked(chunk.len()) {
                if let Some(data) = chunk.get_mut(index_in_chunk).and_then(|slot| slot.data.take()) {
                    swept.push(data);
                    self.free_list.push(chunk_idx * CHUNK_CAPACITY + index_in_chunk);
                }
            }
        }
        swept
    }

    /// Remove every live object, for environment teardown.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::new();
        for (chunk_idx, chunk) in self.chunks.iter_mut().enumerate() {
            for (index_in_chunk, slot) in chunk.iter_mut().enumerate() {
                if let Some(data) = slot.data.take() {
                    drained.push(data);
                    self.free_list.push(chunk_idx * CHUNK_CAPACITY + index_in_chunk);
                }
            }
        }
        drained
    }

    pub(crate) fn stats(&self) -> GcStats {
        let total_objects: usize = self.chunks.iter().map(Vec::len).sum();
        GcStats {
            total_objects,
            pooled_objects: self.free_list.len(),
            live_objects: total_objects - self.free_list.len(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
