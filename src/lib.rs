#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod block;
#[cfg(feature = "counters")]
mod counters;
mod heap;
mod list;
mod span;
mod tag;
mod utils;

pub use block::Block;
#[cfg(feature = "counters")]
pub use counters::Counters;
pub use heap::{BufferHeap, ErrOnGrow, HeapExhausted, HeapSource};
pub use span::Span;

use list::FreeList;
use tag::Tag;
use utils::*;

// Block layout, all fields word-sized:
//   allocated: | HDR: size|1 |        payload        | FTR: size|1 |
//   free:      | HDR: size|0 | PRED | SUCC | ....... | FTR: size|0 |
//
// The footer is kept on allocated blocks too; it is what makes the backward
// neighbor reachable in O(1) during coalescing. PRED/SUCC live in the
// payload, which is unused while the block is free.
//
// The heap is bounded by a prologue (header+footer, no payload, allocated)
// and an epilogue (a lone zero-size allocated header), so neighbor reads
// never run off either end.

const WORD_SIZE: usize = core::mem::size_of::<usize>();
/// Payload alignment unit: the machine word (8 bytes on 64-bit targets).
const ALIGN: usize = WORD_SIZE;
/// Per-block metadata: one header word and one footer word.
const OVERHEAD: usize = 2 * WORD_SIZE;
/// Header, footer and the two payload words a free block's links occupy.
const MIN_BLOCK_SIZE: usize = 4 * WORD_SIZE;
/// Minimum heap growth per extension.
const CHUNK_SIZE: usize = 1 << 12;

/// The Shale allocator: an explicit-free-list heap over a growable byte
/// buffer.
///
/// Construct with [`with_source`](Shale::with_source) (or [`new`](Shale::new)
/// followed by [`init`](Shale::init)). Allocations are [`Block`] handles;
/// their bytes are reached through [`payload`](Shale::payload) and
/// [`payload_mut`](Shale::payload_mut).
pub struct Shale<S: HeapSource> {
    pub source: S,

    free: FreeList,

    /// Offset of the prologue header; the low end of the managed region.
    base: usize,
    established: bool,

    #[cfg(feature = "counters")]
    counters: counters::Counters,
}

impl<S: HeapSource> core::fmt::Debug for Shale<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Shale")
            .field("bounds", &self.source.bounds())
            .field("base", &self.base)
            .field("established", &self.established)
            .finish()
    }
}

impl<S: HeapSource> Shale<S> {
    /// Block size required to hold a `size`-byte payload: payload plus
    /// overhead, aligned up, never below the minimum block size.
    ///
    /// `None` on arithmetic overflow, which no heap can satisfy anyway.
    fn required_block_size(size: usize) -> Option<usize> {
        let padded = size.checked_add(OVERHEAD + ALIGN - 1)?;
        let asize = padded & !(ALIGN - 1);

        Some(if asize < MIN_BLOCK_SIZE { MIN_BLOCK_SIZE } else { asize })
    }

    /// Constructs an unestablished allocator. Call [`init`](Shale::init)
    /// before any other operation.
    pub const fn new(source: S) -> Self {
        Self {
            source,
            free: FreeList::new(),
            base: 0,
            established: false,
            #[cfg(feature = "counters")]
            counters: counters::Counters::new(),
        }
    }

    /// Constructs and establishes an allocator over `source`.
    pub fn with_source(source: S) -> Result<Self, HeapExhausted> {
        let mut shale = Self::new(source);
        shale.init()?;
        Ok(shale)
    }

    /// Establishes the heap: writes the prologue and epilogue sentinels at
    /// the source's current high end and performs one initial extension.
    ///
    /// Must run exactly once before any other operation. Calling it again
    /// performs a full reset: the free list is emptied and a fresh region
    /// is established; blocks handed out earlier are abandoned where they
    /// are and must not be used again.
    pub fn init(&mut self) -> Result<(), HeapExhausted> {
        self.free.clear();
        #[cfg(feature = "counters")]
        {
            self.counters = counters::Counters::new();
        }

        // prologue header+footer and the initial epilogue, three words
        let base = self.source.grow(OVERHEAD + WORD_SIZE)?;
        #[cfg(feature = "counters")]
        self.counters.account_grow(OVERHEAD + WORD_SIZE);

        let heap = self.source.bytes_mut();
        Block::from_payload(base + WORD_SIZE).write_tags(heap, Tag::new(OVERHEAD, true));
        Tag::new(0, true).store(heap, base + OVERHEAD);

        self.base = base;
        self.established = true;

        self.extend(CHUNK_SIZE)?;
        scan_for_errors(self);

        Ok(())
    }

    /// Allocates a block with at least `size` payload bytes.
    ///
    /// `size == 0` is a defined no-op returning `None` without touching the
    /// heap. `None` is otherwise the heap-exhaustion result: the source
    /// refused the extension this request needed.
    pub fn allocate(&mut self, size: usize) -> Option<Block> {
        if size == 0 {
            return None;
        }

        debug_assert!(self.established);

        let asize = Self::required_block_size(size)?;

        let block = match self.find_fit(asize) {
            Some(block) => block,
            None => self.extend(asize.max(CHUNK_SIZE)).ok()?,
        };

        self.deregister(block);
        self.place(block, asize);

        #[cfg(feature = "counters")]
        self.counters.account_alloc(block.payload_size(self.source.bytes()));

        scan_for_errors(self);

        Some(block)
    }

    /// Releases a block previously returned by
    /// [`allocate`](Shale::allocate) or [`resize`](Shale::resize).
    ///
    /// Passing a handle that is not a live allocation of this instance is
    /// outside the contract: the heap structure may be corrupted or a
    /// bounds check may panic, though memory safety is never at risk.
    pub fn release(&mut self, block: Block) {
        debug_assert!(self.established);

        let heap = self.source.bytes_mut();
        let tag = block.tag(heap);
        debug_assert!(tag.is_allocated());

        #[cfg(feature = "counters")]
        self.counters.account_dealloc(tag.size() - OVERHEAD);

        block.write_tags(heap, Tag::new(tag.size(), false));
        self.coalesce(block);

        scan_for_errors(self);
    }

    /// Resizes an allocation to `size` payload bytes, moving it.
    ///
    /// `None` behaves as [`allocate`](Shale::allocate); `size == 0` behaves
    /// as [`release`](Shale::release) and returns `None`. Otherwise the
    /// payload prefix that fits both blocks is copied to a fresh allocation
    /// and the old block is released. On exhaustion the old block is left
    /// untouched and `None` is returned.
    pub fn resize(&mut self, block: Option<Block>, size: usize) -> Option<Block> {
        let Some(block) = block else {
            return self.allocate(size);
        };

        if size == 0 {
            self.release(block);
            return None;
        }

        let new = self.allocate(size)?;

        let heap = self.source.bytes_mut();
        let preserved = size.min(block.payload_size(heap));
        heap.copy_within(block.payload()..block.payload() + preserved, new.payload());

        self.release(block);
        Some(new)
    }

    /// The payload bytes of a live allocation. The slice covers the whole
    /// granted payload, which may exceed the requested size.
    pub fn payload(&self, block: Block) -> &[u8] {
        let heap = self.source.bytes();
        &heap[block.payload()..block.payload() + block.payload_size(heap)]
    }

    /// The payload bytes of a live allocation, mutably.
    pub fn payload_mut(&mut self, block: Block) -> &mut [u8] {
        let heap = self.source.bytes_mut();
        let size = block.payload_size(heap);
        &mut heap[block.payload()..block.payload() + size]
    }

    /// Granted payload size of a live allocation.
    pub fn payload_size(&self, block: Block) -> usize {
        block.payload_size(self.source.bytes())
    }

    /// The source's current bounds.
    pub fn heap_span(&self) -> Span {
        self.source.bounds()
    }

    /// Grows the heap and installs the new region as a free block, merged
    /// with the old tail block if that was free.
    fn extend(&mut self, bytes: usize) -> Result<Block, HeapExhausted> {
        let grown = align_up(bytes);
        let start = self.source.grow(grown)?;

        #[cfg(feature = "counters")]
        self.counters.account_grow(grown);

        // the new block's header lands on the old epilogue
        let block = Block::from_payload(start);
        let heap = self.source.bytes_mut();
        block.write_tags(heap, Tag::new(grown, false));
        Tag::new(0, true).store(heap, block.header() + grown);

        Ok(self.coalesce(block))
    }

    /// First-fit search of the free list in its scan order.
    fn find_fit(&self, asize: usize) -> Option<Block> {
        let heap = self.source.bytes();
        self.free.iter(heap).find(|block| block.size(heap) >= asize)
    }

    /// Places an `asize`-byte allocation into `block`, which has already
    /// been removed from the free list: split off the high remainder if it
    /// can stand as a block of its own, else consume the whole block.
    fn place(&mut self, block: Block, asize: usize) {
        let total = block.size(self.source.bytes());
        let remainder = total - asize;

        if remainder >= MIN_BLOCK_SIZE {
            let heap = self.source.bytes_mut();
            block.write_tags(heap, Tag::new(asize, true));

            let rest = block.next(heap);
            rest.write_tags(heap, Tag::new(remainder, false));
            self.register(rest);
        } else {
            block.write_tags(self.source.bytes_mut(), Tag::new(total, true));
        }
    }

    /// Merges `block` (marked free, not yet listed) with free physical
    /// neighbors and registers the merged block.
    ///
    /// Both `release` and `extend` route through here, which is what keeps
    /// two adjacent free blocks from ever coexisting.
    fn coalesce(&mut self, block: Block) -> Block {
        let heap = self.source.bytes();

        let footer_below = Tag::load(heap, block.header() - WORD_SIZE);
        let next = block.next(heap);
        let header_above = next.tag(heap);

        let size = block.size(heap);
        let prev = Block::from_payload(block.payload() - footer_below.size());
        let prev_size = footer_below.size();
        let next_size = header_above.size();

        let merged = match (footer_below.is_allocated(), header_above.is_allocated()) {
            (true, true) => block,
            (true, false) => {
                self.deregister(next);
                block.write_tags(self.source.bytes_mut(), Tag::new(size + next_size, false));
                block
            }
            (false, true) => {
                self.deregister(prev);
                prev.write_tags(self.source.bytes_mut(), Tag::new(prev_size + size, false));
                prev
            }
            (false, false) => {
                self.deregister(prev);
                self.deregister(next);
                prev.write_tags(
                    self.source.bytes_mut(),
                    Tag::new(prev_size + size + next_size, false),
                );
                prev
            }
        };

        self.register(merged);
        merged
    }

    /// Free-list insertion plus accounting.
    fn register(&mut self, block: Block) {
        #[cfg(feature = "counters")]
        self.counters.account_register_gap(block.size(self.source.bytes()));

        self.free.push(self.source.bytes_mut(), block);
    }

    /// Free-list removal plus accounting.
    fn deregister(&mut self, block: Block) {
        #[cfg(feature = "counters")]
        self.counters.account_deregister_gap(block.size(self.source.bytes()));

        self.free.unlink(self.source.bytes_mut(), block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established() -> Shale<BufferHeap> {
        Shale::with_source(BufferHeap::new()).unwrap()
    }

    fn free_block_count<S: HeapSource>(shale: &Shale<S>) -> usize {
        shale.free.iter(shale.source.bytes()).count()
    }

    #[test]
    fn zero_size_requests() {
        let mut shale = established();
        let bounds = shale.heap_span();

        assert_eq!(shale.allocate(0), None);
        assert_eq!(shale.heap_span(), bounds);
        assert_eq!(free_block_count(&shale), 1);

        // resize of nothing is allocation
        let block = shale.resize(None, 48).unwrap();
        assert!(shale.payload_size(block) >= 48);

        // resize to nothing is release
        assert_eq!(shale.resize(Some(block), 0), None);
        assert_eq!(free_block_count(&shale), 1);
    }

    #[test]
    fn payloads_are_aligned() {
        let mut shale = established();

        for size in [1, 2, 3, 7, 8, 9, 24, 100, 1000] {
            let block = shale.allocate(size).unwrap();
            assert_eq!(block.offset() % ALIGN, 0);
            assert!(shale.payload_size(block) >= size);
            assert_eq!(shale.payload_size(block) % ALIGN, 0);
        }
    }

    #[test]
    fn immediate_reuse() {
        let mut shale = established();
        let bounds = shale.heap_span();

        let first = shale.allocate(1).unwrap();
        shale.release(first);
        let second = shale.allocate(1).unwrap();

        assert_eq!(first, second);
        assert_eq!(shale.heap_span(), bounds, "reuse must not extend the heap");
    }

    #[test]
    fn release_coalesces_neighbors() {
        let mut shale = established();

        let a = shale.allocate(100).unwrap();
        let b = shale.allocate(100).unwrap();

        shale.release(a);
        shale.release(b);

        // a, b and the tail remainder must have merged back into the whole
        // initial chunk
        assert_eq!(free_block_count(&shale), 1);
        let merged = shale.free.iter(shale.source.bytes()).next().unwrap();
        assert_eq!(merged.size(shale.source.bytes()), CHUNK_SIZE);
        assert_eq!(merged, a);
    }

    #[test]
    fn first_fit_follows_insertion_order() {
        let mut shale = established();

        let small = shale.allocate(112).unwrap();
        let _sep1 = shale.allocate(8).unwrap();
        let large = shale.allocate(240).unwrap();
        let _sep2 = shale.allocate(8).unwrap();

        shale.release(small); // 128-byte free block
        shale.release(large); // 256-byte free block, now at the list head

        // both free blocks fit; first-fit in LIFO scan order must take the
        // most recently freed one, not the tighter one
        let block = shale.allocate(64).unwrap();
        assert_eq!(block, large);
    }

    #[test]
    fn resize_preserves_data() {
        let mut shale = established();

        let pattern: alloc::vec::Vec<u8> = (0..40).collect();

        let block = shale.allocate(40).unwrap();
        shale.payload_mut(block)[..40].copy_from_slice(&pattern);

        let grown = shale.resize(Some(block), 100).unwrap();
        assert_ne!(grown, block);
        assert_eq!(&shale.payload(grown)[..40], &pattern[..]);

        let shrunk = shale.resize(Some(grown), 16).unwrap();
        assert_eq!(&shale.payload(shrunk)[..16], &pattern[..16]);
    }

    struct CountingHeap {
        inner: BufferHeap,
        grows: usize,
    }

    impl HeapSource for CountingHeap {
        fn grow(&mut self, bytes: usize) -> Result<usize, HeapExhausted> {
            self.grows += 1;
            self.inner.grow(bytes)
        }

        fn bounds(&self) -> Span {
            self.inner.bounds()
        }

        fn bytes(&self) -> &[u8] {
            self.inner.bytes()
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            self.inner.bytes_mut()
        }
    }

    #[test]
    fn oversized_request_grows_once() {
        let source = CountingHeap { inner: BufferHeap::new(), grows: 0 };
        let mut shale = Shale::with_source(source).unwrap();
        let grows_after_init = shale.source.grows;

        let size = 3 * CHUNK_SIZE;
        let block = shale.allocate(size).unwrap();

        assert_eq!(shale.source.grows, grows_after_init + 1);
        assert_eq!(shale.payload_size(block), size);

        // the initial chunk merged into the extension and was split back
        // off, leaving exactly one remainder of full block size
        assert_eq!(free_block_count(&shale), 1);
        let rest = shale.free.iter(shale.source.bytes()).next().unwrap();
        assert_eq!(rest.size(shale.source.bytes()), CHUNK_SIZE);
    }

    #[test]
    fn exhaustion_is_an_allocation_failure() {
        assert_eq!(Shale::with_source(ErrOnGrow).err(), Some(HeapExhausted));
        assert!(Shale::with_source(BufferHeap::with_limit(1024)).is_err());

        let mut shale = Shale::with_source(BufferHeap::with_limit(8 * 1024)).unwrap();

        assert_eq!(shale.allocate(6000), None);

        // a failing resize must leave the original allocation intact
        let block = shale.allocate(1000).unwrap();
        shale.payload_mut(block)[..4].copy_from_slice(b"kept");
        assert_eq!(shale.resize(Some(block), 6000), None);
        assert_eq!(&shale.payload(block)[..4], b"kept");
    }

    #[test]
    fn reinit_establishes_a_fresh_region() {
        let mut shale = established();

        let old = shale.allocate(50).unwrap();
        shale.init().unwrap();

        let new = shale.allocate(50).unwrap();
        assert!(new.payload() > old.payload());
        assert_eq!(free_block_count(&shale), 1);
        shale.release(new);
    }

    #[test]
    fn randomized_stress() {
        fastrand::seed(0x5ca1e);

        let mut shale = established();
        let mut live: alloc::vec::Vec<(Block, u8, usize)> = alloc::vec::Vec::new();

        for _ in 0..2000 {
            match fastrand::usize(..10) {
                0..=4 => {
                    let size = fastrand::usize(1..600);
                    if let Some(block) = shale.allocate(size) {
                        let fill = fastrand::u8(..);
                        shale.payload_mut(block)[..size].fill(fill);
                        live.push((block, fill, size));
                    }
                }
                5..=7 if !live.is_empty() => {
                    let (block, fill, size) = live.swap_remove(fastrand::usize(..live.len()));
                    assert!(shale.payload(block)[..size].iter().all(|&b| b == fill));
                    shale.release(block);
                }
                8..=9 if !live.is_empty() => {
                    let index = fastrand::usize(..live.len());
                    let (block, fill, size) = live[index];
                    let new_size = fastrand::usize(1..900);

                    if let Some(resized) = shale.resize(Some(block), new_size) {
                        let kept = size.min(new_size);
                        assert!(shale.payload(resized)[..kept].iter().all(|&b| b == fill));
                        shale.payload_mut(resized)[..new_size].fill(fill);
                        live[index] = (resized, fill, new_size);
                    }
                }
                _ => {}
            }
        }

        for (block, fill, size) in live.drain(..) {
            assert!(shale.payload(block)[..size].iter().all(|&b| b == fill));
            shale.release(block);
        }

        // with every allocation released, coalescing must leave a single
        // free block covering the whole grown area
        assert_eq!(free_block_count(&shale), 1);
    }
}
