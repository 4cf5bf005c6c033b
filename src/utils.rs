//! Alignment and word-access helpers, plus the debug-build heap scan.

use crate::{ALIGN, WORD_SIZE};

/// Rounds `size` up to the next multiple of [`ALIGN`].
#[inline]
pub(crate) fn align_up(size: usize) -> usize {
    debug_assert!(size <= usize::MAX - (ALIGN - 1));

    (size + ALIGN - 1) & !(ALIGN - 1)
}

/// Reads the word at `offset`. Panics if the word lies outside `heap`.
#[inline]
pub(crate) fn load_word(heap: &[u8], offset: usize) -> usize {
    let mut word = [0u8; WORD_SIZE];
    word.copy_from_slice(&heap[offset..offset + WORD_SIZE]);
    usize::from_ne_bytes(word)
}

/// Writes the word at `offset`. Panics if the word lies outside `heap`.
#[inline]
pub(crate) fn store_word(heap: &mut [u8], offset: usize, value: usize) {
    heap[offset..offset + WORD_SIZE].copy_from_slice(&value.to_ne_bytes());
}

#[cfg(not(any(debug_assertions, feature = "fuzzing")))]
pub(crate) fn scan_for_errors<S: crate::HeapSource>(_: &crate::Shale<S>) {}

/// Debugging function checking the heap structure against its invariants:
/// mirrored tags, no adjacent free blocks, and free-list/header agreement.
#[cfg(any(debug_assertions, feature = "fuzzing"))]
pub(crate) fn scan_for_errors<S: crate::HeapSource>(shale: &crate::Shale<S>) {
    use crate::block::Block;
    use crate::tag::Tag;
    use crate::{MIN_BLOCK_SIZE, OVERHEAD};

    if !shale.established {
        return;
    }

    let heap = shale.source.bytes();
    let bounds = shale.source.bounds();

    let prologue = Tag::load(heap, shale.base);
    assert!(prologue.is_allocated() && prologue.size() == OVERHEAD);

    // address-order walk from the first real block to the epilogue
    let mut header = shale.base + OVERHEAD;
    let mut free_blocks = 0;
    let mut below_free = false;

    loop {
        let tag = Tag::load(heap, header);

        if tag.size() == 0 {
            // epilogue: always allocated, always the last word of the heap
            assert!(tag.is_allocated());
            assert!(header == bounds.acme - WORD_SIZE);
            break;
        }

        let block = Block::from_payload(header + WORD_SIZE);
        assert!(tag.size() >= MIN_BLOCK_SIZE);
        assert!(tag.size() % ALIGN == 0);
        assert!(block.payload() % ALIGN == 0);
        assert!(Tag::load(heap, block.footer(heap)) == tag, "footer does not mirror header");

        if !tag.is_allocated() {
            assert!(!below_free, "adjacent free blocks at header {}", header);
            free_blocks += 1;
        }

        below_free = !tag.is_allocated();
        header += tag.size();
    }

    // every listed block is marked free and the links are mutually consistent
    let mut listed = 0;
    for block in shale.free.iter(heap) {
        assert!(!block.tag(heap).is_allocated());

        if let Some(succ) = block.succ(heap) {
            assert!(succ.pred(heap) == Some(block));
        }

        listed += 1;
        assert!(listed <= free_blocks, "free list longer than the heap's free block count");
    }

    assert!(listed == free_blocks, "free list misses a free block");

    #[cfg(any(test, feature = "fuzzing"))]
    {
        let mut spans = alloc::vec::Vec::new();
        for block in shale.free.iter(heap) {
            let span = crate::Span::from_base_size(block.header(), block.size(heap));
            for other in &spans {
                assert!(!span.overlaps(*other), "{} intersects {}", span, other);
            }
            spans.push(span);
        }
    }
}
