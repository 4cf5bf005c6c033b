//! Typed block handles and the offset arithmetic that recovers a block's
//! metadata and physical neighbors from them.
//!
//! All neighbor navigation in the crate goes through these accessors; no
//! other component computes raw offsets.

use crate::tag::Tag;
use crate::utils::{load_word, store_word};
use crate::{OVERHEAD, WORD_SIZE};

/// Payload word holding the free-list predecessor link.
const PRED_OFFSET: usize = 0;
/// Payload word holding the free-list successor link.
const SUCC_OFFSET: usize = WORD_SIZE;

/// "No block" in a stored link word. Offset zero is the prologue header and
/// is never a payload.
const NIL: usize = 0;

/// A handle to a heap block, identified by the offset of its payload into
/// the heap bytes.
///
/// Handles are plain offsets: they stay valid across heap growth and are
/// meaningful only to the allocator instance that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(pub(crate) usize);

impl Block {
    /// The offset of the first payload byte within the heap region.
    ///
    /// Always a multiple of the alignment unit.
    pub fn offset(self) -> usize {
        self.0
    }

    #[inline]
    pub(crate) fn from_payload(offset: usize) -> Self {
        debug_assert!(offset >= WORD_SIZE);
        Self(offset)
    }

    /// The offset of the first payload byte.
    #[inline]
    pub(crate) fn payload(self) -> usize {
        self.0
    }

    /// The offset of the header word.
    #[inline]
    pub(crate) fn header(self) -> usize {
        self.0 - WORD_SIZE
    }

    #[inline]
    pub(crate) fn tag(self, heap: &[u8]) -> Tag {
        Tag::load(heap, self.header())
    }

    /// Total block size: header + payload + footer.
    #[inline]
    pub(crate) fn size(self, heap: &[u8]) -> usize {
        self.tag(heap).size()
    }

    #[inline]
    pub(crate) fn payload_size(self, heap: &[u8]) -> usize {
        self.size(heap) - OVERHEAD
    }

    /// The offset of the footer word, derived from the size in the block's
    /// own header.
    #[inline]
    pub(crate) fn footer(self, heap: &[u8]) -> usize {
        self.header() + self.size(heap) - WORD_SIZE
    }

    /// Writes `tag` to both the header and the footer position it implies.
    pub(crate) fn write_tags(self, heap: &mut [u8], tag: Tag) {
        tag.store(heap, self.header());
        tag.store(heap, self.header() + tag.size() - WORD_SIZE);
    }

    /// The physically next block: current header + current size.
    #[inline]
    pub(crate) fn next(self, heap: &[u8]) -> Block {
        Block(self.0 + self.size(heap))
    }

    /// The physically previous block, reached through its footer, which is
    /// the word immediately below this block's header.
    #[inline]
    pub(crate) fn prev(self, heap: &[u8]) -> Block {
        Block(self.0 - Tag::load(heap, self.header() - WORD_SIZE).size())
    }

    // While a block is free, its first two payload words hold the free-list
    // links, encoded as payload offsets with `NIL` for none.

    pub(crate) fn pred(self, heap: &[u8]) -> Option<Block> {
        decode_link(load_word(heap, self.0 + PRED_OFFSET))
    }

    pub(crate) fn succ(self, heap: &[u8]) -> Option<Block> {
        decode_link(load_word(heap, self.0 + SUCC_OFFSET))
    }

    pub(crate) fn set_pred(self, heap: &mut [u8], pred: Option<Block>) {
        store_word(heap, self.0 + PRED_OFFSET, encode_link(pred));
    }

    pub(crate) fn set_succ(self, heap: &mut [u8], succ: Option<Block>) {
        store_word(heap, self.0 + SUCC_OFFSET, encode_link(succ));
    }
}

#[inline]
fn encode_link(block: Option<Block>) -> usize {
    match block {
        Some(block) => block.0,
        None => NIL,
    }
}

#[inline]
fn decode_link(word: usize) -> Option<Block> {
    if word == NIL {
        None
    } else {
        Some(Block(word))
    }
}
