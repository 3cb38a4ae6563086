//! Bump-pointer arena allocator
//!
//! Session setup allocates its transient data (the child's argv and envp,
//! duplicated command strings) from a single arena. Nothing allocated here has
//! its own destructor: the whole arena is released at once when the session
//! ends, so an early return from any setup step can never leak or double-free
//! an individual allocation.
//!
//! - O(1) allocation by bumping an offset inside the current block
//! - Blocks are chained and never move, so returned pointers stay valid until
//!   [`Arena::reset`] or the arena is dropped
//! - Block sizes grow exponentially up to [`MAX_BLOCK_SIZE`]
//! - Every allocation is aligned to [`ALIGNMENT`] bytes

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::ffi::CStr;
use std::ptr::{self, NonNull};

/// Alignment of every pointer handed out by the arena
pub const ALIGNMENT: usize = 8;

/// Default size of the first block (64 KiB)
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Upper bound on grown blocks (16 MiB); larger single requests get an exact-size block
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Arena allocation error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    /// The system allocator refused to provide a new block
    #[error("out of memory allocating a {0}-byte arena block")]
    OutOfMemory(usize),

    /// A size computation overflowed
    #[error("arena allocation size overflow")]
    Overflow,

    /// A string passed to `strdup` contains a NUL byte
    #[error("string contains an interior NUL byte at offset {0}")]
    InteriorNul(usize),
}

/// Result type for arena operations
pub type ArenaResult<T> = Result<T, ArenaError>;

/// A contiguous region with a bump offset
struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
    used: Cell<usize>,
}

impl Block {
    fn new(capacity: usize) -> ArenaResult<Self> {
        let layout = Layout::from_size_align(capacity.max(ALIGNMENT), ALIGNMENT)
            .map_err(|_| ArenaError::Overflow)?;
        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(ArenaError::OutOfMemory(layout.size()))?;
        Ok(Self {
            ptr,
            layout,
            used: Cell::new(0),
        })
    }

    fn capacity(&self) -> usize {
        self.layout.size()
    }

    fn remaining(&self) -> usize {
        self.capacity() - self.used.get()
    }

    /// Carve `size` bytes off the front of the free region.
    ///
    /// Callers check `remaining() >= size` first.
    fn bump(&self, size: usize) -> NonNull<u8> {
        let offset = self.used.get();
        debug_assert!(offset + size <= self.capacity());
        self.used.set(offset + size);
        // SAFETY: offset + size <= capacity, so the result stays inside the block
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc::alloc with this exact layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Bump-pointer arena with chained, exponentially growing blocks
///
/// Allocation goes through `&self` so that references handed out by
/// [`Arena::strdup`] can coexist; [`Arena::reset`] takes `&mut self`, which
/// statically guarantees no such reference outlives a reset.
pub struct Arena {
    /// Blocks, oldest first
    blocks: RefCell<Vec<Block>>,
    /// Index of the block currently being bumped
    current: Cell<usize>,
    initial_block_size: usize,
    max_block_size: usize,
    /// Size requested by the next growth event
    next_block_size: Cell<usize>,
}

// SAFETY: an Arena exclusively owns its blocks. It is not Sync (Cell/RefCell),
// so moving it to another thread cannot race with an allocation.
unsafe impl Send for Arena {}

impl Arena {
    /// Create an arena whose first block holds `initial_block_size` bytes
    pub fn new(initial_block_size: usize) -> ArenaResult<Self> {
        Self::with_limits(initial_block_size, MAX_BLOCK_SIZE)
    }

    /// Create an arena with an explicit growth cap
    pub fn with_limits(initial_block_size: usize, max_block_size: usize) -> ArenaResult<Self> {
        let max_block_size = max_block_size.max(ALIGNMENT);
        let initial_block_size = align_up(initial_block_size)?.clamp(ALIGNMENT, max_block_size);
        let first = Block::new(initial_block_size)?;

        tracing::trace!(initial_block_size, max_block_size, "arena created");

        Ok(Self {
            blocks: RefCell::new(vec![first]),
            current: Cell::new(0),
            initial_block_size,
            max_block_size,
            next_block_size: Cell::new(initial_block_size.saturating_mul(2).min(max_block_size)),
        })
    }

    /// Allocate `size` bytes of uninitialized memory
    ///
    /// The size is rounded up to a multiple of [`ALIGNMENT`]. A request that
    /// does not fit the current block moves on to the next retained block (after
    /// a reset) or chains a new block of `max(size, next_block_size)` bytes.
    pub fn alloc(&self, size: usize) -> ArenaResult<NonNull<u8>> {
        let size = align_up(size)?;
        let mut blocks = self.blocks.borrow_mut();

        let mut index = self.current.get();
        while index < blocks.len() {
            if blocks[index].remaining() >= size {
                self.current.set(index);
                return Ok(blocks[index].bump(size));
            }
            index += 1;
        }

        let block_size = self.grow(size);
        let block = Block::new(block_size)?;
        let ptr = block.bump(size);
        blocks.push(block);
        self.current.set(blocks.len() - 1);

        tracing::trace!(block_size, blocks = blocks.len(), "arena grew");
        Ok(ptr)
    }

    /// Allocate zeroed memory for `count` elements of `elem_size` bytes each
    pub fn calloc(&self, count: usize, elem_size: usize) -> ArenaResult<NonNull<u8>> {
        let size = count.checked_mul(elem_size).ok_or(ArenaError::Overflow)?;
        let ptr = self.alloc(size)?;
        // SAFETY: alloc returned at least `size` writable bytes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Copy `bytes` into the arena as a NUL-terminated C string
    pub fn strdup(&self, bytes: &[u8]) -> ArenaResult<&CStr> {
        self.strcat(&[bytes])
    }

    /// Concatenate `parts` into one NUL-terminated C string inside the arena
    pub fn strcat(&self, parts: &[&[u8]]) -> ArenaResult<&CStr> {
        let mut len = 0usize;
        for part in parts {
            if let Some(pos) = part.iter().position(|&b| b == 0) {
                return Err(ArenaError::InteriorNul(len + pos));
            }
            len = len.checked_add(part.len()).ok_or(ArenaError::Overflow)?;
        }
        let total = len.checked_add(1).ok_or(ArenaError::Overflow)?;

        let dst = self.alloc(total)?.as_ptr();
        let mut offset = 0;
        for part in parts {
            // SAFETY: dst has `total` bytes; the parts sum to `len` < total and
            // the fresh allocation cannot overlap a caller-owned slice
            unsafe { ptr::copy_nonoverlapping(part.as_ptr(), dst.add(offset), part.len()) };
            offset += part.len();
        }

        // SAFETY: dst[len] is inside the allocation; the bytes before it were
        // checked for NULs above, and the memory lives as long as &self
        unsafe {
            *dst.add(len) = 0;
            Ok(CStr::from_bytes_with_nul_unchecked(std::slice::from_raw_parts(dst, total)))
        }
    }

    /// Move an allocation into a fresh region of `new_size` bytes
    ///
    /// Always allocates and copies `min(old_size, new_size)` bytes; the old
    /// region is not reclaimed until the arena is reset or dropped.
    ///
    /// # Safety
    ///
    /// `old` must have been returned by this arena since the last reset and be
    /// valid for reads of `old_size` bytes.
    pub unsafe fn realloc(
        &self,
        old: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> ArenaResult<NonNull<u8>> {
        let new = self.alloc(new_size)?;
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
        Ok(new)
    }

    /// Mark every block empty without returning memory to the system
    ///
    /// Growth restarts from the initial block size.
    pub fn reset(&mut self) {
        for block in self.blocks.get_mut().iter() {
            block.used.set(0);
        }
        self.current.set(0);
        self.next_block_size
            .set(self.initial_block_size.saturating_mul(2).min(self.max_block_size));
    }

    /// Release every block at once
    pub fn destroy(self) {
        tracing::trace!(blocks = self.block_count(), "arena destroyed");
    }

    /// Bytes handed out since creation or the last reset
    pub fn allocated_bytes(&self) -> usize {
        self.blocks.borrow().iter().map(|b| b.used.get()).sum()
    }

    /// Total bytes reserved across all blocks
    pub fn capacity(&self) -> usize {
        self.blocks.borrow().iter().map(Block::capacity).sum()
    }

    /// Number of chained blocks
    pub fn block_count(&self) -> usize {
        self.blocks.borrow().len()
    }

    /// Capacity of each block, oldest first
    pub fn block_capacities(&self) -> Vec<usize> {
        self.blocks.borrow().iter().map(Block::capacity).collect()
    }

    /// Size of the first block
    pub fn initial_block_size(&self) -> usize {
        self.initial_block_size
    }

    fn grow(&self, request: usize) -> usize {
        let next = self.next_block_size.get();
        self.next_block_size
            .set(next.saturating_mul(2).min(self.max_block_size));
        request.max(next)
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("blocks", &self.block_count())
            .field("allocated", &self.allocated_bytes())
            .field("capacity", &self.capacity())
            .finish()
    }
}

fn align_up(size: usize) -> ArenaResult<usize> {
    size.checked_add(ALIGNMENT - 1)
        .map(|s| s & !(ALIGNMENT - 1))
        .ok_or(ArenaError::Overflow)
}
