//! Object layout seen from the allocator.
//!
//! The allocator never interprets objects itself. It asks a [Hub] how big an object has to be and
//! hands raw cells to an [ObjectLayout] that plants headers into them. [CellLayout] is a small
//! reference layout used by the tests and by runtimes that have no layout of their own.
//!
//! [CellLayout] header word:
//!
//! +-----------------+------+------------------------------------------+
//! | name            | bits |                                          |
//! +-----------------+------+------------------------------------------+
//! | kind            |    3 | free, filler, array, tuple or hybrid.    |
//! | marked          |    1 | Free for the collector to use.           |
//! | hub id          |   20 | [Hub::id] of the type.                   |
//! | size            |   40 | Cell size in words.                      |
//! +-----------------+------+------------------------------------------+
//!
//! Arrays, hybrids and fillers carry a length word right after the header. The length of a
//! filler is its payload size in bytes: a filler is a byte array nobody refers to.

use std::{mem::size_of, ptr};

use modular_bitfield::prelude::*;

use crate::{util::align_up, WORD_SIZE};

/// Value written in front of every cell when debug tagging is enabled.
pub const DEBUG_TAG: usize = 0xdead_beef;

/// Writes the debug tag at `mark` when tagging and returns where the cell starts.
///
/// # Safety
/// With `tagging` set, `mark` must point to a writable word.
#[inline(always)]
pub unsafe fn adjust_for_debug_tag(mark: *mut u8, tagging: bool) -> *mut u8 {
    if tagging {
        mark.cast::<usize>().write(DEBUG_TAG);
        mark.add(WORD_SIZE)
    } else {
        mark
    }
}

/// Checks the tag in front of `cell`.
///
/// # Safety
/// `cell` must have been allocated with debug tagging enabled.
pub unsafe fn has_debug_tag(cell: *const u8) -> bool {
    cell.sub(WORD_SIZE).cast::<usize>().read() == DEBUG_TAG
}

/// Element kind of arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Word,
    Reference,
}

impl ComponentKind {
    pub const fn size(self) -> usize {
        match self {
            Self::Boolean | Self::Byte => 1,
            Self::Char | Self::Short => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
            Self::Word | Self::Reference => size_of::<usize>(),
        }
    }
}

/// Type metadata the allocator needs about a class.
pub trait Hub {
    /// Identifier stored in object headers.
    fn id(&self) -> u32;
    /// Size of a tuple of this type, header included. For hybrids this is the size of the
    /// initial, unexpanded cell.
    fn tuple_size(&self) -> usize;
    /// Element kind when this is an array type.
    fn component_kind(&self) -> Option<ComponentKind> {
        None
    }
    /// Objects of this type must be registered for finalization right after allocation.
    fn has_finalizer(&self) -> bool {
        false
    }
}

/// Capability to format raw cells as objects.
///
/// Every `plant_*` method receives a cell of exactly the requested size, writes a well formed
/// header, clears the payload and returns the object.
pub trait ObjectLayout: Send + Sync {
    fn array_size(&self, kind: ComponentKind, length: usize) -> usize;
    fn hybrid_size(&self, length: usize) -> usize;

    /// Size of the cell holding `object`.
    ///
    /// # Safety
    /// `object` must be a live object planted by this layout.
    unsafe fn object_size(&self, object: *const u8) -> usize;

    /// # Safety
    /// `cell` must point to `size` writable bytes.
    unsafe fn plant_array(&self, cell: *mut u8, size: usize, hub: &dyn Hub, length: usize)
        -> *mut u8;
    /// # Safety
    /// `cell` must point to `hub.tuple_size()` writable bytes.
    unsafe fn plant_tuple(&self, cell: *mut u8, hub: &dyn Hub) -> *mut u8;
    /// # Safety
    /// `cell` must point to `size` writable bytes.
    unsafe fn plant_hybrid(&self, cell: *mut u8, size: usize, hub: &dyn Hub) -> *mut u8;
    /// Copies `hybrid` into the larger `cell` and sets its length.
    ///
    /// # Safety
    /// `cell` must point to `size` writable bytes, `hybrid` must be a live hybrid.
    unsafe fn plant_expanded_hybrid(
        &self,
        cell: *mut u8,
        size: usize,
        hybrid: *const u8,
        length: usize,
    ) -> *mut u8;
    /// # Safety
    /// `cell` must point to `size` writable bytes, `object` must be a live object of `size`.
    unsafe fn plant_clone(&self, cell: *mut u8, size: usize, object: *const u8) -> *mut u8;

    /// Formats `[start, end)` as dead cells so the region stays walkable.
    ///
    /// # Safety
    /// The range must be writable and not overlap live objects.
    unsafe fn fill_region(&self, start: *mut u8, end: *mut u8);
}

#[derive(BitfieldSpecifier, Clone, Copy, Debug, PartialEq, Eq)]
#[bits = 3]
pub enum CellKind {
    Free,
    Filler,
    Array,
    Tuple,
    Hybrid,
}

#[bitfield(bits = 64)]
#[derive(Clone, Copy, Debug)]
pub struct CellHeader {
    pub kind: CellKind,
    pub marked: bool,
    pub hub_id: B20,
    pub size_words: B40,
}

impl CellHeader {
    pub fn load(cell: *const u8) -> Self {
        unsafe { Self::from_bytes(cell.cast::<[u8; 8]>().read_unaligned()) }
    }

    pub fn store(self, cell: *mut u8) {
        unsafe { cell.cast::<[u8; 8]>().write_unaligned(self.into_bytes()) }
    }

    pub fn size(&self) -> usize {
        self.size_words() as usize * WORD_SIZE
    }
}

/// Reference [ObjectLayout]. Cell sizes are multiples of a word.
#[derive(Default, Clone, Copy, Debug)]
pub struct CellLayout;

impl CellLayout {
    pub const HEADER_SIZE: usize = size_of::<CellHeader>();
    /// Header plus length word.
    pub const ARRAY_HEADER_SIZE: usize = Self::HEADER_SIZE + WORD_SIZE;

    fn header(kind: CellKind, hub_id: u32, size: usize) -> CellHeader {
        CellHeader::new()
            .with_kind(kind)
            .with_hub_id(hub_id)
            .with_size_words((size / WORD_SIZE) as u64)
    }

    /// Length word of an array, hybrid or filler.
    ///
    /// # Safety
    /// `object` must be one of those.
    pub unsafe fn length(object: *const u8) -> usize {
        object.add(Self::HEADER_SIZE).cast::<usize>().read()
    }

    /// First byte after the header (and length word, if the cell has one).
    ///
    /// # Safety
    /// `object` must be a live cell.
    pub unsafe fn payload(object: *mut u8) -> *mut u8 {
        match CellHeader::load(object).kind() {
            CellKind::Tuple => object.add(Self::HEADER_SIZE),
            _ => object.add(Self::ARRAY_HEADER_SIZE),
        }
    }

    /// Walks the well formed cells in `[start, end)`. Stops early at a zero header, which is
    /// where the allocated part of a region ends.
    ///
    /// # Safety
    /// The range must only contain cells planted by this layout.
    pub unsafe fn walk(start: *const u8, end: *const u8, mut f: impl FnMut(*const u8, CellHeader)) {
        let mut cursor = start;
        while cursor < end {
            let header = CellHeader::load(cursor);
            if header.size_words() == 0 {
                break;
            }
            f(cursor, header);
            cursor = cursor.add(header.size());
        }
    }
}

impl ObjectLayout for CellLayout {
    fn array_size(&self, kind: ComponentKind, length: usize) -> usize {
        align_up(Self::ARRAY_HEADER_SIZE + kind.size() * length, WORD_SIZE)
    }

    fn hybrid_size(&self, length: usize) -> usize {
        Self::ARRAY_HEADER_SIZE + length * WORD_SIZE
    }

    unsafe fn object_size(&self, object: *const u8) -> usize {
        CellHeader::load(object).size()
    }

    unsafe fn plant_array(
        &self,
        cell: *mut u8,
        size: usize,
        hub: &dyn Hub,
        length: usize,
    ) -> *mut u8 {
        Self::header(CellKind::Array, hub.id(), size).store(cell);
        cell.add(Self::HEADER_SIZE).cast::<usize>().write(length);
        ptr::write_bytes(
            cell.add(Self::ARRAY_HEADER_SIZE),
            0,
            size - Self::ARRAY_HEADER_SIZE,
        );
        cell
    }

    unsafe fn plant_tuple(&self, cell: *mut u8, hub: &dyn Hub) -> *mut u8 {
        let size = hub.tuple_size();
        Self::header(CellKind::Tuple, hub.id(), size).store(cell);
        ptr::write_bytes(cell.add(Self::HEADER_SIZE), 0, size - Self::HEADER_SIZE);
        cell
    }

    unsafe fn plant_hybrid(&self, cell: *mut u8, size: usize, hub: &dyn Hub) -> *mut u8 {
        debug_assert!(size >= Self::ARRAY_HEADER_SIZE);
        Self::header(CellKind::Hybrid, hub.id(), size).store(cell);
        cell.add(Self::HEADER_SIZE)
            .cast::<usize>()
            .write((size - Self::ARRAY_HEADER_SIZE) / WORD_SIZE);
        ptr::write_bytes(
            cell.add(Self::ARRAY_HEADER_SIZE),
            0,
            size - Self::ARRAY_HEADER_SIZE,
        );
        cell
    }

    unsafe fn plant_expanded_hybrid(
        &self,
        cell: *mut u8,
        size: usize,
        hybrid: *const u8,
        length: usize,
    ) -> *mut u8 {
        let old = CellHeader::load(hybrid);
        let old_size = old.size();
        ptr::copy_nonoverlapping(hybrid, cell, old_size);
        ptr::write_bytes(cell.add(old_size), 0, size - old_size);
        Self::header(CellKind::Hybrid, old.hub_id(), size).store(cell);
        cell.add(Self::HEADER_SIZE).cast::<usize>().write(length);
        cell
    }

    unsafe fn plant_clone(&self, cell: *mut u8, size: usize, object: *const u8) -> *mut u8 {
        ptr::copy_nonoverlapping(object, cell, size);
        let mut header = CellHeader::load(cell);
        header.set_marked(false);
        header.store(cell);
        cell
    }

    unsafe fn fill_region(&self, start: *mut u8, end: *mut u8) {
        if start >= end {
            return;
        }
        let size = end as usize - start as usize;
        if size < WORD_SIZE {
            ptr::write_bytes(start, 0, size);
        } else if size < Self::ARRAY_HEADER_SIZE {
            Self::header(CellKind::Filler, 0, WORD_SIZE).store(start);
        } else {
            Self::header(CellKind::Filler, 0, size).store(start);
            start
                .add(Self::HEADER_SIZE)
                .cast::<usize>()
                .write(size - Self::ARRAY_HEADER_SIZE);
        }
    }
}
