//! Packed mark work items.
//!
//! A task is a single `u64` so that queues stay dense:
//!
//! ```text
//!  63        54 53  49 48                                   0
//! +------------+------+--------------------------------------+
//! |   chunk    | pow  |             object address           |
//! +------------+------+--------------------------------------+
//! ```
//!
//! `chunk == 0` tags a whole-object task. Otherwise the task covers elements
//! `[(chunk - 1) << pow, chunk << pow)` of an object array.

use std::fmt;
use std::ops::Range;

use crate::oop::ObjRef;

/// A unit of marking work.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MarkTask(u64);

/// Decoded view of a [`MarkTask`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// Scan the whole object.
    Object(ObjRef),
    /// Scan one power-of-two chunk of an object array.
    ArrayChunk {
        /// The array being scanned.
        array: ObjRef,
        /// 1-based chunk index within the subdivision at `pow`.
        chunk: usize,
        /// Chunk width exponent.
        pow: u32,
    },
}

impl MarkTask {
    /// Bits for the chunk index.
    pub const CHUNK_BITS: u32 = 10;
    /// Bits for the chunk width exponent.
    pub const POW_BITS: u32 = 5;
    /// Bits left for the object address.
    pub const OBJ_BITS: u32 = 64 - Self::CHUNK_BITS - Self::POW_BITS;

    /// Chunk-index capacity. The splitter only subdivides while
    /// `chunk * 2 < CHUNK_SIZE`.
    pub const CHUNK_SIZE: usize = 1 << Self::CHUNK_BITS;
    /// Exponents at or above this are split once up front.
    pub const POW_LIMIT: u32 = 31;
    /// Longest array the encoding can describe.
    pub const MAX_ARRAY_LENGTH: usize = 1 << Self::POW_LIMIT;

    const OBJ_SHIFT: u32 = 0;
    const POW_SHIFT: u32 = Self::OBJ_BITS;
    const CHUNK_SHIFT: u32 = Self::OBJ_BITS + Self::POW_BITS;

    const OBJ_MASK: u64 = (1 << Self::OBJ_BITS) - 1;
    const POW_MASK: u64 = (1 << Self::POW_BITS) - 1;
    const CHUNK_MASK: u64 = (1 << Self::CHUNK_BITS) - 1;

    /// A whole-object task.
    #[must_use]
    pub fn object(obj: ObjRef) -> Self {
        Self::encode(obj, 0, 0)
    }

    /// An array-chunk task.
    #[must_use]
    pub fn chunk(array: ObjRef, chunk: usize, pow: u32) -> Self {
        debug_assert!(
            chunk > 0 && chunk < Self::CHUNK_SIZE,
            "chunk id {chunk} out of range"
        );
        debug_assert!(pow < Self::POW_LIMIT, "chunk pow {pow} out of range");
        Self::encode(array, chunk, pow)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_lossless)]
    fn encode(obj: ObjRef, chunk: usize, pow: u32) -> Self {
        debug_assert!(!obj.is_null(), "mark task for null reference");
        let addr = obj.addr() as u64;
        debug_assert_eq!(
            addr & !Self::OBJ_MASK,
            0,
            "{obj:?} does not fit in {} bits",
            Self::OBJ_BITS
        );
        Self(
            (addr & Self::OBJ_MASK) << Self::OBJ_SHIFT
                | (pow as u64 & Self::POW_MASK) << Self::POW_SHIFT
                | (chunk as u64 & Self::CHUNK_MASK) << Self::CHUNK_SHIFT,
        )
    }

    /// The object or array this task refers to.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn obj(self) -> ObjRef {
        ObjRef::from_addr(((self.0 >> Self::OBJ_SHIFT) & Self::OBJ_MASK) as usize)
    }

    /// Chunk index, zero for whole-object tasks.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn chunk_index(self) -> usize {
        ((self.0 >> Self::CHUNK_SHIFT) & Self::CHUNK_MASK) as usize
    }

    /// Chunk width exponent.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pow(self) -> u32 {
        ((self.0 >> Self::POW_SHIFT) & Self::POW_MASK) as u32
    }

    /// Whether this is a whole-object task.
    #[must_use]
    pub const fn is_not_chunked(self) -> bool {
        self.chunk_index() == 0
    }

    pub(crate) const fn to_raw(self) -> u64 {
        self.0
    }

    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Decode into a [`TaskKind`].
    #[must_use]
    pub const fn kind(self) -> TaskKind {
        if self.is_not_chunked() {
            TaskKind::Object(self.obj())
        } else {
            TaskKind::ArrayChunk {
                array: self.obj(),
                chunk: self.chunk_index(),
                pow: self.pow(),
            }
        }
    }
}

impl fmt::Debug for MarkTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            TaskKind::Object(obj) => write!(f, "MarkTask({obj:?})"),
            TaskKind::ArrayChunk { array, chunk, pow } => {
                write!(f, "MarkTask({array:?}, chunk {chunk}, pow {pow})")
            }
        }
    }
}

/// Element range covered by chunk `chunk` at exponent `pow`.
#[must_use]
pub const fn chunk_range(chunk: usize, pow: u32) -> Range<usize> {
    let width = 1usize << pow;
    (chunk - 1) * width..chunk * width
}
