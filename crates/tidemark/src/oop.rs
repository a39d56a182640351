//! Reference handles and reference-holding slots.
//!
//! The marker never looks at raw slot contents. A [`RefSlot`] holds an encoded
//! word, and every access decodes it through a [`RefEncoding`] into an
//! [`ObjRef`], which is just an object address with an explicit null.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Opaque handle to a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct ObjRef(usize);

impl ObjRef {
    /// The "no reference" value.
    pub const NULL: Self = Self(0);

    /// Wrap an object address. Address zero is [`ObjRef::NULL`].
    #[must_use]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// The object's address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Whether this is the null reference.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("ObjRef(null)")
        } else {
            write!(f, "ObjRef({:#x})", self.0)
        }
    }
}

/// How references are stored in heap slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefEncoding {
    /// Slots hold full addresses.
    #[default]
    Wide,
    /// Slots hold `(addr - base) >> shift`. `base` must lie strictly below every
    /// object so that zero stays reserved for null.
    Compressed {
        /// Heap base subtracted before shifting.
        base: usize,
        /// Object alignment shift.
        shift: u32,
    },
}

impl RefEncoding {
    /// Encode a reference into a slot word.
    #[must_use]
    pub fn encode(self, obj: ObjRef) -> usize {
        if obj.is_null() {
            return 0;
        }
        match self {
            Self::Wide => obj.addr(),
            Self::Compressed { base, shift } => {
                debug_assert!(obj.addr() > base, "{obj:?} lies below the compressed base");
                debug_assert_eq!(
                    (obj.addr() - base) & ((1 << shift) - 1),
                    0,
                    "{obj:?} is not aligned for shift {shift}"
                );
                (obj.addr() - base) >> shift
            }
        }
    }

    /// Decode a slot word into a reference.
    #[must_use]
    pub const fn decode(self, raw: usize) -> ObjRef {
        if raw == 0 {
            return ObjRef::NULL;
        }
        match self {
            Self::Wide => ObjRef(raw),
            Self::Compressed { base, shift } => ObjRef(base + (raw << shift)),
        }
    }
}

/// A location holding a reference: an object field, an array element, or a
/// snapshot-buffer entry.
#[repr(transparent)]
pub struct RefSlot(AtomicUsize);

impl RefSlot {
    /// A slot holding null.
    #[must_use]
    pub const fn null() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// A slot holding `obj`, stored with `encoding`.
    #[must_use]
    pub fn new(obj: ObjRef, encoding: RefEncoding) -> Self {
        Self(AtomicUsize::new(encoding.encode(obj)))
    }

    /// Load and decode the reference.
    #[inline]
    #[must_use]
    pub fn load(&self, encoding: RefEncoding) -> ObjRef {
        encoding.decode(self.0.load(Ordering::Acquire))
    }

    /// Encode and store a reference.
    #[inline]
    pub fn store(&self, obj: ObjRef, encoding: RefEncoding) {
        self.0.store(encoding.encode(obj), Ordering::Release);
    }

    /// Replace `current` with `new` if the slot still holds `current`.
    ///
    /// # Errors
    ///
    /// Returns the reference actually found in the slot when it no longer
    /// holds `current`.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: ObjRef,
        new: ObjRef,
        encoding: RefEncoding,
    ) -> Result<ObjRef, ObjRef> {
        self.0
            .compare_exchange(
                encoding.encode(current),
                encoding.encode(new),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|raw| encoding.decode(raw))
            .map_err(|raw| encoding.decode(raw))
    }

    /// The encoded word, for diagnostics.
    #[must_use]
    pub fn raw(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for RefSlot {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for RefSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefSlot({:#x})", self.raw())
    }
}
