use weft_core::{FnRef, TypeTable, ValueType};

// TRANSLATION OPTIONS
// ================================================================================================

/// Collaborator bundle handed to the manager at construction.
///
/// The type table is the only process-wide state the engine touches; the
/// manager itself is a per-method value.
#[derive(Debug)]
pub struct TranslationOptions {
    /// Interner for structural types and block signatures.
    pub types: TypeTable,
    instance_of: FnRef,
    use_eh: bool,
    use_gc: bool,
}

impl TranslationOptions {
    /// Returns a new options bundle.
    ///
    /// `instance_of` is the host function the catch dispatch calls to test a
    /// caught reference against a class index; it takes the reference and the
    /// index and returns an `i32` truth value.
    pub fn new(types: TypeTable, instance_of: FnRef, use_eh: bool, use_gc: bool) -> Self {
        Self { types, instance_of, use_eh, use_gc }
    }

    /// The runtime type-check function reference.
    pub fn instance_of(&self) -> FnRef {
        self.instance_of
    }

    /// Whether the target supports exception handling. When false, catches
    /// degrade to unreachable stubs.
    pub fn use_eh(&self) -> bool {
        self.use_eh
    }

    /// Whether the target supports typed garbage-collected references. When
    /// false, caught exceptions stay opaque.
    pub fn use_gc(&self) -> bool {
        self.use_gc
    }
}

// LOCAL TEMPORARIES
// ================================================================================================

/// Allocator for the typed temporaries the lowering needs: the spilled
/// scrutinee of a lookup switch and the caught reference of a handler
/// dispatch.
///
/// Slots are handed out past the method's own local range and reused per
/// type, the way the surrounding translator manages its frame.
#[derive(Debug)]
pub struct LocalAllocator {
    next: u32,
    cache: smallvec::SmallVec<[(ValueType, u32); 4]>,
}

impl LocalAllocator {
    /// Returns an allocator whose first free slot is `base` (one past the
    /// method's declared locals).
    pub fn new(base: u32) -> Self {
        Self { next: base, cache: smallvec::SmallVec::new() }
    }

    /// Returns a temporary slot of the given type, reusing one type-compatible
    /// slot per type.
    pub fn temp(&mut self, ty: ValueType) -> u32 {
        if let Some((_, slot)) = self.cache.iter().find(|(t, _)| *t == ty) {
            return *slot;
        }
        let slot = self.next;
        self.next += 1;
        self.cache.push((ty, slot));
        slot
    }

    /// One past the highest slot handed out so far.
    pub fn frame_size(&self) -> u32 {
        self.next
    }

    /// Forgets all handed-out temporaries.
    pub fn reset(&mut self, base: u32) {
        self.next = base;
        self.cache.clear();
    }
}
