use alloc::{collections::BTreeMap, string::String, vec::Vec};
use core::fmt;

// VALUE TYPES
// ================================================================================================

/// A value type of the target stack machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    /// A reference to an interned structural type (a source class or
    /// interface).
    Ref(StructTypeId),
    /// The opaque reference produced by a `catch` marker.
    ExnRef,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32 => f.write_str("i32"),
            Self::I64 => f.write_str("i64"),
            Self::F32 => f.write_str("f32"),
            Self::F64 => f.write_str("f64"),
            Self::Ref(id) => write!(f, "ref({})", id.as_u32()),
            Self::ExnRef => f.write_str("exnref"),
        }
    }
}

// TYPE IDS
// ================================================================================================

/// Identifier of an interned structural type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StructTypeId(u32);

impl StructTypeId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Identifier of an interned block signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockTypeId(u32);

impl BlockTypeId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

// BLOCK SIGNATURES
// ================================================================================================

/// A full (params -> results) signature of a structured region.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockSig {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

/// The signature carried by a structural marker.
///
/// Markers start out [`BlockType::Empty`]; the block-type inference pass
/// upgrades them in place once the operand-stack effect of the region
/// interior is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// No parameters, no results.
    Empty,
    /// No parameters, a single result.
    Result(ValueType),
    /// An interned (params -> results) signature.
    Func(BlockTypeId),
}

// TYPE TABLE
// ================================================================================================

/// Process-wide interner for structural types and block signatures.
///
/// The restructurer itself is a per-method value; this table is the one
/// collaborator that outlives it. Interning keys are stable for the lifetime
/// of the table, so ids may be embedded into emitted instructions.
#[derive(Debug, Default)]
pub struct TypeTable {
    structs: Vec<String>,
    struct_ids: BTreeMap<String, StructTypeId>,
    sigs: Vec<BlockSig>,
    sig_ids: BTreeMap<BlockSig, BlockTypeId>,
}

impl TypeTable {
    /// Returns a new, empty table.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Interning
impl TypeTable {
    /// Interns a (params -> results) signature and returns its id.
    pub fn block_type(&mut self, params: &[ValueType], results: &[ValueType]) -> BlockTypeId {
        let sig = BlockSig {
            params: params.to_vec(),
            results: results.to_vec(),
        };
        if let Some(id) = self.sig_ids.get(&sig) {
            return *id;
        }
        let id = BlockTypeId(self.sigs.len() as u32);
        self.sigs.push(sig.clone());
        self.sig_ids.insert(sig, id);
        id
    }

    /// Resolves a named structural type to a reference value type, interning
    /// the name on first use.
    pub fn value_of(&mut self, class_name: &str) -> ValueType {
        ValueType::Ref(self.struct_id(class_name))
    }

    /// Interns a structural type name and returns its id.
    pub fn struct_id(&mut self, class_name: &str) -> StructTypeId {
        if let Some(id) = self.struct_ids.get(class_name) {
            return *id;
        }
        let id = StructTypeId(self.structs.len() as u32);
        self.structs.push(String::from(class_name));
        self.struct_ids.insert(String::from(class_name), id);
        id
    }
}

/// Lookups
impl TypeTable {
    /// Returns the signature interned under the given id.
    pub fn sig(&self, id: BlockTypeId) -> &BlockSig {
        &self.sigs[id.0 as usize]
    }

    /// Returns the name of an interned structural type.
    pub fn struct_name(&self, id: StructTypeId) -> &str {
        &self.structs[id.0 as usize]
    }
}
