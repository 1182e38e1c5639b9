//! Heap object payloads: functions, blueprints, instances, funcrefs, mappings.

use std::collections::HashMap;

use crate::heap::{Heap, ObjRef};
use crate::symbol::Symbol;
use crate::value::Value;
use crate::vfs::FileId;

/// Declared type of a member slot or local. Advisory at runtime — the VM
/// is dynamically typed — but kept for diagnostics and slot layout dumps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeTag {
    Void,
    Any,
    Int,
    Char,
    String,
    Object,
    Mapping,
    Func,
}

impl TypeTag {
    /// Map a type keyword to its tag. `mixed` is a synonym for `any`.
    pub fn from_keyword(word: &str) -> Option<TypeTag> {
        Some(match word {
            "void" => TypeTag::Void,
            "any" | "mixed" => TypeTag::Any,
            "int" => TypeTag::Int,
            "char" => TypeTag::Char,
            "string" => TypeTag::String,
            "object" => TypeTag::Object,
            "mapping" => TypeTag::Mapping,
            "func" => TypeTag::Func,
            _ => return None,
        })
    }
}

/// A compiled method. Immutable once the code writer finishes it.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: Symbol,
    /// Declared parameter count (excluding `self`).
    pub arity: u16,
    /// Local slots required, including the implicit `self` at slot 0.
    pub max_locals: u16,
    /// Extra arguments beyond `arity` are collected into an array local.
    pub varargs: bool,
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
}

impl Function {
    pub fn constant(&self, index: u32) -> Option<Value> {
        self.constants.get(index as usize).copied()
    }
}

/// One member slot in a blueprint's layout.
#[derive(Clone, Copy, Debug)]
pub struct SlotDef {
    pub name: Symbol,
    pub ty: TypeTag,
}

/// A compiled class: method table, member slot layout, parent link.
///
/// Frozen once installed in a file node. Recompiling a file produces a
/// fresh blueprint; instances created earlier keep the old one.
#[derive(Clone, Debug)]
pub struct Blueprint {
    /// Back-reference to the virtual file this blueprint was compiled from.
    pub file: Option<FileId>,
    pub parent: Option<ObjRef>,
    pub methods: HashMap<Symbol, ObjRef>,
    /// Own slots only; inherited slots precede them in the instance layout.
    pub slots: Vec<SlotDef>,
    /// Sum of slot counts up the parent chain.
    pub slot_offset: u16,
    /// SHA-256 over the emitted bytecode, for recompile logging.
    pub code_version: [u8; 32],
}

impl Blueprint {
    /// Total instance slot count, inherited slots included.
    pub fn total_slots(&self) -> usize {
        self.slot_offset as usize + self.slots.len()
    }

    /// Index of an own member slot in the linearized layout.
    pub fn own_slot(&self, name: Symbol) -> Option<u16> {
        self.slots
            .iter()
            .position(|s| s.name == name)
            .map(|i| self.slot_offset + i as u16)
    }
}

/// A runtime instance of a blueprint.
#[derive(Clone, Debug)]
pub struct Instance {
    pub blueprint: ObjRef,
    /// One value per member slot, inherited slots first.
    pub slots: Vec<Value>,
}

/// A first-class reference to a method, bound to the receiver it was
/// created on. Invoking it sends `message` to `receiver`.
#[derive(Clone, Copy, Debug)]
pub struct Funcref {
    pub receiver: Value,
    pub message: Symbol,
}

/// Insertion-ordered key→value association.
///
/// Lookup is linear; world mappings are small and order is script-visible,
/// so an association vector beats a hash table here. Key comparison goes
/// through [`Heap::value_eq`] and therefore lives on the heap, not here.
#[derive(Clone, Debug, Default)]
pub struct Mapping {
    pub entries: Vec<(Value, Value)>,
}

impl Mapping {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Walk the parent chain starting at `blueprint`, returning the first
/// function bound to `message` together with its defining blueprint.
pub fn lookup_method(
    heap: &Heap,
    blueprint: ObjRef,
    message: Symbol,
) -> Option<(ObjRef, ObjRef)> {
    let mut current = Some(blueprint);
    while let Some(bp_ref) = current {
        let bp = heap.blueprint(bp_ref)?;
        if let Some(&func) = bp.methods.get(&message) {
            return Some((func, bp_ref));
        }
        current = bp.parent;
    }
    None
}

/// Method lookup for super-sends: starts above the defining blueprint of
/// the currently executing method, never at the dynamic receiver.
pub fn lookup_super_method(
    heap: &Heap,
    defining: ObjRef,
    message: Symbol,
) -> Option<(ObjRef, ObjRef)> {
    let parent = heap.blueprint(defining)?.parent?;
    lookup_method(heap, parent, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_keywords() {
        assert_eq!(TypeTag::from_keyword("int"), Some(TypeTag::Int));
        assert_eq!(TypeTag::from_keyword("mixed"), Some(TypeTag::Any));
        assert_eq!(TypeTag::from_keyword("float"), None);
    }
}
