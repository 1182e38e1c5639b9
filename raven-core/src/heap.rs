//! Heap arena and mark-and-sweep collector.
//!
//! Every script-visible heap object lives in one slot arena addressed by
//! [`ObjRef`] handles. The collector is a plain worklist mark-and-sweep:
//! the engine gathers roots (fiber stacks, file-node caches, bound
//! connections) at a scheduler safe point and calls [`Heap::collect`].

use crate::object::{Blueprint, Function, Funcref, Instance, Mapping};
use crate::symbol::SymbolTable;
use crate::value::Value;

/// Handle to a heap slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Concrete kind of a heap object.
#[derive(Clone, Debug)]
pub enum HeapKind {
    Str(String),
    Array(Vec<Value>),
    Mapping(Mapping),
    Function(Function),
    Blueprint(Blueprint),
    Object(Instance),
    Funcref(Funcref),
}

impl HeapKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapKind::Str(_) => "string",
            HeapKind::Array(_) => "array",
            HeapKind::Mapping(_) => "mapping",
            HeapKind::Function(_) => "function",
            HeapKind::Blueprint(_) => "blueprint",
            HeapKind::Object(_) => "object",
            HeapKind::Funcref(_) => "funcref",
        }
    }
}

#[derive(Debug)]
struct HeapSlot {
    marked: bool,
    kind: HeapKind,
}

/// Result of one collection cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub live: usize,
    pub freed: usize,
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<HeapSlot>>,
    free: Vec<u32>,
    /// Allocations since the last sweep; the engine reads this to decide
    /// when a cycle is due.
    allocated_since_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, kind: HeapKind) -> ObjRef {
        self.allocated_since_gc += 1;
        let slot = HeapSlot {
            marked: false,
            kind,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                ObjRef(idx)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn alloc_str(&mut self, s: impl Into<String>) -> ObjRef {
        self.alloc(HeapKind::Str(s.into()))
    }

    pub fn get(&self, r: ObjRef) -> Option<&HeapKind> {
        self.slots.get(r.index())?.as_ref().map(|s| &s.kind)
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut HeapKind> {
        self.slots.get_mut(r.index())?.as_mut().map(|s| &mut s.kind)
    }

    // ── Typed accessors ──

    pub fn str_(&self, r: ObjRef) -> Option<&str> {
        match self.get(r)? {
            HeapKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn array(&self, r: ObjRef) -> Option<&Vec<Value>> {
        match self.get(r)? {
            HeapKind::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn array_mut(&mut self, r: ObjRef) -> Option<&mut Vec<Value>> {
        match self.get_mut(r)? {
            HeapKind::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn mapping(&self, r: ObjRef) -> Option<&Mapping> {
        match self.get(r)? {
            HeapKind::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn function(&self, r: ObjRef) -> Option<&Function> {
        match self.get(r)? {
            HeapKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn blueprint(&self, r: ObjRef) -> Option<&Blueprint> {
        match self.get(r)? {
            HeapKind::Blueprint(b) => Some(b),
            _ => None,
        }
    }

    pub fn object(&self, r: ObjRef) -> Option<&Instance> {
        match self.get(r)? {
            HeapKind::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn object_mut(&mut self, r: ObjRef) -> Option<&mut Instance> {
        match self.get_mut(r)? {
            HeapKind::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn funcref(&self, r: ObjRef) -> Option<Funcref> {
        match self.get(r)? {
            HeapKind::Funcref(f) => Some(*f),
            _ => None,
        }
    }

    // ── Comparison and rendering ──

    /// Script-level equality: structural for immediates, by content for
    /// strings, identity for every other heap kind.
    pub fn value_eq(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Obj(x), Value::Obj(y)) => {
                if x == y {
                    return true;
                }
                match (self.get(x), self.get(y)) {
                    (Some(HeapKind::Str(s)), Some(HeapKind::Str(t))) => s == t,
                    _ => false,
                }
            }
            _ => a == b,
        }
    }

    /// Render a value for `write` output and fault diagnostics.
    pub fn display_value(&self, v: Value, symbols: &SymbolTable) -> String {
        self.display_depth(v, symbols, 0)
    }

    fn display_depth(&self, v: Value, symbols: &SymbolTable, depth: u8) -> String {
        // Containers can be cyclic; cut the rendering off instead.
        if depth > 8 {
            return "…".to_string();
        }
        match v {
            Value::Nil => "nil".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Char(c) => c.to_string(),
            Value::Sym(s) => format!("'{}", symbols.name(s)),
            Value::Obj(r) => match self.get(r) {
                Some(HeapKind::Str(s)) => s.clone(),
                Some(HeapKind::Array(items)) => {
                    let parts: Vec<String> = items
                        .iter()
                        .map(|v| self.display_depth(*v, symbols, depth + 1))
                        .collect();
                    format!("[{}]", parts.join(", "))
                }
                Some(HeapKind::Mapping(m)) => {
                    let parts: Vec<String> = m
                        .entries
                        .iter()
                        .map(|(k, v)| {
                            format!(
                                "{}: {}",
                                self.display_depth(*k, symbols, depth + 1),
                                self.display_depth(*v, symbols, depth + 1)
                            )
                        })
                        .collect();
                    format!("[{}]", parts.join(", "))
                }
                Some(HeapKind::Function(f)) => format!("<function {}>", symbols.name(f.name)),
                Some(HeapKind::Blueprint(_)) => "<blueprint>".to_string(),
                Some(HeapKind::Object(_)) => "<object>".to_string(),
                Some(HeapKind::Funcref(f)) => format!("<&{}>", symbols.name(f.message)),
                None => "<stale>".to_string(),
            },
        }
    }

    // ── Mapping operations ──
    //
    // Key comparison needs heap access (string keys compare by content),
    // so these live here rather than on `Mapping`.

    pub fn mapping_lookup(&self, map: ObjRef, key: Value) -> Option<Value> {
        let m = self.mapping(map)?;
        m.entries
            .iter()
            .find(|(k, _)| self.value_eq(*k, key))
            .map(|(_, v)| *v)
    }

    /// Insert or overwrite, preserving first-insertion order.
    pub fn mapping_insert(&mut self, map: ObjRef, key: Value, value: Value) -> bool {
        let existing = match self.mapping(map) {
            Some(m) => m
                .entries
                .iter()
                .position(|(k, _)| self.value_eq(*k, key)),
            None => return false,
        };
        match self.get_mut(map) {
            Some(HeapKind::Mapping(m)) => {
                match existing {
                    Some(i) => m.entries[i].1 = value,
                    None => m.entries.push((key, value)),
                }
                true
            }
            _ => false,
        }
    }

    // ── Garbage collection ──

    pub fn allocated_since_gc(&self) -> usize {
        self.allocated_since_gc
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Mark from `roots`, then sweep. Unmarked slots are freed exactly
    /// once; survivors come out with their mark bit cleared.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ObjRef>) -> GcStats {
        let mut worklist: Vec<ObjRef> = roots.into_iter().collect();

        while let Some(r) = worklist.pop() {
            let newly_marked = match self.slots.get_mut(r.index()) {
                Some(Some(slot)) if !slot.marked => {
                    slot.marked = true;
                    true
                }
                _ => false,
            };
            if !newly_marked {
                continue;
            }
            if let Some(kind) = self.get(r) {
                push_children(kind, &mut worklist);
            }
        }

        let mut stats = GcStats::default();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(s) if s.marked => {
                    s.marked = false;
                    stats.live += 1;
                }
                Some(_) => {
                    *slot = None;
                    self.free.push(idx as u32);
                    stats.freed += 1;
                }
                None => {}
            }
        }
        self.allocated_since_gc = 0;
        stats
    }
}

fn push_children(kind: &HeapKind, worklist: &mut Vec<ObjRef>) {
    let mut push_value = |v: &Value| {
        if let Value::Obj(r) = v {
            worklist.push(*r);
        }
    };
    match kind {
        HeapKind::Str(_) => {}
        HeapKind::Array(items) => items.iter().for_each(push_value),
        HeapKind::Mapping(m) => {
            for (k, v) in &m.entries {
                push_value(k);
                push_value(v);
            }
        }
        HeapKind::Function(f) => f.constants.iter().for_each(push_value),
        HeapKind::Blueprint(b) => {
            if let Some(p) = b.parent {
                worklist.push(p);
            }
            worklist.extend(b.methods.values().copied());
        }
        HeapKind::Object(o) => {
            o.slots.iter().for_each(&mut push_value);
            worklist.push(o.blueprint);
        }
        HeapKind::Funcref(f) => push_value(&f.receiver),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Mapping;

    #[test]
    fn alloc_and_access() {
        let mut heap = Heap::new();
        let s = heap.alloc_str("hello");
        assert_eq!(heap.str_(s), Some("hello"));
        assert_eq!(heap.get(s).map(|k| k.kind_name()), Some("string"));
    }

    #[test]
    fn string_equality_by_content() {
        let mut heap = Heap::new();
        let a = heap.alloc_str("abc");
        let b = heap.alloc_str("abc");
        let c = heap.alloc_str("xyz");

        assert_ne!(a, b);
        assert!(heap.value_eq(Value::Obj(a), Value::Obj(b)));
        assert!(!heap.value_eq(Value::Obj(a), Value::Obj(c)));
        // Other heap kinds keep identity semantics.
        let arr1 = heap.alloc(HeapKind::Array(vec![]));
        let arr2 = heap.alloc(HeapKind::Array(vec![]));
        assert!(!heap.value_eq(Value::Obj(arr1), Value::Obj(arr2)));
    }

    #[test]
    fn mapping_preserves_insertion_order() {
        let mut heap = Heap::new();
        let map = heap.alloc(HeapKind::Mapping(Mapping::default()));
        let k1 = Value::Obj(heap.alloc_str("one"));
        let k2 = Value::Obj(heap.alloc_str("two"));
        heap.mapping_insert(map, k1, Value::Int(1));
        heap.mapping_insert(map, k2, Value::Int(2));
        // Overwrite through an equal-but-distinct key object.
        let k1_again = Value::Obj(heap.alloc_str("one"));
        heap.mapping_insert(map, k1_again, Value::Int(10));

        let m = heap.mapping(map).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(heap.mapping_lookup(map, k1_again), Some(Value::Int(10)));
        assert_eq!(m.entries[0].1, Value::Int(10));
        assert_eq!(m.entries[1].1, Value::Int(2));
    }

    #[test]
    fn collect_frees_unreachable_and_clears_marks() {
        let mut heap = Heap::new();
        let keep_inner = heap.alloc_str("kept");
        let keep = heap.alloc(HeapKind::Array(vec![Value::Obj(keep_inner)]));
        let drop1 = heap.alloc_str("dropped");
        let drop2 = heap.alloc(HeapKind::Array(vec![Value::Obj(drop1)]));

        let stats = heap.collect([keep]);
        assert_eq!(stats.live, 2);
        assert_eq!(stats.freed, 2);
        assert!(heap.get(keep).is_some());
        assert!(heap.get(keep_inner).is_some());
        assert!(heap.get(drop1).is_none());
        assert!(heap.get(drop2).is_none());

        // A second cycle must see cleared marks and keep the survivors.
        let stats = heap.collect([keep]);
        assert_eq!(stats.live, 2);
        assert_eq!(stats.freed, 0);
    }

    #[test]
    fn collect_handles_cycles() {
        let mut heap = Heap::new();
        let a = heap.alloc(HeapKind::Array(vec![]));
        let b = heap.alloc(HeapKind::Array(vec![Value::Obj(a)]));
        heap.array_mut(a).unwrap().push(Value::Obj(b));

        let stats = heap.collect([a]);
        assert_eq!(stats.live, 2);

        let stats = heap.collect([]);
        assert_eq!(stats.freed, 2);
        assert_eq!(stats.live, 0);
    }
}
