//! Compiler façade: lexical scopes, loop bookkeeping, name resolution.
//!
//! The parser talks to this layer only; actual byte emission is delegated
//! to the [`CodeWriter`]. One `Compiler` exists per compiled function.

use anyhow::Result;

use crate::heap::{Heap, ObjRef};
use crate::lang::bytecode::BinaryOp;
use crate::lang::codewriter::{CodeWriter, Label};
use crate::object::{Function, SlotDef, TypeTag};
use crate::symbol::Symbol;
use crate::value::Value;
use crate::vfs::FileId;

/// Accumulates a blueprint during a file compile: parent link, member
/// slot layout, and finished method functions in definition order.
pub struct BlueprintBuilder {
    pub file: Option<FileId>,
    pub parent: Option<ObjRef>,
    /// Slot count of the whole parent chain; own slots start here.
    pub inherited_slots: u16,
    /// Linearized name → slot index for every inherited member.
    inherited_names: Vec<(Symbol, u16)>,
    pub slots: Vec<SlotDef>,
    pub methods: Vec<(Symbol, Function)>,
}

impl BlueprintBuilder {
    pub fn new(file: Option<FileId>) -> Self {
        Self {
            file,
            parent: None,
            inherited_slots: 0,
            inherited_names: Vec::new(),
            slots: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Link the parent blueprint and absorb its linearized slot layout.
    pub fn set_parent(&mut self, heap: &Heap, parent: ObjRef) {
        self.parent = Some(parent);
        self.inherited_names.clear();
        self.inherited_slots = 0;

        let mut chain = Vec::new();
        let mut current = Some(parent);
        while let Some(bp_ref) = current {
            chain.push(bp_ref);
            current = heap.blueprint(bp_ref).and_then(|b| b.parent);
        }
        for bp_ref in chain {
            if let Some(bp) = heap.blueprint(bp_ref) {
                for (i, slot) in bp.slots.iter().enumerate() {
                    self.inherited_names
                        .push((slot.name, bp.slot_offset + i as u16));
                }
                self.inherited_slots = self.inherited_slots.max(bp.total_slots() as u16);
            }
        }
    }

    /// Declare an own member slot. `Err` on a duplicate name anywhere in
    /// the linearized layout.
    pub fn add_slot(&mut self, name: Symbol, ty: TypeTag) -> Result<u16, ()> {
        if self.member_index(name).is_some() {
            return Err(());
        }
        let index = self.inherited_slots + self.slots.len() as u16;
        self.slots.push(SlotDef { name, ty });
        Ok(index)
    }

    /// Linearized slot index of a member, own slots taking precedence.
    pub fn member_index(&self, name: Symbol) -> Option<u16> {
        if let Some(i) = self.slots.iter().position(|s| s.name == name) {
            return Some(self.inherited_slots + i as u16);
        }
        self.inherited_names
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, i)| *i)
    }

    pub fn total_slots(&self) -> u16 {
        self.inherited_slots + self.slots.len() as u16
    }

    pub fn has_method(&self, name: Symbol) -> bool {
        self.methods.iter().any(|(n, _)| *n == name)
    }

    pub fn add_method(&mut self, name: Symbol, function: Function) {
        self.methods.push((name, function));
    }
}

/// Where an identifier reference landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Local(u16),
    Member(u16),
    Funcref,
}

/// Saved loop labels, restored when the loop construct closes.
pub struct LoopContext {
    saved_break: Option<Label>,
    saved_continue: Option<Label>,
}

pub struct Compiler {
    cw: CodeWriter,
    /// Innermost scope last; each entry maps a name to its local slot.
    scopes: Vec<Vec<(Symbol, u16)>>,
    /// Next free local slot; slot 0 is the implicit self.
    next_local: u16,
    break_label: Option<Label>,
    continue_label: Option<Label>,
}

impl Compiler {
    pub fn new(name: Symbol) -> Self {
        Self {
            cw: CodeWriter::new(name),
            scopes: vec![Vec::new()],
            next_local: 1,
            break_label: None,
            continue_label: None,
        }
    }

    // ── Variables ──

    fn declare(&mut self, name: Symbol) -> Result<u16, ()> {
        let scope = self.scopes.last_mut().expect("scope stack never empty");
        if scope.iter().any(|(n, _)| *n == name) {
            return Err(());
        }
        let index = self.next_local;
        scope.push((name, index));
        self.next_local += 1;
        self.cw.report_locals(self.next_local - 1);
        Ok(index)
    }

    pub fn add_arg(&mut self, name: Symbol) -> Result<u16, ()> {
        let index = self.declare(name)?;
        self.cw.set_arity(index);
        Ok(index)
    }

    pub fn add_var(&mut self, name: Symbol) -> Result<u16, ()> {
        self.declare(name)
    }

    pub fn enable_varargs(&mut self) {
        self.cw.enable_varargs();
    }

    pub fn enter_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    pub fn leave_scope(&mut self) {
        let scope = self.scopes.pop().expect("scope stack never empty");
        self.next_local -= scope.len() as u16;
    }

    fn resolve_local(&self, name: Symbol) -> Option<u16> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.iter().find(|(n, _)| *n == name).map(|(_, i)| *i))
    }

    /// Emit a load for `name`: local, else member, else funcref.
    pub fn load_var(&mut self, name: Symbol, blueprint: &BlueprintBuilder) -> Resolution {
        if let Some(index) = self.resolve_local(name) {
            self.cw.load_local(index);
            Resolution::Local(index)
        } else if let Some(index) = blueprint.member_index(name) {
            self.cw.load_member(index);
            Resolution::Member(index)
        } else {
            self.cw.load_funcref(name);
            Resolution::Funcref
        }
    }

    /// Emit a store for `name`. `false` if the name is neither a local
    /// nor a member — funcrefs are not assignable.
    pub fn store_var(&mut self, name: Symbol, blueprint: &BlueprintBuilder) -> bool {
        if let Some(index) = self.resolve_local(name) {
            self.cw.store_local(index);
            true
        } else if let Some(index) = blueprint.member_index(name) {
            self.cw.store_member(index);
            true
        } else {
            false
        }
    }

    // ── Loop context ──

    pub fn enter_loop(&mut self, break_label: Label, continue_label: Label) -> LoopContext {
        LoopContext {
            saved_break: self.break_label.replace(break_label),
            saved_continue: self.continue_label.replace(continue_label),
        }
    }

    pub fn leave_loop(&mut self, saved: LoopContext) {
        self.break_label = saved.saved_break;
        self.continue_label = saved.saved_continue;
    }

    /// Jump to the innermost break label. `false` outside any loop.
    pub fn break_(&mut self) -> bool {
        match self.break_label {
            Some(label) => {
                self.cw.jump(label);
                true
            }
            None => false,
        }
    }

    /// Jump to the innermost continue label. `false` outside any loop.
    pub fn continue_(&mut self) -> bool {
        match self.continue_label {
            Some(label) => {
                self.cw.jump(label);
                true
            }
            None => false,
        }
    }

    // ── Emission pass-through ──

    pub fn load_self(&mut self) {
        self.cw.load_self();
    }

    pub fn load_const(&mut self, value: Value) {
        self.cw.load_const(value);
    }

    pub fn load_array(&mut self, size: u32) {
        self.cw.load_array(size);
    }

    pub fn load_mapping(&mut self, pairs: u32) {
        self.cw.load_mapping(pairs);
    }

    pub fn load_funcref(&mut self, name: Symbol) {
        self.cw.load_funcref(name);
    }

    pub fn store_member(&mut self, index: u16) {
        self.cw.store_member(index);
    }

    pub fn push_self(&mut self) {
        self.cw.push_self();
    }

    pub fn push(&mut self) {
        self.cw.push();
    }

    pub fn pop(&mut self) {
        self.cw.pop();
    }

    pub fn not(&mut self) {
        self.cw.not();
    }

    pub fn binary(&mut self, op: BinaryOp) {
        self.cw.binary(op);
    }

    pub fn send(&mut self, message: Symbol, argc: u32) {
        self.cw.send(message, argc);
    }

    pub fn super_send(&mut self, message: Symbol, argc: u32) {
        self.cw.super_send(message, argc);
    }

    pub fn ret(&mut self) {
        self.cw.ret();
    }

    pub fn open_label(&mut self) -> Label {
        self.cw.open_label()
    }

    pub fn place_label(&mut self, label: Label) {
        self.cw.place_label(label);
    }

    pub fn close_label(&mut self, label: Label) {
        self.cw.close_label(label);
    }

    pub fn jump(&mut self, label: Label) {
        self.cw.jump(label);
    }

    pub fn jump_if(&mut self, label: Label) {
        self.cw.jump_if(label);
    }

    pub fn jump_if_not(&mut self, label: Label) {
        self.cw.jump_if_not(label);
    }

    pub fn finish(self) -> Result<Function> {
        self.cw.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;

    #[test]
    fn locals_allocate_from_slot_one() {
        let mut symbols = SymbolTable::new();
        let mut c = Compiler::new(symbols.intern("f"));
        let a = c.add_arg(symbols.intern("a")).unwrap();
        let b = c.add_var(symbols.intern("b")).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn scopes_shadow_and_release() {
        let mut symbols = SymbolTable::new();
        let x = symbols.intern("x");
        let mut c = Compiler::new(symbols.intern("f"));

        let outer = c.add_var(x).unwrap();
        c.enter_scope();
        let inner = c.add_var(x).unwrap();
        assert_ne!(outer, inner);
        assert_eq!(c.resolve_local(x), Some(inner));
        c.leave_scope();
        assert_eq!(c.resolve_local(x), Some(outer));

        // Slot is reusable after the scope closed.
        c.enter_scope();
        let again = c.add_var(symbols.intern("y")).unwrap();
        assert_eq!(again, inner);
    }

    #[test]
    fn duplicate_in_same_scope_is_rejected() {
        let mut symbols = SymbolTable::new();
        let x = symbols.intern("x");
        let mut c = Compiler::new(symbols.intern("f"));
        c.add_var(x).unwrap();
        assert!(c.add_var(x).is_err());
    }

    #[test]
    fn unknown_names_fall_back_to_funcrefs() {
        let mut symbols = SymbolTable::new();
        let mut c = Compiler::new(symbols.intern("f"));
        let builder = BlueprintBuilder::new(None);
        let resolution = c.load_var(symbols.intern("mystery"), &builder);
        assert_eq!(resolution, Resolution::Funcref);
        assert!(!c.store_var(symbols.intern("mystery"), &builder));
    }

    #[test]
    fn break_outside_loop_is_refused() {
        let mut symbols = SymbolTable::new();
        let mut c = Compiler::new(symbols.intern("f"));
        assert!(!c.break_());
        assert!(!c.continue_());

        let b = c.open_label();
        let k = c.open_label();
        let saved = c.enter_loop(b, k);
        assert!(c.break_());
        assert!(c.continue_());
        c.leave_loop(saved);
        assert!(!c.break_());
    }

    #[test]
    fn builder_linearizes_member_slots() {
        let mut symbols = SymbolTable::new();
        let hp = symbols.intern("hp");
        let name = symbols.intern("name");
        let mut builder = BlueprintBuilder::new(None);
        assert_eq!(builder.add_slot(hp, TypeTag::Int), Ok(0));
        assert_eq!(builder.add_slot(name, TypeTag::String), Ok(1));
        assert!(builder.add_slot(hp, TypeTag::Int).is_err());
        assert_eq!(builder.member_index(name), Some(1));
        assert_eq!(builder.total_slots(), 2);
    }
}
