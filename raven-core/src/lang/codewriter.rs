//! Append-only bytecode assembler with constant pool and label fixups.

use anyhow::{anyhow, Result};

use crate::lang::bytecode::{BinaryOp, Op, WIDE};
use crate::object::Function;
use crate::symbol::Symbol;
use crate::value::Value;

/// Opaque handle to a jump target.
///
/// Labels are opened before their position is known, referenced by any
/// number of jumps, and placed once. Jumps emitted before placement
/// write a placeholder and record a patch site; placement overwrites
/// every pending site with the real offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(u32);

pub struct CodeWriter {
    name: Symbol,
    code: Vec<u8>,
    constants: Vec<Value>,
    /// Label → resolved byte offset, `None` until placed.
    labels: Vec<Option<u32>>,
    /// Placeholder byte offset → label it awaits.
    patches: Vec<(usize, Label)>,
    arity: u16,
    max_locals: u16,
    varargs: bool,
}

impl CodeWriter {
    pub fn new(name: Symbol) -> Self {
        Self {
            name,
            code: Vec::with_capacity(128),
            constants: Vec::new(),
            labels: Vec::new(),
            patches: Vec::new(),
            arity: 0,
            max_locals: 0,
            varargs: false,
        }
    }

    /// Current fill of the code buffer.
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn set_arity(&mut self, arity: u16) {
        self.arity = arity;
    }

    /// Record the high-water mark of allocated locals (excluding self).
    pub fn report_locals(&mut self, locals: u16) {
        if locals > self.max_locals {
            self.max_locals = locals;
        }
    }

    pub fn enable_varargs(&mut self) {
        self.varargs = true;
    }

    // ── Raw emission ──

    fn write(&mut self, op: Op) {
        self.code.push(op as u8);
    }

    fn write_wide(&mut self, wide: u32) {
        self.code.extend_from_slice(&wide.to_le_bytes());
    }

    fn patch_wide(&mut self, at: usize, wide: u32) {
        self.code[at..at + WIDE].copy_from_slice(&wide.to_le_bytes());
    }

    /// Intern a constant and emit its pool index as a wide operand.
    ///
    /// The pool is growable; equal cells (by identity for heap handles)
    /// share an index.
    fn write_constant(&mut self, value: Value) -> u32 {
        let index = match self.constants.iter().position(|c| *c == value) {
            Some(i) => i as u32,
            None => {
                self.constants.push(value);
                (self.constants.len() - 1) as u32
            }
        };
        self.write_wide(index);
        index
    }

    // ── Instruction emitters ──

    pub fn load_self(&mut self) {
        self.write(Op::LoadSelf);
    }

    pub fn load_const(&mut self, value: Value) {
        self.write(Op::LoadConst);
        self.write_constant(value);
    }

    pub fn load_array(&mut self, size: u32) {
        self.write(Op::LoadArray);
        self.write_wide(size);
    }

    pub fn load_mapping(&mut self, pairs: u32) {
        self.write(Op::LoadMapping);
        self.write_wide(pairs);
    }

    pub fn load_funcref(&mut self, name: Symbol) {
        self.write(Op::LoadFuncref);
        self.write_constant(Value::Sym(name));
    }

    pub fn load_local(&mut self, index: u16) {
        self.write(Op::LoadLocal);
        self.write_wide(index as u32);
    }

    pub fn load_member(&mut self, index: u16) {
        self.write(Op::LoadMember);
        self.write_wide(index as u32);
    }

    pub fn store_local(&mut self, index: u16) {
        self.write(Op::StoreLocal);
        self.write_wide(index as u32);
    }

    pub fn store_member(&mut self, index: u16) {
        self.write(Op::StoreMember);
        self.write_wide(index as u32);
    }

    pub fn push_self(&mut self) {
        self.write(Op::PushSelf);
    }

    pub fn push(&mut self) {
        self.write(Op::Push);
    }

    pub fn pop(&mut self) {
        self.write(Op::Pop);
    }

    pub fn not(&mut self) {
        self.write(Op::Not);
    }

    pub fn binary(&mut self, op: BinaryOp) {
        self.write(Op::Binary);
        self.write_wide(op as u32);
    }

    pub fn send(&mut self, message: Symbol, argc: u32) {
        self.write(Op::Send);
        self.write_constant(Value::Sym(message));
        self.write_wide(argc);
    }

    pub fn super_send(&mut self, message: Symbol, argc: u32) {
        self.write(Op::SuperSend);
        self.write_constant(Value::Sym(message));
        self.write_wide(argc);
    }

    pub fn ret(&mut self) {
        self.write(Op::Return);
    }

    // ── Labels ──

    pub fn open_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Resolve `label` to the current fill and patch every pending jump.
    pub fn place_label(&mut self, label: Label) {
        let target = self.here();
        self.labels[label.0 as usize] = Some(target);

        let mut pending = Vec::new();
        self.patches.retain(|&(at, awaited)| {
            if awaited == label {
                pending.push(at);
                false
            } else {
                true
            }
        });
        for at in pending {
            self.patch_wide(at, target);
        }
    }

    /// Release a label handle. The label must have been placed if any
    /// jump referenced it; `finish` reports the leak otherwise.
    pub fn close_label(&mut self, _label: Label) {
        // Handles are not reused; the patch list is the source of truth.
    }

    fn write_label_operand(&mut self, label: Label) {
        match self.labels[label.0 as usize] {
            Some(target) => self.write_wide(target),
            None => {
                self.patches.push((self.code.len(), label));
                self.write_wide(0);
            }
        }
    }

    pub fn jump(&mut self, label: Label) {
        self.write(Op::Jump);
        self.write_label_operand(label);
    }

    pub fn jump_if(&mut self, label: Label) {
        self.write(Op::JumpIf);
        self.write_label_operand(label);
    }

    pub fn jump_if_not(&mut self, label: Label) {
        self.write(Op::JumpIfNot);
        self.write_label_operand(label);
    }

    // ── Finish ──

    /// Seal the stream into an immutable function.
    ///
    /// Fails if any jump still awaits an unplaced label — that is a bug
    /// in the emitting parser, not in the compiled source.
    pub fn finish(self) -> Result<Function> {
        if let Some(&(at, label)) = self.patches.first() {
            return Err(anyhow!(
                "unresolved jump at byte {} awaiting label {:?}",
                at,
                label
            ));
        }
        Ok(Function {
            name: self.name,
            arity: self.arity,
            max_locals: self.max_locals + 1, // + 1 for self
            varargs: self.varargs,
            code: self.code,
            constants: self.constants,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::bytecode::read_wide;
    use crate::symbol::SymbolTable;

    fn writer(symbols: &mut SymbolTable) -> CodeWriter {
        CodeWriter::new(symbols.intern("f"))
    }

    #[test]
    fn backward_jump_resolves_immediately() {
        let mut symbols = SymbolTable::new();
        let mut cw = writer(&mut symbols);

        let top = cw.open_label();
        cw.place_label(top);
        cw.load_const(Value::Int(1));
        cw.jump(top);
        cw.close_label(top);
        cw.ret();

        let f = cw.finish().unwrap();
        // Jump operand points back at offset 0.
        let jump_at = 1 + WIDE; // after LoadConst + its operand
        assert_eq!(f.code[jump_at], Op::Jump as u8);
        assert_eq!(read_wide(&f.code, jump_at + 1), Some(0));
    }

    #[test]
    fn forward_jump_is_patched_on_placement() {
        let mut symbols = SymbolTable::new();
        let mut cw = writer(&mut symbols);

        let end = cw.open_label();
        cw.jump_if_not(end);
        cw.load_const(Value::Int(7));
        cw.place_label(end);
        cw.close_label(end);
        cw.ret();

        let f = cw.finish().unwrap();
        let target = read_wide(&f.code, 1).unwrap();
        assert_eq!(target as usize, 1 + WIDE + 1 + WIDE); // past LoadConst
        assert_eq!(f.code[target as usize], Op::Return as u8);
    }

    #[test]
    fn several_jumps_to_one_label() {
        let mut symbols = SymbolTable::new();
        let mut cw = writer(&mut symbols);

        let out = cw.open_label();
        cw.jump(out);
        cw.jump(out);
        cw.jump(out);
        cw.place_label(out);
        cw.ret();

        let f = cw.finish().unwrap();
        let target = (3 * (1 + WIDE)) as u32;
        for i in 0..3 {
            assert_eq!(read_wide(&f.code, i * (1 + WIDE) + 1), Some(target));
        }
    }

    #[test]
    fn finish_rejects_unplaced_labels() {
        let mut symbols = SymbolTable::new();
        let mut cw = writer(&mut symbols);

        let never = cw.open_label();
        cw.jump(never);

        assert!(cw.finish().is_err());
    }

    #[test]
    fn constants_share_pool_slots() {
        let mut symbols = SymbolTable::new();
        let greet = symbols.intern("greet");
        let mut cw = writer(&mut symbols);

        cw.load_const(Value::Int(42));
        cw.load_const(Value::Int(42));
        cw.send(greet, 0);
        cw.send(greet, 1);
        cw.ret();

        let f = cw.finish().unwrap();
        assert_eq!(f.constants.len(), 2); // 42 and 'greet
    }

    #[test]
    fn max_locals_accounts_for_self() {
        let mut symbols = SymbolTable::new();
        let mut cw = writer(&mut symbols);
        cw.report_locals(3);
        cw.report_locals(1);
        cw.ret();

        let f = cw.finish().unwrap();
        assert_eq!(f.max_locals, 4);
    }
}
