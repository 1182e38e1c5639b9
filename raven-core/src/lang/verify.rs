//! Post-compile bytecode verification.
//!
//! The parser should never emit a malformed stream; this pass exists so
//! that a bug there surfaces as a compile failure instead of a runtime
//! fault deep inside some fiber. Checks: every byte decodes, operands
//! stay inside the stream, constant-pool indices are in bounds, message
//! constants are symbols, and jump targets land on opcode boundaries.

use std::collections::HashSet;

use crate::heap::Heap;
use crate::lang::bytecode::{read_wide, BinaryOp, Op, WIDE};
use crate::object::Function;
use crate::value::Value;

/// Verify one compiled function, returning a list of problems.
pub fn verify_function(function: &Function, heap: &Heap) -> Vec<String> {
    let mut problems = Vec::new();
    let code = &function.code;

    // First pass: decode and collect opcode boundaries.
    let mut boundaries = HashSet::new();
    let mut jumps = Vec::new();
    let mut at = 0;
    while at < code.len() {
        boundaries.insert(at);
        let Some(op) = Op::from_byte(code[at]) else {
            problems.push(format!("invalid opcode {:#04x} at byte {}", code[at], at));
            return problems;
        };
        if at + op.encoded_len() > code.len() {
            problems.push(format!("truncated {:?} at byte {}", op, at));
            return problems;
        }

        let operand = |index: usize| read_wide(code, at + 1 + index * WIDE).unwrap_or(0);
        match op {
            Op::LoadConst => check_constant(function, operand(0), at, &mut problems),
            Op::LoadFuncref | Op::Send | Op::SuperSend => {
                let index = operand(0);
                check_constant(function, index, at, &mut problems);
                match function.constant(index) {
                    Some(Value::Sym(_)) | None => {}
                    Some(other) => problems.push(format!(
                        "{:?} at byte {} names a {} constant, not a symbol",
                        op,
                        at,
                        other.kind_name()
                    )),
                }
            }
            Op::LoadLocal | Op::StoreLocal => {
                if operand(0) >= function.max_locals as u32 {
                    problems.push(format!(
                        "local index {} out of range at byte {} (max_locals {})",
                        operand(0),
                        at,
                        function.max_locals
                    ));
                }
            }
            Op::Binary => {
                if BinaryOp::from_wide(operand(0)).is_none() {
                    problems.push(format!(
                        "unknown binary op code {} at byte {}",
                        operand(0),
                        at
                    ));
                }
            }
            Op::Jump | Op::JumpIf | Op::JumpIfNot => jumps.push((at, operand(0))),
            _ => {}
        }
        at += op.encoded_len();
    }

    // Second pass: jump targets must be opcode boundaries.
    for (at, target) in jumps {
        if !boundaries.contains(&(target as usize)) {
            problems.push(format!(
                "jump at byte {} targets {} which is not an opcode boundary",
                at, target
            ));
        }
    }

    // Heap-handle constants must refer to live objects.
    for (index, constant) in function.constants.iter().enumerate() {
        if let Value::Obj(r) = constant {
            if heap.get(*r).is_none() {
                problems.push(format!("constant {} is a dangling heap handle", index));
            }
        }
    }

    problems
}

fn check_constant(function: &Function, index: u32, at: usize, problems: &mut Vec<String>) {
    if function.constant(index).is_none() {
        problems.push(format!(
            "constant index {} out of range at byte {} (pool size {})",
            index,
            at,
            function.constants.len()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::codewriter::CodeWriter;
    use crate::symbol::SymbolTable;

    #[test]
    fn well_formed_function_verifies() {
        let mut symbols = SymbolTable::new();
        let heap = Heap::new();
        let mut cw = CodeWriter::new(symbols.intern("f"));
        let top = cw.open_label();
        cw.place_label(top);
        cw.load_const(Value::Int(1));
        cw.push();
        cw.load_const(Value::Int(2));
        cw.binary(BinaryOp::Add);
        cw.jump_if(top);
        cw.ret();
        let f = cw.finish().unwrap();

        assert!(verify_function(&f, &heap).is_empty());
    }

    #[test]
    fn rejects_out_of_range_constants() {
        let mut symbols = SymbolTable::new();
        let heap = Heap::new();
        let f = Function {
            name: symbols.intern("f"),
            arity: 0,
            max_locals: 1,
            varargs: false,
            code: vec![Op::LoadConst as u8, 9, 0, 0, 0, Op::Return as u8],
            constants: vec![],
        };
        let problems = verify_function(&f, &heap);
        assert!(problems.iter().any(|p| p.contains("constant index 9")));
    }

    #[test]
    fn rejects_misaligned_jump_targets() {
        let mut symbols = SymbolTable::new();
        let heap = Heap::new();
        // Jump into the middle of its own operand.
        let f = Function {
            name: symbols.intern("f"),
            arity: 0,
            max_locals: 1,
            varargs: false,
            code: vec![Op::Jump as u8, 2, 0, 0, 0, Op::Return as u8],
            constants: vec![],
        };
        let problems = verify_function(&f, &heap);
        assert!(problems.iter().any(|p| p.contains("opcode boundary")));
    }

    #[test]
    fn rejects_non_symbol_send_messages() {
        let mut symbols = SymbolTable::new();
        let heap = Heap::new();
        let f = Function {
            name: symbols.intern("f"),
            arity: 0,
            max_locals: 1,
            varargs: false,
            code: vec![Op::Send as u8, 0, 0, 0, 0, 1, 0, 0, 0, Op::Return as u8],
            constants: vec![Value::Int(3)],
        };
        let problems = verify_function(&f, &heap);
        assert!(problems.iter().any(|p| p.contains("not a symbol")));
    }
}
