//! The bytecode interpreter.
//!
//! One `Vm` runs one fiber for one budgeted slice; the scheduler loop in
//! the engine is the only caller. Fibers carry all execution state, so
//! suspending on blocked input is simply returning without advancing the
//! instruction pointer — the send that invoked the blocking primitive
//! re-executes when the fiber wakes.

use crate::builtins::Builtin;
use crate::engine::Engine;
use crate::error::VmFault;
use crate::fiber::{Fiber, FiberState, Frame};
use crate::heap::HeapKind;
use crate::lang::bytecode::{read_wide, BinaryOp, Op, STACK_LIMIT, WIDE};
use crate::object::{lookup_method, lookup_super_method, Funcref, Mapping};
use crate::symbol::Symbol;
use crate::value::Value;

/// Frames per fiber before a runaway recursion faults.
pub const CALL_DEPTH_LIMIT: usize = 256;

/// Result of one budgeted slice on a fiber.
#[derive(Debug)]
pub enum RunOutcome {
    /// Budget exhausted; the fiber is ready to continue next round.
    Yielded,
    /// Parked on connection input.
    Blocked,
    /// The outermost frame returned; the accumulator holds the result.
    Finished,
    /// The fiber faulted and will not run again.
    Faulted(VmFault),
}

enum Step {
    Continue,
    Blocked,
    Finished,
}

pub struct Vm<'a> {
    engine: &'a mut Engine,
}

impl<'a> Vm<'a> {
    pub fn new(engine: &'a mut Engine) -> Self {
        Self { engine }
    }

    /// Execute up to `budget` instructions on `fiber`.
    pub fn run_fiber(&mut self, fiber: &mut Fiber, budget: u32) -> RunOutcome {
        fiber.state = FiberState::Running;
        for _ in 0..budget {
            match self.step(fiber) {
                Ok(Step::Continue) => {}
                Ok(Step::Blocked) => {
                    fiber.state = FiberState::BlockedOnInput;
                    return RunOutcome::Blocked;
                }
                Ok(Step::Finished) => {
                    fiber.state = FiberState::Finished;
                    return RunOutcome::Finished;
                }
                Err(fault) => {
                    fiber.state = FiberState::Faulted;
                    return RunOutcome::Faulted(fault);
                }
            }
        }
        fiber.state = FiberState::Ready;
        RunOutcome::Yielded
    }

    fn step(&mut self, fiber: &mut Fiber) -> Result<Step, VmFault> {
        let Some(frame) = fiber.frames.last().copied() else {
            return Ok(Step::Finished);
        };

        // Decode under a short heap borrow; operands are copied out.
        let (op, w0, w1, max_locals) = {
            let func = self
                .engine
                .heap
                .function(frame.function)
                .ok_or(VmFault::StaleHandle)?;
            let code = &func.code;
            let byte = *code
                .get(frame.ip)
                .ok_or(VmFault::InvalidBytecode { offset: frame.ip })?;
            let op = Op::from_byte(byte).ok_or(VmFault::InvalidBytecode { offset: frame.ip })?;
            let mut w = [0u32; 2];
            for (i, slot) in w.iter_mut().enumerate().take(op.operand_count()) {
                *slot = read_wide(code, frame.ip + 1 + i * WIDE)
                    .ok_or(VmFault::InvalidBytecode { offset: frame.ip })?;
            }
            (op, w[0], w[1], func.max_locals as usize)
        };
        let next_ip = frame.ip + op.encoded_len();
        let locals_top = frame.base + max_locals;

        match op {
            Op::LoadSelf => fiber.acc = frame.this,
            Op::LoadConst => fiber.acc = self.constant(&frame, w0)?,
            Op::LoadArray => {
                let n = w0 as usize;
                if fiber.stack.len() < locals_top + n {
                    return Err(VmFault::StackUnderflow);
                }
                let at = fiber.stack.len() - n;
                let items = fiber.stack.split_off(at);
                fiber.acc = Value::Obj(self.engine.heap.alloc(HeapKind::Array(items)));
            }
            Op::LoadMapping => {
                let n = w0 as usize * 2;
                if fiber.stack.len() < locals_top + n {
                    return Err(VmFault::StackUnderflow);
                }
                let at = fiber.stack.len() - n;
                let items = fiber.stack.split_off(at);
                let map = self.engine.heap.alloc(HeapKind::Mapping(Mapping::default()));
                for pair in items.chunks_exact(2) {
                    self.engine.heap.mapping_insert(map, pair[0], pair[1]);
                }
                fiber.acc = Value::Obj(map);
            }
            Op::LoadFuncref => {
                let Value::Sym(message) = self.constant(&frame, w0)? else {
                    return Err(VmFault::InvalidBytecode { offset: frame.ip });
                };
                let r = self.engine.heap.alloc(HeapKind::Funcref(Funcref {
                    receiver: frame.this,
                    message,
                }));
                fiber.acc = Value::Obj(r);
            }
            Op::LoadLocal => {
                let slot = frame.base + w0 as usize;
                fiber.acc = fiber
                    .stack
                    .get(slot)
                    .copied()
                    .ok_or(VmFault::StackUnderflow)?;
            }
            Op::LoadMember => {
                let instance = frame
                    .this
                    .as_obj()
                    .and_then(|r| self.engine.heap.object(r))
                    .ok_or(VmFault::NoSelfObject)?;
                fiber.acc = instance
                    .slots
                    .get(w0 as usize)
                    .copied()
                    .ok_or(VmFault::MemberOutOfRange { index: w0 })?;
            }
            Op::StoreLocal => {
                let slot = frame.base + w0 as usize;
                let target = fiber
                    .stack
                    .get_mut(slot)
                    .ok_or(VmFault::StackUnderflow)?;
                *target = fiber.acc;
            }
            Op::StoreMember => {
                let r = frame.this.as_obj().ok_or(VmFault::NoSelfObject)?;
                let acc = fiber.acc;
                let instance = self
                    .engine
                    .heap
                    .object_mut(r)
                    .ok_or(VmFault::NoSelfObject)?;
                let slot = instance
                    .slots
                    .get_mut(w0 as usize)
                    .ok_or(VmFault::MemberOutOfRange { index: w0 })?;
                *slot = acc;
            }
            Op::PushSelf => push(fiber, frame.this)?,
            Op::Push => {
                let v = fiber.acc;
                push(fiber, v)?;
            }
            Op::Pop => fiber.acc = pop(fiber, locals_top)?,
            Op::Not => fiber.acc = Value::from(!fiber.acc.is_truthy()),
            Op::Binary => {
                let binop = BinaryOp::from_wide(w0)
                    .ok_or(VmFault::InvalidBytecode { offset: frame.ip })?;
                let right = fiber.acc;
                let left = pop(fiber, locals_top)?;
                fiber.acc = self.eval_binary(binop, left, right)?;
            }
            Op::Jump => {
                set_ip(fiber, w0 as usize);
                return Ok(Step::Continue);
            }
            Op::JumpIf => {
                set_ip(fiber, if fiber.acc.is_truthy() { w0 as usize } else { next_ip });
                return Ok(Step::Continue);
            }
            Op::JumpIfNot => {
                set_ip(fiber, if fiber.acc.is_truthy() { next_ip } else { w0 as usize });
                return Ok(Step::Continue);
            }
            Op::Send | Op::SuperSend => {
                let Value::Sym(message) = self.constant(&frame, w0)? else {
                    return Err(VmFault::InvalidBytecode { offset: frame.ip });
                };
                return self.send(
                    fiber,
                    message,
                    w1 as usize,
                    op == Op::SuperSend,
                    &frame,
                    next_ip,
                    locals_top,
                );
            }
            Op::Return => {
                fiber.frames.pop();
                fiber.stack.truncate(frame.base);
                return if fiber.frames.is_empty() {
                    Ok(Step::Finished)
                } else {
                    Ok(Step::Continue)
                };
            }
        }

        set_ip(fiber, next_ip);
        Ok(Step::Continue)
    }

    fn constant(&self, frame: &Frame, index: u32) -> Result<Value, VmFault> {
        self.engine
            .heap
            .function(frame.function)
            .ok_or(VmFault::StaleHandle)?
            .constant(index)
            .ok_or(VmFault::ConstantOutOfRange { index })
    }

    // ── Message dispatch ──

    #[allow(clippy::too_many_arguments)]
    fn send(
        &mut self,
        fiber: &mut Fiber,
        message: Symbol,
        argc: usize,
        is_super: bool,
        frame: &Frame,
        next_ip: usize,
        locals_top: usize,
    ) -> Result<Step, VmFault> {
        if fiber.stack.len() < locals_top + argc + 1 {
            return Err(VmFault::StackUnderflow);
        }
        let recv_index = fiber.stack.len() - argc - 1;
        let recv = fiber.stack[recv_index];

        let target = if is_super {
            frame
                .blueprint
                .and_then(|defining| lookup_super_method(&self.engine.heap, defining, message))
        } else {
            recv.as_obj()
                .and_then(|r| self.engine.heap.object(r))
                .map(|o| o.blueprint)
                .and_then(|bp| lookup_method(&self.engine.heap, bp, message))
        };

        if let Some((function, defining)) = target {
            return self.invoke(fiber, function, defining, recv_index, argc, message, next_ip);
        }
        if is_super {
            return Err(self.unknown_message(message, recv));
        }
        match self.engine.builtins.lookup(message) {
            Some(builtin) => {
                self.eval_builtin(fiber, builtin, recv_index, argc, frame, next_ip, locals_top)
            }
            None => Err(self.unknown_message(message, recv)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &mut self,
        fiber: &mut Fiber,
        function: crate::heap::ObjRef,
        defining: crate::heap::ObjRef,
        recv_index: usize,
        argc: usize,
        message: Symbol,
        next_ip: usize,
    ) -> Result<Step, VmFault> {
        if fiber.frames.len() >= CALL_DEPTH_LIMIT {
            return Err(VmFault::CallDepthExceeded);
        }
        let (arity, max_locals, varargs) = {
            let f = self
                .engine
                .heap
                .function(function)
                .ok_or(VmFault::StaleHandle)?;
            (f.arity as usize, f.max_locals as usize, f.varargs)
        };

        let matches_arity = if varargs { argc >= arity } else { argc == arity };
        if !matches_arity {
            return Err(VmFault::ArityMismatch {
                message: self.engine.symbols.name(message).to_string(),
                expected: arity as u16,
                got: argc,
            });
        }

        if varargs {
            let extras = fiber.stack.split_off(recv_index + 1 + arity);
            let rest = self.engine.heap.alloc(HeapKind::Array(extras));
            push(fiber, Value::Obj(rest))?;
        }
        while fiber.stack.len() < recv_index + max_locals {
            push(fiber, Value::Nil)?;
        }

        set_ip(fiber, next_ip);
        let recv = fiber.stack[recv_index];
        fiber.frames.push(Frame {
            function,
            ip: 0,
            base: recv_index,
            this: recv,
            blueprint: Some(defining),
        });
        Ok(Step::Continue)
    }

    // ── Builtins ──

    #[allow(clippy::too_many_arguments)]
    fn eval_builtin(
        &mut self,
        fiber: &mut Fiber,
        builtin: Builtin,
        recv_index: usize,
        argc: usize,
        frame: &Frame,
        next_ip: usize,
        locals_top: usize,
    ) -> Result<Step, VmFault> {
        let args_at = recv_index + 1;
        let expect = |expected: u16| -> Result<(), VmFault> {
            if argc == expected as usize {
                Ok(())
            } else {
                Err(VmFault::ArityMismatch {
                    message: builtin.name().to_string(),
                    expected,
                    got: argc,
                })
            }
        };

        match builtin {
            Builtin::Write => {
                expect(1)?;
                let text = self
                    .engine
                    .heap
                    .display_value(fiber.stack[args_at], &self.engine.symbols);
                match fiber.connection.and_then(|c| self.engine.connections.get_mut(c)) {
                    Some(conn) => conn.write_str(&text),
                    None => tracing::debug!(fiber = %fiber.id, "unconnected write: {text}"),
                }
                finish(fiber, recv_index, next_ip, Value::Nil)
            }
            Builtin::ReadLine => {
                expect(0)?;
                let conn_id = fiber.connection.ok_or(VmFault::NoConnection)?;
                let conn = self
                    .engine
                    .connections
                    .get_mut(conn_id)
                    .ok_or(VmFault::NoConnection)?;
                match conn.read_line() {
                    Some(line) => {
                        let r = self.engine.heap.alloc_str(line);
                        finish(fiber, recv_index, next_ip, Value::Obj(r))
                    }
                    // Leave ip and stack untouched: the send re-executes
                    // once the network loop delivers a terminator.
                    None => Ok(Step::Blocked),
                }
            }
            Builtin::FindObject => {
                expect(1)?;
                let arg = fiber.stack[args_at];
                let path = arg
                    .as_obj()
                    .and_then(|r| self.engine.heap.str_(r))
                    .ok_or_else(|| self.bad_argument(builtin, "a path string", arg))?
                    .to_string();
                let origin = frame
                    .blueprint
                    .and_then(|bp| self.engine.heap.blueprint(bp))
                    .and_then(|b| b.file);
                let found = self.engine.find_object(&path, origin);
                finish(
                    fiber,
                    recv_index,
                    next_ip,
                    found.map(Value::Obj).unwrap_or(Value::Nil),
                )
            }
            Builtin::Call => {
                if argc < 1 {
                    return Err(VmFault::ArityMismatch {
                        message: builtin.name().to_string(),
                        expected: 1,
                        got: argc,
                    });
                }
                let arg = fiber.stack[args_at];
                let funcref = arg
                    .as_obj()
                    .and_then(|r| self.engine.heap.funcref(r))
                    .ok_or_else(|| self.bad_argument(builtin, "a funcref", arg))?;
                // Reshape [self, f, a…] into [f.receiver, a…] and re-send.
                fiber.stack[recv_index] = funcref.receiver;
                fiber.stack.remove(args_at);
                self.send(
                    fiber,
                    funcref.message,
                    argc - 1,
                    false,
                    frame,
                    next_ip,
                    locals_top,
                )
            }
            Builtin::Len => {
                expect(1)?;
                let arg = fiber.stack[args_at];
                let len = match arg.as_obj().and_then(|r| self.engine.heap.get(r)) {
                    Some(HeapKind::Str(s)) => s.chars().count(),
                    Some(HeapKind::Array(items)) => items.len(),
                    Some(HeapKind::Mapping(m)) => m.len(),
                    _ => return Err(self.bad_argument(builtin, "a string, array or mapping", arg)),
                };
                finish(fiber, recv_index, next_ip, Value::Int(len as i64))
            }
            Builtin::Put => {
                expect(3)?;
                let container = fiber.stack[args_at];
                let key = fiber.stack[args_at + 1];
                let value = fiber.stack[args_at + 2];
                let Some(r) = container.as_obj() else {
                    return Err(self.bad_argument(builtin, "a mapping or array", container));
                };
                if self.engine.heap.mapping(r).is_some() {
                    self.engine.heap.mapping_insert(r, key, value);
                } else if let Some(len) = self.engine.heap.array(r).map(|a| a.len()) {
                    let index = key
                        .as_int()
                        .ok_or_else(|| self.bad_argument(builtin, "an integer index", key))?;
                    let slot = usize::try_from(index)
                        .ok()
                        .filter(|&i| i < len)
                        .ok_or(VmFault::IndexOutOfBounds { index, len })?;
                    if let Some(items) = self.engine.heap.array_mut(r) {
                        items[slot] = value;
                    }
                } else {
                    return Err(self.bad_argument(builtin, "a mapping or array", container));
                }
                finish(fiber, recv_index, next_ip, value)
            }
            Builtin::ThisPath => {
                expect(0)?;
                let path = frame
                    .blueprint
                    .and_then(|bp| self.engine.heap.blueprint(bp))
                    .and_then(|b| b.file)
                    .map(|file| self.engine.vfs.path_of(file));
                let result = match path {
                    Some(p) => Value::Obj(self.engine.heap.alloc_str(p)),
                    None => Value::Nil,
                };
                finish(fiber, recv_index, next_ip, result)
            }
            Builtin::Disconnect => {
                expect(0)?;
                if let Some(conn) = fiber.connection.and_then(|c| self.engine.connections.get_mut(c))
                {
                    conn.closing = true;
                }
                finish(fiber, recv_index, next_ip, Value::Nil)
            }
        }
    }

    // ── Binary operators ──

    fn eval_binary(&mut self, op: BinaryOp, left: Value, right: Value) -> Result<Value, VmFault> {
        use BinaryOp::*;
        match op {
            Add => self.eval_add(left, right),
            Sub | Mul | Div | Mod => {
                let (Value::Int(a), Value::Int(b)) = (left, right) else {
                    return Err(self.mismatch(op, left, right));
                };
                let n = match op {
                    Sub => a.wrapping_sub(b),
                    Mul => a.wrapping_mul(b),
                    Div | Mod if b == 0 => return Err(VmFault::DivisionByZero),
                    Div => a.wrapping_div(b),
                    Mod => a.wrapping_rem(b),
                    _ => unreachable!(),
                };
                Ok(Value::Int(n))
            }
            Eq => Ok(Value::from(self.engine.heap.value_eq(left, right))),
            Ne => Ok(Value::from(!self.engine.heap.value_eq(left, right))),
            Lt | Le | Gt | Ge => {
                let ordering = match (left, right) {
                    (Value::Int(a), Value::Int(b)) => a.cmp(&b),
                    (Value::Char(a), Value::Char(b)) => a.cmp(&b),
                    (Value::Obj(a), Value::Obj(b)) => {
                        match (self.engine.heap.str_(a), self.engine.heap.str_(b)) {
                            (Some(s), Some(t)) => s.cmp(t),
                            _ => return Err(self.mismatch(op, left, right)),
                        }
                    }
                    _ => return Err(self.mismatch(op, left, right)),
                };
                let result = match op {
                    Lt => ordering.is_lt(),
                    Le => ordering.is_le(),
                    Gt => ordering.is_gt(),
                    Ge => ordering.is_ge(),
                    _ => unreachable!(),
                };
                Ok(Value::from(result))
            }
            Index => self.eval_index(left, right),
        }
    }

    /// `+` adds ints, concatenates strings (stringifying the other side
    /// when one operand already is one), and concatenates arrays.
    fn eval_add(&mut self, left: Value, right: Value) -> Result<Value, VmFault> {
        if let (Value::Int(a), Value::Int(b)) = (left, right) {
            return Ok(Value::Int(a.wrapping_add(b)));
        }
        let is_stringish = |v: Value, heap: &crate::heap::Heap| match v {
            Value::Char(_) => true,
            Value::Obj(r) => heap.str_(r).is_some(),
            _ => false,
        };
        if is_stringish(left, &self.engine.heap) || is_stringish(right, &self.engine.heap) {
            let mut text = self.engine.heap.display_value(left, &self.engine.symbols);
            text.push_str(&self.engine.heap.display_value(right, &self.engine.symbols));
            return Ok(Value::Obj(self.engine.heap.alloc_str(text)));
        }
        if let (Value::Obj(a), Value::Obj(b)) = (left, right) {
            if let (Some(xs), Some(ys)) = (self.engine.heap.array(a), self.engine.heap.array(b)) {
                let mut items = xs.clone();
                items.extend_from_slice(ys);
                return Ok(Value::Obj(self.engine.heap.alloc(HeapKind::Array(items))));
            }
        }
        Err(self.mismatch(BinaryOp::Add, left, right))
    }

    fn eval_index(&mut self, container: Value, key: Value) -> Result<Value, VmFault> {
        let Some(r) = container.as_obj() else {
            return Err(self.mismatch(BinaryOp::Index, container, key));
        };
        match self.engine.heap.get(r) {
            Some(HeapKind::Array(items)) => {
                let len = items.len();
                let index = key
                    .as_int()
                    .ok_or_else(|| self.mismatch(BinaryOp::Index, container, key))?;
                usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i).copied())
                    .ok_or(VmFault::IndexOutOfBounds { index, len })
            }
            Some(HeapKind::Mapping(_)) => {
                Ok(self.engine.heap.mapping_lookup(r, key).unwrap_or(Value::Nil))
            }
            Some(HeapKind::Str(s)) => {
                let len = s.chars().count();
                let index = key
                    .as_int()
                    .ok_or_else(|| self.mismatch(BinaryOp::Index, container, key))?;
                usize::try_from(index)
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(Value::Char)
                    .ok_or(VmFault::IndexOutOfBounds { index, len })
            }
            _ => Err(self.mismatch(BinaryOp::Index, container, key)),
        }
    }

    // ── Fault construction ──

    fn value_kind(&self, v: Value) -> &'static str {
        match v {
            Value::Obj(r) => self
                .engine
                .heap
                .get(r)
                .map(|k| k.kind_name())
                .unwrap_or("stale"),
            other => other.kind_name(),
        }
    }

    fn mismatch(&self, op: BinaryOp, left: Value, right: Value) -> VmFault {
        VmFault::TypeMismatch {
            op: op.name(),
            left: self.value_kind(left),
            right: self.value_kind(right),
        }
    }

    fn bad_argument(&self, builtin: Builtin, expected: &'static str, got: Value) -> VmFault {
        VmFault::BadArgument {
            builtin: builtin.name(),
            expected,
            got: self.value_kind(got),
        }
    }

    fn unknown_message(&self, message: Symbol, recv: Value) -> VmFault {
        VmFault::UnknownMessage {
            message: self.engine.symbols.name(message).to_string(),
            receiver: self.value_kind(recv).to_string(),
        }
    }
}

fn set_ip(fiber: &mut Fiber, ip: usize) {
    if let Some(frame) = fiber.frames.last_mut() {
        frame.ip = ip;
    }
}

fn push(fiber: &mut Fiber, v: Value) -> Result<(), VmFault> {
    if fiber.stack.len() >= STACK_LIMIT {
        return Err(VmFault::StackOverflow);
    }
    fiber.stack.push(v);
    Ok(())
}

fn pop(fiber: &mut Fiber, locals_top: usize) -> Result<Value, VmFault> {
    if fiber.stack.len() <= locals_top {
        return Err(VmFault::StackUnderflow);
    }
    fiber.stack.pop().ok_or(VmFault::StackUnderflow)
}

/// Builtin epilogue: drop receiver and args, set the result, advance.
fn finish(fiber: &mut Fiber, recv_index: usize, next_ip: usize, result: Value) -> Result<Step, VmFault> {
    fiber.stack.truncate(recv_index);
    fiber.acc = result;
    set_ip(fiber, next_ip);
    Ok(Step::Continue)
}
