//! The engine: the process-wide root that owns the heap, symbol table,
//! virtual filesystem, connections and the fiber scheduler.
//!
//! Everything is single-threaded and cooperative. The network loop feeds
//! bytes in through [`Engine::connection_input`] and drains output after
//! calling [`Engine::run_until_idle`]; no fiber ever runs while another
//! does, and garbage collection happens only between scheduling slices.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{anyhow, bail, Result};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::builtins::BuiltinRegistry;
use crate::config::EngineConfig;
use crate::connection::{ConnId, Connection, ConnectionTable};
use crate::error::VmFault;
use crate::fiber::{Fiber, FiberId, FiberState, FiberTable, Frame};
use crate::heap::{GcStats, Heap, HeapKind, ObjRef};
use crate::lang::lexer::{Lexer, TokenKind};
use crate::lang::parser::{parse_file, CREATE_METHOD, INIT_METHOD, LOGIN_METHOD};
use crate::lang::verify::verify_function;
use crate::lang::CompileLog;
use crate::object::{lookup_method, Blueprint, Instance};
use crate::symbol::{Symbol, SymbolTable};
use crate::value::Value;
use crate::vfs::{FileId, Vfs};
use crate::vm::{RunOutcome, Vm};

/// Budget for synchronous internal fibers (object initializers and
/// direct method calls); generous because nothing else is waiting.
const INTERNAL_BUDGET: u32 = 1_000_000;

pub struct Engine {
    config: EngineConfig,
    pub(crate) heap: Heap,
    pub(crate) symbols: SymbolTable,
    pub(crate) builtins: BuiltinRegistry,
    pub(crate) vfs: Vfs,
    pub(crate) connections: ConnectionTable,
    fibers: FiberTable,
    /// Round-robin run queue of fiber handles.
    ready: VecDeque<FiberId>,
    /// Files currently being compiled, for inheritance cycle detection.
    compiling: HashSet<FileId>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let mut symbols = SymbolTable::new();
        let builtins = BuiltinRegistry::new(&mut symbols);
        Self {
            config,
            heap: Heap::new(),
            symbols,
            builtins,
            vfs: Vfs::new(),
            connections: ConnectionTable::default(),
            fibers: FiberTable::default(),
            ready: VecDeque::new(),
            compiling: HashSet::new(),
        }
    }

    /// Mirror the configured anchor directory into the virtual tree.
    /// Nothing compiles until first reference.
    pub fn load_world(&mut self) -> Result<usize> {
        let anchor = self.config.anchor.clone();
        let root = self.vfs.root();
        let count = self.vfs.load(root, &anchor)?;
        tracing::info!(files = count, "world loaded from {}", anchor.display());
        Ok(count)
    }

    // ── Accessors (inspection and tests) ──

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn intern(&mut self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    pub fn fiber(&self, id: FiberId) -> Option<&Fiber> {
        self.fibers.get(id)
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(id)
    }

    // ── Connection lifecycle ──

    /// Register a fresh connection and bind a fiber running the master
    /// object's `login` method to it.
    pub fn attach_connection(&mut self, peer: String) -> Result<ConnId> {
        let master = self
            .master_object()
            .ok_or_else(|| anyhow!("master object failed to compile"))?;
        let conn_id = self.connections.insert(Connection::new(Uuid::now_v7(), peer));

        let login = self.symbols.intern(LOGIN_METHOD);
        match self.spawn_fiber(Value::Obj(master), login, Some(conn_id)) {
            Ok(fid) => {
                if let Some(conn) = self.connections.get_mut(conn_id) {
                    conn.fiber = Some(fid);
                    tracing::info!(peer = %conn.peer, "connection attached");
                }
                self.ready.push_back(fid);
                Ok(conn_id)
            }
            Err(e) => {
                self.connections.remove(conn_id);
                Err(e)
            }
        }
    }

    /// Deliver received bytes. Wakes the bound fiber iff a line
    /// terminator is now buffered.
    pub fn connection_input(&mut self, id: ConnId, bytes: &[u8]) {
        let (dropped, wake) = match self.connections.get_mut(id) {
            None => return,
            Some(conn) => {
                if !conn.push_input(bytes) {
                    tracing::warn!(peer = %conn.peer, "input buffer overflow, dropping connection");
                    conn.closing = true;
                    (conn.fiber.take(), None)
                } else if conn.has_line() {
                    (None, conn.fiber)
                } else {
                    (None, None)
                }
            }
        };
        if let Some(fid) = dropped {
            self.cancel_fiber(fid);
        }
        if let Some(fid) = wake {
            if let Some(fiber) = self.fibers.get_mut(fid) {
                if fiber.state == FiberState::BlockedOnInput {
                    fiber.state = FiberState::Ready;
                    self.ready.push_back(fid);
                }
            }
        }
    }

    /// The peer closed its end. A fiber parked on this input can never
    /// resume, so it is cancelled.
    pub fn connection_eof(&mut self, id: ConnId) {
        let fid = match self.connections.get_mut(id) {
            None => return,
            Some(conn) => {
                conn.closing = true;
                conn.fiber.take()
            }
        };
        if let Some(fid) = fid {
            self.cancel_fiber(fid);
        }
    }

    /// Mark a fiber finished from outside; the scheduler drops it on its
    /// next selection. Its connection is detached first.
    pub fn cancel_fiber(&mut self, id: FiberId) {
        if let Some(fiber) = self.fibers.get_mut(id) {
            fiber.connection = None;
            fiber.state = FiberState::Finished;
            self.ready.push_back(id);
        }
    }

    /// Pending output per connection, for the network loop to write.
    pub fn drain_output(&mut self) -> Vec<(ConnId, Vec<u8>)> {
        let mut out = Vec::new();
        for (id, conn) in self.connections.iter_mut() {
            if conn.has_output() {
                out.push((id, conn.take_output()));
            }
        }
        out
    }

    /// Connections that finished closing (output already drained). The
    /// network loop should drop their sockets.
    pub fn take_closed(&mut self) -> Vec<ConnId> {
        let ids: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.closing && !c.has_output())
            .map(|(id, _)| id)
            .collect();
        for &id in &ids {
            if let Some(conn) = self.connections.remove(id) {
                tracing::info!(peer = %conn.peer, "connection closed");
                if let Some(fid) = conn.fiber {
                    self.cancel_fiber(fid);
                }
            }
        }
        // Reap any fibers the closes cancelled.
        self.run_until_idle();
        ids
    }

    // ── Scheduler ──

    /// Run scheduling rounds until no fiber is ready. Fibers that
    /// exhaust their slice go to the back of the queue; GC runs between
    /// slices when the allocation threshold is crossed.
    pub fn run_until_idle(&mut self) {
        while let Some(fid) = self.ready.pop_front() {
            self.run_one(fid);
            self.maybe_collect();
        }
    }

    fn run_one(&mut self, fid: FiberId) {
        let Some(mut fiber) = self.fibers.take(fid) else {
            return;
        };
        match fiber.state {
            FiberState::Ready => {}
            FiberState::Finished | FiberState::Faulted => {
                self.finish_fiber(fid, fiber, None);
                return;
            }
            _ => {
                // Parked or already handled; queue entry was stale.
                self.fibers.restore(fid, fiber);
                return;
            }
        }

        let budget = self.config.tick_budget;
        let outcome = Vm::new(self).run_fiber(&mut fiber, budget);
        match outcome {
            RunOutcome::Yielded => {
                self.fibers.restore(fid, fiber);
                self.ready.push_back(fid);
            }
            RunOutcome::Blocked => {
                let alive = fiber
                    .connection
                    .and_then(|c| self.connections.get(c))
                    .map(|c| !c.closing)
                    .unwrap_or(false);
                if alive {
                    self.fibers.restore(fid, fiber);
                } else {
                    self.finish_fiber(fid, fiber, None);
                }
            }
            RunOutcome::Finished => {
                tracing::debug!(fiber = %fiber.id, "fiber finished");
                self.finish_fiber(fid, fiber, None);
            }
            RunOutcome::Faulted(fault) => {
                tracing::warn!(fiber = %fiber.id, %fault, "fiber faulted");
                self.finish_fiber(fid, fiber, Some(fault));
            }
        }
    }

    /// Tear a fiber down: diagnostic to its connection on fault, then
    /// close the connection and release the slot.
    fn finish_fiber(&mut self, fid: FiberId, fiber: Fiber, fault: Option<VmFault>) {
        if let Some(conn_id) = fiber.connection {
            if let Some(conn) = self.connections.get_mut(conn_id) {
                conn.fiber = None;
                if let Some(fault) = &fault {
                    conn.write_str(&format!("\r\n*** runtime fault: {fault}\r\n"));
                }
                conn.closing = true;
            }
        }
        self.fibers.release(fid);
    }

    /// Build a fiber whose first frame invokes `message` on `recv`.
    /// The caller decides whether to queue it or drive it synchronously.
    pub fn spawn_fiber(
        &mut self,
        recv: Value,
        message: Symbol,
        connection: Option<ConnId>,
    ) -> Result<FiberId> {
        let bp = recv
            .as_obj()
            .and_then(|r| self.heap.object(r))
            .map(|o| o.blueprint)
            .ok_or_else(|| anyhow!("fiber receiver is not an object"))?;
        let (function, defining) = lookup_method(&self.heap, bp, message)
            .ok_or_else(|| anyhow!("no `{}` method", self.symbols.name(message)))?;
        let (arity, max_locals) = {
            let f = self
                .heap
                .function(function)
                .ok_or_else(|| anyhow!("method slot holds no function"))?;
            (f.arity, f.max_locals as usize)
        };
        if arity != 0 {
            bail!(
                "`{}` takes {} arguments and cannot start a fiber",
                self.symbols.name(message),
                arity
            );
        }

        let mut fiber = Fiber::new(Uuid::now_v7());
        fiber.connection = connection;
        fiber.stack.push(recv);
        fiber.stack.resize(max_locals.max(1), Value::Nil);
        fiber.frames.push(Frame {
            function,
            ip: 0,
            base: 0,
            this: recv,
            blueprint: Some(defining),
        });
        Ok(self.fibers.insert(fiber))
    }

    /// Invoke a zero-argument method synchronously and return its result.
    pub fn call_method(&mut self, recv: Value, message: &str) -> Result<Value> {
        let sym = self.symbols.intern(message);
        self.run_sync(recv, sym)
    }

    fn run_sync(&mut self, recv: Value, message: Symbol) -> Result<Value> {
        let fid = self.spawn_fiber(recv, message, None)?;
        let Some(mut fiber) = self.fibers.take(fid) else {
            bail!("fiber vanished before running");
        };
        let outcome = Vm::new(self).run_fiber(&mut fiber, INTERNAL_BUDGET);
        self.fibers.release(fid);
        match outcome {
            RunOutcome::Finished => Ok(fiber.acc),
            RunOutcome::Faulted(fault) => Err(fault.into()),
            RunOutcome::Blocked => bail!(
                "`{}` blocked on input outside a connection",
                self.symbols.name(message)
            ),
            RunOutcome::Yielded => bail!(
                "`{}` exceeded the internal budget",
                self.symbols.name(message)
            ),
        }
    }

    // ── Garbage collection ──

    fn maybe_collect(&mut self) {
        if self.heap.allocated_since_gc() >= self.config.gc_threshold {
            self.collect_garbage();
        }
    }

    /// Mark-and-sweep over everything reachable from fibers and the file
    /// tree. Only called at scheduler safe points.
    pub fn collect_garbage(&mut self) -> GcStats {
        let mut roots: Vec<ObjRef> = self.vfs.gc_roots();
        let mut push_value = |roots: &mut Vec<ObjRef>, v: Value| {
            if let Value::Obj(r) = v {
                roots.push(r);
            }
        };
        for (_, fiber) in self.fibers.iter() {
            push_value(&mut roots, fiber.acc);
            for &v in &fiber.stack {
                push_value(&mut roots, v);
            }
            for frame in &fiber.frames {
                roots.push(frame.function);
                push_value(&mut roots, frame.this);
                roots.extend(frame.blueprint);
            }
        }
        let stats = self.heap.collect(roots);
        tracing::debug!(live = stats.live, freed = stats.freed, "gc cycle");
        stats
    }

    // ── Virtual files: lazy compile and instantiation ──

    /// Cached blueprint, compiling on first reference. Diagnostics go to
    /// the process log; `None` if the file does not compile.
    pub fn file_blueprint(&mut self, file: FileId) -> Option<ObjRef> {
        if let Some(bp) = self.vfs.blueprint(file) {
            return Some(bp);
        }
        let mut log = CompileLog::new();
        let ok = self.file_recompile(file, &mut log);
        let path = self.vfs.path_of(file);
        for diagnostic in log.entries() {
            tracing::warn!("{}: {}", path, diagnostic);
        }
        if ok {
            self.vfs.blueprint(file)
        } else {
            None
        }
    }

    /// Force a fresh compile of `file`. On success the new blueprint
    /// replaces the cached one atomically and the cached singleton is
    /// dropped; on failure the old blueprint stays.
    pub fn file_recompile(&mut self, file: FileId, log: &mut CompileLog) -> bool {
        if !self.compiling.insert(file) {
            log.push(0, 0, "inheritance cycle detected");
            return false;
        }
        let ok = self.compile_file(file, log);
        self.compiling.remove(&file);
        ok
    }

    fn compile_file(&mut self, file: FileId, log: &mut CompileLog) -> bool {
        if self.vfs.is_dir(file) {
            log.push(0, 0, "cannot compile a directory");
            return false;
        }
        let Some(path) = self.vfs.real_path(file).map(|p| p.to_path_buf()) else {
            log.push(0, 0, "no host file behind this node");
            return false;
        };
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => {
                log.push(0, 0, format!("cannot read {}: {e}", path.display()));
                return false;
            }
        };
        let virt = self.vfs.path_of(file);
        tracing::debug!("compiling {virt}");

        // Resolve the inherited blueprint first; the parser needs its
        // slot layout for member resolution.
        let parent = match scan_inherit(&source) {
            None => None,
            Some((inherit_path, line, column)) => {
                let Some(target) = self.vfs.resolve(file, &inherit_path) else {
                    log.push(
                        line,
                        column,
                        format!("cannot resolve inherited file `{inherit_path}`"),
                    );
                    return false;
                };
                match self.file_blueprint(target) {
                    Some(bp) => Some(bp),
                    None => {
                        log.push(
                            line,
                            column,
                            format!("inherited file `{inherit_path}` did not compile"),
                        );
                        return false;
                    }
                }
            }
        };

        let Some(built) = parse_file(
            &source,
            Some(file),
            parent,
            &mut self.heap,
            &mut self.symbols,
            log,
        ) else {
            return false;
        };

        // Post-compile verification: a malformed stream here is a
        // compiler bug and must not reach a fiber.
        let mut ok = true;
        let mut hasher = Sha256::new();
        for (name, function) in &built.methods {
            for problem in verify_function(function, &self.heap) {
                log.push(
                    0,
                    0,
                    format!("internal error in `{}`: {problem}", self.symbols.name(*name)),
                );
                ok = false;
            }
            hasher.update(self.symbols.name(*name).as_bytes());
            hasher.update([0u8]);
            hasher.update(&function.code);
        }
        if !ok {
            return false;
        }
        let code_version: [u8; 32] = hasher.finalize().into();

        let mut methods = HashMap::new();
        for (name, function) in built.methods {
            methods.insert(name, self.heap.alloc(HeapKind::Function(function)));
        }
        let blueprint = Blueprint {
            file: Some(file),
            parent: built.parent,
            methods,
            slots: built.slots,
            slot_offset: built.inherited_slots,
            code_version,
        };
        let r = self.heap.alloc(HeapKind::Blueprint(blueprint));
        self.vfs.set_blueprint(file, Some(r));
        self.vfs.set_object(file, None);
        tracing::info!(version = %hex::encode(&code_version[..8]), "compiled {virt}");
        true
    }

    /// Cached singleton instance, forcing a compile if needed. Member
    /// initializers and the script `create` constructor run right after
    /// instantiation.
    pub fn file_object(&mut self, file: FileId) -> Option<ObjRef> {
        if let Some(obj) = self.vfs.object(file) {
            return Some(obj);
        }
        let bp = self.file_blueprint(file)?;
        let total = self.heap.blueprint(bp)?.total_slots();
        let obj = self.heap.alloc(HeapKind::Object(Instance {
            blueprint: bp,
            slots: vec![Value::Nil; total],
        }));
        self.vfs.set_object(file, Some(obj));

        for name in [INIT_METHOD, CREATE_METHOD] {
            let Some(sym) = self.symbols.get(name) else {
                continue;
            };
            if lookup_method(&self.heap, bp, sym).is_some() {
                if let Err(e) = self.run_sync(Value::Obj(obj), sym) {
                    tracing::warn!("initializer of {} failed: {e}", self.vfs.path_of(file));
                }
            }
        }
        Some(obj)
    }

    /// Resolve a virtual path (relative paths start at `origin`) and
    /// materialize the file's singleton object.
    pub fn find_object(&mut self, path: &str, origin: Option<FileId>) -> Option<ObjRef> {
        let from = origin.unwrap_or_else(|| self.vfs.root());
        let file = self.vfs.resolve(from, path)?;
        self.file_object(file)
    }

    fn master_object(&mut self) -> Option<ObjRef> {
        let master = self.config.master.clone();
        self.find_object(&master, None)
    }

    // ── Inspection ──

    pub fn inspect(&self) -> EngineInspection {
        EngineInspection {
            fibers: self
                .fibers
                .iter()
                .map(|(_, f)| FiberInspection {
                    id: f.id,
                    state: f.state,
                    stack_depth: f.stack.len(),
                    call_depth: f.frames.len(),
                })
                .collect(),
            connections: self
                .connections
                .iter()
                .map(|(_, c)| ConnectionInspection {
                    id: c.id,
                    peer: c.peer.clone(),
                    has_fiber: c.fiber.is_some(),
                    closing: c.closing,
                })
                .collect(),
            heap_live: self.heap.live_count(),
        }
    }
}

/// Snapshot of engine state for diagnostics.
#[derive(Debug, Clone)]
pub struct EngineInspection {
    pub fibers: Vec<FiberInspection>,
    pub connections: Vec<ConnectionInspection>,
    pub heap_live: usize,
}

#[derive(Debug, Clone)]
pub struct FiberInspection {
    pub id: Uuid,
    pub state: FiberState,
    pub stack_depth: usize,
    pub call_depth: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectionInspection {
    pub id: Uuid,
    pub peer: String,
    pub has_fiber: bool,
    pub closing: bool,
}

/// Cheap pre-pass for the leading `inherit "path";` clause, so the
/// parent compiles before the full parse begins.
fn scan_inherit(source: &str) -> Option<(String, u32, u32)> {
    let mut lexer = Lexer::new(source);
    let first = lexer.next_token();
    if first.kind != TokenKind::Inherit {
        return None;
    }
    let path = lexer.next_token();
    match path.kind {
        TokenKind::Str(s) => Some((s, path.line, path.column)),
        _ => None,
    }
}
