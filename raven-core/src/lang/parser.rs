//! Single-pass recursive-descent parser ("parsepiler").
//!
//! Emits bytecode through the compiler façade while parsing — no AST is
//! built. On an error the parser logs a diagnostic and resynchronizes at
//! the next statement boundary, so one compile reports several issues;
//! any diagnostic makes the overall compile fail.

use crate::heap::{Heap, ObjRef};
use crate::lang::bytecode::BinaryOp;
use crate::lang::compiler::{BlueprintBuilder, Compiler};
use crate::lang::lexer::{Lexer, Token, TokenKind};
use crate::lang::CompileLog;
use crate::object::TypeTag;
use crate::symbol::{Symbol, SymbolTable};
use crate::value::Value;
use crate::vfs::FileId;

/// Synthesized member-initializer method, run when an object is created.
pub const INIT_METHOD: &str = "__init";
/// Script-defined constructor, run right after the initializer.
pub const CREATE_METHOD: &str = "create";
/// Entry point bound to a fresh connection's fiber.
pub const LOGIN_METHOD: &str = "login";
/// Implicit local that receives surplus arguments of a varargs method.
pub const VARARGS_LOCAL: &str = "args";

/// Compile one source file into blueprint parts.
///
/// `parent` is the already-compiled blueprint named by the file's
/// `inherit` clause; the engine resolves it up front. Returns `None` —
/// with diagnostics in `log` — if anything failed to compile.
pub fn parse_file(
    source: &str,
    file: Option<FileId>,
    parent: Option<ObjRef>,
    heap: &mut Heap,
    symbols: &mut SymbolTable,
    log: &mut CompileLog,
) -> Option<BlueprintBuilder> {
    let mut builder = BlueprintBuilder::new(file);
    if let Some(parent) = parent {
        builder.set_parent(heap, parent);
    }

    let mut parser = Parser::new(source, builder, heap, symbols, log);
    while !matches!(parser.current.kind, TokenKind::Eof) {
        parser.top_level();
        if parser.panicking {
            parser.synchronize();
        }
    }
    parser.finish_init();

    if parser.failed {
        None
    } else {
        Some(parser.builder)
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    peeked: Option<Token>,
    heap: &'a mut Heap,
    symbols: &'a mut SymbolTable,
    log: &'a mut CompileLog,
    builder: BlueprintBuilder,
    /// Lazily created compiler for member initializers.
    init: Option<Compiler>,
    inherit_seen: bool,
    decl_seen: bool,
    failed: bool,
    panicking: bool,
}

impl<'a> Parser<'a> {
    fn new(
        source: &'a str,
        builder: BlueprintBuilder,
        heap: &'a mut Heap,
        symbols: &'a mut SymbolTable,
        log: &'a mut CompileLog,
    ) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token();
        Self {
            lexer,
            current,
            peeked: None,
            heap,
            symbols,
            log,
            builder,
            init: None,
            inherit_seen: false,
            decl_seen: false,
            failed: false,
            panicking: false,
        }
    }

    // ── Token plumbing ──

    fn advance(&mut self) {
        self.current = match self.peeked.take() {
            Some(t) => t,
            None => self.lexer.next_token(),
        };
    }

    fn peek_kind(&mut self) -> &TokenKind {
        let lexer = &mut self.lexer;
        &self.peeked.get_or_insert_with(|| lexer.next_token()).kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.current.kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> bool {
        if self.eat(kind) {
            true
        } else {
            self.error(format!(
                "expected {}, found {}",
                what,
                self.current.kind.describe()
            ));
            false
        }
    }

    /// Consume an identifier and intern it.
    fn ident(&mut self, what: &str) -> Option<Symbol> {
        if let TokenKind::Ident(name) = &self.current.kind {
            let sym = self.symbols.intern(&name.clone());
            self.advance();
            Some(sym)
        } else {
            self.error(format!(
                "expected {}, found {}",
                what,
                self.current.kind.describe()
            ));
            None
        }
    }

    fn current_type(&self) -> Option<TypeTag> {
        match &self.current.kind {
            TokenKind::Ident(name) => TypeTag::from_keyword(name),
            _ => None,
        }
    }

    // ── Diagnostics ──

    fn error(&mut self, message: impl Into<String>) {
        let (line, column) = (self.current.line, self.current.column);
        self.error_at(line, column, message);
    }

    fn error_at(&mut self, line: u32, column: u32, message: impl Into<String>) {
        self.failed = true;
        if self.panicking {
            return;
        }
        self.panicking = true;
        self.log.push(line, column, message);
    }

    /// Skip to the next statement boundary after an error.
    fn synchronize(&mut self) {
        self.panicking = false;
        loop {
            match self.current.kind {
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::RBrace
                | TokenKind::LBrace
                | TokenKind::Eof
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Inherit => return,
                _ => self.advance(),
            }
        }
    }

    // ── File level ──

    fn top_level(&mut self) {
        if self.current.kind == TokenKind::Inherit {
            self.inherit_clause();
            return;
        }

        let Some(ty) = self.current_type() else {
            self.error(format!(
                "expected declaration, found {}",
                self.current.kind.describe()
            ));
            self.advance();
            return;
        };
        self.advance();

        let Some(name) = self.ident("member or method name") else {
            return;
        };

        match self.current.kind {
            TokenKind::LParen => {
                self.advance();
                self.method(name);
            }
            TokenKind::Assign => {
                self.advance();
                self.member(name, ty, true);
            }
            TokenKind::Semicolon => {
                self.advance();
                self.member(name, ty, false);
            }
            _ => self.error(format!(
                "expected `(`, `=` or `;` after `{}`",
                self.symbols.name(name)
            )),
        }
        self.decl_seen = true;
    }

    fn inherit_clause(&mut self) {
        if self.inherit_seen {
            self.error("duplicate `inherit` clause");
        } else if self.decl_seen {
            self.error("`inherit` must precede all declarations");
        }
        self.inherit_seen = true;
        self.advance();

        if let TokenKind::Str(_) = self.current.kind {
            self.advance();
        } else {
            self.error("expected a file path string after `inherit`");
        }
        self.expect(TokenKind::Semicolon, "`;`");

        // The engine resolves the parent before parsing; a missing link
        // here means that resolution failed.
        if self.builder.parent.is_none() {
            self.error("inherited file did not compile");
        }
    }

    fn member(&mut self, name: Symbol, ty: TypeTag, initialized: bool) {
        let slot = match self.builder.add_slot(name, ty) {
            Ok(slot) => Some(slot),
            Err(()) => {
                self.error(format!("duplicate member `{}`", self.symbols.name(name)));
                None
            }
        };

        if initialized {
            let init_name = self.symbols.intern(INIT_METHOD);
            let mut c = match self.init.take() {
                Some(c) => c,
                None => {
                    let mut c = Compiler::new(init_name);
                    // Inherited member initializers run first.
                    let inherited = self.builder.parent.is_some_and(|parent| {
                        crate::object::lookup_method(self.heap, parent, init_name).is_some()
                    });
                    if inherited {
                        c.push_self();
                        c.super_send(init_name, 0);
                    }
                    c
                }
            };
            self.expression(&mut c);
            if let Some(slot) = slot {
                c.store_member(slot);
            }
            self.init = Some(c);
            self.expect(TokenKind::Semicolon, "`;`");
        }
    }

    fn method(&mut self, name: Symbol) {
        let mut c = Compiler::new(name);

        // Parameter list; `(` is already consumed.
        if !self.eat(TokenKind::RParen) {
            loop {
                if self.eat(TokenKind::Ellipsis) {
                    c.enable_varargs();
                    let rest = self.symbols.intern(VARARGS_LOCAL);
                    if c.add_var(rest).is_err() {
                        self.error("duplicate varargs parameter");
                    }
                    break;
                }
                if self.current_type().is_none() {
                    self.error(format!(
                        "expected parameter type, found {}",
                        self.current.kind.describe()
                    ));
                    break;
                }
                self.advance();
                if let Some(param) = self.ident("parameter name") {
                    if c.add_arg(param).is_err() {
                        self.error(format!(
                            "duplicate parameter `{}`",
                            self.symbols.name(param)
                        ));
                    }
                }
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen, "`)`");
        }

        if self.current.kind == TokenKind::LBrace {
            self.block(&mut c);
        } else {
            self.error("expected `{` to open the method body");
        }

        // Falling off the end returns nil.
        c.load_const(Value::Nil);
        c.ret();

        if self.builder.has_method(name) {
            self.error(format!("duplicate method `{}`", self.symbols.name(name)));
            return;
        }
        match c.finish() {
            Ok(function) => self.builder.add_method(name, function),
            Err(e) => self.error(format!("internal compile error: {e}")),
        }
    }

    /// Seal the member-initializer method, if any member had one.
    fn finish_init(&mut self) {
        if let Some(mut c) = self.init.take() {
            c.load_const(Value::Nil);
            c.ret();
            let init_name = self.symbols.intern(INIT_METHOD);
            match c.finish() {
                Ok(function) => self.builder.add_method(init_name, function),
                Err(e) => self.error(format!("internal compile error: {e}")),
            }
        }
    }

    // ── Statements ──

    fn block(&mut self, c: &mut Compiler) {
        self.expect(TokenKind::LBrace, "`{`");
        c.enter_scope();
        while !matches!(self.current.kind, TokenKind::RBrace | TokenKind::Eof) {
            self.statement(c);
            if self.panicking {
                self.synchronize();
            }
        }
        c.leave_scope();
        self.expect(TokenKind::RBrace, "`}`");
    }

    fn statement(&mut self, c: &mut Compiler) {
        match self.current.kind {
            TokenKind::LBrace => self.block(c),
            TokenKind::If => self.if_statement(c),
            TokenKind::While => self.while_statement(c),
            TokenKind::For => self.for_statement(c),
            TokenKind::Break => {
                self.advance();
                if !c.break_() {
                    self.error("`break` outside of a loop");
                }
                self.expect(TokenKind::Semicolon, "`;`");
            }
            TokenKind::Continue => {
                self.advance();
                if !c.continue_() {
                    self.error("`continue` outside of a loop");
                }
                self.expect(TokenKind::Semicolon, "`;`");
            }
            TokenKind::Return => {
                self.advance();
                if self.current.kind == TokenKind::Semicolon {
                    c.load_const(Value::Nil);
                } else {
                    self.expression(c);
                }
                self.expect(TokenKind::Semicolon, "`;`");
                c.ret();
            }
            TokenKind::Semicolon => self.advance(),
            _ => {
                if self.current_type().is_some()
                    && matches!(self.peek_kind(), TokenKind::Ident(_))
                {
                    self.local_decl(c);
                } else {
                    self.expression(c);
                    self.expect(TokenKind::Semicolon, "`;`");
                }
            }
        }
    }

    fn local_decl(&mut self, c: &mut Compiler) {
        self.advance(); // type keyword
        let Some(name) = self.ident("variable name") else {
            return;
        };
        if c.add_var(name).is_err() {
            self.error(format!(
                "duplicate variable `{}` in this scope",
                self.symbols.name(name)
            ));
        }
        if self.eat(TokenKind::Assign) {
            self.expression(c);
            c.store_var(name, &self.builder);
        }
        self.expect(TokenKind::Semicolon, "`;`");
    }

    fn if_statement(&mut self, c: &mut Compiler) {
        self.advance();
        self.expect(TokenKind::LParen, "`(`");
        self.expression(c);
        self.expect(TokenKind::RParen, "`)`");

        let else_label = c.open_label();
        c.jump_if_not(else_label);
        self.statement(c);

        if self.eat(TokenKind::Else) {
            let end_label = c.open_label();
            c.jump(end_label);
            c.place_label(else_label);
            self.statement(c);
            c.place_label(end_label);
            c.close_label(end_label);
        } else {
            c.place_label(else_label);
        }
        c.close_label(else_label);
    }

    fn while_statement(&mut self, c: &mut Compiler) {
        self.advance();
        let continue_label = c.open_label();
        let break_label = c.open_label();
        c.place_label(continue_label);

        self.expect(TokenKind::LParen, "`(`");
        self.expression(c);
        self.expect(TokenKind::RParen, "`)`");
        c.jump_if_not(break_label);

        let saved = c.enter_loop(break_label, continue_label);
        self.statement(c);
        c.leave_loop(saved);

        c.jump(continue_label);
        c.place_label(break_label);
        c.close_label(break_label);
        c.close_label(continue_label);
    }

    /// `for (init; cond; step) body` in a single pass: the step clause is
    /// emitted between condition and body (source order), with jumps
    /// giving it run-after-body semantics.
    fn for_statement(&mut self, c: &mut Compiler) {
        self.advance();
        self.expect(TokenKind::LParen, "`(`");
        c.enter_scope();

        // Init clause.
        if !self.eat(TokenKind::Semicolon) {
            if self.current_type().is_some() && matches!(self.peek_kind(), TokenKind::Ident(_)) {
                self.local_decl(c);
            } else {
                self.expression(c);
                self.expect(TokenKind::Semicolon, "`;`");
            }
        }

        let cond_label = c.open_label();
        let body_label = c.open_label();
        let break_label = c.open_label();
        let continue_label = c.open_label();
        c.place_label(cond_label);

        // Condition clause; empty means run forever.
        if !self.eat(TokenKind::Semicolon) {
            self.expression(c);
            self.expect(TokenKind::Semicolon, "`;`");
            c.jump_if_not(break_label);
        }
        c.jump(body_label);

        // Step clause.
        c.place_label(continue_label);
        if self.current.kind != TokenKind::RParen {
            self.expression(c);
        }
        self.expect(TokenKind::RParen, "`)`");
        c.jump(cond_label);

        c.place_label(body_label);
        let saved = c.enter_loop(break_label, continue_label);
        self.statement(c);
        c.leave_loop(saved);
        c.jump(continue_label);

        c.place_label(break_label);
        c.close_label(cond_label);
        c.close_label(body_label);
        c.close_label(break_label);
        c.close_label(continue_label);
        c.leave_scope();
    }

    // ── Expressions ──

    fn expression(&mut self, c: &mut Compiler) {
        self.assignment(c);
    }

    fn assignment(&mut self, c: &mut Compiler) {
        let target = match &self.current.kind {
            TokenKind::Ident(name) => Some(name.clone()),
            _ => None,
        };
        if let Some(name) = target {
            if *self.peek_kind() == TokenKind::Assign {
                let (line, column) = (self.current.line, self.current.column);
                let sym = self.symbols.intern(&name);
                self.advance();
                self.advance();
                self.assignment(c);
                if !c.store_var(sym, &self.builder) {
                    self.error_at(line, column, format!("cannot assign to `{name}`"));
                }
                return;
            }
        }
        self.or_expr(c);
    }

    fn or_expr(&mut self, c: &mut Compiler) {
        self.and_expr(c);
        if self.current.kind != TokenKind::PipePipe {
            return;
        }
        let end = c.open_label();
        while self.eat(TokenKind::PipePipe) {
            c.jump_if(end);
            self.and_expr(c);
        }
        c.place_label(end);
        c.close_label(end);
    }

    fn and_expr(&mut self, c: &mut Compiler) {
        self.equality(c);
        if self.current.kind != TokenKind::AmpAmp {
            return;
        }
        let end = c.open_label();
        while self.eat(TokenKind::AmpAmp) {
            c.jump_if_not(end);
            self.equality(c);
        }
        c.place_label(end);
        c.close_label(end);
    }

    fn equality(&mut self, c: &mut Compiler) {
        self.comparison(c);
        loop {
            let op = match self.current.kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::BangEq => BinaryOp::Ne,
                _ => break,
            };
            self.advance();
            c.push();
            self.comparison(c);
            c.binary(op);
        }
    }

    fn comparison(&mut self, c: &mut Compiler) {
        self.term(c);
        loop {
            let op = match self.current.kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            c.push();
            self.term(c);
            c.binary(op);
        }
    }

    fn term(&mut self, c: &mut Compiler) {
        self.factor(c);
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            c.push();
            self.factor(c);
            c.binary(op);
        }
    }

    fn factor(&mut self, c: &mut Compiler) {
        self.unary(c);
        loop {
            let op = match self.current.kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            c.push();
            self.unary(c);
            c.binary(op);
        }
    }

    fn unary(&mut self, c: &mut Compiler) {
        match self.current.kind {
            TokenKind::Bang => {
                self.advance();
                self.unary(c);
                c.not();
            }
            TokenKind::Minus => {
                self.advance();
                c.load_const(Value::Int(0));
                c.push();
                self.unary(c);
                c.binary(BinaryOp::Sub);
            }
            _ => self.postfix(c),
        }
    }

    fn postfix(&mut self, c: &mut Compiler) {
        self.primary(c);
        loop {
            match self.current.kind {
                TokenKind::Dot => {
                    self.advance();
                    let Some(message) = self.ident("message name") else {
                        return;
                    };
                    if !self.expect(TokenKind::LParen, "`(`") {
                        return;
                    }
                    c.push();
                    let argc = self.arguments(c);
                    c.send(message, argc);
                }
                TokenKind::LBracket => {
                    self.advance();
                    c.push();
                    self.expression(c);
                    self.expect(TokenKind::RBracket, "`]`");
                    c.binary(BinaryOp::Index);
                }
                _ => return,
            }
        }
    }

    /// Argument list after a consumed `(`. Each argument is evaluated
    /// into the accumulator and pushed.
    fn arguments(&mut self, c: &mut Compiler) -> u32 {
        if self.eat(TokenKind::RParen) {
            return 0;
        }
        let mut argc = 0;
        loop {
            self.expression(c);
            c.push();
            argc += 1;
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "`)`");
        argc
    }

    fn primary(&mut self, c: &mut Compiler) {
        match self.current.kind.clone() {
            TokenKind::Int(n) => {
                self.advance();
                c.load_const(Value::Int(n));
            }
            TokenKind::CharLit(ch) => {
                self.advance();
                c.load_const(Value::Char(ch));
            }
            TokenKind::Str(text) => {
                self.advance();
                let r = self.heap.alloc_str(text);
                c.load_const(Value::Obj(r));
            }
            TokenKind::Nil => {
                self.advance();
                c.load_const(Value::Nil);
            }
            TokenKind::True => {
                self.advance();
                c.load_const(Value::Int(1));
            }
            TokenKind::False => {
                self.advance();
                c.load_const(Value::Int(0));
            }
            TokenKind::This => {
                self.advance();
                c.load_self();
            }
            TokenKind::LParen => {
                self.advance();
                self.expression(c);
                self.expect(TokenKind::RParen, "`)`");
            }
            TokenKind::LBracket => self.collection_literal(c),
            TokenKind::Amp => {
                self.advance();
                if let Some(name) = self.ident("function name") {
                    c.load_funcref(name);
                }
            }
            TokenKind::Super => {
                self.advance();
                self.expect(TokenKind::Dot, "`.`");
                let Some(message) = self.ident("message name") else {
                    return;
                };
                if !self.expect(TokenKind::LParen, "`(`") {
                    return;
                }
                c.push_self();
                let argc = self.arguments(c);
                c.super_send(message, argc);
            }
            TokenKind::Ident(name) => {
                let sym = self.symbols.intern(&name);
                self.advance();
                if self.current.kind == TokenKind::LParen {
                    // Unqualified call: the receiver is self.
                    self.advance();
                    c.push_self();
                    let argc = self.arguments(c);
                    c.send(sym, argc);
                } else {
                    c.load_var(sym, &self.builder);
                }
            }
            TokenKind::Error(message) => {
                self.error(message);
                self.advance();
                c.load_const(Value::Nil);
            }
            other => {
                self.error(format!("expected expression, found {}", other.describe()));
                c.load_const(Value::Nil);
            }
        }
    }

    /// `[...]` — array literal, or mapping literal when keys are present.
    fn collection_literal(&mut self, c: &mut Compiler) {
        self.advance();
        if self.eat(TokenKind::RBracket) {
            c.load_array(0);
            return;
        }
        if self.eat(TokenKind::Colon) {
            self.expect(TokenKind::RBracket, "`]`");
            c.load_mapping(0);
            return;
        }

        self.expression(c);
        if self.eat(TokenKind::Colon) {
            c.push();
            self.expression(c);
            c.push();
            let mut pairs = 1;
            while self.eat(TokenKind::Comma) {
                self.expression(c);
                c.push();
                self.expect(TokenKind::Colon, "`:`");
                self.expression(c);
                c.push();
                pairs += 1;
            }
            self.expect(TokenKind::RBracket, "`]`");
            c.load_mapping(pairs);
        } else {
            c.push();
            let mut len = 1;
            while self.eat(TokenKind::Comma) {
                self.expression(c);
                c.push();
                len += 1;
            }
            self.expect(TokenKind::RBracket, "`]`");
            c.load_array(len);
        }
    }
}
