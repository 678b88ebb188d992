use std::{fmt, rc::Rc};

use crate::{
    ast::{
        BinaryOp, EnumVariant, ExportStmt, Expr, ExprLoc, FieldDef, FunctionDef, FunctionId,
        ImportName, ImportStmt, IncDec, Param, RestParam, Stmt, StmtKind, SwitchCase, TypeExpr,
        TypeKind, UnaryOp,
    },
    intern::{Interner, Interns, StringId},
    lexer::Lexer,
    token::{CodeRange, Keyword, TemplateChunk, Token, TokenKind},
};

/// Hard cap on declared parameters per function.
pub const MAX_PARAMS: usize = 64;

/// A parse-time diagnostic with source-line context.
///
/// Diagnostics never abort parsing; the parser records them and synchronizes
/// to the next statement boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// A parsed compilation unit: statements plus the frozen intern table.
///
/// Tokens and AST nodes are owned here and freed together when the unit is
/// dropped, after codegen or interpretation completes.
#[derive(Debug)]
pub struct Program {
    pub stmts: Vec<Stmt>,
    pub interns: Interns,
    pub file_name: String,
    /// Number of function ids issued (top level excluded).
    pub fn_count: u32,
}

/// Result of parsing: the unit plus any diagnostics.
///
/// `program` is always populated; on malformed input it holds whatever
/// well-formed prefix structure was recovered.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Program,
    pub diagnostics: Vec<Diagnostic>,
}

impl ParseResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Parses a source buffer into a [`ParseResult`].
///
/// Deterministic and single-pass with one-token lookahead; repeated parses
/// of the same input produce structurally identical ASTs.
#[must_use]
pub fn parse(source: &str, file_name: &str) -> ParseResult {
    let mut parser = Parser::new(source, file_name);
    let stmts = parser.parse_program();
    let Parser {
        interner,
        diagnostics,
        next_fn_id,
        ..
    } = parser;
    ParseResult {
        program: Program {
            stmts,
            interns: interner.finish(),
            file_name: file_name.to_owned(),
            fn_count: next_fn_id - 1,
        },
        diagnostics,
    }
}

struct Parser<'src> {
    source: &'src str,
    lexer: Lexer<'src>,
    interner: Interner,
    current: Token,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
    /// Next function id to issue; 0 is reserved for top-level code.
    next_fn_id: u32,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str, _file_name: &str) -> Self {
        let mut parser = Self {
            source,
            lexer: Lexer::new(source),
            interner: Interner::new(),
            current: Token::eof(CodeRange::default()),
            diagnostics: Vec::new(),
            panic_mode: false,
            next_fn_id: 1,
        };
        parser.advance();
        parser
    }

    fn advance(&mut self) {
        self.current = self.lexer.next_token(&mut self.interner);
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.current.kind == *kind
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(format!(
                "expected {what}, found {}",
                self.current.kind.describe()
            ));
        }
    }

    fn at_eof(&self) -> bool {
        matches!(self.current.kind, TokenKind::Eof)
    }

    /// True when the current token is the identifier `word` (used for the
    /// contextual keywords `in`, `ref`, `from`, `as`, `ffi`, `extern`).
    fn at_contextual(&self, word: &str) -> bool {
        matches!(self.current.kind, TokenKind::Ident(id) if self.interner.get(id) == word)
    }

    fn eat_contextual(&mut self, word: &str) -> bool {
        if self.at_contextual(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_at_current(&mut self, message: impl Into<String>) {
        // Panic mode: one diagnostic per statement, then synchronize.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.diagnostics.push(Diagnostic {
            message: message.into(),
            line: self.current.position.line,
        });
    }

    /// Scans forward to the next statement boundary: past a `;`, or up to a
    /// `}` or a statement-starting keyword.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.at_eof() {
            match &self.current.kind {
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::RBrace => return,
                TokenKind::Keyword(
                    Keyword::Let
                    | Keyword::Const
                    | Keyword::Fn
                    | Keyword::If
                    | Keyword::While
                    | Keyword::For
                    | Keyword::Return
                    | Keyword::Break
                    | Keyword::Continue
                    | Keyword::Try
                    | Keyword::Throw
                    | Keyword::Defer
                    | Keyword::Import
                    | Keyword::Export
                    | Keyword::Enum
                    | Keyword::Define
                    | Keyword::Switch,
                ) => return,
                _ => self.advance(),
            }
        }
    }

    fn fresh_fn_id(&mut self) -> FunctionId {
        let id = FunctionId(self.next_fn_id);
        self.next_fn_id += 1;
        id
    }

    fn expect_ident(&mut self, what: &str) -> Option<StringId> {
        if let TokenKind::Ident(id) = self.current.kind {
            self.advance();
            Some(id)
        } else {
            self.error_at_current(format!(
                "expected {what}, found {}",
                self.current.kind.describe()
            ));
            None
        }
    }

    fn expect_string_literal(&mut self, what: &str) -> Option<StringId> {
        if let TokenKind::Str(id) = self.current.kind {
            self.advance();
            Some(id)
        } else {
            self.error_at_current(format!(
                "expected {what}, found {}",
                self.current.kind.describe()
            ));
            None
        }
    }

    // ---- program / statements -------------------------------------------

    fn parse_program(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        while !self.at_eof() {
            if self.matches(&TokenKind::Semicolon) {
                continue;
            }
            stmts.push(self.parse_statement());
            if self.panic_mode {
                self.synchronize();
            }
        }
        stmts
    }

    fn parse_statement(&mut self) -> Stmt {
        let position = self.current.position;
        if let TokenKind::Error(err) = self.current.kind {
            self.error_at_current(err.to_string());
            self.advance();
            return Stmt::new(StmtKind::Block(Vec::new()), position);
        }
        match &self.current.kind {
            TokenKind::Keyword(Keyword::Let) => self.parse_let(false),
            TokenKind::Keyword(Keyword::Const) => self.parse_let(true),
            TokenKind::Keyword(Keyword::Fn) => self.parse_fn_statement(false),
            TokenKind::Keyword(Keyword::Async) => {
                self.advance();
                if self.check(&TokenKind::Keyword(Keyword::Fn)) {
                    self.parse_fn_statement(true)
                } else {
                    self.error_at_current("expected 'fn' after 'async'");
                    Stmt::new(StmtKind::Block(Vec::new()), position)
                }
            }
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::For) => self.parse_for(),
            TokenKind::Keyword(Keyword::Return) => {
                self.advance();
                let value = if self.check(&TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_expression())
                };
                self.expect(&TokenKind::Semicolon, "';' after return");
                Stmt::new(StmtKind::Return(value), position)
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                self.expect(&TokenKind::Semicolon, "';' after break");
                Stmt::new(StmtKind::Break, position)
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                self.expect(&TokenKind::Semicolon, "';' after continue");
                Stmt::new(StmtKind::Continue, position)
            }
            TokenKind::Keyword(Keyword::Try) => self.parse_try(),
            TokenKind::Keyword(Keyword::Throw) => {
                self.advance();
                let value = self.parse_expression();
                self.expect(&TokenKind::Semicolon, "';' after throw");
                Stmt::new(StmtKind::Throw(value), position)
            }
            TokenKind::Keyword(Keyword::Defer) => {
                self.advance();
                let call = self.parse_expression();
                if !matches!(call.expr, Expr::Call { .. }) {
                    self.error_at_current("defer requires a call expression");
                }
                self.expect(&TokenKind::Semicolon, "';' after defer");
                Stmt::new(StmtKind::Defer(call), position)
            }
            TokenKind::Keyword(Keyword::Switch) => self.parse_switch(),
            TokenKind::Keyword(Keyword::Import) => self.parse_import(),
            TokenKind::Keyword(Keyword::Export) => self.parse_export(),
            TokenKind::Keyword(Keyword::Enum) => self.parse_enum(),
            TokenKind::Keyword(Keyword::Define) => self.parse_define(),
            TokenKind::LBrace => {
                let body = self.parse_block();
                Stmt::new(StmtKind::Block(body), position)
            }
            TokenKind::Ident(_) if self.at_contextual("extern") => self.parse_extern_fn(),
            _ => {
                let expr = self.parse_expression();
                self.expect(&TokenKind::Semicolon, "';' after expression");
                Stmt::new(StmtKind::Expr(expr), position)
            }
        }
    }

    /// `let name (: type)? (= expr)? ;` — `const` additionally requires the
    /// initializer.
    fn parse_let(&mut self, is_const: bool) -> Stmt {
        let position = self.current.position;
        self.advance();
        let name = self.expect_ident("binding name").unwrap_or_else(|| {
            // Keep structure well-formed under recovery.
            self.interner.intern("<error>")
        });
        let ty = if self.matches(&TokenKind::Colon) {
            Some(self.parse_type())
        } else {
            None
        };
        let value = if self.matches(&TokenKind::Eq) {
            Some(self.parse_expression())
        } else {
            None
        };
        self.expect(&TokenKind::Semicolon, "';' after declaration");
        if is_const {
            let value = value.unwrap_or_else(|| {
                self.error_at_current("const declaration requires an initializer");
                ExprLoc::new(Expr::Null, position)
            });
            Stmt::new(StmtKind::Const { name, ty, value }, position)
        } else {
            Stmt::new(StmtKind::Let { name, ty, value }, position)
        }
    }

    /// `fn name(params) : ret? { body }` is sugar for
    /// `let name = fn(params) : ret? { body };`. Without a name the function
    /// literal is an expression statement.
    fn parse_fn_statement(&mut self, is_async: bool) -> Stmt {
        let position = self.current.position;
        self.advance(); // fn
        if let TokenKind::Ident(name) = self.current.kind {
            self.advance();
            let func = self.parse_function_tail(Some(name), is_async, position);
            Stmt::new(
                StmtKind::Let {
                    name,
                    ty: None,
                    value: Some(func),
                },
                position,
            )
        } else {
            let func = self.parse_function_tail(None, is_async, position);
            let expr = self.parse_postfix_onto(func);
            self.expect(&TokenKind::Semicolon, "';' after expression");
            Stmt::new(StmtKind::Expr(expr), position)
        }
    }

    fn parse_if(&mut self) -> Stmt {
        let position = self.current.position;
        self.advance();
        self.expect(&TokenKind::LParen, "'(' after 'if'");
        let cond = self.parse_expression();
        self.expect(&TokenKind::RParen, "')' after condition");
        let then_block = self.parse_block();
        let else_block = if self.matches(&TokenKind::Keyword(Keyword::Else)) {
            if self.check(&TokenKind::Keyword(Keyword::If)) {
                Some(vec![self.parse_if()])
            } else {
                Some(self.parse_block())
            }
        } else {
            None
        };
        Stmt::new(
            StmtKind::If {
                cond,
                then_block,
                else_block,
            },
            position,
        )
    }

    fn parse_while(&mut self) -> Stmt {
        let position = self.current.position;
        self.advance();
        self.expect(&TokenKind::LParen, "'(' after 'while'");
        let cond = self.parse_expression();
        self.expect(&TokenKind::RParen, "')' after condition");
        let body = self.parse_block();
        Stmt::new(StmtKind::While { cond, body }, position)
    }

    /// Accepts both the three-part C-style form and `for (k, v in expr)`.
    fn parse_for(&mut self) -> Stmt {
        let position = self.current.position;
        self.advance();
        self.expect(&TokenKind::LParen, "'(' after 'for'");

        // Empty init: `for (;…)`.
        if self.matches(&TokenKind::Semicolon) {
            return self.parse_for_rest(None, position);
        }
        // `let` init is always the three-part form.
        if self.check(&TokenKind::Keyword(Keyword::Let)) {
            let init = self.parse_let(false);
            return self.parse_for_rest(Some(Box::new(init)), position);
        }

        // Otherwise parse one expression, then decide: `,` or `in` means
        // iteration, anything else is a three-part init expression.
        let first = self.parse_expression();
        if self.check(&TokenKind::Comma) || self.at_contextual("in") {
            let key_or_value = match first.expr {
                Expr::Ident(id) => id,
                _ => {
                    self.error_at_current("expected loop variable name before 'in'");
                    self.interner.intern("<error>")
                }
            };
            let (key, value) = if self.matches(&TokenKind::Comma) {
                let value = self
                    .expect_ident("loop value name")
                    .unwrap_or_else(|| self.interner.intern("<error>"));
                (Some(key_or_value), value)
            } else {
                (None, key_or_value)
            };
            if !self.eat_contextual("in") {
                self.error_at_current("expected 'in' in for-in loop");
            }
            let iterable = self.parse_expression();
            self.expect(&TokenKind::RParen, "')' after for-in");
            let body = self.parse_block();
            return Stmt::new(
                StmtKind::ForIn {
                    key,
                    value,
                    iterable,
                    body,
                },
                position,
            );
        }

        let init_pos = first.position;
        self.expect(&TokenKind::Semicolon, "';' after for initializer");
        self.parse_for_rest(
            Some(Box::new(Stmt::new(StmtKind::Expr(first), init_pos))),
            position,
        )
    }

    fn parse_for_rest(&mut self, init: Option<Box<Stmt>>, position: CodeRange) -> Stmt {
        let cond = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression())
        };
        self.expect(&TokenKind::Semicolon, "';' after for condition");
        let step = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(self.parse_expression())
        };
        self.expect(&TokenKind::RParen, "')' after for clauses");
        let body = self.parse_block();
        Stmt::new(
            StmtKind::For {
                init,
                cond,
                step,
                body,
            },
            position,
        )
    }

    fn parse_try(&mut self) -> Stmt {
        let position = self.current.position;
        self.advance();
        let body = self.parse_block();
        let mut catch_param = None;
        let catch_block = if self.matches(&TokenKind::Keyword(Keyword::Catch)) {
            if self.matches(&TokenKind::LParen) {
                catch_param = self.expect_ident("catch parameter");
                self.expect(&TokenKind::RParen, "')' after catch parameter");
            }
            Some(self.parse_block())
        } else {
            None
        };
        let finally_block = if self.matches(&TokenKind::Keyword(Keyword::Finally)) {
            Some(self.parse_block())
        } else {
            None
        };
        if catch_block.is_none() && finally_block.is_none() {
            self.error_at_current("try requires a catch or finally block");
        }
        Stmt::new(
            StmtKind::Try {
                body,
                catch_param,
                catch_block,
                finally_block,
            },
            position,
        )
    }

    fn parse_switch(&mut self) -> Stmt {
        let position = self.current.position;
        self.advance();
        self.expect(&TokenKind::LParen, "'(' after 'switch'");
        let expr = self.parse_expression();
        self.expect(&TokenKind::RParen, "')' after switch expression");
        self.expect(&TokenKind::LBrace, "'{' to open switch body");
        let mut cases = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            let value = if self.matches(&TokenKind::Keyword(Keyword::Case)) {
                let v = self.parse_expression();
                self.expect(&TokenKind::Colon, "':' after case value");
                Some(v)
            } else if self.matches(&TokenKind::Keyword(Keyword::Default)) {
                self.expect(&TokenKind::Colon, "':' after default");
                None
            } else {
                self.error_at_current("expected 'case' or 'default' in switch body");
                break;
            };
            let mut body = Vec::new();
            while !matches!(
                self.current.kind,
                TokenKind::Keyword(Keyword::Case | Keyword::Default)
                    | TokenKind::RBrace
                    | TokenKind::Eof
            ) {
                body.push(self.parse_statement());
                if self.panic_mode {
                    self.synchronize();
                }
            }
            cases.push(SwitchCase { value, body });
        }
        self.expect(&TokenKind::RBrace, "'}' to close switch body");
        Stmt::new(StmtKind::Switch { expr, cases }, position)
    }

    /// `import * as ns from "m";` | `import { a, b as c } from "m";` |
    /// `import "m";` | `import ffi "lib";`
    fn parse_import(&mut self) -> Stmt {
        let position = self.current.position;
        self.advance();

        if self.at_contextual("ffi") {
            self.advance();
            let library_path = self
                .expect_string_literal("library path string")
                .unwrap_or_else(|| self.interner.intern("<error>"));
            self.expect(&TokenKind::Semicolon, "';' after import");
            return Stmt::new(StmtKind::ImportFfi { library_path }, position);
        }

        let mut is_namespace = false;
        let mut namespace_name = None;
        let mut names = Vec::new();
        if self.matches(&TokenKind::Star) {
            is_namespace = true;
            if self.eat_contextual("as") {
                namespace_name = self.expect_ident("namespace name");
            } else {
                self.error_at_current("expected 'as' after '*' in import");
            }
            if !self.eat_contextual("from") {
                self.error_at_current("expected 'from' in import");
            }
        } else if self.matches(&TokenKind::LBrace) {
            names = self.parse_name_list();
            self.expect(&TokenKind::RBrace, "'}' after import names");
            if !self.eat_contextual("from") {
                self.error_at_current("expected 'from' in import");
            }
        }
        let module_path = self
            .expect_string_literal("module path string")
            .unwrap_or_else(|| self.interner.intern("<error>"));
        self.expect(&TokenKind::Semicolon, "';' after import");
        Stmt::new(
            StmtKind::Import(ImportStmt {
                module_path,
                is_namespace,
                namespace_name,
                names,
            }),
            position,
        )
    }

    fn parse_name_list(&mut self) -> Vec<ImportName> {
        let mut names = Vec::new();
        loop {
            let Some(original) = self.expect_ident("name") else {
                break;
            };
            let alias = if self.eat_contextual("as") {
                self.expect_ident("alias")
            } else {
                None
            };
            names.push(ImportName { original, alias });
            if !self.matches(&TokenKind::Comma) {
                break;
            }
            if self.check(&TokenKind::RBrace) {
                break; // trailing comma
            }
        }
        names
    }

    fn parse_export(&mut self) -> Stmt {
        let position = self.current.position;
        self.advance();
        if self.matches(&TokenKind::LBrace) {
            let names = self.parse_name_list();
            self.expect(&TokenKind::RBrace, "'}' after export names");
            let module_path = if self.eat_contextual("from") {
                self.expect_string_literal("module path string")
            } else {
                None
            };
            self.expect(&TokenKind::Semicolon, "';' after export");
            Stmt::new(
                StmtKind::Export(ExportStmt::Names { names, module_path }),
                position,
            )
        } else if matches!(
            self.current.kind,
            TokenKind::Keyword(
                Keyword::Let
                    | Keyword::Const
                    | Keyword::Fn
                    | Keyword::Async
                    | Keyword::Enum
                    | Keyword::Define
            )
        ) {
            let decl = self.parse_statement();
            Stmt::new(StmtKind::Export(ExportStmt::Declaration(Box::new(decl))), position)
        } else {
            self.error_at_current("expected '{' or a declaration after 'export'");
            Stmt::new(StmtKind::Block(Vec::new()), position)
        }
    }

    fn parse_enum(&mut self) -> Stmt {
        let position = self.current.position;
        self.advance();
        let name = self
            .expect_ident("enum name")
            .unwrap_or_else(|| self.interner.intern("<error>"));
        self.expect(&TokenKind::LBrace, "'{' to open enum body");
        let mut variants = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            let Some(vname) = self.expect_ident("enum variant name") else {
                break;
            };
            let value = if self.matches(&TokenKind::Eq) {
                Some(self.parse_expression())
            } else {
                None
            };
            variants.push(EnumVariant { name: vname, value });
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "'}' to close enum body");
        Stmt::new(StmtKind::EnumDecl { name, variants }, position)
    }

    /// `define Name { field: type, opt?: type, with_default: type = expr }`
    fn parse_define(&mut self) -> Stmt {
        let position = self.current.position;
        self.advance();
        let name = self
            .expect_ident("object type name")
            .unwrap_or_else(|| self.interner.intern("<error>"));
        self.expect(&TokenKind::LBrace, "'{' to open define body");
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            let Some(fname) = self.expect_ident("field name") else {
                break;
            };
            let optional = self.matches(&TokenKind::Question);
            let ty = if self.matches(&TokenKind::Colon) {
                Some(self.parse_type())
            } else {
                None
            };
            let default = if self.matches(&TokenKind::Eq) {
                Some(self.parse_expression())
            } else {
                None
            };
            fields.push(FieldDef {
                name: fname,
                ty,
                default,
                optional,
            });
            if !self.matches(&TokenKind::Comma) && !self.matches(&TokenKind::Semicolon) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "'}' to close define body");
        Stmt::new(StmtKind::DefineObject { name, fields }, position)
    }

    /// `extern fn name(i32, string): i64;`
    fn parse_extern_fn(&mut self) -> Stmt {
        let position = self.current.position;
        self.advance(); // extern
        self.expect(&TokenKind::Keyword(Keyword::Fn), "'fn' after 'extern'");
        let name = self
            .expect_ident("extern function name")
            .unwrap_or_else(|| self.interner.intern("<error>"));
        self.expect(&TokenKind::LParen, "'(' after extern function name");
        let mut param_types = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                param_types.push(self.parse_type());
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "')' after extern parameter types");
        let return_type = if self.matches(&TokenKind::Colon) {
            self.parse_type()
        } else {
            TypeExpr::new(TypeKind::Void)
        };
        self.expect(&TokenKind::Semicolon, "';' after extern declaration");
        Stmt::new(
            StmtKind::ExternFn {
                name,
                param_types,
                return_type,
            },
            position,
        )
    }

    fn parse_block(&mut self) -> Vec<Stmt> {
        self.expect(&TokenKind::LBrace, "'{' to open block");
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            if self.matches(&TokenKind::Semicolon) {
                continue;
            }
            stmts.push(self.parse_statement());
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.expect(&TokenKind::RBrace, "'}' to close block");
        stmts
    }

    // ---- types -----------------------------------------------------------

    fn parse_type(&mut self) -> TypeExpr {
        let kind = match &self.current.kind {
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                TypeKind::Null
            }
            TokenKind::Ident(id) => {
                let id = *id;
                let kind = match self.interner.get(id) {
                    "i8" => TypeKind::I8,
                    "i16" => TypeKind::I16,
                    "i32" => TypeKind::I32,
                    "i64" => TypeKind::I64,
                    "u8" => TypeKind::U8,
                    "u16" => TypeKind::U16,
                    "u32" => TypeKind::U32,
                    "u64" => TypeKind::U64,
                    "f32" => TypeKind::F32,
                    "f64" => TypeKind::F64,
                    "bool" => TypeKind::Bool,
                    "string" => TypeKind::String,
                    "rune" => TypeKind::Rune,
                    "ptr" => TypeKind::Ptr,
                    "buffer" => TypeKind::Buffer,
                    "void" => TypeKind::Void,
                    "object" => TypeKind::GenericObject,
                    "array" => {
                        self.advance();
                        let element = if self.matches(&TokenKind::Lt) {
                            let e = self.parse_type();
                            self.expect(&TokenKind::Gt, "'>' to close array type");
                            e
                        } else {
                            TypeExpr::infer()
                        };
                        let nullable = self.matches(&TokenKind::Question);
                        return TypeExpr {
                            kind: TypeKind::Array(Box::new(element)),
                            nullable,
                        };
                    }
                    _ => TypeKind::CustomObject(id),
                };
                self.advance();
                kind
            }
            _ => {
                self.error_at_current(format!(
                    "expected type, found {}",
                    self.current.kind.describe()
                ));
                TypeKind::Infer
            }
        };
        let nullable = self.matches(&TokenKind::Question);
        TypeExpr { kind, nullable }
    }

    // ---- expressions -----------------------------------------------------

    fn parse_expression(&mut self) -> ExprLoc {
        self.parse_assignment()
    }

    /// Assignment is right-associative and the lowest precedence level.
    fn parse_assignment(&mut self) -> ExprLoc {
        let target = self.parse_ternary();
        if self.matches(&TokenKind::Eq) {
            let position = target.position;
            let value = Box::new(self.parse_assignment());
            let expr = match target.expr {
                Expr::Ident(name) => Expr::Assign { name, value },
                Expr::GetProp { object, name } => Expr::SetProp {
                    object,
                    name,
                    value,
                },
                Expr::Index { object, index } => Expr::IndexAssign {
                    object,
                    index,
                    value,
                },
                _ => {
                    self.error_at_current("invalid assignment target");
                    Expr::Null
                }
            };
            return ExprLoc::new(expr, position);
        }
        target
    }

    /// `cond ? then : else`, right-associative through the else arm.
    fn parse_ternary(&mut self) -> ExprLoc {
        let cond = self.parse_coalesce();
        if self.matches(&TokenKind::Question) {
            let position = cond.position;
            let then_expr = Box::new(self.parse_assignment());
            self.expect(&TokenKind::Colon, "':' in ternary expression");
            let else_expr = Box::new(self.parse_ternary());
            return ExprLoc::new(
                Expr::Ternary {
                    cond: Box::new(cond),
                    then_expr,
                    else_expr,
                },
                position,
            );
        }
        cond
    }

    fn parse_coalesce(&mut self) -> ExprLoc {
        let mut left = self.parse_or();
        while self.matches(&TokenKind::QuestionQuestion) {
            let position = left.position;
            let right = self.parse_or();
            left = ExprLoc::new(
                Expr::NullCoalesce {
                    left: Box::new(left),
                    right: Box::new(right),
                },
                position,
            );
        }
        left
    }

    fn parse_or(&mut self) -> ExprLoc {
        let mut left = self.parse_and();
        while self.matches(&TokenKind::PipePipe) {
            let right = self.parse_and();
            left = binary(BinaryOp::Or, left, right);
        }
        left
    }

    fn parse_and(&mut self) -> ExprLoc {
        let mut left = self.parse_bit_or();
        while self.matches(&TokenKind::AmpAmp) {
            let right = self.parse_bit_or();
            left = binary(BinaryOp::And, left, right);
        }
        left
    }

    fn parse_bit_or(&mut self) -> ExprLoc {
        let mut left = self.parse_bit_xor();
        while self.matches(&TokenKind::Pipe) {
            let right = self.parse_bit_xor();
            left = binary(BinaryOp::BitOr, left, right);
        }
        left
    }

    fn parse_bit_xor(&mut self) -> ExprLoc {
        let mut left = self.parse_bit_and();
        while self.matches(&TokenKind::Caret) {
            let right = self.parse_bit_and();
            left = binary(BinaryOp::BitXor, left, right);
        }
        left
    }

    fn parse_bit_and(&mut self) -> ExprLoc {
        let mut left = self.parse_equality();
        while self.matches(&TokenKind::Amp) {
            let right = self.parse_equality();
            left = binary(BinaryOp::BitAnd, left, right);
        }
        left
    }

    fn parse_equality(&mut self) -> ExprLoc {
        let mut left = self.parse_comparison();
        loop {
            let op = if self.matches(&TokenKind::EqEq) {
                BinaryOp::Eq
            } else if self.matches(&TokenKind::BangEq) {
                BinaryOp::Ne
            } else {
                return left;
            };
            let right = self.parse_comparison();
            left = binary(op, left, right);
        }
    }

    fn parse_comparison(&mut self) -> ExprLoc {
        let mut left = self.parse_shift();
        loop {
            let op = if self.matches(&TokenKind::Lt) {
                BinaryOp::Lt
            } else if self.matches(&TokenKind::LtEq) {
                BinaryOp::Le
            } else if self.matches(&TokenKind::Gt) {
                BinaryOp::Gt
            } else if self.matches(&TokenKind::GtEq) {
                BinaryOp::Ge
            } else {
                return left;
            };
            let right = self.parse_shift();
            left = binary(op, left, right);
        }
    }

    fn parse_shift(&mut self) -> ExprLoc {
        let mut left = self.parse_additive();
        loop {
            let op = if self.matches(&TokenKind::Shl) {
                BinaryOp::Shl
            } else if self.matches(&TokenKind::Shr) {
                BinaryOp::Shr
            } else {
                return left;
            };
            let right = self.parse_additive();
            left = binary(op, left, right);
        }
    }

    fn parse_additive(&mut self) -> ExprLoc {
        let mut left = self.parse_multiplicative();
        loop {
            let op = if self.matches(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.matches(&TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                return left;
            };
            let right = self.parse_multiplicative();
            left = binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> ExprLoc {
        let mut left = self.parse_unary();
        loop {
            let op = if self.matches(&TokenKind::Star) {
                BinaryOp::Mul
            } else if self.matches(&TokenKind::Slash) {
                BinaryOp::Div
            } else if self.matches(&TokenKind::Percent) {
                BinaryOp::Mod
            } else {
                return left;
            };
            let right = self.parse_unary();
            left = binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> ExprLoc {
        let position = self.current.position;
        let op = match &self.current.kind {
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary();
            return ExprLoc::new(
                Expr::Unary {
                    op,
                    operand: Box::new(operand),
                },
                position,
            );
        }
        if self.matches(&TokenKind::PlusPlus) {
            let target = self.parse_unary();
            return self.make_inc_dec(IncDec::Inc, target, position, true);
        }
        if self.matches(&TokenKind::MinusMinus) {
            let target = self.parse_unary();
            return self.make_inc_dec(IncDec::Dec, target, position, true);
        }
        if self.matches(&TokenKind::Keyword(Keyword::Await)) {
            let operand = self.parse_unary();
            return ExprLoc::new(Expr::Await(Box::new(operand)), position);
        }
        self.parse_postfix()
    }

    fn make_inc_dec(
        &mut self,
        op: IncDec,
        target: ExprLoc,
        position: CodeRange,
        prefix: bool,
    ) -> ExprLoc {
        if !matches!(
            target.expr,
            Expr::Ident(_) | Expr::GetProp { .. } | Expr::Index { .. }
        ) {
            self.error_at_current("invalid increment/decrement target");
        }
        let expr = if prefix {
            Expr::PrefixIncDec {
                op,
                target: Box::new(target),
            }
        } else {
            Expr::PostfixIncDec {
                op,
                target: Box::new(target),
            }
        };
        ExprLoc::new(expr, position)
    }

    fn parse_postfix(&mut self) -> ExprLoc {
        let primary = self.parse_primary();
        self.parse_postfix_onto(primary)
    }

    fn parse_postfix_onto(&mut self, mut expr: ExprLoc) -> ExprLoc {
        loop {
            let position = expr.position;
            if self.matches(&TokenKind::LParen) {
                let mut args = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    loop {
                        args.push(self.parse_assignment());
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RParen, "')' after arguments");
                expr = ExprLoc::new(
                    Expr::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    position,
                );
            } else if self.matches(&TokenKind::LBracket) {
                let index = self.parse_expression();
                self.expect(&TokenKind::RBracket, "']' after index");
                expr = ExprLoc::new(
                    Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    },
                    position,
                );
            } else if self.matches(&TokenKind::Dot) {
                let name = self
                    .expect_ident("property name")
                    .unwrap_or_else(|| self.interner.intern("<error>"));
                expr = ExprLoc::new(
                    Expr::GetProp {
                        object: Box::new(expr),
                        name,
                    },
                    position,
                );
            } else if self.matches(&TokenKind::QuestionDot) {
                let name = self
                    .expect_ident("property name")
                    .unwrap_or_else(|| self.interner.intern("<error>"));
                expr = ExprLoc::new(
                    Expr::OptionalChain {
                        object: Box::new(expr),
                        name,
                    },
                    position,
                );
            } else if self.matches(&TokenKind::PlusPlus) {
                expr = self.make_inc_dec(IncDec::Inc, expr, position, false);
            } else if self.matches(&TokenKind::MinusMinus) {
                expr = self.make_inc_dec(IncDec::Dec, expr, position, false);
            } else {
                return expr;
            }
        }
    }

    fn parse_primary(&mut self) -> ExprLoc {
        let position = self.current.position;
        match self.current.kind.clone() {
            TokenKind::Number {
                int_value,
                float_value,
                is_float,
            } => {
                self.advance();
                ExprLoc::new(
                    Expr::Number {
                        int_value,
                        float_value,
                        is_float,
                    },
                    position,
                )
            }
            TokenKind::Str(id) => {
                self.advance();
                ExprLoc::new(Expr::Str(id), position)
            }
            TokenKind::Rune(c) => {
                self.advance();
                ExprLoc::new(Expr::Rune(c), position)
            }
            TokenKind::Template(chunks) => {
                self.advance();
                self.parse_template(&chunks, position)
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                ExprLoc::new(Expr::Bool(true), position)
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                ExprLoc::new(Expr::Bool(false), position)
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                ExprLoc::new(Expr::Null, position)
            }
            TokenKind::Keyword(Keyword::Fn) => {
                self.advance();
                self.parse_function_tail(None, false, position)
            }
            TokenKind::Keyword(Keyword::Async) => {
                self.advance();
                self.expect(&TokenKind::Keyword(Keyword::Fn), "'fn' after 'async'");
                self.parse_function_tail(None, true, position)
            }
            TokenKind::Ident(id) => {
                self.advance();
                ExprLoc::new(Expr::Ident(id), position)
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression();
                self.expect(&TokenKind::RParen, "')' after expression");
                expr
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        elements.push(self.parse_assignment());
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                        if self.check(&TokenKind::RBracket) {
                            break; // trailing comma
                        }
                    }
                }
                self.expect(&TokenKind::RBracket, "']' after array literal");
                ExprLoc::new(Expr::ArrayLit(elements), position)
            }
            TokenKind::LBrace => {
                self.advance();
                let mut fields = Vec::new();
                if !self.check(&TokenKind::RBrace) {
                    loop {
                        let Some(name) = self.expect_ident("field name") else {
                            break;
                        };
                        self.expect(&TokenKind::Colon, "':' after field name");
                        let value = self.parse_assignment();
                        fields.push((name, value));
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                        if self.check(&TokenKind::RBrace) {
                            break; // trailing comma
                        }
                    }
                }
                self.expect(&TokenKind::RBrace, "'}' after object literal");
                ExprLoc::new(Expr::ObjectLit { fields }, position)
            }
            TokenKind::Error(err) => {
                self.error_at_current(err.to_string());
                self.advance();
                ExprLoc::new(Expr::Null, position)
            }
            _ => {
                self.error_at_current(format!(
                    "expected expression, found {}",
                    self.current.kind.describe()
                ));
                // Consume the offending token so recovery always progresses.
                if !self.at_eof() {
                    self.advance();
                }
                ExprLoc::new(Expr::Null, position)
            }
        }
    }

    /// Parses `(params) : ret? { body }` after the `fn` keyword (and
    /// optional name) have been consumed.
    fn parse_function_tail(
        &mut self,
        name: Option<StringId>,
        is_async: bool,
        position: CodeRange,
    ) -> ExprLoc {
        let fn_id = self.fresh_fn_id();
        self.expect(&TokenKind::LParen, "'(' to open parameter list");
        let mut params = Vec::new();
        let mut rest = None;
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.matches(&TokenKind::Ellipsis) {
                    let rest_name = self
                        .expect_ident("rest parameter name")
                        .unwrap_or_else(|| self.interner.intern("<error>"));
                    let ty = if self.matches(&TokenKind::Colon) {
                        Some(self.parse_type())
                    } else {
                        None
                    };
                    rest = Some(RestParam {
                        name: rest_name,
                        ty,
                    });
                    break;
                }
                let is_ref = self.eat_contextual("ref");
                let Some(pname) = self.expect_ident("parameter name") else {
                    break;
                };
                // `name ?: type` marks a defaulted parameter even without an
                // explicit `= expr` (the default is then null).
                let optional = self.matches(&TokenKind::Question);
                let ty = if self.matches(&TokenKind::Colon) {
                    Some(self.parse_type())
                } else {
                    None
                };
                let mut default = if self.matches(&TokenKind::Eq) {
                    Some(self.parse_assignment())
                } else {
                    None
                };
                if optional && default.is_none() {
                    default = Some(ExprLoc::new(Expr::Null, position));
                }
                params.push(Param {
                    name: pname,
                    ty,
                    default,
                    is_ref,
                });
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        if params.len() > MAX_PARAMS {
            self.error_at_current(format!("too many parameters (limit is {MAX_PARAMS})"));
        }
        self.expect(&TokenKind::RParen, "')' to close parameter list");
        let return_type = if self.matches(&TokenKind::Colon) {
            Some(self.parse_type())
        } else {
            None
        };
        let body = self.parse_block();
        ExprLoc::new(
            Expr::Function(Rc::new(FunctionDef {
                name,
                params,
                rest,
                return_type,
                body,
                is_async,
                fn_id,
            })),
            position,
        )
    }

    fn parse_template(&mut self, chunks: &[TemplateChunk], position: CodeRange) -> ExprLoc {
        let mut strings = Vec::new();
        let mut exprs = Vec::new();
        for chunk in chunks {
            match chunk {
                TemplateChunk::Lit(id) => strings.push(*id),
                TemplateChunk::Expr(range) => exprs.push(self.parse_subrange(*range)),
            }
        }
        ExprLoc::new(Expr::Interp { strings, exprs }, position)
    }

    /// Re-enters the lexer on a template expression span. The main lexer and
    /// lookahead token are stashed and restored, so the sub-parse shares the
    /// interner, diagnostics, and function-id counter.
    fn parse_subrange(&mut self, range: CodeRange) -> ExprLoc {
        let sub_source = &self.source[..range.end as usize];
        let sub_lexer = Lexer::new_at(sub_source, range.start as usize, range.line);
        let saved_lexer = std::mem::replace(&mut self.lexer, sub_lexer);
        let saved_current = std::mem::replace(&mut self.current, Token::eof(range));
        let saved_panic = self.panic_mode;
        self.advance();
        let expr = self.parse_expression();
        if !self.at_eof() {
            self.error_at_current("unexpected token in template expression");
        }
        self.lexer = saved_lexer;
        self.current = saved_current;
        self.panic_mode = saved_panic;
        expr
    }
}

fn binary(op: BinaryOp, left: ExprLoc, right: ExprLoc) -> ExprLoc {
    let position = left.position;
    ExprLoc::new(
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        position,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        let result = parse(source, "test.hml");
        assert!(
            result.diagnostics.is_empty(),
            "unexpected diagnostics: {:?}",
            result.diagnostics
        );
        result.program
    }

    #[test]
    fn precedence_orders_arithmetic_below_comparison() {
        let program = parse_ok("let x = 1 + 2 * 3 < 4 << 1;");
        let StmtKind::Let {
            value: Some(value), ..
        } = &program.stmts[0].kind
        else {
            panic!("expected let");
        };
        // (1 + (2 * 3)) < (4 << 1)
        let Expr::Binary { op, left, right } = &value.expr else {
            panic!("expected comparison at the top");
        };
        assert_eq!(*op, BinaryOp::Lt);
        assert!(matches!(
            left.expr,
            Expr::Binary {
                op: BinaryOp::Add,
                ..
            }
        ));
        assert!(matches!(
            right.expr,
            Expr::Binary {
                op: BinaryOp::Shl,
                ..
            }
        ));
    }

    #[test]
    fn assignment_is_right_associative() {
        let program = parse_ok("a = b = 1;");
        let StmtKind::Expr(expr) = &program.stmts[0].kind else {
            panic!("expected expression statement");
        };
        let Expr::Assign { value, .. } = &expr.expr else {
            panic!("expected assignment");
        };
        assert!(matches!(value.expr, Expr::Assign { .. }));
    }

    #[test]
    fn fn_declaration_desugars_to_let() {
        let program = parse_ok("fn add(a, b) { return a + b; }");
        let StmtKind::Let {
            value: Some(value), ..
        } = &program.stmts[0].kind
        else {
            panic!("expected let");
        };
        let Expr::Function(def) = &value.expr else {
            panic!("expected function literal");
        };
        assert_eq!(def.params.len(), 2);
        assert!(def.name.is_some());
    }

    #[test]
    fn for_in_forms() {
        let program = parse_ok("for (k, v in obj) { print(k); } for (x in arr) { print(x); }");
        assert!(matches!(
            program.stmts[0].kind,
            StmtKind::ForIn { key: Some(_), .. }
        ));
        assert!(matches!(
            program.stmts[1].kind,
            StmtKind::ForIn { key: None, .. }
        ));
    }

    #[test]
    fn three_part_for_with_let_init() {
        let program = parse_ok("for (let i = 0; i < 10; i = i + 1) { print(i); }");
        let StmtKind::For {
            init: Some(init),
            cond: Some(_),
            step: Some(_),
            ..
        } = &program.stmts[0].kind
        else {
            panic!("expected three-part for");
        };
        assert!(matches!(init.kind, StmtKind::Let { .. }));
    }

    #[test]
    fn try_catch_finally_shapes() {
        let program =
            parse_ok("try { f(); } catch (e) { g(e); } finally { h(); } try { f(); } finally { h(); }");
        assert!(matches!(
            &program.stmts[0].kind,
            StmtKind::Try {
                catch_param: Some(_),
                catch_block: Some(_),
                finally_block: Some(_),
                ..
            }
        ));
        assert!(matches!(
            &program.stmts[1].kind,
            StmtKind::Try {
                catch_param: None,
                catch_block: None,
                finally_block: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn template_string_parses_interpolations() {
        let program = parse_ok("let s = `x=${x} y=${y + 1}`;");
        let StmtKind::Let {
            value: Some(value), ..
        } = &program.stmts[0].kind
        else {
            panic!("expected let");
        };
        let Expr::Interp { strings, exprs } = &value.expr else {
            panic!("expected interpolation");
        };
        assert_eq!(strings.len(), exprs.len() + 1);
        assert_eq!(exprs.len(), 2);
    }

    #[test]
    fn repeated_parses_are_structurally_identical() {
        let source = r#"
            fn fact(n, acc) { if (n <= 1) { return acc; } return fact(n - 1, acc * n); }
            let xs = [1, 2, 3];
            for (i, v in xs) { print(`${i}: ${v}`); }
            try { throw "boom"; } catch (e) { print(e); } finally { print("done"); }
        "#;
        let a = parse(source, "test.hml");
        let b = parse(source, "test.hml");
        assert!(a.diagnostics.is_empty());
        assert_eq!(a.program.stmts, b.program.stmts);
    }

    #[test]
    fn malformed_input_reports_and_recovers() {
        let result = parse("let = 5; let ok = 1;", "test.hml");
        assert!(!result.diagnostics.is_empty());
        // The parser recovered and still parsed the second statement.
        assert!(
            result
                .program
                .stmts
                .iter()
                .any(|s| matches!(s.kind, StmtKind::Let { .. }))
        );
    }

    #[test]
    fn one_error_per_statement() {
        let result = parse("let a = (1 + ; let b = 2;", "test.hml");
        assert_eq!(result.diagnostics.len(), 1, "{:?}", result.diagnostics);
    }

    #[test]
    fn import_export_forms() {
        let program = parse_ok(
            r#"import * as m from "lib/m"; import { a, b as c } from "lib/n"; export { a }; export fn f() { return 1; }"#,
        );
        assert!(matches!(
            &program.stmts[0].kind,
            StmtKind::Import(ImportStmt {
                is_namespace: true,
                namespace_name: Some(_),
                ..
            })
        ));
        let StmtKind::Import(import) = &program.stmts[1].kind else {
            panic!("expected import");
        };
        assert_eq!(import.names.len(), 2);
        assert!(import.names[1].alias.is_some());
        assert!(matches!(
            &program.stmts[2].kind,
            StmtKind::Export(ExportStmt::Names { .. })
        ));
        assert!(matches!(
            &program.stmts[3].kind,
            StmtKind::Export(ExportStmt::Declaration(_))
        ));
    }

    #[test]
    fn define_and_enum_declarations() {
        let program = parse_ok(
            "define Point { x: i32, y: i32 = 0, label?: string } enum Color { Red, Green = 5, Blue }",
        );
        let StmtKind::DefineObject { fields, .. } = &program.stmts[0].kind else {
            panic!("expected define");
        };
        assert_eq!(fields.len(), 3);
        assert!(fields[1].default.is_some());
        assert!(fields[2].optional);
        let StmtKind::EnumDecl { variants, .. } = &program.stmts[1].kind else {
            panic!("expected enum");
        };
        assert_eq!(variants.len(), 3);
        assert!(variants[1].value.is_some());
    }

    #[test]
    fn params_accept_ref_default_and_rest() {
        let program = parse_ok("fn f(ref a: i64, b ?: i32, c = 2, ...rest: array<i32>) { return 0; }");
        let StmtKind::Let {
            value: Some(value), ..
        } = &program.stmts[0].kind
        else {
            panic!("expected let");
        };
        let Expr::Function(def) = &value.expr else {
            panic!("expected function");
        };
        assert!(def.params[0].is_ref);
        assert!(def.params[1].default.is_some());
        assert!(def.params[2].default.is_some());
        assert!(def.rest.is_some());
    }
}
