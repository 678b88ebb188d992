//! Closure analysis for the C backend.
//!
//! Before emitting bodies, the compiler computes the captured set of every
//! function: identifiers referenced inside a function that are neither its
//! parameters nor declared in it. Each enclosing function scope with at
//! least one captured variable materialises one shared closure environment;
//! every nested function defined in that scope receives the same
//! environment pointer, so overlapping captures share slots. Slot
//! assignment is discovery-ordered and stable within a compilation unit.

use ahash::{AHashMap, AHashSet};

use crate::{
    ast::{Expr, ExprLoc, FunctionDef, FunctionId, Stmt, StmtKind},
    intern::StringId,
    parser::Program,
};

/// Output of closure analysis.
#[derive(Debug, Default)]
pub(crate) struct ClosureInfo {
    /// `(owning function scope, name)` pairs captured by a nested function.
    captured: AHashSet<(FunctionId, StringId)>,
    /// Stable slot order per owning scope.
    slots: AHashMap<FunctionId, Vec<StringId>>,
}

impl ClosureInfo {
    pub fn is_captured(&self, scope: FunctionId, name: StringId) -> bool {
        self.captured.contains(&(scope, name))
    }

    /// Env slot index of a captured variable in its owning scope.
    pub fn slot_of(&self, scope: FunctionId, name: StringId) -> Option<usize> {
        self.slots.get(&scope)?.iter().position(|&n| n == name)
    }

    /// Number of slots in the scope's shared environment (0 = no env).
    pub fn env_size(&self, scope: FunctionId) -> usize {
        self.slots.get(&scope).map_or(0, Vec::len)
    }

    pub fn has_env(&self, scope: FunctionId) -> bool {
        self.env_size(scope) > 0
    }
}

/// One lexical function scope during the walk.
struct FnScope {
    fn_id: FunctionId,
    /// Stack of block scopes, each a set of declared names.
    blocks: Vec<AHashSet<StringId>>,
}

impl FnScope {
    fn declares(&self, name: StringId) -> bool {
        self.blocks.iter().any(|block| block.contains(&name))
    }
}

/// Computes capture information for a whole program.
#[must_use]
pub(crate) fn analyze_closures(program: &Program) -> ClosureInfo {
    let mut walker = Walker {
        info: ClosureInfo::default(),
        scopes: vec![FnScope {
            fn_id: FunctionId::TOP_LEVEL,
            blocks: vec![AHashSet::new()],
        }],
    };
    for stmt in &program.stmts {
        walker.stmt(stmt);
    }
    walker.info
}

struct Walker {
    info: ClosureInfo,
    scopes: Vec<FnScope>,
}

impl Walker {
    fn declare(&mut self, name: StringId) {
        self.scopes
            .last_mut()
            .expect("scope stack never empty")
            .blocks
            .last_mut()
            .expect("block stack never empty")
            .insert(name);
    }

    fn push_block(&mut self) {
        self.scopes
            .last_mut()
            .expect("scope stack never empty")
            .blocks
            .push(AHashSet::new());
    }

    fn pop_block(&mut self) {
        self.scopes
            .last_mut()
            .expect("scope stack never empty")
            .blocks
            .pop();
    }

    /// Resolves a reference: a hit in an enclosing function scope records a
    /// capture against that scope.
    fn reference(&mut self, name: StringId) {
        let current = self.scopes.len() - 1;
        if self.scopes[current].declares(name) {
            return;
        }
        for scope in self.scopes[..current].iter().rev() {
            if scope.declares(name) {
                let owner = scope.fn_id;
                if self.info.captured.insert((owner, name)) {
                    self.info.slots.entry(owner).or_default().push(name);
                }
                return;
            }
        }
        // Unresolved: a builtin, an import, or a runtime error. No capture.
    }

    /// Assignment resolves like a reference; an unbound target implicitly
    /// defines in the current scope.
    fn assign(&mut self, name: StringId) {
        let current = self.scopes.len() - 1;
        if self.scopes[current].declares(name) {
            return;
        }
        for scope in self.scopes[..current].iter().rev() {
            if scope.declares(name) {
                let owner = scope.fn_id;
                if self.info.captured.insert((owner, name)) {
                    self.info.slots.entry(owner).or_default().push(name);
                }
                return;
            }
        }
        self.declare(name);
    }

    fn function(&mut self, def: &FunctionDef) {
        self.scopes.push(FnScope {
            fn_id: def.fn_id,
            blocks: vec![AHashSet::new()],
        });
        for param in &def.params {
            self.declare(param.name);
            if let Some(default) = &param.default {
                self.expr(default);
            }
        }
        if let Some(rest) = &def.rest {
            self.declare(rest.name);
        }
        for stmt in &def.body {
            self.stmt(stmt);
        }
        self.scopes.pop();
    }

    fn body(&mut self, body: &[Stmt]) {
        self.push_block();
        for stmt in body {
            self.stmt(stmt);
        }
        self.pop_block();
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let { name, value, .. } => {
                // Declare first when binding a function literal so the body
                // can reference itself recursively without capturing a
                // different outer binding.
                if let Some(value) = value {
                    if matches!(value.expr, Expr::Function(_)) {
                        self.declare(*name);
                        self.expr(value);
                    } else {
                        self.expr(value);
                        self.declare(*name);
                    }
                } else {
                    self.declare(*name);
                }
            }
            StmtKind::Const { name, value, .. } => {
                self.expr(value);
                self.declare(*name);
            }
            StmtKind::Expr(e) | StmtKind::Throw(e) | StmtKind::Defer(e) => self.expr(e),
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expr(cond);
                self.body(then_block);
                if let Some(else_block) = else_block {
                    self.body(else_block);
                }
            }
            StmtKind::While { cond, body } => {
                self.expr(cond);
                self.body(body);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.push_block();
                if let Some(init) = init {
                    self.stmt(init);
                }
                if let Some(cond) = cond {
                    self.expr(cond);
                }
                if let Some(step) = step {
                    self.expr(step);
                }
                for stmt in body {
                    self.stmt(stmt);
                }
                self.pop_block();
            }
            StmtKind::ForIn {
                key,
                value,
                iterable,
                body,
            } => {
                self.expr(iterable);
                self.push_block();
                if let Some(key) = key {
                    self.declare(*key);
                }
                self.declare(*value);
                for stmt in body {
                    self.stmt(stmt);
                }
                self.pop_block();
            }
            StmtKind::Block(body) => self.body(body),
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Try {
                body,
                catch_param,
                catch_block,
                finally_block,
            } => {
                self.body(body);
                if let Some(catch_block) = catch_block {
                    self.push_block();
                    if let Some(param) = catch_param {
                        self.declare(*param);
                    }
                    for stmt in catch_block {
                        self.stmt(stmt);
                    }
                    self.pop_block();
                }
                if let Some(finally_block) = finally_block {
                    self.body(finally_block);
                }
            }
            StmtKind::Switch { expr, cases } => {
                self.expr(expr);
                for case in cases {
                    if let Some(value) = &case.value {
                        self.expr(value);
                    }
                    self.body(&case.body);
                }
            }
            StmtKind::Import(import) => {
                if let Some(ns) = import.namespace_name {
                    self.declare(ns);
                }
                for name in &import.names {
                    self.declare(name.alias.unwrap_or(name.original));
                }
            }
            StmtKind::Export(crate::ast::ExportStmt::Declaration(decl)) => self.stmt(decl),
            StmtKind::Export(crate::ast::ExportStmt::Names { .. })
            | StmtKind::ImportFfi { .. }
            | StmtKind::DefineObject { .. } => {}
            StmtKind::ExternFn { name, .. } => self.declare(*name),
            StmtKind::EnumDecl { name, variants } => {
                for variant in variants {
                    if let Some(value) = &variant.value {
                        self.expr(value);
                    }
                }
                self.declare(*name);
            }
        }
    }

    fn expr(&mut self, e: &ExprLoc) {
        match &e.expr {
            Expr::Ident(name) => self.reference(*name),
            Expr::Assign { name, value } => {
                self.expr(value);
                self.assign(*name);
            }
            Expr::Function(def) => self.function(def),
            Expr::Binary { left, right, .. } | Expr::NullCoalesce { left, right } => {
                self.expr(left);
                self.expr(right);
            }
            Expr::Unary { operand, .. } | Expr::Await(operand) => self.expr(operand),
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.expr(cond);
                self.expr(then_expr);
                self.expr(else_expr);
            }
            Expr::Call { callee, args } => {
                self.expr(callee);
                for arg in args {
                    self.expr(arg);
                }
            }
            Expr::GetProp { object, .. } | Expr::OptionalChain { object, .. } => self.expr(object),
            Expr::SetProp { object, value, .. } => {
                self.expr(object);
                self.expr(value);
            }
            Expr::Index { object, index } => {
                self.expr(object);
                self.expr(index);
            }
            Expr::IndexAssign {
                object,
                index,
                value,
            } => {
                self.expr(object);
                self.expr(index);
                self.expr(value);
            }
            Expr::ArrayLit(elements) => {
                for element in elements {
                    self.expr(element);
                }
            }
            Expr::ObjectLit { fields } => {
                for (_, value) in fields {
                    self.expr(value);
                }
            }
            Expr::PrefixIncDec { target, .. } | Expr::PostfixIncDec { target, .. } => {
                self.expr(target);
            }
            Expr::Interp { exprs, .. } => {
                for expr in exprs {
                    self.expr(expr);
                }
            }
            Expr::Number { .. } | Expr::Bool(_) | Expr::Str(_) | Expr::Rune(_) | Expr::Null => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn analyzed(source: &str) -> (Program, ClosureInfo) {
        let result = parse(source, "test.hml");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let info = analyze_closures(&result.program);
        (result.program, info)
    }

    fn id(program: &Program, text: &str) -> StringId {
        program.interns.lookup(text).expect("interned")
    }

    #[test]
    fn closure_captures_defining_scope_local() {
        let (program, info) = analyzed(
            "fn make() { let i = 0; return fn() { i = i + 1; return i; }; }",
        );
        let i = id(&program, "i");
        // `make` is function id 1, its local `i` is captured by the inner fn.
        assert!(info.is_captured(FunctionId(1), i));
        assert_eq!(info.slot_of(FunctionId(1), i), Some(0));
        assert!(info.has_env(FunctionId(1)));
    }

    #[test]
    fn sibling_closures_share_one_environment() {
        let (program, info) = analyzed(
            "fn make() { let a = 0; let b = 0; let f = fn() { return a; }; let g = fn() { return a + b; }; return f; }",
        );
        let a = id(&program, "a");
        let b = id(&program, "b");
        assert_eq!(info.env_size(FunctionId(1)), 2);
        assert_eq!(info.slot_of(FunctionId(1), a), Some(0));
        assert_eq!(info.slot_of(FunctionId(1), b), Some(1));
    }

    #[test]
    fn locals_not_captured_get_no_env() {
        let (_, info) = analyzed("fn f() { let x = 1; return x; }");
        assert!(!info.has_env(FunctionId(1)));
    }

    #[test]
    fn capture_through_two_levels_lands_on_owner() {
        let (program, info) = analyzed(
            "fn outer() { let x = 1; return fn() { return fn() { return x; }; }; }",
        );
        let x = id(&program, "x");
        assert!(info.is_captured(FunctionId(1), x));
        // The middle function owns nothing.
        assert!(!info.has_env(FunctionId(2)));
    }

    #[test]
    fn recursive_function_captures_its_own_binding() {
        let (program, info) = analyzed(
            "fn fact(n) { if (n <= 1) { return 1; } return n * fact(n - 1); }",
        );
        let fact = id(&program, "fact");
        assert!(info.is_captured(FunctionId::TOP_LEVEL, fact));
    }

    #[test]
    fn parameters_are_not_free_variables() {
        let (program, info) = analyzed("fn f(n) { return fn(m) { return n + m; }; }");
        let n = id(&program, "n");
        let m = id(&program, "m");
        assert!(info.is_captured(FunctionId(1), n));
        assert!(!info.is_captured(FunctionId(2), m));
        assert!(!info.is_captured(FunctionId(1), m));
    }
}
