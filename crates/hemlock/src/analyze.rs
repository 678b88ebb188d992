//! Type inference, unboxing analysis, and tail-call eligibility.
//!
//! The analyzer never rejects a program: its output is a set of side tables
//! the compiler consults to pick representations. A wrong-looking program
//! simply gets weaker tables and keeps its runtime semantics.

use ahash::{AHashMap, AHashSet};

use crate::{
    ast::{
        BinaryOp, Expr, ExprLoc, FunctionDef, FunctionId, Stmt, StmtKind, TypeExpr, TypeKind,
        UnaryOp,
    },
    intern::StringId,
    parser::Program,
};

/// Maximum fixed-point iterations before inference settles for what it has.
const MAX_PASSES: usize = 10;

/// The inference lattice, least specific first.
///
/// `meet` over two control-flow branches moves toward the most specific
/// common ancestor: two different integer widths meet at `Integer`, an
/// integer and a float meet at `Numeric`, anything else meets at `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferType {
    Unknown,
    Numeric,
    Integer,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Str,
    Rune,
    Null,
    Array,
    Object,
    Function,
    Void,
}

impl InferType {
    /// True for the concrete machine-representable primitives.
    #[must_use]
    pub fn is_concrete_primitive(self) -> bool {
        matches!(
            self,
            Self::I8
                | Self::I16
                | Self::I32
                | Self::I64
                | Self::U8
                | Self::U16
                | Self::U32
                | Self::U64
                | Self::F32
                | Self::F64
                | Self::Bool
        )
    }

    /// True for any integer width or the abstract `Integer`.
    #[must_use]
    pub fn is_integer_family(self) -> bool {
        matches!(
            self,
            Self::Integer
                | Self::I8
                | Self::I16
                | Self::I32
                | Self::I64
                | Self::U8
                | Self::U16
                | Self::U32
                | Self::U64
        )
    }

    /// True for anything in the numeric sub-lattice.
    #[must_use]
    pub fn is_numeric_family(self) -> bool {
        self.is_integer_family() || matches!(self, Self::Numeric | Self::F32 | Self::F64)
    }

    /// Most specific common ancestor of two lattice points.
    #[must_use]
    pub fn meet(self, other: Self) -> Self {
        if self == other {
            return self;
        }
        if self.is_integer_family() && other.is_integer_family() {
            return Self::Integer;
        }
        if self.is_numeric_family() && other.is_numeric_family() {
            return Self::Numeric;
        }
        Self::Unknown
    }

    /// Bit width used to pick the wider operand for integer promotions.
    fn integer_rank(self) -> Option<(u8, bool)> {
        match self {
            Self::I8 => Some((8, true)),
            Self::I16 => Some((16, true)),
            Self::I32 => Some((32, true)),
            Self::I64 => Some((64, true)),
            Self::U8 => Some((8, false)),
            Self::U16 => Some((16, false)),
            Self::U32 => Some((32, false)),
            Self::U64 => Some((64, false)),
            _ => None,
        }
    }
}

/// Native machine types an unboxed local can take in generated C.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
}

impl NativeType {
    #[must_use]
    pub fn from_infer(ty: InferType) -> Option<Self> {
        match ty {
            InferType::I8 => Some(Self::I8),
            InferType::I16 => Some(Self::I16),
            InferType::I32 => Some(Self::I32),
            InferType::I64 => Some(Self::I64),
            InferType::U8 => Some(Self::U8),
            InferType::U16 => Some(Self::U16),
            InferType::U32 => Some(Self::U32),
            InferType::U64 => Some(Self::U64),
            InferType::F32 => Some(Self::F32),
            InferType::F64 => Some(Self::F64),
            InferType::Bool => Some(Self::Bool),
            _ => None,
        }
    }

    /// True for the float widths.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

/// Result tables of one analyzer run.
#[derive(Debug, Default)]
pub struct Analysis {
    var_types: AHashMap<(FunctionId, StringId), InferType>,
    unboxable: AHashMap<FunctionId, AHashMap<StringId, NativeType>>,
    tail_recursive: AHashSet<FunctionId>,
    fn_return_types: AHashMap<StringId, InferType>,
}

impl Analysis {
    /// Inferred type for a local of the given function scope.
    #[must_use]
    pub fn var_type(&self, fn_id: FunctionId, name: StringId) -> InferType {
        self.var_types
            .get(&(fn_id, name))
            .copied()
            .unwrap_or(InferType::Unknown)
    }

    /// Native representation for a local proven unboxable, if any.
    #[must_use]
    pub fn unboxed_local(&self, fn_id: FunctionId, name: StringId) -> Option<NativeType> {
        self.unboxable.get(&fn_id)?.get(&name).copied()
    }

    #[must_use]
    pub fn is_tail_recursive(&self, fn_id: FunctionId) -> bool {
        self.tail_recursive.contains(&fn_id)
    }

    /// Registered return type for a named function.
    #[must_use]
    pub fn return_type(&self, name: StringId) -> InferType {
        self.fn_return_types
            .get(&name)
            .copied()
            .unwrap_or(InferType::Unknown)
    }
}

/// Runs inference to a fixed point, then the unboxing and tail-call passes.
#[must_use]
pub fn analyze_program(program: &Program) -> Analysis {
    let mut analysis = Analysis::default();
    for _ in 0..MAX_PASSES {
        let mut pass = InferPass {
            analysis: &mut analysis,
            scopes: Vec::new(),
            changed: false,
        };
        pass.run(program);
        let changed = pass.changed;
        if !changed {
            break;
        }
    }

    let mut unboxing = UnboxPass {
        analysis: &mut analysis,
    };
    unboxing.run(program);

    let mut tails = TailPass {
        analysis: &mut analysis,
    };
    tails.run(program);

    analysis
}

/// Converts an annotation to a lattice point.
///
/// Nullable primitives degrade to `Unknown`: null may inhabit any boxed
/// slot, so a nullable annotation never narrows to an unboxed width.
fn annotation_type(ty: &TypeExpr) -> InferType {
    if ty.nullable {
        return InferType::Unknown;
    }
    match &ty.kind {
        TypeKind::I8 => InferType::I8,
        TypeKind::I16 => InferType::I16,
        TypeKind::I32 => InferType::I32,
        TypeKind::I64 => InferType::I64,
        TypeKind::U8 => InferType::U8,
        TypeKind::U16 => InferType::U16,
        TypeKind::U32 => InferType::U32,
        TypeKind::U64 => InferType::U64,
        TypeKind::F32 => InferType::F32,
        TypeKind::F64 => InferType::F64,
        TypeKind::Bool => InferType::Bool,
        TypeKind::String => InferType::Str,
        TypeKind::Rune => InferType::Rune,
        TypeKind::Null => InferType::Null,
        TypeKind::Void => InferType::Void,
        TypeKind::Array(_) => InferType::Array,
        TypeKind::CustomObject(_) | TypeKind::GenericObject => InferType::Object,
        TypeKind::Enum(_) => InferType::I32,
        TypeKind::Ptr | TypeKind::Buffer | TypeKind::Infer => InferType::Unknown,
    }
}

/// Integer promotion used by binary operators.
///
/// Same-signedness pairs widen to the wider width. Signed/unsigned mixing
/// widens to the next-larger signed type than the unsigned operand (U8→I16,
/// U16→I32, U32→I64) and never below the signed operand's width; pairs
/// involving U64 compute in I64.
fn promote_integers(left: InferType, right: InferType) -> InferType {
    let (Some((lw, ls)), Some((rw, rs))) = (left.integer_rank(), right.integer_rank()) else {
        return InferType::Integer;
    };
    if ls == rs {
        return if lw >= rw { left } else { right };
    }
    let unsigned_w = if ls { rw } else { lw };
    let signed_w = if ls { lw } else { rw };
    let promoted = match unsigned_w {
        8 => 16,
        16 => 32,
        _ => 64,
    };
    match promoted.max(signed_w) {
        16 => InferType::I16,
        32 => InferType::I32,
        _ => InferType::I64,
    }
}

/// Result type of a binary operation over inferred operand types.
fn binary_result(op: BinaryOp, left: InferType, right: InferType) -> InferType {
    match op {
        BinaryOp::Div => InferType::F64,
        BinaryOp::Add if left == InferType::Str || right == InferType::Str => InferType::Str,
        op if op.is_comparison() => InferType::Bool,
        BinaryOp::And | BinaryOp::Or => left.meet(right),
        op if op.is_bitwise() => {
            if left.is_integer_family() && right.is_integer_family() {
                promote_integers(left, right)
            } else {
                InferType::Integer
            }
        }
        // +, -, *, %
        _ => {
            if left == InferType::F64 || right == InferType::F64 {
                InferType::F64
            } else if left == InferType::F32 && right == InferType::F32 {
                InferType::F32
            } else if left == InferType::F32 || right == InferType::F32 {
                InferType::F64
            } else if left.is_integer_family() && right.is_integer_family() {
                promote_integers(left, right)
            } else if left.is_numeric_family() && right.is_numeric_family() {
                InferType::Numeric
            } else {
                InferType::Unknown
            }
        }
    }
}

struct Scope {
    names: AHashMap<StringId, InferType>,
    /// Function scope that owns this lexical scope's locals.
    fn_id: FunctionId,
}

struct InferPass<'a> {
    analysis: &'a mut Analysis,
    scopes: Vec<Scope>,
    changed: bool,
}

impl InferPass<'_> {
    fn run(&mut self, program: &Program) {
        self.scopes.push(Scope {
            names: AHashMap::new(),
            fn_id: FunctionId::TOP_LEVEL,
        });
        for stmt in &program.stmts {
            self.infer_stmt(stmt);
        }
        self.scopes.pop();
    }

    fn current_fn(&self) -> FunctionId {
        self.scopes.last().map_or(FunctionId::TOP_LEVEL, |s| s.fn_id)
    }

    fn record(&mut self, fn_id: FunctionId, name: StringId, ty: InferType) {
        let entry = self
            .analysis
            .var_types
            .entry((fn_id, name))
            .or_insert(ty);
        if *entry != ty {
            *entry = ty;
            self.changed = true;
        }
    }

    /// Declares a name in the current scope.
    fn declare(&mut self, name: StringId, ty: InferType) {
        let fn_id = self.current_fn();
        self.scopes
            .last_mut()
            .expect("scope stack never empty")
            .names
            .insert(name, ty);
        self.record(fn_id, name, ty);
    }

    /// Assigns to a name: refines the owning binding with `meet`, or
    /// implicitly defines in the current scope.
    fn assign(&mut self, name: StringId, ty: InferType) {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(existing) = scope.names.get_mut(&name) {
                let merged = existing.meet(ty);
                let fn_id = scope.fn_id;
                *existing = merged;
                self.record(fn_id, name, merged);
                return;
            }
        }
        self.declare(name, ty);
    }

    fn lookup(&self, name: StringId) -> InferType {
        for scope in self.scopes.iter().rev() {
            if let Some(ty) = scope.names.get(&name) {
                return *ty;
            }
        }
        InferType::Unknown
    }

    fn push_scope(&mut self, fn_id: FunctionId) {
        self.scopes.push(Scope {
            names: AHashMap::new(),
            fn_id,
        });
    }

    fn push_block(&mut self) {
        let fn_id = self.current_fn();
        self.push_scope(fn_id);
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn infer_block(&mut self, body: &[Stmt]) {
        self.push_block();
        for stmt in body {
            self.infer_stmt(stmt);
        }
        self.pop_scope();
    }

    fn infer_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let { name, ty, value } => {
                let inferred = match (ty, value) {
                    (Some(ann), Some(v)) => {
                        self.infer_expr(v);
                        annotation_type(ann)
                    }
                    (Some(ann), None) => annotation_type(ann),
                    (None, Some(v)) => {
                        // Function declarations feed the return-type registry.
                        if let Expr::Function(def) = &v.expr {
                            self.register_function(*name, def);
                            InferType::Function
                        } else {
                            self.infer_expr(v)
                        }
                    }
                    (None, None) => InferType::Null,
                };
                self.declare(*name, inferred);
            }
            StmtKind::Const { name, ty, value } => {
                let inferred = match ty {
                    Some(ann) => {
                        self.infer_expr(value);
                        annotation_type(ann)
                    }
                    None => self.infer_expr(value),
                };
                self.declare(*name, inferred);
            }
            StmtKind::Expr(e) | StmtKind::Throw(e) | StmtKind::Defer(e) => {
                self.infer_expr(e);
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.infer_expr(cond);
                self.infer_block(then_block);
                if let Some(else_block) = else_block {
                    self.infer_block(else_block);
                }
            }
            StmtKind::While { cond, body } => {
                self.infer_expr(cond);
                self.infer_block(body);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.push_block();
                if let Some(init) = init {
                    self.infer_stmt(init);
                }
                if let Some(cond) = cond {
                    self.infer_expr(cond);
                }
                if let Some(step) = step {
                    self.infer_expr(step);
                }
                for stmt in body {
                    self.infer_stmt(stmt);
                }
                self.pop_scope();
            }
            StmtKind::ForIn {
                key,
                value,
                iterable,
                body,
            } => {
                let iter_ty = self.infer_expr(iterable);
                self.push_block();
                if let Some(key) = key {
                    let key_ty = if iter_ty == InferType::Array {
                        InferType::I64
                    } else {
                        InferType::Unknown
                    };
                    self.declare(*key, key_ty);
                }
                self.declare(*value, InferType::Unknown);
                for stmt in body {
                    self.infer_stmt(stmt);
                }
                self.pop_scope();
            }
            StmtKind::Block(body) => self.infer_block(body),
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.infer_expr(value);
                }
            }
            StmtKind::Try {
                body,
                catch_param,
                catch_block,
                finally_block,
            } => {
                self.infer_block(body);
                if let Some(catch_block) = catch_block {
                    self.push_block();
                    if let Some(param) = catch_param {
                        self.declare(*param, InferType::Unknown);
                    }
                    for stmt in catch_block {
                        self.infer_stmt(stmt);
                    }
                    self.pop_scope();
                }
                if let Some(finally_block) = finally_block {
                    self.infer_block(finally_block);
                }
            }
            StmtKind::Switch { expr, cases } => {
                self.infer_expr(expr);
                for case in cases {
                    if let Some(value) = &case.value {
                        self.infer_expr(value);
                    }
                    self.infer_block(&case.body);
                }
            }
            StmtKind::Export(crate::ast::ExportStmt::Declaration(decl)) => self.infer_stmt(decl),
            StmtKind::EnumDecl { name, variants } => {
                self.declare(*name, InferType::Object);
                for variant in variants {
                    if let Some(value) = &variant.value {
                        self.infer_expr(value);
                    }
                }
            }
            StmtKind::ExternFn { name, return_type, .. } => {
                let ret = annotation_type(return_type);
                self.analysis.fn_return_types.insert(*name, ret);
                self.declare(*name, InferType::Function);
            }
            StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Import(_)
            | StmtKind::Export(_)
            | StmtKind::ImportFfi { .. }
            | StmtKind::DefineObject { .. } => {}
        }
    }

    /// Records a named function's return type from its annotation or the
    /// meet over its return expressions (refined across passes).
    fn register_function(&mut self, name: StringId, def: &FunctionDef) {
        self.declare(name, InferType::Function);
        let inferred_ret = self.infer_function_body(def);
        let ret = if let Some(ann) = &def.return_type {
            annotation_type(ann)
        } else {
            inferred_ret.unwrap_or(InferType::Void)
        };
        let entry = self
            .analysis
            .fn_return_types
            .entry(name)
            .or_insert(InferType::Unknown);
        if *entry != ret {
            *entry = ret;
            self.changed = true;
        }
    }

    /// Infers a function body and returns the meet over its return types.
    fn infer_function_body(&mut self, def: &FunctionDef) -> Option<InferType> {
        self.push_scope(def.fn_id);
        for param in &def.params {
            let ty = param.ty.as_ref().map_or(InferType::Unknown, annotation_type);
            self.declare(param.name, ty);
        }
        if let Some(rest) = &def.rest {
            self.declare(rest.name, InferType::Array);
        }
        for stmt in &def.body {
            self.infer_stmt(stmt);
        }
        // Collect return types while the body's scopes are still live.
        let mut collector = ReturnCollector {
            pass: self,
            ty: None,
        };
        let body: &[Stmt] = &def.body;
        collector.walk_body(body);
        let ty = collector.ty;
        self.pop_scope();
        ty
    }

    fn infer_expr(&mut self, e: &ExprLoc) -> InferType {
        match &e.expr {
            Expr::Number {
                int_value,
                is_float,
                ..
            } => {
                if *is_float {
                    InferType::F64
                } else if i32::try_from(*int_value).is_ok() {
                    InferType::I32
                } else {
                    InferType::I64
                }
            }
            Expr::Bool(_) => InferType::Bool,
            Expr::Str(_) => InferType::Str,
            Expr::Rune(_) => InferType::Rune,
            Expr::Null => InferType::Null,
            Expr::Ident(name) => self.lookup(*name),
            Expr::Binary { op, left, right } => {
                let lt = self.infer_expr(left);
                let rt = self.infer_expr(right);
                binary_result(*op, lt, rt)
            }
            Expr::Unary { op, operand } => {
                let ty = self.infer_expr(operand);
                match op {
                    UnaryOp::Not => InferType::Bool,
                    UnaryOp::Neg => {
                        if ty.is_numeric_family() {
                            ty
                        } else {
                            InferType::Numeric
                        }
                    }
                    UnaryOp::BitNot => {
                        if ty.is_integer_family() {
                            ty
                        } else {
                            InferType::Integer
                        }
                    }
                }
            }
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.infer_expr(cond);
                let t = self.infer_expr(then_expr);
                let e = self.infer_expr(else_expr);
                t.meet(e)
            }
            Expr::Call { callee, args } => {
                for arg in args {
                    self.infer_expr(arg);
                }
                if let Expr::Ident(name) = &callee.expr {
                    self.analysis
                        .fn_return_types
                        .get(name)
                        .copied()
                        .unwrap_or(InferType::Unknown)
                } else {
                    self.infer_expr(callee);
                    InferType::Unknown
                }
            }
            Expr::Assign { name, value } => {
                let ty = self.infer_expr(value);
                self.assign(*name, ty);
                ty
            }
            Expr::GetProp { .. } | Expr::OptionalChain { .. } | Expr::Index { .. } => {
                self.infer_children(e);
                InferType::Unknown
            }
            Expr::SetProp { object, value, .. } => {
                self.infer_expr(object);
                self.infer_expr(value)
            }
            Expr::IndexAssign {
                object,
                index,
                value,
            } => {
                self.infer_expr(object);
                self.infer_expr(index);
                self.infer_expr(value)
            }
            Expr::Function(def) => {
                if let Some(name) = def.name {
                    self.register_function(name, def);
                } else {
                    self.infer_function_body(def);
                }
                InferType::Function
            }
            Expr::ArrayLit(elements) => {
                for element in elements {
                    self.infer_expr(element);
                }
                InferType::Array
            }
            Expr::ObjectLit { fields } => {
                for (_, value) in fields {
                    self.infer_expr(value);
                }
                InferType::Object
            }
            Expr::PrefixIncDec { target, .. } | Expr::PostfixIncDec { target, .. } => {
                let ty = self.infer_expr(target);
                if ty.is_numeric_family() {
                    ty
                } else {
                    InferType::Numeric
                }
            }
            Expr::Await(operand) => self.infer_expr(operand),
            Expr::Interp { exprs, .. } => {
                for expr in exprs {
                    self.infer_expr(expr);
                }
                InferType::Str
            }
            Expr::NullCoalesce { left, right } => {
                let lt = self.infer_expr(left);
                let rt = self.infer_expr(right);
                if lt == InferType::Null { rt } else { lt.meet(rt) }
            }
        }
    }

    fn infer_children(&mut self, e: &ExprLoc) {
        match &e.expr {
            Expr::GetProp { object, .. } | Expr::OptionalChain { object, .. } => {
                self.infer_expr(object);
            }
            Expr::Index { object, index } => {
                self.infer_expr(object);
                self.infer_expr(index);
            }
            _ => {}
        }
    }
}

/// Collects the meet of all `return` expression types in a function body
/// (nested functions excluded).
struct ReturnCollector<'a, 'b> {
    pass: &'a mut InferPass<'b>,
    ty: Option<InferType>,
}

impl ReturnCollector<'_, '_> {
    fn walk_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Return(Some(value)) => {
                let ty = self.pass.infer_expr(value);
                self.ty = Some(match self.ty {
                    Some(existing) => existing.meet(ty),
                    None => ty,
                });
            }
            StmtKind::Return(None) => {
                self.ty = Some(match self.ty {
                    Some(existing) => existing.meet(InferType::Void),
                    None => InferType::Void,
                });
            }
            StmtKind::If {
                then_block,
                else_block,
                ..
            } => {
                self.walk_body(then_block);
                if let Some(else_block) = else_block {
                    self.walk_body(else_block);
                }
            }
            StmtKind::While { body, .. }
            | StmtKind::For { body, .. }
            | StmtKind::ForIn { body, .. }
            | StmtKind::Block(body) => self.walk_body(body),
            StmtKind::Try {
                body,
                catch_block,
                finally_block,
                ..
            } => {
                self.walk_body(body);
                if let Some(catch_block) = catch_block {
                    self.walk_body(catch_block);
                }
                if let Some(finally_block) = finally_block {
                    self.walk_body(finally_block);
                }
            }
            StmtKind::Switch { cases, .. } => {
                for case in cases {
                    self.walk_body(&case.body);
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Unboxing
// ---------------------------------------------------------------------------

struct UnboxPass<'a> {
    analysis: &'a mut Analysis,
}

impl UnboxPass<'_> {
    fn run(&mut self, program: &Program) {
        // Nested function scopes are discovered during the scan itself.
        self.scan_scope(FunctionId::TOP_LEVEL, &program.stmts);
    }

    /// Scans one function scope: collects candidates, disqualifies escapes,
    /// and records survivors. Recurses into nested function scopes.
    fn scan_scope(&mut self, fn_id: FunctionId, body: &[Stmt]) {
        let mut scan = EscapeScan {
            analysis: self.analysis,
            fn_id,
            candidates: AHashMap::new(),
            nested: Vec::new(),
        };
        scan.collect_candidates(body);
        scan.walk_body(body);
        let EscapeScan {
            candidates, nested, ..
        } = scan;

        let survivors: AHashMap<StringId, NativeType> = candidates
            .into_iter()
            .filter_map(|(name, state)| {
                if state.disqualified {
                    None
                } else {
                    Some((name, state.native))
                }
            })
            .collect();
        if !survivors.is_empty() {
            self.analysis.unboxable.insert(fn_id, survivors);
        }

        for def in nested {
            self.scan_scope(def.fn_id, &def.body);
        }
    }
}

struct CandidateState {
    native: NativeType,
    disqualified: bool,
}

struct EscapeScan<'a> {
    analysis: &'a Analysis,
    fn_id: FunctionId,
    candidates: AHashMap<StringId, CandidateState>,
    nested: Vec<std::rc::Rc<FunctionDef>>,
}

impl EscapeScan<'_> {
    /// A candidate is a `let` local whose declared or inferred initializer
    /// type is a concrete primitive. The final inferred type must also still
    /// be primitive: a later assignment of a string or object widens the
    /// variable and removes it from consideration.
    fn collect_candidates(&mut self, body: &[Stmt]) {
        for stmt in body {
            match &stmt.kind {
                StmtKind::Let { name, ty, value } => {
                    self.consider(*name, ty.as_ref(), value.as_ref());
                }
                StmtKind::For { init, body, .. } => {
                    if let Some(init) = init
                        && let StmtKind::Let { name, ty, value } = &init.kind
                    {
                        self.consider(*name, ty.as_ref(), value.as_ref());
                    }
                    self.collect_candidates(body);
                }
                StmtKind::If {
                    then_block,
                    else_block,
                    ..
                } => {
                    self.collect_candidates(then_block);
                    if let Some(else_block) = else_block {
                        self.collect_candidates(else_block);
                    }
                }
                StmtKind::While { body, .. }
                | StmtKind::ForIn { body, .. }
                | StmtKind::Block(body) => self.collect_candidates(body),
                StmtKind::Try {
                    body,
                    catch_block,
                    finally_block,
                    ..
                } => {
                    self.collect_candidates(body);
                    if let Some(catch_block) = catch_block {
                        self.collect_candidates(catch_block);
                    }
                    if let Some(finally_block) = finally_block {
                        self.collect_candidates(finally_block);
                    }
                }
                StmtKind::Switch { cases, .. } => {
                    for case in cases {
                        self.collect_candidates(&case.body);
                    }
                }
                _ => {}
            }
        }
    }

    fn consider(&mut self, name: StringId, ty: Option<&TypeExpr>, value: Option<&ExprLoc>) {
        if value.is_none() {
            return; // uninitialized locals start as null
        }
        let declared = ty.map(annotation_type);
        if let Some(declared) = declared
            && !declared.is_concrete_primitive()
        {
            return;
        }
        let final_ty = self.analysis.var_type(self.fn_id, name);
        let Some(native) = NativeType::from_infer(declared.unwrap_or(final_ty)) else {
            return;
        };
        // The meet over every assignment must itself still be primitive.
        if !final_ty.is_concrete_primitive() {
            return;
        }
        self.candidates.insert(
            name,
            CandidateState {
                native,
                disqualified: false,
            },
        );
    }

    fn disqualify(&mut self, name: StringId) {
        if let Some(state) = self.candidates.get_mut(&name) {
            state.disqualified = true;
        }
    }

    fn walk_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let { value, .. } => {
                if let Some(value) = value {
                    self.walk_expr(value);
                }
            }
            StmtKind::Const { value, .. } => self.walk_expr(value),
            StmtKind::Expr(e) | StmtKind::Defer(e) => self.walk_expr(e),
            StmtKind::Throw(e) => {
                // A thrown local escapes.
                if let Expr::Ident(name) = &e.expr {
                    self.disqualify(*name);
                }
                self.walk_expr(e);
            }
            StmtKind::Return(Some(e)) => {
                if let Expr::Ident(name) = &e.expr {
                    self.disqualify(*name);
                }
                self.walk_expr(e);
            }
            StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => {}
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.walk_expr(cond);
                self.walk_body(then_block);
                if let Some(else_block) = else_block {
                    self.walk_body(else_block);
                }
            }
            StmtKind::While { cond, body } => {
                self.walk_expr(cond);
                self.walk_body(body);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.walk_stmt(init);
                }
                if let Some(cond) = cond {
                    self.walk_expr(cond);
                }
                if let Some(step) = step {
                    self.walk_expr(step);
                }
                self.walk_body(body);
            }
            StmtKind::ForIn {
                iterable, body, ..
            } => {
                self.walk_expr(iterable);
                self.walk_body(body);
            }
            StmtKind::Block(body) => self.walk_body(body),
            StmtKind::Try {
                body,
                catch_block,
                finally_block,
                ..
            } => {
                self.walk_body(body);
                if let Some(catch_block) = catch_block {
                    self.walk_body(catch_block);
                }
                if let Some(finally_block) = finally_block {
                    self.walk_body(finally_block);
                }
            }
            StmtKind::Switch { expr, cases } => {
                self.walk_expr(expr);
                for case in cases {
                    if let Some(value) = &case.value {
                        self.walk_expr(value);
                    }
                    self.walk_body(&case.body);
                }
            }
            StmtKind::Export(crate::ast::ExportStmt::Declaration(decl)) => self.walk_stmt(decl),
            StmtKind::EnumDecl { variants, .. } => {
                for variant in variants {
                    if let Some(value) = &variant.value {
                        self.walk_expr(value);
                    }
                }
            }
            StmtKind::Import(_)
            | StmtKind::Export(_)
            | StmtKind::ImportFfi { .. }
            | StmtKind::ExternFn { .. }
            | StmtKind::DefineObject { .. } => {}
        }
    }

    fn walk_expr(&mut self, e: &ExprLoc) {
        match &e.expr {
            Expr::Function(def) => {
                // Everything a nested function references is captured.
                let mut captured = AHashSet::new();
                collect_idents(&def.body, &mut captured);
                for name in &captured {
                    self.disqualify(*name);
                }
                self.nested.push(def.clone());
            }
            Expr::ArrayLit(elements) => {
                for element in elements {
                    if let Expr::Ident(name) = &element.expr {
                        self.disqualify(*name);
                    }
                    self.walk_expr(element);
                }
            }
            Expr::ObjectLit { fields } => {
                for (_, value) in fields {
                    if let Expr::Ident(name) = &value.expr {
                        self.disqualify(*name);
                    }
                    self.walk_expr(value);
                }
            }
            Expr::Call { callee, args } => {
                self.walk_expr(callee);
                for arg in args {
                    if let Expr::Ident(name) = &arg.expr {
                        self.disqualify(*name);
                    }
                    self.walk_expr(arg);
                }
            }
            Expr::Assign { name, value } => {
                self.walk_expr(value);
                if self.candidates.contains_key(name) && !self.update_allowed(name, value) {
                    self.disqualify(*name);
                }
            }
            Expr::SetProp { object, value, .. } => {
                if let Expr::Ident(name) = &object.expr {
                    self.disqualify(*name);
                }
                self.walk_expr(object);
                self.walk_expr(value);
            }
            Expr::IndexAssign {
                object,
                index,
                value,
            } => {
                if let Expr::Ident(name) = &object.expr {
                    self.disqualify(*name);
                }
                self.walk_expr(object);
                self.walk_expr(index);
                self.walk_expr(value);
            }
            Expr::GetProp { object, .. } | Expr::OptionalChain { object, .. } => {
                // Member access on a primitive cannot be represented natively.
                if let Expr::Ident(name) = &object.expr {
                    self.disqualify(*name);
                }
                self.walk_expr(object);
            }
            Expr::Index { object, index } => {
                if let Expr::Ident(name) = &object.expr {
                    self.disqualify(*name);
                }
                self.walk_expr(object);
                self.walk_expr(index);
            }
            Expr::Binary { left, right, .. } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            Expr::Unary { operand, .. } | Expr::Await(operand) => self.walk_expr(operand),
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.walk_expr(cond);
                self.walk_expr(then_expr);
                self.walk_expr(else_expr);
            }
            Expr::PrefixIncDec { target, .. } | Expr::PostfixIncDec { target, .. } => {
                self.walk_expr(target);
            }
            Expr::Interp { exprs, .. } => {
                for expr in exprs {
                    self.walk_expr(expr);
                }
            }
            Expr::NullCoalesce { left, right } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            Expr::Number { .. }
            | Expr::Bool(_)
            | Expr::Str(_)
            | Expr::Rune(_)
            | Expr::Null
            | Expr::Ident(_) => {}
        }
    }

    /// An update keeps a candidate unboxable when it is arithmetic/bitwise
    /// over primitive operands. The accumulator shape `x = x ⊕ e` is also
    /// accepted with an integer-or-unknown `e`, matching the loop-accumulator
    /// pattern.
    fn update_allowed(&self, name: &StringId, value: &ExprLoc) -> bool {
        if let Expr::Binary { op, left, right } = &value.expr
            && matches!(
                op,
                BinaryOp::Add
                    | BinaryOp::Sub
                    | BinaryOp::BitOr
                    | BinaryOp::BitXor
                    | BinaryOp::BitAnd
            )
        {
            let (this, other) = if matches!(&left.expr, Expr::Ident(n) if n == name) {
                (true, right)
            } else if matches!(&right.expr, Expr::Ident(n) if n == name) {
                (true, left)
            } else {
                (false, right)
            };
            if this {
                let other_ty = self.expr_type(other);
                if other_ty.is_integer_family() || other_ty == InferType::Unknown {
                    return true;
                }
            }
        }
        self.is_primitive_arith(value)
    }

    fn is_primitive_arith(&self, e: &ExprLoc) -> bool {
        match &e.expr {
            Expr::Number { .. } | Expr::Bool(_) | Expr::Rune(_) => true,
            Expr::Ident(name) => self
                .analysis
                .var_type(self.fn_id, *name)
                .is_concrete_primitive(),
            Expr::Unary {
                op: UnaryOp::Neg | UnaryOp::BitNot,
                operand,
            } => self.is_primitive_arith(operand),
            Expr::Binary { op, left, right } => {
                !matches!(op, BinaryOp::And | BinaryOp::Or)
                    && self.is_primitive_arith(left)
                    && self.is_primitive_arith(right)
            }
            _ => false,
        }
    }

    fn expr_type(&self, e: &ExprLoc) -> InferType {
        match &e.expr {
            Expr::Number { int_value, is_float, .. } => {
                if *is_float {
                    InferType::F64
                } else if i32::try_from(*int_value).is_ok() {
                    InferType::I32
                } else {
                    InferType::I64
                }
            }
            Expr::Ident(name) => self.analysis.var_type(self.fn_id, *name),
            Expr::Bool(_) => InferType::Bool,
            _ => InferType::Unknown,
        }
    }
}

/// Collects every identifier referenced anywhere in a body, nested
/// functions included. Deliberately over-approximate: shadowed names count,
/// which only makes capture analysis more conservative.
fn collect_idents(body: &[Stmt], out: &mut AHashSet<StringId>) {
    struct V<'a> {
        out: &'a mut AHashSet<StringId>,
    }
    impl V<'_> {
        fn body(&mut self, body: &[Stmt]) {
            for stmt in body {
                self.stmt(stmt);
            }
        }
        fn stmt(&mut self, stmt: &Stmt) {
            match &stmt.kind {
                StmtKind::Let { value, .. } => {
                    if let Some(value) = value {
                        self.expr(value);
                    }
                }
                StmtKind::Const { value, .. } => self.expr(value),
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
                    if let Some(init) = init {
                        self.stmt(init);
                    }
                    if let Some(cond) = cond {
                        self.expr(cond);
                    }
                    if let Some(step) = step {
                        self.expr(step);
                    }
                    self.body(body);
                }
                StmtKind::ForIn {
                    iterable, body, ..
                } => {
                    self.expr(iterable);
                    self.body(body);
                }
                StmtKind::Block(body) => self.body(body),
                StmtKind::Try {
                    body,
                    catch_block,
                    finally_block,
                    ..
                } => {
                    self.body(body);
                    if let Some(catch_block) = catch_block {
                        self.body(catch_block);
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
                StmtKind::Export(crate::ast::ExportStmt::Declaration(decl)) => self.stmt(decl),
                _ => {}
            }
        }
        fn expr(&mut self, e: &ExprLoc) {
            match &e.expr {
                Expr::Ident(name) => {
                    self.out.insert(*name);
                }
                Expr::Binary { left, right, .. } => {
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
                Expr::Assign { name, value } => {
                    self.out.insert(*name);
                    self.expr(value);
                }
                Expr::GetProp { object, .. } | Expr::OptionalChain { object, .. } => {
                    self.expr(object);
                }
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
                Expr::Function(def) => {
                    // Deeper nesting still captures from this scope.
                    let mut v = V { out: self.out };
                    v.body(&def.body);
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
                Expr::NullCoalesce { left, right } => {
                    self.expr(left);
                    self.expr(right);
                }
                Expr::Number { .. }
                | Expr::Bool(_)
                | Expr::Str(_)
                | Expr::Rune(_)
                | Expr::Null => {}
            }
        }
    }
    let mut v = V { out };
    v.body(body);
}

// ---------------------------------------------------------------------------
// Tail calls
// ---------------------------------------------------------------------------

struct TailPass<'a> {
    analysis: &'a mut Analysis,
}

impl TailPass<'_> {
    fn run(&mut self, program: &Program) {
        self.walk_body(&program.stmts);
    }

    fn walk_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let { value: Some(v), .. } | StmtKind::Const { value: v, .. } => {
                self.walk_expr(v);
            }
            StmtKind::Expr(e) | StmtKind::Throw(e) | StmtKind::Defer(e) => self.walk_expr(e),
            StmtKind::Return(Some(e)) => self.walk_expr(e),
            StmtKind::If {
                then_block,
                else_block,
                ..
            } => {
                self.walk_body(then_block);
                if let Some(else_block) = else_block {
                    self.walk_body(else_block);
                }
            }
            StmtKind::While { body, .. }
            | StmtKind::For { body, .. }
            | StmtKind::ForIn { body, .. }
            | StmtKind::Block(body) => self.walk_body(body),
            StmtKind::Try {
                body,
                catch_block,
                finally_block,
                ..
            } => {
                self.walk_body(body);
                if let Some(b) = catch_block {
                    self.walk_body(b);
                }
                if let Some(b) = finally_block {
                    self.walk_body(b);
                }
            }
            StmtKind::Switch { cases, .. } => {
                for case in cases {
                    self.walk_body(&case.body);
                }
            }
            StmtKind::Export(crate::ast::ExportStmt::Declaration(decl)) => self.walk_stmt(decl),
            _ => {}
        }
    }

    fn walk_expr(&mut self, e: &ExprLoc) {
        match &e.expr {
            Expr::Function(def) => {
                if let Some(name) = def.name
                    && function_is_tail_recursive(def, name)
                {
                    self.analysis.tail_recursive.insert(def.fn_id);
                }
                self.walk_body(&def.body);
            }
            Expr::Binary { left, right, .. } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            Expr::Unary { operand, .. } | Expr::Await(operand) => self.walk_expr(operand),
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.walk_expr(cond);
                self.walk_expr(then_expr);
                self.walk_expr(else_expr);
            }
            Expr::Call { callee, args } => {
                self.walk_expr(callee);
                for arg in args {
                    self.walk_expr(arg);
                }
            }
            Expr::Assign { value, .. } => self.walk_expr(value),
            Expr::GetProp { object, .. } | Expr::OptionalChain { object, .. } => {
                self.walk_expr(object);
            }
            Expr::SetProp { object, value, .. } => {
                self.walk_expr(object);
                self.walk_expr(value);
            }
            Expr::Index { object, index } => {
                self.walk_expr(object);
                self.walk_expr(index);
            }
            Expr::IndexAssign {
                object,
                index,
                value,
            } => {
                self.walk_expr(object);
                self.walk_expr(index);
                self.walk_expr(value);
            }
            Expr::ArrayLit(elements) => {
                for element in elements {
                    self.walk_expr(element);
                }
            }
            Expr::ObjectLit { fields } => {
                for (_, value) in fields {
                    self.walk_expr(value);
                }
            }
            Expr::PrefixIncDec { target, .. } | Expr::PostfixIncDec { target, .. } => {
                self.walk_expr(target);
            }
            Expr::Interp { exprs, .. } => {
                for expr in exprs {
                    self.walk_expr(expr);
                }
            }
            Expr::NullCoalesce { left, right } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            _ => {}
        }
    }
}

/// Syntactic tail-recursion check for one named function.
///
/// Every return must either contain no recursive call, or be a direct
/// `f(args)` call whose arguments contain no recursive call. Loops, `try`,
/// and `defer` anywhere in the body disqualify the function, and at least
/// one genuine tail call must exist for the marking to be useful.
#[must_use]
pub fn function_is_tail_recursive(def: &FunctionDef, name: StringId) -> bool {
    let mut check = TailCheck {
        name,
        ok: true,
        has_tail_call: false,
    };
    check.body(&def.body);
    check.ok && check.has_tail_call
}

struct TailCheck {
    name: StringId,
    ok: bool,
    has_tail_call: bool,
}

impl TailCheck {
    fn body(&mut self, body: &[Stmt]) {
        for stmt in body {
            if !self.ok {
                return;
            }
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::While { .. } | StmtKind::For { .. } | StmtKind::ForIn { .. } => {
                self.ok = false;
            }
            StmtKind::Try { .. } | StmtKind::Defer(_) => {
                self.ok = false;
            }
            StmtKind::Return(Some(value)) => {
                if let Expr::Call { callee, args } = &value.expr
                    && matches!(&callee.expr, Expr::Ident(n) if *n == self.name)
                {
                    // Direct tail call; arguments must not recurse.
                    if args.iter().any(|a| self.contains_recursion(a)) {
                        self.ok = false;
                    } else {
                        self.has_tail_call = true;
                    }
                } else if self.contains_recursion(value) {
                    self.ok = false;
                }
            }
            StmtKind::Return(None) => {}
            StmtKind::If {
                then_block,
                else_block,
                ..
            } => {
                self.body(then_block);
                if let Some(else_block) = else_block {
                    self.body(else_block);
                }
            }
            StmtKind::Block(body) => self.body(body),
            StmtKind::Switch { cases, .. } => {
                for case in cases {
                    self.body(&case.body);
                }
            }
            // Recursion in statement position keeps its own frame and does
            // not affect return-shape eligibility.
            StmtKind::Expr(_) | StmtKind::Throw(_) => {}
            _ => {}
        }
    }

    fn contains_recursion(&self, e: &ExprLoc) -> bool {
        let mut found = false;
        let mut names = AHashSet::new();
        collect_calls(e, &mut names);
        if names.contains(&self.name) {
            found = true;
        }
        found
    }
}

/// Collects the callee names of every direct call in an expression tree.
fn collect_calls(e: &ExprLoc, out: &mut AHashSet<StringId>) {
    match &e.expr {
        Expr::Call { callee, args } => {
            if let Expr::Ident(name) = &callee.expr {
                out.insert(*name);
            } else {
                collect_calls(callee, out);
            }
            for arg in args {
                collect_calls(arg, out);
            }
        }
        Expr::Binary { left, right, .. } | Expr::NullCoalesce { left, right } => {
            collect_calls(left, out);
            collect_calls(right, out);
        }
        Expr::Unary { operand, .. } | Expr::Await(operand) => collect_calls(operand, out),
        Expr::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            collect_calls(cond, out);
            collect_calls(then_expr, out);
            collect_calls(else_expr, out);
        }
        Expr::Assign { value, .. } => collect_calls(value, out),
        Expr::GetProp { object, .. } | Expr::OptionalChain { object, .. } => {
            collect_calls(object, out);
        }
        Expr::SetProp { object, value, .. } => {
            collect_calls(object, out);
            collect_calls(value, out);
        }
        Expr::Index { object, index } => {
            collect_calls(object, out);
            collect_calls(index, out);
        }
        Expr::IndexAssign {
            object,
            index,
            value,
        } => {
            collect_calls(object, out);
            collect_calls(index, out);
            collect_calls(value, out);
        }
        Expr::ArrayLit(elements) => {
            for element in elements {
                collect_calls(element, out);
            }
        }
        Expr::ObjectLit { fields } => {
            for (_, value) in fields {
                collect_calls(value, out);
            }
        }
        Expr::PrefixIncDec { target, .. } | Expr::PostfixIncDec { target, .. } => {
            collect_calls(target, out);
        }
        Expr::Interp { exprs, .. } => {
            for expr in exprs {
                collect_calls(expr, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn analyzed(source: &str) -> (Program, Analysis) {
        let result = parse(source, "test.hml");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let analysis = analyze_program(&result.program);
        (result.program, analysis)
    }

    fn name_id(program: &Program, text: &str) -> StringId {
        program
            .interns
            .lookup(text)
            .unwrap_or_else(|| panic!("name {text} not interned"))
    }

    #[test]
    fn meet_narrows_to_common_ancestor() {
        assert_eq!(InferType::I32.meet(InferType::I32), InferType::I32);
        assert_eq!(InferType::I32.meet(InferType::I64), InferType::Integer);
        assert_eq!(InferType::I32.meet(InferType::F64), InferType::Numeric);
        assert_eq!(InferType::I32.meet(InferType::Str), InferType::Unknown);
        assert_eq!(InferType::U8.meet(InferType::U16), InferType::Integer);
    }

    #[test]
    fn literal_widths() {
        let (program, analysis) = analyzed("let a = 1; let b = 5000000000; let c = 1.5;");
        let a = name_id(&program, "a");
        let b = name_id(&program, "b");
        let c = name_id(&program, "c");
        assert_eq!(analysis.var_type(FunctionId::TOP_LEVEL, a), InferType::I32);
        assert_eq!(analysis.var_type(FunctionId::TOP_LEVEL, b), InferType::I64);
        assert_eq!(analysis.var_type(FunctionId::TOP_LEVEL, c), InferType::F64);
    }

    #[test]
    fn division_yields_f64_and_comparison_bool() {
        let (program, analysis) = analyzed("let a = 6 / 2; let b = 1 < 2;");
        let a = name_id(&program, "a");
        let b = name_id(&program, "b");
        assert_eq!(analysis.var_type(FunctionId::TOP_LEVEL, a), InferType::F64);
        assert_eq!(analysis.var_type(FunctionId::TOP_LEVEL, b), InferType::Bool);
    }

    #[test]
    fn annotation_wins_over_literal() {
        let (program, analysis) = analyzed("let a: u16 = 1;");
        let a = name_id(&program, "a");
        assert_eq!(analysis.var_type(FunctionId::TOP_LEVEL, a), InferType::U16);
    }

    #[test]
    fn return_registry_feeds_call_sites() {
        let (program, analysis) =
            analyzed("fn f(): i64 { return 1; } let x = f();");
        let x = name_id(&program, "x");
        assert_eq!(analysis.var_type(FunctionId::TOP_LEVEL, x), InferType::I64);
    }

    #[test]
    fn simple_counter_is_unboxable() {
        let (program, analysis) =
            analyzed("for (let i = 0; i < 10; i = i + 1) { let x = i * 2; }");
        let i = name_id(&program, "i");
        assert_eq!(
            analysis.unboxed_local(FunctionId::TOP_LEVEL, i),
            Some(NativeType::I32)
        );
    }

    #[test]
    fn captured_local_is_never_unboxable() {
        let (program, analysis) =
            analyzed("let i = 0; let f = fn() { return i; }; i = i + 1;");
        let i = name_id(&program, "i");
        assert_eq!(analysis.unboxed_local(FunctionId::TOP_LEVEL, i), None);
    }

    #[test]
    fn string_assigned_local_is_never_unboxable() {
        let (program, analysis) = analyzed(r#"let x = 1; x = "s";"#);
        let x = name_id(&program, "x");
        assert_eq!(analysis.unboxed_local(FunctionId::TOP_LEVEL, x), None);
    }

    #[test]
    fn escaping_uses_disqualify() {
        let (program, analysis) = analyzed(
            "let a = 1; f(a); let b = 2; let arr = [b]; let c = 3; let o = { v: c }; let d = 4; g()[0] = d;",
        );
        for name in ["a", "b", "c"] {
            let id = name_id(&program, name);
            assert_eq!(
                analysis.unboxed_local(FunctionId::TOP_LEVEL, id),
                None,
                "{name} escaped"
            );
        }
        // d is only *assigned into* an index of another object, which is an
        // ordinary read of d — still unboxable.
        let d = name_id(&program, "d");
        assert_eq!(
            analysis.unboxed_local(FunctionId::TOP_LEVEL, d),
            Some(NativeType::I32)
        );
    }

    #[test]
    fn accumulator_pattern_is_unboxable() {
        let (program, analysis) =
            analyzed("let sum = 0; let n = 0; while (n < 10) { sum = sum + n; n = n + 1; }");
        let sum = name_id(&program, "sum");
        assert_eq!(
            analysis.unboxed_local(FunctionId::TOP_LEVEL, sum),
            Some(NativeType::I32)
        );
    }

    #[test]
    fn tail_recursive_factorial_is_detected() {
        let (program, analysis) = analyzed(
            "fn fact(n, acc) { if (n <= 1) { return acc; } return fact(n - 1, acc * n); }",
        );
        let _ = program;
        assert!(analysis.is_tail_recursive(FunctionId(1)));
    }

    #[test]
    fn non_tail_recursion_is_rejected() {
        let (_, analysis) =
            analyzed("fn fact(n) { if (n <= 1) { return 1; } return n * fact(n - 1); }");
        assert!(!analysis.is_tail_recursive(FunctionId(1)));
    }

    #[test]
    fn loops_try_defer_disqualify_tail_calls() {
        let (_, analysis) = analyzed(
            "fn f(n) { while (false) { } if (n == 0) { return 0; } return f(n - 1); }\
             fn g(n) { try { } finally { } if (n == 0) { return 0; } return g(n - 1); }\
             fn h(n) { defer p(); if (n == 0) { return 0; } return h(n - 1); }",
        );
        assert!(!analysis.is_tail_recursive(FunctionId(1)));
        assert!(!analysis.is_tail_recursive(FunctionId(2)));
        assert!(!analysis.is_tail_recursive(FunctionId(3)));
    }
}
