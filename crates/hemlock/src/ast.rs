use std::rc::Rc;

use strum::{Display, IntoStaticStr};

use crate::{intern::StringId, token::CodeRange};

/// Unique identifier for a function literal within one compilation unit.
///
/// Issued by the parser in source order; index 0 is reserved for the
/// top-level program scope. The analyzer and compiler key their side tables
/// (inferred types, unboxable locals, tail-call eligibility) on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

impl FunctionId {
    /// The synthetic scope id of top-level code.
    pub const TOP_LEVEL: Self = Self(0);
}

/// Binary operators, in source spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum BinaryOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "||")]
    Or,
    #[strum(serialize = "&")]
    BitAnd,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "^")]
    BitXor,
    #[strum(serialize = "<<")]
    Shl,
    #[strum(serialize = ">>")]
    Shr,
}

impl BinaryOp {
    /// True for `==`, `!=`, `<`, `<=`, `>`, `>=`.
    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    /// True for `&`, `|`, `^`, `<<`, `>>`.
    #[must_use]
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            Self::BitAnd | Self::BitOr | Self::BitXor | Self::Shl | Self::Shr
        )
    }
}

/// Unary prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum UnaryOp {
    #[strum(serialize = "!")]
    Not,
    #[strum(serialize = "-")]
    Neg,
    #[strum(serialize = "~")]
    BitNot,
}

/// Increment/decrement direction shared by the four `++`/`--` forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncDec {
    Inc,
    Dec,
}

/// Annotation type constructors.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
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
    String,
    Rune,
    Ptr,
    Buffer,
    Array(Box<TypeExpr>),
    Null,
    Void,
    /// A named object type introduced by `define`.
    CustomObject(StringId),
    /// An object with no declared shape.
    GenericObject,
    /// A named enum type.
    Enum(StringId),
    /// No annotation given; the analyzer infers.
    Infer,
}

/// A type annotation: constructor plus nullability.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpr {
    pub kind: TypeKind,
    pub nullable: bool,
}

impl TypeExpr {
    #[must_use]
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            nullable: false,
        }
    }

    #[must_use]
    pub fn infer() -> Self {
        Self::new(TypeKind::Infer)
    }
}

/// A declared function parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: StringId,
    pub ty: Option<TypeExpr>,
    /// Default value for `name ?: type = default` / omitted-argument use.
    pub default: Option<ExprLoc>,
    /// By-reference parameter: assignments inside the callee write back to
    /// the caller's variable when the argument was a plain identifier.
    pub is_ref: bool,
}

/// The trailing rest parameter `...name: type?`.
#[derive(Debug, Clone, PartialEq)]
pub struct RestParam {
    pub name: StringId,
    pub ty: Option<TypeExpr>,
}

/// A function literal. Shared by `Rc` so closures over the same definition
/// reference one body, and so defers can clone expressions cheaply.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    /// Binding name when declared as `fn name(…) {…}`; `None` for anonymous
    /// function expressions. Used for backtraces and the return-type
    /// registry, never for calling convention.
    pub name: Option<StringId>,
    pub params: Vec<Param>,
    pub rest: Option<RestParam>,
    pub return_type: Option<TypeExpr>,
    pub body: Vec<Stmt>,
    pub is_async: bool,
    pub fn_id: FunctionId,
}

/// An expression with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprLoc {
    pub expr: Expr,
    pub position: CodeRange,
}

impl ExprLoc {
    #[must_use]
    pub fn new(expr: Expr, position: CodeRange) -> Self {
        Self { expr, position }
    }
}

/// An expression in the AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal; `is_float` says which decoded value is authoritative.
    Number {
        int_value: i64,
        float_value: f64,
        is_float: bool,
    },
    Bool(bool),
    Str(StringId),
    Rune(char),
    Null,
    Ident(StringId),
    Binary {
        op: BinaryOp,
        left: Box<ExprLoc>,
        right: Box<ExprLoc>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<ExprLoc>,
    },
    Ternary {
        cond: Box<ExprLoc>,
        then_expr: Box<ExprLoc>,
        else_expr: Box<ExprLoc>,
    },
    Call {
        callee: Box<ExprLoc>,
        args: Vec<ExprLoc>,
    },
    Assign {
        name: StringId,
        value: Box<ExprLoc>,
    },
    GetProp {
        object: Box<ExprLoc>,
        name: StringId,
    },
    SetProp {
        object: Box<ExprLoc>,
        name: StringId,
        value: Box<ExprLoc>,
    },
    Index {
        object: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    IndexAssign {
        object: Box<ExprLoc>,
        index: Box<ExprLoc>,
        value: Box<ExprLoc>,
    },
    Function(Rc<FunctionDef>),
    ArrayLit(Vec<ExprLoc>),
    /// Object literal; field order is source order and is observable
    /// through `for-in`.
    ObjectLit {
        fields: Vec<(StringId, ExprLoc)>,
    },
    PrefixIncDec {
        op: IncDec,
        target: Box<ExprLoc>,
    },
    PostfixIncDec {
        op: IncDec,
        target: Box<ExprLoc>,
    },
    Await(Box<ExprLoc>),
    /// Template string: `strings.len() == exprs.len() + 1`, alternating.
    Interp {
        strings: Vec<StringId>,
        exprs: Vec<ExprLoc>,
    },
    /// `object?.name` — yields null when the object is null.
    OptionalChain {
        object: Box<ExprLoc>,
        name: StringId,
    },
    /// `left ?? right` — yields right only when left is null.
    NullCoalesce {
        left: Box<ExprLoc>,
        right: Box<ExprLoc>,
    },
}

impl Expr {
    /// True when this node is a literal constant the optimizer can fold.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Self::Number { .. } | Self::Bool(_) | Self::Str(_) | Self::Rune(_) | Self::Null
        )
    }
}

/// One arm of a `switch`.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    /// `None` is the `default:` arm.
    pub value: Option<ExprLoc>,
    pub body: Vec<Stmt>,
}

/// One imported (or exported) name with optional alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportName {
    pub original: StringId,
    pub alias: Option<StringId>,
}

/// `import …` statement payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportStmt {
    pub module_path: StringId,
    pub is_namespace: bool,
    pub namespace_name: Option<StringId>,
    pub names: Vec<ImportName>,
}

/// `export …` statement payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportStmt {
    /// `export let x = …;` / `export fn f() {…}` — export of a declaration.
    Declaration(Box<Stmt>),
    /// `export { a, b as c };` or `export { a } from "m";` (re-export).
    Names {
        names: Vec<ImportName>,
        module_path: Option<StringId>,
    },
}

/// A field in a `define` object shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: StringId,
    pub ty: Option<TypeExpr>,
    pub default: Option<ExprLoc>,
    pub optional: bool,
}

/// One `enum` variant with optional explicit value.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumVariant {
    pub name: StringId,
    pub value: Option<ExprLoc>,
}

/// A statement with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub position: CodeRange,
}

impl Stmt {
    #[must_use]
    pub fn new(kind: StmtKind, position: CodeRange) -> Self {
        Self { kind, position }
    }
}

/// Statement forms.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Let {
        name: StringId,
        ty: Option<TypeExpr>,
        value: Option<ExprLoc>,
    },
    Const {
        name: StringId,
        ty: Option<TypeExpr>,
        value: ExprLoc,
    },
    Expr(ExprLoc),
    If {
        cond: ExprLoc,
        then_block: Vec<Stmt>,
        /// `else if` chains nest here as a single-`If` block.
        else_block: Option<Vec<Stmt>>,
    },
    While {
        cond: ExprLoc,
        body: Vec<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<ExprLoc>,
        step: Option<ExprLoc>,
        body: Vec<Stmt>,
    },
    ForIn {
        key: Option<StringId>,
        value: StringId,
        iterable: ExprLoc,
        body: Vec<Stmt>,
    },
    Block(Vec<Stmt>),
    Return(Option<ExprLoc>),
    Break,
    Continue,
    Try {
        body: Vec<Stmt>,
        catch_param: Option<StringId>,
        catch_block: Option<Vec<Stmt>>,
        finally_block: Option<Vec<Stmt>>,
    },
    Throw(ExprLoc),
    Switch {
        expr: ExprLoc,
        cases: Vec<SwitchCase>,
    },
    /// `defer call;` — the call expression runs at function exit, LIFO.
    Defer(ExprLoc),
    Import(ImportStmt),
    Export(ExportStmt),
    ImportFfi {
        library_path: StringId,
    },
    ExternFn {
        name: StringId,
        param_types: Vec<TypeExpr>,
        return_type: TypeExpr,
    },
    DefineObject {
        name: StringId,
        fields: Vec<FieldDef>,
    },
    EnumDecl {
        name: StringId,
        variants: Vec<EnumVariant>,
    },
}
