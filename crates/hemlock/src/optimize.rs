//! Local AST rewrites: constant folding, boolean simplification, strength
//! reduction, and algebraic identities.
//!
//! Every rewrite preserves observable evaluation order for expressions that
//! may throw or have side effects, so `eval(optimize(e)) == eval(e)` holds
//! for all programs, not just pure ones. Rewrites that would change the
//! behavior of an overflowing or zero-divisor operation are not applied;
//! the runtime retains responsibility for those.

use std::rc::Rc;

use crate::{
    ast::{BinaryOp, Expr, ExprLoc, Stmt, StmtKind, SwitchCase, UnaryOp},
    intern::Interns,
    parser::Program,
};

/// Counters reported by one optimizer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub constants_folded: usize,
    pub booleans_simplified: usize,
    pub strength_reductions: usize,
}

/// Rewrites the program in place, children first, and reports statistics.
///
/// Idempotent: a second run performs no further rewrites.
pub fn optimize_program(program: &mut Program) -> OptimizeStats {
    let mut folder = Folder {
        interns: &mut program.interns,
        stats: OptimizeStats::default(),
    };
    let stmts = std::mem::take(&mut program.stmts);
    program.stmts = folder.fold_body(stmts);
    folder.stats
}

struct Folder<'a> {
    interns: &'a mut Interns,
    stats: OptimizeStats,
}

impl Folder<'_> {
    fn fold_body(&mut self, body: Vec<Stmt>) -> Vec<Stmt> {
        body.into_iter().map(|s| self.fold_stmt(s)).collect()
    }

    fn fold_stmt(&mut self, stmt: Stmt) -> Stmt {
        let Stmt { kind, position } = stmt;
        let kind = match kind {
            StmtKind::Let { name, ty, value } => StmtKind::Let {
                name,
                ty,
                value: value.map(|v| self.fold_expr(v)),
            },
            StmtKind::Const { name, ty, value } => StmtKind::Const {
                name,
                ty,
                value: self.fold_expr(value),
            },
            StmtKind::Expr(e) => StmtKind::Expr(self.fold_expr(e)),
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => StmtKind::If {
                cond: self.fold_expr(cond),
                then_block: self.fold_body(then_block),
                else_block: else_block.map(|b| self.fold_body(b)),
            },
            StmtKind::While { cond, body } => StmtKind::While {
                cond: self.fold_expr(cond),
                body: self.fold_body(body),
            },
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => StmtKind::For {
                init: init.map(|s| Box::new(self.fold_stmt(*s))),
                cond: cond.map(|e| self.fold_expr(e)),
                step: step.map(|e| self.fold_expr(e)),
                body: self.fold_body(body),
            },
            StmtKind::ForIn {
                key,
                value,
                iterable,
                body,
            } => StmtKind::ForIn {
                key,
                value,
                iterable: self.fold_expr(iterable),
                body: self.fold_body(body),
            },
            StmtKind::Block(body) => StmtKind::Block(self.fold_body(body)),
            StmtKind::Return(value) => StmtKind::Return(value.map(|e| self.fold_expr(e))),
            StmtKind::Try {
                body,
                catch_param,
                catch_block,
                finally_block,
            } => StmtKind::Try {
                body: self.fold_body(body),
                catch_param,
                catch_block: catch_block.map(|b| self.fold_body(b)),
                finally_block: finally_block.map(|b| self.fold_body(b)),
            },
            StmtKind::Throw(e) => StmtKind::Throw(self.fold_expr(e)),
            StmtKind::Switch { expr, cases } => StmtKind::Switch {
                expr: self.fold_expr(expr),
                cases: cases
                    .into_iter()
                    .map(|c| SwitchCase {
                        value: c.value.map(|v| self.fold_expr(v)),
                        body: self.fold_body(c.body),
                    })
                    .collect(),
            },
            StmtKind::Defer(e) => StmtKind::Defer(self.fold_expr(e)),
            StmtKind::Export(crate::ast::ExportStmt::Declaration(decl)) => StmtKind::Export(
                crate::ast::ExportStmt::Declaration(Box::new(self.fold_stmt(*decl))),
            ),
            other @ (StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Import(_)
            | StmtKind::Export(_)
            | StmtKind::ImportFfi { .. }
            | StmtKind::ExternFn { .. }
            | StmtKind::DefineObject { .. }
            | StmtKind::EnumDecl { .. }) => other,
        };
        Stmt { kind, position }
    }

    fn fold_expr(&mut self, expr: ExprLoc) -> ExprLoc {
        let ExprLoc { expr, position } = expr;
        let expr = match expr {
            Expr::Binary { op, left, right } => {
                let left = self.fold_expr(*left);
                let right = self.fold_expr(*right);
                self.fold_binary(op, left, right)
            }
            Expr::Unary { op, operand } => {
                let operand = self.fold_expr(*operand);
                self.fold_unary(op, operand)
            }
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond = self.fold_expr(*cond);
                let then_expr = self.fold_expr(*then_expr);
                let else_expr = self.fold_expr(*else_expr);
                if let Some(truthy) = literal_truthiness(&cond.expr, self.interns) {
                    self.stats.constants_folded += 1;
                    if truthy { then_expr.expr } else { else_expr.expr }
                } else {
                    Expr::Ternary {
                        cond: Box::new(cond),
                        then_expr: Box::new(then_expr),
                        else_expr: Box::new(else_expr),
                    }
                }
            }
            Expr::NullCoalesce { left, right } => {
                let left = self.fold_expr(*left);
                let right = self.fold_expr(*right);
                if matches!(left.expr, Expr::Null) {
                    self.stats.constants_folded += 1;
                    right.expr
                } else if left.expr.is_literal() {
                    self.stats.constants_folded += 1;
                    left.expr
                } else {
                    Expr::NullCoalesce {
                        left: Box::new(left),
                        right: Box::new(right),
                    }
                }
            }
            Expr::Call { callee, args } => Expr::Call {
                callee: Box::new(self.fold_expr(*callee)),
                args: args.into_iter().map(|a| self.fold_expr(a)).collect(),
            },
            Expr::Assign { name, value } => Expr::Assign {
                name,
                value: Box::new(self.fold_expr(*value)),
            },
            Expr::GetProp { object, name } => Expr::GetProp {
                object: Box::new(self.fold_expr(*object)),
                name,
            },
            Expr::SetProp {
                object,
                name,
                value,
            } => Expr::SetProp {
                object: Box::new(self.fold_expr(*object)),
                name,
                value: Box::new(self.fold_expr(*value)),
            },
            Expr::Index { object, index } => Expr::Index {
                object: Box::new(self.fold_expr(*object)),
                index: Box::new(self.fold_expr(*index)),
            },
            Expr::IndexAssign {
                object,
                index,
                value,
            } => Expr::IndexAssign {
                object: Box::new(self.fold_expr(*object)),
                index: Box::new(self.fold_expr(*index)),
                value: Box::new(self.fold_expr(*value)),
            },
            Expr::Function(def) => {
                let mut new_def = (*def).clone();
                new_def.body = self.fold_body(new_def.body);
                Expr::Function(Rc::new(new_def))
            }
            Expr::ArrayLit(elements) => {
                Expr::ArrayLit(elements.into_iter().map(|e| self.fold_expr(e)).collect())
            }
            Expr::ObjectLit { fields } => Expr::ObjectLit {
                fields: fields
                    .into_iter()
                    .map(|(n, v)| (n, self.fold_expr(v)))
                    .collect(),
            },
            Expr::PrefixIncDec { op, target } => Expr::PrefixIncDec {
                op,
                target: Box::new(self.fold_expr(*target)),
            },
            Expr::PostfixIncDec { op, target } => Expr::PostfixIncDec {
                op,
                target: Box::new(self.fold_expr(*target)),
            },
            Expr::Await(operand) => Expr::Await(Box::new(self.fold_expr(*operand))),
            Expr::Interp { strings, exprs } => Expr::Interp {
                strings,
                exprs: exprs.into_iter().map(|e| self.fold_expr(e)).collect(),
            },
            Expr::OptionalChain { object, name } => Expr::OptionalChain {
                object: Box::new(self.fold_expr(*object)),
                name,
            },
            leaf @ (Expr::Number { .. }
            | Expr::Bool(_)
            | Expr::Str(_)
            | Expr::Rune(_)
            | Expr::Null
            | Expr::Ident(_)) => leaf,
        };
        ExprLoc { expr, position }
    }

    fn fold_binary(&mut self, op: BinaryOp, left: ExprLoc, right: ExprLoc) -> Expr {
        // Short-circuit simplification: a literal left operand decides.
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            if let Some(truthy) = literal_truthiness(&left.expr, self.interns) {
                self.stats.booleans_simplified += 1;
                let pick_right = (op == BinaryOp::And) == truthy;
                return if pick_right { right.expr } else { left.expr };
            }
            // Mirror forms: only when the left is statically boolean and
            // cannot throw or side-effect, so dropping it is observationally
            // equivalent.
            if let Expr::Bool(b) = &right.expr
                && statically_bool(&left.expr)
                && is_pure(&left.expr)
            {
                let b = *b;
                self.stats.booleans_simplified += 1;
                return match (op, b) {
                    (BinaryOp::And, true) | (BinaryOp::Or, false) => left.expr,
                    (BinaryOp::And, false) => Expr::Bool(false),
                    (BinaryOp::Or, true) => Expr::Bool(true),
                    _ => unreachable!("op restricted to And/Or above"),
                };
            }
            return rebuild(op, left, right);
        }

        // Bool literal folding over == and !=.
        if let (Expr::Bool(a), Expr::Bool(b)) = (&left.expr, &right.expr) {
            match op {
                BinaryOp::Eq => {
                    self.stats.booleans_simplified += 1;
                    return Expr::Bool(a == b);
                }
                BinaryOp::Ne => {
                    self.stats.booleans_simplified += 1;
                    return Expr::Bool(a != b);
                }
                _ => {}
            }
        }

        // String concatenation folding.
        if op == BinaryOp::Add
            && let (Expr::Str(a), Expr::Str(b)) = (&left.expr, &right.expr)
        {
            let folded = format!("{}{}", self.interns.get(*a), self.interns.get(*b));
            self.stats.constants_folded += 1;
            return Expr::Str(self.interns.push(&folded));
        }

        // Numeric constant folding.
        if let (
            Expr::Number {
                int_value: li,
                float_value: lf,
                is_float: lff,
            },
            Expr::Number {
                int_value: ri,
                float_value: rf,
                is_float: rff,
            },
        ) = (&left.expr, &right.expr)
            && let Some(folded) = fold_numeric(op, *li, *lf, *lff, *ri, *rf, *rff)
        {
            self.stats.constants_folded += 1;
            return folded;
        }

        // Strength reduction: multiplication by a positive power of two.
        if op == BinaryOp::Mul {
            if let Some(shift) = power_of_two_shift(&right.expr)
                && statically_numeric(&left.expr)
            {
                self.stats.strength_reductions += 1;
                return rebuild(BinaryOp::Shl, left, int_expr(shift, right.position));
            }
            if let Some(shift) = power_of_two_shift(&left.expr)
                && statically_numeric(&right.expr)
            {
                self.stats.strength_reductions += 1;
                return rebuild(BinaryOp::Shl, right, int_expr(shift, left.position));
            }
        }

        // Algebraic identities. Only applied when the surviving operand is
        // statically numeric: for a string or object operand these operators
        // behave differently (concatenation, runtime type errors), and the
        // rewrite must not change that.
        if statically_numeric(&left.expr)
            && let Some(rhs) = as_int_literal(&right.expr)
        {
            let identity = match (op, rhs) {
                (BinaryOp::Add | BinaryOp::Sub, 0)
                | (BinaryOp::Mul | BinaryOp::Div, 1)
                | (BinaryOp::BitOr | BinaryOp::BitXor, 0)
                | (BinaryOp::BitAnd, -1)
                | (BinaryOp::Shl | BinaryOp::Shr, 0) => true,
                _ => false,
            };
            if identity {
                self.stats.strength_reductions += 1;
                return left.expr;
            }
        }

        rebuild(op, left, right)
    }

    fn fold_unary(&mut self, op: UnaryOp, operand: ExprLoc) -> Expr {
        match op {
            UnaryOp::Not => {
                if let Some(truthy) = literal_truthiness(&operand.expr, self.interns) {
                    self.stats.booleans_simplified += 1;
                    return Expr::Bool(!truthy);
                }
                // `!!x -> x` only when x is already boolean-valued.
                if let Expr::Unary {
                    op: UnaryOp::Not,
                    operand: inner,
                } = &operand.expr
                    && statically_bool(&inner.expr)
                {
                    self.stats.booleans_simplified += 1;
                    return inner.expr.clone();
                }
            }
            UnaryOp::Neg => {
                if let Expr::Number {
                    int_value,
                    float_value,
                    is_float,
                } = &operand.expr
                {
                    if *is_float {
                        self.stats.constants_folded += 1;
                        return float_expr(-float_value);
                    }
                    if let Some(neg) = int_value.checked_neg() {
                        self.stats.constants_folded += 1;
                        return int_number(neg);
                    }
                }
                // `-(-x) -> x` for numeric x; wrapping negation agrees.
                if let Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: inner,
                } = &operand.expr
                    && statically_numeric(&inner.expr)
                {
                    self.stats.constants_folded += 1;
                    return inner.expr.clone();
                }
            }
            UnaryOp::BitNot => {
                if let Expr::Number {
                    int_value,
                    is_float: false,
                    ..
                } = &operand.expr
                {
                    self.stats.constants_folded += 1;
                    return int_number(!*int_value);
                }
                if let Expr::Unary {
                    op: UnaryOp::BitNot,
                    operand: inner,
                } = &operand.expr
                    && statically_numeric(&inner.expr)
                {
                    self.stats.constants_folded += 1;
                    return inner.expr.clone();
                }
            }
        }
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }
}

fn rebuild(op: BinaryOp, left: ExprLoc, right: ExprLoc) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn int_number(v: i64) -> Expr {
    Expr::Number {
        int_value: v,
        float_value: v as f64,
        is_float: false,
    }
}

fn float_expr(v: f64) -> Expr {
    Expr::Number {
        int_value: v as i64,
        float_value: v,
        is_float: true,
    }
}

fn int_expr(v: i64, position: crate::token::CodeRange) -> ExprLoc {
    ExprLoc::new(int_number(v), position)
}

fn as_int_literal(e: &Expr) -> Option<i64> {
    match e {
        Expr::Number {
            int_value,
            is_float: false,
            ..
        } => Some(*int_value),
        _ => None,
    }
}

/// Returns `log2(v)` when the expression is a positive power-of-two integer
/// literal.
fn power_of_two_shift(e: &Expr) -> Option<i64> {
    let v = as_int_literal(e)?;
    if v > 0 && (v & (v - 1)) == 0 {
        Some(i64::from(v.trailing_zeros()))
    } else {
        None
    }
}

/// Truthiness of a literal, when the expression is one.
///
/// Mirrors the evaluator: `false`, `null`, numeric zero, the empty string,
/// and the zero rune are falsy.
fn literal_truthiness(e: &Expr, interns: &Interns) -> Option<bool> {
    match e {
        Expr::Bool(b) => Some(*b),
        Expr::Null => Some(false),
        Expr::Number {
            int_value,
            float_value,
            is_float,
        } => Some(if *is_float {
            *float_value != 0.0
        } else {
            *int_value != 0
        }),
        Expr::Str(id) => Some(!interns.get(*id).is_empty()),
        Expr::Rune(c) => Some(*c != '\0'),
        _ => None,
    }
}

/// True when the expression statically evaluates to a number (or throws),
/// so numeric identities cannot change a string/object code path.
fn statically_numeric(e: &Expr) -> bool {
    match e {
        Expr::Number { .. } => true,
        Expr::Unary {
            op: UnaryOp::Neg | UnaryOp::BitNot,
            operand,
        } => statically_numeric(&operand.expr),
        Expr::Binary { op, .. } => matches!(
            op,
            BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::Mod
                | BinaryOp::Shl
                | BinaryOp::Shr
                | BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::BitXor
        ),
        Expr::PrefixIncDec { .. } | Expr::PostfixIncDec { .. } => true,
        _ => false,
    }
}

/// True when the expression always yields a Bool at runtime.
fn statically_bool(e: &Expr) -> bool {
    match e {
        Expr::Bool(_) => true,
        Expr::Unary {
            op: UnaryOp::Not, ..
        } => true,
        Expr::Binary { op, left, right } => {
            op.is_comparison()
                || (matches!(op, BinaryOp::And | BinaryOp::Or)
                    && statically_bool(&left.expr)
                    && statically_bool(&right.expr))
        }
        _ => false,
    }
}

/// True when evaluating the expression can neither side-effect nor throw,
/// so it may be dropped entirely.
fn is_pure(e: &Expr) -> bool {
    match e {
        Expr::Number { .. }
        | Expr::Bool(_)
        | Expr::Str(_)
        | Expr::Rune(_)
        | Expr::Null
        | Expr::Ident(_) => true,
        Expr::Unary {
            op: UnaryOp::Not,
            operand,
        } => is_pure(&operand.expr),
        Expr::Binary {
            op: BinaryOp::And | BinaryOp::Or,
            left,
            right,
        } => is_pure(&left.expr) && is_pure(&right.expr),
        _ => false,
    }
}

/// Folds a numeric binary operation, or returns `None` when the operation
/// must be left to the runtime (overflow, zero divisor).
fn fold_numeric(
    op: BinaryOp,
    li: i64,
    lf: f64,
    l_is_float: bool,
    ri: i64,
    rf: f64,
    r_is_float: bool,
) -> Option<Expr> {
    let any_float = l_is_float || r_is_float;
    let lf = if l_is_float { lf } else { li as f64 };
    let rf = if r_is_float { rf } else { ri as f64 };

    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
            if any_float {
                let v = match op {
                    BinaryOp::Add => lf + rf,
                    BinaryOp::Sub => lf - rf,
                    _ => lf * rf,
                };
                Some(float_expr(v))
            } else {
                let v = match op {
                    BinaryOp::Add => li.checked_add(ri),
                    BinaryOp::Sub => li.checked_sub(ri),
                    _ => li.checked_mul(ri),
                }?;
                Some(int_number(v))
            }
        }
        // Division always yields f64; zero divisors stay for the runtime.
        BinaryOp::Div => {
            if rf == 0.0 {
                None
            } else {
                Some(float_expr(lf / rf))
            }
        }
        // Modulo preserves integer-ness.
        BinaryOp::Mod => {
            if any_float {
                if rf == 0.0 {
                    None
                } else {
                    Some(float_expr(lf % rf))
                }
            } else {
                let v = li.checked_rem(ri)?;
                Some(int_number(v))
            }
        }
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let result = if any_float {
                match op {
                    BinaryOp::Eq => lf == rf,
                    BinaryOp::Ne => lf != rf,
                    BinaryOp::Lt => lf < rf,
                    BinaryOp::Le => lf <= rf,
                    BinaryOp::Gt => lf > rf,
                    _ => lf >= rf,
                }
            } else {
                match op {
                    BinaryOp::Eq => li == ri,
                    BinaryOp::Ne => li != ri,
                    BinaryOp::Lt => li < ri,
                    BinaryOp::Le => li <= ri,
                    BinaryOp::Gt => li > ri,
                    _ => li >= ri,
                }
            };
            Some(Expr::Bool(result))
        }
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
            if any_float {
                None
            } else {
                let v = match op {
                    BinaryOp::BitAnd => li & ri,
                    BinaryOp::BitOr => li | ri,
                    _ => li ^ ri,
                };
                Some(int_number(v))
            }
        }
        BinaryOp::Shl | BinaryOp::Shr => {
            if any_float || !(0..64).contains(&ri) {
                None
            } else {
                let v = if op == BinaryOp::Shl {
                    li.wrapping_shl(ri as u32)
                } else {
                    li.wrapping_shr(ri as u32)
                };
                Some(int_number(v))
            }
        }
        BinaryOp::And | BinaryOp::Or => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parser::parse;

    fn optimized(source: &str) -> (Program, OptimizeStats) {
        let result = parse(source, "test.hml");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let mut program = result.program;
        let stats = optimize_program(&mut program);
        (program, stats)
    }

    fn first_let_value(program: &Program) -> &Expr {
        match &program.stmts[0].kind {
            StmtKind::Let {
                value: Some(value), ..
            } => &value.expr,
            other => panic!("expected let, got {other:?}"),
        }
    }

    #[test]
    fn folds_integer_arithmetic() {
        let (program, stats) = optimized("let x = 1 + 2 * 3;");
        assert_eq!(*first_let_value(&program), int_number(7));
        assert_eq!(stats.constants_folded, 2);
    }

    #[test]
    fn division_always_folds_to_float() {
        let (program, _) = optimized("let x = 7 / 2;");
        assert_eq!(*first_let_value(&program), float_expr(3.5));
    }

    #[test]
    fn zero_divisor_left_for_runtime() {
        let (program, stats) = optimized("let x = 1 / 0;");
        assert!(matches!(first_let_value(&program), Expr::Binary { .. }));
        assert_eq!(stats.constants_folded, 0);
    }

    #[test]
    fn overflow_left_for_runtime() {
        let (program, _) = optimized("let x = 9223372036854775807 + 1;");
        assert!(matches!(first_let_value(&program), Expr::Binary { .. }));
    }

    #[test]
    fn string_concat_folds() {
        let (program, stats) = optimized(r#"let x = "a" + "b";"#);
        match first_let_value(&program) {
            Expr::Str(id) => assert_eq!(program.interns.get(*id), "ab"),
            other => panic!("expected string, got {other:?}"),
        }
        assert_eq!(stats.constants_folded, 1);
    }

    #[test]
    fn short_circuit_literal_left() {
        let (program, stats) = optimized("let x = true && f(); let y = false && f();");
        assert!(matches!(first_let_value(&program), Expr::Call { .. }));
        match &program.stmts[1].kind {
            StmtKind::Let {
                value: Some(value), ..
            } => assert_eq!(value.expr, Expr::Bool(false)),
            other => panic!("expected let, got {other:?}"),
        }
        assert_eq!(stats.booleans_simplified, 2);
    }

    #[test]
    fn impure_right_operand_survives_or() {
        // `true || f()` folds to true without evaluating f; `x || f()` must
        // keep both sides.
        let (program, _) = optimized("let a = true || f(); let b = x || f();");
        assert_eq!(*first_let_value(&program), Expr::Bool(true));
        match &program.stmts[1].kind {
            StmtKind::Let {
                value: Some(value), ..
            } => assert!(matches!(
                value.expr,
                Expr::Binary {
                    op: BinaryOp::Or,
                    ..
                }
            )),
            other => panic!("expected let, got {other:?}"),
        }
    }

    #[test]
    fn strength_reduces_power_of_two_multiplication() {
        let (program, stats) = optimized("let x = (a - 0) * 8;");
        // a - 0 is statically numeric; * 8 becomes << 3.
        match first_let_value(&program) {
            Expr::Binary {
                op: BinaryOp::Shl,
                right,
                ..
            } => assert_eq!(right.expr, int_number(3)),
            other => panic!("expected shift, got {other:?}"),
        }
        assert_eq!(stats.strength_reductions, 1);
    }

    #[test]
    fn identity_not_applied_to_possibly_string_operand() {
        // `s + 0` concatenates when s is a string; must not be rewritten.
        let (program, stats) = optimized("let x = s + 0;");
        assert!(matches!(first_let_value(&program), Expr::Binary { .. }));
        assert_eq!(stats.strength_reductions, 0);
    }

    #[test]
    fn ternary_collapses_on_literal_condition() {
        let (program, _) = optimized("let x = 1 ? a : b;");
        assert!(matches!(first_let_value(&program), Expr::Ident(_)));
    }

    #[test]
    fn null_coalesce_literals() {
        let (program, _) = optimized("let x = null ?? a; let y = 3 ?? a;");
        assert!(matches!(first_let_value(&program), Expr::Ident(_)));
        match &program.stmts[1].kind {
            StmtKind::Let {
                value: Some(value), ..
            } => assert_eq!(value.expr, int_number(3)),
            other => panic!("expected let, got {other:?}"),
        }
    }

    #[test]
    fn double_negation_collapses() {
        let (program, _) = optimized("let x = -(-(a * 1));");
        // inner a * 1 -> a (statically numeric), then -(-a) -> a.
        assert!(matches!(first_let_value(&program), Expr::Ident(_)));
    }

    #[test]
    fn optimizer_is_idempotent() {
        let source = "let x = 1 + 2 * 3; let y = true && f(); let z = a * 16; fn g() { return 2 + 2; }";
        let result = parse(source, "test.hml");
        let mut program = result.program;
        optimize_program(&mut program);
        let once = program.stmts.clone();
        let stats = optimize_program(&mut program);
        assert_eq!(once, program.stmts);
        assert_eq!(stats, OptimizeStats::default());
    }

    #[test]
    fn folds_inside_function_bodies() {
        let (program, stats) = optimized("fn f() { return 40 + 2; }");
        let StmtKind::Let {
            value: Some(value), ..
        } = &program.stmts[0].kind
        else {
            panic!("expected let");
        };
        let Expr::Function(def) = &value.expr else {
            panic!("expected function");
        };
        match &def.body[0].kind {
            StmtKind::Return(Some(e)) => assert_eq!(e.expr, int_number(42)),
            other => panic!("expected return, got {other:?}"),
        }
        assert_eq!(stats.constants_folded, 1);
    }
}
