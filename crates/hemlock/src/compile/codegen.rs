//! C emission for Backend B.
//!
//! Every Hemlock function lowers to a C function with the uniform signature
//! `static HmlValue f(HmlEnv *env, HmlValue *args, size_t argc)`. Locals
//! are hoisted to the function prologue (each declaration site gets a
//! unique C name, so shadowing never relies on C scopes), control flow
//! lowers to labels and gotos, and every potentially-throwing call is
//! followed by a pending-exception check that jumps to the innermost
//! handler. Values follow the ABI ownership convention: arguments are
//! borrowed, results are owned, and owned temporaries are released at the
//! end of the statement that produced them.

use ahash::{AHashMap, AHashSet};

use crate::{
    analyze::{Analysis, NativeType},
    ast::{
        BinaryOp, EnumVariant, Expr, ExprLoc, FieldDef, FunctionDef, FunctionId, ImportStmt,
        IncDec, Param, Stmt, StmtKind, SwitchCase, TypeExpr, TypeKind, UnaryOp,
    },
    builtins::Builtin,
    intern::StringId,
    parser::Program,
};

use super::{
    CompileError,
    abi,
    closure::ClosureInfo,
    mangle::{mangle, mangle_imported},
};

/// Value representation of an emitted expression.
#[derive(Debug, Clone)]
struct CVal {
    /// A pure C expression (often just a temp name).
    code: String,
    repr: Repr,
    /// True when this is an owned boxed temporary registered for release.
    owned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repr {
    Boxed,
    Native(NativeType),
}

impl CVal {
    fn boxed(code: String, owned: bool) -> Self {
        Self {
            code,
            repr: Repr::Boxed,
            owned,
        }
    }

    fn native(code: String, ty: NativeType) -> Self {
        Self {
            code,
            repr: Repr::Native(ty),
            owned: false,
        }
    }
}

/// How a resolved identifier is stored.
#[derive(Debug, Clone)]
enum VarKind {
    /// Plain C local of type `HmlValue`, owning its value.
    Local,
    /// Native C local (unboxed).
    Unboxed(NativeType),
    /// Slot in the shared closure environment of its owning scope.
    EnvSlot(usize),
    /// Extern FFI function.
    ExternFn {
        params: Vec<NativeType>,
        ret: Option<NativeType>,
    },
}

#[derive(Debug, Clone)]
struct VarBinding {
    c_name: String,
    kind: VarKind,
    is_const: bool,
}

/// Break/continue target bookkeeping.
#[derive(Debug, Clone)]
enum Ctl {
    Loop {
        break_label: String,
        continue_label: String,
    },
    Switch {
        end_label: String,
    },
}

/// One enclosing `try` with a `finally`, for staged control flow.
#[derive(Debug, Clone)]
struct FinallyFrame {
    merge_label: String,
    /// Innermost loop labels visible when the try was entered, used to
    /// resume a staged break/continue after the finally has run.
    loop_labels: Option<(String, String)>,
}

/// Per-function emission state.
struct FnCtx {
    fn_id: FunctionId,
    body: String,
    decls: Vec<String>,
    scopes: Vec<AHashMap<StringId, VarBinding>>,
    handler_stack: Vec<String>,
    ctl_stack: Vec<Ctl>,
    finally_stack: Vec<FinallyFrame>,
    /// Emitted defer blocks with their guard flags, in registration order.
    defers: Vec<(String, String)>,
    temps_in_stmt: Vec<String>,
    tail_entry: Option<String>,
    self_name: Option<StringId>,
    param_c_names: Vec<String>,
    has_env: bool,
    env_var: String,
    incoming_env: String,
    indent: usize,
}

impl FnCtx {
    fn env_expr(&self) -> &str {
        if self.has_env {
            &self.env_var
        } else {
            &self.incoming_env
        }
    }
}

/// The code generator. One instance per compilation unit.
pub(crate) struct CodeGen<'a> {
    program: &'a Program,
    analysis: &'a Analysis,
    closures: &'a ClosureInfo,
    pub errors: Vec<CompileError>,
    fn_defs: String,
    protos: String,
    extern_decls: String,
    emitted_externs: AHashSet<String>,
    /// Names bound by imports, to their mangled extern symbols.
    imports: AHashMap<StringId, String>,
    fn_stack: Vec<FnCtx>,
    tmp_counter: u32,
    label_counter: u32,
    name_counter: u32,
    /// `define`d shapes for stamp emission.
    shapes: AHashMap<StringId, Vec<FieldDef>>,
    current_line: u32,
}

impl<'a> CodeGen<'a> {
    pub fn new(program: &'a Program, analysis: &'a Analysis, closures: &'a ClosureInfo) -> Self {
        Self {
            program,
            analysis,
            closures,
            errors: Vec::new(),
            fn_defs: String::new(),
            protos: String::new(),
            extern_decls: String::new(),
            emitted_externs: AHashSet::new(),
            imports: AHashMap::new(),
            fn_stack: Vec::new(),
            tmp_counter: 0,
            label_counter: 0,
            name_counter: 0,
            shapes: AHashMap::new(),
            current_line: 0,
        }
    }

    fn text(&self, id: StringId) -> &str {
        self.program.interns.get(id)
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(CompileError {
            message: message.into(),
            line: self.current_line,
        });
    }

    // ---- low-level emission helpers -------------------------------------

    fn cur(&mut self) -> &mut FnCtx {
        self.fn_stack.last_mut().expect("function context present")
    }

    fn cur_ref(&self) -> &FnCtx {
        self.fn_stack.last().expect("function context present")
    }

    fn line(&mut self, text: &str) {
        let indent = self.cur_ref().indent;
        let body = &mut self.cur().body;
        for _ in 0..indent {
            body.push_str("    ");
        }
        body.push_str(text);
        body.push('\n');
    }

    fn label(&mut self, label: &str) {
        let body = &mut self.cur().body;
        body.push_str(label);
        body.push_str(":;\n");
    }

    fn fresh_tmp(&mut self) -> String {
        let n = self.tmp_counter;
        self.tmp_counter += 1;
        let name = format!("hml_t{n}");
        self.cur()
            .decls
            .push(format!("{} {name} = hml_val_null();", abi::VALUE));
        name
    }

    fn fresh_native(&mut self, ty: NativeType) -> String {
        let n = self.tmp_counter;
        self.tmp_counter += 1;
        let name = format!("hml_n{n}");
        self.cur()
            .decls
            .push(format!("{} {name} = 0;", abi::c_type(ty)));
        name
    }

    fn fresh_label(&mut self, stem: &str) -> String {
        let n = self.label_counter;
        self.label_counter += 1;
        format!("hml_{stem}{n}")
    }

    fn fresh_c_name(&mut self, base: &str) -> String {
        let n = self.name_counter;
        self.name_counter += 1;
        format!("v_{base}_{n}")
    }

    /// The label a pending exception jumps to from the current position.
    fn handler_label(&self) -> String {
        self.cur_ref()
            .handler_stack
            .last()
            .cloned()
            .unwrap_or_else(|| "hml_done".to_owned())
    }

    fn exc_check(&mut self) {
        let handler = self.handler_label();
        self.line(&format!("if (hml_exc_pending()) goto {handler};"));
    }

    /// Registers an owned temp for release at statement end.
    fn note_owned(&mut self, name: &str) {
        self.cur().temps_in_stmt.push(name.to_owned());
    }

    /// Releases owned temps produced since `mark`, except `keep`.
    ///
    /// Temps are nulled after release so re-running the same code path (in
    /// a loop) never releases a stale pointer.
    fn release_temps_since(&mut self, mark: usize, keep: Option<&str>) {
        let temps: Vec<String> = self.cur().temps_in_stmt.split_off(mark);
        for temp in temps {
            if Some(temp.as_str()) != keep {
                self.line(&format!("hml_release({temp});"));
                self.line(&format!("{temp} = hml_val_null();"));
            }
        }
    }

    fn temp_mark(&self) -> usize {
        self.cur_ref().temps_in_stmt.len()
    }

    /// Takes ownership of a boxed value: an owned temp is deregistered
    /// (ownership transfers), a borrowed value is retained.
    fn take_owned(&mut self, val: &CVal) -> String {
        debug_assert_eq!(val.repr, Repr::Boxed);
        if val.owned {
            let temps = &mut self.cur().temps_in_stmt;
            if let Some(pos) = temps.iter().rposition(|t| t == &val.code) {
                temps.remove(pos);
            }
            val.code.clone()
        } else {
            format!("hml_retain({})", val.code)
        }
    }

    /// Boxed C expression for any value (borrowed unless it was owned).
    fn boxed_code(&mut self, val: &CVal) -> String {
        match val.repr {
            Repr::Boxed => val.code.clone(),
            Repr::Native(ty) => format!("{}({})", abi::box_fn(ty), val.code),
        }
    }

    /// Coerces to a native value, emitting a checked unbox when boxed.
    fn native_code(&mut self, val: &CVal, want: NativeType) -> String {
        match val.repr {
            Repr::Native(have) if have == want => val.code.clone(),
            Repr::Native(_) => format!("({})({})", abi::c_type(want), val.code),
            Repr::Boxed => {
                let tmp = self.fresh_native(want);
                let unbox = abi::unbox_fn(want);
                let code = val.code.clone();
                self.line(&format!("{tmp} = {unbox}({code});"));
                self.exc_check();
                tmp
            }
        }
    }

    /// Truthiness condition for an `if`/`while` guard.
    fn truthy_code(&mut self, val: &CVal) -> String {
        match val.repr {
            Repr::Native(NativeType::Bool) => val.code.clone(),
            Repr::Native(_) => format!("({} != 0)", val.code),
            Repr::Boxed => format!("hml_truthy({})", val.code),
        }
    }

    /// Runs `f` with the body redirected into a fresh buffer.
    fn capture<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> (R, String) {
        let saved = std::mem::take(&mut self.cur().body);
        let result = f(self);
        let captured = std::mem::replace(&mut self.cur().body, saved);
        (result, captured)
    }

    // ---- name resolution -------------------------------------------------

    fn declare_var(&mut self, name: StringId, kind: VarKind, is_const: bool) -> VarBinding {
        let base = mangle(self.text(name));
        let c_name = match &kind {
            VarKind::EnvSlot(_) => String::new(),
            VarKind::ExternFn { .. } => base.clone(),
            _ => self.fresh_c_name(&base),
        };
        let binding = VarBinding {
            c_name,
            kind,
            is_const,
        };
        let scope = self
            .cur()
            .scopes
            .last_mut()
            .expect("block scope present");
        if scope.insert(name, binding.clone()).is_some() {
            let text = self.text(name).to_owned();
            self.error(format!("duplicate binding '{text}' in the same scope"));
        }
        binding
    }

    /// Resolution outcome for an identifier use site.
    fn resolve(&self, name: StringId) -> Resolved {
        // Current function's block scopes.
        let current = self.fn_stack.len() - 1;
        for scope in self.fn_stack[current].scopes.iter().rev() {
            if let Some(binding) = scope.get(&name) {
                return Resolved::Binding(binding.clone());
            }
        }
        // Enclosing functions: every hit is a captured variable, except
        // extern fns, which are global C symbols callable from anywhere.
        for (depth_from_top, ctx) in self.fn_stack[..current].iter().rev().enumerate() {
            for scope in ctx.scopes.iter().rev() {
                if let Some(binding) = scope.get(&name) {
                    if matches!(binding.kind, VarKind::ExternFn { .. }) {
                        return Resolved::Binding(binding.clone());
                    }
                    let slot = self
                        .closures
                        .slot_of(ctx.fn_id, name)
                        .expect("captured variable has a slot");
                    // Parent-chain distance: the env chain visible here
                    // starts at the current function's own env when it has
                    // one, so every env-owning scope above the owner counts,
                    // the current function included.
                    let owner_index = current - 1 - depth_from_top;
                    let up = self.fn_stack[owner_index + 1..]
                        .iter()
                        .filter(|c| c.has_env)
                        .count();
                    return Resolved::Outer {
                        up,
                        slot,
                        is_const: binding.is_const,
                    };
                }
            }
        }
        if let Some(symbol) = self.imports.get(&name) {
            return Resolved::Import(symbol.clone());
        }
        if let Some(builtin) = Builtin::lookup(self.program.interns.get(name)) {
            return Resolved::Builtin(builtin);
        }
        Resolved::Undefined
    }
}

#[derive(Debug, Clone)]
enum Resolved {
    /// Bound in the current function.
    Binding(VarBinding),
    /// Captured from an enclosing function scope.
    Outer {
        up: usize,
        slot: usize,
        is_const: bool,
    },
    Import(String),
    Builtin(Builtin),
    Undefined,
}

/// Escapes text into a C string literal body (octal escapes for anything
/// outside printable ASCII, so following characters can never extend an
/// escape).
fn c_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(byte as char),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            _ => out.push_str(&format!("\\{byte:03o}")),
        }
    }
    out
}

fn promote_native(a: NativeType, b: NativeType) -> NativeType {
    use NativeType as N;
    fn rank(t: N) -> Option<(u8, bool)> {
        match t {
            N::I8 => Some((8, true)),
            N::I16 => Some((16, true)),
            N::I32 => Some((32, true)),
            N::I64 => Some((64, true)),
            N::U8 => Some((8, false)),
            N::U16 => Some((16, false)),
            N::U32 => Some((32, false)),
            N::U64 => Some((64, false)),
            _ => None,
        }
    }
    if a == N::F64 || b == N::F64 {
        return N::F64;
    }
    if a == N::F32 && b == N::F32 {
        return N::F32;
    }
    if a == N::F32 || b == N::F32 {
        return N::F64;
    }
    let (Some((aw, as_)), Some((bw, bs))) = (rank(a), rank(b)) else {
        return N::I64;
    };
    if as_ == bs {
        let w = aw.max(bw);
        return match (as_, w) {
            (true, 8) => N::I8,
            (true, 16) => N::I16,
            (true, 32) => N::I32,
            (true, _) => N::I64,
            (false, 8) => N::U8,
            (false, 16) => N::U16,
            (false, 32) => N::U32,
            (false, _) => N::U64,
        };
    }
    let unsigned_w = if as_ { bw } else { aw };
    let signed_w = if as_ { aw } else { bw };
    let promoted = match unsigned_w {
        8 => 16,
        16 => 32,
        _ => 64,
    };
    match promoted.max(signed_w) {
        16 => N::I16,
        32 => N::I32,
        _ => N::I64,
    }
}

impl CodeGen<'_> {
    // ---- program ---------------------------------------------------------

    /// Emits the whole compilation unit. Returns the C translation unit
    /// text; the caller refuses to use it when errors were recorded.
    pub fn emit_program(&mut self) -> String {
        let top_env_size = self.closures.env_size(FunctionId::TOP_LEVEL);
        let has_env = top_env_size > 0;
        self.fn_stack.push(FnCtx {
            fn_id: FunctionId::TOP_LEVEL,
            body: String::new(),
            decls: Vec::new(),
            scopes: vec![AHashMap::new()],
            handler_stack: Vec::new(),
            ctl_stack: Vec::new(),
            finally_stack: Vec::new(),
            defers: Vec::new(),
            temps_in_stmt: Vec::new(),
            tail_entry: None,
            self_name: None,
            param_c_names: Vec::new(),
            has_env,
            env_var: "hml_env0".to_owned(),
            incoming_env: "NULL".to_owned(),
            indent: 1,
        });

        for stmt in &self.program.stmts {
            self.emit_stmt(stmt);
        }

        let ctx = self.fn_stack.pop().expect("top-level context");
        let mut main_fn = String::new();
        main_fn.push_str("int main(void) {\n");
        main_fn.push_str("    hml_rt_init();\n");
        main_fn.push_str(&format!("    {} hml_ret = hml_val_null();\n", abi::VALUE));
        main_fn.push_str("    int hml_has_ret = 0;\n    int hml_jump = 0;\n");
        main_fn.push_str("    (void)hml_ret; (void)hml_has_ret; (void)hml_jump;\n");
        for decl in &ctx.decls {
            main_fn.push_str("    ");
            main_fn.push_str(decl);
            main_fn.push('\n');
        }
        if has_env {
            main_fn.push_str(&format!(
                "    {} *{} = hml_env_new(NULL, {top_env_size});\n",
                abi::ENV,
                ctx.env_var
            ));
        }
        main_fn.push_str(&ctx.body);
        main_fn.push_str("hml_done:;\n");
        main_fn.push_str(&epilogue_defers(&ctx));
        main_fn.push_str(&release_locals(&ctx));
        if has_env {
            main_fn.push_str(&format!("    hml_env_release({});\n", ctx.env_var));
        }
        main_fn.push_str("    if (hml_has_ret) hml_release(hml_ret);\n");
        main_fn.push_str(
            "    if (hml_exc_pending()) { hml_exc_report(); hml_rt_shutdown(); return 1; }\n",
        );
        main_fn.push_str("    hml_rt_shutdown();\n    return 0;\n}\n");

        let mut out = String::new();
        out.push_str(&format!("#include \"{}\"\n\n", abi::RUNTIME_HEADER));
        if !self.extern_decls.is_empty() {
            out.push_str(&self.extern_decls);
            out.push('\n');
        }
        if !self.protos.is_empty() {
            out.push_str(&self.protos);
            out.push('\n');
        }
        out.push_str(&self.fn_defs);
        out.push_str(&main_fn);
        out
    }

    // ---- statements ------------------------------------------------------

    fn emit_stmt(&mut self, stmt: &Stmt) {
        self.current_line = stmt.position.line;
        let mark = self.temp_mark();
        match &stmt.kind {
            StmtKind::Let { name, ty, value } => {
                self.emit_let(*name, ty.as_ref(), value.as_ref(), false);
            }
            StmtKind::Const { name, ty, value } => {
                self.emit_let(*name, ty.as_ref(), Some(value), true);
            }
            StmtKind::Expr(e) => {
                let _ = self.emit_expr(e);
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let c = self.emit_expr(cond);
                let guard = self.truthy_code(&c);
                self.line(&format!("if ({guard}) {{"));
                self.cur().indent += 1;
                self.emit_scope(then_block);
                self.cur().indent -= 1;
                if let Some(else_block) = else_block {
                    self.line("} else {");
                    self.cur().indent += 1;
                    self.emit_scope(else_block);
                    self.cur().indent -= 1;
                }
                self.line("}");
                // Condition temps release on the fall-through path too.
            }
            StmtKind::While { cond, body } => {
                let start = self.fresh_label("Lw");
                let brk = self.fresh_label("Lbrk");
                self.label_line(&start);
                let inner_mark = self.temp_mark();
                let c = self.emit_expr(cond);
                let guard = self.truthy_code(&c);
                self.release_temps_since(inner_mark, None);
                self.line(&format!("if (!({guard})) goto {brk};"));
                self.cur().ctl_stack.push(Ctl::Loop {
                    break_label: brk.clone(),
                    continue_label: start.clone(),
                });
                self.line("{");
                self.cur().indent += 1;
                self.emit_scope(body);
                self.cur().indent -= 1;
                self.line("}");
                self.cur().ctl_stack.pop();
                self.line(&format!("goto {start};"));
                self.label_line(&brk);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => self.emit_for(init.as_deref(), cond.as_ref(), step.as_ref(), body),
            StmtKind::ForIn {
                key,
                value,
                iterable,
                body,
            } => self.emit_for_in(*key, *value, iterable, body),
            StmtKind::Block(body) => {
                self.line("{");
                self.cur().indent += 1;
                self.emit_scope(body);
                self.cur().indent -= 1;
                self.line("}");
            }
            StmtKind::Return(value) => self.emit_return(value.as_ref()),
            StmtKind::Break => self.emit_break(),
            StmtKind::Continue => self.emit_continue(),
            StmtKind::Throw(e) => {
                let v = self.emit_expr(e);
                let code = self.boxed_code(&v);
                self.line(&format!("hml_throw({code});"));
                self.release_temps_since(mark, None);
                let handler = self.handler_label();
                self.line(&format!("goto {handler};"));
                return;
            }
            StmtKind::Try {
                body,
                catch_param,
                catch_block,
                finally_block,
            } => self.emit_try(
                body,
                *catch_param,
                catch_block.as_deref(),
                finally_block.as_deref(),
            ),
            StmtKind::Switch { expr, cases } => self.emit_switch(expr, cases),
            StmtKind::Defer(call) => self.emit_defer(call),
            StmtKind::Import(import) => self.emit_import(import),
            StmtKind::Export(crate::ast::ExportStmt::Declaration(decl)) => self.emit_stmt(decl),
            StmtKind::Export(crate::ast::ExportStmt::Names { .. }) => {}
            StmtKind::ImportFfi { library_path } => {
                let path = self.text(*library_path).to_owned();
                self.line(&format!("/* ffi library: {path} */"));
            }
            StmtKind::ExternFn {
                name,
                param_types,
                return_type,
            } => self.emit_extern_fn(*name, param_types, return_type),
            StmtKind::DefineObject { name, fields } => {
                self.shapes.insert(*name, fields.clone());
                let type_name = self.text(*name).to_owned();
                let mut registration = format!("hml_shape_register(\"{}\"", c_escape(&type_name));
                for field in fields.clone() {
                    let fname = self.text(field.name).to_owned();
                    registration.push_str(&format!(", \"{}\"", c_escape(&fname)));
                }
                registration.push_str(", NULL);");
                self.line(&registration);
            }
            StmtKind::EnumDecl { name, variants } => self.emit_enum(*name, variants),
        }
        self.release_temps_since(mark, None);
    }

    /// Emits a label at column zero.
    fn label_line(&mut self, label: &str) {
        self.label(label);
    }

    fn emit_scope(&mut self, body: &[Stmt]) {
        self.cur().scopes.push(AHashMap::new());
        for stmt in body {
            self.emit_stmt(stmt);
        }
        self.cur().scopes.pop();
    }

    fn emit_let(
        &mut self,
        name: StringId,
        ty: Option<&TypeExpr>,
        value: Option<&ExprLoc>,
        is_const: bool,
    ) {
        let fn_id = self.cur_ref().fn_id;
        let captured = self.closures.is_captured(fn_id, name);
        let unboxed = if captured {
            None
        } else {
            self.analysis.unboxed_local(fn_id, name)
        };

        // Declare before emitting a function-literal initializer so the
        // body's self-references resolve to this binding.
        let is_fn_literal = matches!(value.map(|v| &v.expr), Some(Expr::Function(_)));
        let kind = if captured {
            let slot = self
                .closures
                .slot_of(fn_id, name)
                .expect("captured names have slots");
            VarKind::EnvSlot(slot)
        } else if let Some(native) = unboxed {
            VarKind::Unboxed(native)
        } else {
            VarKind::Local
        };

        let binding = if is_fn_literal {
            let b = self.declare_var(name, kind.clone(), is_const);
            Some(b)
        } else {
            None
        };

        let val = match value {
            Some(e) => self.emit_expr(e),
            None => CVal::boxed("hml_val_null()".to_owned(), false),
        };

        let binding = binding.unwrap_or_else(|| self.declare_var(name, kind, is_const));

        match &binding.kind {
            VarKind::Unboxed(native) => {
                let native = *native;
                let code = self.native_code(&val, native);
                let c_name = binding.c_name.clone();
                self.cur()
                    .decls
                    .push(format!("{} {c_name} = 0;", abi::c_type(native)));
                self.line(&format!("{c_name} = {code};"));
            }
            VarKind::EnvSlot(slot) => {
                let slot = *slot;
                let code = self.boxed_code(&val);
                let env = self.cur_ref().env_expr().to_owned();
                self.line(&format!("hml_env_set({env}, 0, {slot}, {code});"));
            }
            VarKind::Local | VarKind::ExternFn { .. } => {
                let c_name = binding.c_name.clone();
                self.cur()
                    .decls
                    .push(format!("{} {c_name} = hml_val_null();", abi::VALUE));
                let boxed = CVal::boxed(self.boxed_code(&val), val.owned);
                let code = self.take_owned(&boxed);
                self.line(&format!("hml_release({c_name});"));
                self.line(&format!("{c_name} = {code};"));
            }
        }

        // Typed object declarations stamp and validate the shape.
        if let Some(TypeExpr {
            kind: TypeKind::CustomObject(type_name),
            ..
        }) = ty
        {
            self.emit_stamp(name, *type_name);
        }
    }

    /// Emits shape validation for `let x: Point = …`.
    fn emit_stamp(&mut self, var: StringId, type_name: StringId) {
        let Some(shape) = self.shapes.get(&type_name).cloned() else {
            return;
        };
        let type_text = c_escape(self.text(type_name));
        let target = self.emit_ident_read(var);
        let target_code = target.code.clone();
        for field in &shape {
            let fname = c_escape(self.text(field.name));
            if let Some(default) = &field.default {
                self.line(&format!(
                    "if (!hml_object_has({target_code}, \"{fname}\")) {{"
                ));
                self.cur().indent += 1;
                let mark = self.temp_mark();
                let v = self.emit_expr(default);
                let code = self.boxed_code(&v);
                self.line(&format!("hml_object_set({target_code}, \"{fname}\", {code});"));
                self.release_temps_since(mark, None);
                self.cur().indent -= 1;
                self.line("}");
            } else if field.optional {
                self.line(&format!(
                    "if (!hml_object_has({target_code}, \"{fname}\")) hml_object_set({target_code}, \"{fname}\", hml_val_null());"
                ));
            } else {
                self.line(&format!(
                    "hml_object_require({target_code}, \"{type_text}\", \"{fname}\");"
                ));
                self.exc_check();
            }
        }
        self.line(&format!("hml_object_stamp({target_code}, \"{type_text}\");"));
        self.exc_check();
    }

    fn emit_enum(&mut self, name: StringId, variants: &[EnumVariant]) {
        let fn_id = self.cur_ref().fn_id;
        let captured = self.closures.is_captured(fn_id, name);
        let kind = if captured {
            VarKind::EnvSlot(
                self.closures
                    .slot_of(fn_id, name)
                    .expect("captured names have slots"),
            )
        } else {
            VarKind::Local
        };
        let binding = self.declare_var(name, kind, true);

        // Build the variant object in a staging slot, then store it where
        // the binding lives.
        let staging = match &binding.kind {
            VarKind::EnvSlot(_) => self.fresh_tmp(),
            _ => {
                let c_name = binding.c_name.clone();
                self.cur()
                    .decls
                    .push(format!("{} {c_name} = hml_val_null();", abi::VALUE));
                c_name
            }
        };
        self.line(&format!("hml_release({staging});"));
        self.line(&format!("{staging} = hml_object_new();"));
        let mut next: i64 = 0;
        for variant in variants {
            let value = match &variant.value {
                Some(e) => match const_int(e) {
                    Some(v) => v,
                    None => {
                        self.error("enum variant value must be an integer constant");
                        next
                    }
                },
                None => next,
            };
            next = value.wrapping_add(1);
            let vname = c_escape(self.text(variant.name));
            self.line(&format!(
                "hml_object_set({staging}, \"{vname}\", hml_val_i32({value}));"
            ));
        }
        let type_text = c_escape(self.text(name));
        self.line(&format!("hml_object_stamp({staging}, \"{type_text}\");"));
        if let VarKind::EnvSlot(slot) = binding.kind {
            let env = self.cur_ref().env_expr().to_owned();
            self.line(&format!("hml_env_set({env}, 0, {slot}, {staging});"));
            self.line(&format!("hml_release({staging});"));
            self.line(&format!("{staging} = hml_val_null();"));
        }
    }

    fn emit_import(&mut self, import: &ImportStmt) {
        let path = self.text(import.module_path).to_owned();
        if import.is_namespace {
            if let Some(ns) = import.namespace_name {
                let symbol = mangle_imported(&path, "namespace");
                self.add_extern(&symbol);
                self.imports.insert(ns, symbol);
            }
        }
        for name in &import.names {
            let symbol = mangle_imported(&path, self.text(name.original));
            self.add_extern(&symbol);
            let binding = name.alias.unwrap_or(name.original);
            self.imports.insert(binding, symbol);
        }
    }

    fn add_extern(&mut self, symbol: &str) {
        if self.emitted_externs.insert(symbol.to_owned()) {
            self.extern_decls
                .push_str(&format!("extern {} {symbol};\n", abi::VALUE));
        }
    }

    fn emit_extern_fn(&mut self, name: StringId, param_types: &[TypeExpr], return_type: &TypeExpr) {
        let mut params = Vec::new();
        for ty in param_types {
            match native_of_annotation(ty) {
                Some(native) => params.push(native),
                None => {
                    self.error("extern fn parameters must be primitive types");
                    return;
                }
            }
        }
        let ret = if matches!(return_type.kind, TypeKind::Void) {
            None
        } else {
            match native_of_annotation(return_type) {
                Some(native) => Some(native),
                None => {
                    self.error("extern fn return type must be primitive or void");
                    return;
                }
            }
        };
        let c_name = mangle(self.text(name));
        let ret_c = ret.map_or("void", abi::c_type);
        let params_c = if params.is_empty() {
            "void".to_owned()
        } else {
            params
                .iter()
                .map(|p| abi::c_type(*p))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let proto = format!("extern {ret_c} {c_name}({params_c});\n");
        if self.emitted_externs.insert(proto.clone()) {
            self.extern_decls.push_str(&proto);
        }
        self.declare_var(name, VarKind::ExternFn { params, ret }, true);
    }

    fn emit_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&ExprLoc>,
        step: Option<&ExprLoc>,
        body: &[Stmt],
    ) {
        self.cur().scopes.push(AHashMap::new());
        self.line("{");
        self.cur().indent += 1;
        if let Some(init) = init {
            self.emit_stmt(init);
        }
        let start = self.fresh_label("Lf");
        let cont = self.fresh_label("Lc");
        let brk = self.fresh_label("Lbrk");
        self.label_line(&start);
        if let Some(cond) = cond {
            let mark = self.temp_mark();
            let c = self.emit_expr(cond);
            let guard = self.truthy_code(&c);
            self.release_temps_since(mark, None);
            self.line(&format!("if (!({guard})) goto {brk};"));
        }
        self.cur().ctl_stack.push(Ctl::Loop {
            break_label: brk.clone(),
            continue_label: cont.clone(),
        });
        self.line("{");
        self.cur().indent += 1;
        self.emit_scope(body);
        self.cur().indent -= 1;
        self.line("}");
        self.cur().ctl_stack.pop();
        self.label_line(&cont);
        if let Some(step) = step {
            let mark = self.temp_mark();
            let v = self.emit_expr(step);
            let _ = v;
            self.release_temps_since(mark, None);
        }
        self.line(&format!("goto {start};"));
        self.label_line(&brk);
        self.cur().indent -= 1;
        self.line("}");
        self.cur().scopes.pop();
    }

    /// Declares a runtime-introduced binding (loop variable, catch
    /// parameter, rest parameter), honoring capture status: a captured
    /// binding lives in the scope's environment, not a C local.
    fn declare_value_var(&mut self, name: StringId) -> VarBinding {
        let fn_id = self.cur_ref().fn_id;
        if self.closures.is_captured(fn_id, name) {
            let slot = self
                .closures
                .slot_of(fn_id, name)
                .expect("captured names have slots");
            self.declare_var(name, VarKind::EnvSlot(slot), false)
        } else {
            let binding = self.declare_var(name, VarKind::Local, false);
            let c_name = binding.c_name.clone();
            self.cur()
                .decls
                .push(format!("{} {c_name} = hml_val_null();", abi::VALUE));
            binding
        }
    }

    /// Stores an owned runtime-produced expression into such a binding.
    fn store_value_var(&mut self, binding: VarBinding, owned_expr: &str) {
        match binding.kind {
            VarKind::EnvSlot(slot) => {
                let staging = self.fresh_tmp();
                self.line(&format!("{staging} = {owned_expr};"));
                let env = self.cur_ref().env_expr().to_owned();
                self.line(&format!("hml_env_set({env}, 0, {slot}, {staging});"));
                self.line(&format!("hml_release({staging});"));
                self.line(&format!("{staging} = hml_val_null();"));
            }
            _ => {
                let c_name = binding.c_name;
                self.line(&format!("hml_release({c_name});"));
                self.line(&format!("{c_name} = {owned_expr};"));
            }
        }
    }

    /// For-in lowering: a counted loop over the runtime iteration accessors
    /// (index loop for arrays/strings/buffers, field-table walk for
    /// objects, both behind `hml_iter_*`).
    fn emit_for_in(
        &mut self,
        key: Option<StringId>,
        value: StringId,
        iterable: &ExprLoc,
        body: &[Stmt],
    ) {
        self.cur().scopes.push(AHashMap::new());
        self.line("{");
        self.cur().indent += 1;

        let iter = self.emit_expr(iterable);
        let boxed = CVal::boxed(self.boxed_code(&iter), iter.owned);
        let it = self.take_owned(&boxed);
        let it_var = self.fresh_tmp();
        self.line(&format!("{it_var} = {it};"));
        let len_var = self.fresh_native(NativeType::I64);
        self.line(&format!("{len_var} = hml_iter_len({it_var});"));
        self.exc_check();

        let idx = self.fresh_native(NativeType::I64);
        self.line(&format!("{idx} = 0;"));

        let key_binding = key.map(|k| self.declare_value_var(k));
        let value_binding = self.declare_value_var(value);

        let start = self.fresh_label("Li");
        let cont = self.fresh_label("Lc");
        let brk = self.fresh_label("Lbrk");
        self.label_line(&start);
        self.line(&format!("if (!({idx} < {len_var})) goto {brk};"));
        if let Some(kb) = &key_binding {
            let code = format!("hml_iter_key({it_var}, {idx})");
            self.store_value_var(kb.clone(), &code);
        }
        let code = format!("hml_iter_val({it_var}, {idx})");
        self.store_value_var(value_binding.clone(), &code);
        self.cur().ctl_stack.push(Ctl::Loop {
            break_label: brk.clone(),
            continue_label: cont.clone(),
        });
        self.line("{");
        self.cur().indent += 1;
        self.emit_scope(body);
        self.cur().indent -= 1;
        self.line("}");
        self.cur().ctl_stack.pop();
        self.label_line(&cont);
        self.line(&format!("{idx}++;"));
        self.line(&format!("goto {start};"));
        self.label_line(&brk);
        self.line(&format!("hml_release({it_var});"));
        self.line(&format!("{it_var} = hml_val_null();"));
        self.cur().indent -= 1;
        self.line("}");
        self.cur().scopes.pop();
    }

    fn emit_return(&mut self, value: Option<&ExprLoc>) {
        // Tail-call lowering: a direct self-call in return position becomes
        // parameter assignment plus a jump to the entry label.
        if let Some(ExprLoc {
            expr: Expr::Call { callee, args },
            ..
        }) = value
            && let Some(entry) = self.cur_ref().tail_entry.clone()
            && let Expr::Ident(name) = &callee.expr
            && self.cur_ref().self_name == Some(*name)
            && args.len() == self.cur_ref().param_c_names.len()
        {
            let mark = self.temp_mark();
            let mut staged = Vec::new();
            for arg in args {
                let v = self.emit_expr(arg);
                let boxed = CVal::boxed(self.boxed_code(&v), v.owned);
                let code = self.take_owned(&boxed);
                let tmp = self.fresh_tmp();
                self.line(&format!("{tmp} = {code};"));
                staged.push(tmp);
            }
            let params = self.cur_ref().param_c_names.clone();
            for (param, tmp) in params.iter().zip(&staged) {
                self.line(&format!("hml_release({param});"));
                self.line(&format!("{param} = {tmp};"));
                self.line(&format!("{tmp} = hml_val_null();"));
            }
            self.release_temps_since(mark, None);
            self.line(&format!("goto {entry};"));
            return;
        }

        let mark = self.temp_mark();
        let code = match value {
            Some(e) => {
                let v = self.emit_expr(e);
                let boxed = CVal::boxed(self.boxed_code(&v), v.owned);
                self.take_owned(&boxed)
            }
            None => "hml_val_null()".to_owned(),
        };
        self.line("if (hml_has_ret) hml_release(hml_ret);");
        self.line(&format!("hml_ret = {code};"));
        self.line("hml_has_ret = 1;");
        self.release_temps_since(mark, None);
        let target = self
            .cur_ref()
            .finally_stack
            .last()
            .map_or_else(|| "hml_done".to_owned(), |f| f.merge_label.clone());
        self.line(&format!("goto {target};"));
    }

    /// Break targets the innermost loop or switch; a staged jump is used
    /// when a `finally` sits between here and the target.
    fn emit_break(&mut self) {
        let target = self.cur_ref().ctl_stack.last().cloned();
        let Some(target) = target else {
            self.error("'break' outside of a loop or switch");
            return;
        };
        // Staging only applies to loop targets; a switch never spans a
        // function's finally boundary in a way its end label cannot reach.
        if matches!(target, Ctl::Loop { .. })
            && let Some(frame) = self.cur_ref().finally_stack.last().cloned()
            && self.break_crosses_finally()
        {
            self.line("hml_jump = 1;");
            self.line(&format!("goto {};", frame.merge_label));
            return;
        }
        let label = match target {
            Ctl::Loop { break_label, .. } => break_label,
            Ctl::Switch { end_label } => end_label,
        };
        self.line(&format!("goto {label};"));
    }

    fn emit_continue(&mut self) {
        let target = self
            .cur_ref()
            .ctl_stack
            .iter()
            .rev()
            .find_map(|c| match c {
                Ctl::Loop { continue_label, .. } => Some(continue_label.clone()),
                Ctl::Switch { .. } => None,
            });
        let Some(label) = target else {
            self.error("'continue' outside of a loop");
            return;
        };
        if let Some(frame) = self.cur_ref().finally_stack.last().cloned()
            && self.break_crosses_finally()
        {
            self.line("hml_jump = 2;");
            self.line(&format!("goto {};", frame.merge_label));
            return;
        }
        self.line(&format!("goto {label};"));
    }

    /// True when the innermost finally-try was entered inside the innermost
    /// loop (so a break/continue must run that finally first).
    fn break_crosses_finally(&self) -> bool {
        let ctx = self.cur_ref();
        let Some(frame) = ctx.finally_stack.last() else {
            return false;
        };
        // The frame recorded the loop labels visible at try entry; if they
        // match the current innermost loop, the loop encloses the try.
        let current = ctx.ctl_stack.iter().rev().find_map(|c| match c {
            Ctl::Loop {
                break_label,
                continue_label,
            } => Some((break_label.clone(), continue_label.clone())),
            Ctl::Switch { .. } => None,
        });
        frame.loop_labels == current && current.is_some()
    }

    fn emit_try(
        &mut self,
        body: &[Stmt],
        catch_param: Option<StringId>,
        catch_block: Option<&[Stmt]>,
        finally_block: Option<&[Stmt]>,
    ) {
        let handler = self.fresh_label("Lh");
        let merge = self.fresh_label("Lm");

        let loop_labels = self.cur_ref().ctl_stack.iter().rev().find_map(|c| match c {
            Ctl::Loop {
                break_label,
                continue_label,
            } => Some((break_label.clone(), continue_label.clone())),
            Ctl::Switch { .. } => None,
        });
        if finally_block.is_some() {
            self.cur().finally_stack.push(FinallyFrame {
                merge_label: merge.clone(),
                loop_labels: loop_labels.clone(),
            });
        }

        // try body: exceptions jump to the handler label.
        self.cur().handler_stack.push(handler.clone());
        self.line("{");
        self.cur().indent += 1;
        self.emit_scope(body);
        self.cur().indent -= 1;
        self.line("}");
        self.cur().handler_stack.pop();
        self.line(&format!("goto {merge};"));

        // handler: abandon any staged return, then run the catch body (its
        // own exceptions fall through to the merge point, so the finally
        // still runs before they propagate).
        self.label_line(&handler);
        self.line("if (hml_has_ret) { hml_release(hml_ret); hml_has_ret = 0; }");
        if let Some(catch_block) = catch_block {
            self.cur().scopes.push(AHashMap::new());
            if let Some(param) = catch_param {
                let binding = self.declare_value_var(param);
                self.store_value_var(binding, "hml_exc_take()");
            } else {
                self.line("hml_release(hml_exc_take());");
            }
            self.cur().handler_stack.push(merge.clone());
            self.line("{");
            self.cur().indent += 1;
            for stmt in catch_block {
                self.emit_stmt(stmt);
            }
            self.cur().indent -= 1;
            self.line("}");
            self.cur().handler_stack.pop();
            self.cur().scopes.pop();
        }

        self.label_line(&merge);

        if let Some(finally_block) = finally_block {
            self.cur().finally_stack.pop();
            // finally body; its own exceptions supersede and propagate via
            // the resolution checks below.
            let after = self.fresh_label("Lq");
            self.cur().handler_stack.push(after.clone());
            self.line("{");
            self.cur().indent += 1;
            self.emit_scope(finally_block);
            self.cur().indent -= 1;
            self.line("}");
            self.cur().handler_stack.pop();
            self.label_line(&after);

            // Resolution: exception first, then staged return, then staged
            // break/continue.
            let outer_handler = self.handler_label();
            self.line(&format!("if (hml_exc_pending()) goto {outer_handler};"));
            let ret_target = self
                .cur_ref()
                .finally_stack
                .last()
                .map_or_else(|| "hml_done".to_owned(), |f| f.merge_label.clone());
            self.line(&format!("if (hml_has_ret) goto {ret_target};"));
            if let Some((brk, cont)) = loop_labels {
                self.line(&format!("if (hml_jump == 1) {{ hml_jump = 0; goto {brk}; }}"));
                self.line(&format!("if (hml_jump == 2) {{ hml_jump = 0; goto {cont}; }}"));
            }
        } else {
            // No finally: an uncaught exception (no catch) or a rethrow from
            // the catch body propagates now.
            let outer_handler = self.handler_label();
            self.line(&format!("if (hml_exc_pending()) goto {outer_handler};"));
        }
    }

    fn emit_switch(&mut self, expr: &ExprLoc, cases: &[SwitchCase]) {
        let end = self.fresh_label("Lse");
        let mark = self.temp_mark();
        let scrutinee = self.emit_expr(expr);

        let all_int = cases
            .iter()
            .all(|c| c.value.as_ref().is_none_or(|v| const_case_key(v).is_some()));

        self.cur().ctl_stack.push(Ctl::Switch {
            end_label: end.clone(),
        });

        if all_int {
            // Integer/rune cases lower to a C switch on the runtime key
            // (non-integer scrutinees produce the sentinel and fall to
            // default, matching equality semantics).
            let code = self.boxed_code(&scrutinee);
            self.line(&format!("switch (hml_switch_key({code})) {{"));
            for case in cases {
                match &case.value {
                    Some(v) => {
                        let key = const_case_key(v).expect("checked all_int");
                        self.line(&format!("case INT64_C({key}): {{"));
                    }
                    None => self.line("default: {"),
                }
                self.cur().indent += 1;
                self.emit_scope(&case.body);
                self.cur().indent -= 1;
                self.line("}");
            }
            self.line("}");
        } else {
            // String or computed cases lower to an if-else dispatch chain
            // followed by the case bodies with fall-through.
            let scrutinee_code = self.boxed_code(&scrutinee);
            let labels: Vec<String> = cases.iter().map(|_| self.fresh_label("Lsc")).collect();
            let mut default_label = end.clone();
            for (case, label) in cases.iter().zip(&labels) {
                match &case.value {
                    Some(value_expr) => {
                        let inner = self.temp_mark();
                        let v = self.emit_expr(value_expr);
                        let v_code = self.boxed_code(&v);
                        let matched = self.fresh_native(NativeType::Bool);
                        self.line(&format!(
                            "{matched} = hml_values_equal({scrutinee_code}, {v_code});"
                        ));
                        self.release_temps_since(inner, None);
                        self.line(&format!("if ({matched}) goto {label};"));
                    }
                    None => default_label = label.clone(),
                }
            }
            self.line(&format!("goto {default_label};"));
            for (case, label) in cases.iter().zip(&labels) {
                self.label_line(label);
                self.line("{");
                self.cur().indent += 1;
                self.emit_scope(&case.body);
                self.cur().indent -= 1;
                self.line("}");
            }
        }

        self.cur().ctl_stack.pop();
        self.label_line(&end);
        self.release_temps_since(mark, None);
    }

    /// `defer call;` captures the call's code as a guarded block that the
    /// epilogue replays in LIFO order on every exit path.
    fn emit_defer(&mut self, call: &ExprLoc) {
        let n = self.cur_ref().defers.len();
        let flag = format!("hml_d{}_{n}", self.cur_ref().fn_id.0);
        self.cur().decls.push(format!("int {flag} = 0;"));
        self.line(&format!("{flag} = 1;"));

        let done = self.fresh_label("Ld");
        let (_, code) = self.capture(|g| {
            g.cur().indent += 1;
            g.line(&format!("if ({flag}) {{"));
            g.cur().indent += 1;
            g.line("int hml_had = hml_exc_pending();");
            g.line(&format!(
                "{} hml_sv = hml_had ? hml_exc_take() : hml_val_null();",
                abi::VALUE
            ));
            g.cur().handler_stack.push(done.clone());
            let mark = g.temp_mark();
            let v = g.emit_expr(call);
            let _ = v;
            g.release_temps_since(mark, None);
            g.cur().handler_stack.pop();
            g.label_line(&done);
            g.line("if (hml_exc_pending()) { if (hml_had) hml_release(hml_sv); }");
            g.line("else if (hml_had) hml_exc_restore(hml_sv);");
            g.cur().indent -= 1;
            g.line("}");
            g.cur().indent -= 1;
        });
        self.cur().defers.push((flag, code));
    }

    // ---- functions -------------------------------------------------------

    /// Emits a function definition and returns its C symbol.
    fn emit_function(&mut self, def: &FunctionDef) -> String {
        let c_name = match def.name {
            Some(name) => format!("hml_fn_{}_{}", def.fn_id.0, mangle(self.text(name))),
            None => format!("hml_fn_{}", def.fn_id.0),
        };
        self.protos.push_str(&format!(
            "static {} {c_name}({} *hml_env_in, {} *hml_args, size_t hml_argc);\n",
            abi::VALUE,
            abi::ENV,
            abi::VALUE
        ));

        let env_size = self.closures.env_size(def.fn_id);
        let has_env = env_size > 0;
        let tail = self.analysis.is_tail_recursive(def.fn_id);

        self.fn_stack.push(FnCtx {
            fn_id: def.fn_id,
            body: String::new(),
            decls: Vec::new(),
            scopes: vec![AHashMap::new()],
            handler_stack: Vec::new(),
            ctl_stack: Vec::new(),
            finally_stack: Vec::new(),
            defers: Vec::new(),
            temps_in_stmt: Vec::new(),
            tail_entry: tail.then(|| "hml_tail_entry".to_owned()),
            self_name: def.name,
            param_c_names: Vec::new(),
            has_env,
            env_var: format!("hml_env{}", def.fn_id.0),
            incoming_env: "hml_env_in".to_owned(),
            indent: 1,
        });

        self.emit_params(def);

        if tail {
            self.label_line("hml_tail_entry");
        }

        for stmt in &def.body {
            self.emit_stmt(stmt);
        }

        let ctx = self.fn_stack.pop().expect("function context");
        let mut out = String::new();
        out.push_str(&format!(
            "static {} {c_name}({} *hml_env_in, {} *hml_args, size_t hml_argc) {{\n",
            abi::VALUE,
            abi::ENV,
            abi::VALUE
        ));
        out.push_str(&format!("    {} hml_ret = hml_val_null();\n", abi::VALUE));
        out.push_str("    int hml_has_ret = 0;\n    int hml_jump = 0;\n");
        out.push_str("    (void)hml_jump; (void)hml_env_in; (void)hml_args; (void)hml_argc;\n");
        for decl in &ctx.decls {
            out.push_str("    ");
            out.push_str(decl);
            out.push('\n');
        }
        if has_env {
            out.push_str(&format!(
                "    {} *{} = hml_env_new(hml_env_in, {env_size});\n",
                abi::ENV,
                ctx.env_var
            ));
        }
        out.push_str(&ctx.body);
        out.push_str("hml_done:;\n");
        out.push_str(&epilogue_defers(&ctx));
        out.push_str(&release_locals(&ctx));
        if has_env {
            out.push_str(&format!("    hml_env_release({});\n", ctx.env_var));
        }
        out.push_str("    if (hml_exc_pending()) { if (hml_has_ret) { hml_release(hml_ret); hml_has_ret = 0; } return hml_val_null(); }\n");
        out.push_str("    if (hml_has_ret) return hml_ret;\n");
        out.push_str("    return hml_val_null();\n}\n\n");
        self.fn_defs.push_str(&out);
        c_name
    }

    /// Binds parameters: required arity checks, defaults, the rest array,
    /// and env moves for captured parameters.
    fn emit_params(&mut self, def: &FunctionDef) {
        let fn_name = def
            .name
            .map_or_else(|| "<anonymous>".to_owned(), |n| self.text(n).to_owned());
        let n_params = def.params.len();
        if def.rest.is_none() {
            self.line(&format!(
                "if (hml_argc > {n_params}) {{ hml_throw_arity(\"{}\", {n_params}, hml_argc); goto hml_done; }}",
                c_escape(&fn_name)
            ));
        }
        for (i, param) in def.params.iter().enumerate() {
            self.emit_one_param(i, param, &fn_name, def.fn_id);
        }
        if let Some(rest) = &def.rest {
            let binding = self.declare_value_var(rest.name);
            let code = format!("hml_args_rest(hml_args, hml_argc, {n_params})");
            self.store_value_var(binding, &code);
        }
    }

    fn emit_one_param(&mut self, i: usize, param: &Param, fn_name: &str, fn_id: FunctionId) {
        let captured = self.closures.is_captured(fn_id, param.name);
        let kind = if captured {
            VarKind::EnvSlot(
                self.closures
                    .slot_of(fn_id, param.name)
                    .expect("captured names have slots"),
            )
        } else {
            VarKind::Local
        };
        let binding = self.declare_var(param.name, kind, false);

        // Materialize the argument (or default) into a local first.
        let staging = if captured {
            self.fresh_tmp()
        } else {
            let c_name = binding.c_name.clone();
            self.cur()
                .decls
                .push(format!("{} {c_name} = hml_val_null();", abi::VALUE));
            c_name
        };
        match &param.default {
            Some(default) => {
                self.line(&format!("if (hml_argc > {i}) {{"));
                self.cur().indent += 1;
                self.line(&format!("hml_release({staging});"));
                self.line(&format!("{staging} = hml_arg(hml_args, hml_argc, {i});"));
                self.cur().indent -= 1;
                self.line("} else {");
                self.cur().indent += 1;
                let mark = self.temp_mark();
                let v = self.emit_expr(default);
                let boxed = CVal::boxed(self.boxed_code(&v), v.owned);
                let code = self.take_owned(&boxed);
                self.line(&format!("hml_release({staging});"));
                self.line(&format!("{staging} = {code};"));
                self.release_temps_since(mark, None);
                self.cur().indent -= 1;
                self.line("}");
            }
            None => {
                let name_text = c_escape(self.text(param.name));
                self.line(&format!(
                    "if (hml_argc <= {i}) {{ hml_throw_missing_arg(\"{}\", \"{name_text}\"); goto hml_done; }}",
                    c_escape(fn_name)
                ));
                self.line(&format!("hml_release({staging});"));
                self.line(&format!("{staging} = hml_arg(hml_args, hml_argc, {i});"));
            }
        }
        if captured {
            let VarKind::EnvSlot(slot) = binding.kind else {
                unreachable!("captured param binds an env slot");
            };
            let env = self.cur_ref().env_expr().to_owned();
            self.line(&format!("hml_env_set({env}, 0, {slot}, {staging});"));
            self.line(&format!("hml_release({staging});"));
            self.line(&format!("{staging} = hml_val_null();"));
        } else {
            self.cur().param_c_names.push(staging);
        }
    }

    // ---- expressions -----------------------------------------------------

    fn emit_expr(&mut self, e: &ExprLoc) -> CVal {
        self.current_line = e.position.line;
        match &e.expr {
            Expr::Number {
                int_value,
                float_value,
                is_float,
            } => {
                if *is_float {
                    let mut buffer = ryu::Buffer::new();
                    CVal::native(buffer.format(*float_value).to_owned(), NativeType::F64)
                } else {
                    CVal::native(format!("INT64_C({int_value})"), NativeType::I64)
                }
            }
            Expr::Bool(b) => CVal::native(if *b { "true" } else { "false" }.to_owned(), NativeType::Bool),
            Expr::Null => CVal::boxed("hml_val_null()".to_owned(), false),
            Expr::Rune(c) => CVal::boxed(format!("hml_val_rune({})", u32::from(*c)), false),
            Expr::Str(id) => {
                let text = self.program.interns.get(*id).to_owned();
                let tmp = self.fresh_tmp();
                self.line(&format!(
                    "{tmp} = hml_str_new(\"{}\", {});",
                    c_escape(&text),
                    text.len()
                ));
                self.note_owned(&tmp);
                CVal::boxed(tmp, true)
            }
            Expr::Ident(name) => self.emit_ident_read(*name),
            Expr::Binary { op, left, right } => self.emit_binary(*op, left, right),
            Expr::Unary { op, operand } => self.emit_unary(*op, operand),
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let c = self.emit_expr(cond);
                let guard = self.truthy_code(&c);
                let result = self.fresh_tmp();
                self.line(&format!("if ({guard}) {{"));
                self.cur().indent += 1;
                let mark = self.temp_mark();
                let t = self.emit_expr(then_expr);
                let boxed = CVal::boxed(self.boxed_code(&t), t.owned);
                let code = self.take_owned(&boxed);
                self.line(&format!("{result} = {code};"));
                self.release_temps_since(mark, None);
                self.cur().indent -= 1;
                self.line("} else {");
                self.cur().indent += 1;
                let mark = self.temp_mark();
                let f = self.emit_expr(else_expr);
                let boxed = CVal::boxed(self.boxed_code(&f), f.owned);
                let code = self.take_owned(&boxed);
                self.line(&format!("{result} = {code};"));
                self.release_temps_since(mark, None);
                self.cur().indent -= 1;
                self.line("}");
                self.note_owned(&result);
                CVal::boxed(result, true)
            }
            Expr::NullCoalesce { left, right } => {
                let l = self.emit_expr(left);
                let l_boxed = CVal::boxed(self.boxed_code(&l), l.owned);
                let l_code = self.take_owned(&l_boxed);
                let result = self.fresh_tmp();
                self.line(&format!("{result} = {l_code};"));
                self.line(&format!("if (hml_is_null({result})) {{"));
                self.cur().indent += 1;
                let mark = self.temp_mark();
                let r = self.emit_expr(right);
                let boxed = CVal::boxed(self.boxed_code(&r), r.owned);
                let code = self.take_owned(&boxed);
                self.line(&format!("hml_release({result});"));
                self.line(&format!("{result} = {code};"));
                self.release_temps_since(mark, None);
                self.cur().indent -= 1;
                self.line("}");
                self.note_owned(&result);
                CVal::boxed(result, true)
            }
            Expr::Call { callee, args } => self.emit_call(callee, args),
            Expr::Assign { name, value } => self.emit_assign(*name, value),
            Expr::GetProp { object, name } => {
                let obj = self.emit_expr(object);
                let obj_code = self.boxed_code(&obj);
                let tmp = self.fresh_tmp();
                let prop = c_escape(self.text(*name));
                self.line(&format!("{tmp} = hml_prop_get({obj_code}, \"{prop}\");"));
                self.exc_check();
                self.note_owned(&tmp);
                CVal::boxed(tmp, true)
            }
            Expr::OptionalChain { object, name } => {
                let obj = self.emit_expr(object);
                let obj_code = self.boxed_code(&obj);
                let tmp = self.fresh_tmp();
                let prop = c_escape(self.text(*name));
                self.line(&format!("if (hml_is_null({obj_code})) {{"));
                self.cur().indent += 1;
                self.line(&format!("{tmp} = hml_val_null();"));
                self.cur().indent -= 1;
                self.line("} else {");
                self.cur().indent += 1;
                self.line(&format!("{tmp} = hml_prop_get({obj_code}, \"{prop}\");"));
                self.exc_check();
                self.cur().indent -= 1;
                self.line("}");
                self.note_owned(&tmp);
                CVal::boxed(tmp, true)
            }
            Expr::SetProp {
                object,
                name,
                value,
            } => {
                let obj = self.emit_expr(object);
                let obj_code = self.boxed_code(&obj);
                let v = self.emit_expr(value);
                let v_code = self.boxed_code(&v);
                let prop = c_escape(self.text(*name));
                self.line(&format!(
                    "hml_prop_set({obj_code}, \"{prop}\", {v_code});"
                ));
                self.exc_check();
                v
            }
            Expr::Index { object, index } => {
                let obj = self.emit_expr(object);
                let obj_code = self.boxed_code(&obj);
                let idx = self.emit_expr(index);
                let idx_code = self.boxed_code(&idx);
                let tmp = self.fresh_tmp();
                self.line(&format!("{tmp} = hml_index_get({obj_code}, {idx_code});"));
                self.exc_check();
                self.note_owned(&tmp);
                CVal::boxed(tmp, true)
            }
            Expr::IndexAssign {
                object,
                index,
                value,
            } => {
                let obj = self.emit_expr(object);
                let obj_code = self.boxed_code(&obj);
                let idx = self.emit_expr(index);
                let idx_code = self.boxed_code(&idx);
                let v = self.emit_expr(value);
                let v_code = self.boxed_code(&v);
                self.line(&format!(
                    "hml_index_set({obj_code}, {idx_code}, {v_code});"
                ));
                self.exc_check();
                v
            }
            Expr::Function(def) => {
                let c_name = self.emit_function(def);
                let env = self.cur_ref().env_expr().to_owned();
                let tmp = self.fresh_tmp();
                self.line(&format!("{tmp} = hml_closure_new({c_name}, {env});"));
                self.note_owned(&tmp);
                CVal::boxed(tmp, true)
            }
            Expr::ArrayLit(elements) => {
                let tmp = self.fresh_tmp();
                self.line(&format!("{tmp} = hml_array_new({});", elements.len()));
                self.note_owned(&tmp);
                for element in elements {
                    let mark = self.temp_mark();
                    let v = self.emit_expr(element);
                    let code = self.boxed_code(&v);
                    self.line(&format!("hml_array_push({tmp}, {code});"));
                    self.release_temps_since(mark, None);
                }
                CVal::boxed(tmp, true)
            }
            Expr::ObjectLit { fields } => {
                let tmp = self.fresh_tmp();
                self.line(&format!("{tmp} = hml_object_new();"));
                self.note_owned(&tmp);
                for (name, value) in fields {
                    let mark = self.temp_mark();
                    let v = self.emit_expr(value);
                    let code = self.boxed_code(&v);
                    let field = c_escape(self.text(*name));
                    self.line(&format!("hml_object_set({tmp}, \"{field}\", {code});"));
                    self.release_temps_since(mark, None);
                }
                CVal::boxed(tmp, true)
            }
            Expr::PrefixIncDec { op, target } => self.emit_inc_dec(*op, target, true),
            Expr::PostfixIncDec { op, target } => self.emit_inc_dec(*op, target, false),
            Expr::Await(operand) => {
                // `await` routes through the runtime's task primitive; the
                // call may suspend at exactly this position.
                let v = self.emit_expr(operand);
                let code = self.boxed_code(&v);
                let tmp = self.fresh_tmp();
                self.line(&format!("{tmp} = hml_await({code});"));
                self.exc_check();
                self.note_owned(&tmp);
                CVal::boxed(tmp, true)
            }
            Expr::Interp { strings, exprs } => {
                let tmp = self.fresh_tmp();
                let first = self.program.interns.get(strings[0]).to_owned();
                self.line(&format!(
                    "{tmp} = hml_str_new(\"{}\", {});",
                    c_escape(&first),
                    first.len()
                ));
                self.note_owned(&tmp);
                for (i, expr) in exprs.iter().enumerate() {
                    let mark = self.temp_mark();
                    let v = self.emit_expr(expr);
                    let code = self.boxed_code(&v);
                    self.line(&format!("{tmp} = hml_strcat_consume({tmp}, {code});"));
                    self.release_temps_since(mark, None);
                    let lit = self.program.interns.get(strings[i + 1]).to_owned();
                    if !lit.is_empty() {
                        self.line(&format!(
                            "{tmp} = hml_strcat_lit({tmp}, \"{}\", {});",
                            c_escape(&lit),
                            lit.len()
                        ));
                    }
                }
                CVal::boxed(tmp, true)
            }
        }
    }

    fn emit_ident_read(&mut self, name: StringId) -> CVal {
        match self.resolve(name) {
            Resolved::Binding(binding) => match binding.kind {
                VarKind::Unboxed(native) => CVal::native(binding.c_name, native),
                VarKind::Local => CVal::boxed(binding.c_name, false),
                VarKind::EnvSlot(slot) => {
                    let env = self.cur_ref().env_expr().to_owned();
                    let tmp = self.fresh_tmp();
                    self.line(&format!("{tmp} = hml_env_get({env}, 0, {slot});"));
                    self.note_owned(&tmp);
                    CVal::boxed(tmp, true)
                }
                VarKind::ExternFn { .. } => {
                    self.error("extern fn can only be called, not read as a value");
                    CVal::boxed("hml_val_null()".to_owned(), false)
                }
            },
            Resolved::Outer { up, slot, .. } => {
                let env = self.cur_ref().env_expr().to_owned();
                let tmp = self.fresh_tmp();
                self.line(&format!("{tmp} = hml_env_get({env}, {up}, {slot});"));
                self.note_owned(&tmp);
                CVal::boxed(tmp, true)
            }
            Resolved::Import(symbol) => CVal::boxed(symbol, false),
            Resolved::Builtin(builtin) => {
                CVal::boxed(format!("hml_builtin_ref({})", abi::builtin_code(builtin)), false)
            }
            Resolved::Undefined => {
                let text = c_escape(self.program.interns.get(name));
                let tmp = self.fresh_tmp();
                self.line(&format!("{tmp} = hml_undefined_var(\"{text}\");"));
                self.exc_check();
                self.note_owned(&tmp);
                CVal::boxed(tmp, true)
            }
        }
    }

    fn emit_assign(&mut self, name: StringId, value: &ExprLoc) -> CVal {
        let v = self.emit_expr(value);
        match self.resolve(name) {
            Resolved::Binding(binding) => {
                if binding.is_const {
                    let text = self.text(name).to_owned();
                    self.error(format!("cannot assign to constant '{text}'"));
                }
                match binding.kind {
                    VarKind::Unboxed(native) => {
                        let code = self.native_code(&v, native);
                        let c_name = binding.c_name.clone();
                        self.line(&format!("{c_name} = {code};"));
                        CVal::native(c_name, native)
                    }
                    VarKind::Local => {
                        let boxed = CVal::boxed(self.boxed_code(&v), v.owned);
                        let code = self.take_owned(&boxed);
                        let c_name = binding.c_name.clone();
                        self.line(&format!("hml_release({c_name});"));
                        self.line(&format!("{c_name} = {code};"));
                        CVal::boxed(c_name, false)
                    }
                    VarKind::EnvSlot(slot) => {
                        let code = self.boxed_code(&v);
                        let env = self.cur_ref().env_expr().to_owned();
                        self.line(&format!("hml_env_set({env}, 0, {slot}, {code});"));
                        v
                    }
                    VarKind::ExternFn { .. } => {
                        self.error("cannot assign to an extern fn");
                        v
                    }
                }
            }
            Resolved::Outer { up, slot, is_const } => {
                if is_const {
                    let text = self.text(name).to_owned();
                    self.error(format!("cannot assign to constant '{text}'"));
                }
                let code = self.boxed_code(&v);
                let env = self.cur_ref().env_expr().to_owned();
                self.line(&format!("hml_env_set({env}, {up}, {slot}, {code});"));
                v
            }
            Resolved::Import(_) | Resolved::Builtin(_) => {
                let text = self.text(name).to_owned();
                self.error(format!("cannot assign to imported or builtin name '{text}'"));
                v
            }
            Resolved::Undefined => {
                // Implicit definition in the current scope; a definition
                // later captured by a closure lives in the environment.
                let fn_id = self.cur_ref().fn_id;
                if self.closures.is_captured(fn_id, name) {
                    let slot = self
                        .closures
                        .slot_of(fn_id, name)
                        .expect("captured names have slots");
                    self.declare_var(name, VarKind::EnvSlot(slot), false);
                    let code = self.boxed_code(&v);
                    let env = self.cur_ref().env_expr().to_owned();
                    self.line(&format!("hml_env_set({env}, 0, {slot}, {code});"));
                    return v;
                }
                let binding = self.declare_var(name, VarKind::Local, false);
                let c_name = binding.c_name.clone();
                self.cur()
                    .decls
                    .push(format!("{} {c_name} = hml_val_null();", abi::VALUE));
                let boxed = CVal::boxed(self.boxed_code(&v), v.owned);
                let code = self.take_owned(&boxed);
                self.line(&format!("hml_release({c_name});"));
                self.line(&format!("{c_name} = {code};"));
                CVal::boxed(c_name, false)
            }
        }
    }

    fn emit_binary(&mut self, op: BinaryOp, left: &ExprLoc, right: &ExprLoc) -> CVal {
        // Short-circuit: the right operand only evaluates when the left's
        // truthiness does not decide the result; the value semantics pick
        // whichever operand decided.
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let l = self.emit_expr(left);
            let l_boxed = CVal::boxed(self.boxed_code(&l), l.owned);
            let l_code = self.take_owned(&l_boxed);
            let result = self.fresh_tmp();
            self.line(&format!("{result} = {l_code};"));
            let cond = if op == BinaryOp::And {
                format!("hml_truthy({result})")
            } else {
                format!("!hml_truthy({result})")
            };
            self.line(&format!("if ({cond}) {{"));
            self.cur().indent += 1;
            let mark = self.temp_mark();
            let r = self.emit_expr(right);
            let boxed = CVal::boxed(self.boxed_code(&r), r.owned);
            let code = self.take_owned(&boxed);
            self.line(&format!("hml_release({result});"));
            self.line(&format!("{result} = {code};"));
            self.release_temps_since(mark, None);
            self.cur().indent -= 1;
            self.line("}");
            self.note_owned(&result);
            return CVal::boxed(result, true);
        }

        let l = self.emit_expr(left);
        let r = self.emit_expr(right);

        // Native fast path when both operands are unboxed numerics.
        if let (Repr::Native(lt), Repr::Native(rt)) = (l.repr, r.repr)
            && !matches!(lt, NativeType::Bool)
            && !matches!(rt, NativeType::Bool)
        {
            if let Some(native) = self.emit_native_binary(op, &l, lt, &r, rt) {
                return native;
            }
        }

        let l_code = self.boxed_code(&l);
        let r_code = self.boxed_code(&r);
        let tmp = self.fresh_tmp();
        self.line(&format!(
            "{tmp} = hml_binop({}, {l_code}, {r_code});",
            abi::binop_code(op)
        ));
        self.exc_check();
        self.note_owned(&tmp);
        CVal::boxed(tmp, true)
    }

    /// Native operator emission; `None` falls back to the boxed intrinsic.
    fn emit_native_binary(
        &mut self,
        op: BinaryOp,
        l: &CVal,
        lt: NativeType,
        r: &CVal,
        rt: NativeType,
    ) -> Option<CVal> {
        let promoted = promote_native(lt, rt);
        let float = promoted.is_float();
        // Comparisons cast both sides to the promoted type, so same-sign
        // unsigned pairs compare unsigned.
        let cmp_cast = if float { "double" } else { abi::c_type(promoted) };
        if op.is_comparison() {
            let c_op: &str = op.into();
            return Some(CVal::native(
                format!(
                    "(({cmp_cast})({}) {c_op} ({cmp_cast})({}))",
                    l.code, r.code
                ),
                NativeType::Bool,
            ));
        }
        match op {
            BinaryOp::Div => {
                let code = if float {
                    format!("((double)({}) / (double)({}))", l.code, r.code)
                } else {
                    let tmp = self.fresh_native(NativeType::F64);
                    self.line(&format!(
                        "{tmp} = hml_div_i64((int64_t)({}), (int64_t)({}));",
                        l.code, r.code
                    ));
                    self.exc_check();
                    tmp
                };
                Some(CVal::native(code, NativeType::F64))
            }
            BinaryOp::Mod => {
                if float {
                    Some(CVal::native(
                        format!("fmod((double)({}), (double)({}))", l.code, r.code),
                        promoted,
                    ))
                } else {
                    let tmp = self.fresh_native(NativeType::I64);
                    self.line(&format!(
                        "{tmp} = hml_mod_i64((int64_t)({}), (int64_t)({}));",
                        l.code, r.code
                    ));
                    self.exc_check();
                    Some(CVal::native(
                        format!("({})({tmp})", abi::c_type(promoted)),
                        promoted,
                    ))
                }
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
                if float {
                    let c_op: &str = op.into();
                    Some(CVal::native(
                        format!("((double)({}) {c_op} (double)({}))", l.code, r.code),
                        promoted,
                    ))
                } else {
                    let helper = abi::native_arith_helper(op, false).expect("int helper exists");
                    Some(CVal::native(
                        format!(
                            "({})({helper}((int64_t)({}), (int64_t)({})))",
                            abi::c_type(promoted),
                            l.code,
                            r.code
                        ),
                        promoted,
                    ))
                }
            }
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
                if float {
                    return None;
                }
                let c_op: &str = op.into();
                Some(CVal::native(
                    format!(
                        "({})((int64_t)({}) {c_op} (int64_t)({}))",
                        abi::c_type(promoted),
                        l.code,
                        r.code
                    ),
                    promoted,
                ))
            }
            BinaryOp::Shl | BinaryOp::Shr => {
                if float {
                    return None;
                }
                let helper = abi::native_arith_helper(op, false).expect("shift helper exists");
                Some(CVal::native(
                    format!(
                        "({})({helper}((int64_t)({}), (int64_t)({})))",
                        abi::c_type(promoted),
                        l.code,
                        r.code
                    ),
                    promoted,
                ))
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let c_op: &str = op.into();
                Some(CVal::native(
                    format!(
                        "(({cmp_cast})({}) {c_op} ({cmp_cast})({}))",
                        l.code, r.code
                    ),
                    NativeType::Bool,
                ))
            }
            _ => None,
        }
    }

    fn emit_unary(&mut self, op: UnaryOp, operand: &ExprLoc) -> CVal {
        let v = self.emit_expr(operand);
        if let Repr::Native(ty) = v.repr {
            match op {
                UnaryOp::Not => {
                    let guard = self.truthy_code(&v);
                    return CVal::native(format!("(!({guard}))"), NativeType::Bool);
                }
                UnaryOp::Neg if ty != NativeType::Bool => {
                    if ty.is_float() {
                        return CVal::native(format!("(-({}))", v.code), ty);
                    }
                    return CVal::native(
                        format!("({})(hml_neg_i64((int64_t)({})))", abi::c_type(ty), v.code),
                        ty,
                    );
                }
                UnaryOp::BitNot if !ty.is_float() && ty != NativeType::Bool => {
                    return CVal::native(
                        format!("({})(~(int64_t)({}))", abi::c_type(ty), v.code),
                        ty,
                    );
                }
                _ => {}
            }
        }
        let code = self.boxed_code(&v);
        let tmp = self.fresh_tmp();
        self.line(&format!(
            "{tmp} = hml_unop({}, {code});",
            abi::unop_code(op)
        ));
        self.exc_check();
        self.note_owned(&tmp);
        CVal::boxed(tmp, true)
    }

    fn emit_inc_dec(&mut self, op: IncDec, target: &ExprLoc, prefix: bool) -> CVal {
        let delta: i64 = match op {
            IncDec::Inc => 1,
            IncDec::Dec => -1,
        };
        if let Expr::Ident(name) = &target.expr {
            // Unboxed counters take the native path, the common case for
            // loop counters.
            if let Resolved::Binding(binding) = self.resolve(*name)
                && let VarKind::Unboxed(native) = binding.kind
                && !native.is_float()
                && native != NativeType::Bool
            {
                let c_name = binding.c_name.clone();
                let c_ty = abi::c_type(native);
                if prefix {
                    self.line(&format!(
                        "{c_name} = ({c_ty})(hml_add_i64((int64_t){c_name}, INT64_C({delta})));"
                    ));
                    return CVal::native(c_name, native);
                }
                let old = self.fresh_native(native);
                self.line(&format!("{old} = {c_name};"));
                self.line(&format!(
                    "{c_name} = ({c_ty})(hml_add_i64((int64_t){c_name}, INT64_C({delta})));"
                ));
                return CVal::native(old, native);
            }
            // Boxed variables go through the runtime increment helper.
            let current = self.emit_ident_read(*name);
            let code = self.boxed_code(&current);
            let new_tmp = self.fresh_tmp();
            self.line(&format!("{new_tmp} = hml_inc_dec({code}, {delta});"));
            self.exc_check();
            self.note_owned(&new_tmp);
            let stored = CVal::boxed(new_tmp.clone(), false);
            let _ = self.emit_store(*name, &stored);
            if prefix {
                return CVal::boxed(new_tmp, true);
            }
            return current;
        }

        // Property and index targets read, adjust, and write back.
        match &target.expr {
            Expr::GetProp { object, name } => {
                let obj = self.emit_expr(object);
                let obj_code = self.boxed_code(&obj);
                let prop = c_escape(self.text(*name));
                let old = self.fresh_tmp();
                self.line(&format!("{old} = hml_prop_get({obj_code}, \"{prop}\");"));
                self.exc_check();
                self.note_owned(&old);
                let new_tmp = self.fresh_tmp();
                self.line(&format!("{new_tmp} = hml_inc_dec({old}, {delta});"));
                self.exc_check();
                self.note_owned(&new_tmp);
                self.line(&format!("hml_prop_set({obj_code}, \"{prop}\", {new_tmp});"));
                self.exc_check();
                CVal::boxed(if prefix { new_tmp } else { old }, true)
            }
            Expr::Index { object, index } => {
                let obj = self.emit_expr(object);
                let obj_code = self.boxed_code(&obj);
                let idx = self.emit_expr(index);
                let idx_code = self.boxed_code(&idx);
                let old = self.fresh_tmp();
                self.line(&format!("{old} = hml_index_get({obj_code}, {idx_code});"));
                self.exc_check();
                self.note_owned(&old);
                let new_tmp = self.fresh_tmp();
                self.line(&format!("{new_tmp} = hml_inc_dec({old}, {delta});"));
                self.exc_check();
                self.note_owned(&new_tmp);
                self.line(&format!(
                    "hml_index_set({obj_code}, {idx_code}, {new_tmp});"
                ));
                self.exc_check();
                CVal::boxed(if prefix { new_tmp } else { old }, true)
            }
            _ => {
                self.error("invalid increment/decrement target");
                CVal::boxed("hml_val_null()".to_owned(), false)
            }
        }
    }

    /// Stores a borrowed boxed value into a resolved variable.
    fn emit_store(&mut self, name: StringId, value: &CVal) -> bool {
        match self.resolve(name) {
            Resolved::Binding(binding) => {
                if binding.is_const {
                    let text = self.text(name).to_owned();
                    self.error(format!("cannot assign to constant '{text}'"));
                }
                match binding.kind {
                    VarKind::Unboxed(native) => {
                        let code = self.native_code(value, native);
                        self.line(&format!("{} = {code};", binding.c_name));
                    }
                    VarKind::Local => {
                        let code = self.boxed_code(value);
                        self.line(&format!("hml_release({});", binding.c_name));
                        self.line(&format!("{} = hml_retain({code});", binding.c_name));
                    }
                    VarKind::EnvSlot(slot) => {
                        let code = self.boxed_code(value);
                        let env = self.cur_ref().env_expr().to_owned();
                        self.line(&format!("hml_env_set({env}, 0, {slot}, {code});"));
                    }
                    VarKind::ExternFn { .. } => {
                        self.error("cannot assign to an extern fn");
                    }
                }
                true
            }
            Resolved::Outer { up, slot, is_const } => {
                if is_const {
                    let text = self.text(name).to_owned();
                    self.error(format!("cannot assign to constant '{text}'"));
                }
                let code = self.boxed_code(value);
                let env = self.cur_ref().env_expr().to_owned();
                self.line(&format!("hml_env_set({env}, {up}, {slot}, {code});"));
                true
            }
            _ => false,
        }
    }

    fn emit_call(&mut self, callee: &ExprLoc, args: &[ExprLoc]) -> CVal {
        // Method-call form dispatches through the runtime on the receiver.
        if let Expr::GetProp { object, name } = &callee.expr {
            let obj = self.emit_expr(object);
            let obj_code = self.boxed_code(&obj);
            let method = c_escape(self.text(*name));
            let argv = self.emit_arg_array(args);
            let tmp = self.fresh_tmp();
            self.line(&format!(
                "{tmp} = hml_method_call({obj_code}, \"{method}\", {}, {});",
                args.len(),
                argv
            ));
            self.exc_check();
            self.note_owned(&tmp);
            return CVal::boxed(tmp, true);
        }

        // Direct builtin and extern calls.
        if let Expr::Ident(name) = &callee.expr {
            match self.resolve(*name) {
                Resolved::Builtin(builtin) => {
                    let argv = self.emit_arg_array(args);
                    let tmp = self.fresh_tmp();
                    self.line(&format!(
                        "{tmp} = hml_builtin_call({}, {}, {});",
                        abi::builtin_code(builtin),
                        args.len(),
                        argv
                    ));
                    self.exc_check();
                    self.note_owned(&tmp);
                    return CVal::boxed(tmp, true);
                }
                Resolved::Binding(binding) => {
                    if let VarKind::ExternFn { params, ret } = binding.kind {
                        return self.emit_extern_call(&binding.c_name, &params, ret, args);
                    }
                }
                _ => {}
            }
        }

        let f = self.emit_expr(callee);
        let f_code = self.boxed_code(&f);
        let argv = self.emit_arg_array(args);
        let tmp = self.fresh_tmp();
        self.line(&format!(
            "{tmp} = hml_call({f_code}, {}, {});",
            args.len(),
            argv
        ));
        self.exc_check();
        self.note_owned(&tmp);
        CVal::boxed(tmp, true)
    }

    /// Evaluates arguments left-to-right into a stack array, returning its
    /// name (or `NULL` for empty argument lists).
    ///
    /// Every argument is snapshotted into a temp at evaluation time, so a
    /// later argument mutating an earlier one cannot change what the call
    /// observes.
    fn emit_arg_array(&mut self, args: &[ExprLoc]) -> String {
        if args.is_empty() {
            return "NULL".to_owned();
        }
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let v = self.emit_expr(arg);
            let boxed = CVal::boxed(self.boxed_code(&v), v.owned);
            let code = self.take_owned(&boxed);
            let tmp = self.fresh_tmp();
            self.line(&format!("{tmp} = {code};"));
            self.note_owned(&tmp);
            values.push(tmp);
        }
        let n = self.tmp_counter;
        self.tmp_counter += 1;
        let name = format!("hml_a{n}");
        self.line(&format!(
            "{} {name}[] = {{ {} }};",
            abi::VALUE,
            values.join(", ")
        ));
        name
    }

    fn emit_extern_call(
        &mut self,
        c_name: &str,
        params: &[NativeType],
        ret: Option<NativeType>,
        args: &[ExprLoc],
    ) -> CVal {
        if args.len() != params.len() {
            self.error(format!(
                "extern fn {c_name} expects {} argument(s), got {}",
                params.len(),
                args.len()
            ));
        }
        let mut arg_codes = Vec::new();
        for (arg, ty) in args.iter().zip(params) {
            let v = self.emit_expr(arg);
            arg_codes.push(self.native_code(&v, *ty));
        }
        let call = format!("{c_name}({})", arg_codes.join(", "));
        match ret {
            Some(native) => {
                let tmp = self.fresh_native(native);
                self.line(&format!("{tmp} = {call};"));
                CVal::native(tmp, native)
            }
            None => {
                self.line(&format!("{call};"));
                CVal::boxed("hml_val_null()".to_owned(), false)
            }
        }
    }
}

/// Emits defer blocks LIFO for the epilogue.
fn epilogue_defers(ctx: &FnCtx) -> String {
    let mut out = String::new();
    for (_, code) in ctx.defers.iter().rev() {
        out.push_str(code);
    }
    out
}

/// Releases every boxed named local (params included) at the epilogue.
///
/// Temporaries are excluded: their ownership either transferred into a
/// named local (which would make an epilogue release a double free) or was
/// released at the end of the statement that produced them.
fn release_locals(ctx: &FnCtx) -> String {
    let mut out = String::new();
    for decl in &ctx.decls {
        // Declarations look like "HmlValue v_x_0 = hml_val_null();".
        if let Some(rest) = decl.strip_prefix(abi::VALUE)
            && let Some(name) = rest.trim_start().split(' ').next()
            && name.starts_with("v_")
        {
            out.push_str(&format!("    hml_release({name});\n"));
        }
    }
    out
}

/// Extracts a compile-time integer from an already-folded expression.
fn const_int(e: &ExprLoc) -> Option<i64> {
    match &e.expr {
        Expr::Number {
            int_value,
            is_float: false,
            ..
        } => Some(*int_value),
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => const_int(operand).map(i64::wrapping_neg),
        _ => None,
    }
}

/// Integer or rune case key for C `switch` lowering.
fn const_case_key(e: &ExprLoc) -> Option<i64> {
    match &e.expr {
        Expr::Rune(c) => Some(i64::from(u32::from(*c))),
        _ => const_int(e),
    }
}

/// Maps a primitive annotation to a native type for FFI signatures.
fn native_of_annotation(ty: &TypeExpr) -> Option<NativeType> {
    if ty.nullable {
        return None;
    }
    match ty.kind {
        TypeKind::I8 => Some(NativeType::I8),
        TypeKind::I16 => Some(NativeType::I16),
        TypeKind::I32 => Some(NativeType::I32),
        TypeKind::I64 => Some(NativeType::I64),
        TypeKind::U8 => Some(NativeType::U8),
        TypeKind::U16 => Some(NativeType::U16),
        TypeKind::U32 => Some(NativeType::U32),
        TypeKind::U64 => Some(NativeType::U64),
        TypeKind::F32 => Some(NativeType::F32),
        TypeKind::F64 => Some(NativeType::F64),
        TypeKind::Bool => Some(NativeType::Bool),
        _ => None,
    }
}
