//! Backend A: the tree-walking interpreter.
//!
//! Evaluation is single-threaded and cooperative within one run: each
//! expression evaluates fully before the next begins. Control flow is
//! expressed natively: `Flow` carries return/break/continue upward as the
//! statement result, and thrown exceptions travel as `Err(RunError::Throw)`
//! so every `?` is the "check the flags after each sub-evaluation" step.
//!
//! Ownership discipline follows the heap contract: every evaluation
//! returns an owned (retained) value, every store retains, and every
//! discarded temporary is released with `drop_with_heap`.

use std::rc::Rc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    ast::{BinaryOp, Expr, ExprLoc, FieldDef, IncDec, Stmt, StmtKind, TypeKind},
    builtins::{Builtin, call_builtin},
    env::{EnvSetOutcome, env_define, env_get, env_new, env_set},
    exception::{Exception, RunError, RunResult, StackFrame, Thrown, ThrownPayload},
    heap::{FunctionValue, Heap, HeapData, HeapId, HeapStats, HmlObject, HmlStr},
    intern::StringId,
    io::PrintWriter,
    optimize::optimize_program,
    parser::{Program, parse},
    resource::ResourceLimits,
    tracer::{ExecTracer, NoopTracer},
    value::{
        Value, binary_op, display_value, inc_dec_value, message_to_value, unary_op,
        value_to_message, values_equal,
    },
};

/// Statement-level control flow.
///
/// `Return` owns its value; whoever consumes a `Flow` is responsible for
/// releasing it.
#[derive(Debug)]
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// One pending `defer`: the cloned call expression and its captured
/// (retained) environment.
#[derive(Debug)]
struct DeferEntry {
    call: ExprLoc,
    env: HeapId,
}

/// One call-stack record, used for stack traces and the depth limit.
#[derive(Debug)]
struct FrameInfo {
    name: String,
}

/// Parses, optimizes, and runs a source buffer in one step.
///
/// Parse failures surface as an [`Exception`] built from the first
/// diagnostic; the caller distinguishes them via [`Exception::frames`]
/// being empty and the CLI maps both to exit code 1.
pub fn run_source<W: PrintWriter>(
    source: &str,
    file_name: &str,
    limits: ResourceLimits,
    writer: &mut W,
) -> Result<(), Exception> {
    let result = parse(source, file_name);
    if !result.diagnostics.is_empty() {
        return Err(Exception::from_diagnostics(file_name, &result.diagnostics));
    }
    let mut program = result.program;
    optimize_program(&mut program);
    run_program(&program, limits, writer)
}

/// Runs a parsed program to completion.
pub fn run_program<W: PrintWriter>(
    program: &Program,
    limits: ResourceLimits,
    writer: &mut W,
) -> Result<(), Exception> {
    let mut interp = Interpreter::new(program, limits, writer, NoopTracer);
    interp.run()
}

/// Backend A entry point, parameterised on output and tracing sinks.
pub struct Interpreter<'a, W: PrintWriter, T: ExecTracer = NoopTracer> {
    program: &'a Program,
    writer: &'a mut W,
    tracer: T,
    limits: ResourceLimits,
    heap: Heap,
    call_stack: Vec<FrameInfo>,
    defer_stacks: Vec<Vec<DeferEntry>>,
    /// `define`d object shapes, keyed by type name text.
    shapes: AHashMap<String, Rc<Vec<FieldDef>>>,
}

impl<'a, W: PrintWriter, T: ExecTracer> Interpreter<'a, W, T> {
    pub fn new(program: &'a Program, limits: ResourceLimits, writer: &'a mut W, tracer: T) -> Self {
        Self {
            program,
            writer,
            tracer,
            limits,
            heap: Heap::new(),
            call_stack: Vec::new(),
            defer_stacks: Vec::new(),
            shapes: AHashMap::new(),
        }
    }

    /// Heap snapshot; after a completed [`Interpreter::run`] the live-object
    /// count must be zero.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Executes the program: top-level statements, then top-level defers,
    /// then cycle breaking and the root release.
    pub fn run(&mut self) -> Result<(), Exception> {
        let root = env_new(&mut self.heap, None);
        self.defer_stacks.push(Vec::new());

        let mut outcome: Result<(), RunError> = Ok(());
        let mut last_line = 0;
        for stmt in &self.program.stmts {
            last_line = stmt.position.line;
            match self.exec_stmt(stmt, root) {
                Ok(Flow::Normal) => {}
                Ok(Flow::Return(value)) => {
                    value.drop_with_heap(&mut self.heap);
                    break;
                }
                Ok(Flow::Break | Flow::Continue) => {
                    outcome = Err(RunError::throw(
                        "break/continue outside of a loop",
                        stmt.position.line,
                    ));
                    break;
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        // Top-level defers run on every exit path.
        let entries = self.defer_stacks.pop().expect("program defer frame");
        let pending = outcome.err();
        let pending = self.run_defer_entries(entries, pending);
        let outcome = match pending {
            Some(err) => Err(err),
            None => Ok(()),
        };

        // Break closure cycles, then release the root environment.
        self.heap.break_cycles(root);
        self.heap.dec_ref(root);

        outcome.map_err(|err| self.into_exception(err, last_line))
    }

    fn into_exception(&mut self, err: RunError, top_line: u32) -> Exception {
        match err {
            RunError::Throw(thrown) => {
                let Thrown {
                    payload,
                    line,
                    mut frames,
                } = *thrown;
                let message = match payload {
                    ThrownPayload::Msg(msg) => msg,
                    ThrownPayload::Val(value) => {
                        let text = display_value(&value, &self.heap, &self.program.interns);
                        value.drop_with_heap(&mut self.heap);
                        text
                    }
                };
                frames.push(StackFrame {
                    function: "<main>".to_owned(),
                    file: self.program.file_name.clone(),
                    line: top_line,
                });
                Exception::new(message, Some((self.program.file_name.clone(), line)), frames)
            }
            RunError::Fatal(fatal) => {
                let frames = self
                    .call_stack
                    .iter()
                    .rev()
                    .map(|frame| StackFrame {
                        function: frame.name.clone(),
                        file: self.program.file_name.clone(),
                        line: top_line,
                    })
                    .collect();
                Exception::fatal(&fatal, frames)
            }
        }
    }

    // ---- statements ------------------------------------------------------

    fn exec_stmts(&mut self, stmts: &[Stmt], env: HeapId) -> RunResult<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    /// Executes statements in a fresh child frame of `env`.
    fn exec_block(&mut self, stmts: &[Stmt], env: HeapId) -> RunResult<Flow> {
        let child = env_new(&mut self.heap, Some(env));
        let flow = self.exec_stmts(stmts, child);
        self.heap.dec_ref(child);
        flow
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: HeapId) -> RunResult<Flow> {
        self.tracer.on_stmt(stmt.position.line);
        let line = stmt.position.line;
        match &stmt.kind {
            StmtKind::Let { name, ty, value } => {
                let v = match value {
                    Some(e) => self.eval_expr(e, env)?,
                    None => Value::Null,
                };
                let v = match ty {
                    Some(ty) => crate::value::coerce_to_annotation(&ty.kind, v),
                    None => v,
                };
                let v = self.stamp_declared_type(ty.as_ref(), v, env, line)?;
                env_define(&mut self.heap, env, *name, v, false);
                Ok(Flow::Normal)
            }
            StmtKind::Const { name, ty, value } => {
                let v = self.eval_expr(value, env)?;
                let v = match ty {
                    Some(ty) => crate::value::coerce_to_annotation(&ty.kind, v),
                    None => v,
                };
                let v = self.stamp_declared_type(ty.as_ref(), v, env, line)?;
                env_define(&mut self.heap, env, *name, v, true);
                Ok(Flow::Normal)
            }
            StmtKind::Expr(e) => {
                let v = self.eval_expr(e, env)?;
                v.drop_with_heap(&mut self.heap);
                Ok(Flow::Normal)
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let c = self.eval_expr(cond, env)?;
                let truthy = c.truthy(&self.heap);
                c.drop_with_heap(&mut self.heap);
                if truthy {
                    self.exec_block(then_block, env)
                } else if let Some(else_block) = else_block {
                    self.exec_block(else_block, env)
                } else {
                    Ok(Flow::Normal)
                }
            }
            StmtKind::While { cond, body } => {
                loop {
                    let c = self.eval_expr(cond, env)?;
                    let truthy = c.truthy(&self.heap);
                    c.drop_with_heap(&mut self.heap);
                    if !truthy {
                        break;
                    }
                    match self.exec_block(body, env)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                let loop_env = env_new(&mut self.heap, Some(env));
                let result = self.exec_for(init.as_deref(), cond.as_ref(), step.as_ref(), body, loop_env);
                self.heap.dec_ref(loop_env);
                result
            }
            StmtKind::ForIn {
                key,
                value,
                iterable,
                body,
            } => {
                let iter = self.eval_expr(iterable, env)?;
                let result = self.exec_for_in(*key, *value, &iter, body, env, line);
                iter.drop_with_heap(&mut self.heap);
                result
            }
            StmtKind::Block(body) => self.exec_block(body, env),
            StmtKind::Return(value) => {
                let v = match value {
                    Some(e) => self.eval_expr(e, env)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(v))
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Throw(e) => {
                let v = self.eval_expr(e, env)?;
                Err(RunError::throw_value(v, line))
            }
            StmtKind::Try {
                body,
                catch_param,
                catch_block,
                finally_block,
            } => self.exec_try(
                body,
                *catch_param,
                catch_block.as_deref(),
                finally_block.as_deref(),
                env,
            ),
            StmtKind::Switch { expr, cases } => self.exec_switch(expr, cases, env),
            StmtKind::Defer(call) => {
                self.heap.inc_ref(env);
                self.defer_stacks
                    .last_mut()
                    .expect("defer frame always present")
                    .push(DeferEntry {
                        call: call.clone(),
                        env,
                    });
                Ok(Flow::Normal)
            }
            StmtKind::Import(import) => Err(RunError::throw(
                format!(
                    "cannot resolve module '{}'",
                    self.program.interns.get(import.module_path)
                ),
                line,
            )),
            StmtKind::ImportFfi { library_path } => Err(RunError::throw(
                format!(
                    "FFI library '{}' is not available in the language core",
                    self.program.interns.get(*library_path)
                ),
                line,
            )),
            StmtKind::ExternFn { name, .. } => Err(RunError::throw(
                format!(
                    "extern fn '{}' requires the FFI runtime",
                    self.program.interns.get(*name)
                ),
                line,
            )),
            StmtKind::Export(crate::ast::ExportStmt::Declaration(decl)) => {
                self.exec_stmt(decl, env)
            }
            StmtKind::Export(crate::ast::ExportStmt::Names { .. }) => Ok(Flow::Normal),
            StmtKind::DefineObject { name, fields } => {
                let key = self.program.interns.get(*name).to_owned();
                self.shapes.insert(key, Rc::new(fields.clone()));
                Ok(Flow::Normal)
            }
            StmtKind::EnumDecl { name, variants } => {
                let mut object = HmlObject {
                    type_name: Some(self.program.interns.get(*name).to_owned()),
                    fields: indexmap::IndexMap::new(),
                };
                let mut next: i64 = 0;
                for variant in variants {
                    let value = match &variant.value {
                        Some(e) => {
                            let v = self.eval_expr(e, env)?;
                            let n = int_value_of(&v);
                            v.drop_with_heap(&mut self.heap);
                            match n {
                                Some(n) => n,
                                None => {
                                    // Release fields gathered so far.
                                    for (_, v) in object.fields {
                                        v.drop_with_heap(&mut self.heap);
                                    }
                                    return Err(RunError::throw(
                                        "enum variant value must be an integer",
                                        line,
                                    ));
                                }
                            }
                        }
                        None => next,
                    };
                    next = value.wrapping_add(1);
                    let vname = self.program.interns.get(variant.name).to_owned();
                    object.fields.insert(vname, Value::I32(value as i32));
                }
                let id = self.heap.allocate(HeapData::Object(object));
                env_define(&mut self.heap, env, *name, Value::Ref(id), true);
                Ok(Flow::Normal)
            }
        }
    }

    fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&ExprLoc>,
        step: Option<&ExprLoc>,
        body: &[Stmt],
        loop_env: HeapId,
    ) -> RunResult<Flow> {
        if let Some(init) = init {
            match self.exec_stmt(init, loop_env)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        loop {
            if let Some(cond) = cond {
                let c = self.eval_expr(cond, loop_env)?;
                let truthy = c.truthy(&self.heap);
                c.drop_with_heap(&mut self.heap);
                if !truthy {
                    break;
                }
            }
            match self.exec_block(body, loop_env)? {
                Flow::Normal | Flow::Continue => {}
                Flow::Break => break,
                ret @ Flow::Return(_) => return Ok(ret),
            }
            if let Some(step) = step {
                let v = self.eval_expr(step, loop_env)?;
                v.drop_with_heap(&mut self.heap);
            }
        }
        Ok(Flow::Normal)
    }

    /// Runs one for-in iteration body, rebinding key/value in the loop's
    /// single scope (the same binding all iterations — and any closures
    /// created in the body — observe, matching the compiled lowering).
    fn run_iteration(
        &mut self,
        key: Option<StringId>,
        key_value: Option<Value>,
        value_name: StringId,
        value: Value,
        body: &[Stmt],
        loop_env: HeapId,
    ) -> RunResult<Flow> {
        if let Some(key) = key {
            let kv = key_value.unwrap_or(Value::Null);
            env_define(&mut self.heap, loop_env, key, kv, false);
        } else if let Some(kv) = key_value {
            kv.drop_with_heap(&mut self.heap);
        }
        env_define(&mut self.heap, loop_env, value_name, value, false);
        self.exec_block(body, loop_env)
    }

    fn exec_for_in(
        &mut self,
        key: Option<StringId>,
        value_name: StringId,
        iter: &Value,
        body: &[Stmt],
        env: HeapId,
        line: u32,
    ) -> RunResult<Flow> {
        let Some(id) = iter.ref_id() else {
            return Err(RunError::throw(
                format!("cannot iterate {}", iter.rt_type(&self.heap)),
                line,
            ));
        };
        let loop_env = env_new(&mut self.heap, Some(env));
        let flow = self.exec_for_in_inner(key, value_name, id, body, loop_env, line);
        self.heap.dec_ref(loop_env);
        flow
    }

    fn exec_for_in_inner(
        &mut self,
        key: Option<StringId>,
        value_name: StringId,
        id: HeapId,
        body: &[Stmt],
        env: HeapId,
        line: u32,
    ) -> RunResult<Flow> {
        match self.heap.get(id) {
            HeapData::Array(_) => {
                let mut index = 0usize;
                loop {
                    let element = {
                        let HeapData::Array(values) = self.heap.get(id) else {
                            break;
                        };
                        if index >= values.len() {
                            break;
                        }
                        values[index].clone_with_heap(&self.heap)
                    };
                    let flow = self.run_iteration(
                        key,
                        Some(Value::I64(index as i64)),
                        value_name,
                        element,
                        body,
                        env,
                    )?;
                    match flow {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                    index += 1;
                }
                Ok(Flow::Normal)
            }
            HeapData::Object(object) => {
                // Snapshot the key order; fields added mid-iteration are
                // not visited, removed ones are skipped.
                let names: Vec<String> = object.fields.keys().cloned().collect();
                for name in names {
                    let element = {
                        let HeapData::Object(object) = self.heap.get(id) else {
                            break;
                        };
                        match object.fields.get(&name) {
                            Some(v) => v.clone_with_heap(&self.heap),
                            None => continue,
                        }
                    };
                    let key_value = if key.is_some() {
                        let sid = self.heap.allocate(HeapData::Str(HmlStr::new(name.clone())));
                        Some(Value::Ref(sid))
                    } else {
                        None
                    };
                    let flow =
                        self.run_iteration(key, key_value, value_name, element, body, env)?;
                    match flow {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            HeapData::Str(s) => {
                let chars: Vec<char> = s.as_str().chars().collect();
                for (i, c) in chars.into_iter().enumerate() {
                    let flow = self.run_iteration(
                        key,
                        Some(Value::I64(i as i64)),
                        value_name,
                        Value::Rune(c),
                        body,
                        env,
                    )?;
                    match flow {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            HeapData::Buffer(bytes) => {
                let bytes = bytes.clone();
                for (i, b) in bytes.into_iter().enumerate() {
                    let flow = self.run_iteration(
                        key,
                        Some(Value::I64(i as i64)),
                        value_name,
                        Value::U8(b),
                        body,
                        env,
                    )?;
                    match flow {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            other => Err(RunError::throw(
                format!("cannot iterate {}", other.variant_name().to_lowercase()),
                line,
            )),
        }
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        catch_param: Option<StringId>,
        catch_block: Option<&[Stmt]>,
        finally_block: Option<&[Stmt]>,
        env: HeapId,
    ) -> RunResult<Flow> {
        let mut outcome = self.exec_block(body, env);

        // The handler captures the exception, clears it, and binds the
        // catch parameter in a fresh child frame.
        if let Some(catch_block) = catch_block {
            outcome = match outcome {
                Err(RunError::Throw(thrown)) => {
                    let catch_env = env_new(&mut self.heap, Some(env));
                    let payload = thrown.payload;
                    if let Some(param) = catch_param {
                        let value = self.materialize_payload(payload);
                        env_define(&mut self.heap, catch_env, param, value, false);
                    } else {
                        self.discard_payload(payload);
                    }
                    let result = self.exec_stmts(catch_block, catch_env);
                    self.heap.dec_ref(catch_env);
                    result
                }
                other => other,
            };
        }

        // finally runs on every exit path and must not swallow an in-flight
        // return or exception unless it returns/throws itself.
        if let Some(finally_block) = finally_block {
            let fin = self.exec_block(finally_block, env);
            match fin {
                Ok(Flow::Normal) => {}
                other => {
                    self.discard_outcome(outcome);
                    outcome = other;
                }
            }
        }
        outcome
    }

    fn exec_switch(
        &mut self,
        expr: &ExprLoc,
        cases: &[crate::ast::SwitchCase],
        env: HeapId,
    ) -> RunResult<Flow> {
        let scrutinee = self.eval_expr(expr, env)?;
        let mut matched = None;
        let mut default_index = None;
        for (i, case) in cases.iter().enumerate() {
            match &case.value {
                None => default_index = Some(i),
                Some(value_expr) => {
                    let v = match self.eval_expr(value_expr, env) {
                        Ok(v) => v,
                        Err(err) => {
                            scrutinee.drop_with_heap(&mut self.heap);
                            return Err(err);
                        }
                    };
                    let equal = values_equal(&scrutinee, &v, &self.heap);
                    v.drop_with_heap(&mut self.heap);
                    if equal {
                        matched = Some(i);
                        break;
                    }
                }
            }
        }
        scrutinee.drop_with_heap(&mut self.heap);

        let Some(start) = matched.or(default_index) else {
            return Ok(Flow::Normal);
        };
        // Execution falls through case bodies until a break.
        for case in &cases[start..] {
            match self.exec_block(&case.body, env)? {
                Flow::Normal => {}
                Flow::Break => return Ok(Flow::Normal),
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    /// Applies a `define`d shape when a declaration is annotated with a
    /// custom object type: validates fields, fills defaults, and stamps the
    /// instance with its type name.
    fn stamp_declared_type(
        &mut self,
        ty: Option<&crate::ast::TypeExpr>,
        value: Value,
        env: HeapId,
        line: u32,
    ) -> RunResult<Value> {
        let Some(ty) = ty else { return Ok(value) };
        let TypeKind::CustomObject(type_name) = &ty.kind else {
            return Ok(value);
        };
        // null may inhabit any boxed slot.
        if matches!(value, Value::Null) {
            return Ok(value);
        }
        let type_text = self.program.interns.get(*type_name).to_owned();
        let Some(shape) = self.shapes.get(&type_text).cloned() else {
            return Ok(value);
        };
        let Some(id) = value.ref_id() else {
            let err = RunError::throw(
                format!(
                    "cannot bind {} to object type {type_text}",
                    value.rt_type(&self.heap)
                ),
                line,
            );
            value.drop_with_heap(&mut self.heap);
            return Err(err);
        };
        if !matches!(self.heap.get(id), HeapData::Object(_)) {
            let err = RunError::throw(
                format!(
                    "cannot bind {} to object type {type_text}",
                    value.rt_type(&self.heap)
                ),
                line,
            );
            value.drop_with_heap(&mut self.heap);
            return Err(err);
        }

        // Unknown fields throw.
        let declared: Vec<String> = shape
            .iter()
            .map(|f| self.program.interns.get(f.name).to_owned())
            .collect();
        {
            let HeapData::Object(object) = self.heap.get(id) else {
                unreachable!("checked above");
            };
            for field in object.fields.keys() {
                if !declared.contains(field) {
                    let message =
                        format!("unknown field '{field}' for object type {type_text}");
                    value.drop_with_heap(&mut self.heap);
                    return Err(RunError::throw(message, line));
                }
            }
        }

        // Missing fields take their declared default; optional fields
        // become null; anything else is an error.
        for (field, field_name) in shape.iter().zip(declared.iter()) {
            let present = {
                let HeapData::Object(object) = self.heap.get(id) else {
                    unreachable!("checked above");
                };
                object.fields.contains_key(field_name)
            };
            if present {
                continue;
            }
            let fill = if let Some(default) = &field.default {
                match self.eval_expr(default, env) {
                    Ok(v) => v,
                    Err(err) => {
                        value.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                }
            } else if field.optional {
                Value::Null
            } else {
                let message = format!(
                    "missing field '{field_name}' for object type {type_text}"
                );
                value.drop_with_heap(&mut self.heap);
                return Err(RunError::throw(message, line));
            };
            let HeapData::Object(object) = self.heap.get_mut(id) else {
                unreachable!("checked above");
            };
            object.fields.insert(field_name.clone(), fill);
        }

        let HeapData::Object(object) = self.heap.get_mut(id) else {
            unreachable!("checked above");
        };
        object.type_name = Some(type_text);
        Ok(value)
    }

    // ---- defers ----------------------------------------------------------

    /// Runs defer entries in LIFO order. A throwing defer supersedes any
    /// pending error; remaining defers still run.
    fn run_defer_entries(
        &mut self,
        entries: Vec<DeferEntry>,
        mut pending: Option<RunError>,
    ) -> Option<RunError> {
        for entry in entries.into_iter().rev() {
            match self.eval_expr(&entry.call, entry.env) {
                Ok(v) => v.drop_with_heap(&mut self.heap),
                Err(err) => match pending.take() {
                    // A fatal error is never superseded by a defer throw.
                    Some(fatal @ RunError::Fatal(_)) => {
                        self.discard_error(err);
                        pending = Some(fatal);
                    }
                    Some(old) => {
                        self.discard_error(old);
                        pending = Some(err);
                    }
                    None => pending = Some(err),
                },
            }
            self.heap.dec_ref(entry.env);
        }
        pending
    }

    fn discard_error(&mut self, err: RunError) {
        if let RunError::Throw(thrown) = err {
            self.discard_payload(thrown.payload);
        }
    }

    fn discard_payload(&mut self, payload: ThrownPayload) {
        if let ThrownPayload::Val(value) = payload {
            value.drop_with_heap(&mut self.heap);
        }
    }

    fn discard_outcome(&mut self, outcome: RunResult<Flow>) {
        match outcome {
            Ok(Flow::Return(value)) => value.drop_with_heap(&mut self.heap),
            Ok(_) => {}
            Err(err) => self.discard_error(err),
        }
    }

    fn materialize_payload(&mut self, payload: ThrownPayload) -> Value {
        match payload {
            ThrownPayload::Msg(msg) => Value::Ref(self.heap.allocate(HeapData::Str(HmlStr::new(msg)))),
            ThrownPayload::Val(value) => value,
        }
    }

    // ---- expressions -----------------------------------------------------

    fn eval_expr(&mut self, e: &ExprLoc, env: HeapId) -> RunResult<Value> {
        let line = e.position.line;
        match &e.expr {
            Expr::Number {
                int_value,
                float_value,
                is_float,
            } => Ok(if *is_float {
                Value::F64(*float_value)
            } else {
                Value::I64(*int_value)
            }),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Rune(c) => Ok(Value::Rune(*c)),
            Expr::Str(id) => {
                let text = self.program.interns.get(*id).to_owned();
                Ok(Value::Ref(self.heap.allocate(HeapData::Str(HmlStr::new(text)))))
            }
            Expr::Ident(name) => self.eval_ident(*name, env, line),
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let l = self.eval_expr(left, env)?;
                    if l.truthy(&self.heap) {
                        l.drop_with_heap(&mut self.heap);
                        self.eval_expr(right, env)
                    } else {
                        Ok(l)
                    }
                }
                BinaryOp::Or => {
                    let l = self.eval_expr(left, env)?;
                    if l.truthy(&self.heap) {
                        Ok(l)
                    } else {
                        l.drop_with_heap(&mut self.heap);
                        self.eval_expr(right, env)
                    }
                }
                _ => {
                    let l = self.eval_expr(left, env)?;
                    let r = match self.eval_expr(right, env) {
                        Ok(r) => r,
                        Err(err) => {
                            l.drop_with_heap(&mut self.heap);
                            return Err(err);
                        }
                    };
                    binary_op(*op, l, r, &mut self.heap, &self.program.interns, line)
                }
            },
            Expr::Unary { op, operand } => {
                let v = self.eval_expr(operand, env)?;
                unary_op(*op, v, &mut self.heap, line)
            }
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let c = self.eval_expr(cond, env)?;
                let truthy = c.truthy(&self.heap);
                c.drop_with_heap(&mut self.heap);
                if truthy {
                    self.eval_expr(then_expr, env)
                } else {
                    self.eval_expr(else_expr, env)
                }
            }
            Expr::NullCoalesce { left, right } => {
                let l = self.eval_expr(left, env)?;
                if matches!(l, Value::Null) {
                    self.eval_expr(right, env)
                } else {
                    Ok(l)
                }
            }
            Expr::Call { callee, args } => self.eval_call(callee, args, env, line),
            Expr::Assign { name, value } => {
                let v = self.eval_expr(value, env)?;
                let stored = v.clone_with_heap(&self.heap);
                match env_set(&mut self.heap, env, *name, stored) {
                    EnvSetOutcome::Stored => Ok(v),
                    EnvSetOutcome::RejectedConst => {
                        v.drop_with_heap(&mut self.heap);
                        Err(RunError::throw(
                            format!(
                                "cannot assign to constant '{}'",
                                self.program.interns.get(*name)
                            ),
                            line,
                        ))
                    }
                }
            }
            Expr::GetProp { object, name } => {
                let obj = self.eval_expr(object, env)?;
                let result = self.get_property(&obj, *name, line);
                obj.drop_with_heap(&mut self.heap);
                result
            }
            Expr::OptionalChain { object, name } => {
                let obj = self.eval_expr(object, env)?;
                if matches!(obj, Value::Null) {
                    return Ok(Value::Null);
                }
                let result = self.get_property(&obj, *name, line);
                obj.drop_with_heap(&mut self.heap);
                result
            }
            Expr::SetProp {
                object,
                name,
                value,
            } => {
                let obj = self.eval_expr(object, env)?;
                let v = match self.eval_expr(value, env) {
                    Ok(v) => v,
                    Err(err) => {
                        obj.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                };
                let stored = v.clone_with_heap(&self.heap);
                let result = self.set_property(&obj, *name, stored, line);
                obj.drop_with_heap(&mut self.heap);
                match result {
                    Ok(()) => Ok(v),
                    Err(err) => {
                        v.drop_with_heap(&mut self.heap);
                        Err(err)
                    }
                }
            }
            Expr::Index { object, index } => {
                let obj = self.eval_expr(object, env)?;
                let idx = match self.eval_expr(index, env) {
                    Ok(v) => v,
                    Err(err) => {
                        obj.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                };
                let result = self.index_get(&obj, &idx, line);
                obj.drop_with_heap(&mut self.heap);
                idx.drop_with_heap(&mut self.heap);
                result
            }
            Expr::IndexAssign {
                object,
                index,
                value,
            } => {
                let obj = self.eval_expr(object, env)?;
                let idx = match self.eval_expr(index, env) {
                    Ok(v) => v,
                    Err(err) => {
                        obj.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                };
                let v = match self.eval_expr(value, env) {
                    Ok(v) => v,
                    Err(err) => {
                        obj.drop_with_heap(&mut self.heap);
                        idx.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                };
                let stored = v.clone_with_heap(&self.heap);
                let result = self.index_set(&obj, &idx, stored, line);
                obj.drop_with_heap(&mut self.heap);
                idx.drop_with_heap(&mut self.heap);
                match result {
                    Ok(()) => Ok(v),
                    Err(err) => {
                        v.drop_with_heap(&mut self.heap);
                        Err(err)
                    }
                }
            }
            Expr::Function(def) => {
                self.heap.inc_ref(env);
                let id = self.heap.allocate(HeapData::Function(FunctionValue {
                    def: def.clone(),
                    env: Some(env),
                }));
                Ok(Value::Ref(id))
            }
            Expr::ArrayLit(elements) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    match self.eval_expr(element, env) {
                        Ok(v) => values.push(v),
                        Err(err) => {
                            for v in values {
                                v.drop_with_heap(&mut self.heap);
                            }
                            return Err(err);
                        }
                    }
                }
                Ok(Value::Ref(self.heap.allocate(HeapData::Array(values))))
            }
            Expr::ObjectLit { fields } => {
                let mut object = HmlObject::default();
                for (name, value_expr) in fields {
                    match self.eval_expr(value_expr, env) {
                        Ok(v) => {
                            let key = self.program.interns.get(*name).to_owned();
                            if let Some(old) = object.fields.insert(key, v) {
                                old.drop_with_heap(&mut self.heap);
                            }
                        }
                        Err(err) => {
                            for (_, v) in object.fields {
                                v.drop_with_heap(&mut self.heap);
                            }
                            return Err(err);
                        }
                    }
                }
                Ok(Value::Ref(self.heap.allocate(HeapData::Object(object))))
            }
            Expr::PrefixIncDec { op, target } => self.eval_inc_dec(*op, target, env, true, line),
            Expr::PostfixIncDec { op, target } => self.eval_inc_dec(*op, target, env, false, line),
            Expr::Await(operand) => {
                // `await` suspends at this position in the full runtime; the
                // core evaluates the operand and yields it directly.
                self.eval_expr(operand, env)
            }
            Expr::Interp { strings, exprs } => {
                let mut text = String::new();
                for (i, sid) in strings.iter().enumerate() {
                    text.push_str(self.program.interns.get(*sid));
                    if let Some(expr) = exprs.get(i) {
                        let v = self.eval_expr(expr, env)?;
                        text.push_str(&display_value(&v, &self.heap, &self.program.interns));
                        v.drop_with_heap(&mut self.heap);
                    }
                }
                Ok(Value::Ref(self.heap.allocate(HeapData::Str(HmlStr::new(text)))))
            }
        }
    }

    fn eval_ident(&mut self, name: StringId, env: HeapId, line: u32) -> RunResult<Value> {
        if let Some(value) = env_get(&self.heap, env, name) {
            return Ok(value);
        }
        let text = self.program.interns.get(name);
        if let Some(builtin) = Builtin::lookup(text) {
            return Ok(Value::Builtin(builtin));
        }
        Err(RunError::throw(format!("undefined variable '{text}'"), line))
    }

    fn eval_inc_dec(
        &mut self,
        op: IncDec,
        target: &ExprLoc,
        env: HeapId,
        prefix: bool,
        line: u32,
    ) -> RunResult<Value> {
        let delta: i64 = match op {
            IncDec::Inc => 1,
            IncDec::Dec => -1,
        };
        match &target.expr {
            Expr::Ident(name) => {
                let old = self.eval_ident(*name, env, line)?;
                let new = match inc_dec_value(&old, delta, &self.heap, line) {
                    Ok(v) => v,
                    Err(err) => {
                        old.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                };
                let stored = new.clone_with_heap(&self.heap);
                if env_set(&mut self.heap, env, *name, stored) == EnvSetOutcome::RejectedConst {
                    old.drop_with_heap(&mut self.heap);
                    new.drop_with_heap(&mut self.heap);
                    return Err(RunError::throw(
                        format!(
                            "cannot assign to constant '{}'",
                            self.program.interns.get(*name)
                        ),
                        line,
                    ));
                }
                if prefix {
                    old.drop_with_heap(&mut self.heap);
                    Ok(new)
                } else {
                    new.drop_with_heap(&mut self.heap);
                    Ok(old)
                }
            }
            Expr::GetProp { object, name } => {
                let obj = self.eval_expr(object, env)?;
                let result = (|| {
                    let old = self.get_property(&obj, *name, line)?;
                    let new = match inc_dec_value(&old, delta, &self.heap, line) {
                        Ok(v) => v,
                        Err(err) => {
                            old.drop_with_heap(&mut self.heap);
                            return Err(err);
                        }
                    };
                    let stored = new.clone_with_heap(&self.heap);
                    if let Err(err) = self.set_property(&obj, *name, stored, line) {
                        old.drop_with_heap(&mut self.heap);
                        new.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                    if prefix {
                        old.drop_with_heap(&mut self.heap);
                        Ok(new)
                    } else {
                        new.drop_with_heap(&mut self.heap);
                        Ok(old)
                    }
                })();
                obj.drop_with_heap(&mut self.heap);
                result
            }
            Expr::Index { object, index } => {
                let obj = self.eval_expr(object, env)?;
                let idx = match self.eval_expr(index, env) {
                    Ok(v) => v,
                    Err(err) => {
                        obj.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                };
                let result = (|| {
                    let old = self.index_get(&obj, &idx, line)?;
                    let new = match inc_dec_value(&old, delta, &self.heap, line) {
                        Ok(v) => v,
                        Err(err) => {
                            old.drop_with_heap(&mut self.heap);
                            return Err(err);
                        }
                    };
                    let stored = new.clone_with_heap(&self.heap);
                    if let Err(err) = self.index_set(&obj, &idx, stored, line) {
                        old.drop_with_heap(&mut self.heap);
                        new.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                    if prefix {
                        old.drop_with_heap(&mut self.heap);
                        Ok(new)
                    } else {
                        new.drop_with_heap(&mut self.heap);
                        Ok(old)
                    }
                })();
                obj.drop_with_heap(&mut self.heap);
                idx.drop_with_heap(&mut self.heap);
                result
            }
            _ => Err(RunError::throw("invalid increment/decrement target", line)),
        }
    }

    // ---- properties and indexing ----------------------------------------

    fn get_property(&mut self, obj: &Value, name: StringId, line: u32) -> RunResult<Value> {
        let text = self.program.interns.get(name);
        let Some(id) = obj.ref_id() else {
            return Err(RunError::throw(
                format!("no property '{text}' on {}", obj.rt_type(&self.heap)),
                line,
            ));
        };
        match self.heap.get(id) {
            HeapData::Object(object) => match object.fields.get(text) {
                Some(value) => Ok(value.clone_with_heap(&self.heap)),
                None => {
                    if let Some(type_name) = &object.type_name {
                        Err(RunError::throw(
                            format!("unknown field '{text}' for object type {type_name}"),
                            line,
                        ))
                    } else {
                        // Missing fields on dynamic objects read as null.
                        Ok(Value::Null)
                    }
                }
            },
            other => Err(RunError::throw(
                format!(
                    "no property '{text}' on {}",
                    other.variant_name().to_lowercase()
                ),
                line,
            )),
        }
    }

    fn set_property(&mut self, obj: &Value, name: StringId, value: Value, line: u32) -> RunResult<()> {
        let text = self.program.interns.get(name).to_owned();
        let Some(id) = obj.ref_id() else {
            value.drop_with_heap(&mut self.heap);
            return Err(RunError::throw(
                format!("cannot set property '{text}' on {}", obj.rt_type(&self.heap)),
                line,
            ));
        };
        // Typed objects reject unknown fields; dynamic objects grow a slot.
        let allowed = match self.heap.get(id) {
            HeapData::Object(object) => match &object.type_name {
                Some(type_name) => {
                    object.fields.contains_key(&text) || {
                        let shape = self.shapes.get(type_name).cloned();
                        shape.is_some_and(|shape| {
                            shape
                                .iter()
                                .any(|f| self.program.interns.get(f.name) == text)
                        })
                    }
                }
                None => true,
            },
            _ => {
                value.drop_with_heap(&mut self.heap);
                return Err(RunError::throw(
                    format!("cannot set property '{text}' on non-object"),
                    line,
                ));
            }
        };
        if !allowed {
            let HeapData::Object(object) = self.heap.get(id) else {
                unreachable!("checked above");
            };
            let type_name = object.type_name.clone().unwrap_or_default();
            value.drop_with_heap(&mut self.heap);
            return Err(RunError::throw(
                format!("unknown field '{text}' for object type {type_name}"),
                line,
            ));
        }
        let HeapData::Object(object) = self.heap.get_mut(id) else {
            unreachable!("checked above");
        };
        let old = object.fields.insert(text, value);
        if let Some(old) = old {
            old.drop_with_heap(&mut self.heap);
        }
        Ok(())
    }

    fn index_get(&mut self, obj: &Value, idx: &Value, line: u32) -> RunResult<Value> {
        let Some(id) = obj.ref_id() else {
            return Err(RunError::throw(
                format!("cannot index {}", obj.rt_type(&self.heap)),
                line,
            ));
        };
        match self.heap.get(id) {
            HeapData::Array(values) => {
                let index = index_as_usize(idx, values.len(), line)?;
                Ok(values[index].clone_with_heap(&self.heap))
            }
            HeapData::Buffer(bytes) => {
                let index = index_as_usize(idx, bytes.len(), line)?;
                Ok(Value::U8(bytes[index]))
            }
            HeapData::Str(s) => {
                let count = s.char_count();
                let index = index_as_usize(idx, count, line)?;
                let c = s
                    .as_str()
                    .chars()
                    .nth(index)
                    .expect("index checked against char count");
                Ok(Value::Rune(c))
            }
            HeapData::Object(_) => {
                let key = self.string_key(idx, line)?;
                let HeapData::Object(object) = self.heap.get(id) else {
                    unreachable!("checked above");
                };
                match object.fields.get(&key) {
                    Some(value) => Ok(value.clone_with_heap(&self.heap)),
                    None => {
                        if let Some(type_name) = &object.type_name {
                            Err(RunError::throw(
                                format!("unknown field '{key}' for object type {type_name}"),
                                line,
                            ))
                        } else {
                            Ok(Value::Null)
                        }
                    }
                }
            }
            other => Err(RunError::throw(
                format!("cannot index {}", other.variant_name().to_lowercase()),
                line,
            )),
        }
    }

    fn index_set(&mut self, obj: &Value, idx: &Value, value: Value, line: u32) -> RunResult<()> {
        let Some(id) = obj.ref_id() else {
            value.drop_with_heap(&mut self.heap);
            return Err(RunError::throw(
                format!("cannot index {}", obj.rt_type(&self.heap)),
                line,
            ));
        };
        enum Target {
            Array(usize),
            Buffer(usize),
            Object(String),
        }
        let target = match self.heap.get(id) {
            HeapData::Array(values) => {
                let len = values.len();
                match index_as_usize(idx, len, line) {
                    Ok(index) => Target::Array(index),
                    Err(err) => {
                        value.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                }
            }
            HeapData::Buffer(bytes) => {
                let len = bytes.len();
                match index_as_usize(idx, len, line) {
                    Ok(index) => Target::Buffer(index),
                    Err(err) => {
                        value.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                }
            }
            HeapData::Object(object) => {
                let key = match self.string_key(idx, line) {
                    Ok(key) => key,
                    Err(err) => {
                        value.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                };
                if let Some(type_name) = &object.type_name
                    && !object.fields.contains_key(&key)
                {
                    let message = format!("unknown field '{key}' for object type {type_name}");
                    value.drop_with_heap(&mut self.heap);
                    return Err(RunError::throw(message, line));
                }
                Target::Object(key)
            }
            other => {
                let message = format!("cannot index {}", other.variant_name().to_lowercase());
                value.drop_with_heap(&mut self.heap);
                return Err(RunError::throw(message, line));
            }
        };
        match target {
            Target::Array(index) => {
                let HeapData::Array(values) = self.heap.get_mut(id) else {
                    unreachable!("checked above");
                };
                let old = std::mem::replace(&mut values[index], value);
                old.drop_with_heap(&mut self.heap);
            }
            Target::Buffer(index) => {
                let byte = match int_value_of(&value) {
                    Some(b) => b as u8,
                    None => {
                        let message =
                            format!("buffer elements must be integers, got {}", value.rt_type(&self.heap));
                        value.drop_with_heap(&mut self.heap);
                        return Err(RunError::throw(message, line));
                    }
                };
                value.drop_with_heap(&mut self.heap);
                let HeapData::Buffer(bytes) = self.heap.get_mut(id) else {
                    unreachable!("checked above");
                };
                bytes[index] = byte;
            }
            Target::Object(key) => {
                let HeapData::Object(object) = self.heap.get_mut(id) else {
                    unreachable!("checked above");
                };
                let old = object.fields.insert(key, value);
                if let Some(old) = old {
                    old.drop_with_heap(&mut self.heap);
                }
            }
        }
        Ok(())
    }

    fn string_key(&self, idx: &Value, line: u32) -> RunResult<String> {
        if let Some(id) = idx.ref_id()
            && let HeapData::Str(s) = self.heap.get(id)
        {
            return Ok(s.as_str().to_owned());
        }
        Err(RunError::throw(
            format!(
                "object index must be a string, got {}",
                idx.rt_type(&self.heap)
            ),
            line,
        ))
    }

    // ---- calls -----------------------------------------------------------

    fn eval_args(&mut self, args: &[ExprLoc], env: HeapId) -> RunResult<SmallVec<[Value; 8]>> {
        let mut values: SmallVec<[Value; 8]> = SmallVec::with_capacity(args.len());
        for arg in args {
            match self.eval_expr(arg, env) {
                Ok(v) => values.push(v),
                Err(err) => {
                    for v in values {
                        v.drop_with_heap(&mut self.heap);
                    }
                    return Err(err);
                }
            }
        }
        Ok(values)
    }

    fn eval_call(
        &mut self,
        callee: &ExprLoc,
        args: &[ExprLoc],
        env: HeapId,
        line: u32,
    ) -> RunResult<Value> {
        // Method-call form: receiver.name(args) dispatches on the receiver
        // tag first; object fields holding functions come last.
        if let Expr::GetProp { object, name } = &callee.expr {
            let obj = self.eval_expr(object, env)?;
            let result = self.eval_method_call(&obj, *name, args, env, line);
            obj.drop_with_heap(&mut self.heap);
            return result;
        }

        let callee_value = self.eval_expr(callee, env)?;
        let result = self.call_value(&callee_value, args, env, line);
        callee_value.drop_with_heap(&mut self.heap);
        result
    }

    fn call_value(
        &mut self,
        callee: &Value,
        args: &[ExprLoc],
        env: HeapId,
        line: u32,
    ) -> RunResult<Value> {
        match callee {
            Value::Builtin(builtin) => {
                let values = self.eval_args(args, env)?;
                call_builtin(
                    *builtin,
                    values.into_vec(),
                    &mut self.heap,
                    &self.program.interns,
                    self.writer,
                    line,
                )
            }
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Function(_)) => {
                self.call_function(*id, args, env, line)
            }
            other => Err(RunError::throw(
                format!("value of type {} is not callable", other.rt_type(&self.heap)),
                line,
            )),
        }
    }

    fn call_function(
        &mut self,
        fn_id: HeapId,
        args: &[ExprLoc],
        caller_env: HeapId,
        line: u32,
    ) -> RunResult<Value> {
        let (def, closure_env) = {
            let HeapData::Function(function) = self.heap.get(fn_id) else {
                unreachable!("caller checked the tag");
            };
            (function.def.clone(), function.env)
        };
        self.limits.check_stack_depth(self.call_stack.len())?;

        let fn_name = def
            .name
            .map_or_else(|| "<anonymous>".to_owned(), |n| self.program.interns.get(n).to_owned());

        // By-reference parameters write back to caller variables when the
        // argument was a plain identifier.
        let mut ref_backs: Vec<(StringId, StringId)> = Vec::new();
        for (i, param) in def.params.iter().enumerate() {
            if param.is_ref
                && let Some(arg) = args.get(i)
                && let Expr::Ident(var) = &arg.expr
            {
                ref_backs.push((param.name, *var));
            }
        }

        let mut values = self.eval_args(args, caller_env)?;

        // Arity: extra arguments require a rest parameter.
        if values.len() > def.params.len() && def.rest.is_none() {
            let got = values.len();
            for v in values {
                v.drop_with_heap(&mut self.heap);
            }
            return Err(RunError::throw(
                format!(
                    "{fn_name}() expects at most {} argument(s), got {got}",
                    def.params.len()
                ),
                line,
            ));
        }

        let callee_env = env_new(&mut self.heap, closure_env);

        // Bind declared parameters, defaults for the missing ones.
        let mut rest_values: Vec<Value> = Vec::new();
        let mut iter = values.drain(..);
        for (i, param) in def.params.iter().enumerate() {
            let value = match iter.next() {
                Some(v) => v,
                None => match &param.default {
                    Some(default) => match self.eval_expr(default, callee_env) {
                        Ok(v) => v,
                        Err(err) => {
                            for v in iter {
                                v.drop_with_heap(&mut self.heap);
                            }
                            self.heap.dec_ref(callee_env);
                            return Err(err);
                        }
                    },
                    None => {
                        for v in iter {
                            v.drop_with_heap(&mut self.heap);
                        }
                        self.heap.dec_ref(callee_env);
                        return Err(RunError::throw(
                            format!(
                                "missing argument '{}' in call to {fn_name}()",
                                self.program.interns.get(def.params[i].name)
                            ),
                            line,
                        ));
                    }
                },
            };
            env_define(&mut self.heap, callee_env, param.name, value, false);
        }
        rest_values.extend(iter);
        if let Some(rest) = &def.rest {
            let id = self.heap.allocate(HeapData::Array(rest_values));
            env_define(&mut self.heap, callee_env, rest.name, Value::Ref(id), false);
        } else {
            debug_assert!(rest_values.is_empty(), "arity checked above");
            for v in rest_values {
                v.drop_with_heap(&mut self.heap);
            }
        }

        // Enter the frame.
        self.call_stack.push(FrameInfo {
            name: fn_name.clone(),
        });
        self.tracer.on_call(&fn_name, self.call_stack.len());
        self.defer_stacks.push(Vec::new());

        let flow = self.exec_stmts(&def.body, callee_env);
        let outcome: RunResult<Value> = match flow {
            Ok(Flow::Return(v)) => Ok(v),
            Ok(_) => Ok(Value::Null),
            Err(err) => Err(err),
        };

        // Defers run on every exit path, LIFO, in their captured env.
        let entries = self.defer_stacks.pop().expect("call defer frame");
        let (ok_value, pending) = match outcome {
            Ok(v) => (Some(v), None),
            Err(err) => (None, Some(err)),
        };
        let pending = self.run_defer_entries(entries, pending);
        let mut outcome: RunResult<Value> = match pending {
            Some(err) => {
                if let Some(v) = ok_value {
                    v.drop_with_heap(&mut self.heap);
                }
                Err(err)
            }
            None => Ok(ok_value.unwrap_or(Value::Null)),
        };

        // Copy-out for ref parameters.
        if outcome.is_ok() {
            for (param_name, caller_var) in ref_backs {
                if let Some(value) = env_get(&self.heap, callee_env, param_name)
                    && env_set(&mut self.heap, caller_env, caller_var, value)
                        == EnvSetOutcome::RejectedConst
                {
                    self.discard_outcome_value(&mut outcome);
                    outcome = Err(RunError::throw(
                        format!(
                            "cannot assign to constant '{}' through ref parameter",
                            self.program.interns.get(caller_var)
                        ),
                        line,
                    ));
                    break;
                }
            }
        }

        self.tracer.on_return(&fn_name);
        self.call_stack.pop();
        self.heap.dec_ref(callee_env);

        outcome.map_err(|err| match err {
            RunError::Throw(mut thrown) => {
                thrown.frames.push(StackFrame {
                    function: fn_name,
                    file: self.program.file_name.clone(),
                    line,
                });
                RunError::Throw(thrown)
            }
            fatal => fatal,
        })
    }

    fn discard_outcome_value(&mut self, outcome: &mut RunResult<Value>) {
        let taken = std::mem::replace(outcome, Ok(Value::Null));
        match taken {
            Ok(v) => v.drop_with_heap(&mut self.heap),
            Err(err) => self.discard_error(err),
        }
    }

    /// Method dispatch on the receiver tag; object fields that hold
    /// callables are looked up last.
    fn eval_method_call(
        &mut self,
        obj: &Value,
        name: StringId,
        args: &[ExprLoc],
        env: HeapId,
        line: u32,
    ) -> RunResult<Value> {
        let method = self.program.interns.get(name).to_owned();
        let Some(id) = obj.ref_id() else {
            return Err(RunError::throw(
                format!("no method '{method}' on {}", obj.rt_type(&self.heap)),
                line,
            ));
        };
        match self.heap.get(id) {
            HeapData::Channel(state) => {
                let state = state.clone();
                match method.as_str() {
                    "send" => {
                        let mut values = self.eval_args(args, env)?;
                        if values.len() != 1 {
                            let got = values.len();
                            for v in values {
                                v.drop_with_heap(&mut self.heap);
                            }
                            return Err(RunError::throw(
                                format!("send() expects 1 argument, got {got}"),
                                line,
                            ));
                        }
                        let value = values.pop().expect("length checked");
                        let message = value_to_message(&value, &self.heap);
                        value.drop_with_heap(&mut self.heap);
                        let message = message.map_err(|msg| RunError::throw(msg, line))?;
                        state
                            .send(message)
                            .map_err(|_| RunError::throw("send on closed channel", line))?;
                        Ok(Value::Null)
                    }
                    "recv" => {
                        self.expect_no_args(args, env, "recv", line)?;
                        match state.recv() {
                            Some(message) => Ok(message_to_value(message, &mut self.heap)),
                            None => Ok(Value::Null),
                        }
                    }
                    "close" => {
                        self.expect_no_args(args, env, "close", line)?;
                        state.close();
                        Ok(Value::Null)
                    }
                    _ => Err(RunError::throw(
                        format!("no method '{method}' on channel"),
                        line,
                    )),
                }
            }
            HeapData::Array(_) => match method.as_str() {
                "push" => {
                    let values = self.eval_args(args, env)?;
                    let HeapData::Array(array) = self.heap.get_mut(id) else {
                        unreachable!("checked above");
                    };
                    for v in values {
                        array.push(v);
                    }
                    Ok(Value::Null)
                }
                "pop" => {
                    self.expect_no_args(args, env, "pop", line)?;
                    let HeapData::Array(array) = self.heap.get_mut(id) else {
                        unreachable!("checked above");
                    };
                    match array.pop() {
                        Some(v) => Ok(v),
                        None => Err(RunError::throw("pop from empty array", line)),
                    }
                }
                "len" => {
                    self.expect_no_args(args, env, "len", line)?;
                    let HeapData::Array(array) = self.heap.get(id) else {
                        unreachable!("checked above");
                    };
                    Ok(Value::I64(array.len() as i64))
                }
                _ => Err(RunError::throw(
                    format!("no method '{method}' on array"),
                    line,
                )),
            },
            HeapData::Str(_) => match method.as_str() {
                "len" => {
                    self.expect_no_args(args, env, "len", line)?;
                    let HeapData::Str(s) = self.heap.get(id) else {
                        unreachable!("checked above");
                    };
                    Ok(Value::I64(s.char_count() as i64))
                }
                _ => Err(RunError::throw(
                    format!("no method '{method}' on string"),
                    line,
                )),
            },
            HeapData::Buffer(_) => match method.as_str() {
                "len" => {
                    self.expect_no_args(args, env, "len", line)?;
                    let HeapData::Buffer(bytes) = self.heap.get(id) else {
                        unreachable!("checked above");
                    };
                    Ok(Value::I64(bytes.len() as i64))
                }
                _ => Err(RunError::throw(
                    format!("no method '{method}' on buffer"),
                    line,
                )),
            },
            HeapData::File(_) => match method.as_str() {
                "read" => {
                    self.expect_no_args(args, env, "read", line)?;
                    let HeapData::File(handle) = self.heap.get_mut(id) else {
                        unreachable!("checked above");
                    };
                    let Some(file) = handle.file.as_mut() else {
                        return Err(RunError::throw("read on closed file", line));
                    };
                    let mut text = String::new();
                    use std::io::Read as _;
                    if let Err(err) = file.read_to_string(&mut text) {
                        let path = handle.path.clone();
                        return Err(RunError::throw(format!("read {path}: {err}"), line));
                    }
                    Ok(Value::Ref(self.heap.allocate(HeapData::Str(HmlStr::new(text)))))
                }
                "write" => {
                    let mut values = self.eval_args(args, env)?;
                    if values.len() != 1 {
                        let got = values.len();
                        for v in values {
                            v.drop_with_heap(&mut self.heap);
                        }
                        return Err(RunError::throw(
                            format!("write() expects 1 argument, got {got}"),
                            line,
                        ));
                    }
                    let value = values.pop().expect("length checked");
                    let text = display_value(&value, &self.heap, &self.program.interns);
                    value.drop_with_heap(&mut self.heap);
                    let HeapData::File(handle) = self.heap.get_mut(id) else {
                        unreachable!("checked above");
                    };
                    if !handle.writable {
                        return Err(RunError::throw("file is not open for writing", line));
                    }
                    let Some(file) = handle.file.as_mut() else {
                        return Err(RunError::throw("write on closed file", line));
                    };
                    use std::io::Write as _;
                    if let Err(err) = file.write_all(text.as_bytes()) {
                        let path = handle.path.clone();
                        return Err(RunError::throw(format!("write {path}: {err}"), line));
                    }
                    Ok(Value::Null)
                }
                "close" => {
                    self.expect_no_args(args, env, "close", line)?;
                    let HeapData::File(handle) = self.heap.get_mut(id) else {
                        unreachable!("checked above");
                    };
                    handle.file = None;
                    Ok(Value::Null)
                }
                _ => Err(RunError::throw(
                    format!("no method '{method}' on file"),
                    line,
                )),
            },
            HeapData::Object(_) => {
                // Fall back to a callable field.
                let callee = self.get_property(obj, name, line)?;
                let result = self.call_value(&callee, args, env, line);
                callee.drop_with_heap(&mut self.heap);
                result
            }
            other => Err(RunError::throw(
                format!(
                    "no method '{method}' on {}",
                    other.variant_name().to_lowercase()
                ),
                line,
            )),
        }
    }

    fn expect_no_args(
        &mut self,
        args: &[ExprLoc],
        env: HeapId,
        method: &str,
        line: u32,
    ) -> RunResult<()> {
        if args.is_empty() {
            return Ok(());
        }
        let values = self.eval_args(args, env)?;
        let got = values.len();
        for v in values {
            v.drop_with_heap(&mut self.heap);
        }
        Err(RunError::throw(
            format!("{method}() expects no arguments, got {got}"),
            line,
        ))
    }
}

/// Reads any integer width out of a value.
fn int_value_of(v: &Value) -> Option<i64> {
    match v {
        Value::I8(x) => Some(i64::from(*x)),
        Value::I16(x) => Some(i64::from(*x)),
        Value::I32(x) => Some(i64::from(*x)),
        Value::I64(x) => Some(*x),
        Value::U8(x) => Some(i64::from(*x)),
        Value::U16(x) => Some(i64::from(*x)),
        Value::U32(x) => Some(i64::from(*x)),
        Value::U64(x) => Some(*x as i64),
        _ => None,
    }
}

/// Validates an index value against a container length.
fn index_as_usize(idx: &Value, len: usize, line: u32) -> RunResult<usize> {
    let Some(i) = int_value_of(idx) else {
        return Err(RunError::throw("index must be an integer", line));
    };
    if i < 0 || (i as usize) >= len {
        return Err(RunError::throw(
            format!("index {i} out of bounds for length {len}"),
            line,
        ));
    }
    Ok(i as usize)
}
