//! Execution tracing hooks for the interpreter.
//!
//! The evaluator calls into an [`ExecTracer`] at statement and call
//! boundaries. The default [`NoopTracer`] compiles to nothing.

/// Observer of interpreter execution events.
pub trait ExecTracer {
    /// Called before each statement, with its 1-based source line.
    fn on_stmt(&mut self, line: u32) {
        let _ = line;
    }

    /// Called on function entry with the callee name and new stack depth.
    fn on_call(&mut self, name: &str, depth: usize) {
        let _ = (name, depth);
    }

    /// Called when a function returns (normally or by unwinding).
    fn on_return(&mut self, name: &str) {
        let _ = name;
    }
}

/// Tracer that does nothing; all hooks inline away.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl ExecTracer for NoopTracer {}

/// Tracer that logs calls and statement lines to stderr.
///
/// Enabled by the interpreter CLI's `--profile` flag.
#[derive(Debug, Default)]
pub struct StderrTracer {
    stmts: u64,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecTracer for StderrTracer {
    fn on_stmt(&mut self, _line: u32) {
        self.stmts += 1;
    }

    fn on_call(&mut self, name: &str, depth: usize) {
        eprintln!("{:depth$}-> {name}", "");
    }

    fn on_return(&mut self, name: &str) {
        eprintln!("<- {name}");
    }
}

impl Drop for StderrTracer {
    fn drop(&mut self) {
        if self.stmts > 0 {
            eprintln!("executed {} statements", self.stmts);
        }
    }
}
