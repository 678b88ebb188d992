use std::{
    cell::RefCell,
    io::{self, Write as _},
};

/// Trait for handling output from the `print()` builtin.
///
/// Implement this to capture or redirect print output. The default
/// implementation [`StdPrint`] writes to stdout.
pub trait PrintWriter {
    /// Writes one formatted argument, without separators or terminator.
    fn stdout_write(&mut self, output: &str);

    /// Writes a single separator/terminator character (space, newline).
    fn stdout_push(&mut self, end: char);
}

/// Default `PrintWriter` that writes to stdout.
///
/// Output is staged in a thread-local buffer and flushed on drop, so
/// interleaved stderr diagnostics are not split mid-line.
#[derive(Debug, Default)]
pub struct StdPrint;

thread_local! {
    static STDOUT_BUFFER: RefCell<String> = const { RefCell::new(String::new()) };
}

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: &str) {
        STDOUT_BUFFER.with(|buffer| buffer.borrow_mut().push_str(output));
    }

    fn stdout_push(&mut self, end: char) {
        STDOUT_BUFFER.with(|buffer| buffer.borrow_mut().push(end));
    }
}

impl Drop for StdPrint {
    fn drop(&mut self) {
        STDOUT_BUFFER.with(|buffer| {
            let mut buffer = buffer.borrow_mut();
            if buffer.is_empty() {
                return;
            }
            let _ = io::stdout().write_all(buffer.as_bytes());
            let _ = io::stdout().flush();
            buffer.clear();
        });
    }
}

/// A `PrintWriter` that collects all output into a string.
///
/// Useful for testing or capturing print output programmatically.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self(String::new())
    }

    /// Returns the collected output as a string slice.
    #[must_use]
    pub fn output(&self) -> &str {
        self.0.as_str()
    }

    /// Consumes the writer and returns the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: &str) {
        self.0.push_str(output);
    }

    fn stdout_push(&mut self, end: char) {
        self.0.push(end);
    }
}

/// `PrintWriter` that ignores all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: &str) {}

    fn stdout_push(&mut self, _end: char) {}
}
