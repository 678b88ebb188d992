//! Bounded channels: the only blocking primitive in the core.
//!
//! A channel is a mutex-protected ring with two condition variables.
//! Payloads crossing a channel are self-contained [`Message`]s rather than
//! heap values, so the (single-threaded) value heap never crosses a thread
//! boundary; conversion happens at `send`/`recv` in the interpreter.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
};

/// A self-contained value that can cross threads through a channel.
///
/// Containers are deep copies; functions, files, and channels themselves are
/// rejected at conversion time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Message {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Rune(char),
    Str(String),
    Buffer(Vec<u8>),
    Array(Vec<Message>),
    Object(Vec<(String, Message)>),
}

/// Error returned by `send` on a closed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SendClosed;

#[derive(Debug)]
struct ChannelInner {
    buffer: VecDeque<Message>,
    closed: bool,
}

/// Shared channel state: `{buffer, closed}` under a mutex plus `not_empty`
/// and `not_full` condition variables.
#[derive(Debug)]
pub(crate) struct ChannelState {
    inner: Mutex<ChannelInner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl ChannelState {
    /// Creates a channel with the given buffer capacity.
    ///
    /// Unbuffered (capacity 0) channels are rejected in the core.
    pub fn new(capacity: usize) -> Result<Self, &'static str> {
        if capacity == 0 {
            return Err("unbuffered channels are not supported");
        }
        Ok(Self {
            inner: Mutex::new(ChannelInner {
                buffer: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until space is available (or the channel closes), then
    /// enqueues the message and signals `not_empty`.
    pub fn send(&self, message: Message) -> Result<(), SendClosed> {
        let mut inner = self.inner.lock().expect("channel mutex poisoned");
        loop {
            if inner.closed {
                return Err(SendClosed);
            }
            if inner.buffer.len() < self.capacity {
                inner.buffer.push_back(message);
                self.not_empty.notify_one();
                return Ok(());
            }
            inner = self.not_full.wait(inner).expect("channel mutex poisoned");
        }
    }

    /// Blocks until a message is available. Returns `None` once the channel
    /// is closed and drained.
    pub fn recv(&self) -> Option<Message> {
        let mut inner = self.inner.lock().expect("channel mutex poisoned");
        loop {
            if let Some(message) = inner.buffer.pop_front() {
                self.not_full.notify_one();
                return Some(message);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).expect("channel mutex poisoned");
        }
    }

    /// Marks the channel closed and wakes all waiters on both conditions.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("channel mutex poisoned");
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn rejects_unbuffered() {
        assert!(ChannelState::new(0).is_err());
    }

    #[test]
    fn send_then_recv_in_order() {
        let ch = ChannelState::new(3).expect("capacity > 0");
        ch.send(Message::I64(1)).unwrap();
        ch.send(Message::I64(2)).unwrap();
        ch.send(Message::I64(3)).unwrap();
        ch.close();
        assert_eq!(ch.recv(), Some(Message::I64(1)));
        assert_eq!(ch.recv(), Some(Message::I64(2)));
        assert_eq!(ch.recv(), Some(Message::I64(3)));
        assert_eq!(ch.recv(), None);
    }

    #[test]
    fn send_after_close_errors() {
        let ch = ChannelState::new(1).expect("capacity > 0");
        ch.close();
        assert_eq!(ch.send(Message::Null), Err(SendClosed));
    }

    #[test]
    fn cross_thread_ordering() {
        // One thread sends 1..=3 and closes; the other receives until None.
        let ch = Arc::new(ChannelState::new(1).expect("capacity > 0"));
        let sender = Arc::clone(&ch);
        let producer = thread::spawn(move || {
            for i in 1..=3 {
                sender.send(Message::I64(i)).unwrap();
            }
            sender.close();
        });
        let mut received = Vec::new();
        while let Some(Message::I64(v)) = ch.recv() {
            received.push(v);
        }
        producer.join().unwrap();
        assert_eq!(received, vec![1, 2, 3]);
    }

    #[test]
    fn send_blocks_until_capacity_frees() {
        let ch = Arc::new(ChannelState::new(1).expect("capacity > 0"));
        ch.send(Message::I64(1)).unwrap();
        let sender = Arc::clone(&ch);
        let producer = thread::spawn(move || {
            // Blocks until the main thread receives.
            sender.send(Message::I64(2)).unwrap();
        });
        assert_eq!(ch.recv(), Some(Message::I64(1)));
        assert_eq!(ch.recv(), Some(Message::I64(2)));
        producer.join().unwrap();
    }
}
