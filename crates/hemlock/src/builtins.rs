//! Builtin functions resolved by name when an identifier is not bound in
//! any environment frame.

use std::sync::Arc;

use strum::{Display, EnumString};

use crate::{
    channel::ChannelState,
    exception::{RunError, RunResult},
    heap::{FileHandle, Heap, HeapData, HmlStr},
    intern::Interns,
    io::PrintWriter,
    value::{Value, display_value},
};

/// The builtin registry.
///
/// `strum` maps the variant names to their source spelling, so resolution
/// is a single `from_str` on the identifier text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Builtin {
    Print,
    Len,
    Str,
    TypeOf,
    Channel,
    Buffer,
    Open,
}

impl Builtin {
    /// Resolves an identifier to a builtin.
    pub fn lookup(name: &str) -> Option<Self> {
        name.parse().ok()
    }
}

fn drop_args(args: Vec<Value>, heap: &mut Heap) {
    for arg in args {
        arg.drop_with_heap(heap);
    }
}

fn arity_error(builtin: Builtin, expected: usize, got: usize, line: u32) -> RunError {
    RunError::throw(
        format!("{builtin}() expects {expected} argument(s), got {got}"),
        line,
    )
}

/// Dispatches one builtin call. Arguments arrive owned and are released
/// here on every path.
pub(crate) fn call_builtin<W: PrintWriter>(
    builtin: Builtin,
    mut args: Vec<Value>,
    heap: &mut Heap,
    interns: &Interns,
    writer: &mut W,
    line: u32,
) -> RunResult<Value> {
    match builtin {
        Builtin::Print => {
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    writer.stdout_push(' ');
                }
                writer.stdout_write(&display_value(arg, heap, interns));
            }
            writer.stdout_push('\n');
            drop_args(args, heap);
            Ok(Value::Null)
        }
        Builtin::Len => {
            if args.len() != 1 {
                let got = args.len();
                drop_args(args, heap);
                return Err(arity_error(builtin, 1, got, line));
            }
            let arg = args.pop().expect("length checked");
            let len = match &arg {
                Value::Ref(id) => match heap.get(*id) {
                    HeapData::Str(s) => Some(s.char_count()),
                    HeapData::Buffer(bytes) => Some(bytes.len()),
                    HeapData::Array(values) => Some(values.len()),
                    HeapData::Object(object) => Some(object.fields.len()),
                    _ => None,
                },
                _ => None,
            };
            let result = match len {
                Some(len) => Ok(Value::I64(len as i64)),
                None => Err(RunError::throw(
                    format!("len() is not defined for {}", arg.rt_type(heap)),
                    line,
                )),
            };
            arg.drop_with_heap(heap);
            result
        }
        Builtin::Str => {
            if args.len() != 1 {
                let got = args.len();
                drop_args(args, heap);
                return Err(arity_error(builtin, 1, got, line));
            }
            let arg = args.pop().expect("length checked");
            let text = display_value(&arg, heap, interns);
            arg.drop_with_heap(heap);
            Ok(Value::Ref(heap.allocate(HeapData::Str(HmlStr::new(text)))))
        }
        Builtin::TypeOf => {
            if args.len() != 1 {
                let got = args.len();
                drop_args(args, heap);
                return Err(arity_error(builtin, 1, got, line));
            }
            let arg = args.pop().expect("length checked");
            let ty = arg.rt_type(heap);
            arg.drop_with_heap(heap);
            Ok(Value::Type(ty))
        }
        Builtin::Channel => {
            if args.len() != 1 {
                let got = args.len();
                drop_args(args, heap);
                return Err(arity_error(builtin, 1, got, line));
            }
            let arg = args.pop().expect("length checked");
            let capacity = int_arg(&arg);
            arg.drop_with_heap(heap);
            if capacity < 0 {
                return Err(RunError::throw(
                    "channel() expects a non-negative integer capacity",
                    line,
                ));
            }
            match ChannelState::new(capacity as usize) {
                Ok(state) => Ok(Value::Ref(heap.allocate(HeapData::Channel(Arc::new(state))))),
                Err(msg) => Err(RunError::throw(msg, line)),
            }
        }
        Builtin::Buffer => {
            if args.len() != 1 {
                let got = args.len();
                drop_args(args, heap);
                return Err(arity_error(builtin, 1, got, line));
            }
            let arg = args.pop().expect("length checked");
            let size = int_arg(&arg);
            arg.drop_with_heap(heap);
            if size < 0 {
                return Err(RunError::throw(
                    "buffer() expects a non-negative integer size",
                    line,
                ));
            }
            Ok(Value::Ref(heap.allocate(HeapData::Buffer(vec![0; size as usize]))))
        }
        Builtin::Open => {
            if args.len() != 2 {
                let got = args.len();
                drop_args(args, heap);
                return Err(arity_error(builtin, 2, got, line));
            }
            let mode_value = args.pop().expect("length checked");
            let path_value = args.pop().expect("length checked");
            let path = string_arg(&path_value, heap);
            let mode = string_arg(&mode_value, heap);
            path_value.drop_with_heap(heap);
            mode_value.drop_with_heap(heap);
            let (Some(path), Some(mode)) = (path, mode) else {
                return Err(RunError::throw(
                    "open() expects (path: string, mode: string)",
                    line,
                ));
            };
            let opened = match mode.as_str() {
                "r" => std::fs::File::open(&path).map(|f| (f, false)),
                "w" => std::fs::File::create(&path).map(|f| (f, true)),
                "a" => std::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&path)
                    .map(|f| (f, true)),
                _ => {
                    return Err(RunError::throw(
                        format!("open(): invalid mode '{mode}'"),
                        line,
                    ));
                }
            };
            match opened {
                Ok((file, writable)) => Ok(Value::Ref(heap.allocate(HeapData::File(FileHandle {
                    path,
                    file: Some(file),
                    writable,
                })))),
                Err(err) => Err(RunError::throw(format!("open(): {path}: {err}"), line)),
            }
        }
    }
}

/// Reads any integer width out of an argument, or -1 for non-integers
/// (callers treat negatives as invalid anyway).
fn int_arg(v: &Value) -> i64 {
    match v {
        Value::I8(x) => i64::from(*x),
        Value::I16(x) => i64::from(*x),
        Value::I32(x) => i64::from(*x),
        Value::I64(x) => *x,
        Value::U8(x) => i64::from(*x),
        Value::U16(x) => i64::from(*x),
        Value::U32(x) => i64::from(*x),
        Value::U64(x) => *x as i64,
        _ => -1,
    }
}

fn string_arg(v: &Value, heap: &Heap) -> Option<String> {
    match v {
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => Some(s.as_str().to_owned()),
            _ => None,
        },
        _ => None,
    }
}
