//! The fixed runtime ABI the code generator emits against.
//!
//! The contract, in one place: a `HmlValue` tagged union with a tag for
//! every runtime variant; boxing and coercion helpers per primitive width;
//! operator intrinsics keyed by an op code; heap primitives for strings,
//! arrays, objects, closures, channels, and files; `hml_retain`/
//! `hml_release`; and thrown-exception state observable after any call via
//! `hml_exc_pending()`. The generated C includes `hemlock_runtime.h` and
//! never defines these itself.
//!
//! Conventions the emitter relies on:
//! - every runtime function that stores a value retains it; arguments are
//!   passed borrowed
//! - every runtime function that produces a value returns it owned
//! - `hml_to_*` coercions set the pending exception and return zero on a
//!   non-numeric operand
//! - `hml_env_get` returns owned; `hml_env_set` releases the old slot
//! - native wrapping helpers (`hml_add_i64`, …) implement two's-complement
//!   wrap so native and boxed arithmetic agree

use crate::analyze::NativeType;
use crate::ast::{BinaryOp, UnaryOp};

/// Name of the generated runtime header include.
pub(crate) const RUNTIME_HEADER: &str = "hemlock_runtime.h";

/// The boxed value type.
pub(crate) const VALUE: &str = "HmlValue";

/// The closure environment type (`{parent, slot count, slots[]}`).
pub(crate) const ENV: &str = "HmlEnv";

/// C type for an unboxed local.
pub(crate) fn c_type(native: NativeType) -> &'static str {
    match native {
        NativeType::I8 => "int8_t",
        NativeType::I16 => "int16_t",
        NativeType::I32 => "int32_t",
        NativeType::I64 => "int64_t",
        NativeType::U8 => "uint8_t",
        NativeType::U16 => "uint16_t",
        NativeType::U32 => "uint32_t",
        NativeType::U64 => "uint64_t",
        NativeType::F32 => "float",
        NativeType::F64 => "double",
        NativeType::Bool => "bool",
    }
}

/// Boxing helper for a native width.
pub(crate) fn box_fn(native: NativeType) -> &'static str {
    match native {
        NativeType::I8 => "hml_val_i8",
        NativeType::I16 => "hml_val_i16",
        NativeType::I32 => "hml_val_i32",
        NativeType::I64 => "hml_val_i64",
        NativeType::U8 => "hml_val_u8",
        NativeType::U16 => "hml_val_u16",
        NativeType::U32 => "hml_val_u32",
        NativeType::U64 => "hml_val_u64",
        NativeType::F32 => "hml_val_f32",
        NativeType::F64 => "hml_val_f64",
        NativeType::Bool => "hml_val_bool",
    }
}

/// Coercion helper from a boxed value to a native width.
pub(crate) fn unbox_fn(native: NativeType) -> &'static str {
    match native {
        NativeType::I8 => "hml_to_i8",
        NativeType::I16 => "hml_to_i16",
        NativeType::I32 => "hml_to_i32",
        NativeType::I64 => "hml_to_i64",
        NativeType::U8 => "hml_to_u8",
        NativeType::U16 => "hml_to_u16",
        NativeType::U32 => "hml_to_u32",
        NativeType::U64 => "hml_to_u64",
        NativeType::F32 => "hml_to_f32",
        NativeType::F64 => "hml_to_f64",
        NativeType::Bool => "hml_to_bool",
    }
}

/// Op code constant for the boxed binary intrinsic `hml_binop`.
pub(crate) fn binop_code(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "HML_OP_ADD",
        BinaryOp::Sub => "HML_OP_SUB",
        BinaryOp::Mul => "HML_OP_MUL",
        BinaryOp::Div => "HML_OP_DIV",
        BinaryOp::Mod => "HML_OP_MOD",
        BinaryOp::Eq => "HML_OP_EQ",
        BinaryOp::Ne => "HML_OP_NE",
        BinaryOp::Lt => "HML_OP_LT",
        BinaryOp::Le => "HML_OP_LE",
        BinaryOp::Gt => "HML_OP_GT",
        BinaryOp::Ge => "HML_OP_GE",
        BinaryOp::BitAnd => "HML_OP_BAND",
        BinaryOp::BitOr => "HML_OP_BOR",
        BinaryOp::BitXor => "HML_OP_BXOR",
        BinaryOp::Shl => "HML_OP_SHL",
        BinaryOp::Shr => "HML_OP_SHR",
        // Short-circuit operators never reach the intrinsic table.
        BinaryOp::And | BinaryOp::Or => "HML_OP_INVALID",
    }
}

/// Op code constant for the boxed unary intrinsic `hml_unop`.
pub(crate) fn unop_code(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Not => "HML_UNARY_NOT",
        UnaryOp::Neg => "HML_UNARY_NEG",
        UnaryOp::BitNot => "HML_UNARY_BNOT",
    }
}

/// Wrapping native arithmetic helper, when the operator has one.
///
/// Signed overflow is UB in C, so native `+`, `-`, `*` and the shifts go
/// through static-inline wrapping helpers computed in the widest width;
/// the emitter truncates back to the promoted width with a cast.
pub(crate) fn native_arith_helper(op: BinaryOp, float: bool) -> Option<&'static str> {
    if float {
        return None; // float arithmetic emits plain C operators
    }
    match op {
        BinaryOp::Add => Some("hml_add_i64"),
        BinaryOp::Sub => Some("hml_sub_i64"),
        BinaryOp::Mul => Some("hml_mul_i64"),
        BinaryOp::Shl => Some("hml_shl_i64"),
        BinaryOp::Shr => Some("hml_shr_i64"),
        _ => None,
    }
}

/// Builtin dispatch constant for `hml_builtin_call`.
pub(crate) fn builtin_code(builtin: crate::builtins::Builtin) -> &'static str {
    use crate::builtins::Builtin;
    match builtin {
        Builtin::Print => "HML_BUILTIN_PRINT",
        Builtin::Len => "HML_BUILTIN_LEN",
        Builtin::Str => "HML_BUILTIN_STR",
        Builtin::TypeOf => "HML_BUILTIN_TYPEOF",
        Builtin::Channel => "HML_BUILTIN_CHANNEL",
        Builtin::Buffer => "HML_BUILTIN_BUFFER",
        Builtin::Open => "HML_BUILTIN_OPEN",
    }
}
