//! Deterministic identifier mangling for the C backend.
//!
//! Identifiers are emitted verbatim unless they would collide with a C
//! keyword, the runtime's reserved prefixes (`hml_`, `Hml`), or one of the
//! emitter's own prefixes (temporaries, labels, module and mangling
//! prefixes). Reserved names gain the fixed prefix `u_`; `u_` itself is
//! reserved so the transform stays injective. Imported identifiers receive
//! a module prefix keyed on the module path.

/// C keywords and common libc names the emitter must never shadow.
const C_RESERVED: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while", "bool", "true", "false", "main", "errno",
    "NULL",
];

fn is_reserved(name: &str) -> bool {
    C_RESERVED.contains(&name)
        || name.starts_with("hml_")
        || name.starts_with("Hml")
        || name.starts_with("u_")
        || name.starts_with("m_")
        || name.starts_with("__")
}

/// Mangles one identifier.
#[must_use]
pub(crate) fn mangle(name: &str) -> String {
    if is_reserved(name) {
        format!("u_{name}")
    } else {
        name.to_owned()
    }
}

/// Builds a module prefix key from a module path: non-identifier bytes
/// collapse to underscores, keeping the transform textual and stable.
#[must_use]
pub(crate) fn module_key(path: &str) -> String {
    let mut key = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c);
        } else {
            key.push('_');
        }
    }
    key
}

/// Mangles an identifier imported from the given module path.
#[must_use]
pub(crate) fn mangle_imported(module_path: &str, name: &str) -> String {
    format!("m_{}__{}", module_key(module_path), mangle(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(mangle("count"), "count");
        assert_eq!(mangle("fooBar2"), "fooBar2");
    }

    #[test]
    fn c_keywords_gain_prefix() {
        assert_eq!(mangle("int"), "u_int");
        assert_eq!(mangle("switch"), "u_switch");
        assert_eq!(mangle("main"), "u_main");
    }

    #[test]
    fn reserved_prefixes_gain_prefix() {
        assert_eq!(mangle("hml_thing"), "u_hml_thing");
        assert_eq!(mangle("HmlValue"), "u_HmlValue");
        assert_eq!(mangle("__secret"), "u___secret");
        assert_eq!(mangle("m_mod"), "u_m_mod");
    }

    #[test]
    fn transform_is_injective_over_u_prefix() {
        // A user identifier that already looks mangled must not collide
        // with the mangling of another identifier.
        assert_eq!(mangle("u_int"), "u_u_int");
        assert_ne!(mangle("u_int"), mangle("int"));
    }

    #[test]
    fn imported_names_carry_module_prefix() {
        assert_eq!(mangle_imported("lib/math", "add"), "m_lib_math__add");
        assert_eq!(mangle_imported("a.b", "int"), "m_a_b__u_int");
    }

    #[test]
    fn mangling_is_deterministic() {
        for name in ["x", "int", "hml_x", "u_y"] {
            assert_eq!(mangle(name), mangle(name));
        }
    }
}
