use ahash::AHashMap;

/// Identifier for an interned string.
///
/// Interned strings are deduplicated: interning the same text twice returns
/// the same `StringId`, so identifier comparison is an integer compare and
/// environment lookup never hashes text at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringId(u32);

impl StringId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Mutable string interner used while lexing and parsing.
///
/// Freeze into [`Interns`] once the compilation unit is built; downstream
/// phases (analysis, interpretation, codegen) only ever read.
#[derive(Debug, Default)]
pub struct Interner {
    map: AHashMap<Box<str>, StringId>,
    strings: Vec<Box<str>>,
}

impl Interner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `text`, returning the existing id when already present.
    pub fn intern(&mut self, text: &str) -> StringId {
        if let Some(&id) = self.map.get(text) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("interner overflow"));
        let boxed: Box<str> = text.into();
        self.strings.push(boxed.clone());
        self.map.insert(boxed, id);
        id
    }

    /// Returns the text for an id issued by this interner.
    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    /// Freezes the interner into a read-only table.
    #[must_use]
    pub fn finish(self) -> Interns {
        Interns {
            strings: self.strings,
        }
    }
}

/// Read-only interned string table owned by a compilation unit.
#[derive(Debug)]
pub struct Interns {
    strings: Vec<Box<str>>,
}

impl Interns {
    /// Appends a string produced after parsing (e.g. by constant folding).
    ///
    /// Unlike [`Interner::intern`] this does not deduplicate; post-parse
    /// additions are rare enough that a lookup table is not worth carrying.
    pub(crate) fn push(&mut self, text: &str) -> StringId {
        let id = StringId(u32::try_from(self.strings.len()).expect("interner overflow"));
        self.strings.push(text.into());
        id
    }

    /// Returns the text for an interned id.
    ///
    /// # Panics
    /// Panics if `id` was not issued by the interner this table came from.
    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    /// Finds the id for exact text, if it was interned. Linear scan; used by
    /// builtin-name resolution at startup and by tests, never in hot paths.
    #[must_use]
    pub fn lookup(&self, text: &str) -> Option<StringId> {
        self.strings
            .iter()
            .position(|s| &**s == text)
            .map(|i| StringId(u32::try_from(i).expect("interner overflow")))
    }

    /// Number of interned strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_deduplicates() {
        let mut interner = Interner::new();
        let a = interner.intern("foo");
        let b = interner.intern("bar");
        let c = interner.intern("foo");
        assert_eq!(a, c);
        assert_ne!(a, b);
        let interns = interner.finish();
        assert_eq!(interns.get(a), "foo");
        assert_eq!(interns.get(b), "bar");
    }
}
