use crate::{
    intern::Interner,
    token::{CodeRange, Keyword, LexError, TemplateChunk, Token, TokenKind},
};

/// Single-pass lexer over a UTF-8 source buffer.
///
/// Tokens are produced on demand via [`Lexer::next_token`]. The lexer never
/// aborts: lexical faults come back as [`TokenKind::Error`] tokens and
/// scanning continues at the next character.
#[derive(Debug)]
pub struct Lexer<'src> {
    source: &'src str,
    bytes: &'src [u8],
    pos: usize,
    line: u32,
}

impl<'src> Lexer<'src> {
    #[must_use]
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    /// Starts lexing at a byte offset, with `line` naming the 1-based line of
    /// that offset. Used to re-enter template-string expression spans.
    #[must_use]
    pub fn new_at(source: &'src str, start: usize, line: u32) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: start,
            line,
        }
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    #[inline]
    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    #[inline]
    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    /// Consumes the next full UTF-8 character.
    fn bump_char(&mut self) -> Option<char> {
        let rest = &self.source[self.pos..];
        let c = rest.chars().next()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Skips whitespace and comments. Returns an error when a block comment
    /// never terminates.
    fn skip_trivia(&mut self) -> Result<(), (LexError, usize)> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let comment_start = self.pos;
                    self.pos += 2;
                    let mut closed = false;
                    while let Some(b) = self.bump() {
                        if b == b'*' && self.eat(b'/') {
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err((LexError::UnterminatedBlockComment, comment_start));
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Scans the next token. At end of input an `Eof` token is returned
    /// (repeatedly, if called again).
    pub fn next_token(&mut self, interner: &mut Interner) -> Token {
        if let Err((err, start)) = self.skip_trivia() {
            return self.error_at(err, start);
        }
        let start = self.pos;
        let line = self.line;
        let Some(b) = self.peek() else {
            return Token::eof(CodeRange::new(start, start, line));
        };

        let kind = match b {
            b'0'..=b'9' => return self.lex_number(interner),
            b'"' => return self.lex_string(interner),
            b'`' => return self.lex_template(interner),
            b'\'' => return self.lex_rune(),
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => return self.lex_ident(interner),
            b'+' => {
                self.pos += 1;
                if self.eat(b'+') {
                    TokenKind::PlusPlus
                } else {
                    TokenKind::Plus
                }
            }
            b'-' => {
                self.pos += 1;
                if self.eat(b'-') {
                    TokenKind::MinusMinus
                } else {
                    TokenKind::Minus
                }
            }
            b'*' => {
                self.pos += 1;
                TokenKind::Star
            }
            b'/' => {
                self.pos += 1;
                TokenKind::Slash
            }
            b'%' => {
                self.pos += 1;
                TokenKind::Percent
            }
            b'=' => {
                self.pos += 1;
                if self.eat(b'=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Eq
                }
            }
            b'!' => {
                self.pos += 1;
                if self.eat(b'=') {
                    TokenKind::BangEq
                } else {
                    TokenKind::Bang
                }
            }
            b'<' => {
                self.pos += 1;
                if self.eat(b'=') {
                    TokenKind::LtEq
                } else if self.eat(b'<') {
                    TokenKind::Shl
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                self.pos += 1;
                if self.eat(b'=') {
                    TokenKind::GtEq
                } else if self.eat(b'>') {
                    TokenKind::Shr
                } else {
                    TokenKind::Gt
                }
            }
            b'&' => {
                self.pos += 1;
                if self.eat(b'&') {
                    TokenKind::AmpAmp
                } else {
                    TokenKind::Amp
                }
            }
            b'|' => {
                self.pos += 1;
                if self.eat(b'|') {
                    TokenKind::PipePipe
                } else {
                    TokenKind::Pipe
                }
            }
            b'^' => {
                self.pos += 1;
                TokenKind::Caret
            }
            b'~' => {
                self.pos += 1;
                TokenKind::Tilde
            }
            b'?' => {
                self.pos += 1;
                if self.eat(b'.') {
                    TokenKind::QuestionDot
                } else if self.eat(b'?') {
                    TokenKind::QuestionQuestion
                } else {
                    TokenKind::Question
                }
            }
            b':' => {
                self.pos += 1;
                TokenKind::Colon
            }
            b';' => {
                self.pos += 1;
                TokenKind::Semicolon
            }
            b',' => {
                self.pos += 1;
                TokenKind::Comma
            }
            b'.' => {
                self.pos += 1;
                if self.peek() == Some(b'.') && self.peek_at(1) == Some(b'.') {
                    self.pos += 2;
                    TokenKind::Ellipsis
                } else {
                    TokenKind::Dot
                }
            }
            b'(' => {
                self.pos += 1;
                TokenKind::LParen
            }
            b')' => {
                self.pos += 1;
                TokenKind::RParen
            }
            b'{' => {
                self.pos += 1;
                TokenKind::LBrace
            }
            b'}' => {
                self.pos += 1;
                TokenKind::RBrace
            }
            b'[' => {
                self.pos += 1;
                TokenKind::LBracket
            }
            b']' => {
                self.pos += 1;
                TokenKind::RBracket
            }
            _ => {
                // Consume a full codepoint so we do not split UTF-8.
                let c = self.bump_char().unwrap_or('\u{fffd}');
                TokenKind::Error(LexError::StrayChar(c))
            }
        };

        Token {
            kind,
            position: CodeRange::new(start, self.pos, line),
        }
    }

    fn error_at(&mut self, err: LexError, start: usize) -> Token {
        Token {
            kind: TokenKind::Error(err),
            position: CodeRange::new(start, self.pos, self.line),
        }
    }

    fn lex_ident(&mut self, interner: &mut Interner) -> Token {
        let start = self.pos;
        let line = self.line;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.source[start..self.pos];
        let kind = match text.parse::<Keyword>() {
            Ok(kw) => TokenKind::Keyword(kw),
            Err(_) => TokenKind::Ident(interner.intern(text)),
        };
        Token {
            kind,
            position: CodeRange::new(start, self.pos, line),
        }
    }

    fn lex_number(&mut self, _interner: &mut Interner) -> Token {
        let start = self.pos;
        let line = self.line;

        // Radix prefixes produce integers only.
        if self.peek() == Some(b'0') {
            let radix = match self.peek_at(1) {
                Some(b'x' | b'X') => Some(16),
                Some(b'b' | b'B') => Some(2),
                Some(b'o' | b'O') => Some(8),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits_start = self.pos;
                while let Some(b) = self.peek() {
                    if (b as char).is_digit(radix) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                let digits = &self.source[digits_start..self.pos];
                let kind = match u64::from_str_radix(digits, radix) {
                    Ok(v) if !digits.is_empty() => TokenKind::Number {
                        int_value: v as i64,
                        float_value: v as f64,
                        is_float: false,
                    },
                    _ => TokenKind::Error(LexError::BadNumber),
                };
                return Token {
                    kind,
                    position: CodeRange::new(start, self.pos, line),
                };
            }
        }

        let mut is_float = false;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        // A dot begins the fractional part only when a digit follows, so
        // member access on a numeric-valued expression still lexes.
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            is_float = true;
            self.pos += 1;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let mut lookahead = 1;
            if matches!(self.peek_at(1), Some(b'+' | b'-')) {
                lookahead = 2;
            }
            if self.peek_at(lookahead).is_some_and(|b| b.is_ascii_digit()) {
                is_float = true;
                self.pos += lookahead;
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }

        let text = &self.source[start..self.pos];
        let kind = if is_float {
            match text.parse::<f64>() {
                Ok(f) => TokenKind::Number {
                    int_value: f as i64,
                    float_value: f,
                    is_float: true,
                },
                Err(_) => TokenKind::Error(LexError::BadNumber),
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => TokenKind::Number {
                    int_value: v,
                    float_value: v as f64,
                    is_float: false,
                },
                Err(_) => TokenKind::Error(LexError::BadNumber),
            }
        };
        Token {
            kind,
            position: CodeRange::new(start, self.pos, line),
        }
    }

    /// Decodes one escape sequence after the backslash has been consumed.
    fn lex_escape(&mut self) -> Result<char, LexError> {
        let Some(c) = self.bump_char() else {
            return Err(LexError::UnterminatedString);
        };
        match c {
            'n' => Ok('\n'),
            'r' => Ok('\r'),
            't' => Ok('\t'),
            '\\' => Ok('\\'),
            '"' => Ok('"'),
            '\'' => Ok('\''),
            '`' => Ok('`'),
            '0' => Ok('\0'),
            'x' | 'u' => {
                if self.bump_char() != Some('{') {
                    return Err(LexError::InvalidEscape(c));
                }
                let mut value: u32 = 0;
                let mut digits = 0;
                loop {
                    match self.bump_char() {
                        Some('}') => break,
                        Some(d) if d.is_ascii_hexdigit() && digits < 8 => {
                            value = value * 16 + d.to_digit(16).expect("hexdigit checked");
                            digits += 1;
                        }
                        _ => return Err(LexError::InvalidCodepoint),
                    }
                }
                if digits == 0 {
                    return Err(LexError::InvalidCodepoint);
                }
                char::from_u32(value).ok_or(LexError::InvalidCodepoint)
            }
            other => Err(LexError::InvalidEscape(other)),
        }
    }

    fn lex_string(&mut self, interner: &mut Interner) -> Token {
        let start = self.pos;
        let line = self.line;
        self.pos += 1; // opening quote
        let mut text = String::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    // Strings do not span lines; leave the newline for trivia.
                    return self.error_at(LexError::UnterminatedString, start);
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.lex_escape() {
                        Ok(c) => text.push(c),
                        Err(err) => return self.error_at(err, start),
                    }
                }
                Some(_) => {
                    let c = self.bump_char().expect("peeked byte");
                    text.push(c);
                }
            }
        }
        Token {
            kind: TokenKind::Str(interner.intern(&text)),
            position: CodeRange::new(start, self.pos, line),
        }
    }

    fn lex_rune(&mut self) -> Token {
        let start = self.pos;
        let line = self.line;
        self.pos += 1; // opening quote
        let c = match self.peek() {
            None => return self.error_at(LexError::UnterminatedRune, start),
            Some(b'\'') => {
                self.pos += 1;
                return self.error_at(LexError::EmptyRune, start);
            }
            Some(b'\\') => {
                self.pos += 1;
                match self.lex_escape() {
                    Ok(c) => c,
                    Err(err) => return self.error_at(err, start),
                }
            }
            Some(_) => self.bump_char().expect("peeked byte"),
        };
        if !self.eat(b'\'') {
            // More than one codepoint before the closing quote: skip to it.
            let err = if self.peek().is_none() {
                LexError::UnterminatedRune
            } else {
                while let Some(b) = self.peek() {
                    if b == b'\'' || b == b'\n' {
                        break;
                    }
                    self.bump_char();
                }
                self.eat(b'\'');
                LexError::MultiCodepointRune
            };
            return self.error_at(err, start);
        }
        Token {
            kind: TokenKind::Rune(c),
            position: CodeRange::new(start, self.pos, line),
        }
    }

    /// Lexes a backtick template string into alternating literal chunks and
    /// expression spans. Expression source is only delimited here (tracking
    /// brace depth and skipping nested string forms); the parser re-lexes
    /// each span.
    fn lex_template(&mut self, interner: &mut Interner) -> Token {
        let start = self.pos;
        let line = self.line;
        self.pos += 1; // opening backtick
        let mut chunks = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return self.error_at(LexError::UnterminatedTemplate, start),
                Some(b'`') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.lex_escape() {
                        Ok(c) => text.push(c),
                        Err(err) => return self.error_at(err, start),
                    }
                }
                Some(b'$') if self.peek_at(1) == Some(b'{') => {
                    chunks.push(TemplateChunk::Lit(interner.intern(&text)));
                    text.clear();
                    self.pos += 2;
                    let expr_start = self.pos;
                    let expr_line = self.line;
                    match self.skip_template_expr() {
                        Ok(expr_end) => {
                            chunks.push(TemplateChunk::Expr(CodeRange::new(
                                expr_start, expr_end, expr_line,
                            )));
                        }
                        Err(err) => return self.error_at(err, start),
                    }
                }
                Some(_) => {
                    let c = self.bump_char().expect("peeked byte");
                    text.push(c);
                }
            }
        }
        chunks.push(TemplateChunk::Lit(interner.intern(&text)));
        Token {
            kind: TokenKind::Template(chunks),
            position: CodeRange::new(start, self.pos, line),
        }
    }

    /// Advances past a `${…}` expression body, returning the byte offset of
    /// the closing brace. Handles nested braces and skips string literals so
    /// a `}` inside a string does not close the interpolation.
    fn skip_template_expr(&mut self) -> Result<usize, LexError> {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                None => return Err(LexError::UnterminatedTemplate),
                Some(b'{') => {
                    depth += 1;
                    self.pos += 1;
                }
                Some(b'}') => {
                    if depth == 0 {
                        let end = self.pos;
                        self.pos += 1;
                        return Ok(end);
                    }
                    depth -= 1;
                    self.pos += 1;
                }
                Some(b'"') => {
                    self.pos += 1;
                    loop {
                        match self.bump() {
                            None | Some(b'\n') => return Err(LexError::UnterminatedTemplate),
                            Some(b'\\') => {
                                self.bump();
                            }
                            Some(b'"') => break,
                            Some(_) => {}
                        }
                    }
                }
                Some(b'`') => {
                    // A nested template: skip to its closing backtick so a
                    // `}` inside it cannot close this interpolation.
                    self.pos += 1;
                    loop {
                        match self.bump() {
                            None => return Err(LexError::UnterminatedTemplate),
                            Some(b'\\') => {
                                self.bump();
                            }
                            Some(b'`') => break,
                            Some(_) => {}
                        }
                    }
                }
                Some(_) => {
                    self.bump_char();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(source: &str) -> (Vec<TokenKind>, Interner) {
        let mut interner = Interner::new();
        let mut lexer = Lexer::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = lexer.next_token(&mut interner);
            let done = token.kind == TokenKind::Eof;
            kinds.push(token.kind);
            if done {
                break;
            }
        }
        (kinds, interner)
    }

    #[test]
    fn identifiers_span_full_length() {
        let (kinds, interner) = lex_all("_abc123 zz");
        match &kinds[0] {
            TokenKind::Ident(id) => assert_eq!(interner.get(*id), "_abc123"),
            other => panic!("expected identifier, got {other:?}"),
        }
        match &kinds[1] {
            TokenKind::Ident(id) => assert_eq!(interner.get(*id), "zz"),
            other => panic!("expected identifier, got {other:?}"),
        }
    }

    #[test]
    fn every_keyword_lexes_as_keyword() {
        for (text, kw) in [
            ("let", Keyword::Let),
            ("const", Keyword::Const),
            ("fn", Keyword::Fn),
            ("if", Keyword::If),
            ("else", Keyword::Else),
            ("while", Keyword::While),
            ("for", Keyword::For),
            ("return", Keyword::Return),
            ("break", Keyword::Break),
            ("continue", Keyword::Continue),
            ("try", Keyword::Try),
            ("catch", Keyword::Catch),
            ("finally", Keyword::Finally),
            ("throw", Keyword::Throw),
            ("defer", Keyword::Defer),
            ("import", Keyword::Import),
            ("export", Keyword::Export),
            ("enum", Keyword::Enum),
            ("define", Keyword::Define),
            ("switch", Keyword::Switch),
            ("case", Keyword::Case),
            ("default", Keyword::Default),
            ("async", Keyword::Async),
            ("await", Keyword::Await),
            ("true", Keyword::True),
            ("false", Keyword::False),
            ("null", Keyword::Null),
        ] {
            let (kinds, _) = lex_all(text);
            assert_eq!(kinds[0], TokenKind::Keyword(kw), "keyword {text}");
            assert_eq!(kinds.len(), 2, "keyword {text} lexed to extra tokens");
        }
    }

    #[test]
    fn string_escapes_decode() {
        let (kinds, interner) = lex_all(r#""\n\t\"\\""#);
        match &kinds[0] {
            TokenKind::Str(id) => assert_eq!(interner.get(*id), "\n\t\"\\"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn hex_and_binary_and_octal_integers() {
        let (kinds, _) = lex_all("0xff 0b101 0o17");
        assert_eq!(
            kinds[0],
            TokenKind::Number {
                int_value: 255,
                float_value: 255.0,
                is_float: false
            }
        );
        assert_eq!(
            kinds[1],
            TokenKind::Number {
                int_value: 5,
                float_value: 5.0,
                is_float: false
            }
        );
        assert_eq!(
            kinds[2],
            TokenKind::Number {
                int_value: 15,
                float_value: 15.0,
                is_float: false
            }
        );
    }

    #[test]
    fn dot_and_exponent_trigger_float() {
        let (kinds, _) = lex_all("1.5 2e3 7");
        assert!(matches!(
            kinds[0],
            TokenKind::Number { is_float: true, float_value, .. } if float_value == 1.5
        ));
        assert!(matches!(
            kinds[1],
            TokenKind::Number { is_float: true, float_value, .. } if float_value == 2000.0
        ));
        assert!(matches!(kinds[2], TokenKind::Number { is_float: false, int_value: 7, .. }));
    }

    #[test]
    fn rune_literals_decode_multibyte() {
        let (kinds, _) = lex_all("'a' '\\n' '\u{e9}'");
        assert_eq!(kinds[0], TokenKind::Rune('a'));
        assert_eq!(kinds[1], TokenKind::Rune('\n'));
        assert_eq!(kinds[2], TokenKind::Rune('\u{e9}'));
    }

    #[test]
    fn template_splits_literal_and_expr_chunks() {
        let source = "`a${x + 1}b`";
        let (kinds, interner) = lex_all(source);
        match &kinds[0] {
            TokenKind::Template(chunks) => {
                assert_eq!(chunks.len(), 3);
                match &chunks[0] {
                    TemplateChunk::Lit(id) => assert_eq!(interner.get(*id), "a"),
                    other => panic!("expected literal chunk, got {other:?}"),
                }
                match &chunks[1] {
                    TemplateChunk::Expr(range) => assert_eq!(range.text(source), "x + 1"),
                    other => panic!("expected expr chunk, got {other:?}"),
                }
            }
            other => panic!("expected template, got {other:?}"),
        }
    }

    #[test]
    fn comments_are_skipped_and_lines_tracked() {
        let mut interner = Interner::new();
        let mut lexer = Lexer::new("// line\n/* block\nstill */ x");
        let token = lexer.next_token(&mut interner);
        assert!(matches!(token.kind, TokenKind::Ident(_)));
        assert_eq!(token.position.line, 3);
    }

    #[test]
    fn faults_become_error_tokens_not_panics() {
        let (kinds, _) = lex_all("\"abc");
        assert!(matches!(
            kinds[0],
            TokenKind::Error(LexError::UnterminatedString)
        ));
        let (kinds, _) = lex_all("''");
        assert!(matches!(kinds[0], TokenKind::Error(LexError::EmptyRune)));
        let (kinds, _) = lex_all("@");
        assert!(matches!(kinds[0], TokenKind::Error(LexError::StrayChar('@'))));
    }
}
