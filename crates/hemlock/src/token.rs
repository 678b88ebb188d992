use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

use crate::intern::StringId;

/// Byte range into the original source buffer.
///
/// The source buffer outlives all downstream tokens and AST nodes, so spans
/// can always be resolved back to text for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeRange {
    /// Byte offset of the first byte of the lexeme.
    pub start: u32,
    /// Byte offset one past the last byte of the lexeme.
    pub end: u32,
    /// 1-based source line of the first byte.
    pub line: u32,
}

impl CodeRange {
    #[must_use]
    pub fn new(start: usize, end: usize, line: u32) -> Self {
        Self {
            start: start as u32,
            end: end as u32,
            line,
        }
    }

    /// Resolves the span back to source text.
    #[must_use]
    pub fn text<'s>(&self, source: &'s str) -> &'s str {
        &source[self.start as usize..self.end as usize]
    }
}

/// Reserved words of the language.
///
/// Matched after identifier scanning: the keyword table wins over a plain
/// identifier. `in`, `ref`, `from`, and `as` are contextual (recognized by
/// the parser where the grammar calls for them) and deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    Let,
    Const,
    Fn,
    If,
    Else,
    While,
    For,
    Return,
    Break,
    Continue,
    Try,
    Catch,
    Finally,
    Throw,
    Defer,
    Import,
    Export,
    Enum,
    Define,
    Switch,
    Case,
    Default,
    Async,
    Await,
    True,
    False,
    Null,
}

/// Lexical faults. Surfaced as [`TokenKind::Error`] tokens so the lexer
/// never aborts; the parser promotes them to diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexError {
    UnterminatedString,
    UnterminatedTemplate,
    UnterminatedRune,
    UnterminatedBlockComment,
    InvalidEscape(char),
    EmptyRune,
    MultiCodepointRune,
    InvalidCodepoint,
    BadNumber,
    StrayChar(char),
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnterminatedString => write!(f, "unterminated string literal"),
            Self::UnterminatedTemplate => write!(f, "unterminated template string"),
            Self::UnterminatedRune => write!(f, "unterminated rune literal"),
            Self::UnterminatedBlockComment => write!(f, "unterminated block comment"),
            Self::InvalidEscape(c) => write!(f, "invalid escape sequence '\\{c}'"),
            Self::EmptyRune => write!(f, "empty rune literal"),
            Self::MultiCodepointRune => write!(f, "rune literal contains more than one codepoint"),
            Self::InvalidCodepoint => write!(f, "invalid unicode codepoint"),
            Self::BadNumber => write!(f, "malformed numeric literal"),
            Self::StrayChar(c) => write!(f, "unexpected character '{c}'"),
        }
    }
}

/// One piece of a template string literal.
///
/// A template string lexes to alternating literal chunks and `${…}`
/// expression spans. The expression source is not tokenized here; the parser
/// re-enters the lexer on each span, keeping template nesting out of the
/// token stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateChunk {
    /// Decoded literal text between interpolations.
    Lit(StringId),
    /// Byte span of the expression source inside `${…}` (braces excluded).
    Expr(CodeRange),
}

/// Token tags produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Numeric literal carrying the decoded integer, the decoded float, and
    /// a flag saying which of the two is authoritative.
    Number {
        int_value: i64,
        float_value: f64,
        is_float: bool,
    },
    /// String literal with escapes decoded.
    Str(StringId),
    /// Backtick template string.
    Template(Vec<TemplateChunk>),
    /// Rune literal, exactly one codepoint.
    Rune(char),
    Ident(StringId),
    Keyword(Keyword),

    // operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    BangEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AmpAmp,
    PipePipe,
    Amp,
    Pipe,
    Caret,
    Shl,
    Shr,
    Bang,
    Tilde,
    Eq,
    PlusPlus,
    MinusMinus,
    Question,
    QuestionDot,
    QuestionQuestion,

    // punctuation
    Colon,
    Semicolon,
    Comma,
    Dot,
    Ellipsis,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,

    Eof,
    /// Lexical fault; the parser reports it and continues in panic mode.
    Error(LexError),
}

impl TokenKind {
    /// Human-readable tag for diagnostics ("expected X, found Y").
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Number { .. } => "number",
            Self::Str(_) => "string",
            Self::Template(_) => "template string",
            Self::Rune(_) => "rune",
            Self::Ident(_) => "identifier",
            Self::Keyword(k) => (*k).into(),
            Self::Plus => "'+'",
            Self::Minus => "'-'",
            Self::Star => "'*'",
            Self::Slash => "'/'",
            Self::Percent => "'%'",
            Self::EqEq => "'=='",
            Self::BangEq => "'!='",
            Self::Lt => "'<'",
            Self::LtEq => "'<='",
            Self::Gt => "'>'",
            Self::GtEq => "'>='",
            Self::AmpAmp => "'&&'",
            Self::PipePipe => "'||'",
            Self::Amp => "'&'",
            Self::Pipe => "'|'",
            Self::Caret => "'^'",
            Self::Shl => "'<<'",
            Self::Shr => "'>>'",
            Self::Bang => "'!'",
            Self::Tilde => "'~'",
            Self::Eq => "'='",
            Self::PlusPlus => "'++'",
            Self::MinusMinus => "'--'",
            Self::Question => "'?'",
            Self::QuestionDot => "'?.'",
            Self::QuestionQuestion => "'??'",
            Self::Colon => "':'",
            Self::Semicolon => "';'",
            Self::Comma => "','",
            Self::Dot => "'.'",
            Self::Ellipsis => "'...'",
            Self::LParen => "'('",
            Self::RParen => "')'",
            Self::LBrace => "'{'",
            Self::RBrace => "'}'",
            Self::LBracket => "'['",
            Self::RBracket => "']'",
            Self::Eof => "end of input",
            Self::Error(_) => "invalid token",
        }
    }
}

/// A lexed token: tag plus the byte span and 1-based line of its lexeme.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: CodeRange,
}

impl Token {
    #[must_use]
    pub fn eof(position: CodeRange) -> Self {
        Self {
            kind: TokenKind::Eof,
            position,
        }
    }
}
