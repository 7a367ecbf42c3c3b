use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    start: usize,
    end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }
}

impl From<Span> for std::ops::Range<usize> {
    fn from(span: Span) -> Self {
        span.start..span.end
    }
}

/// Tokens of Rust source as far as canonicalization cares about them.
///
/// Keywords that introduce bindings get their own variants; the remaining
/// reserved words collapse into [`TokenKind::Keyword`]. Operators that never
/// affect scoping collapse into [`TokenKind::Operator`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Fn,
    Let,
    Mut,
    Ref,
    Move,
    For,
    In,
    If,
    While,
    Match,
    Return,
    SelfValue,
    Keyword(String),
    Identifier(String),
    Lifetime(String),
    Number(String),
    /// Full literal text including quotes and any `b`/`r#` prefix.
    StringLiteral(String),
    CharLiteral(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Lt,
    Gt,
    Colon,
    PathSep,
    Comma,
    Semi,
    Dot,
    Equals,
    Pipe,
    Arrow,
    FatArrow,
    Bang,
    Operator(String),
    Eof,
}

impl TokenKind {
    pub fn keyword(word: &str) -> Option<Self> {
        let kind = match word {
            "fn" => Self::Fn,
            "let" => Self::Let,
            "mut" => Self::Mut,
            "ref" => Self::Ref,
            "move" => Self::Move,
            "for" => Self::For,
            "in" => Self::In,
            "if" => Self::If,
            "while" => Self::While,
            "match" => Self::Match,
            "return" => Self::Return,
            "self" => Self::SelfValue,
            "as" | "async" | "await" | "break" | "const" | "continue" | "crate" | "dyn"
            | "else" | "enum" | "extern" | "false" | "impl" | "loop" | "mod" | "pub"
            | "static" | "struct" | "super" | "trait" | "true" | "type" | "unsafe" | "use"
            | "where" | "yield" | "Self" => Self::Keyword(word.to_string()),
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Fn => "fn",
            Self::Let => "let",
            Self::Mut => "mut",
            Self::Ref => "ref",
            Self::Move => "move",
            Self::For => "for",
            Self::In => "in",
            Self::If => "if",
            Self::While => "while",
            Self::Match => "match",
            Self::Return => "return",
            Self::SelfValue => "self",
            Self::Keyword(_) => "keyword",
            Self::Identifier(_) => "identifier",
            Self::Lifetime(_) => "lifetime",
            Self::Number(_) => "number",
            Self::StringLiteral(_) => "string",
            Self::CharLiteral(_) => "char",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::LBracket => "[",
            Self::RBracket => "]",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Colon => ":",
            Self::PathSep => "::",
            Self::Comma => ",",
            Self::Semi => ";",
            Self::Dot => ".",
            Self::Equals => "=",
            Self::Pipe => "|",
            Self::Arrow => "->",
            Self::FatArrow => "=>",
            Self::Bang => "!",
            Self::Operator(_) => "operator",
            Self::Eof => "eof",
        }
    }

    /// Source text of the token as it appears in canonical output.
    pub fn text(&self) -> &str {
        match self {
            Self::Keyword(text)
            | Self::Identifier(text)
            | Self::Lifetime(text)
            | Self::Number(text)
            | Self::StringLiteral(text)
            | Self::CharLiteral(text)
            | Self::Operator(text) => text,
            Self::Eof => "",
            other => other.name(),
        }
    }

    pub fn is_opener(&self) -> bool {
        matches!(self, Self::LParen | Self::LBrace | Self::LBracket)
    }

    pub fn is_closer(&self) -> bool {
        matches!(self, Self::RParen | Self::RBrace | Self::RBracket)
    }
}

impl fmt::Debug for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyword(word) => write!(f, "Keyword({word})"),
            Self::Identifier(name) => write!(f, "Identifier({name})"),
            Self::Lifetime(name) => write!(f, "Lifetime({name})"),
            Self::Number(number) => write!(f, "Number({number})"),
            Self::StringLiteral(value) => write!(f, "StringLiteral({value})"),
            Self::CharLiteral(value) => write!(f, "CharLiteral({value})"),
            Self::Operator(op) => write!(f, "Operator({op})"),
            kind => f.write_str(kind.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}
