use super::token::{Span, Token, TokenKind};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LexerError {
    #[error("unterminated string literal (line {line}, column {column})")]
    UnterminatedString {
        line: usize,
        column: usize,
        span: Span,
    },
    #[error("unterminated character literal (line {line}, column {column})")]
    UnterminatedChar {
        line: usize,
        column: usize,
        span: Span,
    },
    #[error("unterminated block comment (line {line}, column {column})")]
    UnterminatedComment {
        line: usize,
        column: usize,
        span: Span,
    },
    #[error("unexpected character `{ch}` (line {line}, column {column})")]
    UnexpectedCharacter {
        ch: char,
        line: usize,
        column: usize,
        span: Span,
    },
}

impl LexerError {
    pub fn span(&self) -> Span {
        match self {
            Self::UnterminatedString { span, .. }
            | Self::UnterminatedChar { span, .. }
            | Self::UnterminatedComment { span, .. }
            | Self::UnexpectedCharacter { span, .. } => *span,
        }
    }
}

pub type LexResult<T> = Result<T, Vec<LexerError>>;

/// Lexes Rust source into tokens, dropping whitespace and comments.
///
/// Lexing keeps going after an error so every problem in the source is
/// reported at once.
pub fn tokenize(source: &str) -> LexResult<Vec<Token>> {
    let mut cursor = Cursor::new(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    while let Some(ch) = cursor.peek() {
        let start = cursor.offset;
        let (line, column) = (cursor.line, cursor.column);

        let lexed = match ch {
            c if c.is_whitespace() => {
                cursor.bump();
                continue;
            }
            '/' if cursor.peek_nth(1) == Some('/') => {
                cursor.eat_while(|c| c != '\n');
                continue;
            }
            '/' if cursor.peek_nth(1) == Some('*') => {
                if !skip_block_comment(&mut cursor) {
                    errors.push(LexerError::UnterminatedComment {
                        line,
                        column,
                        span: Span::new(start, cursor.offset),
                    });
                }
                continue;
            }
            '"' => lex_string(&mut cursor, start),
            '\'' => lex_quote(&mut cursor, start),
            c if c.is_ascii_digit() => Ok(lex_number(&mut cursor, start)),
            c if is_ident_start(c) => lex_word(&mut cursor, start),
            _ => lex_punct(&mut cursor).ok_or(ErrorKind::Unexpected(ch)),
        };

        match lexed {
            Ok(kind) => tokens.push(Token::new(kind, Span::new(start, cursor.offset))),
            Err(kind) => {
                let span = Span::new(start, cursor.offset.max(start + ch.len_utf8()));
                errors.push(kind.into_error(line, column, span));
                if cursor.offset == start {
                    cursor.bump();
                }
            }
        }
    }

    let end = cursor.offset;
    tokens.push(Token::new(TokenKind::Eof, Span::new(end, end)));

    if errors.is_empty() {
        Ok(tokens)
    } else {
        Err(errors)
    }
}

enum ErrorKind {
    String,
    Char,
    Unexpected(char),
}

impl ErrorKind {
    fn into_error(self, line: usize, column: usize, span: Span) -> LexerError {
        match self {
            Self::String => LexerError::UnterminatedString { line, column, span },
            Self::Char => LexerError::UnterminatedChar { line, column, span },
            Self::Unexpected(ch) => LexerError::UnexpectedCharacter {
                ch,
                line,
                column,
                span,
            },
        }
    }
}

struct Cursor<'a> {
    source: &'a str,
    offset: usize,
    line: usize,
    column: usize,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            offset: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.offset..].chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.source[self.offset..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.offset += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn eat_while(&mut self, predicate: impl Fn(char) -> bool) {
        while self.peek().is_some_and(&predicate) {
            self.bump();
        }
    }

    fn slice_from(&self, start: usize) -> &'a str {
        &self.source[start..self.offset]
    }
}

fn is_ident_start(ch: char) -> bool {
    ch == '_' || ch.is_alphabetic()
}

fn is_ident_continue(ch: char) -> bool {
    ch == '_' || ch.is_alphanumeric()
}

/// Block comments nest in Rust.
fn skip_block_comment(cursor: &mut Cursor<'_>) -> bool {
    cursor.bump();
    cursor.bump();
    let mut depth = 1usize;
    while let Some(ch) = cursor.bump() {
        match ch {
            '/' if cursor.peek() == Some('*') => {
                cursor.bump();
                depth += 1;
            }
            '*' if cursor.peek() == Some('/') => {
                cursor.bump();
                depth -= 1;
                if depth == 0 {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

fn lex_string(cursor: &mut Cursor<'_>, start: usize) -> Result<TokenKind, ErrorKind> {
    cursor.bump();
    loop {
        match cursor.bump() {
            None => return Err(ErrorKind::String),
            Some('\\') => {
                cursor.bump();
            }
            Some('"') => break,
            Some(_) => {}
        }
    }
    Ok(TokenKind::StringLiteral(cursor.slice_from(start).to_string()))
}

/// Number of `#` marks of a raw string starting `skip` chars ahead, if one
/// starts there at all.
fn raw_string_hashes(cursor: &Cursor<'_>, skip: usize) -> Option<usize> {
    let mut hashes = 0;
    loop {
        match cursor.peek_nth(skip + hashes)? {
            '#' => hashes += 1,
            '"' => return Some(hashes),
            _ => return None,
        }
    }
}

fn lex_raw_string(
    cursor: &mut Cursor<'_>,
    start: usize,
    prefix: usize,
    hashes: usize,
) -> Result<TokenKind, ErrorKind> {
    for _ in 0..prefix + hashes + 1 {
        cursor.bump();
    }
    loop {
        match cursor.bump() {
            None => return Err(ErrorKind::String),
            Some('"') => {
                if (0..hashes).all(|n| cursor.peek_nth(n) == Some('#')) {
                    for _ in 0..hashes {
                        cursor.bump();
                    }
                    break;
                }
            }
            Some(_) => {}
        }
    }
    Ok(TokenKind::StringLiteral(cursor.slice_from(start).to_string()))
}

/// `'a'`, `'\n'` and `'\u{1F600}'` are characters; `'a` is a lifetime.
fn lex_quote(cursor: &mut Cursor<'_>, start: usize) -> Result<TokenKind, ErrorKind> {
    match (cursor.peek_nth(1), cursor.peek_nth(2)) {
        (Some('\\'), _) => {
            cursor.bump();
            cursor.bump();
            cursor.bump();
            loop {
                match cursor.bump() {
                    None | Some('\n') => return Err(ErrorKind::Char),
                    Some('\'') => break,
                    Some(_) => {}
                }
            }
            Ok(TokenKind::CharLiteral(cursor.slice_from(start).to_string()))
        }
        (Some(_), Some('\'')) => {
            cursor.bump();
            cursor.bump();
            cursor.bump();
            Ok(TokenKind::CharLiteral(cursor.slice_from(start).to_string()))
        }
        (Some(c), _) if is_ident_start(c) => {
            cursor.bump();
            cursor.eat_while(is_ident_continue);
            Ok(TokenKind::Lifetime(cursor.slice_from(start).to_string()))
        }
        _ => Err(ErrorKind::Char),
    }
}

fn lex_number(cursor: &mut Cursor<'_>, start: usize) -> TokenKind {
    let radix_prefix =
        cursor.peek() == Some('0') && matches!(cursor.peek_nth(1), Some('x' | 'o' | 'b'));
    cursor.bump();
    loop {
        match cursor.peek() {
            Some(c) if c.is_ascii_alphanumeric() || c == '_' => {
                let exponent = !radix_prefix
                    && matches!(c, 'e' | 'E')
                    && cursor
                        .slice_from(start)
                        .chars()
                        .all(|d| d.is_ascii_digit() || d == '_' || d == '.');
                cursor.bump();
                if exponent
                    && matches!(cursor.peek(), Some('+' | '-'))
                    && cursor.peek_nth(1).is_some_and(|d| d.is_ascii_digit())
                {
                    cursor.bump();
                }
            }
            Some('.')
                if !radix_prefix
                    && !cursor.slice_from(start).contains('.')
                    && cursor.peek_nth(1).is_some_and(|d| d.is_ascii_digit()) =>
            {
                cursor.bump();
            }
            _ => break,
        }
    }
    TokenKind::Number(cursor.slice_from(start).to_string())
}

fn lex_word(cursor: &mut Cursor<'_>, start: usize) -> Result<TokenKind, ErrorKind> {
    match (cursor.peek(), cursor.peek_nth(1), cursor.peek_nth(2)) {
        (Some('r'), Some('"' | '#'), _) => {
            if let Some(hashes) = raw_string_hashes(cursor, 1) {
                return lex_raw_string(cursor, start, 1, hashes);
            }
        }
        (Some('b'), Some('r'), Some('"' | '#')) => {
            if let Some(hashes) = raw_string_hashes(cursor, 2) {
                return lex_raw_string(cursor, start, 2, hashes);
            }
        }
        (Some('b'), Some('"'), _) => {
            cursor.bump();
            return lex_string(cursor, start);
        }
        (Some('b'), Some('\''), _) => {
            cursor.bump();
            return match lex_quote(cursor, start)? {
                kind @ TokenKind::CharLiteral(_) => Ok(kind),
                _ => Err(ErrorKind::Char),
            };
        }
        _ => {}
    }

    // Raw identifiers keep their `r#` so they never collide with keywords.
    if cursor.peek() == Some('r')
        && cursor.peek_nth(1) == Some('#')
        && cursor.peek_nth(2).is_some_and(is_ident_start)
    {
        cursor.bump();
        cursor.bump();
        cursor.eat_while(is_ident_continue);
        return Ok(TokenKind::Identifier(cursor.slice_from(start).to_string()));
    }

    cursor.eat_while(is_ident_continue);
    let word = cursor.slice_from(start);
    Ok(TokenKind::keyword(word).unwrap_or_else(|| TokenKind::Identifier(word.to_string())))
}

fn lex_punct(cursor: &mut Cursor<'_>) -> Option<TokenKind> {
    let ch = cursor.peek()?;
    let next = cursor.peek_nth(1);
    let op = |text: &str| TokenKind::Operator(text.to_string());

    let (kind, len) = match (ch, next) {
        (':', Some(':')) => (TokenKind::PathSep, 2),
        ('-', Some('>')) => (TokenKind::Arrow, 2),
        ('=', Some('>')) => (TokenKind::FatArrow, 2),
        ('=', Some('=')) => (op("=="), 2),
        ('!', Some('=')) => (op("!="), 2),
        ('<', Some('=')) => (op("<="), 2),
        ('>', Some('=')) => (op(">="), 2),
        ('&', Some('&')) => (op("&&"), 2),
        ('|', Some('|')) => (op("||"), 2),
        ('.', Some('.')) => match cursor.peek_nth(2) {
            Some('=') => (op("..="), 3),
            Some('.') => (op("..."), 3),
            _ => (op(".."), 2),
        },
        ('+' | '-' | '*' | '/' | '%' | '^' | '&' | '|', Some('=')) => {
            (TokenKind::Operator(format!("{ch}=")), 2)
        }
        ('(', _) => (TokenKind::LParen, 1),
        (')', _) => (TokenKind::RParen, 1),
        ('{', _) => (TokenKind::LBrace, 1),
        ('}', _) => (TokenKind::RBrace, 1),
        ('[', _) => (TokenKind::LBracket, 1),
        (']', _) => (TokenKind::RBracket, 1),
        ('<', _) => (TokenKind::Lt, 1),
        ('>', _) => (TokenKind::Gt, 1),
        (':', _) => (TokenKind::Colon, 1),
        (',', _) => (TokenKind::Comma, 1),
        (';', _) => (TokenKind::Semi, 1),
        ('.', _) => (TokenKind::Dot, 1),
        ('=', _) => (TokenKind::Equals, 1),
        ('|', _) => (TokenKind::Pipe, 1),
        ('!', _) => (TokenKind::Bang, 1),
        ('+' | '-' | '*' | '/' | '%' | '^' | '&' | '~' | '@' | '#' | '$' | '?', _) => {
            (TokenKind::Operator(ch.to_string()), 1)
        }
        _ => return None,
    };

    for _ in 0..len {
        cursor.bump();
    }
    Some(kind)
}
