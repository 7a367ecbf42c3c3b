//! Rewrites Rust source into a form that does not depend on local names.
//!
//! Function parameters, `let` bindings, `if let`/`while let` bindings, `for`
//! patterns, match-arm patterns and closure parameters become `$v<n>`,
//! numbered per function. Names declared with `fn` become `$f<n>`, numbered
//! once for the whole source unit. Everything else, including free names,
//! field and method names, paths and macro names, is kept verbatim. `$`
//! cannot appear in a Rust identifier, so a renamed token never collides
//! with a free name.
//!
//! Shorthand fields are spelled out (`P { a }` reads as `P { a : $v0 }`) so
//! the field a value lands in stays part of the canonical form. Inline
//! captures in the format string of a macro call (`"{x}"`) are renamed along
//! with the binding they refer to.

use std::collections::HashMap;
use std::mem;

use thiserror::Error;

use super::token::{Span, Token, TokenKind};
use super::tokenizer::{LexerError, tokenize};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanonicalizeError {
    #[error("source could not be lexed ({} error(s))", .0.len())]
    Lex(Vec<LexerError>),
    #[error("unbalanced `{delimiter}` at byte {}", .span.start())]
    Unbalanced { delimiter: &'static str, span: Span },
}

/// Canonical form of `source`: tokens joined by single spaces, with local
/// bindings renamed by position.
pub fn canonicalize(source: &str) -> Result<String, CanonicalizeError> {
    let tokens = tokenize(source).map_err(CanonicalizeError::Lex)?;
    Normalizer::new(&tokens).run()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Block { owns_frame: bool },
    /// Parameters of a closure whose body is a bare expression.
    Expression,
    /// Bindings of a match arm, live until the arm ends.
    Arm,
}

#[derive(Debug)]
struct Scope {
    names: HashMap<String, String>,
    level: usize,
    kind: ScopeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Visible once the enclosing statement ends.
    Statement,
    /// Visible inside the next block opened at the same level.
    Block,
    /// Like `Block`, and the block closes the function frame.
    FunctionBody,
}

#[derive(Debug)]
struct MacroCall {
    level: usize,
    format_seen: bool,
}

#[derive(Debug)]
struct Pending {
    names: Vec<(String, String)>,
    level: usize,
    trigger: Trigger,
}

struct Normalizer<'t> {
    tokens: &'t [Token],
    pos: usize,
    out: Vec<String>,
    delimiters: Vec<(TokenKind, Span)>,
    scopes: Vec<Scope>,
    frames: Vec<usize>,
    declared: HashMap<String, String>,
    pending: Vec<Pending>,
    /// Levels of the braces that hold struct literals.
    struct_literals: Vec<usize>,
    macro_calls: Vec<MacroCall>,
    /// Levels at which a `match` waits for its body.
    pending_matches: Vec<usize>,
}

impl<'t> Normalizer<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            out: Vec::with_capacity(tokens.len()),
            delimiters: Vec::new(),
            scopes: vec![Scope {
                names: HashMap::new(),
                level: 0,
                kind: ScopeKind::Block { owns_frame: false },
            }],
            frames: vec![0],
            declared: HashMap::new(),
            pending: Vec::new(),
            struct_literals: Vec::new(),
            macro_calls: Vec::new(),
            pending_matches: Vec::new(),
        }
    }

    fn run(mut self) -> Result<String, CanonicalizeError> {
        let tokens = self.tokens;
        while let Some(token) = tokens.get(self.pos) {
            match &token.kind {
                TokenKind::Eof => break,
                TokenKind::Fn if matches!(self.kind_at(self.pos + 1), Some(TokenKind::Identifier(_))) => {
                    self.function();
                }
                TokenKind::Let => self.let_binding(),
                TokenKind::For if self.is_for_loop() => self.for_loop(),
                TokenKind::Pipe if self.starts_closure() => self.closure(),
                TokenKind::Match => {
                    self.pending_matches.push(self.level());
                    self.emit_current();
                }
                TokenKind::LBrace => self.open_block(token.span),
                kind @ (TokenKind::LParen | TokenKind::LBracket) => {
                    let closer = if *kind == TokenKind::LParen {
                        TokenKind::RParen
                    } else {
                        TokenKind::RBracket
                    };
                    let macro_call = matches!(self.previous_kind(), Some(TokenKind::Bang))
                        && matches!(
                            self.pos.checked_sub(2).and_then(|pos| self.kind_at(pos)),
                            Some(TokenKind::Identifier(_))
                        );
                    self.delimiters.push((closer, token.span));
                    if macro_call {
                        self.macro_calls.push(MacroCall {
                            level: self.level(),
                            format_seen: false,
                        });
                    }
                    self.emit_current();
                }
                kind if kind.is_closer() => self.close(token)?,
                TokenKind::Comma => {
                    self.end_expression_scopes();
                    self.emit_current();
                    if self.in_arm() {
                        self.next_arm();
                    }
                }
                TokenKind::Semi => self.statement_end(),
                TokenKind::StringLiteral(text) => self.string_literal(text),
                TokenKind::Identifier(name) => self.reference(name),
                _ => self.emit_current(),
            }
        }

        if let Some((closer, span)) = self.delimiters.pop() {
            return Err(CanonicalizeError::Unbalanced {
                delimiter: opener_for(&closer),
                span,
            });
        }
        Ok(self.out.join(" "))
    }

    fn kind_at(&self, pos: usize) -> Option<&'t TokenKind> {
        let tokens: &'t [Token] = self.tokens;
        tokens.get(pos).map(|token| &token.kind)
    }

    fn previous_kind(&self) -> Option<&'t TokenKind> {
        self.pos.checked_sub(1).and_then(|pos| self.kind_at(pos))
    }

    fn level(&self) -> usize {
        self.delimiters.len()
    }

    fn emit(&mut self, text: impl Into<String>) {
        self.out.push(text.into());
    }

    fn emit_current(&mut self) {
        if let Some(kind) = self.kind_at(self.pos) {
            self.out.push(kind.text().to_string());
        }
        self.pos += 1;
    }

    fn fresh(&mut self) -> String {
        let counter = self.frames.last_mut().map_or(0, |counter| {
            let current = *counter;
            *counter += 1;
            current
        });
        format!("$v{counter}")
    }

    fn declared_name(&mut self, name: &str) -> String {
        let next = self.declared.len();
        self.declared
            .entry(name.to_string())
            .or_insert_with(|| format!("$f{next}"))
            .clone()
    }

    fn local(&self, name: &str) -> Option<&String> {
        self.scopes.iter().rev().find_map(|scope| scope.names.get(name))
    }

    fn lookup(&self, name: &str) -> Option<&String> {
        self.local(name).or_else(|| self.declared.get(name))
    }

    fn reference(&mut self, name: &str) {
        // `P { field: value }` and `struct P { field: T }` name a field.
        let field_label = matches!(self.previous_kind(), Some(TokenKind::LBrace | TokenKind::Comma))
            && matches!(self.kind_at(self.pos + 1), Some(TokenKind::Colon));
        let member_or_path = field_label
            || matches!(
                self.previous_kind(),
                Some(TokenKind::Dot | TokenKind::PathSep)
            )
            || matches!(
                self.kind_at(self.pos + 1),
                Some(TokenKind::PathSep | TokenKind::Bang)
            );
        if !member_or_path
            && self.struct_literals.last() == Some(&self.level())
            && self.is_shorthand_field(self.pos)
        {
            if let Some(renamed) = self.local(name).cloned() {
                self.emit(name);
                self.emit(":");
                self.emit(renamed);
                self.pos += 1;
                return;
            }
        }
        let text = if member_or_path {
            name.to_string()
        } else {
            self.lookup(name).cloned().unwrap_or_else(|| name.to_string())
        };
        self.emit(text);
        self.pos += 1;
    }

    /// `P { a, .. }` or `P { ref mut a }`: a field named by its binding.
    fn is_shorthand_field(&self, pos: usize) -> bool {
        if !matches!(self.kind_at(pos + 1), Some(TokenKind::Comma | TokenKind::RBrace)) {
            return false;
        }
        let mut before = pos;
        while let Some(previous) = before.checked_sub(1) {
            match self.kind_at(previous) {
                Some(TokenKind::Ref | TokenKind::Mut) => before = previous,
                Some(TokenKind::LBrace | TokenKind::Comma) => return true,
                _ => return false,
            }
        }
        false
    }

    /// Whether the `{` at the cursor opens a struct literal rather than a
    /// block.
    fn is_struct_literal(&self) -> bool {
        let named = match self.previous_kind() {
            Some(TokenKind::Identifier(name)) => name.starts_with(char::is_uppercase),
            Some(TokenKind::Keyword(word)) => word == "Self",
            _ => false,
        };
        if !named {
            return false;
        }
        let mut depth = 0usize;
        for token in self.tokens[..self.pos].iter().rev() {
            match &token.kind {
                kind if kind.is_closer() => depth += 1,
                kind if kind.is_opener() => {
                    if depth == 0 {
                        return true;
                    }
                    depth -= 1;
                }
                _ if depth > 0 => {}
                TokenKind::If
                | TokenKind::While
                | TokenKind::Match
                | TokenKind::For
                | TokenKind::In
                | TokenKind::Arrow => return false,
                TokenKind::Keyword(word) if word == "where" => return false,
                TokenKind::Semi | TokenKind::Equals | TokenKind::FatArrow => return true,
                _ => {}
            }
        }
        true
    }

    fn string_literal(&mut self, literal: &str) {
        let level = self.level();
        let format = match self.macro_calls.last_mut() {
            Some(call) if call.level == level && !call.format_seen => {
                call.format_seen = true;
                true
            }
            _ => false,
        };
        let text = if format {
            self.rename_captures(literal)
        } else {
            literal.to_string()
        };
        self.emit(text);
        self.pos += 1;
    }

    /// Renames `{name}` and `{name:spec}` captures of local bindings.
    fn rename_captures(&self, literal: &str) -> String {
        if literal.starts_with(['b', 'c']) {
            return literal.to_string();
        }
        let mut out = String::with_capacity(literal.len());
        let mut rest = literal;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..=open]);
            let after = &rest[open + 1..];
            if let Some(escaped) = after.strip_prefix('{') {
                out.push('{');
                rest = escaped;
                continue;
            }
            let end = after
                .find(|c: char| c != '_' && !c.is_alphanumeric())
                .unwrap_or(after.len());
            let name = &after[..end];
            let captured = after[end..].starts_with(['}', ':']);
            match self.local(name) {
                Some(renamed) if captured => out.push_str(renamed),
                _ => out.push_str(name),
            }
            rest = &after[end..];
        }
        out.push_str(rest);
        out
    }

    fn in_arm(&self) -> bool {
        let level = self.level();
        self.scopes
            .last()
            .is_some_and(|scope| scope.kind == ScopeKind::Arm && scope.level == level)
    }

    /// Ends the current arm and reads the pattern of the next one, if any.
    fn next_arm(&mut self) {
        if self.in_arm() {
            self.scopes.pop();
        }
        self.match_arm();
    }

    /// Copies an arm pattern up to `=>` or its guard; the bindings stay
    /// visible until the arm ends.
    fn match_arm(&mut self) {
        if matches!(self.kind_at(self.pos), None | Some(TokenKind::RBrace | TokenKind::Eof)) {
            return;
        }
        let mut names = Vec::new();
        self.pattern(&mut names, |kind| {
            matches!(kind, TokenKind::FatArrow | TokenKind::If)
        });
        self.scopes.push(Scope {
            names: names.into_iter().collect(),
            level: self.level(),
            kind: ScopeKind::Arm,
        });
    }

    fn function(&mut self) {
        self.emit_current();
        if let Some(TokenKind::Identifier(name)) = self.kind_at(self.pos) {
            let renamed = self.declared_name(name);
            self.emit(renamed);
            self.pos += 1;
        }

        // Generics are copied as-is up to the parameter list.
        while let Some(kind) = self.kind_at(self.pos) {
            match kind {
                TokenKind::LParen => break,
                TokenKind::Eof | TokenKind::LBrace | TokenKind::Semi => return,
                _ => self.emit_current(),
            }
        }

        self.frames.push(0);
        let names = self.parameter_list(&TokenKind::RParen);
        self.pending.push(Pending {
            names,
            level: self.level(),
            trigger: Trigger::FunctionBody,
        });
    }

    fn let_binding(&mut self) {
        let trigger = match self.previous_kind() {
            Some(TokenKind::If | TokenKind::While) => Trigger::Block,
            Some(TokenKind::Operator(op)) if op == "&&" => Trigger::Block,
            _ => Trigger::Statement,
        };
        self.emit_current();
        let mut names = Vec::new();
        self.pattern(&mut names, |kind| {
            matches!(kind, TokenKind::Equals | TokenKind::Colon | TokenKind::Semi)
        });
        self.pending.push(Pending {
            names,
            level: self.level(),
            trigger,
        });
    }

    fn is_for_loop(&self) -> bool {
        if matches!(self.kind_at(self.pos + 1), Some(TokenKind::Lt)) {
            return false;
        }
        let mut depth = 0usize;
        for token in &self.tokens[self.pos + 1..] {
            match &token.kind {
                TokenKind::In if depth == 0 => return true,
                TokenKind::LBrace | TokenKind::Semi | TokenKind::Eof if depth == 0 => return false,
                kind if kind.is_opener() => depth += 1,
                kind if kind.is_closer() => {
                    if depth == 0 {
                        return false;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
        false
    }

    fn for_loop(&mut self) {
        self.emit_current();
        let mut names = Vec::new();
        self.pattern(&mut names, |kind| matches!(kind, TokenKind::In));
        self.pending.push(Pending {
            names,
            level: self.level(),
            trigger: Trigger::Block,
        });
    }

    /// A `|` opens a closure only where an expression can start.
    fn starts_closure(&self) -> bool {
        match self.previous_kind() {
            None => true,
            Some(kind) => matches!(
                kind,
                TokenKind::LParen
                    | TokenKind::LBracket
                    | TokenKind::LBrace
                    | TokenKind::Comma
                    | TokenKind::Equals
                    | TokenKind::Semi
                    | TokenKind::Colon
                    | TokenKind::FatArrow
                    | TokenKind::Move
                    | TokenKind::Return
                    | TokenKind::Operator(_)
            ),
        }
    }

    fn closure(&mut self) {
        let names = self.parameter_list(&TokenKind::Pipe);
        match self.kind_at(self.pos) {
            Some(TokenKind::LBrace | TokenKind::Arrow) => self.pending.push(Pending {
                names,
                level: self.level(),
                trigger: Trigger::Block,
            }),
            _ => self.scopes.push(Scope {
                names: names.into_iter().collect(),
                level: self.level(),
                kind: ScopeKind::Expression,
            }),
        }
    }

    /// Consumes `opener param: Type, ... closer`, renaming every binding in
    /// the parameter patterns.
    fn parameter_list(&mut self, closer: &TokenKind) -> Vec<(String, String)> {
        self.emit_current();
        let mut names = Vec::new();
        loop {
            self.pattern(&mut names, |kind| {
                matches!(kind, TokenKind::Colon | TokenKind::Comma) || kind == closer
            });
            if self.kind_at(self.pos) == Some(&TokenKind::Colon) {
                self.emit_current();
                self.type_until(closer);
            }
            match self.kind_at(self.pos) {
                Some(TokenKind::Comma) => self.emit_current(),
                Some(kind) if kind == closer => {
                    self.emit_current();
                    break;
                }
                _ => break,
            }
        }
        names
    }

    fn type_until(&mut self, closer: &TokenKind) {
        let mut depth = 0usize;
        while let Some(kind) = self.kind_at(self.pos) {
            match kind {
                TokenKind::Eof => break,
                kind if depth == 0 && (kind == closer || *kind == TokenKind::Comma) => break,
                TokenKind::Lt => depth += 1,
                TokenKind::Gt => depth = depth.saturating_sub(1),
                kind if kind.is_opener() => depth += 1,
                kind if kind.is_closer() => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                _ => {}
            }
            self.emit_current();
        }
    }

    /// Copies a pattern up to the first `stop` token at its own top level,
    /// renaming the names it binds.
    fn pattern(&mut self, names: &mut Vec<(String, String)>, stop: impl Fn(&TokenKind) -> bool) {
        let mut groups: Vec<bool> = Vec::new();
        while let Some(kind) = self.kind_at(self.pos) {
            if *kind == TokenKind::Eof || (groups.is_empty() && stop(kind)) {
                break;
            }
            match kind {
                kind if kind.is_opener() => {
                    groups.push(*kind == TokenKind::LBrace);
                    self.emit_current();
                }
                kind if kind.is_closer() => {
                    if groups.pop().is_none() {
                        break;
                    }
                    self.emit_current();
                }
                TokenKind::Identifier(name) if self.binds_at(self.pos, groups.last() == Some(&true)) => {
                    if groups.last() == Some(&true) && self.is_shorthand_field(self.pos) {
                        self.emit(name.clone());
                        self.emit(":");
                    }
                    // Alternatives of an or-pattern bind the same names.
                    let renamed = match names.iter().find(|(original, _)| original == name) {
                        Some((_, renamed)) => renamed.clone(),
                        None => {
                            let renamed = self.fresh();
                            names.push((name.clone(), renamed.clone()));
                            renamed
                        }
                    };
                    self.emit(renamed);
                    self.pos += 1;
                }
                _ => self.emit_current(),
            }
        }
    }

    fn binds_at(&self, pos: usize, in_struct_pattern: bool) -> bool {
        let Some(TokenKind::Identifier(name)) = self.kind_at(pos) else {
            return false;
        };
        let bare = name.trim_start_matches("r#");
        if bare == "_" || !bare.starts_with(|c: char| c == '_' || c.is_lowercase()) {
            return false;
        }
        let next = self.kind_at(pos + 1);
        let previous = pos.checked_sub(1).and_then(|pos| self.kind_at(pos));
        if matches!(
            next,
            Some(TokenKind::PathSep | TokenKind::LParen | TokenKind::LBrace | TokenKind::Bang)
        ) || matches!(previous, Some(TokenKind::PathSep))
        {
            return false;
        }
        // `Point { x: px }` binds `px`, not the field name.
        !(in_struct_pattern && matches!(next, Some(TokenKind::Colon)))
    }

    fn open_block(&mut self, span: Span) {
        let outer = self.level();
        let match_body = self.pending_matches.last() == Some(&outer);
        if match_body {
            self.pending_matches.pop();
        }
        let struct_literal = !match_body && self.is_struct_literal();
        self.delimiters.push((TokenKind::RBrace, span));
        self.emit_current();

        let (ready, waiting): (Vec<_>, Vec<_>) = mem::take(&mut self.pending)
            .into_iter()
            .partition(|pending| pending.level == outer && pending.trigger != Trigger::Statement);
        self.pending = waiting;

        let mut scope = Scope {
            names: HashMap::new(),
            level: self.level(),
            kind: ScopeKind::Block { owns_frame: false },
        };
        for pending in ready {
            if pending.trigger == Trigger::FunctionBody {
                scope.kind = ScopeKind::Block { owns_frame: true };
            }
            scope.names.extend(pending.names);
        }
        self.scopes.push(scope);
        if struct_literal {
            self.struct_literals.push(self.level());
        }
        if match_body {
            self.match_arm();
        }
    }

    fn close(&mut self, token: &Token) -> Result<(), CanonicalizeError> {
        let unbalanced = || CanonicalizeError::Unbalanced {
            delimiter: token.kind.name(),
            span: token.span,
        };
        match self.delimiters.last() {
            Some((expected, _)) if *expected == token.kind => {}
            _ => return Err(unbalanced()),
        }

        self.end_expression_scopes();
        let closed_literal = self.struct_literals.last() == Some(&self.level());
        if closed_literal {
            self.struct_literals.pop();
        }
        if self
            .macro_calls
            .last()
            .is_some_and(|call| call.level == self.level())
        {
            self.macro_calls.pop();
        }
        if token.kind == TokenKind::RBrace {
            let level = self.level();
            if self.in_arm() {
                self.scopes.pop();
            }
            let closes_scope = self.scopes.len() > 1
                && self.scopes.last().is_some_and(|scope| scope.level == level);
            if !closes_scope {
                return Err(unbalanced());
            }
            if let Some(Scope {
                kind: ScopeKind::Block { owns_frame: true },
                ..
            }) = self.scopes.pop()
            {
                self.frames.pop();
            }
        }

        let level = self.level();
        let mut abandoned = 0;
        self.pending.retain(|pending| {
            let keep = pending.level < level;
            if !keep && pending.trigger == Trigger::FunctionBody {
                abandoned += 1;
            }
            keep
        });
        for _ in 0..abandoned {
            self.frames.pop();
        }
        self.pending_matches.retain(|pending| *pending < level);

        self.delimiters.pop();
        self.emit_current();

        // A block-like arm body ends its arm without a comma.
        if token.kind == TokenKind::RBrace && !closed_literal && self.in_arm() {
            let continues = match self.kind_at(self.pos) {
                Some(TokenKind::Comma | TokenKind::RBrace | TokenKind::Eof) | None => true,
                Some(TokenKind::Keyword(word)) => word == "else",
                _ => false,
            };
            if !continues {
                self.next_arm();
            }
        }
        Ok(())
    }

    fn end_expression_scopes(&mut self) {
        let level = self.level();
        while self
            .scopes
            .last()
            .is_some_and(|scope| scope.kind == ScopeKind::Expression && scope.level >= level)
        {
            self.scopes.pop();
        }
    }

    fn statement_end(&mut self) {
        self.end_expression_scopes();
        let level = self.level();
        for pending in mem::take(&mut self.pending) {
            if pending.level != level {
                self.pending.push(pending);
                continue;
            }
            match pending.trigger {
                Trigger::Statement => {
                    if let Some(scope) = self.scopes.last_mut() {
                        scope.names.extend(pending.names);
                    }
                }
                // `fn name(..);` declares without a body.
                Trigger::FunctionBody => {
                    self.frames.pop();
                }
                Trigger::Block => {}
            }
        }
        self.emit_current();
    }
}

fn opener_for(closer: &TokenKind) -> &'static str {
    match closer {
        TokenKind::RParen => "(",
        TokenKind::RBracket => "[",
        _ => "{",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_are_numbered_by_position() {
        let canonical = canonicalize("fn add(a: i64, b: i64) -> i64 { a + b }").unwrap();
        assert_eq!(
            canonical,
            "fn $f0 ( $v0 : i64 , $v1 : i64 ) -> i64 { $v0 + $v1 }"
        );
    }

    #[test]
    fn let_binding_is_visible_after_its_statement() {
        let canonical = canonicalize("fn f(x: i64) -> i64 { let x = x + 1; x }").unwrap();
        assert_eq!(
            canonical,
            "fn $f0 ( $v0 : i64 ) -> i64 { let $v1 = $v0 + 1 ; $v1 }"
        );
    }

    #[test]
    fn unbalanced_source_is_rejected() {
        let err = canonicalize("fn f(x: i64) { x ").unwrap_err();
        assert!(matches!(err, CanonicalizeError::Unbalanced { delimiter: "{", .. }));
    }
}
