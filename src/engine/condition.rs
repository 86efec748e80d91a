//! Condition parser and evaluator.
//!
//! Grammar (keywords case-insensitive, `not` binds tighter than `and`,
//! `and` tighter than `or`):
//!
//! ```text
//! expr    := and ( "or" and )*
//! and     := unary ( "and" unary )*
//! unary   := "not" unary | primary
//! primary := "(" expr ")" | quant | NAME
//! quant   := ( "1" | "any" | "all" ) "of" ( "them" | PATTERN )
//! ```

use anyhow::{anyhow, bail, Result};

/// Names a quantifier ranges over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePattern {
    Them,
    Glob(String),
}

/// Boolean expression tree over selection names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Selection(String),
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    AnyOf(NamePattern),
    AllOf(NamePattern),
}

impl Condition {
    /// "Any named result is true", used when a condition cannot be compiled
    pub fn fallback() -> Self {
        Condition::AnyOf(NamePattern::Them)
    }

    /// Parse a condition string
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            bail!("empty condition");
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            bail!("unexpected token '{}'", token.text());
        }
        Ok(expr)
    }

    /// Selection names referenced directly (not through a quantifier)
    pub fn referenced_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Condition::Selection(name) => names.push(name),
            Condition::Not(inner) => inner.collect_names(names),
            Condition::And(items) | Condition::Or(items) => {
                items.iter().for_each(|item| item.collect_names(names))
            }
            Condition::AnyOf(_) | Condition::AllOf(_) => {}
        }
    }

    /// Fold named selection results into one verdict.
    /// Unknown names evaluate to false.
    pub fn evaluate(&self, results: &[(String, bool)]) -> bool {
        match self {
            Condition::Selection(name) => results
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| *v)
                .unwrap_or(false),
            Condition::Not(inner) => !inner.evaluate(results),
            Condition::And(items) => items.iter().all(|item| item.evaluate(results)),
            Condition::Or(items) => items.iter().any(|item| item.evaluate(results)),
            Condition::AnyOf(pattern) => select(results, pattern).any(|v| v),
            Condition::AllOf(pattern) => select(results, pattern).all(|v| v),
        }
    }
}

/// Results named by the pattern; a glob naming nothing covers every result
fn select<'a>(
    results: &'a [(String, bool)],
    pattern: &'a NamePattern,
) -> Box<dyn Iterator<Item = bool> + 'a> {
    match pattern {
        NamePattern::Glob(glob) if results.iter().any(|(name, _)| glob_match(glob, name)) => {
            Box::new(
                results
                    .iter()
                    .filter(move |(name, _)| glob_match(glob, name))
                    .map(|(_, v)| *v),
            )
        }
        _ => Box::new(results.iter().map(|(_, v)| *v)),
    }
}

/// `*` matches any run of characters, everything else is literal
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if name.len() < first.len() + last.len() || !name.starts_with(first) || !name.ends_with(last)
    {
        return false;
    }

    let mut rest = &name[first.len()..name.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Word(String),
}

impl Token {
    fn text(&self) -> &str {
        match self {
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Word(word) => word,
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(word) if word.eq_ignore_ascii_case(keyword))
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    for c in input.chars() {
        match c {
            '(' | ')' => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
                tokens.push(if c == '(' { Token::LParen } else { Token::RParen });
            }
            c if c.is_whitespace() => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
            }
            c if c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '*') => word.push(c),
            other => return Err(anyhow!("unexpected character '{}'", other)),
        }
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_keyword(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Condition> {
        let mut items = vec![self.parse_and()?];
        while self.eat_keyword("or") {
            items.push(self.parse_and()?);
        }
        Ok(flatten(items, Condition::Or))
    }

    fn parse_and(&mut self) -> Result<Condition> {
        let mut items = vec![self.parse_unary()?];
        while self.eat_keyword("and") {
            items.push(self.parse_unary()?);
        }
        Ok(flatten(items, Condition::And))
    }

    fn parse_unary(&mut self) -> Result<Condition> {
        if self.eat_keyword("not") {
            return Ok(Condition::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition> {
        if self.is_quantifier() {
            return self.parse_quantifier();
        }

        match self.next() {
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    _ => bail!("missing closing parenthesis"),
                }
            }
            Some(Token::Word(word)) => {
                if ["and", "or", "not", "of"]
                    .iter()
                    .any(|kw| word.eq_ignore_ascii_case(kw))
                {
                    bail!("unexpected keyword '{}'", word);
                }
                Ok(Condition::Selection(word))
            }
            Some(Token::RParen) => bail!("unexpected ')'"),
            None => bail!("unexpected end of condition"),
        }
    }

    fn is_quantifier(&self) -> bool {
        let quantifier = self
            .peek()
            .is_some_and(|t| t.is_keyword("1") || t.is_keyword("any") || t.is_keyword("all"));
        quantifier && self.peek_at(1).is_some_and(|t| t.is_keyword("of"))
    }

    fn parse_quantifier(&mut self) -> Result<Condition> {
        let all = self.peek().is_some_and(|t| t.is_keyword("all"));
        self.pos += 2;

        let pattern = match self.next() {
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("them") => NamePattern::Them,
            Some(Token::Word(word)) => NamePattern::Glob(word),
            _ => bail!("quantifier without a selection pattern"),
        };

        Ok(if all {
            Condition::AllOf(pattern)
        } else {
            Condition::AnyOf(pattern)
        })
    }
}

fn flatten(mut items: Vec<Condition>, build: fn(Vec<Condition>) -> Condition) -> Condition {
    if items.len() == 1 {
        items.remove(0)
    } else {
        build(items)
    }
}
