//! Sample-selection expression grammar (spec.md §4.6).
//!
//! ```text
//! expr   := '*' | clause | '(' expr ')' | 'not' expr | expr 'and' expr | expr 'or' expr
//! clause := 'sample:' id | 'group:' id
//! ```
//!
//! Precedence: `not` > `and` > `or`, left-associative. Parses into a
//! [`Selection`] tree that `crate::store` compiles into a predicate over a
//! `(sample_id, active, coverage_profile, is_explicit)` tuple, the same
//! division of labor the teacher keeps between parsing (this module) and
//! the execution-time predicate (its `seqvars::query::interpreter`).

use crate::err::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// `*`: every active sample with a coverage profile.
    Tautology,
    Sample(String),
    Group(String),
    Not(Box<Selection>),
    And(Box<Selection>, Box<Selection>),
    Or(Box<Selection>, Box<Selection>),
}

impl Selection {
    /// Parses a selection expression, rejecting `not *` at the top level
    /// (spec.md §4.6: "to prevent accidentally unbounded queries").
    pub fn parse(input: &str) -> Result<Selection, AppError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens: &tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(AppError::InvalidSelection(format!(
                "unexpected trailing input in {input:?}"
            )));
        }
        reject_bare_negated_tautology(&expr)?;
        Ok(expr)
    }

    /// Every `sample:<id>` clause occurring anywhere in the expression,
    /// regardless of `not`/`and`/`or` nesting — these samples contribute
    /// `pool_size` unconditionally per §4.7(ii).
    pub fn explicit_samples(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_explicit_samples(self, &mut out);
        out
    }
}

fn collect_explicit_samples<'a>(sel: &'a Selection, out: &mut Vec<&'a str>) {
    match sel {
        Selection::Sample(id) => out.push(id.as_str()),
        Selection::Tautology | Selection::Group(_) => {}
        Selection::Not(inner) => collect_explicit_samples(inner, out),
        Selection::And(lhs, rhs) | Selection::Or(lhs, rhs) => {
            collect_explicit_samples(lhs, out);
            collect_explicit_samples(rhs, out);
        }
    }
}

fn reject_bare_negated_tautology(expr: &Selection) -> Result<(), AppError> {
    if let Selection::Not(inner) = expr {
        if matches!(inner.as_ref(), Selection::Tautology) {
            return Err(AppError::InvalidSelection(
                "'not *' is not allowed without at least one positive clause".to_string(),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Star,
    Sample(String),
    Group(String),
    Not,
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, AppError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(i, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '*' => {
                tokens.push(Token::Star);
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            _ => {
                let start = i;
                let mut end = input.len();
                for (j, c2) in input[i..].char_indices() {
                    if c2.is_whitespace() || c2 == '(' || c2 == ')' {
                        end = i + j;
                        break;
                    }
                }
                let word = &input[start..end];
                tokens.push(classify_word(word)?);
                while let Some(&(j, _)) = chars.peek() {
                    if j < end {
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
        }
    }
    Ok(tokens)
}

fn classify_word(word: &str) -> Result<Token, AppError> {
    match word {
        "and" => Ok(Token::And),
        "or" => Ok(Token::Or),
        "not" => Ok(Token::Not),
        _ => {
            if let Some(id) = word.strip_prefix("sample:") {
                if id.is_empty() {
                    return Err(AppError::InvalidSelection(format!(
                        "empty sample id in clause {word:?}"
                    )));
                }
                Ok(Token::Sample(id.to_string()))
            } else if let Some(id) = word.strip_prefix("group:") {
                if id.is_empty() {
                    return Err(AppError::InvalidSelection(format!(
                        "empty group id in clause {word:?}"
                    )));
                }
                Ok(Token::Group(id.to_string()))
            } else {
                Err(AppError::InvalidSelection(format!(
                    "unrecognized token {word:?}"
                )))
            }
        }
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    // expr := and_expr ('or' and_expr)*
    fn parse_or(&mut self) -> Result<Selection, AppError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Selection::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // and_expr := not_expr ('and' not_expr)*
    fn parse_and(&mut self) -> Result<Selection, AppError> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = Selection::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // not_expr := 'not' not_expr | atom
    fn parse_not(&mut self) -> Result<Selection, AppError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Selection::Not(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Selection, AppError> {
        match self.advance() {
            Some(Token::Star) => Ok(Selection::Tautology),
            Some(Token::Sample(id)) => Ok(Selection::Sample(id.clone())),
            Some(Token::Group(id)) => Ok(Selection::Group(id.clone())),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(AppError::InvalidSelection("unbalanced parentheses".to_string())),
                }
            }
            other => Err(AppError::InvalidSelection(format!(
                "expected an expression, found {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_tautology() {
        assert_eq!(Selection::parse("*").unwrap(), Selection::Tautology);
    }

    #[test]
    fn parses_sample_clause() {
        assert_eq!(
            Selection::parse("sample:abc").unwrap(),
            Selection::Sample("abc".to_string())
        );
    }

    #[test]
    fn parses_group_clause() {
        assert_eq!(
            Selection::parse("group:xyz").unwrap(),
            Selection::Group("xyz".to_string())
        );
    }

    #[test]
    fn not_binds_tighter_than_and_and_and_tighter_than_or() {
        let parsed = Selection::parse("sample:a or sample:b and not sample:c").unwrap();
        assert_eq!(
            parsed,
            Selection::Or(
                Box::new(Selection::Sample("a".to_string())),
                Box::new(Selection::And(
                    Box::new(Selection::Sample("b".to_string())),
                    Box::new(Selection::Not(Box::new(Selection::Sample("c".to_string()))))
                ))
            )
        );
    }

    #[test]
    fn parentheses_override_precedence() {
        let parsed = Selection::parse("(sample:a or sample:b) and sample:c").unwrap();
        assert_eq!(
            parsed,
            Selection::And(
                Box::new(Selection::Or(
                    Box::new(Selection::Sample("a".to_string())),
                    Box::new(Selection::Sample("b".to_string()))
                )),
                Box::new(Selection::Sample("c".to_string()))
            )
        );
    }

    #[test]
    fn bare_not_star_is_rejected() {
        assert!(matches!(
            Selection::parse("not *"),
            Err(AppError::InvalidSelection(_))
        ));
    }

    #[test]
    fn not_star_with_positive_clause_is_allowed() {
        assert!(Selection::parse("sample:a and not *").is_ok());
    }

    #[test]
    fn unbalanced_parentheses_are_rejected() {
        assert!(Selection::parse("(sample:a").is_err());
        assert!(Selection::parse("sample:a)").is_err());
    }

    #[test]
    fn explicit_samples_are_collected_regardless_of_nesting() {
        let parsed = Selection::parse("not sample:a or (sample:b and group:g)").unwrap();
        let mut samples = parsed.explicit_samples();
        samples.sort();
        assert_eq!(samples, vec!["a", "b"]);
    }

    #[test]
    fn unrecognized_token_is_rejected() {
        assert!(Selection::parse("banana:a").is_err());
    }
}
