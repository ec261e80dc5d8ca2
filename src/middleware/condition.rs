//! Trip conditions of the `cbreaker` middleware.
//!
//! # Grammar
//! ```text
//! condition   := conjunction ( "||" conjunction )*
//! conjunction := comparison ( "&&" comparison )*
//! comparison  := metric ( ">" | ">=" | "<" | "<=" | "==" | "!=" ) NUMBER
//! metric      := IDENT "(" [ NUMBER ( "," NUMBER )* ] ")"
//! ```
//!
//! Metrics, all computed over the breaker's current window:
//! - `NetworkErrorRatio()`: round trips that got no response
//! - `FailureRatio()`: network errors plus 5xx responses
//! - `ResponseCodeRatio(500, 600, 0, 600)`: codes in `[500, 600)` over codes
//!   in `[0, 600)`; bounds are whole hundreds
//! - `MeanLatencyMS()`
//! - `RequestCount()`, handy as a minimum sample size

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use crate::error::{ProxyError, Result};
use crate::proxy::stats::RoundTripStats;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    NetworkErrorRatio,
    FailureRatio,
    /// Codes in `[from_a, to_a)` over codes in `[from_b, to_b)`.
    ResponseCodeRatio {
        from_a: u16,
        to_a: u16,
        from_b: u16,
        to_b: u16,
    },
    MeanLatencyMs,
    RequestCount,
}

impl Metric {
    pub fn value(&self, stats: &RoundTripStats) -> f64 {
        match *self {
            Metric::NetworkErrorRatio => ratio(stats.network_errors, stats.requests),
            Metric::FailureRatio => stats.failure_rate(),
            Metric::ResponseCodeRatio {
                from_a,
                to_a,
                from_b,
                to_b,
            } => ratio(codes_in(stats, from_a, to_a), codes_in(stats, from_b, to_b)),
            Metric::MeanLatencyMs => stats.mean_latency().as_secs_f64() * 1000.0,
            Metric::RequestCount => stats.requests as f64,
        }
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64
}

/// Responses whose code falls in `[from, to)`. Stats only keep classes, so
/// the bounds are whole hundreds.
fn codes_in(stats: &RoundTripStats, from: u16, to: u16) -> u64 {
    (from / 100..to / 100)
        .map(|class| match class {
            2 => stats.status_2xx,
            3 => stats.status_3xx,
            4 => stats.status_4xx,
            5 => stats.status_5xx,
            _ => 0,
        })
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl Op {
    fn holds(self, left: f64, right: f64) -> bool {
        match self {
            Op::Gt => left > right,
            Op::Ge => left >= right,
            Op::Lt => left < right,
            Op::Le => left <= right,
            Op::Eq => (left - right).abs() < f64::EPSILON,
            Op::Ne => (left - right).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub metric: Metric,
    pub op: Op,
    pub threshold: f64,
}

/// A parsed trip condition, kept as an OR of ANDs.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    any_of: Vec<Vec<Comparison>>,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        Parser {
            source,
            tokens,
            pos: 0,
        }
        .parse()
    }

    pub fn matches(&self, stats: &RoundTripStats) -> bool {
        self.any_of.iter().any(|all| {
            all.iter()
                .all(|c| c.op.holds(c.metric.value(stats), c.threshold))
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Op(Op),
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let err = |reason: String| ProxyError::syntax(source, reason);
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            ',' => tokens.push(Token::Comma),
            '&' if eat(&mut chars, '&') => tokens.push(Token::And),
            '|' if eat(&mut chars, '|') => tokens.push(Token::Or),
            '>' if eat(&mut chars, '=') => tokens.push(Token::Op(Op::Ge)),
            '>' => tokens.push(Token::Op(Op::Gt)),
            '<' if eat(&mut chars, '=') => tokens.push(Token::Op(Op::Le)),
            '<' => tokens.push(Token::Op(Op::Lt)),
            '=' if eat(&mut chars, '=') => tokens.push(Token::Op(Op::Eq)),
            '!' if eat(&mut chars, '=') => tokens.push(Token::Op(Op::Ne)),
            c if c.is_ascii_digit() || c == '.' => {
                let mut literal = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_ascii_digit() || next == '.' {
                        literal.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| err(format!("invalid number '{}' at offset {}", literal, offset)))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() => {
                let mut ident = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() {
                        ident.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            c => return Err(err(format!("unexpected character '{}' at offset {}", c, offset))),
        }
    }

    if tokens.is_empty() {
        return Err(err("empty condition".to_string()));
    }
    Ok(tokens)
}

fn eat(chars: &mut Peekable<CharIndices<'_>>, expected: char) -> bool {
    if chars.peek().map(|&(_, c)| c) == Some(expected) {
        chars.next();
        return true;
    }
    false
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: impl Into<String>) -> ProxyError {
        ProxyError::syntax(self.source, reason)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse(mut self) -> Result<Condition> {
        let mut any_of = vec![Vec::new()];
        loop {
            let comparison = self.parse_comparison()?;
            if let Some(all) = any_of.last_mut() {
                all.push(comparison);
            }
            match self.next() {
                None => break,
                Some(Token::And) => continue,
                Some(Token::Or) => any_of.push(Vec::new()),
                Some(other) => {
                    return Err(self.error(format!("expected '&&' or '||', got {:?}", other)))
                }
            }
        }
        Ok(Condition {
            source: self.source.to_string(),
            any_of,
        })
    }

    fn parse_comparison(&mut self) -> Result<Comparison> {
        let metric = self.parse_metric()?;
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            _ => return Err(self.error("expected a comparison operator after metric")),
        };
        let threshold = match self.next() {
            Some(Token::Number(value)) => value,
            _ => return Err(self.error("expected a number after comparison operator")),
        };
        Ok(Comparison {
            metric,
            op,
            threshold,
        })
    }

    fn parse_metric(&mut self) -> Result<Metric> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            Some(other) => return Err(self.error(format!("expected metric name, got {:?}", other))),
            None => return Err(self.error("unexpected end of condition")),
        };
        if self.next() != Some(Token::LParen) {
            return Err(self.error(format!("expected '(' after {}", name)));
        }
        let mut args = Vec::new();
        loop {
            match self.next() {
                Some(Token::RParen) if args.is_empty() => break,
                Some(Token::Number(value)) => args.push(value),
                _ => return Err(self.error(format!("malformed argument list of {}", name))),
            }
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => return Err(self.error(format!("malformed argument list of {}", name))),
            }
        }

        let takes_none = args.is_empty();
        let no_args = |metric: Metric| {
            if takes_none {
                Ok(metric)
            } else {
                Err(self.error(format!("{} takes no arguments", name)))
            }
        };
        match name.as_str() {
            "NetworkErrorRatio" => no_args(Metric::NetworkErrorRatio),
            "FailureRatio" => no_args(Metric::FailureRatio),
            "MeanLatencyMS" => no_args(Metric::MeanLatencyMs),
            "RequestCount" => no_args(Metric::RequestCount),
            "ResponseCodeRatio" => {
                let [from_a, to_a, from_b, to_b] = <[f64; 4]>::try_from(args).map_err(|a| {
                    self.error(format!("ResponseCodeRatio takes four arguments, got {}", a.len()))
                })?;
                let code = |value: f64| -> Result<u16> {
                    if value.fract() != 0.0 || !(0.0..=600.0).contains(&value) || value % 100.0 != 0.0 {
                        return Err(self.error(format!(
                            "response code bound {} must be a whole hundred between 0 and 600",
                            value
                        )));
                    }
                    Ok(value as u16)
                };
                let (from_a, to_a, from_b, to_b) = (code(from_a)?, code(to_a)?, code(from_b)?, code(to_b)?);
                if from_a >= to_a || from_b >= to_b {
                    return Err(self.error("response code ranges must not be empty"));
                }
                Ok(Metric::ResponseCodeRatio {
                    from_a,
                    to_a,
                    from_b,
                    to_b,
                })
            }
            other => Err(self.error(format!("unsupported metric '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(ok: u64, server_errors: u64, network_errors: u64) -> RoundTripStats {
        RoundTripStats {
            requests: ok + server_errors + network_errors,
            status_2xx: ok,
            status_5xx: server_errors,
            network_errors,
            latency_total_us: (ok + server_errors + network_errors) * 20_000,
            ..Default::default()
        }
    }

    #[test]
    fn network_error_ratio() {
        let cond = Condition::parse("NetworkErrorRatio() > 0.5").unwrap();
        assert!(!cond.matches(&stats(1, 0, 1)));
        assert!(cond.matches(&stats(1, 0, 2)));
        assert!(!cond.matches(&RoundTripStats::default()));
    }

    #[test]
    fn response_code_ratio_uses_classes() {
        let cond = Condition::parse("ResponseCodeRatio(500, 600, 0, 600) >= 0.5").unwrap();
        assert!(cond.matches(&stats(1, 1, 0)));
        // network errors carry no code
        assert!(!cond.matches(&stats(3, 1, 4)));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let cond =
            Condition::parse("RequestCount() >= 10 && FailureRatio() > 0.5 || MeanLatencyMS() > 100")
                .unwrap();
        assert!(!cond.matches(&stats(0, 2, 2)), "too few requests");
        assert!(cond.matches(&stats(4, 3, 3)));

        let mut slow = stats(1, 0, 0);
        slow.latency_total_us = 150_000;
        assert!(cond.matches(&slow));
    }

    #[test]
    fn operators() {
        let s = stats(3, 1, 0);
        for (source, expected) in [
            ("FailureRatio() == 0.25", true),
            ("FailureRatio() != 0.25", false),
            ("FailureRatio() < 0.3", true),
            ("FailureRatio() <= 0.2", false),
            ("MeanLatencyMS() >= 20", true),
        ] {
            assert_eq!(Condition::parse(source).unwrap().matches(&s), expected, "{}", source);
        }
    }

    #[test]
    fn rejects_malformed_conditions() {
        for source in [
            "",
            "FailureRatio()",
            "FailureRatio() >",
            "FailureRatio(1) > 0.5",
            "LatencyAtQuantileMS(50.0) > 10",
            "ResponseCodeRatio(500, 600) > 0.5",
            "ResponseCodeRatio(550, 600, 0, 600) > 0.5",
            "ResponseCodeRatio(600, 500, 0, 600) > 0.5",
            "FailureRatio() > 0.5 &",
            "FailureRatio() > 0.5 FailureRatio() > 0.1",
        ] {
            assert!(
                matches!(Condition::parse(source), Err(ProxyError::Syntax { .. })),
                "{} must be rejected",
                source
            );
        }
    }

    #[test]
    fn displays_source() {
        let cond = Condition::parse("FailureRatio() > 0.5").unwrap();
        assert_eq!(cond.to_string(), "FailureRatio() > 0.5");
    }
}
