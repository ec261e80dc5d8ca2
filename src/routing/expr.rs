//! Route expression compiler.
//!
//! # Grammar
//! ```text
//! expression := call ( "&&" call )*
//! call       := IDENT "(" [ string ( "," string )* ] ")"
//! string     := '"' escaped chars '"' | '`' raw chars '`'
//! ```
//!
//! Supported functions:
//! - `Path("/users/<id>")` (required, exactly once)
//! - `Method("GET", "POST")` (optional, one or more methods, OR semantics)
//! - `Host("example.com")` (optional, port ignored, case-insensitive)
//!
//! Path parameters are written `<name>` (or `<string:name>`) and capture
//! everything up to the next `/`.

use std::fmt;

use axum::http::Method;

/// Compilation failure naming the offending expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid route expression '{expr}': {reason}")]
pub struct RouteSyntaxError {
    pub expr: String,
    pub reason: String,
}

impl RouteSyntaxError {
    pub fn new(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            reason: reason.into(),
        }
    }
}

/// One element of a compiled path pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// A literal byte.
    Char(u8),
    /// A named placeholder capturing up to the next `/`.
    Param(String),
}

/// Compiled form of a route expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    pub methods: Option<Vec<Method>>,
    pub host: Option<String>,
    pub path: Vec<PathSegment>,
}

impl RoutePattern {
    /// Canonical textual form, identical for expressions that compile to
    /// the same pattern regardless of spacing, quoting or call order.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    fn path_string(&self) -> String {
        let mut out = String::with_capacity(self.path.len());
        for segment in &self.path {
            match segment {
                PathSegment::Char(b) => out.push(*b as char),
                PathSegment::Param(name) => {
                    out.push('<');
                    out.push_str(name);
                    out.push('>');
                }
            }
        }
        out
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(methods) = &self.methods {
            let list: Vec<String> = methods.iter().map(|m| format!("{:?}", m.as_str())).collect();
            write!(f, "Method({}) && ", list.join(","))?;
        }
        if let Some(host) = &self.host {
            write!(f, "Host({:?}) && ", host)?;
        }
        write!(f, "Path({:?})", self.path_string())
    }
}

/// Compile a route expression into a [`RoutePattern`].
pub fn parse(expr: &str) -> Result<RoutePattern, RouteSyntaxError> {
    let tokens = tokenize(expr)?;
    Parser {
        expr,
        tokens,
        pos: 0,
    }
    .parse()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    And,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, RouteSyntaxError> {
    let err = |reason: String| RouteSyntaxError::new(expr, reason);
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            ',' => tokens.push(Token::Comma),
            '&' => match chars.next() {
                Some((_, '&')) => tokens.push(Token::And),
                _ => return Err(err(format!("expected '&&' at offset {}", offset))),
            },
            '"' => {
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, 'n')) => value.push('\n'),
                            Some((_, 't')) => value.push('\t'),
                            Some((_, c @ ('"' | '\\' | '/'))) => value.push(c),
                            Some((o, c)) => {
                                return Err(err(format!("unknown escape '\\{}' at offset {}", c, o)))
                            }
                            None => break,
                        },
                        c => value.push(c),
                    }
                }
                if !closed {
                    return Err(err(format!("unterminated string starting at offset {}", offset)));
                }
                tokens.push(Token::Str(value));
            }
            '`' => {
                let mut value = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '`' {
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(err(format!("unterminated string starting at offset {}", offset)));
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        ident.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            c if c.is_ascii_digit() => {
                return Err(err(format!(
                    "only string literals are supported as function arguments, got number at offset {}",
                    offset
                )))
            }
            c => return Err(err(format!("unexpected character '{}' at offset {}", c, offset))),
        }
    }

    if tokens.is_empty() {
        return Err(err("empty expression".to_string()));
    }
    Ok(tokens)
}

struct Parser<'a> {
    expr: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

#[derive(Default)]
struct Builder {
    methods: Option<Vec<Method>>,
    host: Option<String>,
    path: Option<Vec<PathSegment>>,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: impl Into<String>) -> RouteSyntaxError {
        RouteSyntaxError::new(self.expr, reason)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse(mut self) -> Result<RoutePattern, RouteSyntaxError> {
        let mut builder = Builder::default();
        loop {
            let (name, args) = self.parse_call()?;
            self.apply(&mut builder, &name, args)?;
            match self.next() {
                None => break,
                Some(Token::And) => continue,
                Some(other) => return Err(self.error(format!("expected '&&', got {:?}", other))),
            }
        }

        let path = builder
            .path
            .ok_or_else(|| self.error("expression must contain a Path(...) matcher"))?;
        Ok(RoutePattern {
            methods: builder.methods,
            host: builder.host,
            path,
        })
    }

    fn parse_call(&mut self) -> Result<(String, Vec<String>), RouteSyntaxError> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            Some(Token::Str(_)) => {
                return Err(self.error("literals are supported only as function arguments"))
            }
            Some(other) => return Err(self.error(format!("expected function name, got {:?}", other))),
            None => return Err(self.error("unexpected end of expression")),
        };
        match self.next() {
            Some(Token::LParen) => {}
            _ => return Err(self.error(format!("expected '(' after {}", name))),
        }

        let mut args = Vec::new();
        loop {
            match self.next() {
                Some(Token::RParen) if args.is_empty() => break,
                Some(Token::Str(value)) => args.push(value),
                Some(Token::Ident(_)) => {
                    return Err(self.error("nested function calls are not allowed"))
                }
                Some(other) => {
                    return Err(self.error(format!("expected string argument, got {:?}", other)))
                }
                None => return Err(self.error(format!("unclosed argument list of {}", name))),
            }
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                Some(other) => {
                    return Err(self.error(format!("expected ',' or ')', got {:?}", other)))
                }
                None => return Err(self.error(format!("unclosed argument list of {}", name))),
            }
        }
        Ok((name, args))
    }

    fn apply(
        &self,
        builder: &mut Builder,
        name: &str,
        args: Vec<String>,
    ) -> Result<(), RouteSyntaxError> {
        match name {
            "Path" => {
                if builder.path.is_some() {
                    return Err(self.error("Path specified more than once"));
                }
                let [path] = <[String; 1]>::try_from(args)
                    .map_err(|a| self.error(format!("Path accepts exactly one argument, got {}", a.len())))?;
                builder.path = Some(self.parse_path(&path)?);
            }
            "Method" => {
                if builder.methods.is_some() {
                    return Err(self.error("Method specified more than once"));
                }
                if args.is_empty() {
                    return Err(self.error("Method accepts at least one argument"));
                }
                let methods = args
                    .iter()
                    .map(|m| {
                        Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                            .map_err(|_| self.error(format!("invalid method '{}'", m)))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                builder.methods = Some(methods);
            }
            "Host" => {
                if builder.host.is_some() {
                    return Err(self.error("Host specified more than once"));
                }
                let [host] = <[String; 1]>::try_from(args)
                    .map_err(|a| self.error(format!("Host accepts exactly one argument, got {}", a.len())))?;
                if host.is_empty() {
                    return Err(self.error("Host can not be empty"));
                }
                builder.host = Some(host.to_ascii_lowercase());
            }
            other => return Err(self.error(format!("unsupported function '{}'", other))),
        }
        Ok(())
    }

    fn parse_path(&self, path: &str) -> Result<Vec<PathSegment>, RouteSyntaxError> {
        if path.is_empty() {
            return Err(self.error("empty path"));
        }
        let bytes = path.as_bytes();
        let mut segments = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'<' => {
                    let end = bytes[i + 1..]
                        .iter()
                        .position(|&b| b == b'>' || b == b'/' || b == b'<')
                        .map(|p| p + i + 1)
                        .filter(|&p| bytes[p] == b'>')
                        .ok_or_else(|| {
                            self.error(format!("unterminated parameter token at offset {}", i))
                        })?;
                    let inner = &path[i + 1..end];
                    let name = match inner.split_once(':') {
                        None => inner,
                        Some(("string", name)) => name,
                        Some((kind, _)) => {
                            return Err(self.error(format!("unsupported parameter matcher '{}'", kind)))
                        }
                    };
                    if name.is_empty() {
                        return Err(self.error(format!("empty parameter name at offset {}", i)));
                    }
                    segments.push(PathSegment::Param(name.to_string()));
                    i = end + 1;
                }
                b'>' => return Err(self.error(format!("unexpected '>' at offset {}", i))),
                b => {
                    segments.push(PathSegment::Char(b));
                    i += 1;
                }
            }
        }
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<PathSegment> {
        s.bytes().map(PathSegment::Char).collect()
    }

    #[test]
    fn parses_plain_path() {
        let p = parse(r#"Path("/a")"#).unwrap();
        assert_eq!(p.path, chars("/a"));
        assert!(p.methods.is_none());
        assert!(p.host.is_none());
    }

    #[test]
    fn parses_methods_and_path() {
        let p = parse(r#"Method("GET","post") && Path("/x")"#).unwrap();
        assert_eq!(p.methods, Some(vec![Method::GET, Method::POST]));
        assert_eq!(p.path, chars("/x"));
    }

    #[test]
    fn parses_parameters() {
        let p = parse("Path(`/a/<id>/b/<string:rest>`)").unwrap();
        let mut expected = chars("/a/");
        expected.push(PathSegment::Param("id".into()));
        expected.extend(chars("/b/"));
        expected.push(PathSegment::Param("rest".into()));
        assert_eq!(p.path, expected);
    }

    #[test]
    fn host_is_lowercased() {
        let p = parse(r#"Host("Example.COM") && Path("/")"#).unwrap();
        assert_eq!(p.host.as_deref(), Some("example.com"));
    }

    #[test]
    fn canonical_form_ignores_layout() {
        let a = parse(r#"Path("/x") && Method("GET")"#).unwrap();
        let b = parse("Method( `GET` )&&Path(`/x`)").unwrap();
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical(), r#"Method("GET") && Path("/x")"#);
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in [
            "",
            "Path(",
            r#"Path("/a""#,
            r#"Path("/a") ||"#,
            r#"Path("/a") & Method("GET")"#,
            r#"Path(1)"#,
            r#"Path(Method("GET"))"#,
            r#""/a""#,
            r#"Path("/a") Path("/b")"#,
        ] {
            let err = parse(expr).unwrap_err();
            assert_eq!(err.expr, expr);
        }
    }

    #[test]
    fn rejects_unsupported_function() {
        let err = parse(r#"Regexp("/a.*")"#).unwrap_err();
        assert!(err.reason.contains("unsupported function"));
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(parse(r#"Path("/a", "/b")"#).is_err());
        assert!(parse(r#"Path()"#).is_err());
        assert!(parse(r#"Method() && Path("/a")"#).is_err());
    }

    #[test]
    fn requires_path() {
        let err = parse(r#"Method("GET")"#).unwrap_err();
        assert!(err.reason.contains("Path"));
    }

    #[test]
    fn rejects_duplicates() {
        assert!(parse(r#"Path("/a") && Path("/b")"#).is_err());
    }

    #[test]
    fn rejects_unterminated_parameter() {
        for path in ["/a/<id", "/a/<id/b", "/a/<>", "/a/<int:id>", "/a/b>"] {
            let expr = format!("Path({:?})", path);
            assert!(parse(&expr).is_err(), "{} should fail", expr);
        }
    }
}
