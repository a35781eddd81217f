use super::RegisterError;

/// Reference passing mode of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub enum RefMode {
    None,
    In,
    Out,
    InOut,
}

/// A type expression as written in a registration declaration, before
/// names are resolved against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct TypeExpr {
    pub base: String,
    pub is_handle: bool,
    pub ref_mode: RefMode,
    pub is_const: bool,
}

impl TypeExpr {
    pub fn plain(base: &str) -> Self {
        TypeExpr {
            base: base.to_string(),
            is_handle: false,
            ref_mode: RefMode::None,
            is_const: false,
        }
    }
}

/// A parsed function declaration, e.g. `"refclass@ create(int, double &out)"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDecl {
    pub ret: TypeExpr,
    pub name: String,
    pub params: Vec<TypeExpr>,
}

/// A parsed property declaration, e.g. `"node@ next"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDecl {
    pub ty: TypeExpr,
    pub name: String,
}

struct Lexer<'a> {
    src: &'a str,
    rest: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Ident(&'a str),
    Handle,
    Amp,
    LParen,
    RParen,
    Comma,
    End,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer { src, rest: src }
    }

    fn error(&self, why: &str) -> RegisterError {
        RegisterError::InvalidDeclaration(format!("'{}': {}", self.src, why))
    }

    fn next(&mut self) -> Result<Token<'a>, RegisterError> {
        self.rest = self.rest.trim_start();
        let mut chars = self.rest.chars();
        let Some(c) = chars.next() else {
            return Ok(Token::End);
        };
        let tok = match c {
            '@' => {
                self.rest = &self.rest[1..];
                Token::Handle
            }
            '&' => {
                self.rest = &self.rest[1..];
                Token::Amp
            }
            '(' => {
                self.rest = &self.rest[1..];
                Token::LParen
            }
            ')' => {
                self.rest = &self.rest[1..];
                Token::RParen
            }
            ',' => {
                self.rest = &self.rest[1..];
                Token::Comma
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '~' => {
                let len = self
                    .rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '~'))
                    .unwrap_or(self.rest.len());
                let ident = &self.rest[..len];
                self.rest = &self.rest[len..];
                Token::Ident(ident)
            }
            other => return Err(self.error(&format!("unexpected character '{}'", other))),
        };
        Ok(tok)
    }

    fn peek(&mut self) -> Result<Token<'a>, RegisterError> {
        let save = self.rest;
        let tok = self.next()?;
        self.rest = save;
        Ok(tok)
    }

    fn type_expr(&mut self) -> Result<TypeExpr, RegisterError> {
        let mut is_const = false;
        let base = loop {
            match self.next()? {
                Token::Ident("const") => is_const = true,
                Token::Ident(name) => break name.to_string(),
                _ => return Err(self.error("expected a type name")),
            }
        };
        let mut is_handle = false;
        let mut ref_mode = RefMode::None;
        loop {
            match self.peek()? {
                Token::Handle => {
                    self.next()?;
                    if is_handle {
                        return Err(self.error("duplicate handle marker"));
                    }
                    is_handle = true;
                }
                Token::Amp => {
                    self.next()?;
                    if ref_mode != RefMode::None {
                        return Err(self.error("duplicate reference marker"));
                    }
                    ref_mode = match self.peek()? {
                        Token::Ident("in") => {
                            self.next()?;
                            RefMode::In
                        }
                        Token::Ident("out") => {
                            self.next()?;
                            RefMode::Out
                        }
                        Token::Ident("inout") => {
                            self.next()?;
                            RefMode::InOut
                        }
                        _ => RefMode::InOut,
                    };
                }
                _ => break,
            }
        }
        Ok(TypeExpr {
            base,
            is_handle,
            ref_mode,
            is_const,
        })
    }
}

/// Parses a function declaration string of the registration grammar.
///
/// The grammar is deliberately small: a return type expression, the
/// function name, and a parenthesized parameter list. Parameter names are
/// accepted and discarded.
pub fn parse_function_decl(src: &str) -> Result<FunctionDecl, RegisterError> {
    let mut lex = Lexer::new(src);
    let ret = lex.type_expr()?;
    let Token::Ident(name) = lex.next()? else {
        return Err(lex.error("expected a function name"));
    };
    let name = name.to_string();
    if lex.next()? != Token::LParen {
        return Err(lex.error("expected '('"));
    }
    let mut params = Vec::new();
    if lex.peek()? == Token::RParen {
        lex.next()?;
    } else {
        loop {
            let param = lex.type_expr()?;
            // Optional parameter name.
            if let Token::Ident(_) = lex.peek()? {
                lex.next()?;
            }
            params.push(param);
            match lex.next()? {
                Token::Comma => continue,
                Token::RParen => break,
                _ => return Err(lex.error("expected ',' or ')'")),
            }
        }
    }
    if lex.next()? != Token::End {
        return Err(lex.error("trailing tokens after the parameter list"));
    }
    Ok(FunctionDecl { ret, name, params })
}

/// Parses a property or global-variable declaration: a type expression
/// followed by a name.
pub fn parse_property_decl(src: &str) -> Result<PropertyDecl, RegisterError> {
    let mut lex = Lexer::new(src);
    let ty = lex.type_expr()?;
    if ty.ref_mode != RefMode::None {
        return Err(lex.error("a property cannot be declared as a reference"));
    }
    let Token::Ident(name) = lex.next()? else {
        return Err(lex.error("expected a property name"));
    };
    let name = name.to_string();
    if lex.next()? != Token::End {
        return Err(lex.error("trailing tokens after the property name"));
    }
    Ok(PropertyDecl { ty, name })
}

/// Parses a bare type expression, e.g. `"scoped"` or `"node@"`.
pub fn parse_type_expr(src: &str) -> Result<TypeExpr, RegisterError> {
    let mut lex = Lexer::new(src);
    let ty = lex.type_expr()?;
    if lex.next()? != Token::End {
        return Err(lex.error("trailing tokens after the type expression"));
    }
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_function() {
        let decl = parse_function_decl("void f()").unwrap();
        assert_eq!(decl.name, "f");
        assert_eq!(decl.ret, TypeExpr::plain("void"));
        assert!(decl.params.is_empty());
    }

    #[test]
    fn test_handle_return_and_params() {
        let decl = parse_function_decl("refclass@ create(int, double)").unwrap();
        assert_eq!(decl.name, "create");
        assert!(decl.ret.is_handle);
        assert_eq!(decl.ret.base, "refclass");
        assert_eq!(decl.params.len(), 2);
        assert_eq!(decl.params[0].base, "int");
        assert_eq!(decl.params[1].base, "double");
    }

    #[test]
    fn test_reference_modes() {
        let decl = parse_function_decl("void f(int &in, scoped &out, float &inout, bool &)").unwrap();
        assert_eq!(decl.params[0].ref_mode, RefMode::In);
        assert_eq!(decl.params[1].ref_mode, RefMode::Out);
        assert_eq!(decl.params[2].ref_mode, RefMode::InOut);
        assert_eq!(decl.params[3].ref_mode, RefMode::InOut);
    }

    #[test]
    fn test_named_parameters_are_accepted() {
        let decl = parse_function_decl("int add(int a, int b)").unwrap();
        assert_eq!(decl.params.len(), 2);
    }

    #[test]
    fn test_const_in_reference() {
        let decl = parse_function_decl("scoped@ opAdd(const scoped &in, int)").unwrap();
        assert!(decl.params[0].is_const);
        assert_eq!(decl.params[0].ref_mode, RefMode::In);
    }

    #[test]
    fn test_operator_and_destructor_names() {
        assert_eq!(parse_function_decl("node& opAssign(const node &in)").unwrap().name, "opAssign");
        assert_eq!(parse_function_decl("void ~node()").unwrap().name, "~node");
    }

    #[test]
    fn test_property_decl() {
        let p = parse_property_decl("node@ next").unwrap();
        assert_eq!(p.name, "next");
        assert!(p.ty.is_handle);
        assert!(parse_property_decl("int &in broken").is_err());
    }

    #[test]
    fn test_malformed_declarations() {
        assert!(parse_function_decl("").is_err());
        assert!(parse_function_decl("void").is_err());
        assert!(parse_function_decl("void f(").is_err());
        assert!(parse_function_decl("void f() extra").is_err());
        assert!(parse_function_decl("void f(int,,int)").is_err());
        assert!(parse_function_decl("@ f()").is_err());
        assert!(parse_function_decl("void@@ f()").is_err());
    }
}
