// File: src/parser.rs
//
// Recursive-descent parser for ECMAScript source.
// Full expression precedence, arrow-function cover-grammar resolution via
// lexer state save/restore, template literal scanning with nested
// re-parsing, classes with private fields and static blocks, contextual
// keyword and ASI handling.

use crate::ast::*;
use crate::errors::{JsError, SourceLocation};
use crate::lexer::{Lexer, LexerState, Token, TokenKind};

/// Parse a whole program
pub fn parse(source: &str, module: bool, is_eval: bool) -> Result<Program, JsError> {
    let lexer = Lexer::new(source);
    let mut parser = Parser::new(lexer, module, is_eval)?;
    parser.parse_program()
}

/// Saved parser position for speculative parsing
struct ParserCheckpoint {
    current: Token,
    next: Token,
    prev_line: usize,
    lexer: LexerState,
}

pub struct Parser {
    lexer: Lexer,
    current: Token,
    next: Token,
    /// Line of the previously consumed token, for ASI
    prev_line: usize,
    strict: bool,
    module: bool,
    is_eval: bool,
    function_nesting: u32,
    async_nesting: u32,
    generator_nesting: u32,
    in_function_body: bool,
    /// `in` parses as an operator unless a for-head suppresses it
    in_operator_allowed: bool,
    parsing_class_with_super: bool,
    in_derived_constructor: bool,
    super_property_allowed: bool,
}

impl Parser {
    pub fn new(mut lexer: Lexer, module: bool, is_eval: bool) -> Result<Self, JsError> {
        let current = lexer.next_token(true)?;
        let next = lexer.next_token(regex_allowed_after(&current))?;
        Ok(Parser {
            lexer,
            current,
            next,
            prev_line: 1,
            strict: module,
            module,
            is_eval,
            function_nesting: 0,
            async_nesting: 0,
            generator_nesting: 0,
            in_function_body: true,
            in_operator_allowed: true,
            parsing_class_with_super: false,
            in_derived_constructor: false,
            super_property_allowed: false,
        })
    }

    // === Token plumbing ===

    fn advance(&mut self) -> Result<Token, JsError> {
        let consumed = std::mem::replace(&mut self.current, self.next.clone());
        self.next = self.lexer.next_token(regex_allowed_after(&self.current))?;
        self.prev_line = consumed.line;
        Ok(consumed)
    }

    fn save(&self) -> ParserCheckpoint {
        ParserCheckpoint {
            current: self.current.clone(),
            next: self.next.clone(),
            prev_line: self.prev_line,
            lexer: self.lexer.save(),
        }
    }

    fn restore(&mut self, checkpoint: ParserCheckpoint) {
        self.current = checkpoint.current;
        self.next = checkpoint.next;
        self.prev_line = checkpoint.prev_line;
        self.lexer.restore(checkpoint.lexer);
    }

    fn span(&self) -> Span {
        Span::new(self.current.line, self.current.column, self.current.offset, self.current.offset)
    }

    fn error(&self, message: impl Into<String>) -> JsError {
        JsError::syntax(
            message,
            SourceLocation::new(self.current.line, self.current.column),
        )
    }

    fn eat_punct(&mut self, p: &str) -> Result<bool, JsError> {
        if self.current.is_punct(p) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), JsError> {
        if !self.eat_punct(p)? {
            return Err(self.error(format!("expected '{}'", p)));
        }
        Ok(())
    }

    fn eat_keyword(&mut self, k: &str) -> Result<bool, JsError> {
        if self.current.is_keyword(k) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_identifier(&mut self) -> Result<String, JsError> {
        match self.current.kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance()?;
                Ok(name)
            }
            // `yield` and `of` double as identifiers outside their contexts
            TokenKind::Keyword(k) if k == "of" || (k == "yield" && self.generator_nesting == 0) => {
                self.advance()?;
                Ok(k)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    /// A line terminator separates `current` from what came before it
    fn has_newline_before(&self) -> bool {
        self.current.newline_before
    }

    /// ASI: a semicolon is taken, implied by a line break, or implied by a
    /// closing brace / end of input
    fn consume_semicolon(&mut self) -> Result<(), JsError> {
        if self.eat_punct(";")? {
            return Ok(());
        }
        if self.current.newline_before {
            return Ok(());
        }
        if self.current.is_punct("}") || matches!(self.current.kind, TokenKind::Eof) {
            return Ok(());
        }
        Err(self.error(format!(
            "unexpected token, expected ';' (line {}, col {})",
            self.current.line, self.current.column
        )))
    }

    // === Program ===

    pub fn parse_program(&mut self) -> Result<Program, JsError> {
        let mut body = Vec::new();
        let mut in_prologue = true;
        while !matches!(self.current.kind, TokenKind::Eof) {
            let stmt = self.parse_stmt()?;
            if in_prologue {
                match stmt.kind {
                    StmtKind::Expr(Expr { kind: ExprKind::Str(ref directive), .. }) => {
                        if directive == "use strict" {
                            self.strict = true;
                        }
                    }
                    _ => in_prologue = false,
                }
            }
            body.push(stmt);
        }
        Ok(Program { body, strict: self.strict, module: self.module })
    }

    /// Re-entry point used for template-literal sub-expressions
    pub fn parse_expression(&mut self) -> Result<Expr, JsError> {
        let span = self.span();
        let first = self.parse_assignment()?;
        if !self.current.is_punct(",") {
            return Ok(first);
        }
        let mut exprs = vec![first];
        while self.eat_punct(",")? {
            exprs.push(self.parse_assignment()?);
        }
        Ok(Expr::new(ExprKind::Sequence(exprs), span))
    }

    // === Statements ===

    fn parse_stmt(&mut self) -> Result<Stmt, JsError> {
        let span = self.span();
        match self.current.kind.clone() {
            TokenKind::Punct(ref p) if p == "{" => {
                self.advance()?;
                let body = self.parse_stmt_list_until("}")?;
                self.expect_punct("}")?;
                Ok(Stmt::new(StmtKind::Block(body), span))
            }
            TokenKind::Punct(ref p) if p == ";" => {
                self.advance()?;
                Ok(Stmt::new(StmtKind::Empty, span))
            }
            TokenKind::Keyword(k) => match k.as_str() {
                "var" => self.parse_var_decl(VarKind::Var),
                "let" => self.parse_var_decl(VarKind::Let),
                "const" => self.parse_var_decl(VarKind::Const),
                "function" => {
                    let def = self.parse_function(false, FunctionForm::Declaration)?;
                    Ok(Stmt::new(StmtKind::FunctionDecl(Box::new(def)), span))
                }
                "class" => {
                    let def = self.parse_class()?;
                    if def.name.is_none() {
                        return Err(self.error("class declarations require a name"));
                    }
                    Ok(Stmt::new(StmtKind::ClassDecl(Box::new(def)), span))
                }
                "return" => {
                    if self.function_nesting == 0 && !self.is_eval {
                        return Err(self.error("'return' outside of a function"));
                    }
                    self.advance()?;
                    let value = if self.current.is_punct(";")
                        || self.current.is_punct("}")
                        || self.has_newline_before()
                        || matches!(self.current.kind, TokenKind::Eof)
                    {
                        None
                    } else {
                        Some(self.parse_expression()?)
                    };
                    self.consume_semicolon()?;
                    Ok(Stmt::new(StmtKind::Return(value), span))
                }
                "if" => self.parse_if(),
                "while" => self.parse_while(),
                "do" => self.parse_do_while(),
                "for" => self.parse_for(),
                "break" | "continue" => {
                    let is_break = k == "break";
                    self.advance()?;
                    let label = match self.current.kind.clone() {
                        TokenKind::Identifier(name) if !self.has_newline_before() => {
                            self.advance()?;
                            Some(name)
                        }
                        _ => None,
                    };
                    self.consume_semicolon()?;
                    Ok(Stmt::new(
                        if is_break { StmtKind::Break(label) } else { StmtKind::Continue(label) },
                        span,
                    ))
                }
                "throw" => {
                    self.advance()?;
                    if self.has_newline_before() {
                        return Err(self.error("illegal newline after 'throw'"));
                    }
                    let value = self.parse_expression()?;
                    self.consume_semicolon()?;
                    Ok(Stmt::new(StmtKind::Throw(value), span))
                }
                "try" => self.parse_try(),
                "switch" => self.parse_switch(),
                "debugger" => {
                    self.advance()?;
                    self.consume_semicolon()?;
                    Ok(Stmt::new(StmtKind::Debugger, span))
                }
                "with" => {
                    if self.strict {
                        return Err(self.error("'with' statements are not allowed in strict mode"));
                    }
                    Err(self.error("'with' statements are not supported"))
                }
                "import" | "export" => {
                    Err(self.error("module declarations are not supported"))
                }
                _ => self.parse_expr_stmt(span),
            },
            TokenKind::Identifier(ref name) => {
                // Labeled statement
                if self.next.is_punct(":") {
                    let label = name.clone();
                    self.advance()?;
                    self.advance()?;
                    let body = self.parse_stmt()?;
                    return Ok(Stmt::new(
                        StmtKind::Labeled { label, body: Box::new(body) },
                        span,
                    ));
                }
                // async function declaration
                if name == "async"
                    && self.next.is_keyword("function")
                    && !self.next.newline_before
                {
                    self.advance()?;
                    let def = self.parse_function(true, FunctionForm::Declaration)?;
                    return Ok(Stmt::new(StmtKind::FunctionDecl(Box::new(def)), span));
                }
                self.parse_expr_stmt(span)
            }
            _ => self.parse_expr_stmt(span),
        }
    }

    fn parse_expr_stmt(&mut self, span: Span) -> Result<Stmt, JsError> {
        let expr = self.parse_expression()?;
        self.consume_semicolon()?;
        Ok(Stmt::new(StmtKind::Expr(expr), span))
    }

    fn parse_stmt_list_until(&mut self, end: &str) -> Result<Vec<Stmt>, JsError> {
        let mut stmts = Vec::new();
        while !self.current.is_punct(end) {
            if matches!(self.current.kind, TokenKind::Eof) {
                return Err(self.error(format!("expected '{}' before end of input", end)));
            }
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    fn parse_var_decl(&mut self, kind: VarKind) -> Result<Stmt, JsError> {
        let span = self.span();
        self.advance()?;
        let mut declarations = Vec::new();
        loop {
            let name = self.expect_identifier()?;
            let init = if self.eat_punct("=")? {
                Some(self.parse_assignment()?)
            } else {
                if kind == VarKind::Const {
                    return Err(self.error("missing initializer in const declaration"));
                }
                None
            };
            declarations.push((name, init));
            if !self.eat_punct(",")? {
                break;
            }
        }
        self.consume_semicolon()?;
        Ok(Stmt::new(StmtKind::VarDecl { kind, declarations }, span))
    }

    fn parse_if(&mut self) -> Result<Stmt, JsError> {
        let span = self.span();
        self.advance()?;
        self.expect_punct("(")?;
        let test = self.parse_expression()?;
        self.expect_punct(")")?;
        let consequent = Box::new(self.parse_stmt()?);
        let alternate = if self.eat_keyword("else")? {
            Some(Box::new(self.parse_stmt()?))
        } else {
            None
        };
        Ok(Stmt::new(StmtKind::If { test, consequent, alternate }, span))
    }

    fn parse_while(&mut self) -> Result<Stmt, JsError> {
        let span = self.span();
        self.advance()?;
        self.expect_punct("(")?;
        let test = self.parse_expression()?;
        self.expect_punct(")")?;
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::new(StmtKind::While { test, body }, span))
    }

    fn parse_do_while(&mut self) -> Result<Stmt, JsError> {
        let span = self.span();
        self.advance()?;
        let body = Box::new(self.parse_stmt()?);
        if !self.eat_keyword("while")? {
            return Err(self.error("expected 'while' after do-loop body"));
        }
        self.expect_punct("(")?;
        let test = self.parse_expression()?;
        self.expect_punct(")")?;
        // The trailing semicolon of do-while is always optional
        self.eat_punct(";")?;
        Ok(Stmt::new(StmtKind::DoWhile { body, test }, span))
    }

    fn parse_for(&mut self) -> Result<Stmt, JsError> {
        let span = self.span();
        self.advance()?;
        let is_await = if self.current.is_ident("await") {
            if self.async_nesting == 0 && !(self.module && self.function_nesting == 0) {
                return Err(self.error("'for await' outside of an async context"));
            }
            self.advance()?;
            true
        } else {
            false
        };
        self.expect_punct("(")?;

        // Empty init
        if self.current.is_punct(";") {
            if is_await {
                return Err(self.error("'for await' requires a for-of head"));
            }
            self.advance()?;
            return self.parse_c_style_for_tail(span, None);
        }

        // Declaration head
        let decl_kind = match self.current.kind {
            TokenKind::Keyword(ref k) if k == "var" => Some(VarKind::Var),
            TokenKind::Keyword(ref k) if k == "let" => Some(VarKind::Let),
            TokenKind::Keyword(ref k) if k == "const" => Some(VarKind::Const),
            _ => None,
        };

        if let Some(kind) = decl_kind {
            self.advance()?;
            let name = self.expect_identifier()?;

            if self.current.is_keyword("of") {
                self.advance()?;
                let iterable = self.parse_assignment()?;
                self.expect_punct(")")?;
                let body = Box::new(self.parse_stmt()?);
                return Ok(Stmt::new(
                    StmtKind::ForOf {
                        head: ForHead::Decl(kind, name),
                        iterable,
                        body,
                        is_await,
                    },
                    span,
                ));
            }
            if self.current.is_keyword("in") {
                if is_await {
                    return Err(self.error("'for await' requires a for-of head"));
                }
                self.advance()?;
                let object = self.parse_expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.parse_stmt()?);
                return Ok(Stmt::new(
                    StmtKind::ForIn { head: ForHead::Decl(kind, name), object, body },
                    span,
                ));
            }
            if is_await {
                return Err(self.error("'for await' requires a for-of head"));
            }

            // C-style with declaration init
            let init = if self.eat_punct("=")? {
                // The `in` operator is suppressed inside a for-head
                let saved = self.in_operator_allowed;
                self.in_operator_allowed = false;
                let expr = self.parse_assignment();
                self.in_operator_allowed = saved;
                Some(expr?)
            } else {
                None
            };
            let mut declarations = vec![(name, init)];
            while self.eat_punct(",")? {
                let name = self.expect_identifier()?;
                let init = if self.eat_punct("=")? {
                    Some(self.parse_assignment()?)
                } else {
                    None
                };
                declarations.push((name, init));
            }
            self.expect_punct(";")?;
            let init_stmt = Stmt::new(StmtKind::VarDecl { kind, declarations }, span);
            return self.parse_c_style_for_tail(span, Some(Box::new(init_stmt)));
        }

        // Expression head
        let saved = self.in_operator_allowed;
        self.in_operator_allowed = false;
        let head_expr = self.parse_expression();
        self.in_operator_allowed = saved;
        let head_expr = head_expr?;

        if self.current.is_keyword("of") {
            self.advance()?;
            let iterable = self.parse_assignment()?;
            self.expect_punct(")")?;
            let body = Box::new(self.parse_stmt()?);
            return Ok(Stmt::new(
                StmtKind::ForOf {
                    head: ForHead::Target(head_expr),
                    iterable,
                    body,
                    is_await,
                },
                span,
            ));
        }
        if self.current.is_keyword("in") {
            if is_await {
                return Err(self.error("'for await' requires a for-of head"));
            }
            self.advance()?;
            let object = self.parse_expression()?;
            self.expect_punct(")")?;
            let body = Box::new(self.parse_stmt()?);
            return Ok(Stmt::new(
                StmtKind::ForIn { head: ForHead::Target(head_expr), object, body },
                span,
            ));
        }
        if is_await {
            return Err(self.error("'for await' requires a for-of head"));
        }
        self.expect_punct(";")?;
        let init_stmt = Stmt::new(StmtKind::Expr(head_expr), span);
        self.parse_c_style_for_tail(span, Some(Box::new(init_stmt)))
    }

    fn parse_c_style_for_tail(
        &mut self,
        span: Span,
        init: Option<Box<Stmt>>,
    ) -> Result<Stmt, JsError> {
        let test = if self.current.is_punct(";") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.current.is_punct(")") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::new(StmtKind::For { init, test, update, body }, span))
    }

    fn parse_try(&mut self) -> Result<Stmt, JsError> {
        let span = self.span();
        self.advance()?;
        self.expect_punct("{")?;
        let block = self.parse_stmt_list_until("}")?;
        self.expect_punct("}")?;

        let handler = if self.eat_keyword("catch")? {
            let param = if self.eat_punct("(")? {
                let name = self.expect_identifier()?;
                self.expect_punct(")")?;
                Some(name)
            } else {
                None
            };
            self.expect_punct("{")?;
            let body = self.parse_stmt_list_until("}")?;
            self.expect_punct("}")?;
            Some(CatchClause { param, body })
        } else {
            None
        };

        let finalizer = if self.eat_keyword("finally")? {
            self.expect_punct("{")?;
            let body = self.parse_stmt_list_until("}")?;
            self.expect_punct("}")?;
            Some(body)
        } else {
            None
        };

        if handler.is_none() && finalizer.is_none() {
            return Err(self.error("missing catch or finally after try"));
        }
        Ok(Stmt::new(StmtKind::Try { block, handler, finalizer }, span))
    }

    fn parse_switch(&mut self) -> Result<Stmt, JsError> {
        let span = self.span();
        self.advance()?;
        self.expect_punct("(")?;
        let discriminant = self.parse_expression()?;
        self.expect_punct(")")?;
        self.expect_punct("{")?;

        let mut cases = Vec::new();
        let mut seen_default = false;
        while !self.current.is_punct("}") {
            let test = if self.eat_keyword("case")? {
                let test = self.parse_expression()?;
                Some(test)
            } else if self.eat_keyword("default")? {
                if seen_default {
                    return Err(self.error("multiple default clauses in switch"));
                }
                seen_default = true;
                None
            } else {
                return Err(self.error("expected 'case' or 'default' in switch body"));
            };
            self.expect_punct(":")?;
            let mut body = Vec::new();
            while !self.current.is_punct("}")
                && !self.current.is_keyword("case")
                && !self.current.is_keyword("default")
            {
                body.push(self.parse_stmt()?);
            }
            cases.push(SwitchCase { test, body });
        }
        self.expect_punct("}")?;
        Ok(Stmt::new(StmtKind::Switch { discriminant, cases }, span))
    }

    // === Functions ===

    fn parse_function(
        &mut self,
        is_async: bool,
        form: FunctionForm,
    ) -> Result<FunctionDef, JsError> {
        let span = self.span();
        if !self.eat_keyword("function")? {
            return Err(self.error("expected 'function'"));
        }
        let is_generator = self.eat_punct("*")?;
        let name = match self.current.kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance()?;
                Some(name)
            }
            _ if form == FunctionForm::Declaration => {
                return Err(self.error("function declarations require a name"))
            }
            _ => None,
        };
        self.parse_function_rest(name, is_async, is_generator, false, span)
    }

    /// Parameters and body, with the nesting counters and contextual flags
    /// saved around them
    fn parse_function_rest(
        &mut self,
        name: Option<String>,
        is_async: bool,
        is_generator: bool,
        is_method: bool,
        span: Span,
    ) -> Result<FunctionDef, JsError> {
        let saved_in_body = self.in_function_body;
        self.function_nesting += 1;
        if is_async {
            self.async_nesting += 1;
        }
        if is_generator {
            self.generator_nesting += 1;
        }
        // await/yield are malformed inside the parameter list itself
        self.in_function_body = false;

        let result = (|| {
            self.expect_punct("(")?;
            let params = self.parse_params()?;
            self.in_function_body = true;
            self.expect_punct("{")?;
            let body = self.parse_stmt_list_until("}")?;
            self.expect_punct("}")?;
            let strict = body_has_use_strict(&body) || self.strict;
            Ok(FunctionDef {
                name,
                params,
                body,
                is_async,
                is_generator,
                is_arrow: false,
                strict,
                span,
            })
        })();

        self.function_nesting -= 1;
        if is_async {
            self.async_nesting -= 1;
        }
        if is_generator {
            self.generator_nesting -= 1;
        }
        self.in_function_body = saved_in_body;
        let _ = is_method;
        result
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, JsError> {
        let mut params = Vec::new();
        while !self.current.is_punct(")") {
            let span = self.span();
            if self.eat_punct("...")? {
                let name = self.expect_identifier()?;
                params.push(Param { name, default: None, rest: true, span });
                // Rest parameters must be terminal
                if !self.current.is_punct(")") {
                    return Err(self.error("rest parameter must be the last parameter"));
                }
                break;
            }
            if self.current.is_ident("await") && self.async_nesting > 0 {
                return Err(self.error("'await' is not allowed in parameter lists"));
            }
            if self.current.is_keyword("yield") && self.generator_nesting > 0 {
                return Err(self.error("'yield' is not allowed in parameter lists"));
            }
            let name = self.expect_identifier()?;
            let default = if self.eat_punct("=")? {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            params.push(Param { name, default, rest: false, span });
            if !self.eat_punct(",")? {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(params)
    }

    // === Classes ===

    fn parse_class(&mut self) -> Result<ClassDef, JsError> {
        let span = self.span();
        self.advance()?; // class
        let name = match self.current.kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance()?;
                Some(name)
            }
            _ => None,
        };
        let superclass = if self.eat_keyword("extends")? {
            Some(Box::new(self.parse_unary()?))
        } else {
            None
        };
        let has_super = superclass.is_some();
        let saved_with_super = self.parsing_class_with_super;
        self.parsing_class_with_super = has_super;

        self.expect_punct("{")?;
        let mut elements = Vec::new();
        while !self.current.is_punct("}") {
            if self.eat_punct(";")? {
                continue;
            }
            elements.push(self.parse_class_element(has_super)?);
        }
        self.expect_punct("}")?;

        self.parsing_class_with_super = saved_with_super;
        Ok(ClassDef { name, superclass, elements, span })
    }

    fn parse_class_element(&mut self, class_has_super: bool) -> Result<ClassElement, JsError> {
        // `static { ... }` block
        if self.current.is_ident("static") && self.next.is_punct("{") {
            self.advance()?;
            self.advance()?;
            let saved_super = self.super_property_allowed;
            self.super_property_allowed = true;
            let body = self.parse_stmt_list_until("}")?;
            self.super_property_allowed = saved_super;
            self.expect_punct("}")?;
            return Ok(ClassElement::StaticBlock(body));
        }

        let is_static = self.current.is_ident("static")
            && !self.next.is_punct("(")
            && !self.next.is_punct("=");
        if is_static {
            self.advance()?;
        }

        let mut is_async = false;
        let mut is_generator = false;
        let mut accessor = None;

        if self.current.is_ident("async")
            && !self.next.is_punct("(")
            && !self.next.is_punct("=")
            && !self.next.newline_before
        {
            is_async = true;
            self.advance()?;
        }
        if self.current.is_punct("*") {
            is_generator = true;
            self.advance()?;
        }
        // get/set apply only when a property name follows
        if (self.current.is_ident("get") || self.current.is_ident("set"))
            && !self.next.is_punct("(")
            && !self.next.is_punct("=")
            && !self.next.is_punct(";")
            && !self.next.is_punct(",")
            && !self.next.is_punct("}")
        {
            accessor = Some(if self.current.is_ident("get") {
                MethodKind::Get
            } else {
                MethodKind::Set
            });
            self.advance()?;
        }

        let key = self.parse_property_key()?;

        // Method
        if self.current.is_punct("(") {
            let is_ctor = !is_static
                && accessor.is_none()
                && !is_async
                && !is_generator
                && matches!(key, PropertyKey::Identifier(ref n) if n == "constructor");
            let kind = accessor.unwrap_or(if is_ctor {
                MethodKind::Constructor
            } else {
                MethodKind::Method
            });

            let saved_super_prop = self.super_property_allowed;
            let saved_derived = self.in_derived_constructor;
            self.super_property_allowed = true;
            if is_ctor && class_has_super {
                self.in_derived_constructor = true;
            }
            let span = self.span();
            let func =
                self.parse_function_rest(None, is_async, is_generator, true, span)?;
            self.super_property_allowed = saved_super_prop;
            self.in_derived_constructor = saved_derived;

            return Ok(ClassElement::Method { key, func: Box::new(func), kind, is_static });
        }

        // Field
        if is_async || is_generator || accessor.is_some() {
            return Err(self.error("expected '(' after method name"));
        }
        let value = if self.eat_punct("=")? {
            let saved_super = self.super_property_allowed;
            self.super_property_allowed = true;
            let value = self.parse_assignment()?;
            self.super_property_allowed = saved_super;
            Some(value)
        } else {
            None
        };
        self.consume_semicolon()?;
        Ok(ClassElement::Field { key, value, is_static })
    }

    fn parse_property_key(&mut self) -> Result<PropertyKey, JsError> {
        match self.current.kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance()?;
                Ok(PropertyKey::Identifier(name))
            }
            TokenKind::Keyword(name) => {
                self.advance()?;
                Ok(PropertyKey::Identifier(name))
            }
            TokenKind::Str(s) => {
                self.advance()?;
                Ok(PropertyKey::Str(s))
            }
            TokenKind::Number(n) => {
                self.advance()?;
                Ok(PropertyKey::Number(n))
            }
            TokenKind::PrivateName(name) => {
                self.advance()?;
                Ok(PropertyKey::Private(name))
            }
            TokenKind::Punct(ref p) if p == "[" => {
                self.advance()?;
                let expr = self.parse_assignment()?;
                self.expect_punct("]")?;
                Ok(PropertyKey::Computed(Box::new(expr)))
            }
            _ => Err(self.error("expected property name")),
        }
    }

    // === Expressions: the precedence ladder ===

    fn parse_assignment(&mut self) -> Result<Expr, JsError> {
        let span = self.span();

        // yield [*] expr?
        if self.current.is_keyword("yield") && self.generator_nesting > 0 {
            if !self.in_function_body {
                return Err(self.error("'yield' is not allowed in parameter lists"));
            }
            self.advance()?;
            let delegate = self.eat_punct("*")?;
            let argument = if self.yield_has_argument() {
                Some(Box::new(self.parse_assignment()?))
            } else {
                None
            };
            return Ok(Expr::new(ExprKind::Yield { argument, delegate }, span));
        }

        // async arrows / async function expressions
        if self.current.is_ident("async") && !self.next.newline_before {
            if let Some(arrow) = self.try_parse_async_arrow(span)? {
                return Ok(arrow);
            }
        }

        // Simple arrow: IDENT =>
        if matches!(self.current.kind, TokenKind::Identifier(_))
            && self.next.is_punct("=>")
            && !self.next.newline_before
        {
            let name = self.expect_identifier()?;
            let param_span = span;
            return self.parse_arrow_body(
                vec![Param { name, default: None, rest: false, span: param_span }],
                false,
                span,
            );
        }

        let left = self.parse_conditional()?;

        // Parenthesised cover grammar: re-interpret as parameters
        if self.current.is_punct("=>") && !self.current.newline_before {
            self.advance()?;
            let params = reinterpret_arrow_params(&left)
                .ok_or_else(|| self.error("invalid arrow function parameter list"))?;
            let body_span = span;
            return self.finish_arrow_body(params, false, body_span);
        }

        // Assignment operators, right-associative
        if let TokenKind::Punct(ref p) = self.current.kind.clone() {
            if is_assignment_op(p) {
                validate_assignment_target(&left)
                    .map_err(|msg| self.error(msg))?;
                let op = p.clone();
                self.advance()?;
                let value = self.parse_assignment()?;
                return Ok(Expr::new(
                    ExprKind::Assign {
                        op,
                        target: Box::new(left),
                        value: Box::new(value),
                    },
                    span,
                ));
            }
        }

        Ok(left)
    }

    fn yield_has_argument(&self) -> bool {
        if self.has_newline_before() {
            return false;
        }
        !(self.current.is_punct(";")
            || self.current.is_punct(")")
            || self.current.is_punct("]")
            || self.current.is_punct("}")
            || self.current.is_punct(",")
            || self.current.is_punct(":")
            || matches!(self.current.kind, TokenKind::Eof))
    }

    /// `async` may start an async function expression, `async x =>`, or
    /// `async (...) =>`; otherwise it is a plain identifier. Resolved by
    /// speculative lookahead with checkpoint restore.
    fn try_parse_async_arrow(&mut self, span: Span) -> Result<Option<Expr>, JsError> {
        if self.next.is_keyword("function") {
            self.advance()?;
            let def = self.parse_function(true, FunctionForm::Expression)?;
            return Ok(Some(Expr::new(ExprKind::Function(Box::new(def)), span)));
        }

        // async IDENT =>
        if matches!(self.next.kind, TokenKind::Identifier(_)) {
            let checkpoint = self.save();
            self.advance()?; // async
            if self.next.is_punct("=>") && !self.next.newline_before {
                let name = self.expect_identifier()?;
                let param = Param { name, default: None, rest: false, span };
                return Ok(Some(self.parse_arrow_body(vec![param], true, span)?));
            }
            self.restore(checkpoint);
            return Ok(None);
        }

        // async ( ... ) =>
        if self.next.is_punct("(") {
            if self.peek_past_parens_is_arrow()? {
                self.advance()?; // async
                let left = self.parse_primary()?;
                if !self.eat_punct("=>")? {
                    return Err(self.error("expected '=>' after async parameter list"));
                }
                let params = reinterpret_arrow_params(&left)
                    .ok_or_else(|| self.error("invalid arrow function parameter list"))?;
                return Ok(Some(self.finish_arrow_body(params, true, span)?));
            }
        }
        Ok(None)
    }

    /// Walk balanced parens from `next` and report whether `=>` follows;
    /// the parser state is fully restored
    fn peek_past_parens_is_arrow(&mut self) -> Result<bool, JsError> {
        let checkpoint = self.save();
        self.advance()?; // async -> current is '('
        let mut depth = 0usize;
        let result = loop {
            match self.current.kind {
                TokenKind::Punct(ref p) if p == "(" => depth += 1,
                TokenKind::Punct(ref p) if p == ")" => {
                    depth -= 1;
                    if depth == 0 {
                        break self.next.is_punct("=>") && !self.next.newline_before;
                    }
                }
                TokenKind::Eof => break false,
                _ => {}
            }
            if self.advance().is_err() {
                break false;
            }
        };
        self.restore(checkpoint);
        Ok(result)
    }

    fn parse_arrow_body(
        &mut self,
        params: Vec<Param>,
        is_async: bool,
        span: Span,
    ) -> Result<Expr, JsError> {
        if !self.eat_punct("=>")? {
            return Err(self.error("expected '=>'"));
        }
        self.finish_arrow_body(params, is_async, span)
    }

    fn finish_arrow_body(
        &mut self,
        params: Vec<Param>,
        is_async: bool,
        span: Span,
    ) -> Result<Expr, JsError> {
        self.function_nesting += 1;
        if is_async {
            self.async_nesting += 1;
        }
        let result = (|| {
            let body = if self.current.is_punct("{") {
                self.advance()?;
                let body = self.parse_stmt_list_until("}")?;
                self.expect_punct("}")?;
                body
            } else {
                // Expression body desugars to a single return
                let expr = self.parse_assignment()?;
                vec![Stmt::new(StmtKind::Return(Some(expr)), span)]
            };
            Ok(Expr::new(
                ExprKind::Function(Box::new(FunctionDef {
                    name: None,
                    params,
                    body,
                    is_async,
                    is_generator: false,
                    is_arrow: true,
                    strict: self.strict,
                    span,
                })),
                span,
            ))
        })();
        self.function_nesting -= 1;
        if is_async {
            self.async_nesting -= 1;
        }
        result
    }

    fn parse_conditional(&mut self) -> Result<Expr, JsError> {
        let span = self.span();
        let test = self.parse_nullish_or()?;
        if !self.eat_punct("?")? {
            return Ok(test);
        }
        let consequent = self.parse_assignment()?;
        self.expect_punct(":")?;
        let alternate = self.parse_assignment()?;
        Ok(Expr::new(
            ExprKind::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            },
            span,
        ))
    }

    /// `??` and `||` share a level and may not mix unparenthesised
    fn parse_nullish_or(&mut self) -> Result<Expr, JsError> {
        let span = self.span();
        let mut left = self.parse_logical_and()?;
        let mut seen: Option<&'static str> = None;
        loop {
            let op = if self.current.is_punct("??") {
                "??"
            } else if self.current.is_punct("||") {
                "||"
            } else {
                break;
            };
            if let Some(previous) = seen {
                if previous != op {
                    return Err(self.error("cannot mix '??' and '||' without parentheses"));
                }
            }
            seen = Some(if op == "??" { "??" } else { "||" });
            self.advance()?;
            let right = self.parse_logical_and()?;
            left = Expr::new(
                ExprKind::Binary {
                    op: op.to_string(),
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> Result<Expr, JsError> {
        let span = self.span();
        let mut left = self.parse_bit_or()?;
        while self.current.is_punct("&&") {
            self.advance()?;
            let right = self.parse_bit_or()?;
            left = Expr::new(
                ExprKind::Binary {
                    op: "&&".to_string(),
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_binary_level(
        &mut self,
        ops: &[&str],
        next: fn(&mut Self) -> Result<Expr, JsError>,
    ) -> Result<Expr, JsError> {
        let span = self.span();
        let mut left = next(self)?;
        'outer: loop {
            for &op in ops {
                if self.current.is_punct(op) {
                    self.advance()?;
                    let right = next(self)?;
                    left = Expr::new(
                        ExprKind::Binary {
                            op: op.to_string(),
                            left: Box::new(left),
                            right: Box::new(right),
                        },
                        span,
                    );
                    continue 'outer;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_bit_or(&mut self) -> Result<Expr, JsError> {
        self.parse_binary_level(&["|"], Self::parse_bit_xor)
    }

    fn parse_bit_xor(&mut self) -> Result<Expr, JsError> {
        self.parse_binary_level(&["^"], Self::parse_bit_and)
    }

    fn parse_bit_and(&mut self) -> Result<Expr, JsError> {
        self.parse_binary_level(&["&"], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr, JsError> {
        self.parse_binary_level(&["===", "!==", "==", "!="], Self::parse_relational)
    }

    fn parse_relational(&mut self) -> Result<Expr, JsError> {
        let span = self.span();
        let mut left = self.parse_shift()?;
        loop {
            let op = if self.current.is_punct("<") {
                "<"
            } else if self.current.is_punct("<=") {
                "<="
            } else if self.current.is_punct(">") {
                ">"
            } else if self.current.is_punct(">=") {
                ">="
            } else if self.current.is_keyword("instanceof") {
                "instanceof"
            } else if self.current.is_keyword("in") && self.in_operator_allowed {
                "in"
            } else {
                break;
            };
            self.advance()?;
            let right = self.parse_shift()?;
            left = Expr::new(
                ExprKind::Binary {
                    op: op.to_string(),
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> Result<Expr, JsError> {
        self.parse_binary_level(&[">>>", "<<", ">>"], Self::parse_additive)
    }

    fn parse_additive(&mut self) -> Result<Expr, JsError> {
        self.parse_binary_level(&["+", "-"], Self::parse_multiplicative)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, JsError> {
        self.parse_binary_level(&["*", "/", "%"], Self::parse_exponent)
    }

    /// Exponentiation is right-associative: the RHS recurses into itself
    fn parse_exponent(&mut self) -> Result<Expr, JsError> {
        let span = self.span();
        let left = self.parse_unary()?;
        if self.current.is_punct("**") {
            self.advance()?;
            let right = self.parse_exponent()?;
            return Ok(Expr::new(
                ExprKind::Binary {
                    op: "**".to_string(),
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            ));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, JsError> {
        let span = self.span();

        // await, gated on async nesting or top-level module code
        if self.current.is_ident("await") {
            let allowed = self.async_nesting > 0
                || (self.module && self.function_nesting == 0);
            if allowed {
                if !self.in_function_body && self.async_nesting > 0 {
                    return Err(self.error("'await' is not allowed in parameter lists"));
                }
                self.advance()?;
                let argument = self.parse_unary()?;
                return Ok(Expr::new(ExprKind::Await(Box::new(argument)), span));
            }
        }

        if let TokenKind::Punct(ref p) = self.current.kind.clone() {
            match p.as_str() {
                "+" | "-" | "!" | "~" => {
                    let op = p.clone();
                    self.advance()?;
                    let argument = self.parse_unary()?;
                    return Ok(Expr::new(
                        ExprKind::Unary { op, argument: Box::new(argument) },
                        span,
                    ));
                }
                "++" | "--" => {
                    let op = p.clone();
                    self.advance()?;
                    let argument = self.parse_unary()?;
                    validate_assignment_target(&argument).map_err(|msg| self.error(msg))?;
                    return Ok(Expr::new(
                        ExprKind::Update { op, prefix: true, argument: Box::new(argument) },
                        span,
                    ));
                }
                _ => {}
            }
        }
        if let TokenKind::Keyword(ref k) = self.current.kind.clone() {
            if matches!(k.as_str(), "typeof" | "void" | "delete") {
                let op = k.clone();
                self.advance()?;
                let argument = self.parse_unary()?;
                if op == "delete" && self.strict {
                    if matches!(argument.kind, ExprKind::Identifier(_)) {
                        return Err(
                            self.error("cannot delete a variable in strict mode")
                        );
                    }
                }
                return Ok(Expr::new(
                    ExprKind::Unary { op, argument: Box::new(argument) },
                    span,
                ));
            }
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, JsError> {
        let span = self.span();
        let expr = self.parse_call_member()?;
        // Postfix ++/-- bind only without an intervening line terminator
        if (self.current.is_punct("++") || self.current.is_punct("--"))
            && !self.current.newline_before
        {
            let op = match self.current.kind {
                TokenKind::Punct(ref p) => p.clone(),
                _ => unreachable!(),
            };
            validate_assignment_target(&expr).map_err(|msg| self.error(msg))?;
            self.advance()?;
            return Ok(Expr::new(
                ExprKind::Update { op, prefix: false, argument: Box::new(expr) },
                span,
            ));
        }
        Ok(expr)
    }

    fn parse_call_member(&mut self) -> Result<Expr, JsError> {
        if self.current.is_keyword("new") {
            return self.parse_new();
        }
        let primary = self.parse_primary()?;
        self.parse_member_chain(primary, true)
    }

    /// `new Expr(...)` binds member access to the callee before the
    /// argument list
    fn parse_new(&mut self) -> Result<Expr, JsError> {
        let span = self.span();
        self.advance()?; // new
        if self.current.is_punct(".") {
            return Err(self.error("'new.target' is not supported"));
        }
        let callee = if self.current.is_keyword("new") {
            self.parse_new()?
        } else {
            let primary = self.parse_primary()?;
            self.parse_member_chain(primary, false)?
        };
        let args = if self.current.is_punct("(") {
            self.parse_arguments()?
        } else {
            Vec::new()
        };
        let new_expr = Expr::new(ExprKind::New { callee: Box::new(callee), args }, span);
        self.parse_member_chain(new_expr, true)
    }

    fn parse_member_chain(&mut self, mut expr: Expr, allow_call: bool) -> Result<Expr, JsError> {
        loop {
            let span = self.span();
            if self.eat_punct(".")? {
                let property = match self.current.kind.clone() {
                    TokenKind::Identifier(name) => {
                        self.advance()?;
                        Expr::new(ExprKind::Identifier(name), span)
                    }
                    TokenKind::Keyword(name) => {
                        self.advance()?;
                        Expr::new(ExprKind::Identifier(name), span)
                    }
                    TokenKind::PrivateName(name) => {
                        self.advance()?;
                        Expr::new(ExprKind::PrivateName(name), span)
                    }
                    _ => return Err(self.error("expected property name after '.'")),
                };
                expr = Expr::new(
                    ExprKind::Member {
                        object: Box::new(expr),
                        property: Box::new(property),
                        computed: false,
                        optional: false,
                    },
                    span,
                );
            } else if self.current.is_punct("?.") {
                self.advance()?;
                if self.current.is_punct("(") {
                    if !allow_call {
                        return Err(self.error("optional call in a new expression"));
                    }
                    let args = self.parse_arguments()?;
                    expr = Expr::new(
                        ExprKind::Call { callee: Box::new(expr), args, optional: true },
                        span,
                    );
                } else if self.eat_punct("[")? {
                    let property = self.parse_expression()?;
                    self.expect_punct("]")?;
                    expr = Expr::new(
                        ExprKind::Member {
                            object: Box::new(expr),
                            property: Box::new(property),
                            computed: true,
                            optional: true,
                        },
                        span,
                    );
                } else {
                    let name = match self.current.kind.clone() {
                        TokenKind::Identifier(name) => name,
                        TokenKind::Keyword(name) => name,
                        _ => return Err(self.error("expected property name after '?.'")),
                    };
                    self.advance()?;
                    expr = Expr::new(
                        ExprKind::Member {
                            object: Box::new(expr),
                            property: Box::new(Expr::new(ExprKind::Identifier(name), span)),
                            computed: false,
                            optional: true,
                        },
                        span,
                    );
                }
            } else if self.eat_punct("[")? {
                let saved = self.in_operator_allowed;
                self.in_operator_allowed = true;
                let property = self.parse_expression();
                self.in_operator_allowed = saved;
                let property = property?;
                self.expect_punct("]")?;
                expr = Expr::new(
                    ExprKind::Member {
                        object: Box::new(expr),
                        property: Box::new(property),
                        computed: true,
                        optional: false,
                    },
                    span,
                );
            } else if allow_call && self.current.is_punct("(") {
                let args = self.parse_arguments()?;
                expr = Expr::new(
                    ExprKind::Call { callee: Box::new(expr), args, optional: false },
                    span,
                );
            } else if let TokenKind::Template(payload) = self.current.kind.clone() {
                // Tagged template
                self.advance()?;
                let (quasis, expressions) = self.parse_template_parts(&payload, true)?;
                expr = Expr::new(
                    ExprKind::TaggedTemplate { tag: Box::new(expr), quasis, expressions },
                    span,
                );
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, JsError> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        while !self.current.is_punct(")") {
            let span = self.span();
            if self.eat_punct("...")? {
                let value = self.parse_assignment()?;
                args.push(Expr::new(ExprKind::Spread(Box::new(value)), span));
            } else {
                args.push(self.parse_assignment()?);
            }
            if !self.eat_punct(",")? {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, JsError> {
        let span = self.span();
        match self.current.kind.clone() {
            TokenKind::Number(n) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Number(n), span))
            }
            TokenKind::BigInt(digits) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::BigInt(digits), span))
            }
            TokenKind::Str(s) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Str(s), span))
            }
            TokenKind::Regex { pattern, flags } => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Regex { pattern, flags }, span))
            }
            TokenKind::Template(payload) => {
                self.advance()?;
                let (quasis, expressions) = self.parse_template_parts(&payload, false)?;
                Ok(Expr::new(ExprKind::TemplateLiteral { quasis, expressions }, span))
            }
            TokenKind::PrivateName(name) => {
                // Only valid as `#x in obj`
                if !self.next.is_keyword("in") {
                    return Err(self.error("unexpected private name"));
                }
                self.advance()?;
                Ok(Expr::new(ExprKind::PrivateName(name), span))
            }
            TokenKind::Keyword(k) => match k.as_str() {
                "this" => {
                    self.advance()?;
                    Ok(Expr::new(ExprKind::This, span))
                }
                "true" => {
                    self.advance()?;
                    Ok(Expr::new(ExprKind::Bool(true), span))
                }
                "false" => {
                    self.advance()?;
                    Ok(Expr::new(ExprKind::Bool(false), span))
                }
                "null" => {
                    self.advance()?;
                    Ok(Expr::new(ExprKind::Null, span))
                }
                "function" => {
                    let def = self.parse_function(false, FunctionForm::Expression)?;
                    Ok(Expr::new(ExprKind::Function(Box::new(def)), span))
                }
                "class" => {
                    let def = self.parse_class()?;
                    Ok(Expr::new(ExprKind::Class(Box::new(def)), span))
                }
                "super" => {
                    if self.next.is_punct("(") {
                        if !self.in_derived_constructor {
                            return Err(self.error(
                                "'super' calls are only valid in derived constructors",
                            ));
                        }
                    } else if self.next.is_punct(".") || self.next.is_punct("[") {
                        if !self.super_property_allowed {
                            return Err(self.error(
                                "'super' property access is only valid in methods",
                            ));
                        }
                    } else {
                        return Err(self.error("unexpected 'super'"));
                    }
                    self.advance()?;
                    Ok(Expr::new(ExprKind::Super, span))
                }
                "yield" if self.generator_nesting == 0 => {
                    // Contextual identifier outside generators
                    self.advance()?;
                    Ok(Expr::new(ExprKind::Identifier("yield".to_string()), span))
                }
                "of" => {
                    self.advance()?;
                    Ok(Expr::new(ExprKind::Identifier("of".to_string()), span))
                }
                other => Err(self.error(format!("unexpected keyword '{}'", other))),
            },
            TokenKind::Identifier(name) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Identifier(name), span))
            }
            TokenKind::Punct(p) => match p.as_str() {
                "(" => self.parse_paren_or_arrow_cover(span),
                "[" => self.parse_array_literal(span),
                "{" => self.parse_object_literal(span),
                other => Err(self.error(format!("unexpected token '{}'", other))),
            },
            TokenKind::Eof => Err(self.error("unexpected end of input")),
        }
    }

    /// Parenthesised expression, or arrow parameters in disguise. Produces
    /// the cover shapes parse_assignment knows how to re-interpret: an
    /// empty-array sentinel for `()`, spread markers for rest parameters.
    fn parse_paren_or_arrow_cover(&mut self, span: Span) -> Result<Expr, JsError> {
        self.advance()?; // (
        if self.eat_punct(")")? {
            if !self.current.is_punct("=>") {
                return Err(self.error("unexpected ')'"));
            }
            return Ok(Expr::new(ExprKind::Array(Vec::new()), span));
        }

        let saved = self.in_operator_allowed;
        self.in_operator_allowed = true;
        let result = (|| {
            let mut items = Vec::new();
            loop {
                if self.current.is_punct("...") {
                    let rest_span = self.span();
                    self.advance()?;
                    let name = self.expect_identifier()?;
                    let marker = Expr::new(
                        ExprKind::Array(vec![Expr::new(
                            ExprKind::Spread(Box::new(Expr::new(
                                ExprKind::Identifier(name),
                                rest_span,
                            ))),
                            rest_span,
                        )]),
                        rest_span,
                    );
                    items.push(marker);
                    break;
                }
                items.push(self.parse_assignment()?);
                if !self.eat_punct(",")? {
                    break;
                }
            }
            self.expect_punct(")")?;
            Ok(if items.len() == 1 {
                items.pop().unwrap()
            } else {
                Expr::new(ExprKind::Sequence(items), span)
            })
        })();
        self.in_operator_allowed = saved;
        result
    }

    fn parse_array_literal(&mut self, span: Span) -> Result<Expr, JsError> {
        self.advance()?; // [
        let mut elements = Vec::new();
        while !self.current.is_punct("]") {
            let element_span = self.span();
            if self.current.is_punct(",") {
                self.advance()?;
                elements.push(Expr::new(ExprKind::Elision, element_span));
                continue;
            }
            if self.eat_punct("...")? {
                let value = self.parse_assignment()?;
                elements.push(Expr::new(ExprKind::Spread(Box::new(value)), element_span));
            } else {
                elements.push(self.parse_assignment()?);
            }
            if !self.eat_punct(",")? {
                break;
            }
        }
        self.expect_punct("]")?;
        Ok(Expr::new(ExprKind::Array(elements), span))
    }

    fn parse_object_literal(&mut self, span: Span) -> Result<Expr, JsError> {
        self.advance()?; // {
        let mut properties = Vec::new();
        while !self.current.is_punct("}") {
            let prop_span = self.span();

            if self.eat_punct("...")? {
                let value = self.parse_assignment()?;
                properties.push(Property {
                    key: PropertyKey::Identifier(String::new()),
                    value,
                    kind: PropertyKind::Spread,
                    computed: false,
                    span: prop_span,
                });
                if !self.eat_punct(",")? {
                    break;
                }
                continue;
            }

            let mut is_async = false;
            let mut is_generator = false;
            let mut accessor = None;

            if self.current.is_ident("async")
                && !self.next.is_punct("(")
                && !self.next.is_punct(":")
                && !self.next.is_punct(",")
                && !self.next.is_punct("}")
                && !self.next.newline_before
            {
                is_async = true;
                self.advance()?;
            }
            if self.current.is_punct("*") {
                is_generator = true;
                self.advance()?;
            }
            if (self.current.is_ident("get") || self.current.is_ident("set"))
                && !self.next.is_punct("(")
                && !self.next.is_punct(":")
                && !self.next.is_punct(",")
                && !self.next.is_punct("}")
            {
                accessor = Some(if self.current.is_ident("get") {
                    PropertyKind::Get
                } else {
                    PropertyKind::Set
                });
                self.advance()?;
            }

            let key = self.parse_property_key()?;
            let computed = matches!(key, PropertyKey::Computed(_));

            if self.current.is_punct("(") {
                // Method shorthand
                let func_span = self.span();
                let func =
                    self.parse_function_rest(None, is_async, is_generator, true, func_span)?;
                properties.push(Property {
                    key,
                    value: Expr::new(ExprKind::Function(Box::new(func)), func_span),
                    kind: match accessor {
                        Some(kind) => kind,
                        None => PropertyKind::Method,
                    },
                    computed,
                    span: prop_span,
                });
            } else if accessor.is_some() || is_async || is_generator {
                return Err(self.error("expected '(' after method name"));
            } else if self.eat_punct(":")? {
                let value = self.parse_assignment()?;
                properties.push(Property {
                    key,
                    value,
                    kind: PropertyKind::Init,
                    computed,
                    span: prop_span,
                });
            } else {
                // Shorthand { a } or default-marked { a = 1 } (cover only)
                let name = match key {
                    PropertyKey::Identifier(ref name) => name.clone(),
                    _ => return Err(self.error("expected ':' after property name")),
                };
                let value = if self.eat_punct("=")? {
                    let default = self.parse_assignment()?;
                    Expr::new(
                        ExprKind::Assign {
                            op: "=".to_string(),
                            target: Box::new(Expr::new(
                                ExprKind::Identifier(name.clone()),
                                prop_span,
                            )),
                            value: Box::new(default),
                        },
                        prop_span,
                    )
                } else {
                    Expr::new(ExprKind::Identifier(name.clone()), prop_span)
                };
                properties.push(Property {
                    key,
                    value,
                    kind: PropertyKind::Shorthand,
                    computed: false,
                    span: prop_span,
                });
            }

            if !self.eat_punct(",")? {
                break;
            }
        }
        self.expect_punct("}")?;
        Ok(Expr::new(ExprKind::Object(properties), span))
    }

    // === Template literals ===

    /// Scan a raw template payload into quasis and re-parsed interpolated
    /// expressions. Each interpolation is parsed by a fresh parser sharing
    /// module/eval state.
    fn parse_template_parts(
        &mut self,
        payload: &str,
        tagged: bool,
    ) -> Result<(Vec<TemplateQuasi>, Vec<Expr>), JsError> {
        let chars: Vec<char> = payload.chars().collect();
        let mut quasis = Vec::new();
        let mut expressions = Vec::new();
        let mut chunk_start = 0usize;
        let mut pos = 0usize;

        while pos < chars.len() {
            match chars[pos] {
                '\\' => {
                    // An escaped `$` (or anything else) cannot open `${`
                    pos += 2;
                }
                '$' if chars.get(pos + 1) == Some(&'{') => {
                    let raw: String = chars[chunk_start..pos].iter().collect();
                    quasis.push(self.make_quasi(&raw, tagged)?);

                    let expr_start = pos + 2;
                    let expr_end = find_template_expression_end(&chars, expr_start)
                        .ok_or_else(|| self.error("unterminated template expression"))?;
                    let source: String = chars[expr_start..expr_end].iter().collect();

                    let sub_lexer = Lexer::new(&source);
                    let mut sub_parser = Parser::new(sub_lexer, self.module, self.is_eval)?;
                    sub_parser.strict = self.strict;
                    sub_parser.function_nesting = self.function_nesting;
                    sub_parser.async_nesting = self.async_nesting;
                    sub_parser.generator_nesting = self.generator_nesting;
                    sub_parser.super_property_allowed = self.super_property_allowed;
                    sub_parser.in_derived_constructor = self.in_derived_constructor;
                    let expr = sub_parser.parse_expression()?;
                    if !matches!(sub_parser.current.kind, TokenKind::Eof) {
                        return Err(self.error("unexpected token in template expression"));
                    }
                    expressions.push(expr);

                    pos = expr_end + 1;
                    chunk_start = pos;
                }
                _ => pos += 1,
            }
        }
        let raw: String = chars[chunk_start..].iter().collect();
        quasis.push(self.make_quasi(&raw, tagged)?);
        Ok((quasis, expressions))
    }

    fn make_quasi(&self, raw: &str, tagged: bool) -> Result<TemplateQuasi, JsError> {
        let raw = normalize_template_newlines(raw);
        match cook_template_chunk(&raw) {
            Ok(cooked) => Ok(TemplateQuasi { raw, cooked: Some(cooked) }),
            Err(message) => {
                if tagged {
                    Ok(TemplateQuasi { raw, cooked: None })
                } else {
                    Err(self.error(message))
                }
            }
        }
    }
}

#[derive(PartialEq, Clone, Copy)]
enum FunctionForm {
    Declaration,
    Expression,
}

/// Regex literals are admissible after tokens that cannot end an operand
fn regex_allowed_after(token: &Token) -> bool {
    match token.kind {
        TokenKind::Identifier(_)
        | TokenKind::Number(_)
        | TokenKind::BigInt(_)
        | TokenKind::Str(_)
        | TokenKind::Template(_)
        | TokenKind::Regex { .. }
        | TokenKind::PrivateName(_) => false,
        TokenKind::Keyword(ref k) => {
            !matches!(k.as_str(), "this" | "super" | "true" | "false" | "null")
        }
        TokenKind::Punct(ref p) => !matches!(p.as_str(), ")" | "]" | "}" | "++" | "--"),
        TokenKind::Eof => true,
    }
}

fn is_assignment_op(p: &str) -> bool {
    matches!(
        p,
        "=" | "+="
            | "-="
            | "*="
            | "/="
            | "%="
            | "**="
            | "<<="
            | ">>="
            | ">>>="
            | "&="
            | "|="
            | "^="
            | "&&="
            | "||="
            | "??="
    )
}

/// The LHS of an assignment must be a simple target or a cover shape that
/// a later pass rejects at runtime (calls)
fn validate_assignment_target(expr: &Expr) -> Result<(), String> {
    match expr.kind {
        ExprKind::Identifier(_)
        | ExprKind::Member { .. }
        | ExprKind::Array(_)
        | ExprKind::Object(_)
        | ExprKind::Call { .. } => Ok(()),
        _ => Err("invalid assignment target".to_string()),
    }
}

/// Re-interpret a parenthesised cover expression as arrow parameters.
/// Acceptable shapes: Identifier; `ident = default`; a Sequence of those;
/// the empty-array sentinel; an array holding a spread rest marker.
fn reinterpret_arrow_params(expr: &Expr) -> Option<Vec<Param>> {
    fn one(expr: &Expr, out: &mut Vec<Param>) -> Option<()> {
        match expr.kind {
            ExprKind::Identifier(ref name) => {
                out.push(Param {
                    name: name.clone(),
                    default: None,
                    rest: false,
                    span: expr.span,
                });
                Some(())
            }
            ExprKind::Assign { ref op, ref target, ref value } if op == "=" => {
                match target.kind {
                    ExprKind::Identifier(ref name) => {
                        out.push(Param {
                            name: name.clone(),
                            default: Some((**value).clone()),
                            rest: false,
                            span: expr.span,
                        });
                        Some(())
                    }
                    _ => None,
                }
            }
            // Rest marker: ArrayExpression([SpreadElement(Ident)])
            ExprKind::Array(ref items) if items.len() == 1 => match items[0].kind {
                ExprKind::Spread(ref inner) => match inner.kind {
                    ExprKind::Identifier(ref name) => {
                        out.push(Param {
                            name: name.clone(),
                            default: None,
                            rest: true,
                            span: expr.span,
                        });
                        Some(())
                    }
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        }
    }

    let mut params = Vec::new();
    match expr.kind {
        // `()` sentinel
        ExprKind::Array(ref items) if items.is_empty() => {}
        ExprKind::Sequence(ref items) => {
            for item in items {
                one(item, &mut params)?;
            }
        }
        _ => one(expr, &mut params)?,
    }
    // Rest must be terminal
    if params.iter().rev().skip(1).any(|p| p.rest) {
        return None;
    }
    Some(params)
}

fn body_has_use_strict(body: &[Stmt]) -> bool {
    for stmt in body {
        match stmt.kind {
            StmtKind::Expr(Expr { kind: ExprKind::Str(ref s), .. }) => {
                if s == "use strict" {
                    return true;
                }
            }
            _ => return false,
        }
    }
    false
}

/// CRLF and lone CR normalise to LF in raw quasis; nothing else changes
fn normalize_template_newlines(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' {
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
            out.push('\n');
        } else {
            out.push(c);
        }
    }
    out
}

/// Full escape processing for a cooked quasi; Err carries the message for
/// untagged templates (tagged ones map it to cooked = None)
fn cook_template_chunk(raw: &str) -> Result<String, String> {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut pos = 0usize;
    while pos < chars.len() {
        let c = chars[pos];
        if c != '\\' {
            out.push(c);
            pos += 1;
            continue;
        }
        pos += 1;
        let Some(&escaped) = chars.get(pos) else {
            return Err("unterminated escape in template literal".to_string());
        };
        pos += 1;
        match escaped {
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'b' => out.push('\u{0008}'),
            'f' => out.push('\u{000C}'),
            'v' => out.push('\u{000B}'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            '`' => out.push('`'),
            '$' => out.push('$'),
            '\n' => {}
            '0' => {
                if chars.get(pos).map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    return Err("octal escapes are not allowed in template literals".to_string());
                }
                out.push('\0');
            }
            '1'..='9' => {
                return Err("octal escapes are not allowed in template literals".to_string());
            }
            'x' => {
                let hex: String = chars.get(pos..pos + 2).map(|s| s.iter().collect()).unwrap_or_default();
                let value = u32::from_str_radix(&hex, 16)
                    .map_err(|_| "invalid hexadecimal escape".to_string())?;
                if hex.len() != 2 {
                    return Err("invalid hexadecimal escape".to_string());
                }
                out.push(char::from_u32(value).ok_or("invalid hexadecimal escape")?);
                pos += 2;
            }
            'u' => {
                if chars.get(pos) == Some(&'{') {
                    let close = chars[pos..]
                        .iter()
                        .position(|&c| c == '}')
                        .ok_or("invalid unicode escape")?;
                    let hex: String = chars[pos + 1..pos + close].iter().collect();
                    if hex.is_empty() {
                        return Err("invalid unicode escape".to_string());
                    }
                    let value = u32::from_str_radix(&hex, 16)
                        .map_err(|_| "invalid unicode escape".to_string())?;
                    out.push(char::from_u32(value).ok_or("invalid unicode escape")?);
                    pos += close + 1;
                } else {
                    let hex: String =
                        chars.get(pos..pos + 4).map(|s| s.iter().collect()).unwrap_or_default();
                    if hex.len() != 4 {
                        return Err("invalid unicode escape".to_string());
                    }
                    let value = u32::from_str_radix(&hex, 16)
                        .map_err(|_| "invalid unicode escape".to_string())?;
                    out.push(char::from_u32(value).ok_or("invalid unicode escape")?);
                    pos += 4;
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Advance through nested constructs (balanced braces, strings of either
/// kind, regex literals when contextually admissible, comments, nested
/// templates, numbers, spread) to the `}` closing a `${` at nesting 0
fn find_template_expression_end(chars: &[char], start: usize) -> Option<usize> {
    let mut pos = start;
    let mut depth = 0usize;
    // Whether a `/` here would start a regex literal
    let mut regex_allowed = true;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            '}' if depth == 0 => return Some(pos),
            '{' => {
                depth += 1;
                regex_allowed = true;
                pos += 1;
            }
            '}' => {
                depth -= 1;
                regex_allowed = false;
                pos += 1;
            }
            '\'' | '"' => {
                let quote = c;
                pos += 1;
                while pos < chars.len() && chars[pos] != quote {
                    if chars[pos] == '\\' {
                        pos += 1;
                    }
                    pos += 1;
                }
                pos += 1;
                regex_allowed = false;
            }
            '`' => {
                // Nested template: skip it whole, interpolations included
                pos += 1;
                while pos < chars.len() && chars[pos] != '`' {
                    if chars[pos] == '\\' {
                        pos += 2;
                        continue;
                    }
                    if chars[pos] == '$' && chars.get(pos + 1) == Some(&'{') {
                        pos = find_template_expression_end(chars, pos + 2)? + 1;
                        continue;
                    }
                    pos += 1;
                }
                pos += 1;
                regex_allowed = false;
            }
            '/' if chars.get(pos + 1) == Some(&'/') => {
                while pos < chars.len() && chars[pos] != '\n' {
                    pos += 1;
                }
            }
            '/' if chars.get(pos + 1) == Some(&'*') => {
                pos += 2;
                while pos + 1 < chars.len() && !(chars[pos] == '*' && chars[pos + 1] == '/') {
                    pos += 1;
                }
                pos += 2;
            }
            '/' if regex_allowed => {
                // Regex literal
                pos += 1;
                let mut in_class = false;
                while pos < chars.len() {
                    match chars[pos] {
                        '\\' => pos += 1,
                        '[' => in_class = true,
                        ']' => in_class = false,
                        '/' if !in_class => break,
                        _ => {}
                    }
                    pos += 1;
                }
                pos += 1;
                regex_allowed = false;
            }
            '.' if chars.get(pos + 1) == Some(&'.') && chars.get(pos + 2) == Some(&'.') => {
                pos += 3;
                regex_allowed = true;
            }
            c if c.is_ascii_digit() => {
                while pos < chars.len()
                    && (chars[pos].is_ascii_alphanumeric()
                        || chars[pos] == '.'
                        || chars[pos] == '_')
                {
                    pos += 1;
                }
                regex_allowed = false;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let word_start = pos;
                while pos < chars.len()
                    && (chars[pos].is_alphanumeric() || chars[pos] == '_' || chars[pos] == '$')
                {
                    pos += 1;
                }
                let word: String = chars[word_start..pos].iter().collect();
                // Contextual keywords re-enable regex position
                regex_allowed = matches!(
                    word.as_str(),
                    "return" | "typeof" | "instanceof" | "in" | "of" | "new" | "delete" | "void"
                        | "case" | "do" | "else" | "yield" | "await"
                );
            }
            c if c.is_whitespace() => pos += 1,
            _ => {
                regex_allowed = true;
                pos += 1;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        parse(src, false, false).expect("parse error")
    }

    fn first_expr(program: &Program) -> &Expr {
        match program.body.first().map(|s| &s.kind) {
            Some(StmtKind::Expr(expr)) => expr,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn test_async_arrow_precedence() {
        let program = parse_ok("let f = async x => x + 1");
        let StmtKind::VarDecl { ref declarations, .. } = program.body[0].kind else {
            panic!("expected let declaration");
        };
        let init = declarations[0].1.as_ref().unwrap();
        let ExprKind::Function(ref def) = init.kind else {
            panic!("expected arrow function, got {:?}", init.kind);
        };
        assert!(def.is_async);
        assert!(def.is_arrow);
        assert_eq!(def.params.len(), 1);
        assert_eq!(def.params[0].name, "x");
        let StmtKind::Return(Some(ref body)) = def.body[0].kind else {
            panic!("expected expression body");
        };
        let ExprKind::Binary { ref op, ref left, ref right } = body.kind else {
            panic!("expected binary body");
        };
        assert_eq!(op, "+");
        assert!(matches!(left.kind, ExprKind::Identifier(ref n) if n == "x"));
        assert!(matches!(right.kind, ExprKind::Number(n) if n == 1.0));
    }

    #[test]
    fn test_async_as_plain_identifier() {
        let program = parse_ok("async = 5; async + 1");
        assert!(matches!(
            first_expr(&program).kind,
            ExprKind::Assign { ref target, .. }
                if matches!(target.kind, ExprKind::Identifier(ref n) if n == "async")
        ));
    }

    #[test]
    fn test_tagged_template_with_nested_template() {
        let program = parse_ok("tag`a${`b${1}c`}d`");
        let ExprKind::TaggedTemplate { ref tag, ref quasis, ref expressions } =
            first_expr(&program).kind
        else {
            panic!("expected tagged template");
        };
        assert!(matches!(tag.kind, ExprKind::Identifier(ref n) if n == "tag"));
        assert_eq!(quasis.len(), 2);
        assert_eq!(quasis[0].cooked.as_deref(), Some("a"));
        assert_eq!(quasis[1].cooked.as_deref(), Some("d"));
        assert_eq!(expressions.len(), 1);
        let ExprKind::TemplateLiteral { quasis: ref inner_q, expressions: ref inner_e } =
            expressions[0].kind
        else {
            panic!("expected nested template literal");
        };
        assert_eq!(inner_q[0].cooked.as_deref(), Some("b"));
        assert_eq!(inner_q[1].cooked.as_deref(), Some("c"));
        assert!(matches!(inner_e[0].kind, ExprKind::Number(n) if n == 1.0));
    }

    #[test]
    fn test_template_escaped_dollar_is_not_interpolation() {
        let program = parse_ok("`a\\${b`");
        let ExprKind::TemplateLiteral { ref quasis, ref expressions } = first_expr(&program).kind
        else {
            panic!("expected template literal");
        };
        assert!(expressions.is_empty());
        assert_eq!(quasis[0].cooked.as_deref(), Some("a${b"));
    }

    #[test]
    fn test_asi_accepts_newline_and_brace() {
        assert!(parse("let a = 1\nlet b = 2", false, false).is_ok());
        assert!(parse("{ let a = 1 }", false, false).is_ok());
        assert!(parse("let a = 1 let b = 2", false, false).is_err());
    }

    #[test]
    fn test_postfix_increment_does_not_cross_newline() {
        // ASI turns this into two statements, the second of which is invalid
        let program = parse_ok("a\n++b");
        assert_eq!(program.body.len(), 2);
        assert!(matches!(
            first_expr(&program).kind,
            ExprKind::Identifier(ref n) if n == "a"
        ));
    }

    #[test]
    fn test_precedence_ladder() {
        let program = parse_ok("1 + 2 * 3 ** 4 < 5 === true && false || 0");
        // || at the top
        let ExprKind::Binary { ref op, .. } = first_expr(&program).kind else {
            panic!("expected binary expression");
        };
        assert_eq!(op, "||");

        // Exponentiation is right-associative
        let program = parse_ok("2 ** 3 ** 4");
        let ExprKind::Binary { ref right, .. } = first_expr(&program).kind else {
            panic!("expected binary expression");
        };
        assert!(matches!(right.kind, ExprKind::Binary { ref op, .. } if op == "**"));
    }

    #[test]
    fn test_nullish_and_or_cannot_mix() {
        assert!(parse("a ?? b ?? c", false, false).is_ok());
        assert!(parse("a || b || c", false, false).is_ok());
        assert!(parse("a ?? b || c", false, false).is_err());
        assert!(parse("a ?? (b || c)", false, false).is_ok());
    }

    #[test]
    fn test_paren_arrow_cover_grammar() {
        let program = parse_ok("(a, b = 1, ...rest) => a");
        let ExprKind::Function(ref def) = first_expr(&program).kind else {
            panic!("expected arrow function");
        };
        assert_eq!(def.params.len(), 3);
        assert!(def.params[1].default.is_some());
        assert!(def.params[2].rest);

        let program = parse_ok("() => 1");
        let ExprKind::Function(ref def) = first_expr(&program).kind else {
            panic!("expected arrow function");
        };
        assert!(def.params.is_empty());

        // The same source without the arrow is a plain sequence
        let program = parse_ok("(a, b)");
        assert!(matches!(first_expr(&program).kind, ExprKind::Sequence(_)));

        assert!(parse("(a + 1) => b", false, false).is_err());
    }

    #[test]
    fn test_new_binds_member_before_args() {
        let program = parse_ok("new a.b.C(1)");
        let ExprKind::New { ref callee, ref args } = first_expr(&program).kind else {
            panic!("expected new expression");
        };
        assert_eq!(args.len(), 1);
        assert!(matches!(callee.kind, ExprKind::Member { .. }));
    }

    #[test]
    fn test_for_in_header_gates_in_operator() {
        let program = parse_ok("for (k in obj) {}");
        assert!(matches!(program.body[0].kind, StmtKind::ForIn { .. }));
        // `in` as an operator elsewhere
        let program = parse_ok("'x' in obj");
        assert!(matches!(
            first_expr(&program).kind,
            ExprKind::Binary { ref op, .. } if op == "in"
        ));
    }

    #[test]
    fn test_for_of_and_for_await() {
        let program = parse_ok("for (const x of xs) {}");
        let StmtKind::ForOf { ref head, is_await, .. } = program.body[0].kind else {
            panic!("expected for-of");
        };
        assert!(!is_await);
        assert!(matches!(head, ForHead::Decl(VarKind::Const, ref n) if n == "x"));

        let program = parse_ok("async function f() { for await (const x of xs) {} }");
        let StmtKind::FunctionDecl(ref def) = program.body[0].kind else { panic!() };
        assert!(matches!(
            def.body[0].kind,
            StmtKind::ForOf { is_await: true, .. }
        ));
        assert!(parse("for await (const x of xs) {}", false, false).is_err());
    }

    #[test]
    fn test_class_with_private_fields_and_static_block() {
        let src = r#"
            class Counter extends Base {
                #count = 0;
                static instances = 0;
                static { Counter.ready = true; }
                constructor(start) { super(); this.#count = start; }
                get value() { return this.#count; }
                increment() { this.#count++; }
                static *make() { yield new Counter(0); }
            }
        "#;
        let program = parse_ok(src);
        let StmtKind::ClassDecl(ref def) = program.body[0].kind else {
            panic!("expected class declaration");
        };
        assert!(def.superclass.is_some());
        assert_eq!(def.elements.len(), 7);
        assert!(matches!(
            def.elements[0],
            ClassElement::Field { key: PropertyKey::Private(ref n), is_static: false, .. }
                if n == "count"
        ));
        assert!(matches!(def.elements[2], ClassElement::StaticBlock(_)));
        assert!(matches!(
            def.elements[3],
            ClassElement::Method { kind: MethodKind::Constructor, .. }
        ));
        assert!(matches!(
            def.elements[4],
            ClassElement::Method { kind: MethodKind::Get, .. }
        ));
        let ClassElement::Method { ref func, is_static, .. } = def.elements[6] else {
            panic!()
        };
        assert!(is_static);
        assert!(func.is_generator);
    }

    #[test]
    fn test_super_gating() {
        assert!(parse("super()", false, false).is_err());
        assert!(parse("class A { m() { super.x; } }", false, false).is_ok());
        assert!(parse("class A extends B { constructor() { super(); } }", false, false).is_ok());
        assert!(parse("class A { constructor() { super(); } }", false, false).is_err());
        assert!(parse("function f() { super.x; }", false, false).is_err());
    }

    #[test]
    fn test_get_set_prefix_is_contextual() {
        let program = parse_ok("let o = { get: 1, set: 2, get x() { return 3; } }");
        let StmtKind::VarDecl { ref declarations, .. } = program.body[0].kind else { panic!() };
        let ExprKind::Object(ref props) = declarations[0].1.as_ref().unwrap().kind else {
            panic!()
        };
        assert_eq!(props.len(), 3);
        assert_eq!(props[0].kind, PropertyKind::Init);
        assert_eq!(props[2].kind, PropertyKind::Get);
    }

    #[test]
    fn test_yield_forms() {
        let program = parse_ok("function* g() { yield; yield 1; yield* inner(); }");
        let StmtKind::FunctionDecl(ref def) = program.body[0].kind else { panic!() };
        let yields: Vec<_> = def
            .body
            .iter()
            .map(|s| match s.kind {
                StmtKind::Expr(Expr { kind: ExprKind::Yield { ref argument, delegate }, .. }) => {
                    (argument.is_some(), delegate)
                }
                _ => panic!("expected yield"),
            })
            .collect();
        assert_eq!(yields, vec![(false, false), (true, false), (true, true)]);
        // yield with a newline before the argument yields undefined (ASI)
        let program = parse_ok("function* g() { yield\n1 }");
        let StmtKind::FunctionDecl(ref def) = program.body[0].kind else { panic!() };
        assert!(matches!(
            def.body[0].kind,
            StmtKind::Expr(Expr { kind: ExprKind::Yield { argument: None, .. }, .. })
        ));
    }

    #[test]
    fn test_await_gating() {
        assert!(parse("async function f() { await p; }", false, false).is_ok());
        // Top-level await needs module mode
        let program = parse("await p", true, false).expect("module-mode top-level await");
        assert!(matches!(first_expr(&program).kind, ExprKind::Await(_)));
        let program = parse_ok("await + 1");
        // Without module mode, `await` is an identifier
        assert!(matches!(
            first_expr(&program).kind,
            ExprKind::Binary { ref left, .. }
                if matches!(left.kind, ExprKind::Identifier(ref n) if n == "await")
        ));
        assert!(parse("async function f(x = await p) {}", false, false).is_err());
    }

    #[test]
    fn test_regex_literal_vs_division() {
        let program = parse_ok("let re = /ab+c/gi");
        let StmtKind::VarDecl { ref declarations, .. } = program.body[0].kind else { panic!() };
        assert!(matches!(
            declarations[0].1.as_ref().unwrap().kind,
            ExprKind::Regex { ref pattern, ref flags } if pattern == "ab+c" && flags == "gi"
        ));
        let program = parse_ok("a / b / c");
        assert!(matches!(
            first_expr(&program).kind,
            ExprKind::Binary { ref op, .. } if op == "/"
        ));
    }

    #[test]
    fn test_optional_chaining_and_spread() {
        let program = parse_ok("a?.b?.[c]?.(d, ...e)");
        assert!(matches!(
            first_expr(&program).kind,
            ExprKind::Call { optional: true, .. }
        ));
    }

    #[test]
    fn test_use_strict_directive() {
        let program = parse_ok("'use strict'; x = 1");
        assert!(program.strict);
        let program = parse_ok("function f() { 'use strict'; }");
        let StmtKind::FunctionDecl(ref def) = program.body[0].kind else { panic!() };
        assert!(def.strict);
        // Module mode implies strict
        assert!(parse("1", true, false).unwrap().strict);
    }

    #[test]
    fn test_rest_parameter_must_be_terminal() {
        assert!(parse("function f(...a, b) {}", false, false).is_err());
        assert!(parse("function f(a, ...b) {}", false, false).is_ok());
    }

    #[test]
    fn test_errors_carry_location() {
        let err = parse("let a = \n  @", false, false).unwrap_err();
        assert_eq!(err.location.line, 2);
    }

    #[test]
    fn test_labeled_statements() {
        let program = parse_ok("outer: for (;;) { break outer; continue outer; }");
        assert!(matches!(program.body[0].kind, StmtKind::Labeled { ref label, .. } if label == "outer"));
    }

    #[test]
    fn test_switch_and_try_shapes() {
        let program =
            parse_ok("try { f(); } catch (e) { g(e); } finally { h(); } switch (x) { case 1: break; default: y(); }");
        assert!(matches!(program.body[0].kind, StmtKind::Try { ref handler, ref finalizer, .. }
            if handler.is_some() && finalizer.is_some()));
        let StmtKind::Switch { ref cases, .. } = program.body[1].kind else { panic!() };
        assert_eq!(cases.len(), 2);
        assert!(cases[1].test.is_none());
    }

    #[test]
    fn test_bigint_and_numeric_separator_literals() {
        let program = parse_ok("let a = 1_000_000; let b = 0xFFn;");
        let StmtKind::VarDecl { ref declarations, .. } = program.body[0].kind else { panic!() };
        assert!(matches!(
            declarations[0].1.as_ref().unwrap().kind,
            ExprKind::Number(n) if n == 1_000_000.0
        ));
        let StmtKind::VarDecl { ref declarations, .. } = program.body[1].kind else { panic!() };
        assert!(matches!(
            declarations[0].1.as_ref().unwrap().kind,
            ExprKind::BigInt(ref d) if d == "255"
        ));
    }
}
