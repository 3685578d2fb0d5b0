use super::lexer::{Diagnostic, Span, Tok, Token};
use crate::scalar::ScalarType;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Copy, Debug, PartialEq)]
pub(super) enum Value {
    I(i64),
    F(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinOp {
    fn is_comparison(self) -> bool {
        use BinOp::*;
        matches!(self, Lt | Le | Gt | Ge | Eq | Ne)
    }
    fn is_shift(self) -> bool {
        matches!(self, Self::Shl | Self::Shr)
    }
    fn integer_only(self) -> bool {
        use BinOp::*;
        matches!(self, Rem | Shl | Shr | BitAnd | BitOr | BitXor)
    }
    fn from_compound(punct: &str) -> Option<Self> {
        use BinOp::*;
        let op = match punct {
            "+=" => Add,
            "-=" => Sub,
            "*=" => Mul,
            "/=" => Div,
            "%=" => Rem,
            "<<=" => Shl,
            ">>=" => Shr,
            "&=" => BitAnd,
            "|=" => BitOr,
            "^=" => BitXor,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinTok {
    Op(BinOp),
    And,
    Or,
}

impl BinTok {
    fn from_punct(punct: &str) -> Option<(Self, u8)> {
        use BinOp::*;
        let (op, prec) = match punct {
            "||" => return Some((Self::Or, 1)),
            "&&" => return Some((Self::And, 2)),
            "|" => (BitOr, 3),
            "^" => (BitXor, 4),
            "&" => (BitAnd, 5),
            "==" => (Eq, 6),
            "!=" => (Ne, 6),
            "<" => (Lt, 7),
            "<=" => (Le, 7),
            ">" => (Gt, 7),
            ">=" => (Ge, 7),
            "<<" => (Shl, 8),
            ">>" => (Shr, 8),
            "+" => (Add, 9),
            "-" => (Sub, 9),
            "*" => (Mul, 10),
            "/" => (Div, 10),
            "%" => (Rem, 10),
            _ => return None,
        };
        Some((Self::Op(op), prec))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum UnOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum WorkItemFn {
    GlobalId,
    LocalId,
    GroupId,
    GlobalSize,
    LocalSize,
    NumGroups,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum MathFn {
    Min,
    Max,
    Abs,
}

#[derive(Clone, Copy)]
enum Builtin {
    WorkItem(WorkItemFn),
    WorkDim,
    Math(MathFn),
}

static BUILTINS: Lazy<HashMap<&'static str, Builtin>> = Lazy::new(|| {
    use Builtin::*;
    use WorkItemFn::*;
    [
        ("get_global_id", WorkItem(GlobalId)),
        ("get_local_id", WorkItem(LocalId)),
        ("get_group_id", WorkItem(GroupId)),
        ("get_global_size", WorkItem(GlobalSize)),
        ("get_local_size", WorkItem(LocalSize)),
        ("get_num_groups", WorkItem(NumGroups)),
        ("get_work_dim", WorkDim),
        ("min", Math(MathFn::Min)),
        ("max", Math(MathFn::Max)),
        ("abs", Math(MathFn::Abs)),
        ("fabs", Math(MathFn::Abs)),
    ]
    .into_iter()
    .collect()
});

#[derive(Debug)]
pub(super) struct Expr {
    pub(super) kind: ExprKind,
    pub(super) ty: ScalarType,
    pub(super) span: Span,
}

#[derive(Debug)]
pub(super) enum ExprKind {
    Const(Value),
    Local(usize),
    Load {
        buffer: usize,
        index: Box<Expr>,
    },
    Unary(UnOp, Box<Expr>),
    /// Operands are converted to the type the operation is performed in.
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Logical {
        and: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Convert(Box<Expr>),
    WorkItem(WorkItemFn, Box<Expr>),
    WorkDim,
    Math(MathFn, Vec<Expr>),
    /// `value` is converted to the place type, or for compound assignment to
    /// the type of the operation.
    Assign {
        place: Place,
        op: Option<(BinOp, ScalarType)>,
        value: Box<Expr>,
    },
    Step {
        place: Place,
        delta: i64,
        post: bool,
    },
}

#[derive(Debug)]
pub(super) enum Place {
    Local(usize),
    Elem { buffer: usize, index: Box<Expr> },
}

#[derive(Debug)]
pub(super) enum Stmt {
    Expr(Expr),
    Decl {
        slot: usize,
        ty: ScalarType,
        init: Option<Expr>,
    },
    If {
        cond: Expr,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    Block(Vec<Stmt>),
    Break,
    Continue,
    Return,
}

#[derive(Debug)]
pub(super) struct ParamDecl {
    pub(super) name: String,
    pub(super) kind: ParamDeclKind,
}

#[derive(Clone, Copy, Debug)]
pub(super) enum ParamDeclKind {
    Buffer {
        elem: ScalarType,
        readonly: bool,
        buffer: usize,
    },
    Scalar {
        ty: ScalarType,
        slot: usize,
    },
}

#[derive(Debug)]
pub(super) struct Function {
    pub(super) name: String,
    pub(super) params: Vec<ParamDecl>,
    pub(super) body: Vec<Stmt>,
    pub(super) frame_size: usize,
    pub(super) buffers: usize,
}

#[derive(Debug, Default)]
pub(super) struct Module {
    pub(super) kernels: Vec<Function>,
}

/// Integer promotion.
pub(super) fn promote(ty: ScalarType) -> ScalarType {
    if !ty.is_float() && ty.size() < 4 {
        ScalarType::I32
    } else {
        ty
    }
}

/// The usual arithmetic conversions.
pub(super) fn common_type(a: ScalarType, b: ScalarType) -> ScalarType {
    use ScalarType::*;
    if a == F64 || b == F64 {
        return F64;
    }
    if a.is_float() || b.is_float() {
        return F32;
    }
    let (a, b) = (promote(a), promote(b));
    if a == b {
        return a;
    }
    let (wide, narrow) = if a.size() >= b.size() { (a, b) } else { (b, a) };
    if wide.size() == narrow.size() {
        // same rank, different signedness
        wide.to_unsigned()
    } else {
        wide
    }
}

fn convert(expr: Expr, ty: ScalarType) -> Expr {
    if expr.ty == ty {
        return expr;
    }
    let span = expr.span;
    Expr {
        kind: ExprKind::Convert(Box::new(expr)),
        ty,
        span,
    }
}

#[derive(Clone, Copy)]
enum Sym {
    Local {
        slot: usize,
        ty: ScalarType,
        is_const: bool,
    },
    Buffer {
        buffer: usize,
        elem: ScalarType,
        readonly: bool,
    },
}

enum Operand {
    Value(Expr),
    Pointer {
        buffer: usize,
        elem: ScalarType,
        span: Span,
    },
}

struct TypeSpec {
    ty: Option<ScalarType>,
    is_const: bool,
}

type PResult<T> = Result<T, Diagnostic>;

/// Statements and expressions nest at most this deep, like clang's `-fbracket-depth`.
const MAX_NESTING: usize = 256;

const ADDRESS_SPACES: &[&str] = &[
    "__global", "global", "__constant", "constant", "__local", "local", "__private", "private",
];

const TYPE_WORDS: &[&str] = &[
    "const", "volatile", "unsigned", "signed", "void", "bool", "char", "uchar", "short", "ushort",
    "int", "uint", "long", "ulong", "float", "double", "size_t",
];

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    diagnostics: Vec<Diagnostic>,
    scopes: Vec<HashMap<String, Sym>>,
    const_slots: HashSet<usize>,
    readonly_buffers: HashSet<usize>,
    next_slot: usize,
    loop_depth: usize,
    nesting: usize,
    kernel: String,
}

pub(super) fn parse(tokens: Vec<Token>, diagnostics: &mut Vec<Diagnostic>) -> Module {
    let mut parser = Parser {
        tokens,
        pos: 0,
        diagnostics: Vec::new(),
        scopes: Vec::new(),
        const_slots: HashSet::new(),
        readonly_buffers: HashSet::new(),
        next_slot: 0,
        loop_depth: 0,
        nesting: 0,
        kernel: String::new(),
    };
    let module = parser.module();
    diagnostics.append(&mut parser.diagnostics);
    module
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }
    fn peek_at(&self, offset: usize) -> &Tok {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].tok
    }
    fn span(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].span
    }
    fn bump(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }
    fn is_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), Tok::Punct(p) if *p == punct)
    }
    fn is_ident(&self, ident: &str) -> bool {
        matches!(self.peek(), Tok::Ident(i) if i == ident)
    }
    fn eat_punct(&mut self, punct: &str) -> bool {
        let found = self.is_punct(punct);
        if found {
            self.bump();
        }
        found
    }
    fn eat_ident(&mut self, ident: &str) -> bool {
        let found = self.is_ident(ident);
        if found {
            self.bump();
        }
        found
    }
    fn error<T>(&self, span: Span, message: impl Into<String>) -> PResult<T> {
        Err(Diagnostic::new(span, message))
    }
    fn enter(&mut self, span: Span, what: &str) -> PResult<()> {
        if self.nesting >= MAX_NESTING {
            return self.error(
                span,
                format!("{what} nesting level exceeded maximum of {MAX_NESTING}"),
            );
        }
        self.nesting += 1;
        Ok(())
    }
    /// Runs `f` one nesting level deeper.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        let base = self.nesting;
        self.enter(self.span(), "bracket")?;
        let result = f(self);
        self.nesting = base;
        result
    }
    fn expected<T>(&self, what: &str) -> PResult<T> {
        self.error(self.span(), format!("expected {what}, found {}", self.peek()))
    }
    fn expect_punct(&mut self, punct: &str) -> PResult<Span> {
        if self.is_punct(punct) {
            Ok(self.bump().span)
        } else {
            self.expected(&format!("'{punct}'"))
        }
    }
    fn expect_name(&mut self) -> PResult<(String, Span)> {
        match self.peek().clone() {
            Tok::Ident(name) if !TYPE_WORDS.contains(&name.as_str()) => {
                let span = self.bump().span;
                Ok((name, span))
            }
            _ => self.expected("identifier"),
        }
    }
    fn is_kernel_keyword(&self) -> bool {
        self.is_ident("__kernel") || self.is_ident("kernel")
    }
    fn is_type_start(&self) -> bool {
        matches!(self.peek(), Tok::Ident(i) if TYPE_WORDS.contains(&i.as_str()))
    }
    fn is_address_space(&self) -> bool {
        matches!(self.peek(), Tok::Ident(i) if ADDRESS_SPACES.contains(&i.as_str()))
    }

    fn lookup(&self, name: &str) -> Option<Sym> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }
    fn declare(&mut self, name: String, span: Span, sym: Sym) -> PResult<()> {
        if let Some(scope) = self.scopes.last_mut() {
            if scope.contains_key(&name) {
                return Err(Diagnostic::new(span, format!("redefinition of '{name}'")));
            }
            scope.insert(name, sym);
        }
        Ok(())
    }
    fn alloc_slot(&mut self) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    /// Skips to the end of the current statement.
    fn synchronize(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                Tok::Eof => return,
                Tok::Punct(";") if depth == 0 => {
                    self.bump();
                    return;
                }
                Tok::Punct("{") => depth += 1,
                Tok::Punct("}") => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                    if depth == 0 {
                        self.bump();
                        return;
                    }
                }
                _ => (),
            }
            self.bump();
        }
    }
    /// Skips a top level item.
    fn skip_item(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                Tok::Eof => return,
                Tok::Punct(";") if depth == 0 => {
                    self.bump();
                    return;
                }
                Tok::Punct("{") => depth += 1,
                Tok::Punct("}") => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        self.bump();
                        return;
                    }
                }
                Tok::Ident(_) if depth == 0 && self.is_kernel_keyword() => return,
                _ => (),
            }
            self.bump();
        }
    }

    fn module(&mut self) -> Module {
        let mut module = Module::default();
        while *self.peek() != Tok::Eof {
            if self.is_kernel_keyword() {
                let span = self.span();
                match self.kernel_function() {
                    Ok(function) => {
                        if module.kernels.iter().any(|k| k.name == function.name) {
                            self.diagnostics.push(Diagnostic::new(
                                span,
                                format!("redefinition of '{}'", function.name),
                            ));
                        } else {
                            module.kernels.push(function);
                        }
                    }
                    Err(diagnostic) => {
                        self.diagnostics.push(diagnostic);
                        self.skip_item();
                    }
                }
            } else if self.is_type_start() {
                self.diagnostics.push(Diagnostic::new(
                    self.span(),
                    "only '__kernel' functions are supported",
                ));
                self.bump();
                self.skip_item();
            } else {
                let diagnostic = Diagnostic::new(
                    self.span(),
                    format!("expected '__kernel', found {}", self.peek()),
                );
                self.diagnostics.push(diagnostic);
                self.bump();
                self.skip_item();
            }
        }
        module
    }

    fn skip_attributes(&mut self) -> PResult<()> {
        while self.eat_ident("__attribute__") {
            self.expect_punct("(")?;
            let mut depth = 1usize;
            while depth > 0 {
                match self.bump().tok {
                    Tok::Punct("(") => depth += 1,
                    Tok::Punct(")") => depth -= 1,
                    Tok::Eof => return self.expected("')'"),
                    _ => (),
                }
            }
        }
        Ok(())
    }

    fn kernel_function(&mut self) -> PResult<Function> {
        self.bump();
        self.skip_attributes()?;
        let ret_span = self.span();
        let ret = self.type_spec()?;
        if ret.ty.is_some() {
            return self.error(ret_span, "kernel functions must have void return type");
        }
        self.skip_attributes()?;
        let (name, _) = self.expect_name()?;
        self.kernel = name.clone();
        self.scopes = vec![HashMap::new()];
        self.const_slots.clear();
        self.readonly_buffers.clear();
        self.next_slot = 0;
        self.loop_depth = 0;
        self.nesting = 0;
        let mut params = Vec::new();
        let mut buffers = 0;
        self.expect_punct("(")?;
        if !(self.is_ident("void") && matches!(self.peek_at(1), Tok::Punct(")"))) {
            while !self.is_punct(")") {
                if !params.is_empty() {
                    self.expect_punct(",")?;
                }
                params.push(self.param(&mut buffers)?);
            }
        } else {
            self.bump();
        }
        self.expect_punct(")")?;
        self.skip_attributes()?;
        self.expect_punct("{")?;
        let body = self.block_body();
        self.scopes.clear();
        Ok(Function {
            name,
            params,
            body,
            frame_size: self.next_slot,
            buffers,
        })
    }

    fn param(&mut self, buffers: &mut usize) -> PResult<ParamDecl> {
        let mut address_space = None;
        let mut is_const = false;
        loop {
            if self.is_address_space() {
                let span = self.span();
                if let Tok::Ident(space) = self.bump().tok {
                    address_space = Some((space.trim_start_matches("__").to_string(), span));
                }
            } else if self.eat_ident("const") {
                is_const = true;
            } else {
                break;
            }
        }
        let type_span = self.span();
        let spec = self.type_spec()?;
        is_const |= spec.is_const;
        let ty = match spec.ty {
            Some(ty) => ty,
            None => return self.error(type_span, "parameters can not have void type"),
        };
        let pointer = self.eat_punct("*");
        while self.eat_ident("const")
            || self.eat_ident("restrict")
            || self.eat_ident("__restrict")
            || self.eat_ident("__restrict__")
        {}
        let (name, name_span) = self.expect_name()?;
        if pointer {
            let readonly = match address_space.as_ref().map(|(space, _)| space.as_str()) {
                Some("global") => is_const,
                Some("constant") => true,
                Some("local") => {
                    return self.error(type_span, "'__local' kernel arguments are not supported")
                }
                _ => return self.error(
                    name_span,
                    "pointer arguments to kernel functions must reside in '__global', '__constant' or '__local' address space",
                ),
            };
            let buffer = *buffers;
            *buffers += 1;
            if readonly {
                self.readonly_buffers.insert(buffer);
            }
            self.declare(
                name.clone(),
                name_span,
                Sym::Buffer {
                    buffer,
                    elem: ty,
                    readonly,
                },
            )?;
            Ok(ParamDecl {
                name,
                kind: ParamDeclKind::Buffer {
                    elem: ty,
                    readonly,
                    buffer,
                },
            })
        } else {
            if let Some((_, span)) = address_space {
                return self.error(span, "parameter may not be qualified with an address space");
            }
            let slot = self.alloc_slot();
            if is_const {
                self.const_slots.insert(slot);
            }
            self.declare(name.clone(), name_span, Sym::Local { slot, ty, is_const })?;
            Ok(ParamDecl {
                name,
                kind: ParamDeclKind::Scalar { ty, slot },
            })
        }
    }

    fn type_spec(&mut self) -> PResult<TypeSpec> {
        use ScalarType::*;
        let mut is_const = false;
        loop {
            if self.eat_ident("const") {
                is_const = true;
            } else if !self.eat_ident("volatile") {
                break;
            }
        }
        let sign_span = self.span();
        let sign = if self.eat_ident("unsigned") {
            Some(true)
        } else if self.eat_ident("signed") {
            Some(false)
        } else {
            None
        };
        let base_span = self.span();
        let base = match self.peek() {
            Tok::Ident(ident) => match ident.as_str() {
                "void" => Some(None),
                "char" => Some(Some(I8)),
                "uchar" => Some(Some(U8)),
                "short" => Some(Some(I16)),
                "ushort" => Some(Some(U16)),
                "int" => Some(Some(I32)),
                "uint" => Some(Some(U32)),
                "long" => Some(Some(I64)),
                "ulong" => Some(Some(U64)),
                "float" => Some(Some(F32)),
                "double" => Some(Some(F64)),
                "size_t" => Some(Some(U64)),
                "bool" => return self.error(base_span, "'bool' is not supported"),
                _ => None,
            },
            _ => None,
        };
        if base.is_some() {
            self.bump();
        }
        let ty = match (sign, base) {
            (None, Some(ty)) => ty,
            (None, None) => return self.expected("a type"),
            (Some(unsigned), None) => Some(if unsigned { U32 } else { I32 }),
            (Some(unsigned), Some(Some(ty)))
                if !ty.is_float() && matches!(ty, I8 | I16 | I32 | I64) =>
            {
                Some(if unsigned { ty.to_unsigned() } else { ty })
            }
            (Some(_), Some(_)) => {
                return self.error(sign_span, "'unsigned' or 'signed' can not be applied here")
            }
        };
        // "unsigned int" and "long int"
        if ty.map_or(false, |ty| !ty.is_float()) && matches!(base, Some(Some(I16 | I64))) {
            self.eat_ident("int");
        }
        while self.eat_ident("const") {
            is_const = true;
        }
        Ok(TypeSpec { ty, is_const })
    }

    fn block_body(&mut self) -> Vec<Stmt> {
        self.scopes.push(HashMap::new());
        let mut stmts = Vec::new();
        while !self.is_punct("}") {
            if *self.peek() == Tok::Eof {
                self.diagnostics
                    .push(Diagnostic::new(self.span(), "expected '}' at end of input"));
                break;
            }
            match self.stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(diagnostic) => {
                    self.diagnostics.push(diagnostic);
                    self.synchronize();
                }
            }
        }
        self.eat_punct("}");
        self.scopes.pop();
        stmts
    }

    fn stmt(&mut self) -> PResult<Stmt> {
        self.nested(Self::statement)
    }

    fn statement(&mut self) -> PResult<Stmt> {
        let span = self.span();
        if self.eat_punct("{") {
            return Ok(Stmt::Block(self.block_body()));
        }
        if self.eat_punct(";") {
            return Ok(Stmt::Block(Vec::new()));
        }
        if self.eat_ident("if") {
            self.expect_punct("(")?;
            let cond = self.scalar_expr()?;
            self.expect_punct(")")?;
            let then = Box::new(self.sub_stmt()?);
            let otherwise = if self.eat_ident("else") {
                Some(Box::new(self.sub_stmt()?))
            } else {
                None
            };
            return Ok(Stmt::If {
                cond,
                then,
                otherwise,
            });
        }
        if self.eat_ident("while") {
            self.expect_punct("(")?;
            let cond = self.scalar_expr()?;
            self.expect_punct(")")?;
            let body = Box::new(self.loop_body()?);
            return Ok(Stmt::While { cond, body });
        }
        if self.eat_ident("do") {
            let body = Box::new(self.loop_body()?);
            if !self.eat_ident("while") {
                return self.expected("'while' in do/while loop");
            }
            self.expect_punct("(")?;
            let cond = self.scalar_expr()?;
            self.expect_punct(")")?;
            self.expect_punct(";")?;
            return Ok(Stmt::DoWhile { body, cond });
        }
        if self.eat_ident("for") {
            self.scopes.push(HashMap::new());
            let result = self.for_stmt();
            self.scopes.pop();
            return result;
        }
        if self.eat_ident("return") {
            if !self.is_punct(";") {
                return self.error(
                    span,
                    format!("void function '{}' should not return a value", self.kernel),
                );
            }
            self.expect_punct(";")?;
            return Ok(Stmt::Return);
        }
        if self.is_ident("break") || self.is_ident("continue") {
            let is_break = self.is_ident("break");
            self.bump();
            if self.loop_depth == 0 {
                let keyword = if is_break { "break" } else { "continue" };
                return self.error(span, format!("'{keyword}' statement not in loop statement"));
            }
            self.expect_punct(";")?;
            return Ok(if is_break { Stmt::Break } else { Stmt::Continue });
        }
        if self.is_address_space() {
            return self.error(span, "local pointer variables are not supported");
        }
        if self.is_type_start() {
            let stmt = self.declaration()?;
            self.expect_punct(";")?;
            return Ok(stmt);
        }
        let expr = self.expr()?;
        self.expect_punct(";")?;
        Ok(Stmt::Expr(expr))
    }

    /// A statement in its own scope, ie the branch of an if.
    fn sub_stmt(&mut self) -> PResult<Stmt> {
        self.scopes.push(HashMap::new());
        let stmt = self.stmt();
        self.scopes.pop();
        stmt
    }

    fn loop_body(&mut self) -> PResult<Stmt> {
        self.loop_depth += 1;
        let body = self.sub_stmt();
        self.loop_depth -= 1;
        body
    }

    fn for_stmt(&mut self) -> PResult<Stmt> {
        self.expect_punct("(")?;
        let init = if self.eat_punct(";") {
            None
        } else {
            let init = if self.is_type_start() {
                self.declaration()?
            } else {
                Stmt::Expr(self.expr()?)
            };
            self.expect_punct(";")?;
            Some(Box::new(init))
        };
        let cond = if self.is_punct(";") {
            None
        } else {
            Some(self.scalar_expr()?)
        };
        self.expect_punct(";")?;
        let step = if self.is_punct(")") {
            None
        } else {
            Some(self.expr()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.loop_body()?);
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
        })
    }

    fn declaration(&mut self) -> PResult<Stmt> {
        let type_span = self.span();
        let spec = self.type_spec()?;
        let ty = match spec.ty {
            Some(ty) => ty,
            None => return self.error(type_span, "variable has incomplete type 'void'"),
        };
        let mut decls = Vec::new();
        loop {
            if self.is_punct("*") {
                return self.error(self.span(), "local pointer variables are not supported");
            }
            let (name, span) = self.expect_name()?;
            if self.is_punct("[") {
                return self.error(self.span(), "local arrays are not supported");
            }
            let init = if self.eat_punct("=") {
                Some(convert(self.assignment()?, ty))
            } else {
                None
            };
            let slot = self.alloc_slot();
            if spec.is_const {
                self.const_slots.insert(slot);
            }
            self.declare(
                name,
                span,
                Sym::Local {
                    slot,
                    ty,
                    is_const: spec.is_const,
                },
            )?;
            decls.push(Stmt::Decl { slot, ty, init });
            if !self.eat_punct(",") {
                break;
            }
        }
        match decls.pop() {
            Some(decl) if decls.is_empty() => Ok(decl),
            Some(decl) => {
                decls.push(decl);
                Ok(Stmt::Block(decls))
            }
            None => Ok(Stmt::Block(decls)),
        }
    }

    fn expr(&mut self) -> PResult<Expr> {
        self.nested(Self::assignment)
    }

    fn scalar_expr(&mut self) -> PResult<Expr> {
        self.expr()
    }

    fn into_place(&self, expr: Expr) -> PResult<(Place, ScalarType)> {
        let ty = expr.ty;
        match expr.kind {
            ExprKind::Local(slot) => {
                if self.const_slots.contains(&slot) {
                    return self.error(
                        expr.span,
                        format!(
                            "cannot assign to variable with const-qualified type 'const {}'",
                            ty.cl_name()
                        ),
                    );
                }
                Ok((Place::Local(slot), ty))
            }
            ExprKind::Load { buffer, index } => {
                if self.readonly_buffers.contains(&buffer) {
                    return self.error(expr.span, "read-only variable is not assignable");
                }
                Ok((Place::Elem { buffer, index }, ty))
            }
            _ => self.error(expr.span, "expression is not assignable"),
        }
    }

    fn assignment(&mut self) -> PResult<Expr> {
        let lhs = self.conditional()?;
        let punct = match self.peek() {
            Tok::Punct(p) if *p == "=" || BinOp::from_compound(p).is_some() => *p,
            _ => return Ok(lhs),
        };
        let span = self.bump().span;
        let (place, ty) = self.into_place(lhs)?;
        let rhs = self.nested(Self::assignment)?;
        let (op, value) = match BinOp::from_compound(punct) {
            None => (None, convert(rhs, ty)),
            Some(op) => {
                let op_ty = if op.is_shift() {
                    promote(ty)
                } else {
                    common_type(ty, rhs.ty)
                };
                self.check_operands(op, ty, rhs.ty, span)?;
                (Some((op, op_ty)), convert(rhs, op_ty))
            }
        };
        Ok(Expr {
            kind: ExprKind::Assign {
                place,
                op,
                value: Box::new(value),
            },
            ty,
            span,
        })
    }

    fn conditional(&mut self) -> PResult<Expr> {
        let cond = self.binary(1)?;
        if !self.is_punct("?") {
            return Ok(cond);
        }
        let span = self.bump().span;
        let a = self.expr()?;
        self.expect_punct(":")?;
        let b = self.nested(Self::conditional)?;
        let ty = common_type(a.ty, b.ty);
        Ok(Expr {
            kind: ExprKind::Ternary(Box::new(cond), Box::new(convert(a, ty)), Box::new(convert(b, ty))),
            ty,
            span,
        })
    }

    fn check_operands(&self, op: BinOp, a: ScalarType, b: ScalarType, span: Span) -> PResult<()> {
        if op.integer_only() && (a.is_float() || b.is_float()) {
            return self.error(
                span,
                format!(
                    "invalid operands to binary expression ('{}' and '{}')",
                    a.cl_name(),
                    b.cl_name()
                ),
            );
        }
        Ok(())
    }

    fn binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let base = self.nesting;
        let result = self.binary_chain(min_prec);
        self.nesting = base;
        result
    }

    /// Each operator of a chain nests the expression one level deeper.
    fn binary_chain(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let (op, prec) = match self.peek() {
                Tok::Punct(p) => match BinTok::from_punct(p) {
                    Some((op, prec)) if prec >= min_prec => (op, prec),
                    _ => break,
                },
                _ => break,
            };
            let span = self.bump().span;
            self.enter(span, "expression")?;
            let rhs = self.binary(prec + 1)?;
            lhs = match op {
                BinTok::And | BinTok::Or => Expr {
                    kind: ExprKind::Logical {
                        and: op == BinTok::And,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    ty: ScalarType::I32,
                    span,
                },
                BinTok::Op(op) => {
                    self.check_operands(op, lhs.ty, rhs.ty, span)?;
                    let (operand_ty, ty) = if op.is_shift() {
                        (promote(lhs.ty), promote(lhs.ty))
                    } else if op.is_comparison() {
                        (common_type(lhs.ty, rhs.ty), ScalarType::I32)
                    } else {
                        let ty = common_type(lhs.ty, rhs.ty);
                        (ty, ty)
                    };
                    Expr {
                        kind: ExprKind::Binary(
                            op,
                            Box::new(convert(lhs, operand_ty)),
                            Box::new(convert(rhs, operand_ty)),
                        ),
                        ty,
                        span,
                    }
                }
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> PResult<Expr> {
        let span = self.span();
        let op = match self.peek() {
            Tok::Punct("-") => Some(UnOp::Neg),
            Tok::Punct("!") => Some(UnOp::Not),
            Tok::Punct("~") => Some(UnOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.nested(Self::unary)?;
            if op == UnOp::BitNot && operand.ty.is_float() {
                return self.error(
                    span,
                    format!(
                        "invalid argument type '{}' to unary expression",
                        operand.ty.cl_name()
                    ),
                );
            }
            let ty = if op == UnOp::Not {
                ScalarType::I32
            } else {
                promote(operand.ty)
            };
            let operand = if op == UnOp::Not {
                operand
            } else {
                convert(operand, ty)
            };
            return Ok(Expr {
                kind: ExprKind::Unary(op, Box::new(operand)),
                ty,
                span,
            });
        }
        if self.eat_punct("+") {
            let operand = self.nested(Self::unary)?;
            let ty = promote(operand.ty);
            return Ok(convert(operand, ty));
        }
        if self.is_punct("++") || self.is_punct("--") {
            let delta = if self.is_punct("++") { 1 } else { -1 };
            self.bump();
            let operand = self.nested(Self::unary)?;
            let (place, ty) = self.into_place(operand)?;
            return Ok(Expr {
                kind: ExprKind::Step {
                    place,
                    delta,
                    post: false,
                },
                ty,
                span,
            });
        }
        if self.is_punct("(")
            && matches!(self.peek_at(1), Tok::Ident(i) if TYPE_WORDS.contains(&i.as_str()))
        {
            self.bump();
            let type_span = self.span();
            let spec = self.type_spec()?;
            if self.is_punct("*") {
                return self.error(self.span(), "pointer casts are not supported");
            }
            self.expect_punct(")")?;
            let ty = match spec.ty {
                Some(ty) => ty,
                None => return self.error(type_span, "casts to 'void' are not supported"),
            };
            let operand = self.nested(Self::unary)?;
            return Ok(Expr {
                kind: ExprKind::Convert(Box::new(operand)),
                ty,
                span,
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut operand = self.primary()?;
        loop {
            if self.is_punct("[") {
                let span = self.bump().span;
                let index = self.expr()?;
                self.expect_punct("]")?;
                let (buffer, elem) = match operand {
                    Operand::Pointer { buffer, elem, .. } => (buffer, elem),
                    Operand::Value(_) => {
                        return self.error(span, "subscripted value is not a pointer")
                    }
                };
                if index.ty.is_float() {
                    return self.error(index.span, "array subscript is not an integer");
                }
                operand = Operand::Value(Expr {
                    kind: ExprKind::Load {
                        buffer,
                        index: Box::new(convert(index, ScalarType::I64)),
                    },
                    ty: elem,
                    span,
                });
            } else if self.is_punct("++") || self.is_punct("--") {
                let delta = if self.is_punct("++") { 1 } else { -1 };
                let span = self.bump().span;
                let expr = self.operand_value(operand)?;
                let (place, ty) = self.into_place(expr)?;
                operand = Operand::Value(Expr {
                    kind: ExprKind::Step {
                        place,
                        delta,
                        post: true,
                    },
                    ty,
                    span,
                });
            } else {
                break;
            }
        }
        self.operand_value(operand)
    }

    fn operand_value(&self, operand: Operand) -> PResult<Expr> {
        match operand {
            Operand::Value(expr) => Ok(expr),
            Operand::Pointer { span, .. } => {
                self.error(span, "pointer values are only supported as a subscript base")
            }
        }
    }

    fn primary(&mut self) -> PResult<Operand> {
        let token = match self.peek() {
            Tok::Int { .. } | Tok::Float { .. } | Tok::Ident(_) | Tok::Punct("(") => self.bump(),
            tok => return self.error(self.span(), format!("expected expression, found {tok}")),
        };
        let span = token.span;
        let expr = match token.tok {
            Tok::Int {
                value,
                unsigned,
                long,
            } => {
                use ScalarType::*;
                let ty = match (unsigned, long) {
                    (false, false) if value <= i32::MAX as u64 => I32,
                    (true, false) if value <= u32::MAX as u64 => U32,
                    (false, _) if value <= i64::MAX as u64 => I64,
                    _ => U64,
                };
                Expr {
                    kind: ExprKind::Const(Value::I(value as i64)),
                    ty,
                    span,
                }
            }
            Tok::Float { value, single } => Expr {
                kind: ExprKind::Const(Value::F(value)),
                ty: if single {
                    ScalarType::F32
                } else {
                    ScalarType::F64
                },
                span,
            },
            Tok::Punct("(") => {
                let expr = self.expr()?;
                self.expect_punct(")")?;
                expr
            }
            Tok::Ident(name) if self.is_punct("(") => return self.call(name, span).map(Operand::Value),
            Tok::Ident(name) => match self.lookup(&name) {
                Some(Sym::Local { slot, ty, .. }) => Expr {
                    kind: ExprKind::Local(slot),
                    ty,
                    span,
                },
                Some(Sym::Buffer { buffer, elem, .. }) => {
                    return Ok(Operand::Pointer { buffer, elem, span })
                }
                None => {
                    return self.error(span, format!("use of undeclared identifier '{name}'"))
                }
            },
            tok => return self.error(span, format!("expected expression, found {tok}")),
        };
        Ok(Operand::Value(expr))
    }

    fn call(&mut self, name: String, span: Span) -> PResult<Expr> {
        let builtin = match BUILTINS.get(name.as_str()) {
            Some(builtin) => *builtin,
            None => {
                return self.error(
                    span,
                    format!("implicit declaration of function '{name}' is invalid in OpenCL"),
                )
            }
        };
        self.expect_punct("(")?;
        let mut args = Vec::new();
        while !self.is_punct(")") {
            if !args.is_empty() {
                self.expect_punct(",")?;
            }
            args.push(self.nested(Self::assignment)?);
        }
        self.expect_punct(")")?;
        let arity = match builtin {
            Builtin::WorkItem(_) => 1,
            Builtin::WorkDim => 0,
            Builtin::Math(MathFn::Abs) => 1,
            Builtin::Math(_) => 2,
        };
        if args.len() != arity {
            return self.error(
                span,
                format!(
                    "too {} arguments to function call, expected {arity}, have {}",
                    if args.len() < arity { "few" } else { "many" },
                    args.len()
                ),
            );
        }
        let expr = match builtin {
            Builtin::WorkItem(f) => {
                let dim = args.remove(0);
                if dim.ty.is_float() {
                    return self.error(dim.span, "work-item dimension must be an integer");
                }
                Expr {
                    kind: ExprKind::WorkItem(f, Box::new(convert(dim, ScalarType::U32))),
                    ty: ScalarType::U64,
                    span,
                }
            }
            Builtin::WorkDim => Expr {
                kind: ExprKind::WorkDim,
                ty: ScalarType::U32,
                span,
            },
            Builtin::Math(f) => {
                let ty = args
                    .iter()
                    .fold(promote(args[0].ty), |ty, arg| common_type(ty, arg.ty));
                let args = args.into_iter().map(|arg| convert(arg, ty)).collect();
                Expr {
                    kind: ExprKind::Math(f, args),
                    ty,
                    span,
                }
            }
        };
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse_source(source: &str) -> (Module, Vec<Diagnostic>) {
        let mut diagnostics = Vec::new();
        let tokens = tokenize(source, &mut diagnostics);
        let module = parse(tokens, &mut diagnostics);
        (module, diagnostics)
    }

    #[test]
    fn usual_arithmetic_conversions() {
        use ScalarType::*;
        assert_eq!(common_type(I32, U32), U32);
        assert_eq!(common_type(U8, I16), I32);
        assert_eq!(common_type(U32, I64), I64);
        assert_eq!(common_type(I64, U64), U64);
        assert_eq!(common_type(I32, F32), F32);
        assert_eq!(common_type(F32, F64), F64);
    }

    #[test]
    fn kernel_signature() {
        let (module, diagnostics) = parse_source(
            "__kernel void scale(__global const float* x, global float *y, const unsigned int n, float alpha) { }",
        );
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let kernel = &module.kernels[0];
        assert_eq!(kernel.name, "scale");
        assert_eq!(kernel.buffers, 2);
        assert!(matches!(
            kernel.params[0].kind,
            ParamDeclKind::Buffer {
                elem: ScalarType::F32,
                readonly: true,
                buffer: 0
            }
        ));
        assert!(matches!(
            kernel.params[1].kind,
            ParamDeclKind::Buffer { readonly: false, .. }
        ));
        assert!(matches!(
            kernel.params[2].kind,
            ParamDeclKind::Scalar {
                ty: ScalarType::U32,
                ..
            }
        ));
    }

    #[test]
    fn errors_recover_per_statement() {
        let (_, diagnostics) = parse_source(
            "__kernel void f(__global int* x) {\n  int a = ;\n  x[0] = b;\n  x[1] = 1;\n}",
        );
        assert_eq!(diagnostics.len(), 2, "{diagnostics:?}");
        assert_eq!(diagnostics[0].span.line, 2);
        assert_eq!(
            diagnostics[1].message,
            "use of undeclared identifier 'b'"
        );
    }

    #[test]
    fn nesting_is_limited() {
        let nested = |depth: usize| {
            format!(
                "__kernel void f(__global int* x) {{ x[0] = {}1{}; }}",
                "(".repeat(depth),
                ")".repeat(depth),
            )
        };
        let (module, diagnostics) = parse_source(&nested(50));
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        assert_eq!(module.kernels[0].body.len(), 1);
        let negated = format!(
            "__kernel void f(__global int* x) {{ x[0] = {}1; }}",
            "- ".repeat(300)
        );
        let (_, diagnostics) = parse_source(&negated);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics[0].message,
            "bracket nesting level exceeded maximum of 256"
        );
        let chain = vec!["1"; 1000].join(" + ");
        let (_, diagnostics) =
            parse_source(&format!("__kernel void f(__global int* x) {{ x[0] = {chain}; }}"));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics[0].message,
            "expression nesting level exceeded maximum of 256"
        );
    }

    #[test]
    fn const_buffers_are_not_assignable() {
        let (_, diagnostics) =
            parse_source("__kernel void f(__global const int* x) { x[0] = 1; }");
        assert_eq!(diagnostics[0].message, "read-only variable is not assignable");
    }

    #[test]
    fn pointer_params_need_an_address_space() {
        let (_, diagnostics) = parse_source("__kernel void f(int* x) { }");
        assert!(diagnostics[0].message.starts_with("pointer arguments"));
    }

    #[test]
    fn non_kernel_functions_are_rejected() {
        let (module, diagnostics) =
            parse_source("int helper(int x) { return x; }\n__kernel void f() { }");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(module.kernels.len(), 1);
    }

    #[test]
    fn break_outside_loop() {
        let (_, diagnostics) = parse_source("kernel void f() { break; }");
        assert_eq!(
            diagnostics[0].message,
            "'break' statement not in loop statement"
        );
    }
}
