use serde::{Deserialize, Serialize};

pub mod source_map;
pub use source_map::SourceMap;

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Wraps a node with its source span. Transparent to serde (serializes as
/// the inner node only).
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Spanned { node, span }
    }

    pub fn unknown(node: T) -> Self {
        Spanned {
            node,
            span: Span::UNKNOWN,
        }
    }
}

impl<T> std::ops::Deref for Spanned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.node
    }
}

impl<T> std::ops::DerefMut for Spanned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.node
    }
}

impl<T: Serialize> Serialize for Spanned<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.node.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Spanned<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(|node| Spanned {
            node,
            span: Span::UNKNOWN,
        })
    }
}

pub type Expr = Spanned<ExprKind>;
pub type Stmt = Spanned<StmtKind>;

// ---- Core AST types ----

/// How scope resolution classified an identifier. Parsers leave
/// `Unknown`; the semantic pass rewrites it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VarScope {
    #[default]
    Unknown,
    Global,
    Local,
    /// Captured from an enclosing function (register upvalue mode).
    Upvalue,
    /// Captured block-scoped variable living in a context array.
    UpvalueNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclKind {
    Var,
    Let,
    Const,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDeclarator {
    pub name: String,
    pub init: Option<Expr>,
}

/// A braces-delimited scope. `id` and `context_slots` are zero/empty out
/// of the parser; semantic analysis fills them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub id: u32,
    pub body: Vec<Stmt>,
    /// Names captured out of this block, in context-slot order. Slot 0 is
    /// reserved for the parent context link, so slots here start at 1.
    #[serde(default)]
    pub context_slots: Vec<String>,
}

impl Block {
    pub fn new(body: Vec<Stmt>) -> Block {
        Block {
            id: 0,
            body,
            context_slots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionLit {
    /// Unique per chunk, assigned by the semantic pass (top level is 0).
    #[serde(default)]
    pub id: u32,
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: Block,
    /// True when the body reads something from an enclosing function.
    #[serde(default)]
    pub captures: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    /// `None` is the `default` arm.
    pub test: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    pub param: Option<String>,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    Expr(Expr),
    VarDecl {
        kind: DeclKind,
        decls: Vec<VarDeclarator>,
    },
    FunctionDecl {
        name: String,
        func: FunctionLit,
    },
    Block(Block),
    If {
        cond: Expr,
        then: Box<Stmt>,
        alt: Option<Box<Stmt>>,
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
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    Switch {
        scrutinee: Expr,
        cases: Vec<SwitchCase>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Throw(Expr),
    Try {
        body: Block,
        catch: Option<CatchClause>,
        finally: Option<Block>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    BitNot,
    Typeof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    Eq,
    NotEq,
    AbsEq,
    AbsNotEq,
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOp {
    Inc,
    Dec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    Regex {
        pattern: String,
        flags: String,
    },
    Ident {
        name: String,
        #[serde(default)]
        scope: VarScope,
    },
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Function(FunctionLit),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Update {
        op: UpdateOp,
        prefix: bool,
        target: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `op` is the compound operator (`+=` carries `Add`); plain `=` is
    /// `None`.
    Assign {
        op: Option<BinaryOp>,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        alt: Box<Expr>,
    },
    Member {
        object: Box<Expr>,
        property: Box<Expr>,
        computed: bool,
        optional: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        optional: bool,
    },
}

impl ExprKind {
    pub fn ident(name: impl Into<String>) -> ExprKind {
        ExprKind::Ident {
            name: name.into(),
            scope: VarScope::Unknown,
        }
    }

    /// True when the expression contains an optional-chain step, i.e. it
    /// belongs to a chain that needs a shared undefined landing site.
    pub fn is_optional_chain(&self) -> bool {
        match self {
            ExprKind::Member {
                object, optional, ..
            } => *optional || object.is_optional_chain(),
            ExprKind::Call {
                callee, optional, ..
            } => *optional || callee.is_optional_chain(),
            _ => false,
        }
    }
}

/// A parsed compilation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub body: Vec<Stmt>,
    #[serde(skip)]
    pub source_name: String,
}
