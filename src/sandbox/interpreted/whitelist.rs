//! Node whitelist of the interpreted backend.
//!
//! The whole tree is checked before anything runs, so a rejected construct
//! anywhere in a submission leaves the namespace untouched.

use rustpython_parser::ast::{self, Ranged};

use crate::sandbox::syntax::{child_blocks, expr_children, stmt_exprs, Prepared};

/// Statement kinds the tree walker evaluates.
pub const ALLOWED_STATEMENTS: &[&str] = &[
    "Expr",
    "Assign",
    "AugAssign",
    "AnnAssign",
    "Pass",
    "Break",
    "Continue",
    "Return",
    "Delete",
    "If",
    "While",
    "For",
    "FunctionDef",
    "ClassDef",
    "Import",
    "ImportFrom",
    "Try",
    "Raise",
    "Assert",
];

/// Expression kinds the tree walker evaluates.
pub const ALLOWED_EXPRESSIONS: &[&str] = &[
    "Constant",
    "Name",
    "JoinedStr",
    "FormattedValue",
    "List",
    "Tuple",
    "Set",
    "Dict",
    "Attribute",
    "Subscript",
    "Slice",
    "Call",
    "BinOp",
    "UnaryOp",
    "BoolOp",
    "Compare",
    "IfExp",
    "NamedExpr",
    "Lambda",
    "ListComp",
    "SetComp",
    "DictComp",
    "GeneratorExp",
    "Starred",
];

/// A construct outside the whitelist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub message: String,
    pub line: usize,
}

pub fn statement_name(stmt: &ast::Stmt) -> &'static str {
    use ast::Stmt::*;
    match stmt {
        FunctionDef(_) => "FunctionDef",
        AsyncFunctionDef(_) => "AsyncFunctionDef",
        ClassDef(_) => "ClassDef",
        Return(_) => "Return",
        Delete(_) => "Delete",
        Assign(_) => "Assign",
        AugAssign(_) => "AugAssign",
        AnnAssign(_) => "AnnAssign",
        For(_) => "For",
        AsyncFor(_) => "AsyncFor",
        While(_) => "While",
        If(_) => "If",
        With(_) => "With",
        AsyncWith(_) => "AsyncWith",
        Match(_) => "Match",
        Raise(_) => "Raise",
        Try(_) => "Try",
        TryStar(_) => "TryStar",
        Assert(_) => "Assert",
        Import(_) => "Import",
        ImportFrom(_) => "ImportFrom",
        Global(_) => "Global",
        Nonlocal(_) => "Nonlocal",
        Expr(_) => "Expr",
        Pass(_) => "Pass",
        Break(_) => "Break",
        Continue(_) => "Continue",
        #[allow(unreachable_patterns)]
        _ => "Statement",
    }
}

pub fn expression_name(expr: &ast::Expr) -> &'static str {
    use ast::Expr::*;
    match expr {
        BoolOp(_) => "BoolOp",
        NamedExpr(_) => "NamedExpr",
        BinOp(_) => "BinOp",
        UnaryOp(_) => "UnaryOp",
        Lambda(_) => "Lambda",
        IfExp(_) => "IfExp",
        Dict(_) => "Dict",
        Set(_) => "Set",
        ListComp(_) => "ListComp",
        SetComp(_) => "SetComp",
        DictComp(_) => "DictComp",
        GeneratorExp(_) => "GeneratorExp",
        Await(_) => "Await",
        Yield(_) => "Yield",
        YieldFrom(_) => "YieldFrom",
        Compare(_) => "Compare",
        Call(_) => "Call",
        FormattedValue(_) => "FormattedValue",
        JoinedStr(_) => "JoinedStr",
        Constant(_) => "Constant",
        Attribute(_) => "Attribute",
        Subscript(_) => "Subscript",
        Starred(_) => "Starred",
        Name(_) => "Name",
        List(_) => "List",
        Tuple(_) => "Tuple",
        Slice(_) => "Slice",
        #[allow(unreachable_patterns)]
        _ => "Expression",
    }
}

fn is_async_comprehension(expr: &ast::Expr) -> bool {
    let generators = match expr {
        ast::Expr::ListComp(ast::ExprListComp { generators, .. })
        | ast::Expr::SetComp(ast::ExprSetComp { generators, .. })
        | ast::Expr::DictComp(ast::ExprDictComp { generators, .. })
        | ast::Expr::GeneratorExp(ast::ExprGeneratorExp { generators, .. }) => generators,
        _ => return false,
    };
    generators.iter().any(|g| g.is_async)
}

/// Returns the first violation in source order.
pub fn validate(prepared: &Prepared) -> Result<(), Violation> {
    Validator { prepared }.block(&prepared.suite)
}

struct Validator<'a> {
    prepared: &'a Prepared,
}

impl Validator<'_> {
    fn reject(&self, message: String, node: &impl Ranged) -> Result<(), Violation> {
        Err(Violation {
            message,
            line: self.prepared.line_of(node),
        })
    }

    fn block(&self, stmts: &[ast::Stmt]) -> Result<(), Violation> {
        stmts.iter().try_for_each(|stmt| self.stmt(stmt))
    }

    fn stmt(&self, stmt: &ast::Stmt) -> Result<(), Violation> {
        let name = statement_name(stmt);
        if !ALLOWED_STATEMENTS.contains(&name) {
            return self.reject(format!("{name} is not supported."), stmt);
        }
        let decorators = match stmt {
            ast::Stmt::FunctionDef(ast::StmtFunctionDef { decorator_list, .. })
            | ast::Stmt::ClassDef(ast::StmtClassDef { decorator_list, .. }) => decorator_list.as_slice(),
            _ => &[],
        };
        if let Some(first) = decorators.first() {
            return self.reject("Decorators are not supported.".to_string(), first);
        }
        stmt_exprs(stmt).into_iter().try_for_each(|e| self.expr(e))?;
        child_blocks(stmt).into_iter().try_for_each(|b| self.block(b))
    }

    fn expr(&self, expr: &ast::Expr) -> Result<(), Violation> {
        let name = expression_name(expr);
        if !ALLOWED_EXPRESSIONS.contains(&name) {
            return self.reject(format!("{name} is not supported."), expr);
        }
        if is_async_comprehension(expr) {
            return self.reject("Async comprehensions are not supported.".to_string(), expr);
        }
        expr_children(expr).into_iter().try_for_each(|e| self.expr(e))
    }
}
