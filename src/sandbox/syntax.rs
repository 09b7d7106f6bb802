//! Source pre-pass shared by both backends.
//!
//! A submission is lexed for bracket nesting, parsed, measured for tree
//! depth and checked against the import policy before any of it runs. A
//! submission refused here leaves the namespace exactly as it was.

use rustpython_parser::ast::{self, Ranged};
use rustpython_parser::{lexer, Mode, Parse, StringKind, Tok};
use tracing::debug;

use crate::sandbox::executor::RunFailure;
use crate::sandbox::policy::{ImportClass, ImportPolicy};
use crate::sandbox::runtime::USER_FILE;

/// Deepest bracket nesting a submission may use.
pub const MAX_NESTING: usize = 200;

/// Deepest expression or block nesting the later passes will walk.
pub const MAX_TREE_DEPTH: usize = 1000;

/// Byte offset to line and column conversion over one source text.
#[derive(Debug, Clone)]
pub struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    /// 1-based line of a byte offset.
    pub fn line(&self, offset: usize) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// 1-based line and character column of a byte offset.
    pub fn line_col(&self, source: &str, offset: usize) -> (usize, usize) {
        let line = self.line(offset);
        let start = self.starts[line - 1];
        let end = offset.min(source.len());
        let col = source.get(start..end).map_or(0, |s| s.chars().count());
        (line, col + 1)
    }
}

/// A submission that passed the pre-pass.
pub struct Prepared {
    pub source: String,
    pub suite: Vec<ast::Stmt>,
    pub lines: LineIndex,
}

impl Prepared {
    /// 1-based line of a node.
    pub fn line_of(&self, node: &impl Ranged) -> usize {
        self.lines.line(node.start().to_usize())
    }
}

/// Runs every check of the pre-pass.
pub fn prepare(source: &str, policy: &ImportPolicy) -> Result<Prepared, RunFailure> {
    let lines = LineIndex::new(source);
    check_nesting(source, &lines)?;

    let suite = ast::Suite::parse(source, USER_FILE).map_err(|err| {
        let (line, col) = lines.line_col(source, err.offset.to_usize());
        debug!(line, col, "submission does not parse");
        RunFailure::Syntax {
            line,
            col,
            message: err.error.to_string(),
        }
    })?;

    let prepared = Prepared {
        source: source.to_string(),
        suite,
        lines,
    };
    if let Some(node) = too_deep(&prepared.suite) {
        let (line, col) = prepared.lines.line_col(source, node);
        return Err(RunFailure::Syntax {
            line,
            col,
            message: "too many nested expressions or blocks".to_string(),
        });
    }
    check_imports(&prepared, policy)?;
    Ok(prepared)
}

fn is_fstring(kind: StringKind) -> bool {
    matches!(kind, StringKind::FString | StringKind::RawFString)
}

/// Brackets inside f-string replacement fields are not separate tokens, so
/// f-string bodies are scanned character by character.
fn check_nesting(source: &str, lines: &LineIndex) -> Result<(), RunFailure> {
    let mut depth = 0usize;
    for token in lexer::lex(source, Mode::Module) {
        let Ok((tok, range)) = token else {
            // The parser reports lexical errors with better messages.
            return Ok(());
        };
        let extra = match &tok {
            Tok::Lpar | Tok::Lsqb | Tok::Lbrace => {
                depth += 1;
                0
            }
            Tok::Rpar | Tok::Rsqb | Tok::Rbrace => {
                depth = depth.saturating_sub(1);
                0
            }
            Tok::String { value, kind, .. } if is_fstring(*kind) => max_bracket_depth(value),
            _ => 0,
        };
        if depth + extra > MAX_NESTING {
            let (line, col) = lines.line_col(source, range.start().to_usize());
            return Err(RunFailure::Syntax {
                line,
                col,
                message: "too many nested parentheses".to_string(),
            });
        }
    }
    Ok(())
}

fn max_bracket_depth(text: &str) -> usize {
    let (mut depth, mut peak) = (0usize, 0usize);
    for c in text.chars() {
        match c {
            '(' | '[' | '{' => {
                depth += 1;
                peak = peak.max(depth);
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    peak
}

/// Statement bodies nested directly in `stmt`.
pub fn child_blocks(stmt: &ast::Stmt) -> Vec<&[ast::Stmt]> {
    use ast::Stmt;
    match stmt {
        Stmt::FunctionDef(ast::StmtFunctionDef { body, .. })
        | Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef { body, .. })
        | Stmt::ClassDef(ast::StmtClassDef { body, .. })
        | Stmt::With(ast::StmtWith { body, .. })
        | Stmt::AsyncWith(ast::StmtAsyncWith { body, .. }) => vec![body],
        Stmt::For(ast::StmtFor { body, orelse, .. })
        | Stmt::AsyncFor(ast::StmtAsyncFor { body, orelse, .. })
        | Stmt::While(ast::StmtWhile { body, orelse, .. })
        | Stmt::If(ast::StmtIf { body, orelse, .. }) => vec![body, orelse],
        Stmt::Try(ast::StmtTry {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        })
        | Stmt::TryStar(ast::StmtTryStar {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        }) => {
            let mut blocks: Vec<&[ast::Stmt]> = vec![body];
            for handler in handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                blocks.push(&h.body);
            }
            blocks.push(orelse);
            blocks.push(finalbody);
            blocks
        }
        Stmt::Match(ast::StmtMatch { cases, .. }) => cases.iter().map(|c| c.body.as_slice()).collect(),
        _ => Vec::new(),
    }
}

fn push_arguments<'a>(args: &'a ast::Arguments, out: &mut Vec<&'a ast::Expr>) {
    let params = args
        .posonlyargs
        .iter()
        .chain(&args.args)
        .chain(&args.kwonlyargs);
    for param in params {
        if let Some(default) = &param.default {
            out.push(default);
        }
        if let Some(annotation) = &param.def.annotation {
            out.push(annotation);
        }
    }
    for param in args.vararg.iter().chain(&args.kwarg) {
        if let Some(annotation) = &param.annotation {
            out.push(annotation);
        }
    }
}

/// Expressions owned directly by `stmt`, not counting nested bodies.
pub fn stmt_exprs(stmt: &ast::Stmt) -> Vec<&ast::Expr> {
    use ast::Stmt;
    let mut out = Vec::new();
    match stmt {
        Stmt::FunctionDef(ast::StmtFunctionDef {
            args,
            decorator_list,
            returns,
            ..
        })
        | Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
            args,
            decorator_list,
            returns,
            ..
        }) => {
            out.extend(decorator_list);
            push_arguments(args, &mut out);
            out.extend(returns.as_deref());
        }
        Stmt::ClassDef(ast::StmtClassDef {
            bases,
            keywords,
            decorator_list,
            ..
        }) => {
            out.extend(decorator_list);
            out.extend(bases);
            out.extend(keywords.iter().map(|k| &k.value));
        }
        Stmt::Return(ast::StmtReturn { value, .. }) => out.extend(value.as_deref()),
        Stmt::Delete(ast::StmtDelete { targets, .. }) => out.extend(targets),
        Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
            out.extend(targets);
            out.push(value);
        }
        Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
            out.push(target);
            out.push(value);
        }
        Stmt::AnnAssign(ast::StmtAnnAssign {
            target,
            annotation,
            value,
            ..
        }) => {
            out.push(target);
            out.push(annotation);
            out.extend(value.as_deref());
        }
        Stmt::For(ast::StmtFor { target, iter, .. })
        | Stmt::AsyncFor(ast::StmtAsyncFor { target, iter, .. }) => {
            out.push(target);
            out.push(iter);
        }
        Stmt::While(ast::StmtWhile { test, .. }) | Stmt::If(ast::StmtIf { test, .. }) => out.push(test),
        Stmt::With(ast::StmtWith { items, .. }) | Stmt::AsyncWith(ast::StmtAsyncWith { items, .. }) => {
            for item in items {
                out.push(&item.context_expr);
                out.extend(item.optional_vars.as_deref());
            }
        }
        Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
            out.push(subject);
            out.extend(cases.iter().filter_map(|c| c.guard.as_deref()));
        }
        Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
            out.extend(exc.as_deref());
            out.extend(cause.as_deref());
        }
        Stmt::Try(ast::StmtTry { handlers, .. }) | Stmt::TryStar(ast::StmtTryStar { handlers, .. }) => {
            for handler in handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                out.extend(h.type_.as_deref());
            }
        }
        Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
            out.push(test);
            out.extend(msg.as_deref());
        }
        Stmt::Expr(ast::StmtExpr { value, .. }) => out.push(value),
        _ => {}
    }
    out
}

/// Sub-expressions of `expr`, in source order where it matters.
pub fn expr_children(expr: &ast::Expr) -> Vec<&ast::Expr> {
    use ast::Expr;
    let mut out = Vec::new();
    match expr {
        Expr::BoolOp(ast::ExprBoolOp { values, .. }) => out.extend(values),
        Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
            out.push(target);
            out.push(value);
        }
        Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
            out.push(left);
            out.push(right);
        }
        Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => out.push(operand),
        Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
            push_arguments(args, &mut out);
            out.push(body);
        }
        Expr::IfExp(ast::ExprIfExp { test, body, orelse, .. }) => {
            out.push(test);
            out.push(body);
            out.push(orelse);
        }
        Expr::Dict(ast::ExprDict { keys, values, .. }) => {
            for (key, value) in keys.iter().zip(values) {
                out.extend(key.as_ref());
                out.push(value);
            }
        }
        Expr::Set(ast::ExprSet { elts, .. })
        | Expr::List(ast::ExprList { elts, .. })
        | Expr::Tuple(ast::ExprTuple { elts, .. }) => out.extend(elts),
        Expr::ListComp(ast::ExprListComp { elt, generators, .. })
        | Expr::SetComp(ast::ExprSetComp { elt, generators, .. })
        | Expr::GeneratorExp(ast::ExprGeneratorExp { elt, generators, .. }) => {
            push_generators(generators, &mut out);
            out.push(elt);
        }
        Expr::DictComp(ast::ExprDictComp {
            key,
            value,
            generators,
            ..
        }) => {
            push_generators(generators, &mut out);
            out.push(key);
            out.push(value);
        }
        Expr::Await(ast::ExprAwait { value, .. })
        | Expr::YieldFrom(ast::ExprYieldFrom { value, .. })
        | Expr::Attribute(ast::ExprAttribute { value, .. })
        | Expr::Starred(ast::ExprStarred { value, .. }) => out.push(value),
        Expr::Yield(ast::ExprYield { value, .. }) => out.extend(value.as_deref()),
        Expr::Compare(ast::ExprCompare {
            left, comparators, ..
        }) => {
            out.push(left);
            out.extend(comparators);
        }
        Expr::Call(ast::ExprCall {
            func,
            args,
            keywords,
            ..
        }) => {
            out.push(func);
            out.extend(args);
            out.extend(keywords.iter().map(|k| &k.value));
        }
        Expr::FormattedValue(ast::ExprFormattedValue {
            value, format_spec, ..
        }) => {
            out.push(value);
            out.extend(format_spec.as_deref());
        }
        Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => out.extend(values),
        Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
            out.push(value);
            out.push(slice);
        }
        Expr::Slice(ast::ExprSlice {
            lower, upper, step, ..
        }) => {
            out.extend(lower.as_deref());
            out.extend(upper.as_deref());
            out.extend(step.as_deref());
        }
        _ => {}
    }
    out
}

fn push_generators<'a>(generators: &'a [ast::Comprehension], out: &mut Vec<&'a ast::Expr>) {
    for generator in generators {
        out.push(&generator.iter);
        out.push(&generator.target);
        out.extend(&generator.ifs);
    }
}

/// Offset of the first node nested deeper than [`MAX_TREE_DEPTH`]. The
/// walk gives up at that depth, so it never recurses further itself.
fn too_deep(suite: &[ast::Stmt]) -> Option<usize> {
    fn block(stmts: &[ast::Stmt], depth: usize) -> Option<usize> {
        stmts.iter().find_map(|stmt| statement(stmt, depth))
    }
    fn statement(stmt: &ast::Stmt, depth: usize) -> Option<usize> {
        if depth > MAX_TREE_DEPTH {
            return Some(stmt.start().to_usize());
        }
        stmt_exprs(stmt)
            .into_iter()
            .find_map(|e| expression(e, depth + 1))
            .or_else(|| child_blocks(stmt).into_iter().find_map(|b| block(b, depth + 1)))
    }
    fn expression(expr: &ast::Expr, depth: usize) -> Option<usize> {
        if depth > MAX_TREE_DEPTH {
            return Some(expr.start().to_usize());
        }
        expr_children(expr)
            .into_iter()
            .find_map(|e| expression(e, depth + 1))
    }
    block(suite, 0)
}

/// Every import in the submission, at any depth, with its line.
pub fn imported_modules(prepared: &Prepared) -> Vec<(String, usize)> {
    fn walk(prepared: &Prepared, stmts: &[ast::Stmt], out: &mut Vec<(String, usize)>) {
        for stmt in stmts {
            match stmt {
                ast::Stmt::Import(ast::StmtImport { names, .. }) => {
                    let line = prepared.line_of(stmt);
                    out.extend(names.iter().map(|alias| (alias.name.as_str().to_string(), line)));
                }
                ast::Stmt::ImportFrom(ast::StmtImportFrom {
                    module: Some(module),
                    level,
                    ..
                }) if level.map_or(0, |l| l.to_u32()) == 0 => {
                    out.push((module.as_str().to_string(), prepared.line_of(stmt)));
                }
                _ => {}
            }
            for body in child_blocks(stmt) {
                walk(prepared, body, out);
            }
        }
    }
    let mut out = Vec::new();
    walk(prepared, &prepared.suite, &mut out);
    out
}

/// Refuses the submission when any import, even one that would never run,
/// names a module outside the whitelist.
fn check_imports(prepared: &Prepared, policy: &ImportPolicy) -> Result<(), RunFailure> {
    for (module, line) in imported_modules(prepared) {
        if policy.classify(&module) == ImportClass::Disallowed {
            debug!(module = %module, line, "import refused before running");
            return Err(RunFailure::Import { module, line });
        }
    }
    Ok(())
}
