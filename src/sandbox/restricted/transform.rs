//! Restricting rewrite applied before compilation.
//!
//! The rewrite works on the source text: it only inserts guard calls
//! around existing expressions, so every statement keeps its line and
//! tracebacks can quote the submission as written. Attribute and item
//! reads go through guard proxies, loop iterables through a ticking
//! iterator, size-sensitive operators through the allocation checks.
//! Import statements are the one exception: each is replaced by calls into
//! the host importer, padded to the same number of lines.
//!
//! Identifiers and attribute names starting with `__` are rejected, apart
//! from a handful of harmless dunders and the protocol methods a class
//! body may define. So are the names of the helpers the rewrite calls.

use rustpython_parser::ast::{self, Ranged};

use crate::sandbox::guards::SAFE_DUNDERS;
use crate::sandbox::policy::top_level;
use crate::sandbox::syntax::{expr_children, Prepared};

/// Builtins the rewritten source calls. Scripts may not bind or read them.
pub const RESERVED_NAMES: &[&str] = &[
    "_getattr_",
    "_getitem_",
    "_inplace_",
    "_operand_",
    "_augcheck_",
    "_getiter_",
    "_factory_",
    "_tick_",
    "_import_",
    "_import_from_",
    "_import_star_",
];

/// Builtins whose calls are routed through the allocation checks.
const FACTORY_NAMES: &[&str] = &["bytes", "bytearray", "list", "tuple", "set", "frozenset", "sorted"];

#[derive(Clone, Copy)]
enum NameKind {
    Variable,
    Attribute,
}

impl NameKind {
    fn as_str(self) -> &'static str {
        match self {
            NameKind::Variable => "variable",
            NameKind::Attribute => "attribute",
        }
    }
}

fn is_protocol_method(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

/// Operators whose operands are size-checked, by their support name.
fn checked_operator(op: ast::Operator) -> Option<&'static str> {
    match op {
        ast::Operator::Add => Some("add"),
        ast::Operator::Mult => Some("mul"),
        ast::Operator::Mod => Some("mod"),
        ast::Operator::Pow => Some("pow"),
        ast::Operator::LShift => Some("lshift"),
        _ => None,
    }
}

enum Edit {
    Wrap {
        start: usize,
        end: usize,
        open: String,
        close: &'static str,
        seq: usize,
    },
    Replace {
        start: usize,
        end: usize,
        text: String,
    },
}

/// Returns the rewritten source, or every naming violation found.
pub fn restrict(prepared: &Prepared) -> Result<String, Vec<String>> {
    let mut rewriter = Rewriter {
        prepared,
        errors: Vec::new(),
        edits: Vec::new(),
        nesting: 0,
    };
    rewriter.block(&prepared.suite);
    if rewriter.errors.is_empty() {
        Ok(apply(&prepared.source, rewriter.edits))
    } else {
        Err(rewriter.errors)
    }
}

struct Rewriter<'a> {
    prepared: &'a Prepared,
    errors: Vec<String>,
    edits: Vec<Edit>,
    /// Function and class bodies entered.
    nesting: usize,
}

impl Rewriter<'_> {
    fn line(&self, node: &impl Ranged) -> usize {
        self.prepared.line_of(node)
    }

    fn check(&mut self, name: &str, kind: NameKind, line: usize) {
        if name.starts_with("__") && !SAFE_DUNDERS.contains(&name) {
            self.errors.push(format!(
                "Line {line}: \"{name}\" is an invalid {} name because it starts with \"__\".",
                kind.as_str()
            ));
        } else if matches!(kind, NameKind::Variable) && RESERVED_NAMES.contains(&name) {
            self.errors.push(format!("Line {line}: \"{name}\" is a reserved name."));
        }
    }

    fn check_variable(&mut self, name: &str, line: usize) {
        self.check(name, NameKind::Variable, line);
    }

    fn wrap(&mut self, node: &impl Ranged, open: impl Into<String>) {
        self.wrap_with(node, open, "))");
    }

    fn wrap_with(&mut self, node: &impl Ranged, open: impl Into<String>, close: &'static str) {
        let seq = self.edits.len();
        self.edits.push(Edit::Wrap {
            start: node.start().to_usize(),
            end: node.end().to_usize(),
            open: open.into(),
            close,
            seq,
        });
    }

    fn optional(&mut self, expr: Option<&ast::Expr>) {
        if let Some(expr) = expr {
            self.expr(expr);
        }
    }

    fn block(&mut self, stmts: &[ast::Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn nested(&mut self, stmts: &[ast::Stmt]) {
        self.nesting += 1;
        self.block(stmts);
        self.nesting -= 1;
    }

    fn stmt(&mut self, stmt: &ast::Stmt) {
        use ast::Stmt;
        let line = self.line(stmt);
        match stmt {
            Stmt::FunctionDef(ast::StmtFunctionDef {
                name,
                args,
                body,
                decorator_list,
                returns,
                ..
            })
            | Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
                name,
                args,
                body,
                decorator_list,
                returns,
                ..
            }) => {
                decorator_list.iter().for_each(|d| self.expr(d));
                if !is_protocol_method(name.as_str()) {
                    self.check_variable(name.as_str(), line);
                }
                self.arguments(args, line);
                self.optional(returns.as_deref());
                self.nested(body);
            }
            Stmt::ClassDef(ast::StmtClassDef {
                name,
                bases,
                keywords,
                body,
                decorator_list,
                ..
            }) => {
                decorator_list.iter().for_each(|d| self.expr(d));
                self.check_variable(name.as_str(), line);
                bases.iter().for_each(|b| self.expr(b));
                self.keywords(keywords, line);
                self.nested(body);
            }
            Stmt::Return(ast::StmtReturn { value, .. }) => self.optional(value.as_deref()),
            Stmt::Delete(ast::StmtDelete { targets, .. }) => targets.iter().for_each(|t| self.target(t)),
            Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                targets.iter().for_each(|t| self.target(t));
                self.expr(value);
            }
            Stmt::AugAssign(node) => self.aug_assign(node, line),
            Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => {
                self.target(target);
                self.expr(annotation);
                self.optional(value.as_deref());
            }
            Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.target(target);
                self.wrap(iter.as_ref(), "_getiter_((");
                self.expr(iter);
                self.block(body);
                self.block(orelse);
            }
            Stmt::AsyncFor(ast::StmtAsyncFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.target(target);
                self.expr(iter);
                self.block(body);
                self.block(orelse);
            }
            Stmt::While(ast::StmtWhile { test, body, orelse, .. }) => {
                self.wrap(test.as_ref(), "_tick_() and ((");
                self.expr(test);
                self.block(body);
                self.block(orelse);
            }
            Stmt::If(ast::StmtIf { test, body, orelse, .. }) => {
                self.expr(test);
                self.block(body);
                self.block(orelse);
            }
            Stmt::With(ast::StmtWith { items, body, .. }) | Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                for item in items {
                    self.expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.target(vars);
                    }
                }
                self.block(body);
            }
            Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
                self.expr(subject);
                for case in cases {
                    self.pattern(&case.pattern, line);
                    self.optional(case.guard.as_deref());
                    self.block(&case.body);
                }
            }
            Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                self.optional(exc.as_deref());
                self.optional(cause.as_deref());
            }
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
                self.block(body);
                for handler in handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    self.optional(handler.type_.as_deref());
                    if let Some(name) = &handler.name {
                        self.check_variable(name.as_str(), self.line(handler));
                    }
                    self.block(&handler.body);
                }
                self.block(orelse);
                self.block(finalbody);
            }
            Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                self.expr(test);
                self.optional(msg.as_deref());
            }
            Stmt::Import(node) => self.import(stmt, node, line),
            Stmt::ImportFrom(node) => self.import_from(stmt, node, line),
            Stmt::Global(ast::StmtGlobal { names, .. }) | Stmt::Nonlocal(ast::StmtNonlocal { names, .. }) => {
                for name in names {
                    self.check_variable(name.as_str(), line);
                }
            }
            Stmt::Expr(ast::StmtExpr { value, .. }) => self.expr(value),
            _ => {}
        }
    }

    fn arguments(&mut self, args: &ast::Arguments, line: usize) {
        for param in args.posonlyargs.iter().chain(&args.args).chain(&args.kwonlyargs) {
            self.check_variable(param.def.arg.as_str(), line);
            self.optional(param.def.annotation.as_deref());
            self.optional(param.default.as_deref());
        }
        for param in args.vararg.iter().chain(&args.kwarg) {
            self.check_variable(param.arg.as_str(), line);
            self.optional(param.annotation.as_deref());
        }
    }

    fn keywords(&mut self, keywords: &[ast::Keyword], line: usize) {
        for keyword in keywords {
            if let Some(name) = &keyword.arg {
                self.check_variable(name.as_str(), line);
            }
            self.expr(&keyword.value);
        }
    }

    /// `x op= v` checks the size of the result before it is built; the
    /// object behind an attribute or item target is read through a proxy
    /// that also performs the operation.
    fn aug_assign(&mut self, node: &ast::StmtAugAssign, line: usize) {
        match node.target.as_ref() {
            ast::Expr::Name(ast::ExprName { id, .. }) => {
                self.check_variable(id.as_str(), line);
                if let Some(op) = checked_operator(node.op) {
                    let open = format!("_augcheck_(\"{op}\", {}, ((", id.as_str());
                    self.wrap_with(node.value.as_ref(), open, ")))");
                }
            }
            ast::Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.check(attr.as_str(), NameKind::Attribute, line);
                self.wrap(value.as_ref(), "_inplace_((");
                self.expr(value);
            }
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.wrap(value.as_ref(), "_inplace_((");
                self.expr(value);
                self.expr(slice);
            }
            other => self.expr(other),
        }
        self.expr(&node.value);
    }

    fn pattern(&mut self, pattern: &ast::Pattern, line: usize) {
        use ast::Pattern;
        match pattern {
            Pattern::MatchValue(ast::PatternMatchValue { value, .. }) => self.expr(value),
            Pattern::MatchSingleton(_) => {}
            Pattern::MatchSequence(ast::PatternMatchSequence { patterns, .. })
            | Pattern::MatchOr(ast::PatternMatchOr { patterns, .. }) => {
                patterns.iter().for_each(|p| self.pattern(p, line))
            }
            Pattern::MatchMapping(ast::PatternMatchMapping {
                keys, patterns, rest, ..
            }) => {
                keys.iter().for_each(|k| self.expr(k));
                patterns.iter().for_each(|p| self.pattern(p, line));
                if let Some(rest) = rest {
                    self.check_variable(rest.as_str(), line);
                }
            }
            Pattern::MatchClass(ast::PatternMatchClass {
                cls,
                patterns,
                kwd_attrs,
                kwd_patterns,
                ..
            }) => {
                self.expr(cls);
                patterns.iter().for_each(|p| self.pattern(p, line));
                for attr in kwd_attrs {
                    self.check(attr.as_str(), NameKind::Attribute, line);
                }
                kwd_patterns.iter().for_each(|p| self.pattern(p, line));
            }
            Pattern::MatchStar(ast::PatternMatchStar { name, .. }) => {
                if let Some(name) = name {
                    self.check_variable(name.as_str(), line);
                }
            }
            Pattern::MatchAs(ast::PatternMatchAs { pattern, name, .. }) => {
                if let Some(inner) = pattern {
                    self.pattern(inner, line);
                }
                if let Some(name) = name {
                    self.check_variable(name.as_str(), line);
                }
            }
        }
    }

    /// Assignment and deletion targets: the object being written to is read
    /// through guards, the final write is not.
    fn target(&mut self, target: &ast::Expr) {
        let line = self.line(target);
        match target {
            ast::Expr::Name(ast::ExprName { id, .. }) => self.check_variable(id.as_str(), line),
            ast::Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.check(attr.as_str(), NameKind::Attribute, line);
                self.expr(value);
            }
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.expr(value);
                self.expr(slice);
            }
            ast::Expr::Tuple(ast::ExprTuple { elts, .. }) | ast::Expr::List(ast::ExprList { elts, .. }) => {
                elts.iter().for_each(|e| self.target(e))
            }
            ast::Expr::Starred(ast::ExprStarred { value, .. }) => self.target(value),
            other => self.expr(other),
        }
    }

    fn comprehensions(&mut self, generators: &[ast::Comprehension]) {
        for generator in generators {
            self.target(&generator.target);
            if !generator.is_async {
                self.wrap(&generator.iter, "_getiter_((");
            }
            self.expr(&generator.iter);
            generator.ifs.iter().for_each(|c| self.expr(c));
        }
    }

    fn expr(&mut self, expr: &ast::Expr) {
        use ast::Expr;
        let line = self.line(expr);
        match expr {
            Expr::Name(ast::ExprName { id, .. }) => self.check_variable(id.as_str(), line),
            Expr::Attribute(ast::ExprAttribute { value, attr, ctx, .. }) => {
                self.check(attr.as_str(), NameKind::Attribute, line);
                if matches!(ctx, ast::ExprContext::Load) {
                    self.wrap(value.as_ref(), "_getattr_((");
                }
                self.expr(value);
            }
            Expr::Subscript(ast::ExprSubscript { value, slice, ctx, .. }) => {
                if matches!(ctx, ast::ExprContext::Load) {
                    self.wrap(value.as_ref(), "_getitem_((");
                }
                self.expr(value);
                self.expr(slice);
            }
            Expr::BinOp(ast::ExprBinOp { left, op, right, .. }) => {
                if checked_operator(*op).is_some() {
                    self.wrap(left.as_ref(), "_operand_((");
                }
                self.expr(left);
                self.expr(right);
            }
            Expr::Call(ast::ExprCall {
                func, args, keywords, ..
            }) => {
                if let Expr::Name(ast::ExprName { id, .. }) = func.as_ref() {
                    if FACTORY_NAMES.contains(&id.as_str()) {
                        self.wrap(func.as_ref(), "_factory_((");
                    }
                }
                self.expr(func);
                args.iter().for_each(|a| self.expr(a));
                self.keywords(keywords, line);
            }
            Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                self.target(target);
                self.expr(value);
            }
            Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                self.arguments(args, line);
                self.expr(body);
            }
            Expr::ListComp(ast::ExprListComp { elt, generators, .. })
            | Expr::SetComp(ast::ExprSetComp { elt, generators, .. })
            | Expr::GeneratorExp(ast::ExprGeneratorExp { elt, generators, .. }) => {
                self.comprehensions(generators);
                self.expr(elt);
            }
            Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.comprehensions(generators);
                self.expr(key);
                self.expr(value);
            }
            other => {
                for child in expr_children(other) {
                    self.expr(child);
                }
            }
        }
    }

    // Imports

    fn check_module_path(&mut self, path: &str, line: usize) {
        for part in path.split('.') {
            self.check_variable(part, line);
        }
    }

    fn replace(&mut self, stmt: &ast::Stmt, text: String) {
        let (start, end) = (stmt.start().to_usize(), stmt.end().to_usize());
        // Newlines go inside the last call's parentheses, so the statement
        // still spans as many lines as the original.
        let breaks = self.prepared.source[start..end].matches('\n').count();
        let text = match text.strip_suffix(')') {
            Some(head) => format!("{head}{})", "\n".repeat(breaks)),
            None => text,
        };
        self.edits.push(Edit::Replace { start, end, text });
    }

    fn import(&mut self, stmt: &ast::Stmt, node: &ast::StmtImport, line: usize) {
        let mut bindings = Vec::with_capacity(node.names.len());
        for alias in &node.names {
            let module = alias.name.as_str();
            self.check_module_path(module, line);
            match &alias.asname {
                Some(asname) => {
                    self.check_variable(asname.as_str(), line);
                    bindings.push(format!("{} = _import_(\"{module}\", True)", asname.as_str()));
                }
                None => {
                    let top = top_level(module);
                    bindings.push(format!("{top} = _import_(\"{module}\", False)"));
                }
            }
        }
        self.replace(stmt, bindings.join("; "));
    }

    fn import_from(&mut self, stmt: &ast::Stmt, node: &ast::StmtImportFrom, line: usize) {
        let level = node.level.map_or(0, |l| l.to_u32());
        let module = node.module.as_ref().map_or("", |m| m.as_str());
        if level > 0 {
            self.replace(
                stmt,
                "raise ImportError(\"attempted relative import with no known parent package\")".to_string(),
            );
            return;
        }
        self.check_module_path(module, line);
        if node.names.iter().any(|alias| alias.name.as_str() == "*") {
            if self.nesting > 0 {
                self.errors
                    .push(format!("Line {line}: import * only allowed at module level"));
                return;
            }
            self.replace(stmt, format!("_import_star_(\"{module}\")"));
            return;
        }
        let mut targets = String::new();
        let mut names = String::new();
        for alias in &node.names {
            self.check_variable(alias.name.as_str(), line);
            let bound = match &alias.asname {
                Some(asname) => {
                    self.check_variable(asname.as_str(), line);
                    asname.as_str()
                }
                None => alias.name.as_str(),
            };
            targets.push_str(&format!("{bound}, "));
            names.push_str(&format!("\"{}\", ", alias.name.as_str()));
        }
        self.replace(stmt, format!("{targets}= _import_from_(\"{module}\", ({names}))"));
    }
}

/// Applies the edits to `source`. Wraps sharing an offset nest: the wider
/// one opens first and closes last.
fn apply(source: &str, edits: Vec<Edit>) -> String {
    enum Event {
        Insert(String),
        Skip { end: usize, text: String },
    }
    // (offset, ordering key, event)
    let mut events: Vec<(usize, (u8, usize, usize), Event)> = Vec::with_capacity(edits.len() * 2);
    for edit in edits {
        match edit {
            Edit::Wrap {
                start,
                end,
                open,
                close,
                seq,
            } => {
                events.push((end, (0, usize::MAX - start, usize::MAX - seq), Event::Insert(close.to_string())));
                events.push((start, (1, usize::MAX - end, seq), Event::Insert(open)));
            }
            Edit::Replace { start, end, text } => {
                events.push((start, (2, 0, 0), Event::Skip { end, text }));
            }
        }
    }
    events.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let mut out = String::with_capacity(source.len() + events.len() * 8);
    let mut cursor = 0;
    for (at, _, event) in events {
        if at < cursor {
            continue;
        }
        out.push_str(&source[cursor..at]);
        cursor = at;
        match event {
            Event::Insert(text) => out.push_str(&text),
            Event::Skip { end, text } => {
                out.push_str(&text);
                cursor = end;
            }
        }
    }
    out.push_str(&source[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::policy::ImportPolicy;
    use crate::sandbox::syntax::prepare;

    fn restricted(src: &str) -> Result<String, Vec<String>> {
        let prepared = prepare(src, &ImportPolicy::new(Vec::<String>::new()))
            .unwrap_or_else(|_| panic!("{src:?} did not parse"));
        restrict(&prepared)
    }

    #[test]
    fn test_reads_become_guarded() {
        assert_eq!(
            restricted("y = a.b[0]\n").unwrap(),
            "y = _getitem_((_getattr_((a)).b))[0]\n"
        );
    }

    #[test]
    fn test_write_targets_stay_plain() {
        assert_eq!(restricted("a.b = 1\nd[k] = v\n").unwrap(), "a.b = 1\nd[k] = v\n");
        assert_eq!(restricted("a.b.c = 1\n").unwrap(), "_getattr_((a)).b.c = 1\n");
    }

    #[test]
    fn test_loops_are_ticked() {
        assert_eq!(
            restricted("for x in xs:\n    pass\nwhile n:\n    n -= 1\n").unwrap(),
            "for x in _getiter_((xs)):\n    pass\nwhile _tick_() and ((n)):\n    n -= 1\n"
        );
        assert_eq!(
            restricted("ys = [y * 2 for y in xs]\n").unwrap(),
            "ys = [_operand_((y)) * 2 for y in _getiter_((xs))]\n"
        );
    }

    #[test]
    fn test_size_checked_operators() {
        assert_eq!(
            restricted("s = 'ab' * n\nt += u\nm = list(g)\n").unwrap(),
            "s = _operand_(('ab')) * n\nt += _augcheck_(\"add\", t, ((u)))\nm = _factory_((list))(g)\n"
        );
        assert_eq!(restricted("o.total += 1\n").unwrap(), "_inplace_((o)).total += 1\n");
    }

    #[test]
    fn test_imports_keep_line_count() {
        let src = "from json import (dumps,\n    loads as ld)\nimport html.parser\nimport math as m\n";
        let out = restricted(src).unwrap();
        assert_eq!(
            out,
            "dumps, ld, = _import_from_(\"json\", (\"dumps\", \"loads\", )\n)\n\
             html = _import_(\"html.parser\", False)\nm = _import_(\"math\", True)\n"
        );
        assert_eq!(out.lines().count(), src.lines().count());
    }

    #[test]
    fn test_nested_wraps_share_offsets() {
        assert_eq!(
            restricted("v = a.b.c\n").unwrap(),
            "v = _getattr_((_getattr_((a)).b)).c\n"
        );
        assert_eq!(
            restricted("print(f'{p.x}')\n").unwrap(),
            "print(f'{_getattr_((p)).x}')\n"
        );
    }

    #[test]
    fn test_dunder_names_rejected() {
        let errors = restricted("x = ().__class__\n__secret = 1\n").unwrap_err();
        assert_eq!(
            errors,
            [
                "Line 1: \"__class__\" is an invalid attribute name because it starts with \"__\".",
                "Line 2: \"__secret\" is an invalid variable name because it starts with \"__\".",
            ]
        );
    }

    #[test]
    fn test_reserved_names_rejected() {
        let errors = restricted("_getattr_ = getattr\n").unwrap_err();
        assert_eq!(errors, ["Line 1: \"_getattr_\" is a reserved name."]);
    }

    #[test]
    fn test_star_import_only_at_module_level() {
        let errors = restricted("def f():\n    from math import *\n").unwrap_err();
        assert_eq!(errors, ["Line 2: import * only allowed at module level"]);
    }

    #[test]
    fn test_protocol_methods_and_safe_dunders_allowed() {
        let src = "\
class P:
    def __init__(self):
        super().__init__()
    def __repr__(self):
        return 'P'
if __name__ == '__main__':
    pass
";
        assert!(restricted(src).is_ok());
    }
}
