//! Single-pass structural analysis of Python source.
//!
//! The source is parsed once with `rustpython-parser` and the resulting AST is
//! walked once. The walk records only what the validation rules and the
//! classifier need: imports, call sites, dunder references, loop nesting and
//! large `range()` literals. Nothing here evaluates or imports the candidate
//! code.

use rustpython_parser::ast::{self, Constant, Expr, Stmt};
use rustpython_parser::Parse;

/// Parse failure, rendered the way the parser reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for SyntaxError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// Full dotted module path; empty for `from . import x`.
    pub module: String,
    pub relative: bool,
}

impl Import {
    /// `numpy.linalg` -> `numpy`.
    pub fn base_module(&self) -> &str {
        self.module.split('.').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// `open(...)`
    Name(String),
    /// `os.path.join(...)`: root `os`, path `os.path.join`, attr `join`.
    /// `root` is `None` when the chain does not start at a plain name,
    /// e.g. `open("f").read()`.
    Attribute {
        root: Option<String>,
        path: String,
        attr: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub callee: Callee,
}

impl CallSite {
    /// The name shown in violation messages.
    pub fn display_name(&self) -> &str {
        match &self.callee {
            Callee::Name(name) => name,
            Callee::Attribute { path, .. } => path,
        }
    }
}

/// The parsed program plus everything the rules inspect.
#[derive(Debug, Clone, Default)]
pub struct SourceTree {
    pub imports: Vec<Import>,
    pub calls: Vec<CallSite>,
    /// Every `__name__`-style identifier, attribute or string subscript key,
    /// in source order.
    pub dunder_references: Vec<String>,
    pub max_loop_depth: usize,
    pub largest_range_literal: Option<u64>,
}

impl SourceTree {
    pub fn parse(source: &str) -> Result<Self, SyntaxError> {
        let suite = ast::Suite::parse(source, "<generated>").map_err(|e| SyntaxError {
            message: e.to_string(),
        })?;

        let mut tree = SourceTree::default();
        let mut walker = Walker {
            tree: &mut tree,
            loop_depth: 0,
        };
        walker.visit_body(&suite);
        Ok(tree)
    }

    pub fn imported_base_modules(&self) -> impl Iterator<Item = &str> {
        self.imports
            .iter()
            .filter(|import| !import.relative)
            .map(Import::base_module)
    }
}

struct Walker<'a> {
    tree: &'a mut SourceTree,
    loop_depth: usize,
}

impl Walker<'_> {
    fn visit_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_loop(&mut self, body: &[Stmt], orelse: &[Stmt]) {
        self.loop_depth += 1;
        self.tree.max_loop_depth = self.tree.max_loop_depth.max(self.loop_depth);
        self.visit_body(body);
        self.loop_depth -= 1;
        self.visit_body(orelse);
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Import(ast::StmtImport { names, .. }) => {
                for alias in names {
                    self.tree.imports.push(Import {
                        module: alias.name.as_str().to_string(),
                        relative: false,
                    });
                }
            }
            Stmt::ImportFrom(ast::StmtImportFrom { module, .. }) => {
                self.tree.imports.push(match module {
                    Some(module) => Import {
                        module: module.as_str().to_string(),
                        relative: false,
                    },
                    None => Import {
                        module: String::new(),
                        relative: true,
                    },
                });
            }
            Stmt::FunctionDef(ast::StmtFunctionDef {
                args,
                body,
                decorator_list,
                returns,
                ..
            })
            | Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
                args,
                body,
                decorator_list,
                returns,
                ..
            }) => {
                self.visit_exprs(decorator_list);
                self.visit_arguments(args);
                if let Some(returns) = returns {
                    self.visit_expr(returns);
                }
                self.visit_body(body);
            }
            Stmt::ClassDef(ast::StmtClassDef {
                bases,
                keywords,
                body,
                decorator_list,
                ..
            }) => {
                self.visit_exprs(decorator_list);
                self.visit_exprs(bases);
                for keyword in keywords {
                    self.visit_expr(&keyword.value);
                }
                self.visit_body(body);
            }
            Stmt::Return(ast::StmtReturn { value, .. }) => self.visit_optional(value),
            Stmt::Delete(ast::StmtDelete { targets, .. }) => self.visit_exprs(targets),
            Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.visit_exprs(targets);
                self.visit_expr(value);
            }
            Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                self.visit_expr(target);
                self.visit_expr(value);
            }
            Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => {
                self.visit_expr(target);
                self.visit_expr(annotation);
                self.visit_optional(value);
            }
            Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            })
            | Stmt::AsyncFor(ast::StmtAsyncFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.visit_expr(target);
                self.visit_expr(iter);
                self.visit_loop(body, orelse);
            }
            Stmt::While(ast::StmtWhile {
                test, body, orelse, ..
            }) => {
                self.visit_expr(test);
                self.visit_loop(body, orelse);
            }
            Stmt::If(ast::StmtIf {
                test, body, orelse, ..
            }) => {
                self.visit_expr(test);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            Stmt::With(ast::StmtWith { items, body, .. })
            | Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                for item in items {
                    self.visit_expr(&item.context_expr);
                    self.visit_optional(&item.optional_vars);
                }
                self.visit_body(body);
            }
            Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
                self.visit_expr(subject);
                for case in cases {
                    self.visit_optional(&case.guard);
                    self.visit_body(&case.body);
                }
            }
            Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                self.visit_optional(exc);
                self.visit_optional(cause);
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
                self.visit_body(body);
                for handler in handlers {
                    match handler {
                        ast::ExceptHandler::ExceptHandler(handler) => {
                            self.visit_optional(&handler.type_);
                            self.visit_body(&handler.body);
                        }
                    }
                }
                self.visit_body(orelse);
                self.visit_body(finalbody);
            }
            Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                self.visit_expr(test);
                self.visit_optional(msg);
            }
            Stmt::Expr(ast::StmtExpr { value, .. }) => self.visit_expr(value),
            _ => {}
        }
    }

    fn visit_arguments(&mut self, args: &ast::Arguments) {
        for arg in args
            .posonlyargs
            .iter()
            .chain(args.args.iter())
            .chain(args.kwonlyargs.iter())
        {
            self.visit_optional(&arg.default);
        }
    }

    fn visit_optional(&mut self, expr: &Option<Box<Expr>>) {
        if let Some(expr) = expr {
            self.visit_expr(expr);
        }
    }

    fn visit_exprs(&mut self, exprs: &[Expr]) {
        for expr in exprs {
            self.visit_expr(expr);
        }
    }

    fn visit_comprehensions(&mut self, generators: &[ast::Comprehension]) {
        for generator in generators {
            self.visit_expr(&generator.target);
            self.visit_expr(&generator.iter);
            self.visit_exprs(&generator.ifs);
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Call(ast::ExprCall {
                func,
                args,
                keywords,
                ..
            }) => {
                self.record_call(func, args);
                self.visit_expr(func);
                self.visit_exprs(args);
                for keyword in keywords {
                    self.visit_expr(&keyword.value);
                }
            }
            Expr::BoolOp(ast::ExprBoolOp { values, .. }) => self.visit_exprs(values),
            Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                self.visit_expr(target);
                self.visit_expr(value);
            }
            Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => self.visit_expr(operand),
            Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                self.visit_arguments(args);
                self.visit_expr(body);
            }
            Expr::IfExp(ast::ExprIfExp {
                test, body, orelse, ..
            }) => {
                self.visit_expr(test);
                self.visit_expr(body);
                self.visit_expr(orelse);
            }
            Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                for key in keys.iter().flatten() {
                    self.visit_expr(key);
                }
                self.visit_exprs(values);
            }
            Expr::Set(ast::ExprSet { elts, .. })
            | Expr::List(ast::ExprList { elts, .. })
            | Expr::Tuple(ast::ExprTuple { elts, .. }) => self.visit_exprs(elts),
            Expr::ListComp(ast::ExprListComp {
                elt, generators, ..
            })
            | Expr::SetComp(ast::ExprSetComp {
                elt, generators, ..
            })
            | Expr::GeneratorExp(ast::ExprGeneratorExp {
                elt, generators, ..
            }) => {
                self.visit_expr(elt);
                self.visit_comprehensions(generators);
            }
            Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.visit_expr(key);
                self.visit_expr(value);
                self.visit_comprehensions(generators);
            }
            Expr::Await(ast::ExprAwait { value, .. })
            | Expr::YieldFrom(ast::ExprYieldFrom { value, .. })
            | Expr::Starred(ast::ExprStarred { value, .. }) => self.visit_expr(value),
            Expr::Yield(ast::ExprYield { value, .. }) => self.visit_optional(value),
            Expr::Compare(ast::ExprCompare {
                left, comparators, ..
            }) => {
                self.visit_expr(left);
                self.visit_exprs(comparators);
            }
            Expr::FormattedValue(ast::ExprFormattedValue {
                value, format_spec, ..
            }) => {
                self.visit_expr(value);
                self.visit_optional(format_spec);
            }
            Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => self.visit_exprs(values),
            Expr::Name(ast::ExprName { id, .. }) => self.record_dunder(id.as_str()),
            Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                self.visit_expr(value);
                self.record_dunder(attr.as_str());
            }
            Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.visit_expr(value);
                if let Expr::Constant(ast::ExprConstant {
                    value: Constant::Str(key),
                    ..
                }) = slice.as_ref()
                {
                    self.record_dunder(key);
                }
                self.visit_expr(slice);
            }
            Expr::Slice(ast::ExprSlice {
                lower, upper, step, ..
            }) => {
                self.visit_optional(lower);
                self.visit_optional(upper);
                self.visit_optional(step);
            }
            _ => {}
        }
    }

    fn record_dunder(&mut self, name: &str) {
        if name.len() > 4 && name.starts_with("__") && name.ends_with("__") {
            self.tree.dunder_references.push(name.to_string());
        }
    }

    fn record_call(&mut self, func: &Expr, args: &[Expr]) {
        let callee = match func {
            Expr::Name(ast::ExprName { id, .. }) => Callee::Name(id.as_str().to_string()),
            Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                let (root, prefix) = dotted_prefix(value);
                let attr = attr.as_str().to_string();
                let path = match prefix {
                    Some(prefix) => format!("{}.{}", prefix, attr),
                    None => attr.clone(),
                };
                Callee::Attribute { root, path, attr }
            }
            _ => return,
        };

        if callee == Callee::Name("range".to_string()) {
            let largest = args.iter().filter_map(integer_literal).max();
            if let Some(value) = largest {
                let current = self.tree.largest_range_literal.unwrap_or(0);
                self.tree.largest_range_literal = Some(current.max(value));
            }
        }

        self.tree.calls.push(CallSite { callee });
    }
}

/// Resolves the receiver of an attribute call to its root name and dotted
/// path, when the receiver is a plain `a.b.c` chain.
fn dotted_prefix(expr: &Expr) -> (Option<String>, Option<String>) {
    match expr {
        Expr::Name(ast::ExprName { id, .. }) => {
            let name = id.as_str().to_string();
            (Some(name.clone()), Some(name))
        }
        Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
            let (root, prefix) = dotted_prefix(value);
            let path = prefix.map(|prefix| format!("{}.{}", prefix, attr.as_str()));
            (root, path)
        }
        _ => (None, None),
    }
}

fn integer_literal(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Constant(ast::ExprConstant {
            value: Constant::Int(value),
            ..
        }) => value.to_string().parse().ok(),
        _ => None,
    }
}
