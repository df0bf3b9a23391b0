use std::collections::HashMap;

use crate::ast::*;

#[derive(Debug, thiserror::Error)]
pub enum SemanticError {
    #[error("assignment to undeclared name '{0}' in strict mode")]
    UndeclaredAssignment(String),
    #[error("assignment to constant '{0}'")]
    ConstAssignment(String),
    #[error("duplicate declaration of '{0}' in the same scope")]
    Duplicate(String),
}

type Result<T> = std::result::Result<T, SemanticError>;

/// Scope resolution over a parsed chunk. Rewrites the AST in place:
/// assigns function and block ids, classifies every identifier
/// (`VarScope`), records per-block captured-name lists, and flags
/// functions that capture.
///
/// Runs in two passes over the same tree. The first discovers captures
/// (a use may be classified before a later closure captures the same
/// binding); the second classifies with the full capture sets known.
pub fn analyze(chunk: &mut Chunk, closure_fix: bool, strict: bool) -> Result<()> {
    for final_pass in [false, true] {
        let mut resolver = Resolver {
            closure_fix,
            strict,
            final_pass,
            scopes: Vec::new(),
            function_captures: vec![false],
            next_function_id: 1,
            next_block_id: 1,
        };
        resolver.push_scope(true, 0);
        resolver.hoist(&chunk.body)?;
        for stmt in &mut chunk.body {
            resolver.visit_stmt(stmt)?;
        }
        resolver.pop_scope();
    }
    Ok(())
}

struct Scope {
    /// Function nesting depth this scope belongs to (root chunk is 0).
    function_index: usize,
    /// True for a function body scope (params and `var`s land here).
    is_function_root: bool,
    block_id: u32,
    names: HashMap<String, DeclKind>,
    /// Block-scoped names captured by an inner function, in slot order.
    captured: Vec<String>,
}

struct Resolver {
    closure_fix: bool,
    strict: bool,
    final_pass: bool,
    scopes: Vec<Scope>,
    function_captures: Vec<bool>,
    next_function_id: u32,
    next_block_id: u32,
}

impl Resolver {
    fn push_scope(&mut self, is_function_root: bool, block_id: u32) {
        let function_index = self.function_captures.len() - 1;
        self.scopes.push(Scope {
            function_index,
            is_function_root,
            block_id,
            names: HashMap::new(),
            captured: Vec::new(),
        });
    }

    fn pop_scope(&mut self) -> Scope {
        self.scopes.pop().unwrap()
    }

    fn declare(&mut self, name: &str, kind: DeclKind) -> Result<()> {
        // `var` is function-scoped: it declares in the nearest function root
        let idx = match kind {
            DeclKind::Var => self
                .scopes
                .iter()
                .rposition(|s| s.is_function_root)
                .unwrap(),
            _ => self.scopes.len() - 1,
        };
        let scope = &mut self.scopes[idx];
        if scope.names.contains_key(name) && kind != DeclKind::Var {
            return Err(SemanticError::Duplicate(name.to_string()));
        }
        scope.names.entry(name.to_string()).or_insert(kind);
        Ok(())
    }

    /// Resolve a name against the scope stack; classify the use and record
    /// the capture when it crosses a function boundary.
    fn resolve(&mut self, name: &str) -> VarScope {
        let current_function = self.function_captures.len() - 1;
        for idx in (0..self.scopes.len()).rev() {
            if !self.scopes[idx].names.contains_key(name) {
                continue;
            }
            let defining_function = self.scopes[idx].function_index;
            let crosses = defining_function < current_function;
            if crosses {
                for f in (defining_function + 1)..=current_function {
                    self.function_captures[f] = true;
                }
            }
            let block_capturable = self.closure_fix && !self.scopes[idx].is_function_root;
            if block_capturable && crosses && !self.scopes[idx].captured.iter().any(|n| n == name)
            {
                self.scopes[idx].captured.push(name.to_string());
            }
            if block_capturable && self.scopes[idx].captured.iter().any(|n| n == name) {
                return VarScope::UpvalueNew;
            }
            if crosses {
                return VarScope::Upvalue;
            }
            return VarScope::Local;
        }
        VarScope::Global
    }

    fn decl_kind_of(&self, name: &str) -> Option<DeclKind> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.names.get(name).copied())
    }

    /// Function declarations and `var` names are visible before their
    /// statement executes.
    fn hoist(&mut self, body: &[Stmt]) -> Result<()> {
        for stmt in body {
            match &stmt.node {
                StmtKind::FunctionDecl { name, .. } => self.declare(name, DeclKind::Var)?,
                StmtKind::VarDecl {
                    kind: DeclKind::Var,
                    decls,
                } => {
                    for d in decls {
                        self.declare(&d.name, DeclKind::Var)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn visit_block(&mut self, block: &mut Block) -> Result<()> {
        if !self.final_pass {
            block.id = self.next_block_id;
            self.next_block_id += 1;
        }
        self.push_scope(false, block.id);
        if self.final_pass {
            // seed pass-one capture results so same-function uses classify
            // as context accesses too
            let captured = std::mem::take(&mut block.context_slots);
            self.scopes.last_mut().unwrap().captured = captured;
        }
        self.visit_block_body(block)
    }

    fn visit_block_body(&mut self, block: &mut Block) -> Result<()> {
        self.hoist(&block.body)?;
        for stmt in &mut block.body {
            self.visit_stmt(stmt)?;
        }
        let scope = self.pop_scope();
        block.context_slots = scope.captured;
        Ok(())
    }

    fn visit_function(&mut self, func: &mut FunctionLit) -> Result<()> {
        if !self.final_pass {
            func.id = self.next_function_id;
            self.next_function_id += 1;
        } else {
            // ids were assigned in pass one; keep the counters in step
            self.next_function_id += 1;
        }
        self.function_captures.push(false);
        self.push_scope(true, func.body.id);
        for param in &func.params {
            self.declare(param, DeclKind::Var)?;
        }
        self.hoist(&func.body.body)?;
        for stmt in &mut func.body.body {
            self.visit_stmt(stmt)?;
        }
        let scope = self.pop_scope();
        // a function root scope never spills to a context array; its
        // captured names bind as register upvalues at CLOSURE
        debug_assert!(scope.captured.is_empty());
        func.captures = self.function_captures.pop().unwrap();
        Ok(())
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt) -> Result<()> {
        match &mut stmt.node {
            StmtKind::Expr(e) => self.visit_expr(e),
            StmtKind::VarDecl { kind, decls } => {
                let kind = *kind;
                for d in decls {
                    if let Some(init) = &mut d.init {
                        self.visit_expr(init)?;
                    }
                    self.declare(&d.name, kind)?;
                }
                Ok(())
            }
            StmtKind::FunctionDecl { func, .. } => self.visit_function(func),
            StmtKind::Block(block) => self.visit_block(block),
            StmtKind::If { cond, then, alt } => {
                self.visit_expr(cond)?;
                self.visit_stmt(then)?;
                if let Some(alt) = alt {
                    self.visit_stmt(alt)?;
                }
                Ok(())
            }
            StmtKind::While { cond, body } => {
                self.visit_expr(cond)?;
                self.visit_stmt(body)
            }
            StmtKind::DoWhile { body, cond } => {
                self.visit_stmt(body)?;
                self.visit_expr(cond)
            }
            StmtKind::For {
                init,
                cond,
                update,
                body,
            } => {
                // the loop header introduces its own scope; `let` names
                // declared there live in the body block's context so each
                // closure mode can do the right thing per iteration
                let StmtKind::Block(block) = &mut body.node else {
                    unreachable!("loop bodies are normalized to blocks");
                };
                if !self.final_pass {
                    block.id = self.next_block_id;
                    self.next_block_id += 1;
                }
                self.push_scope(false, block.id);
                if self.final_pass {
                    let captured = std::mem::take(&mut block.context_slots);
                    self.scopes.last_mut().unwrap().captured = captured;
                }
                if let Some(init) = init {
                    self.visit_stmt(init)?;
                }
                if let Some(cond) = cond {
                    self.visit_expr(cond)?;
                }
                if let Some(update) = update {
                    self.visit_expr(update)?;
                }
                self.visit_block_body(block)
            }
            StmtKind::Switch { scrutinee, cases } => {
                self.visit_expr(scrutinee)?;
                for case in cases {
                    if let Some(test) = &mut case.test {
                        self.visit_expr(test)?;
                    }
                    for stmt in &mut case.body {
                        self.visit_stmt(stmt)?;
                    }
                }
                Ok(())
            }
            StmtKind::Break | StmtKind::Continue => Ok(()),
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
                Ok(())
            }
            StmtKind::Throw(value) => self.visit_expr(value),
            StmtKind::Try {
                body,
                catch,
                finally,
            } => {
                self.visit_block(body)?;
                if let Some(catch) = catch {
                    if !self.final_pass {
                        catch.body.id = self.next_block_id;
                        self.next_block_id += 1;
                    }
                    self.push_scope(false, catch.body.id);
                    if self.final_pass {
                        let captured = std::mem::take(&mut catch.body.context_slots);
                        self.scopes.last_mut().unwrap().captured = captured;
                    }
                    if let Some(param) = &catch.param {
                        self.declare(&param.clone(), DeclKind::Let)?;
                    }
                    self.visit_block_body(&mut catch.body)?;
                }
                if let Some(finally) = finally {
                    self.visit_block(finally)?;
                }
                Ok(())
            }
        }
    }

    fn visit_expr(&mut self, expr: &mut Expr) -> Result<()> {
        match &mut expr.node {
            ExprKind::Ident { name, scope } => {
                *scope = self.resolve(&name.clone());
                Ok(())
            }
            ExprKind::Number(_)
            | ExprKind::Str(_)
            | ExprKind::Bool(_)
            | ExprKind::Null
            | ExprKind::Undefined
            | ExprKind::Regex { .. } => Ok(()),
            ExprKind::Array(items) => {
                for item in items {
                    self.visit_expr(item)?;
                }
                Ok(())
            }
            ExprKind::Object(props) => {
                for (_, value) in props {
                    self.visit_expr(value)?;
                }
                Ok(())
            }
            ExprKind::Function(func) => self.visit_function(func),
            ExprKind::Unary { operand, .. } => self.visit_expr(operand),
            ExprKind::Update { target, .. } => {
                self.check_write_target(target)?;
                self.visit_expr(target)
            }
            ExprKind::Binary { left, right, .. } => {
                self.visit_expr(left)?;
                self.visit_expr(right)
            }
            ExprKind::Assign { target, value, .. } => {
                self.check_write_target(target)?;
                self.visit_expr(value)?;
                self.visit_expr(target)
            }
            ExprKind::Conditional { cond, then, alt } => {
                self.visit_expr(cond)?;
                self.visit_expr(then)?;
                self.visit_expr(alt)
            }
            ExprKind::Member {
                object, property, ..
            } => {
                self.visit_expr(object)?;
                if matches!(
                    property.node,
                    ExprKind::Str(_) | ExprKind::Number(_)
                ) {
                    return Ok(());
                }
                self.visit_expr(property)
            }
            ExprKind::Call { callee, args, .. } => {
                self.visit_expr(callee)?;
                for arg in args {
                    self.visit_expr(arg)?;
                }
                Ok(())
            }
        }
    }

    fn check_write_target(&mut self, target: &Expr) -> Result<()> {
        let ExprKind::Ident { name, .. } = &target.node else {
            return Ok(());
        };
        match self.decl_kind_of(name) {
            Some(DeclKind::Const) => Err(SemanticError::ConstAssignment(name.clone())),
            Some(_) => Ok(()),
            None if self.strict => Err(SemanticError::UndeclaredAssignment(name.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn analyzed(src: &str, closure_fix: bool) -> Chunk {
        let mut chunk = parser::parse(src, "test").unwrap();
        analyze(&mut chunk, closure_fix, false).unwrap();
        chunk
    }

    fn find_ident<'a>(expr: &'a ExprKind, wanted: &str) -> Option<VarScope> {
        match expr {
            ExprKind::Ident { name, scope } if name == wanted => Some(*scope),
            ExprKind::Binary { left, right, .. } => {
                find_ident(&left.node, wanted).or_else(|| find_ident(&right.node, wanted))
            }
            ExprKind::Call { callee, args, .. } => find_ident(&callee.node, wanted)
                .or_else(|| args.iter().find_map(|a| find_ident(&a.node, wanted))),
            ExprKind::Member { object, .. } => find_ident(&object.node, wanted),
            _ => None,
        }
    }

    #[test]
    fn locals_and_globals_classify() {
        let chunk = analyzed("let a = 1; a + b;", true);
        match &chunk.body[1].node {
            StmtKind::Expr(e) => {
                assert_eq!(find_ident(&e.node, "a"), Some(VarScope::Local));
                assert_eq!(find_ident(&e.node, "b"), Some(VarScope::Global));
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn function_ids_start_at_one() {
        let chunk = analyzed("function f() {} var g = function () {};", true);
        match &chunk.body[0].node {
            StmtKind::FunctionDecl { func, .. } => assert_eq!(func.id, 1),
            other => panic!("unexpected stmt: {:?}", other),
        }
        match &chunk.body[1].node {
            StmtKind::VarDecl { decls, .. } => match &decls[0].init.as_ref().unwrap().node {
                ExprKind::Function(func) => assert_eq!(func.id, 2),
                other => panic!("unexpected init: {:?}", other),
            },
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn capture_marks_function_and_block() {
        let src = "function outer() { let x = 1; { let y = 2; var f = function () { return y; }; } }";
        let chunk = analyzed(src, true);
        let StmtKind::FunctionDecl { func: outer, .. } = &chunk.body[0].node else {
            panic!();
        };
        let StmtKind::Block(inner) = &outer.body.body[1].node else {
            panic!("expected inner block, got {:?}", outer.body.body[1].node);
        };
        assert_eq!(inner.context_slots, vec!["y".to_string()]);
        let StmtKind::VarDecl { decls, .. } = &inner.body[1].node else {
            panic!();
        };
        let ExprKind::Function(closure) = &decls[0].init.as_ref().unwrap().node else {
            panic!();
        };
        assert!(closure.captures);
        assert!(!outer.captures);
    }

    #[test]
    fn legacy_mode_uses_register_upvalues() {
        let src = "function outer() { let y = 2; return function () { return y; }; }";
        let chunk = analyzed(src, false);
        let StmtKind::FunctionDecl { func: outer, .. } = &chunk.body[0].node else {
            panic!();
        };
        let StmtKind::Return(Some(ret)) = &outer.body.body[1].node else {
            panic!();
        };
        let ExprKind::Function(inner) = &ret.node else {
            panic!();
        };
        let StmtKind::Return(Some(y)) = &inner.body.body[0].node else {
            panic!();
        };
        assert!(matches!(
            y.node,
            ExprKind::Ident {
                scope: VarScope::Upvalue,
                ..
            }
        ));
    }

    #[test]
    fn same_function_use_of_captured_let_goes_through_context() {
        let src = "{ let y = 1; y = 2; var f = function () { return y; }; }";
        let chunk = analyzed(src, true);
        let StmtKind::Block(block) = &chunk.body[0].node else {
            panic!();
        };
        assert_eq!(block.context_slots, vec!["y".to_string()]);
        let StmtKind::Expr(assign) = &block.body[1].node else {
            panic!();
        };
        let ExprKind::Assign { target, .. } = &assign.node else {
            panic!();
        };
        assert!(matches!(
            target.node,
            ExprKind::Ident {
                scope: VarScope::UpvalueNew,
                ..
            }
        ));
    }

    #[test]
    fn const_assignment_is_rejected() {
        let mut chunk = parser::parse("const c = 1; c = 2;", "t").unwrap();
        let err = analyze(&mut chunk, true, false).unwrap_err();
        assert!(matches!(err, SemanticError::ConstAssignment(_)));
    }

    #[test]
    fn strict_mode_rejects_undeclared_writes() {
        let mut chunk = parser::parse("ghost = 1;", "t").unwrap();
        assert!(analyze(&mut chunk, true, true).is_err());
        let mut chunk = parser::parse("ghost = 1;", "t").unwrap();
        assert!(analyze(&mut chunk, true, false).is_ok());
    }

    #[test]
    fn var_hoists_to_function_scope() {
        let chunk = analyzed("function f() { g(); function g() {} } f();", true);
        let StmtKind::FunctionDecl { func, .. } = &chunk.body[0].node else {
            panic!();
        };
        let StmtKind::Expr(call) = &func.body.body[0].node else {
            panic!();
        };
        assert_eq!(find_ident(&call.node, "g"), Some(VarScope::Local));
    }
}
