use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::*;
use crate::bytecode::{
    CompileOptions, Function, Instruction, OpCode, SwitchInfo, SwitchKeyType, SwitchType,
    UpvalueInfo, encode_line_col, fnv1a64,
};
use crate::value::Value;

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("function needs more than 255 registers")]
    TooManyRegisters,
    #[error("jump distance exceeds 16 bits")]
    JumpTooFar,
    #[error("'break' outside of a loop or switch")]
    BreakOutsideLoop,
    #[error("'continue' outside of a loop")]
    ContinueOutsideLoop,
    #[error("unresolved name '{0}'")]
    Unresolved(String),
    #[error("too many nested functions")]
    TooManyChildren,
}

type Result<T> = std::result::Result<T, CodegenError>;

/// A compiled chunk plus the metadata the host needs to install it.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    pub root: Rc<Function>,
    /// Top-level `var`/`function` bindings, name to root-frame register.
    pub top_level: Vec<(Rc<str>, u32)>,
    pub closure_fix: bool,
    pub target_sdk_version: String,
    pub source_name: String,
}

pub fn compile_chunk(
    chunk: &Chunk,
    source: &str,
    options: &CompileOptions,
) -> Result<CompiledScript> {
    let mut compiler = Compiler {
        options,
        map: SourceMap::new(source),
        funcs: Vec::new(),
        context_chain: Vec::new(),
        top_level: Vec::new(),
    };
    compiler.push_func(None, 0, &[]);
    compiler.hoist_var_slots(&chunk.body)?;
    compiler.hoist_functions(&chunk.body)?;
    let mut last_value: Option<u8> = None;
    for stmt in &chunk.body {
        last_value = compiler.emit_stmt(stmt)?;
    }
    // a script evaluates to its final expression statement
    match last_value {
        Some(reg) => compiler.emit(
            Instruction::abc(OpCode::Ret, reg, 1, 0),
            Span::UNKNOWN,
        ),
        None => compiler.emit(Instruction::abc(OpCode::Ret, 0, 0, 0), Span::UNKNOWN),
    };
    let state = compiler.funcs.pop().unwrap();
    let mut root = state.func;
    root.register_count = state.max_reg as u32;
    Ok(CompiledScript {
        root: Rc::new(root),
        top_level: compiler.top_level,
        closure_fix: options.closure_fix,
        target_sdk_version: options.target_sdk_version.clone(),
        source_name: options.source_name.clone(),
    })
}

/// One block-context layer in the lexical chain. Layers are shared across
/// nested function compilation because closures link to their creation
/// context through slot 0.
struct ContextLayer {
    function_index: usize,
    slots: Vec<String>,
}

struct ScopeInfo {
    names: HashMap<String, u8>,
    reg_mark: u16,
    has_context: bool,
}

struct LoopCtx {
    breaks: Vec<usize>,
    /// `None` marks a switch (breakable but not continuable).
    continues: Option<Vec<usize>>,
    continue_target: usize,
    context_depth: usize,
    try_depth: usize,
}

struct TryCtx {
    finally: Option<Block>,
    /// Catch-handler pushes active at the current emission point.
    pushes_active: u8,
}

struct FuncState {
    func: Function,
    scopes: Vec<ScopeInfo>,
    next_reg: u16,
    max_reg: u16,
    loops: Vec<LoopCtx>,
    trys: Vec<TryCtx>,
    /// Block contexts pushed by this function, counted for unwind depth.
    context_depth: usize,
}

struct Compiler<'a> {
    options: &'a CompileOptions,
    map: SourceMap,
    funcs: Vec<FuncState>,
    context_chain: Vec<ContextLayer>,
    top_level: Vec<(Rc<str>, u32)>,
}

impl<'a> Compiler<'a> {
    fn push_func(&mut self, name: Option<Rc<str>>, id: u32, params: &[String]) {
        let mut func = Function::new(name, id);
        func.param_count = params.len() as u32;
        let mut root = ScopeInfo {
            names: HashMap::new(),
            reg_mark: 0,
            has_context: false,
        };
        for (i, p) in params.iter().enumerate() {
            root.names.insert(p.clone(), i as u8);
        }
        self.funcs.push(FuncState {
            func,
            scopes: vec![root],
            next_reg: params.len() as u16,
            max_reg: params.len() as u16,
            loops: Vec::new(),
            trys: Vec::new(),
            context_depth: 0,
        });
    }

    fn cur(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    fn alloc_reg(&mut self) -> Result<u8> {
        let state = self.cur();
        if state.next_reg >= 256 {
            return Err(CodegenError::TooManyRegisters);
        }
        let r = state.next_reg as u8;
        state.next_reg += 1;
        if state.next_reg > state.max_reg {
            state.max_reg = state.next_reg;
        }
        Ok(r)
    }

    fn reg_mark(&mut self) -> u16 {
        self.cur().next_reg
    }

    fn reset_regs(&mut self, mark: u16) {
        self.cur().next_reg = mark;
    }

    fn emit(&mut self, instr: Instruction, span: Span) -> usize {
        let (line, col) = self.map.lookup(span.start);
        let legacy = !self.options.wide_line_col();
        let state = self.cur();
        let pc = state.func.code.len();
        state.func.code.push(instr);
        state.func.line_col.push(encode_line_col(line, col, legacy));
        pc
    }

    /// Emit a jump with an unknown target; the returned pc is patched later.
    fn emit_jump(&mut self, op: OpCode, a: u8, span: Span) -> usize {
        self.emit(Instruction::asbx(op, a, 0), span)
    }

    fn patch_jump(&mut self, jump_pc: usize) -> Result<()> {
        let target = self.cur().func.code.len();
        self.patch_jump_to(jump_pc, target)
    }

    fn patch_jump_to(&mut self, jump_pc: usize, target: usize) -> Result<()> {
        let offset = target as i64 - jump_pc as i64 - 1;
        if offset > i16::MAX as i64 || offset < i16::MIN as i64 {
            return Err(CodegenError::JumpTooFar);
        }
        self.cur().func.code[jump_pc].set_sbx(offset as i16);
        Ok(())
    }

    fn here(&mut self) -> usize {
        self.cur().func.code.len()
    }

    fn jump_back(&mut self, op: OpCode, a: u8, target: usize, span: Span) -> Result<()> {
        let pc = self.here();
        let offset = target as i64 - pc as i64 - 1;
        if offset < i16::MIN as i64 {
            return Err(CodegenError::JumpTooFar);
        }
        self.emit(Instruction::asbx(op, a, offset as i16), span);
        Ok(())
    }

    fn add_const(&mut self, value: Value) -> u16 {
        self.cur().func.add_const_value(value)
    }

    fn load_const(&mut self, value: Value, span: Span) -> Result<u8> {
        let k = self.add_const(value);
        let dest = self.alloc_reg()?;
        self.emit(Instruction::abx(OpCode::LoadConst, dest, k), span);
        Ok(dest)
    }

    // ---- name resolution ----

    fn lookup_local(&self, func_index: usize, name: &str) -> Option<u8> {
        self.funcs[func_index]
            .scopes
            .iter()
            .rev()
            .find_map(|s| s.names.get(name).copied())
    }

    /// Find (hops, slot) for a context-resident name, walking the lexical
    /// chain from the innermost layer out.
    fn lookup_context(&self, name: &str) -> Option<(u8, u8)> {
        for (idx, layer) in self.context_chain.iter().enumerate().rev() {
            if let Some(slot) = layer.slots.iter().position(|s| s == name) {
                let hops = self.context_chain.len() - 1 - idx;
                return Some((hops as u8, slot as u8 + 1));
            }
        }
        None
    }

    /// Thread an upvalue for `name` down to function `fi`, adding
    /// pass-through descriptors to intermediate functions as needed.
    fn ensure_upvalue(&mut self, fi: usize, name: &str) -> Option<u16> {
        if let Some(i) = self.funcs[fi]
            .func
            .upvalues
            .iter()
            .position(|u| &*u.name == name)
        {
            return Some(i as u16);
        }
        if fi == 0 {
            return None;
        }
        let parent = fi - 1;
        if let Some(reg) = self.lookup_local(parent, name) {
            let idx = self.funcs[fi].func.upvalues.len() as u16;
            self.funcs[fi].func.upvalues.push(UpvalueInfo {
                name: Rc::from(name),
                register: reg as u32,
                in_parent_vars: true,
            });
            return Some(idx);
        }
        let parent_idx = self.ensure_upvalue(parent, name)?;
        let idx = self.funcs[fi].func.upvalues.len() as u16;
        self.funcs[fi].func.upvalues.push(UpvalueInfo {
            name: Rc::from(name),
            register: parent_idx as u32,
            in_parent_vars: false,
        });
        Some(idx)
    }

    // ---- declarations ----

    fn current_block_context_slot(&self, name: &str) -> Option<u8> {
        let chain_top = self.context_chain.last()?;
        if chain_top.function_index != self.funcs.len() - 1 {
            return None;
        }
        if !self.cur_ref().scopes.last().unwrap().has_context {
            return None;
        }
        chain_top
            .slots
            .iter()
            .position(|s| s == name)
            .map(|i| i as u8 + 1)
    }

    fn cur_ref(&self) -> &FuncState {
        self.funcs.last().unwrap()
    }

    /// Bind a declared name. Hoisted names (`var`, function declarations)
    /// write into the function-root register reserved up front; block-scoped
    /// names take a context slot when the block spilled them there, a fresh
    /// register otherwise.
    fn declare(&mut self, name: &str, span: Span, value_reg: u8, hoisted: bool) -> Result<()> {
        if hoisted {
            let reg = self
                .cur_ref()
                .scopes[0]
                .names
                .get(name)
                .copied()
                .ok_or_else(|| CodegenError::Unresolved(name.to_string()))?;
            if reg != value_reg {
                self.emit(Instruction::abc(OpCode::Move, reg, value_reg, 0), span);
            }
            return Ok(());
        }
        if let Some(slot) = self.current_block_context_slot(name) {
            self.emit(
                Instruction::abc(OpCode::SetContextSlot, value_reg, 0, slot),
                span,
            );
            return Ok(());
        }
        let reg = self.alloc_reg()?;
        if reg != value_reg {
            self.emit(Instruction::abc(OpCode::Move, reg, value_reg, 0), span);
        }
        self.cur()
            .scopes
            .last_mut()
            .unwrap()
            .names
            .insert(name.to_string(), reg);
        if self.funcs.len() == 1 && self.cur_ref().scopes.len() == 1 {
            let name: Rc<str> = Rc::from(name);
            if !self.top_level.iter().any(|(n, _)| *n == name) {
                self.top_level.push((name, reg as u32));
            }
        }
        Ok(())
    }

    /// Reserve function-root registers for every `var` and function
    /// declaration in the body, nested blocks included, so block-nested
    /// declarations stay addressable after their block exits.
    fn hoist_var_slots(&mut self, stmts: &[Stmt]) -> Result<()> {
        let mut names = Vec::new();
        collect_hoisted(stmts, &mut names);
        for name in names {
            if self.cur_ref().scopes[0].names.contains_key(&name) {
                continue;
            }
            let reg = self.alloc_reg()?;
            self.cur().scopes[0].names.insert(name.clone(), reg);
            if self.funcs.len() == 1 {
                let rc: Rc<str> = Rc::from(name.as_str());
                if !self.top_level.iter().any(|(n, _)| *n == rc) {
                    self.top_level.push((rc, reg as u32));
                }
            }
        }
        Ok(())
    }

    // ---- statements ----

    /// Function declarations are hoisted: their closures are materialized at
    /// block entry so earlier statements can call them.
    fn hoist_functions(&mut self, body: &[Stmt]) -> Result<()> {
        for stmt in body {
            if let StmtKind::FunctionDecl { name, func } = &stmt.node {
                let mark = self.reg_mark();
                let closure_reg = self.emit_closure(func, stmt.span)?;
                self.reset_regs(mark);
                self.declare(name, stmt.span, closure_reg, true)?;
            }
        }
        Ok(())
    }

    /// Returns the register of the statement's value when it was an
    /// expression statement (scripts surface their last expression).
    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<Option<u8>> {
        match &stmt.node {
            StmtKind::Expr(e) => {
                let mark = self.reg_mark();
                let reg = self.emit_expr(e)?;
                // the register is freed but its value survives until the
                // next write, which is enough for the chunk-result Ret
                self.reset_regs(mark);
                Ok(Some(reg))
            }
            StmtKind::VarDecl { kind, decls } => {
                let hoisted = *kind == DeclKind::Var;
                for d in decls {
                    let mark = self.reg_mark();
                    let value = match &d.init {
                        Some(init) => self.emit_expr(init)?,
                        None => {
                            let r = self.alloc_reg()?;
                            self.emit(Instruction::abc(OpCode::LoadNil, r, 1, 0), stmt.span);
                            r
                        }
                    };
                    self.reset_regs(mark);
                    self.declare(&d.name, stmt.span, value, hoisted)?;
                }
                Ok(None)
            }
            StmtKind::FunctionDecl { .. } => Ok(None), // emitted by hoisting
            StmtKind::Block(block) => {
                self.emit_block(block, stmt.span)?;
                Ok(None)
            }
            StmtKind::If { cond, then, alt } => {
                let mark = self.reg_mark();
                let c = self.emit_expr(cond)?;
                let jump_else = self.emit_jump(OpCode::JmpFalse, c, cond.span);
                self.reset_regs(mark);
                self.emit_stmt(then)?;
                match alt {
                    Some(alt) => {
                        let jump_end = self.emit_jump(OpCode::Jmp, 0, stmt.span);
                        self.patch_jump(jump_else)?;
                        self.emit_stmt(alt)?;
                        self.patch_jump(jump_end)?;
                    }
                    None => self.patch_jump(jump_else)?,
                }
                Ok(None)
            }
            StmtKind::While { cond, body } => {
                let top = self.here();
                let mark = self.reg_mark();
                let c = self.emit_expr(cond)?;
                let exit = self.emit_jump(OpCode::JmpFalse, c, cond.span);
                self.reset_regs(mark);
                self.push_loop(top);
                self.emit_stmt(body)?;
                self.jump_back(OpCode::Jmp, 0, top, stmt.span)?;
                self.patch_jump(exit)?;
                self.finish_loop(top)?;
                Ok(None)
            }
            StmtKind::DoWhile { body, cond } => {
                let top = self.here();
                // continue re-tests the condition
                self.push_loop(usize::MAX);
                self.emit_stmt(body)?;
                let cond_pc = self.here();
                let mark = self.reg_mark();
                let c = self.emit_expr(cond)?;
                self.jump_back(OpCode::JmpTrue, c, top, cond.span)?;
                self.reset_regs(mark);
                self.finish_loop(cond_pc)?;
                Ok(None)
            }
            StmtKind::For {
                init,
                cond,
                update,
                body,
            } => self.emit_for(init, cond, update, body, stmt.span).map(|()| None),
            StmtKind::Switch { scrutinee, cases } => {
                self.emit_switch(scrutinee, cases, stmt.span).map(|()| None)
            }
            StmtKind::Break => {
                let Some(loop_idx) = self.cur_ref().loops.len().checked_sub(1) else {
                    return Err(CodegenError::BreakOutsideLoop);
                };
                self.emit_scope_exit(loop_idx)?;
                let pc = self.emit_jump(OpCode::Jmp, 0, stmt.span);
                self.cur().loops[loop_idx].breaks.push(pc);
                Ok(None)
            }
            StmtKind::Continue => {
                let Some(loop_idx) = self
                    .cur_ref()
                    .loops
                    .iter()
                    .rposition(|l| l.continues.is_some())
                else {
                    return Err(CodegenError::ContinueOutsideLoop);
                };
                self.emit_scope_exit(loop_idx)?;
                let pc = self.emit_jump(OpCode::Jmp, 0, stmt.span);
                self.cur().loops[loop_idx]
                    .continues
                    .as_mut()
                    .unwrap()
                    .push(pc);
                Ok(None)
            }
            StmtKind::Return(value) => {
                let mark = self.reg_mark();
                let reg = match value {
                    Some(v) => Some(self.emit_expr(v)?),
                    None => None,
                };
                self.emit_pending_finallies(0, stmt.span)?;
                match reg {
                    Some(r) => self.emit(Instruction::abc(OpCode::Ret, r, 1, 0), stmt.span),
                    None => self.emit(Instruction::abc(OpCode::Ret, 0, 0, 0), stmt.span),
                };
                self.reset_regs(mark);
                Ok(None)
            }
            StmtKind::Throw(value) => {
                let mark = self.reg_mark();
                let r = self.emit_expr(value)?;
                self.emit(Instruction::abc(OpCode::Throw, r, 0, 0), stmt.span);
                self.reset_regs(mark);
                Ok(None)
            }
            StmtKind::Try {
                body,
                catch,
                finally,
            } => self.emit_try(body, catch, finally, stmt.span).map(|()| None),
        }
    }

    fn push_loop(&mut self, continue_target: usize) {
        let context_depth = self.cur_ref().context_depth;
        let try_depth = self.cur_ref().trys.len();
        self.cur().loops.push(LoopCtx {
            breaks: Vec::new(),
            continues: Some(Vec::new()),
            continue_target,
            context_depth,
            try_depth,
        });
    }

    /// Patch breaks to the current pc and continues to their target.
    fn finish_loop(&mut self, continue_target: usize) -> Result<()> {
        let ctx = self.cur().loops.pop().unwrap();
        for pc in ctx.breaks {
            self.patch_jump(pc)?;
        }
        if let Some(continues) = ctx.continues {
            for pc in continues {
                self.patch_jump_to(pc, continue_target)?;
            }
        }
        Ok(())
    }

    /// `break`/`continue` crossing block contexts and try regions must pop
    /// contexts and run pending finallies on the way out.
    fn emit_scope_exit(&mut self, loop_idx: usize) -> Result<()> {
        let target_try = self.cur_ref().loops[loop_idx].try_depth;
        let target_ctx = self.cur_ref().loops[loop_idx].context_depth;
        self.emit_pending_finallies(target_try, Span::UNKNOWN)?;
        let pops = self.cur_ref().context_depth - target_ctx;
        for _ in 0..pops {
            self.emit(Instruction::abc(OpCode::LeaveBlock, 0, 0, 0), Span::UNKNOWN);
        }
        Ok(())
    }

    /// Inline the finally bodies of every try deeper than `down_to`, popping
    /// their active catch handlers first. Restores the try stack afterwards
    /// so normal fallthrough still lays the real finally out.
    fn emit_pending_finallies(&mut self, down_to: usize, span: Span) -> Result<()> {
        let mut saved = Vec::new();
        while self.cur_ref().trys.len() > down_to {
            let ctx = self.cur().trys.pop().unwrap();
            for _ in 0..ctx.pushes_active {
                self.emit(Instruction::abc(OpCode::SetCatchId, 1, 0, 0), span);
            }
            if let Some(finally) = &ctx.finally {
                let clone = finally.clone();
                self.emit_block(&clone, span)?;
            }
            saved.push(ctx);
        }
        for ctx in saved.into_iter().rev() {
            self.cur().trys.push(ctx);
        }
        Ok(())
    }

    fn emit_block(&mut self, block: &Block, span: Span) -> Result<()> {
        self.enter_block(block, span)?;
        self.emit_block_body(block)?;
        self.leave_block(span);
        Ok(())
    }

    fn enter_block(&mut self, block: &Block, span: Span) -> Result<()> {
        let has_context = !block.context_slots.is_empty();
        let reg_mark = self.reg_mark();
        self.cur().scopes.push(ScopeInfo {
            names: HashMap::new(),
            reg_mark,
            has_context,
        });
        if has_context {
            self.emit(
                Instruction::abx(
                    OpCode::CreateBlockContext,
                    block.context_slots.len() as u8 + 1,
                    block.id as u16,
                ),
                span,
            );
            self.context_chain.push(ContextLayer {
                function_index: self.funcs.len() - 1,
                slots: block.context_slots.clone(),
            });
            self.cur().context_depth += 1;
        }
        Ok(())
    }

    fn leave_block(&mut self, span: Span) {
        let scope = self.cur().scopes.pop().unwrap();
        if scope.has_context {
            self.emit(Instruction::abc(OpCode::LeaveBlock, 0, 0, 0), span);
            self.context_chain.pop();
            self.cur().context_depth -= 1;
        }
        let mark = scope.reg_mark;
        self.reset_regs(mark);
    }

    fn emit_block_body(&mut self, block: &Block) -> Result<()> {
        self.hoist_functions(&block.body)?;
        for stmt in &block.body {
            self.emit_stmt(stmt)?;
        }
        Ok(())
    }

    fn emit_for(
        &mut self,
        init: &Option<Box<Stmt>>,
        cond: &Option<Expr>,
        update: &Option<Expr>,
        body: &Stmt,
        span: Span,
    ) -> Result<()> {
        let StmtKind::Block(block) = &body.node else {
            unreachable!("loop bodies are normalized to blocks");
        };
        // the loop scope (header declarations included) is the body block's
        // scope; per-iteration context rotation gives each iteration a
        // fresh binding for captured loop variables
        self.enter_block(block, span)?;
        if let Some(init) = init {
            self.emit_stmt(init)?;
        }
        let top = self.here();
        let exit = match cond {
            Some(cond) => {
                let mark = self.reg_mark();
                let c = self.emit_expr(cond)?;
                let exit = self.emit_jump(OpCode::JmpFalse, c, cond.span);
                self.reset_regs(mark);
                Some(exit)
            }
            None => None,
        };
        self.push_loop(usize::MAX);
        self.emit_block_body(block)?;
        let continue_target = self.here();
        if !block.context_slots.is_empty() {
            self.rotate_loop_context(block, span)?;
        }
        if let Some(update) = update {
            let mark = self.reg_mark();
            self.emit_expr(update)?;
            self.reset_regs(mark);
        }
        self.jump_back(OpCode::Jmp, 0, top, span)?;
        if let Some(exit) = exit {
            self.patch_jump(exit)?;
        }
        self.finish_loop(continue_target)?;
        self.leave_block(span);
        Ok(())
    }

    /// Copy the captured loop bindings into a fresh context so closures made
    /// in the finished iteration keep their own snapshot.
    fn rotate_loop_context(&mut self, block: &Block, span: Span) -> Result<()> {
        let mark = self.reg_mark();
        let mut tmps = Vec::new();
        for slot in 0..block.context_slots.len() as u8 {
            let tmp = self.alloc_reg()?;
            self.emit(
                Instruction::abc(OpCode::GetContextSlot, tmp, 0, slot + 1),
                span,
            );
            tmps.push(tmp);
        }
        self.emit(Instruction::abc(OpCode::LeaveBlock, 0, 0, 0), span);
        self.emit(
            Instruction::abx(
                OpCode::CreateBlockContext,
                block.context_slots.len() as u8 + 1,
                block.id as u16,
            ),
            span,
        );
        for (slot, tmp) in tmps.into_iter().enumerate() {
            self.emit(
                Instruction::abc(OpCode::SetContextSlot, tmp, 0, slot as u8 + 1),
                span,
            );
        }
        self.reset_regs(mark);
        Ok(())
    }

    fn emit_switch(&mut self, scrutinee: &Expr, cases: &[SwitchCase], span: Span) -> Result<()> {
        let mark = self.reg_mark();
        let s = self.emit_expr(scrutinee)?;
        let context_depth = self.cur_ref().context_depth;
        let try_depth = self.cur_ref().trys.len();
        self.cur().loops.push(LoopCtx {
            breaks: Vec::new(),
            continues: None,
            continue_target: 0,
            context_depth,
            try_depth,
        });

        // old targets cannot deserialize switch tables
        let keys = if self.options.switch_tables_in_codec() {
            switchable_keys(cases)
        } else {
            None
        };
        if let Some(keys) = keys {
            self.emit_table_switch(s, cases, keys, span)?;
        } else {
            self.emit_compare_switch(s, cases, span)?;
        }
        let exit = self.here();
        let ctx = self.cur().loops.pop().unwrap();
        for pc in ctx.breaks {
            self.patch_jump_to(pc, exit)?;
        }
        self.reset_regs(mark);
        Ok(())
    }

    fn emit_table_switch(
        &mut self,
        s: u8,
        cases: &[SwitchCase],
        keys: Vec<(usize, i64)>,
        span: Span,
    ) -> Result<()> {
        let key_type = if cases
            .iter()
            .any(|c| matches!(c.test.as_ref().map(|t| &t.node), Some(ExprKind::Str(_))))
        {
            SwitchKeyType::String
        } else {
            SwitchKeyType::Int
        };
        let table_index = self.cur_ref().func.switch_tables.len() as u16;
        let switch_pc = self.emit(Instruction::abx(OpCode::Switch, s, table_index), span);
        // placeholder; offsets land after the arms are laid out
        self.cur().func.switch_tables.push(SwitchInfo {
            switch_type: SwitchType::Lookup,
            key_type,
            default_offset: 0,
            min: 0,
            table: Vec::new(),
            lookup: Vec::new(),
        });
        let mut arm_pcs = Vec::with_capacity(cases.len());
        let mut default_pc = None;
        for case in cases {
            let pc = self.here();
            arm_pcs.push(pc);
            if case.test.is_none() {
                default_pc = Some(pc);
            }
            for stmt in &case.body {
                self.emit_stmt(stmt)?;
            }
        }
        let end = self.here();
        let default_offset = (default_pc.unwrap_or(end) as i64 - switch_pc as i64) as i32;

        let mut lookup: Vec<(i64, i32)> = keys
            .iter()
            .map(|(arm, key)| (*key, (arm_pcs[*arm] as i64 - switch_pc as i64) as i32))
            .collect();
        lookup.sort_by_key(|(k, _)| *k);

        let info = if key_type == SwitchKeyType::Int {
            let min = lookup.iter().map(|(k, _)| *k).min().unwrap_or(0);
            let max = lookup.iter().map(|(k, _)| *k).max().unwrap_or(0);
            let range = (max - min + 1) as usize;
            // dense enough ranges become a direct offset table
            if range <= lookup.len() * 2 && range <= 1024 {
                let mut table = vec![default_offset; range];
                for (k, off) in &lookup {
                    table[(k - min) as usize] = *off;
                }
                SwitchInfo {
                    switch_type: SwitchType::Table,
                    key_type,
                    default_offset,
                    min,
                    table,
                    lookup: Vec::new(),
                }
            } else {
                SwitchInfo {
                    switch_type: SwitchType::Lookup,
                    key_type,
                    default_offset,
                    min: 0,
                    table: Vec::new(),
                    lookup,
                }
            }
        } else {
            SwitchInfo {
                switch_type: SwitchType::Lookup,
                key_type,
                default_offset,
                min: 0,
                table: Vec::new(),
                lookup,
            }
        };
        self.cur().func.switch_tables[table_index as usize] = info;
        Ok(())
    }

    /// Non-constant cases fall back to a strict-equality chain with the
    /// usual fallthrough semantics.
    fn emit_compare_switch(&mut self, s: u8, cases: &[SwitchCase], span: Span) -> Result<()> {
        let mut arm_jumps = Vec::new();
        let mut default_jump = None;
        for (i, case) in cases.iter().enumerate() {
            if let Some(test) = &case.test {
                let mark = self.reg_mark();
                let t = self.emit_expr(test)?;
                let cmp = self.alloc_reg()?;
                self.emit(Instruction::abc(OpCode::AbsEqual, cmp, s, t), test.span);
                let pc = self.emit_jump(OpCode::JmpTrue, cmp, test.span);
                arm_jumps.push((i, pc));
                self.reset_regs(mark);
            }
        }
        if let Some(i) = cases.iter().position(|c| c.test.is_none()) {
            let pc = self.emit_jump(OpCode::Jmp, 0, span);
            default_jump = Some((i, pc));
        } else {
            let pc = self.emit_jump(OpCode::Jmp, 0, span);
            let loop_idx = self.cur_ref().loops.len() - 1;
            self.cur().loops[loop_idx].breaks.push(pc);
        }
        let mut arm_pcs = Vec::with_capacity(cases.len());
        for case in cases {
            arm_pcs.push(self.here());
            for stmt in &case.body {
                self.emit_stmt(stmt)?;
            }
        }
        for (i, pc) in arm_jumps {
            self.patch_jump_to(pc, arm_pcs[i])?;
        }
        if let Some((i, pc)) = default_jump {
            self.patch_jump_to(pc, arm_pcs[i])?;
        }
        Ok(())
    }

    fn emit_try(
        &mut self,
        body: &Block,
        catch: &Option<CatchClause>,
        finally: &Option<Block>,
        span: Span,
    ) -> Result<()> {
        let depth = self.cur_ref().context_depth as u8;
        self.cur().trys.push(TryCtx {
            finally: finally.clone(),
            pushes_active: 0,
        });

        let push_main = self.emit(Instruction::asbx(OpCode::SetCatchId, 0, 0), span);
        self.bump_pushes(1);
        self.emit_block(body, span)?;
        self.bump_pushes(-1);
        self.emit(Instruction::abc(OpCode::SetCatchId, 1, 0, 0), span);
        let jump_fin_a = self.emit_jump(OpCode::Jmp, 0, span);

        let mut jump_fin_b = None;
        let catch_entry = self.here();
        match catch {
            Some(clause) => {
                self.patch_jump_to(push_main, catch_entry)?;
                let exc = self.alloc_reg()?;
                self.emit(Instruction::abc(OpCode::Catch, depth, exc, 0), span);
                let rethrow_push = if finally.is_some() {
                    let pc = self.emit(Instruction::asbx(OpCode::SetCatchId, 0, 0), span);
                    self.bump_pushes(1);
                    Some(pc)
                } else {
                    None
                };
                // the catch parameter binds inside the catch block scope
                self.enter_block(&clause.body, span)?;
                if let Some(param) = &clause.param {
                    self.declare(param, span, exc, false)?;
                }
                self.emit_block_body(&clause.body)?;
                self.leave_block(span);
                if let Some(pc) = rethrow_push {
                    self.bump_pushes(-1);
                    self.emit(Instruction::abc(OpCode::SetCatchId, 1, 0, 0), span);
                    jump_fin_b = Some(self.emit_jump(OpCode::Jmp, 0, span));
                    let rethrow_entry = self.here();
                    self.patch_jump_to(pc, rethrow_entry)?;
                    self.emit_rethrow_arm(depth, finally.as_ref().unwrap(), span)?;
                }
            }
            None => {
                // no catch clause: the handler is the finally-and-rethrow arm
                self.patch_jump_to(push_main, catch_entry)?;
                self.emit_rethrow_arm(depth, finally.as_ref().unwrap(), span)?;
            }
        }

        self.cur().trys.pop();
        self.patch_jump(jump_fin_a)?;
        if let Some(pc) = jump_fin_b {
            self.patch_jump(pc)?;
        }
        if let Some(finally) = finally {
            self.emit_block(finally, span)?;
        }
        Ok(())
    }

    /// Handler arm that runs the finally body and rethrows the pending
    /// exception.
    fn emit_rethrow_arm(&mut self, depth: u8, finally: &Block, span: Span) -> Result<()> {
        let exc = self.alloc_reg()?;
        self.emit(Instruction::abc(OpCode::Catch, depth, exc, 0), span);
        self.emit_block(finally, span)?;
        self.emit(Instruction::abc(OpCode::Throw, exc, 0, 0), span);
        Ok(())
    }

    fn bump_pushes(&mut self, delta: i8) {
        let ctx = self.cur().trys.last_mut().unwrap();
        ctx.pushes_active = (ctx.pushes_active as i8 + delta) as u8;
    }

    // ---- expressions ----

    fn emit_expr(&mut self, expr: &Expr) -> Result<u8> {
        if expr.node.is_optional_chain() {
            return self.emit_optional_chain(expr);
        }
        self.emit_expr_inner(expr)
    }

    fn emit_expr_inner(&mut self, expr: &Expr) -> Result<u8> {
        let span = expr.span;
        match &expr.node {
            ExprKind::Number(n) => {
                let k = self.cur().func.add_const_number(*n);
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abx(OpCode::LoadConst, dest, k), span);
                Ok(dest)
            }
            ExprKind::Str(s) => self.load_const(Value::string(s), span),
            ExprKind::Bool(b) => self.load_const(Value::Bool(*b), span),
            ExprKind::Null => {
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abc(OpCode::LoadNil, dest, 0, 0), span);
                Ok(dest)
            }
            ExprKind::Undefined => {
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abc(OpCode::LoadNil, dest, 1, 0), span);
                Ok(dest)
            }
            ExprKind::Regex { pattern, flags } => self.load_const(
                Value::RegExp(Rc::new(crate::value::RegExp {
                    pattern: pattern.clone(),
                    flags: flags.clone(),
                })),
                span,
            ),
            ExprKind::Ident { name, scope } => self.emit_read(name, *scope, span),
            ExprKind::Array(items) => {
                let dest = self.alloc_reg()?;
                self.emit(
                    Instruction::abx(OpCode::NewArray, dest, items.len() as u16),
                    span,
                );
                for (i, item) in items.iter().enumerate() {
                    let mark = self.reg_mark();
                    let k = self.cur().func.add_const_number(i as f64);
                    let key = self.alloc_reg()?;
                    self.emit(Instruction::abx(OpCode::LoadConst, key, k), item.span);
                    let v = self.emit_expr(item)?;
                    self.emit(Instruction::abc(OpCode::SetTable, dest, key, v), item.span);
                    self.reset_regs(mark);
                }
                Ok(dest)
            }
            ExprKind::Object(props) => {
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abc(OpCode::NewTable, dest, 0, 0), span);
                for (key, value) in props {
                    let mark = self.reg_mark();
                    let key_reg = self.load_const(Value::string(key), value.span)?;
                    let v = self.emit_expr(value)?;
                    self.emit(
                        Instruction::abc(OpCode::SetTable, dest, key_reg, v),
                        value.span,
                    );
                    self.reset_regs(mark);
                }
                Ok(dest)
            }
            ExprKind::Function(lit) => self.emit_closure(lit, span),
            ExprKind::Unary { op, operand } => {
                let dest = self.alloc_reg()?;
                let mark = self.reg_mark();
                let r = self.emit_expr(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => OpCode::Neg,
                    UnaryOp::Pos => OpCode::Pos,
                    UnaryOp::Not => OpCode::Not,
                    UnaryOp::BitNot => OpCode::BitNot,
                    UnaryOp::Typeof => OpCode::Typeof,
                };
                self.emit(Instruction::abc(opcode, dest, r, 0), span);
                self.reset_regs(mark);
                Ok(dest)
            }
            ExprKind::Update { op, prefix, target } => self.emit_update(*op, *prefix, target, span),
            ExprKind::Binary { op, left, right } => match op {
                BinaryOp::And | BinaryOp::Or | BinaryOp::Nullish => {
                    self.emit_short_circuit(*op, left, right, span)
                }
                _ => {
                    let dest = self.alloc_reg()?;
                    let mark = self.reg_mark();
                    let l = self.emit_expr(left)?;
                    let r = self.emit_expr(right)?;
                    self.emit(Instruction::abc(binary_opcode(*op), dest, l, r), span);
                    self.reset_regs(mark);
                    Ok(dest)
                }
            },
            ExprKind::Assign { op, target, value } => self.emit_assign(*op, target, value, span),
            ExprKind::Conditional { cond, then, alt } => {
                let dest = self.alloc_reg()?;
                let mark = self.reg_mark();
                let c = self.emit_expr(cond)?;
                let jump_alt = self.emit_jump(OpCode::JmpFalse, c, cond.span);
                self.reset_regs(mark);
                let t = self.emit_expr(then)?;
                self.emit(Instruction::abc(OpCode::Move, dest, t, 0), then.span);
                self.reset_regs(mark);
                let jump_end = self.emit_jump(OpCode::Jmp, 0, span);
                self.patch_jump(jump_alt)?;
                let a = self.emit_expr(alt)?;
                self.emit(Instruction::abc(OpCode::Move, dest, a, 0), alt.span);
                self.reset_regs(mark);
                self.patch_jump(jump_end)?;
                Ok(dest)
            }
            ExprKind::Member {
                object,
                property,
                ..
            } => {
                let dest = self.alloc_reg()?;
                let mark = self.reg_mark();
                let obj = self.emit_expr_inner(object)?;
                let key = self.emit_expr(property)?;
                self.emit(Instruction::abc(OpCode::GetTable, dest, obj, key), span);
                self.reset_regs(mark);
                Ok(dest)
            }
            ExprKind::Call { callee, args, .. } => {
                let dest = self.alloc_reg()?;
                let mark = self.reg_mark();
                let base = self.cur_ref().next_reg;
                // contiguous window: callee, then arguments; member calls
                // append the receiver after the last argument so native
                // methods can reach their `this`
                let is_method = matches!(callee.node, ExprKind::Member { .. });
                let argc = args.len() + is_method as usize;
                let f = self.alloc_reg()?;
                let mut arg_regs = Vec::with_capacity(argc);
                for _ in 0..argc {
                    arg_regs.push(self.alloc_reg()?);
                }
                if let ExprKind::Member {
                    object, property, ..
                } = &callee.node
                {
                    let inner_mark = self.reg_mark();
                    let obj = self.emit_expr_inner(object)?;
                    let key = self.emit_expr(property)?;
                    self.emit(Instruction::abc(OpCode::GetTable, f, obj, key), callee.span);
                    let recv = arg_regs[argc - 1];
                    if obj != recv {
                        self.emit(Instruction::abc(OpCode::Move, recv, obj, 0), callee.span);
                    }
                    self.reset_regs(inner_mark);
                } else {
                    let fv = self.emit_expr_inner(callee)?;
                    if fv != f {
                        self.emit(Instruction::abc(OpCode::Move, f, fv, 0), callee.span);
                    }
                }
                self.reset_regs(base + 1 + argc as u16);
                for (arg, slot) in args.iter().zip(&arg_regs) {
                    let inner_mark = self.reg_mark();
                    let v = self.emit_expr(arg)?;
                    if v != *slot {
                        self.emit(Instruction::abc(OpCode::Move, *slot, v, 0), arg.span);
                    }
                    self.reset_regs(inner_mark);
                }
                self.emit(Instruction::abc(OpCode::Call, f, argc as u8, dest), span);
                self.reset_regs(mark);
                Ok(dest)
            }
        }
    }

    fn emit_read(&mut self, name: &str, scope: VarScope, span: Span) -> Result<u8> {
        match scope {
            VarScope::Local => {
                let fi = self.funcs.len() - 1;
                match self.lookup_local(fi, name) {
                    Some(reg) => Ok(reg),
                    None => Err(CodegenError::Unresolved(name.to_string())),
                }
            }
            VarScope::UpvalueNew => {
                let (hops, slot) = self
                    .lookup_context(name)
                    .ok_or_else(|| CodegenError::Unresolved(name.to_string()))?;
                let dest = self.alloc_reg()?;
                self.emit(
                    Instruction::abc(OpCode::GetContextSlot, dest, hops, slot),
                    span,
                );
                Ok(dest)
            }
            VarScope::Upvalue => {
                let fi = self.funcs.len() - 1;
                let idx = self
                    .ensure_upvalue(fi, name)
                    .ok_or_else(|| CodegenError::Unresolved(name.to_string()))?;
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abx(OpCode::GetUpvalue, dest, idx), span);
                Ok(dest)
            }
            VarScope::Global | VarScope::Unknown => {
                let k = self.add_const(Value::string(name));
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abx(OpCode::GetGlobal, dest, k), span);
                Ok(dest)
            }
        }
    }

    fn emit_write(&mut self, name: &str, scope: VarScope, value: u8, span: Span) -> Result<()> {
        match scope {
            VarScope::Local => {
                let fi = self.funcs.len() - 1;
                let reg = self
                    .lookup_local(fi, name)
                    .ok_or_else(|| CodegenError::Unresolved(name.to_string()))?;
                if reg != value {
                    self.emit(Instruction::abc(OpCode::Move, reg, value, 0), span);
                }
                Ok(())
            }
            VarScope::UpvalueNew => {
                let (hops, slot) = self
                    .lookup_context(name)
                    .ok_or_else(|| CodegenError::Unresolved(name.to_string()))?;
                self.emit(
                    Instruction::abc(OpCode::SetContextSlot, value, hops, slot),
                    span,
                );
                Ok(())
            }
            VarScope::Upvalue => {
                let fi = self.funcs.len() - 1;
                let idx = self
                    .ensure_upvalue(fi, name)
                    .ok_or_else(|| CodegenError::Unresolved(name.to_string()))?;
                self.emit(Instruction::abx(OpCode::SetUpvalue, value, idx), span);
                Ok(())
            }
            VarScope::Global | VarScope::Unknown => {
                let k = self.add_const(Value::string(name));
                self.emit(Instruction::abx(OpCode::SetGlobal, value, k), span);
                Ok(())
            }
        }
    }

    fn emit_assign(
        &mut self,
        op: Option<BinaryOp>,
        target: &Expr,
        value: &Expr,
        span: Span,
    ) -> Result<u8> {
        match &target.node {
            ExprKind::Ident { name, scope } => {
                let dest = self.alloc_reg()?;
                let mark = self.reg_mark();
                let v = match op {
                    Some(op) => {
                        let old = self.emit_read(name, *scope, target.span)?;
                        let rhs = self.emit_expr(value)?;
                        self.emit(Instruction::abc(binary_opcode(op), dest, old, rhs), span);
                        dest
                    }
                    None => self.emit_expr(value)?,
                };
                self.emit_write(name, *scope, v, span)?;
                if v != dest {
                    self.emit(Instruction::abc(OpCode::Move, dest, v, 0), span);
                }
                self.reset_regs(mark);
                Ok(dest)
            }
            ExprKind::Member {
                object, property, ..
            } => {
                let dest = self.alloc_reg()?;
                let mark = self.reg_mark();
                let obj = self.emit_expr(object)?;
                let key = self.emit_expr(property)?;
                let v = match op {
                    Some(op) => {
                        let old = self.alloc_reg()?;
                        self.emit(Instruction::abc(OpCode::GetTable, old, obj, key), span);
                        let rhs = self.emit_expr(value)?;
                        self.emit(Instruction::abc(binary_opcode(op), dest, old, rhs), span);
                        dest
                    }
                    None => self.emit_expr(value)?,
                };
                self.emit(Instruction::abc(OpCode::SetTable, obj, key, v), span);
                if v != dest {
                    self.emit(Instruction::abc(OpCode::Move, dest, v, 0), span);
                }
                self.reset_regs(mark);
                Ok(dest)
            }
            _ => Err(CodegenError::Unresolved("assignment target".into())),
        }
    }

    fn emit_update(
        &mut self,
        op: UpdateOp,
        prefix: bool,
        target: &Expr,
        span: Span,
    ) -> Result<u8> {
        let dest = self.alloc_reg()?;
        let mark = self.reg_mark();
        let opcode = match op {
            UpdateOp::Inc => OpCode::Inc,
            UpdateOp::Dec => OpCode::Dec,
        };
        match &target.node {
            ExprKind::Ident { name, scope } => {
                let work = self.alloc_reg()?;
                let cur = self.emit_read(name, *scope, target.span)?;
                self.emit(Instruction::abc(OpCode::Move, work, cur, 0), span);
                if !prefix {
                    self.emit(Instruction::abc(OpCode::Move, dest, work, 0), span);
                }
                self.emit(Instruction::abc(opcode, work, 0, 0), span);
                self.emit_write(name, *scope, work, span)?;
                if prefix {
                    self.emit(Instruction::abc(OpCode::Move, dest, work, 0), span);
                }
            }
            ExprKind::Member {
                object, property, ..
            } => {
                let obj = self.emit_expr(object)?;
                let key = self.emit_expr(property)?;
                let work = self.alloc_reg()?;
                self.emit(Instruction::abc(OpCode::GetTable, work, obj, key), span);
                if !prefix {
                    self.emit(Instruction::abc(OpCode::Move, dest, work, 0), span);
                }
                self.emit(Instruction::abc(opcode, work, 0, 0), span);
                self.emit(Instruction::abc(OpCode::SetTable, obj, key, work), span);
                if prefix {
                    self.emit(Instruction::abc(OpCode::Move, dest, work, 0), span);
                }
            }
            _ => return Err(CodegenError::Unresolved("update target".into())),
        }
        self.reset_regs(mark);
        Ok(dest)
    }

    fn emit_short_circuit(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        span: Span,
    ) -> Result<u8> {
        let dest = self.alloc_reg()?;
        let mark = self.reg_mark();
        let l = self.emit_expr(left)?;
        self.emit(Instruction::abc(OpCode::Move, dest, l, 0), left.span);
        self.reset_regs(mark);
        let skip = match op {
            BinaryOp::And => self.emit_jump(OpCode::JmpFalse, dest, span),
            BinaryOp::Or => self.emit_jump(OpCode::JmpTrue, dest, span),
            BinaryOp::Nullish => {
                // evaluate the right side only when the left is empty
                let to_rhs = self.emit_jump(OpCode::JmpNil, dest, span);
                let over = self.emit_jump(OpCode::Jmp, 0, span);
                self.patch_jump(to_rhs)?;
                over
            }
            _ => unreachable!(),
        };
        let r = self.emit_expr(right)?;
        self.emit(Instruction::abc(OpCode::Move, dest, r, 0), right.span);
        self.reset_regs(mark);
        self.patch_jump(skip)?;
        Ok(dest)
    }

    /// Lower a `?.` chain: every optional step tests its base and bails to
    /// one shared load-undefined site at the end of the chain.
    fn emit_optional_chain(&mut self, expr: &Expr) -> Result<u8> {
        let dest = self.alloc_reg()?;
        let mark = self.reg_mark();
        let mut bails = Vec::new();
        let result = self.emit_chain_step(expr, &mut bails)?;
        self.emit(Instruction::abc(OpCode::Move, dest, result, 0), expr.span);
        let done = self.emit_jump(OpCode::Jmp, 0, expr.span);
        for pc in bails {
            self.patch_jump(pc)?;
        }
        self.emit(Instruction::abc(OpCode::LoadNil, dest, 1, 0), expr.span);
        self.patch_jump(done)?;
        self.reset_regs(mark);
        Ok(dest)
    }

    fn emit_chain_step(&mut self, expr: &Expr, bails: &mut Vec<usize>) -> Result<u8> {
        let span = expr.span;
        match &expr.node {
            ExprKind::Member {
                object,
                property,
                optional,
                ..
            } => {
                let obj = self.emit_chain_step(object, bails)?;
                if *optional {
                    bails.push(self.emit_jump(OpCode::JmpNil, obj, span));
                }
                let key = self.emit_expr(property)?;
                let dest = self.alloc_reg()?;
                self.emit(Instruction::abc(OpCode::GetTable, dest, obj, key), span);
                Ok(dest)
            }
            ExprKind::Call {
                callee,
                args,
                optional,
            } => {
                let dest = self.alloc_reg()?;
                let is_method = matches!(callee.node, ExprKind::Member { .. });
                let argc = args.len() + is_method as usize;
                let f = self.alloc_reg()?;
                let mut arg_regs = Vec::with_capacity(argc);
                for _ in 0..argc {
                    arg_regs.push(self.alloc_reg()?);
                }
                if let ExprKind::Member {
                    object,
                    property,
                    optional: member_optional,
                    ..
                } = &callee.node
                {
                    let obj = self.emit_chain_step(object, bails)?;
                    if *member_optional {
                        bails.push(self.emit_jump(OpCode::JmpNil, obj, callee.span));
                    }
                    let key = self.emit_expr(property)?;
                    self.emit(Instruction::abc(OpCode::GetTable, f, obj, key), callee.span);
                    let recv = arg_regs[argc - 1];
                    if obj != recv {
                        self.emit(Instruction::abc(OpCode::Move, recv, obj, 0), callee.span);
                    }
                } else {
                    let fv = self.emit_chain_step(callee, bails)?;
                    self.emit(Instruction::abc(OpCode::Move, f, fv, 0), span);
                }
                if *optional {
                    bails.push(self.emit_jump(OpCode::JmpNil, f, span));
                }
                for (arg, slot) in args.iter().zip(&arg_regs) {
                    let inner_mark = self.reg_mark();
                    let v = self.emit_expr(arg)?;
                    if v != *slot {
                        self.emit(Instruction::abc(OpCode::Move, *slot, v, 0), arg.span);
                    }
                    self.reset_regs(inner_mark);
                }
                self.emit(Instruction::abc(OpCode::Call, f, argc as u8, dest), span);
                Ok(dest)
            }
            _ => self.emit_expr_inner(expr),
        }
    }

    fn emit_closure(&mut self, lit: &FunctionLit, span: Span) -> Result<u8> {
        let name = lit.name.as_deref().map(Rc::from);
        self.push_func(name, lit.id, &lit.params);
        self.hoist_var_slots(&lit.body.body)?;
        self.emit_block_body(&lit.body)?;
        self.emit(Instruction::abc(OpCode::Ret, 0, 0, 0), span);
        let state = self.funcs.pop().unwrap();
        let mut func = state.func;
        func.register_count = state.max_reg as u32;
        let parent = self.cur();
        if parent.func.children.len() >= u16::MAX as usize {
            return Err(CodegenError::TooManyChildren);
        }
        let child_index = parent.func.children.len() as u16;
        parent.func.children.push(Rc::new(func));
        let dest = self.alloc_reg()?;
        self.emit(Instruction::abx(OpCode::Closure, dest, child_index), span);
        Ok(dest)
    }
}

fn binary_opcode(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Add => OpCode::Add,
        BinaryOp::Sub => OpCode::Sub,
        BinaryOp::Mul => OpCode::Mul,
        BinaryOp::Div => OpCode::Div,
        BinaryOp::Mod => OpCode::Mod,
        BinaryOp::Pow => OpCode::Pow,
        BinaryOp::BitAnd => OpCode::BitAnd,
        BinaryOp::BitOr => OpCode::BitOr,
        BinaryOp::BitXor => OpCode::BitXor,
        BinaryOp::Less => OpCode::Less,
        BinaryOp::Greater => OpCode::Greater,
        BinaryOp::LessEq => OpCode::LessEqual,
        BinaryOp::GreaterEq => OpCode::GreaterEqual,
        BinaryOp::Eq => OpCode::Equal,
        BinaryOp::NotEq => OpCode::UnEqual,
        BinaryOp::AbsEq => OpCode::AbsEqual,
        BinaryOp::AbsNotEq => OpCode::AbsUnEqual,
        BinaryOp::And | BinaryOp::Or | BinaryOp::Nullish => unreachable!("short-circuit lowered"),
    }
}

fn collect_hoisted(stmts: &[Stmt], out: &mut Vec<String>) {
    for stmt in stmts {
        match &stmt.node {
            StmtKind::VarDecl {
                kind: DeclKind::Var,
                decls,
            } => {
                for d in decls {
                    out.push(d.name.clone());
                }
            }
            StmtKind::FunctionDecl { name, .. } => out.push(name.clone()),
            StmtKind::Block(b) => collect_hoisted(&b.body, out),
            StmtKind::If { then, alt, .. } => {
                collect_hoisted(std::slice::from_ref(&**then), out);
                if let Some(alt) = alt {
                    collect_hoisted(std::slice::from_ref(&**alt), out);
                }
            }
            StmtKind::While { body, .. } | StmtKind::DoWhile { body, .. } => {
                collect_hoisted(std::slice::from_ref(&**body), out);
            }
            StmtKind::For { init, body, .. } => {
                if let Some(init) = init {
                    collect_hoisted(std::slice::from_ref(&**init), out);
                }
                collect_hoisted(std::slice::from_ref(&**body), out);
            }
            StmtKind::Switch { cases, .. } => {
                for case in cases {
                    collect_hoisted(&case.body, out);
                }
            }
            StmtKind::Try {
                body,
                catch,
                finally,
            } => {
                collect_hoisted(&body.body, out);
                if let Some(catch) = catch {
                    collect_hoisted(&catch.body.body, out);
                }
                if let Some(finally) = finally {
                    collect_hoisted(&finally.body, out);
                }
            }
            _ => {}
        }
    }
}

/// All-constant switch keys, as `(arm_index, key)` pairs. String keys are
/// pre-hashed; mixed or non-constant tests disqualify the table form.
fn switchable_keys(cases: &[SwitchCase]) -> Option<Vec<(usize, i64)>> {
    let mut keys = Vec::new();
    let mut saw_int = false;
    let mut saw_str = false;
    for (i, case) in cases.iter().enumerate() {
        let Some(test) = &case.test else { continue };
        match &test.node {
            ExprKind::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                saw_int = true;
                keys.push((i, *n as i64));
            }
            ExprKind::Str(s) => {
                saw_str = true;
                keys.push((i, fnv1a64(s) as i64));
            }
            _ => return None,
        }
    }
    if keys.is_empty() || (saw_int && saw_str) {
        return None;
    }
    Some(keys)
}
