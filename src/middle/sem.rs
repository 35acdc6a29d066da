//! Semantic analysis: name resolution, type checking, and stack-slot
//! allocation. Turns the untyped [`crate::front::ast`] into the typed
//! [`crate::middle::tir`] that the code generator walks.
//!
//! Lowering happens in two passes. The first walks every top-level
//! declaration and populates a global scope, so that a call to a function
//! declared later in the file (or only ever prototyped) still resolves. The
//! second walks each function body with its own stack of block scopes,
//! checking and lowering expressions and statements, then calls `allocate`
//! to assign every parameter and local a stack offset.

use std::rc::Rc;

use crate::common::{align_down_neg, Id, Map, NodeIdGen, Set};
use crate::front::ast;

use super::tir::{self, BinOp, LogicOp, Symbol, Type, UnOp};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {msg}")]
pub struct SemError {
    pub line: usize,
    pub msg: String,
}

impl SemError {
    fn new(line: usize, msg: impl Into<String>) -> SemError {
        SemError { line, msg: msg.into() }
    }
}

/// Offset (in bytes) of the first local/parameter slot below the saved
/// `%rbp`/return address pair, mirroring `back::asm::target::SIZEOF_REG`
/// doubled -- kept as a local constant so this module has no dependency on
/// `back::asm` (layering runs front -> middle -> back, never the reverse).
const FIRST_SLOT_OFFSET: i32 = -16;

/// How many parameters the System V convention passes in registers; the
/// rest are passed on the caller's stack. Mirrors
/// `back::asm::target::NUM_PARAM_REGS` -- kept local for the same layering
/// reason as `FIRST_SLOT_OFFSET` above.
const NUM_PARAM_REGS: usize = 6;

/// Offset of the first stack-passed parameter above the saved `%rbp`:
/// skipping the saved `%rbp` itself and the return address, both pushed by
/// `call`/the prologue, so the caller's outgoing arguments start here.
const STACK_PARAM_BASE: i32 = 16;

/// Every stack-passed parameter occupies one 8-byte slot, regardless of its
/// own type's size -- the caller always pushes a full machine word.
const STACK_PARAM_STRIDE: i32 = 8;

/// Lowers a whole translation unit. Returns every error collected rather
/// than stopping at the first one, so a single run reports as much as it
/// can, the way `front::lex`/`front::parse` do not but a real compiler's
/// driver wants.
pub fn lower(program: ast::Program) -> Result<tir::Program, Vec<SemError>> {
    let mut errors = Vec::new();
    let mut globals: Map<Id, Rc<Symbol>> = Map::new();
    let mut defined: Set<Id> = Set::new();
    let mut ids = NodeIdGen::starting_after(max_ast_node_id(&program));

    for decl in &program.decls {
        register_top_decl(decl, &mut globals, &mut defined, &mut errors);
    }

    let mut out_globals = Vec::new();
    let mut functions = Vec::new();

    for decl in program.decls {
        match decl {
            ast::TopDecl::Global { name, .. } => {
                if let Some(sym) = globals.get(&name) {
                    if !sym.ty.is_function() {
                        out_globals.push(sym.clone());
                    }
                }
            }
            ast::TopDecl::Prototype { .. } => {}
            ast::TopDecl::Function { ret, name, params, body, .. } => {
                match lower_function(&ret, name, &params, body, &globals, &mut ids) {
                    Ok(f) => functions.push(f),
                    Err(mut errs) => errors.append(&mut errs),
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(tir::Program { globals: out_globals, functions })
    } else {
        Err(errors)
    }
}

fn register_top_decl(
    decl: &ast::TopDecl,
    globals: &mut Map<Id, Rc<Symbol>>,
    defined: &mut Set<Id>,
    errors: &mut Vec<SemError>,
) {
    match decl {
        ast::TopDecl::Global { line, ty, name, init } => {
            if init.is_some() {
                errors.push(SemError::new(
                    *line,
                    format!("global variable '{name}' cannot have an initializer"),
                ));
            }
            if globals.contains_key(name) {
                errors.push(SemError::new(*line, format!("redefinition of '{name}'")));
                return;
            }
            globals.insert(*name, Symbol::new(*name, lower_type(ty)));
        }
        ast::TopDecl::Prototype { line, ret, name, params, variadic } => {
            let ty = Type::Function {
                ret: Box::new(lower_type(ret)),
                params: params.iter().map(|p| lower_type(&p.ty)).collect(),
                variadic: *variadic,
            };
            insert_function_symbol(*line, *name, ty, globals, errors);
        }
        ast::TopDecl::Function { line, ret, name, params, .. } => {
            if !defined.insert(*name) {
                errors.push(SemError::new(*line, format!("redefinition of function '{name}'")));
                return;
            }
            let ty = Type::Function {
                ret: Box::new(lower_type(ret)),
                params: params.iter().map(|p| lower_type(&p.ty)).collect(),
                variadic: false,
            };
            insert_function_symbol(*line, *name, ty, globals, errors);
        }
    }
}

fn insert_function_symbol(
    line: usize,
    name: Id,
    ty: Type,
    globals: &mut Map<Id, Rc<Symbol>>,
    errors: &mut Vec<SemError>,
) {
    if let Some(existing) = globals.get(&name) {
        if existing.ty != ty {
            errors.push(SemError::new(line, format!("conflicting declarations of '{name}'")));
        }
        return;
    }
    globals.insert(name, Symbol::new(name, ty));
}

/// Scans the whole parsed program for the highest `NodeId` the parser handed
/// out, so the lowerer's own id generator can start past it.
fn max_ast_node_id(program: &ast::Program) -> crate::common::NodeId {
    let mut max = 0u32;
    fn visit_expr(e: &ast::Expr, max: &mut u32) {
        *max = (*max).max(e.id.0);
        match &e.kind {
            ast::ExprKind::Number(_) | ast::ExprKind::Str(_) | ast::ExprKind::Ident(_) => {}
            ast::ExprKind::Unary { expr, .. } => visit_expr(expr, max),
            ast::ExprKind::Binary { left, right, .. }
            | ast::ExprKind::Logical { left, right, .. } => {
                visit_expr(left, max);
                visit_expr(right, max);
            }
            ast::ExprKind::Assign { lhs, rhs } => {
                visit_expr(lhs, max);
                visit_expr(rhs, max);
            }
            ast::ExprKind::Call { args, .. } => args.iter().for_each(|a| visit_expr(a, max)),
            ast::ExprKind::Cast { expr, .. } => visit_expr(expr, max),
        }
    }
    fn visit_block(b: &ast::Block, max: &mut u32) {
        b.iter().for_each(|s| visit_stmt(s, max));
    }
    fn visit_stmt(s: &ast::Stmt, max: &mut u32) {
        match &s.kind {
            ast::StmtKind::Block(b) => visit_block(b, max),
            ast::StmtKind::Decl { init, .. } => {
                if let Some(e) = init {
                    visit_expr(e, max);
                }
            }
            ast::StmtKind::If { cond, then_branch, else_branch } => {
                visit_expr(cond, max);
                visit_block(then_branch, max);
                if let Some(b) = else_branch {
                    visit_block(b, max);
                }
            }
            ast::StmtKind::While { cond, body } => {
                visit_expr(cond, max);
                visit_block(body, max);
            }
            ast::StmtKind::For { init, cond, incr, body } => {
                if let Some(e) = init {
                    visit_expr(e, max);
                }
                if let Some(e) = cond {
                    visit_expr(e, max);
                }
                if let Some(e) = incr {
                    visit_expr(e, max);
                }
                visit_block(body, max);
            }
            ast::StmtKind::Break => {}
            ast::StmtKind::Return(value) => {
                if let Some(e) = value {
                    visit_expr(e, max);
                }
            }
            ast::StmtKind::Simple(e) => visit_expr(e, max),
        }
    }

    for decl in &program.decls {
        match decl {
            ast::TopDecl::Global { init: Some(e), .. } => visit_expr(e, &mut max),
            ast::TopDecl::Global { .. } | ast::TopDecl::Prototype { .. } => {}
            ast::TopDecl::Function { body, .. } => visit_block(body, &mut max),
        }
    }
    crate::common::NodeId(max)
}

fn lower_type(ty: &ast::Type) -> Type {
    match ty {
        ast::Type::Void => Type::Void,
        ast::Type::Int => Type::Int,
        ast::Type::Char => Type::Char,
        ast::Type::Pointer(inner) => Type::Pointer(Box::new(lower_type(inner))),
    }
}

struct Lowerer<'a> {
    scopes: Vec<Map<Id, Rc<Symbol>>>,
    globals: &'a Map<Id, Rc<Symbol>>,
    locals: Vec<Rc<Symbol>>,
    loop_depth: u32,
    ret_ty: Type,
    errors: Vec<SemError>,
    /// Mints ids for tir nodes synthesized during lowering (e.g. the
    /// implicit assignment for `int x = 1;`) that have no ast counterpart
    /// to inherit one from. Seeded past every id the parser handed out so
    /// synthesized and source nodes never collide in `back::asm`'s
    /// per-node side tables. Shared across every function in the
    /// translation unit so ids stay globally unique.
    ids: &'a mut NodeIdGen,
}

impl<'a> Lowerer<'a> {
    fn lookup(&self, name: Id) -> Option<Rc<Symbol>> {
        for scope in self.scopes.iter().rev() {
            if let Some(sym) = scope.get(&name) {
                return Some(sym.clone());
            }
        }
        self.globals.get(&name).cloned()
    }

    fn declare_local(&mut self, line: usize, ty: Type, name: Id) -> Rc<Symbol> {
        let sym = Symbol::new(name, ty);
        if let Some(scope) = self.scopes.last_mut() {
            if scope.insert(name, sym.clone()).is_some() {
                self.errors.push(SemError::new(line, format!("redefinition of '{name}'")));
            }
        }
        self.locals.push(sym.clone());
        sym
    }

    fn err(&mut self, line: usize, msg: impl Into<String>) {
        self.errors.push(SemError::new(line, msg));
    }
}

fn lower_function(
    ret: &ast::Type,
    name: Id,
    params: &[ast::Param],
    body: ast::Block,
    globals: &Map<Id, Rc<Symbol>>,
    ids: &mut NodeIdGen,
) -> Result<tir::Function, Vec<SemError>> {
    let symbol = globals.get(&name).cloned().expect("registered in the first pass");
    let ret_ty = lower_type(ret);

    let mut lowerer = Lowerer {
        scopes: vec![Map::new()],
        globals,
        locals: Vec::new(),
        loop_depth: 0,
        ret_ty: ret_ty.clone(),
        errors: Vec::new(),
        ids,
    };

    let mut param_syms = Vec::with_capacity(params.len());
    for p in params {
        let sym = lowerer.declare_local(0, lower_type(&p.ty), p.name);
        param_syms.push(sym);
    }
    // Parameters live in `locals` too (so `allocate` below walks one combined
    // list), but `Function::locals` should only hold the declarations that
    // came from inside the body.
    lowerer.locals.clear();

    let lowered_body = lower_block(&mut lowerer, body);

    if lowerer.errors.is_empty() {
        // Only the first `NUM_PARAM_REGS` parameters arrive in registers and
        // get spilled into a negative local slot by the prologue; anything
        // past that already lives on the caller's stack at a fixed positive
        // offset and is addressed there directly, never copied (see
        // `back::asm`'s module doc comment and `DESIGN.md` for why a literal
        // "every parameter gets a negative offset" reading of the
        // distillation breaks on more than six parameters).
        let (reg_params, stack_params) = param_syms.split_at(param_syms.len().min(NUM_PARAM_REGS));
        for (i, sym) in stack_params.iter().enumerate() {
            sym.offset.set(STACK_PARAM_BASE + (i as i32) * STACK_PARAM_STRIDE);
        }

        let mut offset = FIRST_SLOT_OFFSET;
        allocate(&mut offset, reg_params);
        allocate(&mut offset, &lowerer.locals);

        tracing::debug!(
            function = %name,
            params = param_syms.len(),
            locals = lowerer.locals.len(),
            frame_size = -offset,
            "resolved function",
        );

        Ok(tir::Function {
            symbol,
            params: param_syms,
            locals: lowerer.locals,
            body: lowered_body,
        })
    } else {
        Err(lowerer.errors)
    }
}

/// Assigns each symbol a stack offset, growing the frame downward from
/// `offset` and aligning every slot to its own access size (`SPEC_FULL.md`
/// §3: "every spilled node has a nonzero, 4- or 8-byte-aligned offset" --
/// the same discipline applies to locals/parameters here so the two halves
/// of the frame never collide on an unaligned boundary).
fn allocate(offset: &mut i32, syms: &[Rc<Symbol>]) {
    for sym in syms {
        let size = sym.ty.size().max(1);
        *offset = align_down_neg(*offset - size, size);
        sym.offset.set(*offset);
    }
}

fn lower_block(l: &mut Lowerer, block: ast::Block) -> tir::Block {
    l.scopes.push(Map::new());
    let lowered = block.into_iter().map(|s| lower_stmt(l, s)).collect();
    l.scopes.pop();
    lowered
}

fn lower_stmt(l: &mut Lowerer, stmt: ast::Stmt) -> tir::Stmt {
    let line = stmt.line;
    match stmt.kind {
        ast::StmtKind::Block(b) => tir::Stmt::Block(lower_block(l, b)),
        ast::StmtKind::Decl { ty, name, init } => {
            let ty = lower_type(&ty);
            let sym = l.declare_local(line, ty.clone(), name);
            let lowered_init = init.map(|e| {
                let rhs = lower_expr(l, e);
                let rhs = coerce(l, line, &ty, rhs);
                tir::Expr {
                    id: l.ids.fresh(),
                    ty: ty.clone(),
                    kind: tir::ExprKind::Assign {
                        lhs: Box::new(tir::Expr {
                            id: l.ids.fresh(),
                            ty: ty.clone(),
                            kind: tir::ExprKind::Identifier(sym.clone()),
                        }),
                        rhs: Box::new(rhs),
                    },
                }
            });
            match lowered_init {
                Some(e) => tir::Stmt::Simple(e),
                None => tir::Stmt::Block(Vec::new()),
            }
        }
        ast::StmtKind::If { cond, then_branch, else_branch } => {
            let cond = lower_expr(l, cond);
            check_scalar(l, line, &cond.ty);
            tir::Stmt::If {
                cond,
                then_branch: lower_block(l, then_branch),
                else_branch: else_branch.map(|b| lower_block(l, b)),
            }
        }
        ast::StmtKind::While { cond, body } => {
            let cond = lower_expr(l, cond);
            check_scalar(l, line, &cond.ty);
            l.loop_depth += 1;
            let body = lower_block(l, body);
            l.loop_depth -= 1;
            tir::Stmt::While { cond, body }
        }
        ast::StmtKind::For { init, cond, incr, body } => {
            let init = init.map(|e| lower_expr(l, e));
            let cond = cond.map(|e| lower_expr(l, e));
            if let Some(c) = &cond {
                check_scalar(l, line, &c.ty);
            }
            let incr = incr.map(|e| lower_expr(l, e));
            l.loop_depth += 1;
            let body = lower_block(l, body);
            l.loop_depth -= 1;
            tir::Stmt::For { init, cond, incr, body }
        }
        ast::StmtKind::Break => {
            if l.loop_depth == 0 {
                l.err(line, "'break' outside of a loop");
            }
            tir::Stmt::Break
        }
        ast::StmtKind::Return(value) => {
            let value = value.map(|e| lower_expr(l, e));
            let ret_ty = l.ret_ty.clone();
            let value = match (&ret_ty, value) {
                (Type::Void, Some(v)) => {
                    l.err(line, "returning a value from a function returning void");
                    Some(v)
                }
                (Type::Void, None) => None,
                (_, None) => {
                    l.err(line, "missing return value");
                    None
                }
                (ret_ty, Some(v)) => Some(coerce(l, line, ret_ty, v)),
            };
            tir::Stmt::Return(value)
        }
        ast::StmtKind::Simple(e) => tir::Stmt::Simple(lower_expr(l, e)),
    }
}

fn check_scalar(l: &mut Lowerer, line: usize, ty: &Type) {
    if matches!(ty, Type::Void | Type::Function { .. }) {
        l.err(line, format!("expected a scalar value, found {ty:?}"));
    }
}

/// True if a value of `from` can be used where `to` is expected -- integer
/// promotion (`char` -> `int`) is implicit, everything else must match
/// exactly or go through an explicit cast.
fn is_assignable(to: &Type, from: &Type) -> bool {
    match (to, from) {
        (a, b) if a == b => true,
        (Type::Int, Type::Char) | (Type::Char, Type::Int) => true,
        (Type::Pointer(_), Type::Pointer(_)) => true,
        _ => false,
    }
}

fn check_assignable(l: &mut Lowerer, line: usize, to: &Type, from: &Type) {
    if !is_assignable(to, from) {
        l.err(line, format!("cannot use a value of type {from:?} as {to:?}"));
    }
}

/// Checks that `e` can implicitly become `target` and, if that requires
/// widening it (only `char` -> `int` does), wraps it in a `Cast` node so
/// code generation actually emits the sign-extension. Narrowing needs no
/// node: the consumer already reads its own type's size off the target, not
/// off `e`, so truncation falls out of the existing width logic for free.
fn coerce(l: &mut Lowerer, line: usize, target: &Type, e: tir::Expr) -> tir::Expr {
    check_assignable(l, line, target, &e.ty);
    if e.ty.size() < target.size() && is_assignable(target, &e.ty) {
        tir::Expr {
            id: l.ids.fresh(),
            ty: target.clone(),
            kind: tir::ExprKind::Cast { expr: Box::new(e) },
        }
    } else {
        e
    }
}

/// Promotes a `char` operand of a binary operator to `int`, mirroring C's
/// integer promotion: `gen_arith`/`gen_relational`/`gen_divmod` all select
/// their instruction width from an operand's own recorded type, so a bare
/// `char` left in place of one would either pick an invalid sub-register
/// width or read past its 1-byte stack slot.
fn promote(l: &mut Lowerer, line: usize, e: tir::Expr) -> tir::Expr {
    if e.ty == Type::Char {
        coerce(l, line, &Type::Int, e)
    } else {
        e
    }
}

fn lower_expr(l: &mut Lowerer, expr: ast::Expr) -> tir::Expr {
    let ast::Expr { id, line, kind } = expr;
    let (ty, kind) = match kind {
        ast::ExprKind::Number(n) => (Type::Int, tir::ExprKind::Number(n)),
        ast::ExprKind::Str(bytes) => {
            (Type::Pointer(Box::new(Type::Char)), tir::ExprKind::Str(bytes))
        }
        ast::ExprKind::Ident(name) => match l.lookup(name) {
            Some(sym) => {
                let ty = sym.ty.clone();
                (ty, tir::ExprKind::Identifier(sym))
            }
            None => {
                l.err(line, format!("undeclared identifier '{name}'"));
                (Type::Int, tir::ExprKind::Number(0))
            }
        },
        ast::ExprKind::Unary { op, expr } => lower_unary(l, line, op, *expr),
        ast::ExprKind::Binary { op, left, right } => lower_binary(l, line, op, *left, *right),
        ast::ExprKind::Logical { op, left, right } => {
            let left = lower_expr(l, *left);
            let right = lower_expr(l, *right);
            check_scalar(l, line, &left.ty);
            check_scalar(l, line, &right.ty);
            let op = match op {
                ast::LogicOp::And => LogicOp::And,
                ast::LogicOp::Or => LogicOp::Or,
            };
            (
                Type::Int,
                tir::ExprKind::Logical { op, left: Box::new(left), right: Box::new(right) },
            )
        }
        ast::ExprKind::Assign { lhs, rhs } => {
            let lhs = lower_expr(l, *lhs);
            if !matches!(lhs.kind, tir::ExprKind::Identifier(_) | tir::ExprKind::Unary { op: UnOp::Deref, .. })
            {
                l.err(line, "left-hand side of an assignment must be an identifier or *pointer");
            }
            let rhs = lower_expr(l, *rhs);
            let ty = lhs.ty.clone();
            let rhs = coerce(l, line, &ty, rhs);
            (ty, tir::ExprKind::Assign { lhs: Box::new(lhs), rhs: Box::new(rhs) })
        }
        ast::ExprKind::Call { callee, args } => lower_call(l, line, callee, args),
        ast::ExprKind::Cast { ty, expr } => {
            let ty = lower_type(&ty);
            let inner = lower_expr(l, *expr);
            check_scalar(l, line, &inner.ty);
            (ty, tir::ExprKind::Cast { expr: Box::new(inner) })
        }
    };
    tir::Expr { id, ty, kind }
}

fn lower_unary(l: &mut Lowerer, line: usize, op: ast::UnOp, inner: ast::Expr) -> (Type, tir::ExprKind) {
    let inner = lower_expr(l, inner);
    match op {
        ast::UnOp::Neg => {
            check_scalar(l, line, &inner.ty);
            let ty = inner.ty.clone();
            (ty, tir::ExprKind::Unary { op: UnOp::Neg, expr: Box::new(inner) })
        }
        ast::UnOp::Not => {
            check_scalar(l, line, &inner.ty);
            (Type::Int, tir::ExprKind::Unary { op: UnOp::Not, expr: Box::new(inner) })
        }
        ast::UnOp::AddrOf => {
            if !matches!(inner.kind, tir::ExprKind::Identifier(_)) {
                l.err(line, "cannot take the address of a non-lvalue");
            }
            let ty = Type::Pointer(Box::new(inner.ty.clone()));
            (ty, tir::ExprKind::Unary { op: UnOp::AddrOf, expr: Box::new(inner) })
        }
        ast::UnOp::Deref => match inner.ty.pointee().cloned() {
            Some(pointee) => {
                (pointee, tir::ExprKind::Unary { op: UnOp::Deref, expr: Box::new(inner) })
            }
            None => {
                l.err(line, format!("cannot dereference a value of type {:?}", inner.ty));
                (Type::Int, tir::ExprKind::Unary { op: UnOp::Deref, expr: Box::new(inner) })
            }
        },
    }
}

fn lower_binary(
    l: &mut Lowerer,
    line: usize,
    op: ast::BinOp,
    left: ast::Expr,
    right: ast::Expr,
) -> (Type, tir::ExprKind) {
    let left = lower_expr(l, left);
    let right = lower_expr(l, right);
    check_scalar(l, line, &left.ty);
    check_scalar(l, line, &right.ty);
    let left = promote(l, line, left);
    let right = promote(l, line, right);

    let (op, ty) = match op {
        ast::BinOp::Add => (BinOp::Add, arith_result(l, line, &left.ty, &right.ty)),
        ast::BinOp::Sub => (BinOp::Sub, arith_result(l, line, &left.ty, &right.ty)),
        ast::BinOp::Mul => (BinOp::Mul, Type::Int),
        ast::BinOp::Div => (BinOp::Div, Type::Int),
        ast::BinOp::Rem => (BinOp::Rem, Type::Int),
        ast::BinOp::Lt => (BinOp::Lt, Type::Int),
        ast::BinOp::Gt => (BinOp::Gt, Type::Int),
        ast::BinOp::Le => (BinOp::Le, Type::Int),
        ast::BinOp::Ge => (BinOp::Ge, Type::Int),
        ast::BinOp::Eq => (BinOp::Eq, Type::Int),
        ast::BinOp::Ne => (BinOp::Ne, Type::Int),
    };
    (ty, tir::ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) })
}

/// `+`/`-` on a pointer and an integer stay pointer-typed (pointer
/// arithmetic); on two integers they stay `int`; mixing two pointers is
/// rejected.
fn arith_result(l: &mut Lowerer, line: usize, left: &Type, right: &Type) -> Type {
    match (left, right) {
        (Type::Pointer(_), Type::Pointer(_)) => {
            l.err(line, "cannot add or subtract two pointers");
            Type::Int
        }
        (p @ Type::Pointer(_), _) => p.clone(),
        (_, p @ Type::Pointer(_)) => p.clone(),
        _ => Type::Int,
    }
}

fn lower_call(l: &mut Lowerer, line: usize, callee: Id, args: Vec<ast::Expr>) -> (Type, tir::ExprKind) {
    let args: Vec<tir::Expr> = args.into_iter().map(|a| lower_expr(l, a)).collect();

    let sym = l.lookup(callee);
    let callee_ty = match &sym {
        Some(sym) if sym.ty.is_function() => sym.ty.clone(),
        Some(_) => {
            l.err(line, format!("'{callee}' is not a function"));
            Type::Function { ret: Box::new(Type::Int), params: Vec::new(), variadic: true }
        }
        None => {
            l.err(line, format!("call to undeclared function '{callee}'"));
            Type::Function { ret: Box::new(Type::Int), params: Vec::new(), variadic: true }
        }
    };

    let (ret, params, variadic) = match &callee_ty {
        Type::Function { ret, params, variadic } => (ret.as_ref().clone(), params.clone(), *variadic),
        _ => unreachable!(),
    };

    let args = if args.len() < params.len() || (args.len() > params.len() && !variadic) {
        l.err(
            line,
            format!(
                "'{callee}' expects {} argument(s), found {}",
                params.len(),
                args.len()
            ),
        );
        args
    } else {
        args.into_iter()
            .enumerate()
            .map(|(i, a)| match params.get(i) {
                Some(param_ty) => coerce(l, line, param_ty, a),
                None => a,
            })
            .collect()
    };

    (ret, tir::ExprKind::Call { callee, callee_ty, args })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lower_src(src: &str) -> Result<tir::Program, Vec<SemError>> {
        let ast = crate::front::parse(src).expect("parses");
        lower(ast)
    }

    #[test]
    fn resolves_forward_declared_function() {
        let prog = lower_src(
            "int add(int a, int b);\nint main() { return add(1, 2); }\nint add(int a, int b) { return a + b; }",
        )
        .expect("lowers cleanly");
        assert_eq!(prog.functions.len(), 2);
    }

    #[test]
    fn assigns_distinct_aligned_offsets_to_locals() {
        let prog = lower_src("int main() { char a; int b; return 0; }").expect("lowers cleanly");
        let f = &prog.functions[0];
        assert_eq!(f.locals.len(), 2);
        for local in &f.locals {
            let off = local.offset.get();
            assert!(off < 0);
            assert_eq!(off % local.ty.size(), 0);
        }
        assert_ne!(f.locals[0].offset.get(), f.locals[1].offset.get());
    }

    #[test]
    fn rejects_break_outside_loop() {
        let err = lower_src("int main() { break; return 0; }").unwrap_err();
        assert!(err[0].msg.contains("break"));
    }

    #[test]
    fn rejects_undeclared_identifier() {
        let err = lower_src("int main() { return x; }").unwrap_err();
        assert!(err[0].msg.contains("undeclared"));
    }

    #[test]
    fn rejects_wrong_argument_count() {
        let err = lower_src("int f(int a); int main() { return f(1, 2); }").unwrap_err();
        assert!(err[0].msg.contains("argument"));
    }

    #[test]
    fn allows_variadic_call_with_extra_arguments() {
        lower_src("int printf(char *fmt, ...); int main() { return printf(\"hi\"); }")
            .expect("variadic calls accept extra arguments");
    }

    #[test]
    fn stack_passed_parameters_get_positive_offsets_above_the_register_ones() {
        let prog = lower_src(
            "int sum8(int a, int b, int c, int d, int e, int f, int g, int h) { return a; }",
        )
        .expect("lowers cleanly");
        let f = &prog.functions[0];
        assert_eq!(f.params.len(), 8);
        for p in &f.params[..6] {
            assert!(p.offset.get() < 0, "register-passed parameter must live below %rbp");
        }
        assert_eq!(f.params[6].offset.get(), 16);
        assert_eq!(f.params[7].offset.get(), 24);
    }

    #[test]
    fn rejects_global_initializer() {
        let err = lower_src("int g = 1; int main() { return g; }").unwrap_err();
        assert!(err[0].msg.contains("initializer"));
    }

    #[test]
    fn widens_a_char_initializer_to_int_with_a_cast() {
        let prog = lower_src("int main() { char c; int i = c; return i; }").expect("lowers cleanly");
        let assign = &prog.functions[0].body[1];
        let tir::Stmt::Simple(e) = assign else { panic!("expected a simple statement") };
        let tir::ExprKind::Assign { rhs, .. } = &e.kind else { panic!("expected an assignment") };
        assert!(matches!(rhs.kind, tir::ExprKind::Cast { .. }));
        assert_eq!(rhs.ty, Type::Int);
    }

    #[test]
    fn widens_a_char_assigned_to_int_with_a_cast() {
        let prog =
            lower_src("int main() { char c; int i; i = c; return i; }").expect("lowers cleanly");
        let tir::Stmt::Simple(e) = &prog.functions[0].body[2] else {
            panic!("expected a simple statement")
        };
        let tir::ExprKind::Assign { rhs, .. } = &e.kind else { panic!("expected an assignment") };
        assert!(matches!(rhs.kind, tir::ExprKind::Cast { .. }));
    }

    #[test]
    fn does_not_wrap_a_narrowing_assignment_in_a_cast() {
        let prog = lower_src("int main() { char c; c = 1; return 0; }").expect("lowers cleanly");
        let tir::Stmt::Simple(e) = &prog.functions[0].body[1] else {
            panic!("expected a simple statement")
        };
        let tir::ExprKind::Assign { rhs, .. } = &e.kind else { panic!("expected an assignment") };
        assert!(!matches!(rhs.kind, tir::ExprKind::Cast { .. }));
    }

    #[test]
    fn widens_a_char_return_value_to_the_declared_return_type() {
        let prog = lower_src("int main() { char c; return c; }").expect("lowers cleanly");
        let tir::Stmt::Return(Some(value)) = &prog.functions[0].body[1] else {
            panic!("expected a return with a value")
        };
        assert!(matches!(value.kind, tir::ExprKind::Cast { .. }));
        assert_eq!(value.ty, Type::Int);
    }

    #[test]
    fn widens_a_char_call_argument_to_an_int_parameter() {
        let prog = lower_src("int f(int a); int main() { char c; return f(c); }")
            .expect("lowers cleanly");
        let tir::Stmt::Return(Some(value)) = &prog.functions[0].body[1] else {
            panic!("expected a return with a value")
        };
        let tir::ExprKind::Call { args, .. } = &value.kind else { panic!("expected a call") };
        assert!(matches!(args[0].kind, tir::ExprKind::Cast { .. }));
        assert_eq!(args[0].ty, Type::Int);
    }

    #[test]
    fn widens_a_char_operand_of_arithmetic_to_int() {
        let prog = lower_src("int main() { char c; return c + 1; }").expect("lowers cleanly");
        let tir::Stmt::Return(Some(value)) = &prog.functions[0].body[1] else {
            panic!("expected a return with a value")
        };
        let tir::ExprKind::Binary { left, .. } = &value.kind else {
            panic!("expected a binary expression")
        };
        assert!(matches!(left.kind, tir::ExprKind::Cast { .. }));
        assert_eq!(left.ty, Type::Int);
    }
}
