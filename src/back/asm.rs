//! The x86-64 System V code generator.
//!
//! This is a tree-walking emitter fused with a small live-set register
//! allocator: there is no separate allocation pass, no liveness analysis, and
//! no instruction scheduling. Each expression's `gen_expr` leaves its value in
//! exactly one of two places -- a register, or a spill slot on the stack --
//! and records which in [`Emitter`]'s side tables, keyed by the expression's
//! [`NodeId`]. A node's value never lives in two places at once, and the
//! register file and those side tables are kept in sync through a single
//! primitive, [`Emitter::assign`], so there is only ever one writer for the
//! `register <-> node` association.
//!
//! # Call stack frame
//!
//! The stack grows down. A function's frame, once its prologue has run, looks
//! like:
//!
//! ```txt
//!   higher addresses
//!   +-------------------------+
//!   | caller's frame          |
//!   +-------------------------+
//!   | stack-passed arguments  |  16(%rbp), 24(%rbp), ...
//!   +-------------------------+
//!   | return address          |  8(%rbp)
//!   +-------------------------+
//!   | saved %rbp              |  0(%rbp) <- %rbp
//!   +-------------------------+
//!   | locals / register-      |  -16(%rbp), -24(%rbp), ...
//!   | passed parameters       |
//!   +-------------------------+
//!   | spill slots             |  grows further down as expressions spill
//!   +-------------------------+ <- %rsp
//!   lower addresses
//! ```
//!
//! Every frame's size (the distance from `%rbp` down to `%rsp`) is a multiple
//! of `target::STACK_ALIGNMENT` so that `call` always executes with `%rsp`
//! 16-byte aligned, per the System V AMD64 ABI.
//!
//! # Calling convention
//!
//! The first six integer/pointer arguments go in `%rdi, %rsi, %rdx, %rcx,
//! %r8, %r9`; the rest are pushed right-to-left onto the stack before `call`.
//! The callee copies its first up to six parameters out of their argument
//! registers into local stack slots on entry (so they can be spilled and
//! addressed uniformly with everything else); arguments beyond the sixth are
//! never copied -- they already live on the stack at a fixed positive offset
//! from `%rbp`, and `middle::sem::allocate` assigns them that offset directly
//! rather than a negative local slot (see `DESIGN.md` for why this departs
//! from a literal reading of the distilled spec, which does not account for
//! functions with more than six parameters).
//!
//! # Register allocation
//!
//! There is no spill-everything policy and no graph coloring: an expression
//! materializes its value in whatever register `getreg` hands out, reuses a
//! child's register when an operator can (arithmetic, negation, dereference),
//! and the allocator evicts (spills) the least-recently-assigned occupant of
//! a needed register on exhaustion. See [`Emitter::getreg`].

use std::fmt::Write as _;
use std::rc::Rc;

use crate::common::{align_down_neg, Map, NodeId};
use crate::middle::tir::{BinOp, Expr, ExprKind, Function, LogicOp, Program, Stmt, Symbol, Type, UnOp};

pub mod target;

use target::{GLOBAL_PREFIX, GLOBAL_SUFFIX, NUM_PARAM_REGS, SIZEOF_REG, STACK_ALIGNMENT};

/// The usable register set, in the fixed order `getreg` hands registers out
/// in. Declaration order doubles as the array index used by the register
/// file, so reordering these variants reorders allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Register {
    Rax,
    Rdi,
    Rsi,
    Rdx,
    Rcx,
    R8,
    R9,
    R10,
    R11,
}

use Register::*;

impl Register {
    const ORDER: [Register; 9] = [Rax, Rdi, Rsi, Rdx, Rcx, R8, R9, R10, R11];

    /// The System V parameter-passing registers, in argument order.
    const PARAMS: [Register; NUM_PARAM_REGS] = [Rdi, Rsi, Rdx, Rcx, R8, R9];

    fn idx(self) -> usize {
        self as usize
    }

    /// The AT&T spelling of this register at the given operand size.
    fn spelling(self, size: i32) -> &'static str {
        match (self, size) {
            (Rax, 8) => "%rax",
            (Rax, 4) => "%eax",
            (Rax, 1) => "%al",
            (Rdi, 8) => "%rdi",
            (Rdi, 4) => "%edi",
            (Rdi, 1) => "%dil",
            (Rsi, 8) => "%rsi",
            (Rsi, 4) => "%esi",
            (Rsi, 1) => "%sil",
            (Rdx, 8) => "%rdx",
            (Rdx, 4) => "%edx",
            (Rdx, 1) => "%dl",
            (Rcx, 8) => "%rcx",
            (Rcx, 4) => "%ecx",
            (Rcx, 1) => "%cl",
            (R8, 8) => "%r8",
            (R8, 4) => "%r8d",
            (R8, 1) => "%r8b",
            (R9, 8) => "%r9",
            (R9, 4) => "%r9d",
            (R9, 1) => "%r9b",
            (R10, 8) => "%r10",
            (R10, 4) => "%r10d",
            (R10, 1) => "%r10b",
            (R11, 8) => "%r11",
            (R11, 4) => "%r11d",
            (R11, 1) => "%r11b",
            (_, other) => unreachable!("operand size must be 1, 4, or 8 bytes; got {other}"),
        }
    }
}

/// The size-denoting letter appended to an AT&T mnemonic.
fn suffix(size: i32) -> char {
    match size {
        1 => 'b',
        4 => 'l',
        8 => 'q',
        other => unreachable!("operand size must be 1, 4, or 8 bytes; got {other}"),
    }
}

/// An opaque, monotonically numbered jump target, formatted as `.L<n>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Label(u32);

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ".L{}", self.0)
    }
}

/// Carries every piece of mutable state threaded through code generation:
/// the register file, the per-node register/spill-offset side tables, the
/// current function's frame offset and exit-label stack, and the
/// translation-unit-wide string pool. Constructed once per translation unit
/// (`Emitter::new`) and reset per function (`Emitter::enter_function`).
struct Emitter {
    out: String,
    /// `regs[r.idx()]` is the node currently resident in register `r`, if any.
    regs: [Option<NodeId>; Register::ORDER.len()],
    /// Inverse of `regs`: which register (if any) a node currently occupies.
    node_reg: Map<NodeId, Register>,
    /// The operand size a node was materialized at, recorded whenever it
    /// enters a register so it can be spilled correctly later without
    /// needing the `Expr` that produced it back in hand.
    node_size: Map<NodeId, i32>,
    /// The stack offset a node was spilled to, if it ever was.
    node_offset: Map<NodeId, i32>,
    frame_offset: i32,
    func_name: crate::common::Id,
    exit_labels: Vec<Label>,
    next_label: u32,
    strings: Map<Vec<u8>, Label>,
}

impl Emitter {
    fn new() -> Self {
        Emitter {
            out: String::new(),
            regs: [None; Register::ORDER.len()],
            node_reg: Map::new(),
            node_size: Map::new(),
            node_offset: Map::new(),
            frame_offset: 0,
            func_name: crate::common::Id::from(String::new()),
            exit_labels: Vec::new(),
            next_label: 0,
            strings: Map::new(),
        }
    }

    /// Resets per-function state. The register file and node side tables are
    /// untouched across functions: at the end of every `Block` (and so at the
    /// end of every function body) they are already empty.
    fn enter_function(&mut self, name: crate::common::Id, frame_offset: i32) {
        debug_assert!(self.regs.iter().all(Option::is_none));
        self.func_name = name;
        self.frame_offset = frame_offset;
        self.exit_labels.clear();
    }

    fn fresh_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    // -----------------------------------------------------------------
    // 4.1 Register file and allocator
    // -----------------------------------------------------------------

    /// Breaks any prior binding on either side, then binds `node <-> reg`.
    /// The only place either half of the association is written -- see the
    /// module doc comment.
    fn assign(&mut self, node: Option<NodeId>, reg: Option<Register>) {
        if let Some(n) = node {
            if let Some(old_reg) = self.node_reg.remove(&n) {
                self.regs[old_reg.idx()] = None;
            }
        }
        if let Some(r) = reg {
            if let Some(old_node) = self.regs[r.idx()].take() {
                self.node_reg.remove(&old_node);
            }
        }
        if let (Some(n), Some(r)) = (node, reg) {
            self.regs[r.idx()] = Some(n);
            self.node_reg.insert(n, r);
        }
    }

    fn node_register(&self, id: NodeId) -> Option<Register> {
        self.node_reg.get(&id).copied()
    }

    /// Records that `id` now holds a value of `size` bytes in `reg`.
    fn bind(&mut self, id: NodeId, size: i32, reg: Register) {
        self.node_size.insert(id, size);
        self.assign(Some(id), Some(reg));
    }

    fn detach(&mut self, id: NodeId) {
        self.assign(Some(id), None);
    }

    /// Grows the frame downward by `size` bytes, aligned to `size`, and
    /// returns the new (more negative) offset.
    fn spill_slot(&mut self, size: i32) -> i32 {
        self.frame_offset = align_down_neg(self.frame_offset - size, size);
        self.frame_offset
    }

    /// Ensures `node` ends up resident in `reg`.
    fn load(&mut self, node: Option<&Expr>, reg: Register) {
        let node_id = node.map(|n| n.id);
        if self.regs[reg.idx()] == node_id {
            return;
        }
        if let Some(occupant) = self.regs[reg.idx()] {
            let size = *self
                .node_size
                .get(&occupant)
                .expect("a resident node always has a recorded size");
            let off = self.spill_slot(size);
            self.node_offset.insert(occupant, off);
            writeln!(self.out, "\tmov{}\t{}, {off}(%rbp)", suffix(size), reg.spelling(size)).unwrap();
            self.assign(Some(occupant), None);
        }
        if let Some(n) = node {
            let size = n.ty.size();
            let operand = self.operand(n);
            writeln!(self.out, "\tmov{}\t{operand}, {}", suffix(size), reg.spelling(size)).unwrap();
            self.node_size.insert(n.id, size);
        }
        self.assign(node_id, Some(reg));
    }

    /// Returns the first free register in allocation order, spilling `%rax`
    /// if the file is full. Deterministic so generated output is
    /// reproducible; see `DESIGN.md` for why this doesn't chase a fancier
    /// (round-robin/LRU) eviction policy.
    fn getreg(&mut self) -> Register {
        for &r in &Register::ORDER {
            if self.regs[r.idx()].is_none() {
                return r;
            }
        }
        self.load(None, Register::ORDER[0]);
        Register::ORDER[0]
    }

    /// Ensures `e`'s value is in a register -- its own, if it already has
    /// one, otherwise a freshly acquired one -- and returns it.
    fn ensure_reg(&mut self, e: &Expr) -> Register {
        if let Some(r) = self.node_register(e.id) {
            return r;
        }
        let r = self.getreg();
        self.load(Some(e), r);
        r
    }

    // -----------------------------------------------------------------
    // 4.2 Operand writer
    // -----------------------------------------------------------------

    fn operand(&mut self, e: &Expr) -> String {
        self.operand_at(e, e.ty.size())
    }

    /// Like `operand`, but spells a register operand at `size` rather than
    /// `e`'s own type size -- needed when `e` feeds an instruction whose
    /// suffix is dictated by a *different* type (e.g. the `int` side of
    /// pointer arithmetic, rendered at the `Pointer`'s 8-byte width).
    fn operand_at(&mut self, e: &Expr, size: i32) -> String {
        if let Some(r) = self.node_register(e.id) {
            return r.spelling(size).to_string();
        }
        match &e.kind {
            ExprKind::Number(n) => format!("${n}"),
            ExprKind::Identifier(sym) => identifier_operand(sym),
            ExprKind::Str(bytes) => self.intern_string(bytes.clone()).to_string(),
            _ => {
                let off = *self
                    .node_offset
                    .get(&e.id)
                    .expect("an un-registered computed node must have been spilled");
                debug_assert_ne!(off, 0);
                format!("{off}(%rbp)")
            }
        }
    }

    fn intern_string(&mut self, bytes: Vec<u8>) -> Label {
        if let Some(&l) = self.strings.get(&bytes) {
            return l;
        }
        let l = self.fresh_label();
        self.strings.insert(bytes, l);
        l
    }

    // -----------------------------------------------------------------
    // 4.3 Expression emitter
    // -----------------------------------------------------------------

    fn gen_expr(&mut self, e: &Expr) {
        match &e.kind {
            ExprKind::Number(_) | ExprKind::Str(_) | ExprKind::Identifier(_) => {
                // Rendered directly by the operand writer; nothing to emit
                // and nothing to register until a consumer calls `ensure_reg`.
            }
            ExprKind::Unary { op, expr } => self.gen_unary(e, *op, expr),
            ExprKind::Binary { op, left, right } => self.gen_binary(e, *op, left, right),
            ExprKind::Logical { op, left, right } => self.gen_logical(e, *op, left, right),
            ExprKind::Assign { lhs, rhs } => self.gen_assign(e, lhs, rhs),
            ExprKind::Call { callee, callee_ty, args } => self.gen_call(e, *callee, callee_ty, args),
            ExprKind::Cast { expr } => self.gen_cast(e, expr),
        }
    }

    fn gen_unary(&mut self, e: &Expr, op: UnOp, inner: &Expr) {
        match op {
            UnOp::Neg => {
                self.gen_expr(inner);
                let reg = self.ensure_reg(inner);
                let size = e.ty.size();
                writeln!(self.out, "\tneg{}\t{}", suffix(size), reg.spelling(size)).unwrap();
                self.detach(inner.id);
                self.bind(e.id, size, reg);
            }
            UnOp::Not => {
                self.gen_expr(inner);
                let size = inner.ty.size();
                let operand = self.operand(inner);
                writeln!(self.out, "\tcmp{}\t$0, {operand}", suffix(size)).unwrap();
                self.detach(inner.id);
                let r = self.getreg();
                writeln!(self.out, "\tsete\t{}", r.spelling(1)).unwrap();
                writeln!(self.out, "\tmovzbl\t{}, {}", r.spelling(1), r.spelling(4)).unwrap();
                self.bind(e.id, 4, r);
            }
            UnOp::AddrOf => {
                if let ExprKind::Unary { op: UnOp::Deref, expr: pointee } = &inner.kind {
                    self.gen_expr(pointee);
                    let reg = self.ensure_reg(pointee);
                    self.detach(pointee.id);
                    self.bind(e.id, 8, reg);
                } else {
                    let r = self.getreg();
                    let operand = self.operand(inner);
                    writeln!(self.out, "\tleaq\t{operand}, {}", r.spelling(8)).unwrap();
                    self.bind(e.id, 8, r);
                }
            }
            UnOp::Deref => {
                self.gen_expr(inner);
                let reg = self.ensure_reg(inner);
                let size = e.ty.size();
                writeln!(self.out, "\tmov{}\t({}), {}", suffix(size), reg.spelling(8), reg.spelling(size)).unwrap();
                self.detach(inner.id);
                self.bind(e.id, size, reg);
            }
        }
    }

    fn gen_binary(&mut self, e: &Expr, op: BinOp, left: &Expr, right: &Expr) {
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul => self.gen_arith(e, op, left, right),
            BinOp::Div | BinOp::Rem => self.gen_divmod(e, op, left, right),
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                self.gen_relational(e, op, left, right)
            }
        }
    }

    fn gen_arith(&mut self, e: &Expr, op: BinOp, left: &Expr, right: &Expr) {
        self.gen_expr(left);
        self.gen_expr(right);
        let lreg = self.ensure_reg(left);
        let size = e.ty.size();
        // `char` operands are promoted to `int` in `sem` before they ever reach
        // a binary operator, so the only width mismatch left to widen here is
        // pointer arithmetic with the pointer on the right: the int operand
        // needs sign-extending up to the pointer's 8-byte width before the op.
        if left.ty.size() < size {
            writeln!(self.out, "\tmovslq\t{}, {}", lreg.spelling(left.ty.size()), lreg.spelling(size)).unwrap();
        }
        let mnemonic = match op {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "imul",
            _ => unreachable!(),
        };
        // Both operands are read at the *result's* width, not their own --
        // pointer arithmetic mixes an 8-byte pointer with a 4-byte int, and
        // the instruction's single suffix must match both operand widths.
        let rhs = self.operand_at(right, size);
        writeln!(self.out, "\t{mnemonic}{}\t{rhs}, {}", suffix(size), lreg.spelling(size)).unwrap();
        self.detach(right.id);
        self.detach(left.id);
        self.bind(e.id, size, lreg);
    }

    fn gen_divmod(&mut self, e: &Expr, op: BinOp, left: &Expr, right: &Expr) {
        self.gen_expr(left);
        self.gen_expr(right);
        self.load(Some(left), Rax);
        self.load(None, Rdx);
        self.load(Some(right), Rcx);
        let size = left.ty.size().max(4);
        if size == 8 {
            self.out.push_str("\tcqto\n");
        } else {
            self.out.push_str("\tcltd\n");
        }
        writeln!(self.out, "\tidiv{}\t{}", suffix(size), Rcx.spelling(size)).unwrap();
        self.detach(left.id);
        self.detach(right.id);
        let result = if op == BinOp::Div { Rax } else { Rdx };
        self.bind(e.id, e.ty.size(), result);
    }

    fn gen_relational(&mut self, e: &Expr, op: BinOp, left: &Expr, right: &Expr) {
        self.gen_expr(left);
        self.gen_expr(right);
        let lreg = self.ensure_reg(left);
        let size = left.ty.size();
        let rhs = self.operand_at(right, size);
        writeln!(self.out, "\tcmp{}\t{rhs}, {}", suffix(size), lreg.spelling(size)).unwrap();
        self.detach(left.id);
        self.detach(right.id);
        let result = self.getreg();
        let cc = match op {
            BinOp::Lt => "l",
            BinOp::Gt => "g",
            BinOp::Le => "le",
            BinOp::Ge => "ge",
            BinOp::Eq => "e",
            BinOp::Ne => "ne",
            _ => unreachable!(),
        };
        writeln!(self.out, "\tset{cc}\t{}", result.spelling(1)).unwrap();
        writeln!(self.out, "\tmovzbl\t{}, {}", result.spelling(1), result.spelling(4)).unwrap();
        self.bind(e.id, 4, result);
    }

    fn gen_logical(&mut self, e: &Expr, op: LogicOp, left: &Expr, right: &Expr) {
        let l1 = self.fresh_label();
        let l2 = self.fresh_label();
        let (short_circuit_if, fallthrough_value, short_circuit_value) = match op {
            LogicOp::Or => (true, 0, 1),
            LogicOp::And => (false, 1, 0),
        };
        self.gen_test(left, l1, short_circuit_if);
        self.gen_test(right, l1, short_circuit_if);
        let r = self.getreg();
        writeln!(self.out, "\tmovl\t${fallthrough_value}, {}", r.spelling(4)).unwrap();
        writeln!(self.out, "\tjmp\t{l2}").unwrap();
        writeln!(self.out, "{l1}:").unwrap();
        writeln!(self.out, "\tmovl\t${short_circuit_value}, {}", r.spelling(4)).unwrap();
        writeln!(self.out, "{l2}:").unwrap();
        self.bind(e.id, 4, r);
    }

    /// Emits `e`, ensures it is registered, compares it with zero, and jumps
    /// to `label` if (`if_true`) it's nonzero or (!`if_true`) it's zero.
    /// Detaches `e` afterward -- this never leaves a lingering register.
    fn gen_test(&mut self, e: &Expr, label: Label, if_true: bool) {
        self.gen_expr(e);
        let reg = self.ensure_reg(e);
        let size = e.ty.size();
        writeln!(self.out, "\tcmp{}\t$0, {}", suffix(size), reg.spelling(size)).unwrap();
        self.detach(e.id);
        let jump = if if_true { "jne" } else { "je" };
        writeln!(self.out, "\t{jump}\t{label}").unwrap();
    }

    fn gen_cast(&mut self, e: &Expr, inner: &Expr) {
        self.gen_expr(inner);
        let reg = self.ensure_reg(inner);
        let from = inner.ty.size();
        let to = e.ty.size();
        let widen = match (from, to) {
            (1, 4) => Some("movsbl"),
            (1, 8) => Some("movsbq"),
            (4, 8) => Some("movslq"),
            _ => None,
        };
        if let Some(mnemonic) = widen {
            writeln!(self.out, "\t{mnemonic}\t{}, {}", reg.spelling(from), reg.spelling(to)).unwrap();
        }
        self.detach(inner.id);
        self.bind(e.id, to, reg);
    }

    fn gen_assign(&mut self, e: &Expr, lhs: &Expr, rhs: &Expr) {
        match &lhs.kind {
            ExprKind::Identifier(sym) => {
                self.gen_expr(rhs);
                let reg = self.ensure_reg(rhs);
                let size = lhs.ty.size();
                let target = identifier_operand(sym);
                writeln!(self.out, "\tmov{}\t{}, {target}", suffix(size), reg.spelling(size)).unwrap();
                self.detach(rhs.id);
                self.bind(e.id, size, reg);
            }
            ExprKind::Unary { op: UnOp::Deref, expr: pointee } => {
                self.gen_expr(pointee);
                let preg = self.ensure_reg(pointee);
                self.gen_expr(rhs);
                let vreg = self.ensure_reg(rhs);
                let size = lhs.ty.size();
                writeln!(self.out, "\tmov{}\t{}, ({})", suffix(size), vreg.spelling(size), preg.spelling(8)).unwrap();
                self.detach(pointee.id);
                self.detach(rhs.id);
                self.bind(e.id, size, vreg);
            }
            _ => unreachable!("middle::sem rejects non-lvalue assignment targets"),
        }
    }

    // -----------------------------------------------------------------
    // 4.5 Call lowering
    // -----------------------------------------------------------------

    fn gen_call(&mut self, e: &Expr, callee: crate::common::Id, callee_ty: &Type, args: &[Expr]) {
        let variadic = matches!(callee_ty, Type::Function { variadic: true, .. });

        // 1. Generate right-to-left so earlier arguments may still hold
        // registers while later ones are placed.
        for a in args.iter().rev() {
            self.gen_expr(a);
        }

        // 2. Pre-pad to a 16-byte boundary for the stack-passed arguments.
        let stack_args = args.len().saturating_sub(NUM_PARAM_REGS);
        let raw_bytes = (stack_args as i32) * SIZEOF_REG;
        let mut num_bytes = target::align_up(raw_bytes, STACK_ALIGNMENT) - raw_bytes;
        if num_bytes > 0 {
            writeln!(self.out, "\tsubq\t${num_bytes}, %rsp").unwrap();
        }

        // 3. Place arguments right-to-left.
        for i in (0..args.len()).rev() {
            let a = &args[i];
            if i >= NUM_PARAM_REGS {
                self.load(Some(a), Rax);
                if a.ty.size() == 1 {
                    writeln!(self.out, "\tmovsbl\t{}, {}", Rax.spelling(1), Rax.spelling(4)).unwrap();
                }
                self.out.push_str("\tpushq\t%rax\n");
                num_bytes += SIZEOF_REG;
            } else {
                let preg = Register::PARAMS[i];
                self.load(Some(a), preg);
                if a.ty.size() == 1 {
                    writeln!(self.out, "\tmovsbl\t{}, {}", preg.spelling(1), preg.spelling(4)).unwrap();
                }
            }
            self.detach(a.id);
        }

        // 4. Evict every caller-saved register: anything still alive across
        // the call must already be on the stack.
        for &r in &Register::ORDER {
            self.load(None, r);
        }

        // 5. A variadic callee needs %al = 0 (no vector arguments).
        if variadic {
            self.out.push_str("\tmovl\t$0, %eax\n");
        }

        // 6. Call.
        writeln!(self.out, "\tcall\t{GLOBAL_PREFIX}{callee}{GLOBAL_SUFFIX}").unwrap();

        // 7. Pop anything we pushed or reserved for alignment.
        if num_bytes > 0 {
            writeln!(self.out, "\taddq\t${num_bytes}, %rsp").unwrap();
        }

        // 8. The result lives in %rax.
        self.bind(e.id, e.ty.size(), Rax);
    }

    // -----------------------------------------------------------------
    // 4.4 Statement and function emitter
    // -----------------------------------------------------------------

    fn gen_stmt(&mut self, s: &Stmt) {
        match s {
            Stmt::Block(b) => self.gen_block(b),
            Stmt::If { cond, then_branch, else_branch } => {
                self.gen_if(cond, then_branch, else_branch.as_deref())
            }
            Stmt::While { cond, body } => self.gen_while(cond, body),
            Stmt::For { init, cond, incr, body } => self.gen_for(init, cond, incr, body),
            Stmt::Break => self.gen_break(),
            Stmt::Return(value) => self.gen_return(value.as_ref()),
            Stmt::Simple(e) => {
                self.gen_expr(e);
                self.detach(e.id);
            }
        }
    }

    fn gen_block(&mut self, block: &[Stmt]) {
        for s in block {
            self.gen_stmt(s);
            debug_assert!(
                self.regs.iter().all(Option::is_none),
                "register file must be empty between statements"
            );
        }
    }

    fn gen_if(&mut self, cond: &Expr, then_branch: &[Stmt], else_branch: Option<&[Stmt]>) {
        let skip = self.fresh_label();
        let exit = self.fresh_label();
        self.gen_test(cond, skip, false);
        self.gen_block(then_branch);
        writeln!(self.out, "\tjmp\t{exit}").unwrap();
        writeln!(self.out, "{skip}:").unwrap();
        if let Some(eb) = else_branch {
            self.gen_block(eb);
        }
        writeln!(self.out, "{exit}:").unwrap();
    }

    fn gen_while(&mut self, cond: &Expr, body: &[Stmt]) {
        let loop_label = self.fresh_label();
        let exit = self.fresh_label();
        self.exit_labels.push(exit);
        writeln!(self.out, "{loop_label}:").unwrap();
        self.gen_test(cond, exit, false);
        self.gen_block(body);
        writeln!(self.out, "\tjmp\t{loop_label}").unwrap();
        writeln!(self.out, "{exit}:").unwrap();
        self.exit_labels.pop();
    }

    fn gen_for(&mut self, init: &Option<Expr>, cond: &Option<Expr>, incr: &Option<Expr>, body: &[Stmt]) {
        let loop_label = self.fresh_label();
        let exit = self.fresh_label();
        self.exit_labels.push(exit);
        if let Some(i) = init {
            self.gen_expr(i);
            self.detach(i.id);
        }
        writeln!(self.out, "{loop_label}:").unwrap();
        if let Some(c) = cond {
            self.gen_test(c, exit, false);
        }
        self.gen_block(body);
        if let Some(i) = incr {
            self.gen_expr(i);
            self.detach(i.id);
        }
        writeln!(self.out, "\tjmp\t{loop_label}").unwrap();
        writeln!(self.out, "{exit}:").unwrap();
        self.exit_labels.pop();
    }

    fn gen_break(&mut self) {
        let label = *self
            .exit_labels
            .last()
            .expect("middle::sem rejects break outside of a loop");
        writeln!(self.out, "\tjmp\t{label}").unwrap();
    }

    fn gen_return(&mut self, value: Option<&Expr>) {
        if let Some(v) = value {
            self.gen_expr(v);
            self.load(Some(v), Rax);
            self.detach(v.id);
        }
        writeln!(self.out, "\tjmp\t{}{}.exit", GLOBAL_PREFIX, self.func_name).unwrap();
    }

    fn gen_function(&mut self, f: &Function) {
        let lowest_used = f
            .params
            .iter()
            .chain(f.locals.iter())
            .map(|s| s.offset.get())
            .filter(|&off| off < 0)
            .min()
            .unwrap_or(-2 * SIZEOF_REG);
        self.enter_function(f.symbol.name, lowest_used);

        let name = f.symbol.name;
        writeln!(self.out, "{GLOBAL_PREFIX}{name}:").unwrap();
        self.out.push_str("\tpushq\t%rbp\n");
        self.out.push_str("\tmovq\t%rsp, %rbp\n");
        writeln!(self.out, "\tmovl\t${name}.size, %eax").unwrap();
        self.out.push_str("\tsubq\t%rax, %rsp\n");

        for (i, p) in f.params.iter().take(NUM_PARAM_REGS).enumerate() {
            let size = p.ty.size();
            writeln!(
                self.out,
                "\tmov{}\t{}, {}(%rbp)",
                suffix(size),
                Register::PARAMS[i].spelling(size),
                p.offset.get()
            )
            .unwrap();
        }

        self.gen_block(&f.body);

        writeln!(self.out, "{GLOBAL_PREFIX}{name}.exit:").unwrap();
        self.out.push_str("\tmovq\t%rbp, %rsp\n");
        self.out.push_str("\tpopq\t%rbp\n");
        self.out.push_str("\tret\n");

        let frame_size = target::align_up(-self.frame_offset, STACK_ALIGNMENT);
        writeln!(self.out, "\t.set\t{name}.size, {frame_size}").unwrap();
        writeln!(self.out, "\t.globl\t{GLOBAL_PREFIX}{name}").unwrap();
    }

    fn gen_globals(&mut self, globals: &[Rc<Symbol>]) {
        for g in globals {
            writeln!(self.out, "\t.comm\t{GLOBAL_PREFIX}{}{GLOBAL_SUFFIX}, {}", g.name, g.ty.size()).unwrap();
        }
        if self.strings.is_empty() {
            return;
        }
        self.out.push_str("\t.data\n");
        for (bytes, label) in &self.strings {
            writeln!(self.out, "{label}:\n\t.asciz \"{}\"", escape_asciz(bytes)).unwrap();
        }
    }
}

fn identifier_operand(sym: &Symbol) -> String {
    if sym.is_global() {
        format!("{GLOBAL_PREFIX}{}{GLOBAL_SUFFIX}", sym.name)
    } else {
        format!("{}(%rbp)", sym.offset.get())
    }
}

/// Escapes raw bytes for a GNU-as `.asciz` directive.
fn escape_asciz(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(b as char),
            other => out.push_str(&format!("\\{:03o}", other)),
        }
    }
    out
}

/// Generates AT&T-syntax x86-64 assembly for a whole translation unit.
pub fn generate(program: &Program) -> String {
    let mut e = Emitter::new();
    e.out.push_str("\t.text\n");
    for f in &program.functions {
        e.gen_function(f);
    }
    e.gen_globals(&program.globals);
    e.out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codegen(src: &str) -> String {
        let ast = crate::front::parse(src).expect("parses");
        let tir = crate::middle::lower(ast).expect("lowers cleanly");
        generate(&tir)
    }

    #[test]
    fn arithmetic_uses_left_to_right_register_reuse() {
        let asm = codegen("int main() { return (1+2)*3 - 4/2; }");
        let add = asm.find("add").expect("an add");
        let imul = asm.find("imul").expect("an imul");
        let idiv = asm.find("idiv").expect("an idiv");
        let sub = asm.find("sub").expect("a sub");
        assert!(add < imul && imul < sub && idiv < sub);
    }

    #[test]
    fn short_circuit_or_orders_right_after_first_test() {
        let asm = codegen("int f(); int main() { return 1 || f(); }");
        let first_jump = asm.find("jne").or_else(|| asm.find("je")).expect("a test jump");
        let call = asm.find("call").expect("the call to f");
        assert!(first_jump < call, "right-hand side must come after the short-circuit test");
    }

    #[test]
    fn break_in_for_loop_jumps_to_the_loop_exit() {
        let asm = codegen(
            "int main() { int i; for (i = 0; i < 10; i = i + 1) { if (i == 5) break; } return i; }",
        );
        assert_eq!(asm.matches("jmp\t.L").count() >= 2, true);
    }

    #[test]
    fn call_with_eight_args_pushes_two_and_restores_sixteen_bytes() {
        let asm = codegen(
            "int sum8(int a, int b, int c, int d, int e, int f, int g, int h);\n\
             int main() { return sum8(1,2,3,4,5,6,7,8); }",
        );
        assert_eq!(asm.matches("pushq\t%rax").count(), 2);
        assert!(asm.contains("addq\t$16, %rsp"));
    }

    #[test]
    fn call_with_exactly_six_args_adjusts_no_stack() {
        let asm = codegen(
            "int sum6(int a, int b, int c, int d, int e, int f);\n\
             int main() { return sum6(1,2,3,4,5,6); }",
        );
        assert!(!asm.contains("pushq"));
        assert!(!asm.contains("subq\t$") || !asm.contains("%rsp"));
    }

    #[test]
    fn call_with_seven_args_pushes_one_and_restores_sixteen_bytes() {
        let asm = codegen(
            "int sum7(int a, int b, int c, int d, int e, int f, int g);\n\
             int main() { return sum7(1,2,3,4,5,6,7); }",
        );
        assert_eq!(asm.matches("pushq\t%rax").count(), 1);
        assert!(asm.contains("addq\t$16, %rsp"));
    }

    #[test]
    fn pointer_store_reuses_the_address_register() {
        let asm = codegen("int main() { int x; int *p; p = &x; *p = *p + 1; return x; }");
        assert!(asm.contains("leaq"));
    }

    #[test]
    fn char_to_int_assignment_sign_extends() {
        let asm = codegen("int main() { char c; int i; c = -1; i = c; return i; }");
        assert!(asm.contains("movsbl"));
    }

    #[test]
    fn duplicate_string_literals_share_one_label() {
        let asm = codegen(r#"int puts(char *s); int main() { puts("hi"); puts("hi"); return 0; }"#);
        assert_eq!(asm.matches(".asciz \"hi\"").count(), 1);
    }

    #[test]
    fn distinct_string_literals_get_distinct_labels() {
        let asm = codegen(r#"int puts(char *s); int main() { puts("hi"); puts("bye"); return 0; }"#);
        assert_eq!(asm.matches(".asciz").count(), 2);
    }

    #[test]
    fn frame_size_is_always_a_multiple_of_sixteen() {
        for src in [
            "int main() { return 0; }",
            "int main() { char a; int b; return 0; }",
            "int f(int a, int b, int c, int d, int e, int f, int g, int h) { return a; } int main() { return 0; }",
        ] {
            let asm = codegen(src);
            for line in asm.lines().filter(|l| l.contains(".set") && l.contains(".size")) {
                let n: i32 = line.rsplit(',').next().unwrap().trim().parse().unwrap();
                assert_eq!(n % 16, 0, "{line}");
            }
        }
    }

    #[test]
    fn allocator_round_trips_assign_load_getreg() {
        let mut e = Emitter::new();
        let a = NodeId(0);
        let b = NodeId(1);
        e.assign(Some(a), Some(Rax));
        assert_eq!(e.node_register(a), Some(Rax));
        e.assign(Some(b), Some(Rax));
        assert_eq!(e.node_register(a), None, "binding rax to b must evict a");
        assert_eq!(e.node_register(b), Some(Rax));
        e.assign(Some(b), None);
        assert_eq!(e.node_register(b), None);
        assert!(e.regs.iter().all(Option::is_none));
    }

    #[test]
    fn getreg_follows_fixed_allocation_order() {
        let mut e = Emitter::new();
        let got: Vec<Register> = (0..9).map(|_| e.getreg()).collect();
        // With nothing bound, the first call always returns the first free
        // register in order, so calling it repeatedly without binding
        // anything always returns `Rax`.
        assert!(got.iter().all(|&r| r == Rax));
    }
}
