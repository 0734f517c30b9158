//! Lowered, typed intermediate representation
//!
//! The codegen core consumes a tree of statements produced by the front-end
//! after offloading and access lowering (`GlobalPtr` has already become
//! `SNodeLookup` + `GetCh`). Statements live in an arena and reference their
//! operands by [`StmtId`]; nested control flow carries its own [`Block`]s.
//!
//! Statements are a tagged union so the visitor's match is checked for
//! exhaustiveness by the compiler. Lowering never mutates the IR: generated
//! SSA values live in a side map owned by the visitor.

use crate::snode::SNodeId;
use crate::types::{ConstValue, DataType};

/// Identity of a statement within its kernel's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtId(pub u32);

impl StmtId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Scalar unary operations (casts are separate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Sqrt,
    Sin,
    Cos,
    Floor,
    Ceil,
    Abs,
    Exp,
    Log,
    Tan,
    Tanh,
    Sgn,
    LogicNot,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Floor => "floor",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Tan => "tan",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Sgn => "sgn",
            UnaryOp::LogicNot => "logic_not",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Max,
    Min,
    CmpEq,
    CmpNe,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::CmpEq
                | BinaryOp::CmpNe
                | BinaryOp::CmpLt
                | BinaryOp::CmpLe
                | BinaryOp::CmpGt
                | BinaryOp::CmpGe
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Mod => "mod",
            BinaryOp::BitAnd => "bit_and",
            BinaryOp::BitOr => "bit_or",
            BinaryOp::BitXor => "bit_xor",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
            BinaryOp::CmpEq => "cmp_eq",
            BinaryOp::CmpNe => "cmp_ne",
            BinaryOp::CmpLt => "cmp_lt",
            BinaryOp::CmpLe => "cmp_le",
            BinaryOp::CmpGt => "cmp_gt",
            BinaryOp::CmpGe => "cmp_ge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Add,
    Sub,
    Max,
    Min,
}

impl AtomicOp {
    pub fn name(self) -> &'static str {
        match self {
            AtomicOp::Add => "atomic_add",
            AtomicOp::Sub => "atomic_sub",
            AtomicOp::Max => "atomic_max",
            AtomicOp::Min => "atomic_min",
        }
    }
}

/// A straight-line sequence of statements with an optional mask.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub statements: Vec<StmtId>,
    pub mask: Option<StmtId>,
}

impl Block {
    pub fn new(statements: Vec<StmtId>) -> Self {
        Self {
            statements,
            mask: None,
        }
    }
}

/// Kind of work an offloaded task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Serial,
    RangeFor,
    StructFor,
    ListGen,
}

/// An independently launchable unit of work; becomes one emitted function.
#[derive(Debug, Clone)]
pub struct OffloadedStmt {
    pub task_type: TaskType,
    pub body: Option<Block>,
    /// Range-for bounds (constants after offloading).
    pub begin: i32,
    pub end: i32,
    pub reversed: bool,
    /// Requested block size; zero means "backend default".
    pub block_size: i32,
    /// Target snode for struct-for and listgen tasks.
    pub snode: Option<SNodeId>,
}

impl OffloadedStmt {
    pub fn serial(body: Block) -> Self {
        Self {
            task_type: TaskType::Serial,
            body: Some(body),
            begin: 0,
            end: 0,
            reversed: false,
            block_size: 0,
            snode: None,
        }
    }

    pub fn range_for(begin: i32, end: i32, body: Block) -> Self {
        Self {
            task_type: TaskType::RangeFor,
            body: Some(body),
            begin,
            end,
            reversed: false,
            block_size: 0,
            snode: None,
        }
    }

    pub fn struct_for(snode: SNodeId, block_size: i32, body: Block) -> Self {
        Self {
            task_type: TaskType::StructFor,
            body: Some(body),
            begin: 0,
            end: 0,
            reversed: false,
            block_size,
            snode: Some(snode),
        }
    }

    pub fn listgen(snode: SNodeId) -> Self {
        Self {
            task_type: TaskType::ListGen,
            body: None,
            begin: 0,
            end: 0,
            reversed: false,
            block_size: 0,
            snode: Some(snode),
        }
    }
}

/// Statement kinds of the lowered IR.
#[derive(Debug, Clone)]
pub enum StmtKind {
    Alloca,
    Const(ConstValue),
    Rand,
    Unary {
        op: UnaryOp,
        operand: StmtId,
    },
    /// Numeric conversion (`by_value`) or size-preserving bit reinterpret.
    Cast {
        operand: StmtId,
        from: DataType,
        to: DataType,
        by_value: bool,
    },
    Binary {
        op: BinaryOp,
        lhs: StmtId,
        rhs: StmtId,
    },
    /// The only ternary operation: SSA select.
    Select {
        cond: StmtId,
        then_val: StmtId,
        else_val: StmtId,
    },
    If {
        cond: StmtId,
        then_body: Option<Block>,
        else_body: Option<Block>,
    },
    While {
        body: Block,
    },
    /// Break out of the enclosing while when `cond == 0`.
    WhileControl {
        cond: StmtId,
    },
    RangeFor {
        loop_var: StmtId,
        begin: StmtId,
        end: StmtId,
        reversed: bool,
        body: Block,
    },
    LocalLoad {
        ptr: StmtId,
    },
    LocalStore {
        ptr: StmtId,
        data: StmtId,
    },
    GlobalLoad {
        ptr: StmtId,
    },
    GlobalStore {
        ptr: StmtId,
        data: StmtId,
    },
    ArgLoad {
        arg_id: usize,
        is_ptr: bool,
    },
    AtomicOp {
        op: AtomicOp,
        dest: StmtId,
        val: StmtId,
    },
    /// Address one level of the sparse tree. Without `input_snode` the
    /// parent is the root buffer.
    SNodeLookup {
        snode: SNodeId,
        input_snode: Option<StmtId>,
        input_index: StmtId,
        activate: bool,
    },
    /// Select child `chid` of a cell pointer.
    GetCh {
        input_ptr: StmtId,
        input_snode: SNodeId,
        output_snode: SNodeId,
        chid: u32,
    },
    ExternalPtr {
        base: StmtId,
        indices: Vec<StmtId>,
    },
    LoopIndex {
        index: usize,
        is_struct_for: bool,
    },
    /// Row-major linearization: `val = val * strides[i] + inputs[i]`.
    Linearize {
        inputs: Vec<StmtId>,
        strides: Vec<i32>,
    },
    /// `((input + offset) >> bit_begin) & ((1 << (bit_end - bit_begin)) - 1)`
    OffsetAndExtractBits {
        input: StmtId,
        offset: i32,
        bit_begin: u32,
        bit_end: u32,
    },
    ElementShuffle,
    Print {
        value: StmtId,
        label: String,
    },
    Assert {
        cond: StmtId,
        text: String,
    },
    Offloaded(OffloadedStmt),
}

/// One statement: a kind, a return type, and a SIMD width.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub ret_type: DataType,
    pub width: u32,
}

/// Arena owning every statement of a kernel.
#[derive(Debug, Clone, Default)]
pub struct IrArena {
    stmts: Vec<Stmt>,
}

impl IrArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: StmtKind, ret_type: DataType) -> StmtId {
        self.push_wide(kind, ret_type, 1)
    }

    pub fn push_wide(&mut self, kind: StmtKind, ret_type: DataType, width: u32) -> StmtId {
        let id = StmtId(self.stmts.len() as u32);
        self.stmts.push(Stmt {
            kind,
            ret_type,
            width,
        });
        id
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.index()]
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }
}

/// A kernel: a name, a grad flag, and an IR root whose statements are all
/// offloaded tasks.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub name: String,
    pub grad: bool,
    pub arena: IrArena,
    pub root: Block,
}

impl Kernel {
    pub fn new(name: impl Into<String>, arena: IrArena, root: Block) -> Self {
        Self {
            name: name.into(),
            grad: false,
            arena,
            root,
        }
    }

    /// Base name for emitted task functions:
    /// `"{name}{_grad}_kernel"`, tasks append `"_{index}"`.
    pub fn task_base_name(&self) -> String {
        let grad_suffix = if self.grad { "_grad" } else { "" };
        format!("{}{}_kernel", self.name, grad_suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_assigns_sequential_ids() {
        let mut arena = IrArena::new();
        let a = arena.push(StmtKind::Const(ConstValue::I32(1)), DataType::I32);
        let b = arena.push(StmtKind::Const(ConstValue::I32(2)), DataType::I32);
        assert_eq!(a, StmtId(0));
        assert_eq!(b, StmtId(1));
        assert_eq!(arena.stmt(a).width, 1);
    }

    #[test]
    fn kernel_task_base_name() {
        let kernel = Kernel::new("init", IrArena::new(), Block::default());
        assert_eq!(kernel.task_base_name(), "init_kernel");

        let mut grad = Kernel::new("advect", IrArena::new(), Block::default());
        grad.grad = true;
        assert_eq!(grad.task_base_name(), "advect_grad_kernel");
    }

    #[test]
    fn offload_constructors() {
        let serial = OffloadedStmt::serial(Block::default());
        assert_eq!(serial.task_type, TaskType::Serial);

        let range = OffloadedStmt::range_for(0, 100, Block::default());
        assert_eq!((range.begin, range.end), (0, 100));
        assert!(!range.reversed);

        let listgen = OffloadedStmt::listgen(SNodeId(1));
        assert!(listgen.body.is_none());
    }

    #[test]
    fn comparison_predicate() {
        assert!(BinaryOp::CmpLe.is_comparison());
        assert!(!BinaryOp::Add.is_comparison());
    }
}
