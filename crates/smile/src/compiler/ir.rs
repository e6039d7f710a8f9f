//! Compiler intermediate representation (design note §4.4).
//!
//! Grounded on `ouros`'s `CodeBuilder` (`bytecode/builder.rs`): emit
//! forward, patch jump targets once the target is known. Spec.md describes
//! the IR as "a doubly-linked list of `IntermediateInstruction` records" with
//! `branchTarget`/successor pointers; here a flat `Vec<IrInstr>` plays that
//! role (index order is the successor link, `Label` ids are resolved against
//! a side table at `linearize` time), which is the natural Rust shape for
//! what the C original needed raw pointers for.

use crate::bytecode::{ByteCode, ByteCodeSegment, Opcode, Operand};

/// One not-yet-linearized instruction. Net stack effect is tracked per
/// instruction so compile-time stack-delta accounting (design note §8's
/// invariant that all paths to a reachable instruction agree on depth) can be
/// verified by simulation in tests rather than asserted here.
#[derive(Debug, Clone)]
pub struct IrInstr {
    pub opcode: Opcode,
    pub operand: IrOperand,
}

#[derive(Debug, Clone)]
pub enum IrOperand {
    None,
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Real64Bits(u64),
    Float64(f64),
    Symbol(crate::intern::Symbol),
    Index(u32),
    Pair(i32, i32),
    Bool(bool),
    /// Unresolved forward/backward reference to a `Label` instruction.
    Label(u32),
    /// A cross-function `till`-flag escape: how many closure-parent hops to
    /// the owning frame, the till-id, and which flag of that till is being
    /// invoked. Unlike `Label`, this isn't resolved during linearization —
    /// the target address lives in the owning function's `till_exits` table
    /// (see `UserFunctionInfo`), since the jump target is in a *different*
    /// segment than this instruction.
    TillEscape { depth: u32, till_id: u32, flag: crate::intern::Symbol },
}

/// A unit of emission: a sequence of IR instructions plus the net operand
/// stack delta they leave (design note §4.4 `CompiledBlock`). Blocks compose by
/// concatenation; `finalStackDelta` lets compound constructs (e.g. `$if`)
/// verify both arms leave the stack in the same state.
#[derive(Debug, Clone, Default)]
pub struct CompiledBlock {
    pub instructions: Vec<IrInstr>,
    pub final_stack_delta: i32,
}

impl CompiledBlock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, opcode: Opcode, operand: IrOperand, stack_delta: i32) {
        self.instructions.push(IrInstr { opcode, operand });
        self.final_stack_delta += stack_delta;
    }

    pub fn append(&mut self, mut other: Self) {
        self.final_stack_delta += other.final_stack_delta;
        self.instructions.append(&mut other.instructions);
    }

    pub fn label(&mut self, id: u32) {
        self.instructions.push(IrInstr {
            opcode: Opcode::Label,
            operand: IrOperand::Label(id),
        });
    }

    pub fn jump(&mut self, opcode: Opcode, label: u32, stack_delta: i32) {
        self.push(opcode, IrOperand::Label(label), stack_delta);
    }
}

/// Assigns each `Label` instruction an address, resolves every branch's
/// label reference to a signed relative instruction-count offset, drops the
/// label pseudo-instructions, and copies the rest into a flat
/// `ByteCodeSegment` (design note §4.4 "Intermediate -> bytecode").
///
/// Also returns the resolved `Label id -> address` map, since compile-time
/// callers that need an absolute landing address rather than a relative
/// branch offset — cross-function `till` escapes, whose label lives in this
/// segment but whose jump instruction lives in a callee's segment entirely —
/// can't express that as a `BranchTarget`.
#[must_use]
pub fn linearize(block: &CompiledBlock) -> (ByteCodeSegment, ahash::AHashMap<u32, u32>) {
    let mut addresses = ahash::AHashMap::new();
    let mut address = 0i64;
    for instr in &block.instructions {
        if let (Opcode::Label, IrOperand::Label(id)) = (instr.opcode, &instr.operand) {
            addresses.insert(*id, address);
        } else {
            address += 1;
        }
    }

    let mut segment = ByteCodeSegment::new();
    let mut address = 0i64;
    for instr in &block.instructions {
        if matches!(instr.opcode, Opcode::Label) {
            continue;
        }
        let operand = match &instr.operand {
            IrOperand::None => Operand::None,
            IrOperand::Byte(b) => Operand::Byte(*b),
            IrOperand::Int16(v) => Operand::Int16(*v),
            IrOperand::Int32(v) => Operand::Int32(*v),
            IrOperand::Int64(v) => Operand::Int64(*v),
            IrOperand::Real64Bits(v) => Operand::Real64Bits(*v),
            IrOperand::Float64(v) => Operand::Float64(*v),
            IrOperand::Symbol(s) => Operand::Symbol(*s),
            IrOperand::Index(i) => Operand::Index(*i),
            IrOperand::Pair(a, b) => Operand::Pair(*a, *b),
            IrOperand::Bool(b) => Operand::Bool(*b),
            IrOperand::TillEscape { depth, till_id, flag } => {
                Operand::TillEscape { depth: *depth, till_id: *till_id, flag: *flag }
            }
            IrOperand::Label(id) => {
                let target = *addresses.get(id).expect("unresolved label");
                let offset = i32::try_from(target - address).expect("branch offset overflow");
                Operand::BranchTarget(offset)
            }
        };
        segment.push(ByteCode::new(instr.opcode, operand));
        address += 1;
    }

    let addresses = addresses
        .into_iter()
        .map(|(id, addr)| (id, u32::try_from(addr).expect("segment longer than u32::MAX")))
        .collect();
    (segment, addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jump_resolves_to_positive_offset() {
        let mut block = CompiledBlock::new();
        block.jump(Opcode::Jmp, 0, 0);
        block.push(Opcode::LdNull, IrOperand::None, 1);
        block.label(0);
        block.push(Opcode::Pop1, IrOperand::None, -1);
        let (segment, _) = linearize(&block);
        assert_eq!(segment.len(), 3);
        match &segment.instructions[0].operand {
            Operand::BranchTarget(offset) => assert_eq!(*offset, 2),
            other => panic!("expected branch target, got {other:?}"),
        }
    }
}
