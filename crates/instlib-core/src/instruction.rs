use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::Address;

bitflags::bitflags! {
    /// Decoder-derived properties of an instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct InstructionFlags: u16 {
        /// Execution may continue at the next sequential instruction.
        const FALLTHROUGH = 1 << 0;

        /// The instruction enters the kernel (`syscall`, `sysenter`).
        const SYSCALL = 1 << 1;

        /// The instruction raises a software interrupt.
        const INTERRUPT = 1 << 2;

        /// `xend`, whose taken-branch point is not instrumentable.
        const XEND = 1 << 3;

        /// Part of a restricted transactional memory region
        /// (`xbegin`, `xend`, `xabort`).
        const RTM = 1 << 4;
    }
}

/// The instruction classes the library reacts to.
///
/// Everything else decodes to [`Opcode::Other`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// `int3`.
    Int3,

    /// `cpuid`.
    Cpuid,

    /// `xchg bx, bx`, the simulator magic instruction.
    XchgBxBx,

    /// Any other instruction.
    #[default]
    Other,
}

/// How an instruction transfers control.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlFlow {
    /// Sequential execution only.
    #[default]
    None,

    /// A branch or call with a target encoded in the instruction.
    Direct {
        /// Branch target.
        target: Address,

        /// Whether this is a call.
        call: bool,
    },

    /// A branch or call through a register or memory operand.
    Indirect {
        /// Whether this is a call.
        call: bool,
    },

    /// A return.
    Return,
}

/// A decoded instruction, as delivered by the instrumentation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    address: Address,
    bytes: SmallVec<[u8; 16]>,
    opcode: Opcode,
    control_flow: ControlFlow,
    flags: InstructionFlags,
    category: String,
    extension: String,
}

impl Instruction {
    /// Creates a sequential instruction at `address` encoded by `bytes`.
    pub fn new(address: impl Into<Address>, bytes: &[u8]) -> Self {
        debug_assert!(!bytes.is_empty(), "empty instruction encoding");

        Self {
            address: address.into(),
            bytes: SmallVec::from_slice(bytes),
            opcode: Opcode::Other,
            control_flow: ControlFlow::None,
            flags: InstructionFlags::FALLTHROUGH,
            category: String::new(),
            extension: String::new(),
        }
    }

    /// Sets the opcode class.
    pub fn with_opcode(mut self, opcode: Opcode) -> Self {
        self.opcode = opcode;
        self
    }

    /// Sets the control-flow kind.
    ///
    /// Any transfer clears [`InstructionFlags::FALLTHROUGH`]; conditional
    /// branches add it back with [`with_flags`].
    ///
    /// [`with_flags`]: Self::with_flags
    pub fn with_control_flow(mut self, control_flow: ControlFlow) -> Self {
        self.control_flow = control_flow;
        if control_flow != ControlFlow::None {
            self.flags.remove(InstructionFlags::FALLTHROUGH);
        }
        self
    }

    /// Adds decoder flags.
    pub fn with_flags(mut self, flags: InstructionFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the ISA category name (e.g. `NOP`, `CALL`, `SSE`).
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Sets the ISA extension name (e.g. `BASE`, `AVX2`).
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Returns the address of the instruction.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Returns the raw encoding.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the encoded length in bytes.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Returns the address of the next sequential instruction.
    pub fn next_address(&self) -> Address {
        self.address + self.size()
    }

    /// Returns the opcode class.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Returns the control-flow kind.
    pub fn control_flow(&self) -> ControlFlow {
        self.control_flow
    }

    /// Returns the decoder flags.
    pub fn flags(&self) -> InstructionFlags {
        self.flags
    }

    /// Returns the ISA category name.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Returns the ISA extension name.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Returns `true` if execution may continue sequentially.
    pub fn has_fallthrough(&self) -> bool {
        self.flags.contains(InstructionFlags::FALLTHROUGH)
    }

    /// Returns `true` if the instruction has a taken-branch point that can
    /// be instrumented.
    pub fn is_valid_for_taken_branch(&self) -> bool {
        self.control_flow != ControlFlow::None && !self.flags.contains(InstructionFlags::XEND)
    }

    /// Returns the target of a direct transfer.
    pub fn direct_target(&self) -> Option<Address> {
        match self.control_flow {
            ControlFlow::Direct { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Returns `true` for indirect branches and calls (not returns).
    pub fn is_indirect(&self) -> bool {
        matches!(self.control_flow, ControlFlow::Indirect { .. })
    }

    /// Returns `true` for returns.
    pub fn is_return(&self) -> bool {
        self.control_flow == ControlFlow::Return
    }

    /// Returns `true` for system calls and software interrupts.
    pub fn is_syscall_or_interrupt(&self) -> bool {
        self.flags
            .intersects(InstructionFlags::SYSCALL | InstructionFlags::INTERRUPT)
    }
}

/// A single-entry, single-exit run of instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    instructions: Vec<Instruction>,
}

impl BasicBlock {
    /// Creates a basic block.
    ///
    /// # Panics
    ///
    /// Panics if `instructions` is empty.
    pub fn new(instructions: Vec<Instruction>) -> Self {
        assert!(!instructions.is_empty(), "empty basic block");
        Self { instructions }
    }

    /// Returns the address of the first instruction.
    pub fn address(&self) -> Address {
        self.head().address()
    }

    /// Returns the first instruction.
    pub fn head(&self) -> &Instruction {
        &self.instructions[0]
    }

    /// Returns the last instruction.
    pub fn tail(&self) -> &Instruction {
        &self.instructions[self.instructions.len() - 1]
    }

    /// Returns the instructions in execution order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Returns the number of instructions.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Always `false`; blocks are never empty.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A single-entry, multiple-exit sequence of basic blocks, the unit the
/// engine hands to instrumentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    blocks: Vec<BasicBlock>,
}

impl Trace {
    /// Creates a trace.
    ///
    /// # Panics
    ///
    /// Panics if `blocks` is empty.
    pub fn new(blocks: Vec<BasicBlock>) -> Self {
        assert!(!blocks.is_empty(), "empty trace");
        Self { blocks }
    }

    /// Creates a trace holding one block of the given instructions.
    pub fn single(instructions: Vec<Instruction>) -> Self {
        Self::new(vec![BasicBlock::new(instructions)])
    }

    /// Returns the entry address.
    pub fn address(&self) -> Address {
        self.blocks[0].address()
    }

    /// Returns the address one past the last byte of the trace.
    pub fn end_address(&self) -> Address {
        self.blocks[self.blocks.len() - 1].tail().next_address()
    }

    /// Returns the number of code bytes covered by the trace.
    pub fn size(&self) -> u64 {
        self.end_address() - self.address()
    }

    /// Returns `true` if `address` lies within the trace.
    pub fn contains(&self, address: Address) -> bool {
        self.address() <= address && address < self.end_address()
    }

    /// Returns the basic blocks.
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    /// Iterates every instruction in execution order.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|block| block.instructions())
    }
}
