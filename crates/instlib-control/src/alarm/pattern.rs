use instlib_core::{Instruction, InstrumentationHost, Trace};
use smallvec::SmallVec;

/// Builds the SSC marker for `value`: `mov ebx, value` followed by the
/// `addr32 fs nop` prefix sequence.
pub fn ssc_marker(value: u32) -> [u8; 8] {
    let mut marker = [0xbb, 0, 0, 0, 0, 0x64, 0x67, 0x90];
    marker[1..5].copy_from_slice(&value.to_le_bytes());
    marker
}

/// Returns the instructions of `trace` at which `pattern` starts.
///
/// The pattern may be one instruction, or span an instruction and the one
/// following it, inside a block or across a block boundary. The final
/// instruction of the trace is compared together with whatever code
/// follows the trace. Every instruction is reported at most once.
pub fn find_pattern<'a>(
    host: &dyn InstrumentationHost,
    trace: &'a Trace,
    pattern: &[u8],
) -> SmallVec<[&'a Instruction; 2]> {
    let length = pattern.len() as u64;
    let mut result = SmallVec::new();

    let mut instructions = trace.instructions().peekable();
    while let Some(instruction) = instructions.next() {
        let size = instruction.size();

        let candidate = match instructions.peek() {
            _ if size == length => true,
            Some(next) => size + next.size() == length,
            None => size < length,
        };

        if candidate && matches_at(host, instruction, pattern) {
            result.push(instruction);
        }
    }

    result
}

fn matches_at(host: &dyn InstrumentationHost, instruction: &Instruction, pattern: &[u8]) -> bool {
    let mut buffer = [0u8; 16];
    let buffer = &mut buffer[..pattern.len()];

    host.fetch_code(instruction.address(), buffer) == pattern.len() && buffer == pattern
}

#[cfg(test)]
mod tests {
    use instlib_core::{Address, BasicBlock, sim::Simulator};

    use super::*;

    #[test]
    fn marker_layout() {
        assert_eq!(
            ssc_marker(0x1122_3344),
            [0xbb, 0x44, 0x33, 0x22, 0x11, 0x64, 0x67, 0x90]
        );
    }

    fn addresses(found: &[&Instruction]) -> Vec<Address> {
        found.iter().map(|instruction| instruction.address()).collect()
    }

    #[test]
    fn straddle_within_block() {
        let sim = Simulator::new();
        let marker = ssc_marker(0x4711);

        let trace = Trace::single(vec![
            Instruction::new(0x1000u64, &[0x90]),
            Instruction::new(0x1001u64, &marker[..5]),
            Instruction::new(0x1006u64, &marker[5..]),
            Instruction::new(0x1009u64, &[0xc3]),
        ]);
        for instruction in trace.instructions() {
            sim.write_memory(instruction.address(), instruction.bytes());
        }

        let found = find_pattern(&*sim, &trace, &marker);
        assert_eq!(addresses(&found), [Address(0x1001)]);
    }

    #[test]
    fn straddle_across_blocks() {
        let sim = Simulator::new();
        let marker = ssc_marker(7);

        let trace = Trace::new(vec![
            BasicBlock::new(vec![
                Instruction::new(0x2000u64, &[0x90]),
                Instruction::new(0x2001u64, &marker[..5]),
            ]),
            BasicBlock::new(vec![
                Instruction::new(0x2006u64, &marker[5..]),
                Instruction::new(0x2009u64, &[0x90]),
            ]),
        ]);
        for instruction in trace.instructions() {
            sim.write_memory(instruction.address(), instruction.bytes());
        }

        let found = find_pattern(&*sim, &trace, &marker);
        assert_eq!(addresses(&found), [Address(0x2001)]);
    }

    #[test]
    fn trace_tail_joins_following_code() {
        let sim = Simulator::new();
        let marker = ssc_marker(7);

        let trace = Trace::single(vec![
            Instruction::new(0x3000u64, &[0x90]),
            Instruction::new(0x3001u64, &marker[..5]),
        ]);
        sim.write_memory(Address(0x3000), &[0x90]);
        sim.write_memory(Address(0x3001), &marker);

        let found = find_pattern(&*sim, &trace, &marker);
        assert_eq!(addresses(&found), [Address(0x3001)]);

        // Nothing mapped after the trace.
        let sim = Simulator::new();
        sim.write_memory(Address(0x3000), &[0x90]);
        sim.write_memory(Address(0x3001), &marker[..5]);
        assert!(find_pattern(&*sim, &trace, &marker).is_empty());
    }

    #[test]
    fn single_instruction_pattern() {
        let sim = Simulator::new();
        let nop = [0x0f, 0x1f, 0x00];

        let trace = Trace::single(vec![
            Instruction::new(0x4000u64, &nop),
            Instruction::new(0x4003u64, &[0x0f, 0x1f]),
            Instruction::new(0x4005u64, &[0x00]),
        ]);
        for instruction in trace.instructions() {
            sim.write_memory(instruction.address(), instruction.bytes());
        }

        let found = find_pattern(&*sim, &trace, &nop);
        assert_eq!(addresses(&found), [Address(0x4000), Address(0x4003)]);
    }
}
