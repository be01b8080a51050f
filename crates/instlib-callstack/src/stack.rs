use instlib_core::Address;

use crate::CallStackManager;

/// A live call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEntry {
    sp: Address,
    target: Address,
}

impl CallEntry {
    /// Creates an entry for a call to `target` made with stack pointer `sp`.
    pub fn new(sp: Address, target: Address) -> Self {
        Self { sp, target }
    }

    /// Stack pointer at the call site.
    pub fn sp(&self) -> Address {
        self.sp
    }

    /// Call target.
    pub fn target(&self) -> Address {
        self.target
    }
}

/// A per-thread shadow call stack.
///
/// Entries are ordered oldest (bottom, highest stack pointer) to newest
/// (top, lowest stack pointer). Each mutation first drops frames the
/// application has already unwound past, so non-local exits such as
/// `longjmp` or exception unwinding are reconciled on the next call or
/// return.
///
/// A stack is only mutated by the application thread it shadows.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallStack {
    entries: Vec<CallEntry>,
}

impl CallStack {
    /// Creates an empty call stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call (or any non-return control transfer) to `target`
    /// about to be taken with stack pointer `sp`.
    pub fn process_call(&mut self, sp: Address, target: Address) {
        self.adjust_stack(sp);
        self.push_head(sp, target);
    }

    /// Records a return about to be taken with stack pointer `sp`.
    ///
    /// Returns without a matching call (instrumentation attached mid-call)
    /// are ignored.
    pub fn process_return(&mut self, sp: Address, ip: Address) {
        self.adjust_stack(sp);

        if self.entries.pop().is_none() {
            tracing::trace!(%ip, %sp, "return with empty call stack");
        }
    }

    /// Pops every frame recorded at a stack pointer at or below `sp`.
    ///
    /// The stack grows down, so such a frame has already been unwound.
    /// Re-entering the exact recorded stack pointer also ends the frame.
    pub fn adjust_stack(&mut self, sp: Address) {
        while let Some(top) = self.entries.last() {
            if sp < top.sp {
                break;
            }

            self.entries.pop();
        }
    }

    /// Pushes an entry without reconciling first.
    pub fn push_head(&mut self, sp: Address, target: Address) {
        self.entries.push(CallEntry::new(sp, target));
    }

    /// Returns the number of live frames.
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no live frames.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the target of the newest frame.
    pub fn top_target(&self) -> Option<Address> {
        self.entries.last().map(CallEntry::target)
    }

    /// Returns the target of the frame `n` levels below the top
    /// (`depth_target(0)` is the newest frame).
    ///
    /// # Panics
    ///
    /// Panics if `n >= self.depth()`.
    pub fn depth_target(&self, n: usize) -> Address {
        assert!(
            n < self.entries.len(),
            "call stack depth {n} out of range (depth {})",
            self.entries.len()
        );

        self.entries[self.entries.len() - 1 - n].target
    }

    /// Returns the live frames, oldest first.
    pub fn entries(&self) -> &[CallEntry] {
        &self.entries
    }

    /// Returns every call target, newest first.
    pub fn targets(&self) -> Vec<Address> {
        self.entries.iter().rev().map(CallEntry::target).collect()
    }

    /// Resolves and caches symbol information for every live frame.
    pub fn save_all_ips_info(&self, manager: &CallStackManager) {
        for entry in &self.entries {
            manager.ip_info(entry.target);
        }
    }

    /// Formats up to `depth` frames, newest first. A `depth` of zero still
    /// prints the newest frame.
    ///
    /// The first element is a header line, the last is a lone `"\n"`.
    pub fn emit_stack(&self, depth: usize, manager: &CallStackManager) -> Vec<String> {
        const WIDTH: usize = size_of::<u64>() * 2;

        let source_location = manager.options().source_location;
        let depth = depth.max(1);
        let mut out = Vec::with_capacity(depth.min(self.entries.len()) + 2);

        let mut header = format!("#  {:>WIDTH$}{:>20}{:>50}", "IP", " FUNCTION ", " IMAGE NAME ");
        if source_location {
            header.push_str(&format!("{:>120}", " FILE NAME:LINE:COLUMN"));
        }
        header.push('\n');
        out.push(header);

        for (id, entry) in self.entries.iter().rev().take(depth).enumerate() {
            let info = manager.ip_info(entry.target);

            let mut line = format!(
                "{id:>2}# 0x{:0WIDTH$x}  {:<20}{:<20}",
                entry.target.0, info.function_name, info.image_name
            );

            if source_location && let Some(file) = &info.file_name {
                line.push_str(&format!(" at {file}:{}", info.line));
                if info.column != 0 {
                    line.push_str(&format!(":{}", info.column));
                }
            }

            line.push('\n');
            out.push(line);
        }

        out.push(String::from("\n"));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(value: u64) -> Address {
        Address(value)
    }

    #[test]
    fn same_sp_reentry_replaces_frame() {
        let mut stack = CallStack::new();
        stack.process_call(a(0x1000), a(0xa));
        stack.process_call(a(0x1000), a(0xb));

        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.top_target(), Some(a(0xb)));

        // A return at the recorded SP unwinds the frame first, leaving
        // nothing to pop.
        stack.process_return(a(0x1000), a(0x50));
        assert!(stack.is_empty());
    }

    #[test]
    fn deeper_calls_are_kept() {
        let mut stack = CallStack::new();
        stack.process_call(a(0x1000), a(0xa));
        stack.process_call(a(0x0fff), a(0xb));

        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.depth_target(0), a(0xb));
        assert_eq!(stack.depth_target(1), a(0xa));
    }

    #[test]
    fn push_pop_balance() {
        let mut stack = CallStack::new();

        for i in 0..16u64 {
            stack.process_call(a(0x8000 - i * 0x20), a(0x400 + i));
        }
        assert_eq!(stack.depth(), 16);
        assert_eq!(stack.targets()[0], a(0x40f));

        // The callee returns with the return address on the stack, 8 bytes
        // below the call-site SP.
        for i in (0..16u64).rev() {
            stack.process_return(a(0x8000 - i * 0x20 - 8), a(0x900));
        }

        assert_eq!(stack.depth(), 0);
        assert!(stack.targets().is_empty());
    }

    #[test]
    fn reconciliation_leaves_no_stale_frames() {
        let mut stack = CallStack::new();

        // (is_call, sp) pairs with occasional jumps up the stack.
        let ops = [
            (true, 0x9000),
            (true, 0x8f00),
            (true, 0x8e00),
            (true, 0x8d00),
            (false, 0x8f80), // longjmp-style skip of two frames
            (true, 0x8f80),
            (true, 0x8e80),
            (false, 0x8e78),
            (true, 0x8800),
            (false, 0x9100), // unwinds everything
            (false, 0x9200),
            (true, 0x7000),
        ];

        for (is_call, sp) in ops {
            let sp = a(sp);
            if is_call {
                stack.process_call(sp, a(0x1));

                let (top, rest) = stack.entries().split_last().unwrap();
                assert_eq!(top.sp(), sp);
                assert!(rest.iter().all(|entry| entry.sp() > sp));
            }
            else {
                stack.process_return(sp, a(0x2));
                assert!(stack.entries().iter().all(|entry| entry.sp() > sp));
            }
        }
    }

    #[test]
    fn return_on_empty_stack_is_ignored() {
        let mut stack = CallStack::new();
        stack.process_return(a(0x1000), a(0x10));
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.top_target(), None);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn depth_target_out_of_range() {
        let mut stack = CallStack::new();
        stack.process_call(a(0x1000), a(0xa));
        stack.depth_target(1);
    }
}
