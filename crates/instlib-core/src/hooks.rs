use crate::{Address, Context, Instruction, ThreadId};

/// Where, relative to an instruction, an analysis hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IPoint {
    /// Before the instruction executes.
    Before,

    /// After the instruction executes and falls through.
    After,

    /// After the instruction executes and its branch is taken.
    TakenBranch,
}

/// Ordering stage of hooks sharing one instruction point.
///
/// Hooks run by stage, then by insertion order. [`CallOrder::Late`] is the
/// second delivery stage: it observes the completed effect of everything
/// the earlier stages did at the same point.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallOrder {
    /// Runs before default hooks.
    First,

    /// The default stage.
    #[default]
    Default,

    /// Runs after all other hooks.
    Late,
}

/// Arguments passed to an analysis hook.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisArgs<'a> {
    /// The executing thread.
    pub tid: ThreadId,

    /// Address of the instrumented instruction.
    pub ip: Address,

    /// Register state at the hook.
    pub context: &'a Context,

    /// Runtime branch target, set only at [`IPoint::TakenBranch`].
    pub branch_target: Option<Address>,
}

/// An analysis hook.
pub type AnalysisFn = Box<dyn Fn(&AnalysisArgs<'_>) + Send + Sync>;

/// An analysis hook bound to an instruction.
pub struct AnalysisCall {
    /// Instrumented instruction.
    pub address: Address,

    /// Instruction point.
    pub point: IPoint,

    /// Ordering stage.
    pub order: CallOrder,

    /// The hook itself.
    pub callback: AnalysisFn,
}

/// Hooks collected while instrumenting one trace.
#[derive(Default)]
pub struct TraceHooks {
    calls: Vec<AnalysisCall>,
    deleted: Vec<Address>,
}

impl TraceHooks {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a hook for `instruction` at `point`.
    pub fn insert(
        &mut self,
        instruction: &Instruction,
        point: IPoint,
        order: CallOrder,
        callback: impl Fn(&AnalysisArgs<'_>) + Send + Sync + 'static,
    ) {
        debug_assert!(
            point != IPoint::After || instruction.has_fallthrough(),
            "after-point on an instruction without fall-through"
        );

        self.calls.push(AnalysisCall {
            address: instruction.address(),
            point,
            order,
            callback: Box::new(callback),
        });
    }

    /// Removes `instruction` from the generated code.
    ///
    /// Hooks attached to it still run.
    pub fn delete(&mut self, instruction: &Instruction) {
        self.deleted.push(instruction.address());
    }

    /// Returns the hooks for `address` at `point`, in execution order.
    pub fn calls(&self, address: Address, point: IPoint) -> Vec<&AnalysisCall> {
        let mut calls = self
            .calls
            .iter()
            .filter(|call| call.address == address && call.point == point)
            .collect::<Vec<_>>();

        // Stable, so insertion order is kept within a stage.
        calls.sort_by_key(|call| call.order);
        calls
    }

    /// Returns the number of inserted hooks.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Returns `true` if no hook was inserted.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Returns `true` if the instruction at `address` was deleted.
    pub fn is_deleted(&self, address: Address) -> bool {
        self.deleted.contains(&address)
    }
}
