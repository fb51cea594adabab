pub mod queue;
pub mod session;

/// The [`StateMachine`] trait provides calling semantics and indicates the upholding of invariants
/// that guarantee deterministic behavior.
///
/// # Functionality
/// State machines operate on defined inputs and outputs. The type groupings are provided by the
/// associated types [`Input`](StateMachine::Input) and [`Output`](StateMachine::Output), usually
/// enums with one variant per kind of input/output.
///
/// Method dispatch is defined by [`process_input`](StateMachine::process_input) and
/// [`poll_output`](StateMachine::poll_output), which map the unified input/output types onto the
/// inherent methods holding the actual logic.
///
/// # Invariants
/// A [`StateMachine`] must be pure: its operation must not depend on any external behavior of the
/// broader system. Implementors *must* uphold all of the following.
///
/// ## No Interior Mutability
/// All data is either immutable or mutable only through `&mut` access. No [`std::cell`] or
/// [`std::sync`] containers, and no `Rc`/`Arc` (their reference counts are not pure).
///
/// ## No IO
/// No [`std::io`], [`std::net`] or libraries wrapping them. This includes reading the system clock
/// or system entropy; time and randomness must be provided through input.
///
/// ## No Concurrency, No Async, No Blocking
/// No threads, no futures, no waiting. Suspension is the job of the container wrapping the state
/// machine: the machine only reports whether an input was accepted and the container decides
/// whether to wait and retry.
///
/// # Side Effects
/// Side effects that do not affect the logic of the state machine (logging, metrics) are allowed.
/// The logic *must not* rely on their outcome.
///
/// # Containers
/// The async session engine wraps these machines in a [`Mutex`](std::sync::Mutex) and adds waking
/// on top: [`FrameQueue`](crate::frame_queue::FrameQueue) drives a
/// [`QueueMachine`](queue::QueueMachine) and [`StreamSession`](crate::session::StreamSession)
/// drives a [`SessionStateMachine`](session::SessionStateMachine). Because the machines never
/// block, the lock is only ever held for the duration of a single input or poll.
pub trait StateMachine {
    /// The type of input that is [processed](StateMachine::process_input) by the state machine.
    type Input;
    /// The type of output that is [polled](StateMachine::poll_output) by the state machine.
    type Output;

    /// Process the provided `input` into the state machine.
    fn process_input(&mut self, input: Self::Input);

    /// Poll the state machine for output, returning the first available output if present.
    fn poll_output(&mut self) -> Option<Self::Output>;
}
