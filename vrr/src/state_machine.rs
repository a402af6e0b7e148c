/// The application service driven by the replication core.
///
/// The core makes an up-call for every operation once it commits, in strict
/// op-number order, exactly once per replica. The returned reply is cached in
/// the client table (for duplicate suppression) and carried on the emitted
/// commit entry.
pub trait StateMachine<Op, R> {
    fn new() -> Self;

    /// Apply a committed operation and produce the reply for its client.
    fn apply(&mut self, operation: &Op, op_number: usize) -> R;
}
