// Draining the queue:
// - BurstWorker: leased polling loop, exits when idle or out of time.
// - SingleShotDrain: bounded, unleased drain for operator-triggered runs.
// Both go through one Processor so they share the retry curve.

pub mod burst;
pub mod drain;
pub mod guard;
pub mod lease;
pub mod processor;
