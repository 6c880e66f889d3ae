// Image pipeline: hash -> safety -> embed for one subject.
// A stage that finishes with `Continue` enqueues the next one; there is no
// separate "pipeline complete" state.

pub mod dispatch;
pub mod enqueuer;
