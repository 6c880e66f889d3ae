// Queue domain:
// - Job and lease entities, and the repository contracts the stores implement.
// - Pure policy: priority from work origin, backoff from attempts.

#[cfg(test)]
pub mod clock;
pub mod entity;
pub mod priority;
pub mod repository;
pub mod retry;
