pub mod enrich;
pub mod maps;
pub mod pipeline;
pub mod retry;
pub mod worker;

pub use worker::{Collaborators, TaskWorker};
