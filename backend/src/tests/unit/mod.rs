pub mod dispatcher;
pub mod engine_flow;
pub mod scheduler;
