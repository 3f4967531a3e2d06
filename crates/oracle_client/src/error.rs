use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("local agent binding has no run handler")]
    NoRunHandler,
}
