use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Unexpected logits shape: {0}")]
    Shape(String),

    #[error("Empty input: nothing to generate from")]
    EmptyInput,

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Session store error: {0}")]
    Session(#[from] tower_sessions::session::Error),

    #[error("Template rendering error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<tokenizers::Error> for ChatError {
    fn from(err: tokenizers::Error) -> Self {
        ChatError::Tokenizer(err.to_string())
    }
}

impl From<ort::OrtError> for ChatError {
    fn from(err: ort::OrtError) -> Self {
        ChatError::Inference(err.to_string())
    }
}

impl From<ndarray::ShapeError> for ChatError {
    fn from(err: ndarray::ShapeError) -> Self {
        ChatError::Shape(err.to_string())
    }
}

pub type Result<T> = core::result::Result<T, ChatError>;
