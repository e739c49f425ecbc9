use std::fmt::Display;

/// Errors produced while resolving, loading or running a diffusion model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The model source is malformed: a bad model id, or a file which is not a DDUF container.
    #[error("invalid model source: {0}")]
    InvalidSource(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    NetworkError(String),

    /// The packaged container or a weight file could not be parsed, or declares byte ranges
    /// outside of its backing storage.
    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    #[error("unsupported quantization: {0}")]
    UnsupportedQuantization(String),

    #[error("missing weight `{0}`")]
    MissingWeight(String),

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    /// Generation parameters were rejected before any computation ran.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("generation cancelled before step {0}")]
    Cancelled(usize),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Numeric backend failure, for example running out of device memory.
    #[error("backend error: {0}")]
    Backend(candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

const ENGINE_CONTEXT: &str = "diffusion_engine";

impl Error {
    pub fn corrupt(msg: impl Display) -> Self {
        Self::CorruptContainer(msg.to_string())
    }

    pub fn validation(msg: impl Display) -> Self {
        Self::Validation(msg.to_string())
    }

    pub fn invalid_config(msg: impl Display) -> Self {
        Self::InvalidConfig(msg.to_string())
    }

    /// Wrap this error so it can travel through code returning `candle_core::Result`.
    /// Converting back with `Error::from` recovers the original variant.
    pub fn into_candle(self) -> candle_core::Error {
        candle_core::Error::WrappedContext {
            wrapped: Box::new(self),
            context: ENGINE_CONTEXT.to_string(),
        }
        .bt()
    }
}

impl From<candle_core::Error> for Error {
    fn from(err: candle_core::Error) -> Self {
        match err {
            candle_core::Error::WithBacktrace { inner, .. }
            | candle_core::Error::Context { inner, .. }
            | candle_core::Error::WithPath { inner, .. } => Self::from(*inner),
            candle_core::Error::CannotFindTensor { path } => Self::MissingWeight(path),
            candle_core::Error::UnexpectedShape { msg, expected, got } => Self::ShapeMismatch {
                name: msg
                    .strip_prefix("shape mismatch for ")
                    .unwrap_or(&msg)
                    .to_string(),
                expected: expected.dims().to_vec(),
                got: got.dims().to_vec(),
            },
            candle_core::Error::WrappedContext { wrapped, context } => {
                match wrapped.downcast::<Error>() {
                    Ok(err) => *err,
                    Err(wrapped) => {
                        Self::Backend(candle_core::Error::WrappedContext { wrapped, context })
                    }
                }
            }
            other => Self::Backend(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Shape;

    use super::Error;

    #[test]
    fn classifies_missing_tensor_through_backtrace() {
        let err = candle_core::Error::CannotFindTensor {
            path: "proj_out.weight".to_string(),
        }
        .bt();
        let err = candle_core::Error::WithBacktrace {
            inner: Box::new(err),
            backtrace: Box::new(std::backtrace::Backtrace::disabled()),
        };
        assert!(matches!(Error::from(err), Error::MissingWeight(name) if name == "proj_out.weight"));
    }

    #[test]
    fn classifies_shape_mismatch() {
        let err = candle_core::Error::UnexpectedShape {
            msg: "shape mismatch for x_embedder.weight".to_string(),
            expected: Shape::from((4, 4)),
            got: Shape::from((4, 5)),
        };
        match Error::from(err) {
            Error::ShapeMismatch {
                name,
                expected,
                got,
            } => {
                assert_eq!(name, "x_embedder.weight");
                assert_eq!(expected, vec![4, 4]);
                assert_eq!(got, vec![4, 5]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn recovers_wrapped_engine_errors() {
        let err = Error::UnsupportedQuantization("bitsandbytes__int2".to_string()).into_candle();
        assert!(matches!(
            Error::from(err),
            Error::UnsupportedQuantization(kind) if kind == "bitsandbytes__int2"
        ));
    }
}
