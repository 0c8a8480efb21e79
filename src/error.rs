use thiserror::Error;

/// Reasons a model/precision/adapter combination cannot be selected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("Model {0} not implemented")]
    NotImplemented(String),

    #[error("unsupported precision `{0}` (expected `int4` or `bf16`)")]
    UnsupportedPrecision(String),

    #[error("int4 only supported on CUDA devices (requested `{0}`)")]
    QuantizedRequiresCuda(String),

    #[error("unknown LoRA adapter `{0}`")]
    UnknownLora(String),

    #[error("invalid device `{0}` (expected `cpu`, `cuda[:N]` or `metal[:N]`)")]
    InvalidDevice(String),
}
