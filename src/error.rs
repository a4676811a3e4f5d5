use thiserror::Error;

#[derive(Debug, Error)]
pub enum PruneError {
    #[error("unsupported architecture '{0}' (only 'alexnet' is available)")]
    UnsupportedArch(String),

    #[error("unknown dataset '{0}' (expected a name containing Flower102 or Birds200)")]
    UnknownDataset(String),

    #[error("no class directories found under {0}")]
    NoClasses(String),

    #[error("checkpoint is missing tensor '{0}'")]
    MissingTensor(String),

    #[error("shape mismatch for '{name}': model has {expected:?}, checkpoint has {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    #[error("checkpoint has unexpected tensor '{0}'")]
    UnexpectedTensor(String),

    #[error("unrecognised checkpoint layout in {0}")]
    UnknownSchema(String),

    #[error("plain alexnet checkpoint has {found} tensors, expected {expected}")]
    TensorCount { expected: usize, found: usize },
}
