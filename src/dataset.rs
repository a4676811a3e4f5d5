use std::path::{Path, PathBuf};

use crate::error::PruneError;

/// The two benchmark datasets this trainer knows how to lay out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Flower102,
    Birds200,
}

impl DatasetKind {
    /// Substring match, so names like `Flower102_small` still select Flower102.
    pub fn from_name(name: &str) -> Result<Self, PruneError> {
        if name.contains("Flower102") {
            Ok(Self::Flower102)
        } else if name.contains("Birds200") {
            Ok(Self::Birds200)
        } else {
            Err(PruneError::UnknownDataset(name.to_string()))
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Flower102 => "Flower102",
            Self::Birds200 => "Birds200",
        }
    }

    pub fn num_classes(self) -> i64 {
        match self {
            Self::Flower102 => 102,
            Self::Birds200 => 200,
        }
    }

    pub fn default_epochs(self) -> i64 {
        match self {
            Self::Flower102 => 50,
            Self::Birds200 => 10,
        }
    }

    pub fn has_val(self) -> bool {
        matches!(self, Self::Flower102)
    }

    pub fn layout(self, root: &Path) -> DatasetLayout {
        let base = root.join(self.dir_name());
        DatasetLayout {
            train: base.join("train"),
            val: self.has_val().then(|| base.join("val")),
            test: base.join("test"),
        }
    }
}

/// Split directories for one dataset.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub train: PathBuf,
    pub val: Option<PathBuf>,
    pub test: PathBuf,
}
