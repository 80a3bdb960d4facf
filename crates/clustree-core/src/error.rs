use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ClusTreeError {
    /// Point length differs from the dimensionality fixed by the first insert.
    DimensionMismatch { expected: usize, found: usize },
    EmptyPoint,
    NonFinite { index: usize },
    InvalidConfig(String),
}

impl fmt::Display for ClusTreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusTreeError::DimensionMismatch { expected, found } => {
                write!(f, "wrong dimensionality: expected {expected}, found {found}")
            }
            ClusTreeError::EmptyPoint => write!(f, "point has no coordinates"),
            ClusTreeError::NonFinite { index } => {
                write!(f, "coordinate {index} is not a finite number")
            }
            ClusTreeError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ClusTreeError {}

pub type Result<T> = std::result::Result<T, ClusTreeError>;
