#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The submitted graph has no node whose kind is a recognised output kind.
    #[error("No output node found in workflow (expected one of: {expected})")]
    NoOutputNode { expected: String },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid artifact manifest: {0}")]
    InvalidManifest(String),
}
