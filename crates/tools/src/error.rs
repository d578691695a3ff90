use serde_json::{json, Value};
use thiserror::Error;

pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Tool failures surfaced to the model as structured errors. The
/// scanner keeps running regardless of what happens in here.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Access denied: path '{0}' is outside the repository")]
    PathEscape(String),

    #[error("File not found: {path}")]
    NotFound {
        path: String,
        suggestions: Vec<String>,
    },

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Cannot read binary file: {0}")]
    BinaryFile(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("{0}")]
    MissingBinary(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ToolError {
    /// Machine-readable error kind for the model.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::PathEscape(_) => "path_escape",
            ToolError::NotFound { .. } => "not_found",
            ToolError::NotAFile(_) => "not_a_file",
            ToolError::NotADirectory(_) => "not_a_directory",
            ToolError::BinaryFile(_) => "binary_file",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::MissingBinary(_) => "missing_binary",
            ToolError::Execution(_) => "execution_failed",
            ToolError::IoError(_) => "io_error",
        }
    }

    /// The structured envelope returned to the model in place of data.
    pub fn to_envelope(&self) -> Value {
        let mut error = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let ToolError::NotFound { suggestions, .. } = self {
            if !suggestions.is_empty() {
                error["did_you_mean"] = json!(suggestions);
            }
        }
        json!({ "success": false, "error": error })
    }
}
