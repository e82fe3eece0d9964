use thiserror::Error;

/// 注册表错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid registration: {field} {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Service instance not found: {0}")]
    NotFound(String),
}

impl RegistryError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        RegistryError::Validation {
            field,
            reason: reason.into(),
        }
    }
}
