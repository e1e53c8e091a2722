use std::any::Any;

use crate::{ErrorExt, StatusCode};

/// Ошибки жизненного цикла исполнителя ввода-вывода.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// Не удалось запустить runtime (фатально для процесса)
    StartFailed { reason: String },
    /// Исполнитель остановлен и не принимает задачи
    Stopped,
}

impl std::fmt::Display for ExecutorError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Self::StartFailed { reason } => write!(f, "I/O executor failed to start: {reason}"),
            Self::Stopped => write!(f, "I/O executor is stopped"),
        }
    }
}

impl std::error::Error for ExecutorError {}

impl ErrorExt for ExecutorError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::StartFailed { .. } => StatusCode::ExecutorStartFailed,
            Self::Stopped => StatusCode::ExecutorStopped,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_failure_is_fatal() {
        let err = ExecutorError::StartFailed {
            reason: "no threads".into(),
        };
        assert!(err.status_code().is_fatal());
        assert!(err.to_string().contains("no threads"));
        assert!(!ExecutorError::Stopped.status_code().is_fatal());
    }
}
