//! Notifier that writes failure notices to the log.

use async_trait::async_trait;

use crate::errors::NotifyError;
use crate::traits::{FailureNotice, Notifier};

/// Logs each failure notice at `warn`. The default when no mail transport
/// is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        tracing::warn!(
            flow_id = %notice.flow_id,
            flow_name = %notice.flow_name,
            execution_id = %notice.execution_id,
            failed_position = ?notice.failed_position,
            error = ?notice.error.as_ref().map(|e| e.message.as_str()),
            "flow execution failed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_succeeds() {
        let notice = FailureNotice {
            flow_id: "f".into(),
            flow_name: "Rows to Slack".into(),
            execution_id: "e".into(),
            failed_position: Some(2),
            error: None,
        };
        assert!(LogNotifier.notify(&notice).await.is_ok());
    }
}
