//! Panic containment for stage runs.
//!
//! A stage is third-party code. A panic inside one must end that job as a
//! fatal failure, not take down the executor task silently.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::types::{Error, Result};

/// Drive `future` to completion, converting a panic into `Error::Internal`.
pub async fn with_recovery_async<F, T>(future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&*panic_payload);
            tracing::error!(
                operation = operation_name,
                panic = %panic_msg,
                "async_panic_recovered"
            );

            Err(Error::internal(format!(
                "Panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_recovery_async_success() {
        let result = with_recovery_async(async { 42 }, "async_test").await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_recovery_async_panic_str() {
        let result: Result<()> = with_recovery_async(
            async {
                panic!("stage exploded");
            },
            "stage:proposer",
        )
        .await;

        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("Panic in stage:proposer"));
        assert!(msg.contains("stage exploded"));
    }

    #[tokio::test]
    async fn test_with_recovery_async_panic_string() {
        let detail = String::from("dynamic panic message");
        let result: Result<()> = with_recovery_async(
            async move {
                panic!("{}", detail);
            },
            "stage:challenger",
        )
        .await;

        assert!(result
            .unwrap_err()
            .to_string()
            .contains("dynamic panic message"));
    }

    #[test]
    fn test_extract_panic_message_unknown_payload() {
        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(extract_panic_message(&*payload), "Unknown panic (no message)");
    }
}
