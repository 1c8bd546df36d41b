use pgjobs::jobs::{handler_fn, HandlerRegistry, Job, JobHandler};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

fn parse_payload<T: for<'de> Deserialize<'de>>(payload: &Value) -> anyhow::Result<T> {
    serde_json::from_value(payload.clone()).map_err(|e| anyhow::anyhow!("bad payload: {e}"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParseBookPayload {
    book_id: i64,
}

/// Example ingestion handler. Re-running it for the same book just produces
/// the same result, which is what the queue's retries require.
struct ParseBook;

#[async_trait::async_trait]
impl JobHandler for ParseBook {
    fn job_type(&self) -> &str {
        "parseBook"
    }

    async fn handle(&self, payload: &Value, job: &Job) -> anyhow::Result<Value> {
        let payload: ParseBookPayload = parse_payload(payload)?;
        tracing::debug!(job_id = %job.id, book_id = payload.book_id, "parsing book");
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(json!({ "bookId": payload.book_id, "chaptersCount": 12 }))
    }
}

pub fn build_registry() -> Arc<HandlerRegistry> {
    let registry = HandlerRegistry::new();

    // Demo handlers. Replace these with your real handlers.
    registry.register(handler_fn("demo_ok", |_payload, _job| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(json!({ "ok": true }))
    }));
    registry.register(handler_fn("fail_me", |_payload, _job| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Err(anyhow::anyhow!("simulated timeout"))
    }));
    registry.register(ParseBook);

    Arc::new(registry)
}
