//! Record streams
//!
//! A bounded, schema-stamped, single-producer/single-consumer pipe of rows.
//! The producer stamps a schema exactly once, pushes any number of records,
//! and terminates with exactly one checkpoint (or an error). The bounded
//! buffer applies backpressure on the source driver; dropping the consumer
//! unblocks a mid-push producer with a cancellation error.
//!
//! ```ignore
//! let (mut tx, mut rx) = stream::channel(1024);
//! tx.set_schema(schema)?;
//! tx.push(record).await?;
//! tx.close(Checkpoint::Lsn(lsn)).await?;
//!
//! let schema = rx.schema().await?;
//! while let StreamItem::Record(record) = rx.next().await { /* ... */ }
//! ```

use crate::error::{ModelError, Result};
use crate::partition::Checkpoint;
use crate::schema::{QRecord, QRecordSchema};
use tokio::sync::{mpsc, watch};

/// Default bounded-buffer capacity, in rows.
pub const DEFAULT_STREAM_CAPACITY: usize = 4096;

/// Items observed by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// One row matching the stamped schema
    Record(QRecord),
    /// Terminal: stream finished at this source progress marker
    End(Checkpoint),
    /// Terminal: stream failed
    Err(ModelError),
}

/// Create a bounded record stream.
pub fn channel(capacity: usize) -> (QRecordSender, QRecordReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (schema_tx, schema_rx) = watch::channel(None);
    (
        QRecordSender {
            tx,
            schema_tx,
            schema: None,
        },
        QRecordReceiver {
            rx,
            schema_rx,
            done: false,
        },
    )
}

/// Producer half of a record stream.
pub struct QRecordSender {
    tx: mpsc::Sender<StreamItem>,
    schema_tx: watch::Sender<Option<QRecordSchema>>,
    schema: Option<QRecordSchema>,
}

impl QRecordSender {
    /// Stamp the stream's schema. Must be called exactly once, before any
    /// record.
    pub fn set_schema(&mut self, schema: QRecordSchema) -> Result<()> {
        if self.schema.is_some() {
            return Err(ModelError::schema("stream schema already stamped"));
        }
        // A lagging receiver only ever sees the latest value, which is fine:
        // the schema is written once.
        let _ = self.schema_tx.send(Some(schema.clone()));
        self.schema = Some(schema);
        Ok(())
    }

    /// The stamped schema, if any.
    pub fn schema(&self) -> Option<&QRecordSchema> {
        self.schema.as_ref()
    }

    /// Push one row. Validates arity against the stamped schema; kinds are
    /// the producer's obligation.
    pub async fn push(&mut self, record: QRecord) -> Result<()> {
        let schema = self
            .schema
            .as_ref()
            .ok_or_else(|| ModelError::schema("push before schema was stamped"))?;
        if record.len() != schema.len() {
            return Err(ModelError::schema(format!(
                "row has {} values, schema declares {} columns",
                record.len(),
                schema.len()
            )));
        }
        self.tx
            .send(StreamItem::Record(record))
            .await
            .map_err(|_| ModelError::Cancelled("record stream receiver dropped".into()))
    }

    /// Terminate the stream successfully at `checkpoint`.
    pub async fn close(self, checkpoint: Checkpoint) -> Result<()> {
        if self.schema.is_none() {
            return Err(ModelError::schema("close before schema was stamped"));
        }
        self.tx
            .send(StreamItem::End(checkpoint))
            .await
            .map_err(|_| ModelError::Cancelled("record stream receiver dropped".into()))
    }

    /// Terminate the stream with an error. Best effort: a dropped receiver
    /// has already observed a terminal condition.
    pub async fn fail(self, error: ModelError) {
        let _ = self.tx.send(StreamItem::Err(error)).await;
    }
}

/// Consumer half of a record stream.
pub struct QRecordReceiver {
    rx: mpsc::Receiver<StreamItem>,
    schema_rx: watch::Receiver<Option<QRecordSchema>>,
    done: bool,
}

impl QRecordReceiver {
    /// The stamped schema, waiting for the producer to stamp it if needed.
    pub async fn schema(&mut self) -> Result<QRecordSchema> {
        let stamped = self
            .schema_rx
            .wait_for(|s| s.is_some())
            .await
            .map_err(|_| {
                ModelError::StreamClosed("producer dropped before stamping a schema".into())
            })?;
        match &*stamped {
            Some(schema) => Ok(schema.clone()),
            None => Err(ModelError::StreamClosed(
                "producer dropped before stamping a schema".into(),
            )),
        }
    }

    /// Next item. After a terminal item, further calls report the stream as
    /// closed.
    pub async fn next(&mut self) -> StreamItem {
        if self.done {
            return StreamItem::Err(ModelError::StreamClosed(
                "record stream already terminated".into(),
            ));
        }
        match self.rx.recv().await {
            Some(item @ StreamItem::Record(_)) => item,
            Some(item) => {
                self.done = true;
                item
            }
            None => {
                self.done = true;
                StreamItem::Err(ModelError::StreamClosed(
                    "producer dropped without a checkpoint".into(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qvalue::{QValue, QValueKind};
    use crate::schema::QField;
    use std::time::Duration;

    fn schema() -> QRecordSchema {
        QRecordSchema::new(vec![
            QField::new("id", QValueKind::Int64, false),
            QField::new("name", QValueKind::String, true),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_push_then_close() {
        let (mut tx, mut rx) = channel(8);
        tx.set_schema(schema()).unwrap();
        tx.push(vec![QValue::Int64(1), QValue::String("a".into())])
            .await
            .unwrap();
        tx.close(Checkpoint::Lsn(42)).await.unwrap();

        assert_eq!(rx.schema().await.unwrap(), schema());
        assert!(matches!(rx.next().await, StreamItem::Record(_)));
        assert_eq!(rx.next().await, StreamItem::End(Checkpoint::Lsn(42)));
        assert!(matches!(rx.next().await, StreamItem::Err(_)));
    }

    #[tokio::test]
    async fn test_push_before_schema() {
        let (mut tx, _rx) = channel(8);
        let err = tx.push(vec![QValue::Int64(1)]).await.unwrap_err();
        assert!(matches!(err, ModelError::Schema(_)));
    }

    #[tokio::test]
    async fn test_schema_stamped_once() {
        let (mut tx, _rx) = channel(8);
        tx.set_schema(schema()).unwrap();
        assert!(tx.set_schema(schema()).is_err());
    }

    #[tokio::test]
    async fn test_arity_validated() {
        let (mut tx, _rx) = channel(8);
        tx.set_schema(schema()).unwrap();
        let err = tx.push(vec![QValue::Int64(1)]).await.unwrap_err();
        assert!(err.to_string().contains("1 values"));
    }

    #[tokio::test]
    async fn test_backpressure() {
        let (mut tx, _rx) = channel(1);
        tx.set_schema(schema()).unwrap();
        tx.push(vec![QValue::Int64(1), QValue::Null(QValueKind::String)])
            .await
            .unwrap();

        // Buffer full, second push must block until the consumer drains.
        let second = tx.push(vec![QValue::Int64(2), QValue::Null(QValueKind::String)]);
        let timed_out = tokio::time::timeout(Duration::from_millis(50), second).await;
        assert!(timed_out.is_err());
    }

    #[tokio::test]
    async fn test_receiver_drop_cancels_producer() {
        let (mut tx, rx) = channel(1);
        tx.set_schema(schema()).unwrap();
        tx.push(vec![QValue::Int64(1), QValue::Null(QValueKind::String)])
            .await
            .unwrap();
        drop(rx);

        let err = tx
            .push(vec![QValue::Int64(2), QValue::Null(QValueKind::String)])
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_producer_drop_without_checkpoint() {
        let (mut tx, mut rx) = channel(8);
        tx.set_schema(schema()).unwrap();
        drop(tx);
        assert!(matches!(rx.next().await, StreamItem::Err(ModelError::StreamClosed(_))));
    }

    #[tokio::test]
    async fn test_error_terminates_stream() {
        let (mut tx, mut rx) = channel(8);
        tx.set_schema(schema()).unwrap();
        tx.fail(ModelError::schema("boom")).await;
        assert!(matches!(rx.next().await, StreamItem::Err(ModelError::Schema(_))));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let (mut tx, mut rx) = channel(8);
        tx.set_schema(schema()).unwrap();
        tx.close(Checkpoint::Lsn(7)).await.unwrap();
        assert_eq!(rx.next().await, StreamItem::End(Checkpoint::Lsn(7)));
    }

    #[tokio::test]
    async fn test_schema_waits_for_stamp() {
        let (mut tx, mut rx) = channel(8);
        let waiter = tokio::spawn(async move { rx.schema().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.set_schema(schema()).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), schema());
    }
}
