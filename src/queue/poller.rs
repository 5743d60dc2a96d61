//! Interval poller bridging a batch-fetch closure into a job stream.
//!
//! Backends that have no native push mechanism poll their store on a fixed
//! interval. The poller runs the fetch closure on a background task and
//! forwards every item, or the fetch error, into a bounded channel exposed
//! as a stream. The stream ends when the token is cancelled or the
//! consumer goes away.

use std::time::Duration;

use futures_core::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Builder configuring the polling interval and channel capacity.
pub struct PollerBuilder {
    interval: Duration,
    channel_size: usize,
}

impl PollerBuilder {
    /// Create a builder polling at the given interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            channel_size: 64,
        }
    }

    /// Capacity of the channel buffering fetched items.
    pub fn channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }

    /// Spawn the polling task and return the item stream.
    ///
    /// `poll_fn` is invoked once per tick and may return an empty batch.
    /// Errors are forwarded as stream items so the consumer decides
    /// whether they are fatal.
    pub fn start<T, F, Fut>(
        self,
        cancel: CancellationToken,
        mut poll_fn: F,
    ) -> BoxStream<'static, Result<T, tower::BoxError>>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<T>, tower::BoxError>> + Send,
    {
        let (tx, rx) = mpsc::channel(self.channel_size);
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match poll_fn().await {
                            Ok(batch) => {
                                for item in batch {
                                    if tx.send(Ok(item)).await.is_err() {
                                        // Consumer dropped the stream.
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                if tx.send(Err(err)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn forwards_batches_and_errors_in_order() {
        let cancel = CancellationToken::new();
        let mut tick = 0;
        let mut stream = PollerBuilder::new(Duration::from_millis(10)).start(
            cancel.clone(),
            move || {
                tick += 1;
                async move {
                    match tick {
                        1 => Ok(vec![1, 2]),
                        2 => Err("boom".into()),
                        _ => Ok(vec![]),
                    }
                }
            },
        );

        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
        assert!(stream.next().await.unwrap().is_err());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_stream() {
        let cancel = CancellationToken::new();
        let mut stream =
            PollerBuilder::new(Duration::from_secs(3600)).start(cancel.clone(), || async {
                Ok(Vec::<u8>::new())
            });

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
