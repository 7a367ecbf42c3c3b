use std::mem;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, bounded, never};
use futures::{Stream, StreamExt};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};

/// Items buffered between the producer thread and the consumer.
pub const DEFAULT_CAPACITY: usize = 64;

/// Drains an asynchronous stream on a dedicated thread and hands its items
/// to a blocking consumer through a bounded channel.
///
/// The producer drives the stream on the ambient tokio runtime when there is
/// one and on a local executor otherwise. Dropping or finishing the bridge
/// disconnects the channel and joins the producer, so no producer outlives
/// its bridge.
#[derive(Debug)]
pub struct StreamBridge<T> {
    receiver: Receiver<T>,
    producer: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> StreamBridge<T> {
    pub fn spawn<S>(stream: S, capacity: usize) -> CacheResult<Self>
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let (sender, receiver) = bounded(capacity.max(1));
        let runtime = Handle::try_current().ok();

        let producer = thread::Builder::new()
            .name("cachestore-bridge".to_string())
            .spawn(move || {
                let drain = async move {
                    let mut stream = Box::pin(stream);
                    let mut produced = 0usize;
                    while let Some(item) = stream.next().await {
                        if sender.send(item).is_err() {
                            debug!(produced, "bridge consumer went away");
                            return;
                        }
                        produced += 1;
                    }
                    debug!(produced, "bridge stream exhausted");
                };
                match runtime {
                    Some(runtime) => runtime.block_on(drain),
                    None => futures::executor::block_on(drain),
                }
            })
            .map_err(|err| CacheError::Background {
                reason: format!("failed to spawn stream producer: {err}"),
            })?;

        Ok(Self {
            receiver,
            producer: Some(producer),
        })
    }
}

impl<T> StreamBridge<T> {
    /// Stops the producer and waits for it. Items not yet received are
    /// discarded.
    pub fn finish(mut self) -> CacheResult<()> {
        self.join()
    }

    fn join(&mut self) -> CacheResult<()> {
        let Some(producer) = self.producer.take() else {
            return Ok(());
        };
        // Dropping the only receiver unblocks a producer waiting on a full
        // channel.
        drop(mem::replace(&mut self.receiver, never()));
        producer.join().map_err(|_| CacheError::Background {
            reason: "stream producer panicked".to_string(),
        })
    }
}

impl<T> Iterator for StreamBridge<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.producer.as_ref()?;
        self.receiver.recv().ok()
    }
}

impl<T> Drop for StreamBridge<T> {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            warn!(error = %err, "stream bridge shut down uncleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_a_stream_without_a_runtime() -> CacheResult<()> {
        let mut bridge = StreamBridge::spawn(futures::stream::iter(0..5), 2)?;
        let items: Vec<i32> = bridge.by_ref().collect();
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
        bridge.finish()
    }

    #[test]
    fn finishing_early_releases_a_blocked_producer() -> CacheResult<()> {
        let mut bridge = StreamBridge::spawn(futures::stream::iter(0..10_000), 1)?;
        assert_eq!(bridge.next(), Some(0));
        bridge.finish()
    }
}
