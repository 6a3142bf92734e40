//! A mapping-free FIFO queue with a single blocking consumer.
//!
//! `push` never blocks. `pop` suspends until an item arrives or a
//! linked [`CancellationToken`] fires, in which case it fails with
//! [`PopError::Cancelled`]. No capacity bound lives here — that is
//! layered on top by `warp_channel`.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum PopError {
  #[error("pop cancelled")]
  Cancelled,
}

/// FIFO hand-off queue. Only one consumer is expected to call `pop`
/// at a time; multiple producers may call `push` freely.
pub struct AsyncQueue<T> {
  items: Mutex<VecDeque<T>>,
  notify: Notify,
}

impl<T> Default for AsyncQueue<T> {
  fn default() -> Self {
    Self {
      items: Mutex::new(VecDeque::new()),
      notify: Notify::new(),
    }
  }
}

impl<T> AsyncQueue<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Enqueue an item. Never blocks.
  pub fn push(&self, item: T) {
    self.items.lock().expect("queue mutex poisoned").push_back(item);
    self.notify.notify_one();
  }

  /// Dequeue the oldest item, waiting if the queue is empty until
  /// either an item arrives or `cancel` fires.
  pub async fn pop(
    &self,
    cancel: &CancellationToken,
  ) -> Result<T, PopError> {
    loop {
      // Register interest in notification before checking the queue,
      // so a concurrent push between the check and the await can't
      // be missed.
      let notified = self.notify.notified();
      if let Some(item) =
        self.items.lock().expect("queue mutex poisoned").pop_front()
      {
        return Ok(item);
      }
      tokio::select! {
        _ = notified => continue,
        _ = cancel.cancelled() => return Err(PopError::Cancelled),
      }
    }
  }

  pub fn len(&self) -> usize {
    self.items.lock().expect("queue mutex poisoned").len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::time::Duration;

  #[tokio::test]
  async fn pop_returns_pushed_item_in_order() {
    let queue = AsyncQueue::new();
    queue.push(1);
    queue.push(2);
    let cancel = CancellationToken::new();
    assert_eq!(queue.pop(&cancel).await.unwrap(), 1);
    assert_eq!(queue.pop(&cancel).await.unwrap(), 2);
  }

  #[tokio::test]
  async fn pop_suspends_until_push() {
    let queue = Arc::new(AsyncQueue::new());
    let cancel = CancellationToken::new();
    let pop_queue = queue.clone();
    let pop_cancel = cancel.clone();
    let handle =
      tokio::spawn(
        async move { pop_queue.pop(&pop_cancel).await },
      );
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.push("hello");
    assert_eq!(handle.await.unwrap().unwrap(), "hello");
  }

  #[tokio::test]
  async fn pop_fails_with_cancelled_on_cancel() {
    let queue: AsyncQueue<()> = AsyncQueue::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
      queue.pop(&cancel).await,
      Err(PopError::Cancelled)
    ));
  }
}
