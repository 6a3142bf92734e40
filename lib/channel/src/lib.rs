//! Generic single-producer/single-consumer stream with optional
//! capacity-based backpressure, idempotent close, and a cancellation
//! handle other waits can link against.
//!
//! Built directly on [`warp_queue::AsyncQueue`]: the queue carries the
//! FIFO ordering, this layer adds capacity and close semantics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use warp_queue::{AsyncQueue, PopError};

enum Envelope<T> {
  Item(T, Option<oneshot::Sender<()>>),
  Close,
}

struct Inner<T> {
  queue: AsyncQueue<Envelope<T>>,
  /// `None` when capacity is 0 (rendezvous); `Some` otherwise, with
  /// `capacity` permits available up front.
  permits: Option<Semaphore>,
  closed: AtomicBool,
  signal: CancellationToken,
}

/// Create a channel with the given capacity. `capacity == 0` is an
/// unbuffered rendezvous: `send` only completes once the matching
/// `recv` begins.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
  let inner = Arc::new(Inner {
    queue: AsyncQueue::new(),
    permits: (capacity > 0).then(|| Semaphore::new(capacity)),
    closed: AtomicBool::new(false),
    signal: CancellationToken::new(),
  });
  let recv_cancel = inner.signal.clone();
  (
    Sender {
      inner: inner.clone(),
    },
    Receiver {
      inner,
      cancel: recv_cancel,
    },
  )
}

/// Composes several cancellation handles into one that fires the
/// first time any source fires.
pub fn link(
  sources: impl IntoIterator<Item = CancellationToken>,
) -> CancellationToken {
  let combined = CancellationToken::new();
  for source in sources {
    let combined = combined.clone();
    tokio::spawn(async move {
      source.cancelled().await;
      combined.cancel();
    });
  }
  combined
}

pub struct Sender<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for Sender<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T: Send + 'static> Sender<T> {
  /// Deliver `v` to the receiver. Fails immediately if the channel is
  /// already closed. Otherwise: the first `capacity` sends complete
  /// without waiting for receipt; beyond that, `send` completes only
  /// once the receiver has consumed enough to keep at most `capacity`
  /// items unacknowledged. `capacity == 0` is a rendezvous: `send`
  /// completes only after the matching `recv` begins.
  pub async fn send(&self, v: T) -> anyhow::Result<()> {
    if self.inner.closed.load(Ordering::Acquire) {
      return Err(anyhow!("send on closed channel"));
    }
    match &self.inner.permits {
      Some(permits) => {
        let permit = tokio::select! {
          permit = permits.acquire() => permit.map_err(|_| anyhow!("send on closed channel"))?,
          _ = self.inner.signal.cancelled() => return Err(anyhow!("send on closed channel")),
        };
        permit.forget();
        self.inner.queue.push(Envelope::Item(v, None));
        Ok(())
      }
      None => {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner.queue.push(Envelope::Item(v, Some(ack_tx)));
        tokio::select! {
          res = ack_rx => res.map_err(|_| anyhow!("send on closed channel")),
          _ = self.inner.signal.cancelled() => Err(anyhow!("send on closed channel")),
        }
      }
    }
  }

  /// Idempotent. Causes pending and future `recv`s to terminate and
  /// future `send`s to fail.
  pub fn close(&self) {
    if self
      .inner
      .closed
      .compare_exchange(
        false,
        true,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok()
    {
      self.inner.queue.push(Envelope::Close);
      self.inner.signal.cancel();
    }
  }

  /// A future that completes once the channel is closed.
  pub async fn closed(&self) {
    self.inner.signal.cancelled().await;
  }

  /// A cancellation handle that fires on close, for linking.
  pub fn signal(&self) -> CancellationToken {
    self.inner.signal.clone()
  }
}

pub struct Receiver<T> {
  inner: Arc<Inner<T>>,
  cancel: CancellationToken,
}

impl<T: Send + 'static> Receiver<T> {
  /// Link an additional cancellation source into this receiver's
  /// waits — e.g. "stop when the transport dies OR the request is
  /// aborted". Safe to call more than once; each call re-derives the
  /// combined signal from the channel's own close signal plus every
  /// cancel passed so far.
  pub fn set_cancel(&mut self, cancel: CancellationToken) {
    self.cancel = link([self.inner.signal.clone(), cancel]);
  }

  /// Dequeue the next value. Returns `None` when the channel is
  /// closed or the linked cancel fires — cancellation is normal
  /// termination, never surfaced as an error. Intended to be awaited
  /// in a `while let Some(v) = receiver.recv().await` pull loop.
  pub async fn recv(&mut self) -> Option<T> {
    loop {
      match self.inner.queue.pop(&self.cancel).await {
        Ok(Envelope::Item(v, ack)) => {
          if let Some(ack) = ack {
            // Rendezvous: wake the sender now that recv has begun.
            let _ = ack.send(());
          } else if let Some(permits) = &self.inner.permits {
            permits.add_permits(1);
          }
          return Some(v);
        }
        Ok(Envelope::Close) => return None,
        Err(PopError::Cancelled) => return None,
      }
    }
  }

  pub fn signal(&self) -> CancellationToken {
    self.inner.signal.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn send_recv_preserves_order() {
    let (tx, mut rx) = channel(8);
    tx.send(1).await.unwrap();
    tx.send(2).await.unwrap();
    tx.send(3).await.unwrap();
    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(rx.recv().await, Some(2));
    assert_eq!(rx.recv().await, Some(3));
  }

  #[tokio::test]
  async fn close_terminates_recv_and_future_sends() {
    let (tx, mut rx) = channel::<i32>(4);
    tx.send(1).await.unwrap();
    tx.close();
    // Close is idempotent.
    tx.close();
    tx.close();
    assert!(tx.send(2).await.is_err());
    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(rx.recv().await, None);
  }

  #[tokio::test]
  async fn capacity_zero_send_completes_only_after_recv_begins() {
    let (tx, mut rx) = channel::<&'static str>(0);
    let sent = Arc::new(tokio::sync::Mutex::new(false));
    let sent_clone = sent.clone();
    let send_task = tokio::spawn(async move {
      tx.send("hi").await.unwrap();
      *sent_clone.lock().await = true;
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!*sent.lock().await, "send must not complete before recv");
    assert_eq!(rx.recv().await, Some("hi"));
    send_task.await.unwrap();
    assert!(*sent.lock().await);
  }

  #[tokio::test]
  async fn capacity_k_allows_k_sends_without_waiting() {
    let (tx, _rx) = channel::<i32>(2);
    // First two sends must not block even with no consumer.
    tokio::time::timeout(Duration::from_millis(50), async {
      tx.send(1).await.unwrap();
      tx.send(2).await.unwrap();
    })
    .await
    .expect("first k sends must not block");
  }

  #[tokio::test]
  async fn recv_ends_cleanly_on_linked_cancel() {
    let (_tx, mut rx) = channel::<i32>(4);
    let cancel = CancellationToken::new();
    rx.set_cancel(cancel.clone());
    cancel.cancel();
    assert_eq!(rx.recv().await, None);
  }

  #[tokio::test]
  async fn link_fires_on_first_source() {
    let a = CancellationToken::new();
    let b = CancellationToken::new();
    let combined = link([a.clone(), b.clone()]);
    assert!(!combined.is_cancelled());
    b.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(combined.is_cancelled());
  }
}
