use std::collections::HashMap;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Publishing to a key after `end(key)` or `close()`. Programmer error;
    /// there is no recovery.
    #[error("publish after end/close")]
    Ended,
}

struct KeyState<V> {
    latest: Option<(u64, V)>,
    next_seq: u64,
    subscribers: Vec<mpsc::UnboundedSender<(u64, V)>>,
    ended: bool,
}

impl<V> Default for KeyState<V> {
    fn default() -> Self {
        Self {
            latest: None,
            next_seq: 1,
            subscribers: Vec::new(),
            ended: false,
        }
    }
}

struct BrokerInner<K, V> {
    keys: HashMap<K, KeyState<V>>,
    closed: bool,
}

/// Pub-sub fan-out of one logical value stream per key. Subscribers each
/// get their own queue and may replay the latest value on subscription.
/// Every operation takes the one broker mutex, so a subscriber never
/// misses a value published after it subscribed and never sees a sequence
/// number twice.
pub struct Broker<K, V> {
    inner: Arc<Mutex<BrokerInner<K, V>>>,
}

impl<K, V> Clone for Broker<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Default for Broker<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Broker<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                keys: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Store `value` as the latest for `key` and push it to every
    /// subscriber queue, under the next per-key sequence number.
    pub fn publish(&self, key: K, value: V) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(BrokerError::Ended);
        }
        let state = inner.keys.entry(key).or_default();
        if state.ended {
            return Err(BrokerError::Ended);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.latest = Some((seq, value.clone()));
        state
            .subscribers
            .retain(|tx| tx.send((seq, value.clone())).is_ok());
        Ok(())
    }

    /// Subscribe to `key`. With `replay_last`, the current latest value (if
    /// any) is yielded first. The stream terminates on `end(key)`/`close()`.
    pub fn subscribe(&self, key: K, replay_last: bool) -> Subscription<V> {
        let mut inner = self.inner.lock();
        let ended = inner.closed;
        let state = inner.keys.entry(key).or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        if replay_last {
            if let Some((seq, value)) = &state.latest {
                let _ = tx.send((*seq, value.clone()));
            }
        }
        if !state.ended && !ended {
            state.subscribers.push(tx);
        }
        Subscription { rx, last_seq: 0 }
    }

    pub fn latest(&self, key: &K) -> Option<V> {
        self.inner
            .lock()
            .keys
            .get(key)
            .and_then(|s| s.latest.as_ref().map(|(_, v)| v.clone()))
    }

    /// Terminate the subscriptions of one key. Later publishes to it fail.
    pub fn end(&self, key: &K) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.keys.get_mut(key) {
            state.ended = true;
            state.subscribers.clear();
        } else {
            let mut state = KeyState::default();
            state.ended = true;
            inner.keys.insert(key.clone(), state);
        }
    }

    /// Drop every key, terminating their subscriptions, while leaving the
    /// broker open. Ended keys become publishable again under fresh
    /// sequence numbers.
    pub fn clear(&self) {
        self.inner.lock().keys.clear();
    }

    /// Terminate every subscription; the broker accepts nothing further.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for state in inner.keys.values_mut() {
            state.ended = true;
            state.subscribers.clear();
        }
    }
}

/// An ordered stream of values for one key. Ends when the key is ended or
/// the broker is closed.
pub struct Subscription<V> {
    rx: mpsc::UnboundedReceiver<(u64, V)>,
    last_seq: u64,
}

impl<V> Subscription<V> {
    /// Next value, or None once the subscription terminated.
    pub async fn next(&mut self) -> Option<V> {
        loop {
            let (seq, value) = self.rx.recv().await?;
            if seq > self.last_seq {
                self.last_seq = seq;
                return Some(value);
            }
        }
    }
}

impl<V> Stream for Subscription<V> {
    type Item = V;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some((seq, value))) => {
                    if seq > self.last_seq {
                        self.last_seq = seq;
                        return Poll::Ready(Some(value));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
