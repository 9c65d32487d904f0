use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Named-signal pub/sub.
///
/// Each integration instance owns its own dispatcher, so signals never leak
/// between instances. Subscribers disconnect by dropping their receiver.
pub struct Dispatcher<T: Clone> {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T: Clone> Dispatcher<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to `signal`.
    pub fn connect(&self, signal: &str) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(signal.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Deliver `payload` to every live subscriber of `signal`.
    ///
    /// Returns the number of subscribers reached.
    pub fn send(&self, signal: &str, payload: T) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(senders) = subscribers.get_mut(signal) else {
            return 0;
        };

        senders.retain(|tx| tx.send(payload.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            subscribers.remove(signal);
        }
        delivered
    }
}

impl<T: Clone> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}
