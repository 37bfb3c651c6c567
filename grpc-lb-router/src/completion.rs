//! A one-shot callback that is guaranteed to fire exactly once.

use std::fmt;

/// Delivers the outcome of an asynchronous operation to whoever started it.
///
/// A [`Completion`] fires exactly once: either explicitly through
/// [`Completion::complete`], or, if it is dropped before that happens, with
/// the value produced by its `abandoned` constructor. Whoever holds a pending
/// operation therefore cannot lose its completion by accident, whether the
/// operation is cancelled, handed over to another policy or torn down during
/// shutdown.
pub struct Completion<T> {
    callback: Option<Box<dyn FnOnce(T) + Send>>,
    abandoned: fn() -> T,
}

impl<T> Completion<T> {
    /// Create a completion that invokes `callback` with the outcome, or with
    /// `abandoned()` if it is dropped without being completed.
    pub fn new<F>(callback: F, abandoned: fn() -> T) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
            abandoned,
        }
    }

    /// Fire the completion with `value`.
    pub fn complete(mut self, value: T) {
        if let Some(callback) = self.callback.take() {
            callback(value);
        }
    }
}

impl<T: Send + 'static> Completion<T> {
    /// Create a completion wired to a [`tokio::sync::oneshot`] channel.
    ///
    /// The receiver observes the abandoned value if the completion is dropped.
    pub fn channel(abandoned: fn() -> T) -> (Self, tokio::sync::oneshot::Receiver<T>) {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let completion = Self::new(
            move |value| {
                // The receiver may have gone away, nobody is interested anymore.
                let _ = sender.send(value);
            },
            abandoned,
        );
        (completion, receiver)
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback((self.abandoned)());
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording() -> (Completion<u32>, Arc<Mutex<Vec<u32>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let completion = Completion::new(move |value| sink.lock().unwrap().push(value), || 0);
        (completion, fired)
    }

    #[test]
    fn complete_fires_once_with_value() {
        let (completion, fired) = recording();
        completion.complete(7);
        assert_eq!(*fired.lock().unwrap(), vec![7]);
    }

    #[test]
    fn drop_fires_abandoned_value() {
        let (completion, fired) = recording();
        drop(completion);
        assert_eq!(*fired.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn channel_receiver_sees_abandoned_value() {
        let (completion, receiver) = Completion::<Result<(), &'static str>>::channel(|| Err("gone"));
        drop(completion);
        assert_eq!(receiver.await.unwrap(), Err("gone"));
    }
}
