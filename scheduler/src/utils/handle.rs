use crate::{utils::extract_panic_message, Error};
use futures::{
    channel::oneshot,
    stream::{AbortHandle, Abortable},
    FutureExt as _,
};
use prometheus_client::metrics::gauge::Gauge;
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{Arc, Once},
    task::{Context, Poll},
};
use tracing::error;

/// Handle to a spawned task.
pub struct Handle<T>
where
    T: Send + 'static,
{
    aborter: AbortHandle,
    receiver: oneshot::Receiver<Result<T, Error>>,

    running: Gauge,
    once: Arc<Once>,
}

impl<T> Handle<T>
where
    T: Send + 'static,
{
    /// Wrap `f` so that its output (or panic) is delivered to the returned [Handle].
    ///
    /// A panic is not propagated: its message is passed to `on_panic` and the
    /// [Handle] resolves to [Error::Exited].
    pub(crate) fn init<F, P>(f: F, running: Gauge, on_panic: P) -> (impl Future<Output = ()>, Self)
    where
        F: Future<Output = T> + Send + 'static,
        P: FnOnce(String) + Send + 'static,
    {
        // Increment running counter
        running.inc();

        // Initialize channels to handle result/abort
        let once = Arc::new(Once::new());
        let (sender, receiver) = oneshot::channel();
        let (aborter, abort_registration) = AbortHandle::new_pair();

        // Wrap the future to handle panics
        let wrapped = {
            let once = once.clone();
            let running = running.clone();
            async move {
                // Run future
                let result = AssertUnwindSafe(f).catch_unwind().await;

                // Decrement running counter
                once.call_once(|| {
                    running.dec();
                });

                // Handle result
                let result = match result {
                    Ok(result) => Ok(result),
                    Err(err) => {
                        let err = extract_panic_message(&*err);
                        error!(?err, "task panicked");
                        on_panic(err);
                        Err(Error::Exited)
                    }
                };
                let _ = sender.send(result);
            }
        };

        // Make the future abortable
        let abortable = Abortable::new(wrapped, abort_registration).map(|_| ());
        (
            abortable,
            Self {
                aborter,
                receiver,

                running,
                once,
            },
        )
    }

    /// Abort the task.
    ///
    /// The task is never resumed again and the [Handle] resolves to [Error::Closed].
    pub fn abort(&self) {
        self.aborter.abort();

        // Decrement running counter
        self.once.call_once(|| {
            self.running.dec();
        });
    }
}

impl<T> Future for Handle<T>
where
    T: Send + 'static,
{
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(Error::Closed),
            Poll::Pending => return Poll::Pending,
        };
        self.once.call_once(|| {
            self.running.dec();
        });
        Poll::Ready(result)
    }
}
