//! Utility functions for tasks running on a [crate::scope::TestScope].

use std::{
    any::Any,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

mod handle;
pub use handle::Handle;

/// Yield control back to the scheduler.
///
/// The task is queued again at the current virtual time, behind any work that
/// is already due.
pub async fn reschedule() {
    struct Reschedule {
        yielded: bool,
    }

    impl Future for Reschedule {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    Reschedule { yielded: false }.await
}

pub(crate) fn extract_panic_message(err: &(dyn Any + Send)) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{err:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_panic_message() {
        let err = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(extract_panic_message(&*err), "static message");

        let value = 7;
        let err = std::panic::catch_unwind(|| panic!("formatted {value}")).unwrap_err();
        assert_eq!(extract_panic_message(&*err), "formatted 7");
    }
}
