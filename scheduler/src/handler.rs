//! Route uncaught task failures back to the [TestScope] that owns them.
//!
//! An [ExceptionHandler] can be built before the scope it reports to exists. It moves
//! through three states:
//!
//! ```txt
//! Unclaimed --claim_ownership_or_copy(owner)--> Claimed(owner) --register_test_scope(owner, scope)--> Linked(scope)
//! ```
//!
//! Claiming a handler that is already claimed or linked never repurposes it: the caller
//! receives an independent copy (sharing only the handler function) so two scopes can
//! never end up reporting through the same binding.
//!
//! Once linked, [ExceptionHandler::handle_exception] invokes the handler function with
//! the scope. If the scope has already been torn down, or reporting a failure of the
//! handler function itself fails, the failure is delivered to the process-wide fallback
//! reporter (see [set_fallback_reporter]).

use crate::{
    scope::{Inner as ScopeInner, TestScope},
    utils::extract_panic_message,
    Error,
};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};
use tracing::{error, warn};

/// Function invoked with the linked scope for every failure.
type HandlerFn = dyn Fn(&TestScope, &FailureContext, Error) -> Result<(), Error> + Send + Sync;

/// Process-wide sink for failures that no scope can accept.
type Reporter = dyn Fn(&FailureContext, &Error) + Send + Sync;

static FALLBACK: RwLock<Option<Arc<Reporter>>> = RwLock::new(None);

/// Install the process-wide reporter for failures that arrive after their scope was
/// torn down.
///
/// Every fallback report is also logged at `ERROR`.
pub fn set_fallback_reporter<F>(reporter: F)
where
    F: Fn(&FailureContext, &Error) + Send + Sync + 'static,
{
    *FALLBACK.write().unwrap() = Some(Arc::new(reporter));
}

fn report_fallback(context: &FailureContext, error: &Error) {
    error!(task = context.task, label = %context.label, ?error, "unhandled task failure");
    let reporter = FALLBACK.read().unwrap().clone();
    if let Some(reporter) = reporter {
        reporter(context, error);
    }
}

/// Identity of a context claiming an [ExceptionHandler].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Owner(u64);

impl Owner {
    /// Returns an identity never handed out before in this process.
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Describes the task whose failure is being handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureContext {
    pub task: u64,
    pub label: String,
}

enum Binding {
    Unclaimed,
    Claimed(Owner),
    Linked(Weak<ScopeInner>),
}

struct Inner {
    binding: Mutex<Binding>,
    handler: Arc<HandlerFn>,
}

/// Links a handler function to at most one [TestScope].
///
/// Clones share the same binding.
#[derive(Clone)]
pub struct ExceptionHandler {
    inner: Arc<Inner>,
}

impl ExceptionHandler {
    /// Create a handler, linked to `scope` if one is provided.
    pub fn new<F>(scope: Option<&TestScope>, handler: F) -> Self
    where
        F: Fn(&TestScope, &FailureContext, Error) -> Result<(), Error> + Send + Sync + 'static,
    {
        let binding = match scope {
            Some(scope) => Binding::Linked(scope.downgrade()),
            None => Binding::Unclaimed,
        };
        Self::with_binding(binding, Arc::new(handler))
    }

    /// Create an unlinked handler that records every failure on its scope.
    pub fn reporting() -> Self {
        Self::new(None, |scope, _, error| scope.report(error))
    }

    fn with_binding(binding: Binding, handler: Arc<HandlerFn>) -> Self {
        Self {
            inner: Arc::new(Inner {
                binding: Mutex::new(binding),
                handler,
            }),
        }
    }

    /// Returns `true` if both handles share the same binding.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns `true` once a scope has been linked.
    pub fn is_linked(&self) -> bool {
        matches!(*self.inner.binding.lock().unwrap(), Binding::Linked(_))
    }

    /// Claim this handler for `owner`.
    ///
    /// If the handler is unclaimed, it becomes claimed by `owner` and is returned.
    /// Otherwise, a new handler (sharing only the handler function) is returned, already
    /// claimed by `owner`. The existing handler is never modified in that case.
    pub fn claim_ownership_or_copy(&self, owner: Owner) -> Self {
        {
            let mut binding = self.inner.binding.lock().unwrap();
            if let Binding::Unclaimed = *binding {
                *binding = Binding::Claimed(owner);
                return self.clone();
            }
        }
        Self::with_binding(Binding::Claimed(owner), self.inner.handler.clone())
    }

    /// Link `scope` to a handler claimed by `owner`.
    ///
    /// # Panics
    ///
    /// Panics if the handler is not currently claimed by `owner`.
    pub fn register_test_scope(&self, owner: Owner, scope: &TestScope) {
        let mut binding = self.inner.binding.lock().unwrap();
        match &*binding {
            Binding::Claimed(claimed) if *claimed == owner => {}
            Binding::Claimed(_) => panic!("exception handler claimed by another owner"),
            Binding::Unclaimed => panic!("exception handler must be claimed before registration"),
            Binding::Linked(_) => panic!("exception handler already linked to a test scope"),
        }
        *binding = Binding::Linked(scope.downgrade());
    }

    /// Deliver `error` raised by the task described by `context`.
    ///
    /// # Panics
    ///
    /// Panics if no scope was ever linked to the handler.
    pub fn handle_exception(&self, context: &FailureContext, error: Error) {
        let scope = match &*self.inner.binding.lock().unwrap() {
            Binding::Linked(scope) => scope.clone(),
            _ => panic!("exception handler is not linked to a test scope"),
        };
        let Some(scope) = TestScope::upgrade(&scope) else {
            warn!(task = context.task, "failure arrived after scope was dropped");
            report_fallback(context, &error);
            return;
        };

        // The handler function runs without holding the binding lock.
        let handler = &*self.inner.handler;
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(&scope, context, error.clone())))
            .unwrap_or_else(|err| Err(Error::Panicked(extract_panic_message(&*err))));
        match outcome {
            Ok(()) => {}
            Err(Error::ScopeFinished) => {
                warn!(task = context.task, "failure arrived after scope finished");
                report_fallback(context, &error);
            }
            Err(failure) => {
                warn!(task = context.task, ?failure, "exception handler failed");
                if let Err(Error::ScopeFinished) = scope.report(failure.clone()) {
                    report_fallback(context, &failure);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scope::Config;
    use commonware_macros::test_traced;
    use std::sync::{Once, OnceLock};

    /// Failures delivered to the fallback reporter by any test in this process.
    pub(crate) fn fallback_messages() -> Vec<String> {
        static CAPTURED: OnceLock<Arc<Mutex<Vec<String>>>> = OnceLock::new();
        static INSTALL: Once = Once::new();
        let captured = CAPTURED.get_or_init(Default::default).clone();
        INSTALL.call_once(|| {
            let captured = captured.clone();
            set_fallback_reporter(move |_, error| {
                captured.lock().unwrap().push(error.to_string());
            });
        });
        let messages = captured.lock().unwrap().clone();
        messages
    }

    fn context(label: &str) -> FailureContext {
        FailureContext {
            task: 1,
            label: label.to_string(),
        }
    }

    #[test]
    fn test_claim_unclaimed_returns_same_binding() {
        let handler = ExceptionHandler::reporting();
        let owner = Owner::unique();
        let claimed = handler.claim_ownership_or_copy(owner);
        assert!(claimed.ptr_eq(&handler));
        assert!(!claimed.is_linked());
    }

    #[test]
    fn test_second_claim_copies() {
        let handler = ExceptionHandler::reporting();
        let first = handler.claim_ownership_or_copy(Owner::unique());
        let second_owner = Owner::unique();
        let second = handler.claim_ownership_or_copy(second_owner);
        assert!(first.ptr_eq(&handler));
        assert!(!second.ptr_eq(&handler));

        // The copy is claimed by the second owner and links independently
        let scope = TestScope::new(Config::default());
        second.register_test_scope(second_owner, &scope);
        assert!(second.is_linked());
        assert!(!handler.is_linked());
    }

    #[test]
    fn test_claim_linked_copies() {
        let scope = TestScope::new(Config::default());
        let linked = ExceptionHandler::new(Some(&scope), |scope, _, error| scope.report(error));
        assert!(linked.is_linked());

        let copy = linked.claim_ownership_or_copy(Owner::unique());
        assert!(!copy.ptr_eq(&linked));
        assert!(!copy.is_linked());
    }

    #[test]
    #[should_panic(expected = "exception handler claimed by another owner")]
    fn test_register_wrong_owner() {
        let handler = ExceptionHandler::reporting().claim_ownership_or_copy(Owner::unique());
        let scope = TestScope::new(Config::default());
        handler.register_test_scope(Owner::unique(), &scope);
    }

    #[test]
    #[should_panic(expected = "exception handler must be claimed before registration")]
    fn test_register_unclaimed() {
        let handler = ExceptionHandler::reporting();
        let scope = TestScope::new(Config::default());
        handler.register_test_scope(Owner::unique(), &scope);
    }

    #[test]
    #[should_panic(expected = "exception handler already linked to a test scope")]
    fn test_register_twice() {
        let owner = Owner::unique();
        let handler = ExceptionHandler::reporting().claim_ownership_or_copy(owner);
        let scope = TestScope::new(Config::default());
        handler.register_test_scope(owner, &scope);
        handler.register_test_scope(owner, &scope);
    }

    #[test]
    #[should_panic(expected = "exception handler is not linked to a test scope")]
    fn test_handle_unlinked() {
        let handler = ExceptionHandler::reporting();
        handler.handle_exception(&context("unlinked"), Error::Exited);
    }

    #[test_traced]
    fn test_handler_invoked_with_scope() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = seen.clone();
            ExceptionHandler::new(None, move |_, context, error| {
                seen.lock().unwrap().push((context.label.clone(), error));
                Ok(())
            })
        };
        let scope = TestScope::new(Config {
            handler: Some(handler.clone()),
            ..Config::default()
        });
        assert!(handler.is_linked());

        scope
            .handler()
            .handle_exception(&context("worker"), Error::Panicked("oops".into()));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("worker".to_string(), Error::Panicked("oops".into()))]
        );
        assert!(scope.uncaught().is_empty());
    }

    #[test_traced]
    fn test_handler_failure_reported_to_scope() {
        let handler = ExceptionHandler::new(None, |_, _, error| {
            Err(Error::Handler(format!("rejected {error}")))
        });
        let scope = TestScope::new(Config {
            handler: Some(handler),
            ..Config::default()
        });
        scope
            .handler()
            .handle_exception(&context("worker"), Error::Exited);
        assert_eq!(
            scope.uncaught(),
            vec![Error::Handler("rejected exited".into())]
        );
    }

    #[test_traced]
    fn test_handler_panic_reported_to_scope() {
        let handler = ExceptionHandler::new(None, |_, _, _| panic!("handler assertion"));
        let scope = TestScope::new(Config {
            handler: Some(handler),
            ..Config::default()
        });
        scope
            .handler()
            .handle_exception(&context("worker"), Error::Exited);
        assert_eq!(
            scope.uncaught(),
            vec![Error::Panicked("handler assertion".into())]
        );
    }

    #[test_traced]
    fn test_finished_scope_falls_back() {
        fallback_messages();
        let scope = TestScope::new(Config::default());
        scope.cleanup_test_coroutines().unwrap();

        // Reporting handler sees the scope finished
        let message = "late failure after cleanup".to_string();
        scope
            .handler()
            .handle_exception(&context("late"), Error::Panicked(message.clone()));
        assert!(fallback_messages().contains(&format!("panicked: {message}")));
    }

    #[test_traced]
    fn test_failing_handler_on_finished_scope_falls_back() {
        fallback_messages();
        let handler = ExceptionHandler::new(None, |_, _, _| {
            Err(Error::Handler("handler failed on finished scope".into()))
        });
        let scope = TestScope::new(Config {
            handler: Some(handler),
            ..Config::default()
        });
        scope.cleanup_test_coroutines().unwrap();
        scope
            .handler()
            .handle_exception(&context("late"), Error::Exited);
        assert!(fallback_messages()
            .contains(&"handler failed: handler failed on finished scope".to_string()));
    }

    #[test]
    fn test_dropped_scope_falls_back() {
        fallback_messages();
        let handler = ExceptionHandler::reporting();
        let scope = TestScope::new(Config {
            handler: Some(handler.clone()),
            ..Config::default()
        });
        drop(scope);
        handler.handle_exception(
            &context("orphan"),
            Error::Panicked("failure after scope dropped".into()),
        );
        assert!(fallback_messages().contains(&"panicked: failure after scope dropped".to_string()));
    }

    #[test]
    fn test_concurrent_claims() {
        let handler = ExceptionHandler::reporting();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let handler = handler.clone();
                std::thread::spawn(move || {
                    let owner = Owner::unique();
                    (owner, handler.claim_ownership_or_copy(owner))
                })
            })
            .collect();
        let claims: Vec<_> = threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .collect();

        // Exactly one thread wins the original binding
        let winners = claims
            .iter()
            .filter(|(_, claimed)| claimed.ptr_eq(&handler))
            .count();
        assert_eq!(winners, 1);
        for (i, (_, claimed)) in claims.iter().enumerate() {
            for (_, other) in &claims[i + 1..] {
                assert!(!claimed.ptr_eq(other));
            }
        }

        // Every claim links to its owner's scope independently
        for (owner, claimed) in &claims {
            let scope = TestScope::new(Config::default());
            claimed.register_test_scope(*owner, &scope);
            assert!(claimed.is_linked());
        }
    }

    #[test]
    fn test_concurrent_handle_exception() {
        let scope = TestScope::new(Config::default());
        let handler = scope.handler().clone();
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let handler = handler.clone();
                std::thread::spawn(move || {
                    handler.handle_exception(
                        &context("threaded"),
                        Error::Panicked(format!("thread {i}")),
                    );
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let mut uncaught: Vec<_> = scope.uncaught().into_iter().map(|e| e.to_string()).collect();
        uncaught.sort();
        let mut expected: Vec<_> = (0..8).map(|i| format!("panicked: thread {i}")).collect();
        expected.sort();
        assert_eq!(uncaught, expected);
    }
}
