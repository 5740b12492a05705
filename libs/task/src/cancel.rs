// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation for tasks.
///
/// Cancellation only sets a flag; the running task must poll
/// [`is_canceled`](Self::is_canceled) and return early. There is no way to
/// skip a task's execution entirely, and waiting on a canceled task still
/// blocks until the task observes the flag and returns.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    canceled: Arc<AtomicBool>,
}

// === impl CancellationToken ===

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    /// Clears the flag so the token can be reused for a new task.
    pub fn reset(&self) {
        self.canceled.store(false, Ordering::Relaxed);
    }

    fn same_token(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.canceled, &other.canceled)
    }
}

thread_local! {
    static CURRENT_TOKEN: Cell<Option<CancellationToken>> = const { Cell::new(None) };
}

/// Publishes a token as the current thread's cancellation token for the
/// duration of the scope.
///
/// Task bodies install this at their top so nested code can poll
/// [`CancellationTokenScope::is_current_work_canceled`] without the token
/// being threaded through every call.
pub struct CancellationTokenScope {
    owns_scope: bool,
}

// === impl CancellationTokenScope ===

impl CancellationTokenScope {
    /// Enters a scope for `token`.
    ///
    /// # Panics
    ///
    /// Panics if a different token's scope is already active on this thread;
    /// nested scopes are only allowed for the same token.
    #[must_use]
    pub fn new(token: &CancellationToken) -> Self {
        let owns_scope = CURRENT_TOKEN.with(|current| {
            let existing = current.take();
            match existing {
                Some(existing) if existing.same_token(token) => {
                    current.set(Some(existing));
                    false
                }
                Some(_) => panic!(
                    "nested cancellation token scopes with different tokens are not supported"
                ),
                None => {
                    current.set(Some(token.clone()));
                    true
                }
            }
        });
        Self { owns_scope }
    }

    /// The current thread's cancellation token, if a scope is active.
    #[must_use]
    pub fn current_token() -> Option<CancellationToken> {
        CURRENT_TOKEN.with(|current| {
            let token = current.take();
            current.set(token.clone());
            token
        })
    }

    /// Whether the current thread's work has been canceled.
    ///
    /// False when no scope is active.
    #[must_use]
    pub fn is_current_work_canceled() -> bool {
        Self::current_token().is_some_and(|token| token.is_canceled())
    }
}

impl Drop for CancellationTokenScope {
    fn drop(&mut self) {
        if self.owns_scope {
            CURRENT_TOKEN.with(Cell::take);
        }
    }
}
