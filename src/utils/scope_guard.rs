/// A guard that executes a closure when it goes out of scope.
///
/// Used to pair state mutations with their inverse along every exit path,
/// including panics.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // The closure lives in an `Option` so drop can take it exactly once.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_guard_runs_on_drop() {
        let fired = Cell::new(false);
        {
            let _guard = ScopeGuard::new(|| fired.set(true));
            assert!(!fired.get());
        }
        assert!(fired.get());
    }
}
