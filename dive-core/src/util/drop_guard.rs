use std::ops::{Deref, DerefMut};

/// Runs `callback` on the guarded value when the guard goes out of scope, including while
/// unwinding. Use [`DropGuard::into_inner`] to take the value back without running it.
pub struct DropGuard<T, F: FnOnce(T)> {
    inner: Option<(T, F)>,
}

impl<T, F: FnOnce(T)> DropGuard<T, F> {
    pub fn new(token: T, callback: F) -> Self {
        Self {
            inner: Some((token, callback)),
        }
    }

    pub fn into_inner(mut self) -> T {
        match self.inner.take() {
            Some((token, _)) => token,
            None => unreachable!("guard was already consumed"),
        }
    }
}

impl<T, F: FnOnce(T)> Drop for DropGuard<T, F> {
    fn drop(&mut self) {
        if let Some((token, callback)) = self.inner.take() {
            (callback)(token);
        }
    }
}

impl<T, F: FnOnce(T)> Deref for DropGuard<T, F> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        match &self.inner {
            Some((token, _)) => token,
            None => unreachable!("guard was already consumed"),
        }
    }
}

impl<T, F: FnOnce(T)> DerefMut for DropGuard<T, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.inner {
            Some((token, _)) => token,
            None => unreachable!("guard was already consumed"),
        }
    }
}
