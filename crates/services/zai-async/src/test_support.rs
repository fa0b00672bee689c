//! Helpers for tests that touch process-global state.

/// Sets or removes an environment variable for the life of the guard.
///
/// On drop the variable is put back the way it was found. Mutating the environment
/// races with other threads reading it, so tests using this must be marked
/// `#[serial(env)]`.
pub struct EnvGuard {
    key: &'static str,
    prev: Option<String>,
}

impl EnvGuard {
    /// Sets `key` to `val` until the guard is dropped
    #[must_use]
    pub fn set(key: &'static str, val: &str) -> Self {
        Self::swap(key, Some(val))
    }

    /// Removes `key` until the guard is dropped
    #[must_use]
    pub fn remove(key: &'static str) -> Self {
        Self::swap(key, None)
    }

    fn swap(key: &'static str, val: Option<&str>) -> Self {
        let prev = std::env::var(key).ok();
        write_var(key, val);
        Self { key, prev }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        write_var(self.key, self.prev.as_deref());
    }
}

fn write_var(key: &str, val: Option<&str>) {
    // SAFETY: callers serialise environment access with `#[serial(env)]`
    match val {
        Some(v) => unsafe { std::env::set_var(key, v) },
        None => unsafe { std::env::remove_var(key) },
    }
}
