//! Shared helpers for unit tests.

use std::sync::Mutex;

/// Run `f` with the given environment variables set, restoring the previous
/// values afterwards. Env vars are process-global, so every caller is
/// serialized through one lock regardless of which test module it lives in.
pub fn temp_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
    static ENV_LOCK: Mutex<()> = Mutex::new(());
    let _guard = match ENV_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    let saved: Vec<(String, Option<String>)> = vars
        .iter()
        .map(|(k, _)| ((*k).to_string(), std::env::var(*k).ok()))
        .collect();
    for (k, v) in vars {
        match v {
            Some(v) => unsafe { std::env::set_var(k, v) },
            None => unsafe { std::env::remove_var(k) },
        }
    }
    f();
    for (k, v) in saved {
        match v {
            Some(v) => unsafe { std::env::set_var(&k, v) },
            None => unsafe { std::env::remove_var(&k) },
        }
    }
}
