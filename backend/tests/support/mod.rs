//! Environment isolation for tests that read process configuration.

use std::sync::Mutex;

/// Every variable `AppConfig::load` or `RepositoryType::from_env` looks at.
const CONFIG_VARS: &[&str] = &[
    "SKYPORTAL_CONFIG",
    "REPOSITORY_TYPE",
    "DATABASE_URL",
    "PG_DATABASE_URL",
    "HOST",
    "PORT",
    "KPED_SECRET_KEY",
    "JSON_QUEUE_TOKEN",
];

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Runs `f` with a controlled environment.
///
/// Config variables not named in `changes` are unset for the duration so the
/// host environment cannot leak in. `Some(v)` sets a variable, `None` unsets
/// it. Everything is restored afterwards, also when `f` panics.
pub fn with_scoped_env<F, R>(changes: &[(&str, Option<&str>)], f: F) -> R
where
    F: FnOnce() -> R,
{
    // A panicking test poisons the lock; the guard still restores the env.
    let _lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _restore = EnvRestore::apply(changes);
    f()
}

struct EnvRestore {
    saved: Vec<(String, Option<String>)>,
}

impl EnvRestore {
    fn apply(changes: &[(&str, Option<&str>)]) -> Self {
        let mut keys: Vec<&str> = CONFIG_VARS.to_vec();
        keys.extend(changes.iter().map(|(key, _)| *key));
        keys.sort_unstable();
        keys.dedup();

        let saved = keys
            .iter()
            .map(|key| (key.to_string(), std::env::var(key).ok()))
            .collect();

        for key in keys {
            let value = changes
                .iter()
                .find(|(k, _)| *k == key)
                .and_then(|(_, v)| *v);
            set_or_remove(key, value);
        }

        Self { saved }
    }
}

impl Drop for EnvRestore {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            set_or_remove(key, value.as_deref());
        }
    }
}

fn set_or_remove(key: &str, value: Option<&str>) {
    match value {
        Some(value) => std::env::set_var(key, value),
        None => std::env::remove_var(key),
    }
}
