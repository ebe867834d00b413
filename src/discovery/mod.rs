//! Credential discovery — resolves a pool's keys from the environment.
//!
//! A pool configured with `env_var: TEXT_API_KEY` picks up
//! `TEXT_API_KEY`, then `TEXT_API_KEY_2`, `TEXT_API_KEY_3`, ... and stops
//! at the first suffix that is missing or empty.

/// Collect credentials for `base` from the process environment.
pub fn discover_credentials(base: &str) -> Vec<String> {
    collect_credentials(base, |name| std::env::var(name).ok())
}

/// Collect credentials for `base` using an arbitrary variable lookup.
///
/// The primary name is optional: a pool may be configured with only
/// suffixed keys. Values are trimmed; blank values count as missing.
pub fn collect_credentials<F>(base: &str, lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| {
        lookup(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let mut credentials: Vec<String> = read(base).into_iter().collect();
    for n in 2.. {
        match read(&format!("{}_{}", base, n)) {
            Some(value) => credentials.push(value),
            None => break,
        }
    }

    tracing::debug!(base = base, found = credentials.len(), "Credential discovery finished");
    credentials
}
