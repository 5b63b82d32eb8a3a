use std::sync::Mutex;
use std::sync::MutexGuard;

/// Lock a mutex, recovering the guard if a previous holder panicked. The
/// state protected by these mutexes stays consistent across panics because
/// every critical section is a plain insert/remove.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Truncate `s` to at most `max_chars` characters, appending an ellipsis
/// when anything was cut. Operates on chars, never splitting a code point.
pub(crate) fn ellipsize(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ellipsize_only_truncates_long_input() {
        assert_eq!(ellipsize("short", 200), "short");
        let long = "x".repeat(250);
        let cut = ellipsize(&long, 200);
        assert_eq!(cut.chars().count(), 201);
        assert!(cut.ends_with('…'));
    }
}
