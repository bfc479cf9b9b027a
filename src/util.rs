//! Shared utility functions

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Truncate a string to at most `max_bytes` on a UTF-8 boundary.
///
/// # Examples
///
/// ```
/// use hookq::util::truncate_utf8_safe;
///
/// assert_eq!(truncate_utf8_safe("hello world", 5), "hello");
/// assert_eq!(truncate_utf8_safe("日本語", 4), "日");
/// ```
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// First `max_chars` characters of `s` (conversation titles count characters,
/// not bytes)
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked
///
/// Worker panics are contained per file; the state they guard stays usable.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
