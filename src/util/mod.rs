use std::time::Duration;

use tokio::time::Instant;

pub(crate) mod retry;
pub(crate) mod runnable;

/// Roughly 30 years, the horizon tokio itself uses for "never".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + after`, saturating at a far-future instant instead of panicking.
pub(crate) fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after).unwrap_or_else(|| from + FAR_FUTURE)
}
