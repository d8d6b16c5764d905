//! Resource-side enforcement of fencing tokens.
//!
//! A holder that stalls (GC pause, slow network) can keep acting after its
//! lease has been handed to someone else. The resource it writes to is the
//! last line of defence: it remembers the highest token it has accepted and
//! refuses anything older.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{LockError, Result};
use crate::lease::FencingToken;

/// High-water mark of fencing tokens seen by one guarded resource.
#[derive(Debug, Default)]
pub struct TokenFence {
    // Zero means nothing admitted yet; issued tokens start at one.
    highest: AtomicU64,
}

impl TokenFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits an operation carrying `token`.
    ///
    /// Equal tokens pass, so one holder may perform many operations.
    ///
    /// # Errors
    ///
    /// [`LockError::StaleToken`] if a newer token has already been admitted.
    pub fn admit(&self, token: FencingToken) -> Result<()> {
        let presented = token.sequence();
        self.highest
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |highest| {
                (presented >= highest).then_some(presented)
            })
            .map(|_| ())
            .map_err(|highest| LockError::StaleToken {
                presented: token,
                highest: FencingToken::new(highest),
            })
    }

    pub fn highest(&self) -> Option<FencingToken> {
        match self.highest.load(Ordering::SeqCst) {
            0 => None,
            highest => Some(FencingToken::new(highest)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_tokens_older_than_highest() {
        let fence = TokenFence::new();
        assert_eq!(fence.highest(), None);

        fence.admit(FencingToken::new(3)).unwrap();
        fence.admit(FencingToken::new(3)).unwrap();
        fence.admit(FencingToken::new(7)).unwrap();

        let err = fence.admit(FencingToken::new(3)).unwrap_err();
        match err {
            LockError::StaleToken { presented, highest } => {
                assert_eq!(presented, FencingToken::new(3));
                assert_eq!(highest, FencingToken::new(7));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fence.highest(), Some(FencingToken::new(7)));
    }
}
