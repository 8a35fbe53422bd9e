use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// cooperative cancellation token
///
/// cloning is cheap and all clones observe the same flag. long-running
/// operations check the token at every I/O boundary and return
/// [`Error::Cancelled`] promptly once it fires.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// request cancellation; irreversible
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// check-point used inside loops
    pub fn err(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_observed_by_clones() {
        let tok = CancelToken::new();
        let tok2 = tok.clone();
        assert!(tok.err().is_ok());

        tok2.cancel();
        assert!(tok.is_cancelled());
        assert!(matches!(tok.err(), Err(Error::Cancelled)));
    }
}
