//! Lock cookie generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque token proving possession of a record lock.
pub type Cookie = u64;

/// Issues lock cookies.
///
/// Cookies are drawn at random so that a client cannot predict the cookie of
/// a lock it does not hold. The number of cookies handed out is tracked for
/// diagnostics.
#[derive(Debug, Default)]
pub struct CookieSource {
    issued: AtomicU64,
}

impl CookieSource {
    /// Draw a new cookie guaranteed to differ from `previous`.
    #[inline]
    pub fn next_after(&self, previous: Option<Cookie>) -> Cookie {
        self.issued.fetch_add(1, Ordering::Relaxed);
        loop {
            let cookie = rand::random::<Cookie>();
            if Some(cookie) != previous {
                return cookie;
            }
        }
    }

    /// Number of cookies issued so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn issue_many_fast() {
        let source = CookieSource::default();
        let start = Instant::now();
        let mut prev = None;
        for _ in 0..100_000 {
            let cookie = source.next_after(prev);
            assert_ne!(Some(cookie), prev);
            prev = Some(cookie);
        }
        let elapsed = start.elapsed();
        assert!(elapsed.as_secs_f64() < 1.0, "cookie generation too slow: {elapsed:?}");
        assert_eq!(source.issued(), 100_000);
    }
}
