//! recdb lock layer: per-record advisory locks guarded by cookies.
#![deny(missing_docs)]

pub mod cookie;
pub mod lock;

pub use cookie::{Cookie, CookieSource};
pub use lock::{LockError, LockTable};
