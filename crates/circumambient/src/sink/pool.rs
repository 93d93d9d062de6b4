//! Bounded, lazily populated connection pool.
//!
//! Connections are dialed by the pool's [`ManageConnection`] on first demand,
//! never at construction, and at most `max_size` exist at once. A checkout
//! that finds every connection borrowed waits up to `checkout_timeout` for
//! one to be returned. The returned guard puts the connection back when it
//! is dropped, on success and error paths alike.

use r2d2::{ManageConnection, Pool};
use std::time::Duration;

pub fn build_pool<M: ManageConnection>(
    manager: M,
    max_size: u32,
    checkout_timeout: Duration,
) -> Pool<M> {
    Pool::builder()
        .max_size(max_size)
        .min_idle(Some(0))
        .test_on_check_out(false)
        .connection_timeout(checkout_timeout)
        .build_unchecked(manager)
}
