//! Safety and cleanup
//!
//! Every acquired host resource is ledgered and released in reverse order.

pub mod cleanup;
