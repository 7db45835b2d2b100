//! Parley Routing Adapters
//!
//! Adapters that never talk to a backend themselves: they select a delegate
//! adapter per call through the credential lookup boundary and forward the
//! request and its response stream untouched.
//! - Credential-pool routing (round-robin or random)
//! - Model-name routing with a mandatory default route

pub mod model_name;
pub mod pool;

pub use model_name::ModelNameAdapter;
pub use pool::{PoolAdapter, PoolStrategy};
