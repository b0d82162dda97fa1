//! Offline cache controller.
//!
//! Each generation (one version tag) moves through install and activate,
//! then answers every intercepted request with stale-while-revalidate:
//! hits come from the cache and are refreshed in the background, misses come
//! from the network and are written through, failed navigations get the
//! fallback page. The registration keeps exactly one generation live.

mod controller;
mod lifecycle;
mod registration;

pub use controller::{CacheController, FetchOutcome};
pub use lifecycle::Phase;
pub use registration::Registration;
