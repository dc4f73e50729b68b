// ice-proxy-stub: Library entry point.
// Exposes modules for integration testing.

pub mod proxy;

pub use proxy::{run, ProxyConfig};
