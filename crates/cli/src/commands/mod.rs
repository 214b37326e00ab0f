//! Command implementations.

mod info;
mod proxy;
mod serve;
mod station;
mod validate;

pub use info::run_info;
pub use proxy::run_proxy;
pub use serve::run_serve;
pub use station::run_station;
pub use validate::run_validate;
