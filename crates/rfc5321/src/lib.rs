#[cfg(feature = "client")]
pub mod client;
pub mod command;
pub mod response;
#[cfg(feature = "client")]
pub mod tls;
#[cfg(feature = "client")]
pub mod traits;
pub mod timeouts;
pub mod verb;

#[cfg(feature = "client")]
pub use client::*;
pub use command::*;
pub use response::*;
pub use timeouts::*;
#[cfg(feature = "client")]
pub use tls::TlsOptions;
#[cfg(feature = "client")]
pub use traits::*;
pub use verb::*;
