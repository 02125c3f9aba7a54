pub mod announce;
pub mod bindings;
pub mod error;
pub mod events;
pub mod feed;
pub mod keyed_lock;
pub mod remote;
pub mod rooms;
pub mod store;

pub use announce::*;
pub use bindings::*;
pub use error::*;
pub use events::*;
pub use feed::*;
pub use keyed_lock::*;
pub use remote::*;
pub use rooms::*;
pub use store::*;
