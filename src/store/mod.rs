//! [`Database`](crate::traits::Database) implementations.

#[cfg(feature = "sea-orm")]
pub mod orm;

#[cfg(feature = "sea-orm")]
#[doc(inline)]
pub use orm::SeaOrmDatabase;
#[cfg(feature = "sea-orm")]
#[doc(inline)]
pub use orm::SeaOrmMapper;
#[cfg(feature = "sea-orm")]
#[doc(inline)]
pub use orm::SeaStatement;
