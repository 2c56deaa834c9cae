//! [`DistributedCache`](crate::traits::DistributedCache) implementations.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

#[doc(inline)]
pub use memory::MemoryCache;
#[cfg(feature = "redis")]
#[doc(inline)]
pub use self::redis::RedisCache;
