//! Wire format of distributed-tier values: a [`CacheEntry`] serialized with `postcard`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::entry::CacheEntry;
use crate::error::RepositoryError;

pub fn encode<E>(entry: &CacheEntry<E>) -> Result<Vec<u8>, RepositoryError>
where
    E: Serialize,
{
    Ok(postcard::to_stdvec(entry)?)
}

pub fn decode<E>(bytes: &[u8]) -> Result<CacheEntry<E>, RepositoryError>
where
    E: DeserializeOwned,
{
    Ok(postcard::from_bytes(bytes)?)
}
