use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::ActiveModelBehavior;
use sea_orm::ActiveModelTrait;
use sea_orm::Condition;
use sea_orm::DatabaseConnection;
use sea_orm::EntityTrait;
use sea_orm::IntoActiveModel;
use sea_orm::Iterable;
use sea_orm::QueryFilter;
use sea_orm::TransactionTrait;
use std::collections::HashSet;
use tracing::instrument;

use crate::error::DataAccessError;
use crate::traits::Database;
use crate::traits::EntityMapper;

// SQLite accepts up to 32766 bound parameters per statement, PostgreSQL up to 65535.
const MAX_BIND_PARAMS: usize = 32_000;
// Lookups by ID bind one parameter per ID.
const ID_CHUNK_SIZE: usize = 1000;

/// How many rows of `T` fit into one multi-row insert.
pub(crate) fn insert_chunk_size<T: EntityTrait>() -> usize {
    (MAX_BIND_PARAMS / T::Column::iter().count().max(1)).max(1)
}

/// A write produced by a [`SeaOrmMapper`].
#[derive(Debug, Clone)]
pub enum SeaStatement<AM> {
    Insert(AM),
    Update(AM),
}

/// What a mapper needs to tell [`SeaOrmDatabase`] about table `T` besides the row/entity conversion.
pub trait SeaOrmMapper<T>: EntityMapper<Row = T::Model, Statement = SeaStatement<T::ActiveModel>>
where
    T: EntityTrait,
{
    /// Condition selecting the rows with the given IDs. Typically `Column::Id.is_in(ids)`.
    fn id_condition(&self, ids: &[Self::Id]) -> Condition;

    fn model_id(&self, model: &T::Model) -> Self::Id;
}

/// Database of a single SeaORM entity.
pub struct SeaOrmDatabase<M, T> {
    connection: DatabaseConnection,
    mapper:     Arc<M>,
    _table:     PhantomData<fn() -> T>,
}

impl<M, T> SeaOrmDatabase<M, T>
where
    M: SeaOrmMapper<T>,
    T: EntityTrait,
{
    pub fn new(connection: DatabaseConnection, mapper: Arc<M>) -> Self {
        Self {
            connection,
            mapper,
            _table: PhantomData,
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

impl<M, T> Debug for SeaOrmDatabase<M, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SeaOrmDatabase<{}>", std::any::type_name::<T>())
    }
}

#[async_trait]
impl<M, T> Database<M> for SeaOrmDatabase<M, T>
where
    M: SeaOrmMapper<T>,
    T: EntityTrait,
    T::Model: IntoActiveModel<T::ActiveModel> + Sync,
    T::ActiveModel: ActiveModelTrait<Entity = T> + ActiveModelBehavior + Debug + Send + Sync + 'static,
{
    #[instrument(level = "trace", skip(self))]
    async fn fetch_row(&self, id: &M::Id) -> Result<Option<M::Row>, DataAccessError> {
        Ok(T::find()
            .filter(self.mapper.id_condition(std::slice::from_ref(id)))
            .one(&self.connection)
            .await?)
    }

    #[instrument(level = "trace", skip(self))]
    async fn existing_ids(&self, ids: &[M::Id]) -> Result<HashSet<M::Id>, DataAccessError> {
        let mut existing = HashSet::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK_SIZE) {
            let models = T::find()
                .filter(self.mapper.id_condition(chunk))
                .all(&self.connection)
                .await?;
            existing.extend(models.iter().map(|model| self.mapper.model_id(model)));
        }
        Ok(existing)
    }

    #[instrument(level = "trace", skip(self))]
    async fn execute(&self, statement: M::Statement) -> Result<(), DataAccessError> {
        match statement {
            SeaStatement::Insert(am) => {
                T::insert(am).exec_without_returning(&self.connection).await?;
            }
            SeaStatement::Update(am) => {
                am.update(&self.connection).await?;
            }
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self, statements), fields(count = statements.len()))]
    async fn execute_batch(&self, statements: Vec<M::Statement>) -> Result<(), DataAccessError> {
        let transaction = self.connection.begin().await?;

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for statement in statements {
            match statement {
                SeaStatement::Insert(am) => inserts.push(am),
                SeaStatement::Update(am) => updates.push(am),
            }
        }

        // Inserts go first: a batch may update a row it inserts.
        for chunk in inserts.chunks(insert_chunk_size::<T>()) {
            T::insert_many(chunk.to_vec())
                .exec_without_returning(&transaction)
                .await?;
        }

        // Updates cannot be done all at once.
        for am in updates {
            am.update(&transaction).await?;
        }

        transaction.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod note {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "notes")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id:     i64,
            pub title:  String,
            pub body:   String,
            pub author: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    #[test]
    fn insert_chunks_respect_the_parameter_budget() {
        let rows = insert_chunk_size::<note::Entity>();
        assert_eq!(rows, MAX_BIND_PARAMS / 4);
        assert!(rows * 4 <= 32766);
    }
}
