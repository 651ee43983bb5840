use sqlx::PgPool;

pub trait DatabaseAccessor {
    fn acquire(&mut self) -> impl sqlx::PgExecutor<'_>;
}

#[derive(Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}

pub struct TransactionProcessor<'b> {
    pub tx: sqlx::Transaction<'b, sqlx::Postgres>,
}

impl DatabaseProcessor {
    /// Open a transaction on the pool.
    pub async fn begin(&self) -> Result<TransactionProcessor<'static>, sqlx::Error> {
        Ok(TransactionProcessor {
            tx: self.pool.begin().await?,
        })
    }
}

impl TransactionProcessor<'_> {
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }
}

impl DatabaseAccessor for DatabaseProcessor {
    fn acquire(&mut self) -> impl sqlx::PgExecutor<'_> {
        &self.pool
    }
}

impl<'b> DatabaseAccessor for TransactionProcessor<'b> {
    fn acquire(&mut self) -> impl sqlx::PgExecutor<'_> {
        &mut *self.tx
    }
}
