/*!
 * Transaction helper
 *
 * Runs a closure inside a database transaction: commit on `Ok`, rollback on
 * `Err`. The closure's own error type is preserved, so domain errors such as
 * `ConcurrentModification` surface unchanged.
 */

use crate::errors::ServiceError;
use metrics::counter;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionError, TransactionTrait};
use std::future::Future;
use std::pin::Pin;
use tracing::warn;

/// Type alias for boxed future used in transactions
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Execute a function within a database transaction
///
/// ```rust,ignore
/// with_transaction(&db, |txn| {
///     Box::pin(async move {
///         cart::Entity::delete_by_id(source_id).exec(txn).await?;
///         Ok(())
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<F, T>(db: &DatabaseConnection, f: F) -> Result<T, ServiceError>
where
    F: for<'a> FnOnce(&'a DatabaseTransaction) -> BoxFuture<'a, Result<T, ServiceError>> + Send,
    T: Send,
{
    let result = db.transaction::<_, T, ServiceError>(f).await;

    if result.is_err() {
        counter!("cart.db.transaction.rolled_back", 1);
    }

    result.map_err(|e| match e {
        TransactionError::Connection(db_err) => {
            warn!(error = %db_err, "transaction could not be started or committed");
            ServiceError::DatabaseError(db_err)
        }
        TransactionError::Transaction(err) => err,
    })
}
