//! Asynchronous interface over a [`Database`].
//!
//! The database itself is synchronous. This module moves each call onto
//! tokio's blocking pool so async callers never stall the runtime, offers a
//! transaction timeout for collaborators that race commits against a timer,
//! and turns live queries into streams.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::task::{JoinError, spawn_blocking};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use crate::database::Database;
use crate::error::{Result, TriadError};
use crate::query::{FetchResult, QueryDescriptor};
use crate::schema::{Migration, MigrationDirection, MigrationReport};
use crate::subscription::Subscription;
use crate::transaction::{EntityUpdate, Transaction, TransactionResult};

fn join_error(e: JoinError) -> TriadError {
    TriadError::Execution(format!("blocking task failed: {}", e))
}

#[derive(Clone)]
pub struct AsyncDatabase {
    database: Database,
}

impl AsyncDatabase {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
    pub fn database(&self) -> &Database {
        &self.database
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let database = self.database.clone();
        spawn_blocking(move || work(database)).await.map_err(join_error)?
    }

    pub async fn fetch(&self, query: QueryDescriptor) -> Result<FetchResult> {
        self.blocking(move |db| db.fetch(&query)).await
    }
    pub async fn insert(&self, collection: &str, document: Json) -> Result<String> {
        let collection = collection.to_owned();
        self.blocking(move |db| db.insert(&collection, document)).await
    }
    pub async fn update<F>(&self, collection: &str, id: &str, updater: F) -> Result<()>
    where
        F: FnOnce(&mut EntityUpdate) -> Result<()> + Send + 'static,
    {
        let (collection, id) = (collection.to_owned(), id.to_owned());
        self.blocking(move |db| db.update(&collection, &id, updater)).await
    }
    pub async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let (collection, id) = (collection.to_owned(), id.to_owned());
        self.blocking(move |db| db.delete(&collection, &id)).await
    }
    pub async fn transact<T, F>(&self, callback: F) -> Result<TransactionResult<T>>
    where
        F: FnOnce(&mut Transaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.blocking(move |db| db.transact(callback)).await
    }

    /// Like [`AsyncDatabase::transact`], but gives up waiting after `timeout`.
    /// The transaction is not cancelled: it still commits if its callback
    /// eventually returns `Ok`.
    pub async fn transact_with_timeout<T, F>(&self, timeout: Duration, callback: F) -> Result<TransactionResult<T>>
    where
        F: FnOnce(&mut Transaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let database = self.database.clone();
        let running = spawn_blocking(move || database.transact(callback));
        match tokio::time::timeout(timeout, running).await {
            Ok(joined) => joined.map_err(join_error)?,
            Err(_) => {
                warn!(?timeout, "Stopped waiting for transaction");
                Err(TriadError::Timeout(timeout))
            }
        }
    }

    pub async fn migrate(&self, migrations: Vec<Migration>, direction: MigrationDirection) -> Result<MigrationReport> {
        self.blocking(move |db| db.migrate(&migrations, direction)).await
    }

    /// A live query as a stream of full results, starting with the current one.
    /// Dropping the stream unsubscribes.
    pub async fn subscribe_stream(&self, query: QueryDescriptor) -> Result<LiveResults> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = self
            .blocking(move |db| {
                db.subscribe(query, move |result: &FetchResult| {
                    // the receiver is gone once the stream is dropped
                    let _ = sender.send(result.clone());
                })
            })
            .await?;
        Ok(LiveResults {
            results: UnboundedReceiverStream::new(receiver),
            subscription,
        })
    }
}

pub struct LiveResults {
    results: UnboundedReceiverStream<FetchResult>,
    subscription: Subscription,
}

impl LiveResults {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl Stream for LiveResults {
    type Item = FetchResult;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().results).poll_next(cx)
    }
}

impl Drop for LiveResults {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}
