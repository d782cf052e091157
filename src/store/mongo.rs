//! Store gateway over the official MongoDB driver.

use super::{
    DeleteOutcome, InsertOutcome, StoreGateway, StoreSession, UpdateOutcome, WriteConcern,
};
use crate::core::{StoreError, StoreErrorKind, StoreResult};
use async_trait::async_trait;
use bson::Document;
use mongodb::error::Error as DriverError;
use mongodb::options::{
    Acknowledgment, ClientOptions, TransactionOptions, UpdateOptions,
    WriteConcern as DriverWriteConcern,
};
use mongodb::{Client, ClientSession, Database};
use tracing::debug;

/// Gateway backed by a pooled MongoDB client. Requires a replica set.
#[derive(Clone)]
pub struct MongoGateway {
    client: Client,
    database: Database,
}

impl MongoGateway {
    pub async fn connect(url: &str, database: &str, pool_size: u32) -> StoreResult<Self> {
        let mut options = ClientOptions::parse(url)
            .await
            .map_err(|err| driver_error(StoreErrorKind::Session, err))?;
        options.max_pool_size = Some(pool_size);

        let client = Client::with_options(options)
            .map_err(|err| driver_error(StoreErrorKind::Session, err))?;
        let database = client.database(database);
        Ok(Self { client, database })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[async_trait]
impl StoreGateway for MongoGateway {
    async fn start_session(&self) -> StoreResult<Box<dyn StoreSession>> {
        let session = self
            .client
            .start_session(None)
            .await
            .map_err(|err| driver_error(StoreErrorKind::Session, err))?;
        Ok(Box::new(MongoSession {
            session,
            database: self.database.clone(),
        }))
    }
}

struct MongoSession {
    session: ClientSession,
    database: Database,
}

#[async_trait]
impl StoreSession for MongoSession {
    async fn start_transaction(&mut self, write_concern: WriteConcern) -> StoreResult<()> {
        self.session
            .start_transaction(transaction_options(write_concern))
            .await
            .map_err(|err| driver_error(StoreErrorKind::Transaction, err))
    }

    async fn insert_one(
        &mut self,
        collection: &str,
        document: &Document,
    ) -> StoreResult<InsertOutcome> {
        let result = self
            .database
            .collection::<Document>(collection)
            .insert_one_with_session(document.clone(), None, &mut self.session)
            .await
            .map_err(|err| driver_error(StoreErrorKind::Write, err))?;
        Ok(InsertOutcome {
            inserted_id: result.inserted_id,
        })
    }

    async fn update_one(
        &mut self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        let mut options = UpdateOptions::default();
        options.upsert = Some(upsert);

        let result = self
            .database
            .collection::<Document>(collection)
            .update_one_with_session(filter.clone(), update.clone(), options, &mut self.session)
            .await
            .map_err(|err| driver_error(StoreErrorKind::Write, err))?;
        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    async fn delete_one(
        &mut self,
        collection: &str,
        filter: &Document,
    ) -> StoreResult<DeleteOutcome> {
        let result = self
            .database
            .collection::<Document>(collection)
            .delete_one_with_session(filter.clone(), None, &mut self.session)
            .await
            .map_err(|err| driver_error(StoreErrorKind::Write, err))?;
        Ok(DeleteOutcome {
            deleted: result.deleted_count,
        })
    }

    async fn commit_transaction(&mut self) -> StoreResult<()> {
        self.session
            .commit_transaction()
            .await
            .map_err(|err| driver_error(StoreErrorKind::Commit, err))
    }

    async fn abort_transaction(&mut self) -> StoreResult<()> {
        self.session
            .abort_transaction()
            .await
            .map_err(|err| driver_error(StoreErrorKind::Abort, err))
    }

    async fn end_session(&mut self) {
        // The driver returns the server session to its pool when the
        // ClientSession is dropped.
        debug!("Ending store session");
    }
}

fn transaction_options(write_concern: WriteConcern) -> TransactionOptions {
    let mut options = TransactionOptions::default();
    options.write_concern = Some(driver_write_concern(write_concern));
    options
}

fn driver_write_concern(write_concern: WriteConcern) -> DriverWriteConcern {
    let mut concern = DriverWriteConcern::default();
    concern.w = Some(match write_concern {
        WriteConcern::Majority => Acknowledgment::Majority,
        WriteConcern::Nodes(n) => Acknowledgment::Nodes(n),
    });
    concern
}

fn driver_error(kind: StoreErrorKind, err: DriverError) -> StoreError {
    let labels: Vec<String> = err.labels().iter().cloned().collect();
    store_error(kind, err.to_string(), labels)
}

fn store_error(
    kind: StoreErrorKind,
    message: String,
    labels: impl IntoIterator<Item = String>,
) -> StoreError {
    labels
        .into_iter()
        .fold(StoreError::new(kind, message), StoreError::with_label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_concern_mapping() {
        let majority = driver_write_concern(WriteConcern::Majority);
        assert!(matches!(majority.w, Some(Acknowledgment::Majority)));

        let nodes = driver_write_concern(WriteConcern::Nodes(2));
        assert!(matches!(nodes.w, Some(Acknowledgment::Nodes(2))));

        let options = transaction_options(WriteConcern::Nodes(3));
        let concern = options.write_concern.unwrap();
        assert!(matches!(concern.w, Some(Acknowledgment::Nodes(3))));
    }

    #[test]
    fn test_driver_labels_pass_through() {
        let err = store_error(
            StoreErrorKind::Commit,
            "commit failed".to_string(),
            [
                "TransientTransactionError".to_string(),
                "UnknownTransactionCommitResult".to_string(),
            ],
        );
        assert_eq!(err.kind(), StoreErrorKind::Commit);
        assert_eq!(err.message(), "commit failed");
        assert!(err.is_transient());
        assert!(err.is_commit_unknown());

        let plain = store_error(StoreErrorKind::Write, "E11000".to_string(), Vec::new());
        assert!(!plain.is_transient());
        assert_eq!(plain.labels().count(), 0);
    }

    #[test]
    fn test_driver_error_keeps_message_and_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset");
        let err = driver_error(StoreErrorKind::Write, DriverError::from(io));
        assert_eq!(err.kind(), StoreErrorKind::Write);
        assert!(err.message().contains("connection reset"), "unexpected: {}", err.message());
    }
}
