#![allow(dead_code)]

use futures::executor::block_on;
use rowguard::{
    DEFAULT_GOD_ID, Engine, EngineBuilder, GeoPoint, LoginId, NoCache, Record, RecordId,
    SecurityId, SqliteConnection, VariantTag,
};

pub type TestEngine = Engine<SqliteConnection, NoCache>;

pub fn connection() -> SqliteConnection {
    let connection = SqliteConnection::open_in_memory().unwrap();
    connection.install_baseline(DEFAULT_GOD_ID).unwrap();
    connection
}

pub fn engine() -> TestEngine {
    EngineBuilder::new(connection()).build().unwrap()
}

/// Creates a login through the superuser and returns its id.
pub fn login<K: rowguard::Cache>(
    engine: &Engine<SqliteConnection, K>,
    name: &str,
    delegated: &[i64],
) -> RecordId {
    block_on(async {
        let mut god = engine.session(Some(DEFAULT_GOD_ID)).await;
        let mut record = Record::login(LoginId::new(name).unwrap());
        record
            .security_node_mut()
            .unwrap()
            .delegated_ids
            .extend(delegated.iter().copied().map(SecurityId::new));
        god.create(record).await.unwrap().id().unwrap()
    })
}

pub fn place(name: &str, latitude: f64, longitude: f64) -> Record {
    let mut record = Record::new(VariantTag::Place);
    record.name = Some(name.to_string());
    record.location = Some(GeoPoint::new(latitude, longitude).unwrap());
    record
}

pub fn generic(name: &str) -> Record {
    let mut record = Record::new(VariantTag::Generic);
    record.name = Some(name.to_string());
    record
}
