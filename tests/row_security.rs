#![cfg(feature = "sqlite")]

mod common;

use async_trait::async_trait;
use common::{engine, generic, login};
use futures::executor::block_on;
use rowguard::{
    Access, AddressField, Connection, DEFAULT_GOD_ID, EngineBuilder, Error, Executed, LoginId,
    Payload, Record, RecordId, Row, SearchCriteria, SearchOptions, SecurityId, SqliteConnection,
    Statement, StoreError, Table, TEMPLATE_ROW_ID, VariantRegistry, VariantTag,
};
use std::sync::atomic::{AtomicBool, Ordering};

/// Fails every UPDATE while armed and passes everything else through.
struct FailingUpdates {
    inner: SqliteConnection,
    armed: AtomicBool,
}

#[async_trait]
impl Connection for FailingUpdates {
    async fn execute(&self, statement: &Statement) -> Result<Executed, StoreError> {
        if self.armed.load(Ordering::SeqCst) && statement.sql.starts_with("UPDATE") {
            return Err("update rejected".into());
        }
        self.inner.execute(statement).await
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
        self.inner.query(statement).await
    }
}

#[test]
fn open_rows_are_readable_by_anyone_but_writable_only_when_authenticated() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);

    block_on(async {
        let mut god = engine.session(Some(DEFAULT_GOD_ID)).await;
        let mut record = generic("notice board");
        record.read_security_id = Some(SecurityId::OPEN);
        record.write_security_id = Some(SecurityId::OPEN);
        let id = god.create(record).await.unwrap().id().unwrap();

        let mut anonymous = engine.session(None).await;
        let seen = anonymous
            .fetch_by_id(Table::Records, id, Access::Read)
            .await
            .unwrap()
            .expect("open row is visible to anonymous callers");
        seen.update(|record| record.name = Some("defaced".to_string()));
        let result = anonymous.write(&seen).await;
        assert!(matches!(result, Err(Error::IllegalWriteAttempt { .. })));
        let result = anonymous.create(generic("spam")).await;
        assert!(matches!(result, Err(Error::NotAuthorized { id: None, .. })));

        let mut alice = engine.session(Some(alice)).await;
        let mine = alice
            .fetch_by_id(Table::Records, id, Access::Write)
            .await
            .unwrap()
            .expect("open row is writable by an authenticated caller");
        mine.update(|record| record.name = Some("updated".to_string()));
        alice.write(&mine).await.unwrap();
    });
}

#[test]
fn only_the_writer_may_modify_and_writes_advance_last_modified() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);
    let bob = login(&engine, "bob", &[]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        let created = a.create(generic("x")).await.unwrap();
        let id = created.id().unwrap();
        assert_eq!(
            created.read().write_security_id,
            Some(SecurityId::from(alice))
        );
        assert_eq!(created.read().read_security_id, Some(SecurityId::OPEN));
        let before = created.read().last_modified().unwrap();

        let mut b = engine.session(Some(bob)).await;
        let theirs = b
            .fetch_by_id(Table::Records, id, Access::Read)
            .await
            .unwrap()
            .unwrap();
        theirs.update(|record| record.name = Some("bob was here".to_string()));
        let result = b.write(&theirs).await;
        assert!(
            matches!(result, Err(Error::IllegalWriteAttempt { id: denied, .. }) if denied == id)
        );

        created.update(|record| record.name = Some("x2".to_string()));
        a.write(&created).await.unwrap();
        let after = created.read().last_modified().unwrap();
        assert!(after > before);

        let mut fresh = engine.session(Some(bob)).await;
        let reread = fresh
            .fetch_by_id(Table::Records, id, Access::Read)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reread.read().name.as_deref(), Some("x2"));
    });
}

#[test]
fn write_access_implies_read_access() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);
    let bob = login(&engine, "bob", &[]);

    block_on(async {
        let mut god = engine.session(Some(DEFAULT_GOD_ID)).await;
        let mut record = generic("private");
        record.read_security_id = Some(SecurityId::new(999));
        record.write_security_id = Some(SecurityId::from(alice));
        let id = god.create(record).await.unwrap().id().unwrap();

        let mut a = engine.session(Some(alice)).await;
        assert!(a.fetch_by_id(Table::Records, id, Access::Read).await.unwrap().is_some());
        let mut b = engine.session(Some(bob)).await;
        assert!(b.fetch_by_id(Table::Records, id, Access::Read).await.unwrap().is_none());
    });
}

#[test]
fn delegated_tokens_grant_read_access() {
    let engine = engine();
    let sam = login(&engine, "sam", &[7, 9]);
    let tess = login(&engine, "tess", &[]);

    let identities = block_on(engine.resolve_identities(sam));
    let ids: Vec<i64> = identities.iter().map(SecurityId::get).collect();
    let mut expected = vec![7, 9, sam.get()];
    expected.sort_unstable();
    assert_eq!(ids, expected);

    block_on(async {
        let mut god = engine.session(Some(DEFAULT_GOD_ID)).await;
        let mut record = generic("team notes");
        record.read_security_id = Some(SecurityId::new(7));
        let id = god.create(record).await.unwrap().id().unwrap();

        let mut s = engine.session(Some(sam)).await;
        assert!(s.fetch_by_id(Table::Records, id, Access::Read).await.unwrap().is_some());
        let mut t = engine.session(Some(tess)).await;
        assert!(t.fetch_by_id(Table::Records, id, Access::Read).await.unwrap().is_none());
    });
}

#[test]
fn identity_resolution_is_one_level_deep() {
    let engine = engine();
    let token = block_on(async {
        let mut god = engine.session(Some(DEFAULT_GOD_ID)).await;
        let mut token = Record::new(VariantTag::Token);
        token
            .security_node_mut()
            .unwrap()
            .delegated_ids
            .insert(SecurityId::new(42));
        god.create(token).await.unwrap().id().unwrap()
    });
    let sam = login(&engine, "sam", &[token.get()]);

    let identities = block_on(engine.resolve_identities(sam));
    assert!(identities.contains(SecurityId::from(token)));
    assert!(!identities.contains(SecurityId::new(42)));
    assert_eq!(identities.len(), 2);
}

#[test]
fn unknown_principals_fail_closed_to_their_own_id() {
    let engine = engine();
    let ghost = RecordId::new(404).unwrap();
    let identities = block_on(engine.resolve_identities(ghost));
    let ids: Vec<i64> = identities.iter().map(SecurityId::get).collect();
    assert_eq!(ids, vec![404]);
}

#[test]
fn lock_hides_rows_from_non_writers_until_unlocked() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);
    let bob = login(&engine, "bob", &[]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        let mut record = generic("draft");
        record.read_security_id = Some(SecurityId::AUTHENTICATED);
        let handle = a.create(record).await.unwrap();
        let id = handle.id().unwrap();

        let mut b = engine.session(Some(bob)).await;
        assert!(b.fetch_by_id(Table::Records, id, Access::Read).await.unwrap().is_some());
        assert_eq!(b.lock(Table::Records, id).await, SecurityId::OPEN);

        let previous = a.lock(Table::Records, id).await;
        assert_eq!(previous, SecurityId::AUTHENTICATED);
        assert!(handle.read().is_locked());

        let mut b = engine.session(Some(bob)).await;
        assert!(b.fetch_by_id(Table::Records, id, Access::Read).await.unwrap().is_none());
        let mut anonymous = engine.session(None).await;
        assert!(anonymous.fetch_by_id(Table::Records, id, Access::Read).await.unwrap().is_none());
        let mut a2 = engine.session(Some(alice)).await;
        let locked = a2
            .fetch_by_id(Table::Records, id, Access::Read)
            .await
            .unwrap()
            .expect("the writer still sees a locked row");
        assert!(locked.read().is_locked());

        let result = b.unlock(Table::Records, id, previous).await;
        assert!(matches!(result, Err(Error::IllegalWriteAttempt { .. })));
        a.unlock(Table::Records, id, previous).await.unwrap();
        assert!(b.fetch_by_id(Table::Records, id, Access::Read).await.unwrap().is_some());
    });
}

#[test]
fn writes_keep_an_existing_lock() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        let handle = a.create(generic("draft")).await.unwrap();
        let id = handle.id().unwrap();
        assert_eq!(a.lock(Table::Records, id).await, SecurityId::OPEN);

        handle.update(|record| {
            record.read_security_id = Some(SecurityId::OPEN);
            record.name = Some("still locked".to_string());
        });
        a.write(&handle).await.unwrap();
        assert!(handle.read().is_locked());
    });
}

#[test]
fn round_trip_preserves_every_column() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        let mut record = common::place("Town Hall", 39.7817, -89.6501);
        record.owner_id = Some(alice);
        record.set_address_field(AddressField::Town, "Springfield");
        record.set_address_field(AddressField::State, "IL");
        record.tags.set(9, "civic").unwrap();
        record
            .context
            .attributes
            .insert("floors".to_string(), serde_json::json!(3));
        record.payload = Some(Payload::new(vec![1, 2, 3, 255]));
        let written = a.create(record).await.unwrap();
        let id = written.id().unwrap();

        let mut other = engine.session(Some(alice)).await;
        let fetched = other
            .fetch_by_id(Table::Records, id, Access::Read)
            .await
            .unwrap()
            .unwrap();
        assert!(!fetched.ptr_eq(&written));
        assert_eq!(fetched.snapshot(), written.snapshot());
        assert_eq!(fetched.read().tag(), VariantTag::Place);
        assert_eq!(fetched.read().formatted_address(), "Springfield, IL");
    });
}

#[test]
fn repeated_fetches_share_one_instance() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        let id = a.create(generic("shared")).await.unwrap().id().unwrap();

        let mut session = engine.session(Some(alice)).await;
        let first = session
            .fetch_by_id(Table::Records, id, Access::Read)
            .await
            .unwrap()
            .unwrap();
        let many = session
            .fetch_many(
                Table::Records,
                &SearchCriteria::new().id(id),
                &SearchOptions::new(),
            )
            .await
            .unwrap()
            .into_records();
        assert!(first.ptr_eq(&many[0]));
        assert!(session.cached(Table::Records, id).unwrap().ptr_eq(&first));
    });
}

#[test]
fn deleting_twice_fails_without_panicking() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);
    let bob = login(&engine, "bob", &[]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        let handle = a.create(generic("temporary")).await.unwrap();
        let id = handle.id().unwrap();

        let mut b = engine.session(Some(bob)).await;
        let result = b.delete_by_id(Table::Records, id).await;
        assert!(matches!(result, Err(Error::IllegalDeleteAttempt { .. })));

        a.delete(&handle).await.unwrap();
        assert_eq!(handle.id(), None);
        assert!(a.cached(Table::Records, id).is_none());

        let result = a.delete_by_id(Table::Records, id).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
        let result = a.delete(&handle).await;
        assert!(matches!(result, Err(Error::InvalidId(_))));
    });
}

#[test]
fn reserved_rows_are_protected() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);

    block_on(async {
        let mut god = engine.session(Some(DEFAULT_GOD_ID)).await;
        let template = RecordId::new(TEMPLATE_ROW_ID).unwrap();
        assert!(god.fetch_by_id(Table::Records, template, Access::Read).await.unwrap().is_none());
        let result = god.delete_by_id(Table::SecurityNodes, DEFAULT_GOD_ID).await;
        assert!(matches!(result, Err(Error::IllegalDeleteAttempt { .. })));

        let mut a = engine.session(Some(alice)).await;
        let hidden = a
            .fetch_by_id(Table::SecurityNodes, DEFAULT_GOD_ID, Access::Read)
            .await
            .unwrap();
        assert!(hidden.is_none());
        let count = a
            .fetch_many(
                Table::SecurityNodes,
                &SearchCriteria::new(),
                &SearchOptions::new().count_only(),
            )
            .await
            .unwrap();
        assert_eq!(count.len(), 1);
    });
}

#[test]
fn inserts_require_a_template_row() {
    let connection = SqliteConnection::open_in_memory().unwrap();
    let engine = EngineBuilder::new(connection).build().unwrap();
    block_on(async {
        let mut god = engine.session(Some(DEFAULT_GOD_ID)).await;
        let result = god.create(generic("orphan")).await;
        assert!(matches!(result, Err(Error::MissingTemplate { table: Table::Records })));
    });
}

#[test]
fn security_nodes_read_as_themselves_and_cannot_grant_unheld_ids() {
    let engine = engine();
    let alice = login(&engine, "alice", &[7]);
    let bob = login(&engine, "bob", &[]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        let own = a
            .fetch_by_id(Table::SecurityNodes, alice, Access::Write)
            .await
            .unwrap()
            .expect("a login can write itself");
        assert_eq!(own.read().read_security_id, Some(SecurityId::from(alice)));
        assert_eq!(own.read().write_security_id, Some(SecurityId::SELF_WRITE));
        assert_eq!(
            own.read().security_node().unwrap().login_id(),
            Some(&LoginId::new("alice").unwrap())
        );

        own.update(|record| {
            record
                .security_node_mut()
                .unwrap()
                .delegated_ids
                .insert(SecurityId::new(8));
        });
        let result = a.write(&own).await;
        assert!(matches!(result, Err(Error::NotAuthorized { .. })));

        own.update(|record| {
            let node = record.security_node_mut().unwrap();
            node.delegated_ids.remove(&SecurityId::new(8));
            record.name = Some("Alice".to_string());
        });
        a.write(&own).await.unwrap();

        let mut b = engine.session(Some(bob)).await;
        assert!(b.fetch_by_id(Table::SecurityNodes, alice, Access::Read).await.unwrap().is_none());

        let mut token = Record::new(VariantTag::Token);
        token
            .security_node_mut()
            .unwrap()
            .delegated_ids
            .insert(SecurityId::new(7));
        let result = b.create(token).await;
        assert!(matches!(result, Err(Error::NotAuthorized { .. })));
    });
}

#[test]
fn callers_cannot_assign_security_ids_they_do_not_hold() {
    let engine = engine();
    let alice = login(&engine, "alice", &[7]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        let mut record = generic("shared with team");
        record.read_security_id = Some(SecurityId::new(7));
        record.write_security_id = Some(SecurityId::new(7));
        let handle = a.create(record).await.unwrap();

        handle.update(|record| record.write_security_id = Some(SecurityId::new(8)));
        let result = a.write(&handle).await;
        assert!(matches!(result, Err(Error::NotAuthorized { .. })));

        let mut locked = generic("pre-locked");
        locked.read_security_id = Some(SecurityId::LOCKED);
        assert!(a.create(locked).await.is_err());
    });
}

#[test]
fn searches_page_and_project_visible_rows() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);
    let bob = login(&engine, "bob", &[]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        let mut ids = Vec::new();
        for index in 0..5 {
            let mut record = generic(&format!("Report {index}"));
            record.owner_id = Some(alice);
            if index == 4 {
                record.read_security_id = Some(SecurityId::from(alice));
            }
            ids.push(a.create(record).await.unwrap().id().unwrap());
        }

        let criteria = SearchCriteria::new().name("report%");
        let page = a
            .fetch_many(
                Table::Records,
                &criteria,
                &SearchOptions::new().ids_only().page(2, 1).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(page.into_ids(), ids[2..4].to_vec());

        let mut b = engine.session(Some(bob)).await;
        let visible = b
            .fetch_many(Table::Records, &criteria, &SearchOptions::new().count_only())
            .await
            .unwrap();
        assert_eq!(visible.len(), 4);
        let writable = b
            .fetch_many(
                Table::Records,
                &criteria,
                &SearchOptions::new().write_only().count_only(),
            )
            .await
            .unwrap();
        assert!(writable.is_empty());

        let narrow = SearchCriteria::new().name("Report 1").owner(bob);
        let none = b
            .fetch_many(Table::Records, &narrow, &SearchOptions::new())
            .await
            .unwrap();
        assert!(none.is_empty());
        let wide = b
            .fetch_many(Table::Records, &narrow, &SearchOptions::new().wide())
            .await
            .unwrap()
            .into_ids();
        assert_eq!(wide, vec![ids[1]]);
    });
}

#[test]
fn unknown_discriminators_fall_back_to_generic() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        let record = generic("standup")
            .with_discriminator(rowguard::Discriminator::new("meeting").unwrap());
        let id = a.create(record).await.unwrap().id().unwrap();

        let mut fresh = engine.session(Some(alice)).await;
        let fetched = fresh
            .fetch_by_id(Table::Records, id, Access::Read)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.read().tag(), VariantTag::Generic);
        assert_eq!(fetched.read().discriminator().as_str(), "meeting");
    });

    let strict = EngineBuilder::new(common::connection())
        .registry(VariantRegistry::default().fallback(None))
        .build()
        .unwrap();
    let carol = login(&strict, "carol", &[]);
    block_on(async {
        let mut c = strict.session(Some(carol)).await;
        let record =
            generic("standup").with_discriminator(rowguard::Discriminator::new("meeting").unwrap());
        let id = c.create(record).await.unwrap().id().unwrap();
        let result = c.fetch_by_id(Table::Records, id, Access::Read).await;
        assert!(matches!(result, Err(Error::RecordTypeUnresolved { .. })));
    });
}

#[cfg(feature = "memory-cache")]
#[test]
fn security_node_writes_invalidate_cached_identities() {
    let engine = EngineBuilder::new(common::connection())
        .cache(rowguard::MemoryCache::new(16))
        .build()
        .unwrap();
    let sam = login(&engine, "sam", &[]);
    assert_eq!(block_on(engine.resolve_identities(sam)).len(), 1);

    block_on(async {
        let mut god = engine.session(Some(DEFAULT_GOD_ID)).await;
        let node = god
            .fetch_by_id(Table::SecurityNodes, sam, Access::Write)
            .await
            .unwrap()
            .unwrap();
        node.update(|record| {
            record
                .security_node_mut()
                .unwrap()
                .delegated_ids
                .insert(SecurityId::new(7));
        });
        god.write(&node).await.unwrap();
    });

    let refreshed = block_on(engine.resolve_identities(sam));
    assert!(refreshed.contains(SecurityId::new(7)));
}

#[test]
fn name_matching_folds_non_ascii_case() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        let school = a.create(generic("ÉCOLE")).await.unwrap().id().unwrap();
        a.create(generic("collège")).await.unwrap();

        for pattern in ["ÉCOLE", "école", "éc%", "%COLE"] {
            let found = a
                .fetch_many(
                    Table::Records,
                    &SearchCriteria::new().name(pattern),
                    &SearchOptions::new().ids_only(),
                )
                .await
                .unwrap()
                .into_ids();
            assert_eq!(found, vec![school], "pattern {pattern}");
        }
    });
}

#[test]
fn underscores_in_wildcard_names_match_literally() {
    let engine = engine();
    let alice = login(&engine, "alice", &[]);

    block_on(async {
        let mut a = engine.session(Some(alice)).await;
        a.create(generic("abcd")).await.unwrap();
        let literal = a.create(generic("a_cd")).await.unwrap().id().unwrap();

        let found = a
            .fetch_many(
                Table::Records,
                &SearchCriteria::new().name("a_c%"),
                &SearchOptions::new().ids_only(),
            )
            .await
            .unwrap()
            .into_ids();
        assert_eq!(found, vec![literal]);
    });
}

#[test]
fn failed_security_node_insert_leaves_no_row_behind() {
    let inner = SqliteConnection::open_in_memory().unwrap();
    inner.install_baseline(DEFAULT_GOD_ID).unwrap();
    let engine = EngineBuilder::new(FailingUpdates {
        inner,
        armed: AtomicBool::new(true),
    })
    .build()
    .unwrap();
    let carol = || Record::login(LoginId::new("carol").unwrap());
    let carol_rows = Statement::new(
        "SELECT id FROM security_nodes WHERE login_id = 'carol'",
        Vec::new(),
    );

    block_on(async {
        let mut god = engine.session(Some(DEFAULT_GOD_ID)).await;
        let result = god.create(carol()).await;
        assert!(matches!(result, Err(Error::Connection(_))), "{result:?}");
        let leftover = engine.gateway().connection().query(&carol_rows).await.unwrap();
        assert!(leftover.is_empty());

        engine.gateway().connection().armed.store(false, Ordering::SeqCst);
        let created = god.create(carol()).await.unwrap();
        let id = created.id().unwrap();
        assert_eq!(created.read().read_security_id, Some(SecurityId::from(id)));
        let rows = engine.gateway().connection().query(&carol_rows).await.unwrap();
        assert_eq!(rows.len(), 1);
    });
}
