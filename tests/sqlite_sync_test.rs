// ABOUTME: End-to-end change polling against the sqlite-directory store
// ABOUTME: One-shot scans with fixed clocks plus daemon cycles with persisted checkpoints

use chrono::{DateTime, Utc};
use directory_sync::directory::sqlite::{SqliteConnector, SqliteDirectory};
use directory_sync::schema::{ConfiguredSchema, ObjectClass, ObjectClassInfo};
use directory_sync::sync::{
    ChangerExclusion, CheckpointState, CollectingHandler, DaemonConfig, FixedClock,
    ModifyTimestampSync, SyncDaemon, SyncOptions, SyncSettings, SyncToken, Watermark,
};
use sqlite_directory::DirectoryStore;
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::tempdir;

const BASE: &str = "dc=example,dc=com";
const ADMIN: &str = "cn=admin,dc=example,dc=com";
const SYNC_IDENTITY: &str = "cn=idm-sync,ou=services,dc=example,dc=com";

fn at(text: &str) -> DateTime<Utc> {
    Watermark::parse(text).unwrap().as_datetime()
}

fn attrs(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    pairs
        .iter()
        .map(|(name, values)| {
            (
                name.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect()
}

fn person(cn: &str) -> BTreeMap<String, Vec<String>> {
    attrs(&[
        ("objectClass", &["top", "inetOrgPerson"]),
        ("cn", &[cn]),
        ("mail", &["someone@example.com"]),
        ("telephoneNumber", &["555-0100"]),
    ])
}

fn schema() -> ConfiguredSchema {
    ConfiguredSchema::new(vec![
        ObjectClassInfo {
            name: "account".to_string(),
            ldap_object_class: "inetOrgPerson".to_string(),
            uid_attribute: "entryUUID".to_string(),
            attributes: vec!["cn".to_string(), "mail".to_string()],
        },
        ObjectClassInfo {
            name: "group".to_string(),
            ldap_object_class: "groupOfNames".to_string(),
            uid_attribute: "dn".to_string(),
            attributes: vec![],
        },
    ])
}

fn settings() -> SyncSettings {
    SyncSettings::new(BASE).with_excluded_modifier(SYNC_IDENTITY)
}

#[test]
fn test_scan_over_sqlite_store() {
    let mut store = DirectoryStore::open_in_memory().unwrap();
    store.set_page_size(2);

    let old = store
        .add_at(&format!("uid=old,{BASE}"), person("Old"), Some(ADMIN), at("20231201000000Z"))
        .unwrap();
    let alice = store
        .add_at(&format!("uid=alice,{BASE}"), person("Alice"), Some(ADMIN), at("20231201000000Z"))
        .unwrap();
    store
        .modify_at(
            &format!("uid=alice,{BASE}"),
            attrs(&[("mail", &["alice@example.com"])]),
            Some(ADMIN),
            at("20240101000500Z"),
        )
        .unwrap();
    let bob = store
        .add_at(&format!("uid=bob,{BASE}"), person("Bob"), Some(ADMIN), at("20240101000000Z"))
        .unwrap();
    store
        .add_at(
            &format!("uid=echo,{BASE}"),
            person("Echo"),
            Some(SYNC_IDENTITY),
            at("20240101000700Z"),
        )
        .unwrap();
    store
        .add_at(
            &format!("cn=ops,{BASE}"),
            attrs(&[("objectClass", &["groupOfNames"]), ("cn", &["ops"])]),
            Some(ADMIN),
            at("20240101000800Z"),
        )
        .unwrap();
    store
        .add_at("uid=outside,dc=other", person("Outside"), Some(ADMIN), at("20240101000900Z"))
        .unwrap();

    let clock = FixedClock::new(at("20240101001000Z"));
    let strategy = ModifyTimestampSync::new(
        settings(),
        SqliteDirectory::from_store(store),
        schema(),
        ChangerExclusion,
    )
    .with_observer(())
    .with_clock(&clock);

    let mut handler = CollectingHandler::new();
    let summary = strategy
        .sync(
            &ObjectClass::named("account"),
            Some(&SyncToken::Text("20240101000000Z".to_string())),
            &mut handler,
            &SyncOptions::default(),
        )
        .unwrap();

    // alice (modified), bob (created on the boundary), echo (excluded creator),
    // ops (other object class). old and outside never match.
    assert_eq!(summary.found, 4);
    assert_eq!(summary.delivered, 2);
    assert_eq!(
        handler.uids(),
        vec![alice.entry_uuid.as_str(), bob.entry_uuid.as_str()]
    );
    assert!(!handler.uids().contains(&old.entry_uuid.as_str()));

    let alice_event = &handler.events[0];
    assert_eq!(alice_event.object.name, format!("uid=alice,{BASE}"));
    assert_eq!(
        alice_event.object.attributes.get("mail"),
        Some(&vec!["alice@example.com".to_string()])
    );
    assert!(!alice_event.object.attributes.contains_key("telephoneNumber"));
    assert_eq!(alice_event.token.to_string(), "20240101001000Z");
    assert_eq!(handler.final_watermark, Some(summary.resume));
}

#[test]
fn test_scan_all_classes_over_sqlite_store() {
    let store = DirectoryStore::open_in_memory().unwrap();
    store
        .add_at(&format!("uid=alice,{BASE}"), person("Alice"), Some(ADMIN), at("20240101000100Z"))
        .unwrap();
    store
        .add_at(
            &format!("cn=ops,{BASE}"),
            attrs(&[
                ("objectClass", &["groupOfNames"]),
                ("cn", &["ops"]),
                ("member", &["uid=alice,dc=example,dc=com"]),
            ]),
            Some(ADMIN),
            at("20240101000200Z"),
        )
        .unwrap();

    let clock = FixedClock::new(at("20240101001000Z"));
    let strategy = ModifyTimestampSync::new(
        settings(),
        SqliteDirectory::from_store(store),
        schema(),
        ChangerExclusion,
    )
    .with_observer(())
    .with_clock(&clock);

    let mut handler = CollectingHandler::new();
    let summary = strategy
        .sync(
            &ObjectClass::All,
            Some(&SyncToken::Text("20240101000000Z".to_string())),
            &mut handler,
            &SyncOptions::default(),
        )
        .unwrap();

    assert_eq!(summary.delivered, 2);
    let group = &handler.events[1].object;
    assert_eq!(group.object_class, "group");
    assert_eq!(group.uid, format!("cn=ops,{BASE}"));
    assert!(group.attributes.contains_key("member"));
    assert!(!group.attributes.contains_key("createTimestamp"));
}

#[test]
fn test_scan_all_classes_skips_organizational_units() {
    let store = DirectoryStore::open_in_memory().unwrap();
    store
        .add_at(
            &format!("ou=people,{BASE}"),
            attrs(&[("objectClass", &["top", "organizationalUnit"]), ("ou", &["people"])]),
            Some(ADMIN),
            at("20240101000100Z"),
        )
        .unwrap();
    store
        .add_at(
            &format!("uid=alice,ou=people,{BASE}"),
            person("Alice"),
            Some(ADMIN),
            at("20240101000200Z"),
        )
        .unwrap();

    let clock = FixedClock::new(at("20240101001000Z"));
    let strategy = ModifyTimestampSync::new(
        settings(),
        SqliteDirectory::from_store(store),
        schema(),
        ChangerExclusion,
    )
    .with_observer(())
    .with_clock(&clock);

    let mut handler = CollectingHandler::new();
    let summary = strategy
        .sync(
            &ObjectClass::All,
            Some(&SyncToken::Text("20240101000000Z".to_string())),
            &mut handler,
            &SyncOptions::default(),
        )
        .unwrap();

    assert_eq!(summary.found, 2);
    assert_eq!(summary.delivered, 1);
    assert_eq!(handler.events[0].object.object_class, "account");
    assert_eq!(handler.final_watermark, Some(summary.resume));
}

#[tokio::test]
async fn test_daemon_cycles_commit_checkpoints() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("directory.db");
    let state_path = dir.path().join("state").join("checkpoints.json");

    let store = DirectoryStore::open(&store_path).unwrap();
    store
        .add_at(&format!("uid=alice,{BASE}"), person("Alice"), Some(ADMIN), at("20200101000000Z"))
        .unwrap();

    let daemon = SyncDaemon::new(
        SqliteConnector::new(&store_path),
        schema(),
        settings(),
        CollectingHandler::new(),
        DaemonConfig {
            sync_interval: Duration::from_secs(1),
            state_path: state_path.clone(),
            object_classes: vec![ObjectClass::named("account")],
        },
    );

    // First cycle only establishes the resume point
    let stats = daemon.run_sync_cycle().await.unwrap();
    assert!(stats.is_success(), "{:?}", stats.errors);
    assert_eq!(stats.classes_synced, 1);
    assert_eq!(stats.events_delivered, 0);

    let state = CheckpointState::load(&state_path).await.unwrap();
    let first = state.watermark("account").unwrap();
    assert!(state.matches_settings(&settings().fingerprint()));

    store
        .modify(
            &format!("uid=alice,{BASE}"),
            attrs(&[("mail", &["alice@example.com"])]),
            Some(ADMIN),
        )
        .unwrap();
    store
        .add(&format!("uid=echo,{BASE}"), person("Echo"), Some(SYNC_IDENTITY))
        .unwrap();

    let stats = daemon.run_sync_cycle().await.unwrap();
    assert!(stats.is_success(), "{:?}", stats.errors);
    assert_eq!(stats.entries_found, 2);
    assert_eq!(stats.events_delivered, 1);

    let state = CheckpointState::load(&state_path).await.unwrap();
    let second = state.watermark("account").unwrap();
    assert!(second >= first);
    assert_eq!(state.checkpoint("account").unwrap().last_delivered, 1);

    let handler = daemon.handler();
    let handler = handler.lock().unwrap();
    assert_eq!(handler.events.len(), 1);
    assert_eq!(handler.events[0].object.name, format!("uid=alice,{BASE}"));
    assert_eq!(handler.final_notifications, 2);
    assert_eq!(handler.final_watermark, Some(second));
}

#[tokio::test]
async fn test_daemon_adopts_changed_settings() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("directory.db");
    let state_path = dir.path().join("checkpoints.json");
    DirectoryStore::open(&store_path).unwrap();

    let config = DaemonConfig {
        sync_interval: Duration::from_secs(1),
        state_path: state_path.clone(),
        object_classes: Vec::new(),
    };
    let daemon = SyncDaemon::new(
        SqliteConnector::new(&store_path),
        schema(),
        settings(),
        CollectingHandler::new(),
        config.clone(),
    );
    let stats = daemon.run_sync_cycle().await.unwrap();
    // Every configured class is polled when none are named
    assert_eq!(stats.classes_synced, 2);

    let mut state = CheckpointState::load(&state_path).await.unwrap();
    assert_eq!(state.tracked_classes(), vec!["account", "group"]);
    state.fingerprint = "stale".to_string();
    state.save(&state_path).await.unwrap();

    let changed = SyncSettings::new(BASE);
    let daemon = SyncDaemon::new(
        SqliteConnector::new(&store_path),
        schema(),
        changed.clone(),
        CollectingHandler::new(),
        config,
    );
    daemon.run_sync_cycle().await.unwrap();

    let state = CheckpointState::load(&state_path).await.unwrap();
    assert!(state.matches_settings(&changed.fingerprint()));
    assert_eq!(state.tracked_classes(), vec!["account", "group"]);
}

#[tokio::test]
async fn test_daemon_delivers_changes_made_before_settings_change() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("directory.db");
    let state_path = dir.path().join("checkpoints.json");
    let store = DirectoryStore::open(&store_path).unwrap();

    // Checkpoint committed under the old settings
    let mut state = CheckpointState::new(
        &store_path.display().to_string(),
        BASE,
        &settings().fingerprint(),
    );
    state.commit(&directory_sync::sync::ScanSummary {
        object_class: "account".to_string(),
        base: BASE.to_string(),
        filter: String::new(),
        since: Watermark::parse("20200101000000Z").unwrap(),
        resume: Watermark::parse("20200101000000Z").unwrap(),
        found: 0,
        delivered: 0,
    });
    state.save(&state_path).await.unwrap();

    // Changed while the poller was down
    store
        .add_at(&format!("uid=a,{BASE}"), person("A"), Some(ADMIN), at("20210101000000Z"))
        .unwrap();

    let changed = SyncSettings::new(BASE).with_excluded_modifier("cn=someone-else");
    let daemon = SyncDaemon::new(
        SqliteConnector::new(&store_path),
        schema(),
        changed.clone(),
        CollectingHandler::new(),
        DaemonConfig {
            sync_interval: Duration::from_secs(1),
            state_path: state_path.clone(),
            object_classes: vec![ObjectClass::named("account")],
        },
    );
    let stats = daemon.run_sync_cycle().await.unwrap();
    assert!(stats.is_success(), "{:?}", stats.errors);
    assert_eq!(stats.events_delivered, 1);

    let handler = daemon.handler();
    assert_eq!(
        handler.lock().unwrap().events[0].object.name,
        format!("uid=a,{BASE}")
    );

    let state = CheckpointState::load(&state_path).await.unwrap();
    assert!(state.matches_settings(&changed.fingerprint()));
    assert!(state.watermark("account").unwrap() > Watermark::parse("20210101000000Z").unwrap());
}

#[test]
fn test_core_and_store_agree_on_dn_and_time_forms() {
    for dn in [
        "cn=admin,dc=example,dc=com",
        "CN=Admin, DC=Example, DC=Com",
        " uid = alice ,ou=People,dc=example",
    ] {
        assert_eq!(
            directory_sync::sync::predicate::normalize_dn(dn),
            sqlite_directory::normalize_dn(dn),
            "{dn}"
        );
    }

    for value in [
        "20240101000000Z",
        "20240101000000.75Z",
        "20240101020000+0200",
        "20231231220000-0200",
    ] {
        assert_eq!(
            Some(Watermark::parse(value).unwrap().as_datetime()),
            sqlite_directory::filter::parse_generalized_time(value),
            "{value}"
        );
    }
}

#[tokio::test]
async fn test_daemon_reports_unreachable_store() {
    let dir = tempdir().unwrap();
    // A directory where the database file should be cannot be opened
    let store_path = dir.path().join("not-a-db");
    std::fs::create_dir_all(&store_path).unwrap();
    let state_path = dir.path().join("checkpoints.json");

    let daemon = SyncDaemon::new(
        SqliteConnector::new(&store_path),
        schema(),
        settings(),
        CollectingHandler::new(),
        DaemonConfig {
            sync_interval: Duration::from_secs(1),
            state_path: state_path.clone(),
            object_classes: vec![ObjectClass::named("account")],
        },
    );
    let stats = daemon.run_sync_cycle().await.unwrap();
    assert!(!stats.is_success());
    assert_eq!(stats.classes_synced, 0);

    let state = CheckpointState::load(&state_path).await.unwrap();
    assert!(state.watermark("account").is_none());
}
