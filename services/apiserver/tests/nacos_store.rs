//! Remote backend behavior over the in-process config service: keyed
//! records, MD5 resource versions, the roster, sealed payloads and
//! poll-driven watch events.

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use osprey_apiserver::nacos::{content_md5, ConfigClient, MemoryConfigClient};
use osprey_apiserver::registry::secret_attrs;
use osprey_apiserver::store::nacos::{NacosSettings, NacosStore};
use osprey_apiserver::store::watch::WatchStream;
use osprey_apiserver::store::{Storage, Updater};
use osprey_codec::YamlCodec;
use osprey_crypto::PayloadCipher;
use osprey_kube::selector::namespace_scoped_attrs;
use osprey_kube::{EventType, KubeObject, ListOptions, RequestContext, ResourceInfo, StorageError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const NS: &str = "osprey-system";

fn fast_settings() -> NacosSettings {
    NacosSettings {
        refresh_interval: Duration::from_millis(50),
        search_page_size: 2,
        cache_sync_delay: Duration::ZERO,
    }
}

fn configmap_info() -> ResourceInfo {
    ResourceInfo {
        group: String::new(),
        version: "v1".to_string(),
        kind: "ConfigMap".to_string(),
        singular: "configmap".to_string(),
        plural: "configmaps".to_string(),
        namespaced: true,
    }
}

fn configmap_store(client: &Arc<MemoryConfigClient>) -> NacosStore<ConfigMap> {
    NacosStore::new(
        configmap_info(),
        Box::new(YamlCodec::new()),
        Arc::clone(client) as Arc<dyn ConfigClient>,
        namespace_scoped_attrs::<ConfigMap>(),
        None,
        fast_settings(),
    )
}

fn secret_store(
    client: &Arc<MemoryConfigClient>,
    key: Option<&[u8]>,
) -> NacosStore<Secret> {
    NacosStore::new(
        ResourceInfo {
            group: String::new(),
            version: "v1".to_string(),
            kind: "Secret".to_string(),
            singular: "secret".to_string(),
            plural: "secrets".to_string(),
            namespaced: true,
        },
        Box::new(YamlCodec::new()),
        Arc::clone(client) as Arc<dyn ConfigClient>,
        secret_attrs(),
        key.map(|key| PayloadCipher::new(key).expect("cipher")),
        fast_settings(),
    )
}

fn ctx() -> RequestContext {
    RequestContext::namespaced(NS)
}

fn config_map(name: &str, data: &[(&str, &str)], labels: &[(&str, &str)]) -> ConfigMap {
    let mut cm = ConfigMap::default();
    cm.metadata.name = Some(name.to_string());
    if !data.is_empty() {
        cm.data = Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
    if !labels.is_empty() {
        cm.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
    cm
}

fn replace_with(obj: ConfigMap) -> Updater<ConfigMap> {
    Box::new(move |_current| Ok(obj))
}

async fn next_event<O: KubeObject>(stream: &mut WatchStream<O>) -> osprey_kube::Event<O> {
    tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("timed out waiting for watch event")
        .expect("watch stream ended")
}

#[tokio::test]
async fn create_get_delete_round_trip() {
    let client = Arc::new(MemoryConfigClient::new());
    let store = configmap_store(&client);

    let created = store
        .create(&ctx(), config_map("cm1", &[("a", "1")], &[]), None)
        .await
        .expect("create");
    assert!(!created.resource_version().is_empty());
    assert_eq!(created.namespace(), NS);

    // The record lands under `<plural>.<name>` in the namespace group and
    // the resource version is the MD5 of the raw payload.
    let raw = client.raw("configmaps.cm1", NS).expect("raw record");
    assert_eq!(created.resource_version(), content_md5(&raw));
    assert!(!raw.contains("resourceVersion"));

    let fetched = store.get(&ctx(), "cm1").await.expect("get");
    assert_eq!(fetched.data.as_ref().expect("data")["a"], "1");
    assert_eq!(fetched.resource_version(), created.resource_version());

    let (deleted, gone) = store.delete(&ctx(), "cm1", None).await.expect("delete");
    assert!(gone);
    assert_eq!(deleted.name(), "cm1");
    assert!(client.raw("configmaps.cm1", NS).is_none());

    let err = store.get(&ctx(), "cm1").await.expect_err("get after delete");
    assert!(err.is_not_found());

    store.destroy();
}

#[tokio::test]
async fn create_on_existing_name_conflicts() {
    let client = Arc::new(MemoryConfigClient::new());
    let store = configmap_store(&client);

    store
        .create(&ctx(), config_map("cm1", &[], &[]), None)
        .await
        .expect("create");
    let err = store
        .create(&ctx(), config_map("cm1", &[], &[]), None)
        .await
        .expect_err("duplicate create");
    assert!(err.is_conflict());

    store.destroy();
}

#[tokio::test]
async fn update_enforces_compare_and_swap_by_content_hash() {
    let client = Arc::new(MemoryConfigClient::new());
    let store = configmap_store(&client);

    let created = store
        .create(&ctx(), config_map("cm1", &[("a", "1")], &[]), None)
        .await
        .expect("create");

    // Stale version: conflict, record unchanged.
    let mut stale = config_map("cm1", &[("a", "999")], &[]);
    stale.set_resource_version(Some("0123456789abcdef0123456789abcdef".to_string()));
    let err = store
        .update(&ctx(), "cm1", replace_with(stale), None, None, false)
        .await
        .expect_err("stale update");
    assert!(err.is_conflict());
    let current = store.get(&ctx(), "cm1").await.expect("get");
    assert_eq!(current.data.as_ref().expect("data")["a"], "1");

    // Current version: accepted, new version is the new payload's hash.
    let mut fresh = config_map("cm1", &[("a", "2")], &[]);
    fresh.set_resource_version(Some(created.resource_version().to_string()));
    let (updated, was_created) = store
        .update(&ctx(), "cm1", replace_with(fresh), None, None, false)
        .await
        .expect("update");
    assert!(!was_created);
    assert_ne!(updated.resource_version(), created.resource_version());

    let fetched = store.get(&ctx(), "cm1").await.expect("get");
    assert_eq!(fetched.resource_version(), updated.resource_version());
    assert_eq!(fetched.data.as_ref().expect("data")["a"], "2");

    store.destroy();
}

#[tokio::test]
async fn update_missing_object_requires_force_allow_create() {
    let client = Arc::new(MemoryConfigClient::new());
    let store = configmap_store(&client);

    let err = store
        .update(
            &ctx(),
            "absent",
            replace_with(config_map("absent", &[], &[])),
            None,
            None,
            false,
        )
        .await
        .expect_err("update of missing object");
    assert!(err.is_not_found());

    let (_, was_created) = store
        .update(
            &ctx(),
            "absent",
            replace_with(config_map("absent", &[], &[])),
            None,
            None,
            true,
        )
        .await
        .expect("forced update");
    assert!(was_created);

    store.destroy();
}

#[tokio::test]
async fn list_paginates_and_applies_selectors() {
    let client = Arc::new(MemoryConfigClient::new());
    let store = configmap_store(&client);

    // Five objects against a page size of two exercises pagination.
    for (name, app) in [("o1", "x"), ("o2", "y"), ("o3", "x"), ("o4", "y"), ("o5", "x")] {
        store
            .create(&ctx(), config_map(name, &[], &[("app", app)]), None)
            .await
            .expect("create");
    }

    let all = store
        .list(&ctx(), &ListOptions::default())
        .await
        .expect("list");
    assert_eq!(all.len(), 5);

    let labeled = store
        .list(
            &ctx(),
            &ListOptions {
                label_selector: Some("app=x".to_string()),
                field_selector: None,
            },
        )
        .await
        .expect("list");
    assert_eq!(labeled.len(), 3);

    store.destroy();
}

#[tokio::test]
async fn roster_tracks_known_records() {
    let client = Arc::new(MemoryConfigClient::new());
    let store = configmap_store(&client);

    store
        .create(&ctx(), config_map("cm1", &[], &[]), None)
        .await
        .expect("create");
    let roster = client
        .raw("configmaps.__names__", "DEFAULT_GROUP")
        .expect("roster");
    assert!(roster.contains(&format!("{NS}/configmaps.cm1\n")));

    store.delete(&ctx(), "cm1", None).await.expect("delete");
    let roster = client
        .raw("configmaps.__names__", "DEFAULT_GROUP")
        .expect("roster");
    // The service rejects empty content, so an empty roster stores a
    // placeholder.
    assert_eq!(roster, "EMPTY");

    store.destroy();
}

#[tokio::test]
async fn secrets_are_field_selectable_by_type() {
    let client = Arc::new(MemoryConfigClient::new());
    let store = secret_store(&client, None);

    let mut tls = Secret::default();
    tls.metadata.name = Some("tls1".to_string());
    tls.type_ = Some("kubernetes.io/tls".to_string());
    let mut opaque = Secret::default();
    opaque.metadata.name = Some("op1".to_string());
    opaque.type_ = Some("Opaque".to_string());

    store.create(&ctx(), tls, None).await.expect("create");
    store.create(&ctx(), opaque, None).await.expect("create");

    let selected = store
        .list(
            &ctx(),
            &ListOptions {
                label_selector: None,
                field_selector: Some("type=kubernetes.io/tls".to_string()),
            },
        )
        .await
        .expect("list");
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].name(), "tls1");

    store.destroy();
}

#[tokio::test]
async fn encrypted_round_trip_and_keyless_reads() {
    let client = Arc::new(MemoryConfigClient::new());
    let key = [0u8; 16];
    let store = secret_store(&client, Some(&key));

    let mut secret = Secret::default();
    secret.metadata.name = Some("s1".to_string());
    secret.string_data = Some(BTreeMap::from([(
        "password".to_string(),
        "hunter2".to_string(),
    )]));
    store.create(&ctx(), secret, None).await.expect("create");

    // The stored payload is sealed; the plaintext never reaches the
    // service.
    let raw = client.raw("secrets.s1", NS).expect("raw record");
    assert!(raw.starts_with("enc|"));
    assert!(!raw.contains("hunter2"));

    // The holder of the key reads plaintext.
    let fetched = store.get(&ctx(), "s1").await.expect("get");
    assert_eq!(
        fetched.string_data.as_ref().expect("string data")["password"],
        "hunter2"
    );

    // A keyless instance cannot decode the record: gets fail and lists
    // skip it.
    let keyless = secret_store(&client, None);
    let err = keyless.get(&ctx(), "s1").await.expect_err("keyless get");
    assert!(matches!(err, StorageError::Internal(_)));
    let listed = keyless
        .list(&ctx(), &ListOptions::default())
        .await
        .expect("list");
    assert!(listed.is_empty());

    // A different key fails the same way.
    let wrong = secret_store(&client, Some(&[1u8; 16]));
    assert!(wrong.get(&ctx(), "s1").await.is_err());

    keyless.destroy();
    wrong.destroy();
    store.destroy();
}

#[tokio::test]
async fn watch_observes_mutations_through_the_refresh_loop() {
    let client = Arc::new(MemoryConfigClient::new());
    let store = configmap_store(&client);

    let mut stream = store
        .watch(
            &ctx(),
            &ListOptions {
                label_selector: Some("app=x".to_string()),
                field_selector: None,
            },
        )
        .await
        .expect("watch");

    store
        .create(&ctx(), config_map("o1", &[], &[("app", "x")]), None)
        .await
        .expect("create");
    store
        .create(&ctx(), config_map("o2", &[], &[("app", "y")]), None)
        .await
        .expect("create");

    // The refresh loop discovers the additions; only the matching object is
    // delivered.
    let event = next_event(&mut stream).await;
    assert_eq!(event.event_type, EventType::Added);
    assert_eq!(event.object.name(), "o1");

    // Give the refresh loop a pass so o2 gains its subscription, then
    // relabel it to match the selector.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let current = store.get(&ctx(), "o2").await.expect("get");
    let mut relabeled = config_map("o2", &[], &[("app", "x")]);
    relabeled.set_resource_version(Some(current.resource_version().to_string()));
    store
        .update(&ctx(), "o2", replace_with(relabeled), None, None, false)
        .await
        .expect("update");

    let event = next_event(&mut stream).await;
    assert_eq!(event.event_type, EventType::Modified);
    assert_eq!(event.object.name(), "o2");

    store.destroy();
}

#[tokio::test]
async fn external_mutations_are_observed() {
    let client = Arc::new(MemoryConfigClient::new());
    let store = configmap_store(&client);

    let mut stream = store
        .watch(&ctx(), &ListOptions::default())
        .await
        .expect("watch");

    // Another client of the config service writes a record directly.
    client.seed(
        "configmaps.external",
        NS,
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: external\n",
    );

    let event = next_event(&mut stream).await;
    assert_eq!(event.event_type, EventType::Added);
    assert_eq!(event.object.name(), "external");
    assert_eq!(event.object.namespace(), NS);

    // And deletes it again.
    client
        .delete_config("configmaps.external", NS)
        .await
        .expect("delete");

    let event = next_event(&mut stream).await;
    assert_eq!(event.event_type, EventType::Deleted);
    assert_eq!(event.object.name(), "external");

    store.destroy();
}

#[tokio::test]
async fn watch_replays_snapshot_before_live_events() {
    let client = Arc::new(MemoryConfigClient::new());
    let store = configmap_store(&client);

    store
        .create(&ctx(), config_map("pre", &[], &[]), None)
        .await
        .expect("create");
    // Let the refresh loop absorb the existing record so it does not show
    // up again as a live Added.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut stream = store
        .watch(&ctx(), &ListOptions::default())
        .await
        .expect("watch");
    let event = next_event(&mut stream).await;
    assert_eq!(event.event_type, EventType::Added);
    assert_eq!(event.object.name(), "pre");

    store
        .create(&ctx(), config_map("post", &[], &[]), None)
        .await
        .expect("create");
    let event = next_event(&mut stream).await;
    assert_eq!(event.event_type, EventType::Added);
    assert_eq!(event.object.name(), "post");

    store.destroy();
}

#[tokio::test]
async fn delete_collection_deletes_matching_records() {
    let client = Arc::new(MemoryConfigClient::new());
    let store = configmap_store(&client);

    for (name, app) in [("o1", "x"), ("o2", "y")] {
        store
            .create(&ctx(), config_map(name, &[], &[("app", app)]), None)
            .await
            .expect("create");
    }

    let deleted = store
        .delete_collection(
            &ctx(),
            None,
            &ListOptions {
                label_selector: Some("app=x".to_string()),
                field_selector: None,
            },
        )
        .await
        .expect("delete collection");
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].name(), "o1");
    assert!(client.raw("configmaps.o1", NS).is_none());
    assert!(client.raw("configmaps.o2", NS).is_some());

    store.destroy();
}
