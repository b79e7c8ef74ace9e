use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use viewhost::view::loader::{component_hash, native_object_literal};
use viewhost::view::PrerenderCache;
use viewhost::{
    BrowserHost, ComponentHost, HostConfig, KeyValueStore, MemoryResolver, MemoryStore,
    ModuleRegistry, NativeMethods, SqliteStore, ViewModule, MAIN_FRAME,
};

const READY: Duration = Duration::from_secs(5);
const SOURCE: &str = "views/badge";

// Reports what was on screen when it was constructed, before its own render.
const BADGE: &str = r#"
Views["Badge"] = { default: class Badge {
    constructor(props, context) {
        this.props = props;
        props.constructed(context.root.innerHTML);
    }
    render() { return '<b>' + this.props.text + '</b>'; }
} };
"#;

struct Session {
    host: ComponentHost,
    first_paint: Arc<Mutex<Vec<String>>>,
}

fn badge(text: &str, first_paint: Arc<Mutex<Vec<String>>>) -> Arc<ViewModule> {
    ViewModule::builder("Badge")
        .main_source(SOURCE)
        .event("Constructed")
        .property("Text", text)
        .native_object(move || {
            let seen = Arc::clone(&first_paint);
            NativeMethods::new()
                .action("Constructed", move |args: Vec<Value>| {
                    let markup = args
                        .first()
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    seen.lock().unwrap().push(markup);
                })
                .into_object()
        })
        .build()
}

fn open(store: Arc<dyn KeyValueStore>, capacity: usize, text: &str) -> Session {
    let browser = BrowserHost::new(
        HostConfig::default().with_cache_entries(capacity),
        Arc::new(MemoryResolver::new().with("views/badge.js", BADGE)),
        store,
    );
    let host = ComponentHost::new(browser, ModuleRegistry::new()).unwrap();
    let first_paint = Arc::new(Mutex::new(Vec::new()));
    host.load_component(MAIN_FRAME, badge(text, Arc::clone(&first_paint)))
        .unwrap();
    assert!(host.wait_until_ready(MAIN_FRAME, READY), "badge '{text}' never became ready");
    Session { host, first_paint }
}

fn hash_of(text: &str) -> String {
    component_hash(&native_object_literal(&badge(text, Arc::default())))
}

#[test]
fn cached_markup_is_shown_before_the_live_render() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let first = open(Arc::clone(&store), 1, "hello");
    assert_eq!(*first.first_paint.lock().unwrap(), vec![""]);
    first.host.dispose();

    let second = open(Arc::clone(&store), 1, "hello");
    let painted = second.first_paint.lock().unwrap().clone();
    assert_eq!(painted.len(), 1);
    assert!(painted[0].contains("<b>hello</b>"), "{painted:?}");
    assert_eq!(
        second.host.markup(MAIN_FRAME).unwrap().as_deref(),
        Some("<b>hello</b>")
    );
    second.host.dispose();
}

#[test]
fn changed_properties_miss_the_cache() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    open(Arc::clone(&store), 2, "before").host.dispose();

    let session = open(Arc::clone(&store), 2, "after");
    assert_eq!(*session.first_paint.lock().unwrap(), vec![""]);
    session.host.dispose();
}

#[test]
fn only_the_most_recent_fingerprints_are_kept() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cache = PrerenderCache::new(Arc::clone(&store));

    for text in ["one", "two", "three"] {
        open(Arc::clone(&store), 2, text).host.dispose();
    }
    assert_eq!(cache.lookup(SOURCE, &hash_of("one")).unwrap(), None);
    assert!(cache.lookup(SOURCE, &hash_of("two")).unwrap().is_some());
    assert!(cache.lookup(SOURCE, &hash_of("three")).unwrap().is_some());

    // hits do not touch the fingerprint list
    for text in ["three", "two"] {
        open(Arc::clone(&store), 2, text).host.dispose();
    }
    assert_eq!(cache.lookup(SOURCE, &hash_of("one")).unwrap(), None);
    assert_eq!(
        cache.entries(SOURCE).unwrap(),
        vec![hash_of("two"), hash_of("three")]
    );
}

#[test]
fn zero_capacity_never_touches_the_store() {
    let store = Arc::new(MemoryStore::new());
    let session = open(store.clone(), 0, "quiet");
    session.host.dispose();
    assert!(store.is_empty());
}

#[test]
fn cache_survives_in_sqlite() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(dir.path(), "tests").unwrap());
        open(store, 1, "persisted").host.dispose();
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(dir.path(), "tests").unwrap());
    let session = open(store, 1, "persisted");
    assert!(session.first_paint.lock().unwrap()[0].contains("<b>persisted</b>"));
    session.host.dispose();
}
