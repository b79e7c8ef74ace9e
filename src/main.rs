use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use viewhost::{
    BrowserHost, ComponentHost, FileResolver, HostConfig, KeyValueStore, MemoryStore,
    ModuleRegistry, SqliteStore, ViewModule, MAIN_FRAME,
};

const READY_TIMEOUT: Duration = Duration::from_secs(30);

fn open_store(config: &HostConfig) -> Arc<dyn KeyValueStore> {
    let opened = match &config.data_dir {
        Some(dir) => SqliteStore::open(dir, &config.storage_domain),
        None => SqliteStore::open_default(&config.storage_domain),
    };
    match opened {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("Failed to open pre-render cache: {err}. Using memory.");
            Arc::new(MemoryStore::new())
        }
    }
}

fn main() {
    let mut args = std::env::args().skip(1);
    let (Some(root), Some(source)) = (args.next(), args.next()) else {
        eprintln!("usage: viewhost <dir> <component>");
        std::process::exit(2);
    };

    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let config_path = std::env::var("VIEWHOST_CONFIG").ok().map(PathBuf::from);
    let config = HostConfig::load(config_path).unwrap_or_else(|err| {
        eprintln!("Failed to load host configuration: {err}. Using defaults.");
        HostConfig::default()
    });

    let store = open_store(&config);
    let browser = BrowserHost::new(config, Arc::new(FileResolver::new(&root)), store);

    let name = Path::new(&source)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.clone());
    let component = ViewModule::builder(name).main_source(source).build();

    let host = ComponentHost::new(browser, ModuleRegistry::new()).unwrap_or_else(|err| {
        eprintln!("Failed to start script host: {err}");
        std::process::exit(1);
    });
    if let Err(err) = host.load_component(MAIN_FRAME, component) {
        eprintln!("Failed to load component: {err}");
        std::process::exit(1);
    }

    let ready = host.wait_until_ready(MAIN_FRAME, READY_TIMEOUT);
    let ui = host.browser().ui_queue();
    if let Err(err) = ui.run_pending() {
        eprintln!("{err}");
        if let Some(exception) = err.exception() {
            eprintln!("{}", exception.stack_trace());
        }
    }
    if !ready {
        eprintln!("Component did not become ready within {}s", READY_TIMEOUT.as_secs());
        host.dispose();
        std::process::exit(1);
    }

    match host.markup(MAIN_FRAME) {
        Ok(Some(markup)) => println!("{markup}"),
        Ok(None) => {}
        Err(err) => eprintln!("Failed to read markup: {err}"),
    }
    host.dispose();
}
