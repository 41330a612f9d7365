mod app_bootstrap;
mod app_runtime;
mod autosave;
mod backends;
mod config;
mod console_command;
mod enrichment_manager;
mod metadata_resolver;
mod playback_session;
mod playback_surface;
mod playlist;
mod playlist_manager;
mod playlist_store;
mod protocol;
mod search;
mod search_manager;
mod thumbnail_cache;
mod thumbnail_fetcher;
mod track;
mod track_enrichment;
mod ui_manager;
mod worker_pool;

use app_runtime::AppRuntime;

fn main() {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Debug);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let runtime = match AppRuntime::build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    };
    runtime.run();
}
