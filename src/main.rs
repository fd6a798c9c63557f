use log::error;
use tunebar::app_runtime::AppRuntime;

const LOG_LEVEL_ENV: &str = "TUNEBAR_LOG";

fn log_level_from_env() -> log::LevelFilter {
    std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|level| level.trim().parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Debug)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log_level_from_env());
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    if std::env::args().skip(1).any(|arg| arg == "--logout") {
        AppRuntime::logout()?;
        return Ok(());
    }

    let runtime = match AppRuntime::build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Startup failed: {}", err);
            return Err(err.into());
        }
    };
    runtime.run()?;
    Ok(())
}
