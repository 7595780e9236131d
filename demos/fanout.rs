use std::process::exit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use workpool::{Pool, PoolScheduler, Result, Settings, TaskScheduler};

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .target(env_logger::Target::Stderr)
        .init();

    if let Err(e) = run() {
        error!("{}", e);
        exit(1);
    }
}

fn run() -> Result<()> {
    let settings = Settings::builder()
        .num_threads(2)
        .name("demo")
        .panic_handler(|_| error!("a job panicked"))
        .build()?;
    let pool = Pool::new(settings);

    info!("fanning out 64 jobs across {} workers", pool.num_threads());
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..64 {
        let counter = Arc::clone(&counter);
        pool.submit(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(5));
        });
    }

    let scheduler = PoolScheduler::new(pool.clone());
    info!(
        "queueing ordered tasks (max concurrency {})",
        scheduler.max_concurrency()
    );
    for i in 0..8 {
        scheduler.queue(move || info!("scheduler task {} running", i));
    }

    pool.close();
    if !pool.wait_for_exit(Some(Duration::from_secs(10))) {
        error!("workers did not exit in time");
        exit(1);
    }
    info!("executed {} pool jobs", counter.load(Ordering::Relaxed));

    Ok(())
}
