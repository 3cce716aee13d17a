//! Basic example of zerg_hive usage

use log::info;
use std::thread;
use std::time::Duration;
use zerg_hive::{DronePool, PoolConfig, ZergRush};

fn main() -> zerg_hive::Result<()> {
    env_logger::init();

    // One drone per task, at most 2 at a time
    let results = ZergRush::add((1..=4u64).map(|i| {
        move || {
            thread::sleep(Duration::from_millis(100 * i));
            Ok::<_, String>(i * i)
        }
    }))
    .run_with_process_limitation(2, Duration::from_millis(1), Duration::ZERO)?;
    info!("rush results: {:?}", results);

    // A pool of long-lived drones
    let config = PoolConfig::with_workers(4).with_env_overrides()?;
    let mut pool = DronePool::with_config(config)?;
    pool.run(|text: String| Ok::<_, String>(text.to_uppercase()))?;

    for word in ["drone", "queen", "hive", "zerg", "swarm"] {
        pool.dispatch(word.to_string(), Duration::from_secs(1))?;
    }
    pool.wait()?;
    for output in pool.pull_workers_output()? {
        match output {
            Ok(text) => println!("{}", text),
            Err(exc) => eprintln!("task failed: {}", exc),
        }
    }
    pool.destroy();
    Ok(())
}
