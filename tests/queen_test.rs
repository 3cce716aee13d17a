
use nix::sys::signal::{kill, Signal};
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use test_utils::{init_logger, random_string};
use zerg_hive::{DronePool, ExceptionKind, PoolConfig, PoolError};

/// 由 before hook 在子进程中设置
static OFFSET: AtomicI32 = AtomicI32::new(0);

fn slow_echo(job: i32) -> Result<i32, String> {
    thread::sleep(Duration::from_secs(1));
    Ok(job)
}

fn sum(results: Vec<zerg_hive::TaskResult<i32>>) -> i32 {
    results.into_iter().map(|r| r.unwrap()).sum()
}

#[test]
fn test_pool_with_two_workers() {
    init_logger();
    let mut pool = DronePool::create(2).unwrap();
    pool.run(slow_echo).unwrap();
    assert_eq!(pool.workers_count(), 2);
    assert_eq!(pool.idle_count(), 2);

    let start = Instant::now();
    for task in 1..=5 {
        pool.dispatch(task, Duration::from_secs(2)).unwrap();
    }
    pool.wait().unwrap();
    let results = pool.pull_workers_output().unwrap();
    let elapsed = start.elapsed();

    // 5 个 1 秒任务、2 只工蜂: 三轮
    assert!(elapsed >= Duration::from_millis(2900), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3900), "{:?}", elapsed);
    assert_eq!(results.len(), 5);
    assert_eq!(sum(results), 15);

    pool.destroy();
    assert!(pool.pids().is_empty());
}

#[test]
fn test_results_of_workers_pool() {
    init_logger();
    let mut pool = DronePool::create(5).unwrap();
    pool.run(slow_echo).unwrap();

    for task in 1..=9 {
        pool.dispatch(task, Duration::from_secs(2)).unwrap();
    }
    // 让第一批的最后一只工蜂也完成
    thread::sleep(Duration::from_millis(200));

    assert_eq!(sum(pool.pull_workers_output().unwrap()), 15);
    assert!(pool.has_worker_in_process().unwrap());
    pool.wait().unwrap();
    assert_eq!(sum(pool.pull_workers_output().unwrap()), 30);
    assert_eq!(pool.busy_count(), 0);
    pool.destroy();
}

#[test]
fn test_pool_common_before_hook() {
    init_logger();
    let mut pool = DronePool::create(5)
        .unwrap()
        .before_hook(|| {
            OFFSET.store(1, Ordering::SeqCst);
            Ok(())
        });
    pool.run(|job: i32| {
        thread::sleep(Duration::from_secs(1));
        Ok::<_, String>(job + OFFSET.load(Ordering::SeqCst))
    })
    .unwrap();

    for task in 1..=9 {
        pool.dispatch(task, Duration::from_secs(2)).unwrap();
    }
    thread::sleep(Duration::from_millis(200));

    assert_eq!(sum(pool.pull_workers_output().unwrap()), 20);
    pool.wait().unwrap();
    assert_eq!(sum(pool.pull_workers_output().unwrap()), 34);
    // hook 只在子进程中运行
    assert_eq!(OFFSET.load(Ordering::SeqCst), 0);
    pool.destroy();
}

#[test]
fn test_pool_large_messages() {
    init_logger();
    let mut pool = DronePool::create(2).unwrap();
    pool.run(|job: String| Ok::<_, String>(job)).unwrap();

    let mut tasks = vec![random_string(10_000), random_string(20_000), random_string(30_000)];
    for task in &tasks {
        pool.dispatch(task.clone(), Duration::from_secs(4)).unwrap();
    }
    pool.wait().unwrap();

    let mut results: Vec<String> = pool
        .pull_workers_output()
        .unwrap()
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    results.sort();
    tasks.sort();
    assert_eq!(results, tasks);
    pool.destroy();
}

#[test]
fn test_dispatch_timeout() {
    init_logger();
    let mut pool = DronePool::create(1).unwrap();
    pool.run(slow_echo).unwrap();

    pool.dispatch(1, Duration::ZERO).unwrap();
    assert!(!pool.has_available_worker().unwrap());
    let err = pool.dispatch(2, Duration::from_millis(100)).unwrap_err();
    assert!(matches!(err, PoolError::DispatchTimeout(_)));

    pool.wait().unwrap();
    assert_eq!(pool.pull_workers_output().unwrap(), vec![Ok(1)]);
    pool.destroy();
}

#[test]
fn test_all_workers_killed() {
    init_logger();
    let mut pool = DronePool::create(3).unwrap();
    pool.run(slow_echo).unwrap();
    assert!(pool.has_available_worker().unwrap());

    for pid in pool.pids() {
        kill(pid, Signal::SIGKILL).unwrap();
    }

    let mut outcome = Ok(true);
    for _ in 0..100 {
        outcome = pool.has_available_worker();
        if outcome.is_err() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(matches!(outcome, Err(PoolError::AllWorkersKilled)));
    assert!(matches!(
        pool.dispatch(1, Duration::from_millis(100)),
        Err(PoolError::AllWorkersKilled)
    ));
    pool.destroy();
}

#[test]
fn test_busy_worker_lost() {
    init_logger();
    let mut pool = DronePool::create(1).unwrap();
    pool.run(slow_echo).unwrap();
    pool.dispatch(7, Duration::ZERO).unwrap();

    let pid = pool.pids()[0];
    kill(pid, Signal::SIGKILL).unwrap();
    pool.wait().unwrap();

    let results = pool.pull_workers_output().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap_err().kind, ExceptionKind::WorkerLost);
    pool.destroy();
}

#[test]
fn test_pool_task_timeout() {
    init_logger();
    let mut config = PoolConfig::with_workers(1);
    config.drone.timeout_secs = 1;
    let mut pool = DronePool::with_config(config).unwrap();
    pool.run(|job: u64| {
        thread::sleep(Duration::from_secs(job));
        Ok::<_, String>(job)
    })
    .unwrap();

    pool.dispatch(0, Duration::ZERO).unwrap();
    pool.dispatch(3, Duration::ZERO).unwrap();
    pool.wait().unwrap();

    let results = pool.pull_workers_output().unwrap();
    assert_eq!(results[0], Ok(0));
    assert!(results[1].as_ref().unwrap_err().is_timeout());

    thread::sleep(Duration::from_millis(100));
    assert!(matches!(
        pool.has_available_worker(),
        Err(PoolError::AllWorkersKilled)
    ));
    pool.destroy();
}

#[test]
fn test_pool_already_created() {
    init_logger();
    let mut pool = DronePool::<i32, i32>::create(1).unwrap();
    pool.run(|job: i32| Ok::<_, String>(job)).unwrap();
    assert!(matches!(
        pool.run(|job: i32| Ok::<_, String>(job)),
        Err(PoolError::PoolAlreadyCreated)
    ));
    pool.destroy();
}

#[test]
fn test_invalid_pool_config() {
    assert!(matches!(
        DronePool::<i32, i32>::create(0),
        Err(PoolError::InvalidConfiguration(_))
    ));
}
