use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fetchcache::{CacheRegistry, Config, RefreshErrorHook};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Payload, WorkloadsConfig, process_request};

#[derive(Default)]
struct WorkloadStats {
    durations: DDSketch,
    failures: usize,
    fetches: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let refresh_failures = Arc::new(AtomicUsize::new(0));
    let hook: RefreshErrorHook = {
        let refresh_failures = Arc::clone(&refresh_failures);
        Arc::new(move |_key, _err| {
            refresh_failures.fetch_add(1, Ordering::Relaxed);
        })
    };
    let registry = CacheRegistry::new(config.caches).with_refresh_error_hook(hook);

    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .map(|workload| {
            let cache = registry
                .cache::<Payload>(&workload.cache)
                .with_context(|| format!("invalid workload for cache `{}`", workload.cache))?;
            Ok((cache, Arc::new(workload), Arc::new(AtomicUsize::new(0))))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure caches are not completely cold
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(cache, workload, fetches)| {
            let cache = cache.clone();
            let workload = Arc::clone(workload);
            let fetches = Arc::clone(fetches);
            tokio::spawn(async move { process_request(&cache, &workload, &fetches).await })
        });

        for result in futures::future::join_all(futures).await {
            result.context("warmup task panicked")??;
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    for (_, _, fetches) in &workloads {
        fetches.store(0, Ordering::Relaxed);
    }
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (cache, workload, fetches) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let stats = Arc::new(Mutex::new(WorkloadStats::default()));
            let concurrency = workload.concurrency;
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let cache = cache.clone();
                        let stats = Arc::clone(&stats);
                        let fetches = Arc::clone(&fetches);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let succeeded = process_request(&cache, &workload, &fetches).await.unwrap();

                            transaction.finish();

                            let mut stats = stats.lock().unwrap();
                            stats.durations.add(task_start.elapsed().as_secs_f64());
                            if !succeeded {
                                stats.failures += 1;
                            }

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let mut stats: WorkloadStats = {
                let mut stats = stats.lock().unwrap();
                std::mem::take(&mut stats)
            };
            stats.fetches = fetches.load(Ordering::Relaxed);

            (workload, stats)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (workload, stats) = task.context("workload task panicked")?;
        let WorkloadStats {
            durations,
            failures,
            fetches,
        } = stats;

        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} ({}, concurrency: {}): {ops} operations, {ops_ps:.2} ops/s",
            workload.cache, workload.concurrency
        );
        println!("  upstream fetches: {fetches}; failed operations: {failures}");

        if ops > 0 {
            let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
            let quantile = |q| {
                let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(secs)
            };
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }
    }
    println!();

    for stats in registry.stats() {
        println!(
            "Cache {}: {} of {} entries, {} fetches running",
            stats.namespace, stats.size, stats.max_size, stats.in_flight
        );
    }
    println!(
        "Failed background refreshes: {}",
        refresh_failures.load(Ordering::Relaxed)
    );
    println!("Pruned stale entries: {}", registry.prune());

    Ok(())
}
