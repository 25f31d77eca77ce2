//! KvBench - Load generator for a ShardKV node
//!
//! Usage:
//!   kvbench --addr 127.0.0.1:8080 --write-iterations 1000 --concurrency 4
//!
//! Each worker first writes random keys through `/set`, then all workers read
//! random keys from the written set through `/get`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::Rng;

/// ShardKV load generator
#[derive(Parser)]
#[command(name = "kvbench")]
#[command(about = "Benchmark the HTTP API of a ShardKV node", long_about = None)]
struct Cli {
    /// The HTTP host:port of the node that is benchmarked
    #[arg(long, default_value = "localhost:8080")]
    addr: String,

    /// Number of writes per worker
    #[arg(long, default_value_t = 1000)]
    write_iterations: usize,

    /// Number of reads per worker
    #[arg(long, default_value_t = 1000)]
    read_iterations: usize,

    /// Number of workers running in parallel
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
}

/// Timing summary of one worker
struct Report {
    qps: f64,
    keys: Vec<String>,
}

async fn benchmark<F, Fut>(name: &str, iterations: usize, mut op: F) -> anyhow::Result<Report>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<String>>,
{
    let mut max = Duration::ZERO;
    let mut min = Duration::MAX;
    let mut keys = Vec::with_capacity(iterations);

    let start = Instant::now();
    for _ in 0..iterations {
        let iter_start = Instant::now();
        keys.push(op().await?);
        let elapsed = iter_start.elapsed();
        min = min.min(elapsed);
        max = max.max(elapsed);
    }

    let total = start.elapsed();
    let iterations = iterations.max(1);
    let avg = total / iterations as u32;
    let qps = iterations as f64 / total.as_secs_f64().max(f64::EPSILON);
    println!(
        "Func {} took avg {:?}, QPS {:.1}, max {:?}, min {:?}",
        name, avg, qps, max, min
    );

    Ok(Report { qps, keys })
}

async fn write_rand(client: &reqwest::Client, addr: &str) -> anyhow::Result<String> {
    let (key, value) = {
        let mut rng = rand::thread_rng();
        (
            format!("key-{}", rng.gen_range(0..1_000_000)),
            format!("value-{}", rng.gen_range(0..1_000_000)),
        )
    };

    client
        .get(format!("http://{}/set", addr))
        .query(&[("key", &key), ("value", &value)])
        .send()
        .await
        .context("Error during set")?
        .bytes()
        .await?;

    Ok(key)
}

async fn read_rand(
    client: &reqwest::Client,
    addr: &str,
    keys: &[String],
) -> anyhow::Result<String> {
    let key = keys[rand::thread_rng().gen_range(0..keys.len())].clone();

    client
        .get(format!("http://{}/get", addr))
        .query(&[("key", &key)])
        .send()
        .await
        .context("Error during get")?
        .bytes()
        .await?;

    Ok(key)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let concurrency = cli.concurrency.max(1);
    println!("Running with concurrency level {}", concurrency);

    let write_iterations = cli.write_iterations;
    let read_iterations = cli.read_iterations;
    let client = reqwest::Client::new();
    let addr = Arc::new(cli.addr);

    let writers = (0..concurrency).map(|_| {
        let client = client.clone();
        let addr = Arc::clone(&addr);
        tokio::spawn(async move {
            benchmark("write", write_iterations, || write_rand(&client, &addr)).await
        })
    });

    let mut total_qps = 0.0;
    let mut all_keys = Vec::new();
    for report in futures::future::join_all(writers).await {
        let report = report??;
        total_qps += report.qps;
        all_keys.extend(report.keys);
    }
    println!(
        "Total write QPS {:.1}, total set {} keys",
        total_qps,
        all_keys.len()
    );

    if all_keys.is_empty() {
        println!("No keys written, skipping reads");
        return Ok(());
    }

    let all_keys = Arc::new(all_keys);
    let readers = (0..concurrency).map(|_| {
        let client = client.clone();
        let addr = Arc::clone(&addr);
        let keys = Arc::clone(&all_keys);
        tokio::spawn(async move {
            benchmark("read", read_iterations, || read_rand(&client, &addr, &keys)).await
        })
    });

    let mut total_qps = 0.0;
    for report in futures::future::join_all(readers).await {
        total_qps += report??.qps;
    }
    println!("Total read QPS {:.1}", total_qps);

    Ok(())
}
