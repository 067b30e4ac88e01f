use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use redfleet::health::redis::InfoReply;
use redfleet::health::{classify, PidInfo, Probe, ProtocolOutcome};
use redfleet::sync::{
    ClientRole, ClientRoster, CommandQueue, CommandQueueItem, CommandVerb, RosterSettings,
};
use std::time::{Duration, SystemTime};
use tokio::runtime::Runtime;
use uuid::Uuid;

const INFO: &str = "# Server\r\nredis_version:7.2.4\r\n# Persistence\r\nloading:0\r\n\
rdb_bgsave_in_progress:0\r\naof_rewrite_in_progress:0\r\n# Stats\r\n\
instantaneous_ops_per_sec:120\r\nrejected_connections:0\r\n# Replication\r\n\
role:slave\r\nmaster_link_status:up\r\nconnected_slaves:0\r\n";

fn working_probe() -> Probe {
    Probe {
        pid_file: Some(PidInfo {
            pid: 4242,
            modified: SystemTime::now() - Duration::from_secs(600),
        }),
        process_alive: true,
        protocol: ProtocolOutcome::Reply(InfoReply::parse(INFO)),
        config_hash_matches: Some(true),
        observed_at: SystemTime::now(),
    }
}

/// Classifier throughput for the common outcomes
fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");

    let works = working_probe();
    group.bench_function("works", |b| b.iter(|| black_box(classify(black_box(&works)))));

    let mut hang = working_probe();
    hang.protocol = ProtocolOutcome::TimedOut;
    group.bench_function("hang", |b| b.iter(|| black_box(classify(black_box(&hang)))));

    let mut stopped = working_probe();
    stopped.pid_file = None;
    group.bench_function("stopped", |b| {
        b.iter(|| black_box(classify(black_box(&stopped))))
    });

    group.bench_function("parse_info", |b| b.iter(|| black_box(InfoReply::parse(black_box(INFO)))));

    group.finish();
}

/// In-memory queue push and drain
fn bench_queue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("command_queue");

    for count in [10u32, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("push_drain", count), count, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                let queue = CommandQueue::in_memory();
                for id in 0..count {
                    let item = CommandQueueItem::new(CommandVerb::Start, id, Uuid::nil(), "bench");
                    queue.push(item).await.unwrap();
                }
                black_box(queue.drain().await.unwrap());
            });
        });
    }

    group.finish();
}

/// Fan-out to client outboxes and roster snapshots
fn bench_roster(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("roster");

    for clients in [4usize, 32, 256].iter() {
        let roster = rt.block_on(async {
            let roster = ClientRoster::new(RosterSettings::default());
            let now = SystemTime::now();
            for n in 0..*clients {
                let role = if n % 4 == 0 {
                    ClientRole::Sentinel
                } else {
                    ClientRole::Minion
                };
                roster
                    .register(role, "0.1.0", &format!("node-{}", n), "10.0.0.1", now)
                    .await;
            }
            roster
        });

        let items: Vec<CommandQueueItem> = (1..=8)
            .map(|id| CommandQueueItem::new(CommandVerb::Stop, id, Uuid::nil(), "bench"))
            .collect();

        // Fresh roster per iteration keeps outboxes from growing across samples
        let items = &items;
        let count = *clients;
        group.bench_with_input(BenchmarkId::new("register_fan_out", clients), &count, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                let roster = ClientRoster::new(RosterSettings::default());
                let now = SystemTime::now();
                for n in 0..count {
                    roster
                        .register(ClientRole::Minion, "0.1.0", &format!("node-{}", n), "", now)
                        .await;
                }
                black_box(roster.fan_out(items).await.unwrap());
            });
        });

        group.bench_with_input(BenchmarkId::new("snapshot", clients), &roster, |b, roster| {
            b.to_async(&rt).iter(|| async move {
                black_box(roster.snapshot(SystemTime::now()).await);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_classify, bench_queue, bench_roster);

criterion_main!(benches);
