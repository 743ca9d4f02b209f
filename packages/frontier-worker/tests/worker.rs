//! End-to-end tests: a full worker and scheduler over the in-memory bus and
//! backend, on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use frontier_worker::bus::find_fatal;
use frontier_worker::codec::{Codec, JsonCodec};
use frontier_worker::memory::{MemoryBackend, MemoryBus};
use frontier_worker::{
    BusClients, FrontierMessage, FrontierWorker, JobId, Lifecycle, Request, Response, WorkerConfig,
};

fn config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.incoming.poll_timeout = Duration::from_millis(200);
    config.scoring.poll_timeout = Duration::from_millis(200);
    config.max_next_requests = 16;
    config.outgoing_partitions = 2;
    config
}

fn publish(bus: &MemoryBus, topic: &str, message: FrontierMessage) {
    let payload = JsonCodec::new().encode(&message).unwrap();
    bus.append(topic, 0, Bytes::new(), payload).unwrap();
}

fn seeds(urls: &[&str]) -> FrontierMessage {
    FrontierMessage::AddSeeds {
        seeds: urls.iter().map(|u| Request::new(*u)).collect(),
    }
}

/// Requests published to one outgoing partition.
fn published_on(bus: &MemoryBus, config: &WorkerConfig, partition: u32) -> Vec<Request> {
    let codec = JsonCodec::new();
    bus.messages(&config.outgoing_topic, partition)
        .iter()
        .map(|m| codec.decode_request(&m.payload).unwrap())
        .collect()
}

/// Every request published to the outgoing topic, across partitions.
fn outgoing(bus: &MemoryBus, config: &WorkerConfig) -> Vec<(u32, Request)> {
    (0..config.outgoing_partitions)
        .flat_map(|partition| {
            published_on(bus, config, partition)
                .into_iter()
                .map(move |r| (partition, r))
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_seeds_flow_into_published_batch() {
    let config = config();
    let bus = MemoryBus::new();
    let clients = BusClients::memory(&bus, &config);
    let backend = Arc::new(MemoryBackend::new(config.outgoing_partitions));
    let (worker, stats) = FrontierWorker::new(&config, clients, backend.clone());
    let (scheduler, handle) = worker.into_scheduler(&config);

    publish(
        &bus,
        &config.incoming_topic,
        seeds(&["https://example.com/", "https://example.org/a", "https://example.org/b"]),
    );
    let run = tokio::spawn(scheduler.run());

    // First batch runs at start on an empty frontier, the second one after
    // the batch delay.
    tokio::time::sleep(Duration::from_secs(65)).await;
    handle.drain().await.unwrap();
    run.await.unwrap().unwrap();

    let published = outgoing(&bus, &config);
    assert_eq!(published.len(), 3);
    assert_eq!(backend.queued_len(), 0);
    for (_, request) in &published {
        assert_eq!(request.job_id(), Some(JobId(0)));
    }

    // Same host, same partition.
    let org: Vec<u32> = published
        .iter()
        .filter(|(_, r)| r.url.contains("example.org"))
        .map(|(p, _)| *p)
        .collect();
    assert_eq!(org.len(), 2);
    assert_eq!(org[0], org[1]);

    let stats = stats.borrow().clone();
    assert_eq!(stats.batches_after_start, 2);
    assert_eq!(stats.last_batch_size, Some(3));
    assert!(stats.last_consumption_run.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_job_id_switch_fences_old_results() {
    let config = config();
    let bus = MemoryBus::new();
    let clients = BusClients::memory(&bus, &config);
    let backend = Arc::new(MemoryBackend::new(config.outgoing_partitions));
    let (worker, stats) = FrontierWorker::new(&config, clients, backend.clone());
    let (scheduler, handle) = worker.into_scheduler(&config);

    publish(&bus, &config.scoring_topic, FrontierMessage::NewJobId { job_id: JobId(3) });
    let run = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(stats.borrow().job_id, JobId(3));

    for (url, job) in [("https://old.test/", 0), ("https://new.test/", 3)] {
        publish(
            &bus,
            &config.incoming_topic,
            FrontierMessage::PageCrawled {
                response: Response::new(Request::new(url).with_job_id(JobId(job)), 200),
                links: vec![Request::new(format!("{url}next"))],
            },
        );
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.drain().await.unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(backend.crawled_len(), 1);
    // Only the current generation's link was queued.
    assert_eq!(backend.queued_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_saturated_partitions_are_skipped() {
    let config = config();
    let bus = MemoryBus::new();
    let clients = BusClients::memory(&bus, &config);
    let backend = Arc::new(MemoryBackend::new(config.outgoing_partitions));

    // Partition 0 already holds a full backlog nobody has consumed.
    for _ in 0..config.max_next_requests {
        bus.append(&config.outgoing_topic, 0, Bytes::new(), Bytes::new()).unwrap();
    }
    let urls: Vec<String> = (0..20).map(|i| format!("https://host{i}.test/")).collect();
    let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    publish(&bus, &config.incoming_topic, seeds(&url_refs));

    let (worker, _stats) = FrontierWorker::new(&config, clients, backend.clone());
    let (scheduler, handle) = worker.into_scheduler(&config);
    let run = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_secs(65)).await;
    handle.drain().await.unwrap();
    run.await.unwrap().unwrap();

    // Nothing joined the backlog on partition 0.
    assert_eq!(
        bus.messages(&config.outgoing_topic, 0).len(),
        config.max_next_requests
    );
    let published = published_on(&bus, &config, 1);
    assert!(!published.is_empty());
    assert!(published.iter().all(|r| r.job_id() == Some(JobId(0))));
    // Hosts owned by partition 0 stay queued.
    assert_eq!(backend.queued_len(), 20 - published.len());
}

#[tokio::test(start_paused = true)]
async fn test_drain_reaches_stopped() {
    let config = config();
    let bus = MemoryBus::new();
    let clients = BusClients::memory(&bus, &config);
    let backend = Arc::new(MemoryBackend::new(config.outgoing_partitions));
    let (worker, _stats) = FrontierWorker::new(&config, clients, backend);
    let (scheduler, handle) = worker.into_scheduler(&config);
    let mut status = handle.watch();

    let run = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.drain().await.unwrap();

    status.wait_for(|s| s.lifecycle == Lifecycle::Stopped).await.unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bus_disconnect_stops_worker_with_error() {
    let config = config();
    let bus = MemoryBus::new();
    let clients = BusClients::memory(&bus, &config);
    let backend = Arc::new(MemoryBackend::new(config.outgoing_partitions));
    let (worker, _stats) = FrontierWorker::new(&config, clients, backend);
    let (scheduler, handle) = worker.into_scheduler(&config);

    let run = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_secs(1)).await;
    bus.disconnect();

    let err = run.await.unwrap().unwrap_err();
    assert!(find_fatal(&err).is_some(), "{err:#}");
    assert_eq!(handle.status().lifecycle, Lifecycle::Stopped);
}
