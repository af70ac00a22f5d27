use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use pilgrim_sync::geofence::{containing_waypoint, haversine_m};
use pilgrim_sync::protocol::{Beacon, Location, ServerMessage};
use pilgrim_sync::queue::{Mutation, MutationQueue, QueueConfig};
use pilgrim_sync::storage::MemoryLocalStore;
use pilgrim_sync::store::Waypoint;

fn waypoints(n: usize) -> Vec<Waypoint> {
    (0..n)
        .map(|i| Waypoint {
            id: i as i64,
            group_id: 1,
            name: format!("Waypoint {i}"),
            latitude: 34.96 + i as f64 * 0.001,
            longitude: 135.77,
            radius: 40.0,
            kind: "landmark".to_string(),
        })
        .collect()
}

fn bench_haversine(c: &mut Criterion) {
    c.bench_function("haversine_m", |b| {
        b.iter(|| {
            black_box(haversine_m(
                black_box(34.9671),
                black_box(135.7727),
                black_box(34.9948),
                black_box(135.7850),
            ))
        })
    });
}

fn bench_geofence_scan(c: &mut Criterion) {
    let wps = waypoints(100);
    // Outside every circle, so the scan visits all of them.
    let location = Location::new(35.5, 135.77, 0);

    c.bench_function("geofence_scan_100_waypoints", |b| {
        b.iter(|| black_box(containing_waypoint(black_box(&wps), black_box(&location))))
    });
}

fn bench_queue_push_at_cap(c: &mut Criterion) {
    let store = Arc::new(MemoryLocalStore::new());
    let queue = MutationQueue::open(store, QueueConfig { max_items: 1000, ..QueueConfig::default() });
    for i in 0..1000 {
        queue.push(Mutation::LocationUpdate(Location::new(35.0, 135.0, i)));
    }

    // Every push evicts the oldest item and rewrites the stored queue.
    c.bench_function("queue_push_evicting_1K", |b| {
        b.iter(|| black_box(queue.push(Mutation::BeaconSignal(black_box(Beacon::Moving)))))
    });
}

fn bench_server_message_encode(c: &mut Criterion) {
    let msg = ServerMessage::LocationUpdate {
        user_id: 42,
        location: Location::new(34.9671, 135.7727, 1_700_000_000_000),
    };

    c.bench_function("location_update_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

criterion_group!(
    benches,
    bench_haversine,
    bench_geofence_scan,
    bench_queue_push_at_cap,
    bench_server_message_encode,
);
criterion_main!(benches);
