// Multi-threaded submission tests for `EventSequencer`.
//
// Producer threads receive shuffled slices of the id space and submit them
// concurrently. With submissions held to windows smaller than the buffer,
// every event must come out exactly once and in ascending order. Without
// that restriction the buffer overflows, and the only guarantee left is
// that nothing is delivered twice.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use healing_stats_sequencer::{EventSequencer, SequencedEvent};
use rand::seq::SliceRandom;

const THREADS: usize = 4;

fn recording_sequencer() -> (Arc<EventSequencer<u64>>, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sequencer = EventSequencer::new(move |event: SequencedEvent<u64>| {
        sink.lock().unwrap().push(event.payload);
    });
    (Arc::new(sequencer), seen)
}

#[test]
fn windowed_permutation_is_delivered_in_order() {
    const BLOCK: u64 = 64;
    const BLOCKS: u64 = 60;
    let last = 1 + BLOCK * BLOCKS;

    let (sequencer, seen) = recording_sequencer();
    sequencer.submit(1, 1);

    // per_thread[t][b] = ids thread `t` submits for block `b`.
    let mut rng = rand::rng();
    let mut per_thread = vec![Vec::new(); THREADS];
    for block in 0..BLOCKS {
        let start = 2 + block * BLOCK;
        let mut ids: Vec<u64> = (start..start + BLOCK).collect();
        ids.shuffle(&mut rng);
        for (t, chunk) in ids.chunks(BLOCK as usize / THREADS).enumerate() {
            per_thread[t].push(chunk.to_vec());
        }
    }

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = per_thread
        .into_iter()
        .map(|blocks| {
            let sequencer = sequencer.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                for block in blocks {
                    for id in block {
                        sequencer.submit(id, id);
                    }
                    barrier.wait();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (1..=last).collect::<Vec<_>>());
    assert!(sequencer.queue_is_empty());
    assert_eq!(sequencer.highest_delivered(), Some(last));
}

#[test]
fn unbounded_shuffle_never_delivers_twice() {
    const TOTAL: u64 = 20_000;

    let (sequencer, seen) = recording_sequencer();
    let mut ids: Vec<u64> = (1..=TOTAL).collect();
    ids.shuffle(&mut rand::rng());

    let handles: Vec<_> = ids
        .chunks(ids.len() / THREADS)
        .map(|chunk| {
            let chunk = chunk.to_vec();
            let sequencer = sequencer.clone();
            thread::spawn(move || {
                for id in chunk {
                    sequencer.submit(id, id);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut seen = seen.lock().unwrap().clone();
    let delivered = seen.len();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), delivered, "an event was delivered twice");
    assert!(seen.iter().all(|id| (1..=TOTAL).contains(id)));
    // Overflow deliveries never advance the sequence, so some of the
    // buffered tail may still be waiting.
    if delivered < TOTAL as usize {
        assert!(!sequencer.queue_is_empty());
    }
}

#[test]
fn unordered_events_bypass_buffering_from_any_thread() {
    let (sequencer, seen) = recording_sequencer();
    sequencer.submit(1, 1);
    sequencer.submit(3, 3);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let sequencer = sequencer.clone();
            thread::spawn(move || sequencer.submit(0, 0))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*seen.lock().unwrap(), vec![1, 0, 0, 0, 0]);
    assert!(!sequencer.queue_is_empty());
}
