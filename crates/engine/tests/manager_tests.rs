//! Manager integration tests: rotation, walks, loading and retention.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::TempDir;
use tidemark_core::{Error, IndexConfig, Key, ManualClock, HALFDAY};
use tidemark_engine::{file_name, Manager};
use tidemark_storage::Range;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Persist a one-key range starting at `start_millis` with fingerprint 42.
fn write_range(dir: &Path, start_millis: i64, key: u64) -> Arc<Range> {
    let range = Range::new(start_millis);
    range
        .add(Key::from_u64(key), &[42, key as u32], start_millis / 1000)
        .unwrap();
    range.save(&dir.join(file_name(start_millis)), false).unwrap();
    Arc::new(range)
}

fn config(switch_limit: u64) -> IndexConfig {
    IndexConfig {
        switch_limit,
        ..IndexConfig::default()
    }
}

#[test]
fn test_rotation_on_switch_limit() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::from_millis(1_000));
    let manager = Manager::builder()
        .dir(dir.path())
        .config(config(10))
        .clock(clock.clone())
        .open()
        .unwrap();

    let saver = manager.saver().unwrap();
    assert_eq!(saver.range().start(), 1_000);
    let handles: Vec<_> = (0..10u64)
        .map(|i| saver.add_async(Key::from_u64(i), vec![i as u32 + 1]))
        .collect();
    for h in handles {
        h.wait().unwrap();
    }
    assert_eq!(manager.last(), Some(1_000));

    clock.advance_millis(5_000);
    let next = manager.saver().unwrap();
    assert!(!Arc::ptr_eq(&saver, &next));
    assert!(saver.is_closed());
    assert_eq!(next.range().start(), 6_000);

    next.add(Key::from_u64(100), vec![7]).unwrap();
    assert_eq!(manager.last(), Some(6_000));
    assert_eq!(manager.file_count(), 2);

    let sealed = manager.load(1_000).unwrap().unwrap();
    assert_eq!(sealed.len(), 10);

    // Below the limit the same aggregator is returned.
    let again = manager.saver().unwrap();
    assert!(Arc::ptr_eq(&next, &again));
}

#[test]
fn test_rotation_on_exhausted_window() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::from_millis(1_000));
    let manager = Manager::builder()
        .dir(dir.path())
        .config(config(1_000))
        .clock(clock.clone())
        .open()
        .unwrap();

    let first = manager.saver().unwrap();
    first.add(Key::from_u64(1), vec![1]).unwrap();

    clock.advance_millis(HALFDAY * 1000);
    let second = manager.saver().unwrap();
    assert!(second.range().base_time() > first.range().base_time());
    assert_eq!(second.range().start(), 1_000 + HALFDAY * 1000);
}

#[test]
fn test_rotation_without_clock_movement_still_advances_start() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::from_millis(1_000));
    let manager = Manager::builder()
        .dir(dir.path())
        .config(config(1))
        .clock(clock)
        .open()
        .unwrap();

    manager.saver().unwrap().add(Key::from_u64(1), vec![1]).unwrap();
    let next = manager.saver().unwrap();
    assert_eq!(next.range().start(), 1_001);
    next.add(Key::from_u64(2), vec![2]).unwrap();
    assert_eq!(manager.last(), Some(1_001));
}

#[test]
fn test_stale_saver_after_seal_reports_range_full() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::builder()
        .dir(dir.path())
        .config(config(2))
        .clock(Arc::new(ManualClock::from_millis(1_000)))
        .open()
        .unwrap();

    let stale = manager.saver().unwrap();
    stale.add(Key::from_u64(1), vec![1]).unwrap();
    stale.add(Key::from_u64(2), vec![2]).unwrap();
    assert!(stale.range().is_sealed());

    // The worker keeps running and answers every late add with RangeFull.
    assert!(matches!(stale.add(Key::from_u64(3), vec![3]), Err(Error::RangeFull)));
    assert!(!stale.is_closed());
    assert!(matches!(stale.add(Key::from_u64(4), vec![4]), Err(Error::RangeFull)));

    let next = manager.saver().unwrap();
    assert!(!Arc::ptr_eq(&stale, &next));
    assert_eq!(next.range().start(), 1_001);
    next.add(Key::from_u64(3), vec![3]).unwrap();
    assert_eq!(manager.load(1_000).unwrap().unwrap().len(), 2);
    assert_eq!(manager.last(), Some(1_001));
}

#[test]
fn test_open_rotates_away_from_sealed_file() {
    let dir = TempDir::new().unwrap();
    let sealed = Range::new(1_000);
    sealed.add(Key::from_u64(1), &[42], 1).unwrap();
    sealed.save(&dir.path().join(file_name(1_000)), true).unwrap();

    let manager = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(1_500)))
        .open()
        .unwrap();
    let saver = manager.saver().unwrap();
    assert_eq!(saver.range().start(), 1_500);
    saver.add(Key::from_u64(2), vec![42]).unwrap();

    assert_eq!(manager.file_count(), 2);
    assert_eq!(manager.load(1_000).unwrap().unwrap().len(), 1);
}

#[test]
fn test_walk_desc_visits_hot_range_first() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    write_range(dir.path(), 1_000, 1);
    write_range(dir.path(), 2_000, 2);

    let hot = Arc::new(Range::new(3_000));
    hot.add(Key::from_u64(3), &[42], 3).unwrap();
    let hook_range = Arc::clone(&hot);

    let manager = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(2_500)))
        .on_missing(move |_| Ok(Some(Arc::clone(&hook_range))))
        .open()
        .unwrap();

    let mut seen = Vec::new();
    let result = manager.walk_desc(5_000, |r| {
        seen.push(r.start());
        true
    });
    assert!(matches!(result, Err(Error::EndOfStream)));
    assert_eq!(seen, vec![3_000, 2_000, 1_000]);

    seen.clear();
    let result = manager.walk_desc(5_000, |r| {
        seen.push(r.start());
        r.start() > 2_000
    });
    assert!(result.is_ok());
    assert_eq!(seen, vec![3_000, 2_000]);
}

#[test]
fn test_walk_desc_ignores_hook_when_files_are_newer() {
    let dir = TempDir::new().unwrap();
    write_range(dir.path(), 1_000, 1);
    write_range(dir.path(), 2_000, 2);

    let calls = Arc::new(AtomicUsize::new(0));
    let hook_calls = Arc::clone(&calls);
    let manager = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(2_500)))
        .on_missing(move |_| {
            hook_calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .open()
        .unwrap();

    let mut seen = Vec::new();
    let _ = manager.walk_desc(1_500, |r| {
        seen.push(r.start());
        true
    });
    assert_eq!(seen, vec![1_000]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Before the earliest file: nothing to visit and no hook call.
    seen.clear();
    let result = manager.walk_desc(500, |r| {
        seen.push(r.start());
        true
    });
    assert!(matches!(result, Err(Error::EndOfStream)));
    assert!(seen.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    seen.clear();
    let _ = manager.walk_desc(9_000, |r| {
        seen.push(r.start());
        true
    });
    assert_eq!(seen, vec![2_000, 1_000]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_walk_asc() {
    let dir = TempDir::new().unwrap();
    for start in [1_000, 2_000, 3_000] {
        write_range(dir.path(), start, start as u64);
    }
    let manager = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(3_500)))
        .open()
        .unwrap();

    let collect_from = |start: i64| {
        let mut seen = Vec::new();
        let result = manager.walk_asc(start, |r| {
            seen.push(r.start());
            true
        });
        assert!(matches!(result, Err(Error::EndOfStream)));
        seen
    };
    assert_eq!(collect_from(0), vec![1_000, 2_000, 3_000]);
    assert_eq!(collect_from(1_000), vec![1_000, 2_000, 3_000]);
    assert_eq!(collect_from(1_001), vec![2_000, 3_000]);
    assert!(collect_from(3_001).is_empty());

    let mut seen = Vec::new();
    manager
        .walk_asc(0, |r| {
            seen.push(r.start());
            false
        })
        .unwrap();
    assert_eq!(seen, vec![1_000]);
}

#[test]
fn test_collect_dedups_across_ranges() {
    let dir = TempDir::new().unwrap();
    write_range(dir.path(), 1_000, 1);
    write_range(dir.path(), 2_000, 2);
    // Same key again in a newer range.
    let r = Range::new(3_000);
    r.add(Key::from_u64(2), &[42], 3).unwrap();
    r.add(Key::from_u64(3), &[42, 43], 3).unwrap();
    r.save(&dir.path().join(file_name(3_000)), false).unwrap();

    let manager = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(4_000)))
        .open()
        .unwrap();

    let mut dedup = HashSet::new();
    let (results, metrics) = manager.collect(&[42, 43], 10, &mut dedup).unwrap();
    let keys: Vec<u64> = results.iter().map(|k| k.key.low()).collect();
    assert_eq!(keys.len(), 3);
    assert_eq!(keys[0..2].iter().copied().collect::<HashSet<_>>(), HashSet::from([2, 3]));
    assert_eq!(keys[2], 1);
    assert_eq!(metrics.len(), 3);
    let top = results.iter().find(|k| k.key.low() == 3).unwrap();
    assert_eq!(top.score, 2);

    let mut dedup = HashSet::new();
    let (results, metrics) = manager.collect(&[42], 1, &mut dedup).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(metrics.len(), 1);

    let (more, _) = manager.collect(&[42], 10, &mut dedup).unwrap();
    assert_eq!(more.len(), 2);
    assert!(more.iter().all(|k| k.key != results[0].key));

    assert!(manager.collect(&[42], 0, &mut HashSet::new()).unwrap().0.is_empty());
}

#[test]
fn test_concurrent_loads_read_disk_once() {
    let dir = TempDir::new().unwrap();
    write_range(dir.path(), 1_000, 1);
    write_range(dir.path(), 2_000, 2);

    let loads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&loads);
    let manager = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(2_500)))
        .on_loaded(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .open()
        .unwrap();

    let barrier = Barrier::new(16);
    let ranges: Vec<Arc<Range>> = thread::scope(|s| {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    manager.load(1_000).unwrap().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(ranges.iter().all(|r| Arc::ptr_eq(r, &ranges[0])));
    assert_eq!(ranges[0].len(), 1);
}

#[test]
fn test_load_serves_current_from_snapshot() {
    let dir = TempDir::new().unwrap();
    write_range(dir.path(), 1_000, 1);

    let loads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&loads);
    let manager = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(1_500)))
        .on_loaded(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .open()
        .unwrap();

    let current = manager.load(1_000).unwrap().unwrap();
    assert!(Arc::ptr_eq(&current, &manager.current_snapshot()));
    assert_eq!(loads.load(Ordering::SeqCst), 0);
    assert_eq!(manager.cache_stats().0, 0);

    assert!(manager.load(999).unwrap().is_none());
}

#[test]
fn test_cache_weight_stays_under_cap() {
    let dir = TempDir::new().unwrap();
    let weights: Vec<u64> = (1..=6i64)
        .map(|i| write_range(dir.path(), i * 1_000, i as u64).rough_size_bytes())
        .collect();
    let cap = weights[0] * 2;
    let manager = Manager::builder()
        .dir(dir.path())
        .config(IndexConfig {
            cache_max_bytes: cap,
            ..IndexConfig::default()
        })
        .clock(Arc::new(ManualClock::from_millis(6_500)))
        .open()
        .unwrap();

    for i in 1..=5 {
        manager.load(i * 1_000).unwrap().unwrap();
        let (_, w) = manager.cache_stats();
        assert!(w <= cap);
    }
    assert!(manager.cache_stats().0 >= 1);
}

#[test]
fn test_failed_save_does_not_rotate() {
    let dir = TempDir::new().unwrap();
    let saved = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let (s, f) = (Arc::clone(&saved), Arc::clone(&failed));
    let manager = Manager::builder()
        .dir(dir.path())
        .config(config(10))
        .clock(Arc::new(ManualClock::from_millis(1_000)))
        .on_saved(move |_, _, err, _| {
            if err.is_some() {
                f.fetch_add(1, Ordering::SeqCst);
            } else {
                s.fetch_add(1, Ordering::SeqCst);
            }
        })
        .open()
        .unwrap();

    // A directory at the range path makes the rename fail.
    let blocker = manager.path_for(1_000);
    fs::create_dir(&blocker).unwrap();
    fs::write(blocker.join("x"), b"x").unwrap();

    let saver = manager.saver().unwrap();
    let handles: Vec<_> = (0..3u64)
        .map(|i| saver.add_async(Key::from_u64(i), vec![1]))
        .collect();
    for h in handles {
        assert!(matches!(h.wait(), Err(Error::Io(_))));
    }
    assert!(failed.load(Ordering::SeqCst) >= 1);
    assert_eq!(manager.current_snapshot().len(), 0);
    assert_eq!(manager.last(), None);

    fs::remove_dir_all(&blocker).unwrap();
    let again = manager.saver().unwrap();
    assert!(Arc::ptr_eq(&saver, &again));
    again.add(Key::from_u64(9), vec![1]).unwrap();
    assert_eq!(manager.current_snapshot().len(), 4);
    assert_eq!(manager.last(), Some(1_000));
    assert_eq!(saved.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reload_rejects_invalid_names() {
    let dir = TempDir::new().unwrap();
    write_range(dir.path(), 1_000, 1);
    fs::write(dir.path().join("notes.txt"), b"hi").unwrap();

    let err = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(1_500)))
        .open()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidFilename(ref n) if n == "notes.txt"));
}

#[test]
fn test_reload_skips_temp_and_config_files() {
    let dir = TempDir::new().unwrap();
    write_range(dir.path(), 1_000, 1);
    fs::write(dir.path().join("00000000000007d0.3.tmp"), b"partial").unwrap();
    fs::write(dir.path().join("tidemark.toml"), "switch_limit = 5\n").unwrap();

    let manager = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(1_500)))
        .open()
        .unwrap();
    assert_eq!(manager.file_count(), 1);
    assert_eq!(manager.config().switch_limit, 5);
}

#[test]
fn test_dir_max_files_prunes_oldest() {
    let dir = TempDir::new().unwrap();
    for start in [1_000, 2_000, 3_000] {
        write_range(dir.path(), start, start as u64);
    }
    let manager = Manager::builder()
        .dir(dir.path())
        .config(IndexConfig {
            dir_max_files: 2,
            ..IndexConfig::default()
        })
        .clock(Arc::new(ManualClock::from_millis(3_500)))
        .open()
        .unwrap();

    assert_eq!(manager.file_count(), 2);
    assert!(!dir.path().join(file_name(1_000)).exists());
    assert!(manager.load(1_000).unwrap().is_none());
    assert_eq!(manager.last(), Some(3_000));
}

#[test]
fn test_open_resumes_latest_file() {
    let dir = TempDir::new().unwrap();
    write_range(dir.path(), 1_000, 1);
    write_range(dir.path(), 2_000, 2);

    let manager = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(2_500)))
        .open()
        .unwrap();
    let saver = manager.saver().unwrap();
    assert_eq!(saver.range().start(), 2_000);
    assert_eq!(saver.range().len(), 1);

    saver.add(Key::from_u64(7), vec![42]).unwrap();
    drop(saver);
    drop(manager);

    let reopened = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(2_600)))
        .open()
        .unwrap();
    assert_eq!(reopened.current_snapshot().len(), 2);
}

#[test]
fn test_close_stops_saver() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(1_000)))
        .open()
        .unwrap();
    let saver = manager.saver().unwrap();
    manager.close();
    manager.close();
    assert!(matches!(manager.saver(), Err(Error::Closed)));
    assert!(matches!(saver.add(Key::from_u64(1), vec![1]), Err(Error::Closed)));
}

#[test]
fn test_display_summary() {
    let dir = TempDir::new().unwrap();
    write_range(dir.path(), 1_000, 1);
    let manager = Manager::builder()
        .dir(dir.path())
        .clock(Arc::new(ManualClock::from_millis(1_500)))
        .open()
        .unwrap();
    let s = manager.to_string();
    assert!(s.starts_with("files: 1, saver: 0.0, cache: 0("));
}
