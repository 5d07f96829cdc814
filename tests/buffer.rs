//! Tests for the bounded exchange buffer.

use ironexchange::testing::{assert_all_released, int_page, page_values, wait_until};
use ironexchange::{AddPage, Delivery, ExchangeBuffer, ExchangeConfig, ExchangeError, PageTracker};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn rows_buffer(rows: usize) -> ExchangeBuffer {
    ExchangeBuffer::new("test", &ExchangeConfig::with_row_capacity(rows)).unwrap()
}

#[test]
fn test_scenario_a_third_page_signals_backpressure() -> anyhow::Result<()> {
    let tracker = PageTracker::new("scenario-a");
    let buffer = rows_buffer(2);

    assert!(buffer.add_page(int_page(&tracker, [1]))?.is_accepted());
    assert!(buffer.add_page(int_page(&tracker, [2]))?.is_accepted());
    let AddPage::Full(third) = buffer.add_page(int_page(&tracker, [3]))? else {
        panic!("third page must be refused while the buffer is full");
    };
    assert!(!buffer.has_space());

    let woken = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&woken);
    buffer.on_space_available(Box::new(move || flag.store(true, Ordering::SeqCst)));
    assert!(!woken.load(Ordering::SeqCst));

    let head = buffer.poll_page()?.expect("head page");
    assert_eq!(page_values(&head), vec![1]);
    assert!(woken.load(Ordering::SeqCst));
    assert!(buffer.add_page(third)?.is_accepted());

    assert_eq!(buffer.outstanding_rows(), 2);
    drop(head);
    buffer.close();
    assert_all_released(&tracker, Duration::from_millis(100));
    Ok(())
}

#[test]
fn test_add_page_blocking_resumes_after_drain() -> anyhow::Result<()> {
    let tracker = PageTracker::new("blocking");
    let buffer = Arc::new(rows_buffer(2));
    buffer.add_page_blocking(int_page(&tracker, [1, 2]))?;

    let producer = {
        let buffer = Arc::clone(&buffer);
        let page = int_page(&tracker, [3]);
        thread::spawn(move || buffer.add_page_blocking(page))
    };
    thread::sleep(Duration::from_millis(20));
    assert_eq!(buffer.size(), 1, "producer must stay suspended while full");

    let first = buffer.poll_page()?.expect("first page");
    producer.join().expect("producer thread")?;
    assert_eq!(page_values(&first), vec![1, 2]);
    assert_eq!(buffer.size(), 1);
    Ok(())
}

#[test]
fn test_add_page_timeout_hands_page_back() -> anyhow::Result<()> {
    let tracker = PageTracker::new("timeout");
    let buffer = rows_buffer(1);
    assert!(buffer.add_page(int_page(&tracker, [1]))?.is_accepted());

    match buffer.add_page_timeout(int_page(&tracker, [2]), Duration::from_millis(10))? {
        AddPage::Full(page) => assert_eq!(page_values(&page), vec![2]),
        AddPage::Accepted => panic!("page accepted beyond capacity"),
    }
    assert_eq!(tracker.live_pages(), 1);
    Ok(())
}

#[test]
fn test_oversized_page_is_rejected() {
    let tracker = PageTracker::new("oversized");
    let buffer = rows_buffer(4);
    let err = buffer.add_page(int_page(&tracker, 0..5)).unwrap_err();
    assert_eq!(err, ExchangeError::PageTooLarge { rows: 5, bytes: 40 });
    assert_eq!(tracker.live_pages(), 0);
}

#[test]
fn test_byte_bound_applies_without_row_bound() -> anyhow::Result<()> {
    let tracker = PageTracker::new("bytes");
    let config = ExchangeConfig::default()
        .with_max_buffer_rows(None)
        .with_max_buffer_bytes(Some(64));
    let buffer = ExchangeBuffer::new("bytes", &config)?;
    assert!(buffer.add_page(int_page(&tracker, 0..8))?.is_accepted());
    assert!(!buffer.add_page(int_page(&tracker, [9]))?.is_accepted());
    assert_eq!(buffer.outstanding_bytes(), 64);
    Ok(())
}

#[test]
fn test_hysteresis_keeps_throttle_until_low_water() -> anyhow::Result<()> {
    let tracker = PageTracker::new("hysteresis");
    let config = ExchangeConfig::with_row_capacity(4).with_low_water_percent(25);
    let buffer = ExchangeBuffer::new("hysteresis", &config)?;
    for v in 0..4 {
        assert!(buffer.add_page(int_page(&tracker, [v]))?.is_accepted());
    }
    assert!(!buffer.add_page(int_page(&tracker, [4]))?.is_accepted());

    // 3 rows left: above the 1-row low-water mark, still throttled
    buffer.poll_page()?;
    assert!(!buffer.has_space());
    assert!(!buffer.add_page(int_page(&tracker, [5]))?.is_accepted());

    buffer.poll_page()?;
    assert!(!buffer.has_space());
    buffer.poll_page()?;
    assert!(buffer.has_space());
    assert_eq!(buffer.stats().backpressure_events, 1);
    Ok(())
}

#[test]
fn test_poll_is_fifo_and_never_blocks() -> anyhow::Result<()> {
    let tracker = PageTracker::new("fifo");
    let buffer = rows_buffer(16);
    assert!(buffer.poll_page()?.is_none());
    for v in 0..5 {
        assert!(buffer.add_page(int_page(&tracker, [v]))?.is_accepted());
    }
    let order: Vec<i64> = std::iter::from_fn(|| buffer.poll_page().ok().flatten())
        .flat_map(|p| page_values(&p))
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[test]
fn test_page_listeners_are_served_in_registration_order() -> anyhow::Result<()> {
    let tracker = PageTracker::new("listeners");
    let buffer = rows_buffer(8);
    let seen = Arc::new(Mutex::new(Vec::new()));
    for id in 0..3 {
        let seen = Arc::clone(&seen);
        buffer.poll_or_listen(Box::new(move |d| match d {
            Delivery::Page { page, .. } => seen.lock().push((id, page_values(&page)[0])),
            other => panic!("listener {id} got {other:?}"),
        }));
    }
    assert_eq!(buffer.pending_listeners(), 3);

    assert!(buffer.add_page(int_page(&tracker, [10]))?.is_accepted());
    assert!(buffer.add_page(int_page(&tracker, [20]))?.is_accepted());
    assert_eq!(*seen.lock(), vec![(0, 10), (1, 20)]);
    assert_eq!(buffer.pending_listeners(), 1);
    assert_eq!(buffer.size(), 0);
    Ok(())
}

#[test]
fn test_finish_wakes_waiters_and_rejects_pages() -> anyhow::Result<()> {
    let tracker = PageTracker::new("finish");
    let buffer = rows_buffer(8);
    let finished = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let finished = Arc::clone(&finished);
        buffer.poll_or_listen(Box::new(move |d| {
            assert!(matches!(d, Delivery::Finished));
            finished.fetch_add(1, Ordering::SeqCst);
        }));
    }
    assert!(buffer.finish());
    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert!(buffer.is_finished());
    assert_eq!(buffer.add_page(int_page(&tracker, [1])).unwrap_err(), ExchangeError::Closed);
    assert_all_released(&tracker, Duration::from_millis(100));
    Ok(())
}

#[test]
fn test_finish_is_idempotent() {
    let buffer = rows_buffer(4);
    let wakeups = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&wakeups);
    buffer.poll_or_listen(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    assert!(buffer.finish());
    assert!(!buffer.finish());
    assert!(!buffer.finish());
    assert_eq!(wakeups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_finished_buffer_drains_before_reporting_finished() -> anyhow::Result<()> {
    let tracker = PageTracker::new("drain");
    let buffer = rows_buffer(8);
    assert!(buffer.add_page(int_page(&tracker, [1]))?.is_accepted());
    assert!(buffer.add_page(int_page(&tracker, [2]))?.is_accepted());
    buffer.finish();
    assert!(!buffer.is_finished());

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let deliveries = Arc::clone(&deliveries);
        buffer.poll_or_listen(Box::new(move |d| {
            let entry = match d {
                Delivery::Page { page, finished } => (page_values(&page), finished),
                Delivery::Finished => (vec![], true),
                Delivery::Failed(e) => panic!("unexpected failure {e}"),
            };
            deliveries.lock().push(entry);
        }));
    }
    assert_eq!(
        *deliveries.lock(),
        vec![(vec![1], false), (vec![2], true), (vec![], true)]
    );
    assert!(buffer.is_finished());
    Ok(())
}

#[test]
fn test_close_releases_pages_once() -> anyhow::Result<()> {
    let tracker = PageTracker::new("close");
    let buffer = rows_buffer(8);
    for v in 0..3 {
        assert!(buffer.add_page(int_page(&tracker, [v]))?.is_accepted());
    }
    assert_eq!(buffer.close(), 3);
    assert_eq!(buffer.close(), 0);
    assert!(buffer.is_closed());
    assert_eq!(tracker.released_pages(), 3);
    assert_eq!(buffer.stats().pages_discarded, 3);
    assert!(buffer.poll_page()?.is_none());
    Ok(())
}

#[test]
fn test_fail_surfaces_error_to_pending_and_future_listeners() -> anyhow::Result<()> {
    let tracker = PageTracker::new("fail");
    let buffer = rows_buffer(8);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let pending = Arc::clone(&errors);
    buffer.poll_or_listen(Box::new(move |d| {
        if let Delivery::Failed(e) = d {
            pending.lock().push(e);
        }
    }));

    assert!(buffer.fail(ExchangeError::producer("boom")));
    assert!(!buffer.fail(ExchangeError::producer("again")));
    assert_eq!(buffer.poll_page().unwrap_err(), ExchangeError::producer("boom"));

    let late = Arc::clone(&errors);
    buffer.poll_or_listen(Box::new(move |d| {
        if let Delivery::Failed(e) = d {
            late.lock().push(e);
        }
    }));
    assert_eq!(errors.lock().len(), 2);
    assert_eq!(buffer.add_page(int_page(&tracker, [1])).unwrap_err(), ExchangeError::Closed);
    assert_eq!(tracker.live_pages(), 0);
    Ok(())
}

#[test]
fn test_wait_for_page_returns_on_finish() -> anyhow::Result<()> {
    let buffer = Arc::new(rows_buffer(4));
    let waiter = {
        let buffer = Arc::clone(&buffer);
        thread::spawn(move || buffer.wait_for_page(Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(10));
    buffer.finish();
    assert!(waiter.join().expect("waiter thread")?.is_none());
    assert!(buffer.is_finished());
    Ok(())
}

#[mark_flaky_tests::flaky]
#[test]
fn test_capacity_never_exceeded_under_concurrency() {
    const CAPACITY: usize = 10;
    let tracker = PageTracker::new("capacity");
    let buffer = Arc::new(rows_buffer(CAPACITY));
    let peak = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let buffer = Arc::clone(&buffer);
            let tracker = Arc::clone(&tracker);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                for i in 0..200_i64 {
                    let rows = usize::try_from(i % 3 + 1).unwrap_or(1);
                    let page = int_page(&tracker, (0..rows as i64).map(|r| p * 1000 + r));
                    buffer.add_page_blocking(page).expect("open buffer");
                    peak.fetch_max(buffer.outstanding_rows(), Ordering::SeqCst);
                }
            })
        })
        .collect();

    let consumer = {
        let buffer = Arc::clone(&buffer);
        thread::spawn(move || {
            let mut rows = 0;
            while let Some(page) = buffer.wait_for_page(Duration::from_secs(5)).expect("no failure") {
                rows += page.row_count();
            }
            rows
        })
    };

    for p in producers {
        p.join().expect("producer");
    }
    buffer.finish();
    let consumed = consumer.join().expect("consumer");

    assert_eq!(consumed, 4 * (200 / 3 * 6 + 1 + 2));
    assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
    assert!(buffer.stats().peak_rows <= CAPACITY as u64);
    assert_all_released(&tracker, Duration::from_secs(1));
}

#[test]
fn test_each_page_released_exactly_once_under_racing_close() {
    for round in 0..20 {
        let tracker = PageTracker::new(format!("race-{round}"));
        let buffer = Arc::new(rows_buffer(64));

        let producer = {
            let buffer = Arc::clone(&buffer);
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for v in 0..100 {
                    match buffer.add_page(int_page(&tracker, [v])) {
                        Ok(AddPage::Accepted) => {}
                        Ok(AddPage::Full(page)) => drop(page),
                        Err(_) => break,
                    }
                }
            })
        };
        let poller = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut polled = 0;
                while !buffer.is_closed() {
                    if let Ok(Some(page)) = buffer.poll_page() {
                        page.release();
                        polled += 1;
                    }
                }
                polled
            })
        };
        thread::sleep(Duration::from_micros(200));
        buffer.close();
        producer.join().expect("producer");
        poller.join().expect("poller");

        assert!(wait_until(Duration::from_secs(1), || tracker.live_pages() == 0));
        assert_eq!(tracker.allocated_pages(), tracker.released_pages());
    }
}
