//! Delays and the advance of model time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use synchronix::data::Token;
use synchronix::director::{DeadlockInfo, Director, DirectorInit, Termination};
use synchronix::time::MonotonicTime;

#[test]
fn delays_order_rendezvous() {
    let t0 = MonotonicTime::EPOCH;
    let director = Director::new();
    let channel = director.channel("c");
    let receive_time = Arc::new(Mutex::new(None));

    let (rx, slot) = (channel.clone(), receive_time.clone());
    director.spawn("B", move |cx| {
        cx.delay(Duration::from_secs(1))?;
        assert_eq!(cx.time(), t0 + Duration::from_secs(1));
        assert_eq!(rx.get(cx)?, Token::Int(3));
        *slot.lock().unwrap() = Some(cx.time());

        Ok(())
    });
    director.spawn("A", move |cx| {
        cx.delay(Duration::from_secs(2))?;
        channel.put(cx, Token::Int(3))
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert_eq!(
        *receive_time.lock().unwrap(),
        Some(t0 + Duration::from_secs(2))
    );
    assert_eq!(director.time(), t0 + Duration::from_secs(2));
}

#[test]
fn simultaneous_delays_resume_together() {
    let director = Director::new();
    let channel = director.channel("c");

    let rx = channel.clone();
    director.spawn("consumer", move |cx| {
        cx.delay(Duration::from_millis(500))?;
        rx.get(cx).map(drop)
    });
    director.spawn("producer", move |cx| {
        cx.delay(Duration::from_millis(500))?;
        channel.put(cx, Token::Boolean(false))
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert_eq!(
        director.time(),
        MonotonicTime::EPOCH + Duration::from_millis(500)
    );
}

#[test]
fn zero_delay_returns_immediately() {
    let director = Director::new();

    director.spawn("P", |cx| {
        cx.delay(Duration::ZERO)?;
        assert_eq!(cx.time(), MonotonicTime::EPOCH);

        Ok(())
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
}

#[test]
fn wait_for_deadlock_resumes_once_others_are_stuck() {
    let director = Director::new();
    let channel = director.channel("c");
    let received = Arc::new(Mutex::new(Vec::new()));
    let seen_by_watcher = Arc::new(Mutex::new(None));

    let (rx, sink) = (channel.clone(), received.clone());
    director.spawn("consumer", move |cx| loop {
        let token = rx.get(cx)?;
        sink.lock().unwrap().push(token);
    });
    director.spawn("producer", move |cx| {
        for i in 0..3 {
            channel.put(cx, Token::Int(i))?;
        }

        Ok(())
    });
    let (log, slot) = (received.clone(), seen_by_watcher.clone());
    director.spawn("watcher", move |cx| {
        cx.wait_for_deadlock()?;
        *slot.lock().unwrap() = Some((cx.time(), log.lock().unwrap().len()));

        Ok(())
    });

    assert_eq!(
        director.run().unwrap(),
        Termination::Deadlock(vec![DeadlockInfo {
            process: "consumer".into(),
            channel: Some("c".into()),
        }])
    );
    assert_eq!(
        *seen_by_watcher.lock().unwrap(),
        Some((MonotonicTime::EPOCH, 3))
    );
}

#[test]
fn stop_time_bounds_the_run() {
    let stop_time = MonotonicTime::EPOCH + Duration::from_secs(5);
    let director = DirectorInit::new().stop_time(stop_time).init();
    let ticks = Arc::new(AtomicUsize::new(0));

    let counter = ticks.clone();
    director.spawn("ticker", move |cx| loop {
        cx.delay(Duration::from_secs(1))?;
        counter.fetch_add(1, Ordering::Relaxed);
    });

    assert_eq!(
        director.run().unwrap(),
        Termination::StopTimeReached(stop_time)
    );
    assert_eq!(ticks.load(Ordering::Relaxed), 5);
}

#[test]
fn time_restarts_with_each_run() {
    let t0 = MonotonicTime::new(1_000, 0).unwrap();
    let director = DirectorInit::new().start_time(t0).init();

    for _ in 0..2 {
        director.spawn("sleeper", move |cx| {
            assert_eq!(cx.time(), t0);
            cx.delay(Duration::from_secs(10))
        });
        assert_eq!(director.run().unwrap(), Termination::Completed);
        assert_eq!(director.time(), t0 + Duration::from_secs(10));
    }
}
