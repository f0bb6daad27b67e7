//! Plain rendezvous between two processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use synchronix::channel::RendezvousError;
use synchronix::data::{Token, TokenType};
use synchronix::director::{Director, ExecutionError, Termination};

use crate::support::wait_until;

#[test]
fn put_returns_only_once_get_has_begun() {
    let director = Director::new();
    let channel = director.channel("c");
    let get_started = Arc::new(AtomicBool::new(false));
    let received = Arc::new(Mutex::new(None));

    let (tx, flag) = (channel.clone(), get_started.clone());
    director.spawn("A", move |cx| {
        tx.put(cx, Token::Int(5))?;
        assert!(flag.load(Ordering::SeqCst));

        Ok(())
    });

    let (flag, slot) = (get_started.clone(), received.clone());
    director.spawn("B", move |cx| {
        // Give A a chance to park its put first.
        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::SeqCst);
        *slot.lock().unwrap() = Some(channel.get(cx)?);

        Ok(())
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert_eq!(*received.lock().unwrap(), Some(Token::Int(5)));
}

#[test]
fn get_before_put() {
    let director = Director::new();
    let channel = director.channel("c");
    let received = Arc::new(Mutex::new(None));

    let (rx, slot) = (channel.clone(), received.clone());
    director.spawn("consumer", move |cx| {
        *slot.lock().unwrap() = Some(rx.get(cx)?);

        Ok(())
    });
    director.spawn("producer", move |cx| {
        wait_until(|| channel.is_read_blocked());
        channel.put(cx, Token::from("hello"))
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert_eq!(*received.lock().unwrap(), Some(Token::from("hello")));
}

#[test]
fn tokens_are_delivered_exactly_once_and_in_order() {
    const COUNT: i32 = 200;

    let director = Director::new();
    let channel = director.channel("c");
    let received = Arc::new(Mutex::new(Vec::new()));

    let tx = channel.clone();
    director.spawn("producer", move |cx| {
        for i in 0..COUNT {
            tx.put(cx, Token::Int(i))?;
        }

        Ok(())
    });
    let sink = received.clone();
    director.spawn("consumer", move |cx| {
        for _ in 0..COUNT {
            let token = channel.get(cx)?;
            sink.lock().unwrap().push(token);
        }

        Ok(())
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    let expected: Vec<_> = (0..COUNT).map(Token::Int).collect();
    assert_eq!(*received.lock().unwrap(), expected);
}

#[test]
fn second_sender_waits_for_the_first_transfer() {
    let director = Director::new();
    let channel = director.channel("c");
    let received = Arc::new(Mutex::new(Vec::new()));

    for i in 0..2 {
        let tx = channel.clone();
        director.spawn(format!("producer {}", i), move |cx| tx.put(cx, Token::Int(i)));
    }
    let sink = received.clone();
    director.spawn("consumer", move |cx| {
        wait_until(|| channel.is_write_blocked());
        for _ in 0..2 {
            let token = channel.get(cx)?;
            sink.lock().unwrap().push(token);
        }
        assert!(!channel.is_write_blocked());

        Ok(())
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    let mut received = received.lock().unwrap().clone();
    received.sort_by_key(|token| match token {
        Token::Int(v) => *v,
        _ => unreachable!(),
    });
    assert_eq!(received, vec![Token::Int(0), Token::Int(1)]);
}

#[test]
fn put_converts_to_the_declared_type() {
    let director = Director::new();
    let channel = director
        .channel_builder("c")
        .element_type(TokenType::Long)
        .build();
    let received = Arc::new(Mutex::new(None));

    let tx = channel.clone();
    director.spawn("producer", move |cx| tx.put(cx, Token::Int(3)));
    let slot = received.clone();
    director.spawn("consumer", move |cx| {
        *slot.lock().unwrap() = Some(channel.get(cx)?);

        Ok(())
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert_eq!(*received.lock().unwrap(), Some(Token::Long(3)));
}

#[test]
fn channel_of_another_director_is_rejected() {
    let director = Director::new();
    let foreign = Director::new().channel("elsewhere");

    director.spawn("confused", move |cx| foreign.put(cx, Token::Int(1)));

    match director.run() {
        Err(ExecutionError::ProcessFailed { process, source }) => {
            assert_eq!(process, "confused");
            assert_eq!(source, RendezvousError::ForeignChannel("elsewhere".into()));
        }
        other => panic!("foreign channel not detected: {:?}", other),
    }
}
