//! Guarded choice between conditional sends and receives.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use synchronix::branch::{Chosen, Guarded};
use synchronix::channel::RendezvousError;
use synchronix::data::Token;
use synchronix::director::{Director, Termination};

use crate::support::init_tracing;

type Slot = Arc<Mutex<Option<Chosen>>>;

fn slot() -> Slot {
    Arc::new(Mutex::new(None))
}

#[test]
fn receive_choice_against_a_plain_send() {
    let director = Director::new();
    let c1 = director.channel("c1");
    let c2 = director.channel("c2");
    let chosen = slot();

    let (r1, r2, out) = (c1.clone(), c2.clone(), chosen.clone());
    director.spawn("R", move |cx| {
        *out.lock().unwrap() = cx.choose(vec![Guarded::receive(&r1), Guarded::receive(&r2)])?;
        assert!(!r1.is_read_blocked());
        assert!(!r2.is_read_blocked());

        Ok(())
    });
    director.spawn("S", move |cx| c1.put(cx, Token::Int(5)));

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert_eq!(
        *chosen.lock().unwrap(),
        Some(Chosen {
            branch: 0,
            token: Some(Token::Int(5))
        })
    );
}

#[test]
fn send_choice_against_a_plain_receive() {
    let director = Director::new();
    let c1 = director.channel("c1");
    let c2 = director.channel("c2");
    let chosen = slot();
    let received = Arc::new(Mutex::new(None));

    let (s1, s2, out) = (c1.clone(), c2.clone(), chosen.clone());
    director.spawn("S", move |cx| {
        *out.lock().unwrap() = cx.choose(vec![
            Guarded::send(&s1, Token::Int(1)),
            Guarded::send(&s2, Token::Int(2)),
        ])?;

        Ok(())
    });
    let sink = received.clone();
    director.spawn("R", move |cx| {
        // Let both conditional sends park first.
        thread::sleep(Duration::from_millis(20));
        *sink.lock().unwrap() = Some(c2.get(cx)?);

        Ok(())
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert_eq!(
        *chosen.lock().unwrap(),
        Some(Chosen {
            branch: 1,
            token: None
        })
    );
    assert_eq!(*received.lock().unwrap(), Some(Token::Int(2)));
}

#[test]
fn conditional_send_meets_conditional_receive() {
    let director = Director::new();
    let c1 = director.channel("c1");
    let c2 = director.channel("c2");
    let c3 = director.channel("c3");
    let receiver_choice = slot();
    let sender_choice = slot();

    let (r1, r2, out) = (c1.clone(), c2.clone(), receiver_choice.clone());
    director.spawn("receiver", move |cx| {
        *out.lock().unwrap() = cx.choose(vec![Guarded::receive(&r2), Guarded::receive(&r1)])?;

        Ok(())
    });
    let out = sender_choice.clone();
    director.spawn("sender", move |cx| {
        *out.lock().unwrap() = cx.choose(vec![
            Guarded::send(&c3, Token::Int(30)),
            Guarded::send(&c1, Token::Int(10)),
        ])?;

        Ok(())
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert_eq!(
        *receiver_choice.lock().unwrap(),
        Some(Chosen {
            branch: 1,
            token: Some(Token::Int(10))
        })
    );
    assert_eq!(
        *sender_choice.lock().unwrap(),
        Some(Chosen {
            branch: 1,
            token: None
        })
    );
}

/// Two guarded choices offering each other two channels, repeatedly: each
/// round must commit exactly one pair of branches.
fn symmetric_choices(rounds: i32) {
    init_tracing();

    let director = Director::new();
    let c1 = director.channel("c1");
    let c2 = director.channel("c2");
    let receiver_log = Arc::new(Mutex::new(Vec::new()));
    let sender_log = Arc::new(Mutex::new(Vec::new()));

    let (r1, r2, log) = (c1.clone(), c2.clone(), receiver_log.clone());
    director.spawn("receiver", move |cx| {
        for _ in 0..rounds {
            let chosen = cx
                .choose(vec![Guarded::receive(&r1), Guarded::receive(&r2)])?
                .unwrap();
            log.lock().unwrap().push((chosen.branch, chosen.token));
        }

        Ok(())
    });
    let log = sender_log.clone();
    director.spawn("sender", move |cx| {
        for i in 0..rounds {
            let chosen = cx
                .choose(vec![Guarded::send(&c1, Token::Int(i)), Guarded::send(&c2, Token::Int(i))])?
                .unwrap();
            log.lock().unwrap().push(chosen.branch);
        }

        Ok(())
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);

    let receiver_log = receiver_log.lock().unwrap();
    let sender_log = sender_log.lock().unwrap();
    assert_eq!(receiver_log.len(), rounds as usize);
    for (i, ((receive_branch, token), send_branch)) in
        receiver_log.iter().zip(sender_log.iter()).enumerate()
    {
        assert_eq!(receive_branch, send_branch);
        assert_eq!(token, &Some(Token::Int(i as i32)));
    }
}

#[test]
fn symmetric_choices_commit_one_pair_per_round() {
    symmetric_choices(100);
}

#[test]
fn disabled_branches_are_ignored() {
    let director = Director::new();
    let c1 = director.channel("c1");
    let c2 = director.channel("c2");
    let chosen = slot();

    let (r1, r2, out) = (c1.clone(), c2.clone(), chosen.clone());
    director.spawn("R", move |cx| {
        assert_eq!(
            cx.choose(vec![Guarded::receive(&r1).when(false)])?,
            None
        );
        assert_eq!(cx.choose(Vec::new())?, None);
        *out.lock().unwrap() = cx.choose(vec![
            Guarded::receive(&r1).when(false),
            Guarded::receive(&r2),
        ])?;

        Ok(())
    });
    director.spawn("S", move |cx| c2.put(cx, Token::Boolean(true)));

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert_eq!(
        *chosen.lock().unwrap(),
        Some(Chosen {
            branch: 1,
            token: Some(Token::Boolean(true))
        })
    );
    drop(c1);
}

#[test]
fn competing_choosers_each_receive_once() {
    const CHOOSERS: usize = 3;

    let director = Director::new();
    let c1 = director.channel("c1");
    let c2 = director.channel("c2");
    let received = Arc::new(Mutex::new(Vec::new()));

    for i in 0..CHOOSERS {
        let (r1, r2, sink) = (c1.clone(), c2.clone(), received.clone());
        director.spawn(format!("chooser {}", i), move |cx| {
            let chosen = cx
                .choose(vec![Guarded::receive(&r1), Guarded::receive(&r2)])?
                .unwrap();
            sink.lock().unwrap().push(chosen.token.unwrap());

            Ok(())
        });
    }
    director.spawn("producer", move |cx| {
        c1.put(cx, Token::Int(0))?;
        c2.put(cx, Token::Int(1))?;
        c1.put(cx, Token::Int(2))
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    let mut received: Vec<_> = received
        .lock()
        .unwrap()
        .iter()
        .map(|token| match token {
            Token::Int(v) => *v,
            _ => unreachable!(),
        })
        .collect();
    received.sort_unstable();
    assert_eq!(received, vec![0, 1, 2]);
}

#[test]
fn conversion_failure_is_reported_before_racing() {
    let director = Director::new();
    let ints = director
        .channel_builder("ints")
        .element_type(synchronix::data::TokenType::Int)
        .build();
    let other = director.channel("other");
    let error = Arc::new(Mutex::new(None));

    let slot = error.clone();
    director.spawn("S", move |cx| {
        let result = cx.choose(vec![
            Guarded::send(&other, Token::Int(1)),
            Guarded::send(&ints, Token::Double(0.5)),
        ]);
        *slot.lock().unwrap() = result.err();

        Ok(())
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert!(matches!(
        error.lock().unwrap().take(),
        Some(RendezvousError::IllegalAction { .. })
    ));
}
