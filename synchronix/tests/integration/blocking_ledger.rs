//! Blocked-process accounting.

use std::thread;
use std::time::Duration;

use synchronix::branch::Guarded;
use synchronix::channel::Batch;
use synchronix::data::Token;
use synchronix::director::{Director, ProcessSnapshot, Termination};

/// Every transition to the blocked state must be matched by the opposite
/// transition once all processes have exited.
fn assert_balanced(snapshot: &[ProcessSnapshot]) {
    assert!(!snapshot.is_empty());
    for process in snapshot {
        assert!(process.exited, "{} has not exited", process.name);
        assert!(!process.blocked, "{} is still blocked", process.name);
        assert_eq!(
            process.block_count, process.unblock_count,
            "unbalanced transitions for {}",
            process.name
        );
    }
}

#[test]
fn plain_rendezvous_are_balanced() {
    let director = Director::new();
    let channel = director.channel("c");

    let rx = channel.clone();
    director.spawn("consumer", move |cx| {
        for _ in 0..50 {
            rx.get(cx)?;
        }

        Ok(())
    });
    director.spawn("producer", move |cx| {
        for i in 0..50 {
            channel.put(cx, Token::Int(i))?;
        }

        Ok(())
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert_balanced(&director.ledger_snapshot());
}

#[test]
fn blocked_process_sleeps_until_its_channel_changes() {
    let director = Director::new();
    let channel = director.channel("c");

    let rx = channel.clone();
    director.spawn("getter", move |cx| {
        assert_eq!(rx.get(cx)?, Token::Int(1));

        Ok(())
    });
    director.spawn("slow putter", move |cx| {
        thread::sleep(Duration::from_millis(300));
        channel.put(cx, Token::Int(1))
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);

    let snapshot = director.ledger_snapshot();
    assert_balanced(&snapshot);
    let getter = snapshot.iter().find(|p| p.name == "getter").unwrap();
    assert!(
        getter.block_count <= 3,
        "getter blocked {} times",
        getter.block_count
    );
}

#[test]
fn blocked_choice_sleeps_until_a_branch_can_commit() {
    let director = Director::new();
    let c1 = director.channel("c1");
    let c2 = director.channel("c2");

    let (r1, r2) = (c1.clone(), c2.clone());
    director.spawn("chooser", move |cx| {
        cx.choose(vec![Guarded::receive(&r1), Guarded::receive(&r2)])?;

        Ok(())
    });
    director.spawn("slow putter", move |cx| {
        thread::sleep(Duration::from_millis(300));
        c2.put(cx, Token::Int(2))
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);

    let snapshot = director.ledger_snapshot();
    assert_balanced(&snapshot);
    let chooser = snapshot.iter().find(|p| p.name == "chooser").unwrap();
    assert!(
        chooser.block_count <= 10,
        "chooser blocked {} times",
        chooser.block_count
    );
}

#[test]
fn batches_and_choices_are_balanced() {
    const ROUNDS: i32 = 20;

    let director = Director::new();
    let c1 = director.channel("c1");
    let c2 = director.channel("c2");
    let c3 = director.channel("c3");
    let c4 = director.channel("c4");

    let batch = Batch::row(&[c1.clone(), c2.clone()]);
    director.spawn("batch sender", move |cx| {
        for i in 0..ROUNDS {
            cx.put_to_all(&[vec![Token::Int(i), Token::Int(-i)]], &batch)?;
        }

        Ok(())
    });
    let (s3, s4) = (c3.clone(), c4.clone());
    director.spawn("relay", move |cx| {
        let batch = Batch::row(&[c1, c2]);
        for _ in 0..ROUNDS {
            let mut row = cx.get_from_all(&batch)?.remove(0);
            let (second, first) = (row.pop().flatten(), row.pop().flatten());
            cx.choose(vec![
                Guarded::send(&s3, first.unwrap()),
                Guarded::send(&s4, second.unwrap()),
            ])?;
        }

        Ok(())
    });
    director.spawn("sink", move |cx| {
        for _ in 0..ROUNDS {
            cx.choose(vec![Guarded::receive(&c3), Guarded::receive(&c4)])?;
        }

        Ok(())
    });

    assert_eq!(director.run().unwrap(), Termination::Completed);
    assert_balanced(&director.ledger_snapshot());
}

#[test]
fn deadlocked_processes_are_balanced() {
    let director = Director::new();
    let c1 = director.channel("c1");
    let c2 = director.channel("c2");

    let (r1, r2) = (c1.clone(), c2.clone());
    director.spawn("chooser", move |cx| {
        cx.choose(vec![Guarded::receive(&r1), Guarded::receive(&r2)])?;

        Ok(())
    });
    director.spawn("batch receiver", move |cx| {
        cx.get_from_all(&Batch::column(&[c1, c2]))?;

        Ok(())
    });

    assert!(matches!(
        director.run().unwrap(),
        Termination::Deadlock(_)
    ));
    assert_balanced(&director.ledger_snapshot());
}
