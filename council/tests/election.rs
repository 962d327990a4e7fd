//! End-to-end elections over loopback TCP.
//!
//! Each test boots a small cluster of participants inside one multi-thread
//! runtime, with seeded RNGs and reliable link profiles so the outcome is
//! stable under CI timing.

use std::net::TcpListener;
use std::time::{Duration, Instant};

use council::{MemberId, Membership, Participant, Profile, ProposeError};

/// Reserve distinct free ports by briefly binding to port 0.
fn free_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port"))
        .collect();
    listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap().port())
        .collect()
}

fn membership(ports: &[u16]) -> Membership {
    let text: String = ports
        .iter()
        .enumerate()
        .map(|(index, port)| format!("M{},127.0.0.1,{},RELIABLE\n", index + 1, port))
        .collect();
    Membership::parse(&text).expect("valid membership")
}

async fn cluster(count: usize, seed: u64) -> Vec<Participant> {
    let ports = free_ports(count);
    let membership = membership(&ports);

    let mut members = Vec::new();
    for (index, port) in ports.iter().enumerate() {
        let id = MemberId::from_ordinal(index as u32 + 1);
        let member = Participant::new(
            id,
            membership.clone(),
            Profile::Reliable,
            Some(seed + index as u64),
        );
        member.start(*port).await.expect("start participant");
        members.push(member);
    }
    members
}

/// Poll until every member has learned, or the deadline passes.
async fn await_agreement(members: &[Participant], deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if members.iter().all(Participant::has_learned) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ideal_network_everyone_learns_the_proposed_value() {
    let members = cluster(5, 100).await;

    members[2].propose("M7").expect("proposal accepted");
    assert!(
        await_agreement(&members, Duration::from_secs(15)).await,
        "cluster did not converge in time",
    );

    for member in &members {
        assert_eq!(member.learned_value(), Some("M7".to_owned()));
    }

    let lost: u64 = members.iter().map(Participant::messages_lost).sum();
    assert_eq!(lost, 0, "reliable profiles must not lose messages");

    for member in &members {
        member.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duelling_proposers_still_agree() {
    let members = cluster(3, 200).await;

    // Fire two proposals as close together as the runtime allows. Either
    // may win, or one may be told to back off and retry; agreement is the
    // property under test.
    let first = members[0].propose("M1");
    let second = members[2].propose("M3");
    assert!(first.is_ok() || second.is_ok() || matches!(second, Err(ProposeError::BackedOff(_))));

    assert!(
        await_agreement(&members, Duration::from_secs(15)).await,
        "duelling cluster did not converge in time",
    );

    let winner = members[0].learned_value().unwrap();
    assert!(winner == "M1" || winner == "M3", "unexpected winner {}", winner);
    for member in &members {
        assert_eq!(member.learned_value(), Some(winner.clone()));
    }

    for member in &members {
        member.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_peer_catches_up_through_learn_rebroadcast() {
    let members = cluster(3, 300).await;

    // M3 cuts itself off from both peers, so it cannot take part in the
    // decision or hear the first LEARN.
    members[2].partition(
        vec![MemberId::from_ordinal(1), MemberId::from_ordinal(2)],
        Duration::from_secs(3),
    );
    members[0].propose("M2").expect("proposal accepted");

    assert!(
        await_agreement(&members[..2], Duration::from_secs(15)).await,
        "majority side did not converge",
    );

    // Once the partition expires, the periodic LEARN announcement from the
    // decided peers brings M3 up to date.
    assert!(
        await_agreement(&members, Duration::from_secs(15)).await,
        "partitioned peer never caught up",
    );
    assert_eq!(members[2].learned_value(), Some("M2".to_owned()));

    for member in &members {
        member.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn decided_value_rejects_later_proposals() {
    let members = cluster(3, 400).await;

    members[0].propose("M9").expect("proposal accepted");
    assert!(await_agreement(&members, Duration::from_secs(15)).await);

    match members[1].propose("M5") {
    | Err(ProposeError::AlreadyDecided(value)) => assert_eq!(value, "M9"),
    | other => panic!("expected AlreadyDecided, got {:?}", other),
    }

    for member in &members {
        member.stop();
    }
}
