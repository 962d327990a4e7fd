//! Line-oriented command loop on stdin.
//!
//! Interactive mode exposes the full command set behind a prompt; plain
//! mode mirrors the election workflow, where any bare line is a proposal.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use council::{MemberId, Participant, Profile, Scenario};

pub fn run(member: &Participant, interactive: bool) {
    if interactive {
        println!("\n{} Interactive Mode", member.id());
        println!("=======================================");
        print_commands();
    } else {
        println!("\n{} ready for election!", member.id());
        println!("Commands: <candidate>, status, stats, metrics, scenario <name>, quit");
    }

    let stdin = io::stdin();
    loop {
        if interactive {
            print!("{}> ", member.id());
            io::stdout().flush().ok();
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
        | Ok(0) | Err(_) => break,
        | Ok(_) => (),
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let done = if interactive {
            execute(member, line)
        } else {
            execute_plain(member, line)
        };
        if done {
            break;
        }
    }
}

/// Interactive command dispatch. Returns true when the loop should end.
fn execute(member: &Participant, line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts[0].to_ascii_lowercase().as_str() {
    | "propose" => match parts.get(1) {
        | Some(&value) => propose(member, value),
        | None => eprintln!("usage: propose <candidate>"),
    },
    | "profile" => match parts.get(1).map(|name| name.parse::<Profile>()) {
        | Some(Ok(profile)) => member.set_profile(profile),
        | Some(Err(())) => eprintln!("invalid profile: {}", parts[1]),
        | None => eprintln!("usage: profile <reliable|latent|failure|standard>"),
    },
    | "scenario" => match parts.get(1) {
        | Some(&name) => {
            if !member.activate_scenario(name) {
                eprintln!("unknown scenario: {} (known: {})", name, Scenario::names().join(", "));
            }
        }
        | None => eprintln!("usage: scenario <name>"),
    },
    | "partition" => partition(member, &parts[1..]),
    | "offline" => match parts.get(1).and_then(|secs| secs.parse::<u64>().ok()) {
        | Some(secs) => member.offline(Duration::from_secs(secs)),
        | None => eprintln!("usage: offline <seconds>"),
    },
    | "stats" => println!("{}", member.status()),
    | "metrics" => println!("{}", member.metrics()),
    | "events" => {
        let count = parts
            .get(1)
            .and_then(|count| count.parse::<usize>().ok())
            .unwrap_or(10);
        println!("Recent Network Events:");
        for event in member.recent_events(count) {
            println!("  {}", event);
        }
    }
    | "reset" => member.reset(),
    | "new_round" => member.begin_new_round(),
    | "help" => print_commands(),
    | "quit" | "exit" => return true,
    | other => eprintln!("unknown command: {}", other),
    }
    false
}

/// Plain-mode dispatch: a bare line is a proposal.
fn execute_plain(member: &Participant, line: &str) -> bool {
    match line.to_ascii_lowercase().as_str() {
    | "quit" | "exit" => return true,
    | "status" | "stats" => println!("{}", member.status()),
    | "metrics" => println!("{}", member.metrics()),
    | _ => {
        if let Some(name) = line.strip_prefix("scenario ") {
            if !member.activate_scenario(name.trim()) {
                eprintln!("unknown scenario: {}", name.trim());
            }
        } else {
            propose(member, line);
        }
    }
    }
    false
}

fn propose(member: &Participant, value: &str) {
    match member.propose(value) {
    | Ok(number) => println!("{} proposing {} with proposal number {}", member.id(), value, number),
    | Err(error) => println!("proposal rejected: {}", error),
    }
}

fn partition(member: &Participant, args: &[&str]) {
    let Some(secs) = args.first().and_then(|secs| secs.parse::<u64>().ok()) else {
        eprintln!("usage: partition <seconds> <peer>...");
        return;
    };
    let peers: Result<Vec<MemberId>, _> = args[1..].iter().map(|peer| peer.parse()).collect();
    match peers {
    | Ok(peers) if !peers.is_empty() => {
        member.partition(peers, Duration::from_secs(secs));
    }
    | Ok(_) => eprintln!("usage: partition <seconds> <peer>..."),
    | Err(error) => eprintln!("invalid peer: {}", error),
    }
}

fn print_commands() {
    println!("Available Commands:");
    println!("  propose <candidate>           Propose a candidate for president");
    println!("  profile <profile>             Change network profile");
    println!("  scenario <name>               Activate a network scenario");
    println!("  partition <seconds> <peer>..  Cut the link to the named peers");
    println!("  offline <seconds>             Go offline for the given time");
    println!("  stats                         Show detailed state");
    println!("  metrics                       Show performance metrics");
    println!("  events [count]                Show recent network events");
    println!("  reset                         Reset proposer state");
    println!("  new_round                     Archive the decision, open a new round");
    println!("  help                          Show this help message");
    println!("  quit/exit                     Exit");
    println!();
    println!("Available Scenarios:");
    println!("  {}", Scenario::names().join(", "));
}
