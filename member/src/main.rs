use std::path::PathBuf;

use structopt::StructOpt;

use council::{MemberId, Membership, Participant, Profile};

mod repl;

#[derive(StructOpt)]
#[structopt(name = "member", about = "Council member peer for the presidential election")]
struct Opt {
    /// Member identifier, e.g. M3
    member: String,

    /// Network behavior profile: reliable, latent, failure, standard.
    /// Defaults to the profile listed in the membership file.
    #[structopt(long = "profile")]
    profile: Option<String>,

    /// Membership file (created with defaults if missing)
    #[structopt(long = "config", default_value = "network.config")]
    config: PathBuf,

    /// Listen port (default: 9000 + member number)
    #[structopt(long = "port")]
    port: Option<u16>,

    /// Scenario to activate at startup: ideal, high_latency,
    /// network_partition, member_failures, recovery_test, stress_test
    #[structopt(long = "scenario")]
    scenario: Option<String>,

    /// Interactive command prompt
    #[structopt(long = "interactive")]
    interactive: bool,

    /// Seed for this peer's random source (deterministic runs)
    #[structopt(long = "seed")]
    seed: Option<u64>,
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();
    if let Err(error) = run(opt) {
        eprintln!("startup error: {}", error);
        std::process::exit(1);
    }
}

fn run(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let id: MemberId = opt.member.parse()?;
    let membership = Membership::load_or_default(&opt.config)?;
    if !membership.contains(&id) {
        return Err(format!("{} does not appear in the membership file", id).into());
    }

    let profile = match &opt.profile {
    | Some(name) => name
        .parse::<Profile>()
        .map_err(|()| format!("unknown profile: {}", name))?,
    | None => membership
        .get(&id)
        .map(|member| member.profile)
        .unwrap_or(Profile::Standard),
    };
    let port = opt.port.unwrap_or(9000 + id.ordinal() as u16);

    let runtime = tokio::runtime::Runtime::new()?;
    let member = Participant::new(id, membership, profile, opt.seed);
    runtime.block_on(member.start(port))?;

    // Keep a runtime context on this thread so the REPL's synchronous
    // calls can spawn their timers.
    let _guard = runtime.enter();

    if let Some(name) = &opt.scenario {
        if !member.activate_scenario(name) {
            eprintln!("unknown scenario: {}", name);
        }
    }

    repl::run(&member, opt.interactive);

    member.stop();
    Ok(())
}
