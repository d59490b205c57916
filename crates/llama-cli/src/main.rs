use std::io::{self, Write};

use anyhow::Context;
use clap::Parser;
use llama_cli::{open, run_bench, run_chat, Cli, Command};
use llama_runtime::ReferenceBackend;
use llama_session::Host;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.session_config()?;
    let backend = ReferenceBackend::new().context("initializing backend")?;
    let mut host = Host::init(backend, config);

    match cli.command {
        Command::Chat {
            model,
            system,
            max_tokens,
            ..
        } => {
            open(&mut host, &model)?;
            let stdin = io::stdin();
            run_chat(&mut host, &system, max_tokens, stdin.lock(), io::stdout())?;
        }
        Command::Bench {
            model,
            pp,
            tg,
            reps,
            json,
        } => {
            open(&mut host, &model)?;
            let out = run_bench(&mut host, pp, tg, reps, json)?;
            println!("{out}");
        }
        Command::Info => {
            println!("{}", host.system_info());
            println!();
            print!("{}", host.config().to_toml()?);
        }
    }

    host.unload();
    if host.shutdown() != 0 {
        anyhow::bail!("backend shutdown failed");
    }
    io::stdout().flush()?;
    Ok(())
}
