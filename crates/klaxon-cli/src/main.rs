//! 🚀 klaxon-cli — the thin shell around the siren.
//!
//! 📦 Everything interesting lives in the `klaxon` library crate. This
//! binary just initializes tracing, figures out where the config comes
//! from, wires the stores, and hands over to `klaxon::run` until ctrl-c.
//! The alerting engine does the alerting; this file does the paperwork. 🦆

use anyhow::{Context, Result};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 🚀 main() — boot sequence for a process whose whole job is waking
/// other people up.
///
/// 🔧 Steps:
/// 1. Init tracing (a paging service that can't explain itself is useless)
/// 2. Parse args (zero or one: an optional TOML override file)
/// 3. Load + validate config (the one moment a bad env is allowed to be fatal)
/// 4. Run the engine until shutdown
/// 5. If it died, explain why in words an operator can act on
#[tokio::main]
async fn main() -> Result<()> {
    // 📡 RUST_LOG drives the filter — `RUST_LOG=klaxon=debug` is the first
    // thing to reach for when a rule ticks but nothing fires
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 🎯 Optional positional arg: a TOML override file. No arg = env only,
    // which is how every containerized deployment runs this.
    let args: Vec<String> = std::env::args().collect();
    let config_file = match args.get(1) {
        Some(path_arg) => {
            // 🔒 Check existence up front — figment would fail later anyway,
            // but "your path is wrong" beats "TOML parse error" as a first clue
            let path = std::path::Path::new(path_arg);
            let exists = path.try_exists().context(format!(
                "💀 Couldn't even check whether '{}' exists. If that's a relative \
                 path, mind your cwd — or sidestep the whole question with an \
                 absolute one.",
                path.display()
            ))?;
            match exists {
                true => Some(path),
                // 💤 An absent override file is not an error — env-only it is
                false => None,
            }
        }
        None => None,
    };

    // 🔧 Load the config — the moment we find out whether the env is set up
    // or whether ES_URL got lost between the runbook and the deploy
    let app_config = klaxon::app_config::load_config(config_file).context(
        "💀 klaxon-cli couldn't load its configuration. Walk the env vars \
         against the recognized list, and eyeball the TOML if you passed one.",
    )?;

    // 🗃️ Stores: the embedded build runs on the in-memory store — rules come
    // in through the (external) API layer, nothing survives a restart.
    // A database-backed deployment swaps its own Store impls in right here.
    let (stores, _direct) = klaxon::stores::Stores::in_memory();

    // 🚀 Hand the keys to the engine. We get them back at shutdown, or never.
    let result = klaxon::run(app_config, stores).await;

    // 💀 Error handling: the part where we find out what went wrong
    // and print it in a way that's helpful at 3am
    if let Err(err) = result {
        error!("💀 error: {}", err);
        // -- 🧅 walk the cause chain — the top-level context says what died,
        // -- the layers underneath say why
        let mut smells_like_connectivity = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            // -- 🕵️ fingerprints of an unreachable backend, as reqwest and
            // -- the resolver spell them
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                smells_like_connectivity = true;
            }
        }

        // -- 📡 a targeted hint beats a wall of backtrace: nine times out of
        // -- ten this is Elasticsearch not listening where ES_URL points
        if smells_like_connectivity {
            error!(
                "🔧 hint: a backing service looks unreachable. Check that \
                Elasticsearch is up at the address in ES_URL (and that the \
                webhook endpoint resolves). If it lives in Docker: `docker ps` \
                to see what's running, `docker compose up -d` to revive it."
            );
        }

        // 🗑️ Nonzero exit so the supervisor (systemd, k8s) knows to restart us.
        std::process::exit(1);
    }

    // ✅ Clean shutdown — the engine drained and handed the keys back.
    Ok(())
}
