//! `replay` — the golden-event contract-test CLI.
//!
//! ```text
//! replay --store-url <url> [--fixture-dir <path>] [--fail-on-invalid]
//! ```
//! Exit codes: 0 success, 2 any mismatched expected/validation outcome,
//! 3 store unreachable.

use std::path::PathBuf;
use std::sync::Arc;

use tradebus::replay::{ReplayPolicy, run_replay};
use tradebus::schema_registry::SchemaRegistry;
use tradebus::store::memory::MemoryStore;

struct Args {
    store_url: String,
    fixture_dir: PathBuf,
    fail_on_invalid: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let mut store_url = None;
    let mut fixture_dir = PathBuf::from("fixtures");
    let mut fail_on_invalid = false;

    let mut i = 0;
    while i < raw.len() {
        match raw[i].as_str() {
            "--store-url" => {
                i += 1;
                store_url = raw.get(i).cloned();
            }
            "--fixture-dir" => {
                i += 1;
                if let Some(dir) = raw.get(i) {
                    fixture_dir = PathBuf::from(dir);
                }
            }
            "--fail-on-invalid" => fail_on_invalid = true,
            other => anyhow::bail!("unrecognized argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        store_url: store_url.ok_or_else(|| anyhow::anyhow!("--store-url is required"))?,
        fixture_dir,
        fail_on_invalid,
    })
}

#[tokio::main]
async fn main() {
    tradebus::logging::init_logging(&tradebus::config::Config::from_env());

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("replay: {e}");
            std::process::exit(2);
        }
    };

    // The only backing store this crate ships is in-process; any other
    // scheme means the configured store is unreachable from this binary.
    if !args.store_url.starts_with("memory://") && args.store_url != "memory" {
        eprintln!("replay: store '{}' is unreachable (only memory:// is built in)", args.store_url);
        std::process::exit(3);
    }

    let policy = if args.fail_on_invalid {
        ReplayPolicy::FailOnInvalid
    } else {
        ReplayPolicy::SkipInvalid
    };

    let registry = SchemaRegistry::new();
    let store = Arc::new(MemoryStore::new());

    match run_replay(&registry, store.as_ref(), &args.fixture_dir, policy).await {
        Ok(summary) => {
            println!(
                "total={} valid={} invalid={} published={} skipped={} failed={}",
                summary.total, summary.valid, summary.invalid, summary.published, summary.skipped, summary.failed
            );
            if summary.failed > 0 {
                std::process::exit(2);
            }
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("replay: {e}");
            std::process::exit(2);
        }
    }
}
