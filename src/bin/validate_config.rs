use clap::Parser;
use std::process::ExitCode;

use bridge_stats::config::{Ctx, Env};

fn main() -> ExitCode {
    let env = Env::parse();
    match Ctx::load_files(&env.config, &env.secrets) {
        Ok(ctx) => {
            eprintln!(
                "Config validation passed: {} chains, {} supply overrides, reserve check every {:?}",
                ctx.chains().len(),
                ctx.reserve_settings().overrides.len(),
                ctx.intervals().reserve_check
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Config validation failed: {}", e.kind());
            ExitCode::FAILURE
        }
    }
}
