// src/main.rs

use taskmux::{cli, logging, run};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            eprintln!("taskmux error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<i32> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args).await
}
