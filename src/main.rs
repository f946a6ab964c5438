use clap::Parser;
use queuectl::cli::{self, Cli};
use queuectl::logs;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _guard = logs::init();

    if let Err(error) = cli::run(cli).await {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}
