#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::env;

use appshell::cli;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let parsed = match cli::parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!();
            eprintln!("{}", cli::USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = cli::run(parsed).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}
