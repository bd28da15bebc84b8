use clap::Parser;
use hestia::cli::{Cli, Commands};
use hestia::config::HestiaConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => hestia::cli::serve::run_serve(args).await,
        Commands::Validate(args) => match HestiaConfig::load(Some(&args.config))
            .map(HestiaConfig::with_env_overrides)
            .and_then(|c| c.validate().map(|()| c))
        {
            Ok(config) => {
                println!(
                    "Configuration OK: {} service(s), listening on {}:{}",
                    config.services.len(),
                    config.server.host,
                    config.server.port
                );
                Ok(())
            }
            Err(e) => Err(Box::new(e) as Box<dyn std::error::Error>),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
