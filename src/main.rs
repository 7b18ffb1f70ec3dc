use clap::Parser;

fn main() -> anyhow::Result<()> {
    // Load .env early; ignore if missing.
    dotenvy::dotenv().ok();
    model_stats::init_tracing();

    let cli = model_stats::Cli::parse();
    model_stats::run(cli)
}
