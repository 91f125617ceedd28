use clap::Parser;
use quest_flow::cli::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenv::dotenv().ok();

    let args = Args::parse();
    quest_flow::workflow::run(args).await
}
