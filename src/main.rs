use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toolchat::run(toolchat::Cli::parse()).await
}
