#![allow(missing_docs)]

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    xiaoba_crawler::cli::run().await
}
