mod engine;

use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    engine::run().await.context("submission grader exited")
}
