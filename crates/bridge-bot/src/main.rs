#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bridge_bot::run().await
}
