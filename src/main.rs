#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pos_offline_sync::run().await
}
